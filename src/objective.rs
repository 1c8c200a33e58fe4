// A finite-domain cost model.  Every variable takes a value in 0..domain_size, and the
// objective is a sum of terms over small groups of variables plus a set of hard constraints.
use std::fmt;
use std::sync::Arc;

use ndarray::prelude::*;

use super::errors::TrafficError;


pub type CostFn = Arc<dyn Fn(&[usize]) -> f64 + Send + Sync>;

#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub label: String,
    pub domain_size: usize,
}

#[derive(Clone)]
pub enum Term {
    Unary { var: usize, costs: Vec<f64> },
    /// `costs[[a, b]]` is the cost when `first` takes value a and `second` takes value b.
    Pairwise { first: usize, second: usize, costs: Array2<f64> },
    /// Any cost over more than two variables.  `cost_fn` receives the values of `vars` in
    /// order.  Quadratic-only backends reject objectives holding one of these.
    HigherOrder { vars: Vec<usize>, label: String, cost_fn: CostFn },
}

impl fmt::Debug for Term {
    fn fmt(&self, ff: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Unary { var, costs } => write!(ff, "Unary({}, {:?})", var, costs),
            Term::Pairwise { first, second, costs } => {
                write!(ff, "Pairwise({}, {}, {:?})", first, second, costs.shape())
            }
            Term::HigherOrder { vars, label, .. } => {
                write!(ff, "HigherOrder({}, {:?})", label, vars)
            }
        }
    }
}

impl Term {
    pub fn vars(&self) -> Vec<usize> {
        match self {
            Term::Unary { var, .. } => vec![*var],
            Term::Pairwise { first, second, .. } => vec![*first, *second],
            Term::HigherOrder { vars, .. } => vars.clone(),
        }
    }

    pub fn evaluate(&self, assignment: &[usize]) -> f64 {
        match self {
            Term::Unary { var, costs } => costs[assignment[*var]],
            Term::Pairwise { first, second, costs } => {
                costs[[assignment[*first], assignment[*second]]]
            }
            Term::HigherOrder { vars, cost_fn, .. } => {
                let values: Vec<usize> = vars.iter().map(|vv| assignment[*vv]).collect();
                cost_fn(&values)
            }
        }
    }

    pub fn is_quadratic(&self) -> bool {
        match self {
            Term::HigherOrder { .. } => false,
            _ => true,
        }
    }

    /// The largest cost magnitude the term can contribute, if it can be known up front.
    fn max_abs(&self) -> Option<f64> {
        match self {
            Term::Unary { costs, .. } => {
                Some(costs.iter().fold(0., |acc, cc| f64::max(acc, cc.abs())))
            }
            Term::Pairwise { costs, .. } => {
                Some(costs.fold(0., |acc, cc| f64::max(acc, cc.abs())))
            }
            Term::HigherOrder { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Constraint {
    /// The variable must take exactly this value.
    Fixed { var: usize, value: usize },
    /// The values of `vars` must add up to `total`.
    SumEquals { vars: Vec<usize>, total: usize },
}

impl Constraint {
    pub fn is_satisfied(&self, assignment: &[usize]) -> bool {
        match self {
            Constraint::Fixed { var, value } => assignment[*var] == *value,
            Constraint::SumEquals { vars, total } => {
                vars.iter().map(|vv| assignment[*vv]).sum::<usize>() == *total
            }
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Objective {
    variables: Vec<Variable>,
    terms: Vec<Term>,
    constraints: Vec<Constraint>,
    // indices into `terms` of every term each variable appears in
    var_terms: Vec<Vec<usize>>,
}

fn malformed(reason: String) -> TrafficError {
    TrafficError::unsupported("any", reason)
}

impl Objective {
    pub fn new() -> Objective {
        Objective::default()
    }

    pub fn add_variable(&mut self, label: &str, domain_size: usize) -> usize {
        self.variables.push(Variable { label: String::from(label), domain_size });
        self.var_terms.push(vec![]);
        self.variables.len() - 1
    }

    pub fn add_unary(&mut self, var: usize, costs: Vec<f64>) -> Result<(), TrafficError> {
        self.check_var(var)?;
        if costs.len() != self.variables[var].domain_size {
            return Err(malformed(format!("unary term on '{}' has {} costs for a domain of {}",
                                         self.variables[var].label, costs.len(),
                                         self.variables[var].domain_size)));
        }
        self.push_term(Term::Unary { var, costs });
        Ok(())
    }

    pub fn add_pairwise(&mut self, first: usize, second: usize, costs: Array2<f64>)
                        -> Result<(), TrafficError> {
        self.check_var(first)?;
        self.check_var(second)?;
        if first == second {
            return Err(malformed(format!("pairwise term pairs '{}' with itself",
                                         self.variables[first].label)));
        }
        let shape = (self.variables[first].domain_size, self.variables[second].domain_size);
        if costs.dim() != shape {
            return Err(malformed(format!("pairwise term has shape {:?}, expected {:?}",
                                         costs.dim(), shape)));
        }
        self.push_term(Term::Pairwise { first, second, costs });
        Ok(())
    }

    pub fn add_higher_order(&mut self, vars: Vec<usize>, label: &str, cost_fn: CostFn)
                            -> Result<(), TrafficError> {
        for var in &vars {
            self.check_var(*var)?;
        }
        self.push_term(Term::HigherOrder { vars, label: String::from(label), cost_fn });
        Ok(())
    }

    pub fn add_constraint(&mut self, constraint: Constraint) -> Result<(), TrafficError> {
        match &constraint {
            Constraint::Fixed { var, value } => {
                self.check_var(*var)?;
                if *value >= self.variables[*var].domain_size {
                    return Err(malformed(format!("'{}' fixed outside its domain",
                                                 self.variables[*var].label)));
                }
            }
            Constraint::SumEquals { vars, .. } => {
                for var in vars {
                    self.check_var(*var)?;
                }
            }
        }
        self.constraints.push(constraint);
        Ok(())
    }

    fn check_var(&self, var: usize) -> Result<(), TrafficError> {
        if var >= self.variables.len() {
            return Err(malformed(format!("variable index {} out of range", var)));
        }
        Ok(())
    }

    fn push_term(&mut self, term: Term) {
        let idx = self.terms.len();
        let mut vars = term.vars();
        vars.sort();
        vars.dedup();
        for var in vars {
            self.var_terms[var].push(idx);
        }
        self.terms.push(term);
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn domain_size(&self, var: usize) -> usize {
        self.variables[var].domain_size
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn terms_of(&self, var: usize) -> &[usize] {
        &self.var_terms[var]
    }

    pub fn is_quadratic(&self) -> bool {
        self.terms.iter().all(|tt| tt.is_quadratic())
    }

    /// An upper bound on the magnitude of the objective, for scaling penalties.  `None` if
    /// a higher-order term makes that unknowable without enumeration.
    pub fn cost_bound(&self) -> Option<f64> {
        let mut bound = 0.;
        for term in &self.terms {
            bound += term.max_abs()?;
        }
        Some(bound)
    }

    /// The product of all domain sizes, or `None` if it overflows.
    pub fn search_space_size(&self) -> Option<u128> {
        let mut size: u128 = 1;
        for var in &self.variables {
            size = size.checked_mul(var.domain_size as u128)?;
        }
        Some(size)
    }

    pub fn fixed_values(&self) -> Vec<Option<usize>> {
        let mut fixed = vec![None; self.variables.len()];
        for constraint in &self.constraints {
            if let Constraint::Fixed { var, value } = constraint {
                fixed[*var] = Some(*value);
            }
        }
        fixed
    }

    pub fn sum_groups(&self) -> Vec<(&[usize], usize)> {
        self.constraints.iter().filter_map(|cc| match cc {
            Constraint::SumEquals { vars, total } => Some((vars.as_slice(), *total)),
            _ => None,
        }).collect()
    }

    pub fn evaluate(&self, assignment: &[usize]) -> f64 {
        self.terms.iter().map(|tt| tt.evaluate(assignment)).sum()
    }

    /// Change in the objective if `var` were set to `new_value`.  The assignment is
    /// modified only for the duration of the call.
    pub fn delta(&self, assignment: &mut [usize], var: usize, new_value: usize) -> f64 {
        let old_value = assignment[var];
        if old_value == new_value {
            return 0.;
        }
        let terms = &self.var_terms[var];
        let before: f64 = terms.iter().map(|ti| self.terms[*ti].evaluate(assignment)).sum();
        assignment[var] = new_value;
        let after: f64 = terms.iter().map(|ti| self.terms[*ti].evaluate(assignment)).sum();
        assignment[var] = old_value;
        after - before
    }

    /// Whether the assignment gives every variable an in-domain value and satisfies
    /// every constraint.
    pub fn is_feasible(&self, assignment: &[usize]) -> bool {
        if assignment.len() != self.variables.len() {
            return false;
        }
        let in_domain = assignment.iter().zip(&self.variables)
            .all(|(value, var)| *value < var.domain_size);
        in_domain && self.constraints.iter().all(|cc| cc.is_satisfied(assignment))
    }

    /// Rejects objectives no backend could solve: empty domains, and sum constraints that no
    /// in-domain assignment can meet.
    pub fn validate(&self) -> Result<(), TrafficError> {
        for var in &self.variables {
            if var.domain_size == 0 {
                return Err(malformed(format!("'{}' has an empty domain", var.label)));
            }
        }
        let fixed = self.fixed_values();
        for (vars, total) in self.sum_groups() {
            let mut lo = 0;
            let mut hi = 0;
            for var in vars {
                match fixed[*var] {
                    Some(value) => {
                        lo += value;
                        hi += value;
                    }
                    None => hi += self.variables[*var].domain_size - 1,
                }
            }
            if total < lo || total > hi {
                return Err(malformed(format!("sum constraint total {} outside [{}, {}]",
                                             total, lo, hi)));
            }
        }
        Ok(())
    }
}
