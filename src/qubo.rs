// A quantum-style sampler: the objective is one-hot encoded into binary variables, its
// constraints become quadratic penalties, and many independent annealing reads sample
// low-energy states of the resulting QUBO.
use std::time::Duration;

use ndarray::prelude::*;
use rand::Rng;
use rand::SeedableRng;
use rand_isaac::Isaac64Rng;
use rayon::prelude::*;

use super::config_utils::EngineConfig;
use super::engine::{CancellationToken, OptimizationEngine, RunBudget, Solution};
use super::errors::TrafficError;
use super::objective::{Constraint, Objective, Term};


const NAME: &str = "quantum_style";
const TOLERANCE: f64 = 1e-9;

/// `energy(x) = offset + Σ linear[i] x_i + Σ_{i<j} quadratic[[i, j]] x_i x_j`, with
/// `quadratic` kept symmetric and zero on the diagonal.
#[derive(Clone, Debug)]
pub struct Qubo {
    pub linear: Array1<f64>,
    pub quadratic: Array2<f64>,
    pub offset: f64,
    // first bit of each variable
    var_offsets: Vec<usize>,
    domain_sizes: Vec<usize>,
}

impl Qubo {
    fn with_bits(domain_sizes: Vec<usize>) -> Qubo {
        let mut var_offsets = vec![];
        let mut num_bits = 0;
        for size in &domain_sizes {
            var_offsets.push(num_bits);
            num_bits += size;
        }
        Qubo {
            linear: Array1::zeros(num_bits),
            quadratic: Array2::zeros((num_bits, num_bits)),
            offset: 0.,
            var_offsets,
            domain_sizes,
        }
    }

    pub fn num_bits(&self) -> usize {
        self.linear.len()
    }

    pub fn bit(&self, var: usize, value: usize) -> usize {
        self.var_offsets[var] + value
    }

    fn add_coupling(&mut self, ii: usize, jj: usize, weight: f64) {
        if ii == jj {
            // x * x == x
            self.linear[ii] += weight;
        } else {
            self.quadratic[[ii, jj]] += weight;
            self.quadratic[[jj, ii]] += weight;
        }
    }

    /// Adds `strength * (Σ weights[i] x_i - target)^2`.
    fn add_squared_penalty(&mut self, weighted_bits: &[(usize, f64)], target: f64,
                           strength: f64) {
        for (ii, (bit_i, w_i)) in weighted_bits.iter().enumerate() {
            self.linear[*bit_i] += strength * (w_i * w_i - 2. * target * w_i);
            for (bit_j, w_j) in &weighted_bits[ii + 1..] {
                self.add_coupling(*bit_i, *bit_j, 2. * strength * w_i * w_j);
            }
        }
        self.offset += strength * target * target;
    }

    pub fn energy(&self, bits: &[u8]) -> f64 {
        let xx: Array1<f64> = bits.iter().map(|bb| *bb as f64).collect();
        self.offset + self.linear.dot(&xx) + 0.5 * xx.dot(&self.quadratic.dot(&xx))
    }

    /// The assignment a sample encodes, or `None` unless every variable has exactly one
    /// bit set.
    pub fn decode(&self, bits: &[u8]) -> Option<Vec<usize>> {
        let mut assignment = vec![];
        for (offset, size) in self.var_offsets.iter().zip(&self.domain_sizes) {
            let slice = &bits[*offset..offset + size];
            if slice.iter().map(|bb| *bb as usize).sum::<usize>() != 1 {
                return None;
            }
            assignment.push(slice.iter().position(|bb| *bb == 1)?);
        }
        Some(assignment)
    }
}

/// Encodes a quadratic objective.  Constraint penalties are scaled above the largest
/// possible objective value so that breaking one never pays.
pub fn build_qubo(objective: &Objective, max_bits: usize) -> Result<Qubo, TrafficError> {
    if !objective.is_quadratic() {
        return Err(TrafficError::unsupported(
            NAME, String::from("objective has terms over more than two variables")));
    }
    let domain_sizes: Vec<usize> = objective.variables().iter().map(|vv| vv.domain_size).collect();
    let num_bits: usize = domain_sizes.iter().sum();
    if num_bits > max_bits {
        return Err(TrafficError::unsupported(
            NAME, format!("encoding needs {} bits, more than the limit of {}", num_bits,
                          max_bits)));
    }
    let strength = match objective.cost_bound() {
        Some(bound) => bound + 1.,
        None => return Err(TrafficError::unsupported(NAME, String::from("unbounded objective"))),
    };

    let mut qubo = Qubo::with_bits(domain_sizes);
    for term in objective.terms() {
        match term {
            Term::Unary { var, costs } => {
                for (value, cost) in costs.iter().enumerate() {
                    let bit = qubo.bit(*var, value);
                    qubo.linear[bit] += cost;
                }
            }
            Term::Pairwise { first, second, costs } => {
                for ((aa, bb), cost) in costs.indexed_iter() {
                    let bit_a = qubo.bit(*first, aa);
                    let bit_b = qubo.bit(*second, bb);
                    qubo.add_coupling(bit_a, bit_b, *cost);
                }
            }
            Term::HigherOrder { label, .. } => {
                return Err(TrafficError::unsupported(NAME, format!("term '{}' is not quadratic",
                                                                   label)));
            }
        }
    }

    for var in 0..objective.num_variables() {
        let one_hot: Vec<(usize, f64)> = (0..objective.domain_size(var))
            .map(|value| (qubo.bit(var, value), 1.))
            .collect();
        qubo.add_squared_penalty(&one_hot, 1., strength);
    }
    for constraint in objective.constraints() {
        match constraint {
            Constraint::Fixed { var, value } => {
                for other in 0..objective.domain_size(*var) {
                    if other != *value {
                        let bit = qubo.bit(*var, other);
                        qubo.linear[bit] += strength;
                    }
                }
            }
            Constraint::SumEquals { vars, total } => {
                let mut weighted = vec![];
                for var in vars {
                    for value in 1..objective.domain_size(*var) {
                        weighted.push((qubo.bit(*var, value), value as f64));
                    }
                }
                qubo.add_squared_penalty(&weighted, *total as f64, strength);
            }
        }
    }
    log::debug!("built qubo with {} bits and penalty strength {}", num_bits, strength);
    Ok(qubo)
}

pub struct QuboSampler {
    max_iterations: u64,
    time_budget: Duration,
    random_seed: u64,
    num_reads: usize,
    max_bits: usize,
}

impl QuboSampler {
    pub fn new(config: &EngineConfig) -> QuboSampler {
        QuboSampler {
            max_iterations: config.max_iterations,
            time_budget: config.time_budget(),
            random_seed: config.random_seed,
            num_reads: config.num_reads,
            max_bits: config.max_qubo_bits,
        }
    }

    /// One annealing read: random one-hot start, single-bit flips under a geometric
    /// temperature schedule, then a zero-temperature descent.
    fn read(&self, qubo: &Qubo, seed: u64, budget: &RunBudget, token: &CancellationToken)
            -> Result<Vec<u8>, TrafficError> {
        let num_bits = qubo.num_bits();
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let mut bits = vec![0u8; num_bits];
        for (offset, size) in qubo.var_offsets.iter().zip(&qubo.domain_sizes) {
            bits[offset + rng.gen_range(0..*size)] = 1;
        }
        if num_bits == 0 {
            return Ok(bits);
        }
        // local field: the energy change of turning bit i on, given the others
        let mut field = qubo.linear.clone();
        for ii in 0..num_bits {
            if bits[ii] == 1 {
                field.scaled_add(1., &qubo.quadratic.row(ii));
            }
        }

        let (temp_hot, temp_cold) = temperature_range(qubo);
        let max_iters = self.max_iterations as f64;
        let cooling = temp_cold / temp_hot;
        for iter in 0..self.max_iterations {
            budget.check(iter, token)?;
            let temp = temp_hot * cooling.powf(iter as f64 / max_iters);
            let ii = rng.gen_range(0..num_bits);
            let delta = flip_delta(bits[ii], field[ii]);
            if delta <= 0. || rng.gen::<f64>() < (-delta / temp).exp() {
                flip(qubo, &mut bits, &mut field, ii);
            }
        }

        // descend until no single flip helps
        loop {
            let mut changed = false;
            for ii in 0..num_bits {
                if flip_delta(bits[ii], field[ii]) < -TOLERANCE {
                    flip(qubo, &mut bits, &mut field, ii);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        Ok(bits)
    }
}

fn flip_delta(bit: u8, field: f64) -> f64 {
    if bit == 1 {
        -field
    } else {
        field
    }
}

fn flip(qubo: &Qubo, bits: &mut [u8], field: &mut Array1<f64>, ii: usize) {
    let sign = if bits[ii] == 1 { -1. } else { 1. };
    bits[ii] = 1 - bits[ii];
    field.scaled_add(sign, &qubo.quadratic.row(ii));
}

/// Starts hot enough to cross a constraint penalty and ends cold enough to resolve the
/// smallest coefficient.
fn temperature_range(qubo: &Qubo) -> (f64, f64) {
    let mut largest: f64 = 0.;
    let mut smallest = f64::INFINITY;
    for coeff in qubo.linear.iter().chain(qubo.quadratic.iter()) {
        let mag = coeff.abs();
        if mag > TOLERANCE {
            largest = largest.max(mag);
            smallest = smallest.min(mag);
        }
    }
    if !smallest.is_finite() {
        return (1., 1e-3);
    }
    (2. * largest, 0.01 * smallest)
}

impl OptimizationEngine for QuboSampler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn solve(&self, objective: &Objective, token: &CancellationToken)
             -> Result<Solution, TrafficError> {
        objective.validate()?;
        let budget = RunBudget::start(self.time_budget);
        budget.check(0, token)?;
        let qubo = build_qubo(objective, self.max_bits)?;

        let reads: Vec<Result<Vec<u8>, TrafficError>> = (0..self.num_reads)
            .into_par_iter()
            .map(|read| self.read(&qubo, self.random_seed.wrapping_add(read as u64), &budget,
                                  token))
            .collect();

        let mut best: Option<(Vec<usize>, f64)> = None;
        let mut num_feasible = 0;
        for read in reads {
            let bits = read?;
            let assignment = match qubo.decode(&bits) {
                Some(assignment) if objective.is_feasible(&assignment) => assignment,
                _ => continue,
            };
            num_feasible += 1;
            let energy = objective.evaluate(&assignment);
            let better = match &best {
                Some((_, best_energy)) => energy < best_energy - TOLERANCE,
                None => true,
            };
            if better {
                best = Some((assignment, energy));
            }
        }

        let iterations = self.max_iterations * self.num_reads as u64;
        match best {
            Some((assignment, energy)) => {
                log::debug!("{} of {} reads feasible, best energy {}", num_feasible,
                            self.num_reads, energy);
                Ok(Solution { assignment, energy, iterations })
            }
            None => Err(TrafficError::NoFeasibleSample { reads: self.num_reads }),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::assert_relative_eq;
    use ndarray::array;

    use super::*;
    use super::super::objective::CostFn;

    #[test]
    fn test_qubo_energy_matches_objective() {
        let mut obj = Objective::new();
        let aa = obj.add_variable("a", 2);
        let bb = obj.add_variable("b", 3);
        obj.add_unary(aa, vec![1., 4.]).unwrap();
        obj.add_pairwise(aa, bb, array![[0., 2., 0.], [1., 0., 3.]]).unwrap();
        obj.add_constraint(Constraint::SumEquals { vars: vec![aa, bb], total: 2 }).unwrap();
        let qubo = build_qubo(&obj, 64).unwrap();
        assert_eq!(qubo.num_bits(), 5);

        // feasible one-hot samples carry no penalty
        for assignment in &[vec![0, 2], vec![1, 1]] {
            let mut bits = vec![0u8; 5];
            bits[qubo.bit(0, assignment[0])] = 1;
            bits[qubo.bit(1, assignment[1])] = 1;
            assert_relative_eq!(qubo.energy(&bits), obj.evaluate(assignment), epsilon = 1e-9);
            assert_eq!(qubo.decode(&bits), Some(assignment.clone()));
        }
        // breaking the sum costs more than any objective value
        let mut bits = vec![0u8; 5];
        bits[qubo.bit(0, 0)] = 1;
        bits[qubo.bit(1, 0)] = 1;
        assert!(qubo.energy(&bits) > obj.cost_bound().unwrap());
        assert_eq!(qubo.decode(&[1, 1, 1, 0, 0]), None);
    }

    #[test]
    fn test_rejects_higher_order_and_large() {
        let mut obj = Objective::new();
        for ii in 0..3 {
            obj.add_variable(&format!("x{}", ii), 4);
        }
        assert!(build_qubo(&obj, 11).is_err());
        assert!(build_qubo(&obj, 12).is_ok());
        let cost_fn: CostFn = Arc::new(|values: &[usize]| values.iter().sum::<usize>() as f64);
        obj.add_higher_order(vec![0, 1, 2], "sum", cost_fn).unwrap();
        match build_qubo(&obj, 64) {
            Err(TrafficError::UnsupportedObjective { backend, .. }) => assert_eq!(backend, NAME),
            other => panic!("expected UnsupportedObjective, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_sampler_respects_fixed() {
        let mut obj = Objective::new();
        let aa = obj.add_variable("a", 3);
        let bb = obj.add_variable("b", 2);
        obj.add_unary(aa, vec![0., 5., 9.]).unwrap();
        obj.add_unary(bb, vec![2., 1.]).unwrap();
        obj.add_constraint(Constraint::Fixed { var: aa, value: 1 }).unwrap();
        let sampler = QuboSampler::new(&EngineConfig::default());
        let solution = sampler.solve(&obj, &CancellationToken::new()).unwrap();
        assert_eq!(solution.assignment, vec![1, 1]);
        assert_relative_eq!(solution.energy, 6.);
    }
}
