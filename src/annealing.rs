// Simulated annealing over a finite-domain objective.  Every state the search visits is
// feasible: it starts from a greedy feasible assignment and only makes moves that keep the
// constraints satisfied.
use std::time::Duration;

use rand::Rng;
use rand::SeedableRng;
use rand_isaac::Isaac64Rng;

use super::config_utils::EngineConfig;
use super::engine::{CancellationToken, OptimizationEngine, RunBudget, Solution};
use super::errors::TrafficError;
use super::objective::Objective;


const NAME: &str = "classical";
// deltas this small count as ties
const TOLERANCE: f64 = 1e-9;
const NUM_PROBES: usize = 64;
// the final temperature as a fraction of the initial one
const COOLING_RANGE: f64 = 1e-3;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Move {
    Set { var: usize, value: usize },
    /// Moves one unit of a sum group from one variable to another.
    Transfer { from: usize, to: usize },
}

/// Which variables each kind of move may touch.
#[derive(Debug)]
struct MoveSet {
    // variables that are in no sum group and not fixed
    free: Vec<usize>,
    // the unfixed members of each sum group with at least two of them
    groups: Vec<Vec<usize>>,
}

impl MoveSet {
    fn new(objective: &Objective) -> Result<MoveSet, TrafficError> {
        let fixed = objective.fixed_values();
        let mut in_group = vec![false; objective.num_variables()];
        let mut groups = vec![];
        for (vars, _) in objective.sum_groups() {
            let mut movable = vec![];
            for var in vars {
                if in_group[*var] {
                    return Err(TrafficError::unsupported(
                        NAME, format!("variable '{}' is in more than one sum constraint",
                                      objective.variables()[*var].label)));
                }
                in_group[*var] = true;
                if fixed[*var].is_none() {
                    movable.push(*var);
                }
            }
            if movable.len() >= 2 {
                groups.push(movable);
            }
        }
        let free = (0..objective.num_variables())
            .filter(|vv| !in_group[*vv] && fixed[*vv].is_none() && objective.domain_size(*vv) > 1)
            .collect();
        Ok(MoveSet { free, groups })
    }

    fn is_empty(&self) -> bool {
        self.free.is_empty() && self.groups.is_empty()
    }

    /// A random move from the current state, or `None` if the drawn group can't transfer.
    fn propose<R: Rng>(&self, objective: &Objective, assignment: &[usize], rng: &mut R)
                       -> Option<Move> {
        let pick = rng.gen_range(0..self.free.len() + self.groups.len());
        if pick < self.free.len() {
            let var = self.free[pick];
            let mut value = rng.gen_range(0..objective.domain_size(var) - 1);
            if value >= assignment[var] {
                value += 1;
            }
            return Some(Move::Set { var, value });
        }
        let group = &self.groups[pick - self.free.len()];
        let from = group[rng.gen_range(0..group.len())];
        let to = group[rng.gen_range(0..group.len())];
        if from == to || assignment[from] == 0 ||
           assignment[to] + 1 >= objective.domain_size(to) {
            return None;
        }
        Some(Move::Transfer { from, to })
    }
}

fn move_delta(objective: &Objective, assignment: &mut [usize], mv: Move) -> f64 {
    match mv {
        Move::Set { var, value } => objective.delta(assignment, var, value),
        Move::Transfer { from, to } => {
            let lowered = assignment[from] - 1;
            let first = objective.delta(assignment, from, lowered);
            assignment[from] = lowered;
            let raised = assignment[to] + 1;
            let second = objective.delta(assignment, to, raised);
            assignment[from] += 1;
            first + second
        }
    }
}

fn apply(assignment: &mut [usize], mv: Move) {
    match mv {
        Move::Set { var, value } => assignment[var] = value,
        Move::Transfer { from, to } => {
            assignment[from] -= 1;
            assignment[to] += 1;
        }
    }
}

/// Builds a feasible assignment one variable at a time, each taking its cheapest value
/// given the ones before it.  Sum groups are filled a unit at a time, each unit going to
/// the member where it costs least.
pub(crate) fn greedy_start(objective: &Objective) -> Vec<usize> {
    let num_vars = objective.num_variables();
    let fixed = objective.fixed_values();
    let mut assignment: Vec<usize> = fixed.iter().map(|ff| ff.unwrap_or(0)).collect();
    let mut in_group = vec![false; num_vars];

    for (vars, total) in objective.sum_groups() {
        let mut remaining = total;
        for var in vars {
            in_group[*var] = true;
            if let Some(value) = fixed[*var] {
                remaining = remaining.saturating_sub(value);
            }
        }
        while remaining > 0 {
            let mut best: Option<(f64, usize)> = None;
            for var in vars {
                if fixed[*var].is_some() || assignment[*var] + 1 >= objective.domain_size(*var) {
                    continue;
                }
                let raised = assignment[*var] + 1;
                let delta = objective.delta(&mut assignment, *var, raised);
                match best {
                    Some((best_delta, _)) if delta >= best_delta - TOLERANCE => (),
                    _ => best = Some((delta, *var)),
                }
            }
            match best {
                Some((_, var)) => assignment[var] += 1,
                // validate() rules this out
                None => break,
            }
            remaining -= 1;
        }
    }

    for var in 0..num_vars {
        if in_group[var] || fixed[var].is_some() {
            continue;
        }
        let mut best_value = assignment[var];
        let mut best_delta = 0.;
        for value in 0..objective.domain_size(var) {
            let delta = objective.delta(&mut assignment, var, value);
            if delta < best_delta - TOLERANCE {
                best_delta = delta;
                best_value = value;
            }
        }
        assignment[var] = best_value;
    }
    assignment
}

/// Greedy descent to a local minimum.  Among equally good moves the lower value index
/// wins, so equal-cost optima resolve the same way every time.
fn quench(objective: &Objective, moves: &MoveSet, assignment: &mut Vec<usize>) {
    let max_passes = 100 * (objective.num_variables() + 1);
    for _ in 0..max_passes {
        let mut changed = false;
        for var in &moves.free {
            let current = assignment[*var];
            let mut best: Option<(f64, usize)> = None;
            for value in 0..objective.domain_size(*var) {
                if value == current {
                    continue;
                }
                let delta = objective.delta(assignment, *var, value);
                let improves = delta < -TOLERANCE || (delta <= TOLERANCE && value < current);
                let better = match best {
                    Some((best_delta, _)) => delta < best_delta - TOLERANCE,
                    None => true,
                };
                if improves && better {
                    best = Some((delta, value));
                }
            }
            if let Some((_, value)) = best {
                assignment[*var] = value;
                changed = true;
            }
        }
        for group in &moves.groups {
            for from in group {
                for to in group {
                    if from == to || assignment[*from] == 0 ||
                       assignment[*to] + 1 >= objective.domain_size(*to) {
                        continue;
                    }
                    let mv = Move::Transfer { from: *from, to: *to };
                    let delta = move_delta(objective, assignment, mv);
                    if delta < -TOLERANCE || (delta <= TOLERANCE && to < from) {
                        apply(assignment, mv);
                        changed = true;
                    }
                }
            }
        }
        if !changed {
            return;
        }
    }
    log::debug!("quench stopped after {} passes", max_passes);
}

pub struct AnnealingEngine {
    max_iterations: u64,
    time_budget: Duration,
    random_seed: u64,
}

impl AnnealingEngine {
    pub fn new(config: &EngineConfig) -> AnnealingEngine {
        AnnealingEngine {
            max_iterations: config.max_iterations,
            time_budget: config.time_budget(),
            random_seed: config.random_seed,
        }
    }

    /// The starting temperature is the median magnitude of a sample of random move deltas,
    /// so that a typical uphill move is accepted about a third of the time.
    fn initial_temperature<R: Rng>(&self, objective: &Objective, moves: &MoveSet,
                                   assignment: &mut [usize], rng: &mut R) -> f64 {
        let mut deltas = vec![];
        for _ in 0..NUM_PROBES {
            if let Some(mv) = moves.propose(objective, assignment, rng) {
                let delta = move_delta(objective, assignment, mv).abs();
                if delta > TOLERANCE {
                    deltas.push(delta);
                }
            }
        }
        if deltas.is_empty() {
            return 1.;
        }
        deltas.sort_by(|aa, bb| aa.partial_cmp(bb).unwrap_or(std::cmp::Ordering::Equal));
        deltas[deltas.len() / 2]
    }
}

impl OptimizationEngine for AnnealingEngine {
    fn name(&self) -> &'static str {
        NAME
    }

    fn solve(&self, objective: &Objective, token: &CancellationToken)
             -> Result<Solution, TrafficError> {
        objective.validate()?;
        let budget = RunBudget::start(self.time_budget);
        budget.check(0, token)?;
        let moves = MoveSet::new(objective)?;
        let mut rng = Isaac64Rng::seed_from_u64(self.random_seed);

        let mut current = greedy_start(objective);
        let mut current_energy = objective.evaluate(&current);
        let mut best = current.clone();
        let mut best_energy = current_energy;
        let mut iterations = 0;

        if !moves.is_empty() {
            let temp0 = self.initial_temperature(objective, &moves, &mut current, &mut rng);
            let max_iters = self.max_iterations as f64;
            while iterations < self.max_iterations {
                budget.check(iterations, token)?;
                let temp = temp0 * COOLING_RANGE.powf(iterations as f64 / max_iters);
                iterations += 1;
                let mv = match moves.propose(objective, &current, &mut rng) {
                    Some(mv) => mv,
                    None => continue,
                };
                let delta = move_delta(objective, &mut current, mv);
                if delta <= 0. || rng.gen::<f64>() < (-delta / temp).exp() {
                    apply(&mut current, mv);
                    current_energy += delta;
                    if current_energy < best_energy - TOLERANCE {
                        best_energy = current_energy;
                        best.clone_from(&current);
                    }
                }
            }
        }

        quench(objective, &moves, &mut best);
        let energy = objective.evaluate(&best);
        log::debug!("annealing finished {} iterations in {:.3}s with energy {}", iterations,
                    budget.elapsed_s(), energy);
        Ok(Solution { assignment: best, energy, iterations })
    }
}


#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::array;

    use super::*;
    use super::super::objective::Constraint;

    #[test]
    fn test_greedy_start_is_feasible() {
        let mut obj = Objective::new();
        for ii in 0..4 {
            obj.add_variable(&format!("x{}", ii), 5);
        }
        obj.add_constraint(Constraint::SumEquals { vars: vec![0, 1, 2], total: 7 }).unwrap();
        obj.add_constraint(Constraint::Fixed { var: 1, value: 4 }).unwrap();
        obj.add_unary(3, vec![4., 3., 0., 3., 4.]).unwrap();
        let start = greedy_start(&obj);
        assert!(obj.is_feasible(&start));
        assert_eq!(start[1], 4);
        assert_eq!(start[3], 2);
    }

    #[test]
    fn test_anneal_finds_pairwise_optimum() {
        // a frustrated chain: each neighbour pair wants to differ
        let mut obj = Objective::new();
        let vars: Vec<usize> = (0..6).map(|ii| obj.add_variable(&format!("x{}", ii), 2)).collect();
        for pair in vars.windows(2) {
            obj.add_pairwise(pair[0], pair[1], array![[1., 0.], [0., 1.]]).unwrap();
        }
        obj.add_unary(vars[0], vec![0., 0.5]).unwrap();
        let engine = AnnealingEngine::new(&EngineConfig::default());
        let solution = engine.solve(&obj, &CancellationToken::new()).unwrap();
        assert_eq!(solution.assignment, vec![0, 1, 0, 1, 0, 1]);
        assert_relative_eq!(solution.energy, 0.);
    }

    #[test]
    fn test_same_seed_same_answer() {
        let mut obj = Objective::new();
        let vars: Vec<usize> = (0..5).map(|ii| obj.add_variable(&format!("g{}", ii), 7)).collect();
        for (ii, var) in vars.iter().enumerate() {
            let load = (ii + 1) as f64;
            obj.add_unary(*var, (0..7).map(|kk| load * (10. - kk as f64).powi(2)).collect())
                .unwrap();
        }
        obj.add_constraint(Constraint::SumEquals { vars: vars.clone(), total: 12 }).unwrap();
        let cfg = EngineConfig::default();
        let token = CancellationToken::new();
        let first = AnnealingEngine::new(&cfg).solve(&obj, &token).unwrap();
        let second = AnnealingEngine::new(&cfg).solve(&obj, &token).unwrap();
        assert_eq!(first, second);
        assert!(obj.is_feasible(&first.assignment));
        // heavier loads get at least as much green
        for pair in first.assignment.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn test_quench_prefers_lower_index_on_ties() {
        let mut obj = Objective::new();
        obj.add_variable("x", 3);
        obj.add_unary(0, vec![1., 1., 1.]).unwrap();
        let moves = MoveSet::new(&obj).unwrap();
        let mut assignment = vec![2];
        quench(&obj, &moves, &mut assignment);
        assert_eq!(assignment, vec![0]);
    }

    #[test]
    fn test_rejects_overlapping_sum_groups() {
        let mut obj = Objective::new();
        obj.add_variable("x", 3);
        obj.add_variable("y", 3);
        obj.add_constraint(Constraint::SumEquals { vars: vec![0, 1], total: 2 }).unwrap();
        obj.add_constraint(Constraint::SumEquals { vars: vec![1], total: 1 }).unwrap();
        let engine = AnnealingEngine::new(&EngineConfig::default());
        match engine.solve(&obj, &CancellationToken::new()) {
            Err(TrafficError::UnsupportedObjective { backend, .. }) => assert_eq!(backend, NAME),
            other => panic!("expected UnsupportedObjective, got {:?}", other),
        }
    }
}
