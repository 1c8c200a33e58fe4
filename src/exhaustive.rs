use std::time::Duration;

use itertools::Itertools;

use super::config_utils::EngineConfig;
use super::engine::{CancellationToken, OptimizationEngine, RunBudget, Solution};
use super::errors::TrafficError;
use super::objective::Objective;


const NAME: &str = "exhaustive";

/// Exact search over every assignment.  Assignments are visited in lexicographic order and
/// only a strictly lower energy replaces the incumbent, so ties go to the lowest values.
pub struct ExhaustiveEngine {
    time_budget: Duration,
    max_states: u64,
}

impl ExhaustiveEngine {
    pub fn new(config: &EngineConfig) -> ExhaustiveEngine {
        ExhaustiveEngine {
            time_budget: config.time_budget(),
            max_states: config.max_exhaustive_states,
        }
    }
}

impl OptimizationEngine for ExhaustiveEngine {
    fn name(&self) -> &'static str {
        NAME
    }

    fn solve(&self, objective: &Objective, token: &CancellationToken)
             -> Result<Solution, TrafficError> {
        objective.validate()?;
        let budget = RunBudget::start(self.time_budget);
        budget.check(0, token)?;
        match objective.search_space_size() {
            Some(size) if size <= self.max_states as u128 => (),
            Some(size) => return Err(TrafficError::unsupported(
                NAME, format!("{} states is more than the limit of {}", size, self.max_states))),
            None => return Err(TrafficError::unsupported(
                NAME, String::from("search space size overflows"))),
        }

        if objective.num_variables() == 0 {
            return Ok(Solution { assignment: vec![], energy: objective.evaluate(&[]),
                                 iterations: 0 });
        }

        let mut best: Option<(Vec<usize>, f64)> = None;
        let mut iterations = 0;
        let all_states = (0..objective.num_variables())
            .map(|var| 0..objective.domain_size(var))
            .multi_cartesian_product();
        for assignment in all_states {
            budget.check(iterations, token)?;
            iterations += 1;
            if !objective.is_feasible(&assignment) {
                continue;
            }
            let energy = objective.evaluate(&assignment);
            let better = match &best {
                Some((_, best_energy)) => energy < *best_energy,
                None => true,
            };
            if better {
                best = Some((assignment, energy));
            }
        }

        log::debug!("enumerated {} states in {:.3}s", iterations, budget.elapsed_s());
        match best {
            Some((assignment, energy)) => Ok(Solution { assignment, energy, iterations }),
            None => Err(TrafficError::NoFeasibleSample { reads: iterations as usize }),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::super::objective::Constraint;

    #[test]
    fn test_state_limit() {
        let mut obj = Objective::new();
        for ii in 0..4 {
            obj.add_variable(&format!("x{}", ii), 10);
        }
        let mut cfg = EngineConfig::default();
        cfg.max_exhaustive_states = 9999;
        let token = CancellationToken::new();
        match ExhaustiveEngine::new(&cfg).solve(&obj, &token) {
            Err(TrafficError::UnsupportedObjective { backend, .. }) => assert_eq!(backend, NAME),
            other => panic!("expected UnsupportedObjective, got {:?}", other),
        }
        cfg.max_exhaustive_states = 10000;
        let solution = ExhaustiveEngine::new(&cfg).solve(&obj, &token).unwrap();
        // every state costs zero, so the first one wins
        assert_eq!(solution.assignment, vec![0, 0, 0, 0]);
        assert_eq!(solution.iterations, 10000);
    }

    #[test]
    fn test_no_feasible_state() {
        let mut obj = Objective::new();
        obj.add_variable("x", 3);
        obj.add_variable("y", 3);
        obj.add_constraint(Constraint::Fixed { var: 0, value: 1 }).unwrap();
        obj.add_constraint(Constraint::Fixed { var: 0, value: 2 }).unwrap();
        let engine = ExhaustiveEngine::new(&EngineConfig::default());
        assert!(engine.solve(&obj, &CancellationToken::new()).is_err());
    }
}
