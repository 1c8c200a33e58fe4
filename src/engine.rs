use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use super::annealing::AnnealingEngine;
use super::config_utils::{Backend, EngineConfig};
use super::errors::TrafficError;
use super::exhaustive::ExhaustiveEngine;
use super::objective::Objective;
use super::qubo::QuboSampler;


/// A lowest-energy assignment found by an engine.  `assignment[v]` is the value index of
/// variable `v`.
#[derive(Clone, Debug, PartialEq)]
pub struct Solution {
    pub assignment: Vec<usize>,
    pub energy: f64,
    pub iterations: u64,
}

/// Shared flag a caller can set from another thread to stop a running solve.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

pub trait OptimizationEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Minimizes `objective` subject to its constraints.  Blocks until done, the time
    /// budget runs out, or `token` is cancelled.
    fn solve(&self, objective: &Objective, token: &CancellationToken)
             -> Result<Solution, TrafficError>;
}

pub fn make_engine(config: &EngineConfig) -> Box<dyn OptimizationEngine> {
    match config.backend {
        Backend::Classical => Box::new(AnnealingEngine::new(config)),
        Backend::QuantumStyle => Box::new(QuboSampler::new(config)),
        Backend::Exhaustive => Box::new(ExhaustiveEngine::new(config)),
    }
}

/// Solves the same objective once per seed, in parallel, and keeps the lowest-energy
/// solution.  Equal energies go to the earliest seed in `seeds`.  Fails only if every
/// seed fails, with the first seed's error.
pub fn best_of_seeds(config: &EngineConfig, objective: &Objective, seeds: &[u64],
                     token: &CancellationToken) -> Result<Solution, TrafficError> {
    if seeds.is_empty() {
        return Err(TrafficError::InvalidConfig(String::from("no seeds to compare")));
    }
    let results: Vec<Result<Solution, TrafficError>> = seeds.par_iter()
        .map(|seed| make_engine(&config.with_seed(*seed)).solve(objective, token))
        .collect();

    let mut best: Option<(usize, Solution)> = None;
    let mut first_err = None;
    for (ii, result) in results.into_iter().enumerate() {
        match result {
            Ok(solution) => {
                let better = match &best {
                    Some((_, incumbent)) => solution.energy < incumbent.energy,
                    None => true,
                };
                if better {
                    best = Some((ii, solution));
                }
            }
            Err(err) => {
                log::warn!("seed {} failed: {}", seeds[ii], err);
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
    }
    match (best, first_err) {
        (Some((ii, solution)), _) => {
            log::info!("best of {} seeds is {} with energy {}", seeds.len(), seeds[ii],
                       solution.energy);
            Ok(solution)
        }
        (None, Some(err)) => Err(err),
        (None, None) => Err(TrafficError::InvalidConfig(String::from("no seeds to compare"))),
    }
}

/// Iteration and wall-clock limits shared by every backend.
#[derive(Clone, Debug)]
pub(crate) struct RunBudget {
    started: Instant,
    time_budget: Duration,
}

// checking the clock on every iteration is measurably slow
const CLOCK_CHECK_INTERVAL: u64 = 256;

impl RunBudget {
    pub fn start(time_budget: Duration) -> RunBudget {
        RunBudget {
            started: Instant::now(),
            time_budget,
        }
    }

    /// Errors if the token is cancelled, or if `iterations` lands on a clock check and the
    /// budget is spent.
    pub fn check(&self, iterations: u64, token: &CancellationToken) -> Result<(), TrafficError> {
        if token.is_cancelled() {
            return Err(TrafficError::OptimizationCancelled { iterations });
        }
        if iterations % CLOCK_CHECK_INTERVAL == 0 {
            let elapsed = self.started.elapsed();
            if elapsed > self.time_budget {
                return Err(TrafficError::OptimizationTimeout {
                    elapsed_s: elapsed.as_secs_f64(),
                    iterations,
                });
            }
        }
        Ok(())
    }

    pub fn elapsed_s(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}


#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::array;

    use super::*;
    use super::super::objective::Constraint;

    fn toy_objective() -> Objective {
        let mut obj = Objective::new();
        let aa = obj.add_variable("a", 3);
        let bb = obj.add_variable("b", 3);
        obj.add_unary(aa, vec![3., 1., 2.]).unwrap();
        obj.add_unary(bb, vec![0., 2., 4.]).unwrap();
        obj.add_pairwise(aa, bb, array![[0., 0., 0.], [5., 0., 0.], [0., 0., 0.]]).unwrap();
        obj.add_constraint(Constraint::SumEquals { vars: vec![aa, bb], total: 2 }).unwrap();
        obj
    }

    #[test]
    fn test_backends_agree_on_toy() {
        // feasible: (0,2)=7, (1,1)=3, (2,0)=2
        let obj = toy_objective();
        let token = CancellationToken::new();
        for backend in &[Backend::Classical, Backend::QuantumStyle, Backend::Exhaustive] {
            let cfg = EngineConfig::default().with_backend(*backend);
            let solution = make_engine(&cfg).solve(&obj, &token).unwrap();
            assert_eq!(solution.assignment, vec![2, 0], "backend {}", backend.name());
            assert_relative_eq!(solution.energy, 2.);
        }
    }

    #[test]
    fn test_cancelled_before_start() {
        let obj = toy_objective();
        let token = CancellationToken::new();
        token.cancel();
        let cfg = EngineConfig::default();
        match make_engine(&cfg).solve(&obj, &token) {
            Err(TrafficError::OptimizationCancelled { .. }) => (),
            other => panic!("expected cancellation, got {:?}", other),
        }
    }

    #[test]
    fn test_best_of_seeds() {
        let obj = toy_objective();
        let token = CancellationToken::new();
        let cfg = EngineConfig::default();
        let solution = best_of_seeds(&cfg, &obj, &[1, 2, 3], &token).unwrap();
        assert_eq!(solution.assignment, vec![2, 0]);
        assert!(best_of_seeds(&cfg, &obj, &[], &token).is_err());
    }

    #[test]
    fn test_budget_timeout() {
        let budget = RunBudget::start(Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(2));
        let token = CancellationToken::new();
        // only multiples of the check interval look at the clock
        assert!(budget.check(1, &token).is_ok());
        match budget.check(CLOCK_CHECK_INTERVAL, &token) {
            Err(TrafficError::OptimizationTimeout { iterations, .. }) => {
                assert_eq!(iterations, CLOCK_CHECK_INTERVAL)
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
