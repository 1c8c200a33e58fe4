use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::config_utils::EngineConfig;
use super::cost_builder::{build_signal_objective, SignalObjective, TransitWindow};
use super::engine::{make_engine, CancellationToken};
use super::errors::TrafficError;
use super::path_optimizer::PathAssignments;
use super::requests::EmergencyVehicleRequest;
use super::road_network::{IntersectionId, RoadNetwork, SegmentId};


/// A span of the cycle during which exactly one incoming segment has green.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub green: SegmentId,
    pub duration_s: u32,
    #[serde(default)]
    pub pinned: bool,
}

/// A fixed-length signal cycle.  Phases run in order starting `offset_s` seconds into
/// every cycle, wrapping around its end.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalPlan {
    pub intersection: IntersectionId,
    pub cycle_length_s: u32,
    pub offset_s: f64,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub windows: Vec<TransitWindow>,
}

pub type SignalPlans = BTreeMap<IntersectionId, SignalPlan>;

impl SignalPlan {
    pub fn total_duration_s(&self) -> u32 {
        self.phases.iter().map(|pp| pp.duration_s).sum()
    }

    /// The phase showing green at absolute time `time_s`.
    pub fn phase_at(&self, time_s: f64) -> Option<&Phase> {
        let cycle = self.cycle_length_s as f64;
        let into_cycle = (time_s - self.offset_s).rem_euclid(cycle);
        let mut phase_end = 0.;
        for phase in &self.phases {
            phase_end += phase.duration_s as f64;
            if into_cycle < phase_end {
                return Some(phase);
            }
        }
        self.phases.last()
    }

    pub fn is_green(&self, segment: &str, time_s: f64) -> bool {
        match self.phase_at(time_s) {
            Some(phase) => phase.green == segment,
            None => false,
        }
    }

    /// Checks that the phases fill the cycle exactly and that every emergency window is
    /// green from start to end.
    pub fn check(&self) -> Result<(), TrafficError> {
        if self.total_duration_s() != self.cycle_length_s {
            return Err(TrafficError::infeasible_cycle(&self.intersection, format!(
                "phases last {}s in a {}s cycle", self.total_duration_s(), self.cycle_length_s)));
        }
        for ww in &self.windows {
            // phases are contiguous, so the two ends decide it
            let last_instant = (ww.end_s - 1e-6).max(ww.start_s);
            if !self.is_green(&ww.segment, ww.start_s) || !self.is_green(&ww.segment, last_instant) {
                return Err(TrafficError::infeasible_cycle(&self.intersection, format!(
                    "'{}' is not green for '{}' from {:.1}s to {:.1}s", ww.segment,
                    ww.vehicle_id, ww.start_s, ww.end_s)));
            }
        }
        Ok(())
    }
}

pub fn optimize_signals(network: &RoadNetwork, assigned: &PathAssignments,
                        emergencies: &[EmergencyVehicleRequest], config: &EngineConfig)
                        -> Result<SignalPlans, TrafficError> {
    optimize_signals_with_token(network, assigned, emergencies, config, &CancellationToken::new())
}

pub fn optimize_signals_with_token(network: &RoadNetwork, assigned: &PathAssignments,
                                   emergencies: &[EmergencyVehicleRequest],
                                   config: &EngineConfig, token: &CancellationToken)
                                   -> Result<SignalPlans, TrafficError> {
    config.validate()?;
    let signal_obj = build_signal_objective(network, assigned, emergencies, &config.signal)?;
    let engine = make_engine(config);
    log::info!("timing {} intersections with the {} backend", signal_obj.intersections.len(),
               engine.name());
    let solution = engine.solve(&signal_obj.objective, token)?;
    assemble(&signal_obj, &solution.assignment)
}

fn assemble(signal_obj: &SignalObjective, assignment: &[usize])
            -> Result<SignalPlans, TrafficError> {
    let cycle = signal_obj.signal.cycle_length_s;
    let mut plans = SignalPlans::new();
    for slots in &signal_obj.intersections {
        let phases = slots.phases.iter().map(|slot| Phase {
            green: slot.segment.clone(),
            duration_s: match slot.var {
                Some(var) => signal_obj.duration_s(assignment[var]),
                None => cycle,
            },
            pinned: slot.pinned,
        }).collect();
        let plan = SignalPlan {
            intersection: slots.intersection.clone(),
            cycle_length_s: cycle,
            offset_s: slots.offset_s,
            phases,
            windows: slots.windows.clone(),
        };
        plan.check()?;
        plans.insert(plan.intersection.clone(), plan);
    }
    Ok(plans)
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::super::config_utils::Backend;
    use super::super::path_optimizer::PathAssignment;
    use super::super::road_network::{CongestionFn, RoadSegment};
    use super::super::test_utils::{emergency, grid_network, init_logging, square_network};

    fn through(vehicle_id: &str, segments: &[&str]) -> PathAssignment {
        PathAssignment {
            vehicle_id: String::from(vehicle_id),
            segments: segments.iter().map(|ss| String::from(*ss)).collect(),
            cost: 0.,
            hops: segments.len(),
            emergency: false,
        }
    }

    #[test]
    fn test_phase_at_wraps() {
        let plan = SignalPlan {
            intersection: String::from("X"),
            cycle_length_s: 60,
            offset_s: 50.,
            phases: vec![
                Phase { green: String::from("a"), duration_s: 20, pinned: false },
                Phase { green: String::from("b"), duration_s: 40, pinned: false },
            ],
            windows: vec![],
        };
        assert!(plan.is_green("a", 50.));
        assert!(plan.is_green("a", 69.9));
        assert!(plan.is_green("b", 70.));
        assert!(plan.is_green("b", 49.));
        // one cycle earlier
        assert!(plan.is_green("a", -5.));
        assert!(plan.check().is_ok());
    }

    #[test]
    fn test_single_approach_gets_whole_cycle() {
        let network = square_network(CongestionFn::Constant);
        let plans = optimize_signals(&network, &PathAssignments::new(), &[],
                                     &EngineConfig::default()).unwrap();
        assert_eq!(plans.len(), 4);
        for plan in plans.values() {
            assert_eq!(plan.phases.len(), 1);
            assert_eq!(plan.phases[0].duration_s, 90);
        }
    }

    #[test]
    fn test_no_incoming_no_plan() {
        let mut network = square_network(CongestionFn::Constant);
        network.add_intersection("E").unwrap();
        let plans = optimize_signals(&network, &PathAssignments::new(), &[],
                                     &EngineConfig::default()).unwrap();
        assert!(!plans.contains_key("E"));
    }

    #[test]
    fn test_loaded_approach_gets_max_green() {
        init_logging();
        let network = grid_network(2, 2, 4.);
        let mut assigned = PathAssignments::new();
        for id in &["v1", "v2", "v3"] {
            assigned.insert(String::from(*id), through(id, &["r0c0>r0c1"]));
        }
        let plans = optimize_signals(&network, &assigned, &[], &EngineConfig::default())
            .unwrap();
        let plan = &plans["r0c1"];
        assert_eq!(plan.phases[0].green, "r0c0>r0c1");
        assert_eq!(plan.phases[0].duration_s, 60);
        assert_eq!(plan.phases[1].duration_s, 30);
        for plan in plans.values() {
            assert_eq!(plan.total_duration_s(), 90);
        }
    }

    #[test]
    fn test_exhaustive_matches_classical() {
        // two roads merging at X
        let mut network = RoadNetwork::new();
        for id in &["X", "Y", "Z"] {
            network.add_intersection(id).unwrap();
        }
        for from in &["Y", "Z"] {
            let id = format!("{}>X", from);
            network.add_segment(RoadSegment::new(&id, from, "X", 1., 2., CongestionFn::Constant))
                .unwrap();
        }
        let mut assigned = PathAssignments::new();
        assigned.insert(String::from("v1"), through("v1", &["Z>X"]));
        for backend in &[Backend::Classical, Backend::Exhaustive] {
            let cfg = EngineConfig::default().with_backend(*backend);
            let plans = optimize_signals(&network, &assigned, &[], &cfg).unwrap();
            assert_eq!(plans.len(), 1);
            let durations: Vec<u32> = plans["X"].phases.iter().map(|pp| pp.duration_s).collect();
            assert_eq!(durations, vec![30, 60], "backend {}", backend.name());
        }
    }

    #[test]
    fn test_emergency_window_is_green() {
        let network = grid_network(3, 3, 4.);
        let ev = emergency("e1", "r0c0", "r2c2").departing_at(17.);
        let plans = optimize_signals(&network, &PathAssignments::new(), &[ev],
                                     &EngineConfig::default()).unwrap();
        let num_windows: usize = plans.values().map(|pp| pp.windows.len()).sum();
        // one for every intersection after the origin
        assert_eq!(num_windows, 4);
        for plan in plans.values() {
            assert_eq!(plan.total_duration_s(), 90);
            for ww in &plan.windows {
                assert!(plan.is_green(&ww.segment, ww.start_s));
                assert!(plan.is_green(&ww.segment, ww.end_s - 0.01));
                let phase = plan.phase_at(ww.start_s).unwrap();
                assert!(phase.pinned);
                assert_eq!(phase.duration_s, 60);
            }
        }
    }

    #[test]
    fn test_zero_clearance_window() {
        let network = grid_network(3, 3, 4.);
        let ev = emergency("e1", "r0c0", "r2c2");
        let mut cfg = EngineConfig::default();
        cfg.signal.emergency_clearance_s = 0.;
        let plans = optimize_signals(&network, &PathAssignments::new(), &[ev], &cfg).unwrap();
        let num_windows: usize = plans.values().map(|pp| pp.windows.len()).sum();
        assert_eq!(num_windows, 4);
        for plan in plans.values() {
            for ww in &plan.windows {
                assert_eq!(ww.start_s, ww.end_s);
                assert!(plan.is_green(&ww.segment, ww.start_s));
                assert!(plan.phase_at(ww.start_s).unwrap().pinned);
            }
            assert!(plan.check().is_ok());
        }
    }

    #[test]
    fn test_cycle_shorter_than_pinned_green() {
        let network = grid_network(2, 2, 4.);
        let ev = emergency("e1", "r0c0", "r1c1");
        let mut cfg = EngineConfig::default();
        cfg.signal.cycle_length_s = 60;
        cfg.signal.max_green_s = 55;
        match optimize_signals(&network, &PathAssignments::new(), &[ev], &cfg) {
            Err(TrafficError::InfeasibleCycle { .. }) => (),
            other => panic!("expected InfeasibleCycle, got {:?}", other),
        }
    }
}
