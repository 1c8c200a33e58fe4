use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::config_utils::EngineConfig;
use super::cost_builder::{build_path_objective, PathObjective};
use super::engine::{make_engine, CancellationToken};
use super::errors::TrafficError;
use super::requests::{EmergencyVehicleRequest, VehicleId, VehicleRequest};
use super::road_network::{RoadNetwork, SegmentId, SegmentLoads};


/// The route chosen for one vehicle.  `cost` is its travel time given every other
/// vehicle's route.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathAssignment {
    pub vehicle_id: VehicleId,
    pub segments: Vec<SegmentId>,
    pub cost: f64,
    pub hops: usize,
    #[serde(default)]
    pub emergency: bool,
}

pub type PathAssignments = BTreeMap<VehicleId, PathAssignment>;

pub fn optimize_paths(network: &RoadNetwork, vehicles: &[VehicleRequest],
                      emergencies: &[EmergencyVehicleRequest], config: &EngineConfig)
                      -> Result<PathAssignments, TrafficError> {
    optimize_paths_with_token(network, vehicles, emergencies, config, &CancellationToken::new())
}

pub fn optimize_paths_with_token(network: &RoadNetwork, vehicles: &[VehicleRequest],
                                 emergencies: &[EmergencyVehicleRequest], config: &EngineConfig,
                                 token: &CancellationToken)
                                 -> Result<PathAssignments, TrafficError> {
    config.validate()?;
    let path_obj = build_path_objective(network, vehicles, emergencies, config)?;
    let engine = make_engine(config);
    log::info!("assigning paths to {} vehicles with the {} backend", path_obj.vehicles.len(),
               engine.name());
    let solution = engine.solve(&path_obj.objective, token)?;

    let mut assignment = solution.assignment;
    let num_pinned = pin_emergencies(&path_obj, &mut assignment);
    if num_pinned > 0 {
        log::warn!("{} emergency vehicles were off their primary path after the solve",
                   num_pinned);
    }
    assemble(network, &path_obj, &assignment)
}

/// Puts every emergency vehicle back on its first candidate.  Returns how many had to be
/// moved.
pub(crate) fn pin_emergencies(path_obj: &PathObjective, assignment: &mut [usize]) -> usize {
    let mut num_pinned = 0;
    for (var, is_emergency) in path_obj.is_emergency.iter().enumerate() {
        if *is_emergency && assignment[var] != 0 {
            log::warn!("restoring emergency vehicle {} to its primary path",
                       path_obj.vehicles[var].id);
            assignment[var] = 0;
            num_pinned += 1;
        }
    }
    num_pinned
}

fn assemble(network: &RoadNetwork, path_obj: &PathObjective, assignment: &[usize])
            -> Result<PathAssignments, TrafficError> {
    let chosen = path_obj.chosen(assignment);
    let loads = SegmentLoads::from_paths(chosen.iter().map(|cc| &cc.segments));

    let mut assignments = PathAssignments::new();
    for (var, path) in chosen.iter().enumerate() {
        let request = &path_obj.vehicles[var];
        network.validate_walk(&request.origin, &request.destination, &path.segments)?;
        let cost = network.path_cost(&path.segments, &loads)?;
        log::debug!("vehicle {} takes {} segments at cost {}", request.id, path.hops(), cost);
        assignments.insert(request.id.clone(), PathAssignment {
            vehicle_id: request.id.clone(),
            segments: path.segments.clone(),
            cost,
            hops: path.hops(),
            emergency: path_obj.is_emergency[var],
        });
    }
    Ok(assignments)
}


#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use super::super::road_network::CongestionFn;
    use super::super::test_utils::{emergency, grid_network, init_logging, square_network,
                                   vehicle};

    fn ids(path: &[&str]) -> Vec<SegmentId> {
        path.iter().map(|ss| String::from(*ss)).collect()
    }

    #[test]
    fn test_square_scenario() {
        init_logging();
        let network = square_network(CongestionFn::Bpr { alpha: 0.15, beta: 4. });
        let vehicles = vec![vehicle("v1", "A", "C")];
        let emergencies = vec![emergency("e1", "D", "C")];
        let assignments = optimize_paths(&network, &vehicles, &emergencies,
                                         &EngineConfig::default()).unwrap();
        assert_eq!(assignments["v1"].segments, ids(&["A-B", "B-C"]));
        assert_eq!(assignments["e1"].segments, ids(&["D-A", "A-B", "B-C"]));
        assert!(assignments["e1"].emergency);
        assert_eq!(assignments["e1"].hops, 3);
    }

    #[test]
    fn test_costs_use_final_loads() {
        let network = square_network(CongestionFn::Linear { slope: 1. });
        let vehicles = vec![vehicle("v1", "A", "C"), vehicle("v2", "B", "D")];
        let assignments = optimize_paths(&network, &vehicles, &[],
                                         &EngineConfig::default()).unwrap();
        // both use B-C, a load of two on capacity two doubles its time
        assert_relative_eq!(assignments["v1"].cost, 1.5 + 2.);
        assert_relative_eq!(assignments["v2"].cost, 2. + 1.5);
    }

    #[test]
    fn test_no_outgoing_segments() {
        let mut network = square_network(CongestionFn::Constant);
        network.add_intersection("E").unwrap();
        let vehicles = vec![vehicle("v1", "E", "A")];
        match optimize_paths(&network, &vehicles, &[], &EngineConfig::default()) {
            Err(TrafficError::NoFeasiblePath { vehicle, origin, .. }) => {
                assert_eq!(vehicle, "v1");
                assert_eq!(origin, "E");
            }
            other => panic!("expected NoFeasiblePath, got {:?}", other),
        }
    }

    #[test]
    fn test_hop_bound() {
        let network = square_network(CongestionFn::Constant);
        let vehicles = vec![vehicle("v1", "A", "D")];
        let mut cfg = EngineConfig::default();
        cfg.max_hops = 2;
        match optimize_paths(&network, &vehicles, &[], &cfg) {
            Err(TrafficError::NoFeasiblePath { reason, .. }) => assert!(reason.contains("2")),
            other => panic!("expected NoFeasiblePath, got {:?}", other),
        }
    }

    #[test]
    fn test_pinning_restores_primary() {
        let network = grid_network(3, 3, 4.);
        let emergencies = vec![emergency("e1", "r0c0", "r2c2")];
        let vehicles = vec![vehicle("v1", "r0c0", "r2c2")];
        let path_obj = build_path_objective(&network, &vehicles, &emergencies,
                                            &EngineConfig::default()).unwrap();
        let mut assignment = vec![2, 1];
        assert_eq!(pin_emergencies(&path_obj, &mut assignment), 1);
        assert_eq!(assignment, vec![0, 1]);
        assert_eq!(pin_emergencies(&path_obj, &mut assignment), 0);
    }

    #[test]
    fn test_vehicles_avoid_each_other() {
        // two vehicles across a 3x3 grid, heavy congestion: they should not share a segment
        let network = grid_network(3, 3, 1.);
        let vehicles = vec![vehicle("v1", "r0c0", "r2c2"), vehicle("v2", "r0c0", "r2c2")];
        let assignments = optimize_paths(&network, &vehicles, &[],
                                         &EngineConfig::default()).unwrap();
        let first = &assignments["v1"].segments;
        let second = &assignments["v2"].segments;
        assert!(first.iter().all(|seg| !second.contains(seg)));
        assert_eq!(assignments["v1"].hops, 4);
        assert_eq!(assignments["v2"].hops, 4);
    }
}
