// non-standard crate imports
use serde::{Deserialize, Serialize};

// imports of other modules from this crate
mod errors;
pub use errors::TrafficError;

mod road_network;
pub use road_network::{CongestionFn, Intersection, IntersectionId, RawNetwork, RoadNetwork,
                       RoadSegment, SegmentId, SegmentLoads};

mod requests;
pub use requests::{EmergencyVehicleRequest, VehicleId, VehicleRequest};

mod shortest_paths;
pub use shortest_paths::{k_shortest_paths, shortest_path, CandidatePath};

mod config_utils;
pub use config_utils::{Backend, CongestionModel, EngineConfig, SignalConfig};

mod objective;
pub use objective::{Constraint, CostFn, Objective, Term, Variable};

mod cost_builder;
pub use cost_builder::{build_path_objective, build_signal_objective, PathObjective,
                       SignalObjective, TransitWindow};

mod engine;
pub use engine::{best_of_seeds, make_engine, CancellationToken, OptimizationEngine, Solution};

mod annealing;
pub use annealing::AnnealingEngine;

mod qubo;
pub use qubo::{build_qubo, Qubo, QuboSampler};

mod exhaustive;
pub use exhaustive::ExhaustiveEngine;

mod path_optimizer;
pub use path_optimizer::{optimize_paths, optimize_paths_with_token, PathAssignment,
                         PathAssignments};

mod signal_optimizer;
pub use signal_optimizer::{optimize_signals, optimize_signals_with_token, Phase, SignalPlan,
                           SignalPlans};

#[cfg(test)]
mod test_utils;


/// Builds a network from its already-parsed form, checking every segment on the way in.
pub fn load_network(raw: &RawNetwork) -> Result<RoadNetwork, TrafficError> {
    RoadNetwork::from_raw(raw)
}

/// Both halves of a solve: a route for every vehicle and a plan for every signalled
/// intersection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkPlan {
    pub paths: PathAssignments,
    pub signals: SignalPlans,
}

pub fn optimize_network(network: &RoadNetwork, vehicles: &[VehicleRequest],
                        emergencies: &[EmergencyVehicleRequest], config: &EngineConfig)
                        -> Result<NetworkPlan, TrafficError> {
    optimize_network_with_token(network, vehicles, emergencies, config,
                                &CancellationToken::new())
}

/// Solves paths and then signals, timing the signals for the solved paths.  Without
/// emergency vehicles, and with `parallel` set, the two run side by side instead and the
/// signals are timed for every vehicle taking its free-flow shortest path.
pub fn optimize_network_with_token(network: &RoadNetwork, vehicles: &[VehicleRequest],
                                   emergencies: &[EmergencyVehicleRequest],
                                   config: &EngineConfig, token: &CancellationToken)
                                   -> Result<NetworkPlan, TrafficError> {
    config.validate()?;
    if emergencies.is_empty() && config.parallel {
        log::info!("solving paths and signals in parallel");
        let (paths, signals) = rayon::join(
            || optimize_paths_with_token(network, vehicles, &[], config, token),
            || {
                let demand = free_flow_demand(network, vehicles)?;
                optimize_signals_with_token(network, &demand, &[], config, token)
            },
        );
        return Ok(NetworkPlan { paths: paths?, signals: signals? });
    }

    let paths = optimize_paths_with_token(network, vehicles, emergencies, config, token)?;
    let signals = optimize_signals_with_token(network, &paths, emergencies, config, token)?;
    Ok(NetworkPlan { paths, signals })
}

/// Every vehicle on its own shortest path.  Vehicles with no path are left out; the path
/// solve reports them.
fn free_flow_demand(network: &RoadNetwork, vehicles: &[VehicleRequest])
                    -> Result<PathAssignments, TrafficError> {
    let mut demand = PathAssignments::new();
    for vehicle in vehicles {
        if let Some(path) = shortest_path(network, &vehicle.origin, &vehicle.destination)? {
            demand.insert(vehicle.id.clone(), PathAssignment {
                vehicle_id: vehicle.id.clone(),
                hops: path.hops(),
                segments: path.segments,
                cost: path.cost,
                emergency: false,
            });
        }
    }
    Ok(demand)
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::test_utils::{compare_maps, grid_network, init_logging, vehicle};

    #[test]
    fn test_parallel_matches_sequential_paths() {
        init_logging();
        let network = grid_network(3, 3, 2.);
        let vehicles = vec![vehicle("v1", "r0c0", "r2c2"), vehicle("v2", "r2c0", "r0c2")];
        let mut cfg = EngineConfig::default();
        let parallel = optimize_network(&network, &vehicles, &[], &cfg).unwrap();
        cfg.parallel = false;
        let sequential = optimize_network(&network, &vehicles, &[], &cfg).unwrap();
        compare_maps(&parallel.paths, &sequential.paths);
        for plan in parallel.signals.values().chain(sequential.signals.values()) {
            assert_eq!(plan.total_duration_s(), plan.cycle_length_s);
        }
    }

    #[test]
    fn test_load_network_round_trip() {
        let network = grid_network(2, 3, 5.);
        let rebuilt = load_network(&network.to_raw()).unwrap();
        assert_eq!(rebuilt, network);
    }
}
