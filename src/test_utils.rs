use std::collections::BTreeMap;
use std::fmt::Debug;

use super::road_network::{CongestionFn, RoadNetwork, RoadSegment};
use super::requests::{EmergencyVehicleRequest, VehicleRequest};


/// Routes log output through the test harness.  Safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One-way square A -> B -> C -> D -> A, every segment of length 1 and capacity 2.
pub fn square_network(congestion: CongestionFn) -> RoadNetwork {
    let mut network = RoadNetwork::new();
    for id in &["A", "B", "C", "D"] {
        network.add_intersection(id).unwrap();
    }
    for (from, to) in &[("A", "B"), ("B", "C"), ("C", "D"), ("D", "A")] {
        let id = format!("{}-{}", from, to);
        let seg = RoadSegment::new(&id, from, to, 1., 2., congestion.clone());
        network.add_segment(seg).unwrap();
    }
    network
}

/// A `width` x `height` grid of two-way streets.  Intersections are named "r{row}c{col}" and
/// segments "{from}>{to}".
pub fn grid_network(width: usize, height: usize, capacity: f64) -> RoadNetwork {
    let mut network = RoadNetwork::new();
    let name = |row: usize, col: usize| format!("r{}c{}", row, col);
    for row in 0..height {
        for col in 0..width {
            network.add_intersection(&name(row, col)).unwrap();
        }
    }
    let mut add_two_way = |aa: String, bb: String| {
        for (from, to) in &[(&aa, &bb), (&bb, &aa)] {
            let id = format!("{}>{}", from, to);
            let seg = RoadSegment::new(&id, from, to, 1., capacity,
                                       CongestionFn::Linear { slope: 1. });
            network.add_segment(seg).unwrap();
        }
    };
    for row in 0..height {
        for col in 0..width {
            if col + 1 < width {
                add_two_way(name(row, col), name(row, col + 1));
            }
            if row + 1 < height {
                add_two_way(name(row, col), name(row + 1, col));
            }
        }
    }
    network
}

pub fn vehicle(id: &str, origin: &str, destination: &str) -> VehicleRequest {
    VehicleRequest::new(id, origin, destination)
}

pub fn emergency(id: &str, origin: &str, destination: &str) -> EmergencyVehicleRequest {
    EmergencyVehicleRequest::new(id, origin, destination, 1, f64::INFINITY)
}

/// Checks that the contents of two maps are the same.
pub fn compare_maps<KK, VV>(query_map: &BTreeMap<KK, VV>, true_map: &BTreeMap<KK, VV>)
    where KK: Debug + Ord,
    VV: Debug + PartialEq,
{
    assert_eq!(query_map.len(), true_map.len());
    for (true_key, true_val) in true_map {
        match query_map.get(true_key) {
            Some(val) => assert_eq!(val, true_val),
            None => assert!(false, "Key {:?} missing!", true_key),
        }
    }
}
