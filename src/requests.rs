use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::errors::TrafficError;
use super::road_network::{IntersectionId, RoadNetwork};


pub type VehicleId = String;

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct VehicleRequest {
    pub id: VehicleId,
    pub origin: IntersectionId,
    pub destination: IntersectionId,
    #[serde(default)]
    pub departure_time_s: Option<f64>,
}

impl VehicleRequest {
    pub fn new(id: &str, origin: &str, destination: &str) -> VehicleRequest {
        VehicleRequest {
            id: String::from(id),
            origin: String::from(origin),
            destination: String::from(destination),
            departure_time_s: None,
        }
    }

    pub fn departing_at(mut self, departure_time_s: f64) -> VehicleRequest {
        self.departure_time_s = Some(departure_time_s);
        self
    }
}

/// A vehicle whose path, and the signal phases along it, come before everyone else's.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyVehicleRequest {
    pub id: VehicleId,
    pub origin: IntersectionId,
    pub destination: IntersectionId,
    #[serde(default)]
    pub departure_time_s: Option<f64>,
    // higher is more senior
    pub priority: u32,
    // measured along the vehicle's path from its origin, in segment length units
    pub affected_radius: f64,
}

impl EmergencyVehicleRequest {
    pub fn new(id: &str, origin: &str, destination: &str, priority: u32, affected_radius: f64)
               -> EmergencyVehicleRequest {
        EmergencyVehicleRequest {
            id: String::from(id),
            origin: String::from(origin),
            destination: String::from(destination),
            departure_time_s: None,
            priority,
            affected_radius,
        }
    }

    pub fn departing_at(mut self, departure_time_s: f64) -> EmergencyVehicleRequest {
        self.departure_time_s = Some(departure_time_s);
        self
    }

    pub fn departure_s(&self) -> f64 {
        match self.departure_time_s {
            Some(tt) => tt,
            None => 0.,
        }
    }

    pub fn as_vehicle(&self) -> VehicleRequest {
        VehicleRequest {
            id: self.id.clone(),
            origin: self.origin.clone(),
            destination: self.destination.clone(),
            departure_time_s: self.departure_time_s,
        }
    }
}

/// Checks that every request names known intersections and that no two requests,
/// normal or emergency, share an identifier.
pub fn check_requests(network: &RoadNetwork, vehicles: &[VehicleRequest],
                      emergencies: &[EmergencyVehicleRequest]) -> Result<(), TrafficError> {
    let mut seen = HashSet::new();
    let all = vehicles.iter().cloned()
        .chain(emergencies.iter().map(|ev| ev.as_vehicle()));
    for request in all {
        if !seen.insert(request.id.clone()) {
            return Err(TrafficError::DuplicateId(request.id));
        }
        for end in &[&request.origin, &request.destination] {
            if !network.has_intersection(end) {
                return Err(TrafficError::invalid_topology(
                    end, &format!("vehicle '{}' references an unknown intersection", request.id)));
            }
        }
    }
    for emergency in emergencies {
        if emergency.affected_radius.is_nan() || emergency.affected_radius < 0. {
            return Err(TrafficError::invalid_topology(
                &emergency.origin,
                &format!("emergency vehicle '{}' has a negative affected radius", emergency.id)));
        }
    }
    Ok(())
}
