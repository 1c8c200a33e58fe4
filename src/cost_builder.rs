// Builds the objectives for the path and signal sub-problems.  Both express emergency
// primacy the same way: a penalty scaled far above the largest cost that normal traffic
// can produce.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use super::config_utils::{CongestionModel, EngineConfig, SignalConfig};
use super::errors::TrafficError;
use super::objective::{Constraint, CostFn, Objective};
use super::path_optimizer::PathAssignments;
use super::requests::{check_requests, EmergencyVehicleRequest, VehicleId, VehicleRequest};
use super::road_network::{IntersectionId, RoadNetwork, RoadSegment, SegmentId, SegmentLoads};
use super::shortest_paths::{k_shortest_paths, shortest_path, CandidatePath};


const PENALTY_FACTOR: f64 = 1000.;
const TOLERANCE: f64 = 1e-9;

/// A penalty that outweighs any total `bound` could describe.
pub fn dominant_penalty(bound: f64) -> f64 {
    PENALTY_FACTOR * bound + 1.
}

fn priority_weight(priority: u32) -> f64 {
    1. + priority as f64
}

/// The path sub-problem.  Variable `v` chooses among `candidates[v]` for `vehicles[v]`.
#[derive(Debug)]
pub struct PathObjective {
    pub objective: Objective,
    pub vehicles: Vec<VehicleRequest>,
    pub candidates: Vec<Vec<CandidatePath>>,
    pub is_emergency: Vec<bool>,
    pub emergency_penalty: f64,
}

impl PathObjective {
    pub fn chosen(&self, assignment: &[usize]) -> Vec<&CandidatePath> {
        assignment.iter().enumerate().map(|(vv, value)| &self.candidates[vv][*value]).collect()
    }
}

fn no_path(request: &VehicleRequest, reason: String) -> TrafficError {
    TrafficError::NoFeasiblePath {
        vehicle: request.id.clone(),
        origin: request.origin.clone(),
        destination: request.destination.clone(),
        reason,
    }
}

/// The routes a vehicle may be assigned, cheapest first.  For an emergency vehicle the
/// first is its minimum-cost path whatever its length.
fn candidate_paths(network: &RoadNetwork, request: &VehicleRequest, is_emergency: bool,
                   config: &EngineConfig) -> Result<Vec<CandidatePath>, TrafficError> {
    if request.origin == request.destination {
        return Err(no_path(request, String::from("origin and destination are the same")));
    }
    if network.outgoing_segments(&request.origin)?.is_empty() {
        return Err(no_path(request, String::from("origin has no outgoing segments")));
    }
    let best = match shortest_path(network, &request.origin, &request.destination)? {
        Some(best) => best,
        None => return Err(no_path(request, String::from("destination is unreachable"))),
    };

    let mut candidates = k_shortest_paths(network, &request.origin, &request.destination,
                                          config.candidate_path_bound, config.max_hops)?;
    if is_emergency {
        candidates.retain(|cc| cc.segments != best.segments);
        candidates.insert(0, best);
        candidates.truncate(config.candidate_path_bound.max(1));
    } else if candidates.is_empty() {
        return Err(no_path(request, format!("every path has more than {} segments",
                                            config.max_hops)));
    }
    Ok(candidates)
}

/// Extra travel time, summed over both vehicles, when two paths share segments.  Each
/// shared segment carries a load of two instead of one.
fn sharing_cost(network: &RoadNetwork, aa: &CandidatePath, bb: &CandidatePath)
                -> Result<f64, TrafficError> {
    let mut cost = 0.;
    for seg_id in &aa.segments {
        if bb.segments.contains(seg_id) {
            let seg = network.require_segment(seg_id)?;
            cost += 2. * (seg.travel_time(2.) - seg.travel_time(1.));
        }
    }
    Ok(cost)
}

pub fn build_path_objective(network: &RoadNetwork, vehicles: &[VehicleRequest],
                            emergencies: &[EmergencyVehicleRequest], config: &EngineConfig)
                            -> Result<PathObjective, TrafficError> {
    check_requests(network, vehicles, emergencies)?;
    let mut requests: Vec<(VehicleRequest, Option<u32>)> = vehicles.iter()
        .map(|vv| (vv.clone(), None))
        .chain(emergencies.iter().map(|ev| (ev.as_vehicle(), Some(ev.priority))))
        .collect();
    requests.sort_by(|aa, bb| aa.0.id.cmp(&bb.0.id));

    let mut candidates = vec![];
    for (request, priority) in &requests {
        candidates.push(candidate_paths(network, request, priority.is_some(), config)?);
    }

    let mut objective = Objective::new();
    for ((request, _), cands) in requests.iter().zip(&candidates) {
        objective.add_variable(&request.id, cands.len());
    }

    let num_vehicles = requests.len();
    let normal_bound = match config.congestion_model {
        CongestionModel::Pairwise => {
            add_pairwise_congestion(network, &mut objective, &requests, &candidates)?
        }
        CongestionModel::Exact => add_exact_congestion(network, &mut objective, &candidates)?,
    };

    let emergency_penalty = dominant_penalty(normal_bound);
    for var in 0..num_vehicles {
        if let Some(priority) = requests[var].1 {
            let weight = priority_weight(priority);
            let costs = (0..candidates[var].len())
                .map(|value| if value == 0 { 0. } else { emergency_penalty * weight })
                .collect();
            objective.add_unary(var, costs)?;
        }
    }

    log::info!("path objective: {} vehicles, {} emergency, {} terms, penalty {}",
               num_vehicles, emergencies.len(), objective.terms().len(), emergency_penalty);
    Ok(PathObjective {
        objective,
        is_emergency: requests.iter().map(|(_, pp)| pp.is_some()).collect(),
        vehicles: requests.into_iter().map(|(request, _)| request).collect(),
        candidates,
        emergency_penalty,
    })
}

/// Solo costs on normal vehicles plus a sharing surcharge on every pair of vehicles.
/// Returns an upper bound on the cost these terms can add up to.
fn add_pairwise_congestion(network: &RoadNetwork, objective: &mut Objective,
                           requests: &[(VehicleRequest, Option<u32>)],
                           candidates: &[Vec<CandidatePath>]) -> Result<f64, TrafficError> {
    let mut bound = 0.;
    for (var, cands) in candidates.iter().enumerate() {
        if requests[var].1.is_some() {
            continue;
        }
        let costs: Vec<f64> = cands.iter().map(|cc| cc.cost).collect();
        bound += costs.iter().cloned().fold(0., f64::max);
        objective.add_unary(var, costs)?;
    }

    for first in 0..candidates.len() {
        for second in first + 1..candidates.len() {
            let shape = (candidates[first].len(), candidates[second].len());
            let mut costs = Array2::zeros(shape);
            for ((aa, bb), cost) in costs.indexed_iter_mut() {
                *cost = sharing_cost(network, &candidates[first][aa], &candidates[second][bb])?;
            }
            let largest = costs.fold(0., |acc: f64, cc| acc.max(*cc));
            if largest > 0. {
                bound += largest;
                objective.add_pairwise(first, second, costs)?;
            }
        }
    }
    Ok(bound)
}

/// One term per segment, costing `load * travel_time(load)` over every vehicle with a
/// candidate that uses it.
fn add_exact_congestion(network: &RoadNetwork, objective: &mut Objective,
                        candidates: &[Vec<CandidatePath>]) -> Result<f64, TrafficError> {
    // segment -> (vehicle, which of its candidates use the segment)
    let mut users: BTreeMap<&str, Vec<(usize, Vec<bool>)>> = BTreeMap::new();
    for (var, cands) in candidates.iter().enumerate() {
        let mut used: HashMap<&str, Vec<bool>> = HashMap::new();
        for (value, cand) in cands.iter().enumerate() {
            for seg_id in &cand.segments {
                used.entry(seg_id.as_str()).or_insert_with(|| vec![false; cands.len()])[value] = true;
            }
        }
        for (seg_id, uses) in used {
            users.entry(seg_id).or_insert_with(Vec::new).push((var, uses));
        }
    }

    let mut bound = 0.;
    for (seg_id, seg_users) in users {
        let segment: RoadSegment = network.require_segment(seg_id)?.clone();
        let max_load = seg_users.len() as f64;
        bound += max_load * segment.travel_time(max_load);

        let vars = seg_users.iter().map(|(var, _)| *var).collect();
        let uses: Vec<Vec<bool>> = seg_users.into_iter().map(|(_, uses)| uses).collect();
        let cost_fn: CostFn = Arc::new(move |values: &[usize]| {
            let load = values.iter().zip(&uses).filter(|(value, uu)| uu[**value]).count() as f64;
            if load == 0. {
                return 0.;
            }
            load * segment.travel_time(load)
        });
        objective.add_higher_order(vars, seg_id, cost_fn)?;
    }
    Ok(bound)
}

/// A time interval during which an emergency vehicle needs green on `segment` as it
/// approaches the segment's downstream intersection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitWindow {
    pub vehicle_id: VehicleId,
    pub segment: SegmentId,
    pub priority: u32,
    pub start_s: f64,
    pub end_s: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PhaseSlot {
    pub segment: SegmentId,
    // `None` when the intersection has a single phase spanning the whole cycle
    pub var: Option<usize>,
    pub pinned: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IntersectionSlots {
    pub intersection: IntersectionId,
    pub phases: Vec<PhaseSlot>,
    pub offset_s: f64,
    pub windows: Vec<TransitWindow>,
}

/// The signal sub-problem.  Variable value `k` means a green of `min_green + k * unit`.
#[derive(Debug)]
pub struct SignalObjective {
    pub objective: Objective,
    pub intersections: Vec<IntersectionSlots>,
    pub signal: SignalConfig,
}

impl SignalObjective {
    pub fn duration_s(&self, value: usize) -> u32 {
        self.signal.min_green_s + value as u32 * self.signal.green_unit_s
    }
}

/// The windows each emergency vehicle needs along its path, keyed by intersection.  Only
/// intersections within the vehicle's affected radius, measured along the path, get one.
pub fn emergency_windows(network: &RoadNetwork, assigned: &PathAssignments,
                         emergencies: &[EmergencyVehicleRequest], signal: &SignalConfig)
                         -> Result<BTreeMap<IntersectionId, Vec<TransitWindow>>, TrafficError> {
    let mut windows: BTreeMap<IntersectionId, Vec<TransitWindow>> = BTreeMap::new();
    for ev in emergencies {
        let path = match assigned.get(&ev.id) {
            Some(assignment) => assignment.segments.clone(),
            None => match shortest_path(network, &ev.origin, &ev.destination)? {
                Some(path) if !path.segments.is_empty() => path.segments,
                _ => return Err(no_path(&ev.as_vehicle(),
                                        String::from("destination is unreachable"))),
            },
        };
        network.validate_walk(&ev.origin, &ev.destination, &path)?;

        let mut distance = 0.;
        let mut arrival = ev.departure_s();
        for seg_id in &path {
            let segment = network.require_segment(seg_id)?;
            distance += segment.length;
            arrival += segment.travel_time(1.);
            if distance > ev.affected_radius {
                break;
            }
            windows.entry(segment.to.clone()).or_insert_with(Vec::new).push(TransitWindow {
                vehicle_id: ev.id.clone(),
                segment: seg_id.clone(),
                priority: ev.priority,
                start_s: arrival,
                end_s: arrival + signal.emergency_clearance_s,
            });
        }
    }
    Ok(windows)
}

/// Pinned approaches in serving order: most senior vehicle first, then earliest arrival.
fn pinned_order(windows: &[TransitWindow]) -> Vec<SegmentId> {
    let mut firsts: BTreeMap<&str, (u32, f64)> = BTreeMap::new();
    for ww in windows {
        let entry = firsts.entry(ww.segment.as_str()).or_insert((ww.priority, ww.start_s));
        entry.0 = entry.0.max(ww.priority);
        entry.1 = entry.1.min(ww.start_s);
    }
    let mut order: Vec<(&str, (u32, f64))> = firsts.into_iter().collect();
    order.sort_by(|(id_a, (pr_a, st_a)), (id_b, (pr_b, st_b))| {
        pr_b.cmp(pr_a)
            .then(st_a.partial_cmp(st_b).unwrap_or(std::cmp::Ordering::Equal))
            .then(id_a.cmp(id_b))
    });
    order.into_iter().map(|(id, _)| String::from(id)).collect()
}

/// Cycle offset that starts the first pinned phase as its first vehicle arrives, after
/// checking that every window falls inside its pinned green.
fn align_windows(intersection: &str, pinned: &[SegmentId], windows: &[TransitWindow],
                 pinned_green_s: f64, signal: &SignalConfig) -> Result<f64, TrafficError> {
    let cycle = signal.cycle_length_s as f64;
    let first = match pinned.first() {
        Some(first) => first,
        None => return Ok(0.),
    };
    let anchor = windows.iter()
        .filter(|ww| &ww.segment == first)
        .map(|ww| ww.start_s)
        .fold(f64::INFINITY, f64::min);
    let offset = anchor.rem_euclid(cycle);
    if pinned_green_s >= cycle {
        // always green
        return Ok(offset);
    }

    for ww in windows {
        let slot = pinned.iter().position(|pp| *pp == ww.segment).unwrap_or(0);
        let phase_start = offset + slot as f64 * pinned_green_s;
        let into_phase = (ww.start_s - phase_start).rem_euclid(cycle);
        if into_phase + (ww.end_s - ww.start_s) > pinned_green_s + TOLERANCE {
            return Err(TrafficError::infeasible_cycle(intersection, format!(
                "window of '{}' on '{}' at {:.1}s does not fit the pinned green of a \
                 {}s cycle", ww.vehicle_id, ww.segment, ww.start_s, signal.cycle_length_s)));
        }
    }
    Ok(offset)
}

fn phase_cost(load: f64, green_s: u32, cycle_s: u32) -> f64 {
    let red = (cycle_s - green_s.min(cycle_s)) as f64;
    load * red * red / (2. * cycle_s as f64)
}

pub fn build_signal_objective(network: &RoadNetwork, assigned: &PathAssignments,
                              emergencies: &[EmergencyVehicleRequest], signal: &SignalConfig)
                              -> Result<SignalObjective, TrafficError> {
    signal.validate()?;
    check_requests(network, &[], emergencies)?;
    let mut windows = emergency_windows(network, assigned, emergencies, signal)?;
    let loads = SegmentLoads::from_paths(assigned.values().map(|pa| &pa.segments));

    let cycle = signal.cycle_length_s;
    let domain_size = signal.buckets(signal.max_green_s - signal.min_green_s) + 1;
    let mut intersection_ids = network.intersection_ids();
    intersection_ids.sort();

    let mut objective = Objective::new();
    let mut layouts = vec![];
    // (var, cost per value) for every phase, penalties added once the bound is known
    let mut phase_costs: Vec<(usize, Vec<f64>)> = vec![];
    let mut pinned_vars = vec![];
    for id in intersection_ids {
        let incoming = network.incoming_segments(id)?;
        let here = windows.remove(id).unwrap_or_default();
        if incoming.is_empty() {
            continue;
        }
        let pinned = pinned_order(&here);
        let num_phases = incoming.len() as u32;
        let num_pinned = pinned.len() as u32;

        if num_phases == 1 {
            if num_pinned > 0 && signal.max_green_s > cycle {
                return Err(TrafficError::infeasible_cycle(id, format!(
                    "maximum green {}s is longer than the {}s cycle", signal.max_green_s, cycle)));
            }
            let offset_s = align_windows(id, &pinned, &here, cycle as f64, signal)?;
            layouts.push(IntersectionSlots {
                intersection: String::from(id),
                phases: vec![PhaseSlot {
                    segment: incoming[0].id.clone(),
                    var: None,
                    pinned: num_pinned > 0,
                }],
                offset_s,
                windows: here,
            });
            continue;
        }

        let needed = num_pinned * signal.max_green_s + (num_phases - num_pinned) * signal.min_green_s;
        if needed > cycle {
            return Err(TrafficError::infeasible_cycle(id, format!(
                "{} pinned phases at {}s and {} more at {}s need {}s, more than the {}s cycle",
                num_pinned, signal.max_green_s, num_phases - num_pinned, signal.min_green_s,
                needed, cycle)));
        }
        if num_phases * signal.max_green_s < cycle {
            return Err(TrafficError::infeasible_cycle(id, format!(
                "{} phases of at most {}s can't fill the {}s cycle", num_phases,
                signal.max_green_s, cycle)));
        }
        let offset_s = align_windows(id, &pinned, &here, signal.max_green_s as f64, signal)?;

        let mut ordered: Vec<&RoadSegment> = vec![];
        for seg_id in &pinned {
            if let Some(seg) = incoming.iter().find(|ss| &ss.id == seg_id) {
                ordered.push(*seg);
            }
        }
        for seg in &incoming {
            if !pinned.contains(&seg.id) {
                ordered.push(*seg);
            }
        }

        let mut phases = vec![];
        let mut vars = vec![];
        for seg in ordered {
            let var = objective.add_variable(&format!("{}/{}", id, seg.id), domain_size);
            let is_pinned = pinned.contains(&seg.id);
            let load = loads.get(&seg.id);
            let costs: Vec<f64> = (0..domain_size)
                .map(|kk| phase_cost(load, signal.min_green_s + kk as u32 * signal.green_unit_s,
                                     cycle))
                .collect();
            phase_costs.push((var, costs));
            if is_pinned {
                pinned_vars.push(var);
            }
            vars.push(var);
            phases.push(PhaseSlot { segment: seg.id.clone(), var: Some(var), pinned: is_pinned });
        }
        let total = signal.buckets(cycle - num_phases * signal.min_green_s);
        objective.add_constraint(Constraint::SumEquals { vars, total })?;
        layouts.push(IntersectionSlots {
            intersection: String::from(id),
            phases,
            offset_s,
            windows: here,
        });
    }

    let bound: f64 = phase_costs.iter()
        .map(|(_, costs)| costs.iter().cloned().fold(0., f64::max))
        .sum();
    let penalty = dominant_penalty(bound);
    let max_value = domain_size - 1;
    for (var, mut costs) in phase_costs {
        if pinned_vars.contains(&var) {
            for (value, cost) in costs.iter_mut().enumerate() {
                if value != max_value {
                    *cost += penalty;
                }
            }
            objective.add_constraint(Constraint::Fixed { var, value: max_value })?;
        }
        objective.add_unary(var, costs)?;
    }

    log::info!("signal objective: {} intersections, {} phase variables, {} pinned",
               layouts.len(), objective.num_variables(), pinned_vars.len());
    Ok(SignalObjective {
        objective,
        intersections: layouts,
        signal: signal.clone(),
    })
}
