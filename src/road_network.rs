// this file defines a struct to represent a network of intersections joined by directed road
// segments.  It's a wrapper around a petgraph graph, keyed by string identifiers.
use std::collections::HashMap;

use itertools::Itertools;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use super::errors::TrafficError;


pub type IntersectionId = String;
pub type SegmentId = String;

/// Maps the ratio of a segment's load to its capacity onto a travel-time multiplier.
///
/// Every variant must be non-decreasing in the load ratio.  This is checked once when a
/// segment is added to a network; `multiplier` itself never validates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CongestionFn {
    Constant,
    Linear { slope: f64 },
    /// The Bureau of Public Roads curve, `1 + alpha * ratio^beta`.
    Bpr { alpha: f64, beta: f64 },
    /// Linear interpolation between `(ratio, multiplier)` points, flat past either end.
    Piecewise { points: Vec<(f64, f64)> },
}

impl Default for CongestionFn {
    fn default() -> CongestionFn {
        CongestionFn::Bpr { alpha: 0.15, beta: 4.0 }
    }
}

impl CongestionFn {
    pub fn multiplier(&self, ratio: f64) -> f64 {
        let ratio = ratio.max(0.);
        match self {
            CongestionFn::Constant => 1.,
            CongestionFn::Linear { slope } => 1. + slope * ratio,
            CongestionFn::Bpr { alpha, beta } => 1. + alpha * ratio.powf(*beta),
            CongestionFn::Piecewise { points } => {
                let (first, last) = match (points.first(), points.last()) {
                    (Some(first), Some(last)) => (first, last),
                    _ => return 1.,
                };
                if ratio <= first.0 {
                    return first.1;
                }
                if ratio >= last.0 {
                    return last.1;
                }
                for ((x0, y0), (x1, y1)) in points.iter().tuple_windows() {
                    if ratio <= *x1 {
                        let frac = (ratio - x0) / (x1 - x0);
                        return y0 + frac * (y1 - y0);
                    }
                }
                last.1
            }
        }
    }

    fn check_monotone(&self) -> Result<(), String> {
        match self {
            CongestionFn::Constant => Ok(()),
            CongestionFn::Linear { slope } if *slope >= 0. => Ok(()),
            CongestionFn::Linear { slope } => Err(format!("linear slope {} is negative", slope)),
            CongestionFn::Bpr { alpha, beta } if *alpha >= 0. && *beta >= 0. => Ok(()),
            CongestionFn::Bpr { alpha, beta } => {
                Err(format!("BPR parameters ({}, {}) must be non-negative", alpha, beta))
            }
            CongestionFn::Piecewise { points } => {
                if points.is_empty() {
                    return Err(String::from("piecewise function has no points"));
                }
                if points.iter().any(|(xx, yy)| !xx.is_finite() || !yy.is_finite() || *yy < 0.) {
                    return Err(String::from("piecewise points must be finite, multipliers >= 0"));
                }
                for ((x0, y0), (x1, y1)) in points.iter().tuple_windows() {
                    if x1 <= x0 {
                        return Err(format!("piecewise ratios not increasing at {}", x1));
                    }
                    if y1 < y0 {
                        return Err(format!("piecewise multiplier decreases at ratio {}", x1));
                    }
                }
                Ok(())
            }
        }
    }
}

/// A directed road between two intersections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoadSegment {
    pub id: SegmentId,
    pub from: IntersectionId,
    pub to: IntersectionId,
    pub length: f64,
    pub capacity: f64,
    pub base_travel_time: f64,
    #[serde(default)]
    pub congestion: CongestionFn,
}

impl RoadSegment {
    /// Base travel time defaults to the length, i.e. unit free-flow speed.
    pub fn new(id: &str, from: &str, to: &str, length: f64, capacity: f64,
               congestion: CongestionFn) -> RoadSegment {
        RoadSegment {
            id: String::from(id),
            from: String::from(from),
            to: String::from(to),
            length,
            capacity,
            base_travel_time: length,
            congestion,
        }
    }

    pub fn with_base_travel_time(mut self, base_travel_time: f64) -> RoadSegment {
        self.base_travel_time = base_travel_time;
        self
    }

    pub fn travel_time(&self, load: f64) -> f64 {
        return self.base_travel_time * self.congestion.multiplier(load / self.capacity);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Intersection {
    pub id: IntersectionId,
}

/// The already-parsed form a network arrives in, and the form it is persisted in.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawNetwork {
    pub intersections: Vec<IntersectionId>,
    pub segments: Vec<RoadSegment>,
}

/// Number of vehicles on each segment, derived from a set of paths.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SegmentLoads {
    loads: HashMap<SegmentId, f64>,
}

impl SegmentLoads {
    pub fn new() -> SegmentLoads {
        SegmentLoads { loads: HashMap::new() }
    }

    pub fn from_paths<'a, II>(paths: II) -> SegmentLoads
        where II: IntoIterator<Item = &'a Vec<SegmentId>>
    {
        let mut loads = SegmentLoads::new();
        for path in paths {
            for seg_id in path {
                loads.add(seg_id, 1.);
            }
        }
        loads
    }

    pub fn add(&mut self, segment_id: &str, amount: f64) {
        *self.loads.entry(String::from(segment_id)).or_insert(0.) += amount;
    }

    pub fn get(&self, segment_id: &str) -> f64 {
        match self.loads.get(segment_id) {
            Some(load) => *load,
            None => 0.,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RoadNetwork {
    graph: DiGraph<Intersection, RoadSegment>,
    node_idxs_by_id: HashMap<IntersectionId, NodeIndex>,
    edge_idxs_by_id: HashMap<SegmentId, EdgeIndex>,
}

impl PartialEq for RoadNetwork {
    fn eq(&self, other: &RoadNetwork) -> bool {
        self.to_raw() == other.to_raw()
    }
}

impl Default for RoadNetwork {
    fn default() -> RoadNetwork {
        RoadNetwork::new()
    }
}

impl RoadNetwork {
    pub fn new() -> RoadNetwork {
        RoadNetwork {
            graph: DiGraph::new(),
            node_idxs_by_id: HashMap::new(),
            edge_idxs_by_id: HashMap::new(),
        }
    }

    pub fn from_raw(raw: &RawNetwork) -> Result<RoadNetwork, TrafficError> {
        let mut network = RoadNetwork::new();
        for id in &raw.intersections {
            network.add_intersection(id)?;
        }
        for segment in &raw.segments {
            network.add_segment(segment.clone())?;
        }
        log::debug!("loaded network with {} intersections and {} segments",
                    network.num_intersections(), network.num_segments());
        Ok(network)
    }

    /// Intersections and segments come back in insertion order, so loading the result
    /// rebuilds an identical network.
    pub fn to_raw(&self) -> RawNetwork {
        RawNetwork {
            intersections: self.graph.node_indices().map(|ni| self.graph[ni].id.clone()).collect(),
            segments: self.graph.edge_indices().map(|ei| self.graph[ei].clone()).collect(),
        }
    }

    pub fn add_intersection(&mut self, id: &str) -> Result<(), TrafficError> {
        if self.node_idxs_by_id.contains_key(id) {
            return Err(TrafficError::DuplicateId(String::from(id)));
        }
        let idx = self.graph.add_node(Intersection { id: String::from(id) });
        self.node_idxs_by_id.insert(String::from(id), idx);
        Ok(())
    }

    pub fn add_segment(&mut self, segment: RoadSegment) -> Result<(), TrafficError> {
        if self.edge_idxs_by_id.contains_key(&segment.id) {
            return Err(TrafficError::DuplicateId(segment.id));
        }
        let from_idx = match self.node_idxs_by_id.get(&segment.from) {
            Some(idx) => *idx,
            None => return Err(TrafficError::invalid_topology(
                &segment.id, &format!("unknown origin intersection '{}'", segment.from))),
        };
        let to_idx = match self.node_idxs_by_id.get(&segment.to) {
            Some(idx) => *idx,
            None => return Err(TrafficError::invalid_topology(
                &segment.id, &format!("unknown destination intersection '{}'", segment.to))),
        };
        if from_idx == to_idx {
            return Err(TrafficError::invalid_topology(&segment.id, "segment is a self-loop"));
        }
        if !(segment.capacity > 0.) || !segment.capacity.is_finite() {
            return Err(TrafficError::invalid_topology(&segment.id, "capacity must be positive"));
        }
        if !(segment.length >= 0.) || !(segment.base_travel_time >= 0.) ||
           !segment.base_travel_time.is_finite() {
            return Err(TrafficError::invalid_topology(
                &segment.id, "length and base travel time must be non-negative"));
        }
        if let Err(reason) = segment.congestion.check_monotone() {
            return Err(TrafficError::invalid_topology(&segment.id, &reason));
        }

        let id = segment.id.clone();
        let edge_idx = self.graph.add_edge(from_idx, to_idx, segment);
        self.edge_idxs_by_id.insert(id, edge_idx);
        Ok(())
    }

    pub fn num_intersections(&self) -> usize {
        return self.graph.node_count();
    }

    pub fn num_segments(&self) -> usize {
        return self.graph.edge_count();
    }

    pub fn has_intersection(&self, id: &str) -> bool {
        return self.node_idxs_by_id.contains_key(id);
    }

    pub fn intersection_ids(&self) -> Vec<&str> {
        return self.graph.node_indices().map(|ni| self.graph[ni].id.as_str()).collect();
    }

    pub fn segments(&self) -> impl Iterator<Item = &RoadSegment> {
        self.graph.edge_indices().map(move |ei| &self.graph[ei])
    }

    pub fn segment(&self, id: &str) -> Option<&RoadSegment> {
        match self.edge_idxs_by_id.get(id) {
            Some(idx) => self.graph.edge_weight(*idx),
            None => None,
        }
    }

    /// Outgoing `(segment, destination)` pairs, ordered by segment id.
    pub fn neighbors(&self, id: &str) -> Result<Vec<(&RoadSegment, &str)>, TrafficError> {
        let mut nbrs: Vec<(&RoadSegment, &str)> = self.outgoing_segments(id)?.into_iter()
            .map(|seg| (seg, seg.to.as_str()))
            .collect();
        nbrs.sort_by(|aa, bb| aa.0.id.cmp(&bb.0.id));
        Ok(nbrs)
    }

    pub fn outgoing_segments(&self, id: &str) -> Result<Vec<&RoadSegment>, TrafficError> {
        self.segments_in_direction(id, Direction::Outgoing)
    }

    pub fn incoming_segments(&self, id: &str) -> Result<Vec<&RoadSegment>, TrafficError> {
        self.segments_in_direction(id, Direction::Incoming)
    }

    fn segments_in_direction(&self, id: &str, dir: Direction)
                             -> Result<Vec<&RoadSegment>, TrafficError> {
        let node = self.require_node(id)?;
        let mut segs: Vec<&RoadSegment> = self.graph.edges_directed(node, dir)
            .map(|er| er.weight())
            .collect();
        segs.sort_by(|aa, bb| aa.id.cmp(&bb.id));
        Ok(segs)
    }

    /// Sum over the path of `base_travel_time * congestion(load / capacity)`.
    pub fn path_cost(&self, path: &[SegmentId], loads: &SegmentLoads)
                     -> Result<f64, TrafficError> {
        let mut cost = 0.;
        for seg_id in path {
            let segment = self.require_segment(seg_id)?;
            cost += segment.travel_time(loads.get(seg_id));
        }
        Ok(cost)
    }

    /// Cost of driving the path with no other traffic, i.e. a load of one on each segment.
    pub fn free_flow_cost(&self, path: &[SegmentId]) -> Result<f64, TrafficError> {
        let mut cost = 0.;
        for seg_id in path {
            cost += self.require_segment(seg_id)?.travel_time(1.);
        }
        Ok(cost)
    }

    /// Checks that `path` is a non-empty walk starting at `origin` and ending at
    /// `destination` whose consecutive segments share an intersection.
    pub fn validate_walk(&self, origin: &str, destination: &str, path: &[SegmentId])
                         -> Result<(), TrafficError> {
        let segs = path.iter().map(|id| self.require_segment(id))
            .collect::<Result<Vec<&RoadSegment>, TrafficError>>()?;
        let (first, last) = match (segs.first(), segs.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(TrafficError::invalid_topology(origin, "path is empty")),
        };
        if first.from != origin {
            return Err(TrafficError::invalid_topology(
                &first.id, &format!("path does not start at '{}'", origin)));
        }
        if last.to != destination {
            return Err(TrafficError::invalid_topology(
                &last.id, &format!("path does not end at '{}'", destination)));
        }
        for (prev, next) in segs.iter().tuple_windows() {
            if prev.to != next.from {
                return Err(TrafficError::invalid_topology(
                    &next.id, &format!("does not continue from segment '{}'", prev.id)));
            }
        }
        Ok(())
    }

    pub(crate) fn graph(&self) -> &DiGraph<Intersection, RoadSegment> {
        &self.graph
    }

    pub(crate) fn require_node(&self, id: &str) -> Result<NodeIndex, TrafficError> {
        match self.node_idxs_by_id.get(id) {
            Some(idx) => Ok(*idx),
            None => Err(TrafficError::invalid_topology(id, "unknown intersection")),
        }
    }

    pub(crate) fn require_segment(&self, id: &str) -> Result<&RoadSegment, TrafficError> {
        match self.segment(id) {
            Some(seg) => Ok(seg),
            None => Err(TrafficError::invalid_topology(id, "unknown segment")),
        }
    }
}
