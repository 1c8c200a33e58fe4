use std::collections::hash_map::Entry::{Occupied, Vacant};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::cmp::Ordering;

use petgraph::Direction;
use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::visit::{EdgeRef, VisitMap, Visitable};
use priority_queue::PriorityQueue;

use super::errors::TrafficError;
use super::road_network::{RoadNetwork, RoadSegment, SegmentId};


/// A loopless path together with its free-flow cost.
#[derive(Clone, Debug, PartialEq)]
pub struct CandidatePath {
    pub segments: Vec<SegmentId>,
    pub cost: f64,
}

impl CandidatePath {
    pub fn hops(&self) -> usize {
        self.segments.len()
    }
}

#[derive(Clone, Debug)]
struct ScoredPath {
    cost: f64,
    edges: Vec<EdgeIndex>,
}

/// Forward dijkstra from `origin` to `goal`.  Based on (aka mostly copied from) the
/// implementation in the petgraph library, but it scores nodes by (cost, hops) so that
/// equal-cost paths resolve to the one with fewer segments, and it can ignore a set of
/// edges and nodes, which Yen's algorithm needs.
///
/// Edge costs must be non-negative.  Returns `None` if `goal` is unreachable.
fn dijkstra_with_paths<F>(
    network: &RoadNetwork,
    origin: NodeIndex,
    goal: NodeIndex,
    banned_edges: &HashSet<EdgeIndex>,
    banned_nodes: &HashSet<NodeIndex>,
    edge_cost: F,
) -> Option<ScoredPath>
where
    F: Fn(&RoadSegment) -> f64,
{
    let graph = network.graph();
    let mut visited = graph.visit_map();
    let mut scores: HashMap<NodeIndex, (f64, usize)> = HashMap::new();
    let mut edges_used: HashMap<NodeIndex, EdgeIndex> = HashMap::new();
    let zero_score = (0., 0);
    scores.insert(origin, zero_score);

    let mut visit_next = BinaryHeap::new();
    visit_next.push(MinScored(zero_score, origin));
    while let Some(MinScored(node_score, node)) = visit_next.pop() {
        if visited.is_visited(&node) {
            continue;
        }
        if node == goal {
            break;
        }
        for edge in graph.edges_directed(node, Direction::Outgoing) {
            if banned_edges.contains(&edge.id()) {
                continue;
            }
            let next = edge.target();
            if visited.is_visited(&next) || banned_nodes.contains(&next) {
                continue;
            }
            let next_score = (node_score.0 + edge_cost(edge.weight()), node_score.1 + 1);
            match scores.entry(next) {
                Occupied(ent) => {
                    if next_score < *ent.get() {
                        *ent.into_mut() = next_score;
                        visit_next.push(MinScored(next_score, next));
                        edges_used.insert(next, edge.id());
                    }
                }
                Vacant(ent) => {
                    ent.insert(next_score);
                    visit_next.push(MinScored(next_score, next));
                    edges_used.insert(next, edge.id());
                }
            }
        }
        visited.visit(node);
    }

    let (cost, _) = *scores.get(&goal)?;
    let mut edges = vec![];
    let mut cur = goal;
    while cur != origin {
        let edge = *edges_used.get(&cur)?;
        edges.push(edge);
        cur = graph.edge_endpoints(edge)?.0;
    }
    edges.reverse();
    Some(ScoredPath { cost, edges })
}

fn solo_cost(segment: &RoadSegment) -> f64 {
    segment.travel_time(1.)
}

fn to_candidate(network: &RoadNetwork, path: &ScoredPath) -> CandidatePath {
    let graph = network.graph();
    CandidatePath {
        segments: path.edges.iter().map(|ei| graph[*ei].id.clone()).collect(),
        cost: path.cost,
    }
}

/// The minimum free-flow-cost path, with ties going to fewer hops.  `Ok(None)` means the
/// destination can't be reached.
pub fn shortest_path(network: &RoadNetwork, origin: &str, destination: &str)
                     -> Result<Option<CandidatePath>, TrafficError> {
    let src = network.require_node(origin)?;
    let dst = network.require_node(destination)?;
    let path = dijkstra_with_paths(network, src, dst, &HashSet::new(), &HashSet::new(),
                                   solo_cost);
    Ok(path.map(|pp| to_candidate(network, &pp)))
}

/// Up to `kk` loopless paths of at most `max_hops` segments, cheapest first, found with
/// Yen's algorithm.  Paths longer than `max_hops` are still expanded as roots, but the
/// search gives up after a bounded number of them so that it terminates on large graphs.
pub fn k_shortest_paths(network: &RoadNetwork, origin: &str, destination: &str, kk: usize,
                        max_hops: usize) -> Result<Vec<CandidatePath>, TrafficError> {
    let src = network.require_node(origin)?;
    let dst = network.require_node(destination)?;
    let graph = network.graph();
    let max_expanded = 4 * kk + 16;

    let first = match dijkstra_with_paths(network, src, dst, &HashSet::new(), &HashSet::new(),
                                          solo_cost) {
        Some(path) if !path.edges.is_empty() => path,
        _ => return Ok(vec![]),
    };

    let mut found: Vec<ScoredPath> = vec![first];
    let mut candidates: PriorityQueue<Vec<EdgeIndex>, PathScore> = PriorityQueue::new();
    while found.iter().filter(|pp| pp.edges.len() <= max_hops).count() < kk &&
          found.len() < max_expanded {
        let prev = found[found.len() - 1].clone();
        for ii in 0..prev.edges.len() {
            let root = &prev.edges[..ii];
            let spur_node = match graph.edge_endpoints(prev.edges[ii]) {
                Some((from, _)) => from,
                None => continue,
            };

            // forbid the next edge of every known path sharing this root
            let mut banned_edges = HashSet::new();
            for path in &found {
                if path.edges.len() > ii && &path.edges[..ii] == root {
                    banned_edges.insert(path.edges[ii]);
                }
            }
            // and the root's own nodes, so the spur can't loop back through them
            let mut banned_nodes = HashSet::new();
            for edge in root {
                if let Some((from, _)) = graph.edge_endpoints(*edge) {
                    banned_nodes.insert(from);
                }
            }

            let spur = match dijkstra_with_paths(network, spur_node, dst, &banned_edges,
                                                 &banned_nodes, solo_cost) {
                Some(spur) => spur,
                None => continue,
            };
            let root_cost: f64 = root.iter().map(|ei| solo_cost(&graph[*ei])).sum();
            let mut edges = root.to_vec();
            edges.extend(spur.edges);
            if found.iter().any(|pp| pp.edges == edges) {
                continue;
            }
            let score = PathScore::new(root_cost + spur.cost, &edges);
            candidates.push(edges, score);
        }

        match candidates.pop() {
            Some((edges, score)) => found.push(ScoredPath { cost: score.cost, edges }),
            None => break,
        }
    }

    let paths: Vec<CandidatePath> = found.iter()
        .filter(|pp| pp.edges.len() <= max_hops)
        .take(kk)
        .map(|pp| to_candidate(network, pp))
        .collect();
    log::debug!("found {} candidate paths from {} to {}", paths.len(), origin, destination);
    Ok(paths)
}


/// Orders candidate paths cheapest first, then by fewest hops, then by edge indices.  The
/// ordering is reversed so that a max-priority queue pops the best path.
#[derive(Clone, Debug)]
struct PathScore {
    cost: f64,
    hops: usize,
    key: Vec<usize>,
}

impl PathScore {
    fn new(cost: f64, edges: &[EdgeIndex]) -> PathScore {
        PathScore {
            cost,
            hops: edges.len(),
            key: edges.iter().map(|ei| ei.index()).collect(),
        }
    }
}

impl Ord for PathScore {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.cost < other.cost {
            return Ordering::Greater;
        } else if self.cost > other.cost {
            return Ordering::Less;
        }
        match other.hops.cmp(&self.hops) {
            Ordering::Equal => other.key.cmp(&self.key),
            ord => ord,
        }
    }
}

// Implementing Ord requires all of the below traits
impl PartialOrd for PathScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        return Some(self.cmp(other));
    }
}

impl PartialEq for PathScore {
    fn eq(&self, other: &Self) -> bool {
        return self.cmp(other) == Ordering::Equal;
    }
}

impl Eq for PathScore {}


#[derive(Copy, Clone, Debug)]
pub struct MinScored<K, T>(pub K, pub T);

impl<K: PartialOrd, T> PartialEq for MinScored<K, T> {
    #[inline]
    fn eq(&self, other: &MinScored<K, T>) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: PartialOrd, T> Eq for MinScored<K, T> {}

impl<K: PartialOrd, T> PartialOrd for MinScored<K, T> {
    #[inline]
    fn partial_cmp(&self, other: &MinScored<K, T>) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: PartialOrd, T> Ord for MinScored<K, T> {
    #[inline]
    fn cmp(&self, other: &MinScored<K, T>) -> Ordering {
        let a = &self.0;
        let b = &other.0;
        if a == b {
            Ordering::Equal
        } else if a < b {
            Ordering::Greater
        } else if a > b {
            Ordering::Less
        } else if a.ne(a) && b.ne(b) {
            // these are the NaN cases
            Ordering::Equal
        } else if a.ne(a) {
            // Order NaN less, so that it is last in the MinScore order
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }
}


#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use super::super::road_network::CongestionFn;
    use super::super::test_utils::{grid_network, square_network};

    fn ids(path: &CandidatePath) -> Vec<&str> {
        path.segments.iter().map(|ss| ss.as_str()).collect()
    }

    #[test]
    fn test_square_shortest() {
        let network = square_network(CongestionFn::Constant);
        let path = shortest_path(&network, "A", "C").unwrap().unwrap();
        assert_eq!(ids(&path), vec!["A-B", "B-C"]);
        assert_relative_eq!(path.cost, 2.);

        let path = shortest_path(&network, "D", "C").unwrap().unwrap();
        assert_eq!(ids(&path), vec!["D-A", "A-B", "B-C"]);
        assert_eq!(path.hops(), 3);
    }

    #[test]
    fn test_unreachable() {
        let mut network = square_network(CongestionFn::Constant);
        network.add_intersection("E").unwrap();
        assert_eq!(shortest_path(&network, "A", "E").unwrap(), None);
        assert!(k_shortest_paths(&network, "E", "A", 3, 10).unwrap().is_empty());
        assert!(shortest_path(&network, "A", "Q").is_err());
    }

    #[test]
    fn test_fewer_hops_win_ties() {
        // a ----> b ----> c
        // |               ^
        // ------ (2) -----|
        let mut network = RoadNetwork::new();
        for id in &["a", "b", "c"] {
            network.add_intersection(id).unwrap();
        }
        network.add_segment(RoadSegment::new("ab", "a", "b", 1., 1., CongestionFn::Constant))
            .unwrap();
        network.add_segment(RoadSegment::new("bc", "b", "c", 1., 1., CongestionFn::Constant))
            .unwrap();
        network.add_segment(RoadSegment::new("ac", "a", "c", 2., 1., CongestionFn::Constant))
            .unwrap();

        let path = shortest_path(&network, "a", "c").unwrap().unwrap();
        assert_eq!(ids(&path), vec!["ac"]);

        let paths = k_shortest_paths(&network, "a", "c", 5, 10).unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(ids(&paths[0]), vec!["ac"]);
        assert_eq!(ids(&paths[1]), vec!["ab", "bc"]);

        let paths = k_shortest_paths(&network, "a", "c", 5, 1).unwrap();
        assert_eq!(paths.len(), 1);
    }

    #[test]
    fn test_k_shortest_on_grid() {
        let network = grid_network(3, 3, 4.);
        let paths = k_shortest_paths(&network, "r0c0", "r2c2", 6, 8).unwrap();
        // there are exactly six monotone routes across a 3x3 grid, all four hops long
        assert_eq!(paths.len(), 6);
        for path in &paths {
            assert_eq!(path.hops(), 4);
            assert!(network.validate_walk("r0c0", "r2c2", &path.segments).is_ok());
        }
        let mut unique: Vec<&Vec<SegmentId>> = paths.iter().map(|pp| &pp.segments).collect();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 6);

        // costs never decrease along the list
        for ii in 1..paths.len() {
            assert!(paths[ii - 1].cost <= paths[ii].cost);
        }
    }

    #[test]
    fn test_k_shortest_loopless() {
        let network = grid_network(2, 2, 4.);
        let paths = k_shortest_paths(&network, "r0c0", "r1c1", 10, 10).unwrap();
        assert_eq!(paths.len(), 2);
        for path in &paths {
            let mut visited = HashSet::new();
            visited.insert(String::from("r0c0"));
            for seg_id in &path.segments {
                let seg = network.segment(seg_id).unwrap();
                assert!(visited.insert(seg.to.clone()), "path revisits {}", seg.to);
            }
        }
    }
}
