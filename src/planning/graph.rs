//! Route graph over configured filesystems.
//!
//! Vertices wrap filesystem instances; edges are directed and carry a
//! polynomial-complexity cost. The graph is small and static (one vertex per
//! configured filesystem), so routing is a plain shortest-path search.

use std::collections::HashMap;
use std::ops::Add;
use std::sync::Arc;

use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::filesystem::Filesystem;

/// Edge cost: the k in O(n^k).
///
/// Costs combine by `max` (parallel stages degrade to the worst stage), so
/// `Add` is saturation, not summation, and shortest-path accumulation does
/// the right thing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct PolynomialCost(pub u32);

/// Constant time.
pub const O1: PolynomialCost = PolynomialCost(0);

/// Linear time.
pub const ON: PolynomialCost = PolynomialCost(1);

/// Quadratic time.
pub const ON2: PolynomialCost = PolynomialCost(2);

impl Add for PolynomialCost {
    type Output = PolynomialCost;

    fn add(self, rhs: PolynomialCost) -> PolynomialCost {
        PolynomialCost(self.0.max(rhs.0))
    }
}

impl std::fmt::Display for PolynomialCost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "O(n^{})", self.0)
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("filesystem {0} is not in the route graph")]
    VertexNotInGraph(String),

    #[error("no route found from {0} to {1}")]
    NoRouteFound(String, String),

    #[error("cannot route between fewer than two filesystems")]
    TooFewWaypoints,
}

/// One step of a route between two filesystem vertices.
#[derive(Clone)]
pub struct RouteHop {
    pub source: Arc<dyn Filesystem>,
    pub target: Arc<dyn Filesystem>,
    pub cost: PolynomialCost,
}

/// Directed graph of transfer capabilities between filesystems.
#[derive(Default)]
pub struct RouteGraph {
    graph: DiGraph<Arc<dyn Filesystem>, PolynomialCost>,
    indices: HashMap<String, NodeIndex>,
}

impl RouteGraph {
    pub fn new() -> Self {
        RouteGraph::default()
    }

    fn vertex(&mut self, filesystem: Arc<dyn Filesystem>) -> NodeIndex {
        let name = filesystem.name().to_string();
        match self.indices.get(&name) {
            Some(&index) => index,
            None => {
                let index = self.graph.add_node(filesystem);
                self.indices.insert(name, index);
                index
            }
        }
    }

    /// Add a directed, cost-bearing edge; unseen vertices are created.
    pub fn add_edge(
        &mut self,
        source: Arc<dyn Filesystem>,
        target: Arc<dyn Filesystem>,
        cost: PolynomialCost,
    ) {
        let a = self.vertex(source);
        let b = self.vertex(target);
        self.graph.add_edge(a, b, cost);
    }

    fn index_of(&self, name: &str) -> Result<NodeIndex, RouteError> {
        self.indices
            .get(name)
            .copied()
            .ok_or_else(|| RouteError::VertexNotInGraph(name.to_string()))
    }

    /// Filesystems reachable from `name` in one hop.
    pub fn neighbours(&self, name: &str) -> Result<Vec<Arc<dyn Filesystem>>, RouteError> {
        let index = self.index_of(name)?;
        Ok(self
            .graph
            .neighbors(index)
            .map(|n| Arc::clone(&self.graph[n]))
            .collect())
    }

    /// Shortest path through an ordered list of waypoints: the concatenation
    /// of pairwise shortest paths under the max-combining cost.
    pub fn route(&self, waypoints: &[&str]) -> Result<Vec<RouteHop>, RouteError> {
        if waypoints.len() < 2 {
            return Err(RouteError::TooFewWaypoints);
        }

        let mut hops = Vec::new();
        for pair in waypoints.windows(2) {
            hops.extend(self.shortest_path(pair[0], pair[1])?);
        }

        Ok(hops)
    }

    fn shortest_path(&self, from: &str, to: &str) -> Result<Vec<RouteHop>, RouteError> {
        let start = self.index_of(from)?;
        let goal = self.index_of(to)?;

        let (_, path) = petgraph::algo::astar(
            &self.graph,
            start,
            |n| n == goal,
            |e| *e.weight(),
            |_| PolynomialCost(0),
        )
        .ok_or_else(|| RouteError::NoRouteFound(from.to_string(), to.to_string()))?;

        Ok(path
            .windows(2)
            .map(|nodes| {
                let edge = self
                    .graph
                    .find_edge(nodes[0], nodes[1])
                    .expect("path edges exist by construction");
                RouteHop {
                    source: Arc::clone(&self.graph[nodes[0]]),
                    target: Arc::clone(&self.graph[nodes[1]]),
                    cost: self.graph[edge],
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::tests::MockFilesystem;

    fn graph_of(edges: &[(&str, &str, PolynomialCost)]) -> RouteGraph {
        let mut graph = RouteGraph::new();
        for (a, b, cost) in edges {
            graph.add_edge(MockFilesystem::new(a), MockFilesystem::new(b), *cost);
        }
        graph
    }

    #[test]
    fn cost_combines_by_max() {
        assert_eq!(O1 + ON, ON);
        assert_eq!(ON + ON2, ON2);
        assert_eq!(ON2 + O1, ON2);
        assert_eq!(O1 + O1, O1);
    }

    #[test]
    fn single_hop_route() {
        let graph = graph_of(&[("a", "b", ON)]);
        let route = graph.route(&["a", "b"]).unwrap();
        assert_eq!(route.len(), 1);
        assert_eq!(route[0].source.name(), "a");
        assert_eq!(route[0].target.name(), "b");
        assert_eq!(route[0].cost, ON);
    }

    #[test]
    fn multi_hop_route_concatenates() {
        let graph = graph_of(&[("a", "b", ON), ("b", "c", O1)]);
        let route = graph.route(&["a", "c"]).unwrap();
        assert_eq!(route.len(), 2);
        assert_eq!(route[0].source.name(), "a");
        assert_eq!(route[1].target.name(), "c");
    }

    #[test]
    fn waypoints_are_routed_pairwise() {
        let graph = graph_of(&[("a", "b", ON), ("b", "c", ON), ("c", "a", ON)]);
        let route = graph.route(&["a", "b", "c"]).unwrap();
        assert_eq!(route.len(), 2);
    }

    #[test]
    fn cheapest_path_wins_under_max_combination() {
        // Direct a->c costs O(n^2); a->b->c degrades only to O(n)
        let graph = graph_of(&[("a", "c", ON2), ("a", "b", ON), ("b", "c", ON)]);
        let route = graph.route(&["a", "c"]).unwrap();
        assert_eq!(route.len(), 2, "should prefer the two-hop linear route");
    }

    #[test]
    fn edges_are_directed() {
        let graph = graph_of(&[("a", "b", ON)]);
        assert!(matches!(
            graph.route(&["b", "a"]),
            Err(RouteError::NoRouteFound(..))
        ));
    }

    #[test]
    fn unknown_vertices_are_rejected() {
        let graph = graph_of(&[("a", "b", ON)]);
        assert!(matches!(
            graph.route(&["a", "nowhere"]),
            Err(RouteError::VertexNotInGraph(..))
        ));
    }

    #[test]
    fn too_few_waypoints_is_an_error() {
        let graph = graph_of(&[("a", "b", ON)]);
        assert!(matches!(
            graph.route(&["a"]),
            Err(RouteError::TooFewWaypoints)
        ));
    }

    #[test]
    fn neighbours_follow_edge_direction() {
        let graph = graph_of(&[("a", "b", ON), ("a", "c", ON)]);
        let mut names: Vec<_> = graph
            .neighbours("a")
            .unwrap()
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["b", "c"]);
        assert!(graph.neighbours("b").unwrap().is_empty());
    }
}
