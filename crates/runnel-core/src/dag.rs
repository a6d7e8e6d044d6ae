//! Generic dependency graph used for both jobs within a pipeline and steps within a job.

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),
    #[error("node {0} depends on itself")]
    SelfDependency(String),
    #[error("the dependency {dependency} of {node} not found")]
    UnknownDependency { node: String, dependency: String },
    #[error("cycle detected in dependencies")]
    CycleDetected,
    #[error("node not found: {0}")]
    NodeNotFound(String),
}

/// Anything that can be placed in a [`Dag`].
pub trait DagNode {
    fn id(&self) -> &str;
    fn depends(&self) -> &[String];
}

/// An immutable, validated DAG.
///
/// Edges point from a dependency to its dependent. Transitive predecessors
/// are computed once at build time.
#[derive(Debug, Clone)]
pub struct Dag<T> {
    graph: DiGraph<T, ()>,
    index: HashMap<String, NodeIndex>,
    order: Vec<NodeIndex>,
    deep_pre: Vec<HashSet<NodeIndex>>,
}

impl<T: DagNode> Dag<T> {
    pub fn build(nodes: impl IntoIterator<Item = T>) -> Result<Self, DagError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for node in nodes {
            let id = node.id().to_string();
            if index.contains_key(&id) {
                return Err(DagError::DuplicateNode(id));
            }
            let idx = graph.add_node(node);
            index.insert(id, idx);
        }

        let mut edges = Vec::new();
        for idx in graph.node_indices() {
            let node = &graph[idx];
            for dep in node.depends() {
                if dep == node.id() {
                    return Err(DagError::SelfDependency(dep.clone()));
                }
                let dep_idx = index.get(dep).ok_or_else(|| DagError::UnknownDependency {
                    node: node.id().to_string(),
                    dependency: dep.clone(),
                })?;
                edges.push((*dep_idx, idx));
            }
        }
        for (from, to) in edges {
            graph.update_edge(from, to, ());
        }

        let order = kahn_order(&graph)?;
        let deep_pre = closure(&graph, &order);

        Ok(Self {
            graph,
            index,
            order,
            deep_pre,
        })
    }

    /// Like [`Dag::build`], except that when no node declares a dependency
    /// the nodes become a chain in declaration order.
    pub fn build_or_chain(
        mut nodes: Vec<T>,
        depends_on: impl Fn(&mut T) -> &mut Vec<String>,
    ) -> Result<Self, DagError> {
        if nodes.iter().all(|n| n.depends().is_empty()) {
            for i in 1..nodes.len() {
                let previous = nodes[i - 1].id().to_string();
                *depends_on(&mut nodes[i]) = vec![previous];
            }
        }
        Self::build(nodes)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &T> {
        self.graph.node_indices().map(|idx| &self.graph[idx])
    }

    /// Every node appears after all of its dependencies.
    pub fn topological_order(&self) -> impl Iterator<Item = &T> {
        self.order.iter().map(|&idx| &self.graph[idx])
    }

    /// Direct dependencies of `id`.
    pub fn predecessors(&self, id: &str) -> Result<Vec<&T>, DagError> {
        let idx = self.lookup(id)?;
        Ok(self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|n| &self.graph[n])
            .collect())
    }

    /// All transitive predecessors of `id`, in topological order.
    pub fn deep_pre(&self, id: &str) -> Result<Vec<&T>, DagError> {
        let idx = self.lookup(id)?;
        let set = &self.deep_pre[idx.index()];
        Ok(self
            .order
            .iter()
            .filter(|n| set.contains(n))
            .map(|&n| &self.graph[n])
            .collect())
    }

    /// All transitive successors of `id`, in topological order.
    pub fn deep_post(&self, id: &str) -> Result<Vec<&T>, DagError> {
        let idx = self.lookup(id)?;
        Ok(self
            .order
            .iter()
            .filter(|n| self.deep_pre[n.index()].contains(&idx))
            .map(|&n| &self.graph[n])
            .collect())
    }

    fn lookup(&self, id: &str) -> Result<NodeIndex, DagError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| DagError::NodeNotFound(id.to_string()))
    }
}

/// In-degree reduction. Ties are broken by declaration order so the result
/// is stable for a given input.
fn kahn_order<T>(graph: &DiGraph<T, ()>) -> Result<Vec<NodeIndex>, DagError> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|idx| graph.neighbors_directed(idx, Direction::Incoming).count())
        .collect();
    let mut ready: VecDeque<NodeIndex> = graph
        .node_indices()
        .filter(|idx| in_degree[idx.index()] == 0)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(idx) = ready.pop_front() {
        order.push(idx);
        let mut successors: Vec<NodeIndex> =
            graph.neighbors_directed(idx, Direction::Outgoing).collect();
        successors.sort();
        for succ in successors {
            in_degree[succ.index()] -= 1;
            if in_degree[succ.index()] == 0 {
                ready.push_back(succ);
            }
        }
    }

    if order.len() < graph.node_count() {
        return Err(DagError::CycleDetected);
    }
    Ok(order)
}

fn closure<T>(graph: &DiGraph<T, ()>, order: &[NodeIndex]) -> Vec<HashSet<NodeIndex>> {
    let mut deep_pre = vec![HashSet::new(); graph.node_count()];
    for &idx in order {
        let mut set = HashSet::new();
        for pred in graph.neighbors_directed(idx, Direction::Incoming) {
            set.insert(pred);
            set.extend(deep_pre[pred.index()].iter().copied());
        }
        deep_pre[idx.index()] = set;
    }
    deep_pre
}
