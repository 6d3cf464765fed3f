use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use relaycore::{
    Graph, GraphId, GraphValidationError, NodeId, NodeKind, NodeSpec, WorkingState, ERROR_LABEL,
};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Which capability runs a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepBinding {
    pub kind: NodeKind,
    pub handler: Option<String>,
}

impl fmt::Display for StepBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.handler {
            Some(handler) => write!(f, "{}:{}", self.kind, handler),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Condition under which an edge is taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeGuard {
    /// Taken whenever the source completes.
    Always,
    /// Taken when the source completes and selected this label.
    Branch(String),
    /// Taken when the source fails after its retry budget.
    OnError,
}

impl EdgeGuard {
    fn from_condition(condition: Option<&str>) -> Self {
        match condition {
            None => EdgeGuard::Always,
            Some(ERROR_LABEL) => EdgeGuard::OnError,
            Some(label) => EdgeGuard::Branch(label.to_string()),
        }
    }

    /// Evaluate the guard once `source` has finished.
    pub fn passes(&self, source: &NodeId, state: &WorkingState, failed: bool) -> bool {
        match self {
            EdgeGuard::Always => !failed,
            EdgeGuard::Branch(label) => !failed && state.selected(source, label),
            EdgeGuard::OnError => failed,
        }
    }
}

/// One outgoing edge of a compiled node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Successor {
    pub guard: EdgeGuard,
    /// `None` for edges into the reserved END target.
    pub target: Option<NodeId>,
}

/// Validated, immutable form of a graph ready to be scheduled.
#[derive(Debug, Clone)]
pub struct ExecutablePlan {
    pub graph_id: GraphId,
    pub version: u64,
    pub entry: NodeId,
    nodes: HashMap<NodeId, NodeSpec>,
    bindings: HashMap<NodeId, StepBinding>,
    successors: HashMap<NodeId, Vec<Successor>>,
    ancestors: HashMap<NodeId, HashSet<NodeId>>,
    topo_order: Vec<NodeId>,
}

impl ExecutablePlan {
    pub fn node(&self, id: &NodeId) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    pub fn binding(&self, id: &NodeId) -> Option<&StepBinding> {
        self.bindings.get(id)
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&NodeId, &StepBinding)> {
        self.bindings.iter()
    }

    /// Outgoing edges of a node, in declaration order.
    pub fn successors(&self, id: &NodeId) -> &[Successor] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_error_successor(&self, id: &NodeId) -> bool {
        self.successors(id)
            .iter()
            .any(|s| s.guard == EdgeGuard::OnError)
    }

    /// Whether `ancestor` can reach `node` through some path.
    pub fn is_ancestor(&self, ancestor: &NodeId, node: &NodeId) -> bool {
        self.ancestors
            .get(node)
            .map(|set| set.contains(ancestor))
            .unwrap_or(false)
    }

    /// Node ids in a topological order.
    pub fn topo_order(&self) -> &[NodeId] {
        &self.topo_order
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Turns a [`Graph`] into an [`ExecutablePlan`].
///
/// Compilation is a pure function of the graph: it is safe to cache by
/// `(graph_id, version)`.
pub struct Compiler;

impl Compiler {
    pub fn compile(graph: &Graph) -> Result<ExecutablePlan, GraphValidationError> {
        if graph.nodes.is_empty() {
            return Err(GraphValidationError::Empty);
        }

        // Index nodes, rejecting duplicates
        let mut dag: DiGraph<NodeId, ()> = DiGraph::new();
        let mut index: HashMap<NodeId, NodeIndex> = HashMap::new();
        for node in &graph.nodes {
            if node.id.is_end() {
                return Err(GraphValidationError::ReservedNodeId(node.id.clone()));
            }
            if index.contains_key(&node.id) {
                return Err(GraphValidationError::DuplicateNode(node.id.clone()));
            }
            let idx = dag.add_node(node.id.clone());
            index.insert(node.id.clone(), idx);
        }

        // Resolve edges
        let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for edge in &graph.edges {
            let from = index.get(&edge.source).ok_or_else(|| GraphValidationError::UnknownNode {
                from: edge.source.clone(),
                to: edge.target.clone(),
                missing: edge.source.clone(),
            })?;
            if edge.target.is_end() {
                continue;
            }
            let to = index.get(&edge.target).ok_or_else(|| GraphValidationError::UnknownNode {
                from: edge.source.clone(),
                to: edge.target.clone(),
                missing: edge.target.clone(),
            })?;
            dag.add_edge(*from, *to, ());
            adjacency
                .entry(edge.source.clone())
                .or_default()
                .push(edge.target.clone());
        }

        let order: Vec<NodeId> = graph.nodes.iter().map(|n| n.id.clone()).collect();
        if let Some(cycle) = find_cycle(&order, &adjacency) {
            return Err(GraphValidationError::Cycle { nodes: cycle });
        }

        let candidates: Vec<NodeId> = graph
            .nodes
            .iter()
            .filter(|n| {
                dag.neighbors_directed(index[&n.id], Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| n.id.clone())
            .collect();
        if candidates.len() != 1 {
            return Err(GraphValidationError::EntryCount { candidates });
        }
        let entry = candidates[0].clone();

        // Bind conditional edges to the labels their source declares
        let mut successors: HashMap<NodeId, Vec<Successor>> = HashMap::new();
        for edge in &graph.edges {
            if let Some(label) = edge.condition.as_deref() {
                let declared = graph
                    .find_node(&edge.source)
                    .map(|n| n.branches.iter().any(|b| b == label))
                    .unwrap_or(false);
                if label != ERROR_LABEL && !declared {
                    return Err(GraphValidationError::UnknownBranch {
                        from: edge.source.clone(),
                        to: edge.target.clone(),
                        label: label.to_string(),
                    });
                }
            }
            successors
                .entry(edge.source.clone())
                .or_default()
                .push(Successor {
                    guard: EdgeGuard::from_condition(edge.condition.as_deref()),
                    target: (!edge.target.is_end()).then(|| edge.target.clone()),
                });
        }

        let topo_order: Vec<NodeId> = petgraph::algo::toposort(&dag, None)
            .map_err(|cycle| GraphValidationError::Cycle {
                nodes: vec![dag[cycle.node_id()].clone()],
            })?
            .into_iter()
            .map(|idx| dag[idx].clone())
            .collect();

        let mut ancestors: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();
        for id in &topo_order {
            let mut set = HashSet::new();
            for pred in dag.neighbors_directed(index[id], Direction::Incoming) {
                let pred_id = &dag[pred];
                set.insert(pred_id.clone());
                if let Some(upstream) = ancestors.get(pred_id) {
                    set.extend(upstream.iter().cloned());
                }
            }
            ancestors.insert(id.clone(), set);
        }

        let bindings = graph
            .nodes
            .iter()
            .map(|n| {
                (
                    n.id.clone(),
                    StepBinding {
                        kind: n.kind,
                        handler: n.handler.clone(),
                    },
                )
            })
            .collect();

        tracing::debug!(
            graph_id = %graph.id,
            version = graph.version,
            entry = %entry,
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "compiled graph"
        );

        Ok(ExecutablePlan {
            graph_id: graph.id,
            version: graph.version,
            entry,
            nodes: graph
                .nodes
                .iter()
                .map(|n| (n.id.clone(), n.clone()))
                .collect(),
            bindings,
            successors,
            ancestors,
            topo_order,
        })
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search over an explicit path; a back edge closes a cycle.
///
/// Returns the nodes on the cycle in traversal order.
fn find_cycle(order: &[NodeId], adjacency: &HashMap<NodeId, Vec<NodeId>>) -> Option<Vec<NodeId>> {
    let mut marks: HashMap<&NodeId, Mark> = order.iter().map(|id| (id, Mark::Unvisited)).collect();

    for root in order {
        if marks.get(root).copied() != Some(Mark::Unvisited) {
            continue;
        }
        // Each frame is a node on the current path and its next edge to follow
        let mut path: Vec<(&NodeId, usize)> = vec![(root, 0)];
        marks.insert(root, Mark::OnStack);

        while let Some(frame) = path.last_mut() {
            let node = frame.0;
            let edges = adjacency.get(node).map(Vec::as_slice).unwrap_or(&[]);
            let Some(next) = edges.get(frame.1) else {
                marks.insert(node, Mark::Done);
                path.pop();
                continue;
            };
            frame.1 += 1;

            match marks.get(next).copied().unwrap_or(Mark::Unvisited) {
                Mark::OnStack => {
                    let start = path.iter().position(|(n, _)| *n == next).unwrap_or(0);
                    return Some(path[start..].iter().map(|(n, _)| (*n).clone()).collect());
                }
                Mark::Unvisited => {
                    marks.insert(next, Mark::OnStack);
                    path.push((next, 0));
                }
                Mark::Done => {}
            }
        }
    }
    None
}
