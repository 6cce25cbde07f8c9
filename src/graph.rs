//! Static DAG view over a workflow definition: adjacency, ready-set computation,
//! branch analysis for conditional skipping, and cycle/topology checks.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;

use crate::{EngineError, Result};

/// One node of a workflow definition, carried through the graph so ready-set
/// results preserve metadata rather than returning bare ids.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub data: NodeData,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodeData {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_strategy: Option<String>,
    #[serde(default)]
    pub backoff_base: Option<f64>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub on_error: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct EdgeData {
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkflowEdge {
    #[serde(default)]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    #[serde(default, rename = "sourceHandle")]
    pub source_handle: Option<String>,
    #[serde(default)]
    pub data: Option<EdgeData>,
}

impl WorkflowEdge {
    /// The branch label carried by this edge, preferring `data.condition` and
    /// falling back to `sourceHandle`, matching the original resolver's
    /// `data.get("condition") or sourceHandle` precedence.
    pub fn branch_label(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.condition.as_deref())
            .or(self.source_handle.as_deref())
    }
}

/// A workflow's full parsed definition: nodes + edges.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkflowDefinition {
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
}

/// Static DAG adjacency view. Construction rejects edges referencing unknown
/// node ids.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: HashMap<String, WorkflowNode>,
    edges: Vec<WorkflowEdge>,
    children: HashMap<String, Vec<String>>,
    parents: HashMap<String, Vec<String>>,
    root_ids: Vec<String>,
    node_order: Vec<String>,
}

impl Graph {
    pub fn new(nodes: Vec<WorkflowNode>, edges: Vec<WorkflowEdge>) -> Result<Self> {
        let mut node_map = HashMap::with_capacity(nodes.len());
        let mut node_order = Vec::with_capacity(nodes.len());
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut parents: HashMap<String, Vec<String>> = HashMap::new();

        for node in nodes {
            node_order.push(node.id.clone());
            children.entry(node.id.clone()).or_default();
            parents.entry(node.id.clone()).or_default();
            node_map.insert(node.id.clone(), node);
        }

        for edge in &edges {
            if !node_map.contains_key(&edge.source) {
                return Err(EngineError::UnknownNodeReference(edge.source.clone()));
            }
            if !node_map.contains_key(&edge.target) {
                return Err(EngineError::UnknownNodeReference(edge.target.clone()));
            }
            children.get_mut(&edge.source).unwrap().push(edge.target.clone());
            parents.get_mut(&edge.target).unwrap().push(edge.source.clone());
        }

        let root_ids: Vec<String> = node_order
            .iter()
            .filter(|nid| parents.get(*nid).map(|p| p.is_empty()).unwrap_or(true))
            .cloned()
            .collect();

        Ok(Self {
            nodes: node_map,
            edges,
            children,
            parents,
            root_ids,
            node_order,
        })
    }

    pub fn get_node(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(node_id)
    }

    pub fn node_ids(&self) -> HashSet<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn root_ids(&self) -> &[String] {
        &self.root_ids
    }

    pub fn leaf_ids(&self) -> Vec<String> {
        self.node_order
            .iter()
            .filter(|nid| self.children.get(*nid).map(|c| c.is_empty()).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Nodes not in `done` whose parents are all in `done`. Returns nodes, not
    /// ids, so callers keep node metadata without a second lookup.
    pub fn ready_set(&self, done: &HashSet<String>) -> Vec<&WorkflowNode> {
        self.node_order
            .iter()
            .filter(|nid| !done.contains(*nid))
            .filter(|nid| {
                self.parents
                    .get(*nid)
                    .map(|ps| ps.iter().all(|p| done.contains(p)))
                    .unwrap_or(true)
            })
            .map(|nid| &self.nodes[nid])
            .collect()
    }

    pub fn get_downstream(&self, node_id: &str) -> &[String] {
        self.children.get(node_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn get_outgoing_edges(&self, node_id: &str) -> Vec<&WorkflowEdge> {
        self.edges.iter().filter(|e| e.source == node_id).collect()
    }

    /// Transitive closure over `children`, iterative to avoid recursion limits
    /// on pathological (wide) graphs.
    pub fn descendants(&self, node_id: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        let mut stack: Vec<String> = self.children.get(node_id).cloned().unwrap_or_default();
        while let Some(current) = stack.pop() {
            if out.insert(current.clone()) {
                if let Some(next) = self.children.get(&current) {
                    stack.extend(next.iter().cloned());
                }
            }
        }
        out
    }

    /// Transitive closure over `parents`.
    pub fn upstream_ids(&self, node_id: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        let mut stack: Vec<String> = self.parents.get(node_id).cloned().unwrap_or_default();
        while let Some(current) = stack.pop() {
            if out.insert(current.clone()) {
                if let Some(next) = self.parents.get(&current) {
                    stack.extend(next.iter().cloned());
                }
            }
        }
        out
    }

    /// Target + descendants of every outgoing edge of `cond_id` labeled `label`
    /// (via `data.condition` or `sourceHandle`).
    pub fn branch_nodes(&self, cond_id: &str, label: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        for edge in self.get_outgoing_edges(cond_id) {
            if edge.branch_label() == Some(label) {
                result.insert(edge.target.clone());
                result.extend(self.descendants(&edge.target));
            }
        }
        result
    }

    /// `branch_nodes(label) \ union(branch_nodes(other labels))` — the set
    /// safe to skip when `label` loses. A node reachable from more than one
    /// outgoing branch (diamond merge) is never in this set.
    pub fn exclusive_branch_nodes(&self, cond_id: &str, label: &str) -> HashSet<String> {
        let mine = self.branch_nodes(cond_id, label);
        let mut other_labels: HashSet<String> = HashSet::new();
        for edge in self.get_outgoing_edges(cond_id) {
            if let Some(l) = edge.branch_label() {
                if l != label {
                    other_labels.insert(l.to_string());
                }
            }
        }
        let mut others = HashSet::new();
        for other in &other_labels {
            others.extend(self.branch_nodes(cond_id, other));
        }
        mine.difference(&others).cloned().collect()
    }

    /// Kahn's algorithm. Returns a topological order or a cycle error.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<String, usize> = self
            .node_order
            .iter()
            .map(|n| (n.clone(), self.parents.get(n).map(|p| p.len()).unwrap_or(0)))
            .collect();

        let mut queue: VecDeque<String> = self
            .node_order
            .iter()
            .filter(|n| in_degree[*n] == 0)
            .cloned()
            .collect();

        let mut order = Vec::with_capacity(self.node_order.len());
        while let Some(nid) = queue.pop_front() {
            order.push(nid.clone());
            for child in self.children.get(&nid).into_iter().flatten() {
                let deg = in_degree.get_mut(child).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(child.clone());
                }
            }
        }

        if order.len() != self.node_order.len() {
            return Err(EngineError::CycleDetected);
        }
        Ok(order)
    }

    pub fn has_cycle(&self) -> bool {
        self.topological_sort().is_err()
    }

    /// BFS levels (level 0 = roots), used by operators to visualize
    /// parallelism; has no bearing on scheduling order (that is driven by
    /// `ready_set` against the live done-set, not static levels).
    pub fn execution_levels(&self) -> Vec<Vec<String>> {
        let mut levels = Vec::new();
        let mut assigned: HashSet<String> = HashSet::new();
        let mut frontier: Vec<String> = self.root_ids.clone();

        while !frontier.is_empty() {
            for n in &frontier {
                assigned.insert(n.clone());
            }
            levels.push(frontier.clone());

            let mut next = Vec::new();
            let mut seen = HashSet::new();
            for nid in &frontier {
                for child in self.children.get(nid).into_iter().flatten() {
                    if assigned.contains(child) || seen.contains(child) {
                        continue;
                    }
                    let parents_done = self
                        .parents
                        .get(child)
                        .map(|ps| ps.iter().all(|p| assigned.contains(p)))
                        .unwrap_or(true);
                    if parents_done {
                        next.push(child.clone());
                        seen.insert(child.clone());
                    }
                }
            }
            frontier = next;
        }
        levels
    }
}
