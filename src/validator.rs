//! Pure pre-publish workflow checks. Returns a list of human-readable error
//! strings; an empty list means the definition is valid. Never raises —
//! validation is data, not control flow (SPEC_FULL.md §4.3).

use std::collections::HashSet;

use crate::graph::{Graph, WorkflowDefinition};
use crate::template::extract_template_refs;

/// Step types the engine dispatches directly rather than through the
/// handler registry (§4.4.2); these are always accepted by check 4
/// regardless of what handlers are registered.
pub const ENGINE_HANDLED_TYPES: &[&str] =
    &["condition", "wait_for_approval", "wait_for_event", "for_each"];

/// Validates `definition` against a set of registered handler step types.
/// Checks run in order with a short-circuit after structural failures (an
/// empty-nodes or dangling-edge definition cannot be meaningfully graphed,
/// so later checks are skipped rather than cascading confusing errors).
pub fn validate_workflow(definition: &WorkflowDefinition, registered_types: &HashSet<String>) -> Vec<String> {
    let mut errors = Vec::new();

    if definition.nodes.is_empty() {
        errors.push("workflow must contain at least one node".to_string());
        return errors;
    }

    let node_ids: HashSet<&str> = definition.nodes.iter().map(|n| n.id.as_str()).collect();
    for edge in &definition.edges {
        if !node_ids.contains(edge.source.as_str()) {
            errors.push(format!("edge references unknown source node '{}'", edge.source));
        }
        if !node_ids.contains(edge.target.as_str()) {
            errors.push(format!("edge references unknown target node '{}'", edge.target));
        }
    }
    if !errors.is_empty() {
        return errors;
    }

    let graph = match Graph::new(definition.nodes.clone(), definition.edges.clone()) {
        Ok(g) => g,
        Err(e) => {
            errors.push(format!("invalid graph: {e}"));
            return errors;
        }
    };

    if graph.has_cycle() {
        errors.push("workflow graph contains a cycle".to_string());
        return errors;
    }

    for node in &definition.nodes {
        if !registered_types.contains(&node.node_type) && !ENGINE_HANDLED_TYPES.contains(&node.node_type.as_str()) {
            errors.push(format!("node '{}' has unregistered step type '{}'", node.id, node.node_type));
        }
    }

    for node in &definition.nodes {
        if node.node_type == "condition" {
            let outgoing = graph.get_outgoing_edges(&node.id);
            let has_true = outgoing.iter().any(|e| e.branch_label() == Some("true"));
            let has_false = outgoing.iter().any(|e| e.branch_label() == Some("false"));
            if !has_true {
                errors.push(format!("condition node '{}' is missing 'true' branch edge", node.id));
            }
            if !has_false {
                errors.push(format!("condition node '{}' is missing 'false' branch edge", node.id));
            }
        }
    }

    if definition.nodes.len() > 1 {
        let mut endpoint_ids: HashSet<&str> = HashSet::new();
        for edge in &definition.edges {
            endpoint_ids.insert(edge.source.as_str());
            endpoint_ids.insert(edge.target.as_str());
        }
        for node in &definition.nodes {
            if !endpoint_ids.contains(node.id.as_str()) {
                errors.push(format!("node '{}' is an orphan (no edges)", node.id));
            }
        }
    }

    for node in &definition.nodes {
        let refs = extract_template_refs(&node.data.config);
        let upstream = graph.upstream_ids(&node.id);
        for root in &refs {
            if root == "input" {
                continue;
            }
            if !upstream.contains(root) {
                errors.push(format!(
                    "node '{}' references '{}' which is not an upstream node",
                    node.id, root
                ));
            }
        }
    }

    for node in &definition.nodes {
        if node.node_type == "for_each" {
            let has_items = node.data.config.get("items").is_some();
            let refs = extract_template_refs(&node.data.config);
            let late_bound = !refs.is_empty();
            if !has_items && !late_bound {
                errors.push(format!(
                    "for_each node '{}' config must contain 'items' or a template reference",
                    node.id
                ));
            }
        }
    }

    errors
}
