use crate::{Edge, Graph, NodeOutcome, RuntimeContext};
use std::collections::BTreeMap;

pub const DEFAULT_FIDELITY: &str = "compact";

pub fn is_valid_fidelity_mode(mode: &str) -> bool {
    matches!(
        mode,
        "full" | "truncate" | "compact" | "summary:low" | "summary:medium" | "summary:high"
    )
}

pub fn find_incoming_edge<'a>(
    graph: &'a Graph,
    target_node_id: &str,
    previous_node_id: Option<&'a str>,
) -> Option<&'a Edge> {
    let from = previous_node_id?;
    graph
        .outgoing_edges(from)
        .find(|edge| edge.to == target_node_id)
}

pub fn resolve_fidelity_mode(
    graph: &Graph,
    target_node_id: &str,
    incoming_edge: Option<&Edge>,
) -> String {
    if let Some(edge) = incoming_edge {
        if let Some(fidelity) = edge.attrs.get_str("fidelity") {
            let trimmed = fidelity.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }

    if let Some(node) = graph.nodes.get(target_node_id) {
        if let Some(fidelity) = node.attrs.get_str("fidelity") {
            let trimmed = fidelity.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }

    if let Some(fidelity) = graph.attrs.get_str("default_fidelity") {
        let trimmed = fidelity.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    DEFAULT_FIDELITY.to_string()
}

/// Resolves the `full`-mode thread id for a node transition: edge `thread_id` takes
/// precedence over node `thread_id`, and failing both a thread id is generated from the
/// previous and target node ids.
pub fn resolve_thread_key(
    graph: &Graph,
    target_node_id: &str,
    incoming_edge: Option<&Edge>,
    previous_node_id: Option<&str>,
) -> Option<String> {
    if let Some(edge) = incoming_edge {
        if let Some(thread_id) = edge.attrs.get_str("thread_id") {
            let trimmed = thread_id.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }

    if let Some(node) = graph.nodes.get(target_node_id) {
        if let Some(thread_id) = node.attrs.get_str("thread_id") {
            let trimmed = thread_id.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }

    Some(format!(
        "{}->{}",
        previous_node_id.unwrap_or(target_node_id),
        target_node_id
    ))
}

fn is_private_key(key: &str) -> bool {
    key.starts_with('_')
}

fn goal_and_run_id(graph: &Graph, context: &RuntimeContext) -> (String, String) {
    let goal = context
        .get("graph.goal")
        .and_then(|value| value.as_str())
        .map(ToOwned::to_owned)
        .or_else(|| graph.attrs.get_str("goal").map(ToOwned::to_owned))
        .unwrap_or_default();
    let run_id = context
        .get("internal.lineage.root_run_id")
        .and_then(|value| value.as_str())
        .map(ToOwned::to_owned)
        .or_else(|| {
            context
                .get("run_id")
                .and_then(|value| value.as_str())
                .map(ToOwned::to_owned)
        })
        .unwrap_or_default();
    (goal, run_id)
}

/// Builds the textual preamble the next stage prepends to its prompt for non-`full`
/// fidelity modes (§4.4). Pure function over the resolved mode and the pipeline's
/// current context/outcome state; performs no I/O.
pub fn build_fidelity_preamble(
    mode: &str,
    graph: &Graph,
    context: &RuntimeContext,
    completed_nodes: &[String],
    node_outcomes: &BTreeMap<String, NodeOutcome>,
    logs: &[String],
) -> String {
    let (goal, run_id) = goal_and_run_id(graph, context);

    match mode {
        "truncate" => format!("Goal: {}\nRun ID: {}", goal, run_id),
        "compact" => {
            let mut lines = vec![format!("Goal: {}", goal), "Completed stages:".to_string()];
            for node_id in completed_nodes {
                let status = node_outcomes
                    .get(node_id)
                    .map(|outcome| outcome.status.as_str())
                    .unwrap_or("unknown");
                lines.push(format!("- {}: {}", node_id, status));
            }
            lines.push("Context:".to_string());
            for (key, value) in context.iter() {
                if is_private_key(key) {
                    continue;
                }
                lines.push(format!("- {} = {}", key, value));
            }
            lines.join("\n")
        }
        "summary:low" => {
            let success_count = node_outcomes
                .values()
                .filter(|outcome| outcome.status.is_success_like())
                .count();
            let fail_count = node_outcomes.len() - success_count;
            format!(
                "Goal: {}\nStages completed: {}\nSuccesses: {}\nFailures: {}",
                goal,
                completed_nodes.len(),
                success_count,
                fail_count
            )
        }
        "summary:medium" => {
            let mut lines = vec![format!("Goal: {}", goal), "Recent outcomes:".to_string()];
            for node_id in completed_nodes.iter().rev().take(5).rev() {
                let notes = node_outcomes
                    .get(node_id)
                    .and_then(|outcome| outcome.notes.as_deref())
                    .unwrap_or("");
                let status = node_outcomes
                    .get(node_id)
                    .map(|outcome| outcome.status.as_str())
                    .unwrap_or("unknown");
                lines.push(format!("- {}: {} ({})", node_id, status, notes));
            }
            lines.push("Context:".to_string());
            for (key, value) in context.iter() {
                if is_private_key(key) {
                    continue;
                }
                lines.push(format!("- {} = {}", key, value));
            }
            lines.join("\n")
        }
        "summary:high" => {
            let mut lines = vec![format!("Goal: {}", goal), "All outcomes:".to_string()];
            for node_id in completed_nodes {
                if let Some(outcome) = node_outcomes.get(node_id) {
                    lines.push(format!(
                        "- {}: {} notes={:?} context_updates={:?}",
                        node_id,
                        outcome.status.as_str(),
                        outcome.notes,
                        outcome.context_updates.keys().collect::<Vec<_>>()
                    ));
                }
            }
            lines.push("Context (full):".to_string());
            for (key, value) in context.iter() {
                lines.push(format!("- {} = {}", key, value));
            }
            if !logs.is_empty() {
                lines.push("Logs:".to_string());
                lines.extend(logs.iter().cloned());
            }
            lines.join("\n")
        }
        _ => String::new(),
    }
}
