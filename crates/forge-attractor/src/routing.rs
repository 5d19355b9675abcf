use crate::{Edge, Graph, NodeOutcome, RuntimeContext, evaluate_condition_expression};

pub fn select_next_edge<'a>(
    graph: &'a Graph,
    from_node_id: &'a str,
    outcome: &NodeOutcome,
    context: &RuntimeContext,
) -> Option<&'a Edge> {
    let edges: Vec<&Edge> = graph.outgoing_edges(from_node_id).collect();
    if edges.is_empty() {
        return None;
    }

    // Step 1: condition match
    let mut condition_matched = Vec::new();
    for edge in &edges {
        let condition = edge.attrs.get_str("condition").unwrap_or_default().trim();
        if condition.is_empty() {
            continue;
        }
        if evaluate_condition_expression(condition, outcome, context).unwrap_or(false) {
            condition_matched.push(*edge);
        }
    }
    if !condition_matched.is_empty() {
        return best_by_weight_then_lexical(condition_matched.iter().copied());
    }

    // Eligible for steps 2 and 3: unconditional or condition=true
    let mut eligible = Vec::new();
    for edge in &edges {
        let condition = edge.attrs.get_str("condition").unwrap_or_default().trim();
        if condition.is_empty()
            || evaluate_condition_expression(condition, outcome, context).unwrap_or(false)
        {
            eligible.push(*edge);
        }
    }

    // Step 2: preferred label
    if let Some(preferred) = outcome.preferred_label.as_ref() {
        let preferred = normalize_label(preferred);
        if let Some(edge) = eligible.iter().find(|edge| {
            normalize_label(edge.attrs.get_str("label").unwrap_or_default()) == preferred
        }) {
            return Some(*edge);
        }
    }

    // Step 3: suggested next ids
    if !outcome.suggested_next_ids.is_empty() {
        for suggested in &outcome.suggested_next_ids {
            if let Some(edge) = eligible.iter().find(|edge| edge.to == *suggested) {
                return Some(*edge);
            }
        }
    }

    // Step 4/5: unconditional by weight then lexical
    let unconditional: Vec<&Edge> = edges
        .iter()
        .copied()
        .filter(|edge| {
            edge.attrs
                .get_str("condition")
                .unwrap_or_default()
                .trim()
                .is_empty()
        })
        .collect();
    if !unconditional.is_empty() {
        return best_by_weight_then_lexical(unconditional.iter().copied());
    }

    // Fallback: any edge by weight then lexical
    best_by_weight_then_lexical(edges.iter().copied())
}

fn best_by_weight_then_lexical<'a, I>(edges: I) -> Option<&'a Edge>
where
    I: IntoIterator<Item = &'a Edge>,
{
    edges.into_iter().max_by(|left, right| {
        edge_weight(left)
            .cmp(&edge_weight(right))
            .then_with(|| right.to.cmp(&left.to))
    })
}

fn edge_weight(edge: &Edge) -> i64 {
    edge.attrs
        .get("weight")
        .and_then(|value| value.as_i64())
        .unwrap_or(0)
}

fn normalize_label(input: &str) -> String {
    let trimmed = input.trim().to_ascii_lowercase();

    if trimmed.starts_with('[') {
        if let Some((_, rest)) = trimmed.split_once(']') {
            return rest.trim().to_string();
        }
    }

    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphanumeric() && bytes[1] == b')' {
        return trimmed[2..].trim().to_string();
    }

    if bytes.len() >= 3 && bytes[0].is_ascii_alphanumeric() && bytes[1] == b' ' && bytes[2] == b'-'
    {
        return trimmed[3..].trim().to_string();
    }

    trimmed
}
