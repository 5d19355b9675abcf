use crate::{
    AttractorError, Graph, Node, NodeOutcome, NodeStatus, RuntimeContext, handlers::NodeHandler,
};
use async_trait::async_trait;
use serde_json::{Value, json};

#[derive(Clone, Debug)]
struct Candidate {
    id: String,
    status: NodeStatus,
    score: f64,
}

#[derive(Debug, Default)]
pub struct ParallelFanInHandler;

#[async_trait]
impl NodeHandler for ParallelFanInHandler {
    async fn execute(
        &self,
        _node: &Node,
        context: &RuntimeContext,
        _graph: &Graph,
    ) -> Result<NodeOutcome, AttractorError> {
        let Some(results) = context.get("parallel.results").and_then(Value::as_array) else {
            return Ok(NodeOutcome::failure(
                "No parallel results to evaluate".to_string(),
            ));
        };
        if results.is_empty() {
            return Ok(NodeOutcome::failure(
                "No parallel results to evaluate".to_string(),
            ));
        }

        let mut candidates: Vec<Candidate> =
            results.iter().filter_map(candidate_from_value).collect();
        if candidates.is_empty() {
            return Ok(NodeOutcome::failure(
                "No parseable parallel results to evaluate".to_string(),
            ));
        }

        candidates.sort_by(|left, right| {
            rank_status(left.status)
                .cmp(&rank_status(right.status))
                .then_with(|| {
                    right
                        .score
                        .partial_cmp(&left.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| left.id.cmp(&right.id))
        });
        let best = candidates
            .first()
            .expect("candidates should contain at least one entry")
            .clone();

        let all_failed = candidates
            .iter()
            .all(|candidate| matches!(candidate.status, NodeStatus::Fail | NodeStatus::Skipped));
        let status = if all_failed {
            NodeStatus::Fail
        } else {
            NodeStatus::Success
        };

        let mut updates = RuntimeContext::new();
        updates.insert(
            "parallel.fan_in.best_id".to_string(),
            Value::String(best.id.clone()),
        );
        updates.insert(
            "parallel.fan_in.best_outcome".to_string(),
            Value::String(best.status.as_str().to_string()),
        );
        updates.insert("parallel.fan_in.best_score".to_string(), json!(best.score));
        updates.insert(
            "parallel.fan_in.candidate_count".to_string(),
            Value::Number((candidates.len() as u64).into()),
        );

        Ok(NodeOutcome {
            status,
            notes: Some(format!(
                "Selected best candidate: {} ({})",
                best.id,
                best.status.as_str()
            )),
            context_updates: updates,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
        })
    }
}

fn candidate_from_value(value: &Value) -> Option<Candidate> {
    let object = value.as_object()?;
    let id = object
        .get("nodeId")
        .and_then(Value::as_str)
        .or_else(|| object.get("branch_id").and_then(Value::as_str))
        .or_else(|| object.get("target_node").and_then(Value::as_str))?
        .to_string();
    let status = object
        .get("status")
        .and_then(Value::as_str)
        .and_then(parse_status)
        .unwrap_or(NodeStatus::Fail);
    let score = object.get("score").and_then(Value::as_f64).unwrap_or(0.0);

    Some(Candidate { id, status, score })
}

fn parse_status(value: &str) -> Option<NodeStatus> {
    match value.trim() {
        "success" => Some(NodeStatus::Success),
        "partial_success" => Some(NodeStatus::PartialSuccess),
        "retry" => Some(NodeStatus::Retry),
        "fail" => Some(NodeStatus::Fail),
        "skipped" => Some(NodeStatus::Skipped),
        _ => None,
    }
}

fn rank_status(status: NodeStatus) -> u8 {
    match status {
        NodeStatus::Success => 0,
        NodeStatus::PartialSuccess => 1,
        NodeStatus::Retry => 2,
        NodeStatus::Fail => 3,
        NodeStatus::Skipped => 4,
    }
}
