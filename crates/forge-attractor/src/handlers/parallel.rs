use crate::{
    AttractorError, Graph, Node, NodeExecutor, NodeOutcome, NodeStatus, RuntimeContext,
    handlers::NodeHandler,
};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JoinPolicy {
    WaitAll,
    KOfN,
    Quorum,
    FirstSuccess,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ErrorPolicy {
    Continue,
    FailFast,
    Ignore,
}

#[derive(Clone, Debug)]
struct BranchRecord {
    node_id: String,
    status: NodeStatus,
    notes: Option<String>,
    context_updates: RuntimeContext,
}

impl BranchRecord {
    fn skipped(node_id: String) -> Self {
        Self {
            node_id,
            status: NodeStatus::Skipped,
            notes: Some("branch cancelled before completion".to_string()),
            context_updates: RuntimeContext::new(),
        }
    }
}

/// Runs a parallel node's branches (its outgoing edges) under a join/error policy,
/// delegating each branch back through the handler registry via `executor`.
pub struct ParallelHandler {
    executor: Arc<dyn NodeExecutor>,
}

impl ParallelHandler {
    pub fn new(executor: Arc<dyn NodeExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl NodeHandler for ParallelHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &RuntimeContext,
        graph: &Graph,
    ) -> Result<NodeOutcome, AttractorError> {
        let branch_targets: Vec<String> = graph
            .outgoing_edges(&node.id)
            .map(|edge| edge.to.clone())
            .collect();

        if branch_targets.is_empty() {
            return Ok(NodeOutcome::failure(format!(
                "parallel node '{}' has no outgoing branches",
                node.id
            )));
        }

        let branch_count = branch_targets.len();
        let join_policy = parse_join_policy(node);
        let error_policy = parse_error_policy(node);
        let max_parallel = parse_usize_attr(node, "max_parallel", branch_count).clamp(1, branch_count);
        let join_k = parse_f64_attr(node, "join_k", 1.0);
        let required = required_successes(join_policy, join_k, branch_count);

        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let mut pending = FuturesUnordered::new();
        for (idx, target) in branch_targets.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let branch_context = clone_branch_context(context, &node.id, &target);
            let executor = self.executor.clone();
            pending.push(Box::pin(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("parallel handler semaphore never closes");
                let outcome = match graph.nodes.get(&target) {
                    Some(branch_node) => executor.execute(branch_node, &branch_context, graph).await,
                    None => Err(AttractorError::Runtime(format!(
                        "parallel branch target '{target}' not found in graph"
                    ))),
                };
                (idx, target, outcome)
            }));
        }

        let mut records: Vec<Option<BranchRecord>> = vec![None; branch_count];
        let mut success_count = 0usize;
        let mut completed = 0usize;
        let mut resolution: Option<NodeStatus> = None;

        while let Some((idx, target, outcome)) = pending.next().await {
            completed += 1;
            let record = match outcome {
                Ok(node_outcome) => {
                    if node_outcome.status.is_success_like() {
                        success_count += 1;
                    }
                    BranchRecord {
                        node_id: target,
                        status: node_outcome.status,
                        notes: node_outcome.notes,
                        context_updates: node_outcome.context_updates,
                    }
                }
                Err(error) => BranchRecord {
                    node_id: target,
                    status: NodeStatus::Fail,
                    notes: Some(error.to_string()),
                    context_updates: RuntimeContext::new(),
                },
            };
            records[idx] = Some(record);

            if error_policy == ErrorPolicy::Ignore {
                continue;
            }

            if success_count >= required {
                resolution = Some(NodeStatus::Success);
                tracing::info!(
                    node = %node.id,
                    success_count,
                    required,
                    completed,
                    branch_count,
                    "parallel handler resolved early on success"
                );
                break;
            }

            if error_policy == ErrorPolicy::FailFast {
                let remaining = branch_count - completed;
                if success_count + remaining < required {
                    resolution = Some(NodeStatus::Fail);
                    tracing::warn!(
                        node = %node.id,
                        success_count,
                        required,
                        completed,
                        branch_count,
                        "parallel handler aborted early, success unreachable under fail_fast"
                    );
                    break;
                }
            }
        }

        // Cancel whatever is still in flight or never started; dropping the stream
        // aborts each branch future at its next await point.
        drop(pending);
        for (idx, target) in branch_targets.iter().enumerate() {
            if records[idx].is_none() {
                records[idx] = Some(BranchRecord::skipped(target.clone()));
            }
        }
        let records: Vec<BranchRecord> = records.into_iter().map(|r| r.unwrap()).collect();

        let fail_count = records
            .iter()
            .filter(|r| r.status == NodeStatus::Fail)
            .count();
        let skipped_count = records
            .iter()
            .filter(|r| r.status == NodeStatus::Skipped)
            .count();

        let (status, notes) = if error_policy == ErrorPolicy::Ignore {
            (
                NodeStatus::Success,
                format!(
                    "ignore policy: {branch_count} branches completed ({fail_count} failures ignored)"
                ),
            )
        } else if let Some(resolved) = resolution {
            let verb = match resolved {
                NodeStatus::Success => "resolved early",
                _ => "aborted early",
            };
            (
                resolved,
                format!(
                    "{join_policy:?}/{error_policy:?} {verb}: {success_count} successes, {skipped_count} skipped (required {required})"
                ),
            )
        } else {
            match join_policy {
                JoinPolicy::WaitAll => {
                    if fail_count == 0 {
                        (
                            NodeStatus::Success,
                            format!("all {branch_count} branches completed successfully"),
                        )
                    } else if success_count == 0 {
                        (
                            NodeStatus::Fail,
                            format!("wait_all: all {branch_count} branches failed"),
                        )
                    } else {
                        (
                            NodeStatus::PartialSuccess,
                            format!(
                                "wait_all: {success_count} succeeded, {fail_count} failed of {branch_count}"
                            ),
                        )
                    }
                }
                JoinPolicy::KOfN | JoinPolicy::Quorum | JoinPolicy::FirstSuccess => {
                    if success_count >= required {
                        (
                            NodeStatus::Success,
                            format!("{success_count} of {branch_count} branches succeeded (required {required})"),
                        )
                    } else {
                        (
                            NodeStatus::Fail,
                            format!(
                                "only {success_count} of {branch_count} branches succeeded (required {required})"
                            ),
                        )
                    }
                }
            }
        };

        let mut updates = RuntimeContext::new();
        updates.insert(
            "parallel.results".to_string(),
            Value::Array(records.iter().map(branch_record_to_value).collect()),
        );
        updates.insert(
            "parallel.branch_count".to_string(),
            Value::Number((branch_count as u64).into()),
        );
        updates.insert(
            "parallel.success_count".to_string(),
            Value::Number((success_count as u64).into()),
        );
        updates.insert(
            "parallel.fail_count".to_string(),
            Value::Number((fail_count as u64).into()),
        );
        updates.insert(
            "parallel.skipped_count".to_string(),
            Value::Number((skipped_count as u64).into()),
        );
        updates.insert(
            "parallel.join_policy".to_string(),
            Value::String(join_policy.as_str().to_string()),
        );
        updates.insert(
            "parallel.error_policy".to_string(),
            Value::String(error_policy.as_str().to_string()),
        );

        Ok(NodeOutcome {
            status,
            notes: Some(notes),
            context_updates: updates,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
        })
    }
}

impl JoinPolicy {
    fn as_str(self) -> &'static str {
        match self {
            Self::WaitAll => "wait_all",
            Self::KOfN => "k_of_n",
            Self::Quorum => "quorum",
            Self::FirstSuccess => "first_success",
        }
    }
}

impl ErrorPolicy {
    fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::FailFast => "fail_fast",
            Self::Ignore => "ignore",
        }
    }
}

fn required_successes(join_policy: JoinPolicy, join_k: f64, branch_count: usize) -> usize {
    match join_policy {
        JoinPolicy::WaitAll => branch_count,
        JoinPolicy::KOfN => (join_k.round() as i64).clamp(1, branch_count as i64) as usize,
        JoinPolicy::Quorum => {
            let ratio = join_k.clamp(f64::MIN_POSITIVE, 1.0);
            ((branch_count as f64) * ratio).ceil().max(1.0) as usize
        }
        JoinPolicy::FirstSuccess => 1,
    }
}

fn clone_branch_context(base: &RuntimeContext, parent_id: &str, target: &str) -> RuntimeContext {
    let mut cloned = base.clone();
    cloned.insert(
        "parallel.branch_parent".to_string(),
        Value::String(parent_id.to_string()),
    );
    cloned.insert(
        "parallel.branch_target".to_string(),
        Value::String(target.to_string()),
    );
    cloned
}

fn parse_join_policy(node: &Node) -> JoinPolicy {
    match attr_str(node, &["join_policy"]).unwrap_or("wait_all").trim() {
        "k_of_n" => JoinPolicy::KOfN,
        "quorum" => JoinPolicy::Quorum,
        "first_success" => JoinPolicy::FirstSuccess,
        _ => JoinPolicy::WaitAll,
    }
}

fn parse_error_policy(node: &Node) -> ErrorPolicy {
    match attr_str(node, &["error_policy"]).unwrap_or("continue").trim() {
        "fail_fast" => ErrorPolicy::FailFast,
        "ignore" => ErrorPolicy::Ignore,
        _ => ErrorPolicy::Continue,
    }
}

fn parse_usize_attr(node: &Node, key: &str, default: usize) -> usize {
    for candidate in attr_key_variants(key) {
        let Some(value) = node.attrs.get(&candidate) else {
            continue;
        };
        return match value {
            crate::AttrValue::Integer(value) if *value >= 0 => *value as usize,
            crate::AttrValue::String(value) => value.parse::<usize>().unwrap_or(default),
            _ => default,
        };
    }
    default
}

fn parse_f64_attr(node: &Node, key: &str, default: f64) -> f64 {
    for candidate in attr_key_variants(key) {
        let Some(value) = node.attrs.get(&candidate) else {
            continue;
        };
        return match value {
            crate::AttrValue::Float(value) => *value,
            crate::AttrValue::Integer(value) => *value as f64,
            crate::AttrValue::String(value) => value.parse::<f64>().unwrap_or(default),
            _ => default,
        };
    }
    default
}

fn attr_key_variants(key: &str) -> Vec<String> {
    vec![key.to_string(), key.replace('.', "_")]
}

fn attr_str<'a>(node: &'a Node, keys: &[&str]) -> Option<&'a str> {
    for key in keys {
        if let Some(value) = node.attrs.get_str(key) {
            return Some(value);
        }
        let underscored = key.replace('.', "_");
        if let Some(value) = node.attrs.get_str(&underscored) {
            return Some(value);
        }
    }
    None
}

fn branch_record_to_value(record: &BranchRecord) -> Value {
    json!({
        "nodeId": record.node_id,
        "status": record.status.as_str(),
        "notes": record.notes,
        "contextUpdates": record.context_updates,
    })
}
