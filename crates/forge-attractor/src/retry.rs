use crate::{Graph, Node, NodeOutcome, NodeStatus};

#[derive(Clone, Debug, PartialEq)]
pub struct RetryBackoffConfig {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryBackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: RetryBackoffConfig,
}

/// A named retry preset as defined by the `retry_policy` node/graph attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPreset {
    None,
    Standard,
    Aggressive,
    Linear,
    Patient,
}

impl RetryPreset {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "none" => Some(Self::None),
            "standard" => Some(Self::Standard),
            "aggressive" => Some(Self::Aggressive),
            "linear" => Some(Self::Linear),
            "patient" => Some(Self::Patient),
            _ => None,
        }
    }

    fn max_attempts(self) -> u32 {
        match self {
            Self::None => 1,
            Self::Standard => 5,
            Self::Aggressive => 5,
            Self::Linear => 3,
            Self::Patient => 3,
        }
    }

    fn backoff(self) -> RetryBackoffConfig {
        match self {
            Self::None => RetryBackoffConfig {
                initial_delay_ms: 0,
                backoff_factor: 1.0,
                max_delay_ms: 0,
                jitter: false,
            },
            Self::Standard => RetryBackoffConfig {
                initial_delay_ms: 200,
                backoff_factor: 2.0,
                max_delay_ms: 60_000,
                jitter: true,
            },
            Self::Aggressive => RetryBackoffConfig {
                initial_delay_ms: 500,
                backoff_factor: 2.0,
                max_delay_ms: 60_000,
                jitter: true,
            },
            Self::Linear => RetryBackoffConfig {
                initial_delay_ms: 500,
                backoff_factor: 1.0,
                max_delay_ms: 500,
                jitter: false,
            },
            Self::Patient => RetryBackoffConfig {
                initial_delay_ms: 2_000,
                backoff_factor: 3.0,
                max_delay_ms: 60_000,
                jitter: false,
            },
        }
    }
}

/// Resolves the retry preset for a node: `retry_policy` attribute on the node, else the
/// graph's `default_retry_policy`, else `none`.
fn resolve_retry_preset(node: &Node, graph: &Graph) -> RetryPreset {
    node.attrs
        .get_str("retry_policy")
        .and_then(RetryPreset::parse)
        .or_else(|| {
            graph
                .attrs
                .get_str("default_retry_policy")
                .and_then(RetryPreset::parse)
        })
        .unwrap_or(RetryPreset::None)
}

fn overridden_u32(node: &Node, key: &str, default: u32) -> u32 {
    match node.attrs.get(key) {
        Some(value) => value.as_i64().map(|v| v.max(0) as u32).unwrap_or(default),
        None => default,
    }
}

fn overridden_u64(node: &Node, key: &str, default: u64) -> u64 {
    match node.attrs.get(key) {
        Some(crate::AttrValue::Integer(value)) if *value >= 0 => *value as u64,
        Some(crate::AttrValue::Duration(value)) => value.millis,
        _ => default,
    }
}

fn overridden_f64(node: &Node, key: &str, default: f64) -> f64 {
    match node.attrs.get(key) {
        Some(crate::AttrValue::Float(value)) => *value,
        Some(crate::AttrValue::Integer(value)) => *value as f64,
        _ => default,
    }
}

fn overridden_bool(node: &Node, key: &str, default: bool) -> bool {
    node.attrs.get_bool(key).unwrap_or(default)
}

/// Builds a node's retry policy from its `retry_policy` preset (or the graph default),
/// honoring per-knob overrides (`max_retries`, `retry_initial_delay_ms`,
/// `retry_backoff_factor`, `retry_max_delay_ms`, `retry_jitter`).
pub fn build_retry_policy(node: &Node, graph: &Graph, fallback: RetryBackoffConfig) -> RetryPolicy {
    let preset = resolve_retry_preset(node, graph);
    let preset_backoff = if preset == RetryPreset::None {
        fallback
    } else {
        preset.backoff()
    };

    let max_attempts = if node.attrs.get("max_retries").is_some() {
        overridden_u32(node, "max_retries", preset.max_attempts().saturating_sub(1)) + 1
    } else if let Some(default_max_retry) = graph
        .attrs
        .get("default_max_retry")
        .and_then(|value| value.as_i64())
    {
        (default_max_retry.max(0) as u32) + 1
    } else {
        preset.max_attempts()
    };

    let backoff = RetryBackoffConfig {
        initial_delay_ms: overridden_u64(
            node,
            "retry_initial_delay_ms",
            preset_backoff.initial_delay_ms,
        ),
        backoff_factor: overridden_f64(node, "retry_backoff_factor", preset_backoff.backoff_factor),
        max_delay_ms: overridden_u64(node, "retry_max_delay_ms", preset_backoff.max_delay_ms),
        jitter: overridden_bool(node, "retry_jitter", preset_backoff.jitter),
    };

    RetryPolicy {
        max_attempts,
        backoff,
    }
}

pub fn should_retry_outcome(outcome: &NodeOutcome) -> bool {
    matches!(outcome.status, NodeStatus::Retry | NodeStatus::Fail)
}

pub fn finalize_retry_exhausted(node: &Node) -> NodeOutcome {
    if node.attrs.get_bool("allow_partial") == Some(true) {
        return NodeOutcome {
            status: NodeStatus::PartialSuccess,
            notes: Some("retries exhausted, partial accepted".to_string()),
            context_updates: Default::default(),
            preferred_label: None,
            suggested_next_ids: Vec::new(),
        };
    }

    NodeOutcome::failure("max retries exceeded")
}

pub fn delay_for_attempt_ms(attempt: u32, config: &RetryBackoffConfig, jitter_seed: u64) -> u64 {
    let exp = (attempt.saturating_sub(1)) as i32;
    let base = (config.initial_delay_ms as f64) * config.backoff_factor.powi(exp);
    let mut delay = base.min(config.max_delay_ms as f64);
    if config.jitter {
        let factor = jitter_factor(attempt, jitter_seed);
        delay *= factor;
    }
    delay.round().max(0.0) as u64
}

fn jitter_factor(attempt: u32, jitter_seed: u64) -> f64 {
    let mut x = jitter_seed ^ ((attempt as u64) << 32) ^ 0x9E3779B97F4A7C15;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    let r = x.wrapping_mul(0x2545F4914F6CDD1D);
    let unit = (r as f64) / (u64::MAX as f64);
    0.5 + unit
}
