// SPDX-License-Identifier: MIT

//! Context-window monitor and clear nodes

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::tandem::workflow::graph::{
    NodeDefinition, NodeId, NodeResult, NodeType, SignalData, SignalKind,
};
use crate::tandem::workflow::state::StateUpdate;

/// Usage percentage at which a warning is raised
pub const DEFAULT_SOFT_THRESHOLD: f64 = 45.0;

/// State key carrying the requested action
pub const CONTEXT_ACTION_KEY: &str = "__context_action";

/// What the host should do with the agent's context window
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContextAction {
    Compact,
    Clear,
}

/// Settings for [`context_monitor_node`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextMonitorConfig {
    pub soft_threshold: f64,
    /// Defaults to the graph's context-window threshold
    pub hard_threshold: Option<f64>,
    /// Action requested above the hard threshold
    pub action: ContextAction,
}

impl Default for ContextMonitorConfig {
    fn default() -> Self {
        Self {
            soft_threshold: DEFAULT_SOFT_THRESHOLD,
            hard_threshold: None,
            action: ContextAction::Compact,
        }
    }
}

impl ContextMonitorConfig {
    pub fn with_soft_threshold(mut self, threshold: f64) -> Self {
        self.soft_threshold = threshold;
        self
    }

    pub fn with_hard_threshold(mut self, threshold: f64) -> Self {
        self.hard_threshold = Some(threshold);
        self
    }

    pub fn with_action(mut self, action: ContextAction) -> Self {
        self.action = action;
        self
    }
}

/// Compares the last reported usage against both thresholds
///
/// No usage reported yet means nothing to do.
pub fn context_monitor_node(id: impl Into<NodeId>, config: ContextMonitorConfig) -> NodeDefinition {
    NodeDefinition::from_fn(id, NodeType::ContextMonitor, move |ctx| async move {
        let Some(usage) = ctx.context_usage else {
            return Ok(NodeResult::new().with_output(json!({ "usage": null })));
        };

        let pct = usage.percentage();
        let hard = config.hard_threshold.unwrap_or(ctx.context_window_threshold);
        let data = json!({
            "usage": pct,
            "soft_threshold": config.soft_threshold,
            "hard_threshold": hard,
        });

        if pct >= hard {
            log::warn!(
                "Context usage {:.1}% reached {:.1}%; requesting {:?}",
                pct,
                hard,
                config.action
            );
            let signal = SignalData::new(
                SignalKind::ContextCompaction,
                format!("Context window at {:.1}%", pct),
            )
            .with_data(data.clone());
            return Ok(NodeResult::update(
                StateUpdate::new().set(CONTEXT_ACTION_KEY, json!(config.action)),
            )
            .with_signal(signal)
            .with_output(json!({ "usage": pct, "action": config.action })));
        }

        if pct >= config.soft_threshold {
            log::info!("Context usage {:.1}% above soft threshold", pct);
            let signal = SignalData::new(
                SignalKind::ContextWindowWarning,
                format!("Context window at {:.1}%", pct),
            )
            .with_data(data);
            return Ok(NodeResult::new()
                .with_signal(signal)
                .with_output(json!({ "usage": pct, "warning": true })));
        }

        Ok(NodeResult::new().with_output(json!({ "usage": pct })))
    })
}

/// Unconditionally asks the host to clear the context window
pub fn clear_context_node(id: impl Into<NodeId>) -> NodeDefinition {
    NodeDefinition::from_fn(id, NodeType::ContextMonitor, |ctx| async move {
        let action = ContextAction::Clear;
        log::info!("Node '{}' requesting context clear", ctx.node_id);
        let signal = SignalData::new(SignalKind::ContextCompaction, "Context clear requested");
        Ok(NodeResult::update(StateUpdate::new().set(CONTEXT_ACTION_KEY, json!(action)))
            .with_signal(signal)
            .with_output(json!({ "action": action })))
    })
}
