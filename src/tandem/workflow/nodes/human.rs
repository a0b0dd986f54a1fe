// SPDX-License-Identifier: MIT

//! Human-in-the-loop nodes
//!
//! Neither node blocks. They raise a `HumanInputRequired` signal and mark the
//! state as waiting; the host pauses by not pulling the next step and feeds
//! the answer back through state before resuming.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::tandem::workflow::graph::{
    NodeDefinition, NodeId, NodeResult, NodeType, SignalData, SignalKind,
};
use crate::tandem::workflow::state::{GraphState, StateUpdate};

pub const WAITING_FOR_INPUT_KEY: &str = "__waiting_for_input";
pub const WAIT_NODE_ID_KEY: &str = "__wait_node_id";
pub const ASK_USER_REQUEST_ID_KEY: &str = "__ask_user_request_id";

/// Supplies input without a human; `None` means a human is needed
pub type InputMapper = Arc<dyn Fn(&GraphState) -> Option<StateUpdate> + Send + Sync>;

/// Settings for [`wait_node`]
#[derive(Clone)]
pub struct WaitConfig {
    pub prompt: String,
    pub auto_approve: Option<InputMapper>,
}

impl WaitConfig {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            auto_approve: None,
        }
    }

    pub fn with_auto_approve<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&GraphState) -> Option<StateUpdate> + Send + Sync + 'static,
    {
        self.auto_approve = Some(Arc::new(mapper));
        self
    }
}

/// Pause point asking a human to approve or provide input
pub fn wait_node(id: impl Into<NodeId>, config: WaitConfig) -> NodeDefinition {
    let config = Arc::new(config);
    NodeDefinition::from_fn(id, NodeType::Wait, move |ctx| {
        let config = Arc::clone(&config);
        async move {
            if let Some(update) = config.auto_approve.as_ref().and_then(|m| m(ctx.state())) {
                log::debug!("Wait node '{}' auto-approved", ctx.node_id);
                let update = update.set(WAITING_FOR_INPUT_KEY, false);
                return Ok(NodeResult::update(update)
                    .with_output(json!({ "prompt": config.prompt, "approved": true })));
            }

            log::info!("Wait node '{}' requires input: {}", ctx.node_id, config.prompt);
            let signal = SignalData::new(SignalKind::HumanInputRequired, config.prompt.clone())
                .with_data(json!({ "node_id": ctx.node_id, "prompt": config.prompt }));
            let update = StateUpdate::new()
                .set(WAITING_FOR_INPUT_KEY, true)
                .set(WAIT_NODE_ID_KEY, ctx.node_id.clone());

            Ok(NodeResult::update(update)
                .with_signal(signal)
                .with_output(json!({ "prompt": config.prompt, "waiting": true })))
        }
    })
}

/// One selectable answer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AskUserOption {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

impl AskUserOption {
    pub fn new(label: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            description: description.into(),
        }
    }
}

/// A structured question
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AskUserConfig {
    pub question: String,
    /// Short label shown above the question
    pub header: Option<String>,
    pub options: Vec<AskUserOption>,
    #[serde(default)]
    pub multi_select: bool,
}

impl AskUserConfig {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            header: None,
            options: Vec::new(),
            multi_select: false,
        }
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = Some(header.into());
        self
    }

    pub fn with_option(mut self, label: impl Into<String>, description: impl Into<String>) -> Self {
        self.options.push(AskUserOption::new(label, description));
        self
    }

    pub fn multi_select(mut self) -> Self {
        self.multi_select = true;
        self
    }
}

/// Node asking the user a structured question
///
/// Emits the signal plus an `ask_user` event carrying the question and a
/// fresh request id the host echoes back with the answer.
pub fn ask_user_node(id: impl Into<NodeId>, config: AskUserConfig) -> NodeDefinition {
    let config = Arc::new(config);
    NodeDefinition::from_fn(id, NodeType::AskUser, move |ctx| {
        let config = Arc::clone(&config);
        async move {
            let request_id = Uuid::new_v4().to_string();
            let payload = json!({
                "request_id": request_id,
                "node_id": ctx.node_id,
                "question": config.question,
                "header": config.header,
                "options": config.options,
                "multi_select": config.multi_select,
            });

            ctx.emit("ask_user", payload.clone());
            let signal = SignalData::new(SignalKind::HumanInputRequired, config.question.clone())
                .with_data(payload.clone());
            let update = StateUpdate::new()
                .set(WAITING_FOR_INPUT_KEY, true)
                .set(WAIT_NODE_ID_KEY, ctx.node_id.clone())
                .set(ASK_USER_REQUEST_ID_KEY, request_id);

            Ok(NodeResult::update(update)
                .with_signal(signal)
                .with_output(payload))
        }
    })
}
