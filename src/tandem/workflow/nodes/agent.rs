// SPDX-License-Identifier: MIT

//! Agent-call node

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::adk::error::NodeError;
use crate::adk::session::{SessionChunk, SessionHandle};
use crate::tandem::workflow::graph::{
    ExecutionContext, NodeDefinition, NodeExecutor, NodeId, NodeResult, NodeType, RetryConfig,
};
use crate::tandem::workflow::state::{GraphState, StateUpdate};

use super::{PromptFn, TextOutput};

/// Settings for [`agent_node`]
#[derive(Clone)]
pub struct AgentNodeConfig {
    pub agent_type: String,
    pub prompt: PromptFn,
    pub model: Option<String>,
    pub retry: Option<RetryConfig>,
    output: TextOutput,
}

impl AgentNodeConfig {
    pub fn new<F>(agent_type: impl Into<String>, prompt: F) -> Self
    where
        F: Fn(&GraphState) -> String + Send + Sync + 'static,
    {
        Self {
            agent_type: agent_type.into(),
            prompt: Arc::new(prompt),
            model: None,
            retry: None,
            output: TextOutput::default(),
        }
    }

    /// Store the collected text under `key`
    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output = TextOutput::Key(key.into());
        self
    }

    pub fn with_output_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&str, &GraphState) -> StateUpdate + Send + Sync + 'static,
    {
        self.output = TextOutput::Mapper(Arc::new(mapper));
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Node that sends a state-derived prompt to an agent session
pub fn agent_node(id: impl Into<NodeId>, config: AgentNodeConfig) -> NodeDefinition {
    let mut node = NodeDefinition::new(id, NodeType::Agent, AgentNode {
        config: config.clone(),
    });
    node.model = config.model;
    node.retry = config.retry;
    node
}

struct AgentNode {
    config: AgentNodeConfig,
}

#[async_trait]
impl NodeExecutor for AgentNode {
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeResult, NodeError> {
        let provider = ctx
            .runtime
            .session_provider
            .clone()
            .ok_or(NodeError::MissingDependency("session_provider"))?;

        let agent_type = &self.config.agent_type;
        let session = provider
            .create_session(agent_type)
            .await?
            .ok_or_else(|| NodeError::SessionUnavailable(agent_type.clone()))?;

        let prompt = (self.config.prompt)(ctx.state());
        log::debug!(
            "Node '{}' sending prompt to '{}' (session {})",
            ctx.node_id,
            agent_type,
            session.id()
        );

        let response = collect_response(session.as_ref(), &prompt, &ctx.cancel).await;

        if let Some(usage) = session.context_usage().await {
            ctx.report_context_usage(usage);
        }
        if let Err(e) = session.destroy().await {
            log::warn!("Failed to destroy session {}: {}", session.id(), e);
        }

        let (text, tool_uses) = response?;
        log::debug!(
            "Node '{}' received {} chars, {} tool use(s)",
            ctx.node_id,
            text.len(),
            tool_uses
        );

        let update = self.config.output.map(&text, ctx.state());
        Ok(NodeResult::update(update).with_output(json!({
            "text": text,
            "tool_uses": tool_uses,
            "agent_type": agent_type,
            "model": ctx.model,
        })))
    }
}

/// Stream the response, counting tool markers
async fn collect_response(
    session: &dyn SessionHandle,
    prompt: &str,
    cancel: &CancellationToken,
) -> Result<(String, u32), NodeError> {
    let mut stream = session.send_and_stream(prompt);
    let mut text = String::new();
    let mut tool_uses = 0;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NodeError::Cancelled),
            chunk = stream.next() => chunk,
        };
        match chunk {
            None => break,
            Some(Ok(SessionChunk::Text(t))) => text.push_str(&t),
            Some(Ok(SessionChunk::ToolUse { name })) => {
                log::trace!("Session used tool '{}'", name);
                tool_uses += 1;
            }
            Some(Ok(SessionChunk::Other(_))) => {}
            Some(Err(e)) => return Err(NodeError::Session(e.to_string())),
        }
    }
    Ok((text, tool_uses))
}
