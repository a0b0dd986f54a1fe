// SPDX-License-Identifier: MIT

//! Tool-call node

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::adk::error::NodeError;
use crate::adk::tool::Tool;
use crate::tandem::workflow::graph::{
    ExecutionContext, NodeDefinition, NodeExecutor, NodeId, NodeResult, NodeType, RetryConfig,
};
use crate::tandem::workflow::state::{GraphState, StateUpdate};

/// Builds tool arguments from state
pub type ArgsFn = Arc<dyn Fn(&GraphState) -> Value + Send + Sync>;

/// Maps a tool's output into a state update
pub type ToolOutputMapper = Arc<dyn Fn(&Value, &GraphState) -> StateUpdate + Send + Sync>;

/// Settings for [`tool_node`]
#[derive(Clone)]
pub struct ToolNodeConfig {
    pub tool: Arc<dyn Tool>,
    pub args: ArgsFn,
    pub output_key: Option<String>,
    pub output_mapper: Option<ToolOutputMapper>,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryConfig>,
}

impl ToolNodeConfig {
    pub fn new<F>(tool: Arc<dyn Tool>, args: F) -> Self
    where
        F: Fn(&GraphState) -> Value + Send + Sync + 'static,
    {
        Self {
            tool,
            args: Arc::new(args),
            output_key: None,
            output_mapper: None,
            timeout: None,
            retry: None,
        }
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    /// Takes precedence over the output key
    pub fn with_output_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&Value, &GraphState) -> StateUpdate + Send + Sync + 'static,
    {
        self.output_mapper = Some(Arc::new(mapper));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Node that invokes a [`Tool`] directly, without an agent in between
pub fn tool_node(id: impl Into<NodeId>, config: ToolNodeConfig) -> NodeDefinition {
    let retry = config.retry;
    let description = config.tool.description().to_string();
    let mut node = NodeDefinition::new(id, NodeType::Tool, ToolNode { config })
        .with_description(description);
    node.retry = retry;
    node
}

struct ToolNode {
    config: ToolNodeConfig,
}

#[async_trait]
impl NodeExecutor for ToolNode {
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeResult, NodeError> {
        let tool = &self.config.tool;
        let args = (self.config.args)(ctx.state());
        log::debug!("Node '{}' calling tool '{}'", ctx.node_id, tool.name());

        let call = async {
            match self.config.timeout {
                Some(limit) => match tokio::time::timeout(limit, tool.execute(args)).await {
                    Ok(result) => result,
                    Err(_) => Err(NodeError::Timeout(limit.as_millis() as u64)),
                },
                None => tool.execute(args).await,
            }
        };

        let output = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(NodeError::Cancelled),
            output = call => output?,
        };

        let update = match (&self.config.output_mapper, &self.config.output_key) {
            (Some(mapper), _) => mapper(&output, ctx.state()),
            (None, Some(key)) => StateUpdate::new().set(key.clone(), output.clone()),
            (None, None) => StateUpdate::new(),
        };
        Ok(NodeResult::update(update).with_output(output))
    }
}
