// SPDX-License-Identifier: MIT

//! Sub-agent delegation nodes
//!
//! Agents are looked up when the node runs, not when the graph is built,
//! so registries may be populated late.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::adk::error::NodeError;
use crate::tandem::subagent::{
    SpawnFailure, SubagentEntry, SubagentLookup, SubagentResult, SubagentSpawnOptions,
    SubagentSpawner,
};
use crate::tandem::workflow::graph::{
    ExecutionContext, NodeDefinition, NodeExecutor, NodeId, NodeResult, NodeType, RetryConfig,
};
use crate::tandem::workflow::state::{GraphState, StateUpdate};

use super::{PromptFn, TextOutput};

fn dependencies(
    ctx: &ExecutionContext,
) -> Result<(Arc<dyn SubagentLookup>, Arc<dyn SubagentSpawner>), NodeError> {
    let registry = ctx
        .runtime
        .subagent_registry
        .clone()
        .ok_or(NodeError::MissingDependency("subagent_registry"))?;
    let bridge = ctx
        .runtime
        .subagent_bridge
        .clone()
        .ok_or(NodeError::MissingDependency("subagent_bridge"))?;
    Ok((registry, bridge))
}

/// Spawn options from a registry entry; explicit overrides win, then the
/// definition, then the node's resolved model
fn spawn_options(
    entry: &SubagentEntry,
    task: String,
    model: Option<&str>,
    tools: Option<&[String]>,
    fallback_model: Option<String>,
    timeout: Option<Duration>,
) -> SubagentSpawnOptions {
    let session = entry.definition.session_config(model, tools);
    SubagentSpawnOptions::new(&entry.name, task)
        .with_system_prompt(session.system_prompt)
        .with_model(session.model.or(fallback_model))
        .with_tools(session.tools)
        .with_timeout(timeout)
}

/// Settings for [`subagent_node`]
#[derive(Clone)]
pub struct SubagentNodeConfig {
    pub agent_name: String,
    pub task: PromptFn,
    pub timeout: Option<Duration>,
    pub model: Option<String>,
    pub tools: Option<Vec<String>>,
    pub retry: Option<RetryConfig>,
    output: TextOutput,
}

impl SubagentNodeConfig {
    pub fn new<F>(agent_name: impl Into<String>, task: F) -> Self
    where
        F: Fn(&GraphState) -> String + Send + Sync + 'static,
    {
        Self {
            agent_name: agent_name.into(),
            task: Arc::new(task),
            timeout: None,
            model: None,
            tools: None,
            retry: None,
            output: TextOutput::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

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
}

/// Delegate one task to a registered sub-agent
pub fn subagent_node(id: impl Into<NodeId>, config: SubagentNodeConfig) -> NodeDefinition {
    let retry = config.retry;
    let mut node = NodeDefinition::new(id, NodeType::Subagent, SubagentNode { config });
    node.retry = retry;
    node
}

struct SubagentNode {
    config: SubagentNodeConfig,
}

#[async_trait]
impl NodeExecutor for SubagentNode {
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeResult, NodeError> {
        let (registry, bridge) = dependencies(&ctx)?;
        let name = &self.config.agent_name;
        let entry = registry
            .get(name)
            .await
            .ok_or_else(|| NodeError::AgentNotFound(name.clone()))?;

        let options = spawn_options(
            &entry,
            (self.config.task)(ctx.state()),
            self.config.model.as_deref(),
            self.config.tools.as_deref(),
            ctx.model.clone(),
            self.config.timeout,
        );
        log::info!(
            "Node '{}' delegating to sub-agent '{}' ({})",
            ctx.node_id,
            name,
            options.agent_id
        );

        let result = bridge.spawn(options, Some(ctx.cancel.child_token())).await;
        if !result.success {
            let message = result.error.clone().unwrap_or_default();
            return Err(match result.failure {
                Some(SpawnFailure::Timeout) => NodeError::Timeout(
                    self.config
                        .timeout
                        .map_or(result.duration_ms, |t| t.as_millis() as u64),
                ),
                Some(SpawnFailure::Cancelled) => NodeError::Cancelled,
                Some(SpawnFailure::NotFound) => NodeError::AgentNotFound(name.clone()),
                _ => NodeError::Subagent {
                    agent: name.clone(),
                    message,
                },
            });
        }

        let update = self.config.output.map(&result.output, ctx.state());
        Ok(NodeResult::update(update).with_output(json!(result)))
    }
}

/// One delegation in a batch
#[derive(Debug, Clone, PartialEq)]
pub struct SubagentTask {
    pub agent_name: String,
    pub prompt: String,
}

impl SubagentTask {
    pub fn new(agent_name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            prompt: prompt.into(),
        }
    }
}

/// Folds the ordered batch results into one update
pub type SubagentMergeFn = Arc<dyn Fn(&[SubagentResult], &GraphState) -> StateUpdate + Send + Sync>;

type TasksFn = Arc<dyn Fn(&GraphState) -> Vec<SubagentTask> + Send + Sync>;

/// Settings for [`parallel_subagent_node`]
#[derive(Clone)]
pub struct ParallelSubagentConfig {
    pub tasks: TasksFn,
    pub merge: SubagentMergeFn,
    /// Applies to each spawn on its own
    pub timeout: Option<Duration>,
    pub retry: Option<RetryConfig>,
}

impl ParallelSubagentConfig {
    pub fn new<T, M>(tasks: T, merge: M) -> Self
    where
        T: Fn(&GraphState) -> Vec<SubagentTask> + Send + Sync + 'static,
        M: Fn(&[SubagentResult], &GraphState) -> StateUpdate + Send + Sync + 'static,
    {
        Self {
            tasks: Arc::new(tasks),
            merge: Arc::new(merge),
            timeout: None,
            retry: None,
        }
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

/// Delegate a batch concurrently; partial failure never fails the node
pub fn parallel_subagent_node(
    id: impl Into<NodeId>,
    config: ParallelSubagentConfig,
) -> NodeDefinition {
    let retry = config.retry;
    let mut node = NodeDefinition::new(
        id,
        NodeType::ParallelSubagent,
        ParallelSubagentNode { config },
    );
    node.retry = retry;
    node
}

struct ParallelSubagentNode {
    config: ParallelSubagentConfig,
}

#[async_trait]
impl NodeExecutor for ParallelSubagentNode {
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeResult, NodeError> {
        let (registry, bridge) = dependencies(&ctx)?;
        let tasks = (self.config.tasks)(ctx.state());

        let mut slots: Vec<Option<SubagentResult>> = vec![None; tasks.len()];
        let mut spawn_slots = Vec::new();
        let mut spawns = Vec::new();

        for (index, task) in tasks.into_iter().enumerate() {
            match registry.get(&task.agent_name).await {
                Some(entry) => {
                    spawns.push(spawn_options(
                        &entry,
                        task.prompt,
                        None,
                        None,
                        ctx.model.clone(),
                        self.config.timeout,
                    ));
                    spawn_slots.push(index);
                }
                None => {
                    log::warn!(
                        "Node '{}': sub-agent '{}' not found in registry",
                        ctx.node_id,
                        task.agent_name
                    );
                    let options = SubagentSpawnOptions::new(&task.agent_name, task.prompt);
                    let message = NodeError::AgentNotFound(task.agent_name).to_string();
                    slots[index] = Some(SubagentResult::failed(
                        &options,
                        SpawnFailure::NotFound,
                        message,
                    ));
                }
            }
        }

        log::info!(
            "Node '{}' delegating {} task(s) ({} unresolved)",
            ctx.node_id,
            spawns.len(),
            slots.iter().filter(|s| s.is_some()).count()
        );
        if !spawns.is_empty() {
            let spawned = bridge
                .spawn_parallel(spawns, Some(ctx.cancel.child_token()))
                .await;
            for (index, result) in spawn_slots.into_iter().zip(spawned) {
                slots[index] = Some(result);
            }
        }

        let results: Vec<SubagentResult> = slots.into_iter().flatten().collect();
        let succeeded = results.iter().filter(|r| r.success).count();
        let update = (self.config.merge)(&results, ctx.state());

        Ok(NodeResult::update(update).with_output(json!({
            "results": results,
            "succeeded": succeeded,
            "failed": results.len() - succeeded,
        })))
    }
}
