// SPDX-License-Identifier: MIT

//! Sub-agent spawn options, results and the runtime-dependency traits

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::adk::agent::{AgentDefinition, AgentSource};

/// One sub-agent delegation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubagentSpawnOptions {
    /// Caller-chosen id used to correlate results
    pub agent_id: String,
    pub agent_name: String,
    pub task: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub tools: Option<Vec<String>>,
    pub timeout: Option<Duration>,
}

impl SubagentSpawnOptions {
    pub fn new(agent_name: impl Into<String>, task: impl Into<String>) -> Self {
        let agent_name = agent_name.into();
        Self {
            agent_id: format!("{}-{}", agent_name, uuid::Uuid::new_v4()),
            agent_name,
            task: task.into(),
            ..Self::default()
        }
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_tools(mut self, tools: Option<Vec<String>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Why a spawn did not succeed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpawnFailure {
    Timeout,
    Cancelled,
    NotFound,
    Error,
}

/// Outcome of one sub-agent delegation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubagentResult {
    pub agent_id: String,
    pub agent_name: String,
    pub success: bool,
    /// Collected (possibly truncated) text output
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<SpawnFailure>,
    pub tool_uses: u32,
    pub duration_ms: u64,
}

impl SubagentResult {
    pub fn succeeded(
        options: &SubagentSpawnOptions,
        output: String,
        tool_uses: u32,
        duration_ms: u64,
    ) -> Self {
        Self {
            agent_id: options.agent_id.clone(),
            agent_name: options.agent_name.clone(),
            success: true,
            output,
            error: None,
            failure: None,
            tool_uses,
            duration_ms,
        }
    }

    pub fn failed(
        options: &SubagentSpawnOptions,
        failure: SpawnFailure,
        error: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: options.agent_id.clone(),
            agent_name: options.agent_name.clone(),
            success: false,
            output: String::new(),
            error: Some(error.into()),
            failure: Some(failure),
            tool_uses: 0,
            duration_ms: 0,
        }
    }

    /// Keep partial output and timing on a failed result
    pub fn with_partial(mut self, output: String, tool_uses: u32, duration_ms: u64) -> Self {
        self.output = output;
        self.tool_uses = tool_uses;
        self.duration_ms = duration_ms;
        self
    }
}

/// Sub-agent bridge runtime dependency
#[async_trait]
pub trait SubagentSpawner: Send + Sync {
    /// Spawn one sub-agent; failures are reported in the result, never raised
    async fn spawn(
        &self,
        options: SubagentSpawnOptions,
        cancel: Option<CancellationToken>,
    ) -> SubagentResult;

    /// Spawn concurrently; one result per entry, in input order
    async fn spawn_parallel(
        &self,
        options: Vec<SubagentSpawnOptions>,
        cancel: Option<CancellationToken>,
    ) -> Vec<SubagentResult>;
}

/// A registered agent type
#[derive(Debug, Clone, PartialEq)]
pub struct SubagentEntry {
    pub name: String,
    pub source: AgentSource,
    pub definition: AgentDefinition,
}

impl SubagentEntry {
    pub fn new(definition: AgentDefinition, source: AgentSource) -> Self {
        Self {
            name: definition.name.clone(),
            source,
            definition,
        }
    }
}

/// Sub-agent registry runtime dependency
#[async_trait]
pub trait SubagentLookup: Send + Sync {
    async fn get(&self, name: &str) -> Option<SubagentEntry>;
    async fn get_all(&self) -> Vec<SubagentEntry>;
}
