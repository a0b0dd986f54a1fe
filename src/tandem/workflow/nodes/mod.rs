// SPDX-License-Identifier: MIT

//! Node factory library
//!
//! One builder function plus a config struct per node kind. Each function
//! returns a plain [`NodeDefinition`] that can be wired with the
//! `GraphBuilder` like any hand-written node.
//!
//! [`NodeDefinition`]: crate::tandem::workflow::graph::NodeDefinition

use std::sync::Arc;

use crate::tandem::workflow::state::{GraphState, StateUpdate};

mod agent;
mod context;
mod decision;
mod human;
mod parallel;
mod subagent;
mod subgraph;
mod tool;

pub use agent::{agent_node, AgentNodeConfig};
pub use context::{
    clear_context_node, context_monitor_node, ContextAction, ContextMonitorConfig,
    CONTEXT_ACTION_KEY, DEFAULT_SOFT_THRESHOLD,
};
pub use decision::{decision_node, DecisionConfig};
pub use human::{
    ask_user_node, wait_node, AskUserConfig, AskUserOption, InputMapper, WaitConfig,
    ASK_USER_REQUEST_ID_KEY, WAITING_FOR_INPUT_KEY, WAIT_NODE_ID_KEY,
};
pub use parallel::{parallel_node, BranchOutcome, ParallelConfig, ParallelMergeFn, ParallelStrategy};
pub use subagent::{
    parallel_subagent_node, subagent_node, ParallelSubagentConfig, SubagentMergeFn,
    SubagentNodeConfig, SubagentTask,
};
pub use subgraph::{subgraph_node, StateMapper, SubgraphConfig, SubgraphSource};
pub use tool::{tool_node, ArgsFn, ToolNodeConfig, ToolOutputMapper};

/// Builds a prompt from the current state
pub type PromptFn = Arc<dyn Fn(&GraphState) -> String + Send + Sync>;

/// Maps collected text output into a state update
pub type OutputMapper = Arc<dyn Fn(&str, &GraphState) -> StateUpdate + Send + Sync>;

/// Where a text-producing node puts its output
#[derive(Clone, Default)]
pub(crate) enum TextOutput {
    /// Recorded only under `outputs[node_id]`
    #[default]
    Discard,
    Key(String),
    Mapper(OutputMapper),
}

impl TextOutput {
    pub(crate) fn map(&self, text: &str, state: &GraphState) -> StateUpdate {
        match self {
            TextOutput::Discard => StateUpdate::new(),
            TextOutput::Key(key) => StateUpdate::new().set(key.clone(), text),
            TextOutput::Mapper(mapper) => mapper(text, state),
        }
    }
}
