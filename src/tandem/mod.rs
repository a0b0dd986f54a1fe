// SPDX-License-Identifier: MIT

//! Workflow engine
//!
//! - [`workflow`] - state, graph builder/executor and the node library
//! - [`subagent`] - sub-agent bridge and registry
//! - [`task_group`] - structured concurrency for fan-out
//! - [`settings`] - YAML/env configuration

pub mod settings;
pub mod subagent;
pub mod task_group;
pub mod workflow;
