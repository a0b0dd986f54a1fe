// SPDX-License-Identifier: MIT

//! tandem-rs - graph-based workflow execution for agent pipelines
//!
//! Build a graph with [`tandem::workflow::graph::GraphBuilder`], compile it,
//! and drive it with [`tandem::workflow::graph::GraphExecutor`]. Agents,
//! nested workflows and sub-agent delegation are reached through the runtime
//! dependencies injected into [`tandem::workflow::graph::GraphConfig`].

pub mod adk;
pub mod tandem;
