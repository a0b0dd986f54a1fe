// SPDX-License-Identifier: MIT

//! Sub-agent delegation
//!
//! - `SubagentGraphBridge` - spawns isolated sessions, alone or in batches
//! - `SubagentTypeRegistry` - name to agent-definition lookup

mod bridge;
mod registry;
mod types;

pub use bridge::{SubagentGraphBridge, DEFAULT_MAX_OUTPUT_CHARS};
pub use registry::SubagentTypeRegistry;
pub use types::{
    SpawnFailure, SubagentEntry, SubagentLookup, SubagentResult, SubagentSpawnOptions,
    SubagentSpawner,
};
