// SPDX-License-Identifier: MIT

//! Graph-based workflow execution
//!
//! Build a graph with [`GraphBuilder`], compile it into a [`CompiledGraph`]
//! and drive it with a [`GraphExecutor`]. Step results can be projected into
//! host-facing views through a [`StreamRouter`].

pub mod builder;
pub mod checkpoint;
pub mod executor;
pub mod stream;
pub mod types;

pub use builder::{GraphBuilder, LoopConfig, DEFAULT_MAX_ITERATIONS};
pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use executor::{
    ExecutionOptions, ExecutionResult, ExecutionStream, GraphExecutor, StepDebug, StepResult,
    StepStatus, DEFAULT_MODEL_ENV,
};
pub use stream::{DebugTrace, StreamEvent, StreamMode, StreamRouter};
pub use types::{
    predicate, CompiledGraph, Edge, ErrorAction, ErrorHandler, ExecutionContext, GraphConfig,
    GraphEvent, LoopScope, NodeDefinition, NodeExecutor, NodeId, NodeResult, NodeType, Predicate,
    ProgressEvent, ProgressHook, RetryConfig, RuntimeDependencies, SignalData, SignalKind,
    WorkflowResolver, DEFAULT_CONTEXT_WINDOW_THRESHOLD, DEFAULT_MAX_NODE_VISITS,
    DEFAULT_MAX_STEPS,
};
