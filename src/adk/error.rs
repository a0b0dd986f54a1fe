// SPDX-License-Identifier: MIT

//! Typed error handling for tandem-rs
//!
//! Errors are split by the layer that raises them:
//! - [`BuilderError`] - graph construction and compilation
//! - [`NodeError`] - a single node's execute call (retryable)
//! - [`ExecutionError`] - fatal conditions that end an execution stream
//! - [`CheckpointError`] - checkpoint persistence
//!
//! [`TandemError`] wraps all of them for callers that want a single type.

use thiserror::Error;

/// Convenience alias used by the session and tool seams
pub type Result<T, E = TandemError> = std::result::Result<T, E>;

/// Top-level error type for tandem-rs
#[derive(Debug, Error)]
pub enum TandemError {
    /// Graph construction failed
    #[error("Graph build error: {0}")]
    Builder(#[from] BuilderError),

    /// Execution aborted
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// A node failed
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    /// Checkpoint persistence failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Configuration errors (invalid settings file, bad env override)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session transport errors raised by provider implementations
    #[error("Session error: {0}")]
    Session(String),

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error wrapper
    #[error("{0}")]
    Other(String),
}

/// Errors raised while building or compiling a graph
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuilderError {
    #[error("'{0}' called before start()")]
    NoStart(&'static str),

    #[error("start() called twice (existing start node '{0}')")]
    StartAlreadyDefined(String),

    #[error("else_() without a matching if_()")]
    UnmatchedElse,

    #[error("else_() called twice for the same if_()")]
    DuplicateElse,

    #[error("end_if() without a matching if_()")]
    UnmatchedEndIf,

    #[error("{0} conditional block(s) left open at compile time")]
    UnclosedConditional(usize),

    #[error("Graph has no start node")]
    MissingStartNode,

    #[error("Graph has no terminal node")]
    NoTerminalNode,

    #[error("Duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("Edge '{from}' -> '{to}' references a missing node")]
    DanglingEdge { from: String, to: String },

    #[error("Loop body must contain at least one node")]
    EmptyLoopBody,

    #[error("Parallel node '{0}' has no branches")]
    EmptyParallel(String),
}

/// Errors raised by a node's execute call
///
/// Every variant is retryable by the executor; only exhaustion turns one
/// into an [`ExecutionError`].
#[derive(Debug, Error)]
pub enum NodeError {
    /// Sub-agent name is not in the registry
    #[error("Sub-agent '{0}' not found in registry")]
    AgentNotFound(String),

    /// Session provider returned no session for the agent type
    #[error("No session available for agent type '{0}'")]
    SessionUnavailable(String),

    /// A runtime dependency the node needs was not configured
    #[error("Runtime dependency '{0}' is not configured")]
    MissingDependency(&'static str),

    /// Nested workflow could not be resolved by name
    #[error("Subgraph '{0}' could not be resolved")]
    SubgraphNotFound(String),

    /// Nested workflow aborted
    #[error("Subgraph execution failed: {0}")]
    Subgraph(Box<ExecutionError>),

    /// A delegated sub-agent reported failure
    #[error("Sub-agent '{agent}' failed: {message}")]
    Subagent { agent: String, message: String },

    /// Tool call failed
    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    /// Parallel branches failed under the configured strategy
    #[error("Parallel node failed: {0}")]
    Parallel(String),

    /// Session transport failure while streaming
    #[error("Session error: {0}")]
    Session(String),

    /// Operation exceeded its timeout
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Cancellation was requested while the node was running
    #[error("Cancelled")]
    Cancelled,

    /// Free-form failure raised by user node code
    #[error("{0}")]
    Failed(String),
}

/// Fatal execution errors
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Step ceiling exceeded
    #[error("Max steps exceeded: {limit}")]
    MaxStepsExceeded { limit: usize },

    /// A node was visited more often than its safety bound allows
    #[error("Loop detected: node '{node_id}' visited {visits} times (limit {limit})")]
    LoopDetected {
        node_id: String,
        visits: usize,
        limit: usize,
    },

    /// Queue or goto referenced a node that does not exist
    #[error("Node '{0}' not found in graph")]
    NodeNotFound(String),

    /// Retries exhausted with no handler, or the handler chose to abort
    #[error("Node '{node_id}' failed after {attempts} attempt(s): {source}")]
    NodeFailed {
        node_id: String,
        attempts: u32,
        #[source]
        source: NodeError,
    },

    /// The external cancellation token fired
    #[error("Execution cancelled")]
    Cancelled,
}

/// Checkpoint persistence errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint '{label}' not found for execution '{execution_id}'")]
    NotFound { execution_id: String, label: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl NodeError {
    /// Create a free-form failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Create a tool failure
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

impl TandemError {
    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a session error
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session(message.into())
    }
}

impl From<&str> for NodeError {
    fn from(s: &str) -> Self {
        Self::Failed(s.to_string())
    }
}

impl From<String> for NodeError {
    fn from(s: String) -> Self {
        Self::Failed(s)
    }
}

impl From<TandemError> for NodeError {
    fn from(err: TandemError) -> Self {
        match err {
            TandemError::Node(inner) => inner,
            TandemError::Execution(inner) => Self::Subgraph(Box::new(inner)),
            TandemError::Session(message) => Self::Session(message),
            other => Self::Failed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_failed_keeps_source() {
        let err = ExecutionError::NodeFailed {
            node_id: "a".to_string(),
            attempts: 3,
            source: NodeError::failed("boom"),
        };
        assert_eq!(err.to_string(), "Node 'a' failed after 3 attempt(s): boom");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_tandem_error_into_node_error() {
        let node: NodeError = TandemError::session("stream closed").into();
        assert!(matches!(node, NodeError::Session(ref m) if m == "stream closed"));

        let node: NodeError = TandemError::Execution(ExecutionError::Cancelled).into();
        assert!(matches!(node, NodeError::Subgraph(_)));
    }

    #[test]
    fn test_builder_error_messages() {
        assert_eq!(
            BuilderError::NoStart("then").to_string(),
            "'then' called before start()"
        );
        assert_eq!(
            BuilderError::DanglingEdge {
                from: "a".into(),
                to: "b".into()
            }
            .to_string(),
            "Edge 'a' -> 'b' references a missing node"
        );
    }
}
