// SPDX-License-Identifier: MIT

//! Session abstraction for agent providers
//!
//! The engine never sees provider-specific message shapes. A session turns a
//! message into a stream of [`SessionChunk`]s; the engine only distinguishes
//! text from tool markers.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::error::Result;

/// One streamed piece of a session response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SessionChunk {
    /// Assistant text
    Text(String),
    /// The agent invoked a tool
    ToolUse { name: String },
    /// Structured content the engine does not interpret
    Other(serde_json::Value),
}

/// Context-window usage reported by a session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ContextUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub max_tokens: u64,
}

impl ContextUsage {
    /// Usage as a percentage of the window (0.0 when the window size is unknown)
    pub fn percentage(&self) -> f64 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        (self.input_tokens + self.output_tokens) as f64 / self.max_tokens as f64 * 100.0
    }
}

/// An open agent session
///
/// Implementations use interior mutability; the engine holds sessions behind
/// `Box<dyn SessionHandle>` and always calls [`SessionHandle::destroy`] once
/// it is done with them.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// Provider-assigned session id
    fn id(&self) -> &str;

    /// Send a message and stream the response
    fn send_and_stream(&self, message: &str) -> BoxStream<'static, Result<SessionChunk>>;

    /// Tear the session down
    async fn destroy(&self) -> Result<()>;

    /// Current context-window usage, if the provider tracks it
    async fn context_usage(&self) -> Option<ContextUsage> {
        None
    }
}

/// Session-provider runtime dependency used by agent-call nodes
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Open a session for the named agent type (`None` if the type is unknown)
    async fn create_session(&self, agent_type: &str) -> Result<Option<Box<dyn SessionHandle>>>;
}

/// Settings for an isolated sub-agent session
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub tools: Option<Vec<String>>,
}

/// Factory used by the sub-agent bridge to open isolated sessions
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(&self, config: SessionConfig) -> Result<Box<dyn SessionHandle>>;
}

/// Channel-backed chunk stream for session implementations
///
/// The returned stream ends once every sender is dropped.
pub fn chunk_channel(
    buffer: usize,
) -> (
    mpsc::Sender<Result<SessionChunk>>,
    BoxStream<'static, Result<SessionChunk>>,
) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (tx, ReceiverStream::new(rx).boxed())
}
