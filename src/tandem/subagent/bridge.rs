// SPDX-License-Identifier: MIT

//! Sub-agent bridge
//!
//! Opens one isolated session per delegation through a [`SessionFactory`],
//! sends the task and collects the streamed text. Every exit path destroys
//! the session. Timeouts and cancellation are raced against each pending
//! stream operation, so partial output survives either.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::adk::session::{SessionChunk, SessionConfig, SessionFactory, SessionHandle};
use crate::tandem::task_group::TaskGroup;

use super::types::{SpawnFailure, SubagentResult, SubagentSpawnOptions, SubagentSpawner};

/// Default cap on collected sub-agent output, in characters
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 4000;

const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Spawns sub-agent sessions on behalf of graph nodes
#[derive(Clone)]
pub struct SubagentGraphBridge {
    factory: Arc<dyn SessionFactory>,
    max_output_chars: usize,
}

/// What came back from the stream before it ended or was interrupted
#[derive(Debug, Default)]
struct Collected {
    text: String,
    tool_uses: u32,
    failure: Option<(SpawnFailure, String)>,
}

impl SubagentGraphBridge {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
        }
    }

    pub fn with_max_output_chars(mut self, max_output_chars: usize) -> Self {
        self.max_output_chars = max_output_chars;
        self
    }

    pub fn max_output_chars(&self) -> usize {
        self.max_output_chars
    }

    /// Run one delegation to completion; failures are reported in the result
    pub async fn spawn(
        &self,
        options: SubagentSpawnOptions,
        cancel: Option<CancellationToken>,
    ) -> SubagentResult {
        let started = Instant::now();
        let cancel = cancel.unwrap_or_default();
        let deadline = options
            .timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        if cancel.is_cancelled() {
            return SubagentResult::failed(
                &options,
                SpawnFailure::Cancelled,
                "Cancelled before the session was created",
            );
        }

        log::info!(
            "Spawning sub-agent '{}' ({})",
            options.agent_name,
            options.agent_id
        );

        let config = SessionConfig {
            system_prompt: options.system_prompt.clone(),
            model: options.model.clone(),
            tools: options.tools.clone(),
        };

        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return SubagentResult::failed(&options, SpawnFailure::Cancelled, "Cancelled while creating session")
                    .with_partial(String::new(), 0, elapsed_ms(started));
            }
            _ = deadline_elapsed(deadline) => {
                return SubagentResult::failed(&options, SpawnFailure::Timeout, timeout_message(&options))
                    .with_partial(String::new(), 0, elapsed_ms(started));
            }
            created = self.factory.create_session(config) => match created {
                Ok(session) => session,
                Err(e) => {
                    log::error!("Failed to create session for sub-agent '{}': {}", options.agent_name, e);
                    return SubagentResult::failed(&options, SpawnFailure::Error, e.to_string())
                        .with_partial(String::new(), 0, elapsed_ms(started));
                }
            },
        };

        let collected = collect(session.as_ref(), &options, &cancel, deadline).await;

        if let Err(e) = session.destroy().await {
            log::warn!("Failed to destroy session {}: {}", session.id(), e);
        }

        let output = truncate_output(collected.text, self.max_output_chars);
        let duration_ms = elapsed_ms(started);

        match collected.failure {
            None => {
                log::info!(
                    "Sub-agent '{}' completed in {} ms ({} tool uses)",
                    options.agent_name,
                    duration_ms,
                    collected.tool_uses
                );
                SubagentResult::succeeded(&options, output, collected.tool_uses, duration_ms)
            }
            Some((failure, message)) => {
                log::warn!("Sub-agent '{}' failed: {}", options.agent_name, message);
                SubagentResult::failed(&options, failure, message).with_partial(
                    output,
                    collected.tool_uses,
                    duration_ms,
                )
            }
        }
    }

    /// Run every delegation concurrently and wait for all of them
    ///
    /// The result vector matches `options` in length and order. A task that
    /// panics becomes a failure result for its own entry.
    pub async fn spawn_parallel(
        &self,
        options: Vec<SubagentSpawnOptions>,
        cancel: Option<CancellationToken>,
    ) -> Vec<SubagentResult> {
        let mut group = TaskGroup::new();
        for opts in options.iter().cloned() {
            let bridge = self.clone();
            let cancel = cancel.clone();
            group.spawn(async move { bridge.spawn(opts, cancel).await });
        }

        log::debug!("Waiting on {} sub-agent spawns", group.len());

        group
            .join_all()
            .await
            .into_iter()
            .zip(options.iter())
            .map(|(joined, opts)| {
                joined.unwrap_or_else(|e| {
                    log::error!("Sub-agent task '{}' aborted: {}", opts.agent_name, e);
                    SubagentResult::failed(opts, SpawnFailure::Error, e.to_string())
                })
            })
            .collect()
    }
}

#[async_trait]
impl SubagentSpawner for SubagentGraphBridge {
    async fn spawn(
        &self,
        options: SubagentSpawnOptions,
        cancel: Option<CancellationToken>,
    ) -> SubagentResult {
        SubagentGraphBridge::spawn(self, options, cancel).await
    }

    async fn spawn_parallel(
        &self,
        options: Vec<SubagentSpawnOptions>,
        cancel: Option<CancellationToken>,
    ) -> Vec<SubagentResult> {
        SubagentGraphBridge::spawn_parallel(self, options, cancel).await
    }
}

async fn collect(
    session: &dyn SessionHandle,
    options: &SubagentSpawnOptions,
    cancel: &CancellationToken,
    deadline: Option<tokio::time::Instant>,
) -> Collected {
    let mut collected = Collected::default();
    let mut stream = session.send_and_stream(&options.task);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                collected.failure = Some((SpawnFailure::Cancelled, "Sub-agent cancelled".to_string()));
                break;
            }
            _ = deadline_elapsed(deadline) => {
                collected.failure = Some((SpawnFailure::Timeout, timeout_message(options)));
                break;
            }
            next = stream.next() => next,
        };

        match next {
            None => break,
            Some(Ok(SessionChunk::Text(text))) => collected.text.push_str(&text),
            Some(Ok(SessionChunk::ToolUse { name })) => {
                log::debug!("Sub-agent '{}' used tool {}", options.agent_name, name);
                collected.tool_uses += 1;
            }
            Some(Ok(SessionChunk::Other(_))) => {}
            Some(Err(e)) => {
                collected.failure = Some((SpawnFailure::Error, e.to_string()));
                break;
            }
        }
    }

    collected
}

async fn deadline_elapsed(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn timeout_message(options: &SubagentSpawnOptions) -> String {
    let ms = options.timeout.map(|t| t.as_millis()).unwrap_or_default();
    format!("Sub-agent '{}' timed out after {} ms", options.agent_name, ms)
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Cut `text` to `max_chars` characters, appending a marker when cut
fn truncate_output(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text,
        Some((byte_idx, _)) => {
            let mut truncated = text[..byte_idx].to_string();
            truncated.push_str(TRUNCATION_MARKER);
            truncated
        }
    }
}
