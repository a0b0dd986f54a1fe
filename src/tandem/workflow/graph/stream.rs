// SPDX-License-Identifier: MIT

//! Projection of step results into host-facing stream modes

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::adk::error::ExecutionError;
use crate::tandem::workflow::state::{GraphState, RejectedField, StateUpdate};

use super::executor::{ExecutionStream, StepResult, StepStatus};
use super::types::{GraphEvent, NodeId, NodeType, SignalData};

/// View of a step result a host subscribes to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Full state after each step
    Values,
    /// Only the merged delta
    Updates,
    /// Events raised through `ExecutionContext::emit`
    Events,
    /// Execution trace
    Debug,
}

/// Per-step trace for [`StreamMode::Debug`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DebugTrace {
    pub step: usize,
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub status: StepStatus,
    pub duration_ms: u64,
    pub attempts: u32,
    pub retry_count: u32,
    pub model: Option<String>,
    pub rejected: Vec<RejectedField>,
    pub error: Option<String>,
    pub next: Vec<NodeId>,
    pub signals: Vec<SignalData>,
}

impl From<&StepResult> for DebugTrace {
    fn from(step: &StepResult) -> Self {
        Self {
            step: step.step,
            node_id: step.node_id.clone(),
            node_type: step.node_type,
            status: step.status,
            duration_ms: step.debug.duration.as_millis() as u64,
            attempts: step.debug.attempts,
            retry_count: step.debug.retry_count,
            model: step.debug.model.clone(),
            rejected: step.debug.rejected.clone(),
            error: step.debug.error.clone(),
            next: step.debug.next.clone(),
            signals: step.signals.clone(),
        }
    }
}

/// One item delivered to a host
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Values {
        step: usize,
        node_id: NodeId,
        state: Arc<GraphState>,
    },
    Updates {
        step: usize,
        node_id: NodeId,
        update: StateUpdate,
    },
    Custom(GraphEvent),
    /// Signals ride along with every mode
    Signal {
        node_id: NodeId,
        signal: SignalData,
    },
    Debug(DebugTrace),
}

/// Splits each step result into the events of the subscribed modes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRouter {
    modes: Vec<StreamMode>,
}

impl Default for StreamRouter {
    fn default() -> Self {
        Self::single(StreamMode::Values)
    }
}

impl StreamRouter {
    /// Router for several modes (duplicates ignored, order kept)
    pub fn new(modes: impl IntoIterator<Item = StreamMode>) -> Self {
        let mut unique = Vec::new();
        for mode in modes {
            if !unique.contains(&mode) {
                unique.push(mode);
            }
        }
        Self { modes: unique }
    }

    pub fn single(mode: StreamMode) -> Self {
        Self { modes: vec![mode] }
    }

    pub fn modes(&self) -> &[StreamMode] {
        &self.modes
    }

    /// Events for one step: each mode in subscription order, then signals
    pub fn route(&self, step: &StepResult) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for mode in &self.modes {
            match mode {
                StreamMode::Values => events.push(StreamEvent::Values {
                    step: step.step,
                    node_id: step.node_id.clone(),
                    state: Arc::clone(&step.state),
                }),
                StreamMode::Updates => {
                    if !step.update.is_empty() {
                        events.push(StreamEvent::Updates {
                            step: step.step,
                            node_id: step.node_id.clone(),
                            update: step.update.clone(),
                        });
                    }
                }
                StreamMode::Events => {
                    events.extend(step.events.iter().cloned().map(StreamEvent::Custom))
                }
                StreamMode::Debug => events.push(StreamEvent::Debug(DebugTrace::from(step))),
            }
        }
        events.extend(step.signals.iter().map(|signal| StreamEvent::Signal {
            node_id: step.node_id.clone(),
            signal: signal.clone(),
        }));
        events
    }

    /// Apply the router to an execution stream; errors pass through unchanged
    pub fn route_stream(
        &self,
        steps: ExecutionStream,
    ) -> stream::BoxStream<'static, Result<StreamEvent, ExecutionError>> {
        let router = self.clone();
        steps
            .map_ok(move |step| {
                stream::iter(router.route(&step).into_iter().map(Ok::<_, ExecutionError>))
            })
            .try_flatten()
            .boxed()
    }
}
