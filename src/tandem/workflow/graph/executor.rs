// SPDX-License-Identifier: MIT

//! Graph workflow executor
//!
//! Drives a [`CompiledGraph`] one node at a time off a FIFO queue. Each
//! completed step is yielded through a lazy, pull-based stream, so the host
//! pauses execution simply by not polling. Per node: cancellation check,
//! step ceiling, visit bound, model resolution, execute with retry, merge,
//! edge evaluation against the merged state, optional checkpoint.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::adk::error::{ExecutionError, NodeError};
use crate::adk::session::ContextUsage;
use crate::tandem::workflow::state::{GraphState, RejectedField, StateUpdate};

use super::checkpoint::Checkpoint;
use super::types::{
    CompiledGraph, Emitter, ErrorAction, ExecutionContext, GraphEvent, NodeDefinition, NodeId,
    NodeResult, NodeType, ProgressEvent, RuntimeDependencies, SignalData,
};

/// Environment variable naming the platform default model
pub const DEFAULT_MODEL_ENV: &str = "TANDEM_DEFAULT_MODEL";

static PLATFORM_DEFAULT_MODEL: Lazy<Option<String>> = Lazy::new(|| {
    std::env::var(DEFAULT_MODEL_ENV)
        .ok()
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
});

/// Lazy, ordered, non-restartable sequence of step results
pub type ExecutionStream = BoxStream<'static, Result<StepResult, ExecutionError>>;

/// How a step ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The node succeeded and its update was merged
    Completed,
    /// The node failed and the error handler chose to skip it
    Skipped,
    /// The node failed and the error handler re-queued it
    Retrying,
    /// The node failed and the error handler jumped elsewhere
    Redirected,
}

/// Trace data for the debug stream mode
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepDebug {
    pub attempts: u32,
    pub retry_count: u32,
    pub duration: Duration,
    pub model: Option<String>,
    /// Fields dropped during merge
    pub rejected: Vec<RejectedField>,
    pub error: Option<String>,
    /// Nodes enqueued by this step
    pub next: Vec<NodeId>,
}

/// One executed node
#[derive(Debug, Clone)]
pub struct StepResult {
    /// 1-based step index within the execution
    pub step: usize,
    pub node_id: NodeId,
    pub node_type: NodeType,
    /// Snapshot after the merge
    pub state: Arc<GraphState>,
    /// Subset of the node's update that was actually merged
    pub update: StateUpdate,
    pub signals: Vec<SignalData>,
    pub events: Vec<GraphEvent>,
    pub status: StepStatus,
    pub debug: StepDebug,
}

/// Outcome of a run driven to completion
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub state: GraphState,
    /// Steps executed by this run
    pub steps: usize,
    /// Node ids in execution order
    pub path: Vec<NodeId>,
    pub signals: Vec<SignalData>,
    pub events: Vec<GraphEvent>,
    /// Update merged by each step, in execution order
    pub updates: Vec<StateUpdate>,
}

impl ExecutionResult {
    pub fn output(&self, node_id: &str) -> Option<&serde_json::Value> {
        self.state.output(node_id)
    }
}

/// Per-run settings
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Seed state; defaults to the graph's initial state
    pub initial_state: Option<GraphState>,
    /// Model of the enclosing subgraph node
    pub parent_model: Option<String>,
    /// Fills runtime dependencies the graph does not set itself
    pub runtime: Option<RuntimeDependencies>,
    pub cancel: Option<CancellationToken>,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_state(mut self, state: GraphState) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn with_parent_model(mut self, model: Option<String>) -> Self {
        self.parent_model = model;
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeDependencies) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Executes compiled graphs
#[derive(Debug, Clone)]
pub struct GraphExecutor {
    graph: Arc<CompiledGraph>,
}

impl GraphExecutor {
    pub fn new(graph: impl Into<Arc<CompiledGraph>>) -> Self {
        Self {
            graph: graph.into(),
        }
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    /// Stream a fresh execution from the start node
    pub fn stream(&self) -> ExecutionStream {
        self.stream_with(ExecutionOptions::default())
    }

    pub fn stream_with(&self, options: ExecutionOptions) -> ExecutionStream {
        into_stream(self.fresh_run(options))
    }

    /// Run to completion
    pub async fn execute(&self) -> Result<ExecutionResult, ExecutionError> {
        self.execute_with(ExecutionOptions::default()).await
    }

    pub async fn execute_with(
        &self,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, ExecutionError> {
        let run = self.fresh_run(options);
        let initial = Arc::clone(&run.state);
        drain(initial, into_stream(run)).await
    }

    /// Stream an execution seeded from a checkpoint's state and pending queue
    pub fn resume(&self, checkpoint: Checkpoint, options: ExecutionOptions) -> ExecutionStream {
        into_stream(self.resumed_run(checkpoint, options))
    }

    /// Resume from a checkpoint and run to completion
    pub async fn execute_from(
        &self,
        checkpoint: Checkpoint,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, ExecutionError> {
        let run = self.resumed_run(checkpoint, options);
        let initial = Arc::clone(&run.state);
        drain(initial, into_stream(run)).await
    }

    fn fresh_run(&self, mut options: ExecutionOptions) -> Run {
        let state = options
            .initial_state
            .take()
            .unwrap_or_else(|| self.graph.initial_state());
        log::info!(
            "Starting execution {} at '{}'",
            state.execution_id,
            self.graph.start()
        );
        let queue = VecDeque::from([self.graph.start().to_string()]);
        Run::new(Arc::clone(&self.graph), options, state, queue, 0)
    }

    fn resumed_run(&self, checkpoint: Checkpoint, options: ExecutionOptions) -> Run {
        log::info!(
            "Resuming execution {} from checkpoint '{}' ({} pending)",
            checkpoint.execution_id,
            checkpoint.label,
            checkpoint.pending.len()
        );
        Run::new(
            Arc::clone(&self.graph),
            options,
            checkpoint.state,
            checkpoint.pending.into(),
            checkpoint.step,
        )
    }
}

fn into_stream(run: Run) -> ExecutionStream {
    stream::try_unfold(run, |mut run| async move {
        let step = run.next_step().await?;
        Ok::<_, ExecutionError>(step.map(|step| (step, run)))
    })
    .boxed()
}

async fn drain(
    initial: Arc<GraphState>,
    mut steps: ExecutionStream,
) -> Result<ExecutionResult, ExecutionError> {
    let mut last = initial;
    let mut path = Vec::new();
    let mut signals = Vec::new();
    let mut events = Vec::new();
    let mut updates = Vec::new();

    while let Some(step) = steps.try_next().await? {
        path.push(step.node_id);
        signals.extend(step.signals);
        events.extend(step.events);
        updates.push(step.update);
        last = step.state;
    }
    drop(steps);

    let state = Arc::try_unwrap(last).unwrap_or_else(|shared| (*shared).clone());
    Ok(ExecutionResult {
        execution_id: state.execution_id.clone(),
        steps: path.len(),
        state,
        path,
        signals,
        events,
        updates,
    })
}

/// What a node produced across its attempts
struct Attempted {
    result: Result<NodeResult, NodeError>,
    attempts: u32,
    events: Vec<GraphEvent>,
}

/// Mutable bookkeeping of one execution
struct Run {
    graph: Arc<CompiledGraph>,
    runtime: RuntimeDependencies,
    parent_model: Option<String>,
    cancel: CancellationToken,
    state: Arc<GraphState>,
    queue: VecDeque<NodeId>,
    visits: HashMap<NodeId, usize>,
    /// Per-node visit bounds for loop members
    visit_limits: HashMap<NodeId, usize>,
    /// Loop entry id -> members whose counters reset on entry
    loop_members: HashMap<NodeId, Vec<NodeId>>,
    step: usize,
    context_usage: Option<ContextUsage>,
}

impl Run {
    fn new(
        graph: Arc<CompiledGraph>,
        options: ExecutionOptions,
        state: GraphState,
        queue: VecDeque<NodeId>,
        step: usize,
    ) -> Self {
        let mut visit_limits = HashMap::new();
        let mut loop_members = HashMap::new();
        for scope in graph.loops() {
            for member in scope.members() {
                visit_limits.insert(member.clone(), scope.max_iterations + 1);
            }
            loop_members.insert(scope.entry.clone(), scope.members().cloned().collect());
        }

        let runtime = match &options.runtime {
            Some(fallback) => graph.config().runtime.or(fallback),
            None => graph.config().runtime.clone(),
        };

        Self {
            runtime,
            parent_model: options.parent_model,
            cancel: options.cancel.unwrap_or_default(),
            state: Arc::new(state),
            queue,
            visits: HashMap::new(),
            visit_limits,
            loop_members,
            step,
            context_usage: None,
            graph,
        }
    }

    async fn next_step(&mut self) -> Result<Option<StepResult>, ExecutionError> {
        let Some(node_id) = self.queue.pop_front() else {
            log::info!(
                "Execution {} finished after {} steps",
                self.state.execution_id,
                self.step
            );
            return Ok(None);
        };

        if self.cancel.is_cancelled() {
            log::warn!("Execution {} cancelled", self.state.execution_id);
            return Err(ExecutionError::Cancelled);
        }

        let limit = self.graph.config().max_steps;
        if self.step >= limit {
            log::error!("Execution {} exceeded {} steps", self.state.execution_id, limit);
            return Err(ExecutionError::MaxStepsExceeded { limit });
        }

        let node = self
            .graph
            .node(&node_id)
            .cloned()
            .ok_or_else(|| ExecutionError::NodeNotFound(node_id.clone()))?;
        self.track_visit(&node_id)?;

        self.step += 1;
        let step = self.step;
        let model = self.resolve_model(&node);

        log::info!(
            "Step {}: executing node '{}' ({:?})",
            step,
            node_id,
            node.node_type
        );
        self.notify(ProgressEvent::NodeStarted {
            node_id: node_id.clone(),
            step,
        });

        let started = Instant::now();
        let attempted = self.execute_with_retry(&node, &model).await?;
        let mut debug = StepDebug {
            attempts: attempted.attempts,
            retry_count: attempted.attempts.saturating_sub(1),
            duration: started.elapsed(),
            model,
            ..StepDebug::default()
        };

        let (update, signals, status, next) = match attempted.result {
            Ok(result) => {
                let (update, signals, next) = self.complete(&node, result, &mut debug)?;
                self.notify(ProgressEvent::NodeCompleted {
                    node_id: node_id.clone(),
                    step,
                    duration: debug.duration,
                });
                (update, signals, StepStatus::Completed, next)
            }
            Err(error) => {
                log::error!(
                    "Node '{}' failed after {} attempt(s): {}",
                    node_id,
                    attempted.attempts,
                    error
                );
                self.notify(ProgressEvent::NodeFailed {
                    node_id: node_id.clone(),
                    error: error.to_string(),
                });
                debug.error = Some(error.to_string());

                let action = match &self.graph.error_handler {
                    Some(handler) => handler(&error, &node_id, self.state.as_ref()),
                    None => ErrorAction::Abort,
                };
                log::debug!("Error handler for '{}' chose {:?}", node_id, action);

                match action {
                    ErrorAction::Abort => {
                        return Err(ExecutionError::NodeFailed {
                            node_id,
                            attempts: attempted.attempts,
                            source: error,
                        });
                    }
                    ErrorAction::Retry => {
                        self.queue.push_front(node_id.clone());
                        debug.next = vec![node_id.clone()];
                        (StateUpdate::new(), Vec::new(), StepStatus::Retrying, Vec::new())
                    }
                    ErrorAction::Skip => {
                        let next = self.eligible_targets(&node_id);
                        (StateUpdate::new(), Vec::new(), StepStatus::Skipped, next)
                    }
                    ErrorAction::Goto(target) => {
                        self.check_target(&target)?;
                        self.visits.remove(&target);
                        (
                            StateUpdate::new(),
                            Vec::new(),
                            StepStatus::Redirected,
                            vec![target],
                        )
                    }
                }
            }
        };

        let enqueued = self.enqueue(next);
        if status != StepStatus::Retrying {
            debug.next = enqueued;
        }
        self.checkpoint(step).await;

        Ok(Some(StepResult {
            step,
            node_id,
            node_type: node.node_type,
            state: Arc::clone(&self.state),
            update,
            signals,
            events: attempted.events,
            status,
            debug,
        }))
    }

    /// Run the node, retrying with backoff until it succeeds or attempts run out
    async fn execute_with_retry(
        &mut self,
        node: &NodeDefinition,
        model: &Option<String>,
    ) -> Result<Attempted, ExecutionError> {
        let retry = node.retry.unwrap_or(self.graph.config().default_retry);
        let mut events = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let emitter = Emitter::default();
            let mut ctx = ExecutionContext::new(node.id.clone(), Arc::clone(&self.state))
                .with_model(model.clone())
                .with_context_usage(self.context_usage)
                .with_runtime(self.runtime.clone())
                .with_cancel(self.cancel.clone())
                .with_emitter(emitter.clone());
            ctx.context_window_threshold = self.graph.config().context_window_threshold;

            // Nodes observe the token themselves; the future is never dropped mid-flight
            let result = node.execute(ctx).await;

            let (emitted, usage) = emitter.drain();
            events.extend(emitted);
            if usage.is_some() {
                self.context_usage = usage;
            }

            match result {
                Ok(result) => {
                    return Ok(Attempted {
                        result: Ok(result),
                        attempts: attempt,
                        events,
                    })
                }
                Err(NodeError::Cancelled) => return Err(ExecutionError::Cancelled),
                Err(_) if self.cancel.is_cancelled() => return Err(ExecutionError::Cancelled),
                Err(error) if attempt < retry.max_attempts => {
                    let delay = retry.delay_for(attempt);
                    log::warn!(
                        "Node '{}' failed (attempt {}/{}): {}; retrying in {:?}",
                        node.id,
                        attempt,
                        retry.max_attempts,
                        error,
                        delay
                    );
                    self.notify(ProgressEvent::NodeRetrying {
                        node_id: node.id.clone(),
                        attempt,
                        error: error.to_string(),
                    });

                    let cancelled = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if cancelled {
                        return Err(ExecutionError::Cancelled);
                    }
                }
                Err(error) => {
                    return Ok(Attempted {
                        result: Err(error),
                        attempts: attempt,
                        events,
                    })
                }
            }
        }
    }

    /// Merge a successful result and pick the next nodes
    fn complete(
        &mut self,
        node: &NodeDefinition,
        result: NodeResult,
        debug: &mut StepDebug,
    ) -> Result<(StateUpdate, Vec<SignalData>, Vec<NodeId>), ExecutionError> {
        let NodeResult {
            state_update,
            output,
            signals,
            goto,
        } = result;

        let (merged, report) = self.state.apply(&state_update, self.graph.schema());
        if !report.rejected.is_empty() {
            log::debug!(
                "Node '{}' update had rejected fields: {:?}",
                node.id,
                report.rejected
            );
        }
        let output = output.unwrap_or_else(|| report.applied.clone().into_value());
        self.state = Arc::new(merged.with_output(node.id.clone(), output));
        debug.rejected = report.rejected;

        let next = if goto.is_empty() {
            self.eligible_targets(&node.id)
        } else {
            for target in &goto {
                self.check_target(target)?;
            }
            goto
        };
        Ok((report.applied, signals, next))
    }

    /// Targets of every edge eligible under the current state
    fn eligible_targets(&self, node_id: &str) -> Vec<NodeId> {
        if self.graph.is_terminal(node_id) {
            return Vec::new();
        }
        let mut targets: Vec<NodeId> = Vec::new();
        for edge in self.graph.outgoing(node_id) {
            if edge.is_eligible(&self.state) && !targets.contains(&edge.target) {
                targets.push(edge.target.clone());
            }
        }
        targets
    }

    fn check_target(&self, target: &str) -> Result<(), ExecutionError> {
        if self.graph.node(target).is_none() {
            return Err(ExecutionError::NodeNotFound(target.to_string()));
        }
        Ok(())
    }

    /// Append targets not already pending; returns what was added
    fn enqueue(&mut self, targets: Vec<NodeId>) -> Vec<NodeId> {
        let mut added = Vec::new();
        for target in targets {
            if self.queue.contains(&target) || added.contains(&target) {
                log::debug!("Node '{}' already pending, not enqueued twice", target);
                continue;
            }
            added.push(target);
        }
        self.queue.extend(added.iter().cloned());
        added
    }

    fn track_visit(&mut self, node_id: &str) -> Result<(), ExecutionError> {
        if let Some(members) = self.loop_members.get(node_id) {
            for member in members {
                self.visits.remove(member);
            }
        }

        let visits = {
            let count = self.visits.entry(node_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let limit = self
            .visit_limits
            .get(node_id)
            .copied()
            .unwrap_or(self.graph.config().max_node_visits);

        if visits > limit {
            log::error!(
                "Node '{}' visited {} times (limit {}); aborting",
                node_id,
                visits,
                limit
            );
            return Err(ExecutionError::LoopDetected {
                node_id: node_id.to_string(),
                visits,
                limit,
            });
        }
        Ok(())
    }

    /// node -> parent subgraph -> graph config -> platform default
    fn resolve_model(&self, node: &NodeDefinition) -> Option<String> {
        node.model
            .clone()
            .or_else(|| self.parent_model.clone())
            .or_else(|| self.graph.config().default_model.clone())
            .or_else(|| PLATFORM_DEFAULT_MODEL.clone())
    }

    async fn checkpoint(&self, step: usize) {
        let Some(store) = self.graph.config().checkpoint_store.clone() else {
            return;
        };
        let checkpoint = Checkpoint::new(
            Checkpoint::step_label(step),
            step,
            (*self.state).clone(),
            self.queue.iter().cloned().collect(),
        );
        if let Err(e) = store.save(&checkpoint).await {
            log::warn!(
                "Failed to write checkpoint '{}' for execution {}: {}",
                checkpoint.label,
                checkpoint.execution_id,
                e
            );
        }
    }

    fn notify(&self, event: ProgressEvent) {
        if let Some(hook) = &self.graph.config().on_progress {
            hook(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tandem::workflow::graph::builder::{GraphBuilder, LoopConfig};
    use crate::tandem::workflow::graph::checkpoint::{CheckpointStore, MemoryCheckpointStore};
    use crate::tandem::workflow::graph::types::{GraphConfig, RetryConfig};
    use crate::tandem::workflow::state::{Annotation, AnnotationRoot, FieldType};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig::new(max_attempts, Duration::from_millis(1), 2.0)
    }

    fn noop(id: &str) -> NodeDefinition {
        NodeDefinition::passthrough(id, NodeType::Custom)
    }

    fn incrementer(id: &str) -> NodeDefinition {
        NodeDefinition::from_fn(id, NodeType::Custom, |_ctx| async {
            Ok(NodeResult::update(StateUpdate::new().set("counter", 1)))
        })
    }

    /// Fails until it has been called `failures` times
    fn flaky(id: &str, failures: u32, calls: Arc<AtomicU32>) -> NodeDefinition {
        NodeDefinition::from_fn(id, NodeType::Custom, move |_ctx| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(NodeError::failed(format!("failure {}", n)))
                } else {
                    Ok(NodeResult::update(StateUpdate::new().set("ok", true)))
                }
            }
        })
    }

    fn counter_schema() -> AnnotationRoot {
        AnnotationRoot::new().field("counter", Annotation::sum(0).typed(FieldType::Number))
    }

    #[tokio::test]
    async fn test_sequential_execution_sums_counter() {
        let graph = GraphBuilder::new()
            .with_schema(counter_schema())
            .start(incrementer("a"))
            .then(incrementer("b"))
            .then(incrementer("c"))
            .end()
            .compile(GraphConfig::default())
            .unwrap();

        let result = GraphExecutor::new(graph).execute().await.unwrap();
        assert_eq!(result.state.get_i64("counter"), Some(3));
        assert_eq!(result.state.outputs.len(), 3);
        assert_eq!(result.path, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_stream_yields_each_step_in_order() {
        let graph = GraphBuilder::new()
            .start(incrementer("a"))
            .then(incrementer("b"))
            .compile(GraphConfig::default())
            .unwrap();

        let steps: Vec<StepResult> = GraphExecutor::new(graph)
            .stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step, 1);
        assert_eq!(steps[1].node_id, "b");
        assert_eq!(steps[0].debug.next, vec!["b"]);
        assert!(steps[1].debug.next.is_empty());
    }

    #[tokio::test]
    async fn test_retry_then_success_reports_retry_count() {
        let calls = Arc::new(AtomicU32::new(0));
        let graph = GraphBuilder::new()
            .start(flaky("f", 2, calls.clone()).with_retry(fast_retry(3)))
            .compile(GraphConfig::default())
            .unwrap();

        let steps: Vec<StepResult> = GraphExecutor::new(graph)
            .stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[0].debug.retry_count, 2);
        assert_eq!(steps[0].debug.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_aborts_with_original_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let graph = GraphBuilder::new()
            .start(flaky("f", 10, calls.clone()).with_retry(fast_retry(3)))
            .compile(GraphConfig::default())
            .unwrap();

        let err = GraphExecutor::new(graph).execute().await.unwrap_err();
        match err {
            ExecutionError::NodeFailed {
                node_id,
                attempts,
                source,
            } => {
                assert_eq!(node_id, "f");
                assert_eq!(attempts, 3);
                assert_eq!(source.to_string(), "failure 3");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_delays_are_applied() {
        let calls = Arc::new(AtomicU32::new(0));
        let graph = GraphBuilder::new()
            .start(
                flaky("f", 2, calls)
                    .with_retry(RetryConfig::new(3, Duration::from_millis(20), 2.0)),
            )
            .compile(GraphConfig::default())
            .unwrap();

        let started = Instant::now();
        GraphExecutor::new(graph).execute().await.unwrap();
        // 20ms + 40ms
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_error_handler_skip_follows_edges() {
        let calls = Arc::new(AtomicU32::new(0));
        let graph = GraphBuilder::new()
            .start(flaky("f", 100, calls).with_retry(RetryConfig::none()))
            .then(incrementer("after"))
            .catch(|_, _, _| ErrorAction::Skip)
            .compile(GraphConfig::default())
            .unwrap();

        let steps: Vec<StepResult> = GraphExecutor::new(graph)
            .stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(steps[0].status, StepStatus::Skipped);
        assert!(steps[0].update.is_empty());
        assert!(steps[0].state.output("f").is_none());
        assert_eq!(steps[1].node_id, "after");
    }

    #[tokio::test]
    async fn test_error_handler_retry_requeues_node() {
        let calls = Arc::new(AtomicU32::new(0));
        let graph = GraphBuilder::new()
            .start(flaky("f", 1, calls.clone()).with_retry(RetryConfig::none()))
            .catch(|_, _, _| ErrorAction::Retry)
            .compile(GraphConfig::default())
            .unwrap();

        let steps: Vec<StepResult> = GraphExecutor::new(graph)
            .stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].status, StepStatus::Retrying);
        assert_eq!(steps[1].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_error_handler_goto_resets_visit_counter() {
        // "f" fails five times and jumps back to itself each time
        let calls = Arc::new(AtomicU32::new(0));
        let graph = GraphBuilder::new()
            .start(flaky("f", 5, calls).with_retry(RetryConfig::none()))
            .catch(|_, _, _| ErrorAction::Goto("f".into()))
            .compile(GraphConfig::default().with_max_node_visits(3))
            .unwrap();

        let steps: Vec<StepResult> = GraphExecutor::new(graph)
            .stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(steps.len(), 6);
        assert!(steps[..5]
            .iter()
            .all(|s| s.status == StepStatus::Redirected));
        assert_eq!(steps[5].state.get_bool("ok"), Some(true));
    }

    #[tokio::test]
    async fn test_goto_to_unknown_node_is_fatal() {
        let calls = Arc::new(AtomicU32::new(0));
        let graph = GraphBuilder::new()
            .start(flaky("f", 5, calls).with_retry(RetryConfig::none()))
            .catch(|_, _, _| ErrorAction::Goto("nowhere".into()))
            .compile(GraphConfig::default())
            .unwrap();

        let err = GraphExecutor::new(graph).execute().await.unwrap_err();
        assert!(matches!(err, ExecutionError::NodeNotFound(ref id) if id == "nowhere"));
    }

    #[tokio::test]
    async fn test_unconditioned_cycle_trips_loop_detection() {
        let graph = GraphBuilder::new()
            .start(noop("a"))
            .then(noop("b"))
            .add_edge("b", "a")
            .add_node(noop("unreachable_end"))
            .compile(GraphConfig::default().with_max_node_visits(5))
            .unwrap();

        let err = GraphExecutor::new(graph).execute().await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::LoopDetected { ref node_id, visits: 6, limit: 5 } if node_id == "a"
        ));
    }

    #[tokio::test]
    async fn test_max_steps_is_fatal() {
        let graph = GraphBuilder::new()
            .start(noop("a"))
            .then(noop("b"))
            .add_edge("b", "a")
            .add_node(noop("unreachable_end"))
            .compile(GraphConfig::default().with_max_steps(4))
            .unwrap();

        let err = GraphExecutor::new(graph).execute().await.unwrap_err();
        assert!(matches!(err, ExecutionError::MaxStepsExceeded { limit: 4 }));
    }

    #[tokio::test]
    async fn test_loop_runs_until_condition() {
        let graph = GraphBuilder::new()
            .with_schema(counter_schema())
            .start(noop("begin"))
            .loop_(
                vec![incrementer("body")],
                LoopConfig::until(|s| s.get_i64("counter").unwrap_or(0) >= 5),
            )
            .then(noop("after"))
            .compile(GraphConfig::default())
            .unwrap();

        let result = GraphExecutor::new(graph).execute().await.unwrap();
        assert_eq!(result.state.get_i64("counter"), Some(5));
        assert_eq!(result.path.iter().filter(|id| *id == "body").count(), 5);
        assert_eq!(result.path.last().map(String::as_str), Some("after"));
    }

    #[tokio::test]
    async fn test_loop_cap_bounds_iterations_beyond_visit_limit() {
        let graph = GraphBuilder::new()
            .with_schema(counter_schema())
            .start(noop("begin"))
            .loop_(
                vec![incrementer("body")],
                LoopConfig::until(|_| false).with_max_iterations(12),
            )
            .compile(GraphConfig::default().with_max_node_visits(5))
            .unwrap();

        let result = GraphExecutor::new(graph).execute().await.unwrap();
        assert_eq!(result.state.get_i64("counter"), Some(12));
    }

    #[tokio::test]
    async fn test_fan_out_enqueues_each_target_once() {
        let graph = GraphBuilder::new()
            .start(noop("decide"))
            .add_node(incrementer("left"))
            .add_node(incrementer("right"))
            .add_node(noop("join"))
            .add_conditional_edge("decide", "left", |_| true)
            .add_conditional_edge("decide", "right", |_| true)
            .add_edge("decide", "left")
            .add_edge("left", "join")
            .add_edge("right", "join")
            .compile(GraphConfig::default())
            .unwrap();

        let result = GraphExecutor::new(graph).execute().await.unwrap();
        assert_eq!(result.path, vec!["decide", "left", "right", "join"]);
    }

    #[tokio::test]
    async fn test_goto_override_bypasses_edges() {
        let graph = GraphBuilder::new()
            .start(NodeDefinition::from_fn("router", NodeType::Decision, |_| async {
                Ok(NodeResult::new().with_goto("special"))
            }))
            .then(noop("normal"))
            .add_node(noop("special"))
            .compile(GraphConfig::default())
            .unwrap();

        let result = GraphExecutor::new(graph).execute().await.unwrap();
        assert_eq!(result.path, vec!["router", "special"]);
    }

    #[tokio::test]
    async fn test_schema_rejection_only_visible_in_debug() {
        let graph = GraphBuilder::new()
            .with_schema(counter_schema())
            .start(NodeDefinition::from_fn("bad", NodeType::Custom, |_| async {
                Ok(NodeResult::update(
                    StateUpdate::new().set("counter", "three").set("note", "kept"),
                ))
            }))
            .compile(GraphConfig::default())
            .unwrap();

        let steps: Vec<StepResult> = GraphExecutor::new(graph)
            .stream()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(steps[0].state.get_i64("counter"), Some(0));
        assert_eq!(steps[0].update.len(), 1);
        assert_eq!(steps[0].debug.rejected[0].field, "counter");
    }

    #[tokio::test]
    async fn test_model_resolution_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = |id: &str, seen: Arc<Mutex<Vec<Option<String>>>>| {
            NodeDefinition::from_fn(id, NodeType::Custom, move |ctx| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(ctx.model.clone());
                    Ok(NodeResult::new())
                }
            })
        };

        let graph = GraphBuilder::new()
            .start(record("a", seen.clone()).with_model("node-model"))
            .then(record("b", seen.clone()))
            .compile(GraphConfig::default().with_default_model("graph-model"))
            .unwrap();
        let executor = GraphExecutor::new(graph);

        executor.execute().await.unwrap();
        executor
            .execute_with(ExecutionOptions::new().with_parent_model(Some("parent-model".into())))
            .await
            .unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                Some("node-model".to_string()),
                Some("graph-model".to_string()),
                Some("node-model".to_string()),
                Some("parent-model".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_execution() {
        use std::sync::atomic::AtomicBool;

        let cancel = CancellationToken::new();
        let cleaned_up = Arc::new(AtomicBool::new(false));
        let flag = cleaned_up.clone();
        let graph = GraphBuilder::new()
            .start(NodeDefinition::from_fn("slow", NodeType::Custom, move |ctx| {
                let flag = flag.clone();
                async move {
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => {
                            flag.store(true, Ordering::SeqCst);
                            Err(NodeError::Cancelled)
                        }
                        _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(NodeResult::new()),
                    }
                }
            }))
            .then(incrementer("after"))
            .compile(GraphConfig::default())
            .unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = GraphExecutor::new(graph)
            .execute_with(ExecutionOptions::new().with_cancel(cancel))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
        // The node ran to its own cancellation branch instead of being dropped
        assert!(cleaned_up.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_after_success_stops_before_next_node() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let graph = GraphBuilder::new()
            .start(NodeDefinition::from_fn("first", NodeType::Custom, move |_| {
                let trigger = trigger.clone();
                async move {
                    trigger.cancel();
                    Ok(NodeResult::update(StateUpdate::new().set("counter", 1)))
                }
            }))
            .then(incrementer("second"))
            .compile(GraphConfig::default())
            .unwrap();

        let mut steps =
            GraphExecutor::new(graph).stream_with(ExecutionOptions::new().with_cancel(cancel));
        let first = steps.try_next().await.unwrap().unwrap();
        assert_eq!(first.node_id, "first");
        assert!(matches!(steps.try_next().await, Err(ExecutionError::Cancelled)));
    }

    #[tokio::test]
    async fn test_checkpoint_written_after_each_step() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let graph = GraphBuilder::new()
            .start(incrementer("a"))
            .then(incrementer("b"))
            .compile(GraphConfig::default().with_checkpoint_store(store.clone()))
            .unwrap();

        let result = GraphExecutor::new(graph).execute().await.unwrap();
        let checkpoints = store.list(&result.execution_id).await.unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].pending, vec!["b"]);
        assert!(checkpoints[1].pending.is_empty());
    }

    #[tokio::test]
    async fn test_events_and_context_usage_flow_through() {
        let graph = GraphBuilder::new()
            .start(NodeDefinition::from_fn("emit", NodeType::Custom, |ctx| async move {
                ctx.emit("progress", json!({"pct": 50}));
                ctx.report_context_usage(ContextUsage {
                    input_tokens: 70,
                    output_tokens: 0,
                    max_tokens: 100,
                });
                Ok(NodeResult::new())
            }))
            .then(NodeDefinition::from_fn("read", NodeType::Custom, |ctx| async move {
                let pct = ctx.context_usage.map(|u| u.percentage()).unwrap_or(0.0);
                Ok(NodeResult::update(StateUpdate::new().set("pct", pct)))
            }))
            .compile(GraphConfig::default())
            .unwrap();

        let result = GraphExecutor::new(graph).execute().await.unwrap();
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].event_type, "progress");
        assert_eq!(result.state.get_f64("pct"), Some(70.0));
    }

    #[tokio::test]
    async fn test_progress_hook_sees_lifecycle() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let graph = GraphBuilder::new()
            .start(noop("a"))
            .compile(GraphConfig::default().with_progress_hook(Arc::new(move |e: &ProgressEvent| {
                sink.lock().unwrap().push(e.clone());
            })))
            .unwrap();

        GraphExecutor::new(graph).execute().await.unwrap();
        let events = events.lock().unwrap();
        assert!(matches!(events[0], ProgressEvent::NodeStarted { step: 1, .. }));
        assert!(matches!(events[1], ProgressEvent::NodeCompleted { .. }));
    }
}
