// SPDX-License-Identifier: MIT

//! Graph workflow type definitions
//!
//! Value objects shared by the builder, the node library and the executor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::adk::error::NodeError;
use crate::adk::session::{ContextUsage, SessionProvider};
use crate::tandem::subagent::{SubagentLookup, SubagentSpawner};
use crate::tandem::workflow::state::{AnnotationRoot, GraphState, StateUpdate};

use super::checkpoint::CheckpointStore;

pub type NodeId = String;

/// Boolean test over state, used by edges, decisions and loops
pub type Predicate = Arc<dyn Fn(&GraphState) -> bool + Send + Sync>;

/// Wrap a closure as a [`Predicate`]
pub fn predicate<F>(f: F) -> Predicate
where
    F: Fn(&GraphState) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

pub(crate) fn negate(p: &Predicate) -> Predicate {
    let inner = Arc::clone(p);
    Arc::new(move |state| !inner(state))
}

/// Kind of a node
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Agent,
    Tool,
    Decision,
    Wait,
    AskUser,
    Parallel,
    Subgraph,
    Subagent,
    ParallelSubagent,
    ContextMonitor,
    /// Loop entry / check nodes created by the builder
    Loop,
    /// Structural no-op (branch merge points)
    Passthrough,
    Custom,
}

/// Retry policy for a node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier,
        }
    }

    /// Single attempt, no retry
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    /// Delay after failed attempt `attempt` (1-based): base × multiplier^(attempt−1)
    ///
    /// Saturates at [`Duration::MAX`]; a negative or NaN product means no delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Kind of out-of-band notification
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    ContextWindowWarning,
    ContextCompaction,
    HumanInputRequired,
}

/// A signal emitted by a node; does not alter control flow
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SignalData {
    pub kind: SignalKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl SignalData {
    pub fn new(kind: SignalKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Application event raised through [`ExecutionContext::emit`]
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct GraphEvent {
    pub node_id: NodeId,
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct EmitBuffer {
    events: Vec<GraphEvent>,
    context_usage: Option<ContextUsage>,
}

/// Shared sink behind the context's emit hook
#[derive(Debug, Clone, Default)]
pub(crate) struct Emitter {
    inner: Arc<Mutex<EmitBuffer>>,
}

impl Emitter {
    fn with_buffer<R>(&self, f: impl FnOnce(&mut EmitBuffer) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    /// Take everything emitted so far
    pub(crate) fn drain(&self) -> (Vec<GraphEvent>, Option<ContextUsage>) {
        self.with_buffer(|buf| (std::mem::take(&mut buf.events), buf.context_usage.take()))
    }
}

/// Everything a node sees during one execute call
#[derive(Clone)]
pub struct ExecutionContext {
    pub node_id: NodeId,
    pub state: Arc<GraphState>,
    /// Resolved model (node → parent subgraph → graph → platform default)
    pub model: Option<String>,
    /// Last known context-window usage
    pub context_usage: Option<ContextUsage>,
    /// Compaction threshold percentage from the graph config
    pub context_window_threshold: f64,
    pub runtime: RuntimeDependencies,
    pub cancel: CancellationToken,
    emitter: Emitter,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("node_id", &self.node_id)
            .field("model", &self.model)
            .field("context_usage", &self.context_usage)
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    /// Standalone context, mainly for driving a node outside an executor
    pub fn new(node_id: impl Into<NodeId>, state: Arc<GraphState>) -> Self {
        Self {
            node_id: node_id.into(),
            state,
            model: None,
            context_usage: None,
            context_window_threshold: DEFAULT_CONTEXT_WINDOW_THRESHOLD,
            runtime: RuntimeDependencies::default(),
            cancel: CancellationToken::new(),
            emitter: Emitter::default(),
        }
    }

    pub fn with_runtime(mut self, runtime: RuntimeDependencies) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_context_usage(mut self, usage: Option<ContextUsage>) -> Self {
        self.context_usage = usage;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Same context re-targeted at another node id (parallel branches)
    pub(crate) fn for_node(&self, node_id: impl Into<NodeId>) -> Self {
        let mut ctx = self.clone();
        ctx.node_id = node_id.into();
        ctx
    }

    pub fn state(&self) -> &GraphState {
        &self.state
    }

    /// Raise an application event (routed to the `events` stream mode)
    pub fn emit(&self, event_type: impl Into<String>, data: Value) {
        let event = GraphEvent {
            node_id: self.node_id.clone(),
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
        };
        self.emitter.with_buffer(|buf| buf.events.push(event));
    }

    /// Report fresh context-window usage for later nodes
    pub fn report_context_usage(&self, usage: ContextUsage) {
        self.emitter
            .with_buffer(|buf| buf.context_usage = Some(usage));
    }

    /// Events emitted through this context so far (not drained)
    pub fn emitted_events(&self) -> Vec<GraphEvent> {
        self.emitter.with_buffer(|buf| buf.events.clone())
    }
}

/// Outcome of one node execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeResult {
    pub state_update: StateUpdate,
    /// Raw result recorded under `outputs[node_id]`; defaults to the update
    pub output: Option<Value>,
    pub signals: Vec<SignalData>,
    /// Explicit next nodes, bypassing edge evaluation
    pub goto: Vec<NodeId>,
}

impl NodeResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(state_update: StateUpdate) -> Self {
        Self {
            state_update,
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_signal(mut self, signal: SignalData) -> Self {
        self.signals.push(signal);
        self
    }

    pub fn with_goto(mut self, target: impl Into<NodeId>) -> Self {
        self.goto.push(target.into());
        self
    }
}

/// Execute contract of a node
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeResult, NodeError>;
}

/// Adapter turning an async closure into a [`NodeExecutor`]
pub struct FnExecutor<F>(pub F);

#[async_trait]
impl<F, Fut> NodeExecutor for FnExecutor<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NodeResult, NodeError>> + Send + 'static,
{
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeResult, NodeError> {
        (self.0)(ctx).await
    }
}

/// A node in the workflow graph
#[derive(Clone)]
pub struct NodeDefinition {
    pub id: NodeId,
    pub node_type: NodeType,
    pub description: Option<String>,
    pub retry: Option<RetryConfig>,
    /// Model override for this node
    pub model: Option<String>,
    executor: Arc<dyn NodeExecutor>,
}

impl fmt::Debug for NodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDefinition")
            .field("id", &self.id)
            .field("node_type", &self.node_type)
            .field("retry", &self.retry)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl NodeDefinition {
    pub fn new(
        id: impl Into<NodeId>,
        node_type: NodeType,
        executor: impl NodeExecutor + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            node_type,
            description: None,
            retry: None,
            model: None,
            executor: Arc::new(executor),
        }
    }

    /// Node backed by an async closure
    pub fn from_fn<F, Fut>(id: impl Into<NodeId>, node_type: NodeType, f: F) -> Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NodeResult, NodeError>> + Send + 'static,
    {
        Self::new(id, node_type, FnExecutor(f))
    }

    /// Node that does nothing
    pub fn passthrough(id: impl Into<NodeId>, node_type: NodeType) -> Self {
        Self::from_fn(id, node_type, |_ctx| async { Ok(NodeResult::new()) })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub async fn execute(&self, ctx: ExecutionContext) -> Result<NodeResult, NodeError> {
        self.executor.execute(ctx).await
    }
}

/// Directed, optionally predicated connection between two nodes
#[derive(Clone)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub condition: Option<Predicate>,
    pub label: Option<String>,
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("conditional", &self.condition.is_some())
            .field("label", &self.label)
            .finish()
    }
}

impl Edge {
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: None,
            label: None,
        }
    }

    pub fn when(mut self, condition: Predicate) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn is_eligible(&self, state: &GraphState) -> bool {
        self.condition.as_ref().map_or(true, |c| c(state))
    }
}

/// What to do once a node has exhausted its retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAction {
    /// Run the node again from scratch
    Retry,
    /// Leave state unchanged and follow the node's edges
    Skip,
    /// Fail the execution with the node's error
    Abort,
    /// Continue at another node (its visit counter is reset)
    Goto(NodeId),
}

/// Graph-level handler installed with `catch()`
pub type ErrorHandler = Arc<dyn Fn(&NodeError, &str, &GraphState) -> ErrorAction + Send + Sync>;

/// Resolves nested workflows by name
pub trait WorkflowResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<CompiledGraph>>;
}

impl WorkflowResolver for HashMap<String, Arc<CompiledGraph>> {
    fn resolve(&self, name: &str) -> Option<Arc<CompiledGraph>> {
        self.get(name).cloned()
    }
}

/// Runtime dependencies injected into a compiled graph
#[derive(Clone, Default)]
pub struct RuntimeDependencies {
    pub session_provider: Option<Arc<dyn SessionProvider>>,
    pub workflow_resolver: Option<Arc<dyn WorkflowResolver>>,
    pub subagent_bridge: Option<Arc<dyn SubagentSpawner>>,
    pub subagent_registry: Option<Arc<dyn SubagentLookup>>,
}

impl fmt::Debug for RuntimeDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeDependencies")
            .field("session_provider", &self.session_provider.is_some())
            .field("workflow_resolver", &self.workflow_resolver.is_some())
            .field("subagent_bridge", &self.subagent_bridge.is_some())
            .field("subagent_registry", &self.subagent_registry.is_some())
            .finish()
    }
}

impl RuntimeDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_provider(mut self, provider: Arc<dyn SessionProvider>) -> Self {
        self.session_provider = Some(provider);
        self
    }

    pub fn with_workflow_resolver(mut self, resolver: Arc<dyn WorkflowResolver>) -> Self {
        self.workflow_resolver = Some(resolver);
        self
    }

    pub fn with_subagent_bridge(mut self, bridge: Arc<dyn SubagentSpawner>) -> Self {
        self.subagent_bridge = Some(bridge);
        self
    }

    pub fn with_subagent_registry(mut self, registry: Arc<dyn SubagentLookup>) -> Self {
        self.subagent_registry = Some(registry);
        self
    }

    /// Fill unset dependencies from `fallback`
    pub fn or(&self, fallback: &RuntimeDependencies) -> RuntimeDependencies {
        RuntimeDependencies {
            session_provider: self
                .session_provider
                .clone()
                .or_else(|| fallback.session_provider.clone()),
            workflow_resolver: self
                .workflow_resolver
                .clone()
                .or_else(|| fallback.workflow_resolver.clone()),
            subagent_bridge: self
                .subagent_bridge
                .clone()
                .or_else(|| fallback.subagent_bridge.clone()),
            subagent_registry: self
                .subagent_registry
                .clone()
                .or_else(|| fallback.subagent_registry.clone()),
        }
    }
}

/// Lifecycle notifications for an optional telemetry hook
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    NodeStarted { node_id: NodeId, step: usize },
    NodeRetrying { node_id: NodeId, attempt: u32, error: String },
    NodeCompleted { node_id: NodeId, step: usize, duration: Duration },
    NodeFailed { node_id: NodeId, error: String },
}

pub type ProgressHook = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

pub const DEFAULT_MAX_STEPS: usize = 1000;
pub const DEFAULT_MAX_NODE_VISITS: usize = 100;
pub const DEFAULT_CONTEXT_WINDOW_THRESHOLD: f64 = 60.0;

/// Resolved execution settings of a compiled graph
#[derive(Clone)]
pub struct GraphConfig {
    pub max_steps: usize,
    /// Safety bound on visits per node outside loop scopes
    pub max_node_visits: usize,
    pub context_window_threshold: f64,
    pub default_model: Option<String>,
    pub default_retry: RetryConfig,
    pub checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    pub on_progress: Option<ProgressHook>,
    pub runtime: RuntimeDependencies,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_node_visits: DEFAULT_MAX_NODE_VISITS,
            context_window_threshold: DEFAULT_CONTEXT_WINDOW_THRESHOLD,
            default_model: None,
            default_retry: RetryConfig::default(),
            checkpoint_store: None,
            on_progress: None,
            runtime: RuntimeDependencies::default(),
        }
    }
}

impl fmt::Debug for GraphConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphConfig")
            .field("max_steps", &self.max_steps)
            .field("max_node_visits", &self.max_node_visits)
            .field("context_window_threshold", &self.context_window_threshold)
            .field("default_model", &self.default_model)
            .field("default_retry", &self.default_retry)
            .field("checkpointing", &self.checkpoint_store.is_some())
            .field("runtime", &self.runtime)
            .finish()
    }
}

impl GraphConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_node_visits(mut self, max_node_visits: usize) -> Self {
        self.max_node_visits = max_node_visits;
        self
    }

    pub fn with_context_window_threshold(mut self, threshold: f64) -> Self {
        self.context_window_threshold = threshold;
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_default_retry(mut self, retry: RetryConfig) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn with_progress_hook(mut self, hook: ProgressHook) -> Self {
        self.on_progress = Some(hook);
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeDependencies) -> Self {
        self.runtime = runtime;
        self
    }
}

/// A loop created by the builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopScope {
    pub entry: NodeId,
    pub check: NodeId,
    pub body: Vec<NodeId>,
    pub max_iterations: usize,
}

impl LoopScope {
    /// Body and check nodes, whose visit counters reset on loop entry
    pub fn members(&self) -> impl Iterator<Item = &NodeId> {
        self.body.iter().chain(std::iter::once(&self.check))
    }
}

/// Immutable, validated graph ready for execution
#[derive(Clone)]
pub struct CompiledGraph {
    pub(crate) nodes: HashMap<NodeId, NodeDefinition>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) start: NodeId,
    pub(crate) terminals: HashSet<NodeId>,
    pub(crate) loops: Vec<LoopScope>,
    pub(crate) schema: Option<Arc<AnnotationRoot>>,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) config: GraphConfig,
}

impl fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.nodes.keys().collect();
        ids.sort();
        f.debug_struct("CompiledGraph")
            .field("start", &self.start)
            .field("nodes", &ids)
            .field("edges", &self.edges)
            .field("terminals", &self.terminals)
            .field("config", &self.config)
            .finish()
    }
}

impl CompiledGraph {
    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.get(id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Edges leaving `id`, in insertion order
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }

    pub fn is_terminal(&self, id: &str) -> bool {
        self.terminals.contains(id)
    }

    pub fn terminals(&self) -> &HashSet<NodeId> {
        &self.terminals
    }

    pub fn loops(&self) -> &[LoopScope] {
        &self.loops
    }

    pub fn schema(&self) -> Option<&AnnotationRoot> {
        self.schema.as_deref()
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Initial state: schema defaults, or an empty state
    pub fn initial_state(&self) -> GraphState {
        match &self.schema {
            Some(schema) => GraphState::from_schema(schema),
            None => GraphState::new(),
        }
    }

    /// Copy of this graph with different runtime dependencies
    pub fn with_runtime(&self, runtime: RuntimeDependencies) -> CompiledGraph {
        let mut graph = self.clone();
        graph.config.runtime = runtime;
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retry_delay_is_exponential() {
        let retry = RetryConfig::new(4, Duration::from_millis(100), 2.0);
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_delay_saturates_instead_of_overflowing() {
        let huge = RetryConfig::new(5, Duration::from_secs(1), 1e300);
        assert_eq!(huge.delay_for(4), Duration::MAX);
        assert_eq!(huge.delay_for(u32::MAX), Duration::MAX);

        let infinite = RetryConfig::new(5, Duration::from_millis(10), f64::INFINITY);
        assert_eq!(infinite.delay_for(1), Duration::from_millis(10));
        assert_eq!(infinite.delay_for(2), Duration::MAX);

        let nan = RetryConfig::new(5, Duration::from_millis(10), f64::NAN);
        assert_eq!(nan.delay_for(2), Duration::ZERO);
        let negative = RetryConfig::new(5, Duration::from_millis(10), -3.0);
        assert_eq!(negative.delay_for(2), Duration::ZERO);
    }

    #[test]
    fn test_retry_config_clamps_attempts() {
        assert_eq!(RetryConfig::new(0, Duration::ZERO, 1.0).max_attempts, 1);
        assert_eq!(RetryConfig::none().max_attempts, 1);
    }

    #[test]
    fn test_edge_eligibility() {
        let state = GraphState::new().with_field("ready", true);
        assert!(Edge::new("a", "b").is_eligible(&state));

        let edge = Edge::new("a", "b").when(predicate(|s| s.get_bool("ready") == Some(true)));
        assert!(edge.is_eligible(&state));
        assert!(!negate(edge.condition.as_ref().unwrap())(&state));
    }

    #[tokio::test]
    async fn test_context_emit_collects_events() {
        let ctx = ExecutionContext::new("n1", Arc::new(GraphState::new()));
        let branch = ctx.for_node("n1.branch");
        ctx.emit("progress", json!({"pct": 10}));
        branch.emit("progress", json!({"pct": 20}));

        let events = ctx.emitted_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].node_id, "n1.branch");
    }

    #[tokio::test]
    async fn test_node_from_fn_executes() {
        let node = NodeDefinition::from_fn("inc", NodeType::Custom, |ctx| async move {
            let n = ctx.state().get_i64("n").unwrap_or(0);
            Ok(NodeResult::update(StateUpdate::new().set("n", n + 1)))
        });
        let ctx = ExecutionContext::new("inc", Arc::new(GraphState::new().with_field("n", 4)));
        let result = node.execute(ctx).await.unwrap();
        assert_eq!(result.state_update.get("n"), Some(&json!(5)));
    }

    #[test]
    fn test_runtime_or_fills_missing() {
        let resolver: Arc<dyn WorkflowResolver> = Arc::new(HashMap::<String, Arc<CompiledGraph>>::new());
        let parent = RuntimeDependencies::new().with_workflow_resolver(resolver);
        let merged = RuntimeDependencies::new().or(&parent);
        assert!(merged.workflow_resolver.is_some());
        assert!(merged.session_provider.is_none());
    }
}
