// SPDX-License-Identifier: MIT

//! Graph builder - fluent construction of workflow graphs
//!
//! The builder keeps a cursor of "tails": the nodes the next `then()` will
//! attach to, each with the predicate its outgoing edge must carry. Control
//! flow helpers (`if_`, `loop_`, `parallel`, `wait`) move that cursor and
//! add the structural nodes they need. Mistakes are recorded as they happen
//! and the first one is returned by [`GraphBuilder::compile`].

use std::collections::HashSet;
use std::mem;
use std::sync::Arc;

use crate::adk::error::{BuilderError, NodeError};
use crate::tandem::workflow::nodes::{parallel_node, wait_node, ParallelConfig, WaitConfig};
use crate::tandem::workflow::state::{AnnotationRoot, GraphState, StateUpdate};

use super::types::{
    negate, predicate, CompiledGraph, Edge, ErrorAction, ErrorHandler, GraphConfig, LoopScope,
    NodeDefinition, NodeId, NodeResult, NodeType, Predicate,
};

/// Iteration cap used when a loop does not set one
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Loop settings for [`GraphBuilder::loop_`]
#[derive(Clone)]
pub struct LoopConfig {
    /// Exit once this holds after an iteration
    pub until: Predicate,
    pub max_iterations: usize,
}

impl LoopConfig {
    pub fn until<F>(until: F) -> Self
    where
        F: Fn(&GraphState) -> bool + Send + Sync + 'static,
    {
        Self {
            until: predicate(until),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

/// Attachment point for the next node
#[derive(Clone)]
struct Tail {
    node: NodeId,
    condition: Option<Predicate>,
}

impl Tail {
    fn plain(node: impl Into<NodeId>) -> Self {
        Self {
            node: node.into(),
            condition: None,
        }
    }
}

/// An open `if_` block
struct ConditionalFrame {
    decision: NodeId,
    condition: Predicate,
    /// Tails of the then-branch, set once `else_` is seen
    then_tails: Option<Vec<Tail>>,
}

/// Fluent graph builder
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<NodeDefinition>,
    ids: HashSet<NodeId>,
    edges: Vec<Edge>,
    start: Option<NodeId>,
    tails: Vec<Tail>,
    frames: Vec<ConditionalFrame>,
    loops: Vec<LoopScope>,
    terminals: HashSet<NodeId>,
    error_handler: Option<ErrorHandler>,
    schema: Option<Arc<AnnotationRoot>>,
    counter: usize,
    error: Option<BuilderError>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// State schema used to seed and merge state
    pub fn with_schema(mut self, schema: AnnotationRoot) -> Self {
        self.schema = Some(Arc::new(schema));
        self
    }

    /// Set the entry node
    pub fn start(mut self, node: NodeDefinition) -> Self {
        if let Some(existing) = &self.start {
            let err = BuilderError::StartAlreadyDefined(existing.clone());
            self.fail(err);
            return self;
        }
        let id = node.id.clone();
        if self.push_node(node) {
            self.start = Some(id.clone());
            self.tails = vec![Tail::plain(id)];
        }
        self
    }

    /// Append a node after the current tails
    pub fn then(mut self, node: NodeDefinition) -> Self {
        if !self.require_start("then") {
            return self;
        }
        let id = node.id.clone();
        if self.push_node(node) {
            let tails = mem::take(&mut self.tails);
            self.connect(tails, &id);
            self.tails = vec![Tail::plain(id)];
        }
        self
    }

    /// Open a conditional block; following nodes run only when `condition` holds
    pub fn if_<F>(mut self, condition: F) -> Self
    where
        F: Fn(&GraphState) -> bool + Send + Sync + 'static,
    {
        if !self.require_start("if_") {
            return self;
        }
        let decision = self.next_id("if");
        self.push_node(NodeDefinition::passthrough(&decision, NodeType::Decision));
        let tails = mem::take(&mut self.tails);
        self.connect(tails, &decision);

        let condition = predicate(condition);
        self.tails = vec![Tail {
            node: decision.clone(),
            condition: Some(condition.clone()),
        }];
        self.frames.push(ConditionalFrame {
            decision,
            condition,
            then_tails: None,
        });
        self
    }

    /// Switch to the branch taken when the open `if_` condition fails
    pub fn else_(mut self) -> Self {
        let Some(frame) = self.frames.last_mut() else {
            self.fail(BuilderError::UnmatchedElse);
            return self;
        };
        if frame.then_tails.is_some() {
            self.fail(BuilderError::DuplicateElse);
            return self;
        }
        frame.then_tails = Some(mem::take(&mut self.tails));
        self.tails = vec![Tail {
            node: frame.decision.clone(),
            condition: Some(negate(&frame.condition)),
        }];
        self
    }

    /// Close the open `if_` block with a merge node joining both branches
    pub fn end_if(mut self) -> Self {
        let Some(frame) = self.frames.pop() else {
            self.fail(BuilderError::UnmatchedEndIf);
            return self;
        };

        let current = mem::take(&mut self.tails);
        let incoming = match frame.then_tails {
            Some(mut then_tails) => {
                then_tails.extend(current);
                then_tails
            }
            // No else: a failed condition goes straight to the merge node
            None => {
                let mut incoming = current;
                incoming.push(Tail {
                    node: frame.decision.clone(),
                    condition: Some(negate(&frame.condition)),
                });
                incoming
            }
        };

        let merge = self.next_id("merge");
        self.push_node(NodeDefinition::passthrough(&merge, NodeType::Passthrough));
        self.connect(incoming, &merge);
        self.tails = vec![Tail::plain(merge)];
        self
    }

    /// Run `body` in order until `config.until` holds or the cap is reached
    ///
    /// Adds a loop entry node (resets the iteration counter), the chained
    /// body, and a check node with a back-edge to the first body node.
    pub fn loop_(mut self, body: Vec<NodeDefinition>, config: LoopConfig) -> Self {
        if !self.require_start("loop_") {
            return self;
        }
        if body.is_empty() {
            self.fail(BuilderError::EmptyLoopBody);
            return self;
        }

        let n = self.bump();
        let entry = self.unique_id(&format!("loop_start_{}", n));
        let check = self.unique_id(&format!("loop_check_{}", n));
        let counter = format!("__loop_{}", n);
        let max_iterations = config.max_iterations.max(1);

        self.push_node(loop_entry_node(&entry, counter.clone()));
        let tails = mem::take(&mut self.tails);
        self.connect(tails, &entry);

        let body_ids: Vec<NodeId> = body.iter().map(|node| node.id.clone()).collect();
        let mut previous = entry.clone();
        for node in body {
            let id = node.id.clone();
            if !self.push_node(node) {
                return self;
            }
            self.edges.push(Edge::new(&previous, &id));
            previous = id;
        }

        self.push_node(loop_check_node(&check, counter.clone()));
        self.edges.push(Edge::new(&previous, &check));

        let until = config.until;
        let exit: Predicate = Arc::new(move |state: &GraphState| {
            let iterations = state.get_i64(&counter).unwrap_or(0).max(0) as usize;
            iterations >= max_iterations || until(state)
        });
        self.edges.push(
            Edge::new(&check, &body_ids[0])
                .when(negate(&exit))
                .labeled("continue"),
        );

        self.loops.push(LoopScope {
            entry,
            check: check.clone(),
            body: body_ids,
            max_iterations,
        });
        self.tails = vec![Tail {
            node: check,
            condition: Some(exit),
        }];
        self
    }

    /// Fan out into concurrent branches as a single step
    pub fn parallel(mut self, config: ParallelConfig) -> Self {
        if !self.require_start("parallel") {
            return self;
        }
        let id = self.next_id("parallel");
        if config.branches.is_empty() {
            self.fail(BuilderError::EmptyParallel(id));
            return self;
        }
        self.then(parallel_node(id, config))
    }

    /// Pause point that asks a human for input
    pub fn wait(mut self, prompt: impl Into<String>) -> Self {
        if !self.require_start("wait") {
            return self;
        }
        let id = self.next_id("wait");
        self.then(wait_node(id, WaitConfig::new(prompt)))
    }

    /// Install the graph-level error handler (replaces any previous one)
    pub fn catch<F>(mut self, handler: F) -> Self
    where
        F: Fn(&NodeError, &str, &GraphState) -> ErrorAction + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Mark the current path as finished
    pub fn end(mut self) -> Self {
        if !self.require_start("end") {
            return self;
        }
        for id in self.sink_tails() {
            self.terminals.insert(id);
        }
        self
    }

    /// Add a node without wiring it
    pub fn add_node(mut self, node: NodeDefinition) -> Self {
        self.push_node(node);
        self
    }

    pub fn add_edge(mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        self.edges.push(Edge::new(from, to));
        self
    }

    pub fn add_conditional_edge<F>(
        mut self,
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        condition: F,
    ) -> Self
    where
        F: Fn(&GraphState) -> bool + Send + Sync + 'static,
    {
        self.edges.push(Edge::new(from, to).when(predicate(condition)));
        self
    }

    /// Validate and freeze the graph
    pub fn compile(mut self, config: GraphConfig) -> Result<CompiledGraph, BuilderError> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        let Some(start) = self.start.clone() else {
            return Err(BuilderError::MissingStartNode);
        };
        if !self.frames.is_empty() {
            return Err(BuilderError::UnclosedConditional(self.frames.len()));
        }

        // A path left open after a loop or branch still needs somewhere to exit
        self.sink_tails();

        for edge in &self.edges {
            if !self.ids.contains(&edge.source) || !self.ids.contains(&edge.target) {
                return Err(BuilderError::DanglingEdge {
                    from: edge.source.clone(),
                    to: edge.target.clone(),
                });
            }
        }

        let sources: HashSet<&NodeId> = self.edges.iter().map(|e| &e.source).collect();
        let mut terminals = mem::take(&mut self.terminals);
        terminals.extend(
            self.ids
                .iter()
                .filter(|id| !sources.contains(id))
                .cloned(),
        );
        if terminals.is_empty() {
            return Err(BuilderError::NoTerminalNode);
        }

        log::debug!(
            "Compiled graph: {} nodes, {} edges, start '{}', terminals {:?}",
            self.nodes.len(),
            self.edges.len(),
            start,
            terminals
        );

        Ok(CompiledGraph {
            nodes: self
                .nodes
                .into_iter()
                .map(|node| (node.id.clone(), node))
                .collect(),
            edges: self.edges,
            start,
            terminals,
            loops: self.loops,
            schema: self.schema,
            error_handler: self.error_handler,
            config,
        })
    }

    fn fail(&mut self, err: BuilderError) {
        log::debug!("Graph builder error: {}", err);
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn require_start(&mut self, op: &'static str) -> bool {
        if self.start.is_none() {
            self.fail(BuilderError::NoStart(op));
            return false;
        }
        true
    }

    fn push_node(&mut self, node: NodeDefinition) -> bool {
        if !self.ids.insert(node.id.clone()) {
            self.fail(BuilderError::DuplicateNode(node.id));
            return false;
        }
        self.nodes.push(node);
        true
    }

    fn connect(&mut self, tails: Vec<Tail>, target: &str) {
        for tail in tails {
            let edge = Edge::new(tail.node, target);
            self.edges.push(match tail.condition {
                Some(condition) => edge.when(condition),
                None => edge,
            });
        }
    }

    /// Close the cursor; conditional tails are routed into a fresh exit node
    fn sink_tails(&mut self) -> Vec<NodeId> {
        let tails = mem::take(&mut self.tails);
        if tails.iter().all(|t| t.condition.is_none()) {
            return tails.into_iter().map(|t| t.node).collect();
        }
        let exit = self.next_id("end");
        self.push_node(NodeDefinition::passthrough(&exit, NodeType::Passthrough));
        self.connect(tails, &exit);
        vec![exit]
    }

    fn bump(&mut self) -> usize {
        self.counter += 1;
        self.counter
    }

    fn next_id(&mut self, prefix: &str) -> NodeId {
        let n = self.bump();
        self.unique_id(&format!("{}_{}", prefix, n))
    }

    fn unique_id(&self, base: &str) -> NodeId {
        let mut id = base.to_string();
        while self.ids.contains(&id) {
            id.push('_');
        }
        id
    }
}

fn loop_entry_node(id: &str, counter: String) -> NodeDefinition {
    NodeDefinition::from_fn(id, NodeType::Loop, move |_ctx| {
        let counter = counter.clone();
        async move { Ok(NodeResult::update(StateUpdate::new().set(counter, 0))) }
    })
}

fn loop_check_node(id: &str, counter: String) -> NodeDefinition {
    NodeDefinition::from_fn(id, NodeType::Loop, move |ctx| {
        let counter = counter.clone();
        async move {
            let iterations = ctx.state().get_i64(&counter).unwrap_or(0);
            Ok(NodeResult::update(
                StateUpdate::new().set(counter, iterations + 1),
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeDefinition {
        NodeDefinition::passthrough(id, NodeType::Custom)
    }

    fn targets(graph: &CompiledGraph, from: &str) -> Vec<String> {
        graph.outgoing(from).map(|e| e.target.clone()).collect()
    }

    #[test]
    fn test_sequential_graph() {
        let graph = GraphBuilder::new()
            .start(node("a"))
            .then(node("b"))
            .then(node("c"))
            .end()
            .compile(GraphConfig::default())
            .unwrap();

        assert_eq!(graph.start(), "a");
        assert_eq!(targets(&graph, "a"), vec!["b"]);
        assert_eq!(targets(&graph, "b"), vec!["c"]);
        assert!(graph.is_terminal("c"));
        assert!(!graph.is_terminal("a"));
    }

    #[test]
    fn test_then_before_start_fails_at_compile() {
        let err = GraphBuilder::new()
            .then(node("a"))
            .start(node("b"))
            .compile(GraphConfig::default())
            .unwrap_err();
        assert_eq!(err, BuilderError::NoStart("then"));
    }

    #[test]
    fn test_missing_start() {
        let err = GraphBuilder::new()
            .compile(GraphConfig::default())
            .unwrap_err();
        assert_eq!(err, BuilderError::MissingStartNode);
    }

    #[test]
    fn test_unmatched_else_and_end_if() {
        let err = GraphBuilder::new()
            .start(node("a"))
            .else_()
            .compile(GraphConfig::default())
            .unwrap_err();
        assert_eq!(err, BuilderError::UnmatchedElse);

        let err = GraphBuilder::new()
            .start(node("a"))
            .end_if()
            .compile(GraphConfig::default())
            .unwrap_err();
        assert_eq!(err, BuilderError::UnmatchedEndIf);
    }

    #[test]
    fn test_unclosed_conditional() {
        let err = GraphBuilder::new()
            .start(node("a"))
            .if_(|_| true)
            .then(node("b"))
            .compile(GraphConfig::default())
            .unwrap_err();
        assert_eq!(err, BuilderError::UnclosedConditional(1));
    }

    #[test]
    fn test_duplicate_node_id() {
        let err = GraphBuilder::new()
            .start(node("a"))
            .then(node("a"))
            .compile(GraphConfig::default())
            .unwrap_err();
        assert_eq!(err, BuilderError::DuplicateNode("a".into()));
    }

    #[test]
    fn test_dangling_edge() {
        let err = GraphBuilder::new()
            .start(node("a"))
            .add_edge("a", "ghost")
            .compile(GraphConfig::default())
            .unwrap_err();
        assert!(matches!(err, BuilderError::DanglingEdge { .. }));
    }

    #[test]
    fn test_if_else_creates_merge_node() {
        let graph = GraphBuilder::new()
            .start(node("a"))
            .if_(|s| s.get_bool("flag") == Some(true))
            .then(node("yes"))
            .else_()
            .then(node("no"))
            .end_if()
            .then(node("done"))
            .compile(GraphConfig::default())
            .unwrap();

        let decision = &targets(&graph, "a")[0];
        assert!(decision.starts_with("if_"));
        assert_eq!(graph.node(decision).unwrap().node_type, NodeType::Decision);

        let branch_targets = targets(&graph, decision);
        assert_eq!(branch_targets, vec!["yes", "no"]);

        let flag_on = GraphState::new().with_field("flag", true);
        let eligible: Vec<_> = graph
            .outgoing(decision)
            .filter(|e| e.is_eligible(&flag_on))
            .map(|e| e.target.as_str())
            .collect();
        assert_eq!(eligible, vec!["yes"]);

        let merge = &targets(&graph, "yes")[0];
        assert!(merge.starts_with("merge_"));
        assert_eq!(&targets(&graph, "no")[0], merge);
        assert_eq!(targets(&graph, merge), vec!["done"]);
    }

    #[test]
    fn test_if_without_else_joins_decision_to_merge() {
        let graph = GraphBuilder::new()
            .start(node("a"))
            .if_(|s| s.get_bool("flag") == Some(true))
            .then(node("yes"))
            .end_if()
            .compile(GraphConfig::default())
            .unwrap();

        let decision = &targets(&graph, "a")[0];
        let out = targets(&graph, decision);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], "yes");
        assert!(out[1].starts_with("merge_"));

        let flag_off = GraphState::new();
        let eligible: Vec<_> = graph
            .outgoing(decision)
            .filter(|e| e.is_eligible(&flag_off))
            .map(|e| e.target.clone())
            .collect();
        assert_eq!(eligible, vec![out[1].clone()]);
    }

    #[test]
    fn test_nested_conditionals() {
        let graph = GraphBuilder::new()
            .start(node("a"))
            .if_(|_| true)
            .if_(|_| true)
            .then(node("inner"))
            .end_if()
            .else_()
            .then(node("outer_else"))
            .end_if()
            .end()
            .compile(GraphConfig::default())
            .unwrap();

        let merges = graph
            .node_ids()
            .filter(|id| id.starts_with("merge_"))
            .count();
        assert_eq!(merges, 2);
    }

    #[test]
    fn test_loop_structure() {
        let graph = GraphBuilder::new()
            .start(node("a"))
            .loop_(
                vec![node("work"), node("review")],
                LoopConfig::until(|s| s.get_bool("done") == Some(true)).with_max_iterations(3),
            )
            .then(node("after"))
            .compile(GraphConfig::default())
            .unwrap();

        let scope = &graph.loops()[0];
        assert_eq!(scope.body, vec!["work", "review"]);
        assert_eq!(scope.max_iterations, 3);
        assert_eq!(targets(&graph, &scope.entry), vec!["work"]);
        assert_eq!(targets(&graph, "review"), vec![scope.check.clone()]);
        assert_eq!(targets(&graph, &scope.check), vec!["work", "after"]);

        // iteration counter lives in state
        let counter = format!("__loop_{}", &scope.entry["loop_start_".len()..]);
        let mid = GraphState::new().with_field(counter.as_str(), 1);
        let capped = GraphState::new().with_field(counter.as_str(), 3);
        let next = |s: &GraphState| -> Vec<String> {
            graph
                .outgoing(&scope.check)
                .filter(|e| e.is_eligible(s))
                .map(|e| e.target.clone())
                .collect()
        };
        assert_eq!(next(&mid), vec!["work"]);
        assert_eq!(next(&capped), vec!["after"]);
    }

    #[test]
    fn test_empty_loop_body() {
        let err = GraphBuilder::new()
            .start(node("a"))
            .loop_(vec![], LoopConfig::until(|_| true))
            .compile(GraphConfig::default())
            .unwrap_err();
        assert_eq!(err, BuilderError::EmptyLoopBody);
    }

    #[test]
    fn test_trailing_loop_gets_exit_node() {
        let graph = GraphBuilder::new()
            .start(node("a"))
            .loop_(vec![node("body")], LoopConfig::until(|_| true))
            .compile(GraphConfig::default())
            .unwrap();

        let exit: Vec<_> = graph
            .terminals()
            .iter()
            .filter(|id| id.starts_with("end_"))
            .collect();
        assert_eq!(exit.len(), 1);
    }

    #[test]
    fn test_first_error_wins() {
        let err = GraphBuilder::new()
            .else_()
            .end_if()
            .compile(GraphConfig::default())
            .unwrap_err();
        assert_eq!(err, BuilderError::UnmatchedElse);
    }

    #[test]
    fn test_catch_installs_handler() {
        let graph = GraphBuilder::new()
            .start(node("a"))
            .catch(|_, _, _| ErrorAction::Skip)
            .compile(GraphConfig::default())
            .unwrap();
        assert!(graph.error_handler.is_some());
    }

    #[test]
    fn test_wait_and_parallel_nodes() {
        let graph = GraphBuilder::new()
            .start(node("a"))
            .wait("Approve the plan?")
            .parallel(ParallelConfig::new(vec![node("x"), node("y")]))
            .compile(GraphConfig::default())
            .unwrap();

        let wait = &targets(&graph, "a")[0];
        assert_eq!(graph.node(wait).unwrap().node_type, NodeType::Wait);
        let par = &targets(&graph, wait)[0];
        assert_eq!(graph.node(par).unwrap().node_type, NodeType::Parallel);
        assert!(graph.is_terminal(par));
    }

    #[test]
    fn test_empty_parallel() {
        let err = GraphBuilder::new()
            .start(node("a"))
            .parallel(ParallelConfig::new(vec![]))
            .compile(GraphConfig::default())
            .unwrap_err();
        assert!(matches!(err, BuilderError::EmptyParallel(_)));
    }
}
