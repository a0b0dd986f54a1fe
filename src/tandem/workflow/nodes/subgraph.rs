// SPDX-License-Identifier: MIT

//! Nested-subgraph node
//!
//! By default the child starts from a copy of the parent's fields and hands
//! back only what its own steps contributed, so the parent's reducers never
//! see the seeded values a second time.

use async_trait::async_trait;
use serde_json::{json, Map};
use std::sync::Arc;

use crate::adk::error::{ExecutionError, NodeError};
use crate::tandem::workflow::graph::{
    CompiledGraph, ExecutionContext, ExecutionOptions, GraphExecutor, NodeDefinition,
    NodeExecutor, NodeId, NodeResult, NodeType, RetryConfig,
};
use crate::tandem::workflow::state::{AnnotationRoot, GraphState, StateUpdate};

/// Projects one state into an update for another
pub type StateMapper = Arc<dyn Fn(&GraphState) -> StateUpdate + Send + Sync>;

/// Where the child graph comes from
#[derive(Clone)]
pub enum SubgraphSource {
    Graph(Arc<CompiledGraph>),
    /// Resolved at execution time through the workflow resolver
    Named(String),
}

/// Settings for [`subgraph_node`]
#[derive(Clone)]
pub struct SubgraphConfig {
    pub source: SubgraphSource,
    /// Parent state to child input; defaults to copying every parent field
    pub input: Option<StateMapper>,
    /// Final child state to parent update; defaults to the child's own
    /// step updates combined through the child schema
    pub output: Option<StateMapper>,
    pub model: Option<String>,
    pub retry: Option<RetryConfig>,
}

impl SubgraphConfig {
    fn with_source(source: SubgraphSource) -> Self {
        Self {
            source,
            input: None,
            output: None,
            model: None,
            retry: None,
        }
    }

    pub fn graph(graph: impl Into<Arc<CompiledGraph>>) -> Self {
        Self::with_source(SubgraphSource::Graph(graph.into()))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::with_source(SubgraphSource::Named(name.into()))
    }

    pub fn with_input_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&GraphState) -> StateUpdate + Send + Sync + 'static,
    {
        self.input = Some(Arc::new(mapper));
        self
    }

    pub fn with_output_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&GraphState) -> StateUpdate + Send + Sync + 'static,
    {
        self.output = Some(Arc::new(mapper));
        self
    }

    /// Model for the child graph's nodes unless they set their own
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

pub fn subgraph_node(id: impl Into<NodeId>, config: SubgraphConfig) -> NodeDefinition {
    let mut node = NodeDefinition::new(id, NodeType::Subgraph, SubgraphNode {
        config: config.clone(),
    });
    node.model = config.model;
    node.retry = config.retry;
    node
}

struct SubgraphNode {
    config: SubgraphConfig,
}

impl SubgraphNode {
    fn resolve(&self, ctx: &ExecutionContext) -> Result<Arc<CompiledGraph>, NodeError> {
        match &self.config.source {
            SubgraphSource::Graph(graph) => Ok(Arc::clone(graph)),
            SubgraphSource::Named(name) => {
                let resolver = ctx
                    .runtime
                    .workflow_resolver
                    .as_ref()
                    .ok_or(NodeError::MissingDependency("workflow_resolver"))?;
                resolver
                    .resolve(name)
                    .ok_or_else(|| NodeError::SubgraphNotFound(name.clone()))
            }
        }
    }
}

fn copy_fields(state: &GraphState) -> StateUpdate {
    state
        .fields()
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Net effect of the child's steps as a single update
///
/// Repeated writes to a declared field are combined with that field's
/// reducer; undeclared fields keep the last write.
fn child_contribution(updates: &[StateUpdate], schema: Option<&AnnotationRoot>) -> StateUpdate {
    let mut combined = Map::new();
    for update in updates {
        for (key, value) in update.iter() {
            let next = match (combined.remove(key), schema.and_then(|s| s.get(key))) {
                (Some(previous), Some(annotation)) => annotation.reduce(&previous, value.clone()),
                _ => value.clone(),
            };
            combined.insert(key.clone(), next);
        }
    }
    StateUpdate::from(combined)
}

#[async_trait]
impl NodeExecutor for SubgraphNode {
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeResult, NodeError> {
        let graph = self.resolve(&ctx)?;

        let input = match &self.config.input {
            Some(mapper) => mapper(ctx.state()),
            None => copy_fields(ctx.state()),
        };
        let (child_state, report) = graph.initial_state().apply(&input, graph.schema());
        if !report.rejected.is_empty() {
            log::debug!(
                "Subgraph '{}' dropped input fields: {:?}",
                ctx.node_id,
                report.rejected
            );
        }

        log::info!(
            "Subgraph '{}' starting child execution {}",
            ctx.node_id,
            child_state.execution_id
        );
        let options = ExecutionOptions::new()
            .with_initial_state(child_state)
            .with_parent_model(ctx.model.clone())
            .with_runtime(ctx.runtime.clone())
            .with_cancel(ctx.cancel.child_token());

        let result = GraphExecutor::new(graph.clone())
            .execute_with(options)
            .await
            .map_err(|e| match e {
                ExecutionError::Cancelled => NodeError::Cancelled,
                other => NodeError::Subgraph(Box::new(other)),
            })?;

        for event in &result.events {
            ctx.emit(event.event_type.clone(), event.data.clone());
        }

        let update = match &self.config.output {
            Some(mapper) => mapper(&result.state),
            None => child_contribution(&result.updates, graph.schema()),
        };

        let mut node_result = NodeResult::update(update).with_output(json!({
            "execution_id": result.execution_id,
            "steps": result.steps,
            "path": result.path,
            "outputs": result.state.outputs,
        }));
        node_result.signals = result.signals;
        Ok(node_result)
    }
}
