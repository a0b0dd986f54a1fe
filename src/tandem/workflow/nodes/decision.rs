// SPDX-License-Identifier: MIT

//! Decision node: routes by predicate, never touches state

use serde_json::json;
use std::sync::Arc;

use crate::tandem::workflow::graph::{
    predicate, NodeDefinition, NodeId, NodeResult, NodeType, Predicate,
};
use crate::tandem::workflow::state::GraphState;

#[derive(Clone)]
struct Route {
    condition: Predicate,
    target: NodeId,
}

/// Ordered routes evaluated against state
#[derive(Clone, Default)]
pub struct DecisionConfig {
    routes: Vec<Route>,
    otherwise: Option<NodeId>,
    fan_out: bool,
}

impl DecisionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route to `target` when `condition` holds
    pub fn route<F>(mut self, condition: F, target: impl Into<NodeId>) -> Self
    where
        F: Fn(&GraphState) -> bool + Send + Sync + 'static,
    {
        self.routes.push(Route {
            condition: predicate(condition),
            target: target.into(),
        });
        self
    }

    /// Target used when no route matches
    pub fn otherwise(mut self, target: impl Into<NodeId>) -> Self {
        self.otherwise = Some(target.into());
        self
    }

    /// Take every matching route instead of the first
    pub fn fan_out(mut self) -> Self {
        self.fan_out = true;
        self
    }

    fn select(&self, state: &GraphState) -> Vec<NodeId> {
        let mut matched = self
            .routes
            .iter()
            .filter(|route| (route.condition)(state))
            .map(|route| route.target.clone());

        let targets: Vec<NodeId> = if self.fan_out {
            matched.collect()
        } else {
            matched.next().into_iter().collect()
        };

        if targets.is_empty() {
            self.otherwise.iter().cloned().collect()
        } else {
            targets
        }
    }
}

/// Node returning a next-node override
///
/// With no match and no fallback the override is empty and the node's own
/// edges are followed.
pub fn decision_node(id: impl Into<NodeId>, config: DecisionConfig) -> NodeDefinition {
    let config = Arc::new(config);
    NodeDefinition::from_fn(id, NodeType::Decision, move |ctx| {
        let config = Arc::clone(&config);
        async move {
            let targets = config.select(ctx.state());
            log::debug!("Decision '{}' routed to {:?}", ctx.node_id, targets);
            let mut result = NodeResult::new().with_output(json!({ "routes": targets }));
            result.goto = targets;
            Ok(result)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tandem::workflow::graph::ExecutionContext;

    fn config() -> DecisionConfig {
        DecisionConfig::new()
            .route(|s| s.get_f64("score").unwrap_or(0.0) >= 0.8, "publish")
            .route(|s| s.get_f64("score").unwrap_or(0.0) >= 0.5, "revise")
            .otherwise("discard")
    }

    async fn run(node: &NodeDefinition, state: GraphState) -> NodeResult {
        node.execute(ExecutionContext::new("decide", Arc::new(state)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_matching_route_wins() {
        let node = decision_node("decide", config());
        let result = run(&node, GraphState::new().with_field("score", 0.9)).await;
        assert_eq!(result.goto, vec!["publish"]);
        assert!(result.state_update.is_empty());
    }

    #[tokio::test]
    async fn test_fallback_when_nothing_matches() {
        let node = decision_node("decide", config());
        let result = run(&node, GraphState::new().with_field("score", 0.1)).await;
        assert_eq!(result.goto, vec!["discard"]);
    }

    #[tokio::test]
    async fn test_fan_out_takes_all_matches() {
        let node = decision_node("decide", config().fan_out());
        let result = run(&node, GraphState::new().with_field("score", 0.9)).await;
        assert_eq!(result.goto, vec!["publish", "revise"]);
    }

    #[tokio::test]
    async fn test_no_match_no_fallback_follows_edges() {
        let node = decision_node(
            "decide",
            DecisionConfig::new().route(|_| false, "never"),
        );
        let result = run(&node, GraphState::new()).await;
        assert!(result.goto.is_empty());
        assert_eq!(node.node_type, NodeType::Decision);
    }
}
