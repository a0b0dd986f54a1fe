// SPDX-License-Identifier: MIT

//! Parallel node
//!
//! Runs its branch nodes as independent tasks on the fan-out snapshot and
//! settles them per strategy. The whole fan-out is a single graph step.
//! A branch with its own retry policy is retried inside its task. Branches
//! that lose a race are cancelled through their token and awaited.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::adk::error::NodeError;
use crate::tandem::task_group::{TaskError, TaskGroup};
use crate::tandem::workflow::graph::{
    ExecutionContext, NodeDefinition, NodeExecutor, NodeId, NodeResult, NodeType,
};
use crate::tandem::workflow::state::{GraphState, StateUpdate};

/// How branch outcomes settle the node
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParallelStrategy {
    /// Await every branch; any failure fails the node
    #[default]
    All,
    /// First branch to settle decides, success or not
    Race,
    /// First success wins; fails only if every branch fails
    Any,
}

/// Result of one branch
#[derive(Debug)]
pub struct BranchOutcome {
    pub node_id: NodeId,
    pub result: Result<NodeResult, NodeError>,
}

/// Combines the settled branch outcomes into one update
pub type ParallelMergeFn =
    Arc<dyn Fn(&GraphState, Vec<BranchOutcome>) -> Result<StateUpdate, NodeError> + Send + Sync>;

/// Settings for [`parallel_node`]
#[derive(Clone)]
pub struct ParallelConfig {
    pub branches: Vec<NodeDefinition>,
    pub strategy: ParallelStrategy,
    /// Defaults to folding branch updates in branch order
    pub merge: Option<ParallelMergeFn>,
}

impl ParallelConfig {
    pub fn new(branches: Vec<NodeDefinition>) -> Self {
        Self {
            branches,
            strategy: ParallelStrategy::default(),
            merge: None,
        }
    }

    pub fn with_strategy(mut self, strategy: ParallelStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_merge<F>(mut self, merge: F) -> Self
    where
        F: Fn(&GraphState, Vec<BranchOutcome>) -> Result<StateUpdate, NodeError>
            + Send
            + Sync
            + 'static,
    {
        self.merge = Some(Arc::new(merge));
        self
    }
}

pub fn parallel_node(id: impl Into<NodeId>, config: ParallelConfig) -> NodeDefinition {
    NodeDefinition::new(id, NodeType::Parallel, ParallelNode { config })
}

struct ParallelNode {
    config: ParallelConfig,
}

#[async_trait]
impl NodeExecutor for ParallelNode {
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeResult, NodeError> {
        let branches = &self.config.branches;
        let ids: Vec<NodeId> = branches.iter().map(|b| b.id.clone()).collect();
        log::debug!(
            "Parallel node '{}' starting {} branches ({:?})",
            ctx.node_id,
            branches.len(),
            self.config.strategy
        );

        let branch_cancel = ctx.cancel.child_token();
        let mut group = TaskGroup::new();
        for branch in branches {
            let branch = branch.clone();
            let branch_ctx = ctx
                .for_node(format!("{}.{}", ctx.node_id, branch.id))
                .with_cancel(branch_cancel.clone());
            group.spawn(run_branch(branch, branch_ctx));
        }

        let outcome = |index: usize, result: Result<Result<NodeResult, NodeError>, TaskError>| {
            BranchOutcome {
                node_id: ids[index].clone(),
                result: result
                    .map_err(|e| NodeError::Parallel(e.to_string()))
                    .and_then(|r| r),
            }
        };

        let strategy = self.config.strategy;
        let outcomes: Vec<BranchOutcome> = match strategy {
            ParallelStrategy::All => group
                .join_all()
                .await
                .into_iter()
                .enumerate()
                .map(|(index, result)| outcome(index, result))
                .collect(),
            ParallelStrategy::Race => {
                let first = group.first_settled().await;
                release_losers(&branch_cancel, group).await;
                first
                    .map(|(index, result)| outcome(index, result))
                    .into_iter()
                    .collect()
            }
            ParallelStrategy::Any => {
                let (winner, mut rejected) = group.first_accepted(|r| r.is_ok()).await;
                release_losers(&branch_cancel, group).await;
                match winner {
                    Some((index, result)) => vec![outcome(index, Ok(result))],
                    None => {
                        rejected.sort_by_key(|(index, _)| *index);
                        rejected
                            .into_iter()
                            .map(|(index, result)| outcome(index, result))
                            .collect()
                    }
                }
            }
        };

        if ctx.cancel.is_cancelled() {
            log::debug!("Parallel node '{}' cancelled", ctx.node_id);
            return Err(NodeError::Cancelled);
        }

        check_strategy(strategy, &outcomes)?;

        let summary: Vec<Value> = outcomes.iter().map(summarize).collect();
        let signals = outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .flat_map(|r| r.signals.iter().cloned())
            .collect::<Vec<_>>();

        let update = match &self.config.merge {
            Some(merge) => merge(ctx.state(), outcomes)?,
            None => fold_updates(outcomes),
        };

        let mut result = NodeResult::update(update).with_output(json!({
            "strategy": strategy,
            "branches": summary,
        }));
        result.signals = signals;
        Ok(result)
    }
}

/// Run one branch, retrying it under its own policy when it has one
async fn run_branch(
    branch: NodeDefinition,
    ctx: ExecutionContext,
) -> Result<NodeResult, NodeError> {
    let Some(retry) = branch.retry else {
        return branch.execute(ctx).await;
    };
    let mut attempt = 0;
    loop {
        attempt += 1;
        match branch.execute(ctx.clone()).await {
            Ok(result) => return Ok(result),
            Err(NodeError::Cancelled) => return Err(NodeError::Cancelled),
            Err(error) if attempt < retry.max_attempts && !ctx.cancel.is_cancelled() => {
                let delay = retry.delay_for(attempt);
                log::warn!(
                    "Branch '{}' failed (attempt {}/{}): {}; retrying in {:?}",
                    ctx.node_id,
                    attempt,
                    retry.max_attempts,
                    error,
                    delay
                );
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(NodeError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => return Err(error),
        }
    }
}

/// Signal the branches still running and wait for them to wind down
async fn release_losers<T: Send + 'static>(cancel: &CancellationToken, group: TaskGroup<T>) {
    if group.unsettled() == 0 {
        return;
    }
    cancel.cancel();
    group.wait_remaining().await;
}

fn check_strategy(strategy: ParallelStrategy, outcomes: &[BranchOutcome]) -> Result<(), NodeError> {
    let failed: Vec<&BranchOutcome> = outcomes.iter().filter(|o| o.result.is_err()).collect();
    if failed.is_empty() {
        return Ok(());
    }
    let describe = |o: &BranchOutcome| match &o.result {
        Err(e) => format!("'{}': {}", o.node_id, e),
        Ok(_) => o.node_id.clone(),
    };
    match strategy {
        ParallelStrategy::All | ParallelStrategy::Race => Err(NodeError::Parallel(format!(
            "branch {}",
            describe(failed[0])
        ))),
        ParallelStrategy::Any => Err(NodeError::Parallel(format!(
            "all {} branches failed; first {}",
            failed.len(),
            describe(failed[0])
        ))),
    }
}

fn summarize(outcome: &BranchOutcome) -> Value {
    match &outcome.result {
        Ok(result) => json!({
            "node_id": outcome.node_id,
            "ok": true,
            "output": result.output.clone().unwrap_or_else(|| result.state_update.clone().into_value()),
        }),
        Err(e) => json!({
            "node_id": outcome.node_id,
            "ok": false,
            "error": e.to_string(),
        }),
    }
}

fn fold_updates(outcomes: Vec<BranchOutcome>) -> StateUpdate {
    let mut update = StateUpdate::new();
    for outcome in outcomes {
        if let Ok(result) = outcome.result {
            update.extend(result.state_update);
        }
    }
    update
}
