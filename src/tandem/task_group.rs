// SPDX-License-Identifier: MIT

//! Task group - runs N futures as independent tokio tasks
//!
//! Results come back as a fixed-size vector in spawn order, each entry
//! tagged independently. A panicking task only fails its own entry.
//! Dropping the group aborts unfinished tasks; callers that need the
//! stragglers to clean up signal them and call [`TaskGroup::wait_remaining`].

use futures::future::select_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use thiserror::Error;
use tokio::task::JoinHandle;

/// A task panicked or was aborted
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("task failed: {0}")]
pub struct TaskError(pub String);

/// Group of spawned tasks producing `T`
pub struct TaskGroup<T> {
    /// `None` once the task's output has been taken
    handles: Vec<Option<JoinHandle<T>>>,
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Spawn a task; its index is the number of tasks spawned before it
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.handles.push(Some(tokio::spawn(future)));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Tasks whose output has not been taken yet
    pub fn unsettled(&self) -> usize {
        self.handles.iter().filter(|slot| slot.is_some()).count()
    }

    /// Wait for every task to settle
    pub async fn join_all(mut self) -> Vec<Result<T, TaskError>> {
        let mut results = Vec::with_capacity(self.handles.len());
        for slot in self.handles.iter_mut() {
            let result = match slot.take() {
                Some(handle) => handle.await.map_err(|e| TaskError(e.to_string())),
                None => Err(TaskError("already settled".to_string())),
            };
            results.push(result);
        }
        results
    }

    /// First unsettled task to finish, whatever its outcome
    pub async fn first_settled(&mut self) -> Option<(usize, Result<T, TaskError>)> {
        let (indices, live): (Vec<usize>, Vec<&mut JoinHandle<T>>) = self
            .handles
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_mut().map(|handle| (index, handle)))
            .unzip();
        if live.is_empty() {
            return None;
        }
        let (result, position, _) = select_all(live).await;
        let index = indices[position];
        self.handles[index] = None;
        Some((index, result.map_err(|e| TaskError(e.to_string()))))
    }

    /// First unsettled task whose output satisfies `accept`
    ///
    /// Returns the winner (if any) and every rejected outcome seen before it,
    /// each paired with its spawn index. Tasks still running stay in the group.
    pub async fn first_accepted<P>(
        &mut self,
        accept: P,
    ) -> (Option<(usize, T)>, Vec<(usize, Result<T, TaskError>)>)
    where
        P: Fn(&T) -> bool,
    {
        let mut settled = Vec::new();
        let mut rejected = Vec::new();
        let mut winner = None;
        {
            let mut pending: FuturesUnordered<_> = self
                .handles
                .iter_mut()
                .enumerate()
                .filter_map(|(index, slot)| {
                    slot.as_mut()
                        .map(|handle| async move { (index, handle.await) })
                })
                .collect();

            while let Some((index, result)) = pending.next().await {
                settled.push(index);
                match result {
                    Ok(value) if accept(&value) => {
                        winner = Some((index, value));
                        break;
                    }
                    Ok(value) => rejected.push((index, Ok(value))),
                    Err(e) => rejected.push((index, Err(TaskError(e.to_string())))),
                }
            }
        }
        for index in settled {
            self.handles[index] = None;
        }
        (winner, rejected)
    }

    /// Wait for the unsettled tasks and discard their outputs
    pub async fn wait_remaining(mut self) {
        for slot in self.handles.iter_mut() {
            if let Some(handle) = slot.take() {
                if let Err(e) = handle.await {
                    log::debug!("Discarded task ended abnormally: {}", e);
                }
            }
        }
    }
}

impl<T: Send + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for TaskGroup<T> {
    fn drop(&mut self) {
        for handle in self.handles.iter().flatten() {
            handle.abort();
        }
    }
}
