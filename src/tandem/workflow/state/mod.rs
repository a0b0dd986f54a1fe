// SPDX-License-Identifier: MIT

//! State management for graph workflows
//!
//! This module provides:
//! - `Annotation` / `Reducer` - per-field defaults and merge rules
//! - `AnnotationRoot` - a full schema used to seed and validate state
//! - `GraphState` - immutable runtime state, merged once per step

mod annotation;
mod store;

pub use annotation::{Annotation, AnnotationRoot, FieldType, Reducer, ReducerFn};
pub use store::{GraphState, MergeReport, RejectedField, StateUpdate, RESERVED_KEYS};
