// SPDX-License-Identifier: MIT

//! Agent development kit - the seams between the engine and its host
//!
//! - [`error`] - typed error hierarchy
//! - [`session`] - provider-agnostic agent sessions
//! - [`tool`] - directly callable tools
//! - [`agent`] - sub-agent definitions

pub mod agent;
pub mod error;
pub mod session;
pub mod tool;
