// SPDX-License-Identifier: MIT

//! Graph workflows: typed state, graph construction and execution, and the
//! built-in node kinds

pub mod graph;
pub mod nodes;
pub mod state;
