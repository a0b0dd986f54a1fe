// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use serde_json::Value;

use super::error::NodeError;

/// Trait for tools that tool-call nodes invoke directly.
///
/// `name()`, `description()` and `schema()` return borrowed data;
/// implementations should store these values in struct fields.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the tool name
    fn name(&self) -> &str;

    /// Returns a human-readable description of what the tool does
    fn description(&self) -> &str;

    /// Returns the JSON schema for the tool's input parameters
    fn schema(&self) -> &Value;

    /// Execute the tool with the given input and return the result
    async fn execute(&self, input: Value) -> Result<Value, NodeError>;
}
