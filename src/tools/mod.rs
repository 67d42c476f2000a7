//! Tool execution capability
//!
//! The agent loop never runs tools itself; it hands each call to a
//! [`ToolExecutor`]. Executor failures are infrastructure errors and are
//! reported back to the model as error results rather than ending the run.

use async_trait::async_trait;
use eyre::eyre;
use tokio_util::sync::CancellationToken;

use crate::llm::ToolResult;

/// Runs tool calls on behalf of the agent loop
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute `name` with its raw JSON arguments
    async fn execute(&self, cancel: &CancellationToken, name: &str, arguments: &str) -> eyre::Result<ToolResult>;
}

/// Executor with no tools; every call fails
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableExecutor;

#[async_trait]
impl ToolExecutor for UnavailableExecutor {
    async fn execute(&self, _cancel: &CancellationToken, name: &str, _arguments: &str) -> eyre::Result<ToolResult> {
        Err(eyre!("tool '{}' is not available", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unavailable_executor() {
        let err = UnavailableExecutor
            .execute(&CancellationToken::new(), "read_file", "{}")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "tool 'read_file' is not available");
    }
}
