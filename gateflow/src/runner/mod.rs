//! Uniform "run an external command" interface.

mod invocation;
mod process;

pub use invocation::{CommandInvocation, CommandOutcome};
pub use process::ProcessToolRunner;

use crate::cancellation::CancellationToken;
use crate::errors::InfrastructureError;
use async_trait::async_trait;

/// Executes external commands for the engine.
///
/// A command that runs and exits non-zero is `Ok`; errors are reserved for
/// failures to run it at all.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Runs `invocation` to completion, timeout or cancellation.
    async fn execute(
        &self,
        invocation: &CommandInvocation,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, InfrastructureError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_runner_through_trait_object() {
        let mut mock = MockToolRunner::new();
        mock.expect_execute()
            .withf(|invocation, _| invocation.program == "cargo")
            .times(1)
            .returning(|_, _| Ok(CommandOutcome::exit(101, "test failed")));

        let runner: Box<dyn ToolRunner> = Box::new(mock);
        let token = CancellationToken::new();
        let outcome = runner
            .execute(&CommandInvocation::new("test", "cargo", "."), &token)
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, Some(101));
        assert!(!outcome.success());
    }
}
