//! Payload that runs a step script's argv commands in order.

use async_trait::async_trait;

use stepwright_config::ScriptStep;
use stepwright_runner::CommandSpec;

use crate::task::{Payload, StepContext};

/// Runs its commands one after another and stops at the first failure.
///
/// The outcome is the first non-zero exit code, or `0` when every command
/// succeeded. With retry enabled each command goes through the Retry Wrapper
/// using the run's retry policy.
#[derive(Debug, Clone, Default)]
pub struct CommandPayload {
    commands: Vec<CommandSpec>,
    retry: bool,
}

impl CommandPayload {
    #[must_use]
    pub fn new(commands: Vec<CommandSpec>) -> Self {
        Self {
            commands,
            retry: false,
        }
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn from_step(step: &ScriptStep) -> Self {
        Self::new(step.command_specs()).with_retry(step.retry)
    }

    #[must_use]
    pub fn commands(&self) -> &[CommandSpec] {
        &self.commands
    }
}

#[async_trait]
impl Payload for CommandPayload {
    async fn run(&mut self, ctx: StepContext) -> i32 {
        for cmd in &self.commands {
            let code = if self.retry {
                ctx.exec_with_retries(cmd, ctx.retry_policy()).await
            } else {
                ctx.exec(cmd).await
            };
            if code != 0 {
                return code;
            }
        }
        0
    }
}
