//! Task handlers: what the local engine does with each task.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::Task;

/// Executes one task. An `Err` marks the task as failed.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<()>;
}

/// Runs an external executable per task, passing the target as its only
/// argument. Exit status 0 is success.
///
/// The child also sees `WORKFEED_TARGET`, `WORKFEED_QUEUE`,
/// `WORKFEED_DELIVERY_TAG` and `WORKFEED_TASK_ID`. The child is killed if
/// the task is dropped before it exits.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    command: PathBuf,
}

impl CommandHandler {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &Path {
        &self.command
    }

    fn resolved(&self) -> Result<PathBuf> {
        // Bare names are left to PATH lookup; relative paths resolve against
        // the process CWD.
        if self.command.is_relative() && self.command.components().count() > 1 {
            Ok(std::env::current_dir()?.join(&self.command))
        } else {
            Ok(self.command.clone())
        }
    }
}

#[async_trait]
impl TaskHandler for CommandHandler {
    async fn handle(&self, task: &Task) -> Result<()> {
        let command = self.resolved()?;
        let ack = task.ack_context();

        debug!(
            task_id = %task.id(),
            command = %command.display(),
            target = task.target(),
            "running handler"
        );

        let status = Command::new(&command)
            .arg(task.target())
            .env("WORKFEED_TARGET", task.target())
            .env("WORKFEED_QUEUE", &ack.queue)
            .env("WORKFEED_DELIVERY_TAG", ack.delivery_tag.as_str())
            .env("WORKFEED_TASK_ID", task.id().0.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::Handler(format!(
                "{} exited with status {}",
                command.display(),
                status.code().unwrap_or(-1)
            )))
        }
    }
}
