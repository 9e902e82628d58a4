use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::db::TaskId;

/// Spawns task commands through the shell. Task output is deliberately not
/// captured: it goes to the worker's own stdout/stderr, and payload or
/// result storage is the job of whatever system the command itself talks to.
#[derive(Debug, Clone, Default)]
pub struct TaskExecutor;

impl TaskExecutor {
    pub fn spawn(&self, id: TaskId, command: &str) -> std::io::Result<Child> {
        tracing::info!(task_id = %id, command, "starting task");
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}
