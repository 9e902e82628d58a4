//! The worker loop: advertise resource tags, poll for matching tasks, run
//! each as a shell command, and heartbeat until it completes.
//!
//! A transport failure tears the session down and the worker reconnects
//! with the same back-off schedule the idle poll uses. On shutdown the
//! loop stops polling but lets a running task finish so the server
//! observes its completion.

pub mod executor;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::TaskClient;
use crate::config::{ServerAddress, WorkerConfig};
use crate::db::TaskAssignment;
use crate::error::Result;

pub use executor::TaskExecutor;

pub struct TaskWorker {
    address: ServerAddress,
    resources: Vec<String>,
    config: WorkerConfig,
    executor: TaskExecutor,
}

impl TaskWorker {
    pub fn new(address: ServerAddress, resources: Vec<String>, config: WorkerConfig) -> Self {
        Self {
            address,
            resources,
            config,
            executor: TaskExecutor,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(server = %self.address.to_addr(), resources = ?self.resources, "starting worker");

        let mut retry_delay = Duration::ZERO;
        while !shutdown.is_cancelled() {
            match self.serve(&shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    retry_delay = next_poll_delay(
                        retry_delay,
                        self.config.min_poll_interval,
                        self.config.max_poll_interval,
                    );
                    tracing::warn!(error = %e, retry_in = ?retry_delay, "lost connection to server; retrying");
                    if sleep_or_cancel(retry_delay, &shutdown).await {
                        break;
                    }
                }
            }
        }

        tracing::info!("worker shut down");
        Ok(())
    }

    /// One connection's worth of work: hello, then poll until shutdown.
    async fn serve(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let mut client = TaskClient::connect(&self.address).await?;
        client.worker_hello(&self.resources).await?;

        let mut poll_delay = Duration::ZERO;
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            match client.take_task_to_run().await? {
                Some(assignment) => {
                    poll_delay = Duration::ZERO;
                    self.run_task(&mut client, assignment).await?;
                }
                None => {
                    poll_delay = next_poll_delay(
                        poll_delay,
                        self.config.min_poll_interval,
                        self.config.max_poll_interval,
                    );
                    if sleep_or_cancel(poll_delay, shutdown).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Run one assigned task to completion, heartbeating alongside it.
    /// A cancel reply (or a task the server no longer knows) kills the
    /// child; either way the process is waited on and reported finished.
    async fn run_task(&self, client: &mut TaskClient, assignment: TaskAssignment) -> Result<()> {
        let mut child = self.executor.spawn(assignment.id, &assignment.command)?;
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.tick().await; // the first tick fires immediately; skip it

        let mut killed = false;
        let exit = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = ticker.tick() => {
                    match client.heartbeat_task(assignment.id).await? {
                        Some(false) => {}
                        Some(true) => {
                            if !killed {
                                tracing::warn!(task_id = %assignment.id, "server requested cancellation; killing task");
                                child.start_kill()?;
                                killed = true;
                            }
                        }
                        None => {
                            if !killed {
                                tracing::warn!(task_id = %assignment.id, "task no longer known to server; killing");
                                child.start_kill()?;
                                killed = true;
                            }
                        }
                    }
                }
            }
        };

        tracing::info!(task_id = %assignment.id, exit_code = ?exit.code(), killed, "task finished");
        if !client.mark_task_finished(assignment.id).await? {
            tracing::warn!(task_id = %assignment.id, "server no longer knew the finished task");
        }
        Ok(())
    }
}

/// Slow exponential back-off: `next = cur + 1ms + cur/4`, clamped.
fn next_poll_delay(cur: Duration, min: Duration, max: Duration) -> Duration {
    (cur + Duration::from_millis(1) + cur / 4).clamp(min, max)
}

/// Sleep for `delay`, returning `true` if the token fired first.
async fn sleep_or_cancel(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
