//! The task server: owns the [`TaskDatabase`], serves client and worker
//! sessions over the framed protocol, and runs the zombie reaper.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ServerConfig;
use crate::db::{TaskDatabase, TaskId, TaskState, TaskStatus};
use crate::error::Result;
use crate::wire::codec::{read_frame, write_frame};
use crate::wire::message::{error_reply, not_found_reply, ok_reply, Request, Wire, STATUS_OK};

/// Seconds between request-statistics log lines.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(10);

type Db = Arc<RwLock<TaskDatabase>>;

/// Per-process counters over served requests, reported periodically.
#[derive(Debug, Default)]
struct RequestStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    bad: AtomicU64,
}

impl RequestStats {
    fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.succeeded.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.bad.load(Ordering::Relaxed),
        )
    }
}

pub struct TaskServer {
    config: ServerConfig,
    db: Db,
    stats: Arc<RequestStats>,
}

impl TaskServer {
    pub fn new(config: ServerConfig) -> Self {
        let db = Arc::new(RwLock::new(TaskDatabase::new(config.max_list_tasks)));
        Self {
            config,
            db,
            stats: Arc::new(RequestStats::default()),
        }
    }

    /// Bind the configured port and serve until the token fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        self.run_on(listener, shutdown).await
    }

    /// Serve on an already-bound listener. Tests use this with an
    /// ephemeral port.
    pub async fn run_on(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "task server listening");

        let reaper_db = self.db.clone();
        let reap_interval = self.config.reap_interval;
        let heartbeat_timeout = self.config.heartbeat_timeout_secs;
        let reaper_shutdown = shutdown.clone();
        tokio::spawn(async move {
            reaper_loop(reaper_db, reap_interval, heartbeat_timeout, reaper_shutdown).await;
        });

        let stats = self.stats.clone();
        let stats_shutdown = shutdown.clone();
        tokio::spawn(async move {
            stats_loop(stats, stats_shutdown).await;
        });

        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let db = self.db.clone();
                        let stats = self.stats.clone();
                        let session_shutdown = shutdown.clone();
                        tracker.spawn(async move {
                            handle_session(stream, peer, db, stats, session_shutdown).await;
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to accept connection"),
                },
            }
        }

        // Stop accepting, let in-flight sessions drain their current
        // request, then exit. Nothing is persisted.
        drop(listener);
        tracker.close();
        tracker.wait().await;
        tracing::info!("task server shut down");
        Ok(())
    }
}

async fn reaper_loop(db: Db, interval: Duration, timeout_secs: i64, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let reaped = db.write().await.cleanup_zombie_tasks(timeout_secs);
                if reaped > 0 {
                    tracing::info!(reaped, "reaper finished zombie tasks");
                }
            }
        }
    }
}

async fn stats_loop(stats: Arc<RequestStats>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(STATS_LOG_INTERVAL);
    let mut last = stats.snapshot();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let current = stats.snapshot();
                if current != last {
                    let (succeeded, failed, bad) = current;
                    tracing::info!(succeeded, failed, bad, "request statistics");
                    last = current;
                }
            }
        }
    }
}

/// One connection: read frames until EOF or error, dispatch each request,
/// reply on the same stream. Worker sessions carry the resource tags from
/// their `WORKER_HELLO` for the lifetime of the connection.
async fn handle_session(
    mut stream: TcpStream,
    peer: SocketAddr,
    db: Db,
    stats: Arc<RequestStats>,
    shutdown: CancellationToken,
) {
    tracing::debug!(%peer, "session opened");
    let mut worker_resources: Option<HashSet<String>> = None;

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            f = read_frame(&mut stream) => f,
        };
        let payload = match frame {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "dropping connection on framing error");
                stats.bad.fetch_add(1, Ordering::Relaxed);
                break;
            }
        };

        let request = match Request::decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "dropping connection on undecodable request");
                stats.bad.fetch_add(1, Ordering::Relaxed);
                break;
            }
        };

        let written = match request {
            Request::Wait(id) => {
                stats.succeeded.fetch_add(1, Ordering::Relaxed);
                handle_wait(&mut stream, &db, id, &shutdown).await
            }
            request => {
                let reply = dispatch(&db, &mut worker_resources, request).await;
                if reply.first() == Some(&STATUS_OK) {
                    stats.succeeded.fetch_add(1, Ordering::Relaxed);
                } else {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                }
                write_frame(&mut stream, &reply).await
            }
        };

        if let Err(e) = written {
            tracing::debug!(%peer, error = %e, "failed to write reply");
            break;
        }
    }

    tracing::debug!(%peer, "session closed");
}

async fn dispatch(
    db: &Db,
    worker_resources: &mut Option<HashSet<String>>,
    request: Request,
) -> Vec<u8> {
    match request {
        Request::New(info) => {
            let task = db.write().await.create_task(&info);
            tracing::info!(task_id = %task.id, command = %task.command, "task created");
            let mut w = ok_reply();
            task.id.encode(&mut w);
            w.into_bytes()
        }

        Request::Cancel(id) => {
            let canceled = db.write().await.mark_task_should_cancel(id);
            if canceled {
                tracing::info!(task_id = %id, "task marked for cancellation");
            }
            let mut w = ok_reply();
            w.put_bool(canceled);
            w.into_bytes()
        }

        Request::Info(id) => {
            let db = db.read().await;
            let info = db.get_task(id).map(|t| (t.status, t.schedule.clone()));
            let mut w = ok_reply();
            match info {
                Some((status, schedule)) => {
                    w.put_bool(true);
                    status.encode(&mut w);
                    schedule.encode(&mut w);
                }
                None => w.put_bool(false),
            }
            w.into_bytes()
        }

        Request::List(states) => {
            let briefs = db.read().await.tasks_by_states(&states);
            let mut w = ok_reply();
            briefs.encode(&mut w);
            w.into_bytes()
        }

        Request::Stats => {
            let stats = db.read().await.stats();
            let mut w = ok_reply();
            stats.encode(&mut w);
            w.into_bytes()
        }

        // Wait streams multiple frames and is handled by the session loop.
        Request::Wait(_) => error_reply("wait cannot be dispatched as a unary request"),

        Request::WorkerHello(tags) => {
            tracing::info!(resources = ?tags, "worker registered");
            *worker_resources = Some(tags.into_iter().collect());
            ok_reply().into_bytes()
        }

        Request::WorkerPoll => match worker_resources {
            None => error_reply("worker_poll before worker_hello"),
            Some(have) => {
                let taken = db.write().await.take_task_to_run(have);
                let mut w = ok_reply();
                match taken {
                    Some(task) => {
                        tracing::info!(task_id = %task.id, "task assigned to worker");
                        w.put_bool(true);
                        task.id.encode(&mut w);
                        task.command.encode(&mut w);
                    }
                    None => w.put_bool(false),
                }
                w.into_bytes()
            }
        },

        Request::WorkerHeartbeat(id) => match db.write().await.heartbeat_task(id) {
            Some(should_cancel) => {
                let mut w = ok_reply();
                w.put_bool(should_cancel);
                w.into_bytes()
            }
            None => not_found_reply("unknown task"),
        },

        Request::WorkerFinished(id) => {
            if db.write().await.mark_task_finished(id) {
                tracing::info!(task_id = %id, "task finished");
                ok_reply().into_bytes()
            } else {
                not_found_reply("unknown task")
            }
        }
    }
}

/// Stream status updates for one task until it leaves the database: a
/// present status per derived-state change, then one absent marker.
async fn handle_wait(
    stream: &mut TcpStream,
    db: &Db,
    id: TaskId,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut changes = db.read().await.subscribe();
    let mut last_state: Option<TaskState> = None;

    loop {
        let status = db.read().await.task_status(id);
        match status {
            None => {
                let mut w = ok_reply();
                Option::<TaskStatus>::None.encode(&mut w);
                return write_frame(stream, &w.into_bytes()).await;
            }
            Some(status) => {
                let state = status.state();
                if last_state != Some(state) {
                    last_state = Some(state);
                    let mut w = ok_reply();
                    Some(status).encode(&mut w);
                    write_frame(stream, &w.into_bytes()).await?;
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            changed = changes.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
