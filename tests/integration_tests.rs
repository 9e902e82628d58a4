//! End-to-end scenarios against a real server on an ephemeral port.

use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use dispatch_lite::client::TaskClient;
use dispatch_lite::config::{ServerAddress, ServerConfig, WorkerConfig};
use dispatch_lite::db::{TaskCreateInfo, TaskId, TaskSchedule, TaskState};
use dispatch_lite::error::DispatchError;
use dispatch_lite::server::TaskServer;
use dispatch_lite::worker::TaskWorker;

async fn spawn_server(config: ServerConfig) -> (ServerAddress, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let shutdown = CancellationToken::new();
    let server = TaskServer::new(config);
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        server.run_on(listener, server_shutdown).await.unwrap();
    });
    (
        ServerAddress {
            host: "127.0.0.1".to_string(),
            port,
        },
        shutdown,
    )
}

async fn default_server() -> (ServerAddress, CancellationToken) {
    spawn_server(ServerConfig::default()).await
}

fn create_info(command: &str, required: &[&str], optional: &[&str]) -> TaskCreateInfo {
    TaskCreateInfo {
        command: command.to_string(),
        schedule: TaskSchedule {
            required: required.iter().map(|s| s.to_string()).collect(),
            optional: optional.iter().map(|s| s.to_string()).collect(),
        },
    }
}

fn worker_tags(tags: &[&str]) -> Vec<String> {
    tags.iter().map(|s| s.to_string()).collect()
}

fn test_worker_config() -> WorkerConfig {
    WorkerConfig {
        heartbeat_interval: Duration::from_millis(100),
        min_poll_interval: Duration::from_millis(50),
        max_poll_interval: Duration::from_millis(200),
    }
}

#[tokio::test]
async fn test_submit_run_finish() {
    let (addr, shutdown) = default_server().await;

    let mut worker = TaskClient::connect(&addr).await.unwrap();
    worker.worker_hello(&worker_tags(&["GPU"])).await.unwrap();

    let mut client = TaskClient::connect(&addr).await.unwrap();
    let id = client
        .create_task(&create_info("echo hi", &["GPU"], &[]))
        .await
        .unwrap();

    let assignment = worker.take_task_to_run().await.unwrap().unwrap();
    assert_eq!(assignment.id, id);
    assert_eq!(assignment.command, "echo hi");

    let stats = client.stats().await.unwrap();
    assert_eq!(
        (stats.num_pending, stats.num_running, stats.num_canceling, stats.num_finished),
        (0, 1, 0, 0)
    );

    assert_eq!(worker.heartbeat_task(id).await.unwrap(), Some(false));
    assert!(worker.mark_task_finished(id).await.unwrap());

    let stats = client.stats().await.unwrap();
    assert_eq!(
        (stats.num_pending, stats.num_running, stats.num_canceling, stats.num_finished),
        (0, 0, 0, 1)
    );
    assert!(client.task_info(id).await.unwrap().is_none());

    shutdown.cancel();
}

#[tokio::test]
async fn test_scoring_assigns_better_matched_worker_first() {
    let (addr, shutdown) = default_server().await;

    let mut client = TaskClient::connect(&addr).await.unwrap();
    client
        .create_task(&create_info("task one", &["GPU"], &["XYZ"]))
        .await
        .unwrap();
    client
        .create_task(&create_info("task two", &["GPU"], &["XYZ"]))
        .await
        .unwrap();

    let mut worker_b = TaskClient::connect(&addr).await.unwrap();
    worker_b
        .worker_hello(&worker_tags(&["GPU", "XYZ"]))
        .await
        .unwrap();
    let mut worker_a = TaskClient::connect(&addr).await.unwrap();
    worker_a.worker_hello(&worker_tags(&["GPU"])).await.unwrap();

    // B scores 1.0 against either task, A scores 0.0 but is still eligible.
    assert!(worker_b.take_task_to_run().await.unwrap().is_some());
    assert!(worker_a.take_task_to_run().await.unwrap().is_some());

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.num_running, 2);
    assert_eq!(stats.num_pending, 0);

    shutdown.cancel();
}

#[tokio::test]
async fn test_required_mismatch_yields_no_work() {
    let (addr, shutdown) = default_server().await;

    let mut client = TaskClient::connect(&addr).await.unwrap();
    client
        .create_task(&create_info("train", &["GPU"], &[]))
        .await
        .unwrap();

    let mut worker = TaskClient::connect(&addr).await.unwrap();
    worker.worker_hello(&worker_tags(&["CPU"])).await.unwrap();
    assert!(worker.take_task_to_run().await.unwrap().is_none());

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.num_pending, 1);
    assert_eq!(stats.num_running, 0);

    shutdown.cancel();
}

#[tokio::test]
async fn test_cancel_running_task() {
    let (addr, shutdown) = default_server().await;

    let mut worker = TaskClient::connect(&addr).await.unwrap();
    worker.worker_hello(&worker_tags(&[])).await.unwrap();

    let mut client = TaskClient::connect(&addr).await.unwrap();
    let id = client
        .create_task(&create_info("sleep 100", &[], &[]))
        .await
        .unwrap();
    let assignment = worker.take_task_to_run().await.unwrap().unwrap();
    assert_eq!(assignment.id, id);

    assert!(client.mark_task_should_cancel(id).await.unwrap());
    let (status, _) = client.task_info(id).await.unwrap().unwrap();
    assert_eq!(status.state(), TaskState::Canceling);

    // The cancel is advisory until the worker observes it.
    assert_eq!(worker.heartbeat_task(id).await.unwrap(), Some(true));
    assert!(worker.mark_task_finished(id).await.unwrap());

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.num_canceling, 0);
    assert_eq!(stats.num_finished, 1);

    shutdown.cancel();
}

#[tokio::test]
async fn test_cancel_pending_task() {
    let (addr, shutdown) = default_server().await;

    let mut client = TaskClient::connect(&addr).await.unwrap();
    let id = client
        .create_task(&create_info("true", &["NO-SUCH-WORKER"], &[]))
        .await
        .unwrap();

    assert!(client.mark_task_should_cancel(id).await.unwrap());
    assert!(client.task_info(id).await.unwrap().is_none());

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.num_finished, 1);

    shutdown.cancel();
}

#[tokio::test]
async fn test_double_cancel_and_double_finish() {
    let (addr, shutdown) = default_server().await;

    let mut worker = TaskClient::connect(&addr).await.unwrap();
    worker.worker_hello(&worker_tags(&[])).await.unwrap();

    let mut client = TaskClient::connect(&addr).await.unwrap();
    let id = client
        .create_task(&create_info("true", &[], &[]))
        .await
        .unwrap();
    worker.take_task_to_run().await.unwrap().unwrap();

    assert!(client.mark_task_should_cancel(id).await.unwrap());
    assert!(!client.mark_task_should_cancel(id).await.unwrap());

    assert!(worker.mark_task_finished(id).await.unwrap());
    assert!(!worker.mark_task_finished(id).await.unwrap());

    shutdown.cancel();
}

#[tokio::test]
async fn test_heartbeat_after_reap_reports_unknown() {
    let (addr, shutdown) = spawn_server(ServerConfig {
        reap_interval: Duration::from_millis(100),
        heartbeat_timeout_secs: 1,
        ..ServerConfig::default()
    })
    .await;

    let mut worker = TaskClient::connect(&addr).await.unwrap();
    worker.worker_hello(&worker_tags(&[])).await.unwrap();

    let mut client = TaskClient::connect(&addr).await.unwrap();
    let id = client
        .create_task(&create_info("sleep 100", &[], &[]))
        .await
        .unwrap();
    worker.take_task_to_run().await.unwrap().unwrap();

    // Go silent past the heartbeat timeout; the reaper finishes the task.
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(client.task_info(id).await.unwrap().is_none());
    let stats = client.stats().await.unwrap();
    assert_eq!(stats.num_running, 0);
    assert_eq!(stats.num_finished, 1);

    assert_eq!(worker.heartbeat_task(id).await.unwrap(), None);

    shutdown.cancel();
}

#[tokio::test]
async fn test_poll_before_hello_is_rejected() {
    let (addr, shutdown) = default_server().await;

    let mut worker = TaskClient::connect(&addr).await.unwrap();
    assert!(matches!(
        worker.take_task_to_run().await,
        Err(DispatchError::Server(_))
    ));

    shutdown.cancel();
}

#[tokio::test]
async fn test_list_and_refusal() {
    let (addr, shutdown) = spawn_server(ServerConfig {
        max_list_tasks: 2,
        ..ServerConfig::default()
    })
    .await;

    let mut client = TaskClient::connect(&addr).await.unwrap();
    let first = client
        .create_task(&create_info("a", &[], &[]))
        .await
        .unwrap();
    client.create_task(&create_info("b", &[], &[])).await.unwrap();

    let all_states = [TaskState::Pending, TaskState::Running, TaskState::Canceling];
    let briefs = client.tasks_by_states(&all_states).await.unwrap().unwrap();
    assert_eq!(briefs.len(), 2);
    assert!(briefs.iter().any(|b| b.id == first));

    client.create_task(&create_info("c", &[], &[])).await.unwrap();
    assert!(client.tasks_by_states(&all_states).await.unwrap().is_none());

    shutdown.cancel();
}

#[tokio::test]
async fn test_info_returns_status_and_schedule() {
    let (addr, shutdown) = default_server().await;

    let mut client = TaskClient::connect(&addr).await.unwrap();
    let id = client
        .create_task(&create_info("train", &["GPU"], &["XYZ"]))
        .await
        .unwrap();

    let (status, schedule) = client.task_info(id).await.unwrap().unwrap();
    assert_eq!(status.state(), TaskState::Pending);
    assert_eq!(schedule.required, vec!["GPU".to_string()]);
    assert_eq!(schedule.optional, vec!["XYZ".to_string()]);

    assert!(client.get_task_status(id).await.unwrap().is_some());
    assert!(client.get_task_schedule(id).await.unwrap().is_some());
    assert!(client.task_info(TaskId(0)).await.unwrap().is_none());

    shutdown.cancel();
}

#[tokio::test]
async fn test_wait_returns_once_task_finishes() {
    let (addr, shutdown) = default_server().await;

    let mut client = TaskClient::connect(&addr).await.unwrap();
    let id = client
        .create_task(&create_info("true", &[], &[]))
        .await
        .unwrap();

    let wait_addr = addr.clone();
    let waiter = tokio::spawn(async move {
        let mut client = TaskClient::connect(&wait_addr).await.unwrap();
        client.wait_until_finished(id).await.unwrap();
    });

    // Give the waiter time to subscribe, then run the task through.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut worker = TaskClient::connect(&addr).await.unwrap();
    worker.worker_hello(&worker_tags(&[])).await.unwrap();
    worker.take_task_to_run().await.unwrap().unwrap();
    worker.mark_task_finished(id).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("wait did not observe the finish")
        .unwrap();

    shutdown.cancel();
}

#[tokio::test]
async fn test_wait_on_unknown_task_returns_immediately() {
    let (addr, shutdown) = default_server().await;

    let mut client = TaskClient::connect(&addr).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(1),
        client.wait_until_finished(TaskId(0x1234)),
    )
    .await
    .expect("wait on unknown id should not block")
    .unwrap();

    shutdown.cancel();
}

#[tokio::test]
async fn test_worker_loop_executes_a_command() {
    let (addr, shutdown) = default_server().await;

    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    let worker = TaskWorker::new(addr.clone(), worker_tags(&["GPU"]), test_worker_config());
    let worker_shutdown = CancellationToken::new();
    let worker_handle = {
        let token = worker_shutdown.clone();
        tokio::spawn(async move { worker.run(token).await })
    };

    let mut client = TaskClient::connect(&addr).await.unwrap();
    let id = client
        .create_task(&create_info(
            &format!("touch {}", marker.display()),
            &["GPU"],
            &[],
        ))
        .await
        .unwrap();

    let mut wait_client = TaskClient::connect(&addr).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), wait_client.wait_until_finished(id))
        .await
        .expect("task did not finish in time")
        .unwrap();
    assert!(marker.exists(), "the task command never ran");

    worker_shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), worker_handle)
        .await
        .expect("worker did not drain")
        .unwrap()
        .unwrap();

    shutdown.cancel();
}

#[tokio::test]
async fn test_worker_loop_kills_canceled_task() {
    let (addr, shutdown) = default_server().await;

    let worker = TaskWorker::new(addr.clone(), worker_tags(&[]), test_worker_config());
    let worker_shutdown = CancellationToken::new();
    let worker_handle = {
        let token = worker_shutdown.clone();
        tokio::spawn(async move { worker.run(token).await })
    };

    let mut client = TaskClient::connect(&addr).await.unwrap();
    let id = client
        .create_task(&create_info("sleep 600", &[], &[]))
        .await
        .unwrap();

    // Wait for the worker to pick the task up.
    let mut observed_running = false;
    for _ in 0..100 {
        if let Some(status) = client.get_task_status(id).await.unwrap() {
            if status.state() == TaskState::Running {
                observed_running = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(observed_running, "worker never started the task");

    assert!(client.mark_task_should_cancel(id).await.unwrap());

    // The next heartbeat tells the worker to kill the sleep; the task
    // finishes long before its 600 seconds are up.
    let mut wait_client = TaskClient::connect(&addr).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), wait_client.wait_until_finished(id))
        .await
        .expect("canceled task was not torn down")
        .unwrap();

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.num_canceling, 0);
    assert_eq!(stats.num_finished, 1);

    worker_shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), worker_handle)
        .await
        .expect("worker did not drain")
        .unwrap()
        .unwrap();

    shutdown.cancel();
}
