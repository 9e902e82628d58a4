use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dispatch_lite::client::TaskClient;
use dispatch_lite::config::{parse_resource_tags, ServerAddress, ServerConfig, WorkerConfig, DEFAULT_PORT};
use dispatch_lite::db::task::now_secs;
use dispatch_lite::db::{TaskCreateInfo, TaskId, TaskSchedule, TaskState};
use dispatch_lite::error::{DispatchError, Result};
use dispatch_lite::server::TaskServer;
use dispatch_lite::shutdown::{install_shutdown_handler, install_worker_shutdown_handler};
use dispatch_lite::worker::TaskWorker;

#[derive(Parser, Debug)]
#[command(name = "dispatch-lite")]
#[command(about = "A minimalistic task dispatch system for heterogeneous compute clusters")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a new task built from the given command tokens
    New {
        /// Task server address, host or host:port
        #[arg(long)]
        server: ServerAddress,

        /// Resource tags a worker must have (space/comma/semicolon separated)
        #[arg(long, default_value = "")]
        require: String,

        /// Resource tags a worker would ideally have
        #[arg(long, default_value = "")]
        want: String,

        /// Command tokens to execute on the worker
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Mark a task for cancellation
    Cancel {
        #[arg(long)]
        server: ServerAddress,

        /// Task id in hex
        id: String,
    },

    /// Block until each listed task is no longer live
    Wait {
        #[arg(long)]
        server: ServerAddress,

        /// Task ids in hex
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Print a task's state, schedule, and timers
    Info {
        #[arg(long)]
        server: ServerAddress,

        /// Task id in hex
        id: String,
    },

    /// Print all live tasks (small-scale debugging aid)
    List {
        #[arg(long)]
        server: ServerAddress,
    },

    /// Print the task counters
    Stats {
        #[arg(long)]
        server: ServerAddress,
    },

    /// Run the worker loop until interrupted
    Worker {
        #[arg(long)]
        server: ServerAddress,

        /// Resource tags this worker advertises
        #[arg(long, default_value = "")]
        have: String,
    },

    /// Run the task server until interrupted
    Server {
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Seconds between zombie-task sweeps
        #[arg(long, default_value_t = 5)]
        reap_interval: u64,

        /// Seconds of heartbeat silence before a running task is reaped
        #[arg(long, default_value_t = 60)]
        heartbeat_timeout: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn parse_task_id(s: &str) -> Result<TaskId> {
    TaskId::parse_hex(s).ok_or_else(|| DispatchError::InvalidTaskId(s.to_string()))
}

async fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::New {
            server,
            require,
            want,
            command,
        } => {
            let info = TaskCreateInfo {
                command: command.join(" "),
                schedule: TaskSchedule {
                    required: parse_resource_tags(&require),
                    optional: parse_resource_tags(&want),
                },
            };
            let mut client = TaskClient::connect(&server).await?;
            let id = client.create_task(&info).await?;
            println!("{}", id);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Cancel { server, id } => {
            let id = parse_task_id(&id)?;
            let mut client = TaskClient::connect(&server).await?;
            if client.mark_task_should_cancel(id).await? {
                println!("canceled task {}", id);
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!(
                    "failed to cancel task {}: it is unknown or already canceling",
                    id
                );
                Ok(ExitCode::FAILURE)
            }
        }

        Commands::Wait { server, ids } => {
            let mut client = TaskClient::connect(&server).await?;
            for id in ids {
                let id = parse_task_id(&id)?;
                client.wait_until_finished(id).await?;
                println!("task {} is no longer live", id);
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Info { server, id } => {
            let id = parse_task_id(&id)?;
            let mut client = TaskClient::connect(&server).await?;
            match client.task_info(id).await? {
                None => {
                    eprintln!(
                        "task {} is not live (finished, canceled, or never existed)",
                        id
                    );
                    Ok(ExitCode::FAILURE)
                }
                Some((status, schedule)) => {
                    println!("{}: {}", id, status.summary(now_secs()));
                    println!("required: {{{}}}", schedule.required.join(", "));
                    println!("optional: {{{}}}", schedule.optional.join(", "));
                    Ok(ExitCode::SUCCESS)
                }
            }
        }

        Commands::List { server } => {
            let mut client = TaskClient::connect(&server).await?;
            let states = [TaskState::Pending, TaskState::Running, TaskState::Canceling];
            match client.tasks_by_states(&states).await? {
                None => {
                    eprintln!(
                        "task list is unavailable: the server has too many tasks. \
                         `list` is a debugging aid for small-scale deployments."
                    );
                    Ok(ExitCode::FAILURE)
                }
                Some(briefs) => {
                    if briefs.is_empty() {
                        println!("no tasks");
                    }
                    let now = now_secs();
                    for brief in briefs {
                        println!("{}: {}", brief.id, brief.status.summary(now));
                    }
                    Ok(ExitCode::SUCCESS)
                }
            }
        }

        Commands::Stats { server } => {
            let mut client = TaskClient::connect(&server).await?;
            let stats = client.stats().await?;
            println!("{} tasks pending", stats.num_pending);
            println!("{} tasks running", stats.num_running);
            println!("{} tasks canceling", stats.num_canceling);
            println!("{} tasks finished", stats.num_finished);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Worker { server, have } => {
            let shutdown = install_worker_shutdown_handler();
            let worker = TaskWorker::new(server, parse_resource_tags(&have), WorkerConfig::default());
            worker.run(shutdown).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Server {
            port,
            reap_interval,
            heartbeat_timeout,
        } => {
            let shutdown = install_shutdown_handler();
            let config = ServerConfig {
                port,
                reap_interval: Duration::from_secs(reap_interval),
                heartbeat_timeout_secs: heartbeat_timeout,
                ..ServerConfig::default()
            };
            TaskServer::new(config).run(shutdown).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
