use chrono::Utc;

/// Opaque task identity: 64 random bits, rendered to users as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn parse_hex(s: &str) -> Option<TaskId> {
        u64::from_str_radix(s, 16).ok().map(TaskId)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.hex())
    }
}

/// Current wall-clock time in whole seconds since the epoch.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskState {
    Pending,
    Running,
    Canceling,
}

impl TaskState {
    pub fn as_byte(self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Running => 1,
            TaskState::Canceling => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<TaskState> {
        match b {
            0 => Some(TaskState::Pending),
            1 => Some(TaskState::Running),
            2 => Some(TaskState::Canceling),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Canceling => write!(f, "canceling"),
        }
    }
}

/// Where a task may run: resource tags the worker must have, and tags it
/// would be nice for the worker to have (these drive the match score).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSchedule {
    pub required: Vec<String>,
    pub optional: Vec<String>,
}

/// Present iff the task has been taken by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRunStatus {
    pub start_time: i64,
    pub heartbeat_time: i64,
    pub was_canceled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStatus {
    pub create_time: i64,
    pub run_status: Option<TaskRunStatus>,
}

impl TaskStatus {
    pub fn state(&self) -> TaskState {
        match &self.run_status {
            Some(run) if run.was_canceled => TaskState::Canceling,
            Some(_) => TaskState::Running,
            None => TaskState::Pending,
        }
    }

    /// One-line human-readable summary, e.g.
    /// `running (runtime 1m4s; last heartbeat 3s ago)`.
    pub fn summary(&self, now: i64) -> String {
        match &self.run_status {
            None => format!("pending (waited {} so far)", format_interval(now - self.create_time)),
            Some(run) => format!(
                "{} (runtime {}; last heartbeat {} ago)",
                self.state(),
                format_interval(now - run.start_time),
                format_interval(now - run.heartbeat_time),
            ),
        }
    }
}

/// Render a span of seconds as `1d2h3m4s`, omitting leading zero units.
pub fn format_interval(interval: i64) -> String {
    let mut rest = interval.max(0);
    let seconds = rest % 60;
    rest /= 60;
    let minutes = rest % 60;
    rest /= 60;
    let hours = rest % 24;
    let days = rest / 24;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{}d", days));
    }
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&format!("{}s", seconds));
    out
}

/// One scheduling record. `command` and `schedule` are fixed at creation;
/// only `status.run_status` mutates afterwards, and only through the
/// database.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub command: String,
    pub schedule: TaskSchedule,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(id: TaskId, info: &TaskCreateInfo) -> Self {
        Self {
            id,
            command: info.command.clone(),
            schedule: info.schedule.clone(),
            status: TaskStatus {
                create_time: now_secs(),
                run_status: None,
            },
        }
    }

    pub fn state(&self) -> TaskState {
        self.status.state()
    }
}

/// Everything a client supplies to enqueue a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskCreateInfo {
    pub command: String,
    pub schedule: TaskSchedule,
}

/// Aggregate counters over the life of the server. The first three always
/// sum to the number of live tasks; `num_finished` only ever grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub num_pending: u64,
    pub num_running: u64,
    pub num_canceling: u64,
    pub num_finished: u64,
}

/// One `list` reply entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskBrief {
    pub id: TaskId,
    pub status: TaskStatus,
}

/// What a worker receives from a successful poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAssignment {
    pub id: TaskId,
    pub command: String,
}
