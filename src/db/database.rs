use std::collections::{BTreeSet, HashMap, HashSet};

use tokio::sync::watch;

use crate::db::task::{
    now_secs, Task, TaskBrief, TaskCreateInfo, TaskId, TaskRunStatus, TaskState, TaskStats,
    TaskStatus,
};

/// The single authoritative store of live tasks. All mutation goes through
/// the methods below; callers serialize access with the server's lock, so
/// every method sees and leaves a consistent state.
#[derive(Debug)]
pub struct TaskDatabase {
    tasks: HashMap<TaskId, Task>,
    pending: BTreeSet<TaskId>,
    stats: TaskStats,
    max_list_tasks: usize,
    changed: watch::Sender<u64>,
}

impl TaskDatabase {
    pub fn new(max_list_tasks: usize) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            tasks: HashMap::new(),
            pending: BTreeSet::new(),
            stats: TaskStats::default(),
            max_list_tasks,
            changed,
        }
    }

    /// Receiver that wakes whenever a task changes state or leaves the
    /// database. `wait` sessions subscribe to this.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    fn touch(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn stats(&self) -> TaskStats {
        self.stats
    }

    pub fn get_task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.tasks.get(&id).map(|t| t.status)
    }

    /// Enqueue a new pending task under a freshly drawn id.
    pub fn create_task(&mut self, info: &TaskCreateInfo) -> Task {
        let id = self.unused_task_id();
        let task = Task::new(id, info);
        self.tasks.insert(id, task.clone());
        self.pending.insert(id);
        self.stats.num_pending += 1;
        self.touch();
        task
    }

    fn unused_task_id(&self) -> TaskId {
        let mut attempts = 0u32;
        loop {
            let id = TaskId(rand::random::<u64>());
            if !self.tasks.contains_key(&id) {
                return id;
            }
            attempts += 1;
            if attempts > 10 {
                tracing::warn!(attempts, "task id generation is taking unusually long");
            }
            if attempts >= 1000 {
                // 64 random bits colliding a thousand times means the RNG
                // is broken; that is a bug, not a recoverable error.
                panic!("failed to find an unused task id after 1000 attempts");
            }
        }
    }

    /// All live tasks currently in one of `states`, or `None` when the
    /// database is too large for listing to be sensible.
    pub fn tasks_by_states(&self, states: &[TaskState]) -> Option<Vec<TaskBrief>> {
        if self.tasks.len() > self.max_list_tasks {
            return None;
        }
        let mut briefs: Vec<TaskBrief> = self
            .tasks
            .values()
            .filter(|t| states.contains(&t.state()))
            .map(|t| TaskBrief {
                id: t.id,
                status: t.status,
            })
            .collect();
        briefs.sort_by_key(|b| (b.status.create_time, b.id));
        Some(briefs)
    }

    /// The scheduling decision: among pending tasks whose `required` tags
    /// the worker has, pick the one with the highest fraction of matched
    /// `optional` tags. Ties fall to the lowest live id.
    pub fn take_task_to_run(&mut self, have: &HashSet<String>) -> Option<Task> {
        let mut best: Option<(TaskId, f32)> = None;
        for &id in &self.pending {
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            if !task.schedule.required.iter().all(|r| have.contains(r)) {
                continue;
            }

            let score = if task.schedule.optional.is_empty() {
                0.0
            } else {
                let matches = task
                    .schedule
                    .optional
                    .iter()
                    .filter(|r| have.contains(r.as_str()))
                    .count();
                matches as f32 / task.schedule.optional.len() as f32
            };

            if best.map_or(true, |(_, s)| score > s) {
                best = Some((id, score));
                if score >= 0.999 {
                    // a full optional match cannot be beaten
                    break;
                }
            }
        }

        let (id, _) = best?;
        self.pending.remove(&id);
        let task = self.tasks.get_mut(&id)?;
        let now = now_secs();
        task.status.run_status = Some(TaskRunStatus {
            start_time: now,
            heartbeat_time: now,
            was_canceled: false,
        });
        self.stats.num_pending -= 1;
        self.stats.num_running += 1;
        let taken = task.clone();
        self.touch();
        Some(taken)
    }

    /// Refresh a running task's liveness clock. Returns whether the task
    /// should cancel, or `None` if the task is unknown (e.g. already
    /// reaped, which the worker treats as finished).
    pub fn heartbeat_task(&mut self, id: TaskId) -> Option<bool> {
        let task = self.tasks.get_mut(&id)?;
        match task.status.run_status.as_mut() {
            Some(run) => {
                run.heartbeat_time = now_secs();
                Some(run.was_canceled)
            }
            None => Some(false),
        }
    }

    /// Request cancellation. A pending task is finished on the spot; a
    /// running task is flipped to canceling and its worker observes the
    /// flag on its next heartbeat. Returns `false` for unknown or
    /// already-canceling tasks.
    pub fn mark_task_should_cancel(&mut self, id: TaskId) -> bool {
        match self.tasks.get(&id).map(|t| t.state()) {
            None => false,
            Some(TaskState::Pending) => self.mark_task_finished(id),
            Some(TaskState::Running) => {
                if let Some(run) = self
                    .tasks
                    .get_mut(&id)
                    .and_then(|t| t.status.run_status.as_mut())
                {
                    run.was_canceled = true;
                }
                self.stats.num_running -= 1;
                self.stats.num_canceling += 1;
                self.touch();
                true
            }
            Some(TaskState::Canceling) => false,
        }
    }

    /// Remove a task and fold it into `num_finished`. Returns `false` if
    /// the id is unknown.
    pub fn mark_task_finished(&mut self, id: TaskId) -> bool {
        let Some(task) = self.tasks.remove(&id) else {
            return false;
        };
        match task.state() {
            TaskState::Pending => {
                self.pending.remove(&id);
                self.stats.num_pending -= 1;
            }
            TaskState::Running => self.stats.num_running -= 1,
            TaskState::Canceling => self.stats.num_canceling -= 1,
        }
        self.stats.num_finished += 1;
        self.touch();
        true
    }

    /// Forcibly finish every assigned task whose heartbeat has lapsed for
    /// at least `timeout_secs`. Pending tasks have no worker and are never
    /// reaped. Returns how many tasks were removed.
    pub fn cleanup_zombie_tasks(&mut self, timeout_secs: i64) -> usize {
        let now = now_secs();
        let zombies: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| {
                t.status
                    .run_status
                    .map_or(false, |run| now - run.heartbeat_time >= timeout_secs)
            })
            .map(|t| t.id)
            .collect();
        for &id in &zombies {
            tracing::warn!(task_id = %id, "reaping zombie task: worker heartbeat lapsed");
            self.mark_task_finished(id);
        }
        zombies.len()
    }
}
