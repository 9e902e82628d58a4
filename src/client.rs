//! Thin client over the framed protocol: one TCP connection, one method
//! per operation.

use tokio::net::TcpStream;

use crate::config::ServerAddress;
use crate::db::{TaskAssignment, TaskBrief, TaskCreateInfo, TaskId, TaskSchedule, TaskState, TaskStats, TaskStatus};
use crate::error::{DispatchError, Result};
use crate::wire::codec::{read_frame, write_frame, ByteReader};
use crate::wire::message::{read_reply_status, ReplyStatus, Request, Wire};

pub struct TaskClient {
    stream: TcpStream,
}

impl TaskClient {
    pub async fn connect(address: &ServerAddress) -> Result<TaskClient> {
        let stream = TcpStream::connect(address.to_addr()).await?;
        Ok(Self { stream })
    }

    async fn round_trip(&mut self, request: &Request) -> Result<Vec<u8>> {
        write_frame(&mut self.stream, &request.encode()).await?;
        read_frame(&mut self.stream)
            .await?
            .ok_or(DispatchError::ConnectionClosed)
    }

    pub async fn create_task(&mut self, info: &TaskCreateInfo) -> Result<TaskId> {
        let reply = self.round_trip(&Request::New(info.clone())).await?;
        let mut r = ByteReader::new(&reply);
        expect_ok(&mut r)?;
        TaskId::decode(&mut r)
    }

    /// Ask the server to cancel. `true` means the request took effect
    /// (the task was pending or running); `false` means the task is
    /// unknown or already canceling.
    pub async fn mark_task_should_cancel(&mut self, id: TaskId) -> Result<bool> {
        let reply = self.round_trip(&Request::Cancel(id)).await?;
        let mut r = ByteReader::new(&reply);
        expect_ok(&mut r)?;
        bool::decode(&mut r)
    }

    /// Status and schedule for a live task, or `None` once it is gone.
    pub async fn task_info(&mut self, id: TaskId) -> Result<Option<(TaskStatus, TaskSchedule)>> {
        let reply = self.round_trip(&Request::Info(id)).await?;
        let mut r = ByteReader::new(&reply);
        expect_ok(&mut r)?;
        if !bool::decode(&mut r)? {
            return Ok(None);
        }
        let status = TaskStatus::decode(&mut r)?;
        let schedule = TaskSchedule::decode(&mut r)?;
        Ok(Some((status, schedule)))
    }

    pub async fn get_task_status(&mut self, id: TaskId) -> Result<Option<TaskStatus>> {
        Ok(self.task_info(id).await?.map(|(status, _)| status))
    }

    pub async fn get_task_schedule(&mut self, id: TaskId) -> Result<Option<TaskSchedule>> {
        Ok(self.task_info(id).await?.map(|(_, schedule)| schedule))
    }

    /// Live tasks in the given states, or `None` when the server refused
    /// because the database is too large for listing.
    pub async fn tasks_by_states(
        &mut self,
        states: &[TaskState],
    ) -> Result<Option<Vec<TaskBrief>>> {
        let reply = self.round_trip(&Request::List(states.to_vec())).await?;
        let mut r = ByteReader::new(&reply);
        expect_ok(&mut r)?;
        Option::decode(&mut r)
    }

    pub async fn stats(&mut self) -> Result<TaskStats> {
        let reply = self.round_trip(&Request::Stats).await?;
        let mut r = ByteReader::new(&reply);
        expect_ok(&mut r)?;
        TaskStats::decode(&mut r)
    }

    /// Block until the task is no longer observable as pending, running,
    /// or canceling, consuming the server's streamed updates.
    pub async fn wait_until_finished(&mut self, id: TaskId) -> Result<()> {
        write_frame(&mut self.stream, &Request::Wait(id).encode()).await?;
        loop {
            let frame = read_frame(&mut self.stream)
                .await?
                .ok_or(DispatchError::ConnectionClosed)?;
            let mut r = ByteReader::new(&frame);
            expect_ok(&mut r)?;
            if Option::<TaskStatus>::decode(&mut r)?.is_none() {
                return Ok(());
            }
        }
    }

    /// Advertise this connection's resource tags. Must precede polling.
    pub async fn worker_hello(&mut self, resources: &[String]) -> Result<()> {
        let reply = self
            .round_trip(&Request::WorkerHello(resources.to_vec()))
            .await?;
        let mut r = ByteReader::new(&reply);
        expect_ok(&mut r)
    }

    /// Ask for a matching task. `None` means nothing suitable is queued.
    pub async fn take_task_to_run(&mut self) -> Result<Option<TaskAssignment>> {
        let reply = self.round_trip(&Request::WorkerPoll).await?;
        let mut r = ByteReader::new(&reply);
        expect_ok(&mut r)?;
        Option::decode(&mut r)
    }

    /// Refresh the task's liveness clock. `Some(should_cancel)` for a
    /// live task; `None` when the server no longer knows the task (it was
    /// reaped or finished), which the worker treats as terminal.
    pub async fn heartbeat_task(&mut self, id: TaskId) -> Result<Option<bool>> {
        let reply = self.round_trip(&Request::WorkerHeartbeat(id)).await?;
        let mut r = ByteReader::new(&reply);
        match read_reply_status(&mut r)? {
            ReplyStatus::Ok => Ok(Some(bool::decode(&mut r)?)),
            ReplyStatus::NotFound(_) => Ok(None),
            ReplyStatus::Error(message) => Err(DispatchError::Server(message)),
        }
    }

    /// Report the task done. `false` when the server no longer knew it.
    pub async fn mark_task_finished(&mut self, id: TaskId) -> Result<bool> {
        let reply = self.round_trip(&Request::WorkerFinished(id)).await?;
        let mut r = ByteReader::new(&reply);
        match read_reply_status(&mut r)? {
            ReplyStatus::Ok => Ok(true),
            ReplyStatus::NotFound(_) => Ok(false),
            ReplyStatus::Error(message) => Err(DispatchError::Server(message)),
        }
    }
}

fn expect_ok(r: &mut ByteReader<'_>) -> Result<()> {
    match read_reply_status(r)? {
        ReplyStatus::Ok => Ok(()),
        ReplyStatus::Error(message) | ReplyStatus::NotFound(message) => {
            Err(DispatchError::Server(message))
        }
    }
}
