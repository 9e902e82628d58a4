use crate::db::task::{
    TaskAssignment, TaskBrief, TaskCreateInfo, TaskId, TaskRunStatus, TaskSchedule, TaskState,
    TaskStats, TaskStatus,
};
use crate::error::{DispatchError, Result};
use crate::wire::codec::{ByteReader, ByteWriter};

/// Reply status byte. Non-zero statuses are followed by an error string.
pub const STATUS_OK: u8 = 0;
pub const STATUS_ERROR: u8 = 1;
pub const STATUS_NOT_FOUND: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OpCode {
    New = 1,
    Cancel = 2,
    Info = 3,
    List = 4,
    Stats = 5,
    Wait = 6,
    WorkerHello = 7,
    WorkerPoll = 8,
    WorkerHeartbeat = 9,
    WorkerFinished = 10,
}

impl OpCode {
    pub fn from_u16(v: u16) -> Option<OpCode> {
        match v {
            1 => Some(OpCode::New),
            2 => Some(OpCode::Cancel),
            3 => Some(OpCode::Info),
            4 => Some(OpCode::List),
            5 => Some(OpCode::Stats),
            6 => Some(OpCode::Wait),
            7 => Some(OpCode::WorkerHello),
            8 => Some(OpCode::WorkerPoll),
            9 => Some(OpCode::WorkerHeartbeat),
            10 => Some(OpCode::WorkerFinished),
            _ => None,
        }
    }
}

/// Everything that travels on the wire implements this pair.
pub trait Wire: Sized {
    fn encode(&self, w: &mut ByteWriter);
    fn decode(r: &mut ByteReader<'_>) -> Result<Self>;
}

impl Wire for bool {
    fn encode(&self, w: &mut ByteWriter) {
        w.put_bool(*self);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        r.take_bool()
    }
}

impl Wire for String {
    fn encode(&self, w: &mut ByteWriter) {
        w.put_str(self);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        r.take_str()
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn encode(&self, w: &mut ByteWriter) {
        w.put_u32(self.len() as u32);
        for item in self {
            item.encode(w);
        }
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let count = r.take_u32()? as usize;
        let mut items = Vec::new();
        for _ in 0..count {
            items.push(T::decode(r)?);
        }
        Ok(items)
    }
}

impl<T: Wire> Wire for Option<T> {
    fn encode(&self, w: &mut ByteWriter) {
        match self {
            Some(value) => {
                w.put_bool(true);
                value.encode(w);
            }
            None => w.put_bool(false),
        }
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        if r.take_bool()? {
            Ok(Some(T::decode(r)?))
        } else {
            Ok(None)
        }
    }
}

impl Wire for TaskId {
    fn encode(&self, w: &mut ByteWriter) {
        w.put_u64(self.0);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(TaskId(r.take_u64()?))
    }
}

impl Wire for TaskState {
    fn encode(&self, w: &mut ByteWriter) {
        w.put_u8(self.as_byte());
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        TaskState::from_byte(r.take_u8()?).ok_or(DispatchError::Decode("unknown task state byte"))
    }
}

impl Wire for TaskSchedule {
    fn encode(&self, w: &mut ByteWriter) {
        self.required.encode(w);
        self.optional.encode(w);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(TaskSchedule {
            required: Vec::decode(r)?,
            optional: Vec::decode(r)?,
        })
    }
}

impl Wire for TaskCreateInfo {
    fn encode(&self, w: &mut ByteWriter) {
        self.command.encode(w);
        self.schedule.encode(w);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(TaskCreateInfo {
            command: String::decode(r)?,
            schedule: TaskSchedule::decode(r)?,
        })
    }
}

impl Wire for TaskRunStatus {
    fn encode(&self, w: &mut ByteWriter) {
        w.put_i64(self.start_time);
        w.put_i64(self.heartbeat_time);
        w.put_bool(self.was_canceled);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(TaskRunStatus {
            start_time: r.take_i64()?,
            heartbeat_time: r.take_i64()?,
            was_canceled: r.take_bool()?,
        })
    }
}

impl Wire for TaskStatus {
    fn encode(&self, w: &mut ByteWriter) {
        w.put_i64(self.create_time);
        self.run_status.encode(w);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(TaskStatus {
            create_time: r.take_i64()?,
            run_status: Option::decode(r)?,
        })
    }
}

impl Wire for TaskStats {
    fn encode(&self, w: &mut ByteWriter) {
        w.put_u64(self.num_pending);
        w.put_u64(self.num_running);
        w.put_u64(self.num_canceling);
        w.put_u64(self.num_finished);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(TaskStats {
            num_pending: r.take_u64()?,
            num_running: r.take_u64()?,
            num_canceling: r.take_u64()?,
            num_finished: r.take_u64()?,
        })
    }
}

impl Wire for TaskBrief {
    fn encode(&self, w: &mut ByteWriter) {
        self.id.encode(w);
        self.status.encode(w);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(TaskBrief {
            id: TaskId::decode(r)?,
            status: TaskStatus::decode(r)?,
        })
    }
}

impl Wire for TaskAssignment {
    fn encode(&self, w: &mut ByteWriter) {
        self.id.encode(w);
        self.command.encode(w);
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(TaskAssignment {
            id: TaskId::decode(r)?,
            command: String::decode(r)?,
        })
    }
}

/// One decoded request frame. The payload starts with the u16 opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    New(TaskCreateInfo),
    Cancel(TaskId),
    Info(TaskId),
    List(Vec<TaskState>),
    Stats,
    Wait(TaskId),
    WorkerHello(Vec<String>),
    WorkerPoll,
    WorkerHeartbeat(TaskId),
    WorkerFinished(TaskId),
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        match self {
            Request::New(info) => {
                w.put_u16(OpCode::New as u16);
                info.encode(&mut w);
            }
            Request::Cancel(id) => {
                w.put_u16(OpCode::Cancel as u16);
                id.encode(&mut w);
            }
            Request::Info(id) => {
                w.put_u16(OpCode::Info as u16);
                id.encode(&mut w);
            }
            Request::List(states) => {
                w.put_u16(OpCode::List as u16);
                states.encode(&mut w);
            }
            Request::Stats => w.put_u16(OpCode::Stats as u16),
            Request::Wait(id) => {
                w.put_u16(OpCode::Wait as u16);
                id.encode(&mut w);
            }
            Request::WorkerHello(tags) => {
                w.put_u16(OpCode::WorkerHello as u16);
                tags.encode(&mut w);
            }
            Request::WorkerPoll => w.put_u16(OpCode::WorkerPoll as u16),
            Request::WorkerHeartbeat(id) => {
                w.put_u16(OpCode::WorkerHeartbeat as u16);
                id.encode(&mut w);
            }
            Request::WorkerFinished(id) => {
                w.put_u16(OpCode::WorkerFinished as u16);
                id.encode(&mut w);
            }
        }
        w.into_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Request> {
        let mut r = ByteReader::new(payload);
        let op = OpCode::from_u16(r.take_u16()?).ok_or(DispatchError::Decode("unknown opcode"))?;
        let request = match op {
            OpCode::New => Request::New(TaskCreateInfo::decode(&mut r)?),
            OpCode::Cancel => Request::Cancel(TaskId::decode(&mut r)?),
            OpCode::Info => Request::Info(TaskId::decode(&mut r)?),
            OpCode::List => Request::List(Vec::decode(&mut r)?),
            OpCode::Stats => Request::Stats,
            OpCode::Wait => Request::Wait(TaskId::decode(&mut r)?),
            OpCode::WorkerHello => Request::WorkerHello(Vec::decode(&mut r)?),
            OpCode::WorkerPoll => Request::WorkerPoll,
            OpCode::WorkerHeartbeat => Request::WorkerHeartbeat(TaskId::decode(&mut r)?),
            OpCode::WorkerFinished => Request::WorkerFinished(TaskId::decode(&mut r)?),
        };
        if !r.is_empty() {
            return Err(DispatchError::Decode("trailing bytes after request body"));
        }
        Ok(request)
    }
}

/// Start an OK reply; the caller appends the response body.
pub fn ok_reply() -> ByteWriter {
    let mut w = ByteWriter::new();
    w.put_u8(STATUS_OK);
    w
}

pub fn error_reply(message: &str) -> Vec<u8> {
    status_reply(STATUS_ERROR, message)
}

pub fn not_found_reply(message: &str) -> Vec<u8> {
    status_reply(STATUS_NOT_FOUND, message)
}

fn status_reply(status: u8, message: &str) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u8(status);
    w.put_str(message);
    w.into_bytes()
}

/// Decoded reply status, consumed from the front of a reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error(String),
    NotFound(String),
}

pub fn read_reply_status(r: &mut ByteReader<'_>) -> Result<ReplyStatus> {
    match r.take_u8()? {
        STATUS_OK => Ok(ReplyStatus::Ok),
        STATUS_NOT_FOUND => Ok(ReplyStatus::NotFound(r.take_str()?)),
        _ => Ok(ReplyStatus::Error(r.take_str()?)),
    }
}
