pub mod codec;
pub mod message;

pub use codec::{read_frame, write_frame, ByteReader, ByteWriter, MAX_FRAME_LEN};
pub use message::{OpCode, ReplyStatus, Request, Wire};
