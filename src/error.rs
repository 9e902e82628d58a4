use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed payload: {0}")]
    Decode(&'static str),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("server error: {0}")]
    Server(String),

    #[error("invalid server address \"{0}\"")]
    InvalidAddress(String),

    #[error("invalid task id \"{0}\"")]
    InvalidTaskId(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
