// Controller-level errors

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::bpf::{MapError, ProgramError};

#[derive(Error, Debug)]
pub enum TrafficError {
    /// Rejected before any map was touched
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to read socket cookie: {io_error}")]
    SocketCookie { io_error: io::Error },

    #[error("qtaguid command `{command}` failed on {}: {io_error}", path.display())]
    Qtaguid {
        command: String,
        path: PathBuf,
        io_error: io::Error,
    },

    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Program(#[from] ProgramError),
}

impl TrafficError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        TrafficError::InvalidArgument(msg.into())
    }

    /// Raw errno for callers that hand results back over an RPC boundary
    pub fn errno(&self) -> i32 {
        match self {
            TrafficError::InvalidArgument(_) => libc::EINVAL,
            TrafficError::SocketCookie { io_error }
            | TrafficError::Qtaguid { io_error, .. } => io_error.raw_os_error().unwrap_or(libc::EIO),
            TrafficError::Map(e) => e.errno(),
            TrafficError::Program(e) => e.errno(),
        }
    }
}
