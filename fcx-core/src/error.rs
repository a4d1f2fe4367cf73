use thiserror::Error;

use crate::assembler::State;

/// Errors that terminate a single FastCGI connection.
#[derive(Debug, Error)]
pub enum FcgiError {
    /// Buffered, unprocessed input grew past the per-connection cap.
    #[error("buffered input of {buffered} bytes exceeds the {limit} byte cap")]
    FrameTooLarge { buffered: usize, limit: usize },

    #[error("unsupported FastCGI version: {0} (expected 1)")]
    UnsupportedVersion(u8),

    #[error("malformed {record} record: {reason}")]
    MalformedRecord {
        record: &'static str,
        reason: &'static str,
    },

    #[error("record content of {0} bytes exceeds 65535")]
    ContentTooLarge(usize),

    #[error("unexpected record type {record_type} for request {request_id} in state {state:?}")]
    UnexpectedRecord {
        state: State,
        record_type: u8,
        request_id: u16,
    },

    #[error("PARAMS exceeds size limit ({0} bytes)")]
    ParamsTooLarge(usize),

    #[error("STDIN exceeds size limit ({0} bytes)")]
    StdinTooLarge(usize),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FcgiError {
    /// Orderly peer shutdown, as opposed to a protocol or transport failure.
    pub fn is_peer_close(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FcgiError>;
