use std::fmt;
use std::io;

/// Top-level error kind surfaced to users of the crate.
///
/// Mirrors the error kinds enumerated in the protocol design: most
/// variants are delivered exactly once to a send callback, a few are
/// returned synchronously from configuration or setup calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChirpError {
    Success,
    ValueError(String),
    UvError(String),
    ProtocolError(String),
    AddrInUse,
    Fatal(String),
    TlsError(String),
    NotInitialized,
    InProgress,
    Timeout,
    EnoMem,
    Shutdown,
    CannotConnect,
    Queued,
    Used,
    More,
    Busy,
    Empty,
    WriteError(String),
    InitFail(String),
}

impl fmt::Display for ChirpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChirpError::Success => write!(f, "success"),
            ChirpError::ValueError(s) => write!(f, "invalid value: {}", s),
            ChirpError::UvError(s) => write!(f, "i/o error: {}", s),
            ChirpError::ProtocolError(s) => write!(f, "protocol error: {}", s),
            ChirpError::AddrInUse => write!(f, "address already in use"),
            ChirpError::Fatal(s) => write!(f, "fatal error: {}", s),
            ChirpError::TlsError(s) => write!(f, "tls error: {}", s),
            ChirpError::NotInitialized => write!(f, "not initialized"),
            ChirpError::InProgress => write!(f, "operation already in progress"),
            ChirpError::Timeout => write!(f, "timed out"),
            ChirpError::EnoMem => write!(f, "out of memory"),
            ChirpError::Shutdown => write!(f, "shutting down"),
            ChirpError::CannotConnect => write!(f, "cannot connect"),
            ChirpError::Queued => write!(f, "message queued"),
            ChirpError::Used => write!(f, "message already in use"),
            ChirpError::More => write!(f, "more data required"),
            ChirpError::Busy => write!(f, "resource busy"),
            ChirpError::Empty => write!(f, "nothing to do"),
            ChirpError::WriteError(s) => write!(f, "write error: {}", s),
            ChirpError::InitFail(s) => write!(f, "initialization failed: {}", s),
        }
    }
}

impl std::error::Error for ChirpError {}

impl From<io::Error> for ChirpError {
    fn from(e: io::Error) -> Self {
        ChirpError::UvError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChirpError>;
