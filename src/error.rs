//! Error types shared across the runtime.
//!
//! A single enum covers everything a session pipeline can observe via
//! `on_error` as well as the build-time configuration failures.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Which idle interval was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleKind {
    Read,
    Write,
}

impl std::fmt::Display for IdleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdleKind::Read => f.write_str("read"),
            IdleKind::Write => f.write_str("write"),
        }
    }
}

/// Runtime error, delivered to session pipelines through `on_error`.
#[derive(Debug, Error)]
pub enum Error {
    /// The memory buffer pool cannot satisfy another allocation.
    #[error("buffer pool exhausted ({used}/{capacity} bytes)")]
    PoolExhausted { used: usize, capacity: usize },

    /// The file store cannot satisfy another region allocation.
    #[error("file store exhausted ({used}/{capacity} bytes)")]
    StoreExhausted { used: u64, capacity: u64 },

    /// The session table has no free slot.
    #[error("session table full ({capacity} slots)")]
    SessionTableFull { capacity: usize },

    /// A dial did not become connectable before its deadline.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// A read or write interval exceeded its configured bound.
    #[error("{kind} idle for {elapsed:?} (limit {limit:?})")]
    IdleTimeout {
        kind: IdleKind,
        elapsed: Duration,
        limit: Duration,
    },

    /// The peer closed the connection.
    #[error("channel closed by peer")]
    ChannelClosed,

    /// A user handler reported an error.
    #[error("handler error: {0}")]
    Handler(String),

    /// An I/O error from a socket or the backing file.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Invalid configuration detected at build time.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// True for pool, store, and session-table exhaustion.
    pub fn is_allocation(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted { .. }
                | Error::StoreExhausted { .. }
                | Error::SessionTableFull { .. }
        )
    }

    /// Shorthand for wrapping a handler-produced message.
    pub fn handler(msg: impl Into<String>) -> Self {
        Error::Handler(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
