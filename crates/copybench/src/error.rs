//! Error taxonomy for the transfer engine.
//!
//! - [`ServerError`] is process-fatal: nothing can run without a listener.
//! - [`TransferError`] is session-local: it ends one connection and is
//!   reported through that session's final statistics.
//! - Zero-copy backpressure is not an error at all; it is resolved inside
//!   the strategy and only surfaces as [`TransferError::RetriesExhausted`].

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

// ── Session-local errors ────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed the connection after {received} of {expected} bytes")]
    PeerClosed { received: usize, expected: usize },
    #[error("failed to allocate {bytes} byte message segment")]
    Alloc { bytes: usize },
    #[error("zero-copy completion channel failed: {0}")]
    CompletionChannel(io::Error),
    #[error("zero-copy submission still rejected after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("completion record {0} released while the kernel may still reference it")]
    ReleasePending(u64),
    #[error("unknown completion record {0}")]
    UnknownRecord(u64),
    #[error("zero-copy unavailable on this socket: {0}")]
    ZeroCopyUnsupported(io::Error),
    /// The server hung up while the client still expected an echo.
    #[error("server closed the connection with an echo outstanding after {round_trips} round trips: {source}")]
    EchoLost {
        round_trips: u64,
        #[source]
        source: Box<TransferError>,
    },
}

impl TransferError {
    /// Client-side view of an error: a hang-up while an echo is owed is a
    /// failed session, not the end of a conversation.
    pub fn echo_owed(self, round_trips: u64) -> TransferError {
        if self.is_disconnect() {
            TransferError::EchoLost {
                round_trips,
                source: Box::new(self),
            }
        } else {
            self
        }
    }

    /// Whether the error is an ordinary end of conversation (peer went
    /// away) rather than something worth a warning.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransferError::PeerClosed { received: 0, .. } => true,
            TransferError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

// ── Process-fatal errors ────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("listener failed: {0}")]
    Listener(#[from] io::Error),
}

impl ServerError {
    /// Exit status used by the binaries; distinct from the generic `1`.
    pub fn exit_code(&self) -> u8 {
        match self {
            ServerError::Bind { .. } => 2,
            ServerError::Listener(_) => 3,
        }
    }
}

// ── Configuration errors ────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unknown transfer strategy '{0}'")]
    UnknownStrategy(String),
    #[error("{field} must be at least {min}")]
    OutOfRange { field: &'static str, min: u64 },
    #[error("cannot read config file: {0}")]
    Read(#[from] io::Error),
}
