//! # Transfer Strategies
//!
//! Three ways of handing one [`Message`] to a TCP socket:
//!
//! - [`FullCopy`]: serialise into a staging buffer, then one `send`
//!   (user → staging → kernel: the two-copy baseline).
//! - [`ScatterGather`]: pass the 8 segments to one vectored send,
//!   eliding the staging copy.
//! - [`ZeroCopy`]: `MSG_ZEROCOPY`; the kernel pins the pages and reports
//!   completion later, so the buffer stays owned by the strategy's
//!   [`CompletionTracker`](crate::tracker::CompletionTracker) until then.
//!
//! All three put identical bytes on the wire.

pub mod copy;
pub mod vectored;
pub mod zerocopy;

use std::net::TcpStream;
use std::time::Duration;

use tracing::warn;

pub use copy::FullCopy;
pub use vectored::ScatterGather;
pub use zerocopy::{Rejection, TrySubmit, ZeroCopy};

use crate::config::{StrategyKind, ZeroCopyConfig};
use crate::error::TransferError;
use crate::message::Message;
use crate::tracker::CompletionId;

// ─── Outcomes ───────────────────────────────────────────────────────────────

/// Result of handing one message to a strategy.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Every byte was accepted synchronously; the buffer is reusable now.
    Sent { bytes: usize, message: Message },
    /// The kernel is sending straight from the buffer. It comes back
    /// through [`TransferStrategy::drain_completions`] once `id` completes.
    Queued { bytes: usize, id: CompletionId },
}

impl SubmitOutcome {
    pub fn bytes(&self) -> usize {
        match self {
            SubmitOutcome::Sent { bytes, .. } | SubmitOutcome::Queued { bytes, .. } => *bytes,
        }
    }
}

/// Buffers handed back by a drain.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    /// Submissions whose completion was observed and whose buffers are
    /// returned in `reclaimed`.
    pub reclaimed: Vec<Message>,
    /// Submissions still in flight after the drain.
    pub outstanding: usize,
    /// Buffers given up on at teardown and leaked.
    pub abandoned: usize,
}

impl DrainOutcome {
    pub fn completed(&self) -> usize {
        self.reclaimed.len()
    }
}

/// Strategy-internal counters folded into session stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StrategyCounters {
    pub backpressure_events: u64,
    pub copied_completions: u64,
    pub leaked_buffers: u64,
}

// ─── Trait ──────────────────────────────────────────────────────────────────

/// Uniform transmit interface over the three copy strategies.
pub trait TransferStrategy: Send {
    fn kind(&self) -> StrategyKind;

    /// Transmit the whole message.
    ///
    /// Backpressure is resolved inside; the only way it surfaces is
    /// [`TransferError::RetriesExhausted`].
    fn submit(&mut self, message: Message) -> Result<SubmitOutcome, TransferError>;

    /// Collect finished asynchronous sends without blocking.
    fn drain_completions(&mut self) -> Result<DrainOutcome, TransferError> {
        Ok(DrainOutcome::default())
    }

    /// Teardown: wait up to `timeout` for everything in flight.
    fn finish(&mut self, _timeout: Duration) -> Result<DrainOutcome, TransferError> {
        Ok(DrainOutcome::default())
    }

    fn counters(&self) -> StrategyCounters {
        StrategyCounters::default()
    }
}

/// Build the strategy for `kind` on the send side of `stream`.
///
/// Zero-copy degrades to scatter-gather when the socket refuses
/// `SO_ZEROCOPY`, so a run on an unsupported kernel still completes.
pub fn build(
    kind: StrategyKind,
    stream: TcpStream,
    zc: &ZeroCopyConfig,
) -> Result<Box<dyn TransferStrategy>, TransferError> {
    match kind {
        StrategyKind::FullCopy => Ok(Box::new(FullCopy::new(stream))),
        StrategyKind::ScatterGather => Ok(Box::new(ScatterGather::new(stream))),
        StrategyKind::ZeroCopy => build_zerocopy(stream, zc),
    }
}

#[cfg(target_os = "linux")]
fn build_zerocopy(
    stream: TcpStream,
    zc: &ZeroCopyConfig,
) -> Result<Box<dyn TransferStrategy>, TransferError> {
    use crate::net::zerocopy::ZeroCopySocket;

    let fallback = stream.try_clone()?;
    match ZeroCopySocket::new(stream) {
        Ok((sender, errqueue)) => Ok(Box::new(ZeroCopy::new(sender, errqueue, zc.clone()))),
        Err(TransferError::ZeroCopyUnsupported(e)) => {
            warn!(error = %e, "SO_ZEROCOPY not supported, falling back to scatter-gather");
            Ok(Box::new(ScatterGather::new(fallback)))
        }
        Err(e) => Err(e),
    }
}

#[cfg(not(target_os = "linux"))]
fn build_zerocopy(
    stream: TcpStream,
    _zc: &ZeroCopyConfig,
) -> Result<Box<dyn TransferStrategy>, TransferError> {
    warn!("MSG_ZEROCOPY is Linux-only, falling back to scatter-gather");
    Ok(Box::new(ScatterGather::new(stream)))
}
