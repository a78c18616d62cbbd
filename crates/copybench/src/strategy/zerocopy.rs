//! # Zero-copy Strategy
//!
//! Submits messages with `MSG_ZEROCOPY` and parks each one in a
//! [`CompletionTracker`] until the kernel reports it finished.
//!
//! Two kinds of backpressure are resolved here instead of being surfaced
//! to the session:
//!
//! - the tracker is at its watermark (too many unreleased buffers);
//! - the kernel returns `ENOBUFS` (it refuses to pin more pages).
//!
//! Both are answered the same way: release whatever has completed, wait a
//! bounded time for one more completion, retry. Only after
//! `max_submit_retries` rejections does a submission fail.
//!
//! Any `sendmsg` that accepted bytes consumed one kernel sequence number,
//! so a message split across several calls is only complete once every one
//! of those numbers has been reported.

use std::io;
use std::mem;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{StrategyKind, ZeroCopyConfig};
use crate::error::TransferError;
use crate::message::Message;
use crate::tracker::{CompletionChannel, CompletionId, CompletionTracker, SeqRange};

use super::{DrainOutcome, StrategyCounters, SubmitOutcome, TransferStrategy};

/// A socket that can send straight from caller memory.
///
/// The caller guarantees the slices stay alive and unmodified until the
/// matching completion is observed.
pub trait PinnedSend: Send {
    /// One send attempt over `bufs`; returns the bytes accepted.
    fn send_pinned(&mut self, bufs: &[&[u8]]) -> io::Result<usize>;
}

/// Whether an error is the kernel refusing to pin more pages (`ENOBUFS`,
/// optmem limit hit). That is backpressure, not failure.
pub fn is_resource_exhausted(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOBUFS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The tracker holds `watermark` unreleased records.
    WatermarkReached,
    /// The kernel returned `ENOBUFS` before accepting any byte.
    ResourceExhausted,
}

/// Outcome of a single submission attempt.
#[derive(Debug)]
pub enum TrySubmit {
    Accepted { id: CompletionId, bytes: usize },
    /// Nothing reached the kernel; the message comes back untouched.
    Rejected { message: Message, reason: Rejection },
}

pub struct ZeroCopy<S: PinnedSend, C: CompletionChannel> {
    sender: S,
    tracker: CompletionTracker<C>,
    config: ZeroCopyConfig,
    /// Mirror of the kernel's per-socket zero-copy counter.
    next_seq: u32,
    /// Buffers released while resolving backpressure, handed out by the
    /// next drain.
    reclaimed: Vec<Message>,
    backpressure_events: u64,
}

impl<S: PinnedSend, C: CompletionChannel> ZeroCopy<S, C> {
    pub fn new(sender: S, channel: C, config: ZeroCopyConfig) -> Self {
        ZeroCopy {
            sender,
            tracker: CompletionTracker::new(channel, config.watermark),
            config,
            next_seq: 0,
            reclaimed: Vec::new(),
            backpressure_events: 0,
        }
    }

    pub fn tracker(&self) -> &CompletionTracker<C> {
        &self.tracker
    }

    /// One attempt: either every byte is handed to the kernel and the
    /// message is parked in the tracker, or nothing was sent and the
    /// message is returned.
    ///
    /// `ENOBUFS` after part of the message went out cannot be undone, so
    /// it is waited out here.
    pub fn try_submit(&mut self, message: Message) -> Result<TrySubmit, TransferError> {
        if self.tracker.is_full() {
            return Ok(TrySubmit::Rejected {
                message,
                reason: Rejection::WatermarkReached,
            });
        }

        let total = message.len();
        let first = self.next_seq;
        let mut sent = 0usize;
        let mut calls = 0u32;
        let mut stalls = 0u32;

        while sent < total {
            let result = {
                let bufs = message.slices_from(sent);
                self.sender.send_pinned(&bufs)
            };
            match result {
                Ok(0) => {
                    let err = io::Error::from(io::ErrorKind::WriteZero);
                    return Err(self.park_partial(message, first, calls, sent, err.into()));
                }
                Ok(n) => {
                    sent += n;
                    calls += 1;
                    self.next_seq = self.next_seq.wrapping_add(1);
                }
                Err(e) if is_resource_exhausted(&e) && calls == 0 => {
                    return Ok(TrySubmit::Rejected {
                        message,
                        reason: Rejection::ResourceExhausted,
                    });
                }
                Err(e) if is_resource_exhausted(&e) => {
                    stalls += 1;
                    self.backpressure_events += 1;
                    if stalls > self.config.max_submit_retries {
                        let err = TransferError::RetriesExhausted { attempts: stalls };
                        return Err(self.park_partial(message, first, calls, sent, err));
                    }
                    debug!(sent, total, stalls, "ENOBUFS mid-message, waiting for completions");
                    if let Err(e) = self.tracker.wait_one(self.config.completion_timeout) {
                        return Err(self.park_partial(message, first, calls, sent, e));
                    }
                }
                Err(e) => {
                    return Err(self.park_partial(message, first, calls, sent, e.into()));
                }
            }
        }

        let seqs = SeqRange {
            first,
            count: calls,
        };
        match self.tracker.register(message, seqs, total) {
            Ok(id) => Ok(TrySubmit::Accepted { id, bytes: total }),
            // Capacity was checked above and nothing registers in between.
            Err(message) => {
                mem::forget(message);
                Err(TransferError::RetriesExhausted { attempts: 0 })
            }
        }
    }

    /// A failure after some bytes already went out: the kernel may still
    /// read from the message, so it is parked under the sequence numbers
    /// it consumed instead of being dropped.
    fn park_partial(
        &mut self,
        message: Message,
        first: u32,
        calls: u32,
        sent: usize,
        err: TransferError,
    ) -> TransferError {
        if calls == 0 {
            return err;
        }
        let seqs = SeqRange {
            first,
            count: calls,
        };
        if let Err(message) = self.tracker.register(message, seqs, sent) {
            warn!(sent, "no room to park partially sent message, leaking it");
            mem::forget(message);
        }
        err
    }

    fn collect_reclaimed(&mut self) {
        let released = self.tracker.release_completed();
        self.reclaimed.extend(released);
    }
}

impl<S: PinnedSend, C: CompletionChannel> TransferStrategy for ZeroCopy<S, C> {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ZeroCopy
    }

    fn submit(&mut self, message: Message) -> Result<SubmitOutcome, TransferError> {
        let attempts = self.config.max_submit_retries;
        let mut message = message;
        for attempt in 0..attempts {
            match self.try_submit(message)? {
                TrySubmit::Accepted { id, bytes } => {
                    return Ok(SubmitOutcome::Queued { bytes, id });
                }
                TrySubmit::Rejected { message: back, reason } => {
                    self.backpressure_events += 1;
                    debug!(?reason, attempt, "zero-copy submission rejected, draining");
                    message = back;
                    self.tracker.drain_available()?;
                    self.collect_reclaimed();
                    if self.tracker.is_full() || reason == Rejection::ResourceExhausted {
                        self.tracker.wait_one(self.config.completion_timeout)?;
                        self.collect_reclaimed();
                    }
                }
            }
        }
        // The message never reached the kernel, so dropping it is safe.
        drop(message);
        Err(TransferError::RetriesExhausted { attempts })
    }

    fn drain_completions(&mut self) -> Result<DrainOutcome, TransferError> {
        self.tracker.drain_available()?;
        self.collect_reclaimed();
        Ok(DrainOutcome {
            reclaimed: mem::take(&mut self.reclaimed),
            outstanding: self.tracker.outstanding(),
            abandoned: 0,
        })
    }

    fn finish(&mut self, timeout: Duration) -> Result<DrainOutcome, TransferError> {
        let drained = self.tracker.drain_all_blocking(timeout);
        self.collect_reclaimed();
        let still_pending = match drained {
            Ok((_, still_pending)) => still_pending,
            Err(e) => {
                let leaked = self.tracker.abandon_pending();
                warn!(leaked, error = %e, "completion channel failed during teardown");
                return Err(e);
            }
        };
        let abandoned = if still_pending > 0 {
            let bytes = self.tracker.pending_bytes();
            let leaked = self.tracker.abandon_pending();
            warn!(
                leaked,
                bytes,
                timeout_ms = timeout.as_millis() as u64,
                "zero-copy completions missing at teardown, leaking buffers"
            );
            leaked
        } else {
            0
        };
        Ok(DrainOutcome {
            reclaimed: mem::take(&mut self.reclaimed),
            outstanding: self.tracker.outstanding(),
            abandoned,
        })
    }

    fn counters(&self) -> StrategyCounters {
        StrategyCounters {
            backpressure_events: self.backpressure_events,
            copied_completions: self.tracker.copied_completions(),
            leaked_buffers: self.tracker.leaked(),
        }
    }
}
