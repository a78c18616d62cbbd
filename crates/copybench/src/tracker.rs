//! # Completion Tracker
//!
//! Bookkeeping for in-flight `MSG_ZEROCOPY` submissions on one connection.
//!
//! Every accepted submission becomes a completion record that *owns* the
//! submitted [`Message`]. The submitter keeps only a [`CompletionId`], which
//! cannot reach the bytes. Records move through
//!
//! ```text
//! PENDING ──(kernel notification)──▶ COMPLETED ──(release)──▶ RELEASED
//! ```
//!
//! and only [`CompletionTracker::release`] on a COMPLETED record hands the
//! message back. RELEASED is terminal: the record is removed.
//!
//! The kernel numbers zero-copy sends with a per-socket 32-bit counter (one
//! value per `sendmsg` call that accepted bytes) and reports finished sends
//! as inclusive, possibly coalesced, ranges of those numbers on the socket
//! error queue. A record stores the counter values its submission consumed
//! and completes when all of them have been reported.
//!
//! A tracker is owned by exactly one session and is never shared.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::TransferError;
use crate::message::Message;

// ─── Channel ────────────────────────────────────────────────────────────────

/// One completion report: kernel send ids `lo..=hi` are finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub lo: u32,
    pub hi: u32,
    /// The kernel fell back to copying for this range.
    pub copied: bool,
}

impl Notification {
    fn covers(&self, seq: u32) -> bool {
        seq.wrapping_sub(self.lo) <= self.hi.wrapping_sub(self.lo)
    }
}

/// Source of completion notifications (the socket error queue in
/// production, a scripted queue in tests).
pub trait CompletionChannel: Send {
    /// Non-blocking read of one notification. `Ok(None)` means nothing is
    /// queued right now.
    fn try_recv(&mut self) -> io::Result<Option<Notification>>;

    /// Block until a notification may be available or `timeout` elapses.
    /// Returns `false` on timeout.
    fn wait(&mut self, timeout: Duration) -> io::Result<bool>;
}

// ─── Records ────────────────────────────────────────────────────────────────

/// Opaque handle to a record. Carries no access to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompletionId(u64);

impl CompletionId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CompletionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zc#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    Completed,
    Released,
}

/// Kernel send ids consumed by one submission: `first .. first + count`
/// (wrapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqRange {
    pub first: u32,
    pub count: u32,
}

impl SeqRange {
    fn iter(&self) -> impl Iterator<Item = u32> {
        let first = self.first;
        (0..self.count).map(move |k| first.wrapping_add(k))
    }
}

#[derive(Debug)]
struct CompletionRecord {
    id: CompletionId,
    seqs: SeqRange,
    /// Per-seq "reported" flags so a repeated range cannot over-count.
    reported: Vec<bool>,
    bytes: usize,
    state: RecordState,
    copied: bool,
    message: Message,
}

impl CompletionRecord {
    /// Apply a notification; returns true on the PENDING → COMPLETED edge.
    fn apply(&mut self, n: &Notification) -> bool {
        if self.state != RecordState::Pending {
            return false;
        }
        for (k, seq) in self.seqs.iter().enumerate() {
            if n.covers(seq) && !self.reported[k] {
                self.reported[k] = true;
                self.copied |= n.copied;
            }
        }
        if self.reported.iter().all(|&r| r) {
            self.state = RecordState::Completed;
            return true;
        }
        false
    }
}

// ─── Tracker ────────────────────────────────────────────────────────────────

pub struct CompletionTracker<C: CompletionChannel> {
    channel: C,
    watermark: usize,
    records: VecDeque<CompletionRecord>,
    /// Newly completed records not yet reported by `poll_one`.
    ready: VecDeque<CompletionId>,
    next_id: u64,
    copied_completions: u64,
    leaked: u64,
}

impl<C: CompletionChannel> CompletionTracker<C> {
    pub fn new(channel: C, watermark: usize) -> Self {
        CompletionTracker {
            channel,
            watermark: watermark.max(1),
            records: VecDeque::with_capacity(watermark),
            ready: VecDeque::new(),
            next_id: 0,
            copied_completions: 0,
            leaked: 0,
        }
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    /// Records not yet released (PENDING or COMPLETED).
    pub fn outstanding(&self) -> usize {
        self.records.len()
    }

    pub fn pending(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.state == RecordState::Pending)
            .count()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.watermark
    }

    pub fn copied_completions(&self) -> u64 {
        self.copied_completions
    }

    pub fn leaked(&self) -> u64 {
        self.leaked
    }

    /// State of a record; `Released` once it has been handed back, `None`
    /// for ids this tracker never issued.
    pub fn state(&self, id: CompletionId) -> Option<RecordState> {
        if let Some(r) = self.records.iter().find(|r| r.id == id) {
            return Some(r.state);
        }
        (id.0 < self.next_id).then_some(RecordState::Released)
    }

    /// Take ownership of a submitted message as a new PENDING record.
    ///
    /// At the watermark the message is handed back untouched; the caller
    /// must drain before trying again.
    pub fn register(
        &mut self,
        message: Message,
        seqs: SeqRange,
        bytes: usize,
    ) -> Result<CompletionId, Message> {
        if self.is_full() {
            return Err(message);
        }
        let id = CompletionId(self.next_id);
        self.next_id += 1;
        let mut record = CompletionRecord {
            id,
            seqs,
            reported: vec![false; seqs.count as usize],
            bytes,
            state: RecordState::Pending,
            copied: false,
            message,
        };
        // A submission that never reached the kernel has nothing to wait for.
        if seqs.count == 0 {
            record.state = RecordState::Completed;
            self.ready.push_back(id);
        }
        self.records.push_back(record);
        Ok(id)
    }

    /// Report at most one newly COMPLETED record without blocking.
    pub fn poll_one(&mut self) -> Result<Option<CompletionId>, TransferError> {
        loop {
            if let Some(id) = self.ready.pop_front() {
                return Ok(Some(id));
            }
            match self.channel.try_recv() {
                Ok(Some(n)) => self.apply(n),
                Ok(None) => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransferError::CompletionChannel(e)),
            }
        }
    }

    fn apply(&mut self, n: Notification) {
        let mut matched = false;
        for record in self.records.iter_mut() {
            if record.apply(&n) {
                matched = true;
                if record.copied {
                    self.copied_completions += 1;
                }
                self.ready.push_back(record.id);
            }
        }
        if !matched {
            debug!(lo = n.lo, hi = n.hi, "notification matched no new completion");
        }
    }

    /// Poll until nothing more is ready. Returns the newly completed ids.
    pub fn drain_available(&mut self) -> Result<Vec<CompletionId>, TransferError> {
        let mut done = Vec::new();
        while let Some(id) = self.poll_one()? {
            done.push(id);
        }
        Ok(done)
    }

    /// Wait (bounded) until at least one record completes.
    ///
    /// Returns `Ok(None)` if nothing completed within `timeout`.
    pub fn wait_one(&mut self, timeout: Duration) -> Result<Option<CompletionId>, TransferError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(id) = self.poll_one()? {
                return Ok(Some(id));
            }
            if self.pending() == 0 {
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.channel
                .wait(deadline - now)
                .map_err(TransferError::CompletionChannel)?;
        }
    }

    /// Teardown drain: wait until no record is PENDING or `timeout`
    /// elapses. Returns the ids that completed and how many are still
    /// pending.
    pub fn drain_all_blocking(
        &mut self,
        timeout: Duration,
    ) -> Result<(Vec<CompletionId>, usize), TransferError> {
        let deadline = Instant::now() + timeout;
        let mut done = self.drain_available()?;
        while self.pending() > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if let Some(id) = self.wait_one(deadline - now)? {
                done.push(id);
                done.extend(self.drain_available()?);
            }
        }
        Ok((done, self.pending()))
    }

    /// COMPLETED → RELEASED: hand the buffer back to the application.
    pub fn release(&mut self, id: CompletionId) -> Result<Message, TransferError> {
        let pos = self
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or(TransferError::UnknownRecord(id.0))?;
        if self.records[pos].state != RecordState::Completed {
            return Err(TransferError::ReleasePending(id.0));
        }
        let record = self
            .records
            .remove(pos)
            .ok_or(TransferError::UnknownRecord(id.0))?;
        self.ready.retain(|r| *r != id);
        Ok(record.message)
    }

    /// Release every COMPLETED record, oldest first.
    pub fn release_completed(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < self.records.len() {
            if self.records[i].state == RecordState::Completed {
                if let Some(r) = self.records.remove(i) {
                    out.push(r.message);
                }
            } else {
                i += 1;
            }
        }
        self.ready.retain(|id| self.records.iter().any(|r| r.id == *id));
        out
    }

    /// Bytes submitted by records that are still PENDING.
    pub fn pending_bytes(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.state == RecordState::Pending)
            .map(|r| r.bytes)
            .sum()
    }

    /// Give up on PENDING records without freeing their buffers.
    ///
    /// The kernel may still read from those pages, so the memory is leaked
    /// instead of returned to the allocator. Returns how many were leaked.
    pub fn abandon_pending(&mut self) -> usize {
        let mut leaked = 0;
        let mut kept = VecDeque::with_capacity(self.records.len());
        for record in self.records.drain(..) {
            if record.state == RecordState::Pending {
                std::mem::forget(record.message);
                leaked += 1;
            } else {
                kept.push_back(record);
            }
        }
        self.records = kept;
        self.leaked += leaked as u64;
        leaked
    }
}

impl<C: CompletionChannel> Drop for CompletionTracker<C> {
    fn drop(&mut self) {
        let pending = self.pending();
        if pending > 0 {
            let bytes = self.pending_bytes();
            let leaked = self.abandon_pending();
            warn!(
                leaked,
                bytes, "dropping tracker with pending zero-copy sends, leaking buffers"
            );
        }
    }
}

impl<C: CompletionChannel> fmt::Debug for CompletionTracker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionTracker")
            .field("watermark", &self.watermark)
            .field("outstanding", &self.records.len())
            .field("pending", &self.pending())
            .finish()
    }
}
