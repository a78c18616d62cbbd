//! # Benchmark Statistics
//!
//! Per-session counters and the run-wide [`Summary`] folded from them.
//! Everything is `Serialize` so the client can emit a JSON report.

use std::time::Duration;

use serde::Serialize;

use crate::config::StrategyKind;

// ─── Session Stats ──────────────────────────────────────────────────────────

/// Counters owned and mutated by exactly one session thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    /// Participant id (accept order on the server, index on the client).
    pub session_id: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Client, zero-copy: counted once the completion arrives.
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Sum of request → full echo latencies in µs (client only).
    pub total_latency_us: f64,
    /// Zero-copy submissions rejected for backpressure and retried.
    pub backpressure_events: u64,
    /// Completions where the kernel fell back to copying.
    pub copied_completions: u64,
    /// Buffers leaked because their completion never arrived.
    pub leaked_buffers: u64,
    /// Set when the session ended on something other than a clean close.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionStats {
    pub fn new(session_id: usize) -> Self {
        Self {
            session_id,
            ..Self::default()
        }
    }

    pub fn record_latency(&mut self, latency: Duration) {
        self.total_latency_us += latency.as_secs_f64() * 1e6;
    }
}

// ─── Summary ────────────────────────────────────────────────────────────────

/// Aggregate over all sessions of one run. Derived once after every
/// session has joined; never updated incrementally.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub strategy: StrategyKind,
    pub message_size: usize,
    /// Sessions that ran (including ones that failed early).
    pub sessions: usize,
    /// Sessions that ended with an error.
    pub failed_sessions: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub total_latency_us: f64,
    pub backpressure_events: u64,
    pub copied_completions: u64,
    pub leaked_buffers: u64,
    /// Configured run length in seconds; the throughput denominator.
    pub duration_secs: f64,
}

impl Summary {
    pub fn fold<'a>(
        strategy: StrategyKind,
        message_size: usize,
        duration: Duration,
        sessions: impl IntoIterator<Item = &'a SessionStats>,
    ) -> Self {
        let mut s = Summary {
            strategy,
            message_size,
            duration_secs: duration.as_secs_f64(),
            ..Summary::default()
        };
        for st in sessions {
            s.sessions += 1;
            if st.error.is_some() {
                s.failed_sessions += 1;
            }
            s.bytes_sent += st.bytes_sent;
            s.bytes_received += st.bytes_received;
            s.messages_sent += st.messages_sent;
            s.messages_received += st.messages_received;
            s.total_latency_us += st.total_latency_us;
            s.backpressure_events += st.backpressure_events;
            s.copied_completions += st.copied_completions;
            s.leaked_buffers += st.leaked_buffers;
        }
        s
    }

    /// Completed request/echo exchanges.
    pub fn round_trips(&self) -> u64 {
        self.messages_received
    }

    /// `(sent + received) * 8 / (duration * 1e9)`.
    pub fn throughput_gbps(&self) -> f64 {
        if self.duration_secs <= 0.0 {
            return 0.0;
        }
        (self.bytes_sent + self.bytes_received) as f64 * 8.0 / (self.duration_secs * 1e9)
    }

    /// Mean round-trip latency in µs, or 0 if nothing completed.
    pub fn avg_latency_us(&self) -> f64 {
        match self.round_trips() {
            0 => 0.0,
            n => self.total_latency_us / n as f64,
        }
    }
}

/// Flat report for JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    #[serde(flatten)]
    pub summary: Summary,
    pub throughput_gbps: f64,
    pub avg_latency_us: f64,
}

impl From<Summary> for Report {
    fn from(summary: Summary) -> Self {
        Report {
            throughput_gbps: summary.throughput_gbps(),
            avg_latency_us: summary.avg_latency_us(),
            summary,
        }
    }
}
