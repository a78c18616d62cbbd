//! # copybench
//!
//! TCP echo benchmark comparing three ways of handing a segmented message
//! to the kernel: a two-copy baseline, scatter-gather, and Linux
//! `MSG_ZEROCOPY` with error-queue completion tracking.
//!
//! A [`server::Server`] echoes every full message it receives; a
//! [`client::LoadGenerator`] drives timed request/echo exchanges over
//! several concurrent connections and reports throughput and latency.
//!
//! ## Crate structure
//!
//! - [`message`]: 8-segment message model and per-session pool
//! - [`strategy`]: full-copy, scatter-gather and zero-copy transmit paths
//! - [`tracker`]: zero-copy completion records and buffer ownership
//! - [`net`]: socket setup and `MSG_ZEROCOPY` syscalls
//! - [`session`]: per-connection echo and exchange loops
//! - [`server`]: accept loop, admission control, supervised shutdown
//! - [`client`]: load generator
//! - [`shutdown`]: cancellation signal that wakes blocked waits
//! - [`stats`]: session counters and run summary
//! - [`config`]: TOML configuration
//! - [`error`]: error types

pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod net;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod stats;
pub mod strategy;
pub mod tracker;
