//! Benchmark configuration.
//!
//! TOML documents deserialize into the `*Input` structs (every field
//! optional) and are then resolved into validated runtime configs with
//! defaults filled in. Binaries apply CLI overrides to the input before
//! resolving, so a file and flags can be mixed.

use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MESSAGE_SIZE: usize = 1024;
pub const DEFAULT_MAX_SESSIONS: usize = 4;
pub const DEFAULT_DURATION_SECS: u64 = 10;

// ─── Strategy selection ─────────────────────────────────────────────────────

/// Which transmit path a session uses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Serialise into one contiguous buffer, then `send`.
    #[default]
    FullCopy,
    /// Hand all segments to one vectored send.
    ScatterGather,
    /// `MSG_ZEROCOPY` with error-queue completion tracking.
    ZeroCopy,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::FullCopy => "full-copy",
            StrategyKind::ScatterGather => "scatter-gather",
            StrategyKind::ZeroCopy => "zero-copy",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full-copy" | "two-copy" | "copy" => Ok(StrategyKind::FullCopy),
            "scatter-gather" | "one-copy" | "sendmsg" => Ok(StrategyKind::ScatterGather),
            "zero-copy" | "zerocopy" | "msg_zerocopy" => Ok(StrategyKind::ZeroCopy),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

// ─── Zero-copy ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ZeroCopyConfigInput {
    pub watermark: Option<usize>,
    pub max_submit_retries: Option<u32>,
    pub completion_timeout_ms: Option<u64>,
}

/// Knobs for the `MSG_ZEROCOPY` path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZeroCopyConfig {
    /// Cap on outstanding (not yet released) submissions per connection.
    /// Too low serialises toward the synchronous strategies; too high pins
    /// more memory in the kernel.
    pub watermark: usize,
    /// How many times one submission may be rejected for backpressure
    /// before the session gives up.
    pub max_submit_retries: u32,
    /// Longest single wait for a completion while resolving backpressure.
    pub completion_timeout: Duration,
}

impl Default for ZeroCopyConfig {
    fn default() -> Self {
        Self {
            watermark: 8,
            max_submit_retries: 64,
            completion_timeout: Duration::from_millis(1000),
        }
    }
}

impl ZeroCopyConfigInput {
    pub fn resolve(self) -> Result<ZeroCopyConfig, ConfigError> {
        let defaults = ZeroCopyConfig::default();
        let watermark = self.watermark.unwrap_or(defaults.watermark);
        if watermark == 0 {
            return Err(ConfigError::OutOfRange {
                field: "zerocopy.watermark",
                min: 1,
            });
        }
        Ok(ZeroCopyConfig {
            watermark,
            max_submit_retries: self
                .max_submit_retries
                .unwrap_or(defaults.max_submit_retries)
                .max(1),
            completion_timeout: self
                .completion_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.completion_timeout),
        })
    }
}

// ─── Server ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfigInput {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub message_size: Option<usize>,
    pub max_sessions: Option<usize>,
    pub strategy: Option<String>,
    pub accept_poll_interval_ms: Option<u64>,
    pub session_poll_interval_ms: Option<u64>,
    pub drain_timeout_ms: Option<u64>,
    pub zerocopy: ZeroCopyConfigInput,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub message_size: usize,
    pub max_sessions: usize,
    pub strategy: StrategyKind,
    /// Upper bound on one accept wait; also bounds how stale the
    /// shutdown check can be if the wake fd is never signalled.
    pub accept_poll_interval: Duration,
    /// Upper bound on one blocking receive inside an echo session.
    pub session_poll_interval: Duration,
    /// Budget for draining zero-copy completions at session teardown.
    pub drain_timeout: Duration,
    pub zerocopy: ZeroCopyConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_PORT,
            message_size: DEFAULT_MESSAGE_SIZE,
            max_sessions: DEFAULT_MAX_SESSIONS,
            strategy: StrategyKind::default(),
            accept_poll_interval: Duration::from_millis(1000),
            session_poll_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_millis(2000),
            zerocopy: ZeroCopyConfig::default(),
        }
    }
}

impl ServerConfigInput {
    pub fn resolve(self) -> Result<ServerConfig, ConfigError> {
        let defaults = ServerConfig::default();
        let max_sessions = self.max_sessions.unwrap_or(defaults.max_sessions);
        if max_sessions == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_sessions",
                min: 1,
            });
        }
        let strategy = match self.strategy {
            Some(s) => s.parse()?,
            None => defaults.strategy,
        };
        Ok(ServerConfig {
            bind: self.bind.unwrap_or(defaults.bind),
            port: self.port.unwrap_or(defaults.port),
            message_size: self.message_size.unwrap_or(defaults.message_size).max(1),
            max_sessions,
            strategy,
            accept_poll_interval: self
                .accept_poll_interval_ms
                .map(|ms| Duration::from_millis(ms.max(1)))
                .unwrap_or(defaults.accept_poll_interval),
            session_poll_interval: self
                .session_poll_interval_ms
                .map(|ms| Duration::from_millis(ms.max(1)))
                .unwrap_or(defaults.session_poll_interval),
            drain_timeout: self
                .drain_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.drain_timeout),
            zerocopy: self.zerocopy.resolve()?,
        })
    }
}

impl ServerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        parse_input::<ServerConfigInput>(input)?.resolve()
    }
}

// ─── Client ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfigInput {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub message_size: Option<usize>,
    pub sessions: Option<usize>,
    pub duration_secs: Option<u64>,
    pub strategy: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub zerocopy: ZeroCopyConfigInput,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub message_size: usize,
    pub sessions: usize,
    pub duration: Duration,
    pub strategy: StrategyKind,
    /// Upper bound on one blocking receive before re-checking the deadline.
    pub poll_interval: Duration,
    pub zerocopy: ZeroCopyConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            message_size: DEFAULT_MESSAGE_SIZE,
            sessions: DEFAULT_MAX_SESSIONS,
            duration: Duration::from_secs(DEFAULT_DURATION_SECS),
            strategy: StrategyKind::default(),
            poll_interval: Duration::from_millis(100),
            zerocopy: ZeroCopyConfig::default(),
        }
    }
}

impl ClientConfigInput {
    pub fn resolve(self) -> Result<ClientConfig, ConfigError> {
        let defaults = ClientConfig::default();
        let duration_secs = self
            .duration_secs
            .unwrap_or(defaults.duration.as_secs());
        if duration_secs == 0 {
            return Err(ConfigError::OutOfRange {
                field: "duration_secs",
                min: 1,
            });
        }
        let strategy = match self.strategy {
            Some(s) => s.parse()?,
            None => defaults.strategy,
        };
        let host = self
            .host
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or(defaults.host);
        Ok(ClientConfig {
            host,
            port: self.port.unwrap_or(defaults.port),
            message_size: self.message_size.unwrap_or(defaults.message_size).max(1),
            sessions: self.sessions.unwrap_or(defaults.sessions).max(1),
            duration: Duration::from_secs(duration_secs),
            strategy,
            poll_interval: self
                .poll_interval_ms
                .map(|ms| Duration::from_millis(ms.max(1)))
                .unwrap_or(defaults.poll_interval),
            zerocopy: self.zerocopy.resolve()?,
        })
    }
}

impl ClientConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        parse_input::<ClientConfigInput>(input)?.resolve()
    }
}

// ─── Loading ────────────────────────────────────────────────────────────────

fn parse_input<T: Default + for<'de> Deserialize<'de>>(input: &str) -> Result<T, ConfigError> {
    if input.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(toml::from_str(input)?)
}

/// Read a TOML file into an input struct, or defaults when `path` is `None`.
pub fn load_input<T: Default + for<'de> Deserialize<'de>>(
    path: Option<&Path>,
) -> Result<T, ConfigError> {
    match path {
        Some(p) => parse_input(&std::fs::read_to_string(p)?),
        None => Ok(T::default()),
    }
}
