//! # Load Generator
//!
//! Opens `sessions` concurrent connections, each on its own thread, and
//! drives request/echo exchanges until the configured duration elapses or
//! shutdown is requested. Per-session counters are folded into one
//! [`Summary`] after every thread has joined.

use std::thread;

use quanta::Instant;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::session;
use crate::shutdown::ShutdownSignal;
use crate::stats::{SessionStats, Summary};

pub struct LoadGenerator {
    config: ClientConfig,
}

impl LoadGenerator {
    pub fn new(config: ClientConfig) -> Self {
        LoadGenerator { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run every session to completion and summarise.
    ///
    /// Failures stay inside their session: a session that cannot connect
    /// reports zero counters and an error string.
    pub fn run(&self, shutdown: &ShutdownSignal) -> Summary {
        let config = &self.config;
        info!(
            host = %config.host,
            port = config.port,
            sessions = config.sessions,
            strategy = %config.strategy,
            message_size = config.message_size,
            duration_secs = config.duration.as_secs(),
            "starting load"
        );

        let deadline = Instant::now() + config.duration;
        let all: Vec<SessionStats> = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(config.sessions);
            for id in 0..config.sessions {
                let spawned = thread::Builder::new()
                    .name(format!("copybench-cli-{id}"))
                    .spawn_scoped(scope, move || {
                        session::run_client(id, config, deadline, shutdown)
                    });
                match spawned {
                    Ok(handle) => handles.push((id, handle)),
                    Err(e) => warn!(session = id, error = %e, "failed to spawn client thread"),
                }
            }
            handles
                .into_iter()
                .map(|(id, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        warn!(session = id, "client thread panicked");
                        SessionStats {
                            error: Some("session thread panicked".into()),
                            ..SessionStats::new(id)
                        }
                    })
                })
                .collect()
        });

        let summary = Summary::fold(config.strategy, config.message_size, config.duration, &all);
        info!(
            round_trips = summary.round_trips(),
            failed = summary.failed_sessions,
            throughput_gbps = summary.throughput_gbps(),
            avg_latency_us = summary.avg_latency_us(),
            "load finished"
        );
        summary
    }
}
