//! # copybench-server
//!
//! Echo server for the copy-strategy benchmark.
//!
//! ## Usage
//!
//! ```bash
//! copybench-server --port 8080 --strategy zero-copy --max-sessions 8
//! copybench-server --config server.toml --message-size 65536
//! ```
//!
//! Exits with status 2 when the listener cannot be bound.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use copybench::config::{load_input, ServerConfigInput};
use copybench::error::ServerError;
use copybench::server::Server;
use copybench::shutdown::ShutdownSignal;

/// TCP echo server comparing copy strategies.
#[derive(Parser, Debug)]
#[command(name = "copybench-server", about = "copy-strategy benchmark echo server")]
struct Cli {
    /// TOML config file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listening port.
    #[arg(long, short)]
    port: Option<u16>,

    /// Listening address.
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Requested message size in bytes (rounded down to a multiple of 8).
    #[arg(long, short = 's')]
    message_size: Option<usize>,

    /// Concurrent session cap; further connections are closed on accept.
    #[arg(long)]
    max_sessions: Option<usize>,

    /// full-copy | scatter-gather | zero-copy
    #[arg(long)]
    strategy: Option<String>,

    /// Teardown budget for outstanding zero-copy completions.
    #[arg(long)]
    drain_timeout_ms: Option<u64>,

    /// Max unreleased zero-copy submissions per connection.
    #[arg(long)]
    watermark: Option<usize>,
}

impl Cli {
    fn apply(self, mut input: ServerConfigInput) -> ServerConfigInput {
        input.port = self.port.or(input.port);
        input.bind = self.bind.or(input.bind);
        input.message_size = self.message_size.or(input.message_size);
        input.max_sessions = self.max_sessions.or(input.max_sessions);
        input.strategy = self.strategy.or(input.strategy);
        input.drain_timeout_ms = self.drain_timeout_ms.or(input.drain_timeout_ms);
        input.zerocopy.watermark = self.watermark.or(input.zerocopy.watermark);
        input
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .compact()
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "copybench-server failed");
            match e.downcast_ref::<ServerError>() {
                Some(server_err) => ExitCode::from(server_err.exit_code()),
                None => ExitCode::FAILURE,
            }
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let input: ServerConfigInput =
        load_input(cli.config.as_deref()).context("failed to load server config")?;
    let config = cli.apply(input).resolve()?;

    let server = Server::bind(config)?;

    // ── Graceful shutdown ──
    let shutdown = ShutdownSignal::new().context("failed to create shutdown signal")?;
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            shutdown.trigger();
        })
        .context("failed to install signal handler")?;
    }

    let summary = server.run(&shutdown)?;
    let totals = &summary.totals;
    tracing::info!(
        sessions = summary.sessions,
        rejected = summary.rejected,
        failed = totals.failed_sessions,
        messages_received = totals.messages_received,
        bytes_received = totals.bytes_received,
        bytes_sent = totals.bytes_sent,
        backpressure_events = totals.backpressure_events,
        leaked_buffers = totals.leaked_buffers,
        "server summary"
    );
    Ok(())
}
