//! # copybench-client
//!
//! Load generator for the copy-strategy benchmark.
//!
//! ## Usage
//!
//! ```bash
//! copybench-client --host 10.0.0.2 --sessions 8 --duration-secs 30
//! copybench-client --strategy scatter-gather --message-size 65536 --json
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use copybench::client::LoadGenerator;
use copybench::config::{load_input, ClientConfigInput};
use copybench::shutdown::ShutdownSignal;
use copybench::stats::{Report, Summary};

/// Drives request/echo exchanges against a copybench server.
#[derive(Parser, Debug)]
#[command(name = "copybench-client", about = "copy-strategy benchmark load generator")]
struct Cli {
    /// TOML config file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server host.
    #[arg(long)]
    host: Option<String>,

    /// Server port.
    #[arg(long, short)]
    port: Option<u16>,

    /// Requested message size in bytes (rounded down to a multiple of 8).
    #[arg(long, short = 's')]
    message_size: Option<usize>,

    /// Concurrent connections.
    #[arg(long, short = 'n')]
    sessions: Option<usize>,

    /// Run length in seconds.
    #[arg(long, short = 'd')]
    duration_secs: Option<u64>,

    /// full-copy | scatter-gather | zero-copy
    #[arg(long)]
    strategy: Option<String>,

    /// Max unreleased zero-copy submissions per connection.
    #[arg(long)]
    watermark: Option<usize>,

    /// Print the summary as JSON on stdout.
    #[arg(long, default_value_t = false)]
    json: bool,
}

impl Cli {
    fn apply(&self, mut input: ClientConfigInput) -> ClientConfigInput {
        input.host = self.host.clone().or(input.host);
        input.port = self.port.or(input.port);
        input.message_size = self.message_size.or(input.message_size);
        input.sessions = self.sessions.or(input.sessions);
        input.duration_secs = self.duration_secs.or(input.duration_secs);
        input.strategy = self.strategy.clone().or(input.strategy);
        input.zerocopy.watermark = self.watermark.or(input.zerocopy.watermark);
        input
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "copybench-client failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let input: ClientConfigInput =
        load_input(cli.config.as_deref()).context("failed to load client config")?;
    let config = cli.apply(input).resolve()?;

    let shutdown = ShutdownSignal::new().context("failed to create shutdown signal")?;
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("stopping load early...");
            shutdown.trigger();
        })
        .context("failed to install signal handler")?;
    }

    let summary = LoadGenerator::new(config).run(&shutdown);
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&Report::from(summary))?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(s: &Summary) {
    println!("strategy:        {}", s.strategy);
    println!("message size:    {} bytes", s.message_size);
    println!("sessions:        {} ({} failed)", s.sessions, s.failed_sessions);
    println!("round trips:     {}", s.round_trips());
    println!("bytes sent:      {}", s.bytes_sent);
    println!("bytes received:  {}", s.bytes_received);
    println!("throughput:      {:.4} Gbps", s.throughput_gbps());
    println!("avg latency:     {:.2} us", s.avg_latency_us());
    if s.backpressure_events > 0 || s.leaked_buffers > 0 || s.copied_completions > 0 {
        println!(
            "zero-copy:       {} backpressure, {} copied, {} leaked",
            s.backpressure_events, s.copied_completions, s.leaked_buffers
        );
    }
}
