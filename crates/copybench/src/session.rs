//! # Sessions
//!
//! One connection, one thread, one strategy. The server side echoes every
//! full message it receives; the client side drives request/echo
//! exchanges and times them.
//!
//! Both ends receive through [`recv_exact`], which never blocks longer
//! than the poll interval without re-checking the [`ShutdownSignal`].
//!
//! Bytes and messages count as *sent* once the transmit buffer is free
//! again: immediately for the synchronous strategies, on completion for
//! zero-copy.

use std::io::{self, Read};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::time::Duration;

use quanta::Instant;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ServerConfig, StrategyKind, ZeroCopyConfig};
use crate::error::TransferError;
use crate::message::{effective_size, MessagePool};
use crate::shutdown::{wait_readable, Readiness, ShutdownSignal};
use crate::stats::SessionStats;
use crate::strategy::{self, DrainOutcome, SubmitOutcome, TransferStrategy};

/// How long a client waits for the last echo after its deadline.
const ECHO_GRACE: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-session knobs, derived from the server or client config.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub strategy: StrategyKind,
    pub message_size: usize,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
    pub zerocopy: ZeroCopyConfig,
}

impl From<&ServerConfig> for SessionParams {
    fn from(c: &ServerConfig) -> Self {
        SessionParams {
            strategy: c.strategy,
            message_size: c.message_size,
            poll_interval: c.session_poll_interval,
            drain_timeout: c.drain_timeout,
            zerocopy: c.zerocopy.clone(),
        }
    }
}

impl From<&ClientConfig> for SessionParams {
    fn from(c: &ClientConfig) -> Self {
        SessionParams {
            strategy: c.strategy,
            message_size: c.message_size,
            poll_interval: c.poll_interval,
            drain_timeout: c.zerocopy.completion_timeout,
            zerocopy: c.zerocopy.clone(),
        }
    }
}

// ─── Receive ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    Complete,
    Cancelled,
    /// The deadline passed before the buffer filled.
    Expired,
}

/// Fill `buf` completely from `stream`.
///
/// A close before the first byte is `PeerClosed { received: 0 }`, the
/// normal end of a conversation; a close mid-message is a partial receive.
pub fn recv_exact(
    stream: &mut TcpStream,
    buf: &mut [u8],
    shutdown: &ShutdownSignal,
    poll_interval: Duration,
    deadline: Option<Instant>,
) -> Result<RecvOutcome, TransferError> {
    let expected = buf.len();
    let mut received = 0;
    while received < expected {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(RecvOutcome::Expired);
        }
        match wait_readable(stream.as_raw_fd(), shutdown, poll_interval)? {
            Readiness::Cancelled => return Ok(RecvOutcome::Cancelled),
            Readiness::TimedOut => continue,
            Readiness::Ready => {}
        }
        match stream.read(&mut buf[received..]) {
            Ok(0) => return Err(TransferError::PeerClosed { received, expected }),
            Ok(n) => received += n,
            Err(e)
                if e.kind() == io::ErrorKind::Interrupted
                    || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(RecvOutcome::Complete)
}

// ─── Accounting ─────────────────────────────────────────────────────────────

fn account_submit(stats: &mut SessionStats, pool: &mut MessagePool, outcome: SubmitOutcome) {
    if let SubmitOutcome::Sent { bytes, message } = outcome {
        stats.bytes_sent += bytes as u64;
        stats.messages_sent += 1;
        pool.restore(message);
    }
}

fn account_drain(stats: &mut SessionStats, pool: &mut MessagePool, drained: DrainOutcome) {
    for message in drained.reclaimed {
        stats.bytes_sent += message.len() as u64;
        stats.messages_sent += 1;
        pool.restore(message);
    }
}

fn absorb_counters(stats: &mut SessionStats, strategy: &dyn TransferStrategy) {
    let c = strategy.counters();
    stats.backpressure_events = c.backpressure_events;
    stats.copied_completions = c.copied_completions;
    stats.leaked_buffers = c.leaked_buffers;
}

/// Record how a session ended. Routine disconnects are not errors.
fn conclude(stats: &mut SessionStats, role: &str, result: Result<(), TransferError>) {
    match result {
        Ok(()) => debug!(session = stats.session_id, role, "session ended"),
        Err(e) if e.is_disconnect() => {
            debug!(session = stats.session_id, role, error = %e, "peer disconnected");
        }
        Err(e) => {
            warn!(session = stats.session_id, role, error = %e, "session failed");
            stats.error = Some(e.to_string());
        }
    }
}

/// Run `body` with a strategy built on `writer`, then tear the strategy
/// down whatever the outcome.
fn with_strategy<F>(
    writer: TcpStream,
    params: &SessionParams,
    stats: &mut SessionStats,
    pool: &mut MessagePool,
    body: F,
) -> Result<(), TransferError>
where
    F: FnOnce(&mut dyn TransferStrategy, &mut SessionStats, &mut MessagePool) -> Result<(), TransferError>,
{
    let mut strategy = strategy::build(params.strategy, writer, &params.zerocopy)?;
    let result = body(strategy.as_mut(), stats, pool);
    let teardown = strategy.finish(params.drain_timeout);
    absorb_counters(stats, strategy.as_ref());
    match teardown {
        Ok(drained) => {
            account_drain(stats, pool, drained);
            result
        }
        Err(e) => result.and(Err(e)),
    }
}

// ─── Server side ────────────────────────────────────────────────────────────

/// Echo full messages back until the peer closes, an error, or shutdown.
pub fn run_echo(
    id: usize,
    mut stream: TcpStream,
    params: &SessionParams,
    shutdown: &ShutdownSignal,
) -> SessionStats {
    let mut stats = SessionStats::new(id);
    let mut pool = MessagePool::new(params.message_size);
    let result = match stream.try_clone() {
        Ok(writer) => with_strategy(writer, params, &mut stats, &mut pool, |strategy, stats, pool| {
            echo_loop(&mut stream, strategy, stats, pool, params, shutdown)
        }),
        Err(e) => Err(e.into()),
    };
    conclude(&mut stats, "server", result);
    stats
}

fn echo_loop(
    stream: &mut TcpStream,
    strategy: &mut dyn TransferStrategy,
    stats: &mut SessionStats,
    pool: &mut MessagePool,
    params: &SessionParams,
    shutdown: &ShutdownSignal,
) -> Result<(), TransferError> {
    let mut request = vec![0u8; effective_size(params.message_size)];
    loop {
        account_drain(stats, pool, strategy.drain_completions()?);

        match recv_exact(stream, &mut request, shutdown, params.poll_interval, None) {
            Ok(RecvOutcome::Complete) => {}
            Ok(RecvOutcome::Cancelled | RecvOutcome::Expired) => return Ok(()),
            Err(TransferError::PeerClosed { received: 0, .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        stats.bytes_received += request.len() as u64;
        stats.messages_received += 1;

        let response = pool.acquire()?;
        let outcome = strategy.submit(response)?;
        account_submit(stats, pool, outcome);
    }
}

// ─── Client side ────────────────────────────────────────────────────────────

/// Connect, then run timed request/echo exchanges until `deadline` or
/// shutdown. Connect failures end only this session.
pub fn run_client(
    id: usize,
    config: &ClientConfig,
    deadline: Instant,
    shutdown: &ShutdownSignal,
) -> SessionStats {
    let mut stats = SessionStats::new(id);
    let params = SessionParams::from(config);

    let stream = match crate::net::socket::connect(&config.host, config.port, CONNECT_TIMEOUT) {
        Ok(s) => s,
        Err(e) => {
            warn!(session = id, host = %config.host, port = config.port, error = %e, "connect failed");
            stats.error = Some(format!("connect failed: {e}"));
            return stats;
        }
    };
    debug!(session = id, strategy = %params.strategy, "client session connected");

    let mut pool = MessagePool::new(params.message_size);
    let mut reader = stream;
    let result = match reader.try_clone() {
        Ok(writer) => with_strategy(writer, &params, &mut stats, &mut pool, |strategy, stats, pool| {
            exchange_loop(&mut reader, strategy, stats, pool, &params, deadline, shutdown)
        }),
        Err(e) => Err(e.into()),
    };
    conclude(&mut stats, "client", result);
    info!(
        session = id,
        round_trips = stats.messages_received,
        bytes_sent = stats.bytes_sent,
        "client session finished"
    );
    stats
}

fn exchange_loop(
    stream: &mut TcpStream,
    strategy: &mut dyn TransferStrategy,
    stats: &mut SessionStats,
    pool: &mut MessagePool,
    params: &SessionParams,
    deadline: Instant,
    shutdown: &ShutdownSignal,
) -> Result<(), TransferError> {
    let mut echo = vec![0u8; effective_size(params.message_size)];
    let hard_deadline = deadline + ECHO_GRACE;

    while !shutdown.is_triggered() && Instant::now() < deadline {
        let message = pool.acquire()?;
        let t0 = Instant::now();
        let round_trips = stats.messages_received;
        let outcome = strategy.submit(message).map_err(|e| e.echo_owed(round_trips))?;
        account_submit(stats, pool, outcome);

        let received = recv_exact(stream, &mut echo, shutdown, params.poll_interval, Some(hard_deadline))
            .map_err(|e| e.echo_owed(round_trips))?;
        match received {
            RecvOutcome::Complete => {}
            RecvOutcome::Cancelled => return Ok(()),
            RecvOutcome::Expired => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "echo not received before the run deadline",
                )
                .into())
            }
        }
        stats.record_latency(t0.elapsed());
        stats.bytes_received += echo.len() as u64;
        stats.messages_received += 1;

        account_drain(stats, pool, strategy.drain_completions()?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn params(strategy: StrategyKind, message_size: usize) -> SessionParams {
        SessionParams {
            strategy,
            message_size,
            poll_interval: Duration::from_millis(20),
            drain_timeout: Duration::from_millis(500),
            zerocopy: ZeroCopyConfig::default(),
        }
    }

    #[test]
    fn server_sessions_use_their_own_receive_wait() {
        let config = ServerConfig {
            accept_poll_interval: Duration::from_millis(1500),
            session_poll_interval: Duration::from_millis(30),
            ..ServerConfig::default()
        };
        let p = SessionParams::from(&config);
        assert_eq!(p.poll_interval, Duration::from_millis(30));
        assert_eq!(p.drain_timeout, config.drain_timeout);
    }

    #[test]
    fn recv_exact_assembles_split_writes() {
        let (mut tx, mut rx) = loopback_pair();
        let signal = ShutdownSignal::new().unwrap();
        let writer = thread::spawn(move || {
            tx.write_all(b"hello ").unwrap();
            thread::sleep(Duration::from_millis(30));
            tx.write_all(b"world!").unwrap();
            tx
        });

        let mut buf = [0u8; 12];
        let res = recv_exact(&mut rx, &mut buf, &signal, Duration::from_millis(10), None).unwrap();
        assert_eq!(res, RecvOutcome::Complete);
        assert_eq!(&buf, b"hello world!");
        writer.join().unwrap();
    }

    #[test]
    fn close_mid_message_is_a_partial_receive() {
        let (mut tx, mut rx) = loopback_pair();
        let signal = ShutdownSignal::new().unwrap();
        tx.write_all(b"abc").unwrap();
        drop(tx);

        let mut buf = [0u8; 8];
        let err = recv_exact(&mut rx, &mut buf, &signal, Duration::from_millis(10), None)
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::PeerClosed {
                received: 3,
                expected: 8
            }
        ));
        assert!(!err.is_disconnect());
    }

    #[test]
    fn close_at_boundary_is_a_disconnect() {
        let (tx, mut rx) = loopback_pair();
        let signal = ShutdownSignal::new().unwrap();
        drop(tx);
        let mut buf = [0u8; 8];
        let err = recv_exact(&mut rx, &mut buf, &signal, Duration::from_millis(10), None)
            .unwrap_err();
        assert!(err.is_disconnect());
    }

    #[test]
    fn shutdown_and_deadline_end_a_blocked_receive() {
        let (_tx, mut rx) = loopback_pair();
        let mut buf = [0u8; 8];

        let signal = ShutdownSignal::new().unwrap();
        let deadline = Instant::now() + Duration::from_millis(40);
        let res = recv_exact(&mut rx, &mut buf, &signal, Duration::from_millis(10), Some(deadline))
            .unwrap();
        assert_eq!(res, RecvOutcome::Expired);

        signal.trigger();
        let res = recv_exact(&mut rx, &mut buf, &signal, Duration::from_secs(5), None).unwrap();
        assert_eq!(res, RecvOutcome::Cancelled);
    }

    #[test]
    fn echo_session_returns_every_byte() {
        for kind in [
            StrategyKind::FullCopy,
            StrategyKind::ScatterGather,
            StrategyKind::ZeroCopy,
        ] {
            let (mut client, server) = loopback_pair();
            let signal = ShutdownSignal::new().unwrap();
            let p = params(kind, 1024);
            let session = thread::spawn(move || run_echo(1, server, &p, &signal));

            let mut request = Vec::new();
            crate::message::Message::new(1024)
                .unwrap()
                .serialize_into(&mut request);
            for _ in 0..5 {
                client.write_all(&request).unwrap();
                let mut echo = vec![0u8; request.len()];
                client.read_exact(&mut echo).unwrap();
                assert_eq!(echo, request, "{kind}");
            }
            drop(client);

            let stats = session.join().unwrap();
            assert_eq!(stats.messages_received, 5, "{kind}");
            assert_eq!(stats.bytes_received, 5 * 1024, "{kind}");
            assert_eq!(stats.messages_sent + stats.leaked_buffers, 5, "{kind}");
            assert!(stats.error.is_none(), "{kind}: {:?}", stats.error);
        }
    }

    #[test]
    fn echo_session_stops_on_shutdown() {
        let (_client, server) = loopback_pair();
        let signal = ShutdownSignal::new().unwrap();
        let p = params(StrategyKind::FullCopy, 64);
        let session_signal = signal.clone();
        let session = thread::spawn(move || run_echo(2, server, &p, &session_signal));

        thread::sleep(Duration::from_millis(30));
        signal.trigger();
        let stats = session.join().unwrap();
        assert_eq!(stats.messages_received, 0);
        assert!(stats.error.is_none());
    }

    #[test]
    fn client_fails_when_server_hangs_up_with_echo_owed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = [0u8; 64];
            conn.read_exact(&mut request).unwrap();
        });

        let config = ClientConfig {
            port,
            message_size: 64,
            poll_interval: Duration::from_millis(20),
            ..ClientConfig::default()
        };
        let signal = ShutdownSignal::new().unwrap();
        let stats = run_client(4, &config, Instant::now() + Duration::from_secs(5), &signal);
        peer.join().unwrap();

        assert_eq!(stats.messages_received, 0);
        let error = stats.error.expect("hang-up with an echo owed must fail the session");
        assert!(error.contains("echo outstanding"), "{error}");
    }

    #[test]
    fn client_connect_failure_is_session_local() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ClientConfig {
            port,
            ..ClientConfig::default()
        };
        let signal = ShutdownSignal::new().unwrap();
        let stats = run_client(3, &config, Instant::now() + Duration::from_secs(1), &signal);
        assert_eq!(stats.session_id, 3);
        assert_eq!(stats.messages_received, 0);
        assert!(stats.error.is_some());
    }
}
