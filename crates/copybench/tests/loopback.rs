//! # Loopback integration tests
//!
//! Real server, real load generator, real sockets on 127.0.0.1. Each test
//! binds an ephemeral port so they can run in parallel.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use copybench::client::LoadGenerator;
use copybench::config::{ClientConfig, ServerConfig, StrategyKind, ZeroCopyConfig};
use copybench::message::{effective_size, Message};
use copybench::server::{Server, ServerMonitor, ServerSummary};
use copybench::shutdown::ShutdownSignal;

// ─── Helpers ────────────────────────────────────────────────────────────────

fn server_config(strategy: StrategyKind, message_size: usize, max_sessions: usize) -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1".parse().unwrap(),
        port: 0,
        message_size,
        max_sessions,
        strategy,
        accept_poll_interval: Duration::from_millis(100),
        session_poll_interval: Duration::from_millis(20),
        drain_timeout: Duration::from_millis(500),
        zerocopy: ZeroCopyConfig::default(),
    }
}

struct RunningServer {
    port: u16,
    monitor: ServerMonitor,
    signal: ShutdownSignal,
    handle: thread::JoinHandle<ServerSummary>,
}

impl RunningServer {
    fn start(config: ServerConfig) -> Self {
        let server = Server::bind(config).unwrap();
        let port = server.local_addr().port();
        let monitor = server.monitor();
        let signal = ShutdownSignal::new().unwrap();
        let run_signal = signal.clone();
        let handle = thread::spawn(move || server.run(&run_signal).unwrap());
        RunningServer {
            port,
            monitor,
            signal,
            handle,
        }
    }

    fn stop(self) -> ServerSummary {
        self.signal.trigger();
        self.handle.join().unwrap()
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn request_bytes(size: usize) -> Vec<u8> {
    let mut out = Vec::new();
    Message::new(size).unwrap().serialize_into(&mut out);
    out
}

// ─── Echo invariant ─────────────────────────────────────────────────────────

fn check_echo_invariant(strategy: StrategyKind, message_size: usize) {
    let server = RunningServer::start(server_config(strategy, message_size, 4));

    let client = LoadGenerator::new(ClientConfig {
        host: "127.0.0.1".into(),
        port: server.port,
        message_size,
        sessions: 2,
        duration: Duration::from_secs(1),
        strategy,
        poll_interval: Duration::from_millis(20),
        zerocopy: ZeroCopyConfig::default(),
    })
    .run(&ShutdownSignal::new().unwrap());

    let served = server.stop();
    let totals = &served.totals;
    let wire = effective_size(message_size) as u64;
    let n = client.messages_received;

    assert_eq!(client.failed_sessions, 0, "{strategy}");
    assert!(n > 0, "{strategy}: no exchanges completed");
    assert_eq!(client.bytes_received, n * wire, "{strategy}");
    assert_eq!(totals.bytes_received, client.bytes_sent + client.leaked_buffers * wire, "{strategy}");
    assert_eq!(totals.bytes_received, n * wire, "{strategy}");
    assert_eq!(
        totals.bytes_sent + totals.leaked_buffers * wire,
        client.bytes_received,
        "{strategy}"
    );
    assert_eq!(served.sessions, 2);
    assert_eq!(served.rejected, 0);
}

#[test]
fn full_copy_echo_invariant() {
    check_echo_invariant(StrategyKind::FullCopy, 1024);
}

#[test]
fn scatter_gather_echo_invariant() {
    check_echo_invariant(StrategyKind::ScatterGather, 1023);
}

#[test]
fn zero_copy_echo_invariant() {
    check_echo_invariant(StrategyKind::ZeroCopy, 64 * 1024);
}

#[test]
fn tiny_messages_still_carry_eight_bytes() {
    let server = RunningServer::start(server_config(StrategyKind::ScatterGather, 1, 1));
    let mut conn = TcpStream::connect(("127.0.0.1", server.port)).unwrap();

    let request = request_bytes(1);
    assert_eq!(request, b"ABCDEFGH");
    conn.write_all(&request).unwrap();
    let mut echo = [0u8; 8];
    conn.read_exact(&mut echo).unwrap();
    assert_eq!(&echo, b"ABCDEFGH");

    drop(conn);
    let summary = server.stop();
    assert_eq!(summary.totals.bytes_received, 8);
    assert_eq!(summary.totals.bytes_sent, 8);
}

// ─── Admission control ──────────────────────────────────────────────────────

#[test]
fn admission_caps_concurrent_sessions() {
    let server = RunningServer::start(server_config(StrategyKind::FullCopy, 64, 2));

    let mut conns: Vec<TcpStream> = Vec::new();
    for _ in 0..5 {
        conns.push(TcpStream::connect(("127.0.0.1", server.port)).unwrap());
    }
    let monitor = server.monitor.clone();
    assert!(
        wait_until(Duration::from_secs(3), || monitor.rejected() == 3),
        "rejected = {}",
        monitor.rejected()
    );
    assert_eq!(monitor.active(), 2);

    // Rejected peers see an immediate close.
    for conn in &mut conns[2..] {
        conn.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut byte = [0u8; 1];
        assert_eq!(conn.read(&mut byte).unwrap_or(0), 0);
    }

    // Admitted peers are served.
    let request = request_bytes(64);
    for conn in &mut conns[..2] {
        conn.write_all(&request).unwrap();
        let mut echo = vec![0u8; request.len()];
        conn.read_exact(&mut echo).unwrap();
        assert_eq!(echo, request);
    }

    // A freed slot admits the next connection.
    conns.truncate(1);
    assert!(wait_until(Duration::from_secs(3), || monitor.active() == 1));
    let _late = TcpStream::connect(("127.0.0.1", server.port)).unwrap();
    assert!(wait_until(Duration::from_secs(3), || monitor.active() == 2));
    assert_eq!(monitor.rejected(), 3);

    let summary = server.stop();
    assert_eq!(summary.sessions, 3);
    assert_eq!(summary.rejected, 3);
}

// ─── Shutdown ───────────────────────────────────────────────────────────────

#[test]
fn shutdown_closes_listener_then_drains_within_bound() {
    let config = ServerConfig {
        accept_poll_interval: Duration::from_millis(200),
        drain_timeout: Duration::from_millis(300),
        ..server_config(StrategyKind::ZeroCopy, 4096, 4)
    };
    let bound = config.accept_poll_interval + config.drain_timeout;
    let server = RunningServer::start(config);
    let port = server.port;

    // One busy session, one idle. Both peers stay connected throughout,
    // so only the server can end their sessions.
    let mut busy = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let idle = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let request = request_bytes(4096);
    busy.write_all(&request).unwrap();
    let mut echo = vec![0u8; request.len()];
    busy.read_exact(&mut echo).unwrap();

    let monitor = server.monitor.clone();
    assert!(wait_until(Duration::from_secs(3), || monitor.active() == 2));

    let triggered = Instant::now();
    let summary = server.stop();

    // Both slots were still held when the listener closed, so the drain
    // instant is the one stamped by the last session's guard.
    assert_eq!(summary.active_at_close, 2);
    let drained = summary.drained_at.expect("sessions did not drain");
    assert!(summary.listener_closed_at <= drained);
    assert!(triggered <= summary.listener_closed_at);
    assert!(
        drained.duration_since(triggered) <= bound + Duration::from_millis(250),
        "drain took {:?}",
        drained.duration_since(triggered)
    );
    assert_eq!(monitor.active(), 0);
    assert_eq!(summary.detached, 0);
    assert_eq!(summary.sessions, 2);

    // The port no longer accepts, and the held peers were closed by the
    // server.
    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
    for mut conn in [busy, idle] {
        conn.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut byte = [0u8; 1];
        assert_eq!(conn.read(&mut byte).unwrap_or(0), 0);
    }
}

#[test]
fn turned_away_client_sessions_are_reported_failed() {
    let server = RunningServer::start(server_config(StrategyKind::FullCopy, 64, 1));

    let client = LoadGenerator::new(ClientConfig {
        host: "127.0.0.1".into(),
        port: server.port,
        message_size: 64,
        sessions: 3,
        duration: Duration::from_secs(1),
        strategy: StrategyKind::FullCopy,
        poll_interval: Duration::from_millis(20),
        zerocopy: ZeroCopyConfig::default(),
    })
    .run(&ShutdownSignal::new().unwrap());

    let served = server.stop();
    assert_eq!(served.sessions, 1);
    assert_eq!(served.rejected, 2);
    assert_eq!(client.sessions, 3);
    assert_eq!(client.failed_sessions as u64, served.rejected);
    assert!(client.messages_received > 0);
}

#[test]
fn client_stops_early_on_shutdown() {
    let server = RunningServer::start(server_config(StrategyKind::FullCopy, 256, 4));
    let client_signal = ShutdownSignal::new().unwrap();
    let trigger = client_signal.clone();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        trigger.trigger();
    });

    let started = Instant::now();
    let summary = LoadGenerator::new(ClientConfig {
        host: "127.0.0.1".into(),
        port: server.port,
        message_size: 256,
        sessions: 2,
        duration: Duration::from_secs(30),
        ..ClientConfig::default()
    })
    .run(&client_signal);
    stopper.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(summary.failed_sessions, 0);
    server.stop();
}
