//! # Echo Server
//!
//! Accept loop plus one supervised thread per admitted connection.
//!
//! Admission is a mutex-guarded active count: a connection beyond
//! `max_sessions` is accepted and closed straight away, which the peer
//! sees as an immediate EOF. Every admitted session holds an
//! [`AdmissionGuard`] that gives its slot back when the thread ends,
//! panics included.
//!
//! Shutdown order: stop accepting, close the listener, cancel the
//! sessions, wait (bounded) for the active count to reach zero, then join
//! the session threads and fold their stats. Sessions watch their own
//! signal, fired only once the listener is gone, so no slot can be given
//! back to a shutdown request while the port still accepts.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::net::socket;
use crate::session::{self, SessionParams};
use crate::shutdown::{wait_readable, Readiness, ShutdownSignal};
use crate::stats::{SessionStats, Summary};

// ─── Admission ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Admission {
    max: usize,
    state: Mutex<AdmissionState>,
    idle: Condvar,
}

#[derive(Debug, Default)]
struct AdmissionState {
    active: usize,
    rejected: u64,
    /// Last time the active count dropped to zero.
    idle_at: Option<Instant>,
}

impl Admission {
    fn new(max: usize) -> Self {
        Admission {
            max,
            state: Mutex::new(AdmissionState::default()),
            idle: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check and increment in one critical section.
    fn try_admit(self: &Arc<Self>) -> Option<AdmissionGuard> {
        let mut state = self.lock();
        if state.active >= self.max {
            state.rejected += 1;
            return None;
        }
        state.active += 1;
        Some(AdmissionGuard(Arc::clone(self)))
    }

    /// Wait until no session is active and return when that happened,
    /// or `None` on timeout.
    fn wait_idle(&self, timeout: Duration) -> Option<Instant> {
        let state = self.lock();
        let (state, _) = self
            .idle
            .wait_timeout_while(state, timeout, |s| s.active > 0)
            .unwrap_or_else(|e| e.into_inner());
        (state.active == 0).then(|| state.idle_at.unwrap_or_else(Instant::now))
    }
}

/// Slot held by one running session.
struct AdmissionGuard(Arc<Admission>);

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            state.idle_at = Some(Instant::now());
            self.0.idle.notify_all();
        }
    }
}

/// Read-only view of the admission counters, usable from other threads
/// while the server runs.
#[derive(Debug, Clone)]
pub struct ServerMonitor(Arc<Admission>);

impl ServerMonitor {
    pub fn active(&self) -> usize {
        self.0.lock().active
    }

    pub fn rejected(&self) -> u64 {
        self.0.lock().rejected
    }

    pub fn capacity(&self) -> usize {
        self.0.max
    }
}

// ─── Summary ────────────────────────────────────────────────────────────────

/// What the server did over its whole run.
#[derive(Debug, Clone)]
pub struct ServerSummary {
    /// Sessions admitted.
    pub sessions: usize,
    /// Connections refused at capacity.
    pub rejected: u64,
    pub totals: Summary,
    /// When the listener was closed.
    pub listener_closed_at: Instant,
    /// Sessions still holding a slot at that moment.
    pub active_at_close: usize,
    /// When the last session gave its slot back, if that happened within
    /// the bound. Equal to `listener_closed_at` if none were active then.
    pub drained_at: Option<Instant>,
    /// Session threads still running at return; left detached.
    pub detached: usize,
}

// ─── Server ─────────────────────────────────────────────────────────────────

pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    admission: Arc<Admission>,
}

impl Server {
    /// Create, bind and listen. Any failure here is fatal for the process.
    pub fn bind(config: ServerConfig) -> Result<Server, ServerError> {
        let addr = SocketAddr::new(config.bind, config.port);
        let listener = socket::bind_listener(addr, config.max_sessions)
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;
        let admission = Arc::new(Admission::new(config.max_sessions));
        Ok(Server {
            config,
            listener,
            local_addr,
            admission,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn monitor(&self) -> ServerMonitor {
        ServerMonitor(Arc::clone(&self.admission))
    }

    /// Serve until `shutdown` fires, then tear down in order.
    pub fn run(self, shutdown: &ShutdownSignal) -> Result<ServerSummary, ServerError> {
        let started = Instant::now();
        let Server {
            config,
            listener,
            local_addr,
            admission,
        } = self;
        let params = SessionParams::from(&config);
        let session_signal = ShutdownSignal::new()?;
        let (stats_tx, stats_rx) = unbounded::<SessionStats>();
        let mut sessions = Sessions::default();

        info!(
            addr = %local_addr,
            strategy = %config.strategy,
            message_size = config.message_size,
            max_sessions = config.max_sessions,
            "server listening"
        );

        let outcome = accept_loop(
            &listener,
            &config,
            &params,
            &admission,
            &stats_tx,
            &mut sessions,
            &session_signal,
            shutdown,
        );

        // ── Teardown ──
        // Reached on shutdown and on accept-loop failure alike.
        drop(listener);
        let listener_closed_at = Instant::now();
        let active_at_close = admission.lock().active;
        info!(active = active_at_close, "listener closed, draining sessions");
        session_signal.trigger();

        let bound = config.drain_timeout + config.accept_poll_interval;
        let drained_at = match admission.wait_idle(bound) {
            Some(_) if active_at_close == 0 => Some(listener_closed_at),
            Some(idle_at) => Some(idle_at),
            None => {
                warn!(
                    active = admission.lock().active,
                    bound_ms = bound.as_millis() as u64,
                    "sessions still active after drain bound"
                );
                None
            }
        };

        let detached = sessions.join(drained_at.is_some());
        drop(stats_tx);
        let all: Vec<SessionStats> = collect(&stats_rx);
        let totals = Summary::fold(
            config.strategy,
            config.message_size,
            started.elapsed(),
            &all,
        );
        let rejected = admission.lock().rejected;

        info!(
            sessions = sessions.spawned,
            rejected,
            detached,
            bytes_received = totals.bytes_received,
            bytes_sent = totals.bytes_sent,
            "server stopped"
        );

        outcome.map(|()| ServerSummary {
            sessions: sessions.spawned,
            rejected,
            totals,
            listener_closed_at,
            active_at_close,
            drained_at,
            detached,
        })
    }
}

fn collect(rx: &Receiver<SessionStats>) -> Vec<SessionStats> {
    let mut all: Vec<SessionStats> = rx.try_iter().collect();
    all.sort_by_key(|s| s.session_id);
    all
}

fn accept_loop(
    listener: &TcpListener,
    config: &ServerConfig,
    params: &SessionParams,
    admission: &Arc<Admission>,
    stats_tx: &Sender<SessionStats>,
    sessions: &mut Sessions,
    session_signal: &ShutdownSignal,
    shutdown: &ShutdownSignal,
) -> Result<(), ServerError> {
    loop {
        match wait_readable(listener.as_raw_fd(), shutdown, config.accept_poll_interval)? {
            Readiness::Cancelled => return Ok(()),
            Readiness::TimedOut => {
                sessions.reap();
                continue;
            }
            Readiness::Ready => {}
        }

        let (stream, peer) = match listener.accept() {
            Ok(conn) => conn,
            Err(e) if is_transient_accept_error(&e) => {
                debug!(error = %e, "transient accept error");
                continue;
            }
            Err(e) => return Err(ServerError::Listener(e)),
        };

        let Some(guard) = admission.try_admit() else {
            debug!(%peer, max = admission.max, "at capacity, rejecting connection");
            drop(stream);
            continue;
        };

        if let Err(e) = socket::configure_accepted(&stream) {
            warn!(%peer, error = %e, "failed to configure accepted socket");
            continue;
        }

        sessions.spawn(stream, peer, guard, params, stats_tx, session_signal);
        sessions.reap();
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

// ─── Supervision ────────────────────────────────────────────────────────────

#[derive(Default)]
struct Sessions {
    spawned: usize,
    next_id: usize,
    handles: Vec<JoinHandle<()>>,
}

impl Sessions {
    fn spawn(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        guard: AdmissionGuard,
        params: &SessionParams,
        stats_tx: &Sender<SessionStats>,
        shutdown: &ShutdownSignal,
    ) {
        let id = self.next_id;
        self.next_id += 1;
        let params = params.clone();
        let tx = stats_tx.clone();
        let shutdown = shutdown.clone();

        let spawned = thread::Builder::new()
            .name(format!("copybench-srv-{id}"))
            .spawn(move || {
                // Declared first so the slot is released last.
                let _guard = guard;
                debug!(session = id, %peer, "session started");
                let stats = session::run_echo(id, stream, &params, &shutdown);
                let _ = tx.send(stats);
            });
        match spawned {
            Ok(handle) => {
                self.spawned += 1;
                self.handles.push(handle);
            }
            Err(e) => warn!(session = id, %peer, error = %e, "failed to spawn session thread"),
        }
    }

    /// Join threads that have already finished.
    fn reap(&mut self) {
        let mut i = 0;
        while i < self.handles.len() {
            if self.handles[i].is_finished() {
                let handle = self.handles.swap_remove(i);
                if handle.join().is_err() {
                    warn!("session thread panicked");
                }
            } else {
                i += 1;
            }
        }
    }

    /// Join everything that can be joined. Returns how many threads were
    /// left running.
    fn join(&mut self, drained: bool) -> usize {
        if drained {
            for handle in self.handles.drain(..) {
                if handle.join().is_err() {
                    warn!("session thread panicked");
                }
            }
            return 0;
        }
        self.reap();
        let left = self.handles.len();
        self.handles.clear();
        left
    }
}
