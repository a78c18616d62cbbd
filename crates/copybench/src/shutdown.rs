//! # Cancellation
//!
//! [`ShutdownSignal`] replaces a bare `running` flag with something blocked
//! threads can actually wait on. It pairs an atomic flag (cheap to check at
//! loop boundaries) with a self-pipe: triggering writes one byte that is
//! never read back, so the read end stays readable forever and every
//! `poll(2)` that includes it wakes immediately, now and later.
//!
//! [`wait_readable`] is the one blocking primitive the server and sessions
//! use: it waits for a socket, the shutdown pipe, or a bounded timeout,
//! whichever comes first.

use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What ended a [`wait_readable`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The socket has data, a pending connection, EOF, or an error.
    Ready,
    /// Shutdown was requested.
    Cancelled,
    /// Nothing happened within the timeout.
    TimedOut,
}

struct Inner {
    triggered: AtomicBool,
    wake_tx: UnixStream,
    wake_rx: UnixStream,
}

/// Process- or test-scoped cancellation shared by every session.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    pub fn new() -> io::Result<Self> {
        let (wake_tx, wake_rx) = UnixStream::pair()?;
        wake_tx.set_nonblocking(true)?;
        Ok(Self {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                wake_tx,
                wake_rx,
            }),
        })
    }

    /// Request shutdown. Idempotent; safe to call from the ctrl-c thread.
    pub fn trigger(&self) {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        // A full pipe still leaves the read end readable, so a failed write
        // cannot lose the wakeup.
        let _ = (&self.inner.wake_tx).write(&[1]);
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Relaxed)
    }

    fn wake_fd(&self) -> RawFd {
        self.inner.wake_rx.as_raw_fd()
    }
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

/// Block until `fd` is readable, shutdown is signalled, or `timeout` passes.
///
/// Shutdown wins ties so callers stop promptly even on a busy socket.
pub fn wait_readable(
    fd: RawFd,
    shutdown: &ShutdownSignal,
    timeout: Duration,
) -> io::Result<Readiness> {
    if shutdown.is_triggered() {
        return Ok(Readiness::Cancelled);
    }

    let mut fds = [
        libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: shutdown.wake_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Readiness::TimedOut);
        }
        return Err(err);
    }
    if rc == 0 {
        return Ok(Readiness::TimedOut);
    }
    if fds[1].revents != 0 || shutdown.is_triggered() {
        return Ok(Readiness::Cancelled);
    }
    Ok(Readiness::Ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Instant;

    #[test]
    fn idle_socket_times_out() {
        let signal = ShutdownSignal::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let res = wait_readable(a.as_raw_fd(), &signal, Duration::from_millis(20)).unwrap();
        assert_eq!(res, Readiness::TimedOut);
    }

    #[test]
    fn readable_socket_is_ready() {
        let signal = ShutdownSignal::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();
        let res = wait_readable(a.as_raw_fd(), &signal, Duration::from_secs(1)).unwrap();
        assert_eq!(res, Readiness::Ready);
    }

    #[test]
    fn trigger_wakes_a_blocked_waiter() {
        let signal = ShutdownSignal::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();

        let waiter_signal = signal.clone();
        let fd = a.as_raw_fd();
        let start = Instant::now();
        let waiter = std::thread::spawn(move || {
            wait_readable(fd, &waiter_signal, Duration::from_secs(10)).unwrap()
        });

        std::thread::sleep(Duration::from_millis(50));
        signal.trigger();
        assert_eq!(waiter.join().unwrap(), Readiness::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn trigger_is_sticky_and_idempotent() {
        let signal = ShutdownSignal::new().unwrap();
        assert!(!signal.is_triggered());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_triggered());

        let (a, _b) = UnixStream::pair().unwrap();
        for _ in 0..3 {
            let res = wait_readable(a.as_raw_fd(), &signal, Duration::from_secs(1)).unwrap();
            assert_eq!(res, Readiness::Cancelled);
        }
    }
}
