//! Linux `MSG_ZEROCOPY` plumbing.
//!
//! [`ZeroCopySocket`] issues `sendmsg(2)` with `MSG_ZEROCOPY` so the kernel
//! pins the caller's pages instead of copying them. [`ErrQueue`] reads the
//! matching completion notifications from the socket error queue
//! (`recvmsg(2)` with `MSG_ERRQUEUE`). Both wrap their own handle to the
//! same socket; the error queue belongs to the socket, not the fd, so a
//! `try_clone` sees every notification.
//!
//! Requires `SO_ZEROCOPY` (Linux 4.14+). On loopback the kernel always
//! copies and flags the notification with `SO_EE_CODE_ZEROCOPY_COPIED`.

use std::io;
use std::mem;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::TransferError;
use crate::strategy::zerocopy::PinnedSend;
use crate::tracker::{CompletionChannel, Notification};

const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;
const SO_EE_CODE_ZEROCOPY_COPIED: u8 = 1;

/// Re-check interval while `poll` keeps reporting an error or hang-up
/// with nothing in the queue.
const IDLE_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// `struct sock_extended_err` from `<linux/errqueue.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SockExtendedErr {
    ee_errno: u32,
    ee_origin: u8,
    ee_type: u8,
    ee_code: u8,
    ee_pad: u8,
    ee_info: u32,
    ee_data: u32,
}

/// Turn on `SO_ZEROCOPY`. Without it the kernel silently ignores
/// `MSG_ZEROCOPY` and never posts completions.
pub fn enable_zerocopy(fd: RawFd) -> io::Result<()> {
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ZEROCOPY,
            &one as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ─── Sender ─────────────────────────────────────────────────────────────────

/// Send half of a zero-copy enabled TCP socket.
#[derive(Debug)]
pub struct ZeroCopySocket {
    stream: TcpStream,
}

impl ZeroCopySocket {
    /// Enable `SO_ZEROCOPY` on `stream` and split off its error queue.
    pub fn new(stream: TcpStream) -> Result<(Self, ErrQueue), TransferError> {
        enable_zerocopy(stream.as_raw_fd()).map_err(TransferError::ZeroCopyUnsupported)?;
        let errqueue = ErrQueue::new(stream.try_clone()?);
        Ok((ZeroCopySocket { stream }, errqueue))
    }
}

impl PinnedSend for ZeroCopySocket {
    fn send_pinned(&mut self, bufs: &[&[u8]]) -> io::Result<usize> {
        let mut iov: Vec<libc::iovec> = bufs
            .iter()
            .map(|b| libc::iovec {
                iov_base: b.as_ptr() as *mut libc::c_void,
                iov_len: b.len(),
            })
            .collect();
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = iov.as_mut_ptr();
        msg.msg_iovlen = iov.len() as _;

        loop {
            let n = unsafe {
                libc::sendmsg(
                    self.stream.as_raw_fd(),
                    &msg,
                    libc::MSG_ZEROCOPY | libc::MSG_NOSIGNAL,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

// ─── Completion channel ─────────────────────────────────────────────────────

/// Reader for the socket error queue.
#[derive(Debug)]
pub struct ErrQueue {
    stream: TcpStream,
    /// Completion dequeued by [`wait`](CompletionChannel::wait), handed out
    /// by the next `try_recv`.
    ready: Option<Notification>,
}

impl ErrQueue {
    fn new(stream: TcpStream) -> Self {
        ErrQueue {
            stream,
            ready: None,
        }
    }
}

impl ErrQueue {
    fn recv_one(&self) -> io::Result<Option<Option<Notification>>> {
        // u64 backing keeps the control buffer aligned for `cmsghdr`.
        let mut control = [0u64; 16];
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = mem::size_of_val(&control) as _;

        let rc = unsafe {
            libc::recvmsg(
                self.stream.as_raw_fd(),
                &mut msg,
                libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }

        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let hdr = &*cmsg;
                let is_recverr = (hdr.cmsg_level == libc::SOL_IP
                    && hdr.cmsg_type == libc::IP_RECVERR)
                    || (hdr.cmsg_level == libc::SOL_IPV6 && hdr.cmsg_type == libc::IPV6_RECVERR);
                if is_recverr {
                    let ee = std::ptr::read_unaligned(
                        libc::CMSG_DATA(cmsg) as *const SockExtendedErr
                    );
                    if ee.ee_origin == SO_EE_ORIGIN_ZEROCOPY && ee.ee_errno == 0 {
                        return Ok(Some(Some(Notification {
                            lo: ee.ee_info,
                            hi: ee.ee_data,
                            copied: ee.ee_code & SO_EE_CODE_ZEROCOPY_COPIED != 0,
                        })));
                    }
                    debug!(
                        origin = ee.ee_origin,
                        errno = ee.ee_errno,
                        "ignoring non zero-copy error queue entry"
                    );
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
        // Dequeued something that was not a completion.
        Ok(Some(None))
    }
}

impl CompletionChannel for ErrQueue {
    fn try_recv(&mut self) -> io::Result<Option<Notification>> {
        if let Some(n) = self.ready.take() {
            return Ok(Some(n));
        }
        loop {
            match self.recv_one()? {
                None => return Ok(None),
                Some(Some(n)) => return Ok(Some(n)),
                Some(None) => continue,
            }
        }
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<bool> {
        if self.ready.is_some() {
            return Ok(true);
        }
        let started = Instant::now();
        // Error-queue readiness is reported as POLLERR, which poll(2)
        // always returns regardless of the requested events.
        let mut pfd = libc::pollfd {
            fd: self.stream.as_raw_fd(),
            events: 0,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().clamp(1, libc::c_int::MAX as u128) as libc::c_int;
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(false);
        }

        // POLLERR also stays raised for a pending socket error, and POLLHUP
        // for a hung-up peer, with the queue empty. Only a dequeued
        // completion ends the wait early.
        loop {
            if let Some(n) = self.try_recv()? {
                self.ready = Some(n);
                return Ok(true);
            }
            let Some(rest) = timeout.checked_sub(started.elapsed()) else {
                return Ok(false);
            };
            if rest.is_zero() {
                return Ok(false);
            }
            thread::sleep(rest.min(IDLE_ERROR_BACKOFF));
        }
    }
}
