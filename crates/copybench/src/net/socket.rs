//! TCP socket setup shared by the server and the load generator.
//!
//! Both ends disable Nagle so one request/echo exchange is never held back
//! waiting for more data; the listener also sets `SO_REUSEADDR` so a
//! restarted server can rebind while old connections sit in TIME_WAIT.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// Bind a non-blocking listener. `backlog` follows the session cap so
/// excess connections still reach `accept` and are rejected explicitly.
pub fn bind_listener(addr: SocketAddr, backlog: usize) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(backlog.clamp(16, i32::MAX as usize) as i32)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Prepare an accepted stream: blocking mode, Nagle off.
pub fn configure_accepted(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)
}

/// Resolve `host:port` and connect with Nagle disabled.
pub fn connect(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(true)?;
        match socket.connect_timeout(&SockAddr::from(addr), timeout) {
            Ok(()) => return Ok(socket.into()),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{host}:{port} resolved to no addresses"),
        )
    }))
}
