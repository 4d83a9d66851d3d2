//! Listener and accept loop: binds each configured address with
//! `SO_REUSEADDR`, `IPV6_V6ONLY` where applicable, and the platform's
//! maximum backlog, then hands accepted sockets to the caller.

use crate::error::{Error, Result};
use mio::net::TcpStream as MioTcpStream;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;

/// A bound, listening, non-blocking socket plus the `tls` flag carried by
/// its configuration.
pub struct Listener {
    inner: mio::net::TcpListener,
    pub bind_addr: SocketAddr,
    pub tls: bool,
}

impl Listener {
    pub fn bind(bind_addr: SocketAddr, tls: bool, backlog: i32) -> Result<Self> {
        let domain = if bind_addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::fatal_config(format!("creating socket for {bind_addr}: {e}")))?;

        socket
            .set_reuse_address(true)
            .map_err(|e| Error::fatal_config(format!("SO_REUSEADDR on {bind_addr}: {e}")))?;

        if bind_addr.is_ipv6() {
            socket
                .set_only_v6(true)
                .map_err(|e| Error::fatal_config(format!("IPV6_V6ONLY on {bind_addr}: {e}")))?;
        }

        socket
            .bind(&bind_addr.into())
            .map_err(|e| Error::fatal_config(format!("binding {bind_addr}: {e}")))?;
        socket
            .listen(backlog)
            .map_err(|e| Error::fatal_config(format!("listen on {bind_addr}: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::fatal_config(format!("set_nonblocking on {bind_addr}: {e}")))?;

        let inner = mio::net::TcpListener::from_std(socket.into());

        Ok(Self { inner, bind_addr, tls })
    }

    pub fn mio_source(&mut self) -> &mut mio::net::TcpListener {
        &mut self.inner
    }

    /// Accept one connection, applying the keepalive toggle, and format
    /// its peer address as a plain string for logging and, if TLS is in
    /// play, hostname validation.
    pub fn accept_one(&self, tcp_keepalive: bool) -> Result<Option<(MioTcpStream, String)>> {
        match self.inner.accept() {
            Ok((stream, addr)) => {
                if tcp_keepalive {
                    use std::os::fd::AsRawFd;
                    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(stream.as_raw_fd()) };
                    let sock = socket2::SockRef::from(&borrowed);
                    if let Err(e) = sock.set_keepalive(true) {
                        tracing::warn!(peer = %addr, error = %e, "failed to enable SO_KEEPALIVE");
                    }
                }
                Ok(Some((stream, addr.to_string())))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }
}
