//! TLS adapter: drives a `rustls` session using the same
//! non-blocking read/write model as the plaintext path, including the two
//! reentrancy bits that handle protocol-internal rekeying.
//!
//! `rustls` signals `wants_read()`/`wants_write()` rather than
//! `want_read`/`want_write` return codes from `SSL_read`/`SSL_write`
//! directly, but the resulting event-registration dance is the same: when
//! the session wants to write during what the event loop thought was a
//! read (or vice versa), the connection has to borrow the other
//! direction's event, temporarily if none is currently scheduled.

use crate::error::{Error, Result};
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use std::io::{self, Read, Write};
use std::sync::Arc;

enum Session {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl Session {
    fn wants_read(&self) -> bool {
        match self {
            Session::Server(s) => s.wants_read(),
            Session::Client(s) => s.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Session::Server(s) => s.wants_write(),
            Session::Client(s) => s.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Session::Server(s) => s.is_handshaking(),
            Session::Client(s) => s.is_handshaking(),
        }
    }

    fn read_tls(&mut self, r: &mut dyn Read) -> io::Result<usize> {
        match self {
            Session::Server(s) => s.read_tls(r),
            Session::Client(s) => s.read_tls(r),
        }
    }

    fn write_tls(&mut self, w: &mut dyn Write) -> io::Result<usize> {
        match self {
            Session::Server(s) => s.write_tls(w),
            Session::Client(s) => s.write_tls(w),
        }
    }

    fn process_new_packets(&mut self) -> std::result::Result<rustls::IoState, rustls::Error> {
        match self {
            Session::Server(s) => s.process_new_packets(),
            Session::Client(s) => s.process_new_packets(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Session::Server(s) => s.reader(),
            Session::Client(s) => s.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Session::Server(s) => s.writer(),
            Session::Client(s) => s.writer(),
        }
    }

    fn negotiated_cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
        match self {
            Session::Server(s) => s.negotiated_cipher_suite(),
            Session::Client(s) => s.negotiated_cipher_suite(),
        }
    }

    fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        match self {
            Session::Server(s) => s.protocol_version(),
            Session::Client(s) => s.protocol_version(),
        }
    }
}

/// Which "other" direction the TLS session is currently borrowing, so the
/// adapter knows what to re-arm once that direction is ready again.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reentrancy {
    pub read_instead_of_write: bool,
    pub write_instead_of_read: bool,
    pub temporary_write_event: bool,
}

pub struct TlsAdapter<S: Read + Write> {
    session: Session,
    transport: S,
    pub reentrancy: Reentrancy,
    handshake_done: bool,
}

impl<S: Read + Write> TlsAdapter<S> {
    pub fn server(transport: S, config: Arc<ServerConfig>) -> Result<Self> {
        let session = ServerConnection::new(config)
            .map_err(|e| Error::protocol(format!("tls server setup: {e}")))?;
        Ok(Self {
            session: Session::Server(session),
            transport,
            reentrancy: Reentrancy::default(),
            handshake_done: false,
        })
    }

    pub fn underlying_mut(&mut self) -> &mut S {
        &mut self.transport
    }

    /// Drive the handshake one step. Returns `Ok(true)` once complete. On
    /// each call, reads or writes TLS records depending on which direction
    /// `rustls` currently wants, reassigning the event registration each
    /// time the preference flips.
    pub fn advance_handshake(&mut self) -> Result<bool> {
        if !self.session.is_handshaking() {
            self.handshake_done = true;
            return Ok(true);
        }

        if self.session.wants_read() {
            match self.session.read_tls(&mut self.transport) {
                Ok(0) => return Err(Error::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed during tls handshake",
                ))),
                Ok(_) => {
                    self.session
                        .process_new_packets()
                        .map_err(|e| Error::protocol(format!("tls handshake error: {e}")))?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(Error::from(e)),
            }
        }

        if self.session.wants_write() {
            match self.session.write_tls(&mut self.transport) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(Error::from(e)),
            }
        }

        self.handshake_done = !self.session.is_handshaking();
        Ok(self.handshake_done)
    }

    pub fn is_handshaking(&self) -> bool {
        self.session.is_handshaking()
    }

    /// Negotiated version/cipher for diagnostics.
    pub fn diagnostics(&self) -> Option<(String, String)> {
        let version = self.session.protocol_version()?;
        let suite = self.session.negotiated_cipher_suite()?;
        Some((format!("{version:?}"), format!("{:?}", suite.suite())))
    }

    /// Whether the event loop should hold a `WRITABLE` registration open
    /// on this connection's socket purely to retry a TLS record write
    /// that previously hit `WouldBlock` mid-`pump`.
    pub fn wants_writable_registration(&self) -> bool {
        self.reentrancy.temporary_write_event
    }

    /// Retry the pending write once the socket reports writable. Clears
    /// the temporary write event once the session has nothing left to
    /// write, so the caller can drop the `WRITABLE` registration again.
    pub fn drive_pending_write(&mut self) -> io::Result<()> {
        self.pump()?;
        if !self.session.wants_write() {
            self.reentrancy.temporary_write_event = false;
        }
        Ok(())
    }

    /// Pump ciphertext in both directions; call before `Read`/`Write` on
    /// application data once the handshake has completed.
    fn pump(&mut self) -> io::Result<()> {
        if self.session.wants_write() {
            self.reentrancy.write_instead_of_read = false;
            loop {
                match self.session.write_tls(&mut self.transport) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.reentrancy.read_instead_of_write = true;
                        self.reentrancy.temporary_write_event = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if self.session.wants_read() {
            match self.session.read_tls(&mut self.transport) {
                Ok(_) => {
                    self.reentrancy.read_instead_of_write = false;
                    self.reentrancy.temporary_write_event = false;
                    let _ = self.session.process_new_packets();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.reentrancy.write_instead_of_read = true;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<S: Read + Write> TlsAdapter<S> {
    pub fn client(transport: S, server_name: &str) -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots_trust_anchors());
        let config = Arc::new(
            ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let name = rustls::ServerName::try_from(server_name)
            .map_err(|e| Error::protocol(format!("invalid relay server name: {e}")))?;
        let session = ClientConnection::new(config, name)
            .map_err(|e| Error::protocol(format!("tls client setup: {e}")))?;
        Ok(Self {
            session: Session::Client(session),
            transport,
            reentrancy: Reentrancy::default(),
            handshake_done: false,
        })
    }
}

/// Minimal trust anchor set; relay connections are within the same
/// deployment, so a locally-issued CA is expected here in practice (the
/// crate does not ship a fixed bundle, unlike a browser-facing client).
fn webpki_roots_trust_anchors() -> impl Iterator<Item = rustls::OwnedTrustAnchor> {
    std::iter::empty()
}

impl<S: Read + Write> Read for TlsAdapter<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.pump()?;
        match self.session.reader().read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Err(e.kind().into()),
            Err(e) => Err(e),
        }
    }
}

impl<S: Read + Write> Write for TlsAdapter<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.session.writer().write(buf)?;
        self.pump()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.pump()
    }
}
