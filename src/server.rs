//! The event loop: a single `mio::Poll` multiplexing every
//! listener, connection, timer, and signal. Nothing here ever blocks;
//! each callback runs to completion before control returns to `poll`.

use crate::commit::{CommitScheduler, TimerKind};
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use crate::listener::Listener;
use crate::relay_client::RelayLink;
use crate::replay;
use crate::sink::journal::JournalSink;
use crate::sink::local::{LocalSink, RandomDrop};
use crate::sink::relay::RelaySink;
use crate::sink::Sink;
use crate::state::State;
use crate::tls::TlsAdapter;
use mio::net::TcpStream as MioTcpStream;
use mio::{Events, Interest, Poll, Token};
use rustls::{Certificate, PrivateKey, ServerConfig as RustlsServerConfig};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGPIPE, SIGTERM};
use signal_hook_mio::v0_8::Signals;
use slotmap::{DefaultKey, SlotMap};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

const SERVER_ID: &str = concat!("Sudo Audit Server <", env!("CARGO_PKG_VERSION"), ">");
const SIGNAL_TOKEN: Token = Token(usize::MAX - 1);
const DYNAMIC_TOKEN_BASE: usize = 1024;

enum Transport {
    Plain(MioTcpStream),
    Tls(TlsAdapter<MioTcpStream>),
}

impl Transport {
    fn mio_source(&mut self) -> &mut MioTcpStream {
        match self {
            Transport::Plain(s) => s,
            Transport::Tls(t) => t.underlying_mut(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(t) => t.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(t) => t.write(buf),
        }
    }

    fn handshaking(&self) -> bool {
        matches!(self, Transport::Tls(t) if t.is_handshaking())
    }

    fn wants_writable_registration(&self) -> bool {
        matches!(self, Transport::Tls(t) if t.wants_writable_registration())
    }

    fn drive_pending_write(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(_) => Ok(()),
            Transport::Tls(t) => t.drive_pending_write(),
        }
    }

    fn diagnostics(&self) -> Option<(String, String)> {
        match self {
            Transport::Plain(_) => None,
            Transport::Tls(t) => t.diagnostics(),
        }
    }
}

struct ConnEntry {
    conn: Connection,
    transport: Transport,
    token: Token,
    relay: Option<Rc<RefCell<RelayLink>>>,
    commit_armed: bool,
    /// Whether this connection's socket currently has `Interest::WRITABLE`
    /// registered in addition to `READABLE`, to retry a TLS record write
    /// that previously hit `WouldBlock`.
    writable_registered: bool,
    /// Set when this connection is backed by a [`JournalSink`]: the
    /// journal file to replay once the session reaches `Finished`.
    journal_path: Option<PathBuf>,
}

enum ReadOutcome {
    Read,
    WouldBlock,
    Closed,
}

pub struct Server {
    poll: Poll,
    events: Events,
    listeners: Vec<(Token, Listener)>,
    connections: SlotMap<DefaultKey, ConnEntry>,
    token_to_key: HashMap<Token, DefaultKey>,
    next_token: usize,
    config: ServerConfig,
    tls_server_config: Option<Arc<RustlsServerConfig>>,
    scheduler: CommitScheduler,
    lifecycle: Lifecycle,
    signals: Signals,
    random_drop: RandomDrop,
}

impl Server {
    pub fn new(config: ServerConfig, config_path: PathBuf, random_drop: RandomDrop) -> Result<Self> {
        let poll = Poll::new().map_err(Error::from)?;
        let listeners = bind_listeners(&poll, &config)?;

        let tls_server_config = match &config.tls {
            Some(tls) => Some(Arc::new(build_server_tls_config(tls)?)),
            None => None,
        };

        let mut signals = Signals::new([SIGHUP, SIGINT, SIGTERM, SIGPIPE])
            .map_err(|e| Error::fatal_config(format!("installing signal handlers: {e}")))?;
        poll.registry()
            .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)
            .map_err(|e| Error::fatal_config(format!("registering signal handler: {e}")))?;

        let ack_frequency = Duration::from_secs(2);
        let shutdown_timeout = config.server_timeout;

        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            listeners,
            connections: SlotMap::new(),
            token_to_key: HashMap::new(),
            next_token: DYNAMIC_TOKEN_BASE,
            config,
            tls_server_config,
            scheduler: CommitScheduler::new(ack_frequency),
            lifecycle: Lifecycle::new(config_path, shutdown_timeout),
            signals,
            random_drop,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        loop {
            let timeout = self.scheduler.next_timeout();
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from(e)),
            }

            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();
            for (token, readable, writable) in ready {
                if token == SIGNAL_TOKEN {
                    self.handle_signals()?;
                } else if let Some(idx) = self.listener_index(token) {
                    self.accept_on(idx)?;
                } else if let Some(key) = self.token_to_key.get(&token).copied() {
                    if writable {
                        self.service_writable(key)?;
                    }
                    if readable {
                        self.service_connection(key)?;
                    }
                }
            }

            self.fire_timers()?;
            self.drive_relays()?;

            if self.lifecycle.is_draining() && self.connections.is_empty() {
                self.lifecycle.mark_stopped();
                return Ok(());
            }
        }
    }

    fn listener_index(&self, token: Token) -> Option<usize> {
        self.listeners.iter().position(|(t, _)| *t == token)
    }

    fn handle_signals(&mut self) -> Result<()> {
        let pending: Vec<i32> = self.signals.pending().collect();
        for signal in pending {
            match signal {
                SIGHUP => {
                    if let Some(new_config) = self.lifecycle.reload() {
                        self.reload_listeners(new_config)?;
                    }
                }
                SIGINT | SIGTERM => self.begin_shutdown(),
                SIGPIPE => {}
                _ => {}
            }
        }
        Ok(())
    }

    fn reload_listeners(&mut self, new_config: ServerConfig) -> Result<()> {
        for (_, mut listener) in self.listeners.drain(..) {
            let _ = self.poll.registry().deregister(listener.mio_source());
        }
        self.listeners = bind_listeners(&self.poll, &new_config)?;
        self.config = new_config;
        Ok(())
    }

    fn begin_shutdown(&mut self) {
        tracing::info!("shutdown requested");
        let timeout = self.lifecycle.begin_shutdown();
        for (_, mut listener) in self.listeners.drain(..) {
            let _ = self.poll.registry().deregister(listener.mio_source());
        }
        let keys: Vec<DefaultKey> = self.connections.keys().collect();
        for key in keys {
            let has_relay = self.connections[key].relay.is_some();
            let log_io = self.connections[key].conn.log_io();
            let outcome = self.connections[key].conn.begin_shutdown();
            if !has_relay && log_io {
                self.scheduler.arm_commit(key);
            }
            let _ = self.flush_writes(key);
            self.sync_writable_registration(key);
            if outcome.close_after_drain {
                self.maybe_close_drained(key);
            }
        }
        if !self.connections.is_empty() {
            self.scheduler.arm_shutdown_deadline(timeout);
        }
    }

    fn accept_on(&mut self, idx: usize) -> Result<()> {
        loop {
            let (stream, peer, tls) = {
                let (_, listener) = &self.listeners[idx];
                match listener.accept_one(self.config.tcp_keepalive)? {
                    Some((stream, peer)) => (stream, peer, listener.tls),
                    None => return Ok(()),
                }
            };
            if let Err(e) = self.bootstrap_connection(stream, peer.clone(), tls) {
                tracing::warn!(peer, error = %e, "failed to bootstrap connection");
            }
        }
    }

    fn bootstrap_connection(&mut self, mut stream: MioTcpStream, peer: String, tls: bool) -> Result<()> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
            .map_err(Error::from)?;

        let transport = if tls {
            let config = self
                .tls_server_config
                .clone()
                .ok_or_else(|| Error::protocol("tls listener with no tls configuration"))?;
            Transport::Tls(TlsAdapter::server(stream, config)?)
        } else {
            Transport::Plain(stream)
        };

        let mut journal_path = None;
        let (sink, relay): (Box<dyn Sink>, Option<Rc<RefCell<RelayLink>>>) =
            if self.config.relay.enabled && self.config.relay.store_first {
                let journal_dir = self.config.iolog.dir.join("_journal");
                let journal = JournalSink::create(&journal_dir)?;
                journal_path = Some(journal.path().to_path_buf());
                (Box::new(journal), None)
            } else if self.config.relay.enabled {
                let link = Rc::new(RefCell::new(RelayLink::connect(&self.config.relay, Some(peer.as_str()))?));
                (Box::new(RelaySink::new(Rc::clone(&link))), Some(link))
            } else {
                (
                    Box::new(LocalSink::new(
                        self.config.iolog.dir.clone(),
                        self.config.iolog.file_mode,
                        self.random_drop,
                    )),
                    None,
                )
            };
        let has_relay = relay.is_some();

        if let Some(link) = &relay {
            let relay_token = Token(self.next_token);
            self.next_token += 1;
            if let Some(src) = link.borrow_mut().mio_source_plain() {
                // Purely to wake `poll` when a reply arrives with nothing
                // else active; `drive_relays` (not token dispatch) is what
                // actually pumps this socket.
                self.poll
                    .registry()
                    .register(src, relay_token, Interest::READABLE)
                    .map_err(Error::from)?;
            }
        }

        let mut conn = Connection::new(peer, sink, has_relay);
        conn.send_hello(SERVER_ID)?;

        let key = self.connections.insert(ConnEntry {
            conn,
            transport,
            token,
            relay,
            commit_armed: false,
            writable_registered: false,
            journal_path,
        });
        self.token_to_key.insert(token, key);
        Ok(())
    }

    fn read_into_connection(&mut self, key: DefaultKey) -> ReadOutcome {
        let entry = match self.connections.get_mut(key) {
            Some(e) => e,
            None => return ReadOutcome::Closed,
        };
        entry.conn.ensure_read_capacity(4096);
        match entry.transport.read(entry.conn.read_spare_mut()) {
            Ok(0) => ReadOutcome::Closed,
            Ok(n) => {
                entry.conn.read_commit(n);
                ReadOutcome::Read
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
            Err(e) => {
                tracing::warn!(error = %e, "transport read failed");
                ReadOutcome::Closed
            }
        }
    }

    fn service_connection(&mut self, key: DefaultKey) -> Result<()> {
        let handshaking = matches!(self.connections.get(key), Some(e) if e.transport.handshaking());
        if handshaking {
            return self.drive_handshake(key);
        }

        match self.read_into_connection(key) {
            ReadOutcome::Closed => {
                self.close_connection(key);
                return Ok(());
            }
            ReadOutcome::WouldBlock | ReadOutcome::Read => {}
        }

        let outcomes = match self.connections.get_mut(key) {
            Some(entry) => entry.conn.drain_messages(),
            None => return Ok(()),
        };
        let outcomes = match outcomes {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(error = %e, "decode failure");
                self.close_connection(key);
                return Ok(());
            }
        };

        let arm_commit = outcomes.iter().any(|o| o.arm_commit);
        let should_close = outcomes.iter().any(|o| o.close_after_drain);

        if arm_commit {
            if let Some(entry) = self.connections.get_mut(key) {
                if !entry.conn.has_relay() && !entry.commit_armed {
                    entry.commit_armed = true;
                    self.scheduler.arm_commit(key);
                }
            }
        }

        self.flush_writes(key)?;

        if should_close {
            self.maybe_close_drained(key);
        }
        self.sync_writable_registration(key);
        Ok(())
    }

    /// Retry a TLS record write that previously blocked on the socket
    /// send buffer; fires on the `WRITABLE` half of a registration armed
    /// by [`Self::sync_writable_registration`].
    fn service_writable(&mut self, key: DefaultKey) -> Result<()> {
        let result = match self.connections.get_mut(key) {
            Some(entry) => entry.transport.drive_pending_write(),
            None => return Ok(()),
        };
        match result {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::warn!(error = %e, "tls write-event retry failed");
                self.close_connection(key);
                return Ok(());
            }
        }
        self.flush_writes(key)?;
        self.sync_writable_registration(key);
        Ok(())
    }

    /// Add or drop the socket's `WRITABLE` registration to match whether
    /// the TLS session currently has a blocked write waiting to retry.
    fn sync_writable_registration(&mut self, key: DefaultKey) {
        let (wants, already, token) = match self.connections.get(key) {
            Some(entry) => (
                entry.transport.wants_writable_registration(),
                entry.writable_registered,
                entry.token,
            ),
            None => return,
        };
        if wants == already {
            return;
        }
        if let Some(entry) = self.connections.get_mut(key) {
            let interest = if wants {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            if self
                .poll
                .registry()
                .reregister(entry.transport.mio_source(), token, interest)
                .is_ok()
            {
                entry.writable_registered = wants;
            }
        }
    }

    fn drive_handshake(&mut self, key: DefaultKey) -> Result<()> {
        let result = match self.connections.get_mut(key) {
            Some(entry) => match &mut entry.transport {
                Transport::Tls(t) => t.advance_handshake(),
                Transport::Plain(_) => Ok(true),
            },
            None => return Ok(()),
        };
        let done = match result {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!(error = %e, "tls handshake failed");
                self.close_connection(key);
                return Ok(());
            }
        };
        if done {
            if let Some((version, suite)) = self.connections.get(key).and_then(|e| e.transport.diagnostics()) {
                tracing::debug!(version, suite, "tls handshake complete");
            }
        }
        Ok(())
    }

    fn flush_writes(&mut self, key: DefaultKey) -> Result<()> {
        loop {
            let entry = match self.connections.get_mut(key) {
                Some(e) => e,
                None => return Ok(()),
            };
            if !entry.conn.has_pending_writes() {
                return Ok(());
            }
            let wrote = {
                let buf = entry.conn.write_queue().front_mut().expect("checked has_pending_writes");
                entry.transport.write(buf.unconsumed())
            };
            match wrote {
                Ok(n) => {
                    entry.conn.write_queue().front_mut().unwrap().advance(n);
                    let mut pool = std::mem::take(entry.conn.buffer_pool());
                    entry.conn.write_queue().pop_drained(&mut pool);
                    *entry.conn.buffer_pool() = pool;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, "transport write failed");
                    self.close_connection(key);
                    return Ok(());
                }
            }
        }
    }

    fn maybe_close_drained(&mut self, key: DefaultKey) {
        let drained = self
            .connections
            .get(key)
            .map(|e| !e.conn.has_pending_writes())
            .unwrap_or(true);
        if drained {
            self.close_connection(key);
        }
    }

    fn fire_timers(&mut self) -> Result<()> {
        for fired in self.scheduler.drain_due() {
            match fired {
                TimerKind::CommitAck(key) => {
                    let outcome = match self.connections.get_mut(key) {
                        Some(entry) => entry.conn.emit_scheduled_commit(),
                        None => continue,
                    };
                    match outcome {
                        Ok(outcome) => {
                            self.flush_writes(key)?;
                            self.sync_writable_registration(key);
                            if outcome.close_after_drain {
                                self.maybe_close_drained(key);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "commit emission failed");
                            self.close_connection(key);
                        }
                    }
                }
                TimerKind::ShutdownDeadline => {
                    let keys: Vec<DefaultKey> = self.connections.keys().collect();
                    for key in keys {
                        self.close_connection(key);
                    }
                }
            }
        }
        Ok(())
    }

    /// Pump every attached relay link's non-blocking I/O and forward
    /// decoded replies back to their downstream client connections: replies
    /// flow in the reverse direction and are what the client receives.
    fn drive_relays(&mut self) -> Result<()> {
        let keys: Vec<DefaultKey> = self
            .connections
            .iter()
            .filter(|(_, e)| e.relay.is_some())
            .map(|(k, _)| k)
            .collect();
        for key in keys {
            let (link, closed) = match self.connections.get(key).and_then(|e| e.relay.clone()) {
                Some(link) => {
                    if let Err(e) = link.borrow_mut().drive() {
                        tracing::warn!(error = %e, "relay link I/O failed");
                    }
                    let closed = link.borrow().is_closed();
                    (link, closed)
                }
                None => continue,
            };
            let replies: Vec<_> = link.borrow_mut().inbound.drain(..).collect();
            for msg in replies {
                let outcome = match self.connections.get_mut(key) {
                    Some(entry) => entry.conn.forward_relay_reply(msg),
                    None => break,
                };
                match outcome {
                    Ok(o) => {
                        self.flush_writes(key)?;
                        self.sync_writable_registration(key);
                        if o.close_after_drain {
                            self.maybe_close_drained(key);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "forwarding relay reply failed");
                        self.close_connection(key);
                        break;
                    }
                }
            }
            if closed {
                self.close_connection(key);
            }
        }
        Ok(())
    }

    fn close_connection(&mut self, key: DefaultKey) {
        self.scheduler.cancel_commit(key);
        if let Some(mut entry) = self.connections.remove(key) {
            let _ = self.poll.registry().deregister(entry.transport.mio_source());
            self.token_to_key.remove(&entry.token);
            if let Some(link) = &entry.relay {
                if let Some(src) = link.borrow_mut().mio_source_plain() {
                    let _ = self.poll.registry().deregister(src);
                }
            }
            if entry.conn.state() == State::Finished {
                if let Some(path) = entry.journal_path {
                    self.replay_finished_journal(&path);
                }
            }
        }
    }

    /// Replay a just-completed store-first session's journal to the
    /// relay immediately rather than waiting for the next process
    /// startup's sweep. A failure here leaves the journal file in place
    /// for the startup sweep to retry.
    fn replay_finished_journal(&self, path: &std::path::Path) {
        match replay::replay_one(path, &self.config.relay) {
            Ok(()) => tracing::debug!(path = %path.display(), "replayed finished session journal"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "journal replay failed, retrying at next startup"),
        }
    }

    /// Replay any journals left over from a prior run once the relay
    /// configuration is known.
    pub fn replay_pending_journals(&self) -> Result<usize> {
        if !self.config.relay.enabled {
            return Ok(0);
        }
        let journal_dir = self.config.iolog.dir.join("_journal");
        replay::replay_pending(&journal_dir, &self.config.relay)
    }
}

fn bind_listeners(poll: &Poll, config: &ServerConfig) -> Result<Vec<(Token, Listener)>> {
    let mut listeners = Vec::new();
    for (i, l) in config.listeners.iter().enumerate() {
        let mut listener = Listener::bind(l.bind, l.tls, 1024)?;
        let token = Token(i);
        poll.registry()
            .register(listener.mio_source(), token, Interest::READABLE)
            .map_err(|e| Error::fatal_config(format!("registering listener {}: {e}", l.bind)))?;
        listeners.push((token, listener));
    }
    if listeners.is_empty() {
        return Err(Error::fatal_config("no listeners could be bound"));
    }
    Ok(listeners)
}

fn build_server_tls_config(tls: &crate::config::TlsConfig) -> Result<RustlsServerConfig> {
    let cert_file = std::fs::File::open(&tls.cert_file)
        .map_err(|e| Error::fatal_config(format!("opening {}: {e}", tls.cert_file.display())))?;
    let mut cert_reader = io::BufReader::new(cert_file);
    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut cert_reader)
        .map_err(|e| Error::fatal_config(format!("parsing {}: {e}", tls.cert_file.display())))?
        .into_iter()
        .map(Certificate)
        .collect();

    let key_file = std::fs::File::open(&tls.key_file)
        .map_err(|e| Error::fatal_config(format!("opening {}: {e}", tls.key_file.display())))?;
    let mut key_reader = io::BufReader::new(key_file);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
        .map_err(|e| Error::fatal_config(format!("parsing {}: {e}", tls.key_file.display())))?;
    let key = keys
        .pop()
        .map(PrivateKey)
        .ok_or_else(|| Error::fatal_config(format!("no private key found in {}", tls.key_file.display())))?;

    let builder = RustlsServerConfig::builder().with_safe_defaults();
    if tls.verify_peer {
        let mut roots = rustls::RootCertStore::empty();
        for cert in &certs {
            roots
                .add(cert)
                .map_err(|e| Error::fatal_config(format!("loading client-verification roots: {e}")))?;
        }
        let verifier = rustls::server::AllowAnyAuthenticatedClient::new(roots);
        builder
            .with_client_cert_verifier(Arc::new(verifier))
            .with_single_cert(certs, key)
            .map_err(|e| Error::fatal_config(format!("building tls server config: {e}")))
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::fatal_config(format!("building tls server config: {e}")))
    }
}
