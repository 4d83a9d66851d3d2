//! Outbound relay client: the connection-engine side of forwarding a
//! session to an upstream server of this same kind. Owns exactly one
//! nested TCP (optionally TLS) connection per parent connection closure.

use crate::codec::{self, Decoded};
use crate::config::RelayConfig;
use crate::error::{self, Error, Result};
use crate::tls::TlsAdapter;
use crate::wire::{ClientMessage, ServerMessage};
use mio::net::TcpStream as MioTcpStream;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

enum Transport {
    Plain(MioTcpStream),
    Tls(TlsAdapter<MioTcpStream>),
}

/// A live (or connecting) connection to the upstream relay, forwarding a
/// single downstream session.
pub struct RelayLink {
    transport: Transport,
    out_queue: VecDeque<Vec<u8>>,
    read_buf: Vec<u8>,
    read_len: usize,
    /// Replies decoded from the relay but not yet delivered to the
    /// downstream client (drained by `Connection::pump_relay_inbound`).
    pub inbound: VecDeque<ServerMessage>,
    closed: bool,
}

impl RelayLink {
    /// Connect (synchronously, best-effort non-blocking) to the first
    /// reachable endpoint in `config.endpoints`.
    pub fn connect(config: &RelayConfig, server_name: Option<&str>) -> Result<Self> {
        let addr: SocketAddr = *config
            .endpoints
            .first()
            .ok_or_else(|| Error::resource("no relay endpoint configured"))?;
        let stream = MioTcpStream::connect(addr)
            .map_err(|e| error::transport_context(e, format!("connecting to relay {addr}")))?;
        let transport = if config.tls {
            let name = server_name.unwrap_or("relay").to_string();
            Transport::Tls(TlsAdapter::client(stream, &name)?)
        } else {
            Transport::Plain(stream)
        };
        Ok(Self {
            transport,
            out_queue: VecDeque::new(),
            read_buf: vec![0u8; 4096],
            read_len: 0,
            inbound: VecDeque::new(),
            closed: false,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Re-encode and enqueue a message to forward upstream: each inbound
    /// message is re-encoded verbatim onto the outbound relay connection's
    /// write queue.
    pub fn forward(&mut self, msg: &ClientMessage) -> Result<()> {
        let frame = codec::encode(msg)?;
        self.out_queue.push_back(frame);
        Ok(())
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.out_queue.is_empty()
    }

    /// Drive one round of non-blocking I/O: flush as much of the write
    /// queue as the socket accepts, then read and decode any complete
    /// `ServerMessage` frames into `inbound`.
    pub fn drive(&mut self) -> Result<()> {
        self.flush_writes()?;
        self.read_replies()?;
        Ok(())
    }

    fn flush_writes(&mut self) -> Result<()> {
        while let Some(mut front) = self.out_queue.pop_front() {
            match self.write_transport(&front) {
                Ok(n) if n == front.len() => {}
                Ok(n) => {
                    front.drain(0..n);
                    self.out_queue.push_front(front);
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.out_queue.push_front(front);
                    break;
                }
                Err(e) => {
                    self.closed = true;
                    self.out_queue.push_front(front);
                    return Err(Error::from(e));
                }
            }
        }
        Ok(())
    }

    fn write_transport(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.transport {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(t) => t.write(buf),
        }
    }

    fn read_transport(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.transport {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(t) => t.read(buf),
        }
    }

    fn read_replies(&mut self) -> Result<()> {
        loop {
            if self.read_len == self.read_buf.len() {
                self.read_buf.resize(self.read_buf.len() * 2, 0);
            }
            let mut read_buf = std::mem::take(&mut self.read_buf);
            let result = self.read_transport(&mut read_buf[self.read_len..]);
            self.read_buf = read_buf;
            match result {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => self.read_len += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.closed = true;
                    return Err(Error::from(e));
                }
            }
            self.decode_available()?;
        }
        self.decode_available()
    }

    fn decode_available(&mut self) -> Result<()> {
        loop {
            match codec::decode::<ServerMessage>(&self.read_buf[..self.read_len])? {
                Decoded::Message { value, consumed } => {
                    self.read_buf.copy_within(consumed..self.read_len, 0);
                    self.read_len -= consumed;
                    self.inbound.push_back(value);
                }
                Decoded::NeedMore => break,
            }
        }
        Ok(())
    }

    pub fn mio_source_plain(&mut self) -> Option<&mut MioTcpStream> {
        match &mut self.transport {
            Transport::Plain(s) => Some(s),
            Transport::Tls(t) => Some(t.underlying_mut()),
        }
    }
}
