//! A network audit-log server for privilege-escalation session transcripts:
//! a single-threaded `mio` event loop that accepts sessions over TCP or
//! TLS, dispatches each through a framed wire protocol and a per-session
//! state machine, and persists or relays the resulting I/O transcript.
//!
//! The event loop itself is cooperative, not async -- every connection is
//! serviced to completion (or to its next would-block) before control
//! returns to `Poll::poll`, the same model as a traditional reactor.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod buffer;
pub mod cli;
pub mod codec;
pub mod commit;
pub mod config;
pub mod connection;
pub mod error;
pub mod eventlog;
pub mod iolog;
pub mod lifecycle;
pub mod listener;
pub mod pidfile;
pub mod relay_client;
pub mod replay;
pub mod server;
pub mod sink;
pub mod state;
pub mod tls;
pub mod wire;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use server::Server;
