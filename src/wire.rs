//! Wire message schema for the audit log protocol.
//!
//! Every message is a `serde`-derived enum encoded with `bincode` and framed
//! by [`crate::codec`] as a big-endian length prefix followed by the packed
//! bytes. Field names follow the external interface section of the design
//! doc exactly.

use serde::{Deserialize, Serialize};

/// Seconds + nanoseconds, used for submit/run times, I/O delays and commit
/// points. Mirrors a POSIX `timespec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpec {
    pub secs: i64,
    pub nanos: i32,
}

impl TimeSpec {
    pub const ZERO: TimeSpec = TimeSpec { secs: 0, nanos: 0 };

    pub fn new(secs: i64, nanos: i32) -> Self {
        Self { secs, nanos }
    }
}

impl PartialOrd for TimeSpec {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeSpec {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.secs, self.nanos).cmp(&(other.secs, other.nanos))
    }
}

/// The core never interprets these values; they are
/// forwarded opaquely to the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InfoValue {
    Text(String),
    Number(i64),
    Strings(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoMessage {
    pub key: String,
    pub value: InfoValue,
}

/// Which of the five I/O streams an `IoBuffer` message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamId {
    TtyIn,
    TtyOut,
    StdIn,
    StdOut,
    StdErr,
}

impl StreamId {
    pub const ALL: [StreamId; 5] = [
        StreamId::TtyIn,
        StreamId::TtyOut,
        StreamId::StdIn,
        StreamId::StdOut,
        StreamId::StdErr,
    ];

    /// File name used under the I/O log directory for this stream.
    pub fn file_name(self) -> &'static str {
        match self {
            StreamId::TtyIn => "ttyin",
            StreamId::TtyOut => "ttyout",
            StreamId::StdIn => "stdin",
            StreamId::StdOut => "stdout",
            StreamId::StdErr => "stderr",
        }
    }
}

/// Inbound (client to server) message kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    ClientHello {
        client_id: String,
    },
    Accept {
        submit_time: TimeSpec,
        info_msgs: Vec<InfoMessage>,
        expect_iobufs: bool,
    },
    Reject {
        reason: String,
        submit_time: TimeSpec,
        info_msgs: Vec<InfoMessage>,
    },
    Exit {
        exit_value: i32,
        run_time: TimeSpec,
        signal: Option<String>,
        dumped_core: bool,
    },
    Restart {
        log_id: String,
        restart_time: TimeSpec,
    },
    Alert {
        reason: String,
        alert_time: TimeSpec,
        info_msgs: Vec<InfoMessage>,
    },
    IoBuffer {
        stream: StreamId,
        delay: TimeSpec,
        data: Vec<u8>,
    },
    ChangeWindowSize {
        rows: u16,
        cols: u16,
        delay: TimeSpec,
    },
    CommandSuspend {
        signal: String,
        delay: TimeSpec,
    },
}

impl ClientMessage {
    /// Short name used for logging and error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ClientMessage::ClientHello { .. } => "ClientHello",
            ClientMessage::Accept { .. } => "Accept",
            ClientMessage::Reject { .. } => "Reject",
            ClientMessage::Exit { .. } => "Exit",
            ClientMessage::Restart { .. } => "Restart",
            ClientMessage::Alert { .. } => "Alert",
            ClientMessage::IoBuffer { .. } => "IoBuffer",
            ClientMessage::ChangeWindowSize { .. } => "ChangeWindowSize",
            ClientMessage::CommandSuspend { .. } => "CommandSuspend",
        }
    }
}

/// Outbound (server to client) message kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    ServerHello { server_id: String },
    LogId { id: String },
    CommitPoint { time: TimeSpec },
    Error { reason: String },
}
