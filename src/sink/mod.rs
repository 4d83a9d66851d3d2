//! Sink dispatch: a capability set — one implementation per message
//! kind — with three concrete variants. Exactly one is bound per
//! connection at construction time; dispatch never switches sinks at
//! runtime.
//!
//! A capability table could be implemented as eight function pointers;
//! here it's a trait object bound once per connection.

pub mod journal;
pub mod local;
pub mod relay;

use crate::error::Result;
use crate::wire::{InfoMessage, StreamId, TimeSpec};

/// Outcome of a successful `Accept` dispatch: whether a `LogId` reply
/// should be sent immediately, and with what identifier.
pub enum AcceptOutcome {
    /// No local log id to report yet (e.g. the relay sink defers to
    /// whatever the upstream relay replies with).
    Deferred,
    /// Emit `LogId { id }` now.
    LogId(String),
}

/// The pluggable destination for one connection's messages.
pub trait Sink {
    fn accept(
        &mut self,
        submit_time: TimeSpec,
        info_msgs: &[InfoMessage],
        expect_iobufs: bool,
    ) -> Result<AcceptOutcome>;

    fn reject(&mut self, reason: &str, submit_time: TimeSpec, info_msgs: &[InfoMessage]) -> Result<()>;

    fn exit(
        &mut self,
        exit_value: i32,
        run_time: TimeSpec,
        signal: Option<&str>,
        dumped_core: bool,
    ) -> Result<()>;

    fn restart(&mut self, log_id: &str, restart_time: TimeSpec) -> Result<()>;

    fn alert(&mut self, reason: &str, alert_time: TimeSpec, info_msgs: &[InfoMessage]) -> Result<()>;

    fn iobuf(&mut self, stream: StreamId, delay: TimeSpec, data: &[u8]) -> Result<()>;

    fn winsize(&mut self, rows: u16, cols: u16, delay: TimeSpec) -> Result<()>;

    fn suspend(&mut self, signal: &str, delay: TimeSpec) -> Result<()>;
}
