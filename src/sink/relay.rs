//! Relay sink: forwards every inbound message verbatim onto the
//! nested relay connection instead of persisting it locally.

use super::{AcceptOutcome, Sink};
use crate::error::Result;
use crate::relay_client::RelayLink;
use crate::wire::{ClientMessage, InfoMessage, StreamId, TimeSpec};
use std::cell::RefCell;
use std::rc::Rc;

pub struct RelaySink {
    link: Rc<RefCell<RelayLink>>,
}

impl RelaySink {
    pub fn new(link: Rc<RefCell<RelayLink>>) -> Self {
        Self { link }
    }

    fn forward(&mut self, msg: ClientMessage) -> Result<()> {
        self.link.borrow_mut().forward(&msg)
    }
}

impl Sink for RelaySink {
    fn accept(
        &mut self,
        submit_time: TimeSpec,
        info_msgs: &[InfoMessage],
        expect_iobufs: bool,
    ) -> Result<AcceptOutcome> {
        self.forward(ClientMessage::Accept {
            submit_time,
            info_msgs: info_msgs.to_vec(),
            expect_iobufs,
        })?;
        // The relay's LogId reply arrives asynchronously via
        // `RelayLink::inbound`; nothing to emit from here.
        Ok(AcceptOutcome::Deferred)
    }

    fn reject(&mut self, reason: &str, submit_time: TimeSpec, info_msgs: &[InfoMessage]) -> Result<()> {
        self.forward(ClientMessage::Reject {
            reason: reason.to_string(),
            submit_time,
            info_msgs: info_msgs.to_vec(),
        })
    }

    fn exit(
        &mut self,
        exit_value: i32,
        run_time: TimeSpec,
        signal: Option<&str>,
        dumped_core: bool,
    ) -> Result<()> {
        self.forward(ClientMessage::Exit {
            exit_value,
            run_time,
            signal: signal.map(str::to_string),
            dumped_core,
        })
    }

    fn restart(&mut self, log_id: &str, restart_time: TimeSpec) -> Result<()> {
        self.forward(ClientMessage::Restart {
            log_id: log_id.to_string(),
            restart_time,
        })
    }

    fn alert(&mut self, reason: &str, alert_time: TimeSpec, info_msgs: &[InfoMessage]) -> Result<()> {
        self.forward(ClientMessage::Alert {
            reason: reason.to_string(),
            alert_time,
            info_msgs: info_msgs.to_vec(),
        })
    }

    fn iobuf(&mut self, stream: StreamId, delay: TimeSpec, data: &[u8]) -> Result<()> {
        self.forward(ClientMessage::IoBuffer {
            stream,
            delay,
            data: data.to_vec(),
        })
    }

    fn winsize(&mut self, rows: u16, cols: u16, delay: TimeSpec) -> Result<()> {
        self.forward(ClientMessage::ChangeWindowSize { rows, cols, delay })
    }

    fn suspend(&mut self, signal: &str, delay: TimeSpec) -> Result<()> {
        self.forward(ClientMessage::CommandSuspend {
            signal: signal.to_string(),
            delay,
        })
    }
}
