//! Local sink: persists events and I/O buffers to disk.

use super::{AcceptOutcome, Sink};
use crate::error::{Error, Result};
use crate::eventlog::{EventLog, EventRecord};
use crate::iolog::IoLog;
use crate::wire::{InfoMessage, StreamId, TimeSpec};
use rand::Rng;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Process-wide random-drop probability for debugging client restart
/// behavior. Set once at startup from the CLI flag, then treated as an
/// immutable configuration value for the lifetime of the process.
#[derive(Debug, Clone, Copy)]
pub struct RandomDrop(pub Option<f64>);

impl RandomDrop {
    pub fn none() -> Self {
        Self(None)
    }

    fn should_drop(&self) -> bool {
        match self.0 {
            Some(p) if p > 0.0 => rand::thread_rng().gen::<f64>() < p,
            _ => false,
        }
    }
}

pub struct LocalSink {
    log_root: PathBuf,
    file_mode: u32,
    log_id: Option<String>,
    event_log: Option<EventLog>,
    io_log: Option<IoLog>,
    expect_iobufs: bool,
    random_drop: RandomDrop,
}

impl LocalSink {
    pub fn new(log_root: PathBuf, file_mode: u32, random_drop: RandomDrop) -> Self {
        Self {
            log_root,
            file_mode,
            log_id: None,
            event_log: None,
            io_log: None,
            expect_iobufs: false,
            random_drop,
        }
    }

    fn generate_log_id() -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let counter: u32 = rand::thread_rng().gen();
        format!("{nanos:x}-{counter:08x}")
    }

    fn event_log_mut(&mut self) -> Result<&mut EventLog> {
        self.event_log
            .as_mut()
            .ok_or_else(|| Error::resource("local sink used before Accept/Reject"))
    }
}

impl Sink for LocalSink {
    fn accept(
        &mut self,
        submit_time: TimeSpec,
        info_msgs: &[InfoMessage],
        expect_iobufs: bool,
    ) -> Result<AcceptOutcome> {
        let log_id = Self::generate_log_id();
        let mut event_log = EventLog::create(&self.log_root.join(&log_id).join("log.jsonl"))?;
        event_log.append(&EventRecord::Accept {
            submit_time,
            info_msgs,
        })?;
        self.event_log = Some(event_log);
        self.expect_iobufs = expect_iobufs;

        if expect_iobufs {
            self.io_log = Some(IoLog::create(&self.log_root, &log_id, self.file_mode)?);
        }
        self.log_id = Some(log_id.clone());
        if expect_iobufs {
            Ok(AcceptOutcome::LogId(log_id))
        } else {
            Ok(AcceptOutcome::Deferred)
        }
    }

    fn reject(&mut self, reason: &str, submit_time: TimeSpec, info_msgs: &[InfoMessage]) -> Result<()> {
        let log_id = Self::generate_log_id();
        let mut event_log = EventLog::create(&self.log_root.join(&log_id).join("log.jsonl"))?;
        event_log.append(&EventRecord::Reject {
            reason,
            submit_time,
            info_msgs,
        })?;
        self.event_log = Some(event_log);
        Ok(())
    }

    fn exit(
        &mut self,
        exit_value: i32,
        run_time: TimeSpec,
        signal: Option<&str>,
        dumped_core: bool,
    ) -> Result<()> {
        self.event_log_mut()?.append(&EventRecord::Exit {
            exit_value,
            run_time,
            signal,
            dumped_core,
        })?;
        if let Some(io_log) = &self.io_log {
            io_log.mark_complete()?;
        }
        Ok(())
    }

    fn restart(&mut self, log_id: &str, _restart_time: TimeSpec) -> Result<()> {
        self.io_log = Some(IoLog::reopen(&self.log_root, log_id, self.file_mode)?);
        self.log_id = Some(log_id.to_string());
        self.expect_iobufs = true;
        Ok(())
    }

    fn alert(&mut self, reason: &str, alert_time: TimeSpec, info_msgs: &[InfoMessage]) -> Result<()> {
        self.event_log_mut()?.append(&EventRecord::Alert {
            reason,
            alert_time,
            info_msgs,
        })
    }

    fn iobuf(&mut self, stream: StreamId, delay: TimeSpec, data: &[u8]) -> Result<()> {
        if self.random_drop.should_drop() {
            return Err(Error::protocol("random-drop: simulated iobuf failure"));
        }
        let io_log = self
            .io_log
            .as_mut()
            .ok_or_else(|| Error::protocol("iobuf received but no I/O log is open"))?;
        io_log.write_event(stream, delay, data)
    }

    fn winsize(&mut self, _rows: u16, _cols: u16, _delay: TimeSpec) -> Result<()> {
        // Window-size changes are not separately persisted by the local
        // sink beyond keeping the commit timer armed; nothing to do.
        Ok(())
    }

    fn suspend(&mut self, _signal: &str, _delay: TimeSpec) -> Result<()> {
        Ok(())
    }
}
