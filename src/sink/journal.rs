//! Journal sink: appends every inbound
//! message, framed exactly as it would be on the wire, to a local journal
//! file. A separate replay step (`crate::replay`) later drains the journal
//! to an upstream relay once one becomes reachable.

use super::{AcceptOutcome, Sink};
use crate::codec;
use crate::error::{Error, Result};
use crate::wire::{ClientMessage, InfoMessage, StreamId, TimeSpec};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct JournalSink {
    path: PathBuf,
    file: File,
    log_id: String,
}

impl JournalSink {
    pub fn create(journal_dir: &Path) -> Result<Self> {
        fs::create_dir_all(journal_dir)
            .map_err(|e| Error::resource(format!("creating journal dir: {e}")))?;
        let log_id = Self::generate_log_id();
        let path = journal_dir.join(format!("{log_id}.journal"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::resource(format!("opening journal file {}: {e}", path.display())))?;
        Ok(Self { path, file, log_id })
    }

    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn generate_log_id() -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        format!("journal-{nanos:x}")
    }

    fn append(&mut self, msg: &ClientMessage) -> Result<()> {
        let frame = codec::encode(msg)?;
        self.file
            .write_all(&frame)
            .map_err(|e| Error::resource(format!("appending to journal: {e}")))
    }
}

impl Sink for JournalSink {
    fn accept(
        &mut self,
        submit_time: TimeSpec,
        info_msgs: &[InfoMessage],
        expect_iobufs: bool,
    ) -> Result<AcceptOutcome> {
        self.append(&ClientMessage::Accept {
            submit_time,
            info_msgs: info_msgs.to_vec(),
            expect_iobufs,
        })?;
        if expect_iobufs {
            Ok(AcceptOutcome::LogId(self.log_id.clone()))
        } else {
            Ok(AcceptOutcome::Deferred)
        }
    }

    fn reject(&mut self, reason: &str, submit_time: TimeSpec, info_msgs: &[InfoMessage]) -> Result<()> {
        self.append(&ClientMessage::Reject {
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
        self.append(&ClientMessage::Exit {
            exit_value,
            run_time,
            signal: signal.map(str::to_string),
            dumped_core,
        })
    }

    fn restart(&mut self, log_id: &str, restart_time: TimeSpec) -> Result<()> {
        self.append(&ClientMessage::Restart {
            log_id: log_id.to_string(),
            restart_time,
        })
    }

    fn alert(&mut self, reason: &str, alert_time: TimeSpec, info_msgs: &[InfoMessage]) -> Result<()> {
        self.append(&ClientMessage::Alert {
            reason: reason.to_string(),
            alert_time,
            info_msgs: info_msgs.to_vec(),
        })
    }

    fn iobuf(&mut self, stream: StreamId, delay: TimeSpec, data: &[u8]) -> Result<()> {
        self.append(&ClientMessage::IoBuffer {
            stream,
            delay,
            data: data.to_vec(),
        })
    }

    fn winsize(&mut self, rows: u16, cols: u16, delay: TimeSpec) -> Result<()> {
        self.append(&ClientMessage::ChangeWindowSize { rows, cols, delay })
    }

    fn suspend(&mut self, signal: &str, delay: TimeSpec) -> Result<()> {
        self.append(&ClientMessage::CommandSuspend {
            signal: signal.to_string(),
            delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "auditlogd-journal-test-{}-{}",
            std::process::id(),
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos()
        ));
        p
    }

    #[test]
    fn appends_framed_messages_and_returns_log_id_when_expecting_iobufs() {
        let dir = tempdir();
        let mut sink = JournalSink::create(&dir).unwrap();
        let outcome = sink.accept(TimeSpec::ZERO, &[], true).unwrap();
        match outcome {
            AcceptOutcome::LogId(id) => assert_eq!(id, sink.log_id()),
            AcceptOutcome::Deferred => panic!("journal sink must report a log id immediately"),
        }
        sink.iobuf(StreamId::StdOut, TimeSpec::ZERO, b"hi").unwrap();

        let bytes = fs::read(sink.path()).unwrap();
        assert!(!bytes.is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn defers_log_id_when_not_expecting_iobufs() {
        let dir = tempdir();
        let mut sink = JournalSink::create(&dir).unwrap();
        let outcome = sink.accept(TimeSpec::ZERO, &[], false).unwrap();
        assert!(matches!(outcome, AcceptOutcome::Deferred));
        let _ = fs::remove_dir_all(&dir);
    }
}
