//! Structured event log formatter: an external collaborator with a narrow
//! interface — the core only calls [`EventLog::append`].
//!
//! One JSON line per accept/reject/alert/exit event. This is the
//! human-readable audit trail; it is distinct from the I/O log (see
//! `iolog.rs`), which holds the replayable byte stream.

use crate::error::{Error, Result};
use crate::wire::{InfoMessage, TimeSpec};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventRecord<'a> {
    Accept {
        submit_time: TimeSpec,
        info_msgs: &'a [InfoMessage],
    },
    Reject {
        reason: &'a str,
        submit_time: TimeSpec,
        info_msgs: &'a [InfoMessage],
    },
    Alert {
        reason: &'a str,
        alert_time: TimeSpec,
        info_msgs: &'a [InfoMessage],
    },
    Exit {
        exit_value: i32,
        run_time: TimeSpec,
        signal: Option<&'a str>,
        dumped_core: bool,
    },
}

/// Append-only JSON-lines event log for one session.
pub struct EventLog {
    file: std::fs::File,
}

impl EventLog {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::resource(format!("creating event log dir: {e}")))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::resource(format!("opening event log {}: {e}", path.display())))?;
        Ok(Self { file })
    }

    pub fn append(&mut self, record: &EventRecord<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| Error::resource(format!("serializing event record: {e}")))?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .map_err(|e| Error::resource(format!("writing event log: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::InfoValue;

    #[test]
    fn appends_one_json_line_per_record() {
        let dir = tempdir();
        let path = dir.join("events.jsonl");
        let mut log = EventLog::create(&path).unwrap();
        let info = vec![InfoMessage {
            key: "user".into(),
            value: InfoValue::Text("alice".into()),
        }];
        log.append(&EventRecord::Accept {
            submit_time: TimeSpec::new(1_700_000_000, 0),
            info_msgs: &info,
        })
        .unwrap();
        log.append(&EventRecord::Exit {
            exit_value: 0,
            run_time: TimeSpec::new(3, 0),
            signal: None,
            dumped_core: false,
        })
        .unwrap();
        drop(log);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.lines().next().unwrap().contains("\"accept\""));
        let _ = std::fs::remove_dir_all(&dir);
    }

    fn tempdir() -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("auditlogd-eventlog-test-{}", std::process::id()));
        std::fs::create_dir_all(&p).unwrap();
        p
    }
}
