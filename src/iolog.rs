//! I/O log writer: an external collaborator behind a narrow interface.
//! Creates, per session, a directory named after the log id containing a
//! `timing` file (one line per I/O event: stream, delay, byte count) and
//! one data file per stream.

use crate::error::{Error, Result};
use crate::wire::{StreamId, TimeSpec};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// An open I/O log directory for one session.
pub struct IoLog {
    dir: PathBuf,
    timing: File,
    timing_mode: u32,
    streams: HashMap<StreamId, File>,
}

impl IoLog {
    /// Create a new I/O log directory under `root`, named `log_id`.
    pub fn create(root: &Path, log_id: &str, file_mode: u32) -> Result<Self> {
        let dir = root.join(log_id);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::resource(format!("creating io log dir {}: {e}", dir.display())))?;

        let timing = Self::open_with_mode(&dir.join("timing"), file_mode)?;

        Ok(Self {
            dir,
            timing,
            timing_mode: file_mode,
            streams: HashMap::new(),
        })
    }

    /// Reopen an existing I/O log directory by id.
    pub fn reopen(root: &Path, log_id: &str, file_mode: u32) -> Result<Self> {
        let dir = root.join(log_id);
        if !dir.is_dir() {
            return Err(Error::resource(format!(
                "no such io log directory: {}",
                dir.display()
            )));
        }
        let timing = OpenOptions::new()
            .append(true)
            .open(dir.join("timing"))
            .map_err(|e| Error::resource(format!("reopening timing file: {e}")))?;
        Ok(Self {
            dir,
            timing,
            timing_mode: file_mode,
            streams: HashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn open_with_mode(path: &Path, mode: u32) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::resource(format!("opening {}: {e}", path.display())))?;
        file.set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| Error::resource(format!("setting permissions on {}: {e}", path.display())))?;
        Ok(file)
    }

    fn stream_file(&mut self, stream: StreamId) -> Result<&mut File> {
        if !self.streams.contains_key(&stream) {
            let path = self.dir.join(stream.file_name());
            let file = Self::open_with_mode(&path, self.timing_mode)?;
            self.streams.insert(stream, file);
        }
        Ok(self.streams.get_mut(&stream).unwrap())
    }

    /// Append one I/O event: a timing line plus the raw bytes to the
    /// stream's data file.
    pub fn write_event(&mut self, stream: StreamId, delay: TimeSpec, data: &[u8]) -> Result<()> {
        let line = format!(
            "{:?} {}.{:09} {}\n",
            stream,
            delay.secs,
            delay.nanos,
            data.len()
        );
        self.timing
            .write_all(line.as_bytes())
            .map_err(|e| Error::resource(format!("writing timing file: {e}")))?;
        self.stream_file(stream)?
            .write_all(data)
            .map_err(|e| Error::resource(format!("writing stream file: {e}")))
    }

    /// Clear the timing file's write-mode bits to mark completion.
    pub fn mark_complete(&self) -> Result<()> {
        let path = self.dir.join("timing");
        let mut perms = fs::metadata(&path)
            .map_err(|e| Error::resource(format!("stat timing file: {e}")))?
            .permissions();
        let read_only = perms.mode() & !0o222;
        perms.set_mode(read_only);
        fs::set_permissions(&path, perms)
            .map_err(|e| Error::resource(format!("clearing timing file write bits: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("auditlogd-iolog-test-{}-{}", std::process::id(), rand_suffix()));
        p
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos() as u64
    }

    #[test]
    fn write_and_mark_complete() {
        let root = tempdir();
        let mut log = IoLog::create(&root, "session-1", 0o600).unwrap();
        log.write_event(StreamId::TtyOut, TimeSpec::new(0, 100_000_000), b"hello\n")
            .unwrap();
        log.mark_complete().unwrap();

        let timing_path = root.join("session-1").join("timing");
        let mode = fs::metadata(&timing_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o222, 0, "write bits should be cleared");

        let data = fs::read(root.join("session-1").join("ttyout")).unwrap();
        assert_eq!(data, b"hello\n");

        let _ = fs::remove_dir_all(&root);
    }
}
