//! Journal replay: once a journal file's
//! session has reached `Finished`, drain its frames onto a relay connection
//! and unlink the file only after every frame has been forwarded
//! successfully. A replay left half-done on a crash is retried from scratch
//! on the next pass, since partially-written journals are never truncated.

use crate::codec::{self, Decoded};
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::relay_client::RelayLink;
use crate::wire::ClientMessage;
use std::fs;
use std::path::Path;

/// Replay every `*.journal` file under `journal_dir` to the configured
/// relay, removing each one on full success. Returns the number of
/// journals successfully replayed.
pub fn replay_pending(journal_dir: &Path, relay: &RelayConfig) -> Result<usize> {
    if !journal_dir.is_dir() {
        return Ok(0);
    }
    let mut replayed = 0;
    for entry in fs::read_dir(journal_dir)
        .map_err(|e| Error::resource(format!("reading journal dir: {e}")))?
    {
        let entry = entry.map_err(|e| Error::resource(format!("reading journal entry: {e}")))?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("journal") {
            continue;
        }
        replay_one(&path, relay)?;
        replayed += 1;
    }
    Ok(replayed)
}

/// Replay a single journal file to the configured relay, unlinking it on
/// full success. Used both by the startup sweep above and by the
/// in-run path triggered when a store-first session reaches its
/// terminal state.
pub fn replay_one(path: &Path, relay: &RelayConfig) -> Result<()> {
    let bytes = fs::read(path).map_err(|e| Error::resource(format!("reading journal file: {e}")))?;
    let messages = decode_all(&bytes)?;

    let mut link = RelayLink::connect(relay, None)?;
    for msg in &messages {
        link.forward(msg)?;
    }
    // Block until the write queue drains; replay runs outside the main
    // event loop (at startup or on a timer), so a bounded busy-poll here
    // is acceptable rather than integrating with `mio`.
    while link.has_pending_writes() {
        if link.is_closed() {
            return Err(Error::resource(format!(
                "relay closed mid-replay for {}",
                path.display()
            )));
        }
        link.drive()?;
    }

    fs::remove_file(path).map_err(|e| Error::resource(format!("unlinking replayed journal: {e}")))
}

fn decode_all(bytes: &[u8]) -> Result<Vec<ClientMessage>> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        match codec::decode::<ClientMessage>(&bytes[offset..])? {
            Decoded::Message { value, consumed } => {
                out.push(value);
                offset += consumed;
            }
            Decoded::NeedMore => break,
        }
    }
    Ok(out)
}
