//! A durable, per-destination forward buffer.
//!
//! When a destination can't accept messages (dead, or in a role we must not
//! write to yet), envelopes are spooled to disk and replayed once the
//! destination recovers. Each destination gets its own subdirectory; each
//! message is one JSON file whose name is the zero-padded arrival time in
//! microseconds plus a sequence number, so lexicographic name order is
//! arrival order.
//!
//! Replay is at-most-once: a file is removed before its message is handed to
//! the transport, so a crash or send failure mid-flush loses that message
//! rather than duplicating it.
//!
//! A destination may declare a replay boundary (it already holds the data up
//! to some point in time, e.g. after being rebuilt from a snapshot). Buffered
//! messages dated at or before the boundary are dropped during flush, and the
//! boundary is forgotten once a flush forwards anything.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::FileExt as _;
use log::{error, warn};
use serde_derive::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::encoding::{self, Value as _};
use crate::error::{Error, Result};
use crate::message::{Address, Envelope};

/// Buffered message file extension.
const MESSAGE_EXT: &str = "msg";

/// An envelope spooled for later delivery, with enough metadata to resume
/// after a restart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BufferedMessage {
    /// The original envelope, unmodified.
    pub envelope: Envelope,
    /// Where it should go.
    pub destination: Address,
}

impl encoding::Value for BufferedMessage {}

/// The on-disk forward buffer. Owns its root directory exclusively, enforced
/// with a file lock so two engine processes can't interleave writes.
pub struct ForwardBuffer {
    /// Root directory, one subdirectory per destination.
    root: PathBuf,
    /// Tie-breaker for messages buffered within the same microsecond.
    sequence: u64,
    /// Replay boundaries by destination directory key.
    boundaries: BTreeMap<String, OffsetDateTime>,
    /// Held for the lifetime of the buffer.
    _lock: File,
}

impl ForwardBuffer {
    /// Opens the buffer rooted at the given directory, creating it if
    /// necessary and taking the exclusive lock.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let lock = OpenOptions::new().create(true).write(true).open(root.join(".lock"))?;
        lock.try_lock_exclusive().map_err(|_| {
            Error::Internal(format!("forward buffer {} is locked by another process", root.display()))
        })?;
        Ok(Self { root, sequence: 0, boundaries: BTreeMap::new(), _lock: lock })
    }

    /// The subdirectory key for a destination. Lossy, so each message file
    /// also embeds the real destination address.
    fn dir_key(destination: &Address) -> String {
        destination
            .node()
            .to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }

    /// Spools an envelope for a destination.
    pub fn add(&mut self, envelope: &Envelope, destination: &Address) -> Result<()> {
        let dir = self.root.join(Self::dir_key(destination));
        std::fs::create_dir_all(&dir)?;
        let micros = unix_micros(OffsetDateTime::now_utc());
        let name = format!("{micros:020}-{:06}.{MESSAGE_EXT}", self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        let buffered =
            BufferedMessage { envelope: envelope.clone(), destination: destination.node() };
        // Write to a temporary name first so a crash can't leave a partial
        // message where the flusher will pick it up.
        let staging = dir.join(format!("{name}.tmp"));
        let mut file = File::create(&staging)?;
        buffered.encode_into(&mut file)?;
        std::fs::rename(&staging, dir.join(name))?;
        Ok(())
    }

    /// Returns true if nothing is buffered for the destination.
    pub fn is_empty_for(&self, destination: &Address) -> Result<bool> {
        Ok(self.files_for(&self.root.join(Self::dir_key(destination)))?.is_empty())
    }

    /// Destinations with buffered backlog, recovered from message metadata.
    /// Used at startup to resume replay obligations across restarts.
    pub fn buffered_destinations(&self) -> Result<Vec<Address>> {
        let mut destinations = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }
            let Some(first) = self.files_for(&dir)?.into_iter().next() else { continue };
            match Self::read_message(&first) {
                Ok(buffered) => destinations.push(buffered.destination),
                Err(err) => warn!("Skipping unreadable buffered message {}: {err}", first.display()),
            }
        }
        Ok(destinations)
    }

    /// Sets or clears the replay boundary for a destination. Messages dated
    /// at or before the boundary are dropped at the next flush.
    pub fn set_boundary(&mut self, destination: &Address, boundary: Option<OffsetDateTime>) {
        let key = Self::dir_key(destination);
        match boundary {
            Some(boundary) => {
                self.boundaries.insert(key, boundary);
            }
            None => {
                self.boundaries.remove(&key);
            }
        }
    }

    /// Replays all buffered messages for a destination in arrival order
    /// through the given sender, honoring the replay boundary. Returns the
    /// number of messages forwarded. The boundary is cleared once anything
    /// was forwarded, even if a later send fails.
    pub fn flush(
        &mut self,
        destination: &Address,
        mut send: impl FnMut(Envelope, &Address) -> Result<()>,
    ) -> Result<usize> {
        let key = Self::dir_key(destination);
        let dir = self.root.join(&key);
        let boundary = self.boundaries.get(&key).copied();
        let mut forwarded = 0;
        let result = (|| {
            for path in self.files_for(&dir)? {
                let buffered = match Self::read_message(&path) {
                    Ok(buffered) => buffered,
                    Err(err) => {
                        error!("Dropping unreadable buffered message {}: {err}", path.display());
                        std::fs::remove_file(&path)?;
                        continue;
                    }
                };
                // At-most-once: the file is gone before the send starts.
                std::fs::remove_file(&path)?;
                if let (Some(boundary), Some(date)) = (boundary, buffered.envelope.date) {
                    if date <= boundary {
                        continue;
                    }
                }
                send(buffered.envelope, &buffered.destination)?;
                forwarded += 1;
            }
            Ok(())
        })();
        if forwarded > 0 {
            self.boundaries.remove(&key);
        }
        if dir.exists() && self.files_for(&dir)?.is_empty() {
            let _ = std::fs::remove_dir(&dir);
        }
        result.map(|()| forwarded)
    }

    /// Message files under a destination directory, in name (arrival) order.
    fn files_for(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == MESSAGE_EXT) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Reads one buffered message file.
    fn read_message(path: &Path) -> Result<BufferedMessage> {
        BufferedMessage::decode(&std::fs::read(path)?)
    }
}

/// Microseconds since the Unix epoch.
fn unix_micros(at: OffsetDateTime) -> u64 {
    (at.unix_timestamp_nanos() / 1_000) as u64
}
