//! Channel logs
//!
//! Each channel is an ordered, append-only sequence of [`ChannelRecord`]s.
//! Records are never updated or deleted.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use skein_core::{ChannelName, ChannelRecord, NodeName, SkeinError, SkeinResult};

/// Storage for one node's channel logs
pub trait ChannelStore: Send + Sync {
    /// Append a record to the end of `channel`, creating it if needed
    fn append(&self, channel: &ChannelName, record: ChannelRecord) -> SkeinResult<()>;

    /// Every record of `channel` in append order.
    ///
    /// Fails with [`SkeinError::ChannelReadMiss`] if nothing was ever written.
    fn read(&self, channel: &ChannelName) -> SkeinResult<Vec<ChannelRecord>>;
}

/// Channel logs kept as JSON-lines files under `<root>/<node>/`
#[derive(Debug)]
pub struct FileChannelStore {
    dir: PathBuf,
    append_lock: Mutex<()>,
}

impl FileChannelStore {
    /// Open (and create if missing) the store directory for `node`
    pub fn open(root: impl AsRef<Path>, node: &NodeName) -> SkeinResult<Self> {
        let dir = root.as_ref().join(escape_file_name(node.as_str()));
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "channel store opened");
        Ok(Self {
            dir,
            append_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, channel: &ChannelName) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl", escape_file_name(channel.as_str())))
    }
}

impl ChannelStore for FileChannelStore {
    fn append(&self, channel: &ChannelName, record: ChannelRecord) -> SkeinResult<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let _guard = self.append_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.path_for(channel))
            .map_err(|e| SkeinError::WriteFailure(format!("{channel}: {e}")))?;
        // close off a torn final line so this record starts a line of its own
        if !ends_with_newline(&mut file)
            .map_err(|e| SkeinError::WriteFailure(format!("{channel}: {e}")))?
        {
            line.insert(0, b'\n');
        }
        file.write_all(&line)
            .map_err(|e| SkeinError::WriteFailure(format!("{channel}: {e}")))?;
        Ok(())
    }

    fn read(&self, channel: &ChannelName) -> SkeinResult<Vec<ChannelRecord>> {
        let file = match File::open(self.path_for(channel)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SkeinError::ChannelReadMiss(channel.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).split(b'\n').enumerate() {
            let line = line?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice(&line) {
                Ok(record) => records.push(record),
                // a torn final line from an interrupted append
                Err(e) => warn!(%channel, line = index + 1, error = %e, "skipping unreadable record"),
            }
        }
        Ok(records)
    }
}

/// True for an empty file or one whose last byte is `\n`
fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Channel logs kept in memory
#[derive(Debug, Default)]
pub struct MemoryChannelStore {
    channels: RwLock<HashMap<ChannelName, Vec<ChannelRecord>>>,
}

impl MemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelStore for MemoryChannelStore {
    fn append(&self, channel: &ChannelName, record: ChannelRecord) -> SkeinResult<()> {
        self.channels
            .write()
            .entry(channel.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    fn read(&self, channel: &ChannelName) -> SkeinResult<Vec<ChannelRecord>> {
        self.channels
            .read()
            .get(channel)
            .cloned()
            .ok_or_else(|| SkeinError::ChannelReadMiss(channel.clone()))
    }
}

/// Map an arbitrary name onto a single safe path component.
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte becomes
/// `%XX`. The mapping is injective, so distinct names never share a file.
pub fn escape_file_name(name: &str) -> String {
    if name.is_empty() {
        return "%".to_string();
    }
    let mut escaped = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => escaped.push(byte as char),
            other => escaped.push_str(&format!("%{other:02X}")),
        }
    }
    escaped
}
