// Local, file-backed conversation log.
//
// Two layouts are supported. JSON lines (one record per line) is the default
// and is appended to in place. The legacy layout is a single pretty-printed
// JSON array that is rewritten on every append.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::message::StoredMessage;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io { path: path.to_path_buf(), source }
    }
}

/// An ordered, append-only log of stored messages.
pub trait MessageLog: Send + Sync {
    /// Reads every message in insertion order. Never fails: unreadable data is
    /// treated as absent.
    fn load(&self) -> Vec<StoredMessage>;

    fn append(&self, message: &StoredMessage) -> Result<(), StoreError>;

    /// Rewrites the backing file with only the records `load` can read and
    /// returns how many were kept.
    fn compact(&self) -> Result<usize, StoreError>;

    fn path(&self) -> &Path;
}

/// Picks the layout from the file extension: `.jsonl` is line-oriented,
/// everything else is the single-array layout.
pub fn open_log(path: impl Into<PathBuf>) -> Arc<dyn MessageLog> {
    let path = path.into();
    let is_lines = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("jsonl"))
        .unwrap_or(false);
    if is_lines {
        Arc::new(JsonLinesLog::new(path))
    } else {
        Arc::new(JsonArrayLog::new(path))
    }
}

/// One JSON record per line.
#[derive(Debug, Clone)]
pub struct JsonLinesLog {
    path: PathBuf,
}

impl JsonLinesLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl JsonLinesLog {
    /// Parses every readable record. Lines that are not valid JSON, including
    /// ones cut inside a multi-byte character, are skipped. Only a failure to
    /// read the file itself is an error; a missing file has no records.
    fn read_records(&self) -> io::Result<Vec<StoredMessage>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let records = data
            .split(|b| *b == b'\n')
            .enumerate()
            .filter(|(_, line)| !line.iter().all(u8::is_ascii_whitespace))
            .filter_map(|(idx, line)| match serde_json::from_slice::<StoredMessage>(line) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!(path = %self.path.display(), line = idx + 1, error = %e, "Skipping malformed log record");
                    None
                }
            })
            .collect();
        Ok(records)
    }
}

impl MessageLog for JsonLinesLog {
    fn load(&self) -> Vec<StoredMessage> {
        self.read_records().unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "Failed to read message log");
            Vec::new()
        })
    }

    fn append(&self, message: &StoredMessage) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;

        // A previous crash may have left a partial line without a newline;
        // start on a fresh line so this record stays readable.
        if ends_mid_line(&mut file).map_err(|e| StoreError::io(&self.path, e))? {
            line.insert(0, '\n');
        }

        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| StoreError::io(&self.path, e))?;
        debug!(path = %self.path.display(), role = %message.role, "Appended message to log");
        Ok(())
    }

    fn compact(&self) -> Result<usize, StoreError> {
        // Never replace the file based on a read that failed.
        let messages = self.read_records().map_err(|e| StoreError::io(&self.path, e))?;
        let mut out = String::new();
        for msg in &messages {
            out.push_str(&serde_json::to_string(msg)?);
            out.push('\n');
        }
        write_replacing(&self.path, out.as_bytes())?;
        Ok(messages.len())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// A single pretty-printed JSON array, rewritten whole on every append.
#[derive(Debug, Clone)]
pub struct JsonArrayLog {
    path: PathBuf,
}

impl JsonArrayLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn write_all(&self, messages: &[StoredMessage]) -> Result<(), StoreError> {
        let data = serde_json::to_string_pretty(messages)?;
        write_replacing(&self.path, data.as_bytes())
    }
}

impl MessageLog for JsonArrayLog {
    fn load(&self) -> Vec<StoredMessage> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read message log");
                return Vec::new();
            }
        };
        match serde_json::from_str(&data) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Message log is not a valid JSON array, treating as empty");
                Vec::new()
            }
        }
    }

    fn append(&self, message: &StoredMessage) -> Result<(), StoreError> {
        let mut messages = self.load();
        messages.push(message.clone());
        self.write_all(&messages)?;
        debug!(path = %self.path.display(), total = messages.len(), "Rewrote message log");
        Ok(())
    }

    fn compact(&self) -> Result<usize, StoreError> {
        let messages: Vec<StoredMessage> = match fs::read_to_string(&self.path) {
            Ok(data) => serde_json::from_str(&data)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        self.write_all(&messages)?;
        Ok(messages.len())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

fn ends_mid_line(file: &mut fs::File) -> io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Writes to a sibling temp file, then renames it over `path`.
fn write_replacing(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let mut tmp_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "log".into());
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    fs::write(&tmp_path, contents).map_err(|e| StoreError::io(&tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| StoreError::io(path, e))?;
    Ok(())
}
