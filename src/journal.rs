//! Append-only audit journal
//!
//! One JSON object per line. The file is opened in append mode and every
//! record is flushed and synced before `append` returns, so a record exists on
//! disk before the caller acts on the outcome it describes.
//!
//! A registration is a single `Registered` record; the parent's child list is
//! rebuilt from the entry's parent link on replay.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::PublicKey;
use crate::provenance::{ProvenanceEntry, RejectionRecord, SignedDecision};
use crate::token::ProcessId;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal record encoding failed: {0}")]
    Encode(serde_json::Error),

    #[error("journal line {line} is malformed: {source}")]
    Decode {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalRecord {
    Registered {
        entry: ProvenanceEntry,
    },
    Terminated {
        process_id: ProcessId,
        at: DateTime<Utc>,
        exit_status: Option<i32>,
    },
    Decision {
        validator: ProcessId,
        decision: SignedDecision,
    },
    Rejected {
        rejection: RejectionRecord,
    },
    Revoked {
        public_key: PublicKey,
        at: DateTime<Utc>,
    },
}

enum Sink {
    File(File),
    Writer(Box<dyn Write + Send>),
}

impl Sink {
    fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        match self {
            Sink::File(file) => {
                file.write_all(line)?;
                file.flush()?;
                file.sync_data()
            }
            Sink::Writer(writer) => {
                writer.write_all(line)?;
                writer.flush()
            }
        }
    }
}

pub struct Journal {
    path: Option<PathBuf>,
    sink: Mutex<Sink>,
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal").field("path", &self.path).finish_non_exhaustive()
    }
}

impl Journal {
    /// Open (or create) a journal for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        log::debug!("audit journal opened at {}", path.display());
        Ok(Self {
            path: Some(path),
            sink: Mutex::new(Sink::File(file)),
        })
    }

    /// Journal into an arbitrary writer, e.g. a pipe to a log shipper.
    /// Records are flushed but there is no file to sync.
    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            path: None,
            sink: Mutex::new(Sink::Writer(Box::new(writer))),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn append(&self, record: &JournalRecord) -> Result<(), JournalError> {
        let mut line = serde_json::to_string(record).map_err(JournalError::Encode)?;
        line.push('\n');
        self.sink.lock().write_line(line.as_bytes())?;
        Ok(())
    }

    /// Read every record of a journal file, in append order. Blank lines are
    /// skipped.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<JournalRecord>, JournalError> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line)
                .map_err(|source| JournalError::Decode { line: i + 1, source })?;
            records.push(record);
        }
        Ok(records)
    }
}
