// Copyright 2023 Bitwise IO, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A durable backend built from a write-ahead log and a snapshot.
//!
//! Every batch is appended to the log as one frame:
//!
//! ```text
//! +-------------+-------------+---------------------------+
//! | len (u32le) | crc (u32le) | JSON list of mutations    |
//! +-------------+-------------+---------------------------+
//! ```
//!
//! and synced before it becomes visible to readers. On open the snapshot is loaded and the log
//! replayed on top of it. Replay stops at the first frame which is short or fails its checksum;
//! such a frame can only be the tail of a write interrupted by a crash, so the batch it carried
//! was never acknowledged and is discarded. When the log grows past a threshold the full image is
//! written to a new snapshot, which atomically replaces the old one, and the log is truncated.
//!
//! If the log can not be restored to a frame boundary after a failed append or truncation, the
//! backend refuses every further write until it is reopened, so nothing is appended after a
//! partial frame.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::codec;
use super::{Mutation, StorageBackend, StorageError, Table, TableSet, WriteBatch};

const WAL_FILE: &str = "dtxn.wal";
const SNAPSHOT_FILE: &str = "dtxn.snapshot";
const FRAME_HEADER_SIZE: usize = 8;
const DEFAULT_COMPACT_THRESHOLD: u64 = 4 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct SnapshotRow {
    table: Table,
    key: String,
    #[serde(with = "codec::hex_bytes")]
    value: Vec<u8>,
}

struct Inner {
    tables: TableSet,
    wal: File,
    wal_len: u64,
    // Why the log no longer ends on a frame boundary.
    poisoned: Option<String>,
}

pub struct FileBackend {
    dir: PathBuf,
    compact_threshold: u64,
    inner: RwLock<Inner>,
}

impl FileBackend {
    /// Opens the backend stored in `dir`, creating it if needed, and recovers its contents.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut tables = load_snapshot(&dir.join(SNAPSHOT_FILE))?;

        let mut wal = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(WAL_FILE))?;
        let wal_len = replay(&mut wal, &mut tables)?;

        debug!("opened file backend at {}", dir.display());

        Ok(FileBackend {
            dir,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            inner: RwLock::new(Inner {
                tables,
                wal,
                wal_len,
                poisoned: None,
            }),
        })
    }

    /// Sets the log size, in bytes, after which the log is folded into the snapshot.
    pub fn with_compact_threshold(mut self, bytes: u64) -> Self {
        self.compact_threshold = bytes;
        self
    }

    /// Folds the log into a fresh snapshot.
    pub fn compact(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        self.compact_locked(&mut inner)
    }

    fn compact_locked(&self, inner: &mut Inner) -> Result<(), StorageError> {
        let rows: Vec<SnapshotRow> = inner
            .tables
            .rows()
            .map(|(table, key, value)| SnapshotRow {
                table,
                key: key.clone(),
                value: value.clone(),
            })
            .collect();

        let mut snapshot = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer(&mut snapshot, &rows)?;
        snapshot.as_file().sync_all()?;
        snapshot
            .persist(self.dir.join(SNAPSHOT_FILE))
            .map_err(|err| StorageError::Io(err.error))?;

        // Replaying a log over a snapshot which already contains its effects yields the same
        // image, so a crash before the truncation below is harmless.
        let truncated = inner
            .wal
            .set_len(0)
            .and_then(|_| inner.wal.seek(SeekFrom::Start(0)))
            .and_then(|_| inner.wal.sync_data());
        if let Err(err) = truncated {
            error!("unable to truncate log at {}: {}", self.dir.display(), err);
            inner.poisoned = Some(format!("log truncation failed: {}", err));
            return Err(err.into());
        }
        inner.wal_len = 0;

        debug!(
            "compacted {} rows into snapshot at {}",
            rows.len(),
            self.dir.display()
        );
        Ok(())
    }

    fn append(inner: &mut Inner, mutations: &[Mutation]) -> Result<(), StorageError> {
        let payload = codec::encode(&mutations)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        let written = inner
            .wal
            .write_all(&frame)
            .and_then(|_| inner.wal.sync_data());
        if let Err(err) = written {
            // Cut off whatever part of the frame reached the file so later frames stay
            // reachable by replay.
            let restored = inner
                .wal
                .set_len(inner.wal_len)
                .and_then(|_| inner.wal.seek(SeekFrom::Start(inner.wal_len)));
            if let Err(cleanup) = restored {
                error!("unable to cut off failed log append: {}", cleanup);
                inner.poisoned = Some(format!(
                    "failed append ({}) could not be cut off: {}",
                    err, cleanup
                ));
            }
            return Err(err.into());
        }

        inner.wal_len += frame.len() as u64;
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.inner.read().tables.get(table, key).cloned())
    }

    fn scan(&self, table: Table, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        Ok(self.inner.read().tables.scan(table, prefix))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        if let Some(reason) = &inner.poisoned {
            return Err(StorageError::Corruption(format!(
                "{} is unusable until reopened: {}",
                self.dir.display(),
                reason
            )));
        }
        inner.tables.check(batch.preconditions())?;
        if batch.is_empty() {
            return Ok(());
        }

        Self::append(&mut inner, batch.mutations())?;
        inner.tables.apply(batch.mutations().iter().cloned());

        if inner.wal_len >= self.compact_threshold {
            if let Err(err) = self.compact_locked(&mut inner) {
                warn!("unable to compact {}: {}", self.dir.display(), err);
            }
        }
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Result<TableSet, StorageError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(TableSet::default()),
        Err(err) => return Err(err.into()),
    };

    let rows: Vec<SnapshotRow> = serde_json::from_slice(&bytes).map_err(|err| {
        StorageError::Corruption(format!("unreadable snapshot {}: {}", path.display(), err))
    })?;

    let mut tables = TableSet::default();
    tables.apply(rows.into_iter().map(|row| Mutation::Put {
        table: row.table,
        key: row.key,
        value: row.value,
    }));
    Ok(tables)
}

/// Applies every intact frame of the log to `tables` and returns the length of the intact prefix.
/// The log is truncated to that length and positioned at its end.
fn replay(wal: &mut File, tables: &mut TableSet) -> Result<u64, StorageError> {
    let mut bytes = Vec::new();
    wal.seek(SeekFrom::Start(0))?;
    wal.read_to_end(&mut bytes)?;

    let mut offset = 0;
    let mut frames = 0;
    while offset + FRAME_HEADER_SIZE <= bytes.len() {
        let len = read_u32(&bytes[offset..offset + 4])? as usize;
        let crc = read_u32(&bytes[offset + 4..offset + 8])?;
        let start = offset + FRAME_HEADER_SIZE;
        let end = start + len;
        if end > bytes.len() || crc32fast::hash(&bytes[start..end]) != crc {
            break;
        }

        let mutations: Vec<Mutation> = codec::decode(&bytes[start..end]).map_err(|err| {
            StorageError::Corruption(format!("undecodable log frame at {}: {}", offset, err))
        })?;
        tables.apply(mutations);

        offset = end;
        frames += 1;
    }

    if offset < bytes.len() {
        warn!(
            "discarding {} bytes of incomplete log tail",
            bytes.len() - offset
        );
        wal.set_len(offset as u64)?;
    }
    wal.seek(SeekFrom::Start(offset as u64))?;

    debug!("replayed {} log frames", frames);
    Ok(offset as u64)
}

fn read_u32(bytes: &[u8]) -> Result<u32, StorageError> {
    let bytes: [u8; 4] = bytes
        .try_into()
        .map_err(|_| StorageError::Corruption("short log frame header".into()))?;
    Ok(u32::from_le_bytes(bytes))
}
