//! # raft-storage
//!
//! why: provide durable, atomically replaced persistence for raft state
//! relations: stores raft-core's PersistentState; read once and written by raft-runtime
//! what: Storage trait, state codec, FileStorage, InMemoryStorage for testing

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use raft_core::PersistentState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// errors surfaced by a storage backend or the state codec
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] io::Error),

    /// the bytes exist but cannot be trusted; the node must not run on them
    #[error("persisted raft state is corrupt: {0}")]
    Corrupt(String),
}

/// current on-disk format
const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u32,
    state: &'a PersistentState,
}

#[derive(Deserialize)]
struct Envelope {
    version: u32,
    state: PersistentState,
}

/// serialize state into the blob handed to a backend
pub fn encode(state: &PersistentState) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(&EnvelopeRef {
        version: FORMAT_VERSION,
        state,
    })
    .map_err(|e| StorageError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// parse and integrity-check a blob read from a backend
pub fn decode(bytes: &[u8]) -> Result<PersistentState, StorageError> {
    let envelope: Envelope = serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupt(e.to_string()))?;
    if envelope.version != FORMAT_VERSION {
        return Err(StorageError::Corrupt(format!("unknown format version {}", envelope.version)));
    }
    envelope.state.check_integrity().map_err(StorageError::Corrupt)?;
    Ok(envelope.state)
}

/// durable home of one node's raft state
///
/// backends store an opaque blob; a save replaces the previous blob
/// atomically, so a reader sees either the old or the new one in full.
/// implementations:
/// - real filesystem (FileStorage)
/// - in-memory (InMemoryStorage, testing)
pub trait Storage: Send {
    /// atomically replace the stored blob
    fn save_raft_state(&mut self, bytes: &[u8]) -> Result<(), StorageError>;

    /// the last saved blob, `None` for a node that never saved
    fn read_raft_state(&self) -> Result<Option<Vec<u8>>, StorageError>;

    /// size in bytes of the stored blob
    fn raft_state_size(&self) -> Result<usize, StorageError> {
        Ok(self.read_raft_state()?.map(|b| b.len()).unwrap_or(0))
    }

    /// clear all persisted state (for testing)
    fn clear(&mut self) -> Result<(), StorageError>;

    /// encode and save
    fn save_state(&mut self, state: &PersistentState) -> Result<(), StorageError> {
        let bytes = encode(state)?;
        self.save_raft_state(&bytes)
    }

    /// read and decode; a node that never saved starts from the empty state
    fn load_state(&self) -> Result<PersistentState, StorageError> {
        match self.read_raft_state()? {
            Some(bytes) => decode(&bytes),
            None => Ok(PersistentState::default()),
        }
    }
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores the blob as `raft_state.json` inside a directory, replaced via
/// write-to-temp, fsync, rename
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("raft_state.json")
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join("raft_state.tmp")
    }
}

impl Storage for FileStorage {
    fn save_raft_state(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;

        // make the rename itself durable
        #[cfg(unix)]
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    fn read_raft_state(&self) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.state_path()) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        for path in [self.state_path(), self.temp_path()] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// clones share the same blob, which lets a test harness keep a node's
/// state while the node itself is torn down; `duplicate` takes an
/// independent copy so a dead incarnation can no longer write into the
/// storage of its successor
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    blob: Arc<Mutex<Option<Vec<u8>>>>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// independent storage holding a copy of the current blob
    pub fn duplicate(&self) -> Self {
        Self {
            blob: Arc::new(Mutex::new(self.blob.lock().clone())),
        }
    }
}

impl Storage for InMemoryStorage {
    fn save_raft_state(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        *self.blob.lock() = Some(bytes.to_vec());
        Ok(())
    }

    fn read_raft_state(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blob.lock().clone())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        *self.blob.lock() = None;
        Ok(())
    }
}
