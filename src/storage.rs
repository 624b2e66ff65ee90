//! Block-scoped key-value persistence.
//!
//! Writes are staged in a [`StorageTransaction`] and become durable on
//! [`StorageTransaction::commit`]. A commit is atomic: after a crash either
//! all of its writes are visible or none are.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("block {block}: io error: {source}")]
    Io { block: String, source: io::Error },

    #[error("block {block}: corrupt contents: {source}")]
    Corrupt {
        block: String,
        source: serde_json::Error,
    },

    #[error("block {0}: commit rejected")]
    CommitRejected(String),
}

/// Durable key-value store, partitioned in blocks.
pub trait PersistentStorage: Send + Sync {
    fn read(&self, block: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Apply every write of one transaction atomically.
    fn apply(&self, block: &str, writes: Vec<(String, Vec<u8>)>) -> Result<(), StorageError>;
}

impl dyn PersistentStorage + '_ {
    pub fn start_transaction(&self, block: &str) -> StorageTransaction<'_> {
        StorageTransaction {
            storage: self,
            block: block.to_string(),
            writes: Vec::new(),
        }
    }
}

/// Pending writes against one block.
pub struct StorageTransaction<'a> {
    storage: &'a dyn PersistentStorage,
    block: String,
    writes: Vec<(String, Vec<u8>)>,
}

impl StorageTransaction<'_> {
    pub fn set(&mut self, key: &str, value: Vec<u8>) {
        self.writes.push((key.to_string(), value));
    }

    pub fn commit(self) -> Result<(), StorageError> {
        debug!(block = %self.block, writes = self.writes.len(), "committing storage transaction");
        self.storage.apply(&self.block, self.writes)
    }
}

/// Volatile storage. Commits can be made to fail on demand.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blocks: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
    reject_commits: AtomicBool,
    commits: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent commit fail with [`StorageError::CommitRejected`].
    pub fn reject_commits(&self, reject: bool) {
        self.reject_commits.store(reject, Ordering::SeqCst);
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

impl PersistentStorage for MemoryStorage {
    fn read(&self, block: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(blocks.get(block).and_then(|b| b.get(key)).cloned())
    }

    fn apply(&self, block: &str, writes: Vec<(String, Vec<u8>)>) -> Result<(), StorageError> {
        if self.reject_commits.load(Ordering::SeqCst) {
            return Err(StorageError::CommitRejected(block.to_string()));
        }
        let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        blocks.entry(block.to_string()).or_default().extend(writes);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One JSON file per block, replaced atomically on every commit.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    // serializes read-modify-write of block files
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| StorageError::Io {
            block: root.display().to_string(),
            source,
        })?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn block_path(&self, block: &str) -> PathBuf {
        let name: String = block
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.root.join(format!("{name}.json"))
    }

    fn load_block(&self, block: &str) -> Result<BTreeMap<String, Vec<u8>>, StorageError> {
        let path = self.block_path(block);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(StorageError::Io {
                    block: block.to_string(),
                    source,
                });
            }
        };
        serde_json::from_slice(&content).map_err(|source| StorageError::Corrupt {
            block: block.to_string(),
            source,
        })
    }
}

impl PersistentStorage for FileStorage {
    fn read(&self, block: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.load_block(block)?.remove(key))
    }

    fn apply(&self, block: &str, writes: Vec<(String, Vec<u8>)>) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut contents = self.load_block(block)?;
        contents.extend(writes);

        let bytes = serde_json::to_vec(&contents).map_err(|source| StorageError::Corrupt {
            block: block.to_string(),
            source,
        })?;

        let io_err = |source| StorageError::Io {
            block: block.to_string(),
            source,
        };
        let path = self.block_path(block);
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;
        Ok(())
    }
}
