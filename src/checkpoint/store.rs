//! Durable storage of subscription checkpoints.

use crate::error::{Result, SubscriptionError};
use crate::types::{Position, SubscriptionKey, Timestamp};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for checkpoint files.
const CHECKPOINT_MAGIC: &[u8; 4] = b"CKP\0";

/// Current checkpoint format version.
const CHECKPOINT_VERSION: u8 = 1;

/// Last confirmed position of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Every event at or below this position has been acknowledged or parked.
    pub position: Position,
    /// When the checkpoint was written.
    pub timestamp: Timestamp,
}

impl Checkpoint {
    pub fn at(position: Position) -> Self {
        Self {
            position,
            timestamp: Timestamp::now(),
        }
    }
}

/// Durable checkpoint storage.
///
/// `persist` must not return before the checkpoint is durable, and must
/// reject a position behind the one already stored.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, key: &SubscriptionKey) -> Result<Option<Checkpoint>>;

    fn persist(&self, key: &SubscriptionKey, checkpoint: Checkpoint) -> Result<()>;

    fn remove(&self, key: &SubscriptionKey) -> Result<()>;
}

fn check_monotonic(current: Option<&Checkpoint>, next: &Checkpoint) -> Result<()> {
    match current {
        Some(current) if next.position < current.position => {
            Err(SubscriptionError::CheckpointRegression {
                attempted: next.position,
                current: current.position,
            })
        }
        _ => Ok(()),
    }
}

/// Checkpoints held in memory (lost on restart).
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<SubscriptionKey, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.read().is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, key: &SubscriptionKey) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.read().get(key).copied())
    }

    fn persist(&self, key: &SubscriptionKey, checkpoint: Checkpoint) -> Result<()> {
        let mut checkpoints = self.checkpoints.write();
        check_monotonic(checkpoints.get(key), &checkpoint)?;
        checkpoints.insert(key.clone(), checkpoint);
        Ok(())
    }

    fn remove(&self, key: &SubscriptionKey) -> Result<()> {
        self.checkpoints.write().remove(key);
        Ok(())
    }
}

/// On-disk body of a checkpoint file.
#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    key: SubscriptionKey,
    checkpoint: Checkpoint,
}

/// Checkpoints stored as one file per subscription.
///
/// File layout: magic, version, body length (u64 LE), MessagePack body,
/// CRC32 of the body. Files are written to a temporary name, synced and
/// renamed over the previous version. The directory is held with an
/// exclusive lock for the lifetime of the store.
pub struct FileCheckpointStore {
    /// Directory holding checkpoint files.
    path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Serializes writers so the monotonic check and the write are atomic.
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a checkpoint directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let lock_file = Self::acquire_lock(&path)?;

        Ok(Self {
            path,
            _lock_file: lock_file,
            write_lock: Mutex::new(()),
        })
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| SubscriptionError::Locked)?;

        Ok(lock_file)
    }

    /// File name for a key: stream and group names may hold any character.
    fn file_path(&self, key: &SubscriptionKey) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.stream_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(key.group_name.as_bytes());
        let name = hex::encode(hasher.finalize());
        self.path.join(format!("{}.ckp", name))
    }

    fn read_file(path: &Path) -> Result<CheckpointFile> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != CHECKPOINT_MAGIC {
            return Err(SubscriptionError::InvalidFormat(
                "Invalid checkpoint magic".into(),
            ));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != CHECKPOINT_VERSION {
            return Err(SubscriptionError::InvalidFormat(format!(
                "Unsupported checkpoint version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(SubscriptionError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }

    fn write_file(path: &Path, body: &CheckpointFile) -> Result<()> {
        let encoded = rmp_serde::to_vec(body)?;
        let tmp_path = path.with_extension("tmp");

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;

            file.write_all(CHECKPOINT_MAGIC)?;
            file.write_all(&[CHECKPOINT_VERSION])?;
            file.write_all(&(encoded.len() as u64).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, key: &SubscriptionKey) -> Result<Option<Checkpoint>> {
        let path = self.file_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let stored = Self::read_file(&path)?;
        if &stored.key != key {
            return Err(SubscriptionError::InvalidFormat(format!(
                "checkpoint file for {} holds {}",
                key, stored.key
            )));
        }
        Ok(Some(stored.checkpoint))
    }

    fn persist(&self, key: &SubscriptionKey, checkpoint: Checkpoint) -> Result<()> {
        let _lock = self.write_lock.lock();

        let current = self.load(key)?;
        check_monotonic(current.as_ref(), &checkpoint)?;

        Self::write_file(
            &self.file_path(key),
            &CheckpointFile {
                key: key.clone(),
                checkpoint,
            },
        )
    }

    fn remove(&self, key: &SubscriptionKey) -> Result<()> {
        let _lock = self.write_lock.lock();
        let path = self.file_path(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
