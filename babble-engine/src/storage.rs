//! Storage collaborator contract and reference stores.
//!
//! The persistent engine behind the corpus, the n-gram counts, the neural
//! checkpoints and the job records is an external collaborator; this module
//! pins down the contract the rest of the crate relies on:
//!
//! - corpus entries are append-only,
//! - n-gram count writes are increment-or-insert and must accumulate
//!   correctly under concurrent ingestion,
//! - checkpoints are an immutable metadata row plus an opaque binary blob,
//! - job records are plain key-value reads/writes,
//! - n-gram increment batches are capped at [`MAX_BATCH`] keys so a backing
//!   SQL engine never exceeds its statement parameter limit.
//!
//! Two reference implementations ship with the crate: [`MemoryStore`] for
//! tests and [`FileStore`], a single-directory store with an atomically
//! rewritten JSON snapshot and one blob file per checkpoint.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::jobs::TrainingJob;

/// Maximum number of keys per n-gram increment batch.
///
/// 200 keys at 4 fields each stays under the ~999-parameter statement limit
/// of common embedded SQL engines.
pub const MAX_BATCH: usize = 200;

/// Errors from the storage collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("state snapshot parse error")]
    Json(#[from] serde_json::Error),

    #[error("increment batch of {0} keys exceeds the {MAX_BATCH}-key limit")]
    BatchTooLarge(usize),

    #[error("no checkpoint blob for id '{0}'")]
    MissingBlob(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

type Result<T> = std::result::Result<T, StorageError>;

/// One normalized text block of the accumulated training corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusEntry {
    /// Monotonically increasing identifier.
    pub id: u64,
    /// Normalized content.
    pub content: String,
    /// Length of `content` in symbols.
    pub chars: usize,
    /// Creation time as Unix timestamp (seconds).
    pub created_at: u64,
}

/// Aggregate corpus figures.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CorpusStats {
    pub entries: usize,
    pub total_chars: u64,
}

/// Key of one n-gram observation: (order, context, next symbol).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NGramKey {
    pub order: u8,
    pub context: String,
    pub next: char,
}

/// An increment to apply to one n-gram key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NGramDelta {
    pub key: NGramKey,
    pub count: u64,
}

/// A stored n-gram count row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NGramRecord {
    pub key: NGramKey,
    pub count: u64,
}

/// Checkpoint metadata supplied by the orchestrator at save time.
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub epochs: usize,
    pub block_size: usize,
    pub loss: f32,
    pub accuracy: Option<f32>,
    pub is_best: bool,
}

/// A stored checkpoint row. The parameter blob lives beside it, keyed by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub id: String,
    pub epochs: usize,
    pub block_size: usize,
    pub loss: f32,
    pub accuracy: Option<f32>,
    pub is_best: bool,
    pub created_at: u64,
}

/// The storage contract consumed by the engine.
pub trait Store: Send + Sync {
    /// Append a corpus entry; the store assigns id and timestamp.
    fn append_corpus(&self, content: &str) -> Result<CorpusEntry>;

    /// Corpus entries, newest first, at most `limit`.
    fn list_corpus(&self, limit: usize) -> Result<Vec<CorpusEntry>>;

    fn corpus_stats(&self) -> Result<CorpusStats>;

    /// Increment-or-insert every key in `batch`. Atomic with respect to
    /// concurrent callers: concurrent increments to the same key accumulate.
    fn increment_ngrams(&self, batch: &[NGramDelta]) -> Result<()>;

    /// The full sparse count table for one order.
    fn ngram_counts(&self, order: u8) -> Result<Vec<NGramRecord>>;

    /// Store a checkpoint row plus its parameter blob. When `is_best` is
    /// set, the flag is cleared on every other row in the same write.
    fn put_checkpoint(&self, new: NewCheckpoint, blob: &[u8]) -> Result<CheckpointMeta>;

    fn checkpoint_blob(&self, id: &str) -> Result<Vec<u8>>;

    fn best_checkpoint(&self) -> Result<Option<CheckpointMeta>>;

    fn latest_checkpoint(&self) -> Result<Option<CheckpointMeta>>;

    /// Checkpoint rows, newest first, at most `limit`.
    fn list_checkpoints(&self, limit: usize) -> Result<Vec<CheckpointMeta>>;

    fn put_job(&self, job: &TrainingJob) -> Result<()>;

    fn get_job(&self, id: &str) -> Result<Option<TrainingJob>>;

    fn list_jobs(&self) -> Result<Vec<TrainingJob>>;

    /// Full reset: corpus, n-gram counts, checkpoints and job records are
    /// deleted wholesale. The only operation that ever removes data.
    fn reset(&self) -> Result<()>;
}

/// Current time as Unix timestamp in seconds.
pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Shared state machinery for the reference stores
// ---------------------------------------------------------------------------

fn encode_key(key: &NGramKey) -> String {
    // ':' is not in the alphabet, so the encoding is unambiguous.
    format!("{}:{}:{}", key.order, key.context, key.next)
}

fn decode_key(s: &str) -> Option<NGramKey> {
    let mut parts = s.splitn(3, ':');
    let order: u8 = parts.next()?.parse().ok()?;
    let context = parts.next()?.to_string();
    let next = parts.next()?.chars().next()?;
    Some(NGramKey {
        order,
        context,
        next,
    })
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    corpus: Vec<CorpusEntry>,
    corpus_seq: u64,
    ngrams: HashMap<String, u64>,
    checkpoints: Vec<CheckpointMeta>,
    checkpoint_seq: u64,
    jobs: HashMap<String, TrainingJob>,
    #[serde(skip)]
    blobs: HashMap<String, Vec<u8>>,
}

impl StoreState {
    fn append_corpus(&mut self, content: &str) -> CorpusEntry {
        self.corpus_seq += 1;
        let entry = CorpusEntry {
            id: self.corpus_seq,
            content: content.to_string(),
            chars: content.chars().count(),
            created_at: now_unix(),
        };
        self.corpus.push(entry.clone());
        entry
    }

    fn list_corpus(&self, limit: usize) -> Vec<CorpusEntry> {
        self.corpus.iter().rev().take(limit).cloned().collect()
    }

    fn corpus_stats(&self) -> CorpusStats {
        CorpusStats {
            entries: self.corpus.len(),
            total_chars: self.corpus.iter().map(|e| e.chars as u64).sum(),
        }
    }

    fn increment_ngrams(&mut self, batch: &[NGramDelta]) -> Result<()> {
        if batch.len() > MAX_BATCH {
            return Err(StorageError::BatchTooLarge(batch.len()));
        }
        for delta in batch {
            *self.ngrams.entry(encode_key(&delta.key)).or_insert(0) += delta.count;
        }
        Ok(())
    }

    fn ngram_counts(&self, order: u8) -> Vec<NGramRecord> {
        self.ngrams
            .iter()
            .filter_map(|(k, &count)| {
                let key = decode_key(k)?;
                (key.order == order).then_some(NGramRecord { key, count })
            })
            .collect()
    }

    fn put_checkpoint(&mut self, new: NewCheckpoint) -> CheckpointMeta {
        self.checkpoint_seq += 1;
        if new.is_best {
            for meta in &mut self.checkpoints {
                meta.is_best = false;
            }
        }
        let meta = CheckpointMeta {
            id: format!("ckpt-{:06}", self.checkpoint_seq),
            epochs: new.epochs,
            block_size: new.block_size,
            loss: new.loss,
            accuracy: new.accuracy,
            is_best: new.is_best,
            created_at: now_unix(),
        };
        self.checkpoints.push(meta.clone());
        meta
    }

    fn best_checkpoint(&self) -> Option<CheckpointMeta> {
        self.checkpoints.iter().rev().find(|m| m.is_best).cloned()
    }

    fn latest_checkpoint(&self) -> Option<CheckpointMeta> {
        self.checkpoints.last().cloned()
    }

    fn list_checkpoints(&self, limit: usize) -> Vec<CheckpointMeta> {
        self.checkpoints.iter().rev().take(limit).cloned().collect()
    }

    fn clear(&mut self) {
        *self = StoreState::default();
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory reference store. Increments are atomic under the state lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        // A poisoned lock means a panic mid-write; the state is plain data
        // and every mutation below is complete-or-absent, so recover.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Store for MemoryStore {
    fn append_corpus(&self, content: &str) -> Result<CorpusEntry> {
        Ok(self.lock().append_corpus(content))
    }

    fn list_corpus(&self, limit: usize) -> Result<Vec<CorpusEntry>> {
        Ok(self.lock().list_corpus(limit))
    }

    fn corpus_stats(&self) -> Result<CorpusStats> {
        Ok(self.lock().corpus_stats())
    }

    fn increment_ngrams(&self, batch: &[NGramDelta]) -> Result<()> {
        self.lock().increment_ngrams(batch)
    }

    fn ngram_counts(&self, order: u8) -> Result<Vec<NGramRecord>> {
        Ok(self.lock().ngram_counts(order))
    }

    fn put_checkpoint(&self, new: NewCheckpoint, blob: &[u8]) -> Result<CheckpointMeta> {
        let mut state = self.lock();
        let meta = state.put_checkpoint(new);
        state.blobs.insert(meta.id.clone(), blob.to_vec());
        Ok(meta)
    }

    fn checkpoint_blob(&self, id: &str) -> Result<Vec<u8>> {
        self.lock()
            .blobs
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::MissingBlob(id.to_string()))
    }

    fn best_checkpoint(&self) -> Result<Option<CheckpointMeta>> {
        Ok(self.lock().best_checkpoint())
    }

    fn latest_checkpoint(&self) -> Result<Option<CheckpointMeta>> {
        Ok(self.lock().latest_checkpoint())
    }

    fn list_checkpoints(&self, limit: usize) -> Result<Vec<CheckpointMeta>> {
        Ok(self.lock().list_checkpoints(limit))
    }

    fn put_job(&self, job: &TrainingJob) -> Result<()> {
        self.lock().jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn get_job(&self, id: &str) -> Result<Option<TrainingJob>> {
        Ok(self.lock().jobs.get(id).cloned())
    }

    fn list_jobs(&self) -> Result<Vec<TrainingJob>> {
        let mut jobs: Vec<TrainingJob> = self.lock().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn reset(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// Single-directory file-backed store.
///
/// Layout:
/// ```text
/// <dir>/state.json           corpus, counts, metadata, jobs
/// <dir>/checkpoints/<id>.bin one parameter blob per checkpoint
/// ```
///
/// The snapshot is rewritten atomically (temp file + rename) after every
/// mutation, so a crash mid-write leaves the previous snapshot intact.
pub struct FileStore {
    dir: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Open a store directory, creating it (and an empty state) if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(dir.join("checkpoints"))?;

        let state_path = dir.join("state.json");
        let state = if state_path.exists() {
            let bytes = std::fs::read(&state_path)?;
            serde_json::from_slice(&bytes)?
        } else {
            StoreState::default()
        };

        Ok(Self {
            dir,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn flush(&self, state: &StoreState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.dir, &self.dir.join("state.json"), &bytes)
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.dir.join("checkpoints").join(format!("{id}.bin"))
    }
}

/// Write `bytes` to `path` via a temp file in `dir`, then rename into place.
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| StorageError::Io(e.error))?;
    Ok(())
}

impl Store for FileStore {
    fn append_corpus(&self, content: &str) -> Result<CorpusEntry> {
        let mut state = self.lock();
        let entry = state.append_corpus(content);
        self.flush(&state)?;
        Ok(entry)
    }

    fn list_corpus(&self, limit: usize) -> Result<Vec<CorpusEntry>> {
        Ok(self.lock().list_corpus(limit))
    }

    fn corpus_stats(&self) -> Result<CorpusStats> {
        Ok(self.lock().corpus_stats())
    }

    fn increment_ngrams(&self, batch: &[NGramDelta]) -> Result<()> {
        let mut state = self.lock();
        state.increment_ngrams(batch)?;
        self.flush(&state)
    }

    fn ngram_counts(&self, order: u8) -> Result<Vec<NGramRecord>> {
        Ok(self.lock().ngram_counts(order))
    }

    fn put_checkpoint(&self, new: NewCheckpoint, blob: &[u8]) -> Result<CheckpointMeta> {
        let mut state = self.lock();
        let meta = state.put_checkpoint(new);
        write_atomic(&self.dir, &self.blob_path(&meta.id), blob)?;
        self.flush(&state)?;
        Ok(meta)
    }

    fn checkpoint_blob(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(id);
        if !path.exists() {
            return Err(StorageError::MissingBlob(id.to_string()));
        }
        Ok(std::fs::read(path)?)
    }

    fn best_checkpoint(&self) -> Result<Option<CheckpointMeta>> {
        Ok(self.lock().best_checkpoint())
    }

    fn latest_checkpoint(&self) -> Result<Option<CheckpointMeta>> {
        Ok(self.lock().latest_checkpoint())
    }

    fn list_checkpoints(&self, limit: usize) -> Result<Vec<CheckpointMeta>> {
        Ok(self.lock().list_checkpoints(limit))
    }

    fn put_job(&self, job: &TrainingJob) -> Result<()> {
        let mut state = self.lock();
        state.jobs.insert(job.id.clone(), job.clone());
        self.flush(&state)
    }

    fn get_job(&self, id: &str) -> Result<Option<TrainingJob>> {
        Ok(self.lock().jobs.get(id).cloned())
    }

    fn list_jobs(&self) -> Result<Vec<TrainingJob>> {
        let mut jobs: Vec<TrainingJob> = self.lock().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn reset(&self) -> Result<()> {
        let mut state = self.lock();
        let ids: Vec<String> = state.checkpoints.iter().map(|m| m.id.clone()).collect();
        state.clear();
        self.flush(&state)?;
        for id in ids {
            let path = self.blob_path(&id);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn delta(order: u8, context: &str, next: char, count: u64) -> NGramDelta {
        NGramDelta {
            key: NGramKey {
                order,
                context: context.to_string(),
                next,
            },
            count,
        }
    }

    #[test]
    fn test_corpus_ids_increase() {
        let store = MemoryStore::new();
        let a = store.append_corpus("AAA").unwrap();
        let b = store.append_corpus("BBB").unwrap();
        assert!(b.id > a.id);

        let listed = store.list_corpus(10).unwrap();
        assert_eq!(listed.len(), 2);
        // Newest first
        assert_eq!(listed[0].content, "BBB");

        let stats = store.corpus_stats().unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_chars, 6);
    }

    #[test]
    fn test_increments_accumulate() {
        let store = MemoryStore::new();
        store
            .increment_ngrams(&[delta(2, "T", 'H', 2)])
            .unwrap();
        store
            .increment_ngrams(&[delta(2, "T", 'H', 3), delta(2, "H", 'E', 1)])
            .unwrap();

        let counts = store.ngram_counts(2).unwrap();
        let th = counts
            .iter()
            .find(|r| r.key.context == "T" && r.key.next == 'H')
            .unwrap();
        assert_eq!(th.count, 5);
    }

    #[test]
    fn test_batch_cap_enforced() {
        let store = MemoryStore::new();
        let batch: Vec<NGramDelta> = (0..MAX_BATCH + 1)
            .map(|i| delta(2, "A", char::from(b'A' + (i % 26) as u8), 1))
            .collect();
        assert!(matches!(
            store.increment_ngrams(&batch),
            Err(StorageError::BatchTooLarge(_))
        ));
    }

    #[test]
    fn test_concurrent_increments_accumulate() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    store.increment_ngrams(&[delta(2, " ", 'Q', 1)]).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let counts = store.ngram_counts(2).unwrap();
        assert_eq!(counts[0].count, 800);
    }

    #[test]
    fn test_best_flag_exclusive() {
        let store = MemoryStore::new();
        let first = store
            .put_checkpoint(
                NewCheckpoint {
                    epochs: 1,
                    block_size: 100,
                    loss: 2.0,
                    accuracy: None,
                    is_best: true,
                },
                b"one",
            )
            .unwrap();
        let second = store
            .put_checkpoint(
                NewCheckpoint {
                    epochs: 2,
                    block_size: 100,
                    loss: 1.5,
                    accuracy: None,
                    is_best: true,
                },
                b"two",
            )
            .unwrap();

        let best = store.best_checkpoint().unwrap().unwrap();
        assert_eq!(best.id, second.id);
        let all = store.list_checkpoints(10).unwrap();
        assert_eq!(all.iter().filter(|m| m.is_best).count(), 1);
        assert_eq!(store.checkpoint_blob(&first.id).unwrap(), b"one");
    }

    #[test]
    fn test_missing_blob() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.checkpoint_blob("ckpt-000099"),
            Err(StorageError::MissingBlob(_))
        ));
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.append_corpus("THE FOX").unwrap();
            store.increment_ngrams(&[delta(2, "T", 'H', 1)]).unwrap();
            store
                .put_checkpoint(
                    NewCheckpoint {
                        epochs: 3,
                        block_size: 100,
                        loss: 1.25,
                        accuracy: Some(0.5),
                        is_best: true,
                    },
                    b"params",
                )
                .unwrap();
        }

        // Reopen from disk
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.corpus_stats().unwrap().entries, 1);
        assert_eq!(store.ngram_counts(2).unwrap().len(), 1);
        let best = store.best_checkpoint().unwrap().unwrap();
        assert_eq!(best.epochs, 3);
        assert_eq!(store.checkpoint_blob(&best.id).unwrap(), b"params");
    }

    #[test]
    fn test_file_store_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.append_corpus("SOME TEXT").unwrap();
        let meta = store
            .put_checkpoint(
                NewCheckpoint {
                    epochs: 1,
                    block_size: 10,
                    loss: 3.0,
                    accuracy: None,
                    is_best: true,
                },
                b"blob",
            )
            .unwrap();

        store.reset().unwrap();
        assert_eq!(store.corpus_stats().unwrap().entries, 0);
        assert!(store.best_checkpoint().unwrap().is_none());
        assert!(store.checkpoint_blob(&meta.id).is_err());
    }
}
