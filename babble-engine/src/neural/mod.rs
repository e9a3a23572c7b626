//! Neural character model: architecture, training, checkpointing, and the
//! shared handle generation reads from.

pub mod checkpoint;
pub mod config;
pub mod model;
pub(crate) mod tensor;
pub mod train;

pub use checkpoint::{DecodedCheckpoint, decode, encode};
pub use config::{NeuralConfig, config};
pub use model::CharModel;
pub use train::{
    CORPUS_CHAR_BUDGET, EpochStats, MIN_DATASET_CHARS, NullObserver, TrainObserver, TrainOptions,
    TrainProgress, TrainSummary, build_dataset, synthetic_symbols, train,
};

use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::storage::Store;

/// Shared reference to the checkpoint currently serving generation.
///
/// Readers clone the inner `Arc` and never hold the lock across inference;
/// the orchestrator publishes a new checkpoint by swapping the whole
/// reference, so concurrent readers see either the old model or the new
/// one in full, never a partially loaded one.
#[derive(Clone, Default)]
pub struct ModelHandle {
    inner: Arc<RwLock<Option<Arc<CharModel>>>>,
}

impl ModelHandle {
    /// A handle with no model loaded; generation runs markov-only.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the best (else latest) stored checkpoint into a fresh handle.
    pub fn load(store: &dyn Store, cfg: &NeuralConfig) -> Result<Self> {
        let handle = Self::empty();
        let meta = match store.best_checkpoint()? {
            Some(meta) => Some(meta),
            None => store.latest_checkpoint()?,
        };
        if let Some(meta) = meta {
            let blob = store.checkpoint_blob(&meta.id)?;
            let decoded = checkpoint::decode(&blob, cfg)?;
            handle.swap(Arc::new(decoded.model));
        }
        Ok(handle)
    }

    /// The model currently published, if any.
    pub fn current(&self) -> Option<Arc<CharModel>> {
        self.inner.read().expect("lock poisoned").clone()
    }

    /// Atomically publish a new model.
    pub fn swap(&self, model: Arc<CharModel>) {
        *self.inner.write().expect("lock poisoned") = Some(model);
    }

    /// Drop the published model (after a full reset).
    pub fn clear(&self) {
        *self.inner.write().expect("lock poisoned") = None;
    }
}
