//! Gradient training for the character model.
//!
//! Cross-entropy on next-symbol prediction, Adam, global-norm gradient
//! clipping. The dataset is the accumulated corpus flattened to symbol
//! indices; when it falls below [`MIN_DATASET_CHARS`] it is padded with
//! seeded pseudo-random symbols so training never receives an empty
//! dataset. This is a deliberate degenerate-input fallback, logged as a
//! warning.
//!
//! Training with identical data, options and seed is deterministic; the
//! orchestrator relies on this for pause/resume equivalence.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use super::model::{CharModel, Params};
use super::tensor::softmax;
use crate::alphabet;
use crate::error::{EngineError, Result};
use crate::storage::Store;

/// Below this many corpus symbols, the synthetic fallback kicks in.
pub const MIN_DATASET_CHARS: usize = 10_000;

/// Upper bound on corpus symbols loaded into one training dataset.
pub const CORPUS_CHAR_BUDGET: usize = 2_000_000;

const MAX_GRAD_NORM: f32 = 1.0;

/// Knobs for one training run.
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Cap on total optimizer steps across all epochs.
    pub max_steps: usize,
    /// Seed for shuffling and dropout; fixed seed ⇒ fixed trajectory.
    pub seed: u64,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 5,
            batch_size: 32,
            learning_rate: 1e-3,
            max_steps: usize::MAX,
            seed: 0,
        }
    }
}

/// Snapshot passed to [`TrainObserver::on_step`].
#[derive(Debug, Clone, Copy)]
pub struct TrainProgress {
    pub epoch: usize,
    pub epochs: usize,
    pub step: usize,
    pub total_steps: usize,
    pub loss: f32,
}

/// Snapshot passed to [`TrainObserver::on_epoch`].
#[derive(Debug, Clone, Copy)]
pub struct EpochStats {
    pub epoch: usize,
    pub loss: f32,
}

/// Result of a completed run.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrainSummary {
    pub epochs_run: usize,
    pub steps: usize,
    pub final_loss: f32,
}

/// Hooks into the training loop.
///
/// `on_step` fires after every optimizer step (progress reporting, stall
/// heartbeats); `on_epoch` fires at epoch boundaries, the only point where
/// suspending the run leaves no partial state behind. Returning an error
/// from either aborts training with that error.
pub trait TrainObserver {
    fn on_step(&mut self, progress: &TrainProgress) -> Result<()> {
        let _ = progress;
        Ok(())
    }

    fn on_epoch(&mut self, stats: &EpochStats) -> Result<()> {
        let _ = stats;
        Ok(())
    }
}

/// Observer that ignores everything.
pub struct NullObserver;

impl TrainObserver for NullObserver {}

/// Seeded pseudo-random symbol indices.
pub fn synthetic_symbols(seed: u64, count: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| rng.random_range(0..alphabet::SIZE) as u8)
        .collect()
}

/// Flatten the accumulated corpus (newest entries first) into a training
/// buffer of symbol indices, capped at [`CORPUS_CHAR_BUDGET`] and padded
/// with synthetic symbols below [`MIN_DATASET_CHARS`].
pub fn build_dataset(store: &dyn Store, window: usize, seed: u64) -> Result<Vec<u8>> {
    let mut data: Vec<u8> = Vec::new();
    for entry in store.list_corpus(usize::MAX)? {
        if data.len() >= CORPUS_CHAR_BUDGET {
            break;
        }
        let indices = alphabet::to_indices(&entry.content)?;
        let room = CORPUS_CHAR_BUDGET - data.len();
        data.extend(indices.into_iter().take(room));
    }

    if data.len() < MIN_DATASET_CHARS {
        warn!(
            corpus_symbols = data.len(),
            threshold = MIN_DATASET_CHARS,
            "corpus below training threshold, padding with synthetic data"
        );
        let missing = MIN_DATASET_CHARS + window - data.len();
        data.extend(synthetic_symbols(seed, missing));
    }
    Ok(data)
}

struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: i32,
    m: Params,
    v: Params,
}

impl Adam {
    fn new(params: &Params, lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: params.zeros_like(),
            v: params.zeros_like(),
        }
    }

    fn step(&mut self, params: &mut Params, grads: &Params) {
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t);
        let bc2 = 1.0 - self.beta2.powi(self.t);

        let mut ps = params.mats_mut();
        let gs = grads.mats();
        let mut ms = self.m.mats_mut();
        let mut vs = self.v.mats_mut();
        for i in 0..ps.len() {
            let (p, g) = (&mut ps[i], gs[i]);
            let (m, v) = (&mut ms[i], &mut vs[i]);
            for j in 0..p.data.len() {
                let grad = g.data[j];
                m.data[j] = self.beta1 * m.data[j] + (1.0 - self.beta1) * grad;
                v.data[j] = self.beta2 * v.data[j] + (1.0 - self.beta2) * grad * grad;
                let mhat = m.data[j] / bc1;
                let vhat = v.data[j] / bc2;
                p.data[j] -= self.lr * mhat / (vhat.sqrt() + self.eps);
            }
        }
    }
}

/// Scale gradients down to a global norm of `max_norm`; returns the
/// pre-clip norm.
fn clip_gradients(grads: &mut Params, max_norm: f32) -> f32 {
    let norm = grads
        .mats()
        .iter()
        .flat_map(|m| &m.data)
        .map(|&g| g * g)
        .sum::<f32>()
        .sqrt();
    if norm > max_norm {
        let scale = max_norm / norm;
        for m in grads.mats_mut() {
            for g in &mut m.data {
                *g *= scale;
            }
        }
    }
    norm
}

/// Train `model` in place over `data` (symbol indices).
///
/// Resumption from a checkpoint is just training a decoded model further;
/// nothing here distinguishes a fresh model from a loaded one.
pub fn train(
    model: &mut CharModel,
    data: &[u8],
    opts: &TrainOptions,
    observer: &mut dyn TrainObserver,
) -> Result<TrainSummary> {
    let window = model.config().window;
    if data.len() < window + 1 {
        return Err(EngineError::InvalidArgument(format!(
            "dataset of {} symbols cannot fill a {window}-symbol window",
            data.len()
        )));
    }
    if opts.epochs == 0 || opts.batch_size == 0 {
        return Err(EngineError::InvalidArgument(
            "epochs and batch_size must be positive".to_string(),
        ));
    }

    let windows = data.len() - window;
    let steps_per_epoch = windows.div_ceil(opts.batch_size);
    let total_steps = opts.max_steps.min(opts.epochs * steps_per_epoch).max(1);
    let dropout_p = model.config().dropout;

    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut adam = Adam::new(&model.params, opts.learning_rate);
    let mut starts: Vec<usize> = (0..windows).collect();

    info!(
        dataset = data.len(),
        windows,
        total_steps,
        epochs = opts.epochs,
        "neural training started"
    );

    let mut step = 0usize;
    let mut summary = TrainSummary::default();
    for epoch in 0..opts.epochs {
        starts.shuffle(&mut rng);
        let mut epoch_loss = 0.0f32;
        let mut batches = 0usize;

        for batch in starts.chunks(opts.batch_size) {
            let mut grads = model.params.zeros_like();
            let mut batch_loss = 0.0f32;
            let scale = 1.0 / batch.len() as f32;

            for &start in batch {
                let idx: Vec<usize> = data[start..start + window]
                    .iter()
                    .map(|&b| b as usize)
                    .collect();
                let target = data[start + window] as usize;

                let cache = model.forward(&idx, Some((dropout_p, &mut rng)));
                let mut probs = cache.logits.clone();
                softmax(&mut probs);
                batch_loss += -probs[target].max(1e-12).ln();

                let mut dlogits = probs;
                dlogits[target] -= 1.0;
                for g in dlogits.iter_mut() {
                    *g *= scale;
                }
                model.backward(&cache, &dlogits, &mut grads);
            }

            clip_gradients(&mut grads, MAX_GRAD_NORM);
            adam.step(&mut model.params, &grads);

            step += 1;
            let loss = batch_loss / batch.len() as f32;
            epoch_loss += loss;
            batches += 1;
            summary.steps = step;
            observer.on_step(&TrainProgress {
                epoch,
                epochs: opts.epochs,
                step,
                total_steps,
                loss,
            })?;
            if step >= total_steps {
                break;
            }
        }

        let avg = epoch_loss / batches.max(1) as f32;
        summary.epochs_run = epoch + 1;
        summary.final_loss = avg;
        info!(
            epoch = epoch + 1,
            epochs = opts.epochs,
            loss = avg,
            "epoch complete"
        );
        observer.on_epoch(&EpochStats {
            epoch: epoch + 1,
            loss: avg,
        })?;
        if step >= total_steps {
            break;
        }
    }

    Ok(summary)
}
