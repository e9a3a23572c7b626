//! Training orchestrator: a bounded worker pool driving two-phase training
//! jobs with progress reporting, pause/resume, cancellation and a stall
//! watchdog.
//!
//! Each job runs entirely on one worker: ingestion (progress 0–50) persists
//! the corpus entry and feeds the n-gram model block by block, then neural
//! training (50–100) runs over the accumulated corpus and publishes a
//! checkpoint. Pause requests are honored only at safe suspension points
//! (between ingestion blocks and between training epochs), so suspension
//! never leaves partial uncommitted state. Generation stays lock-free with
//! respect to all of this: it reads an [`NGramTable`] snapshot and an
//! immutable model reference.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::alphabet;
use crate::error::{EngineError, Result};
use crate::evaluate::{self, EvalOptions, EvalReport};
use crate::generate::{GenerationParams, GenerationResult, Generator};
use crate::jobs::{JobRegistry, JobStatus, TrainingJob};
use crate::neural::{
    self, CharModel, ModelHandle, NeuralConfig, TrainObserver, TrainOptions, TrainProgress,
};
use crate::ngram::NGramTable;
use crate::storage::{NewCheckpoint, Store};
use crate::validator::WordValidator;

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Maximum simultaneously running jobs.
    pub workers: usize,
    /// Ingestion block size when a request does not name one.
    pub default_block_size: usize,
    /// A running job with no heartbeat for this long is forcibly failed.
    pub stall_timeout: Duration,
    /// Post-training Monte Carlo samples; 0 disables the evaluation step.
    pub eval_samples: usize,
    /// Architecture for models trained by this orchestrator.
    pub neural: NeuralConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            default_block_size: 100_000,
            stall_timeout: Duration::from_secs(120),
            eval_samples: 20,
            neural: neural::config().clone(),
        }
    }
}

/// One training request.
#[derive(Debug, Clone)]
pub struct TrainRequest {
    /// Raw text; normalized before it reaches the corpus.
    pub text: String,
    /// Ingestion block size; defaults to the orchestrator's.
    pub block_size: Option<usize>,
    /// Neural training epochs.
    pub epochs: usize,
    /// Seed for dataset fallback, model init and training; fixed seed plus
    /// fixed corpus gives a fixed loss trajectory.
    pub seed: u64,
}

impl TrainRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            block_size: None,
            epochs: 5,
            seed: 0,
        }
    }
}

struct QueuedJob {
    id: String,
    text: String,
    block_size: usize,
    epochs: usize,
    seed: u64,
}

struct ControlState {
    pause_requested: bool,
    abort: Option<String>,
}

/// Per-job control block shared between the worker, the watchdog and the
/// public pause/resume/cancel calls.
struct JobControl {
    state: Mutex<ControlState>,
    cv: Condvar,
    last_beat: Mutex<Instant>,
}

impl JobControl {
    fn new() -> Self {
        Self {
            state: Mutex::new(ControlState {
                pause_requested: false,
                abort: None,
            }),
            cv: Condvar::new(),
            last_beat: Mutex::new(Instant::now()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().expect("lock poisoned")
    }

    fn beat(&self) {
        *self.last_beat.lock().expect("lock poisoned") = Instant::now();
    }

    fn request_pause(&self) {
        self.lock().pause_requested = true;
    }

    fn request_resume(&self) {
        self.lock().pause_requested = false;
        self.cv.notify_all();
    }

    fn abort(&self, reason: String) {
        self.lock().abort = Some(reason);
        self.cv.notify_all();
    }

    fn abort_reason(&self) -> Option<String> {
        self.lock().abort.clone()
    }

    fn check_abort(&self) -> Result<()> {
        match &self.lock().abort {
            Some(reason) => Err(EngineError::Timeout(reason.clone())),
            None => Ok(()),
        }
    }

    fn is_stalled(&self, timeout: Duration) -> bool {
        if self.lock().pause_requested {
            return false;
        }
        self.last_beat.lock().expect("lock poisoned").elapsed() > timeout
    }

    /// Safe suspension point: record a heartbeat, honor a pending pause,
    /// and abort if the job was cancelled or timed out.
    fn checkpoint(&self, registry: &JobRegistry, job_id: &str) -> Result<()> {
        self.beat();
        let mut st = self.lock();
        if let Some(reason) = &st.abort {
            return Err(EngineError::Timeout(reason.clone()));
        }
        if st.pause_requested {
            let _ = registry.update(job_id, |j| {
                j.status = JobStatus::Paused;
                j.message = "Paused".to_string();
            });
            info!(job_id, "job paused");
            while st.pause_requested && st.abort.is_none() {
                st = self.cv.wait(st).expect("lock poisoned");
            }
            if let Some(reason) = &st.abort {
                return Err(EngineError::Timeout(reason.clone()));
            }
            let _ = registry.update(job_id, |j| {
                j.status = JobStatus::Running;
                j.message = "Resumed".to_string();
            });
            info!(job_id, "job resumed");
            drop(st);
            self.beat();
        }
        Ok(())
    }
}

struct Inner {
    store: Arc<dyn Store>,
    registry: JobRegistry,
    model: ModelHandle,
    validator: WordValidator,
    config: TrainerConfig,
    queue: Mutex<VecDeque<QueuedJob>>,
    queue_cv: Condvar,
    controls: Mutex<HashMap<String, Arc<JobControl>>>,
    stop: AtomicBool,
}

/// The training orchestrator and engine facade.
pub struct Trainer {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

impl Trainer {
    /// Start the worker pool. Loads the best stored checkpoint into the
    /// generation handle; a corrupt one is logged and skipped, never fatal
    /// at startup.
    pub fn new(
        store: Arc<dyn Store>,
        validator: WordValidator,
        config: TrainerConfig,
    ) -> Result<Self> {
        let model = match ModelHandle::load(&*store, &config.neural) {
            Ok(handle) => handle,
            Err(e @ EngineError::CheckpointCorrupt(_)) => {
                warn!("stored checkpoint unusable, starting without a model: {e}");
                ModelHandle::empty()
            }
            Err(e) => return Err(e),
        };

        let inner = Arc::new(Inner {
            registry: JobRegistry::new(Arc::clone(&store)),
            store,
            model,
            validator,
            config,
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            controls: Mutex::new(HashMap::new()),
            stop: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(inner.config.workers);
        for i in 0..inner.config.workers {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("babble-worker-{i}"))
                .spawn(move || worker_loop(&inner))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        let watchdog = {
            let inner = Arc::clone(&inner);
            Some(
                std::thread::Builder::new()
                    .name("babble-watchdog".to_string())
                    .spawn(move || watchdog_loop(&inner))
                    .expect("failed to spawn watchdog thread"),
            )
        };

        Ok(Self {
            inner,
            workers,
            watchdog,
        })
    }

    /// Accept a training request; returns the job id immediately. The job
    /// runs when a worker slot frees up.
    pub fn submit(&self, req: TrainRequest) -> Result<String> {
        if req.epochs == 0 {
            return Err(EngineError::InvalidArgument(
                "epoch count must be at least 1".to_string(),
            ));
        }
        let block_size = req.block_size.unwrap_or(self.inner.config.default_block_size);
        if block_size == 0 {
            return Err(EngineError::InvalidArgument(
                "block size must be at least 1".to_string(),
            ));
        }

        let job = self.inner.registry.create(block_size, req.epochs)?;
        self.inner
            .controls
            .lock()
            .expect("lock poisoned")
            .insert(job.id.clone(), Arc::new(JobControl::new()));
        self.inner
            .queue
            .lock()
            .expect("lock poisoned")
            .push_back(QueuedJob {
                id: job.id.clone(),
                text: req.text,
                block_size,
                epochs: req.epochs,
                seed: req.seed,
            });
        self.inner.queue_cv.notify_one();
        info!(job_id = %job.id, block_size, epochs = req.epochs, "training job accepted");
        Ok(job.id)
    }

    pub fn job(&self, id: &str) -> Result<Option<TrainingJob>> {
        self.inner.registry.get(id)
    }

    pub fn jobs(&self) -> Result<Vec<TrainingJob>> {
        self.inner.registry.list()
    }

    /// Request suspension; the worker parks at the next block or epoch
    /// boundary and the record shows `Paused` once it does.
    pub fn pause(&self, id: &str) -> Result<()> {
        self.control_for(id)?.request_pause();
        Ok(())
    }

    /// Resume a paused job from its last completed phase boundary.
    pub fn resume(&self, id: &str) -> Result<()> {
        self.control_for(id)?.request_resume();
        Ok(())
    }

    /// Cancel a queued, running or paused job: the record is forced to
    /// `Error` and the worker abandons it at the next safe point.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let control = self.control_for(id)?;
        let reason = "cancelled by request".to_string();
        let _ = self.inner.registry.update(id, |j| {
            j.status = JobStatus::Error;
            j.message = "Cancelled".to_string();
            j.error = Some(reason.clone());
        });
        control.abort(reason);
        Ok(())
    }

    fn control_for(&self, id: &str) -> Result<Arc<JobControl>> {
        self.inner
            .controls
            .lock()
            .expect("lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| {
                EngineError::InvalidArgument(format!("no active job with id '{id}'"))
            })
    }

    /// Shared handle to the checkpoint generation reads.
    pub fn model_handle(&self) -> ModelHandle {
        self.inner.model.clone()
    }

    /// Generate against fresh read snapshots of the n-gram counts and the
    /// currently published model. Never blocks on training.
    pub fn generate(&self, params: &GenerationParams) -> Result<GenerationResult> {
        let table = NGramTable::load(&*self.inner.store)?;
        let model = self.inner.model.current();
        Generator::new(&table, model.as_deref(), &self.inner.validator).generate(params)
    }

    /// Monte Carlo evaluation against the current snapshots.
    pub fn evaluate(&self, opts: &EvalOptions) -> Result<EvalReport> {
        let table = NGramTable::load(&*self.inner.store)?;
        let model = self.inner.model.current();
        evaluate::run(
            &Generator::new(&table, model.as_deref(), &self.inner.validator),
            opts,
        )
    }

    /// Full reset: wipes corpus, counts, checkpoints and job records, and
    /// drops the published model.
    pub fn reset(&self) -> Result<()> {
        self.inner.store.reset()?;
        self.inner.model.clear();
        warn!("engine state reset");
        Ok(())
    }

    /// Stop accepting work and join the pool. Jobs already running finish
    /// first; queued jobs stay queued in the store.
    pub fn shutdown(mut self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.queue_cv.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.watchdog.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Trainer {
    fn drop(&mut self) {
        // Without an explicit shutdown the threads are left to drain and
        // exit on their own; they hold only an Arc to the shared state.
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.queue_cv.notify_all();
    }
}

fn worker_loop(inner: &Inner) {
    loop {
        let queued = {
            let mut queue = inner.queue.lock().expect("lock poisoned");
            loop {
                if inner.stop.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                queue = inner.queue_cv.wait(queue).expect("lock poisoned");
            }
        };
        run_job(inner, queued);
    }
}

fn run_job(inner: &Inner, queued: QueuedJob) {
    let control = {
        let controls = inner.controls.lock().expect("lock poisoned");
        match controls.get(&queued.id) {
            Some(control) => Arc::clone(control),
            None => return,
        }
    };

    // Queued → running. Fails if the job was cancelled while waiting.
    let started = inner.registry.update(&queued.id, |j| {
        j.status = JobStatus::Running;
        j.message = "Starting".to_string();
    });
    if started.is_ok() {
        match execute_job(inner, &queued, &control) {
            Ok(outcome) => {
                let _ = inner.registry.update(&queued.id, |j| {
                    j.status = JobStatus::Success;
                    j.progress = 100;
                    j.message = format!(
                        "Completed: checkpoint {} (loss {:.4})",
                        outcome.checkpoint_id, outcome.loss
                    );
                });
                info!(
                    job_id = %queued.id,
                    checkpoint = %outcome.checkpoint_id,
                    loss = outcome.loss,
                    "training job succeeded"
                );
            }
            Err(err) => {
                // A watchdog or cancel may already have terminalized the
                // record; the update then fails and is deliberately ignored.
                let detail = control.abort_reason().unwrap_or_else(|| err.to_string());
                let _ = inner.registry.update(&queued.id, |j| {
                    j.status = JobStatus::Error;
                    j.message = "Failed".to_string();
                    j.error = Some(detail.clone());
                });
                error!(job_id = %queued.id, "training job failed: {detail}");
            }
        }
    }

    inner
        .controls
        .lock()
        .expect("lock poisoned")
        .remove(&queued.id);
}

struct JobOutcome {
    checkpoint_id: String,
    loss: f32,
}

fn execute_job(inner: &Inner, queued: &QueuedJob, control: &JobControl) -> Result<JobOutcome> {
    let registry = &inner.registry;
    let store = &*inner.store;
    let id = queued.id.as_str();

    // Phase 1: ingestion (progress 0–50).
    registry.update(id, |j| {
        j.progress = 1;
        j.message = "Persisting training text".to_string();
    })?;
    let normalized = alphabet::normalize(&queued.text);
    store.append_corpus(&normalized)?;
    control.checkpoint(registry, id)?;

    let symbols: Vec<char> = normalized.chars().collect();
    let total = symbols.len();
    let mut processed = 0usize;
    for (block_no, chunk) in symbols.chunks(queued.block_size).enumerate() {
        let block: String = chunk.iter().collect();
        crate::ngram::ingest_block(store, &block)?;
        processed += chunk.len();
        let pct = (50 * processed / total.max(1)) as u8;
        registry.update(id, |j| {
            j.progress = pct;
            j.message = format!(
                "Ingested block {} ({processed}/{total} symbols)",
                block_no + 1
            );
        })?;
        control.checkpoint(registry, id)?;
    }
    registry.update(id, |j| {
        j.progress = 50;
        j.message = "Ingestion complete".to_string();
    })?;

    // Phase 2: neural training (progress 50–100).
    let cfg = &inner.config.neural;
    let dataset = neural::build_dataset(store, cfg.window, queued.seed)?;

    let mut model = match store.best_checkpoint()? {
        Some(meta) => {
            let loaded = store
                .checkpoint_blob(&meta.id)
                .map_err(EngineError::from)
                .and_then(|blob| neural::decode(&blob, cfg));
            match loaded {
                Ok(decoded) => {
                    info!(job_id = id, checkpoint = %meta.id, "resuming from checkpoint");
                    decoded.model
                }
                Err(e) => {
                    warn!(job_id = id, "checkpoint {} unusable ({e}), training fresh", meta.id);
                    CharModel::new(cfg.clone(), queued.seed)
                }
            }
        }
        None => CharModel::new(cfg.clone(), queued.seed),
    };

    let opts = TrainOptions {
        epochs: queued.epochs,
        max_steps: (queued.block_size / TrainOptions::default().batch_size).max(1),
        seed: queued.seed,
        ..TrainOptions::default()
    };
    let mut observer = JobObserver {
        registry,
        control,
        job_id: id,
        last_pct: 50,
    };
    let summary = neural::train(&mut model, &dataset, &opts, &mut observer)?;

    // Publish: checkpoint row + blob, then swap the shared handle.
    registry.update(id, |j| {
        j.progress = 95;
        j.message = "Saving checkpoint".to_string();
    })?;
    let blob = neural::encode(&model, summary.epochs_run, summary.final_loss);
    let is_best = store
        .best_checkpoint()?
        .is_none_or(|b| summary.final_loss <= b.loss);
    let meta = store.put_checkpoint(
        NewCheckpoint {
            epochs: summary.epochs_run,
            block_size: queued.block_size,
            loss: summary.final_loss,
            accuracy: None,
            is_best,
        },
        &blob,
    )?;
    inner.model.swap(Arc::new(model));

    if inner.config.eval_samples > 0 {
        registry.update(id, |j| {
            j.progress = 99;
            j.message = "Running Monte Carlo evaluation".to_string();
        })?;
        // Quality telemetry only: a failure here never fails the job.
        match post_training_eval(inner, queued.seed) {
            Ok(report) => info!(
                job_id = id,
                mean_validity = report.mean_validity,
                std = report.std_deviation,
                "post-training evaluation complete"
            ),
            Err(e) => warn!(job_id = id, "post-training evaluation failed: {e}"),
        }
    }

    Ok(JobOutcome {
        checkpoint_id: meta.id,
        loss: summary.final_loss,
    })
}

fn post_training_eval(inner: &Inner, seed: u64) -> Result<EvalReport> {
    let table = NGramTable::load(&*inner.store)?;
    let model = inner.model.current();
    let generator = Generator::new(&table, model.as_deref(), &inner.validator);
    evaluate::run(
        &generator,
        &EvalOptions {
            samples: inner.config.eval_samples,
            params: GenerationParams {
                max_len: 200,
                temperature: 0.8,
                seed,
                ..GenerationParams::default()
            },
        },
    )
}

struct JobObserver<'a> {
    registry: &'a JobRegistry,
    control: &'a JobControl,
    job_id: &'a str,
    last_pct: u8,
}

impl TrainObserver for JobObserver<'_> {
    fn on_step(&mut self, p: &TrainProgress) -> Result<()> {
        self.control.beat();
        self.control.check_abort()?;
        let pct = (50 + 45 * p.step / p.total_steps.max(1)).min(95) as u8;
        if pct != self.last_pct {
            self.last_pct = pct;
            self.registry.update(self.job_id, |j| {
                j.progress = pct;
                j.message = format!(
                    "Epoch {}/{}, step {}/{}, loss {:.4}",
                    p.epoch + 1,
                    p.epochs,
                    p.step,
                    p.total_steps,
                    p.loss
                );
            })?;
        }
        Ok(())
    }

    fn on_epoch(&mut self, _stats: &neural::EpochStats) -> Result<()> {
        // Epoch boundaries are the training phase's safe suspension points.
        self.control.checkpoint(self.registry, self.job_id)
    }
}

fn watchdog_loop(inner: &Inner) {
    let timeout = inner.config.stall_timeout;
    let tick = (timeout / 4)
        .max(Duration::from_millis(10))
        .min(Duration::from_millis(200));
    loop {
        if inner.stop.load(Ordering::SeqCst) {
            return;
        }
        std::thread::sleep(tick);
        watchdog_pass(inner);
    }
}

/// One watchdog sweep: fail every running job whose heartbeat is stale.
fn watchdog_pass(inner: &Inner) {
    let controls: Vec<(String, Arc<JobControl>)> = inner
        .controls
        .lock()
        .expect("lock poisoned")
        .iter()
        .map(|(id, c)| (id.clone(), Arc::clone(c)))
        .collect();

    for (id, control) in controls {
        if !control.is_stalled(inner.config.stall_timeout) {
            continue;
        }
        let running = matches!(
            inner.registry.get(&id),
            Ok(Some(TrainingJob {
                status: JobStatus::Running,
                ..
            }))
        );
        if !running {
            continue;
        }
        let reason = format!(
            "no progress within {:?}, job presumed stalled",
            inner.config.stall_timeout
        );
        warn!(job_id = %id, "{reason}");
        let _ = inner.registry.update(&id, |j| {
            j.status = JobStatus::Error;
            j.message = "Timed out".to_string();
            j.error = Some(reason.clone());
        });
        control.abort(reason);
    }
}
