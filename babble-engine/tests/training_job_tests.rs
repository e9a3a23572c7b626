use std::sync::Arc;
use std::time::{Duration, Instant};

use babble_engine::storage::Store;
use babble_engine::{
    GenerationParams, JobStatus, MemoryStore, NeuralConfig, TrainRequest, Trainer, TrainerConfig,
    TrainingJob, WordValidator,
};

fn tiny_neural() -> NeuralConfig {
    NeuralConfig {
        window: 4,
        embed_dim: 4,
        conv_channels: 5,
        kernel: 3,
        hidden_dim: 3,
        ff_hidden: 6,
        dropout: 0.1,
    }
}

fn test_config(workers: usize) -> TrainerConfig {
    TrainerConfig {
        workers,
        default_block_size: 256,
        stall_timeout: Duration::from_secs(60),
        eval_samples: 0,
        neural: tiny_neural(),
    }
}

fn new_trainer(store: Arc<MemoryStore>, workers: usize) -> Trainer {
    Trainer::new(store, WordValidator::builtin(), test_config(workers)).unwrap()
}

fn wait_terminal(trainer: &Trainer, id: &str) -> TrainingJob {
    wait_for(trainer, id, |j| j.status.is_terminal())
}

fn wait_for(trainer: &Trainer, id: &str, pred: impl Fn(&TrainingJob) -> bool) -> TrainingJob {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let job = trainer.job(id).unwrap().expect("job record missing");
        if pred(&job) {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting on job {id}: {job:?}"
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_small_corpus_job_reaches_success() {
    // Corpus far below the minimum dataset size: the synthetic fallback
    // must carry training to success, not error.
    let store = Arc::new(MemoryStore::new());
    let trainer = new_trainer(Arc::clone(&store), 1);

    let id = trainer
        .submit(TrainRequest {
            epochs: 2,
            seed: 3,
            ..TrainRequest::new("hello world!")
        })
        .unwrap();
    let job = wait_terminal(&trainer, &id);

    assert_eq!(job.status, JobStatus::Success, "job failed: {:?}", job.error);
    assert_eq!(job.progress, 100);
    assert!(job.message.contains("Completed"));
    assert!(job.error.is_none());

    // A checkpoint was published and flagged best.
    let best = store.best_checkpoint().unwrap().unwrap();
    assert_eq!(best.epochs, 2);
    assert!(best.loss.is_finite());

    // The normalized corpus entry landed.
    let corpus = store.list_corpus(10).unwrap();
    assert_eq!(corpus.len(), 1);
    assert_eq!(corpus[0].content, "HELLO WORLD");
}

#[test]
fn test_generation_uses_trained_model() {
    let store = Arc::new(MemoryStore::new());
    let trainer = new_trainer(store, 1);

    let id = trainer
        .submit(TrainRequest {
            epochs: 1,
            ..TrainRequest::new("THE CAT SAT ON THE MAT")
        })
        .unwrap();
    assert_eq!(wait_terminal(&trainer, &id).status, JobStatus::Success);
    assert!(trainer.model_handle().current().is_some());

    let params = GenerationParams {
        prompt: "THE ".to_string(),
        max_len: 24,
        neural_weight: 0.5,
        seed: 42,
        ..GenerationParams::default()
    };
    let a = trainer.generate(&params).unwrap();
    let b = trainer.generate(&params).unwrap();
    assert_eq!(a.text, b.text, "fixed seed must be byte-identical");
    assert_eq!(a.text.chars().count(), 4 + 24);
    assert_eq!(a.valid_mask.len(), a.text.split_whitespace().count());
}

#[test]
fn test_jobs_queue_beyond_worker_limit() {
    let store = Arc::new(MemoryStore::new());
    let trainer = new_trainer(store, 1);

    let ids: Vec<String> = (0..3)
        .map(|i| {
            trainer
                .submit(TrainRequest {
                    epochs: 1,
                    seed: i,
                    ..TrainRequest::new("QUEUED WORK")
                })
                .unwrap()
        })
        .collect();

    for id in &ids {
        assert_eq!(wait_terminal(&trainer, id).status, JobStatus::Success);
    }
}

#[test]
fn test_concurrent_jobs_accumulate_counts() {
    let store = Arc::new(MemoryStore::new());
    let trainer = new_trainer(Arc::clone(&store), 2);

    let a = trainer
        .submit(TrainRequest {
            epochs: 1,
            ..TrainRequest::new("THE THE THE")
        })
        .unwrap();
    let b = trainer
        .submit(TrainRequest {
            epochs: 1,
            seed: 1,
            ..TrainRequest::new("THE THE THE")
        })
        .unwrap();
    assert_eq!(wait_terminal(&trainer, &a).status, JobStatus::Success);
    assert_eq!(wait_terminal(&trainer, &b).status, JobStatus::Success);

    // Both ingestions of the same text must have accumulated, not raced.
    let counts = store.ngram_counts(2).unwrap();
    let th = counts
        .iter()
        .find(|r| r.key.context == "T" && r.key.next == 'H')
        .unwrap();
    assert_eq!(th.count, 6); // 3 per ingestion, twice
}

#[test]
fn test_pause_shows_paused_then_resumes_to_success() {
    let store = Arc::new(MemoryStore::new());
    let trainer = new_trainer(store, 1);

    // Occupy the single worker, then pause the second job while it is
    // still queued; it parks at its first safe point once it starts.
    let first = trainer
        .submit(TrainRequest {
            epochs: 3,
            ..TrainRequest::new("BUSY WORKER")
        })
        .unwrap();
    let second = trainer
        .submit(TrainRequest {
            epochs: 1,
            ..TrainRequest::new("PAUSED JOB")
        })
        .unwrap();
    trainer.pause(&second).unwrap();

    let paused = wait_for(&trainer, &second, |j| j.status == JobStatus::Paused);
    assert_eq!(paused.message, "Paused");
    assert_eq!(wait_terminal(&trainer, &first).status, JobStatus::Success);

    // Still paused while the worker sits parked.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(
        trainer.job(&second).unwrap().unwrap().status,
        JobStatus::Paused
    );

    trainer.resume(&second).unwrap();
    assert_eq!(wait_terminal(&trainer, &second).status, JobStatus::Success);
}

#[test]
fn test_cancel_paused_job_goes_to_error() {
    let store = Arc::new(MemoryStore::new());
    let trainer = new_trainer(store, 1);

    let first = trainer
        .submit(TrainRequest {
            epochs: 3,
            ..TrainRequest::new("BUSY WORKER")
        })
        .unwrap();
    let second = trainer
        .submit(TrainRequest {
            epochs: 1,
            ..TrainRequest::new("DOOMED JOB")
        })
        .unwrap();
    trainer.pause(&second).unwrap();
    wait_for(&trainer, &second, |j| j.status == JobStatus::Paused);

    trainer.cancel(&second).unwrap();
    let job = wait_terminal(&trainer, &second);
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.error.as_deref(), Some("cancelled by request"));

    let _ = wait_terminal(&trainer, &first);
}

#[test]
fn test_pause_resume_preserves_loss_trajectory() {
    // The same two jobs, once with a pause in the middle and once without,
    // must publish byte-identical final checkpoints.
    fn run(pause: bool) -> Vec<u8> {
        let store = Arc::new(MemoryStore::new());
        let trainer = new_trainer(Arc::clone(&store), 1);

        let warmup = trainer
            .submit(TrainRequest {
                epochs: 3,
                seed: 1,
                ..TrainRequest::new("WARMUP CORPUS TEXT")
            })
            .unwrap();
        let main = trainer
            .submit(TrainRequest {
                epochs: 2,
                seed: 7,
                ..TrainRequest::new("MAIN CORPUS TEXT")
            })
            .unwrap();
        if pause {
            trainer.pause(&main).unwrap();
            wait_for(&trainer, &main, |j| j.status == JobStatus::Paused);
            std::thread::sleep(Duration::from_millis(50));
            trainer.resume(&main).unwrap();
        }
        assert_eq!(wait_terminal(&trainer, &warmup).status, JobStatus::Success);
        assert_eq!(wait_terminal(&trainer, &main).status, JobStatus::Success);

        let latest = store.latest_checkpoint().unwrap().unwrap();
        store.checkpoint_blob(&latest.id).unwrap()
    }

    assert_eq!(run(true), run(false));
}

#[test]
fn test_reset_clears_engine_state() {
    let store = Arc::new(MemoryStore::new());
    let trainer = new_trainer(Arc::clone(&store), 1);

    let id = trainer
        .submit(TrainRequest {
            epochs: 1,
            ..TrainRequest::new("SOON TO BE FORGOTTEN")
        })
        .unwrap();
    assert_eq!(wait_terminal(&trainer, &id).status, JobStatus::Success);

    trainer.reset().unwrap();
    assert_eq!(store.corpus_stats().unwrap().entries, 0);
    assert!(store.best_checkpoint().unwrap().is_none());
    assert!(trainer.model_handle().current().is_none());

    // Generation still works, riding the uniform fallback.
    let result = trainer
        .generate(&GenerationParams {
            max_len: 10,
            neural_weight: 0.0,
            seed: 2,
            ..GenerationParams::default()
        })
        .unwrap();
    assert_eq!(result.text.chars().count(), 10);
}

#[test]
fn test_shutdown_finishes_running_work() {
    let store = Arc::new(MemoryStore::new());
    let trainer = new_trainer(store, 2);
    let id = trainer
        .submit(TrainRequest {
            epochs: 1,
            ..TrainRequest::new("LAST JOB")
        })
        .unwrap();
    let job = wait_terminal(&trainer, &id);
    assert_eq!(job.status, JobStatus::Success);
    trainer.shutdown();
}
