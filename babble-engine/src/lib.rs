//! Hybrid character-sequence generation engine.
//!
//! Generates text over a fixed 27-symbol alphabet by blending an n-gram
//! frequency model with a learned neural character model, trained
//! incrementally on an accumulating corpus through asynchronous training
//! jobs. Storage is an external collaborator behind the [`storage::Store`]
//! contract; two reference stores ship with the crate.

pub mod alphabet;
pub mod error;
pub mod evaluate;
pub mod generate;
pub mod jobs;
pub mod neural;
pub mod ngram;
pub mod orchestrator;
pub mod storage;
pub mod validator;

pub use error::{EngineError, Result};
pub use evaluate::{EvalOptions, EvalReport};
pub use generate::{GenerationParams, GenerationResult, Generator};
pub use jobs::{JobRegistry, JobStatus, TrainingJob};
pub use neural::{CharModel, ModelHandle, NeuralConfig};
pub use ngram::NGramTable;
pub use orchestrator::{TrainRequest, Trainer, TrainerConfig};
pub use storage::{FileStore, MemoryStore, Store};
pub use validator::WordValidator;
