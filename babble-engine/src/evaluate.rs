//! Monte Carlo quality evaluation.
//!
//! Runs N seeded generations and scores each for word validity, reporting
//! distribution statistics. Sample `i` uses `base seed + i`, so a report is
//! fully reproducible from its options.

use serde::Serialize;
use tracing::info;

use crate::error::{EngineError, Result};
use crate::generate::{GenerationParams, Generator};

/// Options for one evaluation run.
#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// Number of generations to sample.
    pub samples: usize,
    /// Generation parameters; `seed` is the base seed.
    pub params: GenerationParams,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            samples: 50,
            params: GenerationParams::default(),
        }
    }
}

/// Statistics over per-sample validity percentages.
#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub samples: usize,
    pub mean_validity: f32,
    pub median_validity: f32,
    pub std_deviation: f32,
    pub min_validity: f32,
    pub max_validity: f32,
    /// Ten buckets: [0–10), [10–20), …, [90–100].
    pub histogram: [u32; 10],
    pub per_sample: Vec<f32>,
}

/// Run the evaluation against an immutable generator snapshot.
pub fn run(generator: &Generator<'_>, opts: &EvalOptions) -> Result<EvalReport> {
    if opts.samples == 0 {
        return Err(EngineError::InvalidArgument(
            "evaluation needs at least one sample".to_string(),
        ));
    }

    let mut per_sample = Vec::with_capacity(opts.samples);
    for i in 0..opts.samples {
        let mut params = opts.params.clone();
        params.seed = opts.params.seed.wrapping_add(i as u64);
        let result = generator.generate(&params)?;

        let total = result.valid_mask.len();
        let valid = result.valid_mask.iter().filter(|&&v| v).count();
        let pct = if total == 0 {
            0.0
        } else {
            valid as f32 / total as f32 * 100.0
        };
        per_sample.push(pct);
    }

    let n = per_sample.len() as f32;
    let mean = per_sample.iter().sum::<f32>() / n;
    let variance = per_sample.iter().map(|&p| (p - mean).powi(2)).sum::<f32>() / n;

    let mut sorted = per_sample.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let median = if sorted.len() % 2 == 0 {
        (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2.0
    } else {
        sorted[sorted.len() / 2]
    };

    let mut histogram = [0u32; 10];
    for &pct in &per_sample {
        let bucket = ((pct / 10.0) as usize).min(9);
        histogram[bucket] += 1;
    }

    let report = EvalReport {
        samples: per_sample.len(),
        mean_validity: mean,
        median_validity: median,
        std_deviation: variance.sqrt(),
        min_validity: sorted[0],
        max_validity: sorted[sorted.len() - 1],
        histogram,
        per_sample,
    };
    info!(
        samples = report.samples,
        mean = report.mean_validity,
        std = report.std_deviation,
        "evaluation complete"
    );
    Ok(report)
}
