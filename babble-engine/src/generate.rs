//! Hybrid generation: blends the n-gram distributions with the neural
//! model's, applies temperature and optional top-p truncation, and samples
//! with a caller-supplied seed.
//!
//! Stateless request/response: a [`Generator`] only borrows immutable
//! models, so any number of generations may run concurrently with each
//! other and with in-progress training.

use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::alphabet;
use crate::error::{EngineError, Result};
use crate::neural::CharModel;
use crate::ngram::{NGramTable, ORDERS};
use crate::validator::WordValidator;

const SIZE: usize = alphabet::SIZE;

/// Parameters of one generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Normalized starting prompt; may be empty.
    #[serde(default)]
    pub prompt: String,
    /// Number of symbols to generate after the prompt.
    pub max_len: usize,
    /// Sampling temperature; must be > 0.
    pub temperature: f32,
    /// Optional nucleus truncation in [0, 1].
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Neural blend weight α in [0, 1].
    pub neural_weight: f32,
    pub bigram_weight: f32,
    pub trigram_weight: f32,
    pub tetragram_weight: f32,
    /// RNG seed; fixed seed + fixed inputs ⇒ byte-identical output.
    pub seed: u64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            max_len: 100,
            temperature: 1.0,
            top_p: None,
            neural_weight: 0.5,
            bigram_weight: 0.2,
            trigram_weight: 0.3,
            tetragram_weight: 0.5,
            seed: 0,
        }
    }
}

/// Output of one generation request.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Prompt plus generated symbols.
    pub text: String,
    /// Per whitespace-delimited token validity, over the full text.
    pub valid_mask: Vec<bool>,
    /// The parameters that produced this result.
    pub params: GenerationParams,
}

/// Stateless generation over immutable model snapshots.
pub struct Generator<'a> {
    table: &'a NGramTable,
    model: Option<&'a CharModel>,
    validator: &'a WordValidator,
}

impl<'a> Generator<'a> {
    pub fn new(
        table: &'a NGramTable,
        model: Option<&'a CharModel>,
        validator: &'a WordValidator,
    ) -> Self {
        Self {
            table,
            model,
            validator,
        }
    }

    pub fn generate(&self, params: &GenerationParams) -> Result<GenerationResult> {
        validate_params(params)?;

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut text = params.prompt.clone();
        for _ in 0..params.max_len {
            let blended = self.next_distribution(&text, params)?;
            let mut dist = apply_temperature(&blended, params.temperature);
            if let Some(top_p) = params.top_p {
                dist = apply_top_p(dist, top_p);
            }
            let sym = sample(&dist, &mut rng);
            text.push(alphabet::symbol_at(sym));
        }

        let score = self.validator.score_text(&text);
        Ok(GenerationResult {
            text,
            valid_mask: score.mask,
            params: params.clone(),
        })
    }

    /// The blended, un-tempered distribution for the next symbol.
    fn next_distribution(&self, context: &str, params: &GenerationParams) -> Result<[f32; SIZE]> {
        let weights = [
            params.bigram_weight,
            params.trigram_weight,
            params.tetragram_weight,
        ];
        let ctx_chars: Vec<char> = context.chars().collect();

        // Weighted markov mixture over the orders the context can feed.
        // Dividing by the participating weight total renormalizes the
        // caller's weights to sum to 1.
        let mut markov = [0.0f32; SIZE];
        let mut used_weight = 0.0f32;
        for (weight, &order) in weights.into_iter().zip(ORDERS.iter()) {
            let need = (order - 1) as usize;
            if weight <= 0.0 || ctx_chars.len() < need {
                continue;
            }
            let ctx: String = ctx_chars[ctx_chars.len() - need..].iter().collect();
            let probs = self.table.probabilities(order, &ctx)?;
            for (m, p) in markov.iter_mut().zip(probs) {
                *m += weight * p;
            }
            used_weight += weight;
        }
        if used_weight > 0.0 {
            for m in markov.iter_mut() {
                *m /= used_weight;
            }
        }

        let alpha = params.neural_weight;
        let mut blended = [0.0f32; SIZE];
        let neural = match self.model {
            Some(model) if alpha > 0.0 => Some(model.predict(context)?),
            _ => None,
        };
        for i in 0..SIZE {
            let n = neural.as_ref().map_or(0.0, |probs| probs[i]);
            blended[i] = (1.0 - alpha) * markov[i] + alpha * n;
        }

        // Zero mass cannot happen while the n-gram uniform fallback holds,
        // but a division by zero downstream would be worse than a uniform
        // draw, so handle it.
        let total: f32 = blended.iter().sum();
        if total <= f32::EPSILON {
            return Ok([1.0 / SIZE as f32; SIZE]);
        }
        Ok(blended)
    }
}

fn validate_params(params: &GenerationParams) -> Result<()> {
    if !(params.temperature > 0.0) || !params.temperature.is_finite() {
        return Err(EngineError::InvalidArgument(format!(
            "temperature must be > 0, got {}",
            params.temperature
        )));
    }
    if !(0.0..=1.0).contains(&params.neural_weight) {
        return Err(EngineError::InvalidArgument(format!(
            "neural_weight must be in [0, 1], got {}",
            params.neural_weight
        )));
    }
    for (name, w) in [
        ("bigram_weight", params.bigram_weight),
        ("trigram_weight", params.trigram_weight),
        ("tetragram_weight", params.tetragram_weight),
    ] {
        if !w.is_finite() || w < 0.0 {
            return Err(EngineError::InvalidArgument(format!(
                "{name} must be a non-negative number, got {w}"
            )));
        }
    }
    if let Some(top_p) = params.top_p {
        if !(0.0..=1.0).contains(&top_p) {
            return Err(EngineError::InvalidArgument(format!(
                "top_p must be in [0, 1], got {top_p}"
            )));
        }
    }
    if params.max_len == 0 {
        return Err(EngineError::InvalidArgument(
            "max_len must be at least 1".to_string(),
        ));
    }
    alphabet::check(&params.prompt)
}

/// Rescale by `p^(1/T)` in log space and renormalize. T → 0 approaches
/// arg-max; T = 1 leaves relative masses unchanged; T > 1 flattens.
fn apply_temperature(dist: &[f32; SIZE], temperature: f32) -> [f32; SIZE] {
    let mut logs = [0.0f32; SIZE];
    for (l, &p) in logs.iter_mut().zip(dist) {
        *l = p.clamp(1e-10, 1.0).ln() / temperature;
    }
    let max = logs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for l in logs.iter_mut() {
        *l = (*l - max).exp();
        sum += *l;
    }
    for l in logs.iter_mut() {
        *l /= sum;
    }
    logs
}

/// Keep the smallest set of highest-probability symbols whose cumulative
/// mass reaches `top_p`; renormalize over the kept set.
fn apply_top_p(mut dist: [f32; SIZE], top_p: f32) -> [f32; SIZE] {
    if top_p >= 1.0 {
        return dist;
    }
    let mut order: Vec<usize> = (0..SIZE).collect();
    order.sort_by(|&a, &b| dist[b].partial_cmp(&dist[a]).unwrap_or(Ordering::Equal));

    let mut keep = [false; SIZE];
    let mut cum = 0.0;
    for &i in &order {
        keep[i] = true;
        cum += dist[i];
        if cum >= top_p {
            break;
        }
    }

    let mut sum = 0.0;
    for (i, d) in dist.iter_mut().enumerate() {
        if keep[i] {
            sum += *d;
        } else {
            *d = 0.0;
        }
    }
    for d in dist.iter_mut() {
        *d /= sum;
    }
    dist
}

/// Cumulative-scan weighted sampling.
fn sample(dist: &[f32; SIZE], rng: &mut StdRng) -> usize {
    let total: f32 = dist.iter().sum();
    let mut r = rng.random::<f32>() * total;
    let mut fallback = 0;
    for (i, &p) in dist.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        if r < p {
            return i;
        }
        r -= p;
        fallback = i;
    }
    // Floating point drift past the last bucket lands here.
    fallback
}
