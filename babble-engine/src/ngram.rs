//! N-gram frequency model: count extraction, batched persistence, and the
//! read-side probability table.
//!
//! Counts are kept for orders 2, 3 and 4 (bigram/trigram/tetragram). Writes
//! go to the storage collaborator in bounded batches; each batch commits
//! independently and is retried on its own, so a failing ingestion never
//! rolls back batches that already landed.
//!
//! The probability side returns a **uniform distribution for unseen
//! contexts** at every order independently. With sparse higher-order data
//! this fallback can dominate a blended distribution; that matches the
//! behavior this engine is specified to preserve, so callers tuning
//! generation quality should weight higher orders with that in mind.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::alphabet;
use crate::error::{EngineError, Result};
use crate::storage::{MAX_BATCH, NGramDelta, NGramKey, Store};

/// The n-gram orders this engine maintains.
pub const ORDERS: [u8; 3] = [2, 3, 4];

/// Attempts per batch before a storage failure aborts the ingestion step.
const WRITE_ATTEMPTS: usize = 3;

fn check_order(order: u8) -> Result<()> {
    if ORDERS.contains(&order) {
        Ok(())
    } else {
        Err(EngineError::InvalidArgument(format!(
            "n-gram order must be one of {ORDERS:?}, got {order}"
        )))
    }
}

/// Count every (context, next-symbol) observation in `text` for the
/// requested orders, sliding a window of `order` symbols over the text.
///
/// The text must be normalized; the orders must come from [`ORDERS`].
pub fn extract_counts(text: &str, orders: &[u8]) -> Result<HashMap<NGramKey, u64>> {
    alphabet::check(text)?;
    for &order in orders {
        check_order(order)?;
    }

    let chars: Vec<char> = text.chars().collect();
    let mut counts: HashMap<NGramKey, u64> = HashMap::new();
    for &order in orders {
        let n = order as usize;
        if chars.len() < n {
            continue;
        }
        for i in 0..=chars.len() - n {
            let key = NGramKey {
                order,
                context: chars[i..i + n - 1].iter().collect(),
                next: chars[i + n - 1],
            };
            *counts.entry(key).or_insert(0) += 1;
        }
    }
    Ok(counts)
}

/// Figures from one ingested block.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestStats {
    /// Distinct (order, context, next) keys touched.
    pub keys: usize,
    /// Total observations recorded.
    pub observations: u64,
    /// Batches written.
    pub batches: usize,
}

/// Ingest one normalized text block for all maintained orders.
pub fn ingest_block(store: &dyn Store, text: &str) -> Result<IngestStats> {
    ingest(store, text, &ORDERS)
}

/// Ingest one normalized text block: extract counts for the requested
/// orders and write them as independently committed batches of at most
/// [`MAX_BATCH`] keys.
///
/// The model does not deduplicate: re-ingesting the same block doubles its
/// counts. Exactly-once ingestion is the caller's responsibility.
pub fn ingest(store: &dyn Store, text: &str, orders: &[u8]) -> Result<IngestStats> {
    let counts = extract_counts(text, orders)?;

    // Deterministic batch layout, so a partially failed ingestion commits a
    // well-defined prefix.
    let mut deltas: Vec<NGramDelta> = counts
        .into_iter()
        .map(|(key, count)| NGramDelta { key, count })
        .collect();
    deltas.sort_by(|a, b| {
        (a.key.order, &a.key.context, a.key.next).cmp(&(b.key.order, &b.key.context, b.key.next))
    });

    let mut stats = IngestStats {
        keys: deltas.len(),
        observations: deltas.iter().map(|d| d.count).sum(),
        batches: 0,
    };
    for batch in deltas.chunks(MAX_BATCH) {
        write_batch(store, batch)?;
        stats.batches += 1;
    }

    debug!(
        keys = stats.keys,
        observations = stats.observations,
        batches = stats.batches,
        "n-gram block ingested"
    );
    Ok(stats)
}

fn write_batch(store: &dyn Store, batch: &[NGramDelta]) -> Result<()> {
    let mut last_err = None;
    for attempt in 1..=WRITE_ATTEMPTS {
        match store.increment_ngrams(batch) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt, max = WRITE_ATTEMPTS, "n-gram batch write failed: {e}");
                last_err = Some(e);
            }
        }
    }
    // last_err is always set here: the loop ran WRITE_ATTEMPTS >= 1 times.
    Err(EngineError::Persistence(last_err.unwrap()))
}

/// Read-only in-memory snapshot of the persisted counts, loaded once per
/// generation session. Training jobs mutate the store, not this table.
pub struct NGramTable {
    tables: [HashMap<String, [u64; alphabet::SIZE]>; ORDERS.len()],
}

impl NGramTable {
    /// An empty table: every context falls back to the uniform distribution.
    pub fn empty() -> Self {
        Self {
            tables: [HashMap::new(), HashMap::new(), HashMap::new()],
        }
    }

    /// Load all three orders from the store.
    pub fn load(store: &dyn Store) -> Result<Self> {
        let mut table = Self::empty();
        for (slot, &order) in ORDERS.iter().enumerate() {
            for record in store.ngram_counts(order)? {
                let Some(sym) = alphabet::index_of(record.key.next) else {
                    continue;
                };
                table.tables[slot]
                    .entry(record.key.context)
                    .or_insert([0; alphabet::SIZE])[sym] += record.count;
            }
        }
        Ok(table)
    }

    /// Number of distinct contexts held for one order.
    pub fn context_count(&self, order: u8) -> Result<usize> {
        check_order(order)?;
        Ok(self.tables[(order - 2) as usize].len())
    }

    /// Normalized next-symbol distribution for `context` under `order`.
    ///
    /// `context` must be exactly `order - 1` in-alphabet symbols. A context
    /// with zero observations yields the uniform distribution (1/27
    /// everywhere) rather than an error. This is the documented fallback.
    pub fn probabilities(&self, order: u8, context: &str) -> Result<[f32; alphabet::SIZE]> {
        check_order(order)?;
        alphabet::check(context)?;
        if context.chars().count() != (order - 1) as usize {
            return Err(EngineError::InvalidArgument(format!(
                "order-{order} context must be {} symbols, got {:?}",
                order - 1,
                context
            )));
        }

        let uniform = [1.0 / alphabet::SIZE as f32; alphabet::SIZE];
        let Some(counts) = self.tables[(order - 2) as usize].get(context) else {
            return Ok(uniform);
        };
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return Ok(uniform);
        }
        let mut probs = [0.0f32; alphabet::SIZE];
        for (p, &c) in probs.iter_mut().zip(counts.iter()) {
            *p = c as f32 / total as f32;
        }
        Ok(probs)
    }
}
