//! Word validation with a layered dictionary strategy.
//!
//! Three tiers, fixed priority: a rich dictionary word list, a
//! word-frequency list with a Zipf threshold, and an embedded common-word
//! allow-list that is always available. The tier is chosen once at
//! construction (whichever resource loads first wins), so a validator
//! never has zero strategies and answers are stable for a given word.
//!
//! Tokens are judged independently: scoring never looks at neighboring
//! tokens.

use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::path::Path;

use tracing::warn;

/// Words of one or two letters that count as valid despite their length.
const ALLOWED_SHORT: &[&str] = &[
    "a", "i", "an", "in", "on", "to", "of", "is", "as", "at", "be", "he", "we", "us", "it", "or",
    "by",
];

/// Embedded lowest-tier allow-list.
const COMMON_WORDS: &[&str] = &[
    "the", "and", "to", "of", "in", "a", "that", "is", "it", "for", "on", "with", "as", "at",
    "by", "an", "be", "this", "was", "are", "been", "have", "had", "were", "said", "each",
    "which", "she", "do", "how", "their", "if", "will", "up", "other", "about", "out", "many",
    "then", "them", "these", "so", "some", "her", "would", "make", "like", "him", "into", "time",
    "has", "look", "two", "more", "write", "go",
];

/// Zipf frequency at or above which a word counts as valid (tier 2).
const ZIPF_THRESHOLD: f32 = 3.3;

/// Strip everything but letters and apostrophes, lowercase the rest.
fn clean_word(word: &str) -> String {
    word.chars()
        .filter(|c| c.is_ascii_alphabetic() || *c == '\'')
        .collect::<String>()
        .to_lowercase()
}

fn short_word_allowed(word: &str) -> bool {
    word.chars().count() > 2 || ALLOWED_SHORT.contains(&word)
}

/// One validation tier.
pub trait ValidationStrategy: Send + Sync {
    fn is_valid(&self, word: &str) -> bool;
    fn name(&self) -> &'static str;
}

/// Tier 1: a dictionary word list, one word per line.
pub struct DictionaryList {
    words: HashSet<String>,
}

impl DictionaryList {
    /// Load a word list. Blank lines and `#` comments are skipped.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let mut words = HashSet::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            words.insert(line.to_lowercase());
        }
        Ok(Self { words })
    }
}

impl ValidationStrategy for DictionaryList {
    fn is_valid(&self, word: &str) -> bool {
        let clean = clean_word(word);
        !clean.is_empty() && short_word_allowed(&clean) && self.words.contains(&clean)
    }

    fn name(&self) -> &'static str {
        "dictionary"
    }
}

/// Tier 2: a word-frequency list (`word\tzipf` per line); a word is valid
/// when its Zipf frequency clears [`ZIPF_THRESHOLD`].
pub struct FrequencyList {
    zipf: HashMap<String, f32>,
}

impl FrequencyList {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let mut zipf = HashMap::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split('\t');
            let (Some(word), Some(freq)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(freq) = freq.parse::<f32>() else {
                continue;
            };
            zipf.insert(word.to_lowercase(), freq);
        }
        Ok(Self { zipf })
    }
}

impl ValidationStrategy for FrequencyList {
    fn is_valid(&self, word: &str) -> bool {
        let clean = clean_word(word);
        if clean.is_empty() || !short_word_allowed(&clean) {
            return false;
        }
        self.zipf
            .get(&clean)
            .is_some_and(|&freq| freq >= ZIPF_THRESHOLD)
    }

    fn name(&self) -> &'static str {
        "frequency"
    }
}

/// Tier 3: the embedded allow-list. Always available.
pub struct CommonWords {
    words: HashSet<&'static str>,
}

impl CommonWords {
    pub fn new() -> Self {
        let words = COMMON_WORDS
            .iter()
            .chain(ALLOWED_SHORT.iter())
            .copied()
            .collect();
        Self { words }
    }
}

impl Default for CommonWords {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationStrategy for CommonWords {
    fn is_valid(&self, word: &str) -> bool {
        self.words.contains(clean_word(word).as_str())
    }

    fn name(&self) -> &'static str {
        "common-words"
    }
}

/// Per-token validity over a whitespace-tokenized text.
#[derive(Debug, Clone, PartialEq)]
pub struct TextScore {
    pub mask: Vec<bool>,
    pub valid: usize,
    pub total: usize,
}

impl TextScore {
    /// Percentage of valid tokens; an empty text scores 100.
    pub fn validity_percent(&self) -> f32 {
        if self.total == 0 {
            100.0
        } else {
            self.valid as f32 / self.total as f32 * 100.0
        }
    }
}

/// The word validator: one active tier chosen at construction.
pub struct WordValidator {
    strategy: Box<dyn ValidationStrategy>,
}

impl WordValidator {
    /// Pick the highest-priority tier whose resource loads; failures are
    /// logged and fall through to the next tier.
    pub fn with_resources(dict_path: Option<&Path>, freq_path: Option<&Path>) -> Self {
        if let Some(path) = dict_path {
            match DictionaryList::load(path) {
                Ok(dict) => return Self::with_strategy(Box::new(dict)),
                Err(e) => warn!("dictionary list {path:?} unavailable: {e}"),
            }
        }
        if let Some(path) = freq_path {
            match FrequencyList::load(path) {
                Ok(freq) => return Self::with_strategy(Box::new(freq)),
                Err(e) => warn!("frequency list {path:?} unavailable: {e}"),
            }
        }
        Self::builtin()
    }

    /// The guaranteed lowest tier.
    pub fn builtin() -> Self {
        Self::with_strategy(Box::new(CommonWords::new()))
    }

    pub fn with_strategy(strategy: Box<dyn ValidationStrategy>) -> Self {
        Self { strategy }
    }

    /// Name of the active tier.
    pub fn tier(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn is_valid(&self, word: &str) -> bool {
        self.strategy.is_valid(word)
    }

    /// Tokenize on whitespace and judge each token independently.
    pub fn score_text(&self, text: &str) -> TextScore {
        let mask: Vec<bool> = text
            .split_whitespace()
            .map(|w| self.is_valid(w))
            .collect();
        let valid = mask.iter().filter(|&&v| v).count();
        let total = mask.len();
        TextScore { mask, valid, total }
    }
}
