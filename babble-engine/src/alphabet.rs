//! Fixed 27-symbol alphabet and the text normalizer.
//!
//! Every component in this crate operates on uppercase A–Z plus the space
//! word separator. Raw input is mapped onto the alphabet by [`normalize`];
//! core entry points call [`check`] so that text which bypassed the
//! normalizer is rejected instead of silently accepted.

use crate::error::{EngineError, Result};

/// The alphabet, in index order. Index 26 is the word separator.
pub const SYMBOLS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ ";

/// Number of symbols in the alphabet.
pub const SIZE: usize = 27;

/// The word separator symbol.
pub const SEPARATOR: char = ' ';

/// Index of the word separator.
pub const SEPARATOR_IDX: usize = 26;

/// Map a symbol to its alphabet index.
pub fn index_of(c: char) -> Option<usize> {
    match c {
        'A'..='Z' => Some(c as usize - 'A' as usize),
        ' ' => Some(SEPARATOR_IDX),
        _ => None,
    }
}

/// Map an alphabet index back to its symbol.
///
/// # Panics
/// Panics if `idx >= SIZE`; indices are produced by this module and the
/// neural vocabulary, both of which are bounded by [`SIZE`].
pub fn symbol_at(idx: usize) -> char {
    SYMBOLS.as_bytes()[idx] as char
}

/// Map raw text onto the alphabet: uppercase, then drop every character
/// outside it. Characters with no uppercase mapping in A–Z (digits,
/// punctuation, accented letters) are dropped, not substituted.
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .flat_map(|c| c.to_uppercase())
        .filter(|c| index_of(*c).is_some())
        .collect()
}

/// Verify that `text` is entirely in-alphabet.
pub fn check(text: &str) -> Result<()> {
    match text.chars().find(|c| index_of(*c).is_none()) {
        None => Ok(()),
        Some(c) => Err(EngineError::InvalidArgument(format!(
            "out-of-alphabet symbol {c:?}; input must pass the normalizer"
        ))),
    }
}

/// Convert in-alphabet text to symbol indices.
pub fn to_indices(text: &str) -> Result<Vec<u8>> {
    text.chars()
        .map(|c| {
            index_of(c).map(|i| i as u8).ok_or_else(|| {
                EngineError::InvalidArgument(format!("out-of-alphabet symbol {c:?}"))
            })
        })
        .collect()
}
