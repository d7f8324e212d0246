//! Dense position keys for the replicated sequence.
//!
//! A [`Position`] is a printable string compared by code point. Between any
//! two distinct positions another one can always be allocated, so inserting
//! at an arbitrary place never renumbers existing elements.
//!
//! ```text
//!   prev = "M"          next = "N"
//!   ─────────────────────────────────
//!   i=0   'M'(77)  vs  'N'(78)   → adjacent, emit 'M', upper bound released
//!   i=1   ' '(32)  vs  '\x7f'    → emit midpoint 'O'(79)
//!   key  = "MO"        "M" < "MO" < "N"
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Smallest code point a position may contain (space).
pub const ALPHABET_MIN: u32 = 0x20;
/// Largest code point a position may contain (tilde).
pub const ALPHABET_MAX: u32 = 0x7e;

/// Allocation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PositionError {
    /// Bounds are not strictly ordered.
    #[error("lower bound {prev:?} is not below upper bound {next:?}")]
    InvalidBounds { prev: String, next: String },
    /// A bound contains a character outside the position alphabet.
    #[error("position {0:?} contains a character outside the printable alphabet")]
    OutOfAlphabet(String),
}

/// An allocator-produced sort key. Immutable once assigned to an element.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(String);

impl Position {
    /// Allocate a position strictly between two neighbors.
    ///
    /// `None` stands for the document start (as `prev`) or end (as `next`).
    pub fn between(prev: Option<&Position>, next: Option<&Position>) -> Result<Self, PositionError> {
        let prev = prev.map_or("", |p| p.as_str());
        let next = next.map_or("", |p| p.as_str());
        alloc(prev, next).map(Position)
    }

    /// Wrap a raw key received from a peer.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this key could have come from [`alloc`]: non-empty, inside
    /// the printable alphabet, and not ending in [`ALPHABET_MIN`].
    ///
    /// A trailing minimum would leave no room for a key just below it.
    pub fn is_well_formed(&self) -> bool {
        in_alphabet(&self.0)
            && self
                .0
                .chars()
                .last()
                .is_some_and(|c| u32::from(c) != ALPHABET_MIN)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn in_alphabet(key: &str) -> bool {
    key.chars()
        .all(|c| (ALPHABET_MIN..=ALPHABET_MAX).contains(&u32::from(c)))
}

/// Return a key `k` with `prev < k < next`.
///
/// An empty `prev` means "no lower bound" and an empty `next` means "no upper
/// bound". A character missing from `prev` counts as [`ALPHABET_MIN`]; one
/// missing from `next` counts as one past [`ALPHABET_MAX`].
pub fn alloc(prev: &str, next: &str) -> Result<String, PositionError> {
    if !in_alphabet(prev) {
        return Err(PositionError::OutOfAlphabet(prev.to_string()));
    }
    if !in_alphabet(next) {
        return Err(PositionError::OutOfAlphabet(next.to_string()));
    }
    if !next.is_empty() && (prev >= next || !has_gap(prev, next)) {
        return Err(PositionError::InvalidBounds {
            prev: prev.to_string(),
            next: next.to_string(),
        });
    }

    let lower: Vec<u32> = prev.chars().map(u32::from).collect();
    let upper: Vec<u32> = next.chars().map(u32::from).collect();
    let unbounded = ALPHABET_MAX + 1;

    let mut key = String::with_capacity(lower.len().max(upper.len()) + 1);
    // Set once the emitted prefix is already below `next`.
    let mut released = false;
    let mut i = 0;

    loop {
        let lo = lower.get(i).copied().unwrap_or(ALPHABET_MIN);
        let hi = if released {
            unbounded
        } else {
            upper.get(i).copied().unwrap_or(unbounded)
        };

        if hi > lo + 1 {
            push_code(&mut key, (lo + hi) / 2);
            return Ok(key);
        }
        if hi == lo + 1 {
            released = true;
        }
        push_code(&mut key, lo);
        i += 1;
    }
}

/// Whether some key sorts strictly between `prev < next`.
///
/// The only ordered pairs without one are `next == prev + ' '...`.
fn has_gap(prev: &str, next: &str) -> bool {
    match next.strip_prefix(prev) {
        Some(rest) => rest.chars().any(|c| u32::from(c) != ALPHABET_MIN),
        None => true,
    }
}

fn push_code(key: &mut String, code: u32) {
    // Every emitted code lies in ALPHABET_MIN..=ALPHABET_MAX, all valid scalars.
    if let Some(c) = char::from_u32(code) {
        key.push(c);
    }
}
