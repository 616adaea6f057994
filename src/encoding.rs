//! Nucleotide to state-code encoding.
//!
//! # Overview
//! The likelihood engine consumes one small integer per aligned character:
//!
//! | Character      | Code |
//! |----------------|------|
//! | `A` / `a`      | 0    |
//! | `C` / `c`      | 1    |
//! | `G` / `g`      | 2    |
//! | `T` / `t`      | 3    |
//! | `-`            | 4    |
//!
//! Code 4 is outside the 4-state alphabet, so the engine treats it as
//! missing data (every state equally compatible).
//!
//! # Unrecognised characters
//! Any other character (`N`, `?`, IUPAC ambiguity codes, ...) is handled by an
//! [`UnknownCharPolicy`]. The default, [`UnknownCharPolicy::Adenine`], encodes
//! it as 0 without complaint. This keeps log-likelihoods comparable with
//! earlier runs but treats ambiguity as adenine; pick
//! [`UnknownCharPolicy::Missing`] or [`UnknownCharPolicy::Reject`] to change it.

use clap::ValueEnum;

/// Number of nucleotide states.
pub const STATE_COUNT: usize = 4;

/// State code used for gaps (and, under [`UnknownCharPolicy::Missing`], unknown characters).
pub const GAP_STATE: i32 = 4;

/// What to do with characters outside `{A,C,G,T,-}`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum UnknownCharPolicy {
    /// Encode as adenine (code 0).
    #[default]
    Adenine,
    /// Encode as missing data (code 4).
    Missing,
    /// Fail with [`UnknownChar`].
    Reject,
}

/// An unrecognised character found under [`UnknownCharPolicy::Reject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownChar {
    pub column: usize,
    pub byte: u8,
}

const UNKNOWN: i8 = -1;

/// Lookup table from ASCII byte to state code, `UNKNOWN` for anything else.
const TABLE: [i8; 128] = {
    let mut table = [UNKNOWN; 128];
    table[b'A' as usize] = 0;
    table[b'C' as usize] = 1;
    table[b'G' as usize] = 2;
    table[b'T' as usize] = 3;
    table[b'a' as usize] = 0;
    table[b'c' as usize] = 1;
    table[b'g' as usize] = 2;
    table[b't' as usize] = 3;
    table[b'-' as usize] = GAP_STATE as i8;
    table
};

/// Look up a single character. Returns `None` when it is not in the table.
#[inline]
pub fn state_code(byte: u8) -> Option<i32> {
    match TABLE.get(byte as usize) {
        Some(&code) if code != UNKNOWN => Some(code as i32),
        _ => None,
    }
}

/// Encode a sequence into state codes.
///
/// The output always has the same length as the input.
pub fn encode_states(sequence: &[u8], policy: UnknownCharPolicy) -> Result<Vec<i32>, UnknownChar> {
    sequence
        .iter()
        .enumerate()
        .map(|(column, &byte)| match state_code(byte) {
            Some(code) => Ok(code),
            None => match policy {
                UnknownCharPolicy::Adenine => Ok(0),
                UnknownCharPolicy::Missing => Ok(GAP_STATE),
                UnknownCharPolicy::Reject => Err(UnknownChar { column, byte }),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_nucleotides() {
        let codes = encode_states(b"ACGT-acgt", UnknownCharPolicy::default()).unwrap();
        assert_eq!(codes, vec![0, 1, 2, 3, 4, 0, 1, 2, 3]);
    }

    #[test]
    fn test_unknown_defaults_to_adenine() {
        let codes = encode_states(b"NRY?", UnknownCharPolicy::Adenine).unwrap();
        assert_eq!(codes, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_unknown_as_missing() {
        let codes = encode_states(b"ANc", UnknownCharPolicy::Missing).unwrap();
        assert_eq!(codes, vec![0, GAP_STATE, 1]);
    }

    #[test]
    fn test_unknown_rejected() {
        let err = encode_states(b"ACnT", UnknownCharPolicy::Reject).unwrap_err();
        assert_eq!(err, UnknownChar { column: 2, byte: b'n' });
    }

    #[test]
    fn test_non_ascii_is_unknown() {
        assert_eq!(state_code(0xC3), None);
        assert_eq!(encode_states(&[0xC3, b'G'], UnknownCharPolicy::Adenine).unwrap(), vec![0, 2]);
    }
}
