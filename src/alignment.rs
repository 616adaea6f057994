//! Aligned nucleotide sequences and their column-pattern compression.
//!
//! # Overview
//! An [`Alignment`] holds one sequence per taxon, all of equal length.
//! Many columns of a real alignment are identical; the likelihood of a column
//! only depends on its content, so [`Alignment::compress`] keeps each distinct
//! column ("pattern") once and records how often it occurred:
//!
//! ```text
//! column:   0 1 2 3 4        pattern: 0 1 2
//! taxon_a   A C A A G                 A C G
//! taxon_b   A T A A G   ==>           A T G
//!                                     weights: [3, 1, 1]
//! ```
//!
//! [`PatternAlignment::encode`] then turns every compressed sequence into the
//! state codes the engine consumes, once per taxon, so every tree evaluated
//! against the alignment shares the same encoded data.

use crate::encoding::{encode_states, state_code, UnknownCharPolicy};
use crate::error::{LikelihoodError, Result};
use itertools::Itertools;
use rayon::prelude::*;
use std::collections::HashMap;
use std::io::BufRead;

/// Ordered taxon name → sequence pairs of equal length.
#[derive(Debug, Clone)]
pub struct Alignment {
    names: Vec<String>,
    sequences: Vec<Vec<u8>>,
}

impl Alignment {
    /// Build an alignment, checking that it is non-empty, names are unique
    /// and all sequences have the same length.
    pub fn new(records: Vec<(String, Vec<u8>)>) -> Result<Self> {
        let Some(first) = records.first() else {
            return Err(LikelihoodError::Alignment("alignment contains no sequences".into()));
        };
        let length = first.1.len();

        let mut seen = HashMap::with_capacity(records.len());
        for (idx, (name, sequence)) in records.iter().enumerate() {
            if let Some(prev) = seen.insert(name.as_str(), idx) {
                return Err(LikelihoodError::Alignment(format!(
                    "sequence name '{name}' appears twice (records {prev} and {idx})"
                )));
            }
            if sequence.len() != length {
                return Err(LikelihoodError::Alignment(format!(
                    "sequence '{name}' has length {}, expected {length}",
                    sequence.len()
                )));
            }
        }

        let (names, sequences) = records.into_iter().unzip();
        Ok(Self { names, sequences })
    }

    /// Parse FASTA records: `>` header lines name a sequence by their first
    /// whitespace-delimited token, the following lines up to the next header
    /// are concatenated. Blank lines are skipped.
    pub fn from_fasta<R: BufRead>(reader: R) -> Result<Self> {
        let mut records: Vec<(String, Vec<u8>)> = Vec::new();

        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix('>') {
                let name = header.split_whitespace().next().ok_or_else(|| {
                    LikelihoodError::Alignment(format!("empty sequence name on line {}", lineno + 1))
                })?;
                records.push((name.to_string(), Vec::new()));
            } else {
                let Some((_, sequence)) = records.last_mut() else {
                    return Err(LikelihoodError::Alignment(format!(
                        "sequence data before the first header on line {}",
                        lineno + 1
                    )));
                };
                sequence.extend(line.bytes().filter(|b| !b.is_ascii_whitespace()));
            }
        }

        Self::new(records)
    }

    pub fn sequence_count(&self) -> usize {
        self.names.len()
    }

    /// Number of columns.
    pub fn length(&self) -> usize {
        self.sequences.first().map_or(0, Vec::len)
    }

    /// Iterate over `(name, sequence)` pairs in input order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.sequences.iter().map(Vec::as_slice))
    }

    /// Collapse identical columns into weighted patterns.
    ///
    /// Patterns keep the order of their first occurrence, and the weights sum
    /// to [`Alignment::length`].
    pub fn compress(&self) -> PatternAlignment {
        let mut column_to_pattern: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut columns: Vec<usize> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();

        for col in 0..self.length() {
            let column: Vec<u8> = self.sequences.iter().map(|s| s[col]).collect();
            match column_to_pattern.get(&column) {
                Some(&pattern) => weights[pattern] += 1.0,
                None => {
                    column_to_pattern.insert(column, weights.len());
                    columns.push(col);
                    weights.push(1.0);
                }
            }
        }

        let patterns = self
            .sequences
            .iter()
            .map(|s| columns.iter().map(|&col| s[col]).collect())
            .collect();

        PatternAlignment {
            names: self.names.clone(),
            patterns,
            weights,
        }
    }
}

/// An alignment reduced to its distinct columns.
#[derive(Debug, Clone)]
pub struct PatternAlignment {
    names: Vec<String>,
    /// One compressed sequence per taxon, `weights.len()` characters each.
    patterns: Vec<Vec<u8>>,
    weights: Vec<f64>,
}

impl PatternAlignment {
    pub fn sequence_count(&self) -> usize {
        self.names.len()
    }

    pub fn pattern_count(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Iterate over `(name, compressed sequence)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.patterns.iter().map(Vec::as_slice))
    }

    /// Encode every compressed sequence into engine state codes.
    ///
    /// # Errors
    /// Under [`UnknownCharPolicy::Reject`], returns an alignment error naming
    /// the first sequence with an unrecognised character.
    pub fn encode(&self, policy: UnknownCharPolicy) -> Result<EncodedAlignment> {
        let encoded = self
            .names
            .par_iter()
            .zip(self.patterns.par_iter())
            .map(|(name, pattern)| {
                encode_states(pattern, policy)
                    .map(|states| (name.clone(), states))
                    .map_err(|unknown| {
                        LikelihoodError::Alignment(format!(
                            "sequence '{name}' contains unrecognised character '{}' in pattern {}",
                            unknown.byte.escape_ascii(),
                            unknown.column
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let unknown: Vec<u8> = self
            .patterns
            .iter()
            .flatten()
            .copied()
            .filter(|&b| state_code(b).is_none())
            .unique()
            .collect();
        if !unknown.is_empty() {
            tracing::debug!(
                ?policy,
                "unrecognised characters in alignment: {}",
                unknown.iter().map(|b| b.escape_ascii()).join(" ")
            );
        }

        Ok(EncodedAlignment {
            states: encoded.into_iter().collect(),
            weights: self.weights.clone(),
        })
    }
}

/// Per-taxon state codes plus pattern weights, shared read-only by all workers.
#[derive(Debug, Clone)]
pub struct EncodedAlignment {
    states: HashMap<String, Vec<i32>>,
    weights: Vec<f64>,
}

impl EncodedAlignment {
    pub fn sequence_count(&self) -> usize {
        self.states.len()
    }

    pub fn pattern_count(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// State codes of the named taxon, one per pattern.
    pub fn tip_states(&self, name: &str) -> Option<&[i32]> {
        self.states.get(name).map(Vec::as_slice)
    }
}
