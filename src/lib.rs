//! Crate root: module layout and public re-exports.
//!
//! Modules:
//! - `encoding`: nucleotide to state-code mapping.
//! - `alignment`: sequences, FASTA parsing, column-pattern compression.
//! - `model`: substitution model handed to the engine.
//! - `indexer`: buffer numbering of tree nodes.
//! - `schedule`: bottom-up combine operations for one tree.
//! - `engine`: likelihood engine contract, reference CPU engine, optional BEAGLE binding.
//! - `evaluator`: log-likelihood of one tree.
//! - `orchestrator`: many trees over a pool of workers.
//! - `io`: reading trees/alignments, writing results.
//! - `api`: Python bindings via `pyo3` (gated behind "python" feature).

pub mod alignment;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod indexer;
pub mod io;
pub mod model;
pub mod orchestrator;
pub mod schedule;

#[cfg(feature = "python")]
pub mod api;

// Re-export frequently used types & functions
pub use alignment::{Alignment, EncodedAlignment};
pub use encoding::UnknownCharPolicy;
pub use engine::cpu::CpuEngine;
pub use error::{ErrorKind, LikelihoodError, Result};
pub use evaluator::LikelihoodEvaluator;
pub use io::{read_alignment, read_trees, write_results_tsv};
pub use model::SubstitutionModel;
pub use orchestrator::{Orchestrator, RunConfig, RunSummary, TreeOutcome};
