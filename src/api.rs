//! Python binding layer for tree likelihood evaluation.
//!
//! Provides a Python function computing the log-likelihood of every tree in
//! a Newick file given a FASTA alignment.

use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;

use crate::engine::cpu::CpuEngine;
use crate::error::{ErrorKind, LikelihoodError};
use crate::io::{read_alignment, read_trees};
use crate::model::SubstitutionModel;
use crate::orchestrator::{Orchestrator, RunConfig};

fn to_py_err(e: LikelihoodError) -> PyErr {
    match e.kind() {
        ErrorKind::Input => PyIOError::new_err(e.to_string()),
        _ => PyValueError::new_err(e.to_string()),
    }
}

/// Compute the Jukes-Cantor log-likelihood of every tree in a file.
///
/// Args:
///     tree_path: Newick file with one or more `;`-terminated trees (plain or .gz)
///     alignment_path: FASTA alignment (plain or .gz)
///     threads: Number of trees evaluated in parallel (default: 1)
///
/// Returns:
///     A list of (index, log_likelihood, error) tuples in tree order, where
///     exactly one of log_likelihood and error is None.
///
/// Raises:
///     IOError: If a file cannot be read or the alignment is malformed
///     ValueError: If the first tree's tips don't match the alignment
#[pyfunction]
#[pyo3(signature = (tree_path, alignment_path, threads=1))]
fn tree_log_likelihoods(
    tree_path: String,
    alignment_path: String,
    threads: usize,
) -> PyResult<Vec<(usize, Option<f64>, Option<String>)>> {
    let config = RunConfig {
        workers: threads,
        ..RunConfig::default()
    };

    let alignment = read_alignment(&alignment_path)
        .and_then(|a| a.compress().encode(config.unknown_chars))
        .map_err(to_py_err)?;
    let trees = read_trees(&tree_path)
        .map_err(|e| PyIOError::new_err(format!("Failed to read '{tree_path}': {e}")))?;

    let model = SubstitutionModel::jukes_cantor();
    let engine = CpuEngine;
    let outcomes = Orchestrator::new(&alignment, &model, &engine, config.effective_workers())
        .evaluate_all(trees)
        .map_err(to_py_err)?;

    Ok(outcomes
        .into_iter()
        .map(|o| match o.result {
            Ok(lnl) => (o.index, Some(lnl), None),
            Err(e) => (o.index, None, Some(e.to_string())),
        })
        .collect())
}

/// Python module definition
#[pymodule]
fn tree_likelihood(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(tree_log_likelihoods, m)?)?;
    Ok(())
}
