//! Instance accounting around any engine.
//!
//! [`CountingEngine`] forwards every call to the wrapped engine and counts
//! created and finalized instances, so a run can check that nothing leaked.

use super::{EngineError, EngineInstance, InstanceConfig, LikelihoodEngine};
use crate::model::EigenDecomposition;
use crate::schedule::Operation;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Counters {
    created: AtomicUsize,
    failed: AtomicUsize,
    finalized: AtomicUsize,
}

/// Snapshot of instance counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceStats {
    pub created: usize,
    /// Creation attempts the engine rejected.
    pub failed: usize,
    pub finalized: usize,
}

impl InstanceStats {
    /// Instances created but not yet finalized.
    pub fn live(&self) -> usize {
        self.created.saturating_sub(self.finalized)
    }
}

/// Engine wrapper counting instance lifecycles.
#[derive(Debug, Clone)]
pub struct CountingEngine<E> {
    inner: E,
    counters: Arc<Counters>,
}

impl<E> CountingEngine<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            counters: Arc::default(),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn stats(&self) -> InstanceStats {
        InstanceStats {
            created: self.counters.created.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            finalized: self.counters.finalized.load(Ordering::SeqCst),
        }
    }
}

impl<E: LikelihoodEngine> LikelihoodEngine for CountingEngine<E> {
    type Instance = CountedInstance<E::Instance>;

    fn create_instance(&self, config: &InstanceConfig) -> Result<Self::Instance, EngineError> {
        match self.inner.create_instance(config) {
            Ok(inner) => {
                self.counters.created.fetch_add(1, Ordering::SeqCst);
                Ok(CountedInstance {
                    inner,
                    counters: Arc::clone(&self.counters),
                })
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

/// Instance created by a [`CountingEngine`].
#[derive(Debug)]
pub struct CountedInstance<I> {
    inner: I,
    counters: Arc<Counters>,
}

impl<I: EngineInstance> EngineInstance for CountedInstance<I> {
    fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<(), EngineError> {
        self.inner.set_pattern_weights(weights)
    }

    fn set_state_frequencies(&mut self, index: usize, frequencies: &[f64]) -> Result<(), EngineError> {
        self.inner.set_state_frequencies(index, frequencies)
    }

    fn set_category_weights(&mut self, index: usize, weights: &[f64]) -> Result<(), EngineError> {
        self.inner.set_category_weights(index, weights)
    }

    fn set_category_rates(&mut self, rates: &[f64]) -> Result<(), EngineError> {
        self.inner.set_category_rates(rates)
    }

    fn set_eigen_decomposition(
        &mut self,
        index: usize,
        eigen: &EigenDecomposition,
    ) -> Result<(), EngineError> {
        self.inner.set_eigen_decomposition(index, eigen)
    }

    fn set_tip_states(&mut self, tip: usize, states: &[i32]) -> Result<(), EngineError> {
        self.inner.set_tip_states(tip, states)
    }

    fn update_transition_matrices(
        &mut self,
        eigen_index: usize,
        matrix_indices: &[usize],
        edge_lengths: &[f64],
    ) -> Result<(), EngineError> {
        self.inner
            .update_transition_matrices(eigen_index, matrix_indices, edge_lengths)
    }

    fn update_partials(
        &mut self,
        operations: &[Operation],
        cumulative_scale: Option<usize>,
    ) -> Result<(), EngineError> {
        self.inner.update_partials(operations, cumulative_scale)
    }

    fn calculate_root_log_likelihoods(
        &mut self,
        buffer_indices: &[usize],
        category_weight_indices: &[usize],
        state_frequency_indices: &[usize],
        cumulative_scale_indices: &[Option<usize>],
    ) -> Result<f64, EngineError> {
        self.inner.calculate_root_log_likelihoods(
            buffer_indices,
            category_weight_indices,
            state_frequency_indices,
            cumulative_scale_indices,
        )
    }

    fn finalize(&mut self) -> Result<(), EngineError> {
        self.counters.finalized.fetch_add(1, Ordering::SeqCst);
        self.inner.finalize()
    }
}
