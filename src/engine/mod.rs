//! Likelihood engine interface.
//!
//! # Overview
//! The numerical work (transition matrices from an eigendecomposition, the
//! pruning recursion, the root log-likelihood) belongs to an engine. This
//! module fixes the contract every engine implements:
//!
//! - [`LikelihoodEngine`] creates instances. It is shared by all workers.
//! - [`EngineInstance`] holds the buffers for one tree. It is owned by exactly
//!   one worker and used for one configure → compute → read cycle.
//! - [`InstanceHandle`] wraps an instance and finalizes it exactly once, on
//!   [`InstanceHandle::close`] or on drop.
//! - [`CreationGate`] serialises instance creation, which engines are not
//!   required to support concurrently.
//!
//! Backends: [`cpu::CpuEngine`] (pure Rust, always available) and, behind the
//! `beagle` feature, `beagle::BeagleEngine` (libhmsbeagle).

#[cfg(feature = "beagle")]
pub mod beagle;
pub mod counting;
pub mod cpu;

use crate::encoding::STATE_COUNT;
use crate::model::EigenDecomposition;
use crate::schedule::Operation;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Errors reported by an engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The engine could not allocate an instance.
    #[error("failed to obtain engine instance: {0}")]
    Creation(String),

    /// A native call returned an error code.
    #[error("{call} rejected with code {code}")]
    Rejected { call: &'static str, code: i32 },

    /// A buffer, matrix or eigen index outside the instance's allocation.
    #[error("{kind} index {index} out of range")]
    IndexOutOfRange { kind: &'static str, index: usize },

    /// A buffer was read before anything was written to it.
    #[error("{kind} {index} read before it was set")]
    Unset { kind: &'static str, index: usize },

    /// Argument of the wrong size or value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The instance was already finalized.
    #[error("instance already finalized")]
    Finalized,
}

/// Buffer counts an instance is allocated with.
///
/// All counts are fixed for the lifetime of the instance, so an instance
/// only fits trees with the same number of tips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceConfig {
    pub tip_count: usize,
    pub partials_buffer_count: usize,
    pub compact_buffer_count: usize,
    pub state_count: usize,
    pub pattern_count: usize,
    pub eigen_buffer_count: usize,
    pub matrix_buffer_count: usize,
    pub category_count: usize,
    pub scale_buffer_count: usize,
}

impl InstanceConfig {
    /// Layout for a bifurcating tree: one compact buffer per tip, one partials
    /// buffer per internal node, one matrix per node, no scaling.
    pub fn for_tree(tip_count: usize, pattern_count: usize) -> Self {
        Self {
            tip_count,
            partials_buffer_count: tip_count.saturating_sub(1),
            compact_buffer_count: tip_count,
            state_count: STATE_COUNT,
            pattern_count,
            eigen_buffer_count: 1,
            matrix_buffer_count: (2 * tip_count).saturating_sub(1),
            category_count: 1,
            scale_buffer_count: 0,
        }
    }

    /// Total number of addressable buffers (tips and partials).
    pub fn buffer_count(&self) -> usize {
        self.compact_buffer_count + self.partials_buffer_count
    }
}

/// Factory for engine instances, shared read-only between workers.
pub trait LikelihoodEngine: Sync {
    type Instance: EngineInstance;

    /// Allocate a new instance. May not be safe to call concurrently; go
    /// through a [`CreationGate`].
    fn create_instance(&self, config: &InstanceConfig) -> Result<Self::Instance, EngineError>;
}

/// Buffers and model state for one tree.
///
/// `None` scale indices stand for "no scaling".
pub trait EngineInstance {
    fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<(), EngineError>;

    fn set_state_frequencies(&mut self, index: usize, frequencies: &[f64]) -> Result<(), EngineError>;

    fn set_category_weights(&mut self, index: usize, weights: &[f64]) -> Result<(), EngineError>;

    fn set_category_rates(&mut self, rates: &[f64]) -> Result<(), EngineError>;

    fn set_eigen_decomposition(
        &mut self,
        index: usize,
        eigen: &EigenDecomposition,
    ) -> Result<(), EngineError>;

    /// Load the state codes of one tip, one per pattern.
    fn set_tip_states(&mut self, tip: usize, states: &[i32]) -> Result<(), EngineError>;

    /// Compute `P(edge_lengths[i])` into matrix `matrix_indices[i]` for every `i`.
    fn update_transition_matrices(
        &mut self,
        eigen_index: usize,
        matrix_indices: &[usize],
        edge_lengths: &[f64],
    ) -> Result<(), EngineError>;

    /// Run the operations in order.
    fn update_partials(
        &mut self,
        operations: &[Operation],
        cumulative_scale: Option<usize>,
    ) -> Result<(), EngineError>;

    /// Sum of the log-likelihoods at the given root buffers.
    fn calculate_root_log_likelihoods(
        &mut self,
        buffer_indices: &[usize],
        category_weight_indices: &[usize],
        state_frequency_indices: &[usize],
        cumulative_scale_indices: &[Option<usize>],
    ) -> Result<f64, EngineError>;

    /// Release the instance's resources. Called exactly once, by [`InstanceHandle`].
    fn finalize(&mut self) -> Result<(), EngineError>;
}

/// Owning handle that finalizes its instance exactly once.
///
/// Prefer [`InstanceHandle::close`] to observe finalization errors; dropping
/// the handle finalizes too and only logs them.
pub struct InstanceHandle<I: EngineInstance> {
    instance: I,
    released: bool,
}

impl<I: EngineInstance> InstanceHandle<I> {
    pub fn new(instance: I) -> Self {
        Self {
            instance,
            released: false,
        }
    }

    pub fn close(mut self) -> Result<(), EngineError> {
        self.released = true;
        self.instance.finalize()
    }
}

impl<I: EngineInstance> Deref for InstanceHandle<I> {
    type Target = I;

    fn deref(&self) -> &I {
        &self.instance
    }
}

impl<I: EngineInstance> DerefMut for InstanceHandle<I> {
    fn deref_mut(&mut self) -> &mut I {
        &mut self.instance
    }
}

impl<I: EngineInstance> Drop for InstanceHandle<I> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.instance.finalize() {
            tracing::warn!("failed to finalize engine instance: {e}");
        }
    }
}

/// Single-slot gate around instance creation.
///
/// Only the creation call runs under the lock; the returned handle is used
/// without it. The lock guards no data, so a panic while holding it leaves
/// nothing inconsistent and poisoning is ignored.
#[derive(Debug, Default)]
pub struct CreationGate {
    slot: Mutex<()>,
}

impl CreationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create<E: LikelihoodEngine>(
        &self,
        engine: &E,
        config: &InstanceConfig,
    ) -> Result<InstanceHandle<E::Instance>, EngineError> {
        let _slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        engine.create_instance(config).map(InstanceHandle::new)
    }
}
