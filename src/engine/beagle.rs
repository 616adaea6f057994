//! libhmsbeagle backend.
//!
//! Thin binding over the BEAGLE C API. Linking needs `libhmsbeagle` on the
//! library path (or `BEAGLE_LIB_DIR` at build time). Indices are converted to
//! `c_int`, every slice length is checked against the instance's allocation
//! before it crosses the boundary, and negative return codes become
//! [`EngineError::Rejected`].

use super::{EngineError, EngineInstance, InstanceConfig, LikelihoodEngine};
use crate::model::EigenDecomposition;
use crate::schedule::Operation;
use std::ffi::CStr;
use std::os::raw::{c_char, c_double, c_int, c_long};
use std::ptr;

/// "No buffer" marker for scale indices.
const BEAGLE_OP_NONE: c_int = -1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct BeagleOperation {
    destination_partials: c_int,
    destination_scale_write: c_int,
    destination_scale_read: c_int,
    child1_partials: c_int,
    child1_transition_matrix: c_int,
    child2_partials: c_int,
    child2_transition_matrix: c_int,
}

#[repr(C)]
#[allow(dead_code)]
struct BeagleInstanceDetails {
    resource_number: c_int,
    resource_name: *mut c_char,
    impl_name: *mut c_char,
    impl_description: *mut c_char,
    flags: c_long,
}

#[link(name = "hmsbeagle")]
unsafe extern "C" {
    fn beagleCreateInstance(
        tip_count: c_int,
        partials_buffer_count: c_int,
        compact_buffer_count: c_int,
        state_count: c_int,
        pattern_count: c_int,
        eigen_buffer_count: c_int,
        matrix_buffer_count: c_int,
        category_count: c_int,
        scale_buffer_count: c_int,
        resource_list: *const c_int,
        resource_count: c_int,
        preference_flags: c_long,
        requirement_flags: c_long,
        return_info: *mut BeagleInstanceDetails,
    ) -> c_int;

    fn beagleFinalizeInstance(instance: c_int) -> c_int;

    fn beagleSetTipStates(instance: c_int, tip_index: c_int, in_states: *const c_int) -> c_int;

    fn beagleSetPatternWeights(instance: c_int, in_pattern_weights: *const c_double) -> c_int;

    fn beagleSetStateFrequencies(
        instance: c_int,
        state_frequencies_index: c_int,
        in_state_frequencies: *const c_double,
    ) -> c_int;

    fn beagleSetCategoryWeights(
        instance: c_int,
        category_weights_index: c_int,
        in_category_weights: *const c_double,
    ) -> c_int;

    fn beagleSetCategoryRates(instance: c_int, in_category_rates: *const c_double) -> c_int;

    fn beagleSetEigenDecomposition(
        instance: c_int,
        eigen_index: c_int,
        in_eigen_vectors: *const c_double,
        in_inverse_eigen_vectors: *const c_double,
        in_eigen_values: *const c_double,
    ) -> c_int;

    fn beagleUpdateTransitionMatrices(
        instance: c_int,
        eigen_index: c_int,
        probability_indices: *const c_int,
        first_derivative_indices: *const c_int,
        second_derivative_indices: *const c_int,
        edge_lengths: *const c_double,
        count: c_int,
    ) -> c_int;

    fn beagleUpdatePartials(
        instance: c_int,
        operations: *const BeagleOperation,
        operation_count: c_int,
        cumulative_scale_index: c_int,
    ) -> c_int;

    fn beagleCalculateRootLogLikelihoods(
        instance: c_int,
        buffer_indices: *const c_int,
        category_weights_indices: *const c_int,
        state_frequencies_indices: *const c_int,
        cumulative_scale_indices: *const c_int,
        count: c_int,
        out_sum_log_likelihood: *mut c_double,
    ) -> c_int;
}

fn check(call: &'static str, code: c_int) -> Result<(), EngineError> {
    if code < 0 {
        Err(EngineError::Rejected { call, code })
    } else {
        Ok(())
    }
}

fn to_c(kind: &'static str, index: usize) -> Result<c_int, EngineError> {
    c_int::try_from(index).map_err(|_| EngineError::IndexOutOfRange { kind, index })
}

fn to_c_all(kind: &'static str, indices: &[usize]) -> Result<Vec<c_int>, EngineError> {
    indices.iter().map(|&i| to_c(kind, i)).collect()
}

fn scale_index(index: Option<usize>) -> Result<c_int, EngineError> {
    index.map_or(Ok(BEAGLE_OP_NONE), |i| to_c("scale buffer", i))
}

fn expect_len(what: &str, actual: usize, expected: usize) -> Result<(), EngineError> {
    if actual == expected {
        Ok(())
    } else {
        Err(EngineError::InvalidArgument(format!(
            "{what}: expected {expected} values, got {actual}"
        )))
    }
}

/// Engine backed by libhmsbeagle. Resource selection is left to BEAGLE.
#[derive(Debug, Clone, Copy, Default)]
pub struct BeagleEngine {
    pub preference_flags: i64,
    pub requirement_flags: i64,
}

impl LikelihoodEngine for BeagleEngine {
    type Instance = BeagleInstance;

    fn create_instance(&self, config: &InstanceConfig) -> Result<BeagleInstance, EngineError> {
        let mut details = BeagleInstanceDetails {
            resource_number: 0,
            resource_name: ptr::null_mut(),
            impl_name: ptr::null_mut(),
            impl_description: ptr::null_mut(),
            flags: 0,
        };

        // SAFETY: all counts are plain integers, the resource list is empty
        // and `details` is a valid out-pointer for the duration of the call.
        let id = unsafe {
            beagleCreateInstance(
                to_c("tip", config.tip_count)?,
                to_c("partials buffer", config.partials_buffer_count)?,
                to_c("compact buffer", config.compact_buffer_count)?,
                to_c("state", config.state_count)?,
                to_c("pattern", config.pattern_count)?,
                to_c("eigen buffer", config.eigen_buffer_count)?,
                to_c("matrix buffer", config.matrix_buffer_count)?,
                to_c("category", config.category_count)?,
                to_c("scale buffer", config.scale_buffer_count)?,
                ptr::null(),
                0,
                self.preference_flags as c_long,
                self.requirement_flags as c_long,
                &mut details,
            )
        };
        if id < 0 {
            return Err(EngineError::Creation(format!(
                "beagleCreateInstance returned {id}"
            )));
        }

        if !details.impl_name.is_null() {
            // SAFETY: BEAGLE fills in a NUL-terminated string it owns.
            let name = unsafe { CStr::from_ptr(details.impl_name) };
            tracing::trace!(
                instance = id,
                resource = details.resource_number,
                flags = details.flags as i64,
                "created BEAGLE instance ({})",
                name.to_string_lossy()
            );
        }

        Ok(BeagleInstance {
            id,
            config: *config,
            finalized: false,
        })
    }
}

/// One BEAGLE instance id.
#[derive(Debug)]
pub struct BeagleInstance {
    id: c_int,
    config: InstanceConfig,
    finalized: bool,
}

impl BeagleInstance {
    fn live(&self) -> Result<c_int, EngineError> {
        if self.finalized {
            Err(EngineError::Finalized)
        } else {
            Ok(self.id)
        }
    }
}

impl EngineInstance for BeagleInstance {
    fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<(), EngineError> {
        let id = self.live()?;
        expect_len("pattern weights", weights.len(), self.config.pattern_count)?;
        // SAFETY: `weights` holds `pattern_count` doubles.
        check("beagleSetPatternWeights", unsafe {
            beagleSetPatternWeights(id, weights.as_ptr())
        })
    }

    fn set_state_frequencies(&mut self, index: usize, frequencies: &[f64]) -> Result<(), EngineError> {
        let id = self.live()?;
        expect_len("state frequencies", frequencies.len(), self.config.state_count)?;
        // SAFETY: `frequencies` holds `state_count` doubles.
        check("beagleSetStateFrequencies", unsafe {
            beagleSetStateFrequencies(id, to_c("state frequency", index)?, frequencies.as_ptr())
        })
    }

    fn set_category_weights(&mut self, index: usize, weights: &[f64]) -> Result<(), EngineError> {
        let id = self.live()?;
        expect_len("category weights", weights.len(), self.config.category_count)?;
        // SAFETY: `weights` holds `category_count` doubles.
        check("beagleSetCategoryWeights", unsafe {
            beagleSetCategoryWeights(id, to_c("category weight", index)?, weights.as_ptr())
        })
    }

    fn set_category_rates(&mut self, rates: &[f64]) -> Result<(), EngineError> {
        let id = self.live()?;
        expect_len("category rates", rates.len(), self.config.category_count)?;
        // SAFETY: `rates` holds `category_count` doubles.
        check("beagleSetCategoryRates", unsafe {
            beagleSetCategoryRates(id, rates.as_ptr())
        })
    }

    fn set_eigen_decomposition(
        &mut self,
        index: usize,
        eigen: &EigenDecomposition,
    ) -> Result<(), EngineError> {
        let id = self.live()?;
        expect_len("eigenvalues", eigen.eigenvalues.len(), self.config.state_count)?;
        // SAFETY: the decomposition arrays are sized for `state_count` states.
        check("beagleSetEigenDecomposition", unsafe {
            beagleSetEigenDecomposition(
                id,
                to_c("eigen", index)?,
                eigen.eigenvectors.as_ptr(),
                eigen.inverse_eigenvectors.as_ptr(),
                eigen.eigenvalues.as_ptr(),
            )
        })
    }

    fn set_tip_states(&mut self, tip: usize, states: &[i32]) -> Result<(), EngineError> {
        let id = self.live()?;
        expect_len("tip states", states.len(), self.config.pattern_count)?;
        // SAFETY: `states` holds `pattern_count` ints.
        check("beagleSetTipStates", unsafe {
            beagleSetTipStates(id, to_c("tip", tip)?, states.as_ptr())
        })
    }

    fn update_transition_matrices(
        &mut self,
        eigen_index: usize,
        matrix_indices: &[usize],
        edge_lengths: &[f64],
    ) -> Result<(), EngineError> {
        let id = self.live()?;
        expect_len("edge lengths", edge_lengths.len(), matrix_indices.len())?;
        let indices = to_c_all("matrix", matrix_indices)?;
        // SAFETY: both arrays hold `count` elements; derivative matrices are
        // not requested.
        check("beagleUpdateTransitionMatrices", unsafe {
            beagleUpdateTransitionMatrices(
                id,
                to_c("eigen", eigen_index)?,
                indices.as_ptr(),
                ptr::null(),
                ptr::null(),
                edge_lengths.as_ptr(),
                to_c("matrix count", indices.len())?,
            )
        })
    }

    fn update_partials(
        &mut self,
        operations: &[Operation],
        cumulative_scale: Option<usize>,
    ) -> Result<(), EngineError> {
        let id = self.live()?;
        let ops = operations
            .iter()
            .map(|op| -> Result<BeagleOperation, EngineError> {
                Ok(BeagleOperation {
                    destination_partials: to_c("partials buffer", op.destination)?,
                    destination_scale_write: scale_index(op.scale_write)?,
                    destination_scale_read: scale_index(op.scale_read)?,
                    child1_partials: to_c("partials buffer", op.child1)?,
                    child1_transition_matrix: to_c("matrix", op.child1_matrix)?,
                    child2_partials: to_c("partials buffer", op.child2)?,
                    child2_transition_matrix: to_c("matrix", op.child2_matrix)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        // SAFETY: `ops` is a contiguous array of `repr(C)` operations.
        check("beagleUpdatePartials", unsafe {
            beagleUpdatePartials(
                id,
                ops.as_ptr(),
                to_c("operation count", ops.len())?,
                scale_index(cumulative_scale)?,
            )
        })
    }

    fn calculate_root_log_likelihoods(
        &mut self,
        buffer_indices: &[usize],
        category_weight_indices: &[usize],
        state_frequency_indices: &[usize],
        cumulative_scale_indices: &[Option<usize>],
    ) -> Result<f64, EngineError> {
        let id = self.live()?;
        let count = buffer_indices.len();
        expect_len("category weight indices", category_weight_indices.len(), count)?;
        expect_len("state frequency indices", state_frequency_indices.len(), count)?;
        expect_len("scale indices", cumulative_scale_indices.len(), count)?;

        let buffers = to_c_all("partials buffer", buffer_indices)?;
        let weights = to_c_all("category weight", category_weight_indices)?;
        let freqs = to_c_all("state frequency", state_frequency_indices)?;
        let scales = cumulative_scale_indices
            .iter()
            .map(|&s| scale_index(s))
            .collect::<Result<Vec<_>, EngineError>>()?;

        let mut lnl: c_double = 0.0;
        // SAFETY: the four index arrays hold `count` elements and `lnl` is a
        // valid out-pointer.
        check("beagleCalculateRootLogLikelihoods", unsafe {
            beagleCalculateRootLogLikelihoods(
                id,
                buffers.as_ptr(),
                weights.as_ptr(),
                freqs.as_ptr(),
                scales.as_ptr(),
                to_c("root count", count)?,
                &mut lnl,
            )
        })?;
        Ok(lnl)
    }

    fn finalize(&mut self) -> Result<(), EngineError> {
        let id = self.live()?;
        self.finalized = true;
        // SAFETY: `id` was returned by beagleCreateInstance and is released once.
        check("beagleFinalizeInstance", unsafe { beagleFinalizeInstance(id) })
    }
}
