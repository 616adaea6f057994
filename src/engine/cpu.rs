//! Pure-Rust reference engine.
//!
//! Implements the engine contract with straightforward loops:
//!
//! - `P(t) = V · diag(exp(λ·r·t)) · V⁻¹` for each requested edge, `r` being
//!   the category rate,
//! - the pruning step for each operation,
//!   `L_dest[p][s] = (Σ_j P1[s][j]·L1[p][j]) · (Σ_j P2[s][j]·L2[p][j])`,
//! - at the root, `Σ_p w_p · ln(Σ_s π_s · c · L_root[p][s])`, `c` being the
//!   category weight.
//!
//! Tips are stored as compact state codes; a code outside `0..stateCount`
//! (gap or unknown) is compatible with every state.
//!
//! Unlike a native engine, every index and every read is checked, so a
//! malformed schedule surfaces as an [`EngineError`] instead of garbage.

use super::{EngineError, EngineInstance, InstanceConfig, LikelihoodEngine};
use crate::encoding::STATE_COUNT;
use crate::model::EigenDecomposition;
use crate::schedule::Operation;

const MATRIX_SIZE: usize = STATE_COUNT * STATE_COUNT;

/// Engine computing likelihoods on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuEngine;

impl LikelihoodEngine for CpuEngine {
    type Instance = CpuInstance;

    fn create_instance(&self, config: &InstanceConfig) -> Result<CpuInstance, EngineError> {
        if config.state_count != STATE_COUNT {
            return Err(EngineError::Creation(format!(
                "only {STATE_COUNT} states are supported, got {}",
                config.state_count
            )));
        }
        if config.category_count != 1 {
            return Err(EngineError::Creation(format!(
                "only one rate category is supported, got {}",
                config.category_count
            )));
        }
        if config.tip_count == 0 || config.pattern_count == 0 {
            return Err(EngineError::Creation(
                "an instance needs at least one tip and one pattern".into(),
            ));
        }
        if config.compact_buffer_count > config.tip_count
            || config.eigen_buffer_count == 0
            || config.matrix_buffer_count == 0
        {
            return Err(EngineError::Creation(format!("inconsistent buffer counts: {config:?}")));
        }

        Ok(CpuInstance::new(*config))
    }
}

/// Buffers of one [`CpuEngine`] instance.
#[derive(Debug)]
pub struct CpuInstance {
    config: InstanceConfig,
    pattern_weights: Option<Vec<f64>>,
    frequencies: Vec<Option<[f64; STATE_COUNT]>>,
    category_weights: Vec<Option<f64>>,
    category_rate: f64,
    eigen: Vec<Option<EigenDecomposition>>,
    tip_states: Vec<Option<Vec<i32>>>,
    partials: Vec<Option<Vec<f64>>>,
    matrices: Vec<Option<[f64; MATRIX_SIZE]>>,
    finalized: bool,
}

/// Read-only view of a child buffer during an operation.
enum Child<'a> {
    States(&'a [i32]),
    Partials(&'a [f64]),
}

impl CpuInstance {
    fn new(config: InstanceConfig) -> Self {
        Self {
            config,
            pattern_weights: None,
            frequencies: vec![None; config.eigen_buffer_count],
            category_weights: vec![None; config.eigen_buffer_count],
            category_rate: 1.0,
            eigen: vec![None; config.eigen_buffer_count],
            tip_states: vec![None; config.compact_buffer_count],
            partials: vec![None; config.buffer_count()],
            matrices: vec![None; config.matrix_buffer_count],
            finalized: false,
        }
    }

    fn check_live(&self) -> Result<(), EngineError> {
        if self.finalized {
            Err(EngineError::Finalized)
        } else {
            Ok(())
        }
    }

    fn check_len(what: &str, got: usize, expected: usize) -> Result<(), EngineError> {
        if got == expected {
            Ok(())
        } else {
            Err(EngineError::InvalidArgument(format!(
                "{what}: expected {expected} values, got {got}"
            )))
        }
    }

    fn child(&self, buffer: usize) -> Result<Child<'_>, EngineError> {
        if buffer >= self.config.buffer_count() {
            return Err(EngineError::IndexOutOfRange {
                kind: "buffer",
                index: buffer,
            });
        }
        if let Some(Some(states)) = self.tip_states.get(buffer) {
            return Ok(Child::States(states));
        }
        match &self.partials[buffer] {
            Some(partials) => Ok(Child::Partials(partials)),
            None => Err(EngineError::Unset {
                kind: "buffer",
                index: buffer,
            }),
        }
    }

    fn matrix(&self, index: usize) -> Result<&[f64; MATRIX_SIZE], EngineError> {
        match self.matrices.get(index) {
            Some(Some(matrix)) => Ok(matrix),
            Some(None) => Err(EngineError::Unset {
                kind: "transition matrix",
                index,
            }),
            None => Err(EngineError::IndexOutOfRange {
                kind: "transition matrix",
                index,
            }),
        }
    }

    /// Σ_j P[s][j] · L[p][j] for every state `s` of pattern `p`.
    fn propagate(child: &Child<'_>, matrix: &[f64; MATRIX_SIZE], pattern: usize) -> [f64; STATE_COUNT] {
        let mut out = [0.0; STATE_COUNT];
        match child {
            Child::States(states) => {
                let code = states[pattern];
                for (s, value) in out.iter_mut().enumerate() {
                    *value = match usize::try_from(code) {
                        Ok(c) if c < STATE_COUNT => matrix[s * STATE_COUNT + c],
                        _ => 1.0,
                    };
                }
            }
            Child::Partials(partials) => {
                let below = &partials[pattern * STATE_COUNT..(pattern + 1) * STATE_COUNT];
                for (s, value) in out.iter_mut().enumerate() {
                    let row = &matrix[s * STATE_COUNT..(s + 1) * STATE_COUNT];
                    *value = row.iter().zip(below).map(|(p, l)| p * l).sum();
                }
            }
        }
        out
    }

    fn run_operation(&mut self, op: &Operation) -> Result<(), EngineError> {
        if op.scale_write.is_some() || op.scale_read.is_some() {
            return Err(EngineError::InvalidArgument("scaling is not supported".into()));
        }
        if op.destination < self.config.compact_buffer_count
            || op.destination >= self.config.buffer_count()
        {
            return Err(EngineError::IndexOutOfRange {
                kind: "partials buffer",
                index: op.destination,
            });
        }

        let patterns = self.config.pattern_count;
        let mut out = vec![0.0; patterns * STATE_COUNT];
        {
            let left = self.child(op.child1)?;
            let left_matrix = self.matrix(op.child1_matrix)?;
            let right = self.child(op.child2)?;
            let right_matrix = self.matrix(op.child2_matrix)?;

            for pattern in 0..patterns {
                let l = Self::propagate(&left, left_matrix, pattern);
                let r = Self::propagate(&right, right_matrix, pattern);
                for s in 0..STATE_COUNT {
                    out[pattern * STATE_COUNT + s] = l[s] * r[s];
                }
            }
        }
        self.partials[op.destination] = Some(out);
        Ok(())
    }
}

impl EngineInstance for CpuInstance {
    fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<(), EngineError> {
        self.check_live()?;
        Self::check_len("pattern weights", weights.len(), self.config.pattern_count)?;
        self.pattern_weights = Some(weights.to_vec());
        Ok(())
    }

    fn set_state_frequencies(&mut self, index: usize, frequencies: &[f64]) -> Result<(), EngineError> {
        self.check_live()?;
        let slot = self.frequencies.get_mut(index).ok_or(EngineError::IndexOutOfRange {
            kind: "state frequencies",
            index,
        })?;
        let frequencies: [f64; STATE_COUNT] = frequencies.try_into().map_err(|_| {
            EngineError::InvalidArgument(format!(
                "state frequencies: expected {STATE_COUNT} values, got {}",
                frequencies.len()
            ))
        })?;
        *slot = Some(frequencies);
        Ok(())
    }

    fn set_category_weights(&mut self, index: usize, weights: &[f64]) -> Result<(), EngineError> {
        self.check_live()?;
        Self::check_len("category weights", weights.len(), self.config.category_count)?;
        let slot = self.category_weights.get_mut(index).ok_or(EngineError::IndexOutOfRange {
            kind: "category weights",
            index,
        })?;
        *slot = Some(weights[0]);
        Ok(())
    }

    fn set_category_rates(&mut self, rates: &[f64]) -> Result<(), EngineError> {
        self.check_live()?;
        Self::check_len("category rates", rates.len(), self.config.category_count)?;
        self.category_rate = rates[0];
        Ok(())
    }

    fn set_eigen_decomposition(
        &mut self,
        index: usize,
        eigen: &EigenDecomposition,
    ) -> Result<(), EngineError> {
        self.check_live()?;
        let slot = self.eigen.get_mut(index).ok_or(EngineError::IndexOutOfRange {
            kind: "eigen decomposition",
            index,
        })?;
        *slot = Some(eigen.clone());
        Ok(())
    }

    fn set_tip_states(&mut self, tip: usize, states: &[i32]) -> Result<(), EngineError> {
        self.check_live()?;
        Self::check_len("tip states", states.len(), self.config.pattern_count)?;
        let slot = self.tip_states.get_mut(tip).ok_or(EngineError::IndexOutOfRange {
            kind: "tip",
            index: tip,
        })?;
        *slot = Some(states.to_vec());
        Ok(())
    }

    fn update_transition_matrices(
        &mut self,
        eigen_index: usize,
        matrix_indices: &[usize],
        edge_lengths: &[f64],
    ) -> Result<(), EngineError> {
        self.check_live()?;
        Self::check_len("edge lengths", edge_lengths.len(), matrix_indices.len())?;
        let eigen = match self.eigen.get(eigen_index) {
            Some(Some(eigen)) => eigen.clone(),
            Some(None) => {
                return Err(EngineError::Unset {
                    kind: "eigen decomposition",
                    index: eigen_index,
                });
            }
            None => {
                return Err(EngineError::IndexOutOfRange {
                    kind: "eigen decomposition",
                    index: eigen_index,
                });
            }
        };

        for (&index, &length) in matrix_indices.iter().zip(edge_lengths) {
            let slot = self.matrices.get_mut(index).ok_or(EngineError::IndexOutOfRange {
                kind: "transition matrix",
                index,
            })?;
            let t = length * self.category_rate;
            let decay: Vec<f64> = eigen.eigenvalues.iter().map(|l| (l * t).exp()).collect();

            let mut matrix = [0.0; MATRIX_SIZE];
            for i in 0..STATE_COUNT {
                for j in 0..STATE_COUNT {
                    matrix[i * STATE_COUNT + j] = (0..STATE_COUNT)
                        .map(|k| {
                            eigen.eigenvectors[i * STATE_COUNT + k]
                                * decay[k]
                                * eigen.inverse_eigenvectors[k * STATE_COUNT + j]
                        })
                        .sum();
                }
            }
            *slot = Some(matrix);
        }
        Ok(())
    }

    fn update_partials(
        &mut self,
        operations: &[Operation],
        cumulative_scale: Option<usize>,
    ) -> Result<(), EngineError> {
        self.check_live()?;
        if cumulative_scale.is_some() {
            return Err(EngineError::InvalidArgument("scaling is not supported".into()));
        }
        for op in operations {
            self.run_operation(op)?;
        }
        Ok(())
    }

    fn calculate_root_log_likelihoods(
        &mut self,
        buffer_indices: &[usize],
        category_weight_indices: &[usize],
        state_frequency_indices: &[usize],
        cumulative_scale_indices: &[Option<usize>],
    ) -> Result<f64, EngineError> {
        self.check_live()?;
        let count = buffer_indices.len();
        Self::check_len("category weight indices", category_weight_indices.len(), count)?;
        Self::check_len("state frequency indices", state_frequency_indices.len(), count)?;
        Self::check_len("cumulative scale indices", cumulative_scale_indices.len(), count)?;
        if cumulative_scale_indices.iter().any(Option::is_some) {
            return Err(EngineError::InvalidArgument("scaling is not supported".into()));
        }
        let weights = self.pattern_weights.as_deref().ok_or(EngineError::Unset {
            kind: "pattern weights",
            index: 0,
        })?;

        let mut total = 0.0;
        for i in 0..count {
            let root = buffer_indices[i];
            let partials = match self.partials.get(root) {
                Some(Some(partials)) => partials,
                Some(None) => return Err(EngineError::Unset { kind: "buffer", index: root }),
                None => {
                    return Err(EngineError::IndexOutOfRange {
                        kind: "buffer",
                        index: root,
                    });
                }
            };
            let frequencies = match self.frequencies.get(state_frequency_indices[i]) {
                Some(Some(f)) => f,
                _ => {
                    return Err(EngineError::Unset {
                        kind: "state frequencies",
                        index: state_frequency_indices[i],
                    });
                }
            };
            let category_weight = match self.category_weights.get(category_weight_indices[i]) {
                Some(Some(w)) => *w,
                _ => {
                    return Err(EngineError::Unset {
                        kind: "category weights",
                        index: category_weight_indices[i],
                    });
                }
            };

            total += weights
                .iter()
                .enumerate()
                .map(|(pattern, w)| {
                    let site: f64 = partials[pattern * STATE_COUNT..(pattern + 1) * STATE_COUNT]
                        .iter()
                        .zip(frequencies)
                        .map(|(l, pi)| pi * category_weight * l)
                        .sum();
                    w * site.ln()
                })
                .sum::<f64>();
        }
        Ok(total)
    }

    fn finalize(&mut self) -> Result<(), EngineError> {
        self.check_live()?;
        self.finalized = true;
        self.partials = Vec::new();
        self.tip_states = Vec::new();
        self.matrices = Vec::new();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SubstitutionModel;

    fn configured(tips: usize, patterns: usize) -> CpuInstance {
        let model = SubstitutionModel::jukes_cantor();
        let mut instance = CpuEngine
            .create_instance(&InstanceConfig::for_tree(tips, patterns))
            .unwrap();
        instance.set_pattern_weights(&vec![1.0; patterns]).unwrap();
        instance.set_state_frequencies(0, model.frequencies()).unwrap();
        instance.set_category_weights(0, &model.category_weights()).unwrap();
        instance.set_category_rates(&model.category_rates()).unwrap();
        instance.set_eigen_decomposition(0, model.eigen_decomposition()).unwrap();
        instance
    }

    fn jc(same: bool, t: f64) -> f64 {
        let e = (-4.0 * t / 3.0).exp();
        if same { 0.25 + 0.75 * e } else { 0.25 - 0.25 * e }
    }

    #[test]
    fn test_transition_matrix_matches_closed_form() {
        let mut instance = configured(2, 1);
        instance.update_transition_matrices(0, &[0, 1], &[0.0, 0.3]).unwrap();

        let identity = instance.matrix(0).unwrap();
        let p = instance.matrix(1).unwrap();
        for i in 0..4 {
            let row: f64 = p[i * 4..(i + 1) * 4].iter().sum();
            assert!((row - 1.0).abs() < 1e-12);
            for j in 0..4 {
                assert!((identity[i * 4 + j] - if i == j { 1.0 } else { 0.0 }).abs() < 1e-12);
                assert!((p[i * 4 + j] - jc(i == j, 0.3)).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_two_tip_likelihood() {
        // Two tips joined at the root: L = Σ_s ¼·P(s,x)·P(s,y) = ¼·P(x,y; t1+t2)
        let mut instance = configured(2, 2);
        instance.set_tip_states(0, &[0, 0]).unwrap();
        instance.set_tip_states(1, &[0, 2]).unwrap();
        instance
            .update_transition_matrices(0, &[0, 1, 2], &[0.1, 0.2, 0.0])
            .unwrap();
        instance
            .update_partials(&[Operation::combine(2, 0, 1)], None)
            .unwrap();
        let lnl = instance
            .calculate_root_log_likelihoods(&[2], &[0], &[0], &[None])
            .unwrap();

        let expected = (0.25 * jc(true, 0.3)).ln() + (0.25 * jc(false, 0.3)).ln();
        assert!((lnl - expected).abs() < 1e-12, "{lnl} vs {expected}");
    }

    #[test]
    fn test_gap_is_uninformative() {
        let mut instance = configured(2, 1);
        instance.set_tip_states(0, &[1]).unwrap();
        instance.set_tip_states(1, &[4]).unwrap();
        instance
            .update_transition_matrices(0, &[0, 1, 2], &[0.1, 0.2, 0.0])
            .unwrap();
        instance
            .update_partials(&[Operation::combine(2, 0, 1)], None)
            .unwrap();
        let lnl = instance
            .calculate_root_log_likelihoods(&[2], &[0], &[0], &[None])
            .unwrap();
        assert!((lnl - 0.25f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_unset_child_rejected() {
        let mut instance = configured(3, 1);
        instance.set_tip_states(0, &[0]).unwrap();
        instance.set_tip_states(1, &[0]).unwrap();
        instance.set_tip_states(2, &[0]).unwrap();
        instance
            .update_transition_matrices(0, &[0, 1, 2, 3, 4], &[0.1; 5])
            .unwrap();

        // Root combines buffer 3 before it was computed.
        let err = instance
            .update_partials(&[Operation::combine(4, 3, 2), Operation::combine(3, 0, 1)], None)
            .unwrap_err();
        assert_eq!(err, EngineError::Unset { kind: "buffer", index: 3 });
    }

    #[test]
    fn test_tip_buffer_not_writable() {
        let mut instance = configured(2, 1);
        instance.set_tip_states(0, &[0]).unwrap();
        instance.set_tip_states(1, &[0]).unwrap();
        instance.update_transition_matrices(0, &[0, 1, 2], &[0.1; 3]).unwrap();
        let err = instance
            .update_partials(&[Operation::combine(1, 0, 1)], None)
            .unwrap_err();
        assert!(matches!(err, EngineError::IndexOutOfRange { .. }));
    }

    #[test]
    fn test_wrong_tip_length_rejected() {
        let mut instance = configured(2, 3);
        assert!(matches!(
            instance.set_tip_states(0, &[0, 1]),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_finalize_twice() {
        let mut instance = configured(2, 1);
        instance.finalize().unwrap();
        assert_eq!(instance.finalize(), Err(EngineError::Finalized));
        assert_eq!(instance.set_pattern_weights(&[1.0]), Err(EngineError::Finalized));
    }

    #[test]
    fn test_rejects_multiple_categories() {
        let config = InstanceConfig {
            category_count: 4,
            ..InstanceConfig::for_tree(4, 10)
        };
        assert!(matches!(
            CpuEngine.create_instance(&config),
            Err(EngineError::Creation(_))
        ));
    }
}
