//! Evaluate the log-likelihood of one tree.
//!
//! # Call sequence
//! Everything that can fail without the engine happens first, in
//! [`LikelihoodEvaluator::plan`]: tip count check, indexing, schedule,
//! tip-name lookup. Only then is an instance created, and it is driven
//! through a fixed order:
//!
//! 1. pattern weights, state frequencies, category weight and rate,
//!    eigendecomposition
//! 2. tip states, one call per tip
//! 3. transition matrices for all `2n-1` edges in one call
//! 4. the whole operation schedule in one call
//! 5. the root log-likelihood
//!
//! and is finalized afterwards whether or not a step failed.

use crate::alignment::EncodedAlignment;
use crate::engine::{CreationGate, EngineInstance, InstanceConfig, LikelihoodEngine};
use crate::error::{LikelihoodError, Result};
use crate::indexer::{IndexedTree, NodeIndexer};
use crate::model::SubstitutionModel;
use crate::schedule::{build_schedule, OperationSchedule};
use phylotree::tree::Tree as PhyloTree;

const EIGEN_INDEX: usize = 0;
const CATEGORY_WEIGHT_INDEX: usize = 0;
const STATE_FREQUENCY_INDEX: usize = 0;

/// Everything derived from one tree before the engine is involved.
#[derive(Debug, Clone)]
pub struct TreePlan<'a> {
    pub indexed: IndexedTree,
    pub schedule: OperationSchedule,
    /// `(tip buffer, state codes)` for every tip.
    pub tip_states: Vec<(usize, &'a [i32])>,
}

/// Computes tree log-likelihoods against a shared alignment and model.
#[derive(Debug, Clone, Copy)]
pub struct LikelihoodEvaluator<'a> {
    alignment: &'a EncodedAlignment,
    model: &'a SubstitutionModel,
    indexer: NodeIndexer,
}

impl<'a> LikelihoodEvaluator<'a> {
    pub fn new(alignment: &'a EncodedAlignment, model: &'a SubstitutionModel) -> Self {
        Self {
            alignment,
            model,
            indexer: NodeIndexer::new(alignment.sequence_count()),
        }
    }

    pub fn alignment(&self) -> &'a EncodedAlignment {
        self.alignment
    }

    /// Index the tree, build its schedule and look up every tip's states.
    pub fn plan(&self, tree: &PhyloTree) -> Result<TreePlan<'a>> {
        let indexed = self.indexer.index(tree)?;
        let schedule = build_schedule(&indexed)?;

        let alignment = self.alignment;
        let tip_states = indexed
            .tips()
            .map(|(index, name)| {
                alignment
                    .tip_states(name)
                    .map(|states| (index, states))
                    .ok_or_else(|| LikelihoodError::UnknownTaxon(name.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(TreePlan {
            indexed,
            schedule,
            tip_states,
        })
    }

    /// Instance layout for a plan.
    pub fn instance_config(&self, plan: &TreePlan<'_>) -> InstanceConfig {
        InstanceConfig::for_tree(plan.indexed.tip_count(), self.alignment.pattern_count())
    }

    /// Drive an already created instance through the call sequence.
    pub fn run<I: EngineInstance + ?Sized>(&self, instance: &mut I, plan: &TreePlan<'_>) -> Result<f64> {
        let eigen = self.model.eigen_decomposition();
        instance.set_pattern_weights(self.alignment.weights())?;
        instance.set_state_frequencies(STATE_FREQUENCY_INDEX, self.model.frequencies())?;
        instance.set_category_weights(CATEGORY_WEIGHT_INDEX, &self.model.category_weights())?;
        instance.set_category_rates(&self.model.category_rates())?;
        instance.set_eigen_decomposition(EIGEN_INDEX, eigen)?;

        for &(tip, states) in &plan.tip_states {
            instance.set_tip_states(tip, states)?;
        }

        let edge_lengths = plan.indexed.edge_lengths();
        let matrix_indices: Vec<usize> = (0..edge_lengths.len()).collect();
        instance.update_transition_matrices(EIGEN_INDEX, &matrix_indices, edge_lengths)?;

        instance.update_partials(plan.schedule.operations(), None)?;

        let lnl = instance.calculate_root_log_likelihoods(
            &[plan.schedule.root()],
            &[CATEGORY_WEIGHT_INDEX],
            &[STATE_FREQUENCY_INDEX],
            &[None],
        )?;
        Ok(lnl)
    }

    /// Plan, create an instance through `gate`, run, and finalize.
    pub fn evaluate<E: LikelihoodEngine>(
        &self,
        engine: &E,
        gate: &CreationGate,
        tree: &PhyloTree,
    ) -> Result<f64> {
        let plan = self.plan(tree)?;
        let mut instance = gate.create(engine, &self.instance_config(&plan))?;

        let outcome = self.run(&mut *instance, &plan);
        let released = instance.close();
        let lnl = outcome?;
        released?;

        tracing::debug!(
            tips = plan.indexed.tip_count(),
            operations = plan.schedule.len(),
            lnl,
            "evaluated tree"
        );
        Ok(lnl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::Alignment;
    use crate::encoding::UnknownCharPolicy;
    use crate::engine::counting::CountingEngine;
    use crate::engine::cpu::CpuEngine;
    use crate::error::ErrorKind;
    use crate::indexer::tests::parse;

    /// Independent brute-force value: sum over all 4³ ancestral state
    /// assignments with closed-form Jukes–Cantor probabilities.
    const REFERENCE_LNL: f64 = -33.61991349212056;

    const ULTRAMETRIC: &str = "((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1);";

    fn encoded(records: &[(&str, &str)]) -> EncodedAlignment {
        Alignment::new(
            records
                .iter()
                .map(|(n, s)| (n.to_string(), s.as_bytes().to_vec()))
                .collect(),
        )
        .unwrap()
        .compress()
        .encode(UnknownCharPolicy::Adenine)
        .unwrap()
    }

    fn four_taxa() -> EncodedAlignment {
        encoded(&[
            ("A", "ACGTACGTAA"),
            ("B", "ACGTACGTCA"),
            ("C", "ACTTACGAA-"),
            ("D", "GCTTACGAAC"),
        ])
    }

    fn jc(same: bool, t: f64) -> f64 {
        let e = (-4.0 * t / 3.0).exp();
        if same { 0.25 + 0.75 * e } else { 0.25 - 0.25 * e }
    }

    fn brute_force(columns: &[[usize; 4]]) -> f64 {
        let leaf = |s: usize, c: usize| if c == 4 { 1.0 } else { jc(s == c, 0.1) };
        columns
            .iter()
            .map(|&[a, b, c, d]| {
                let mut site = 0.0;
                for r in 0..4 {
                    for u in 0..4 {
                        for v in 0..4 {
                            site += 0.25
                                * jc(r == u, 0.1)
                                * leaf(u, a)
                                * leaf(u, b)
                                * jc(r == v, 0.1)
                                * leaf(v, c)
                                * leaf(v, d);
                        }
                    }
                }
                site.ln()
            })
            .sum()
    }

    #[test]
    fn test_ultrametric_reference() {
        let alignment = four_taxa();
        let model = SubstitutionModel::jukes_cantor();
        let evaluator = LikelihoodEvaluator::new(&alignment, &model);

        let lnl = evaluator
            .evaluate(&CpuEngine, &CreationGate::new(), &parse(ULTRAMETRIC))
            .unwrap();
        assert!((lnl - REFERENCE_LNL).abs() < 1e-6, "{lnl}");
    }

    #[test]
    fn test_matches_brute_force() {
        let code = |c: u8| crate::encoding::state_code(c).unwrap() as usize;
        let rows = ["ACGTACGTAA", "ACGTACGTCA", "ACTTACGAA-", "GCTTACGAAC"];
        let columns: Vec<[usize; 4]> = (0..10)
            .map(|i| [0, 1, 2, 3].map(|r| code(rows[r].as_bytes()[i])))
            .collect();
        assert!((brute_force(&columns) - REFERENCE_LNL).abs() < 1e-9);
    }

    #[test]
    fn test_deterministic() {
        let alignment = four_taxa();
        let model = SubstitutionModel::jukes_cantor();
        let evaluator = LikelihoodEvaluator::new(&alignment, &model);
        let gate = CreationGate::new();
        let tree = parse("((A:0.05,C:0.2):0.13,(B:0.3,D:0.01):0.02);");

        let first = evaluator.evaluate(&CpuEngine, &gate, &tree).unwrap();
        let second = evaluator.evaluate(&CpuEngine, &gate, &tree).unwrap();
        assert!((first - second).abs() < 1e-12);
    }

    #[test]
    fn test_rooting_does_not_matter() {
        // Reversible model: moving the root along an edge keeps the likelihood.
        let alignment = four_taxa();
        let model = SubstitutionModel::jukes_cantor();
        let evaluator = LikelihoodEvaluator::new(&alignment, &model);
        let gate = CreationGate::new();

        let a = evaluator
            .evaluate(&CpuEngine, &gate, &parse("((A:0.1,B:0.1):0.15,(C:0.1,D:0.1):0.05);"))
            .unwrap();
        let b = evaluator
            .evaluate(&CpuEngine, &gate, &parse("(A:0.1,(B:0.1,(C:0.1,D:0.1):0.2):0.0);"))
            .unwrap();
        assert!((a - b).abs() < 1e-9, "{a} vs {b}");
    }

    #[test]
    fn test_tip_count_mismatch_makes_no_engine_call() {
        let alignment = four_taxa();
        let model = SubstitutionModel::jukes_cantor();
        let evaluator = LikelihoodEvaluator::new(&alignment, &model);
        let engine = CountingEngine::new(CpuEngine);

        let err = evaluator
            .evaluate(&engine, &CreationGate::new(), &parse("((A:0.1,B:0.1):0.1,C:0.1);"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(engine.stats().created + engine.stats().failed, 0);
    }

    #[test]
    fn test_unknown_taxon() {
        let alignment = four_taxa();
        let model = SubstitutionModel::jukes_cantor();
        let evaluator = LikelihoodEvaluator::new(&alignment, &model);
        let engine = CountingEngine::new(CpuEngine);

        let err = evaluator
            .evaluate(&engine, &CreationGate::new(), &parse("((A:0.1,B:0.1):0.1,(C:0.1,X:0.1):0.1);"))
            .unwrap_err();
        assert!(matches!(err, LikelihoodError::UnknownTaxon(ref name) if name == "X"));
        assert_eq!(engine.stats().created, 0);
    }

    #[test]
    fn test_duplicate_tip_makes_no_engine_call() {
        let alignment = four_taxa();
        let model = SubstitutionModel::jukes_cantor();
        let evaluator = LikelihoodEvaluator::new(&alignment, &model);
        let engine = CountingEngine::new(CpuEngine);

        let err = evaluator
            .evaluate(&engine, &CreationGate::new(), &parse("((A:0.1,A:0.1):0.1,(C:0.1,D:0.1):0.1);"))
            .unwrap_err();
        assert!(matches!(err, LikelihoodError::DuplicateTaxon(ref name) if name == "A"));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        let stats = engine.stats();
        assert_eq!(stats.created + stats.failed, 0);
    }

    #[test]
    fn test_instance_released_on_success() {
        let alignment = four_taxa();
        let model = SubstitutionModel::jukes_cantor();
        let evaluator = LikelihoodEvaluator::new(&alignment, &model);
        let engine = CountingEngine::new(CpuEngine);

        evaluator
            .evaluate(&engine, &CreationGate::new(), &parse(ULTRAMETRIC))
            .unwrap();
        let stats = engine.stats();
        assert_eq!((stats.created, stats.finalized), (1, 1));
    }

    #[test]
    fn test_plan_layout() {
        let alignment = four_taxa();
        let model = SubstitutionModel::jukes_cantor();
        let evaluator = LikelihoodEvaluator::new(&alignment, &model);

        let plan = evaluator.plan(&parse(ULTRAMETRIC)).unwrap();
        let config = evaluator.instance_config(&plan);
        assert_eq!(config.tip_count, 4);
        assert_eq!(config.pattern_count, alignment.pattern_count());
        assert_eq!(config.matrix_buffer_count, plan.indexed.edge_lengths().len());
        assert_eq!(plan.tip_states.len(), 4);
        assert_eq!(plan.schedule.root(), 6);
    }
}
