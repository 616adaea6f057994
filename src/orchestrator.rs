//! Evaluate many trees concurrently.
//!
//! # Overview
//! Trees arrive from a single source (possibly a stream being parsed while
//! earlier trees are evaluated). A feeder thread pushes them, numbered in
//! arrival order, into a bounded queue; `W` workers on a dedicated rayon pool
//! pull from it until the queue is closed and drained. Each worker evaluates
//! its tree alone, start to finish, on its own engine instance, then sends a
//! [`TreeOutcome`] back to the calling thread.
//!
//! ```text
//!  trees ──► feeder ──► [ queue ] ──► worker 0 ──┐
//!                                 ├─► worker 1 ──┼──► outcomes ──► caller
//!                                 └─► worker W-1 ┘
//! ```
//!
//! # Shared state
//! The alignment, model and engine factory are shared read-only. The only
//! serialisation point is the [`CreationGate`] around instance creation.
//!
//! # Failures
//! A failing tree yields an `Err` outcome and the worker moves on. A panic
//! while evaluating a tree is caught and reported the same way. Only a tip
//! count mismatch on the first tree aborts the run, before any worker starts.

use crate::alignment::EncodedAlignment;
use crate::encoding::UnknownCharPolicy;
use crate::engine::{CreationGate, LikelihoodEngine};
use crate::error::{LikelihoodError, Result};
use crate::evaluator::LikelihoodEvaluator;
use crate::model::SubstitutionModel;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use phylotree::tree::Tree as PhyloTree;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

/// Run-level settings.
#[derive(Debug, Clone, Copy)]
pub struct RunConfig {
    /// Number of concurrent workers, clamped to `[1, available parallelism]`.
    pub workers: usize,
    pub unknown_chars: UnknownCharPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            unknown_chars: UnknownCharPolicy::default(),
        }
    }
}

impl RunConfig {
    /// Worker count actually used.
    pub fn effective_workers(&self) -> usize {
        clamp_workers(self.workers)
    }
}

fn clamp_workers(requested: usize) -> usize {
    let available = std::thread::available_parallelism().map_or(1, usize::from);
    requested.clamp(1, available)
}

/// Result for one tree, `index` being its position in the source.
#[derive(Debug)]
pub struct TreeOutcome {
    pub index: usize,
    pub result: Result<f64>,
}

/// Totals for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub evaluated: usize,
    pub failed: usize,
}

/// Fans trees out over a pool of workers sharing one alignment and model.
pub struct Orchestrator<'a, E> {
    evaluator: LikelihoodEvaluator<'a>,
    engine: &'a E,
    gate: CreationGate,
    workers: usize,
}

impl<'a, E: LikelihoodEngine> Orchestrator<'a, E> {
    /// `workers` is clamped to `[1, available parallelism]`.
    pub fn new(
        alignment: &'a EncodedAlignment,
        model: &'a SubstitutionModel,
        engine: &'a E,
        workers: usize,
    ) -> Self {
        Self {
            evaluator: LikelihoodEvaluator::new(alignment, model),
            engine,
            gate: CreationGate::new(),
            workers: clamp_workers(workers),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Evaluate every tree and collect the outcomes, sorted by tree index.
    pub fn evaluate_all<I>(&self, trees: I) -> Result<Vec<TreeOutcome>>
    where
        I: IntoIterator<Item = Result<PhyloTree>>,
        I::IntoIter: Send,
    {
        let mut outcomes = Vec::new();
        self.evaluate_with(trees, |outcome| outcomes.push(outcome))?;
        outcomes.sort_by_key(|o| o.index);
        Ok(outcomes)
    }

    /// Evaluate every tree, handing each outcome to `on_outcome` on the
    /// calling thread as soon as it is available, in completion order.
    ///
    /// Source items that are already errors (e.g. unparseable trees) are
    /// reported as failed outcomes without reaching a worker.
    ///
    /// # Errors
    /// Only run-level failures: the first tree's tip count differs from the
    /// alignment, or the worker pool cannot be built. A run in which every
    /// tree fails still returns `Ok`.
    pub fn evaluate_with<I, F>(&self, trees: I, mut on_outcome: F) -> Result<RunSummary>
    where
        I: IntoIterator<Item = Result<PhyloTree>>,
        I::IntoIter: Send,
        F: FnMut(TreeOutcome),
    {
        let mut trees = trees.into_iter();
        let first = trees.next();
        if let Some(Ok(tree)) = &first {
            let tips = tree.get_leaves().len();
            let sequences = self.evaluator.alignment().sequence_count();
            if tips != sequences {
                return Err(LikelihoodError::TipCountMismatch { sequences, tips });
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("lk-worker-{i}"))
            .build()?;

        let started = Instant::now();
        let (tree_tx, tree_rx) = bounded::<(usize, PhyloTree)>(self.workers * 2);
        let (outcome_tx, outcome_rx) = unbounded::<TreeOutcome>();
        let mut summary = RunSummary::default();

        std::thread::scope(|scope| {
            let feeder_outcomes = outcome_tx.clone();
            scope.spawn(move || {
                let source = first.into_iter().chain(trees);
                feed(source, tree_tx, feeder_outcomes);
            });

            pool.in_place_scope(|pool_scope| {
                for worker in 0..self.workers {
                    let queue = tree_rx.clone();
                    let outcomes = outcome_tx.clone();
                    pool_scope.spawn(move |_| self.work(worker, queue, outcomes));
                }
                drop(tree_rx);
                drop(outcome_tx);

                for outcome in outcome_rx.iter() {
                    match &outcome.result {
                        Ok(_) => summary.evaluated += 1,
                        Err(e) => {
                            summary.failed += 1;
                            tracing::warn!(tree = outcome.index, "tree failed: {e}");
                        }
                    }
                    on_outcome(outcome);
                }
            });
        });

        tracing::info!(
            evaluated = summary.evaluated,
            failed = summary.failed,
            workers = self.workers,
            "finished in {:.3}s",
            started.elapsed().as_secs_f64()
        );
        Ok(summary)
    }

    /// Worker loop: one tree at a time until the queue is closed.
    fn work(&self, worker: usize, queue: Receiver<(usize, PhyloTree)>, outcomes: Sender<TreeOutcome>) {
        for (index, tree) in queue.iter() {
            tracing::debug!(worker, tree = index, "evaluating");
            let result = catch_unwind(AssertUnwindSafe(|| {
                self.evaluator.evaluate(self.engine, &self.gate, &tree)
            }))
            .unwrap_or_else(|payload| Err(LikelihoodError::WorkerPanic(panic_message(payload))));

            if outcomes.send(TreeOutcome { index, result }).is_err() {
                break;
            }
        }
    }
}

/// Number the source items and push the trees into the queue. Dropping the
/// sender at the end closes the queue.
///
/// A panic inside the source is reported against the item it was producing
/// and ends the stream; the trees already queued are still evaluated.
fn feed<I>(mut source: I, queue: Sender<(usize, PhyloTree)>, outcomes: Sender<TreeOutcome>)
where
    I: Iterator<Item = Result<PhyloTree>>,
{
    for index in 0.. {
        let item = match catch_unwind(AssertUnwindSafe(|| source.next())) {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(payload) => {
                let result = Err(LikelihoodError::WorkerPanic(panic_message(payload)));
                let _ = outcomes.send(TreeOutcome { index, result });
                break;
            }
        };
        match item {
            Ok(tree) => {
                if queue.send((index, tree)).is_err() {
                    break;
                }
            }
            Err(e) => {
                if outcomes.send(TreeOutcome { index, result: Err(e) }).is_err() {
                    break;
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
