//! Error types for tree likelihood evaluation.

use crate::engine::EngineError;
use thiserror::Error;

/// Result type alias for likelihood operations.
pub type Result<T> = std::result::Result<T, LikelihoodError>;

/// Coarse classification of a [`LikelihoodError`].
///
/// `Configuration` errors concern the pairing of alignment and tree,
/// `Topology` errors the shape of a single tree, `Engine` errors a rejected
/// engine call. `Input` covers unreadable or unparseable files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Topology,
    Engine,
    Input,
    Panic,
}

/// Errors that can occur while evaluating tree likelihoods.
#[derive(Error, Debug)]
pub enum LikelihoodError {
    /// The alignment and the tree disagree on the number of taxa.
    #[error("number of sequences ({sequences}) doesn't match the number of tips ({tips})")]
    TipCountMismatch { sequences: usize, tips: usize },

    /// A tip name has no sequence in the alignment.
    #[error("tip '{0}' has no sequence in the alignment")]
    UnknownTaxon(String),

    /// Two tips carry the same name.
    #[error("tip '{0}' appears more than once in the tree")]
    DuplicateTaxon(String),

    /// A tip without a name cannot be matched to a sequence.
    #[error("tip without a name (node {0})")]
    UnnamedTip(usize),

    /// A non-root internal node is not bifurcating.
    #[error("internal node {index} has {degree} neighbours, expected 3")]
    InternalDegree { index: usize, degree: usize },

    /// The root does not have exactly two children.
    #[error("root has {0} children, expected 2")]
    RootDegree(usize),

    /// The first neighbour of an internal node is not the node it was reached from.
    #[error("neighbours of internal node {0} are not ordered parent-first")]
    NeighbourOrder(usize),

    /// The tree has no internal node to combine.
    #[error("no operations to do")]
    EmptySchedule,

    /// An edge length is negative or not a number.
    #[error("invalid branch length {length} above node {index}")]
    InvalidBranchLength { index: usize, length: f64 },

    /// The likelihood engine rejected a call.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// A tree could not be parsed.
    #[error("failed to parse tree: {0}")]
    TreeParse(String),

    /// A tree could not be traversed.
    #[error("tree error: {0}")]
    Tree(String),

    /// The alignment is malformed.
    #[error("alignment error: {0}")]
    Alignment(String),

    /// The worker evaluating a tree panicked.
    #[error("worker panicked: {0}")]
    WorkerPanic(String),

    /// The worker pool could not be built.
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LikelihoodError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TipCountMismatch { .. } | Self::UnknownTaxon(_) | Self::DuplicateTaxon(_) => {
                ErrorKind::Configuration
            }
            Self::UnnamedTip(_)
            | Self::InternalDegree { .. }
            | Self::RootDegree(_)
            | Self::NeighbourOrder(_)
            | Self::EmptySchedule
            | Self::InvalidBranchLength { .. }
            | Self::Tree(_) => ErrorKind::Topology,
            Self::Engine(_) => ErrorKind::Engine,
            Self::TreeParse(_) | Self::Alignment(_) | Self::Pool(_) | Self::Io(_) => {
                ErrorKind::Input
            }
            Self::WorkerPanic(_) => ErrorKind::Panic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let mismatch = LikelihoodError::TipCountMismatch { sequences: 4, tips: 5 };
        assert_eq!(mismatch.kind(), ErrorKind::Configuration);
        assert_eq!(
            mismatch.to_string(),
            "number of sequences (4) doesn't match the number of tips (5)"
        );

        let degree = LikelihoodError::InternalDegree { index: 7, degree: 4 };
        assert_eq!(degree.kind(), ErrorKind::Topology);

        let engine = LikelihoodError::from(EngineError::InvalidArgument("bad".into()));
        assert_eq!(engine.kind(), ErrorKind::Engine);
    }
}
