//! The engine's error taxonomy.
//!
//! Everything here is either a configuration mistake or a broken invariant: both are fatal, and
//! both are returned rather than panicked on so that an embedding process can shut a run down
//! cleanly. The one genuinely recoverable condition — an export buffer filling up mid-walk — is
//! not an error at all; it is signalled through [`crate::export::PushOutcome`] and handled by
//! resuming the same fixed-size buffer over whatever of the work set didn't fit, rather than
//! growing it — see [`crate::phases::toptree_phase`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("query/result record size {size} is not a multiple of 8 bytes")]
    UnalignedRecord { size: usize },

    #[error("not enough memory to export even 100 particles: have {have} bytes, need at least {need}")]
    InsufficientExportMemory { have: usize, need: usize },

    #[error("zero worker threads requested")]
    ZeroThreads,

    #[error("tree mask {tree_mask:#x} does not cover requested iterator mask {iter_mask:#x}")]
    MaskMismatch { tree_mask: u32, iter_mask: u32 },

    #[error("symmetric treewalk requested but the tree has not computed Hmax")]
    SymmetricWithoutHmax,

    #[error("pseudo-node {node} encountered while walking in ghost mode")]
    PseudoNodeInGhostWalk { node: i64 },

    #[error("reduced result for particle {target} arrived with no matching export record")]
    UnmatchedResult { target: usize },

    #[error("task {task} sent {actual} exports, but the receiver expected {expected}")]
    SendCountMismatch { task: usize, expected: usize, actual: usize },

    #[error("smoothing length did not converge after {max_iter} iterations, {remaining} particles left over")]
    ConvergenceExceeded { max_iter: u32, remaining: usize },

    #[error("bisection bracket for particle {target} never closed: lower {lower} >= upper {upper}")]
    BracketDidNotClose { target: usize, lower: f64, upper: f64 },
}
