//! Error type for tree analysis and the reduction engine.

use qlt_parallel::CommError;
use thiserror::Error;

/// Errors surfaced by analysis, setup, and the sweeps.
///
/// Setup errors are precondition violations and fatal to the operation that
/// raised them; communication errors are passed through from the transport
/// unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// The input tree violates a structural precondition.
    #[error("malformed tree: {0}")]
    MalformedTree(String),
    /// A leaf cell index outside `[0, ncells)`.
    #[error("cell index {cellidx} is outside [0, {ncells})")]
    CellIndexOutOfRange {
        /// Offending cell index.
        cellidx: usize,
        /// Global cell count.
        ncells: usize,
    },
    /// The same cell index appears on more than one leaf.
    #[error("cell index {0} appears on more than one leaf")]
    DuplicateCellIndex(usize),
    /// A problem-type mask outside the accepted combinations.
    #[error("invalid problem type mask {0:#05b}")]
    InvalidProblemType(u32),
    /// A tracer was declared after `end_tracer_declarations`.
    #[error("tracer declarations are closed")]
    DeclarationsClosed,
    /// A global cell index this rank does not own.
    #[error("global cell {0} is not owned by this rank")]
    CellNotOwned(usize),
    /// The caller's local value count disagrees with the owned leaf count.
    #[error("caller holds {got} local values but this rank owns {want} leaves")]
    LeafCountMismatch {
        /// Owned leaf count.
        want: usize,
        /// Caller's value count.
        got: usize,
    },
    /// Transport failure.
    #[error(transparent)]
    Comm(#[from] CommError),
}
