//! # Message passing for distributed tree reductions
//!
//! The reduction engine in `qlt-tree` is written against the [`Parallel`]
//! trait defined here: rank/size queries, non-blocking point-to-point
//! messages completed by [`Parallel::waitall`], and a small set of blocking
//! collectives. Three backends are provided:
//!
//! * [`SerialComm`], a single rank with no peers.
//! * [`ThreadComm`], N ranks inside one process backed by shared mailboxes.
//!   Collectives combine contributions in rank order, so reductions are
//!   deterministic; this is what the test suites run on.
//! * `MpiComm`, a veneer over the `mpi` crate, available with the `mpi`
//!   feature and an MPI installation.
//!
//! Message ordering between a pair of ranks follows MPI semantics: messages
//! with the same `(source, destination, tag)` are received in the order they
//! were sent.
#![cfg_attr(feature = "strict", deny(warnings))]
#![warn(missing_docs)]

use thiserror::Error;

#[cfg(feature = "mpi")]
mod mpi_comm;
mod serial;
mod thread;

#[cfg(feature = "mpi")]
pub use mpi_comm::{MpiComm, MpiRequest};
pub use serial::{SerialComm, SerialRequest};
pub use thread::{ThreadComm, ThreadRequest};

/// Scalar carried by messages and reductions.
pub type Real = f64;

/// Message tag.
pub type Tag = i32;

/// Errors surfaced by a communication backend.
#[derive(Debug, Error)]
pub enum CommError {
    /// A peer rank outside `[0, size)`.
    #[error("rank {rank} is not a valid peer (communicator size {size})")]
    InvalidRank {
        /// Offending rank.
        rank: usize,
        /// Communicator size.
        size: usize,
    },
    /// A received message did not fit the posted window.
    #[error("message from rank {src} carries {got} values but the posted window holds {want}")]
    SizeMismatch {
        /// Sending rank.
        src: usize,
        /// Window length in values.
        want: usize,
        /// Message length in values.
        got: usize,
    },
    /// Point-to-point messaging on a communicator without peers.
    #[error("point-to-point messaging is not available on a serial communicator")]
    NoPeers,
    /// Mismatched buffer lengths passed to a collective.
    #[error("collective buffers disagree in length: send {send}, recv {recv}")]
    CollectiveMismatch {
        /// Send buffer length.
        send: usize,
        /// Receive buffer length.
        recv: usize,
    },
}

/// Reduction operators for [`Parallel::all_reduce`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    /// Elementwise sum.
    Sum,
    /// Elementwise minimum.
    Min,
    /// Elementwise maximum.
    Max,
}

impl ReduceOp {
    /// Combine `b` into `a`, elementwise, with `a` the lower-ranked operand.
    pub fn apply(self, a: &mut [Real], b: &[Real]) {
        debug_assert_eq!(a.len(), b.len());
        match self {
            ReduceOp::Sum => {
                for (x, y) in a.iter_mut().zip(b) {
                    *x += *y;
                }
            }
            ReduceOp::Min => {
                for (x, y) in a.iter_mut().zip(b) {
                    *x = x.min(*y);
                }
            }
            ReduceOp::Max => {
                for (x, y) in a.iter_mut().zip(b) {
                    *x = x.max(*y);
                }
            }
        }
    }
}

/// Handle to an in-flight non-blocking operation.
///
/// A request is inert until passed to [`Parallel::waitall`]. Completed
/// receives expose their payload; the caller copies it into the window the
/// receive was posted for.
pub trait Request {
    /// Payload of a completed receive; empty for sends.
    fn payload(&self) -> &[Real];
}

/// The message-passing context a reduction engine runs in.
///
/// One instance per rank. All collectives must be entered by every rank in
/// the same order.
pub trait Parallel: Send + Sync {
    /// Backend request handle.
    type Request: Request + Send;

    /// This process's rank.
    fn rank(&self) -> usize;

    /// Number of ranks.
    fn size(&self) -> usize;

    /// The root rank.
    fn root(&self) -> usize {
        0
    }

    /// Whether this rank is the root.
    fn amroot(&self) -> bool {
        self.rank() == self.root()
    }

    /// Start sending `buf` to `dest`. The data is staged, so `buf` may be
    /// reused as soon as the call returns.
    fn isend(&self, buf: &[Real], dest: usize, tag: Tag) -> Result<Self::Request, CommError>;

    /// Post a receive of `len` values from `src`.
    fn irecv(&self, len: usize, src: usize, tag: Tag) -> Result<Self::Request, CommError>;

    /// Complete all requests, in posted order.
    fn waitall(&self, reqs: &mut [Self::Request]) -> Result<(), CommError>;

    /// Reduce `local` across all ranks into `global` on every rank.
    ///
    /// Contributions are combined in rank order, so for a fixed set of
    /// inputs the result does not depend on arrival timing.
    fn all_reduce(
        &self,
        local: &[Real],
        global: &mut [Real],
        op: ReduceOp,
    ) -> Result<(), CommError>;

    /// Block until every rank has entered the barrier.
    fn barrier(&self);
}
