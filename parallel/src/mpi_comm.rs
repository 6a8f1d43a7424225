//! MPI backend, available with the `mpi` feature and an MPI installation.
//!
//! The caller owns MPI initialization:
//!
//! ```ignore
//! let _universe = mpi::initialize().expect("MPI init failed");
//! let p = MpiComm::world();
//! ```
//!
//! `isend` and `irecv` post `MPI_Isend`/`MPI_Irecv` against staging buffers
//! owned by the returned request handles and complete them in `waitall`, in
//! posted order. A posted send therefore stays in flight while later
//! receives are posted and drained, which is what the level-scheduled sweeps
//! rely on when they defer their send waits to cleanup.

use mpi::collective::SystemOperation;
use mpi::request::StaticScope;
use mpi::topology::{Communicator, SimpleCommunicator};
use mpi::traits::*;

use crate::{CommError, Parallel, Real, ReduceOp, Request, Tag};

/// An in-flight transfer whose buffer lives in the owning [`MpiRequest`].
type Transfer = mpi::request::Request<'static, [Real], StaticScope>;

/// Communicator over `MPI_COMM_WORLD`.
///
/// `mpi::initialize()` must have been called, and the returned universe must
/// outlive this value.
pub struct MpiComm;

impl MpiComm {
    /// The world communicator.
    pub fn world() -> Self {
        MpiComm
    }
}

/// Request handle for [`MpiComm`].
///
/// Holds the staging buffer the posted transfer reads or writes. The
/// transfer never outlives the buffer: `waitall` completes it, and dropping
/// an uncompleted request waits first.
pub struct MpiRequest {
    buf: Box<[Real]>,
    transfer: Option<Transfer>,
    recv: bool,
}

impl Request for MpiRequest {
    fn payload(&self) -> &[Real] {
        if self.recv && self.transfer.is_none() {
            &self.buf
        } else {
            &[]
        }
    }
}

impl Drop for MpiRequest {
    fn drop(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            transfer.wait();
        }
    }
}

fn check_rank(world: &SimpleCommunicator, rank: usize) -> Result<(), CommError> {
    if rank >= world.size() as usize {
        return Err(CommError::InvalidRank {
            rank,
            size: world.size() as usize,
        });
    }
    Ok(())
}

impl Parallel for MpiComm {
    type Request = MpiRequest;

    fn rank(&self) -> usize {
        SimpleCommunicator::world().rank() as usize
    }

    fn size(&self) -> usize {
        SimpleCommunicator::world().size() as usize
    }

    fn isend(&self, buf: &[Real], dest: usize, tag: Tag) -> Result<MpiRequest, CommError> {
        let world = SimpleCommunicator::world();
        check_rank(&world, dest)?;
        let staging: Box<[Real]> = buf.into();
        // The box's heap storage is stable across moves of the request, and
        // the transfer is always waited before the box is freed.
        let sendbuf: &'static [Real] = unsafe { &*(&*staging as *const [Real]) };
        let transfer = world
            .process_at_rank(dest as i32)
            .immediate_send_with_tag(StaticScope, sendbuf, tag);
        Ok(MpiRequest {
            buf: staging,
            transfer: Some(transfer),
            recv: false,
        })
    }

    fn irecv(&self, len: usize, src: usize, tag: Tag) -> Result<MpiRequest, CommError> {
        let world = SimpleCommunicator::world();
        check_rank(&world, src)?;
        let mut staging: Box<[Real]> = vec![0.0; len].into_boxed_slice();
        // Same invariant as in isend; nothing else touches the box while
        // the transfer is in flight.
        let recvbuf: &'static mut [Real] = unsafe { &mut *(&mut *staging as *mut [Real]) };
        let transfer = world
            .process_at_rank(src as i32)
            .immediate_receive_into_with_tag(StaticScope, recvbuf, tag);
        Ok(MpiRequest {
            buf: staging,
            transfer: Some(transfer),
            recv: true,
        })
    }

    fn waitall(&self, reqs: &mut [MpiRequest]) -> Result<(), CommError> {
        for req in reqs {
            if let Some(transfer) = req.transfer.take() {
                transfer.wait();
            }
        }
        Ok(())
    }

    fn all_reduce(
        &self,
        local: &[Real],
        global: &mut [Real],
        op: ReduceOp,
    ) -> Result<(), CommError> {
        if local.len() != global.len() {
            return Err(CommError::CollectiveMismatch {
                send: local.len(),
                recv: global.len(),
            });
        }
        if local.is_empty() {
            self.barrier();
            return Ok(());
        }
        let world = SimpleCommunicator::world();
        let sysop = match op {
            ReduceOp::Sum => SystemOperation::sum(),
            ReduceOp::Min => SystemOperation::min(),
            ReduceOp::Max => SystemOperation::max(),
        };
        world.all_reduce_into(local, global, sysop);
        Ok(())
    }

    fn barrier(&self) {
        SimpleCommunicator::world().barrier();
    }
}
