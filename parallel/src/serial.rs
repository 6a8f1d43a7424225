//! Single-rank backend.

use crate::{CommError, Parallel, Real, ReduceOp, Request, Tag};

/// A communicator with one rank and no peers.
///
/// Collectives pass values through unchanged. A pruned reduction tree on a
/// single rank never messages, so point-to-point calls are errors rather
/// than loopbacks.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialComm;

/// Request type for [`SerialComm`]; never constructed.
#[derive(Debug)]
pub struct SerialRequest;

impl Request for SerialRequest {
    fn payload(&self) -> &[Real] {
        &[]
    }
}

impl Parallel for SerialComm {
    type Request = SerialRequest;

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn isend(&self, _buf: &[Real], _dest: usize, _tag: Tag) -> Result<SerialRequest, CommError> {
        Err(CommError::NoPeers)
    }

    fn irecv(&self, _len: usize, _src: usize, _tag: Tag) -> Result<SerialRequest, CommError> {
        Err(CommError::NoPeers)
    }

    fn waitall(&self, reqs: &mut [SerialRequest]) -> Result<(), CommError> {
        debug_assert!(reqs.is_empty());
        Ok(())
    }

    fn all_reduce(
        &self,
        local: &[Real],
        global: &mut [Real],
        _op: ReduceOp,
    ) -> Result<(), CommError> {
        if local.len() != global.len() {
            return Err(CommError::CollectiveMismatch {
                send: local.len(),
                recv: global.len(),
            });
        }
        global.copy_from_slice(local);
        Ok(())
    }

    fn barrier(&self) {}
}
