//! The flat per-rank data buffers the sweeps operate on.

use qlt_parallel::Real;

use crate::types::meta::MetaData;

/// Bulk storage for both sweeps.
///
/// Each of this rank's `nslots` slots holds one L2R record and one R2L
/// record; a node's records start at `slot * width`. Message windows are
/// contiguous runs of slots, so a message is a single slice of one of these
/// buffers.
#[derive(Clone, Debug, Default)]
pub struct BulkData {
    /// Leaves-to-root records.
    pub l2r_data: Vec<Real>,
    /// Root-to-leaves records.
    pub r2l_data: Vec<Real>,
}

impl BulkData {
    /// Allocate for `nslots` slots with the widths `md` dictates.
    pub fn new(md: &MetaData, nslots: usize) -> Self {
        BulkData {
            l2r_data: vec![0.0; md.l2r_width() * nslots],
            r2l_data: vec![0.0; md.r2l_width() * nslots],
        }
    }
}
