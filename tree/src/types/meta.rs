//! Tracer metadata: declaration collection and the frozen prefix tables.

use crate::error::Error;
use crate::types::problem::{ProblemKind, NPROBTYPES};

/// Collects tracer declarations until the set is frozen.
#[derive(Clone, Debug, Default)]
pub struct MetaDataBuilder {
    /// Canonical problem kind per tracer, in declaration order.
    pub trcr2prob: Vec<ProblemKind>,
}

impl MetaDataBuilder {
    /// Record one tracer with the given problem-type mask.
    pub fn declare(&mut self, mask: u32) -> Result<(), Error> {
        self.trcr2prob.push(ProblemKind::from_mask(mask)?);
        Ok(())
    }
}

/// Frozen tracer metadata.
///
/// Tracers are reordered so that all tracers of one canonical kind form a
/// contiguous block inside the bulk records; the prefix tables map between
/// the caller's tracer index, the blocked index, and the displacement of a
/// tracer's values inside an L2R or R2L record. Slot value 0 of every L2R
/// record is the total density, so `prob2bl2r` starts at 1.
#[derive(Clone, Debug)]
pub struct MetaData {
    /// Canonical kind per tracer (caller's index).
    pub trcr2prob: Vec<ProblemKind>,
    /// Blocked index to caller's tracer index.
    pub bidx2trcr: Vec<usize>,
    /// Caller's tracer index to blocked index.
    pub trcr2bidx: Vec<usize>,
    /// Caller's tracer index to its L2R record displacement.
    pub trcr2bl2r: Vec<usize>,
    /// Caller's tracer index to its R2L record displacement.
    pub trcr2br2l: Vec<usize>,
    /// Blocked-index range of each canonical kind.
    pub prob2trcrptr: [usize; NPROBTYPES + 1],
    /// L2R displacement of each kind's block; the last entry is the record
    /// width.
    pub prob2bl2r: [usize; NPROBTYPES + 1],
    /// R2L displacement of each kind's block; the last entry is the record
    /// width.
    pub prob2br2l: [usize; NPROBTYPES + 1],
}

impl MetaData {
    /// Freeze a set of declarations into the prefix tables.
    pub fn new(mdb: &MetaDataBuilder) -> Self {
        let ntracers = mdb.trcr2prob.len();
        let mut md = MetaData {
            trcr2prob: mdb.trcr2prob.clone(),
            bidx2trcr: vec![0; ntracers],
            trcr2bidx: vec![0; ntracers],
            trcr2bl2r: vec![0; ntracers],
            trcr2br2l: vec![0; ntracers],
            prob2trcrptr: [0; NPROBTYPES + 1],
            prob2bl2r: [0; NPROBTYPES + 1],
            prob2br2l: [0; NPROBTYPES + 1],
        };
        md.prob2bl2r[0] = 1; // Total density sits at L2R slot value 0.
        for pi in 0..NPROBTYPES {
            let kind = ProblemKind::from_index(pi);
            let l2rbulksz = kind.l2r_bulk_size();
            let r2lbulksz = kind.r2l_bulk_size();
            md.prob2trcrptr[pi + 1] = md.prob2trcrptr[pi];
            for ti in 0..ntracers {
                if md.trcr2prob[ti] != kind {
                    continue;
                }
                let tcnt = md.prob2trcrptr[pi + 1] - md.prob2trcrptr[pi];
                md.trcr2bl2r[ti] = md.prob2bl2r[pi] + tcnt * l2rbulksz;
                md.trcr2br2l[ti] = md.prob2br2l[pi] + tcnt * r2lbulksz;
                md.bidx2trcr[md.prob2trcrptr[pi + 1]] = ti;
                md.prob2trcrptr[pi + 1] += 1;
            }
            let ni = md.prob2trcrptr[pi + 1] - md.prob2trcrptr[pi];
            md.prob2bl2r[pi + 1] = md.prob2bl2r[pi] + ni * l2rbulksz;
            md.prob2br2l[pi + 1] = md.prob2br2l[pi] + ni * r2lbulksz;
        }
        debug_assert_eq!(md.prob2trcrptr[NPROBTYPES], ntracers);
        for bi in 0..ntracers {
            md.trcr2bidx[md.bidx2trcr[bi]] = bi;
        }
        md
    }

    /// Number of declared tracers.
    pub fn ntracers(&self) -> usize {
        self.trcr2prob.len()
    }

    /// Values per slot in the L2R buffer.
    pub fn l2r_width(&self) -> usize {
        self.prob2bl2r[NPROBTYPES]
    }

    /// Values per slot in the R2L buffer.
    pub fn r2l_width(&self) -> usize {
        self.prob2br2l[NPROBTYPES]
    }
}
