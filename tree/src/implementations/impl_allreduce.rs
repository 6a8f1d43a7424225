//! All-reduce by tree walk, bit-for-bit invariant to the decomposition.

use std::sync::Arc;

use qlt_parallel::{Parallel, Real, Request};

use crate::constants::MPITAG;
use crate::error::Error;
use crate::implementations::impl_analyze::analyze;
use crate::types::node_sets::NodeSets;
use crate::types::tree::Tree;

/// Sums `nfield` scalars per leaf over a fixed reduction tree with
/// point-to-point messages only.
///
/// A plain `MPI_Allreduce` may change its reduction order with the process
/// count; this walk fixes the order to the tree shape, so the same tree and
/// inputs give the same bits on every rank under every decomposition.
pub struct BfbTreeAllReducer<P: Parallel> {
    p: Arc<P>,
    ns: NodeSets,
    nfield: usize,
    bd: Vec<Real>,
}

impl<P: Parallel> BfbTreeAllReducer<P> {
    /// Analyze `tree` over `nleaf` leaves. `nlocal` must equal the number of
    /// leaves this rank owns; each leaf contributes `nfield` scalars.
    pub fn new(
        p: Arc<P>,
        nleaf: usize,
        tree: &Tree,
        nlocal: usize,
        nfield: usize,
    ) -> Result<Self, Error> {
        let ns = analyze(&*p, nleaf, tree)?;
        let nown = ns.levels[0].nodes.len();
        if nlocal != nown {
            return Err(Error::LeafCountMismatch {
                want: nown,
                got: nlocal,
            });
        }
        let bd = vec![0.0; ns.nslots * nfield];
        Ok(BfbTreeAllReducer { p, ns, nfield, bd })
    }

    /// Number of leaves this rank owns.
    pub fn nlocal(&self) -> usize {
        self.ns.levels[0].nodes.len()
    }

    /// The owned leaves' global ids, in the order [`Self::allreduce`]
    /// expects its `send` rows.
    pub fn leaf_ids(&self) -> Vec<usize> {
        self.ns.levels[0]
            .nodes
            .iter()
            .map(|&ni| self.ns.nodes[ni].id)
            .collect()
    }

    /// Reduce. `send` holds `nlocal × nfield` values, one row per owned
    /// leaf in [`Self::leaf_ids`] order; `recv` receives the `nfield`
    /// global sums.
    pub fn allreduce(&mut self, send: &[Real], recv: &mut [Real]) -> Result<(), Error> {
        let BfbTreeAllReducer { p, ns, nfield, bd } = self;
        let w = *nfield;
        let nlocal = ns.levels[0].nodes.len();
        if send.len() != nlocal * w {
            return Err(Error::LeafCountMismatch {
                want: nlocal * w,
                got: send.len(),
            });
        }
        for (i, &ni) in ns.levels[0].nodes.iter().enumerate() {
            let o = ns.nodes[ni].slot();
            bd[o * w..(o + 1) * w].copy_from_slice(&send[i * w..(i + 1) * w]);
        }
        let nlev = ns.levels.len();
        let mut me_req: Vec<Vec<P::Request>> = (0..nlev).map(|_| Vec::new()).collect();
        let mut kids_req: Vec<Vec<P::Request>> = (0..nlev).map(|_| Vec::new()).collect();
        // Leaves to root.
        for il in 0..nlev {
            let lvl = &ns.levels[il];
            for mmd in &lvl.kids {
                kids_req[il].push(p.irecv(mmd.size * w, mmd.rank, MPITAG)?);
            }
            p.waitall(&mut kids_req[il])?;
            for (req, mmd) in kids_req[il].iter().zip(&lvl.kids) {
                bd[mmd.offset * w..(mmd.offset + mmd.size) * w].copy_from_slice(req.payload());
            }
            kids_req[il].clear();
            for &ni in &lvl.nodes {
                let n = &ns.nodes[ni];
                if n.kids.is_empty() {
                    continue;
                }
                let o = n.slot();
                let o0 = ns.nodes[n.kids[0]].slot();
                let o1 = ns.nodes[n.kids[1]].slot();
                for f in 0..w {
                    bd[o * w + f] = bd[o0 * w + f] + bd[o1 * w + f];
                }
            }
            for mmd in &lvl.me {
                let buf = &bd[mmd.offset * w..(mmd.offset + mmd.size) * w];
                me_req[il].push(p.isend(buf, mmd.rank, MPITAG)?);
            }
            if il + 1 == nlev {
                p.waitall(&mut me_req[il])?;
                me_req[il].clear();
            }
        }
        // Root to leaves: every node passes the total through to its kids.
        for il in (0..nlev).rev() {
            let lvl = &ns.levels[il];
            let mut recv_req: Vec<P::Request> = Vec::with_capacity(lvl.me.len());
            for mmd in &lvl.me {
                recv_req.push(p.irecv(mmd.size * w, mmd.rank, MPITAG)?);
            }
            p.waitall(&mut recv_req)?;
            for (req, mmd) in recv_req.iter().zip(&lvl.me) {
                bd[mmd.offset * w..(mmd.offset + mmd.size) * w].copy_from_slice(req.payload());
            }
            for &ni in &lvl.nodes {
                let n = &ns.nodes[ni];
                if n.kids.is_empty() {
                    continue;
                }
                let o = n.slot();
                for k in 0..n.kids.len() {
                    let ok = ns.nodes[n.kids[k]].slot();
                    for f in 0..w {
                        bd[ok * w + f] = bd[o * w + f];
                    }
                }
            }
            for mmd in &lvl.kids {
                let buf = &bd[mmd.offset * w..(mmd.offset + mmd.size) * w];
                kids_req[il].push(p.isend(buf, mmd.rank, MPITAG)?);
            }
        }
        for il in 0..nlev {
            p.waitall(&mut me_req[il])?;
            p.waitall(&mut kids_req[il])?;
        }
        let o = ns.nodes[ns.levels[0].nodes[0]].slot();
        recv.copy_from_slice(&bd[o * w..(o + 1) * w]);
        Ok(())
    }
}
