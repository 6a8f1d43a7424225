//! The reduction engine: tracer lifecycle, leaf access, and the two-sweep
//! run protocol.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use log::trace;
use qlt_parallel::{Parallel, Real, Request};

use crate::constants::MPITAG;
use crate::error::Error;
use crate::implementations::impl_analyze::analyze;
use crate::implementations::impl_solve::SerialKernel;
use crate::traits::{MetricsSink, NodeKernel, TimedOp};
use crate::types::bulk::BulkData;
use crate::types::meta::{MetaData, MetaDataBuilder};
use crate::types::node_sets::NodeSets;
use crate::types::problem::{ProblemKind, NPROBTYPES};
use crate::types::tree::Tree;

/// The distributed tree reduction engine.
///
/// Lifecycle: build the globally agreed [`Tree`], construct the engine (this
/// runs the analysis and fixes the communication schedule), declare every
/// tracer, close declarations, and then per step write the leaf records with
/// [`Qlt::set_rhom`] and [`Qlt::set_qm`], call [`Qlt::run`], and read the
/// reconciled masses back with [`Qlt::get_qm`].
pub struct Qlt<P: Parallel, K: NodeKernel = SerialKernel> {
    p: Arc<P>,
    ns: NodeSets,
    gci2lci: HashMap<usize, usize>,
    mdb: Option<MetaDataBuilder>,
    md: Option<MetaData>,
    bd: BulkData,
    kernel: K,
    metrics: Option<Arc<dyn MetricsSink>>,
}

fn record(metrics: &Option<Arc<dyn MetricsSink>>, op: TimedOp, start: Instant) {
    if let Some(sink) = metrics {
        sink.record(op, start.elapsed());
    }
}

impl<P: Parallel> Qlt<P> {
    /// Analyze `tree` and set up an engine with the reference kernel.
    pub fn new(p: Arc<P>, ncells: usize, tree: &Tree) -> Result<Self, Error> {
        Self::with_kernel(p, ncells, tree, SerialKernel, None)
    }
}

impl<P: Parallel, K: NodeKernel> Qlt<P, K> {
    /// Analyze `tree` and set up an engine with a caller-provided kernel
    /// and, optionally, a metrics sink.
    pub fn with_kernel(
        p: Arc<P>,
        ncells: usize,
        tree: &Tree,
        kernel: K,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> Result<Self, Error> {
        let t = Instant::now();
        let ns = analyze(&*p, ncells, tree)?;
        record(&metrics, TimedOp::Analyze, t);
        let gci2lci = ns.levels[0]
            .nodes
            .iter()
            .map(|&ni| (ns.nodes[ni].id, ns.nodes[ni].slot()))
            .collect();
        Ok(Qlt {
            p,
            ns,
            gci2lci,
            mdb: Some(MetaDataBuilder::default()),
            md: None,
            bd: BulkData::default(),
            kernel,
            metrics,
        })
    }

    /// Attach a metrics sink.
    pub fn set_metrics(&mut self, sink: Arc<dyn MetricsSink>) {
        self.metrics = Some(sink);
    }

    /// The per-rank pruned view this engine runs on.
    pub fn node_sets(&self) -> &NodeSets {
        &self.ns
    }

    /// Declare one tracer. The caller's tracer index is the call order.
    /// Declaring after [`Qlt::end_tracer_declarations`] is an error.
    pub fn declare_tracer(&mut self, problem_type: u32) -> Result<(), Error> {
        self.mdb
            .as_mut()
            .ok_or(Error::DeclarationsClosed)?
            .declare(problem_type)
    }

    /// Freeze the tracer set and allocate the bulk buffers.
    pub fn end_tracer_declarations(&mut self) -> Result<(), Error> {
        let mdb = self.mdb.take().ok_or(Error::DeclarationsClosed)?;
        let md = MetaData::new(&mdb);
        trace!(
            "tracers closed: {} tracers, l2r width {}, r2l width {}",
            md.ntracers(),
            md.l2r_width(),
            md.r2l_width()
        );
        self.bd = BulkData::new(&md, self.ns.nslots);
        self.md = Some(md);
        Ok(())
    }

    fn md(&self) -> &MetaData {
        self.md
            .as_ref()
            .expect("end_tracer_declarations must be called first")
    }

    /// Canonical problem kind of a tracer.
    pub fn get_problem_type(&self, tracer_idx: usize) -> ProblemKind {
        self.md().trcr2prob[tracer_idx]
    }

    /// Number of declared tracers.
    pub fn get_num_tracers(&self) -> usize {
        self.md().ntracers()
    }

    /// Number of cells owned by this rank.
    pub fn nlclcells(&self) -> usize {
        self.ns.levels[0].nodes.len()
    }

    /// Cells owned by this rank, in local-index order; `gci2lci(gcis[i]) ==
    /// i`. Ideally a caller uses this once at setup and never needs
    /// [`Qlt::gci2lci`] again.
    pub fn get_owned_glblcells(&self) -> Vec<usize> {
        let mut gcis = vec![0; self.nlclcells()];
        for &ni in &self.ns.levels[0].nodes {
            gcis[self.ns.nodes[ni].slot()] = self.ns.nodes[ni].id;
        }
        gcis
    }

    /// This rank's local index for a global cell index. Not an efficient
    /// operation; intended for setup.
    pub fn gci2lci(&self, gci: usize) -> Result<usize, Error> {
        self.gci2lci.get(&gci).copied().ok_or(Error::CellNotOwned(gci))
    }

    /// Write the total density of leaf `lci`.
    pub fn set_rhom(&mut self, lci: usize, rhom: Real) {
        let ndps = self.md().l2r_width();
        self.bd.l2r_data[lci * ndps] = rhom;
    }

    /// Write tracer `tracer_idx`'s L2R record for leaf `lci`.
    ///
    /// For non-shape-preserving tracers the bounds are stored as density
    /// ratios, so [`Qlt::set_rhom`] must have been called for the leaf
    /// already. `qm_prev` is read only for conserving tracers.
    pub fn set_qm(
        &mut self,
        lci: usize,
        tracer_idx: usize,
        qm: Real,
        qm_min: Real,
        qm_max: Real,
        qm_prev: Real,
    ) {
        let md = self.md();
        let ndps = md.l2r_width();
        let kind = md.trcr2prob[tracer_idx];
        let base = lci * ndps + md.trcr2bl2r[tracer_idx];
        let bd = &mut self.bd.l2r_data;
        bd[base + 1] = qm;
        if kind.shapepreserve() {
            bd[base] = qm_min;
            bd[base + 2] = qm_max;
        } else {
            let rhom = bd[lci * ndps];
            bd[base] = qm_min / rhom;
            bd[base + 2] = qm_max / rhom;
        }
        if kind.conserve() {
            bd[base + 3] = qm_prev;
        }
    }

    /// Read tracer `tracer_idx`'s reconciled mass for leaf `lci`.
    pub fn get_qm(&self, lci: usize, tracer_idx: usize) -> Real {
        let md = self.md();
        self.bd.r2l_data[lci * md.r2l_width() + md.trcr2br2l[tracer_idx]]
    }

    /// Run the two sweeps.
    ///
    /// On entry every owned leaf's L2R record must be populated; on return
    /// every owned leaf's R2L record holds the reconciled values.
    pub fn run(&mut self) -> Result<(), Error> {
        let Qlt {
            p,
            ns,
            bd,
            md,
            kernel,
            metrics,
            ..
        } = self;
        let md = md
            .as_ref()
            .expect("end_tracer_declarations must be called before run");
        let l2rndps = md.l2r_width();
        let r2lndps = md.r2l_width();
        let nlev = ns.levels.len();
        let mut me_req: Vec<Vec<P::Request>> = (0..nlev).map(|_| Vec::new()).collect();
        let mut kids_req: Vec<Vec<P::Request>> = (0..nlev).map(|_| Vec::new()).collect();

        // Leaves to root.
        let t_l2r = Instant::now();
        for il in 0..nlev {
            let lvl = &ns.levels[il];
            // Set up receives.
            for mmd in &lvl.kids {
                kids_req[il].push(p.irecv(mmd.size * l2rndps, mmd.rank, MPITAG)?);
            }
            let t = Instant::now();
            p.waitall(&mut kids_req[il])?;
            record(metrics, TimedOp::Waitall, t);
            for (req, mmd) in kids_req[il].iter().zip(&lvl.kids) {
                bd.l2r_data[mmd.offset * l2rndps..(mmd.offset + mmd.size) * l2rndps]
                    .copy_from_slice(req.payload());
            }
            kids_req[il].clear();
            // Combine kids' data.
            for &ni in &lvl.nodes {
                let n = &ns.nodes[ni];
                if n.kids.is_empty() {
                    continue;
                }
                debug_assert_eq!(n.kids.len(), 2);
                let o = n.slot();
                let o0 = ns.nodes[n.kids[0]].slot();
                let o1 = ns.nodes[n.kids[1]].slot();
                // Total density.
                bd.l2r_data[o * l2rndps] =
                    bd.l2r_data[o0 * l2rndps] + bd.l2r_data[o1 * l2rndps];
                // Tracers, one block at a time, always kid 0 then kid 1.
                for pti in 0..NPROBTYPES {
                    let kind = ProblemKind::from_index(pti);
                    let bsz = kind.l2r_bulk_size();
                    for bi in md.prob2trcrptr[pti]..md.prob2trcrptr[pti + 1] {
                        let bdi = md.trcr2bl2r[md.bidx2trcr[bi]];
                        let mut k0 = [0.0; 4];
                        let mut k1 = [0.0; 4];
                        k0[..bsz]
                            .copy_from_slice(&bd.l2r_data[o0 * l2rndps + bdi..][..bsz]);
                        k1[..bsz]
                            .copy_from_slice(&bd.l2r_data[o1 * l2rndps + bdi..][..bsz]);
                        let me = &mut bd.l2r_data[o * l2rndps + bdi..][..bsz];
                        kernel.combine(kind, me, &k0[..bsz], &k1[..bsz]);
                    }
                }
            }
            // Send to parents. All but the last level leave the sends
            // outstanding until cleanup so they overlap later receives.
            for mmd in &lvl.me {
                let buf = &bd.l2r_data[mmd.offset * l2rndps..(mmd.offset + mmd.size) * l2rndps];
                me_req[il].push(p.isend(buf, mmd.rank, MPITAG)?);
            }
            if il + 1 == nlev {
                let t = Instant::now();
                p.waitall(&mut me_req[il])?;
                record(metrics, TimedOp::Waitall, t);
                me_req[il].clear();
            }
        }
        record(metrics, TimedOp::L2r, t_l2r);

        // Root: seed the downward sweep.
        let t_r2l = Instant::now();
        if nlev > 0 {
            let last = &ns.levels[nlev - 1];
            if last.nodes.len() == 1 && ns.nodes[last.nodes[0]].parent.is_none() {
                let o = ns.nodes[last.nodes[0]].slot();
                for pti in 0..NPROBTYPES {
                    let kind = ProblemKind::from_index(pti);
                    for bi in md.prob2trcrptr[pti]..md.prob2trcrptr[pti + 1] {
                        let ti = md.bidx2trcr[bi];
                        let l2rbdi = md.trcr2bl2r[ti];
                        let r2lbdi = md.trcr2br2l[ti];
                        // When enforcing conservation the root mass is the
                        // previous total; otherwise the reduced total passes
                        // through unchanged.
                        let os = if kind.conserve() { 3 } else { 1 };
                        bd.r2l_data[o * r2lndps + r2lbdi] =
                            bd.l2r_data[o * l2rndps + l2rbdi + os];
                        if !kind.shapepreserve() {
                            // The global density-ratio bounds are now known;
                            // start propagating them leafward.
                            bd.r2l_data[o * r2lndps + r2lbdi + 1] =
                                bd.l2r_data[o * l2rndps + l2rbdi];
                            bd.r2l_data[o * r2lndps + r2lbdi + 2] =
                                bd.l2r_data[o * l2rndps + l2rbdi + 2];
                        }
                    }
                }
            }
        }

        // Root to leaves.
        for il in (0..nlev).rev() {
            let lvl = &ns.levels[il];
            let mut recv_req: Vec<P::Request> = Vec::with_capacity(lvl.me.len());
            for mmd in &lvl.me {
                recv_req.push(p.irecv(mmd.size * r2lndps, mmd.rank, MPITAG)?);
            }
            let t = Instant::now();
            p.waitall(&mut recv_req)?;
            record(metrics, TimedOp::Waitall, t);
            for (req, mmd) in recv_req.iter().zip(&lvl.me) {
                bd.r2l_data[mmd.offset * r2lndps..(mmd.offset + mmd.size) * r2lndps]
                    .copy_from_slice(req.payload());
            }
            // Solve the node problem for the kids' values.
            let t_snp = Instant::now();
            for &ni in &lvl.nodes {
                let n = &ns.nodes[ni];
                if n.kids.is_empty() {
                    continue;
                }
                debug_assert_eq!(n.kids.len(), 2);
                let o = n.slot();
                let o0 = ns.nodes[n.kids[0]].slot();
                let o1 = ns.nodes[n.kids[1]].slot();
                for pti in 0..NPROBTYPES {
                    let kind = ProblemKind::from_index(pti);
                    let bsz = kind.l2r_bulk_size();
                    for bi in md.prob2trcrptr[pti]..md.prob2trcrptr[pti + 1] {
                        let ti = md.bidx2trcr[bi];
                        let l2rbdi = md.trcr2bl2r[ti];
                        let r2lbdi = md.trcr2br2l[ti];
                        if !kind.shapepreserve() {
                            // Pass the global bounds along: the L2R copies
                            // feed the solves, the kids' R2L copies feed the
                            // kids' sends.
                            let q_min = bd.r2l_data[o * r2lndps + r2lbdi + 1];
                            let q_max = bd.r2l_data[o * r2lndps + r2lbdi + 2];
                            bd.l2r_data[o * l2rndps + l2rbdi] = q_min;
                            bd.l2r_data[o * l2rndps + l2rbdi + 2] = q_max;
                            for ok in [o0, o1] {
                                bd.l2r_data[ok * l2rndps + l2rbdi] = q_min;
                                bd.l2r_data[ok * l2rndps + l2rbdi + 2] = q_max;
                                bd.r2l_data[ok * r2lndps + r2lbdi + 1] = q_min;
                                bd.r2l_data[ok * r2lndps + r2lbdi + 2] = q_max;
                            }
                        }
                        let qm = bd.r2l_data[o * r2lndps + r2lbdi];
                        let (qm0, qm1) = kernel.solve_node_problem(
                            kind,
                            bd.l2r_data[o * l2rndps],
                            &bd.l2r_data[o * l2rndps + l2rbdi..][..bsz],
                            qm,
                            bd.l2r_data[o0 * l2rndps],
                            &bd.l2r_data[o0 * l2rndps + l2rbdi..][..bsz],
                            bd.l2r_data[o1 * l2rndps],
                            &bd.l2r_data[o1 * l2rndps + l2rbdi..][..bsz],
                        );
                        bd.r2l_data[o0 * r2lndps + r2lbdi] = qm0;
                        bd.r2l_data[o1 * r2lndps + r2lbdi] = qm1;
                    }
                }
            }
            record(metrics, TimedOp::NodeProblems, t_snp);
            // Send down.
            for mmd in &lvl.kids {
                let buf = &bd.r2l_data[mmd.offset * r2lndps..(mmd.offset + mmd.size) * r2lndps];
                kids_req[il].push(p.isend(buf, mmd.rank, MPITAG)?);
            }
        }

        // Wait on the outstanding sends to clean up.
        let t = Instant::now();
        for il in 0..nlev {
            p.waitall(&mut me_req[il])?;
            p.waitall(&mut kids_req[il])?;
        }
        record(metrics, TimedOp::Waitall, t);
        record(metrics, TimedOp::R2l, t_r2l);
        Ok(())
    }
}
