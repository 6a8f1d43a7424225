//! The sequential node kernel: L2R combines and the two-child node problem.

use qlt_parallel::Real;

use crate::traits::NodeKernel;
use crate::types::problem::ProblemKind;

/// Reference kernel; runs the per-node work inline on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialKernel;

impl NodeKernel for SerialKernel {
    fn combine(&self, kind: ProblemKind, me: &mut [Real], k0: &[Real], k1: &[Real]) {
        // Shape-preserving bounds are masses and add; otherwise they are
        // density ratios and reduce to the subtree envelope.
        let sum_only = kind.shapepreserve();
        me[0] = if sum_only {
            k0[0] + k1[0]
        } else {
            k0[0].min(k1[0])
        };
        me[1] = k0[1] + k1[1];
        me[2] = if sum_only {
            k0[2] + k1[2]
        } else {
            k0[2].max(k1[2])
        };
        if me.len() == 4 {
            me[3] = k0[3] + k1[3];
        }
    }

    fn solve_node_problem(
        &self,
        kind: ProblemKind,
        rhom: Real,
        pd: &[Real],
        qm: Real,
        rhom0: Real,
        k0d: &[Real],
        rhom1: Real,
        k1d: &[Real],
    ) -> (Real, Real) {
        if !kind.shapepreserve() {
            // Bounds travel as density ratios; rescale to masses.
            let mpd = [pd[0] * rhom, pd[1], pd[2] * rhom];
            let mk0 = [k0d[0] * rhom0, k0d[1], k0d[2] * rhom0];
            let mk1 = [k1d[0] * rhom1, k1d[1], k1d[2] * rhom1];
            return solve_masses(&mpd, qm, rhom0, &mk0, rhom1, &mk1);
        }
        solve_masses(pd, qm, rhom0, k0d, rhom1, k1d)
    }
}

fn solve_masses(
    pd: &[Real],
    qm: Real,
    rhom0: Real,
    k0d: &[Real],
    rhom1: Real,
    k1d: &[Real],
) -> (Real, Real) {
    let mut qm_min = [k0d[0], k1d[0]];
    let qm_orig = [k0d[1], k1d[1]];
    let mut qm_max = [k0d[2], k1d[2]];
    // The ideal problem is not assuredly feasible. If the target falls
    // outside the parent envelope, relax the kids' bounds to the safety
    // problem, which is feasible whenever total density is conserved.
    if qm < pd[0] {
        adjust_bounds(&mut qm_min, &[rhom0, rhom1], qm - pd[0]);
    } else if qm > pd[2] {
        adjust_bounds(&mut qm_max, &[rhom0, rhom1], qm - pd[2]);
    }
    split_mass(qm, &qm_min, &qm_orig, &qm_max)
}

/// Absorb a bound violation of `extra` into the kid bounds.
///
/// Shift the bound whose density ratio can take the whole discrepancy
/// without crossing its sibling's; otherwise equalize both bounds at the
/// common feasible ratio.
fn adjust_bounds(bnd: &mut [Real; 2], rhom: &[Real; 2], extra: Real) {
    let q = [bnd[0] / rhom[0], bnd[1] / rhom[1]];
    if extra < 0.0 {
        let (i0, i1) = if q[0] >= q[1] { (0, 1) } else { (1, 0) };
        let gap = (q[i1] - q[i0]) * rhom[i0];
        if gap <= extra {
            bnd[i0] += extra;
            return;
        }
    } else {
        let (i0, i1) = if q[0] <= q[1] { (0, 1) } else { (1, 0) };
        let gap = (q[i1] - q[i0]) * rhom[i0];
        if gap >= extra {
            bnd[i0] += extra;
            return;
        }
    }
    let q_tot = (bnd[0] + bnd[1] + extra) / (rhom[0] + rhom[1]);
    bnd[0] = q_tot * rhom[0];
    bnd[1] = q_tot * rhom[1];
}

/// Split `qm` between two kids: clamp each prior into its bounds, then
/// spread the remaining discrepancy in proportion to the headroom each kid
/// has toward the active bound. A zero discrepancy returns the priors
/// unchanged, bit for bit.
fn split_mass(qm: Real, qm_min: &[Real; 2], qm_orig: &[Real; 2], qm_max: &[Real; 2]) -> (Real, Real) {
    let mut x = [
        qm_orig[0].max(qm_min[0]).min(qm_max[0]),
        qm_orig[1].max(qm_min[1]).min(qm_max[1]),
    ];
    let dm = qm - (x[0] + x[1]);
    if dm == 0.0 {
        return (x[0], x[1]);
    }
    if dm > 0.0 {
        let h = [qm_max[0] - x[0], qm_max[1] - x[1]];
        let hsum = h[0] + h[1];
        if hsum > 0.0 {
            // The clip removes round-off overshoot; the mass error it can
            // introduce is of the same order.
            x[0] = (x[0] + dm * (h[0] / hsum)).min(qm_max[0]);
            x[1] = (x[1] + dm * (h[1] / hsum)).min(qm_max[1]);
        } else {
            // Both kids pinned at their max; only round-off can land here.
            x[0] += 0.5 * dm;
            x[1] += 0.5 * dm;
        }
    } else {
        let h = [x[0] - qm_min[0], x[1] - qm_min[1]];
        let hsum = h[0] + h[1];
        if hsum > 0.0 {
            x[0] = (x[0] + dm * (h[0] / hsum)).max(qm_min[0]);
            x[1] = (x[1] + dm * (h[1] / hsum)).max(qm_min[1]);
        } else {
            x[0] += 0.5 * dm;
            x[1] += 0.5 * dm;
        }
    }
    (x[0], x[1])
}
