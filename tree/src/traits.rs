//! Seams the engine calls back into: per-node kernels and metrics.

use std::sync::Mutex;
use std::time::Duration;

use qlt_parallel::Real;

use crate::types::problem::ProblemKind;

/// Per-node work performed during the sweeps.
///
/// The engine owns all ordering guarantees: kernels are invoked on one node
/// at a time, with the first child always the first combine operand, and a
/// level's kernel work finishes before the level's sends are posted. An
/// implementation may run the per-node work of one level wherever it likes
/// as long as each call remains a pure function of its arguments.
pub trait NodeKernel {
    /// Combine two children's L2R records for one tracer into the parent's.
    ///
    /// `me`, `k0`, and `k1` are one tracer's block of
    /// [`ProblemKind::l2r_bulk_size`] values.
    fn combine(&self, kind: ProblemKind, me: &mut [Real], k0: &[Real], k1: &[Real]);

    /// Split a parent's reconciled mass `qm` between its two children.
    ///
    /// `pd`, `k0d`, and `k1d` are the L2R tracer blocks of the parent and
    /// children; bounds are read from them, and the engine refreshes them
    /// from the propagated global bounds before the call for
    /// non-shape-preserving kinds. The returned child masses must sum to
    /// `qm` up to round-off, lie inside the per-child bounds whenever `qm`
    /// itself is strictly feasible, and depend on nothing but the
    /// arguments.
    #[allow(clippy::too_many_arguments)]
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
    ) -> (Real, Real);
}

/// Phases reported to a [`MetricsSink`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimedOp {
    /// Tree analysis.
    Analyze,
    /// The leaves-to-root sweep.
    L2r,
    /// The root-to-leaves sweep.
    R2l,
    /// Node-problem solves inside the R2L sweep.
    NodeProblems,
    /// Blocking waits on outstanding messages.
    Waitall,
}

impl TimedOp {
    /// All phases, in report order.
    pub const ALL: [TimedOp; 5] = [
        TimedOp::Analyze,
        TimedOp::L2r,
        TimedOp::R2l,
        TimedOp::NodeProblems,
        TimedOp::Waitall,
    ];

    fn index(self) -> usize {
        match self {
            TimedOp::Analyze => 0,
            TimedOp::L2r => 1,
            TimedOp::R2l => 2,
            TimedOp::NodeProblems => 3,
            TimedOp::Waitall => 4,
        }
    }
}

/// Caller-provided sink for engine timings.
///
/// The engine holds no global timing state; a sink is attached per engine
/// instance and receives one span per timed phase occurrence.
pub trait MetricsSink: Send + Sync {
    /// Record one completed span.
    fn record(&self, op: TimedOp, elapsed: Duration);
}

/// A [`MetricsSink`] that accumulates totals in memory.
#[derive(Debug, Default)]
pub struct MetricsTotals {
    totals: Mutex<[(Duration, u64); TimedOp::ALL.len()]>,
}

impl MetricsTotals {
    /// A zeroed accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total elapsed time and span count for one phase.
    pub fn get(&self, op: TimedOp) -> (Duration, u64) {
        self.totals.lock().unwrap()[op.index()]
    }
}

impl MetricsSink for MetricsTotals {
    fn record(&self, op: TimedOp, elapsed: Duration) {
        let mut totals = self.totals.lock().unwrap();
        let (dur, cnt) = &mut totals[op.index()];
        *dur += elapsed;
        *cnt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_accumulate() {
        let m = MetricsTotals::new();
        m.record(TimedOp::L2r, Duration::from_millis(2));
        m.record(TimedOp::L2r, Duration::from_millis(3));
        let (dur, cnt) = m.get(TimedOp::L2r);
        assert_eq!(cnt, 2);
        assert_eq!(dur, Duration::from_millis(5));
        assert_eq!(m.get(TimedOp::R2l).1, 0);
    }
}
