//! Fixtures for 1-D test meshes, the reduction trees over them, and
//! per-cell tracer data.

use qlt_parallel::Real;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::types::tree::{NodeIdx, Tree};

/// How the cells of a 1-D mesh map to ranks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decomp {
    /// One contiguous block of cell indices per rank.
    Contiguous,
    /// A scattered assignment that forces the tree to communicate, pack,
    /// and unpack in awkward ways.
    Pseudorandom,
}

/// A 1-D mesh of `ncells` cells distributed over `nranks` ranks.
#[derive(Clone, Copy, Debug)]
pub struct Mesh {
    ncells: usize,
    nranks: usize,
    decomp: Decomp,
}

impl Mesh {
    /// A mesh; `nranks` must not exceed `ncells`.
    pub fn new(ncells: usize, nranks: usize, decomp: Decomp) -> Self {
        assert!(nranks <= ncells);
        Mesh {
            ncells,
            nranks,
            decomp,
        }
    }

    /// Number of cells.
    pub fn ncells(&self) -> usize {
        self.ncells
    }

    /// Owning rank of cell `ci`.
    pub fn rank(&self, ci: usize) -> usize {
        match self.decomp {
            Decomp::Contiguous => (self.nranks - 1).min(ci / (self.ncells / self.nranks)),
            Decomp::Pseudorandom => {
                let chunk = ci / self.nranks;
                (ci + chunk) % self.nranks
            }
        }
    }
}

/// Build the reduction tree over a 1-D mesh by recursive bisection.
///
/// `imbalanced` splits off the first third instead of the first half, which
/// exercises uneven level schedules.
pub fn make_tree(m: &Mesh, imbalanced: bool) -> Tree {
    let mut tree = Tree::new();
    build(&mut tree, m, 0, m.ncells(), imbalanced);
    tree
}

fn build(tree: &mut Tree, m: &Mesh, cs: usize, ce: usize, imbalanced: bool) -> NodeIdx {
    let cn = ce - cs;
    if cn == 1 {
        return tree.leaf(m.rank(cs), cs);
    }
    let cn0 = if imbalanced && cn > 2 { cn / 3 } else { cn / 2 };
    let kid0 = build(tree, m, cs, cs + cn0, imbalanced);
    let kid1 = build(tree, m, cs + cn0, ce, imbalanced);
    tree.interior(kid0, kid1)
}

/// Per-cell tracer fixture values.
#[derive(Clone, Copy, Debug)]
pub struct CellValues {
    /// Total density.
    pub rhom: Real,
    /// Lower mass bound.
    pub qm_min: Real,
    /// Tracer mass.
    pub qm: Real,
    /// Upper mass bound.
    pub qm_max: Real,
    /// Previous tracer mass.
    pub qm_prev: Real,
}

/// Total density of a cell, drawn from `[0.5, 2)`.
///
/// Values are a pure function of `(seed, cellidx)`, so every rank and every
/// decomposition sees the same field.
pub fn rhom_fixture(seed: u64, cellidx: usize) -> Real {
    let mut rng = cell_rng(seed, cellidx, usize::MAX);
    0.5 + 1.5 * rng.gen::<Real>()
}

/// Feasible tracer values for one cell: ratio bounds inside `(0, 1]` with
/// the mass strictly between them and `qm_prev == qm`.
///
/// Like [`rhom_fixture`], a pure function of its arguments.
pub fn tracer_fixture(seed: u64, cellidx: usize, tracer_idx: usize) -> CellValues {
    let rhom = rhom_fixture(seed, cellidx);
    let mut rng = cell_rng(seed, cellidx, tracer_idx);
    let q_min = 0.1 + 0.8 * rng.gen::<Real>();
    let q_max = (q_min + (0.9 - q_min) * rng.gen::<Real>()).min(1.0);
    let q = q_min + (q_max - q_min) * rng.gen::<Real>();
    let qm_min = q_min * rhom;
    let qm_max = q_max * rhom;
    let qm = (q * rhom).clamp(qm_min, qm_max);
    CellValues {
        rhom,
        qm_min,
        qm,
        qm_max,
        qm_prev: qm,
    }
}

fn cell_rng(seed: u64, cellidx: usize, tracer_idx: usize) -> StdRng {
    let key = seed
        ^ (cellidx as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)
        ^ (tracer_idx as u64).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    StdRng::seed_from_u64(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tree::NodeKind;

    #[test]
    fn ranks_stay_in_range() {
        for decomp in [Decomp::Contiguous, Decomp::Pseudorandom] {
            for nranks in [1, 2, 3, 7] {
                let m = Mesh::new(42.max(3 * nranks), nranks, decomp);
                for ci in 0..m.ncells() {
                    assert!(m.rank(ci) < nranks);
                }
            }
        }
    }

    #[test]
    fn contiguous_is_monotone() {
        let m = Mesh::new(10, 3, Decomp::Contiguous);
        let ranks: Vec<_> = (0..10).map(|ci| m.rank(ci)).collect();
        for w in ranks.windows(2) {
            assert!(w[0] <= w[1]);
        }
        assert_eq!(ranks[0], 0);
        assert_eq!(ranks[9], 2);
    }

    #[test]
    fn every_cell_appears_once() {
        for decomp in [Decomp::Contiguous, Decomp::Pseudorandom] {
            for imbalanced in [false, true] {
                let m = Mesh::new(42, 4, decomp);
                let tree = make_tree(&m, imbalanced);
                let mut cells = vec![0usize; m.ncells()];
                for node in &tree.nodes {
                    if let NodeKind::Leaf { cellidx, .. } = node.kind {
                        cells[cellidx] += 1;
                    }
                }
                assert!(cells.iter().all(|&c| c == 1));
            }
        }
    }

    #[test]
    fn fixtures_are_reproducible_and_feasible() {
        for ci in 0..20 {
            let a = tracer_fixture(7, ci, 3);
            let b = tracer_fixture(7, ci, 3);
            assert_eq!(a.qm.to_bits(), b.qm.to_bits());
            assert!(a.qm_min > 0.0);
            assert!(a.qm_min <= a.qm && a.qm <= a.qm_max);
            assert!(a.qm_max <= a.rhom * (1.0 + 1e-12));
            assert_eq!(a.qm, a.qm_prev);
        }
        // Different tracers draw different fields.
        assert_ne!(
            tracer_fixture(7, 0, 0).qm.to_bits(),
            tracer_fixture(7, 0, 1).qm.to_bits()
        );
    }
}
