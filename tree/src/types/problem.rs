//! Problem-type masks and the four canonical reduction problems.

use crate::error::Error;

/// Tracer bounds are enforced cell by cell.
pub const SHAPEPRESERVE: u32 = 1;
/// Total tracer mass is restored to the previous mass.
pub const CONSERVE: u32 = 2;
/// The tracer tracks total density within globally reduced bounds.
pub const CONSISTENT: u32 = 4;

/// Number of canonical problem types.
pub const NPROBTYPES: usize = 4;

/// The canonical reduction problems.
///
/// Every accepted mask combination maps onto one of these; widths and
/// combine behavior branch on the variant, never on raw bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProblemKind {
    /// Shape-preserving and consistent (`s`, `s|t`).
    Shape,
    /// Mass-conserving, shape-preserving, consistent (`c|s`, `c|s|t`).
    ConserveShape,
    /// Consistent only (`t`): bounds travel as density ratios.
    Consistent,
    /// Mass-conserving and consistent (`c|t`).
    ConserveConsistent,
}

impl ProblemKind {
    /// All canonical kinds, in canonical index order.
    pub const ALL: [ProblemKind; NPROBTYPES] = [
        ProblemKind::Shape,
        ProblemKind::ConserveShape,
        ProblemKind::Consistent,
        ProblemKind::ConserveConsistent,
    ];

    /// Canonicalize a mask. Accepted combinations are `s`, `s|t`, `c|s`,
    /// `c|s|t`, `t`, and `c|t`; anything else is an error.
    pub fn from_mask(mask: u32) -> Result<Self, Error> {
        match mask {
            m if m == SHAPEPRESERVE || m == (SHAPEPRESERVE | CONSISTENT) => Ok(ProblemKind::Shape),
            m if m == (CONSERVE | SHAPEPRESERVE)
                || m == (CONSERVE | SHAPEPRESERVE | CONSISTENT) =>
            {
                Ok(ProblemKind::ConserveShape)
            }
            m if m == CONSISTENT => Ok(ProblemKind::Consistent),
            m if m == (CONSERVE | CONSISTENT) => Ok(ProblemKind::ConserveConsistent),
            _ => Err(Error::InvalidProblemType(mask)),
        }
    }

    /// The kind at canonical index `idx`.
    pub fn from_index(idx: usize) -> Self {
        Self::ALL[idx]
    }

    /// Canonical index, `0..NPROBTYPES`.
    pub fn index(self) -> usize {
        match self {
            ProblemKind::Shape => 0,
            ProblemKind::ConserveShape => 1,
            ProblemKind::Consistent => 2,
            ProblemKind::ConserveConsistent => 3,
        }
    }

    /// The canonical mask; `CONSISTENT` is always set.
    pub fn mask(self) -> u32 {
        match self {
            ProblemKind::Shape => SHAPEPRESERVE | CONSISTENT,
            ProblemKind::ConserveShape => CONSERVE | SHAPEPRESERVE | CONSISTENT,
            ProblemKind::Consistent => CONSISTENT,
            ProblemKind::ConserveConsistent => CONSERVE | CONSISTENT,
        }
    }

    /// Whether per-cell bounds are enforced.
    pub fn shapepreserve(self) -> bool {
        matches!(self, ProblemKind::Shape | ProblemKind::ConserveShape)
    }

    /// Whether total mass is restored to the previous mass.
    pub fn conserve(self) -> bool {
        matches!(
            self,
            ProblemKind::ConserveShape | ProblemKind::ConserveConsistent
        )
    }

    /// Values per tracer in a leaves-to-root record: `min, mass, max`, plus
    /// the previous mass when conserving.
    pub fn l2r_bulk_size(self) -> usize {
        if self.conserve() {
            4
        } else {
            3
        }
    }

    /// Values per tracer in a root-to-leaves record: the reconciled mass,
    /// plus propagated bounds unless shape preservation pins them per cell.
    pub fn r2l_bulk_size(self) -> usize {
        if self.shapepreserve() {
            1
        } else {
            3
        }
    }
}
