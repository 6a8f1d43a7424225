//! Implementations: tree analysis, the reduction engine, kernels, the
//! bit-for-bit all-reducer, and 1-D test fixtures.

pub mod helpers;
pub mod impl_allreduce;
pub mod impl_analyze;
pub mod impl_qlt;
pub mod impl_solve;
