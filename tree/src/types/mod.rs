//! Data structures: the input tree, the per-rank pruned view, tracer
//! metadata, and the bulk buffers.

pub mod bulk;
pub mod meta;
pub mod node_sets;
pub mod problem;
pub mod tree;
