//! Crate-wide constants.

use qlt_parallel::Tag;

/// Tag shared by every sweep message.
///
/// Message routing relies on sends and receives being posted in the same
/// deterministic order on both peers, not on tags; see
/// [`crate::implementations::impl_analyze`].
pub const MPITAG: Tag = 42;
