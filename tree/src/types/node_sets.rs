//! The per-rank pruned, level-scheduled view of the global tree.

use std::collections::BTreeSet;
use std::fmt;

use itertools::Itertools;

/// A node in the pruned tree that is relevant to this rank.
///
/// If the node sits in a level, this rank owns it; otherwise it is a
/// communication partner of an owned node. Parents and kids are pruned
/// relative to the full tree to just the nodes that matter here.
#[derive(Clone, Debug)]
pub struct NsNode {
    /// Owning rank.
    pub rank: usize,
    /// Globally unique id; the cell index on leaves.
    pub id: usize,
    /// Parent (arena index), present when an owned node must send upward.
    pub parent: Option<usize>,
    /// Children (arena indices), pruned to those that matter on this rank.
    pub kids: Vec<usize>,
    /// Slot into the bulk buffers; actual positions are multiples of the
    /// per-slot width. Assigned for every owned node and every non-owned
    /// kid of an owned node.
    pub offset: Option<usize>,
}

impl NsNode {
    /// The assigned slot.
    pub(crate) fn slot(&self) -> usize {
        self.offset.expect("slot assigned during analysis")
    }
}

/// One coalesced message window: everything exchanged with `rank` in one
/// message of one level.
#[derive(Clone, Copy, Debug)]
pub struct MpiMetaData {
    /// Peer rank.
    pub rank: usize,
    /// First slot of the window.
    pub offset: usize,
    /// Window length in slots.
    pub size: usize,
}

/// A stratum of the level schedule.
///
/// A node in a level depends only on nodes in lower levels (leaves-to-root)
/// or higher levels (root-to-leaves). Per level the traffic is
///
/// ```text
/// leaves-to-root:  recv into kids | combine into node | send from node
/// root-to-leaves:  recv into node | solve for kids    | send from kids
/// ```
///
/// with at most one message per peer per direction.
#[derive(Clone, Debug, Default)]
pub struct Level {
    /// Owned nodes in this level (arena indices), in tree-DFS order.
    pub nodes: Vec<usize>,
    /// Windows for this level's own slots: sends upward, receives downward.
    pub me: Vec<MpiMetaData>,
    /// Windows for the kids' slots: receives upward, sends downward.
    pub kids: Vec<MpiMetaData>,
}

/// The pruned tree plus everything needed to drive its communication.
///
/// Immutable once analysis has produced it; a run needs only this and the
/// bulk buffers.
#[derive(Clone, Debug, Default)]
pub struct NodeSets {
    /// Node arena; levels and kids index into it.
    pub nodes: Vec<NsNode>,
    /// Levels, leaf level first. Empty levels are squeezed out.
    pub levels: Vec<Level>,
    /// Number of slots this rank addresses: one per owned node plus one per
    /// non-owned kid of an owned node.
    pub nslots: usize,
}

impl fmt::Display for NodeSets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.levels.is_empty() {
            return write!(f, "empty node sets");
        }
        let my_rank = self.nodes[self.levels[0].nodes[0]].rank;
        write!(f, "pid {}: #levels {}", my_rank, self.levels.len())?;
        for (il, lvl) in self.levels.iter().enumerate() {
            let mut kid_peers = BTreeSet::new();
            let mut parent_peers = BTreeSet::new();
            for &ni in &lvl.nodes {
                let n = &self.nodes[ni];
                for &ki in &n.kids {
                    if self.nodes[ki].rank != my_rank {
                        kid_peers.insert(self.nodes[ki].rank);
                    }
                }
                if let Some(pi) = n.parent {
                    if self.nodes[pi].rank != my_rank {
                        parent_peers.insert(self.nodes[pi].rank);
                    }
                }
            }
            write!(
                f,
                "\n  {}: {} | {} ({}) | {} ({})",
                il,
                lvl.nodes.len(),
                kid_peers.iter().join(" "),
                lvl.kids.len(),
                parent_peers.iter().join(" "),
                lvl.me.len()
            )?;
        }
        Ok(())
    }
}
