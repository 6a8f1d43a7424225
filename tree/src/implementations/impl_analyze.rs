//! Analysis of the global tree into a per-rank [`NodeSets`].
//!
//! Levels are run from 0 to `#levels - 1`. Each level holds nodes whose
//! operations depend only on nodes in lower-indexed levels, which prevents
//! deadlock in the general case of multiple cells per rank with multiple
//! ranks appearing in a subtree other than the root. The set of nodes
//! collected is just those owned by this rank plus the partners owned nodes
//! must communicate with; once analysis is done the input tree can be
//! dropped.

use log::debug;
use qlt_parallel::Parallel;

use crate::error::Error;
use crate::types::node_sets::{Level, MpiMetaData, NodeSets, NsNode};
use crate::types::tree::{NodeIdx, NodeKind, Tree};

/// Side tables over the indexed tree; what the analysis derives instead of
/// mutating the caller's nodes.
struct TreeInfo {
    /// Owning rank per node; interior nodes take their first kid's rank.
    rank: Vec<usize>,
    /// Globally unique id per node; `cellidx` on leaves, a counter seeded at
    /// `ncells` on interior nodes, assigned post-order.
    id: Vec<usize>,
    /// Number of levels in the full tree.
    depth: usize,
}

/// Walk the tree once: check leaf preconditions, derive ranks and ids, and
/// measure the depth.
fn init_tree(tree: &Tree, root: NodeIdx, ncells: usize) -> Result<TreeInfo, Error> {
    let nnodes = tree.len();
    let mut info = TreeInfo {
        rank: vec![0; nnodes],
        id: vec![0; nnodes],
        depth: 0,
    };
    let mut seen = vec![false; ncells];
    let mut next_id = ncells;
    info.depth = init_node(tree, root, ncells, &mut info, &mut seen, &mut next_id)?;
    Ok(info)
}

fn init_node(
    tree: &Tree,
    ni: NodeIdx,
    ncells: usize,
    info: &mut TreeInfo,
    seen: &mut [bool],
    next_id: &mut usize,
) -> Result<usize, Error> {
    match tree.nodes[ni].kind {
        NodeKind::Leaf { rank, cellidx } => {
            if cellidx >= ncells {
                return Err(Error::CellIndexOutOfRange { cellidx, ncells });
            }
            if seen[cellidx] {
                return Err(Error::DuplicateCellIndex(cellidx));
            }
            seen[cellidx] = true;
            info.rank[ni] = rank;
            info.id[ni] = cellidx;
            Ok(1)
        }
        NodeKind::Interior { kids } => {
            let mut depth = 0;
            for &ki in &kids {
                if tree.nodes[ki].parent != Some(ni) {
                    return Err(Error::MalformedTree(format!(
                        "node {ki} does not link back to its parent {ni}"
                    )));
                }
                depth = depth.max(init_node(tree, ki, ncells, info, seen, next_id)?);
            }
            info.rank[ni] = info.rank[kids[0]];
            info.id[ni] = *next_id;
            *next_id += 1;
            Ok(depth + 1)
        }
    }
}

/// Compute each node's level and materialize the pruned node set.
///
/// A node is materialized if this rank owns it, or if a descendant needs it
/// as a send target. Owned nodes join their level and record both kids
/// (allocating peer records for non-owned kids, which the pruned tree treats
/// as childless); non-owned nodes record only their owned kids, back-linking
/// those kids' parent pointers.
///
/// Returns `(level, parent_is_needed)`.
fn level_schedule_and_collect(
    ns: &mut NodeSets,
    my_rank: usize,
    tree: &Tree,
    info: &TreeInfo,
    ns_of: &mut [Option<usize>],
    ni: NodeIdx,
) -> (usize, bool) {
    let mut level = 0;
    let mut make_ns_node = false;
    if let NodeKind::Interior { kids } = tree.nodes[ni].kind {
        for &ki in &kids {
            let (kid_level, kid_needs_ns_node) =
                level_schedule_and_collect(ns, my_rank, tree, info, ns_of, ki);
            level = level.max(kid_level);
            make_ns_node |= kid_needs_ns_node;
        }
        level += 1;
    }
    let node_is_owned = info.rank[ni] == my_rank;
    if node_is_owned || make_ns_node {
        debug_assert!(ns_of[ni].is_none());
        let ns_idx = ns.nodes.len();
        ns.nodes.push(NsNode {
            rank: info.rank[ni],
            id: info.id[ni],
            parent: None,
            kids: Vec::new(),
            offset: None,
        });
        ns_of[ni] = Some(ns_idx);
        if node_is_owned {
            // Levels hold only owned nodes.
            ns.levels[level].nodes.push(ns_idx);
        }
        if let NodeKind::Interior { kids } = tree.nodes[ni].kind {
            if node_is_owned {
                // An owned node needs all of its kids.
                for &ki in &kids {
                    let kid_idx = match ns_of[ki] {
                        Some(kid_idx) => {
                            // Owned by this rank; fill in its parent.
                            ns.nodes[kid_idx].parent = Some(ns_idx);
                            kid_idx
                        }
                        None => {
                            // Not owned here, but needed as a receive
                            // partner. In the pruned tree it has no kids.
                            debug_assert_ne!(info.rank[ki], my_rank);
                            let kid_idx = ns.nodes.len();
                            ns.nodes.push(NsNode {
                                rank: info.rank[ki],
                                id: info.id[ki],
                                parent: None,
                                kids: Vec::new(),
                                offset: None,
                            });
                            ns_of[ki] = Some(kid_idx);
                            kid_idx
                        }
                    };
                    ns.nodes[ns_idx].kids.push(kid_idx);
                }
            } else {
                // Not owned; pick up only the owned kids as send partners.
                for &ki in &kids {
                    if let Some(kid_idx) = ns_of[ki] {
                        if info.rank[ki] == my_rank {
                            ns.nodes[ns_idx].kids.push(kid_idx);
                            ns.nodes[kid_idx].parent = Some(ns_idx);
                        }
                    }
                }
            }
        }
    }
    (level, node_is_owned)
}

fn consolidate(ns: &mut NodeSets) {
    ns.levels.retain(|lvl| !lvl.nodes.is_empty());
}

/// Assign slots to one level's rank/node list and emit the coalesced
/// windows.
///
/// Entries on this rank carry the sentinel key `-1` so they sort first and
/// get slots without windows. The sort is stable and on the rank key only:
/// within a window both peers must enumerate nodes in the shared tree-DFS
/// order the collection pass produced.
fn init_offsets(
    rns: &mut Vec<(i64, usize)>,
    mmds: &mut Vec<MpiMetaData>,
    nodes: &mut [NsNode],
    offset: &mut usize,
) {
    rns.sort_by_key(|rn| rn.0);
    let mut prev_rank = -1i64;
    for &(rank, ni) in rns.iter() {
        if rank == -1 {
            if nodes[ni].offset.is_none() {
                nodes[ni].offset = Some(*offset);
                *offset += 1;
            }
            continue;
        }
        if rank != prev_rank {
            debug_assert!(rank > prev_rank);
            prev_rank = rank;
            mmds.push(MpiMetaData {
                rank: rank as usize,
                offset: *offset,
                size: 0,
            });
        }
        mmds.last_mut().expect("window just pushed").size += 1;
        debug_assert!(nodes[ni].offset.is_none());
        nodes[ni].offset = Some(*offset);
        *offset += 1;
    }
}

/// Set up communication data: one message between this rank and any peer
/// per level per direction, and a slot for every node a message touches.
fn init_comm(my_rank: usize, ns: &mut NodeSets) {
    let NodeSets {
        nodes,
        levels,
        nslots,
    } = ns;
    *nslots = 0;
    let key = |rank: usize| if rank == my_rank { -1 } else { rank as i64 };
    for lvl in levels.iter_mut() {
        let mut me: Vec<(i64, usize)> = Vec::with_capacity(lvl.nodes.len());
        let mut kids: Vec<(i64, usize)> = Vec::new();
        for &ni in &lvl.nodes {
            let parent_rank = nodes[ni].parent.map_or(my_rank, |pi| nodes[pi].rank);
            me.push((key(parent_rank), ni));
            for &ki in &nodes[ni].kids {
                kids.push((key(nodes[ki].rank), ki));
            }
        }
        init_offsets(&mut me, &mut lvl.me, nodes, nslots);
        init_offsets(&mut kids, &mut lvl.kids, nodes, nslots);
    }
}

/// Analyze the globally agreed tree into this rank's [`NodeSets`].
///
/// Preconditions are checked and violations are fatal to the call: a single
/// parentless root, consistent child-parent links, two kids per interior
/// node, and unique leaf cell indices in `[0, ncells)`. The tree itself is
/// left untouched and can be dropped afterwards.
pub fn analyze<P: Parallel>(p: &P, ncells: usize, tree: &Tree) -> Result<NodeSets, Error> {
    let root = tree.root()?;
    let info = init_tree(tree, root, ncells)?;
    let mut ns = NodeSets {
        nodes: Vec::new(),
        levels: vec![Level::default(); info.depth],
        nslots: 0,
    };
    let mut ns_of = vec![None; tree.len()];
    level_schedule_and_collect(&mut ns, p.rank(), tree, &info, &mut ns_of, root);
    consolidate(&mut ns);
    init_comm(p.rank(), &mut ns);
    debug!(
        "analyze: rank {} holds {} of {} nodes in {} levels, {} slots",
        p.rank(),
        ns.nodes.len(),
        tree.len(),
        ns.levels.len(),
        ns.nslots
    );
    Ok(ns)
}

/// Count slot-accounting violations: every owned node and every non-owned
/// kid of an owned node must hold exactly one slot in `[0, nslots)`.
///
/// Test support; a correct analysis always returns 0.
pub fn check_comm(ns: &NodeSets) -> usize {
    let mut uses = vec![0usize; ns.nslots];
    for lvl in &ns.levels {
        for &ni in &lvl.nodes {
            let n = &ns.nodes[ni];
            uses[n.slot()] += 1;
            for &ki in &n.kids {
                if ns.nodes[ki].rank != n.rank {
                    uses[ns.nodes[ki].slot()] += 1;
                }
            }
        }
    }
    uses.iter().filter(|&&u| u != 1).count()
}

/// Count leaf-layout violations: the leaf level must hold every owned leaf,
/// with slots forming a permutation of `[0, #leaves)` and ids in range, and
/// the leaf count must sum to `ncells` across ranks.
///
/// Test support; a correct analysis always returns 0.
pub fn check_leaf_nodes<P: Parallel>(p: &P, ns: &NodeSets, ncells: usize) -> usize {
    let mut nerr = 0;
    assert!(!ns.levels.is_empty());
    let leaves = &ns.levels[0].nodes;
    for &ni in leaves {
        let n = &ns.nodes[ni];
        if !n.kids.is_empty() {
            nerr += 1;
        }
        if n.slot() >= leaves.len() {
            nerr += 1;
        }
        if n.id >= ncells {
            nerr += 1;
        }
    }
    let mut glbl_nleaves = [0.0];
    p.all_reduce(
        &[leaves.len() as f64],
        &mut glbl_nleaves,
        qlt_parallel::ReduceOp::Sum,
    )
    .expect("all_reduce");
    if glbl_nleaves[0] as usize != ncells {
        nerr += 1;
    }
    nerr
}
