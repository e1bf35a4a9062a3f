//! Symbolic analysis: union lower structures, relative index maps, and the
//! cached exchange patterns used by the numeric factorization and solves.
//!
//! The local portion walks this rank's elimination tree bottom-up, unioning
//! each node's original lower structure with its children's union structures.
//! The distributed portion proceeds level by level up the top of the tree: at
//! each level the two half-teams exchange their child's size and union lower
//! structure pairwise, then every rank merges identically. Each distributed
//! node also precomputes, once, exactly which front positions this rank sends
//! to and receives from every peer during the extend-add and during the solve
//! update exchange.

use crate::comm::{self, CommRef};
use crate::grid::{self, Grid};
use crate::nested_dissection::ElimTree;
use crate::Ctx;

/// Symbolic data for one local supernode.
pub struct LocalNodeInfo {
    pub size: usize,
    pub offset: usize,
    /// Offset of this node's columns in the rank-local nodal stacking.
    pub my_offset: usize,
    pub parent: Option<usize>,
    pub children: Option<[usize; 2]>,
    pub orig_lower_struct: Vec<usize>,
    /// Position of each original lower index inside the full front structure.
    pub orig_lower_rel: Vec<usize>,
    /// Union lower structure (sorted, deduplicated).
    pub lower_struct: Vec<usize>,
    pub left_child_rel: Vec<usize>,
    pub right_child_rel: Vec<usize>,
}

/// Symbolic data for one distributed supernode (level `l` spans `2^l` ranks).
pub struct DistNodeInfo {
    pub size: usize,
    pub offset: usize,
    pub my_offset: usize,
    /// Rows of this node owned by this rank in the 1-D solve layout.
    pub local_size_1d: usize,
    /// Offset of those rows in the rank-local nodal stacking.
    pub local_offset_1d: usize,
    pub comm: CommRef,
    pub grid: Grid,
    pub on_left: bool,
    pub orig_lower_struct: Vec<usize>,
    pub orig_lower_rel: Vec<usize>,
    pub lower_struct: Vec<usize>,
    pub left_child_size: usize,
    pub right_child_size: usize,
    pub left_child_rel: Vec<usize>,
    pub right_child_rel: Vec<usize>,
    /// Number of extend-add values this rank sends to each team rank.
    pub fact_send_counts: Vec<usize>,
    /// Child update indices whose front row / column lands on this rank.
    pub left_fact_col_indices: Vec<usize>,
    pub left_fact_row_indices: Vec<usize>,
    pub right_fact_col_indices: Vec<usize>,
    pub right_fact_row_indices: Vec<usize>,
    /// Per source rank, the global front positions this rank accumulates
    /// during the extend-add, in the source's packing order.
    pub fact_recv_indices: Vec<Vec<(usize, usize)>>,
    /// Number of solve update rows this rank sends to each team rank.
    pub solve_send_counts: Vec<usize>,
    pub left_solve_indices: Vec<usize>,
    pub right_solve_indices: Vec<usize>,
    /// Per source rank, the local rows of this rank's work vector that
    /// receive solve updates, in the source's packing order.
    pub solve_recv_indices: Vec<Vec<usize>>,
}

/// Full symbolic factorization output.
pub struct SymbolicInfo {
    pub local_nodes: Vec<LocalNodeInfo>,
    pub dist_nodes: Vec<DistNodeInfo>,
}

impl SymbolicInfo {
    /// Height of this rank's nodal stacking (local node columns plus this
    /// rank's 1-D rows of each distributed node above the local root).
    pub fn local_nodal_height(&self) -> usize {
        let local: usize = self.local_nodes.iter().map(|n| n.size).sum();
        let dist: usize = self.dist_nodes[1..].iter().map(|n| n.local_size_1d).sum();
        local + dist
    }
}

fn set_union(a: &[usize], b: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            core::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            core::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            core::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

/// Positions of each element of the sorted subset `sub` inside the sorted
/// superset `full`, found with one monotone scan.
fn rel_positions(sub: &[usize], full: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(sub.len());
    let mut i = 0;
    for &s in sub {
        while full[i] < s {
            i += 1;
        }
        debug_assert!(full[i] == s, "relative index target missing from the front");
        out.push(i);
    }
    out
}

/// Enumerates this rank's locally owned entries of a child's Schur update
/// (lower triangle only, columns outer, in ascending child coordinates).
/// The update is the trailing block of the child's square front, so its
/// cyclic alignments are inherited from the child size.
pub(crate) fn for_each_child_update_entry(
    child_size: usize,
    update_size: usize,
    cgh: usize,
    cgw: usize,
    cg_row: usize,
    cg_col: usize,
    mut f: impl FnMut(usize, usize, usize, usize),
) {
    let row_shift = grid::shift(cg_row, child_size % cgh, cgh);
    let col_shift = grid::shift(cg_col, child_size % cgw, cgw);
    let local_h = grid::local_length(update_size, row_shift, cgh);
    let local_w = grid::local_length(update_size, col_shift, cgw);
    for jl in 0..local_w {
        let j = col_shift + jl * cgw;
        let il0 = if j <= row_shift {
            0
        } else {
            (j - row_shift).div_ceil(cgh)
        };
        for il in il0..local_h {
            let i = row_shift + il * cgh;
            debug_assert!(i >= j);
            f(i, j, il, jl);
        }
    }
}

/// Enumerates this rank's locally owned rows of a child's solve update (the
/// trailing rows of the child's 1-D work vector), ascending.
pub(crate) fn for_each_child_solve_row(
    child_size: usize,
    update_size: usize,
    child_team_rank: usize,
    child_team_size: usize,
    mut f: impl FnMut(usize, usize),
) {
    let tc = child_team_size;
    let shift1d = grid::shift(child_team_rank, child_size % tc, tc);
    let mut u = shift1d;
    while u < update_size {
        let w_local = (child_size + u - child_team_rank) / tc;
        f(u, w_local);
        u += tc;
    }
}

/// Runs the symbolic analysis over the elimination tree. Collective.
pub fn analysis(etree: &ElimTree, ctx: &Ctx) -> SymbolicInfo {
    let start = std::time::Instant::now();
    let local_nodes = local_analysis(etree, ctx);
    let dist_nodes = dist_analysis(etree, &local_nodes, ctx);
    log::debug!(
        "symbolic analysis: {} local nodes, {} distributed levels in {:?}",
        local_nodes.len(),
        dist_nodes.len(),
        start.elapsed()
    );
    SymbolicInfo {
        local_nodes,
        dist_nodes,
    }
}

fn local_analysis(etree: &ElimTree, ctx: &Ctx) -> Vec<LocalNodeInfo> {
    let mut infos: Vec<LocalNodeInfo> = Vec::with_capacity(etree.local_nodes.len());
    let mut my_offset = 0;
    for node in &etree.local_nodes {
        let info = match node.children {
            None => {
                let lower = node.lower_struct.clone();
                let orig_rel = (0..lower.len()).map(|i| node.size + i).collect();
                LocalNodeInfo {
                    size: node.size,
                    offset: node.offset,
                    my_offset,
                    parent: node.parent,
                    children: None,
                    orig_lower_struct: node.lower_struct.clone(),
                    orig_lower_rel: orig_rel,
                    lower_struct: lower,
                    left_child_rel: Vec::new(),
                    right_child_rel: Vec::new(),
                }
            }
            Some([l, r]) => {
                if ctx.check {
                    for s in [&infos[l].lower_struct, &infos[r].lower_struct] {
                        assert!(
                            s.windows(2).all(|w| w[0] < w[1]),
                            "child lower structure is not strictly sorted"
                        );
                    }
                }
                let children_struct = set_union(&infos[l].lower_struct, &infos[r].lower_struct);
                let partial = set_union(&node.lower_struct, &children_struct);
                let cols: Vec<usize> = (node.offset..node.offset + node.size).collect();
                let full = set_union(&cols, &partial);
                debug_assert!(full[..node.size] == cols[..], "front columns are not leading");
                LocalNodeInfo {
                    size: node.size,
                    offset: node.offset,
                    my_offset,
                    parent: node.parent,
                    children: node.children,
                    orig_lower_rel: rel_positions(&node.lower_struct, &full),
                    left_child_rel: rel_positions(&infos[l].lower_struct, &full),
                    right_child_rel: rel_positions(&infos[r].lower_struct, &full),
                    orig_lower_struct: node.lower_struct.clone(),
                    lower_struct: full[node.size..].to_vec(),
                }
            }
        };
        my_offset += info.size;
        infos.push(info);
    }
    infos
}

fn dist_analysis(etree: &ElimTree, local: &[LocalNodeInfo], ctx: &Ctx) -> Vec<DistNodeInfo> {
    let num_dist = etree.dist_nodes.len();
    let root_local = local.last().expect("empty local elimination tree");
    let mut dist: Vec<DistNodeInfo> = Vec::with_capacity(num_dist);

    // The bottom distributed node is this rank's local root on a team of one.
    let bottom_comm = etree.dist_nodes[0].comm.clone();
    dist.push(DistNodeInfo {
        size: root_local.size,
        offset: root_local.offset,
        my_offset: root_local.my_offset,
        local_size_1d: root_local.size,
        local_offset_1d: root_local.my_offset,
        grid: Grid::new(bottom_comm.clone()),
        comm: bottom_comm,
        on_left: false,
        orig_lower_struct: root_local.orig_lower_struct.clone(),
        orig_lower_rel: root_local.orig_lower_rel.clone(),
        lower_struct: root_local.lower_struct.clone(),
        left_child_size: 0,
        right_child_size: 0,
        left_child_rel: Vec::new(),
        right_child_rel: Vec::new(),
        fact_send_counts: Vec::new(),
        left_fact_col_indices: Vec::new(),
        left_fact_row_indices: Vec::new(),
        right_fact_col_indices: Vec::new(),
        right_fact_row_indices: Vec::new(),
        fact_recv_indices: Vec::new(),
        solve_send_counts: Vec::new(),
        left_solve_indices: Vec::new(),
        right_solve_indices: Vec::new(),
        solve_recv_indices: Vec::new(),
    });

    let mut my_offset = root_local.my_offset + root_local.size;
    let mut local_offset_1d = my_offset;

    for l in 1..num_dist {
        let enode = &etree.dist_nodes[l];
        let team = enode.comm.clone();
        let t = team.size();
        let team_rank = team.rank();
        debug_assert!(t == 1usize << l, "level {l} team has size {t}");
        let tc = t / 2;
        let partner = team_rank ^ tc;
        let on_left = enode.on_left;
        debug_assert!(on_left == (team_rank < tc));

        let (my_child_size, my_child_lower, cgh, cgw, cg_row, cg_col, child_team_rank) = {
            let child = &dist[l - 1];
            (
                child.size,
                child.lower_struct.clone(),
                child.grid.height(),
                child.grid.width(),
                child.grid.row(),
                child.grid.col(),
                child.comm.rank(),
            )
        };

        // Exchange the child's size and union lower structure with the
        // partner rank of the sibling half-team.
        let mut msg = vec![my_child_size, my_child_lower.len()];
        msg.extend_from_slice(&my_child_lower);
        let their = comm::send_recv(&*team, partner, &msg);
        let their_child_size = their[0];
        let their_lower = &their[2..2 + their[1]];

        let children_struct = set_union(&my_child_lower, their_lower);
        let partial = set_union(&enode.lower_struct, &children_struct);
        let cols: Vec<usize> = (enode.offset..enode.offset + enode.size).collect();
        let full = set_union(&cols, &partial);
        debug_assert!(full[..enode.size] == cols[..], "front columns are not leading");

        let orig_lower_rel = rel_positions(&enode.lower_struct, &full);
        let (left_lower, right_lower, left_child_size, right_child_size) = if on_left {
            (&my_child_lower[..], their_lower, my_child_size, their_child_size)
        } else {
            (their_lower, &my_child_lower[..], their_child_size, my_child_size)
        };
        let left_child_rel = rel_positions(left_lower, &full);
        let right_child_rel = rel_positions(right_lower, &full);
        let lower_struct = full[enode.size..].to_vec();

        if ctx.check {
            // Both half-teams must have derived the same structure.
            let theirs = comm::send_recv(&*team, partner, &[lower_struct.len()]);
            assert!(
                theirs[0] == lower_struct.len(),
                "partner rank derived a lower structure of size {} against {}",
                theirs[0],
                lower_struct.len()
            );
        }

        let grid_ = Grid::new(team.clone());
        let (gh, gw) = (grid_.height(), grid_.width());
        let (g_row, g_col) = (grid_.row(), grid_.col());
        let local_size_1d = grid::local_length(enode.size, team_rank, t);

        let my_rel = if on_left { &left_child_rel } else { &right_child_rel };
        let update_size = my_child_lower.len();

        // How much extend-add traffic this rank sends to each peer.
        let mut fact_send_counts = vec![0usize; t];
        for_each_child_update_entry(my_child_size, update_size, cgh, cgw, cg_row, cg_col, |i, j, _, _| {
            let dest = grid_.rank_of(my_rel[i] % gh, my_rel[j] % gw);
            fact_send_counts[dest] += 1;
        });

        // How much solve traffic this rank sends to each peer.
        let mut solve_send_counts = vec![0usize; t];
        for_each_child_solve_row(my_child_size, update_size, child_team_rank, tc, |u, _| {
            solve_send_counts[my_rel[u] % t] += 1;
        });

        // Child update indices whose front position lands on this rank.
        let filter = |rel: &[usize], modulus: usize, coord: usize| -> Vec<usize> {
            (0..rel.len()).filter(|&i| rel[i] % modulus == coord).collect()
        };
        let left_fact_col_indices = filter(&left_child_rel, gh, g_row);
        let left_fact_row_indices = filter(&left_child_rel, gw, g_col);
        let right_fact_col_indices = filter(&right_child_rel, gh, g_row);
        let right_fact_row_indices = filter(&right_child_rel, gw, g_col);
        let left_solve_indices = filter(&left_child_rel, t, team_rank);
        let right_solve_indices = filter(&right_child_rel, t, team_rank);

        // Both half-teams have the same size, so both children share the
        // same grid shape.
        debug_assert!((cgh, cgw) == Grid::dims_for(tc));

        // Extend-add receive positions, per source rank, in each source's
        // packing order (columns outer, rows inner, ascending).
        let mut fact_recv_indices: Vec<Vec<(usize, usize)>> = vec![Vec::new(); t];
        for (rel, child_size, row_idx, col_idx, rank_offset) in [
            (
                &left_child_rel,
                left_child_size,
                &left_fact_row_indices,
                &left_fact_col_indices,
                0,
            ),
            (
                &right_child_rel,
                right_child_size,
                &right_fact_row_indices,
                &right_fact_col_indices,
                tc,
            ),
        ] {
            for &j_child in row_idx {
                let j_front = rel[j_child];
                let child_col = (j_child + child_size) % cgw;
                let start = col_idx.partition_point(|&i| i < j_child);
                for &i_child in &col_idx[start..] {
                    let i_front = rel[i_child];
                    let child_row = (i_child + child_size) % cgh;
                    let src = rank_offset + child_row + child_col * cgh;
                    fact_recv_indices[src].push((i_front, j_front));
                }
            }
        }

        // Solve receive rows, per source rank, in each source's packing order.
        let mut solve_recv_indices: Vec<Vec<usize>> = vec![Vec::new(); t];
        for (rel, child_size, solve_idx, rank_offset) in [
            (&left_child_rel, left_child_size, &left_solve_indices, 0),
            (&right_child_rel, right_child_size, &right_solve_indices, tc),
        ] {
            for &i_child in solve_idx.iter() {
                let i_front = rel[i_child];
                let w_local = (i_front - team_rank) / t;
                let src = rank_offset + (i_child + child_size) % tc;
                solve_recv_indices[src].push(w_local);
            }
        }

        dist.push(DistNodeInfo {
            size: enode.size,
            offset: enode.offset,
            my_offset,
            local_size_1d,
            local_offset_1d,
            comm: team.clone(),
            grid: grid_,
            on_left,
            orig_lower_struct: enode.lower_struct.clone(),
            orig_lower_rel,
            lower_struct,
            left_child_size,
            right_child_size,
            left_child_rel,
            right_child_rel,
            fact_send_counts,
            left_fact_col_indices,
            left_fact_row_indices,
            right_fact_col_indices,
            right_fact_row_indices,
            fact_recv_indices,
            solve_send_counts,
            left_solve_indices,
            right_solve_indices,
            solve_recv_indices,
        });
        my_offset += enode.size;
        local_offset_1d += local_size_1d;
    }
    dist
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bisect::{stencil_graph, BfsBisector};
    use crate::comm;
    use crate::graph::DistGraph;
    use crate::nested_dissection::{nested_dissection, NdControl};
    use crate::Ctx;

    fn dist_stencil(n1: usize, n2: usize, n3: usize, c: comm::CommRef) -> DistGraph {
        let seq = stencil_graph(n1, n2, n3);
        let mut g = DistGraph::new(seq.num_sources(), c);
        g.start_assembly();
        for i in g.first_local_source()..g.first_local_source() + g.num_local_sources() {
            for &t in seq.targets_of(i) {
                g.insert(i, t);
            }
        }
        g.stop_assembly();
        g
    }

    fn analyse(n1: usize, n2: usize, cutoff: usize, c: comm::CommRef) -> SymbolicInfo {
        let ctl = NdControl {
            cutoff,
            ..NdControl::default()
        };
        let g = dist_stencil(n1, n2, 1, c);
        let (_, _, etree) = nested_dissection(&g, &BfsBisector, &ctl, &Ctx::default());
        analysis(&etree, &Ctx::default())
    }

    #[test]
    fn relative_indices_point_into_the_front() {
        let info = comm::run_spmd(1, |c| analyse(12, 12, 8, c)).pop().unwrap();
        for node in &info.local_nodes {
            let mut full: Vec<usize> = (node.offset..node.offset + node.size).collect();
            full.extend_from_slice(&node.lower_struct);
            for (k, &rel) in node.orig_lower_rel.iter().enumerate() {
                assert_eq!(full[rel], node.orig_lower_struct[k]);
            }
            if let Some([l, r]) = node.children {
                for (child, rel) in [
                    (&info.local_nodes[l], &node.left_child_rel),
                    (&info.local_nodes[r], &node.right_child_rel),
                ] {
                    assert_eq!(child.lower_struct.len(), rel.len());
                    for (k, &p) in rel.iter().enumerate() {
                        assert_eq!(full[p], child.lower_struct[k]);
                    }
                }
            }
        }
    }

    #[test]
    fn union_lower_structure_recursion_holds() {
        let info = comm::run_spmd(1, |c| analyse(12, 12, 8, c)).pop().unwrap();
        for node in &info.local_nodes {
            if let Some([l, r]) = node.children {
                let mut expect: Vec<usize> = node.orig_lower_struct.clone();
                for c in [l, r] {
                    expect.extend(
                        info.local_nodes[c]
                            .lower_struct
                            .iter()
                            .copied()
                            .filter(|&i| i >= node.offset + node.size),
                    );
                }
                expect.sort_unstable();
                expect.dedup();
                assert_eq!(node.lower_struct, expect);
            }
        }
    }

    #[test]
    fn distributed_structures_match_sequential_run() {
        let base = comm::run_spmd(1, |c| analyse(16, 16, 16, c)).pop().unwrap();
        comm::run_spmd(4, |c| {
            let info = analyse(16, 16, 16, c);
            // Each distributed node corresponds to the sequential node with
            // the same column offset; structures must agree exactly.
            for dn in &info.dist_nodes[1..] {
                let sn = base
                    .local_nodes
                    .iter()
                    .find(|n| n.offset == dn.offset && n.size == dn.size)
                    .expect("no sequential counterpart for a distributed node");
                assert_eq!(dn.lower_struct, sn.lower_struct);
                assert_eq!(dn.orig_lower_rel, sn.orig_lower_rel);
            }
        });
    }

    #[test]
    fn exchange_counts_balance_across_the_team() {
        comm::run_spmd(4, |c| {
            let info = analyse(16, 16, 16, c);
            for dn in &info.dist_nodes[1..] {
                let t = dn.comm.size();
                let fact = comm::all_gather_v(&*dn.comm, &dn.fact_send_counts);
                let solve = comm::all_gather_v(&*dn.comm, &dn.solve_send_counts);
                let me = dn.comm.rank();
                for q in 0..t {
                    assert_eq!(fact[q][me], dn.fact_recv_indices[q].len());
                    assert_eq!(solve[q][me], dn.solve_recv_indices[q].len());
                }
            }
        });
    }
}
