//! The distributed multifrontal LDL driver.
//!
//! Local supernodes are processed in post-order: the children's Schur
//! complements are scattered into the parent's front through the relative
//! index maps (the extend-add), the front is factored in place, and its own
//! Schur complement is left for the parent. The distributed levels then walk
//! up the top of the tree, performing the extend-add with one vector
//! all-to-all per level against the exchange patterns cached by the symbolic
//! analysis, and factoring each front with the team-replicated kernel.
//!
//! A numerical failure on one rank must not strand its peers inside a
//! collective, so a failed rank keeps exchanging correctly sized payloads and
//! the whole group agrees on the final outcome in a closing flag exchange.

use crate::comm;
use crate::dense::Mat;
use crate::front::{dist, local, FrontTree};
use crate::grid::DistMat;
use crate::scalar::Scalar;
use crate::symbolic::{for_each_child_update_entry, SymbolicInfo};
use crate::{Ctx, LdlError};

/// Factors every front of the tree in place. Collective; every rank returns
/// the same result.
pub fn ldl<S: Scalar>(
    info: &SymbolicInfo,
    tree: &mut FrontTree<S>,
    ctx: &Ctx,
) -> Result<(), LdlError> {
    let start = std::time::Instant::now();
    let mode = tree.mode;
    let conj = tree.conj;
    let mut failure: Option<LdlError> = None;

    // Local phase, in post-order.
    for s in 0..info.local_nodes.len() {
        let node = &info.local_nodes[s];
        let u = node.lower_struct.len();
        let mut work = Mat::zeros(u, u);

        if let Some([lc, rc]) = node.children {
            for (c, rel) in [(lc, &node.left_child_rel), (rc, &node.right_child_rel)] {
                let cw = core::mem::replace(&mut tree.local[c].work, Mat::zeros(0, 0));
                debug_assert!(cw.nrows() == rel.len());
                for jc in 0..cw.ncols() {
                    let rj = rel[jc];
                    for ic in jc..cw.nrows() {
                        let v = cw[(ic, jc)];
                        if v.is_zero() {
                            continue;
                        }
                        let ri = rel[ic];
                        if rj < node.size {
                            if ri < node.size {
                                tree.local[s].l_t[(ri, rj)] += v;
                            } else {
                                tree.local[s].l_b[(ri - node.size, rj)] += v;
                            }
                        } else {
                            work[(ri - node.size, rj - node.size)] += v;
                        }
                    }
                }
            }
        }

        if failure.is_none() {
            let front = &mut tree.local[s];
            match local::front_ldl(mode, conj, &mut front.l_t, &mut front.l_b, &mut work) {
                Ok(p) => front.pivots = p,
                Err(e) => failure = Some(e),
            }
        }
        tree.local[s].work = work;
    }

    // The local root's Schur complement becomes the bottom distributed
    // node's update, on its team of one.
    let root = info.local_nodes.len() - 1;
    {
        let w = core::mem::replace(&mut tree.local[root].work, Mat::zeros(0, 0));
        let grid = info.dist_nodes[0].grid.clone();
        tree.dist[0].work = DistMat::from_local_full(grid, w);
    }

    // Distributed phase, level by level.
    for l in 1..info.dist_nodes.len() {
        let node = &info.dist_nodes[l];
        let team = node.comm.clone();
        let t = team.size();
        let s_size = node.size;
        let u = node.lower_struct.len();
        let (gh, gw) = (node.grid.height(), node.grid.width());
        let mut work = DistMat::zeros(node.grid.clone(), u, u, s_size % gh, s_size % gw);

        // Extend-add: pack this rank's entries of the child's update in the
        // canonical order, one bucket per destination.
        let child_node = &info.dist_nodes[l - 1];
        let child_work = core::mem::replace(
            &mut tree.dist[l - 1].work,
            DistMat::empty(child_node.grid.clone()),
        );
        let my_rel = if node.on_left {
            &node.left_child_rel
        } else {
            &node.right_child_rel
        };
        let mut sends: Vec<Vec<S>> = vec![Vec::new(); t];
        for_each_child_update_entry(
            child_node.size,
            child_node.lower_struct.len(),
            child_node.grid.height(),
            child_node.grid.width(),
            child_node.grid.row(),
            child_node.grid.col(),
            |i, j, il, jl| {
                let dest = node.grid.rank_of(my_rel[i] % gh, my_rel[j] % gw);
                sends[dest].push(child_work.local()[(il, jl)]);
            },
        );
        drop(child_work);
        if ctx.check {
            for q in 0..t {
                assert!(
                    sends[q].len() == node.fact_send_counts[q],
                    "extend-add send count drifted from the symbolic cache"
                );
            }
        }
        let recvs = comm::all_to_all_v(&*team, sends);
        for q in 0..t {
            let idxs = &node.fact_recv_indices[q];
            assert!(
                recvs[q].len() == idxs.len(),
                "extend-add receive count disagrees with the symbolic cache"
            );
            let front = &mut tree.dist[l];
            for (&(i_front, j_front), &v) in idxs.iter().zip(recvs[q].iter()) {
                if j_front < s_size {
                    if i_front < s_size {
                        let (li, lj) = front.l_t.local_of(i_front, j_front);
                        front.l_t.local_mut()[(li, lj)] += v;
                    } else {
                        let (li, lj) = front.l_b.local_of(i_front - s_size, j_front);
                        front.l_b.local_mut()[(li, lj)] += v;
                    }
                } else {
                    let (li, lj) = work.local_of(i_front - s_size, j_front - s_size);
                    work.local_mut()[(li, lj)] += v;
                }
            }
        }

        // Replicated dense factorization; the 2-D panels are released and
        // only the 1-D solve form is kept.
        let front = &mut tree.dist[l];
        let l_t = core::mem::replace(&mut front.l_t, DistMat::empty(node.grid.clone()));
        let l_b = core::mem::replace(&mut front.l_b, DistMat::empty(node.grid.clone()));
        let (atl, abl) = dist::gather_panel(node, &l_t, &l_b);
        drop((l_t, l_b));
        if failure.is_none() {
            match dist::compute_factor(mode, conj, node, atl, abl, &mut work) {
                Ok((l_1d, pivots)) => {
                    front.l_1d = l_1d;
                    front.pivots = pivots;
                }
                Err(e) => failure = Some(e),
            }
        }
        front.work = work;
    }

    // Agree on the outcome across the whole group.
    let world = info.dist_nodes.last().unwrap().comm.clone();
    let mine = match &failure {
        Some(LdlError::ZeroPivot { column }) => column + 1,
        None => 0,
    };
    let flags = comm::all_gather_v(&*world, &[mine]);
    for f in flags {
        if f[0] > 0 {
            return Err(LdlError::ZeroPivot { column: f[0] - 1 });
        }
    }
    log::debug!("numeric factorization done in {:?}", start.elapsed());
    Ok(())
}

/// Releases the Schur accumulators after a factorization (the root has none,
/// and interior updates were consumed by their parents). Fronts keep only
/// what the solves need.
pub fn release_schur<S: Scalar>(tree: &mut FrontTree<S>) {
    for f in tree.local.iter_mut() {
        f.work = Mat::zeros(0, 0);
    }
    for f in tree.dist.iter_mut() {
        let grid = f.work.grid().clone();
        f.work = DistMat::empty(grid);
    }
}
