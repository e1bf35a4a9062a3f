//! Distributed triangular solves over the factored frontal tree.
//!
//! The forward sweep walks local supernodes in post-order and then the
//! distributed levels bottom-up, building each supernode's work vector from
//! its nodal right-hand-side rows, accumulating the children's updates
//! (through the cached solve exchange patterns for the distributed levels),
//! and applying the forward kernel. The diagonal sweep acts on the nodal
//! vector alone. The backward sweep runs in reverse: each supernode copies
//! the rows it contributed from its parent's solved work vector into its own
//! bottom rows and applies the backward kernel.

use crate::comm;
use crate::dense::Mat;
use crate::front::{dist, local, FrontTree, LdlMode};
use crate::grid::VcMat;
use crate::rhs::DistNodalMultiVec;
use crate::scalar::Scalar;
use crate::symbolic::{for_each_child_solve_row, SymbolicInfo};
use crate::Ctx;

/// Solves `L D L^{T|H} X = B` in the nodal layout, overwriting `x`.
/// Collective.
pub fn ldl_solve<S: Scalar>(
    info: &SymbolicInfo,
    tree: &FrontTree<S>,
    x: &mut DistNodalMultiVec<S>,
    ctx: &Ctx,
) {
    let start = std::time::Instant::now();
    let (mut local_w, mut dist_w) = lower_forward(info, tree, x, ctx);
    if tree.mode == LdlMode::Normal {
        diagonal_solve(info, tree, x);
    }
    lower_backward(info, tree, x, &mut local_w, &mut dist_w);
    log::debug!("triangular solves done in {:?}", start.elapsed());
}

type LocalW<S> = Vec<(Mat<S>, Mat<S>)>;

fn lower_forward<S: Scalar>(
    info: &SymbolicInfo,
    tree: &FrontTree<S>,
    x: &mut DistNodalMultiVec<S>,
    ctx: &Ctx,
) -> (LocalW<S>, Vec<VcMat<S>>) {
    let width = x.local.ncols();
    let nl = info.local_nodes.len();
    let root = nl - 1;

    // Local sweep.
    let mut local_w: LocalW<S> = Vec::with_capacity(nl);
    for s in 0..nl {
        let node = &info.local_nodes[s];
        let u = node.lower_struct.len();
        let mut w_t = Mat::zeros(node.size, width);
        let mut w_b = Mat::zeros(u, width);
        for c in 0..node.size {
            for j in 0..width {
                w_t[(c, j)] = x.local[(node.my_offset + c, j)];
            }
        }
        if let Some([lc, rc]) = node.children {
            for (cidx, rel) in [(lc, &node.left_child_rel), (rc, &node.right_child_rel)] {
                let (_, cw_b) = &local_w[cidx];
                for (i, &r) in rel.iter().enumerate() {
                    for j in 0..width {
                        let v = cw_b[(i, j)];
                        if r < node.size {
                            w_t[(r, j)] += v;
                        } else {
                            w_b[(r - node.size, j)] += v;
                        }
                    }
                }
            }
        }
        let front = &tree.local[s];
        local::dispatch_forward(tree.mode, &front.pivots, &front.l_t, &front.l_b, &mut w_t, &mut w_b);
        for c in 0..node.size {
            for j in 0..width {
                x.local[(node.my_offset + c, j)] = w_t[(c, j)];
            }
        }
        local_w.push((w_t, w_b));
    }

    // Distributed sweep.
    let nd = info.dist_nodes.len();
    let mut dist_w: Vec<VcMat<S>> = Vec::with_capacity(nd);
    dist_w.push(VcMat::zeros(info.dist_nodes[0].comm.clone(), 0, 0));
    for l in 1..nd {
        let node = &info.dist_nodes[l];
        let team = node.comm.clone();
        let t = team.size();
        let u = node.lower_struct.len();
        let mut w = VcMat::zeros(team.clone(), node.size + u, width);
        for li in 0..node.local_size_1d {
            for j in 0..width {
                w.local_mut()[(li, j)] = x.local[(node.local_offset_1d + li, j)];
            }
        }

        // Ship this rank's rows of the child's update to their owners in the
        // parent front, in the canonical ascending order.
        let child = &info.dist_nodes[l - 1];
        let tc = t / 2;
        let my_rel = if node.on_left {
            &node.left_child_rel
        } else {
            &node.right_child_rel
        };
        let mut sends: Vec<Vec<S>> = vec![Vec::new(); t];
        for_each_child_solve_row(
            child.size,
            child.lower_struct.len(),
            child.comm.rank(),
            tc,
            |uu, w_local| {
                let dest = my_rel[uu] % t;
                for j in 0..width {
                    let v = if l == 1 {
                        let (rw_t, rw_b) = &local_w[root];
                        if w_local < child.size {
                            rw_t[(w_local, j)]
                        } else {
                            rw_b[(w_local - child.size, j)]
                        }
                    } else {
                        dist_w[l - 1].local()[(w_local, j)]
                    };
                    sends[dest].push(v);
                }
            },
        );
        if ctx.check {
            for q in 0..t {
                assert!(
                    sends[q].len() == node.solve_send_counts[q] * width,
                    "solve send count drifted from the symbolic cache"
                );
            }
        }
        let recvs = comm::all_to_all_v(&*team, sends);
        for q in 0..t {
            let idxs = &node.solve_recv_indices[q];
            assert!(recvs[q].len() == idxs.len() * width, "solve receive count disagrees");
            for (k, &w_local) in idxs.iter().enumerate() {
                for j in 0..width {
                    let v = recvs[q][k * width + j];
                    let cur = w.local()[(w_local, j)];
                    w.local_mut()[(w_local, j)] = cur + v;
                }
            }
        }

        dist::front_forward_solve(tree.mode, node, &tree.dist[l], &mut w);
        for li in 0..node.local_size_1d {
            for j in 0..width {
                x.local[(node.local_offset_1d + li, j)] = w.local()[(li, j)];
            }
        }
        dist_w.push(w);
    }
    (local_w, dist_w)
}

fn diagonal_solve<S: Scalar>(info: &SymbolicInfo, tree: &FrontTree<S>, x: &mut DistNodalMultiVec<S>) {
    let width = x.local.ncols();
    for (s, node) in info.local_nodes.iter().enumerate() {
        let diag = &tree.local[s].pivots.diag;
        for c in 0..node.size {
            for j in 0..width {
                let v = x.local[(node.my_offset + c, j)];
                x.local[(node.my_offset + c, j)] = v / diag[c];
            }
        }
    }
    for (l, node) in info.dist_nodes.iter().enumerate().skip(1) {
        let t = node.comm.size();
        let rank = node.comm.rank();
        let diag = &tree.dist[l].pivots.diag;
        for li in 0..node.local_size_1d {
            let r = rank + li * t;
            for j in 0..width {
                let v = x.local[(node.local_offset_1d + li, j)];
                x.local[(node.local_offset_1d + li, j)] = v / diag[r];
            }
        }
    }
}

fn lower_backward<S: Scalar>(
    info: &SymbolicInfo,
    tree: &FrontTree<S>,
    x: &mut DistNodalMultiVec<S>,
    local_w: &mut LocalW<S>,
    dist_w: &mut [VcMat<S>],
) {
    let width = x.local.ncols();
    let nl = info.local_nodes.len();
    let nd = info.dist_nodes.len();
    let root = nl - 1;

    // Distributed sweep, top down. Each level's work vector is rebuilt: the
    // top rows reload the current nodal values (which carry the diagonal
    // solve), the bottom rows copy the parent's solved work vector.
    for l in (1..nd).rev() {
        let node = &info.dist_nodes[l];
        for li in 0..node.local_size_1d {
            for j in 0..width {
                dist_w[l].local_mut()[(li, j)] = x.local[(node.local_offset_1d + li, j)];
            }
        }
        if l + 1 < nd {
            pull_parent_rows(info, local_w, dist_w, l, width, root);
        }
        dist::front_backward_solve(tree.mode, tree.conj, node, &tree.dist[l], &mut dist_w[l]);
        for li in 0..node.local_size_1d {
            for j in 0..width {
                x.local[(node.local_offset_1d + li, j)] = dist_w[l].local()[(li, j)];
            }
        }
    }
    if nd > 1 {
        pull_parent_rows(info, local_w, dist_w, 0, width, root);
    }

    // Local sweep, reverse post-order, rebuilding each work vector the same
    // way.
    for s in (0..nl).rev() {
        let node = &info.local_nodes[s];
        {
            let (w_t, _) = &mut local_w[s];
            for c in 0..node.size {
                for j in 0..width {
                    w_t[(c, j)] = x.local[(node.my_offset + c, j)];
                }
            }
        }
        if let Some(p) = node.parent {
            let pnode = &info.local_nodes[p];
            let rel = if pnode.children.unwrap()[0] == s {
                &pnode.left_child_rel
            } else {
                &pnode.right_child_rel
            };
            debug_assert!(p > s);
            let (lo, hi) = local_w.split_at_mut(p);
            let (pw_t, pw_b) = &hi[0];
            let (_, w_b) = &mut lo[s];
            for (i, &r) in rel.iter().enumerate() {
                for j in 0..width {
                    w_b[(i, j)] = if r < pnode.size {
                        pw_t[(r, j)]
                    } else {
                        pw_b[(r - pnode.size, j)]
                    };
                }
            }
        }
        let front = &tree.local[s];
        let (w_t, w_b) = &mut local_w[s];
        local::dispatch_backward(tree.mode, tree.conj, &front.pivots, &front.l_t, &front.l_b, w_t, w_b);
        for c in 0..node.size {
            for j in 0..width {
                x.local[(node.my_offset + c, j)] = w_t[(c, j)];
            }
        }
    }
}

/// Sends each row of the parent level's solved work vector back to the rank
/// that contributed it during the forward sweep, and overwrites the child
/// level's bottom rows with the received values.
fn pull_parent_rows<S: Scalar>(
    info: &SymbolicInfo,
    local_w: &mut LocalW<S>,
    dist_w: &mut [VcMat<S>],
    child_level: usize,
    width: usize,
    root: usize,
) {
    let pnode = &info.dist_nodes[child_level + 1];
    let pt = pnode.comm.size();

    let mut sends: Vec<Vec<S>> = vec![Vec::new(); pt];
    for (q, bucket) in sends.iter_mut().enumerate() {
        for &w_local in &pnode.solve_recv_indices[q] {
            for j in 0..width {
                bucket.push(dist_w[child_level + 1].local()[(w_local, j)]);
            }
        }
    }
    let recvs = comm::all_to_all_v(&*pnode.comm, sends);

    let cnode = &info.dist_nodes[child_level];
    let tc = pt / 2;
    let my_rel = if pnode.on_left {
        &pnode.left_child_rel
    } else {
        &pnode.right_child_rel
    };
    let mut cursors = vec![0usize; pt];
    for_each_child_solve_row(
        cnode.size,
        cnode.lower_struct.len(),
        cnode.comm.rank(),
        tc,
        |uu, w_local| {
            let src = my_rel[uu] % pt;
            for j in 0..width {
                let v = recvs[src][cursors[src]];
                cursors[src] += 1;
                if child_level == 0 {
                    local_w[root].1[(w_local - cnode.size, j)] = v;
                } else {
                    dist_w[child_level].local_mut()[(w_local, j)] = v;
                }
            }
        },
    );
}
