//! Kernels for fronts distributed over a team.
//!
//! The factorization kernel gathers the pivot block and elimination panel of
//! the front onto every team rank (they are the communication-light part of
//! the front), factors them redundantly and deterministically with the local
//! panel kernel, and applies the Schur update only to this rank's cyclic
//! piece of the accumulator, which stays distributed. The factored panel's
//! 1-D row-cyclic solve form then falls out of the replicated copy with no
//! further communication.
//!
//! The solve kernels replicate only the top block of the work vector plus an
//! `O(size × nrhs)` correction term per rank: one gather per front per sweep.

use crate::comm;
use crate::dense::{
    apply_row_perm, apply_row_perm_inv, matmul_acc, solve_lower_in_place,
    solve_lower_transpose_in_place, Mat,
};
use crate::front::local::{factor_panel, FactoredPanel};
use crate::front::{DistFront, LdlMode, PivotData};
use crate::grid::{self, VcMat};
use crate::scalar::{Conj, Diag, Scalar};
use crate::symbolic::{for_each_child_update_entry, DistNodeInfo};
use crate::LdlError;

/// Gathers the front's pivot block and elimination panel onto every team
/// rank. Collective over the node's team.
pub(crate) fn gather_panel<S: Scalar>(
    node: &DistNodeInfo,
    l_t: &crate::grid::DistMat<S>,
    l_b: &crate::grid::DistMat<S>,
) -> (Mat<S>, Mat<S>) {
    let s = node.size;
    let u = node.lower_struct.len();
    let (gh, gw) = (node.grid.height(), node.grid.width());
    let t = node.comm.size();

    let mut payload = Vec::with_capacity(l_t.local().data().len() + l_b.local().data().len());
    payload.extend_from_slice(l_t.local().data());
    payload.extend_from_slice(l_b.local().data());
    let parts = comm::all_gather_v(&*node.comm, &payload);

    let mut atl = Mat::zeros(s, s);
    let mut abl = Mat::zeros(u, s);
    for (q, part) in parts.iter().enumerate().take(t) {
        let (qr, qc) = (q % gh, q / gh);
        let h_t = grid::local_length(s, qr, gh);
        let w_t = grid::local_length(s, qc, gw);
        let rb = grid::shift(qr, s % gh, gh);
        let h_b = grid::local_length(u, rb, gh);
        let mut idx = 0;
        for lj in 0..w_t {
            for li in 0..h_t {
                atl[(qr + li * gh, qc + lj * gw)] = part[idx];
                idx += 1;
            }
        }
        for lj in 0..w_t {
            for li in 0..h_b {
                abl[(rb + li * gh, qc + lj * gw)] = part[idx];
                idx += 1;
            }
        }
        debug_assert!(idx == part.len(), "panel gather payload mismatch");
    }
    (atl, abl)
}

/// Factors a gathered front panel and applies the Schur update to this
/// rank's piece of the accumulator; returns the 1-D solve form and the pivot
/// caches. Not collective (the gather already happened).
pub(crate) fn compute_factor<S: Scalar>(
    mode: LdlMode,
    conj: Conj,
    node: &DistNodeInfo,
    atl: Mat<S>,
    abl: Mat<S>,
    work: &mut crate::grid::DistMat<S>,
) -> Result<(VcMat<S>, PivotData<S>), LdlError> {
    let s = node.size;
    let u = node.lower_struct.len();
    let fp: FactoredPanel<S> = factor_panel(mode, conj, atl, abl)?;

    // Schur update restricted to this rank's entries of the lower triangle.
    let (gh, gw) = (node.grid.height(), node.grid.width());
    let (g_row, g_col) = (node.grid.row(), node.grid.col());
    {
        let wl = work.local_mut();
        for_each_child_update_entry(s, u, gh, gw, g_row, g_col, |i, j, il, jl| {
            let mut acc = S::zero();
            for k in 0..s {
                acc += fp.l21[(i, k)] * conj.apply(fp.y[(j, k)]);
            }
            wl[(il, jl)] -= acc;
        });
    }

    // 1-D row-cyclic solve form of the stored panel.
    let t = node.comm.size();
    let rank = node.comm.rank();
    let mut l_1d = VcMat::zeros(node.comm.clone(), s + u, s);
    for li in 0..l_1d.local().nrows() {
        let r = rank + li * t;
        for c in 0..s {
            l_1d.local_mut()[(li, c)] = if r < s {
                fp.atl[(r, c)]
            } else {
                fp.abl[(r - s, c)]
            };
        }
    }
    Ok((l_1d, fp.pivots))
}

/// Gathers the replicated pivot-block rows of the stored panel and the top
/// rows of the work vector; optionally reduces a per-rank `size × nrhs`
/// correction term at the same time. Collective over the node's team.
fn gather_top<S: Scalar>(
    node: &DistNodeInfo,
    front: &DistFront<S>,
    w: &VcMat<S>,
    extra: Option<&Mat<S>>,
) -> (Mat<S>, Mat<S>, Mat<S>) {
    let s = node.size;
    let t = node.comm.size();
    let rank = node.comm.rank();
    let width = w.ncols();

    let top_rows = grid::local_length(s, rank, t);
    let mut payload =
        Vec::with_capacity(top_rows * (s + width) + extra.map_or(0, |e| e.data().len()));
    for li in 0..top_rows {
        for c in 0..s {
            payload.push(front.l_1d.local()[(li, c)]);
        }
    }
    for li in 0..top_rows {
        for j in 0..width {
            payload.push(w.local()[(li, j)]);
        }
    }
    if let Some(e) = extra {
        payload.extend_from_slice(e.data());
    }
    let parts = comm::all_gather_v(&*node.comm, &payload);

    let mut atl = Mat::zeros(s, s);
    let mut wt = Mat::zeros(s, width);
    let mut sum = Mat::zeros(s, width);
    for (q, part) in parts.iter().enumerate().take(t) {
        let cnt = grid::local_length(s, q, t);
        let mut idx = 0;
        for li in 0..cnt {
            let r = q + li * t;
            for c in 0..s {
                atl[(r, c)] = part[idx];
                idx += 1;
            }
        }
        for li in 0..cnt {
            let r = q + li * t;
            for j in 0..width {
                wt[(r, j)] = part[idx];
                idx += 1;
            }
        }
        if extra.is_some() {
            for j in 0..width {
                for i in 0..s {
                    sum[(i, j)] += part[idx];
                    idx += 1;
                }
            }
        }
        debug_assert!(idx == part.len(), "top gather payload mismatch");
    }
    (atl, wt, sum)
}

/// Forward solve over a distributed front:
/// `W_T := L_T^{-1} W_T; W_B := W_B - L_B W_T` in the 1-D layout.
/// Collective over the node's team.
pub(crate) fn front_forward_solve<S: Scalar>(
    mode: LdlMode,
    node: &DistNodeInfo,
    front: &DistFront<S>,
    w: &mut VcMat<S>,
) {
    let s = node.size;
    assert!(w.nrows() == s + node.lower_struct.len(), "nonconformal front solve");
    let t = node.comm.size();
    let rank = node.comm.rank();
    let width = w.ncols();

    let (atl, mut wt, _) = gather_top(node, front, w, None);
    match mode {
        LdlMode::Normal => solve_lower_in_place(&atl, Diag::Unit, &mut wt),
        LdlMode::BlockLdl => {
            let y = wt.clone();
            wt.fill(S::zero());
            matmul_acc(&mut wt, S::one(), &atl, &y);
        }
        LdlMode::BlockLdlIntraPiv => {
            apply_row_perm(&mut wt, &front.pivots.piv);
            let y = wt.clone();
            wt.fill(S::zero());
            matmul_acc(&mut wt, S::one(), &atl, &y);
        }
    }

    // Write back this rank's top rows, then update its panel rows.
    let top_rows = grid::local_length(s, rank, t);
    for li in 0..top_rows {
        let r = rank + li * t;
        for j in 0..width {
            w.local_mut()[(li, j)] = wt[(r, j)];
        }
    }
    for li in top_rows..w.local().nrows() {
        for j in 0..width {
            let mut acc = S::zero();
            for c in 0..s {
                acc += front.l_1d.local()[(li, c)] * wt[(c, j)];
            }
            w.local_mut()[(li, j)] -= acc;
        }
    }
}

/// Backward solve over a distributed front:
/// `W_T := W_T - L_B^{T|H} W_B; W_T := L_T^{-T|H} W_T` in the 1-D layout.
/// Collective over the node's team.
pub(crate) fn front_backward_solve<S: Scalar>(
    mode: LdlMode,
    conj: Conj,
    node: &DistNodeInfo,
    front: &DistFront<S>,
    w: &mut VcMat<S>,
) {
    let s = node.size;
    assert!(w.nrows() == s + node.lower_struct.len(), "nonconformal front solve");
    let t = node.comm.size();
    let rank = node.comm.rank();
    let width = w.ncols();

    // This rank's contribution to L_B^{T|H} W_B.
    let mut partial = Mat::zeros(s, width);
    let top_rows = grid::local_length(s, rank, t);
    for li in top_rows..w.local().nrows() {
        for c in 0..s {
            let lc = conj.apply(front.l_1d.local()[(li, c)]);
            if lc.is_zero() {
                continue;
            }
            for j in 0..width {
                let wv = w.local()[(li, j)];
                partial[(c, j)] += lc * wv;
            }
        }
    }

    let (atl, mut wt, sum) = gather_top(node, front, w, Some(&partial));
    match mode {
        LdlMode::Normal => {
            for j in 0..width {
                for i in 0..s {
                    let v = sum[(i, j)];
                    wt[(i, j)] -= v;
                }
            }
            solve_lower_transpose_in_place(&atl, Diag::Unit, &mut wt, conj);
        }
        LdlMode::BlockLdl => {
            matmul_acc(&mut wt, -S::one(), &atl, &sum);
        }
        LdlMode::BlockLdlIntraPiv => {
            matmul_acc(&mut wt, -S::one(), &atl, &sum);
            apply_row_perm_inv(&mut wt, &front.pivots.piv);
        }
    }

    for li in 0..top_rows {
        let r = rank + li * t;
        for j in 0..width {
            w.local_mut()[(li, j)] = wt[(r, j)];
        }
    }
}

/// Mirror of the forward solve for distributed fronts:
/// `W_B := W_B + L_B W_T; W_T := L_T W_T`. Collective over the team.
pub fn front_lower_multiply_normal<S: Scalar>(
    diag: Diag,
    node: &DistNodeInfo,
    front: &DistFront<S>,
    w: &mut VcMat<S>,
) {
    let s = node.size;
    let t = node.comm.size();
    let rank = node.comm.rank();
    let width = w.ncols();
    let (atl, wt, _) = gather_top(node, front, w, None);

    let top_rows = grid::local_length(s, rank, t);
    for li in top_rows..w.local().nrows() {
        for j in 0..width {
            let mut acc = S::zero();
            for c in 0..s {
                acc += front.l_1d.local()[(li, c)] * wt[(c, j)];
            }
            let wv = w.local()[(li, j)];
            w.local_mut()[(li, j)] = wv + acc;
        }
    }
    for li in 0..top_rows {
        let r = rank + li * t;
        for j in 0..width {
            let mut v = match diag {
                Diag::Unit => wt[(r, j)],
                Diag::NonUnit => atl[(r, r)] * wt[(r, j)],
            };
            for c in 0..r {
                v += atl[(r, c)] * wt[(c, j)];
            }
            w.local_mut()[(li, j)] = v;
        }
    }
}

/// Mirror of the backward solve for distributed fronts:
/// `W_T := L_T^{T|H} W_T + L_B^{T|H} W_B`. Collective over the team.
pub fn front_lower_multiply_transpose<S: Scalar>(
    diag: Diag,
    conj: Conj,
    node: &DistNodeInfo,
    front: &DistFront<S>,
    w: &mut VcMat<S>,
) {
    let s = node.size;
    let t = node.comm.size();
    let rank = node.comm.rank();
    let width = w.ncols();

    let mut partial = Mat::zeros(s, width);
    let top_rows = grid::local_length(s, rank, t);
    for li in top_rows..w.local().nrows() {
        for c in 0..s {
            let lc = conj.apply(front.l_1d.local()[(li, c)]);
            if lc.is_zero() {
                continue;
            }
            for j in 0..width {
                let wv = w.local()[(li, j)];
                partial[(c, j)] += lc * wv;
            }
        }
    }
    let (atl, wt, sum) = gather_top(node, front, w, Some(&partial));
    for li in 0..top_rows {
        let r = rank + li * t;
        for j in 0..width {
            let mut v = match diag {
                Diag::Unit => wt[(r, j)],
                Diag::NonUnit => conj.apply(atl[(r, r)]) * wt[(r, j)],
            };
            for k in r + 1..s {
                v += conj.apply(atl[(k, r)]) * wt[(k, j)];
            }
            w.local_mut()[(li, j)] = v + sum[(r, j)];
        }
    }
}
