//! Dense kernels for fronts held entirely on one rank.
//!
//! Factorization kernels consume the pivot block `L_T`, the elimination panel
//! `L_B` and the Schur accumulator; solve kernels come in the plain
//! (triangular substitution), block (dense multiply against the stored
//! inverse) and intra-pivoted (row permutation around the block kernel)
//! variants, together with the lower-multiply mirrors of the solves.

use crate::dense::{
    apply_row_perm, apply_row_perm_inv, block_diag_solve_in_place,
    block_diag_solve_right_in_place, bunch_kaufman_in_place, ldl_in_place, ldl_product_inverse,
    matmul_acc, matmul_tn_acc, rank_update_lower, solve_lower_in_place,
    solve_lower_transpose_in_place, solve_unit_lower_right_transpose_in_place, Mat,
};
use crate::front::{LdlMode, PivotData};
use crate::scalar::{Conj, Diag, Scalar};
use crate::LdlError;

/// A factored front panel in its final stored form, together with the
/// intermediates the Schur update needs.
pub(crate) struct FactoredPanel<S> {
    /// Final pivot block: the packed factor (normal mode) or its inverse
    /// (block modes).
    pub atl: Mat<S>,
    /// Final elimination panel: the solved panel (normal mode) or the
    /// (pivoted) original entries (block modes).
    pub abl: Mat<S>,
    /// Solved panel `L21`.
    pub l21: Mat<S>,
    /// `L21 * D`.
    pub y: Mat<S>,
    pub pivots: PivotData<S>,
}

/// Factors the pivot block and solves the panel, without touching the Schur
/// accumulator. Shared between the local and the distributed kernels.
pub(crate) fn factor_panel<S: Scalar>(
    mode: LdlMode,
    conj: Conj,
    mut atl: Mat<S>,
    abl: Mat<S>,
) -> Result<FactoredPanel<S>, LdlError> {
    assert!(atl.nrows() == atl.ncols(), "pivot block must be square");
    assert!(abl.ncols() == atl.ncols(), "panel width must match the pivot block");
    let s = atl.nrows();

    match mode {
        LdlMode::Normal | LdlMode::BlockLdl => {
            let saved = if mode == LdlMode::BlockLdl {
                Some(abl.clone())
            } else {
                None
            };
            ldl_in_place(&mut atl, conj)?;
            let diag: Vec<S> = (0..s).map(|i| atl[(i, i)]).collect();
            let sub_diag = vec![S::zero(); s];
            let mut y = abl;
            solve_unit_lower_right_transpose_in_place(&atl, &mut y, conj);
            let mut l21 = y.clone();
            block_diag_solve_right_in_place(&diag, &sub_diag, conj, &mut l21);
            let pivots = PivotData {
                diag,
                sub_diag,
                piv: Vec::new(),
            };
            match saved {
                None => Ok(FactoredPanel {
                    abl: l21.clone(),
                    atl,
                    l21,
                    y,
                    pivots,
                }),
                Some(orig) => {
                    let inv = ldl_product_inverse(&atl, &pivots.diag, &pivots.sub_diag, conj);
                    Ok(FactoredPanel {
                        atl: inv,
                        abl: orig,
                        l21,
                        y,
                        pivots,
                    })
                }
            }
        }
        LdlMode::BlockLdlIntraPiv => {
            let bk = bunch_kaufman_in_place(&mut atl, conj)?;
            let diag: Vec<S> = (0..s).map(|i| atl[(i, i)]).collect();
            // Pivot the panel columns to match the permuted pivot block.
            let z = Mat::from_fn(abl.nrows(), s, |i, k| abl[(i, bk.perm[k])]);
            let mut y = z.clone();
            solve_unit_lower_right_transpose_in_place(&atl, &mut y, conj);
            let mut l21 = y.clone();
            block_diag_solve_right_in_place(&diag, &bk.sub_diag, conj, &mut l21);
            let inv = ldl_product_inverse(&atl, &diag, &bk.sub_diag, conj);
            Ok(FactoredPanel {
                atl: inv,
                abl: z,
                l21,
                y,
                pivots: PivotData {
                    diag,
                    sub_diag: bk.sub_diag,
                    piv: bk.perm,
                },
            })
        }
    }
}

/// Factors a local front in place: pivot block, panel, and Schur complement.
pub fn front_ldl<S: Scalar>(
    mode: LdlMode,
    conj: Conj,
    l_t: &mut Mat<S>,
    l_b: &mut Mat<S>,
    work: &mut Mat<S>,
) -> Result<PivotData<S>, LdlError> {
    assert!(work.nrows() == l_b.nrows() && work.ncols() == l_b.nrows());
    let atl = core::mem::replace(l_t, Mat::zeros(0, 0));
    let abl = core::mem::replace(l_b, Mat::zeros(0, 0));
    let fp = factor_panel(mode, conj, atl, abl)?;
    rank_update_lower(work, &fp.l21, &fp.y, conj);
    *l_t = fp.atl;
    *l_b = fp.abl;
    Ok(fp.pivots)
}

fn check_solve_dims<S: Scalar>(l_t: &Mat<S>, l_b: &Mat<S>, x_t: &Mat<S>, x_b: &Mat<S>) {
    assert!(l_t.nrows() == l_t.ncols(), "pivot block must be square");
    assert!(l_b.ncols() == l_t.ncols(), "panel width must match the pivot block");
    assert!(
        x_t.nrows() == l_t.ncols() && x_b.nrows() == l_b.nrows(),
        "nonconformal front solve"
    );
    assert!(x_t.ncols() == x_b.ncols(), "nonconformal front solve");
}

/// `X_T := L_T^{-1} X_T; X_B := X_B - L_B X_T`.
pub fn front_lower_forward_solve<S: Scalar>(
    diag: Diag,
    l_t: &Mat<S>,
    l_b: &Mat<S>,
    x_t: &mut Mat<S>,
    x_b: &mut Mat<S>,
) {
    check_solve_dims(l_t, l_b, x_t, x_b);
    solve_lower_in_place(l_t, diag, x_t);
    matmul_acc(x_b, -S::one(), l_b, x_t);
}

/// `X_T := X_T - L_B^{T|H} X_B; X_T := L_T^{-T|H} X_T`.
pub fn front_lower_backward_solve<S: Scalar>(
    diag: Diag,
    conj: Conj,
    l_t: &Mat<S>,
    l_b: &Mat<S>,
    x_t: &mut Mat<S>,
    x_b: &mut Mat<S>,
) {
    check_solve_dims(l_t, l_b, x_t, x_b);
    matmul_tn_acc(x_t, -S::one(), l_b, x_b, conj);
    solve_lower_transpose_in_place(l_t, diag, x_t, conj);
}

/// Block forward solve: the stored pivot block is already inverted, so the
/// triangular solve becomes a dense multiply.
pub fn front_block_lower_forward_solve<S: Scalar>(
    inv_atl: &Mat<S>,
    abl: &Mat<S>,
    x_t: &mut Mat<S>,
    x_b: &mut Mat<S>,
) {
    check_solve_dims(inv_atl, abl, x_t, x_b);
    let y = x_t.clone();
    x_t.fill(S::zero());
    matmul_acc(x_t, S::one(), inv_atl, &y);
    matmul_acc(x_b, -S::one(), abl, x_t);
}

/// Block backward solve: `X_T := X_T - inv(A_TL) (L_B^{T|H} X_B)`.
pub fn front_block_lower_backward_solve<S: Scalar>(
    conj: Conj,
    inv_atl: &Mat<S>,
    abl: &Mat<S>,
    x_t: &mut Mat<S>,
    x_b: &mut Mat<S>,
) {
    check_solve_dims(inv_atl, abl, x_t, x_b);
    let mut t = Mat::zeros(inv_atl.nrows(), x_t.ncols());
    matmul_tn_acc(&mut t, S::one(), abl, x_b, conj);
    matmul_acc(x_t, -S::one(), inv_atl, &t);
}

/// Intra-pivoted forward solve: apply the cached row permutation to `X_T`,
/// then run the block kernel.
pub fn front_intra_piv_lower_forward_solve<S: Scalar>(
    piv: &[usize],
    inv_atl: &Mat<S>,
    abl: &Mat<S>,
    x_t: &mut Mat<S>,
    x_b: &mut Mat<S>,
) {
    apply_row_perm(x_t, piv);
    front_block_lower_forward_solve(inv_atl, abl, x_t, x_b);
}

/// Intra-pivoted backward solve: run the block kernel, then undo the cached
/// row permutation on `X_T`.
pub fn front_intra_piv_lower_backward_solve<S: Scalar>(
    conj: Conj,
    piv: &[usize],
    inv_atl: &Mat<S>,
    abl: &Mat<S>,
    x_t: &mut Mat<S>,
    x_b: &mut Mat<S>,
) {
    front_block_lower_backward_solve(conj, inv_atl, abl, x_t, x_b);
    apply_row_perm_inv(x_t, piv);
}

/// Solves against the (block) diagonal of a factored front.
pub fn front_diagonal_solve<S: Scalar>(diag: &[S], sub_diag: &[S], conj: Conj, x: &mut Mat<S>) {
    block_diag_solve_in_place(diag, sub_diag, conj, x);
}

/// Mirror of the forward solve: `X_B := X_B + L_B X_T; X_T := L_T X_T`.
pub fn front_lower_multiply_normal<S: Scalar>(
    diag: Diag,
    l_t: &Mat<S>,
    l_b: &Mat<S>,
    x_t: &mut Mat<S>,
    x_b: &mut Mat<S>,
) {
    check_solve_dims(l_t, l_b, x_t, x_b);
    matmul_acc(x_b, S::one(), l_b, x_t);
    let n = l_t.nrows();
    for j in 0..x_t.ncols() {
        for i in (0..n).rev() {
            let mut v = match diag {
                Diag::Unit => x_t[(i, j)],
                Diag::NonUnit => l_t[(i, i)] * x_t[(i, j)],
            };
            for k in 0..i {
                v += l_t[(i, k)] * x_t[(k, j)];
            }
            x_t[(i, j)] = v;
        }
    }
}

/// Mirror of the backward solve:
/// `X_T := L_T^{T|H} X_T; X_T := X_T + L_B^{T|H} X_B`.
pub fn front_lower_multiply_transpose<S: Scalar>(
    diag: Diag,
    conj: Conj,
    l_t: &Mat<S>,
    l_b: &Mat<S>,
    x_t: &mut Mat<S>,
    x_b: &mut Mat<S>,
) {
    check_solve_dims(l_t, l_b, x_t, x_b);
    let n = l_t.nrows();
    for j in 0..x_t.ncols() {
        for i in 0..n {
            let mut v = match diag {
                Diag::Unit => x_t[(i, j)],
                Diag::NonUnit => conj.apply(l_t[(i, i)]) * x_t[(i, j)],
            };
            for k in i + 1..n {
                v += conj.apply(l_t[(k, i)]) * x_t[(k, j)];
            }
            x_t[(i, j)] = v;
        }
    }
    matmul_tn_acc(x_t, S::one(), l_b, x_b, conj);
}

/// Reconstructs `diag` as a dense block-diagonal multiply; used by the
/// multiply mirrors and tests.
pub fn front_diagonal_multiply<S: Scalar>(diag: &[S], sub_diag: &[S], conj: Conj, x: &mut Mat<S>) {
    let n = diag.len();
    assert!(x.nrows() == n, "nonconformal diagonal multiply");
    let mut k = 0;
    while k < n {
        if k + 1 < n && !sub_diag[k].is_zero() {
            let (d1, d2, e) = (diag[k], diag[k + 1], sub_diag[k]);
            for j in 0..x.ncols() {
                let (r1, r2) = (x[(k, j)], x[(k + 1, j)]);
                x[(k, j)] = d1 * r1 + conj.apply(e) * r2;
                x[(k + 1, j)] = e * r1 + d2 * r2;
            }
            k += 2;
        } else {
            let d = diag[k];
            for j in 0..x.ncols() {
                x[(k, j)] *= d;
            }
            k += 1;
        }
    }
}

pub(crate) fn dispatch_forward<S: Scalar>(
    mode: LdlMode,
    pivots: &PivotData<S>,
    l_t: &Mat<S>,
    l_b: &Mat<S>,
    x_t: &mut Mat<S>,
    x_b: &mut Mat<S>,
) {
    match mode {
        LdlMode::Normal => front_lower_forward_solve(Diag::Unit, l_t, l_b, x_t, x_b),
        LdlMode::BlockLdl => front_block_lower_forward_solve(l_t, l_b, x_t, x_b),
        LdlMode::BlockLdlIntraPiv => {
            front_intra_piv_lower_forward_solve(&pivots.piv, l_t, l_b, x_t, x_b)
        }
    }
}

pub(crate) fn dispatch_backward<S: Scalar>(
    mode: LdlMode,
    conj: Conj,
    pivots: &PivotData<S>,
    l_t: &Mat<S>,
    l_b: &Mat<S>,
    x_t: &mut Mat<S>,
    x_b: &mut Mat<S>,
) {
    match mode {
        LdlMode::Normal => front_lower_backward_solve(Diag::Unit, conj, l_t, l_b, x_t, x_b),
        LdlMode::BlockLdl => front_block_lower_backward_solve(conj, l_t, l_b, x_t, x_b),
        LdlMode::BlockLdlIntraPiv => {
            front_intra_piv_lower_backward_solve(conj, &pivots.piv, l_t, l_b, x_t, x_b)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::c64;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_mat(rng: &mut StdRng, m: usize, n: usize) -> Mat<c64> {
        Mat::from_fn(m, n, |_, _| c64::new(rng.gen::<f64>() - 0.5, rng.gen::<f64>() - 0.5))
    }

    /// A random Hermitian front: positive definite pivot block, dense panel,
    /// zero Schur accumulator.
    fn random_front(rng: &mut StdRng, s: usize, l: usize) -> (Mat<c64>, Mat<c64>, Mat<c64>) {
        let mut a = Mat::zeros(s + l, s + l);
        let w = random_mat(rng, s + l, s + l);
        matmul_tn_acc(&mut a, c64::one(), &w, &w, Conj::Yes);
        for i in 0..s + l {
            a[(i, i)] += c64::new(1.0, 0.0);
        }
        let l_t = Mat::from_fn(s, s, |i, j| a[(i, j)]);
        let l_b = Mat::from_fn(l, s, |i, j| a[(s + i, j)]);
        let work = Mat::zeros(l, l);
        (l_t, l_b, work)
    }

    fn solve_roundtrip(mode: LdlMode) {
        let mut rng = StdRng::seed_from_u64(7);
        let (s, l, w) = (11, 6, 2);
        let (l_t0, l_b0, mut work) = random_front(&mut rng, s, l);
        let mut l_t = l_t0.clone();
        let mut l_b = l_b0.clone();
        let pivots = front_ldl(mode, Conj::Yes, &mut l_t, &mut l_b, &mut work).unwrap();

        // Forward + diagonal + backward against the full factored front must
        // reproduce a direct dense solve of the leading block system when
        // the right-hand side is confined to the pivot block and the Schur
        // side is discarded: instead verify the factor reconstructs A via
        // multiply mirrors for the normal mode, and via solve consistency
        // for the block modes.
        let b_t = random_mat(&mut rng, s, w);
        let b_b = Mat::zeros(l, w);
        let mut x_t = b_t.clone();
        let mut x_b = b_b.clone();
        dispatch_forward(mode, &pivots, &l_t, &l_b, &mut x_t, &mut x_b);
        if mode == LdlMode::Normal {
            front_diagonal_solve(&pivots.diag, &pivots.sub_diag, Conj::Yes, &mut x_t);
        }
        dispatch_backward(mode, Conj::Yes, &pivots, &l_t, &l_b, &mut x_t, &mut x_b);

        // x_t must now satisfy A_TL x + A_TL^H-panel coupling limited to the
        // pivot block: since b_b = 0 and the update was not propagated
        // through a parent, the effective system solved is
        // [A_TL, A_BL^H; A_BL, A_BL inv(A_TL) A_BL^H] which restricted to
        // the first block row gives A_TL x_t + A_BL^H x_b2 = b_t with x_b2
        // the Schur-stage unknowns; for a front in isolation x_b carries
        // -L21-weighted data, so check the first block row only.
        let mut lhs = Mat::zeros(s, w);
        matmul_acc(&mut lhs, c64::one(), &l_t0, &x_t);
        matmul_tn_acc(&mut lhs, c64::one(), &l_b0, &x_b, Conj::Yes);
        for j in 0..w {
            for i in 0..s {
                assert!(
                    (lhs[(i, j)] - b_t[(i, j)]).abs() < 1e-8,
                    "mode {mode:?}, entry ({i}, {j})"
                );
            }
        }
    }

    #[test]
    fn normal_solve_satisfies_first_block_row() {
        solve_roundtrip(LdlMode::Normal);
    }

    #[test]
    fn block_solve_satisfies_first_block_row() {
        solve_roundtrip(LdlMode::BlockLdl);
    }

    #[test]
    fn intra_piv_solve_satisfies_first_block_row() {
        solve_roundtrip(LdlMode::BlockLdlIntraPiv);
    }

    #[test]
    fn schur_update_matches_dense_elimination() {
        let mut rng = StdRng::seed_from_u64(8);
        let (s, l) = (7, 5);
        let (l_t0, l_b0, mut work) = random_front(&mut rng, s, l);
        let mut l_t = l_t0.clone();
        let mut l_b = l_b0.clone();
        front_ldl(LdlMode::Normal, Conj::Yes, &mut l_t, &mut l_b, &mut work).unwrap();
        // work must equal -A_BL inv(A_TL) A_BL^H on its lower triangle.
        let mut inv = l_t0.clone();
        ldl_in_place(&mut inv, Conj::Yes).unwrap();
        let diag: Vec<c64> = (0..s).map(|i| inv[(i, i)]).collect();
        let m = ldl_product_inverse(&inv, &diag, &vec![c64::zero(); s], Conj::Yes);
        let mut t = Mat::zeros(l, s);
        matmul_acc(&mut t, c64::one(), &l_b0, &m);
        let mut expect = Mat::zeros(l, l);
        crate::dense::matmul_nt_acc(&mut expect, -c64::one(), &t, &l_b0, Conj::Yes);
        for j in 0..l {
            for i in j..l {
                assert!(
                    (work[(i, j)] - expect[(i, j)]).abs() < 1e-8,
                    "entry ({i}, {j})"
                );
            }
        }
    }

    #[test]
    fn multiply_mirrors_invert_the_solves() {
        let mut rng = StdRng::seed_from_u64(9);
        let (s, l, w) = (9, 4, 3);
        let (l_t0, l_b0, mut work) = random_front(&mut rng, s, l);
        let mut l_t = l_t0.clone();
        let mut l_b = l_b0.clone();
        let pivots = front_ldl(LdlMode::Normal, Conj::Yes, &mut l_t, &mut l_b, &mut work).unwrap();

        let x_t0 = random_mat(&mut rng, s, w);
        let x_b0 = random_mat(&mut rng, l, w);
        let mut x_t = x_t0.clone();
        let mut x_b = x_b0.clone();

        front_lower_forward_solve(Diag::Unit, &l_t, &l_b, &mut x_t, &mut x_b);
        front_lower_multiply_normal(Diag::Unit, &l_t, &l_b, &mut x_t, &mut x_b);
        for j in 0..w {
            for i in 0..s {
                assert!((x_t[(i, j)] - x_t0[(i, j)]).abs() < 1e-9);
            }
            for i in 0..l {
                assert!((x_b[(i, j)] - x_b0[(i, j)]).abs() < 1e-9);
            }
        }

        let mut x_t = x_t0.clone();
        let mut x_b = x_b0.clone();
        front_lower_backward_solve(Diag::Unit, Conj::Yes, &l_t, &l_b, &mut x_t, &mut x_b);
        front_lower_multiply_transpose(Diag::Unit, Conj::Yes, &l_t, &l_b, &mut x_t, &mut x_b);
        for j in 0..w {
            for i in 0..s {
                assert!((x_t[(i, j)] - x_t0[(i, j)]).abs() < 1e-9);
            }
        }
        let _ = pivots;
    }
}
