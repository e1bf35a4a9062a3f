//! Dense storage and the unblocked kernels consumed by the frontal layer.
//!
//! [`Mat`] is a column-major owned matrix. The routines here are the only
//! dense linear algebra the solver relies on: in-place `LDL^{T|H}`, in-place
//! Bunch–Kaufman with symmetric pivoting, unit-triangular solves on either
//! side, the unit-triangular inverse, the symmetric inverse of an assembled
//! `L D L^{T|H}` product, and a handful of accumulating multiply primitives.
//! Everything is written against [`Scalar`], so one source covers the four
//! field types.

use crate::scalar::{Conj, Diag, Scalar};
use crate::LdlError;
use num_traits::Float;

/// Owned column-major matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct Mat<S> {
    nrows: usize,
    ncols: usize,
    data: Vec<S>,
}

impl<S: Scalar> Mat<S> {
    /// Creates a zero-filled matrix.
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Mat {
            nrows,
            ncols,
            data: vec![S::zero(); nrows * ncols],
        }
    }

    /// Creates a matrix whose `(i, j)` entry is `f(i, j)`.
    pub fn from_fn(nrows: usize, ncols: usize, mut f: impl FnMut(usize, usize) -> S) -> Self {
        let mut data = Vec::with_capacity(nrows * ncols);
        for j in 0..ncols {
            for i in 0..nrows {
                data.push(f(i, j));
            }
        }
        Mat { nrows, ncols, data }
    }

    /// Wraps an existing column-major buffer.
    pub fn from_data(nrows: usize, ncols: usize, data: Vec<S>) -> Self {
        assert!(data.len() == nrows * ncols, "buffer does not match dimensions");
        Mat { nrows, ncols, data }
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.nrows
    }
    #[inline]
    pub fn ncols(&self) -> usize {
        self.ncols
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Column `j` as a slice.
    #[inline]
    pub fn col(&self, j: usize) -> &[S] {
        &self.data[j * self.nrows..(j + 1) * self.nrows]
    }

    /// Column `j` as a mutable slice.
    #[inline]
    pub fn col_mut(&mut self, j: usize) -> &mut [S] {
        &mut self.data[j * self.nrows..(j + 1) * self.nrows]
    }

    /// The underlying column-major buffer.
    #[inline]
    pub fn data(&self) -> &[S] {
        &self.data
    }

    pub fn fill(&mut self, v: S) {
        self.data.fill(v);
    }

    #[inline]
    pub fn swap_elems(&mut self, a: (usize, usize), b: (usize, usize)) {
        let ia = a.0 + a.1 * self.nrows;
        let ib = b.0 + b.1 * self.nrows;
        self.data.swap(ia, ib);
    }
}

impl<S: Scalar> core::ops::Index<(usize, usize)> for Mat<S> {
    type Output = S;
    #[inline]
    fn index(&self, (i, j): (usize, usize)) -> &S {
        debug_assert!(i < self.nrows && j < self.ncols);
        &self.data[i + j * self.nrows]
    }
}

impl<S: Scalar> core::ops::IndexMut<(usize, usize)> for Mat<S> {
    #[inline]
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut S {
        debug_assert!(i < self.nrows && j < self.ncols);
        &mut self.data[i + j * self.nrows]
    }
}

// ---------------------------------------------------------------------------
// Multiply primitives
// ---------------------------------------------------------------------------

/// `acc += alpha * lhs * rhs`.
pub fn matmul_acc<S: Scalar>(acc: &mut Mat<S>, alpha: S, lhs: &Mat<S>, rhs: &Mat<S>) {
    assert!(lhs.ncols() == rhs.nrows(), "nonconformal multiply");
    assert!(acc.nrows() == lhs.nrows() && acc.ncols() == rhs.ncols(), "nonconformal multiply");
    let (m, k) = (lhs.nrows(), lhs.ncols());
    for j in 0..acc.ncols() {
        for p in 0..k {
            let w = alpha * rhs[(p, j)];
            if w.is_zero() {
                continue;
            }
            let lcol = lhs.col(p);
            let acol = acc.col_mut(j);
            for i in 0..m {
                acol[i] += lcol[i] * w;
            }
        }
    }
}

/// `acc += alpha * lhs^{T|H} * rhs`.
pub fn matmul_tn_acc<S: Scalar>(acc: &mut Mat<S>, alpha: S, lhs: &Mat<S>, rhs: &Mat<S>, conj: Conj) {
    assert!(lhs.nrows() == rhs.nrows(), "nonconformal multiply");
    assert!(acc.nrows() == lhs.ncols() && acc.ncols() == rhs.ncols(), "nonconformal multiply");
    let k = lhs.nrows();
    for j in 0..acc.ncols() {
        let rcol = rhs.col(j);
        for i in 0..acc.nrows() {
            let lcol = lhs.col(i);
            let mut sum = S::zero();
            for p in 0..k {
                sum += conj.apply(lcol[p]) * rcol[p];
            }
            acc[(i, j)] += alpha * sum;
        }
    }
}

/// `acc += alpha * lhs * rhs^{T|H}`.
pub fn matmul_nt_acc<S: Scalar>(acc: &mut Mat<S>, alpha: S, lhs: &Mat<S>, rhs: &Mat<S>, conj: Conj) {
    assert!(lhs.ncols() == rhs.ncols(), "nonconformal multiply");
    assert!(acc.nrows() == lhs.nrows() && acc.ncols() == rhs.nrows(), "nonconformal multiply");
    let (m, k) = (lhs.nrows(), lhs.ncols());
    for j in 0..acc.ncols() {
        for p in 0..k {
            let w = alpha * conj.apply(rhs[(j, p)]);
            if w.is_zero() {
                continue;
            }
            let lcol = lhs.col(p);
            let acol = acc.col_mut(j);
            for i in 0..m {
                acol[i] += lcol[i] * w;
            }
        }
    }
}

/// `acc -= lhs * rhs^{T|H}`, touching only the lower triangle of `acc`.
pub fn rank_update_lower<S: Scalar>(acc: &mut Mat<S>, lhs: &Mat<S>, rhs: &Mat<S>, conj: Conj) {
    assert!(lhs.ncols() == rhs.ncols(), "nonconformal update");
    assert!(acc.nrows() == lhs.nrows() && acc.ncols() == rhs.nrows(), "nonconformal update");
    let (m, k) = (lhs.nrows(), lhs.ncols());
    for j in 0..acc.ncols() {
        for p in 0..k {
            let w = conj.apply(rhs[(j, p)]);
            if w.is_zero() {
                continue;
            }
            let lcol = lhs.col(p);
            let acol = acc.col_mut(j);
            for i in j..m {
                acol[i] -= lcol[i] * w;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Triangular solves
// ---------------------------------------------------------------------------

/// `x := l^{-1} x` for lower triangular `l`.
pub fn solve_lower_in_place<S: Scalar>(l: &Mat<S>, diag: Diag, x: &mut Mat<S>) {
    let n = l.ncols();
    assert!(l.nrows() >= n, "triangular operand is too short");
    assert!(x.nrows() == n, "nonconformal solve");
    for j in 0..x.ncols() {
        for i in 0..n {
            let mut v = x[(i, j)];
            for k in 0..i {
                v -= l[(i, k)] * x[(k, j)];
            }
            if diag == Diag::NonUnit {
                v /= l[(i, i)];
            }
            x[(i, j)] = v;
        }
    }
}

/// `x := l^{-T|H} x` for lower triangular `l`.
pub fn solve_lower_transpose_in_place<S: Scalar>(l: &Mat<S>, diag: Diag, x: &mut Mat<S>, conj: Conj) {
    let n = l.ncols();
    assert!(x.nrows() == n, "nonconformal solve");
    for j in 0..x.ncols() {
        for i in (0..n).rev() {
            let mut v = x[(i, j)];
            for k in i + 1..n {
                v -= conj.apply(l[(k, i)]) * x[(k, j)];
            }
            if diag == Diag::NonUnit {
                v /= conj.apply(l[(i, i)]);
            }
            x[(i, j)] = v;
        }
    }
}

/// `x := x * l^{-T|H}` for unit lower triangular `l`; this is the panel solve
/// `Y L^{T|H} = X`.
pub fn solve_unit_lower_right_transpose_in_place<S: Scalar>(l: &Mat<S>, x: &mut Mat<S>, conj: Conj) {
    let n = l.ncols();
    assert!(x.ncols() == n, "nonconformal solve");
    let m = x.nrows();
    for k in 0..n {
        for j in 0..k {
            let w = conj.apply(l[(k, j)]);
            if w.is_zero() {
                continue;
            }
            let (a, b) = x.data.split_at_mut(k * m);
            let xj = &a[j * m..(j + 1) * m];
            let xk = &mut b[..m];
            for i in 0..m {
                xk[i] -= xj[i] * w;
            }
        }
    }
}

/// Inverse of a unit lower triangular matrix, returned as a full matrix with
/// an explicit unit diagonal.
pub fn unit_lower_inverse<S: Scalar>(l: &Mat<S>) -> Mat<S> {
    let n = l.ncols();
    let mut x = Mat::zeros(n, n);
    for j in 0..n {
        x[(j, j)] = S::one();
        for i in j + 1..n {
            let mut v = l[(i, j)];
            for k in j + 1..i {
                v += l[(i, k)] * x[(k, j)];
            }
            x[(i, j)] = -v;
        }
    }
    x
}

// ---------------------------------------------------------------------------
// Block diagonal operations
// ---------------------------------------------------------------------------

/// `x := D^{-1} x`, where `D` is the 1×1 / 2×2 block diagonal described by
/// `diag` and `sub_diag` (a nonzero `sub_diag[k]` couples rows `k` and `k+1`).
pub fn block_diag_solve_in_place<S: Scalar>(diag: &[S], sub_diag: &[S], conj: Conj, x: &mut Mat<S>) {
    let n = diag.len();
    assert!(x.nrows() == n, "nonconformal diagonal solve");
    let mut k = 0;
    while k < n {
        if k + 1 < n && !sub_diag[k].is_zero() {
            let (d1, d2, e) = (diag[k], diag[k + 1], sub_diag[k]);
            let det = d1 * d2 - conj.apply(e) * e;
            for j in 0..x.ncols() {
                let (r1, r2) = (x[(k, j)], x[(k + 1, j)]);
                x[(k, j)] = (d2 * r1 - conj.apply(e) * r2) / det;
                x[(k + 1, j)] = (d1 * r2 - e * r1) / det;
            }
            k += 2;
        } else {
            let d = diag[k];
            for j in 0..x.ncols() {
                x[(k, j)] /= d;
            }
            k += 1;
        }
    }
}

/// `x := x D^{-1}` with the same block diagonal convention, acting on columns.
pub fn block_diag_solve_right_in_place<S: Scalar>(
    diag: &[S],
    sub_diag: &[S],
    conj: Conj,
    x: &mut Mat<S>,
) {
    let n = diag.len();
    assert!(x.ncols() == n, "nonconformal diagonal solve");
    let m = x.nrows();
    let mut k = 0;
    while k < n {
        if k + 1 < n && !sub_diag[k].is_zero() {
            let (d1, d2, e) = (diag[k], diag[k + 1], sub_diag[k]);
            let det = d1 * d2 - conj.apply(e) * e;
            for i in 0..m {
                let (c1, c2) = (x[(i, k)], x[(i, k + 1)]);
                x[(i, k)] = (c1 * d2 - c2 * e) / det;
                x[(i, k + 1)] = (c2 * d1 - c1 * conj.apply(e)) / det;
            }
            k += 2;
        } else {
            let d = diag[k];
            for i in 0..m {
                x[(i, k)] /= d;
            }
            k += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Factorizations
// ---------------------------------------------------------------------------

/// Unblocked in-place `LDL^{T|H}` of the lower triangle of `a`.
///
/// On return the strict lower triangle holds the unit lower factor and the
/// diagonal holds `D`. The strict upper triangle is not referenced.
pub fn ldl_in_place<S: Scalar>(a: &mut Mat<S>, conj: Conj) -> Result<(), LdlError> {
    assert!(a.nrows() == a.ncols(), "pivot blocks must be square");
    let n = a.nrows();
    for k in 0..n {
        let d = a[(k, k)];
        if d.abs() == <S::Real as Scalar>::zero() {
            return Err(LdlError::ZeroPivot { column: k });
        }
        for j in k + 1..n {
            let c = conj.apply(a[(j, k)]) / d;
            if c.is_zero() {
                continue;
            }
            for i in j..n {
                let w = a[(i, k)];
                a[(i, j)] -= w * c;
            }
        }
        for i in k + 1..n {
            a[(i, k)] /= d;
        }
    }
    Ok(())
}

/// Pivoting data produced by [`bunch_kaufman_in_place`].
pub struct BkPivots<S> {
    /// Row permutation: `(P x)[i] = x[perm[i]]`.
    pub perm: Vec<usize>,
    /// Subdiagonal of the block diagonal; `sub_diag[k] != 0` marks a 2×2
    /// pivot coupling columns `k` and `k + 1`.
    pub sub_diag: Vec<S>,
}

fn symmetric_swap<S: Scalar>(a: &mut Mat<S>, i: usize, j: usize, conj: Conj) {
    debug_assert!(i < j);
    let n = a.nrows();
    for c in 0..i {
        a.swap_elems((i, c), (j, c));
    }
    a.swap_elems((i, i), (j, j));
    for t in i + 1..j {
        let tmp = a[(t, i)];
        a[(t, i)] = conj.apply(a[(j, t)]);
        a[(j, t)] = conj.apply(tmp);
    }
    a[(j, i)] = conj.apply(a[(j, i)]);
    for t in j + 1..n {
        a.swap_elems((t, i), (t, j));
    }
}

/// Unblocked in-place Bunch–Kaufman factorization `P A P^{T} = L D L^{T|H}`
/// of the lower triangle of `a`, with 1×1 and 2×2 pivots.
///
/// On return the strict lower triangle holds the unit lower factor (with the
/// subdiagonal entry of each 2×2 pivot cleared), the diagonal holds the block
/// diagonal's diagonal, and the returned pivots carry the permutation and the
/// block subdiagonal.
pub fn bunch_kaufman_in_place<S: Scalar>(a: &mut Mat<S>, conj: Conj) -> Result<BkPivots<S>, LdlError> {
    assert!(a.nrows() == a.ncols(), "pivot blocks must be square");
    let n = a.nrows();
    let zero_r = <S::Real as Scalar>::zero();
    // Standard growth-bounding constant.
    let alpha = S::Real::from_f64((1.0 + 17.0f64.sqrt()) / 8.0);

    let mut perm: Vec<usize> = (0..n).collect();
    let mut sub_diag = vec![S::zero(); n];
    let mut w1 = vec![S::zero(); n];
    let mut w2 = vec![S::zero(); n];

    let mut k = 0;
    while k < n {
        let abs_akk = a[(k, k)].abs();
        let mut lambda = zero_r;
        let mut r = k;
        for i in k + 1..n {
            let v = a[(i, k)].abs();
            if v > lambda {
                lambda = v;
                r = i;
            }
        }
        if abs_akk == zero_r && lambda == zero_r {
            return Err(LdlError::ZeroPivot { column: k });
        }

        let mut two_by_two = false;
        if abs_akk < alpha * lambda {
            let mut sigma = zero_r;
            for j in k..r {
                sigma = sigma.max(a[(r, j)].abs());
            }
            for i in r + 1..n {
                sigma = sigma.max(a[(i, r)].abs());
            }
            if abs_akk * sigma >= alpha * lambda * lambda {
                // Keep the 1×1 pivot in place.
            } else if a[(r, r)].abs() >= alpha * sigma {
                symmetric_swap(a, k, r, conj);
                perm.swap(k, r);
            } else {
                if k + 1 != r {
                    symmetric_swap(a, k + 1, r, conj);
                    perm.swap(k + 1, r);
                }
                two_by_two = true;
            }
        }

        if !two_by_two {
            let d = a[(k, k)];
            if d.abs() == zero_r {
                return Err(LdlError::ZeroPivot { column: k });
            }
            for j in k + 1..n {
                let c = conj.apply(a[(j, k)]) / d;
                if c.is_zero() {
                    continue;
                }
                for i in j..n {
                    let w = a[(i, k)];
                    a[(i, j)] -= w * c;
                }
            }
            for i in k + 1..n {
                a[(i, k)] /= d;
            }
            k += 1;
        } else {
            let d1 = a[(k, k)];
            let d2 = a[(k + 1, k + 1)];
            let e = a[(k + 1, k)];
            let det = d1 * d2 - e * conj.apply(e);
            if det.abs() == zero_r {
                return Err(LdlError::ZeroPivot { column: k });
            }
            for i in k + 2..n {
                w1[i] = a[(i, k)];
                w2[i] = a[(i, k + 1)];
            }
            for i in k + 2..n {
                a[(i, k)] = (w1[i] * d2 - w2[i] * e) / det;
                a[(i, k + 1)] = (w2[i] * d1 - w1[i] * conj.apply(e)) / det;
            }
            for j in k + 2..n {
                let c1 = conj.apply(w1[j]);
                let c2 = conj.apply(w2[j]);
                for i in j..n {
                    let upd = a[(i, k)] * c1 + a[(i, k + 1)] * c2;
                    a[(i, j)] -= upd;
                }
            }
            sub_diag[k] = e;
            a[(k + 1, k)] = S::zero();
            k += 2;
        }
    }
    Ok(BkPivots { perm, sub_diag })
}

/// Forms `(L D L^{T|H})^{-1}` as a full symmetric matrix, given the unit
/// lower factor in the strict lower triangle of `l`, the block diagonal in
/// `diag` / `sub_diag`.
pub fn ldl_product_inverse<S: Scalar>(
    l: &Mat<S>,
    diag: &[S],
    sub_diag: &[S],
    conj: Conj,
) -> Mat<S> {
    let n = l.ncols();
    let t = unit_lower_inverse(l);
    let mut u = t.clone();
    block_diag_solve_in_place(diag, sub_diag, conj, &mut u);
    let mut m = Mat::zeros(n, n);
    matmul_tn_acc(&mut m, S::one(), &t, &u, conj);
    m
}

// ---------------------------------------------------------------------------
// Row pivots
// ---------------------------------------------------------------------------

/// `x := P x`, i.e. row `i` of the result is row `perm[i]` of the input.
pub fn apply_row_perm<S: Scalar>(x: &mut Mat<S>, perm: &[usize]) {
    assert!(x.nrows() == perm.len(), "nonconformal pivot application");
    let m = x.nrows();
    let mut tmp = vec![S::zero(); m];
    for j in 0..x.ncols() {
        let col = x.col_mut(j);
        tmp.copy_from_slice(col);
        for i in 0..m {
            col[i] = tmp[perm[i]];
        }
    }
}

/// `x := P^{-1} x`, undoing [`apply_row_perm`].
pub fn apply_row_perm_inv<S: Scalar>(x: &mut Mat<S>, perm: &[usize]) {
    assert!(x.nrows() == perm.len(), "nonconformal pivot application");
    let m = x.nrows();
    let mut tmp = vec![S::zero(); m];
    for j in 0..x.ncols() {
        let col = x.col_mut(j);
        tmp.copy_from_slice(col);
        for i in 0..m {
            col[perm[i]] = tmp[i];
        }
    }
}

/// Frobenius norm.
pub fn norm_f<S: Scalar>(a: &Mat<S>) -> S::Real {
    let mut acc = <S::Real as Scalar>::zero();
    for v in a.data().iter() {
        let m = v.abs();
        acc += m * m;
    }
    acc.sqrt()
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

    fn random_hpd(rng: &mut StdRng, n: usize) -> Mat<c64> {
        let z = random_mat(rng, n, n);
        let mut a = Mat::zeros(n, n);
        matmul_tn_acc(&mut a, c64::one(), &z, &z, Conj::Yes);
        for i in 0..n {
            a[(i, i)] += c64::new(0.5, 0.0);
        }
        a
    }

    fn reconstruct_ldl(a: &Mat<c64>, sub_diag: &[c64], conj: Conj) -> Mat<c64> {
        // Rebuilds L * D * L^{T|H} from the packed factor.
        let n = a.nrows();
        let mut l = Mat::zeros(n, n);
        let mut d = Mat::zeros(n, n);
        for j in 0..n {
            l[(j, j)] = c64::one();
            d[(j, j)] = a[(j, j)];
            if !sub_diag[j].is_zero() {
                d[(j + 1, j)] = sub_diag[j];
                d[(j, j + 1)] = conj.apply(sub_diag[j]);
            }
            for i in j + 1..n {
                l[(i, j)] = a[(i, j)];
            }
        }
        let mut ld = Mat::zeros(n, n);
        matmul_acc(&mut ld, c64::one(), &l, &d);
        let mut out = Mat::zeros(n, n);
        matmul_nt_acc(&mut out, c64::one(), &ld, &l, conj);
        out
    }

    #[test]
    fn ldl_roundtrip_hermitian() {
        let mut rng = StdRng::seed_from_u64(0);
        for n in [1usize, 2, 3, 5, 16, 33] {
            let a0 = random_hpd(&mut rng, n);
            let mut a = a0.clone();
            ldl_in_place(&mut a, Conj::Yes).unwrap();
            let rec = reconstruct_ldl(&a, &vec![c64::zero(); n], Conj::Yes);
            for j in 0..n {
                for i in j..n {
                    assert!((rec[(i, j)] - a0[(i, j)]).abs() < 1e-10);
                }
            }
        }
    }

    #[test]
    fn bunch_kaufman_roundtrip_indefinite() {
        let mut rng = StdRng::seed_from_u64(1);
        for n in [2usize, 3, 5, 12, 31] {
            // Hermitian and strongly indefinite.
            let z = random_mat(&mut rng, n, n);
            let mut a0 = Mat::zeros(n, n);
            matmul_tn_acc(&mut a0, c64::one(), &z, &z, Conj::Yes);
            for i in 0..n {
                a0[(i, i)] -= c64::new(1.5, 0.0);
            }
            let mut a = a0.clone();
            let piv = bunch_kaufman_in_place(&mut a, Conj::Yes).unwrap();
            let rec = reconstruct_ldl(&a, &piv.sub_diag, Conj::Yes);
            // rec must equal P A0 P^T.
            for j in 0..n {
                for i in j..n {
                    let expect = a0[(piv.perm[i], piv.perm[j])];
                    let expect = if piv.perm[i] < piv.perm[j] {
                        Conj::Yes.apply(a0[(piv.perm[j], piv.perm[i])])
                    } else {
                        expect
                    };
                    assert!(
                        (rec[(i, j)] - expect).abs() < 1e-9,
                        "mismatch at ({i}, {j}) for n = {n}"
                    );
                }
            }
        }
    }

    #[test]
    fn triangular_solves_invert_each_other() {
        let mut rng = StdRng::seed_from_u64(2);
        let n = 24;
        let mut l = random_mat(&mut rng, n, n);
        for j in 0..n {
            l[(j, j)] = c64::one();
        }
        let x0 = random_mat(&mut rng, n, 3);

        let mut x = x0.clone();
        solve_lower_in_place(&l, Diag::Unit, &mut x);
        // Multiply back: y = L x.
        let mut y = Mat::zeros(n, 3);
        for j in 0..3 {
            for i in 0..n {
                let mut v = x[(i, j)];
                for k in 0..i {
                    v += l[(i, k)] * x[(k, j)];
                }
                y[(i, j)] = v;
            }
        }
        for j in 0..3 {
            for i in 0..n {
                assert!((y[(i, j)] - x0[(i, j)]).abs() < 1e-10);
            }
        }

        let mut x = x0.clone();
        solve_lower_transpose_in_place(&l, Diag::Unit, &mut x, Conj::Yes);
        let mut y = x0.clone();
        let inv = unit_lower_inverse(&l);
        let mut z = Mat::zeros(n, 3);
        matmul_tn_acc(&mut z, c64::one(), &inv, &y, Conj::Yes);
        for j in 0..3 {
            for i in 0..n {
                assert!((z[(i, j)] - x[(i, j)]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn right_transpose_solve_matches_definition() {
        let mut rng = StdRng::seed_from_u64(3);
        let n = 9;
        let mut l = random_mat(&mut rng, n, n);
        for j in 0..n {
            l[(j, j)] = c64::one();
        }
        let x0 = random_mat(&mut rng, 4, n);
        let mut y = x0.clone();
        solve_unit_lower_right_transpose_in_place(&l, &mut y, Conj::Yes);
        // y * L^H must reproduce x0.
        let mut back = Mat::zeros(4, n);
        let mut lh = Mat::zeros(n, n);
        for j in 0..n {
            for i in 0..n {
                let v = if i == j {
                    c64::one()
                } else if i > j {
                    l[(i, j)]
                } else {
                    c64::zero()
                };
                lh[(j, i)] = Conj::Yes.apply(v);
            }
        }
        matmul_acc(&mut back, c64::one(), &y, &lh);
        for j in 0..n {
            for i in 0..4 {
                assert!((back[(i, j)] - x0[(i, j)]).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn ldl_product_inverse_is_an_inverse() {
        let mut rng = StdRng::seed_from_u64(4);
        let n = 13;
        let a0 = random_hpd(&mut rng, n);
        let mut a = a0.clone();
        ldl_in_place(&mut a, Conj::Yes).unwrap();
        let diag: Vec<c64> = (0..n).map(|i| a[(i, i)]).collect();
        let inv = ldl_product_inverse(&a, &diag, &vec![c64::zero(); n], Conj::Yes);
        let mut prod = Mat::zeros(n, n);
        matmul_acc(&mut prod, c64::one(), &inv, &a0);
        for j in 0..n {
            for i in 0..n {
                let expect = if i == j { c64::one() } else { c64::zero() };
                assert!((prod[(i, j)] - expect).abs() < 1e-8, "entry ({i}, {j})");
            }
        }
    }

    #[test]
    fn row_perm_roundtrip() {
        let mut rng = StdRng::seed_from_u64(5);
        let x0 = random_mat(&mut rng, 7, 2);
        let perm = vec![3usize, 0, 6, 1, 5, 2, 4];
        let mut x = x0.clone();
        apply_row_perm(&mut x, &perm);
        apply_row_perm_inv(&mut x, &perm);
        assert_eq!(x, x0);
    }
}
