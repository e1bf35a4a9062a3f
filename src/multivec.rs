//! 1-D row-distributed vectors and multi-vectors (the caller-facing
//! right-hand-side containers).

use crate::comm::{self, CommRef};
use crate::dense::Mat;
use crate::scalar::Scalar;
use num_traits::Float;

/// Dense multi-vector distributed by rows in the universal 1-D partition.
pub struct DistMultiVec<S> {
    height: usize,
    width: usize,
    comm: CommRef,
    blocksize: usize,
    first_local_row: usize,
    local: Mat<S>,
}

impl<S: Scalar> DistMultiVec<S> {
    pub fn zeros(height: usize, width: usize, comm: CommRef) -> Self {
        let (first, count) = comm::local_row_range(height, comm.size(), comm.rank());
        DistMultiVec {
            blocksize: comm::row_blocksize(height, comm.size()),
            height,
            width,
            first_local_row: first,
            local: Mat::zeros(count, width),
            comm,
        }
    }

    /// Builds a multi-vector whose global entry `(i, j)` is `f(i, j)`.
    pub fn from_fn(
        height: usize,
        width: usize,
        comm: CommRef,
        mut f: impl FnMut(usize, usize) -> S,
    ) -> Self {
        let mut x = DistMultiVec::zeros(height, width, comm);
        let first = x.first_local_row;
        for j in 0..width {
            for i in 0..x.local.nrows() {
                x.local[(i, j)] = f(first + i, j);
            }
        }
        x
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }
    #[inline]
    pub fn comm(&self) -> &CommRef {
        &self.comm
    }
    #[inline]
    pub fn blocksize(&self) -> usize {
        self.blocksize
    }
    #[inline]
    pub fn first_local_row(&self) -> usize {
        self.first_local_row
    }
    #[inline]
    pub fn local_height(&self) -> usize {
        self.local.nrows()
    }
    #[inline]
    pub fn local(&self) -> &Mat<S> {
        &self.local
    }
    #[inline]
    pub fn local_mut(&mut self) -> &mut Mat<S> {
        &mut self.local
    }

    /// Owner rank of global row `i`.
    #[inline]
    pub fn owner(&self, i: usize) -> usize {
        comm::row_to_process(i, self.blocksize, self.comm.size())
    }

    /// Collective Frobenius norm (2-norm for a single column).
    pub fn norm(&self) -> S::Real {
        let mut sq = <S::Real as Scalar>::zero();
        for v in self.local.data() {
            let a = v.abs();
            sq += a * a;
        }
        let parts = comm::all_gather_v(&*self.comm, &[sq]);
        let mut total = <S::Real as Scalar>::zero();
        for p in parts {
            total += p[0];
        }
        total.sqrt()
    }

    /// `self := self + alpha * other`, entrywise over the local rows.
    pub fn axpy(&mut self, alpha: S, other: &DistMultiVec<S>) {
        assert!(self.height == other.height && self.width == other.width);
        for j in 0..self.width {
            for i in 0..self.local.nrows() {
                let v = other.local[(i, j)];
                self.local[(i, j)] += alpha * v;
            }
        }
    }
}

/// Single distributed vector; a thin wrapper over a one-column multi-vector.
pub struct DistVec<S> {
    inner: DistMultiVec<S>,
}

impl<S: Scalar> DistVec<S> {
    pub fn zeros(height: usize, comm: CommRef) -> Self {
        DistVec {
            inner: DistMultiVec::zeros(height, 1, comm),
        }
    }

    pub fn from_fn(height: usize, comm: CommRef, mut f: impl FnMut(usize) -> S) -> Self {
        DistVec {
            inner: DistMultiVec::from_fn(height, 1, comm, |i, _| f(i)),
        }
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.inner.height()
    }
    #[inline]
    pub fn first_local_row(&self) -> usize {
        self.inner.first_local_row()
    }
    #[inline]
    pub fn local_height(&self) -> usize {
        self.inner.local_height()
    }
    #[inline]
    pub fn norm(&self) -> S::Real {
        self.inner.norm()
    }
    #[inline]
    pub fn as_multi(&self) -> &DistMultiVec<S> {
        &self.inner
    }
    #[inline]
    pub fn as_multi_mut(&mut self) -> &mut DistMultiVec<S> {
        &mut self.inner
    }
    #[inline]
    pub fn get_local(&self, i_local: usize) -> S {
        self.inner.local()[(i_local, 0)]
    }
    #[inline]
    pub fn set_local(&mut self, i_local: usize, v: S) {
        self.inner.local_mut()[(i_local, 0)] = v;
    }
}

/// `y := alpha * A * x + beta * y` for a distributed sparse `A`; used by the
/// drivers and tests to form residuals. Collective.
pub fn sparse_multiply<S: Scalar>(
    alpha: S,
    a: &crate::sparse::DistSparseMat<S>,
    x: &DistMultiVec<S>,
    beta: S,
    y: &mut DistMultiVec<S>,
) {
    assert!(a.height() == x.height() && a.height() == y.height());
    assert!(x.width() == y.width());
    let comm = a.comm().clone();
    let p = comm.size();
    let width = x.width();

    // Request the remote x rows this rank's entries touch.
    let mut needed: Vec<Vec<usize>> = vec![Vec::new(); p];
    for il in 0..a.local_height() {
        let (targets, _) = a.row_entries(il);
        for &t in targets {
            needed[x.owner(t)].push(t);
        }
    }
    for q in 0..p {
        needed[q].sort_unstable();
        needed[q].dedup();
    }
    let requests = comm::all_to_all_v(&*comm, needed.clone());
    let mut replies: Vec<Vec<S>> = Vec::with_capacity(p);
    for batch in &requests {
        let mut vals = Vec::with_capacity(batch.len() * width);
        for &i in batch {
            for j in 0..width {
                vals.push(x.local()[(i - x.first_local_row(), j)]);
            }
        }
        replies.push(vals);
    }
    let answers = comm::all_to_all_v(&*comm, replies);

    for j in 0..width {
        for i in 0..y.local_height() {
            let v = y.local()[(i, j)];
            y.local_mut()[(i, j)] = beta * v;
        }
    }
    for il in 0..a.local_height() {
        let (targets, values) = a.row_entries(il);
        for (&t, &v) in targets.iter().zip(values.iter()) {
            let q = x.owner(t);
            let pos = needed[q].binary_search(&t).unwrap();
            for j in 0..width {
                let xv = answers[q][pos * width + j];
                y.local_mut()[(il, j)] += alpha * v * xv;
            }
        }
    }
}
