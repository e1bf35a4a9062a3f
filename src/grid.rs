//! Process grids and cyclic dense layouts for distributed fronts.
//!
//! A [`Grid`] arranges the ranks of a team as a near-square 2-D grid with
//! column-major rank-to-coordinate mapping. [`DistMat`] is an element-cyclic
//! 2-D distribution over a grid: global entry `(i, j)` of a matrix with
//! alignments `(ra, ca)` lives on grid coordinate
//! `((ra + i) mod height, (ca + j) mod width)`. [`VcMat`] is the matching
//! 1-D row-cyclic layout over the whole team, used by the solve phase.

use crate::comm::CommRef;
use crate::dense::Mat;
use crate::scalar::Scalar;

/// First global index owned by `coord` under a cyclic distribution with the
/// given alignment and stride.
#[inline]
pub fn shift(coord: usize, align: usize, stride: usize) -> usize {
    (coord + stride - align % stride) % stride
}

/// Number of locally owned indices among `n`, starting at `shift` with the
/// given stride.
#[inline]
pub fn local_length(n: usize, shift: usize, stride: usize) -> usize {
    if n > shift {
        (n - shift).div_ceil(stride)
    } else {
        0
    }
}

/// A team of ranks arranged as a 2-D grid.
///
/// The grid height is the largest divisor of the team size that does not
/// exceed its square root, and ranks map to coordinates column-major:
/// rank `r` sits at row `r mod height`, column `r / height`.
#[derive(Clone)]
pub struct Grid {
    comm: CommRef,
    height: usize,
    width: usize,
}

impl Grid {
    pub fn new(comm: CommRef) -> Self {
        let size = comm.size();
        let (height, width) = Grid::dims_for(size);
        Grid { comm, height, width }
    }

    /// Grid dimensions chosen for a team of `size` ranks.
    pub fn dims_for(size: usize) -> (usize, usize) {
        let mut height = (size as f64).sqrt().floor() as usize;
        height = height.max(1);
        while size % height != 0 {
            height -= 1;
        }
        (height, size / height)
    }

    #[inline]
    pub fn comm(&self) -> &CommRef {
        &self.comm
    }
    #[inline]
    pub fn size(&self) -> usize {
        self.comm.size()
    }
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }
    /// This rank's grid row.
    #[inline]
    pub fn row(&self) -> usize {
        self.comm.rank() % self.height
    }
    /// This rank's grid column.
    #[inline]
    pub fn col(&self) -> usize {
        self.comm.rank() / self.height
    }
    /// Team rank of the grid coordinate `(row, col)`.
    #[inline]
    pub fn rank_of(&self, row: usize, col: usize) -> usize {
        row + col * self.height
    }
}

/// Element-cyclic 2-D distributed matrix over a [`Grid`].
pub struct DistMat<S> {
    grid: Grid,
    nrows: usize,
    ncols: usize,
    row_align: usize,
    col_align: usize,
    row_shift: usize,
    col_shift: usize,
    local: Mat<S>,
}

impl<S: Scalar> DistMat<S> {
    pub fn zeros(grid: Grid, nrows: usize, ncols: usize, row_align: usize, col_align: usize) -> Self {
        let row_shift = shift(grid.row(), row_align, grid.height());
        let col_shift = shift(grid.col(), col_align, grid.width());
        let local = Mat::zeros(
            local_length(nrows, row_shift, grid.height()),
            local_length(ncols, col_shift, grid.width()),
        );
        DistMat {
            grid,
            nrows,
            ncols,
            row_align,
            col_align,
            row_shift,
            col_shift,
            local,
        }
    }

    /// An empty placeholder (used to release storage after redistribution).
    pub fn empty(grid: Grid) -> Self {
        DistMat::zeros(grid, 0, 0, 0, 0)
    }

    /// Wraps a fully local matrix as the distribution over a 1 × 1 grid.
    pub fn from_local_full(grid: Grid, local: Mat<S>) -> Self {
        assert!(grid.size() == 1, "from_local_full requires a team of one");
        DistMat {
            nrows: local.nrows(),
            ncols: local.ncols(),
            row_align: 0,
            col_align: 0,
            row_shift: 0,
            col_shift: 0,
            grid,
            local,
        }
    }

    #[inline]
    pub fn grid(&self) -> &Grid {
        &self.grid
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
    pub fn row_align(&self) -> usize {
        self.row_align
    }
    #[inline]
    pub fn col_align(&self) -> usize {
        self.col_align
    }
    #[inline]
    pub fn row_shift(&self) -> usize {
        self.row_shift
    }
    #[inline]
    pub fn col_shift(&self) -> usize {
        self.col_shift
    }
    #[inline]
    pub fn local(&self) -> &Mat<S> {
        &self.local
    }
    #[inline]
    pub fn local_mut(&mut self) -> &mut Mat<S> {
        &mut self.local
    }

    /// Grid row owning global row `i`.
    #[inline]
    pub fn owner_row(&self, i: usize) -> usize {
        (self.row_align + i) % self.grid.height()
    }
    /// Grid column owning global column `j`.
    #[inline]
    pub fn owner_col(&self, j: usize) -> usize {
        (self.col_align + j) % self.grid.width()
    }

    /// Whether this rank owns global entry `(i, j)`.
    #[inline]
    pub fn is_local(&self, i: usize, j: usize) -> bool {
        self.owner_row(i) == self.grid.row() && self.owner_col(j) == self.grid.col()
    }

    /// Local indices of a locally owned global entry.
    #[inline]
    pub fn local_of(&self, i: usize, j: usize) -> (usize, usize) {
        debug_assert!(self.is_local(i, j));
        (
            (i - self.row_shift) / self.grid.height(),
            (j - self.col_shift) / self.grid.width(),
        )
    }

    /// Global row of local row `li`.
    #[inline]
    pub fn global_row(&self, li: usize) -> usize {
        self.row_shift + li * self.grid.height()
    }
    /// Global column of local column `lj`.
    #[inline]
    pub fn global_col(&self, lj: usize) -> usize {
        self.col_shift + lj * self.grid.width()
    }
}

/// Row-cyclic 1-D distributed matrix over a team: global row `i` lives on
/// rank `i mod size`, columns are not distributed.
pub struct VcMat<S> {
    comm: CommRef,
    nrows: usize,
    ncols: usize,
    local: Mat<S>,
}

impl<S: Scalar> VcMat<S> {
    pub fn zeros(comm: CommRef, nrows: usize, ncols: usize) -> Self {
        let size = comm.size();
        let rank = comm.rank();
        let local = Mat::zeros(local_length(nrows, rank, size), ncols);
        VcMat {
            comm,
            nrows,
            ncols,
            local,
        }
    }

    /// Wraps a fully local matrix as the single-rank distribution.
    pub fn from_local(comm: CommRef, local: Mat<S>) -> Self {
        assert!(comm.size() == 1, "from_local requires a team of one");
        VcMat {
            comm,
            nrows: local.nrows(),
            ncols: local.ncols(),
            local,
        }
    }

    #[inline]
    pub fn comm(&self) -> &CommRef {
        &self.comm
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
    pub fn local(&self) -> &Mat<S> {
        &self.local
    }
    #[inline]
    pub fn local_mut(&mut self) -> &mut Mat<S> {
        &mut self.local
    }

    #[inline]
    pub fn owner(&self, i: usize) -> usize {
        i % self.comm.size()
    }
    #[inline]
    pub fn is_local(&self, i: usize) -> bool {
        self.owner(i) == self.comm.rank()
    }
    #[inline]
    pub fn local_of(&self, i: usize) -> usize {
        debug_assert!(self.is_local(i));
        (i - self.comm.rank()) / self.comm.size()
    }
    #[inline]
    pub fn global_row(&self, li: usize) -> usize {
        self.comm.rank() + li * self.comm.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm;

    #[test]
    fn grid_dims_divide_evenly() {
        assert_eq!(Grid::dims_for(1), (1, 1));
        assert_eq!(Grid::dims_for(2), (1, 2));
        assert_eq!(Grid::dims_for(4), (2, 2));
        assert_eq!(Grid::dims_for(8), (2, 4));
        assert_eq!(Grid::dims_for(16), (4, 4));
    }

    #[test]
    fn cyclic_ownership_partitions_entries() {
        comm::run_spmd(4, |c| {
            let grid = Grid::new(c);
            let m = DistMat::<f64>::zeros(grid, 7, 5, 3, 1);
            let mut count = 0;
            for i in 0..7 {
                for j in 0..5 {
                    if m.is_local(i, j) {
                        let (li, lj) = m.local_of(i, j);
                        assert_eq!(m.global_row(li), i);
                        assert_eq!(m.global_col(lj), j);
                        count += 1;
                    }
                }
            }
            assert_eq!(count, m.local().nrows() * m.local().ncols());
        });
    }

    #[test]
    fn vc_rows_cycle_over_ranks() {
        comm::run_spmd(3, |c| {
            let rank = c.rank();
            let v = VcMat::<f64>::zeros(c, 10, 2);
            for li in 0..v.local().nrows() {
                assert_eq!(v.global_row(li) % 3, rank);
            }
        });
    }
}
