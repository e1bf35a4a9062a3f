//! Distributed-memory multifrontal `LDL^T` / `LDL^H` factorization and solve
//! for sparse symmetric and Hermitian matrices.
//!
//! The pipeline behind the solve entry points is:
//!
//! 1. [`nested_dissection`](nested_dissection::nested_dissection) computes a
//!    fill-reducing ordering by recursive vertex bisection, together with the
//!    separator tree and the elimination tree of supernodes;
//! 2. [`symbolic::analysis`] derives every front structure and relative index
//!    map, plus the exchange patterns reused across factorizations and
//!    solves;
//! 3. [`front::build_front_tree`] packs the matrix into per-supernode dense
//!    fronts (local near the leaves, cyclic on 2-D process grids whose team
//!    size doubles level by level toward the root);
//! 4. [`factor::ldl`] runs the multifrontal factorization with a parallel
//!    extend-add of child Schur complements;
//! 5. [`solve::ldl_solve`] drives the forward / diagonal / backward sweeps
//!    over the factored tree, with the right-hand side shuffled between the
//!    caller's row partition and the nodal layout by [`rhs`].
//!
//! Everything is SPMD over a [`comm::Comm`] process group; `P = 1` degrades
//! to a purely sequential solver and the distributed path requires a
//! power-of-two group size.
//!
//! ```no_run
//! use multifrontal::{comm, DistMultiVec, DistSparseMat, Options};
//!
//! let comm = comm::single();
//! let n = 100;
//! let mut a = DistSparseMat::<f64>::new(n, comm.clone());
//! a.start_assembly();
//! for i in 0..n {
//!     a.update(i, i, 2.0);
//!     if i + 1 < n {
//!         a.update(i, i + 1, -1.0);
//!         a.update(i + 1, i, -1.0);
//!     }
//! }
//! a.stop_assembly();
//! let mut x = DistMultiVec::from_fn(n, 1, comm, |i, _| i as f64);
//! multifrontal::symmetric_solve(&a, &mut x, &Options::default()).unwrap();
//! ```

pub mod bisect;
pub mod comm;
pub mod dense;
pub mod factor;
pub mod front;
pub mod graph;
pub mod grid;
pub mod map;
pub mod multivec;
pub mod nested_dissection;
pub mod rhs;
pub mod scalar;
pub mod solve;
pub mod sparse;
pub mod symbolic;

use std::sync::atomic::{AtomicBool, Ordering};

use bisect::{BfsBisector, Bisector, GridBisector};
use nested_dissection::NdControl;
use rhs::DistNodalMultiVec;

pub use comm::{run_spmd, Comm, CommRef};
pub use dense::Mat;
pub use front::LdlMode;
pub use graph::{DistGraph, Graph};
pub use map::DistMap;
pub use multivec::{sparse_multiply, DistMultiVec, DistVec};
pub use scalar::{c32, c64, Conj, Diag, Scalar};
pub use sparse::DistSparseMat;

/// Errors surfaced by the numeric factorization. Structural misuse
/// (assembly-state violations, nonconformal dimensions, invalid process
/// counts) panics instead, as those are caller bugs rather than data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LdlError {
    /// A front's pivot block was exactly singular at the given column (local
    /// to the front). The factorization offers no fallback.
    #[error("encountered an exactly zero pivot at column {column} of a frontal pivot block")]
    ZeroPivot { column: usize },
}

/// Per-call context: the debug-check switch threaded through the phase
/// drivers. Defaults to checking in debug builds only.
#[derive(Copy, Clone, Debug)]
pub struct Ctx {
    /// Run the (collective) consistency checks: bisection validation,
    /// partner agreement during symbolic analysis, exchange-count audits.
    pub check: bool,
}

impl Default for Ctx {
    fn default() -> Self {
        Ctx {
            check: cfg!(debug_assertions),
        }
    }
}

/// Partitioning mode used by nested dissection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Partition {
    /// Bisector-backed mode (breadth-first separators by default).
    General,
    /// Closed-form middle-plane cuts for an `nx × ny × nz` stencil mesh in
    /// natural ordering.
    Grid { dims: [usize; 3] },
}

/// Solver configuration.
#[derive(Clone, Debug)]
pub struct Options {
    /// Gather each distributed subgraph and run the sequential partitioner
    /// redundantly (the default and currently only strategy; kept as a knob
    /// for external distributed partitioners).
    pub sequential: bool,
    /// Partitioner attempts per distributed bisection.
    pub num_dist_seps: usize,
    /// Partitioner attempts per sequential bisection.
    pub num_seq_seps: usize,
    /// Maximum leaf supernode size.
    pub cutoff: usize,
    /// Dense factorization variant applied inside every front.
    pub block_ldl: LdlMode,
    /// Partitioning mode.
    pub partition: Partition,
    /// Debug-check switch.
    pub check: Option<bool>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            sequential: true,
            num_dist_seps: 1,
            num_seq_seps: 1,
            cutoff: 128,
            block_ldl: LdlMode::Normal,
            partition: Partition::General,
            check: None,
        }
    }
}

impl Options {
    fn ctx(&self) -> Ctx {
        match self.check {
            Some(check) => Ctx { check },
            None => Ctx::default(),
        }
    }
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Joins the process group and sets up global state. Idempotent; the
/// in-process communication backend needs no per-process setup, so this is a
/// bootstrap hook for alternative backends.
pub fn initialize() {
    if !INITIALIZED.swap(true, Ordering::SeqCst) {
        log::debug!("multifrontal initialized");
    }
}

/// Releases global state. Idempotent.
pub fn finalize() {
    if INITIALIZED.swap(false, Ordering::SeqCst) {
        log::debug!("multifrontal finalized");
    }
}

/// A factored matrix: symbolic structure, permutations and factored fronts.
/// Solving against fresh right-hand sides reuses everything.
pub struct Factorization<S> {
    info: symbolic::SymbolicInfo,
    sep_tree: nested_dissection::SeparatorTree,
    perm: DistMap,
    inv_perm: DistMap,
    tree: front::FrontTree<S>,
    ctx: Ctx,
}

impl<S: Scalar> Factorization<S> {
    /// The separator tree computed by nested dissection.
    pub fn separator_tree(&self) -> &nested_dissection::SeparatorTree {
        &self.sep_tree
    }
    /// The composite fill-reducing permutation (original to reordered).
    pub fn permutation(&self) -> &DistMap {
        &self.perm
    }
    /// The symbolic structure.
    pub fn symbolic(&self) -> &symbolic::SymbolicInfo {
        &self.info
    }

    /// Solves `A X = B` in place against the cached factorization.
    /// Collective.
    pub fn solve(&self, x: &mut DistMultiVec<S>) {
        let mut nodal = DistNodalMultiVec::pull(&self.inv_perm, &self.info, x);
        solve::ldl_solve(&self.info, &self.tree, &mut nodal, &self.ctx);
        nodal.push(&self.inv_perm, &self.info, x);
    }

    /// Single-vector form of [`solve`](Self::solve).
    pub fn solve_vec(&self, x: &mut DistVec<S>) {
        self.solve(x.as_multi_mut());
    }
}

/// Orders, analyses and factors `A` with the default bisector for the
/// configured partitioning mode. Collective.
pub fn factorize<S: Scalar>(
    a: &DistSparseMat<S>,
    conj: Conj,
    opts: &Options,
) -> Result<Factorization<S>, LdlError> {
    match opts.partition {
        Partition::General => factorize_with_bisector(a, conj, opts, &BfsBisector),
        Partition::Grid { dims } => factorize_with_bisector(a, conj, opts, &GridBisector { dims }),
    }
}

/// [`factorize`] with a caller-provided bisector implementation.
pub fn factorize_with_bisector<S: Scalar>(
    a: &DistSparseMat<S>,
    conj: Conj,
    opts: &Options,
    bisector: &dyn Bisector,
) -> Result<Factorization<S>, LdlError> {
    let ctx = opts.ctx();
    let ctl = NdControl {
        num_dist_seps: opts.num_dist_seps,
        num_seq_seps: opts.num_seq_seps,
        cutoff: opts.cutoff,
        imbalance: 1.1,
    };
    let (perm, sep_tree, etree) = nested_dissection::nested_dissection(a.graph(), bisector, &ctl, &ctx);
    let info = symbolic::analysis(&etree, &ctx);
    let inv_perm = perm.form_inverse();
    let mut tree = front::build_front_tree(conj, opts.block_ldl, a, &perm, &inv_perm, &info);
    factor::ldl(&info, &mut tree, &ctx)?;
    factor::release_schur(&mut tree);
    Ok(Factorization {
        info,
        sep_tree,
        perm,
        inv_perm,
        tree,
        ctx,
    })
}

/// Factors the symmetric matrix `A` (`LDL^T`) and overwrites `X` with the
/// solution of `A X = B`, where `B` is the value of `X` on entry. Collective.
pub fn symmetric_solve<S: Scalar>(
    a: &DistSparseMat<S>,
    x: &mut DistMultiVec<S>,
    opts: &Options,
) -> Result<(), LdlError> {
    let f = factorize(a, Conj::No, opts)?;
    f.solve(x);
    Ok(())
}

/// Hermitian (`LDL^H`) variant of [`symmetric_solve`].
pub fn hermitian_solve<S: Scalar>(
    a: &DistSparseMat<S>,
    x: &mut DistMultiVec<S>,
    opts: &Options,
) -> Result<(), LdlError> {
    let f = factorize(a, Conj::Yes, opts)?;
    f.solve(x);
    Ok(())
}

/// Single-vector form of [`symmetric_solve`].
pub fn symmetric_solve_vec<S: Scalar>(
    a: &DistSparseMat<S>,
    x: &mut DistVec<S>,
    opts: &Options,
) -> Result<(), LdlError> {
    symmetric_solve(a, x.as_multi_mut(), opts)
}

/// Single-vector form of [`hermitian_solve`].
pub fn hermitian_solve_vec<S: Scalar>(
    a: &DistSparseMat<S>,
    x: &mut DistVec<S>,
    opts: &Options,
) -> Result<(), LdlError> {
    hermitian_solve(a, x.as_multi_mut(), opts)
}
