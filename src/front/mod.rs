//! Frontal matrices: per-supernode dense storage and the packing of the
//! sparse matrix into it.
//!
//! Each supernode owns a front split into three blocks: the square pivot
//! block `L_T`, the elimination panel `L_B` below it, and the Schur
//! complement accumulator `work` (created during factorization and consumed
//! by the parent's extend-add). Fronts of local supernodes live on one rank;
//! fronts of distributed supernodes are stored element-cyclically on their
//! team's 2-D grid, and after factorization the factored panel is kept in the
//! 1-D row-cyclic form the solves consume.
//!
//! Packing reads the symmetrized pattern of `A`: each rank mirrors its stored
//! entries across the diagonal (conjugating for the adjoint form), then every
//! front column pulls its original row and scatters the entries at or below
//! the permuted diagonal through the relative index maps.

pub mod dist;
pub mod local;

use crate::comm;
use crate::dense::Mat;
use crate::grid::{DistMat, VcMat};
use crate::map::DistMap;
use crate::scalar::{Conj, Scalar};
use crate::sparse::DistSparseMat;
use crate::symbolic::SymbolicInfo;

/// Dense factorization variant applied inside every front.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LdlMode {
    /// Standard unit-lower LDL; solves use triangular substitution.
    Normal,
    /// The pivot block is replaced by its inverse after factorization, so
    /// solves become dense multiplies; the panel keeps the original entries.
    BlockLdl,
    /// Block LDL with Bunch–Kaufman pivoting inside the pivot block; the
    /// stored inverse is the symmetric-pivoted one, and the row permutation
    /// and block subdiagonal are cached on the front.
    BlockLdlIntraPiv,
}

/// Pivot caches shared by every front kind.
#[derive(Clone)]
pub struct PivotData<S> {
    pub diag: Vec<S>,
    pub sub_diag: Vec<S>,
    /// Intra-front row permutation; empty when no pivoting was performed.
    pub piv: Vec<usize>,
}

impl<S: Scalar> PivotData<S> {
    pub fn none() -> Self {
        PivotData {
            diag: Vec::new(),
            sub_diag: Vec::new(),
            piv: Vec::new(),
        }
    }
}

/// Front of a local supernode.
pub struct LocalFront<S> {
    /// `size × size` pivot block; factored in place (or replaced by its
    /// inverse in the block modes).
    pub l_t: Mat<S>,
    /// `|lower_struct| × size` elimination panel.
    pub l_b: Mat<S>,
    /// Schur complement accumulator; filled during factorization and taken
    /// by the parent's extend-add.
    pub work: Mat<S>,
    pub pivots: PivotData<S>,
}

/// Front of a distributed supernode.
pub struct DistFront<S> {
    /// 2-D cyclic pivot block (packing and extend-add storage; dropped after
    /// the front is factored).
    pub l_t: DistMat<S>,
    /// 2-D cyclic elimination panel, row-aligned below the pivot block.
    pub l_b: DistMat<S>,
    /// 2-D cyclic Schur accumulator, aligned as the trailing block of the
    /// square front.
    pub work: DistMat<S>,
    /// Factored panel in the 1-D row-cyclic solve form (top block and panel
    /// stacked), filled by the factorization.
    pub l_1d: VcMat<S>,
    pub pivots: PivotData<S>,
}

/// The frontal tree: one front per supernode of the symbolic tree.
pub struct FrontTree<S> {
    pub conj: Conj,
    pub mode: LdlMode,
    pub local: Vec<LocalFront<S>>,
    pub dist: Vec<DistFront<S>>,
}

/// Symmetrized row storage used by the pack's pull stage.
struct SymmRows<S> {
    first: usize,
    offsets: Vec<usize>,
    targets: Vec<usize>,
    values: Vec<S>,
}

impl<S: Scalar> SymmRows<S> {
    fn row(&self, i: usize) -> (&[usize], &[S]) {
        let il = i - self.first;
        let (a, b) = (self.offsets[il], self.offsets[il + 1]);
        (&self.targets[a..b], &self.values[a..b])
    }
}

/// Mirrors the stored pattern across the diagonal so that either triangle
/// (or both) of the caller's matrix yields the same symmetric operator. When
/// both orientations of an entry are stored, the directly stored one wins.
fn symmetrize<S: Scalar>(a: &DistSparseMat<S>, conj: Conj) -> SymmRows<S> {
    let comm = a.comm().clone();
    let p = comm.size();
    let first = a.first_local_row();

    let mut idx_sends: Vec<Vec<usize>> = vec![Vec::new(); p];
    let mut val_sends: Vec<Vec<S>> = vec![Vec::new(); p];
    for il in 0..a.local_height() {
        let i = first + il;
        let (targets, values) = a.row_entries(il);
        for (&t, &v) in targets.iter().zip(values.iter()) {
            if t == i {
                continue;
            }
            let q = comm::row_to_process(t, a.blocksize(), p);
            idx_sends[q].push(t);
            idx_sends[q].push(i);
            val_sends[q].push(conj.apply(v));
        }
    }
    let idx_recv = comm::all_to_all_v(&*comm, idx_sends);
    let val_recv = comm::all_to_all_v(&*comm, val_sends);

    // Merge original rows with mirrored entries; sort by (target, mirrored)
    // so direct entries take precedence over mirrors at the same position.
    let mut per_row: Vec<Vec<(usize, bool, S)>> = vec![Vec::new(); a.local_height()];
    for il in 0..a.local_height() {
        let (targets, values) = a.row_entries(il);
        for (&t, &v) in targets.iter().zip(values.iter()) {
            per_row[il].push((t, false, v));
        }
    }
    for (batch, vals) in idx_recv.into_iter().zip(val_recv.into_iter()) {
        for (pair, v) in batch.chunks_exact(2).zip(vals.into_iter()) {
            per_row[pair[0] - first].push((pair[1], true, v));
        }
    }

    let mut offsets = Vec::with_capacity(a.local_height() + 1);
    let mut targets = Vec::new();
    let mut values = Vec::new();
    offsets.push(0);
    for row in per_row.iter_mut() {
        row.sort_unstable_by_key(|&(t, mirrored, _)| (t, mirrored));
        let mut last: Option<usize> = None;
        for &(t, _, v) in row.iter() {
            if last == Some(t) {
                continue;
            }
            last = Some(t);
            targets.push(t);
            values.push(v);
        }
        offsets.push(targets.len());
    }
    SymmRows {
        first,
        offsets,
        targets,
        values,
    }
}

#[derive(Clone, Copy)]
enum ColHome {
    Local(usize),
    Dist(usize),
}

/// Builds the frontal tree of `a` under the composite permutation, scattering
/// the matrix entries through the symbolic relative index maps. Collective.
pub fn build_front_tree<S: Scalar>(
    conj: Conj,
    mode: LdlMode,
    a: &DistSparseMat<S>,
    perm: &DistMap,
    inv_perm: &DistMap,
    info: &SymbolicInfo,
) -> FrontTree<S> {
    let start = std::time::Instant::now();
    let comm = a.comm().clone();
    let p = comm.size();
    let symm = symmetrize(a, conj);

    // Every front column this rank materialises, in a fixed order.
    let mut homes: Vec<ColHome> = Vec::new();
    let mut front_cols: Vec<usize> = Vec::new();
    let mut global_cols: Vec<usize> = Vec::new();
    for (s, node) in info.local_nodes.iter().enumerate() {
        for c in 0..node.size {
            homes.push(ColHome::Local(s));
            front_cols.push(c);
            global_cols.push(node.offset + c);
        }
    }
    for (l, node) in info.dist_nodes.iter().enumerate().skip(1) {
        let gw = node.grid.width();
        let mut c = node.grid.col();
        while c < node.size {
            homes.push(ColHome::Dist(l));
            front_cols.push(c);
            global_cols.push(node.offset + c);
            c += gw;
        }
    }

    // Original row of each needed column, then pull those rows from their
    // owners: one exchange of requests, one of row structures, one of values.
    let mut orig_rows = global_cols.clone();
    inv_perm.translate(&mut orig_rows);

    let mut requests: Vec<Vec<usize>> = vec![Vec::new(); p];
    for &r in &orig_rows {
        requests[comm::row_to_process(r, a.blocksize(), p)].push(r);
    }
    let fulfills = comm::all_to_all_v(&*comm, requests);
    let mut struct_replies: Vec<Vec<usize>> = Vec::with_capacity(p);
    let mut value_replies: Vec<Vec<S>> = Vec::with_capacity(p);
    for batch in &fulfills {
        let mut st = Vec::new();
        let mut va = Vec::new();
        for &r in batch {
            let (targets, values) = symm.row(r);
            st.push(targets.len());
            st.extend_from_slice(targets);
            va.extend_from_slice(values);
        }
        struct_replies.push(st);
        value_replies.push(va);
    }
    let struct_recv = comm::all_to_all_v(&*comm, struct_replies);
    let value_recv = comm::all_to_all_v(&*comm, value_replies);

    // Re-walk the pulled rows in request order, translating every target to
    // the new ordering in one collective pass.
    let mut row_targets: Vec<Vec<usize>> = Vec::with_capacity(orig_rows.len());
    let mut row_values: Vec<Vec<S>> = Vec::with_capacity(orig_rows.len());
    {
        let mut st_cursor = vec![0usize; p];
        let mut va_cursor = vec![0usize; p];
        for &r in &orig_rows {
            let q = comm::row_to_process(r, a.blocksize(), p);
            let st = &struct_recv[q];
            let len = st[st_cursor[q]];
            let tg = st[st_cursor[q] + 1..st_cursor[q] + 1 + len].to_vec();
            st_cursor[q] += 1 + len;
            let va = value_recv[q][va_cursor[q]..va_cursor[q] + len].to_vec();
            va_cursor[q] += len;
            row_targets.push(tg);
            row_values.push(va);
        }
    }
    let mut flat: Vec<usize> = row_targets.iter().flatten().copied().collect();
    perm.translate(&mut flat);
    {
        let mut cursor = 0;
        for tg in row_targets.iter_mut() {
            for t in tg.iter_mut() {
                *t = flat[cursor];
                cursor += 1;
            }
        }
    }

    // Allocate the fronts.
    let mut local: Vec<LocalFront<S>> = info
        .local_nodes
        .iter()
        .map(|n| LocalFront {
            l_t: Mat::zeros(n.size, n.size),
            l_b: Mat::zeros(n.lower_struct.len(), n.size),
            work: Mat::zeros(0, 0),
            pivots: PivotData::none(),
        })
        .collect();
    let mut dist: Vec<DistFront<S>> = info
        .dist_nodes
        .iter()
        .enumerate()
        .map(|(l, n)| {
            if l == 0 {
                DistFront {
                    l_t: DistMat::empty(n.grid.clone()),
                    l_b: DistMat::empty(n.grid.clone()),
                    work: DistMat::empty(n.grid.clone()),
                    l_1d: VcMat::zeros(n.comm.clone(), 0, 0),
                    pivots: PivotData::none(),
                }
            } else {
                let gh = n.grid.height();
                DistFront {
                    l_t: DistMat::zeros(n.grid.clone(), n.size, n.size, 0, 0),
                    l_b: DistMat::zeros(
                        n.grid.clone(),
                        n.lower_struct.len(),
                        n.size,
                        n.size % gh,
                        0,
                    ),
                    work: DistMat::empty(n.grid.clone()),
                    l_1d: VcMat::zeros(n.comm.clone(), 0, 0),
                    pivots: PivotData::none(),
                }
            }
        })
        .collect();

    // Scatter the pulled rows into the fronts.
    for (k, home) in homes.iter().enumerate() {
        let c = front_cols[k];
        let j = global_cols[k];
        let (targets, values) = (&row_targets[k], &row_values[k]);
        match *home {
            ColHome::Local(s) => {
                let node = &info.local_nodes[s];
                let front = &mut local[s];
                for (&pt, &v) in targets.iter().zip(values.iter()) {
                    if pt < j {
                        continue;
                    }
                    let val = if pt == j { v } else { conj.apply(v) };
                    if pt < node.offset + node.size {
                        front.l_t[(pt - node.offset, c)] = val;
                    } else {
                        let idx = node
                            .orig_lower_struct
                            .binary_search(&pt)
                            .expect("entry outside the symbolic structure");
                        front.l_b[(node.orig_lower_rel[idx] - node.size, c)] = val;
                    }
                }
            }
            ColHome::Dist(l) => {
                let node = &info.dist_nodes[l];
                let front = &mut dist[l];
                for (&pt, &v) in targets.iter().zip(values.iter()) {
                    if pt < j {
                        continue;
                    }
                    let val = if pt == j { v } else { conj.apply(v) };
                    if pt < node.offset + node.size {
                        let r = pt - node.offset;
                        if front.l_t.is_local(r, c) {
                            let (li, lj) = front.l_t.local_of(r, c);
                            front.l_t.local_mut()[(li, lj)] = val;
                        }
                    } else {
                        let idx = node
                            .orig_lower_struct
                            .binary_search(&pt)
                            .expect("entry outside the symbolic structure");
                        let u = node.orig_lower_rel[idx] - node.size;
                        if front.l_b.is_local(u, c) {
                            let (li, lj) = front.l_b.local_of(u, c);
                            front.l_b.local_mut()[(li, lj)] = val;
                        }
                    }
                }
            }
        }
    }

    log::debug!(
        "front tree built: {} local fronts, {} distributed fronts in {:?}",
        local.len(),
        dist.len().saturating_sub(1),
        start.elapsed()
    );
    FrontTree {
        conj,
        mode,
        local,
        dist,
    }
}
