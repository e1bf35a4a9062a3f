//! Right-hand-side shuffling between the caller's 1-D row partition and the
//! per-supernode nodal layout the solves operate on.
//!
//! The nodal stacking on each rank is: every local supernode's rows in tree
//! order, followed by this rank's 1-D cyclic share of every distributed
//! supernode above the local root. `pull` materialises that stacking from a
//! distributed multi-vector with one request / reply exchange pair; `push` is
//! the exact inverse.

use crate::comm;
use crate::dense::Mat;
use crate::map::DistMap;
use crate::multivec::DistMultiVec;
use crate::scalar::Scalar;
use crate::symbolic::SymbolicInfo;

/// A multi-vector in the nodal (per-supernode) layout.
pub struct DistNodalMultiVec<S> {
    pub local: Mat<S>,
}

impl<S: Scalar> DistNodalMultiVec<S> {
    /// The reordered row indices this rank materialises, in stacking order.
    fn mapped_indices(info: &SymbolicInfo) -> Vec<usize> {
        let mut mapped = Vec::with_capacity(info.local_nodal_height());
        for node in &info.local_nodes {
            for t in 0..node.size {
                mapped.push(node.offset + t);
            }
        }
        for node in &info.dist_nodes[1..] {
            let t_team = node.comm.size();
            let mut t = node.comm.rank();
            while t < node.size {
                mapped.push(node.offset + t);
                t += t_team;
            }
        }
        debug_assert!(mapped.len() == info.local_nodal_height());
        mapped
    }

    /// Gathers the nodal view of `x`. Collective over `x`'s group.
    pub fn pull(inverse_map: &DistMap, info: &SymbolicInfo, x: &DistMultiVec<S>) -> Self {
        let comm = x.comm().clone();
        let p = comm.size();
        let width = x.width();

        let mut indices = Self::mapped_indices(info);
        inverse_map.translate(&mut indices);

        let mut requests: Vec<Vec<usize>> = vec![Vec::new(); p];
        for &i in &indices {
            requests[x.owner(i)].push(i);
        }
        let fulfills = comm::all_to_all_v(&*comm, requests);
        let mut replies: Vec<Vec<S>> = Vec::with_capacity(p);
        for batch in &fulfills {
            let mut vals = Vec::with_capacity(batch.len() * width);
            for &i in batch {
                for j in 0..width {
                    vals.push(x.local()[(i - x.first_local_row(), j)]);
                }
            }
            replies.push(vals);
        }
        let answers = comm::all_to_all_v(&*comm, replies);

        let mut local = Mat::zeros(indices.len(), width);
        let mut cursors = vec![0usize; p];
        for (row, &i) in indices.iter().enumerate() {
            let q = x.owner(i);
            for j in 0..width {
                local[(row, j)] = answers[q][cursors[q] * width + j];
            }
            cursors[q] += 1;
        }
        DistNodalMultiVec { local }
    }

    /// Scatters the nodal view back into `x`. Collective over `x`'s group.
    pub fn push(&self, inverse_map: &DistMap, info: &SymbolicInfo, x: &mut DistMultiVec<S>) {
        let comm = x.comm().clone();
        let p = comm.size();
        let width = x.width();
        assert!(self.local.ncols() == width, "nonconformal push");

        let mut indices = Self::mapped_indices(info);
        inverse_map.translate(&mut indices);
        assert!(indices.len() == self.local.nrows());

        let mut idx_sends: Vec<Vec<usize>> = vec![Vec::new(); p];
        let mut val_sends: Vec<Vec<S>> = vec![Vec::new(); p];
        for (row, &i) in indices.iter().enumerate() {
            let q = x.owner(i);
            idx_sends[q].push(i);
            for j in 0..width {
                val_sends[q].push(self.local[(row, j)]);
            }
        }
        let idx_recv = comm::all_to_all_v(&*comm, idx_sends);
        let val_recv = comm::all_to_all_v(&*comm, val_sends);

        let mut received = 0;
        for (batch, vals) in idx_recv.iter().zip(val_recv.iter()) {
            for (k, &i) in batch.iter().enumerate() {
                let il = i - x.first_local_row();
                for j in 0..width {
                    x.local_mut()[(il, j)] = vals[k * width + j];
                }
                received += 1;
            }
        }
        debug_assert!(received == x.local_height(), "push did not cover the local rows");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bisect::{stencil_graph, BfsBisector};
    use crate::comm;
    use crate::graph::DistGraph;
    use crate::nested_dissection::{nested_dissection, NdControl};
    use crate::symbolic;
    use crate::Ctx;

    #[test]
    fn pull_then_push_roundtrips() {
        comm::run_spmd(4, |c| {
            let seq = stencil_graph(10, 10, 1);
            let mut g = DistGraph::new(100, c.clone());
            g.start_assembly();
            for i in g.first_local_source()..g.first_local_source() + g.num_local_sources() {
                for &t in seq.targets_of(i) {
                    g.insert(i, t);
                }
            }
            g.stop_assembly();
            let ctl = NdControl {
                cutoff: 8,
                ..NdControl::default()
            };
            let (perm, _, etree) = nested_dissection(&g, &BfsBisector, &ctl, &Ctx::default());
            let info = symbolic::analysis(&etree, &Ctx::default());
            let inv = perm.form_inverse();

            let x0 = DistMultiVec::<f64>::from_fn(100, 2, c.clone(), |i, j| (i * 2 + j) as f64);
            let nodal = DistNodalMultiVec::pull(&inv, &info, &x0);
            assert_eq!(nodal.local.nrows(), info.local_nodal_height());
            let mut x1 = DistMultiVec::<f64>::zeros(100, 2, c);
            nodal.push(&inv, &info, &mut x1);
            for j in 0..2 {
                for i in 0..x1.local_height() {
                    assert_eq!(x1.local()[(i, j)], x0.local()[(i, j)]);
                }
            }
        });
    }
}
