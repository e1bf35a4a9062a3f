//! Distributed sparse matrices: values layered over a [`DistGraph`].
//!
//! Assembly mirrors the graph's, with one difference: finishing the assembly
//! sums the values of duplicate `(i, j)` entries instead of dropping them, so
//! finite-element style accumulation works without caller-side merging.

use crate::comm::CommRef;
use crate::graph::DistGraph;
use crate::scalar::Scalar;

/// Square sparse matrix distributed by rows, semantically symmetric or
/// Hermitian. Either triangle (or both) may be provided; the factorization
/// symmetrizes the pattern it reads.
pub struct DistSparseMat<S> {
    graph: DistGraph,
    values: Vec<S>,
}

impl<S: Scalar> DistSparseMat<S> {
    pub fn new(height: usize, comm: CommRef) -> Self {
        DistSparseMat {
            graph: DistGraph::new(height, comm),
            values: Vec::new(),
        }
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.graph.num_sources()
    }
    #[inline]
    pub fn comm(&self) -> &CommRef {
        self.graph.comm()
    }
    #[inline]
    pub fn graph(&self) -> &DistGraph {
        &self.graph
    }
    #[inline]
    pub fn blocksize(&self) -> usize {
        self.graph.blocksize()
    }
    #[inline]
    pub fn first_local_row(&self) -> usize {
        self.graph.first_local_source()
    }
    #[inline]
    pub fn local_height(&self) -> usize {
        self.graph.num_local_sources()
    }
    #[inline]
    pub fn num_local_entries(&self) -> usize {
        self.values.len()
    }

    pub fn start_assembly(&mut self) {
        self.graph.start_assembly();
        debug_assert!(self.values.len() == self.graph.num_local_edges());
    }

    pub fn reserve(&mut self, n: usize) {
        self.graph.reserve(n);
        self.values.reserve(n);
    }

    /// Accumulates `value` at entry `(row, col)`; `row` must be local.
    pub fn update(&mut self, row: usize, col: usize, value: S) {
        self.graph.insert(row, col);
        self.values.push(value);
    }

    /// Sorts entries by `(row, col)`, sums duplicates and builds the row
    /// offset table.
    pub fn stop_assembly(&mut self) {
        assert!(self.graph.assembling(), "no assembly in progress");
        let values = core::mem::take(&mut self.values);
        {
            let (sources, targets) = self.graph.raw_edges_mut();
            assert!(
                sources.len() == values.len(),
                "edge and value counts diverged during assembly"
            );
            let mut order: Vec<usize> = (0..values.len()).collect();
            order.sort_unstable_by_key(|&e| (sources[e], targets[e]));

            let mut new_sources = Vec::with_capacity(order.len());
            let mut new_targets = Vec::with_capacity(order.len());
            let mut new_values: Vec<S> = Vec::with_capacity(order.len());
            for &e in &order {
                let (s, t, v) = (sources[e], targets[e], values[e]);
                if let (Some(&ls), Some(&lt)) = (new_sources.last(), new_targets.last()) {
                    if ls == s && lt == t {
                        *new_values.last_mut().unwrap() += v;
                        continue;
                    }
                }
                new_sources.push(s);
                new_targets.push(t);
                new_values.push(v);
            }
            *sources = new_sources;
            *targets = new_targets;
            self.values = new_values;
        }
        self.graph.set_assembling(false);
        self.graph.rebuild_offsets();
    }

    /// Targets and values of local row `i_local`.
    pub fn row_entries(&self, i_local: usize) -> (&[usize], &[S]) {
        let off = self.graph.local_edge_offset(i_local);
        let n = self.graph.num_connections(i_local);
        (
            &self.graph.targets_of(i_local)[..n],
            &self.values[off..off + n],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm;

    #[test]
    fn duplicates_are_summed() {
        comm::run_spmd(2, |c| {
            let mut a = DistSparseMat::<f64>::new(4, c);
            a.start_assembly();
            for i in a.first_local_row()..a.first_local_row() + a.local_height() {
                a.update(i, i, 1.0);
                a.update(i, i, 2.5);
                a.update(i, (i + 1) % 4, -1.0);
            }
            a.stop_assembly();
            for il in 0..a.local_height() {
                let i = a.first_local_row() + il;
                let (targets, values) = a.row_entries(il);
                let d = targets.iter().position(|&t| t == i).unwrap();
                assert_eq!(values[d], 3.5);
                assert_eq!(targets.len(), 2);
            }
        });
    }

    #[test]
    fn assembly_is_order_independent() {
        let build = |rev: bool| {
            let mut a = DistSparseMat::<f64>::new(3, comm::single());
            a.start_assembly();
            let mut entries = vec![(0, 1, 1.0), (0, 1, 4.0), (2, 0, 2.0), (1, 1, 3.0)];
            if rev {
                entries.reverse();
            }
            for (i, j, v) in entries {
                a.update(i, j, v);
            }
            a.stop_assembly();
            (0..3)
                .flat_map(|i| {
                    let (t, v) = a.row_entries(i);
                    t.iter().copied().zip(v.to_vec()).collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(build(false), build(true));
    }
}
