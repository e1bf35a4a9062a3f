//! Undirected graphs in assembly form, sequential and 1-D distributed.
//!
//! A graph is assembled by pushing `(source, target)` edges between
//! [`start_assembly`](Graph::start_assembly) and
//! [`stop_assembly`](Graph::stop_assembly); finishing the assembly sorts the
//! edges lexicographically, drops exact duplicates, and builds the per-source
//! offset table. Reads of the offset table or of per-source neighbour lists
//! panic while an assembly is open.
//!
//! Targets are allowed to point past the end of the vertex range: the
//! dissection recursion uses such out-of-range targets to carry a subgraph's
//! connections to the separators above it.

use crate::comm::{self, CommRef};

/// Sequential undirected graph on `[0, num_sources)`.
#[derive(Clone, Default)]
pub struct Graph {
    num_sources: usize,
    assembling: bool,
    sources: Vec<usize>,
    targets: Vec<usize>,
    edge_offsets: Vec<usize>,
}

impl Graph {
    pub fn new(num_sources: usize) -> Self {
        Graph {
            num_sources,
            assembling: false,
            sources: Vec::new(),
            targets: Vec::new(),
            edge_offsets: Vec::new(),
        }
    }

    #[inline]
    pub fn num_sources(&self) -> usize {
        self.num_sources
    }
    #[inline]
    pub fn num_edges(&self) -> usize {
        self.sources.len()
    }
    #[inline]
    pub fn source(&self, e: usize) -> usize {
        self.sources[e]
    }
    #[inline]
    pub fn target(&self, e: usize) -> usize {
        self.targets[e]
    }

    pub fn start_assembly(&mut self) {
        self.assembling = true;
        self.edge_offsets.clear();
    }

    pub fn reserve(&mut self, n: usize) {
        self.sources.reserve(n);
        self.targets.reserve(n);
    }

    pub fn insert(&mut self, source: usize, target: usize) {
        assert!(self.assembling, "insert outside of an assembly");
        assert!(source < self.num_sources, "source {source} out of range");
        self.sources.push(source);
        self.targets.push(target);
    }

    pub fn stop_assembly(&mut self) {
        assert!(self.assembling, "no assembly in progress");
        self.assembling = false;
        let mut edges: Vec<(usize, usize)> =
            self.sources.iter().copied().zip(self.targets.iter().copied()).collect();
        edges.sort_unstable();
        edges.dedup();
        self.sources.clear();
        self.targets.clear();
        for (s, t) in edges {
            self.sources.push(s);
            self.targets.push(t);
        }
        self.edge_offsets = build_offsets(&self.sources, self.num_sources, 0);
    }

    #[inline]
    fn check_assembled(&self) {
        assert!(!self.assembling, "graph is still assembling");
    }

    /// Offset of source `i`'s first edge.
    pub fn edge_offset(&self, i: usize) -> usize {
        self.check_assembled();
        self.edge_offsets[i]
    }

    /// Number of edges out of source `i`.
    pub fn num_connections(&self, i: usize) -> usize {
        self.check_assembled();
        self.edge_offsets[i + 1] - self.edge_offsets[i]
    }

    /// Neighbour list of source `i`.
    pub fn targets_of(&self, i: usize) -> &[usize] {
        self.check_assembled();
        &self.targets[self.edge_offsets[i]..self.edge_offsets[i + 1]]
    }
}

/// Builds the offset table of a sorted source array. `first` is the global
/// index of local source 0.
fn build_offsets(sources: &[usize], num_local: usize, first: usize) -> Vec<usize> {
    let mut offsets = vec![0; num_local + 1];
    let mut prev = first;
    let mut slot = 0;
    for (e, &s) in sources.iter().enumerate() {
        debug_assert!(s + 1 > prev, "sources were not properly sorted");
        while prev < s {
            slot += 1;
            offsets[slot] = e;
            prev += 1;
        }
    }
    while slot < num_local {
        slot += 1;
        offsets[slot] = sources.len();
    }
    offsets
}

/// 1-D row-distributed undirected graph.
///
/// Vertex `i` is owned by rank `min(i / blocksize, p - 1)` with
/// `blocksize = ceil(n / p)`; only locally owned sources may be inserted.
#[derive(Clone)]
pub struct DistGraph {
    num_sources: usize,
    comm: CommRef,
    blocksize: usize,
    first_local_source: usize,
    num_local_sources: usize,
    assembling: bool,
    sources: Vec<usize>,
    targets: Vec<usize>,
    local_edge_offsets: Vec<usize>,
}

impl DistGraph {
    pub fn new(num_sources: usize, comm: CommRef) -> Self {
        let p = comm.size();
        let blocksize = comm::row_blocksize(num_sources, p);
        let (first_local_source, num_local_sources) =
            comm::local_row_range(num_sources, p, comm.rank());
        DistGraph {
            num_sources,
            comm,
            blocksize,
            first_local_source,
            num_local_sources,
            assembling: false,
            sources: Vec::new(),
            targets: Vec::new(),
            local_edge_offsets: Vec::new(),
        }
    }

    /// Clears every edge and re-partitions for the new vertex count.
    pub fn resize(&mut self, num_sources: usize) {
        *self = DistGraph::new(num_sources, self.comm.clone());
    }

    /// Clears every edge and adopts a new process group.
    pub fn set_comm(&mut self, comm: CommRef) {
        *self = DistGraph::new(self.num_sources, comm);
    }

    #[inline]
    pub fn comm(&self) -> &CommRef {
        &self.comm
    }
    #[inline]
    pub fn num_sources(&self) -> usize {
        self.num_sources
    }
    #[inline]
    pub fn blocksize(&self) -> usize {
        self.blocksize
    }
    #[inline]
    pub fn first_local_source(&self) -> usize {
        self.first_local_source
    }
    #[inline]
    pub fn num_local_sources(&self) -> usize {
        self.num_local_sources
    }
    #[inline]
    pub fn num_local_edges(&self) -> usize {
        self.sources.len()
    }
    #[inline]
    pub fn source(&self, e: usize) -> usize {
        self.sources[e]
    }
    #[inline]
    pub fn target(&self, e: usize) -> usize {
        self.targets[e]
    }

    /// Owner rank of vertex `i`.
    #[inline]
    pub fn owner(&self, i: usize) -> usize {
        comm::row_to_process(i, self.blocksize, self.comm.size())
    }

    pub fn start_assembly(&mut self) {
        self.assembling = true;
        self.local_edge_offsets.clear();
    }

    pub fn reserve(&mut self, n: usize) {
        self.sources.reserve(n);
        self.targets.reserve(n);
    }

    pub fn insert(&mut self, source: usize, target: usize) {
        assert!(self.assembling, "insert outside of an assembly");
        assert!(
            source >= self.first_local_source
                && source < self.first_local_source + self.num_local_sources,
            "source {source} is not locally owned"
        );
        self.sources.push(source);
        self.targets.push(target);
    }

    pub fn stop_assembly(&mut self) {
        assert!(self.assembling, "no assembly in progress");
        self.assembling = false;
        let mut edges: Vec<(usize, usize)> =
            self.sources.iter().copied().zip(self.targets.iter().copied()).collect();
        edges.sort_unstable();
        edges.dedup();
        self.sources.clear();
        self.targets.clear();
        for (s, t) in edges {
            self.sources.push(s);
            self.targets.push(t);
        }
        self.local_edge_offsets =
            build_offsets(&self.sources, self.num_local_sources, self.first_local_source);
    }

    #[inline]
    fn check_assembled(&self) {
        assert!(!self.assembling, "graph is still assembling");
    }

    /// Offset of local source `i_local`'s first edge.
    pub fn local_edge_offset(&self, i_local: usize) -> usize {
        self.check_assembled();
        self.local_edge_offsets[i_local]
    }

    /// Number of edges out of local source `i_local`.
    pub fn num_connections(&self, i_local: usize) -> usize {
        self.check_assembled();
        self.local_edge_offsets[i_local + 1] - self.local_edge_offsets[i_local]
    }

    /// Neighbour list of local source `i_local`.
    pub fn targets_of(&self, i_local: usize) -> &[usize] {
        self.check_assembled();
        &self.targets[self.local_edge_offsets[i_local]..self.local_edge_offsets[i_local + 1]]
    }

    /// Gathers the whole edge set onto every rank as a sequential [`Graph`].
    pub fn gather_to_all(&self) -> Graph {
        self.check_assembled();
        let mut flat = Vec::with_capacity(2 * self.sources.len());
        for (&s, &t) in self.sources.iter().zip(self.targets.iter()) {
            flat.push(s);
            flat.push(t);
        }
        let gathered = comm::all_gather_v(&**self.comm(), &flat);
        let mut g = Graph::new(self.num_sources);
        g.start_assembly();
        g.reserve(gathered.iter().map(|v| v.len() / 2).sum());
        for part in gathered {
            for pair in part.chunks_exact(2) {
                g.insert(pair[0], pair[1]);
            }
        }
        g.stop_assembly();
        g
    }
}

// Internal access for the sparse-matrix layer, which co-sorts values with the
// edge arrays.
impl DistGraph {
    pub(crate) fn assembling(&self) -> bool {
        self.assembling
    }
    pub(crate) fn raw_edges_mut(&mut self) -> (&mut Vec<usize>, &mut Vec<usize>) {
        (&mut self.sources, &mut self.targets)
    }
    pub(crate) fn set_assembling(&mut self, v: bool) {
        self.assembling = v;
    }
    pub(crate) fn rebuild_offsets(&mut self) {
        self.local_edge_offsets =
            build_offsets(&self.sources, self.num_local_sources, self.first_local_source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm;

    #[test]
    fn assembly_sorts_and_dedups() {
        let mut g = Graph::new(4);
        g.start_assembly();
        g.reserve(8);
        g.insert(2, 1);
        g.insert(0, 3);
        g.insert(2, 1);
        g.insert(0, 0);
        g.insert(3, 2);
        g.insert(0, 3);
        g.stop_assembly();
        assert_eq!(g.num_edges(), 4);
        assert_eq!(g.targets_of(0), &[0, 3]);
        assert_eq!(g.targets_of(1), &[] as &[usize]);
        assert_eq!(g.targets_of(2), &[1]);
        assert_eq!(g.targets_of(3), &[2]);
        assert_eq!(g.num_connections(0), 2);
        assert_eq!(g.edge_offset(3), 3);
    }

    #[test]
    #[should_panic(expected = "still assembling")]
    fn reads_during_assembly_panic() {
        let mut g = Graph::new(2);
        g.start_assembly();
        g.insert(0, 1);
        let _ = g.num_connections(0);
    }

    #[test]
    fn out_of_range_targets_are_kept() {
        let mut g = Graph::new(2);
        g.start_assembly();
        g.insert(0, 5);
        g.insert(1, 0);
        g.stop_assembly();
        assert_eq!(g.targets_of(0), &[5]);
    }

    #[test]
    fn dist_assembly_matches_local_view() {
        comm::run_spmd(4, |c| {
            let n = 10;
            let mut g = DistGraph::new(n, c);
            g.start_assembly();
            for i in g.first_local_source()..g.first_local_source() + g.num_local_sources() {
                g.insert(i, (i + 1) % n);
                g.insert(i, (i + n - 1) % n);
                g.insert(i, (i + 1) % n); // duplicate
            }
            g.stop_assembly();
            assert_eq!(g.num_local_edges(), 2 * g.num_local_sources());
            let seq = g.gather_to_all();
            assert_eq!(seq.num_edges(), 2 * n);
        });
    }
}
