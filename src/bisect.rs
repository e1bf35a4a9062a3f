//! Graph bisection: the pluggable partitioning oracle behind nested
//! dissection.
//!
//! A bisector splits a graph's vertex set into a left part, a right part and
//! a vertex separator such that no edge joins the two parts directly. The
//! separator's size is the only correctness-critical output; balance is
//! advisory. Implementations must ignore self-loops and must be deterministic
//! for a given graph (the symbolic phase relies on every rank reproducing the
//! same partition from the same gathered subgraph).
//!
//! Two implementations are provided: a breadth-first-search bisector used by
//! default, and a closed-form bisector for axis-aligned stencil meshes that
//! cuts the middle plane orthogonal to the longest box axis.

use crate::graph::Graph;

/// Advisory quality knobs passed through to a bisector.
#[derive(Clone, Copy, Debug)]
pub struct BisectParams {
    /// Number of candidate separators to try; the smallest wins.
    pub num_seps: usize,
    /// Accepted imbalance ratio between the two parts (advisory).
    pub imbalance: f64,
}

impl Default for BisectParams {
    fn default() -> Self {
        BisectParams {
            num_seps: 1,
            imbalance: 1.1,
        }
    }
}

/// Result of one bisection. `map` renumbers the graph's vertices so that the
/// left part occupies `[0, left_size)`, the right part
/// `[left_size, left_size + right_size)`, and the separator the rest.
pub struct Bisection {
    pub left_size: usize,
    pub right_size: usize,
    pub sep_size: usize,
    pub map: Vec<usize>,
}

impl Bisection {
    /// Checks that `map` is a permutation and that no edge joins the two
    /// parts; used by the callers' debug paths.
    pub fn validate(&self, graph: &Graph) {
        let n = graph.num_sources();
        assert!(self.left_size + self.right_size + self.sep_size == n);
        let mut hits = vec![0usize; n];
        for &m in &self.map {
            hits[m] += 1;
        }
        assert!(
            hits.iter().all(|&h| h == 1),
            "bisection map is not a permutation"
        );
        let cut = self.left_size + self.right_size;
        for e in 0..graph.num_edges() {
            let (s, t) = (graph.source(e), graph.target(e));
            if s == t || t >= n {
                continue;
            }
            let (ms, mt) = (self.map[s], self.map[t]);
            if ms >= cut || mt >= cut {
                continue;
            }
            assert!(
                (ms < self.left_size) == (mt < self.left_size),
                "edge crosses the separator"
            );
        }
    }
}

/// A vertex-separator oracle.
///
/// `vertex_ids` carries the caller's identity of each vertex (the original
/// global index); the BFS bisector ignores it, the mesh bisector derives
/// coordinates from it.
pub trait Bisector: Send + Sync {
    fn bisect(&self, graph: &Graph, vertex_ids: &[usize], params: &BisectParams) -> Bisection;
}

/// Default bisector: grows a breadth-first region to half the vertex count
/// and takes the region's boundary as the separator. Deterministic; tries
/// `num_seps` start vertices and keeps the smallest separator.
pub struct BfsBisector;

impl BfsBisector {
    /// BFS visit order from `seed`, restarting in index order on disconnected
    /// remainders. Self-loops and out-of-range targets are skipped.
    fn bfs_order(graph: &Graph, seed: usize) -> Vec<usize> {
        let n = graph.num_sources();
        let mut order = Vec::with_capacity(n);
        let mut seen = vec![false; n];
        let mut queue = std::collections::VecDeque::new();
        let mut next_restart = 0;
        let mut start = Some(seed);
        while order.len() < n {
            let s = match start.take() {
                Some(s) if !seen[s] => s,
                _ => {
                    while seen[next_restart] {
                        next_restart += 1;
                    }
                    next_restart
                }
            };
            seen[s] = true;
            queue.push_back(s);
            while let Some(v) = queue.pop_front() {
                order.push(v);
                for &t in graph.targets_of(v) {
                    if t < n && t != v && !seen[t] {
                        seen[t] = true;
                        queue.push_back(t);
                    }
                }
            }
        }
        order
    }

    fn candidate(graph: &Graph, seed: usize) -> Bisection {
        let n = graph.num_sources();
        let order = Self::bfs_order(graph, seed);
        let half = n.div_ceil(2);
        let mut in_region = vec![false; n];
        for &v in &order[..half] {
            in_region[v] = true;
        }
        // The separator is the part of the region adjacent to the outside.
        let mut in_sep = vec![false; n];
        let mut sep_size = 0;
        for v in 0..n {
            if !in_region[v] {
                continue;
            }
            for &t in graph.targets_of(v) {
                if t < n && t != v && !in_region[t] {
                    in_sep[v] = true;
                    sep_size += 1;
                    break;
                }
            }
        }
        let left_size = half - sep_size;
        let right_size = n - half;
        let mut map = vec![0usize; n];
        let (mut next_l, mut next_r, mut next_s) = (0, left_size, left_size + right_size);
        for v in 0..n {
            map[v] = if in_sep[v] {
                let m = next_s;
                next_s += 1;
                m
            } else if in_region[v] {
                let m = next_l;
                next_l += 1;
                m
            } else {
                let m = next_r;
                next_r += 1;
                m
            };
        }
        Bisection {
            left_size,
            right_size,
            sep_size,
            map,
        }
    }
}

impl Bisector for BfsBisector {
    fn bisect(&self, graph: &Graph, _vertex_ids: &[usize], params: &BisectParams) -> Bisection {
        let n = graph.num_sources();
        assert!(n >= 2, "cannot bisect fewer than two vertices");
        let attempts = params.num_seps.max(1);
        let mut best: Option<Bisection> = None;
        for k in 0..attempts {
            let seed = if k == 0 {
                0
            } else {
                // Spread the remaining seeds over the index range.
                (k * n) / attempts
            };
            let cand = Self::candidate(graph, seed.min(n - 1));
            let better = match &best {
                None => true,
                Some(b) => cand.sep_size < b.sep_size,
            };
            if better {
                best = Some(cand);
            }
        }
        best.unwrap()
    }
}

/// Closed-form bisector for vertices numbered over an `nx × ny × nz` box
/// (`id = x + y * nx + z * nx * ny`): cuts the middle plane orthogonal to the
/// longest axis of the vertex set's bounding box. Produces the textbook
/// nested-dissection ordering for 5- and 7-point stencil meshes.
pub struct GridBisector {
    pub dims: [usize; 3],
}

impl GridBisector {
    #[inline]
    fn coords(&self, id: usize) -> [usize; 3] {
        let [nx, ny, _] = self.dims;
        [id % nx, (id / nx) % ny, id / (nx * ny)]
    }
}

impl Bisector for GridBisector {
    fn bisect(&self, graph: &Graph, vertex_ids: &[usize], _params: &BisectParams) -> Bisection {
        let n = graph.num_sources();
        assert!(n >= 2, "cannot bisect fewer than two vertices");
        assert!(
            vertex_ids.len() == n,
            "vertex identities must cover the graph"
        );
        let mut lo = [usize::MAX; 3];
        let mut hi = [0usize; 3];
        for &id in vertex_ids {
            let c = self.coords(id);
            for a in 0..3 {
                lo[a] = lo[a].min(c[a]);
                hi[a] = hi[a].max(c[a]);
            }
        }
        let mut axis = 0;
        for a in 1..3 {
            if hi[a] - lo[a] > hi[axis] - lo[axis] {
                axis = a;
            }
        }
        assert!(hi[axis] > lo[axis], "degenerate box cannot be bisected");
        let cut = (lo[axis] + hi[axis]) / 2;

        let mut left_size = 0;
        let mut right_size = 0;
        let mut sep_size = 0;
        for &id in vertex_ids {
            let c = self.coords(id)[axis];
            if c < cut {
                left_size += 1;
            } else if c > cut {
                right_size += 1;
            } else {
                sep_size += 1;
            }
        }
        let mut map = vec![0usize; n];
        let (mut next_l, mut next_r, mut next_s) = (0, left_size, left_size + right_size);
        for (v, &id) in vertex_ids.iter().enumerate() {
            let c = self.coords(id)[axis];
            map[v] = if c < cut {
                let m = next_l;
                next_l += 1;
                m
            } else if c > cut {
                let m = next_r;
                next_r += 1;
                m
            } else {
                let m = next_s;
                next_s += 1;
                m
            };
        }
        Bisection {
            left_size,
            right_size,
            sep_size,
            map,
        }
    }
}

/// Builds the graph of an `n1 × n2 × n3` 7-point stencil (5-point when one
/// dimension is 1); shared by tests and example drivers.
pub fn stencil_graph(n1: usize, n2: usize, n3: usize) -> Graph {
    let n = n1 * n2 * n3;
    let mut g = Graph::new(n);
    g.start_assembly();
    g.reserve(7 * n);
    for i in 0..n {
        let x = i % n1;
        let y = (i / n1) % n2;
        let z = i / (n1 * n2);
        g.insert(i, i);
        if x != 0 {
            g.insert(i, i - 1);
        }
        if x != n1 - 1 {
            g.insert(i, i + 1);
        }
        if y != 0 {
            g.insert(i, i - n1);
        }
        if y != n2 - 1 {
            g.insert(i, i + n1);
        }
        if z != 0 {
            g.insert(i, i - n1 * n2);
        }
        if z != n3 - 1 {
            g.insert(i, i + n1 * n2);
        }
    }
    g.stop_assembly();
    g
}
