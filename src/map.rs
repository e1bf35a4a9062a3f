//! Distributed index maps (renumberings of `[0, n)`).
//!
//! A [`DistMap`] stores, for every locally owned index `i`, the image `m[i]`
//! under a permutation of the global index space. Applying the map to an
//! arbitrary index array, inverting it, and composing two maps are all
//! collective, built on the same request/fulfill all-to-all pattern: bucket
//! the queried indices by owner, exchange, answer from local storage,
//! exchange back, and unpack in the packing order.

use crate::comm::{self, CommRef};

/// 1-D distributed permutation of `[0, num_sources)`.
pub struct DistMap {
    comm: CommRef,
    num_sources: usize,
    blocksize: usize,
    first_local_source: usize,
    local: Vec<usize>,
}

impl DistMap {
    /// A map with zero-initialised local storage.
    pub fn new(num_sources: usize, comm: CommRef) -> Self {
        let (first, count) = comm::local_row_range(num_sources, comm.size(), comm.rank());
        DistMap {
            blocksize: comm::row_blocksize(num_sources, comm.size()),
            num_sources,
            first_local_source: first,
            local: vec![0; count],
            comm,
        }
    }

    /// Wraps this rank's slice of the map.
    pub fn from_local(num_sources: usize, comm: CommRef, local: Vec<usize>) -> Self {
        let mut m = DistMap::new(num_sources, comm);
        assert!(
            local.len() == m.local.len(),
            "local map slice has the wrong length"
        );
        m.local = local;
        m
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
    pub fn local(&self) -> &[usize] {
        &self.local
    }
    #[inline]
    pub fn local_mut(&mut self) -> &mut [usize] {
        &mut self.local
    }

    /// Owner rank of index `i`.
    #[inline]
    pub fn owner(&self, i: usize) -> usize {
        comm::row_to_process(i, self.blocksize, self.comm.size())
    }

    /// Replaces each entry of `indices` with its image under the map.
    /// Collective over the map's group.
    pub fn translate(&self, indices: &mut [usize]) {
        let p = self.comm.size();
        let mut requests: Vec<Vec<usize>> = vec![Vec::new(); p];
        for &i in indices.iter() {
            assert!(i < self.num_sources, "index {i} outside the map's domain");
            requests[self.owner(i)].push(i);
        }
        let fulfills = comm::all_to_all_v(&*self.comm, requests);
        let mut replies: Vec<Vec<usize>> = Vec::with_capacity(p);
        for batch in fulfills {
            let mut out = Vec::with_capacity(batch.len());
            for i in batch {
                out.push(self.local[i - self.first_local_source]);
            }
            replies.push(out);
        }
        let answered = comm::all_to_all_v(&*self.comm, replies);
        // Unpack in the same order the requests were packed.
        let mut cursors = vec![0usize; p];
        for slot in indices.iter_mut() {
            let q = self.owner(*slot);
            *slot = answered[q][cursors[q]];
            cursors[q] += 1;
        }
    }

    /// Forms the inverse map by exchanging `(i, m[i])` pairs with the owner
    /// of `m[i]`. Collective.
    pub fn form_inverse(&self) -> DistMap {
        let p = self.comm.size();
        let mut sends: Vec<Vec<usize>> = vec![Vec::new(); p];
        for (k, &image) in self.local.iter().enumerate() {
            let q = self.owner(image);
            sends[q].push(self.first_local_source + k);
            sends[q].push(image);
        }
        let recvs = comm::all_to_all_v(&*self.comm, sends);
        let mut inv = DistMap::new(self.num_sources, self.comm.clone());
        let mut seen = 0;
        for batch in recvs {
            for pair in batch.chunks_exact(2) {
                let (orig, image) = (pair[0], pair[1]);
                inv.local[image - inv.first_local_source] = orig;
                seen += 1;
            }
        }
        debug_assert!(seen == inv.local.len(), "inverse map is not a bijection");
        inv
    }

    /// Composition `third[i] = second[self[i]]`. Collective.
    pub fn compose(&self, second: &DistMap) -> DistMap {
        let mut third = self.local.clone();
        second.translate(&mut third);
        DistMap::from_local(self.num_sources, self.comm.clone(), third)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm;

    fn cyclic_shift_map(n: usize, shift: usize, comm: CommRef) -> DistMap {
        let mut m = DistMap::new(n, comm);
        let first = m.first_local_source();
        for k in 0..m.local().len() {
            m.local_mut()[k] = (first + k + shift) % n;
        }
        m
    }

    #[test]
    fn inverse_roundtrip() {
        comm::run_spmd(4, |c| {
            let m = cyclic_shift_map(11, 4, c);
            let inv = m.form_inverse();
            let back = inv.form_inverse();
            assert_eq!(back.local(), m.local());
        });
    }

    #[test]
    fn translate_then_inverse_translate_is_identity() {
        comm::run_spmd(3, |c| {
            let m = cyclic_shift_map(10, 3, c);
            let inv = m.form_inverse();
            let mut idx: Vec<usize> = vec![0, 9, 4, 4, 7];
            let orig = idx.clone();
            m.translate(&mut idx);
            inv.translate(&mut idx);
            assert_eq!(idx, orig);
        });
    }

    #[test]
    fn compose_matches_pointwise() {
        comm::run_spmd(2, |c| {
            let n = 8;
            let a = cyclic_shift_map(n, 3, c.clone());
            let b = cyclic_shift_map(n, 5, c.clone());
            let ab = a.compose(&b);
            // b[a[i]] = i + 3 + 5 mod 8: composing the shifts.
            let first = ab.first_local_source();
            for k in 0..ab.local().len() {
                assert_eq!(ab.local()[k], (first + k + 8) % n);
            }
        });
    }
}
