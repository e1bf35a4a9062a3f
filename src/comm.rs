//! The collective-communication layer.
//!
//! Every distributed phase of the solver is SPMD: the same code runs on `P`
//! ranks of a process group and synchronises only through the collectives
//! declared by [`Comm`]. The solver never assumes a particular transport; any
//! implementation of the trait works. Two are provided:
//!
//! - [`SelfComm`], the trivial single-rank group, and
//! - [`ThreadComm`], an in-process group in which each rank is a thread and
//!   collectives rendezvous through a shared mailbox. [`run_spmd`] spawns a
//!   full group of ranks over a closure, which is how the tests and example
//!   drivers bootstrap.
//!
//! Payloads cross the trait as raw bytes; the typed helpers at the bottom of
//! the module cast `Pod` slices in and out so index traffic (`usize`) and
//! scalar traffic share one code path.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared handle to a communicator.
pub type CommRef = Arc<dyn Comm>;

/// A fixed group of ranks with collective operations.
///
/// All operations are collective: every rank of the group must call them in
/// the same order, or the group deadlocks. Messages between a fixed pair of
/// ranks are non-overtaking.
pub trait Comm: Send + Sync {
    /// This rank's index in `0..size()`.
    fn rank(&self) -> usize;
    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Blocks until every rank of the group has entered the barrier.
    fn barrier(&self);

    /// Splits the group into sub-groups, one per distinct `color`. Ranks are
    /// ordered within each sub-group by `(key, rank)`.
    fn split(&self, color: usize, key: usize) -> CommRef;

    /// Replaces `buf` on every rank with `root`'s buffer.
    fn broadcast(&self, root: usize, buf: &mut Vec<u8>);

    /// Vector all-to-all: `sends[q]` is delivered to rank `q`; the returned
    /// vector holds the payload received from each rank.
    fn all_to_all_v(&self, sends: Vec<Vec<u8>>) -> Vec<Vec<u8>>;

    /// Pairwise exchange with `partner`. Collective: every rank of the group
    /// must call it (with matching partners) at the same point.
    fn send_recv(&self, partner: usize, send: Vec<u8>) -> Vec<u8>;
}

/// The universal address-of-row rule: row `i` of an `n`-row object distributed
/// over `p` ranks with block size `blocksize = ceil(n / p)` lives on rank
/// `min(i / blocksize, p - 1)`.
#[inline]
pub fn row_to_process(i: usize, blocksize: usize, p: usize) -> usize {
    usize::min(i / blocksize, p - 1)
}

/// Block size of the universal 1-D row partition.
#[inline]
pub fn row_blocksize(n: usize, p: usize) -> usize {
    n.div_ceil(p).max(1)
}

/// Local row range of `rank` under the universal 1-D partition.
pub fn local_row_range(n: usize, p: usize, rank: usize) -> (usize, usize) {
    let bs = row_blocksize(n, p);
    let first = usize::min(rank * bs, n);
    let count = if rank + 1 == p {
        n - first
    } else {
        usize::min(bs, n - first)
    };
    (first, count)
}

// ---------------------------------------------------------------------------
// Single-rank group
// ---------------------------------------------------------------------------

/// The trivial group of one rank.
pub struct SelfComm;

/// Returns the single-rank communicator.
pub fn single() -> CommRef {
    Arc::new(SelfComm)
}

impl Comm for SelfComm {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn barrier(&self) {}
    fn split(&self, _color: usize, _key: usize) -> CommRef {
        single()
    }
    fn broadcast(&self, root: usize, _buf: &mut Vec<u8>) {
        assert!(root == 0, "invalid broadcast root {root} for a group of one");
    }
    fn all_to_all_v(&self, mut sends: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        assert!(sends.len() == 1, "all_to_all_v row count must equal group size");
        vec![core::mem::take(&mut sends[0])]
    }
    fn send_recv(&self, partner: usize, send: Vec<u8>) -> Vec<u8> {
        assert!(partner == 0, "invalid partner {partner} for a group of one");
        send
    }
}

// ---------------------------------------------------------------------------
// Thread-backed group
// ---------------------------------------------------------------------------

#[derive(PartialEq, Eq, Clone, Copy)]
enum Stage {
    Gather,
    Scatter,
}

struct RoundState {
    stage: Stage,
    boxes: Vec<Vec<Option<Vec<u8>>>>,
    deposited: usize,
    taken: usize,
}

struct SplitPending {
    shared: Arc<Shared>,
    taken: usize,
}

struct Shared {
    size: usize,
    state: Mutex<RoundState>,
    cv: Condvar,
    splits: Mutex<HashMap<(u64, usize), SplitPending>>,
}

impl Shared {
    fn new(size: usize) -> Self {
        Shared {
            size,
            state: Mutex::new(RoundState {
                stage: Stage::Gather,
                boxes: vec![Vec::new(); size],
                deposited: 0,
                taken: 0,
            }),
            cv: Condvar::new(),
            splits: Mutex::new(HashMap::new()),
        }
    }

    /// One full-matrix exchange: rank `r` deposits its row of payloads and
    /// picks up column `r` once every rank has deposited. This single
    /// primitive backs every collective of the group.
    fn exchange(&self, rank: usize, rows: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        debug_assert!(rows.len() == self.size);
        let mut st = self.state.lock();
        while st.stage != Stage::Gather {
            self.cv.wait(&mut st);
        }
        st.boxes[rank] = rows.into_iter().map(Some).collect();
        st.deposited += 1;
        if st.deposited == self.size {
            st.stage = Stage::Scatter;
            self.cv.notify_all();
        }
        while st.stage != Stage::Scatter {
            self.cv.wait(&mut st);
        }
        let mut out = Vec::with_capacity(self.size);
        for src in 0..self.size {
            out.push(st.boxes[src][rank].take().expect("exchange slot already taken"));
        }
        st.taken += 1;
        if st.taken == self.size {
            st.deposited = 0;
            st.taken = 0;
            for b in st.boxes.iter_mut() {
                b.clear();
            }
            st.stage = Stage::Gather;
            self.cv.notify_all();
        }
        out
    }
}

/// One rank of an in-process group; collectives rendezvous through shared
/// state guarded by a mutex and condition variable.
pub struct ThreadComm {
    shared: Arc<Shared>,
    rank: usize,
    split_seq: AtomicU64,
}

impl ThreadComm {
    /// Creates the handles for a new group of `size` ranks.
    pub fn group(size: usize) -> Vec<CommRef> {
        assert!(size > 0);
        let shared = Arc::new(Shared::new(size));
        (0..size)
            .map(|rank| {
                Arc::new(ThreadComm {
                    shared: shared.clone(),
                    rank,
                    split_seq: AtomicU64::new(0),
                }) as CommRef
            })
            .collect()
    }
}

impl Comm for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) {
        let empty = vec![Vec::new(); self.shared.size];
        let _ = self.shared.exchange(self.rank, empty);
    }

    fn split(&self, color: usize, key: usize) -> CommRef {
        let size = self.shared.size;
        // Agree on every rank's (color, key) first so group membership and
        // the new rank order are known before the rendezvous.
        let mut rows = Vec::with_capacity(size);
        for _ in 0..size {
            rows.push(bytemuck::cast_slice(&[color, key]).to_vec());
        }
        let infos = self.shared.exchange(self.rank, rows);
        let infos: Vec<(usize, usize)> = infos
            .iter()
            .map(|b| {
                let v: Vec<usize> = bytemuck::allocation::pod_collect_to_vec(&b[..]);
                (v[0], v[1])
            })
            .collect();

        let mut members: Vec<(usize, usize)> = (0..size)
            .filter(|&r| infos[r].0 == color)
            .map(|r| (infos[r].1, r))
            .collect();
        members.sort_unstable();
        let group_size = members.len();
        let new_rank = members
            .iter()
            .position(|&(_, r)| r == self.rank)
            .expect("rank missing from its own split group");

        let seq = self.split_seq.fetch_add(1, Ordering::Relaxed);
        let mut splits = self.shared.splits.lock();
        let pending = splits
            .entry((seq, color))
            .or_insert_with(|| SplitPending {
                shared: Arc::new(Shared::new(group_size)),
                taken: 0,
            });
        let shared = pending.shared.clone();
        pending.taken += 1;
        if pending.taken == group_size {
            splits.remove(&(seq, color));
        }
        drop(splits);

        Arc::new(ThreadComm {
            shared,
            rank: new_rank,
            split_seq: AtomicU64::new(0),
        })
    }

    fn broadcast(&self, root: usize, buf: &mut Vec<u8>) {
        let size = self.shared.size;
        assert!(root < size, "invalid broadcast root {root}");
        let rows = if self.rank == root {
            vec![buf.clone(); size]
        } else {
            vec![Vec::new(); size]
        };
        let recv = self.shared.exchange(self.rank, rows);
        *buf = recv.into_iter().nth(root).unwrap();
    }

    fn all_to_all_v(&self, sends: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        assert!(
            sends.len() == self.shared.size,
            "all_to_all_v row count must equal group size"
        );
        self.shared.exchange(self.rank, sends)
    }

    fn send_recv(&self, partner: usize, send: Vec<u8>) -> Vec<u8> {
        let size = self.shared.size;
        assert!(partner < size, "invalid partner rank {partner}");
        let mut rows = vec![Vec::new(); size];
        rows[partner] = send;
        let recv = self.shared.exchange(self.rank, rows);
        recv.into_iter().nth(partner).unwrap()
    }
}

/// Runs `f` as an SPMD program over `size` in-process ranks and returns every
/// rank's result, ordered by rank.
pub fn run_spmd<R: Send>(size: usize, f: impl Fn(CommRef) -> R + Sync) -> Vec<R> {
    let comms = ThreadComm::group(size);
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(size);
        for comm in comms {
            let f = &f;
            handles.push(scope.spawn(move || f(comm)));
        }
        handles
            .into_iter()
            .map(|h| h.join().expect("SPMD rank panicked"))
            .collect()
    })
}

// ---------------------------------------------------------------------------
// Typed helpers
// ---------------------------------------------------------------------------

fn to_bytes<T: bytemuck::Pod>(s: &[T]) -> Vec<u8> {
    bytemuck::cast_slice(s).to_vec()
}

fn from_bytes<T: bytemuck::Pod>(b: &[u8]) -> Vec<T> {
    bytemuck::allocation::pod_collect_to_vec(b)
}

/// Typed vector all-to-all.
pub fn all_to_all_v<T: bytemuck::Pod>(comm: &dyn Comm, sends: Vec<Vec<T>>) -> Vec<Vec<T>> {
    let bytes = sends.iter().map(|s| to_bytes(s)).collect();
    comm.all_to_all_v(bytes)
        .iter()
        .map(|b| from_bytes(b))
        .collect()
}

/// Typed all-gather: every rank receives every rank's payload, ordered by rank.
pub fn all_gather_v<T: bytemuck::Pod>(comm: &dyn Comm, send: &[T]) -> Vec<Vec<T>> {
    let bytes = to_bytes(send);
    let sends = vec![bytes; comm.size()];
    comm.all_to_all_v(sends).iter().map(|b| from_bytes(b)).collect()
}

/// Typed broadcast from `root`.
pub fn broadcast<T: bytemuck::Pod>(comm: &dyn Comm, root: usize, data: &mut Vec<T>) {
    let mut bytes = to_bytes(data);
    comm.broadcast(root, &mut bytes);
    *data = from_bytes(&bytes);
}

/// Typed pairwise exchange.
pub fn send_recv<T: bytemuck::Pod>(comm: &dyn Comm, partner: usize, send: &[T]) -> Vec<T> {
    from_bytes(&comm.send_recv(partner, to_bytes(send)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_partition_covers_everything() {
        for n in [0usize, 1, 5, 17, 64] {
            for p in [1usize, 2, 3, 4, 8] {
                let bs = row_blocksize(n, p);
                let mut total = 0;
                for rank in 0..p {
                    let (first, count) = local_row_range(n, p, rank);
                    for i in first..first + count {
                        assert_eq!(row_to_process(i, bs, p), rank);
                    }
                    total += count;
                }
                assert_eq!(total, n);
            }
        }
    }

    #[test]
    fn all_to_all_v_routes_rows() {
        let results = run_spmd(4, |comm| {
            let rank = comm.rank();
            let sends: Vec<Vec<usize>> = (0..4).map(|q| vec![rank * 10 + q]).collect();
            all_to_all_v(&*comm, sends)
        });
        for (rank, recv) in results.iter().enumerate() {
            for (q, payload) in recv.iter().enumerate() {
                assert_eq!(payload, &vec![q * 10 + rank]);
            }
        }
    }

    #[test]
    fn split_halves_and_renumbers() {
        run_spmd(4, |comm| {
            let color = comm.rank() / 2;
            let sub = comm.split(color, comm.rank());
            assert_eq!(sub.size(), 2);
            assert_eq!(sub.rank(), comm.rank() % 2);
            // The sub-groups must be independently usable.
            let gathered = all_gather_v(&*sub, &[comm.rank()]);
            let got: Vec<usize> = gathered.into_iter().flatten().collect();
            assert_eq!(got, vec![color * 2, color * 2 + 1]);
        });
    }

    #[test]
    fn send_recv_pairs_up() {
        run_spmd(4, |comm| {
            let partner = comm.rank() ^ 1;
            let got = send_recv(&*comm, partner, &[comm.rank() as u64]);
            assert_eq!(got, vec![partner as u64]);
        });
    }

    #[test]
    fn broadcast_replicates_root() {
        run_spmd(3, |comm| {
            let mut data: Vec<u64> = if comm.rank() == 1 { vec![7, 8, 9] } else { vec![] };
            broadcast(&*comm, 1, &mut data);
            assert_eq!(data, vec![7, 8, 9]);
        });
    }

    #[test]
    fn consecutive_collectives_do_not_interleave() {
        run_spmd(4, |comm| {
            for round in 0..50usize {
                let sends = vec![vec![round]; 4];
                let recv = all_to_all_v::<usize>(&*comm, sends);
                for r in recv {
                    assert_eq!(r, vec![round]);
                }
            }
        });
    }
}
