//! Solves a damped 3-D Helmholtz problem on an n x n x n grid with the
//! analytic middle-plane ordering and reports the residual.
//!
//! Usage: helmholtz_3d [ranks] [n] [omega] [damping] [cutoff]

use multifrontal::{
    c64, comm, sparse_multiply, symmetric_solve, DistMultiVec, DistSparseMat, LdlMode, Options,
    Partition, Scalar,
};
use num_complex::Complex;

fn helmholtz_3d(n: usize, omega: f64, damping: f64, c: comm::CommRef) -> DistSparseMat<c64> {
    let total = n * n * n;
    let mut a = DistSparseMat::new(total, c);
    let shift = {
        let w = Complex::new(omega, damping);
        w * w
    };
    let h = ((n + 1) * (n + 1)) as f64;
    let diag = c64::new(6.0 * h - shift.re, -shift.im);
    a.start_assembly();
    a.reserve(7 * a.local_height());
    for il in 0..a.local_height() {
        let i = a.first_local_row() + il;
        let x = i % n;
        let y = (i / n) % n;
        let z = i / (n * n);
        a.update(i, i, diag);
        if x != 0 {
            a.update(i, i - 1, c64::new(-h, 0.0));
        }
        if x != n - 1 {
            a.update(i, i + 1, c64::new(-h, 0.0));
        }
        if y != 0 {
            a.update(i, i - n, c64::new(-h, 0.0));
        }
        if y != n - 1 {
            a.update(i, i + n, c64::new(-h, 0.0));
        }
        if z != 0 {
            a.update(i, i - n * n, c64::new(-h, 0.0));
        }
        if z != n - 1 {
            a.update(i, i + n * n, c64::new(-h, 0.0));
        }
    }
    a.stop_assembly();
    a
}

fn noise(i: usize, salt: usize) -> f64 {
    let mut h = (i as u64).wrapping_mul(0x9e3779b97f4a7c15) ^ (salt as u64).wrapping_mul(0xc2b2ae3d27d4eb4f);
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    (h % 1_000_000) as f64 / 1_000_000.0 - 0.5
}

fn main() {
    env_logger::init();
    multifrontal::initialize();
    let args: Vec<String> = std::env::args().collect();
    let arg = |k: usize, default: f64| -> f64 {
        args.get(k).and_then(|s| s.parse().ok()).unwrap_or(default)
    };
    let ranks = arg(1, 4.0) as usize;
    let n = arg(2, 30.0) as usize;
    let omega = arg(3, 18.0);
    let damping = arg(4, 7.0);
    let cutoff = arg(5, 128.0) as usize;

    let opts = Options {
        cutoff,
        block_ldl: LdlMode::BlockLdl,
        partition: Partition::Grid { dims: [n, n, n] },
        ..Options::default()
    };
    let reports = comm::run_spmd(ranks, |c| {
        let total = n * n * n;
        let a = helmholtz_3d(n, omega, damping, c.clone());
        let b = DistMultiVec::from_fn(total, 1, c.clone(), |i, _| c64::new(noise(i, 0), noise(i, 1)));
        let mut x =
            DistMultiVec::from_fn(total, 1, c.clone(), |i, _| c64::new(noise(i, 0), noise(i, 1)));
        let t0 = std::time::Instant::now();
        symmetric_solve(&a, &mut x, &opts).unwrap();
        let elapsed = t0.elapsed();
        let mut r = DistMultiVec::zeros(total, 1, c);
        sparse_multiply(c64::one(), &a, &x, c64::zero(), &mut r);
        r.axpy(-c64::one(), &b);
        (r.norm() / b.norm(), elapsed)
    });
    let (rel, elapsed) = &reports[0];
    println!("n = {n}^3, ranks = {ranks}");
    println!("relative residual = {rel:.3e}");
    println!("factor + solve    = {elapsed:?}");
    multifrontal::finalize();
}
