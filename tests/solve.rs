//! End-to-end factor / solve scenarios over the in-process SPMD runtime.

use multifrontal::{
    c64, comm, hermitian_solve, sparse_multiply, symmetric_solve, Conj, DistMultiVec,
    DistSparseMat, LdlMode, Options, Partition, Scalar,
};
use num_complex::Complex;

/// Deterministic pseudo-random value in [-0.5, 0.5), identical on every rank.
fn noise(i: usize, j: usize) -> f64 {
    let mut h = (i as u64).wrapping_mul(0x9e3779b97f4a7c15) ^ (j as u64).wrapping_mul(0xc2b2ae3d27d4eb4f);
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    (h % 1_000_000) as f64 / 1_000_000.0 - 0.5
}

fn laplacian_2d(n1: usize, n2: usize, c: comm::CommRef) -> DistSparseMat<f64> {
    let n = n1 * n2;
    let mut a = DistSparseMat::new(n, c);
    a.start_assembly();
    a.reserve(5 * a.local_height());
    for il in 0..a.local_height() {
        let i = a.first_local_row() + il;
        let (x, y) = (i % n1, i / n1);
        a.update(i, i, 4.0);
        if x != 0 {
            a.update(i, i - 1, -1.0);
        }
        if x != n1 - 1 {
            a.update(i, i + 1, -1.0);
        }
        if y != 0 {
            a.update(i, i - n1, -1.0);
        }
        if y != n2 - 1 {
            a.update(i, i + n1, -1.0);
        }
    }
    a.stop_assembly();
    a
}

fn helmholtz(dims: [usize; 3], omega: f64, damping: f64, c: comm::CommRef) -> DistSparseMat<c64> {
    let [n1, n2, n3] = dims;
    let n = n1 * n2 * n3;
    let mut a = DistSparseMat::new(n, c);
    let shift = {
        let w = Complex::new(omega, damping);
        w * w
    };
    let h1 = ((n1 + 1) * (n1 + 1)) as f64;
    let h2 = ((n2 + 1) * (n2 + 1)) as f64;
    let h3 = ((n3 + 1) * (n3 + 1)) as f64;
    let mut diag = c64::new(2.0 * h1 + 2.0 * h2 - shift.re, -shift.im);
    if n3 > 1 {
        diag += c64::new(2.0 * h3, 0.0);
    }
    a.start_assembly();
    a.reserve(7 * a.local_height());
    for il in 0..a.local_height() {
        let i = a.first_local_row() + il;
        let x = i % n1;
        let y = (i / n1) % n2;
        let z = i / (n1 * n2);
        a.update(i, i, diag);
        if x != 0 {
            a.update(i, i - 1, c64::new(-h1, 0.0));
        }
        if x != n1 - 1 {
            a.update(i, i + 1, c64::new(-h1, 0.0));
        }
        if y != 0 {
            a.update(i, i - n1, c64::new(-h2, 0.0));
        }
        if y != n2 - 1 {
            a.update(i, i + n1, c64::new(-h2, 0.0));
        }
        if n3 > 1 {
            if z != 0 {
                a.update(i, i - n1 * n2, c64::new(-h3, 0.0));
            }
            if z != n3 - 1 {
                a.update(i, i + n1 * n2, c64::new(-h3, 0.0));
            }
        }
    }
    a.stop_assembly();
    a
}

/// Solves with a deterministic right-hand side and returns the relative
/// residual together with this rank's solution slice.
fn solve_and_residual<S: Scalar>(
    a: &DistSparseMat<S>,
    opts: &Options,
    conj: Conj,
    width: usize,
    rhs: impl Fn(usize, usize) -> S,
) -> (S::Real, Vec<S>) {
    let comm = a.comm().clone();
    let n = a.height();
    let b = DistMultiVec::from_fn(n, width, comm.clone(), &rhs);
    let mut x = DistMultiVec::from_fn(n, width, comm.clone(), &rhs);
    match conj {
        Conj::No => symmetric_solve(a, &mut x, opts).unwrap(),
        Conj::Yes => hermitian_solve(a, &mut x, opts).unwrap(),
    }
    let mut r = DistMultiVec::zeros(n, width, comm);
    sparse_multiply(S::one(), a, &x, S::zero(), &mut r);
    r.axpy(-S::one(), &b);
    let rel = r.norm() / b.norm();
    (rel, x.local().data().to_vec())
}

#[test]
fn laplace_2d_matches_across_process_counts() {
    let opts = Options {
        cutoff: 16,
        ..Options::default()
    };
    let baseline = comm::run_spmd(1, |c| {
        let a = laplacian_2d(16, 16, c);
        solve_and_residual(&a, &opts, Conj::No, 2, |i, j| noise(i, j))
    })
    .pop()
    .unwrap();
    assert!(baseline.0 < 1e-10, "sequential residual {}", baseline.0);

    let pieces = comm::run_spmd(4, |c| {
        let a = laplacian_2d(16, 16, c);
        solve_and_residual(&a, &opts, Conj::No, 2, |i, j| noise(i, j))
    });
    let mut merged: Vec<f64> = Vec::new();
    // Local storage is column-major per rank; reassemble column-major global.
    for j in 0..2 {
        for piece in &pieces {
            let rows = piece.1.len() / 2;
            merged.extend_from_slice(&piece.1[j * rows..(j + 1) * rows]);
        }
    }
    for (p, rel) in pieces.iter().map(|p| p.0).enumerate() {
        assert!(rel < 1e-10, "rank {p} residual {rel}");
    }
    for (a, b) in merged.iter().zip(baseline.1.iter()) {
        assert!((a - b).abs() < 1e-8, "solutions diverged across process counts");
    }
}

#[test]
fn helmholtz_2d_block_ldl() {
    let opts = Options {
        cutoff: 32,
        block_ldl: LdlMode::BlockLdl,
        ..Options::default()
    };
    for p in [1usize, 4] {
        let rels = comm::run_spmd(p, |c| {
            let a = helmholtz([30, 30, 1], 18.0, 7.0, c);
            solve_and_residual(&a, &opts, Conj::No, 1, |i, j| {
                c64::new(noise(i, j), noise(i + 1, j))
            })
            .0
        });
        for rel in rels {
            assert!(rel < 1e-10, "p = {p}, residual {rel}");
        }
    }
}

#[test]
fn helmholtz_2d_with_intra_front_pivoting() {
    let opts = Options {
        cutoff: 24,
        block_ldl: LdlMode::BlockLdlIntraPiv,
        ..Options::default()
    };
    let rels = comm::run_spmd(4, |c| {
        let a = helmholtz([30, 30, 1], 18.0, 7.0, c);
        solve_and_residual(&a, &opts, Conj::No, 2, |i, j| {
            c64::new(noise(i, j), noise(i + 7, j))
        })
        .0
    });
    for rel in rels {
        assert!(rel < 1e-10, "residual {rel}");
    }
}

#[test]
fn helmholtz_3d_block_ldl() {
    let opts = Options {
        cutoff: 64,
        block_ldl: LdlMode::BlockLdl,
        ..Options::default()
    };
    let rels = comm::run_spmd(4, |c| {
        let a = helmholtz([12, 12, 12], 18.0, 7.0, c);
        solve_and_residual(&a, &opts, Conj::No, 1, |i, j| {
            c64::new(noise(i, j), noise(i + 3, j))
        })
        .0
    });
    for rel in rels {
        assert!(rel < 1e-8, "residual {rel}");
    }
}

#[test]
#[ignore = "large: 27000 unknowns"]
fn helmholtz_3d_30_cubed() {
    let opts = Options {
        cutoff: 128,
        block_ldl: LdlMode::BlockLdl,
        partition: Partition::Grid { dims: [30, 30, 30] },
        ..Options::default()
    };
    let rels = comm::run_spmd(4, |c| {
        let a = helmholtz([30, 30, 30], 18.0, 7.0, c);
        solve_and_residual(&a, &opts, Conj::No, 1, |i, j| {
            c64::new(noise(i, j), noise(i + 3, j))
        })
        .0
    });
    for rel in rels {
        assert!(rel < 1e-8, "residual {rel}");
    }
}

#[test]
fn grid_partition_mode_solves_too() {
    let opts = Options {
        cutoff: 32,
        partition: Partition::Grid { dims: [16, 16, 1] },
        ..Options::default()
    };
    let rels = comm::run_spmd(4, |c| {
        let a = laplacian_2d(16, 16, c);
        solve_and_residual(&a, &opts, Conj::No, 1, |i, j| noise(i, j)).0
    });
    for rel in rels {
        assert!(rel < 1e-10, "residual {rel}");
    }
}

#[test]
fn hermitian_dense_shifted_gram_matrix() {
    // A = Z^H Z + alpha I for a deterministic complex Z is Hermitian
    // positive definite; assemble it as a (dense) sparse matrix and solve.
    let n = 40;
    let rels = comm::run_spmd(2, |c| {
        let z: Vec<c64> = (0..n * n)
            .map(|k| c64::new(noise(k, 0), noise(k, 1)))
            .collect();
        let mut a = DistSparseMat::<c64>::new(n, c.clone());
        a.start_assembly();
        for il in 0..a.local_height() {
            let i = a.first_local_row() + il;
            for j in 0..n {
                // (Z^H Z)[i][j] = sum_k conj(z[k][i]) z[k][j], column-major z.
                let mut v = c64::zero();
                for k in 0..n {
                    v += z[k + i * n].conj() * z[k + j * n];
                }
                if i == j {
                    v += c64::new(2.0, 0.0);
                }
                a.update(i, j, v);
            }
        }
        a.stop_assembly();
        let opts = Options {
            cutoff: 8,
            ..Options::default()
        };
        solve_and_residual(&a, &opts, Conj::Yes, 1, |i, j| {
            c64::new(noise(i, j), noise(i + 9, j))
        })
        .0
    });
    for rel in rels {
        assert!(rel < 1e-9, "residual {rel}");
    }
}

#[test]
fn symmetric_and_hermitian_agree_bitwise_on_reals() {
    use assert2::assert;
    let opts = Options {
        cutoff: 16,
        ..Options::default()
    };
    let outs = comm::run_spmd(4, |c| {
        let a = laplacian_2d(12, 12, c.clone());
        let mut xs = DistMultiVec::from_fn(144, 1, c.clone(), |i, j| noise(i, j));
        symmetric_solve(&a, &mut xs, &opts).unwrap();
        let mut xh = DistMultiVec::from_fn(144, 1, c, |i, j| noise(i, j));
        hermitian_solve(&a, &mut xh, &opts).unwrap();
        (xs.local().data().to_vec(), xh.local().data().to_vec())
    });
    for (s, h) in outs {
        assert!(s == h);
    }
}

#[test]
fn repeated_solves_match_fresh_factorizations() {
    let opts = Options {
        cutoff: 16,
        ..Options::default()
    };
    let outs = comm::run_spmd(4, |c| {
        let a = laplacian_2d(14, 14, c.clone());
        let n = 14 * 14;
        let f = multifrontal::factorize(&a, Conj::No, &opts).unwrap();

        let mut x1 = DistMultiVec::from_fn(n, 1, c.clone(), |i, j| noise(i, j));
        f.solve(&mut x1);
        let mut x2 = DistMultiVec::from_fn(n, 1, c.clone(), |i, j| noise(i + 100, j));
        f.solve(&mut x2);

        let mut y1 = DistMultiVec::from_fn(n, 1, c.clone(), |i, j| noise(i, j));
        symmetric_solve(&a, &mut y1, &opts).unwrap();
        let mut y2 = DistMultiVec::from_fn(n, 1, c, |i, j| noise(i + 100, j));
        symmetric_solve(&a, &mut y2, &opts).unwrap();

        (
            x1.local().data().to_vec(),
            x2.local().data().to_vec(),
            y1.local().data().to_vec(),
            y2.local().data().to_vec(),
        )
    });
    for (x1, x2, y1, y2) in outs {
        assert_eq!(x1, y1);
        assert_eq!(x2, y2);
    }
}

#[test]
fn single_triangle_input_matches_full_storage() {
    // Providing only the lower triangle must factor identically to full
    // symmetric storage.
    let opts = Options {
        cutoff: 16,
        ..Options::default()
    };
    let outs = comm::run_spmd(2, |c| {
        let n1 = 12;
        let n = n1 * n1;
        let full = laplacian_2d(n1, n1, c.clone());
        let mut lower = DistSparseMat::<f64>::new(n, c.clone());
        lower.start_assembly();
        for il in 0..lower.local_height() {
            let i = lower.first_local_row() + il;
            let (x, y) = (i % n1, i / n1);
            lower.update(i, i, 4.0);
            if x != 0 {
                lower.update(i, i - 1, -1.0);
            }
            if y != 0 {
                lower.update(i, i - n1, -1.0);
            }
        }
        lower.stop_assembly();

        let mut xf = DistMultiVec::from_fn(n, 1, c.clone(), |i, j| noise(i, j));
        symmetric_solve(&full, &mut xf, &opts).unwrap();
        let mut xl = DistMultiVec::from_fn(n, 1, c, |i, j| noise(i, j));
        symmetric_solve(&lower, &mut xl, &opts).unwrap();
        (xf.local().data().to_vec(), xl.local().data().to_vec())
    });
    for (f, l) in outs {
        for (a, b) in f.iter().zip(l.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }
}

#[test]
fn vector_entry_points_match_multivector() {
    let opts = Options {
        cutoff: 16,
        ..Options::default()
    };
    comm::run_spmd(2, |c| {
        let a = laplacian_2d(10, 10, c.clone());
        let mut xv = multifrontal::DistVec::from_fn(100, c.clone(), |i| noise(i, 0));
        multifrontal::symmetric_solve_vec(&a, &mut xv, &opts).unwrap();
        let mut xm = DistMultiVec::from_fn(100, 1, c, |i, j| noise(i, j));
        symmetric_solve(&a, &mut xm, &opts).unwrap();
        for i in 0..xm.local_height() {
            assert_eq!(xv.get_local(i), xm.local()[(i, 0)]);
        }
    });
}
