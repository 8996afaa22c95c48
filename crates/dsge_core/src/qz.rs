use nalgebra::DMatrix;
use num_complex::Complex;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SolveError};

type C64 = Complex<f64>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QzSettings {
    /// Total sweep budget is this figure times the pencil dimension.
    pub sweeps_per_eigenvalue: usize,
    /// Relative threshold for declaring a subdiagonal entry converged.
    pub deflation_tolerance: f64,
}

impl Default for QzSettings {
    fn default() -> Self {
        Self {
            sweeps_per_eigenvalue: 30,
            deflation_tolerance: f64::EPSILON,
        }
    }
}

/// Generalized eigenvalue of the pencil `(a, b)`, stored as the pair
/// `(alpha, beta)` with `lambda = beta / alpha`. A zero `alpha` encodes an
/// infinite eigenvalue without dividing by zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeneralizedEigenvalue {
    pub alpha: C64,
    pub beta: C64,
}

impl GeneralizedEigenvalue {
    /// `|beta| / |alpha|`, or infinity when `alpha` vanishes.
    pub fn modulus(&self) -> f64 {
        let a = self.alpha.norm();
        if a == 0.0 {
            f64::INFINITY
        } else {
            self.beta.norm() / a
        }
    }

    /// Strictly inside the unit circle. Infinite eigenvalues are unstable.
    pub fn is_stable(&self) -> bool {
        self.beta.norm() < self.alpha.norm()
    }

    /// Within `tolerance` of the unit circle, relative to `|alpha|`.
    pub fn near_unit(&self, tolerance: f64) -> bool {
        let a = self.alpha.norm();
        (self.beta.norm() - a).abs() < tolerance * a
    }
}

/// Complex QZ decomposition `q * a * z = s`, `q * b * z = t` with `q`, `z`
/// unitary and `s`, `t` upper triangular. Eigenvalues are read off the
/// diagonals as `t[(k, k)] / s[(k, k)]` and are sorted by ascending modulus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QzDecomposition {
    pub s: DMatrix<C64>,
    pub t: DMatrix<C64>,
    pub q: DMatrix<C64>,
    pub z: DMatrix<C64>,
    pub eigenvalues: Vec<GeneralizedEigenvalue>,
}

/// Factors the real pencil `(a, b)` into complex Schur form with eigenvalues
/// ordered by ascending modulus.
///
/// A singular `b` is handled by running the iteration on the shifted pencil
/// `(a, b + d * a)` for a small set of candidate `d` and undoing the shift
/// afterwards; the substitution moves every eigenvalue by exactly `d` and
/// leaves the Schur vectors untouched. When no candidate yields a nonsingular
/// combination the pencil itself is singular and
/// [`SolveError::NonInvertible`] is returned. Exceeding the sweep budget
/// surfaces as [`SolveError::SchurNoConvergence`].
pub fn decompose(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    settings: &QzSettings,
) -> Result<QzDecomposition> {
    let n = a.nrows();
    if a.ncols() != n || b.nrows() != n || b.ncols() != n {
        return Err(SolveError::Precondition {
            reason: "pencil matrices must be square and of equal dimension",
        });
    }
    if n == 0 {
        return Err(SolveError::Precondition {
            reason: "pencil matrices must be nonempty",
        });
    }
    if !a.iter().all(|v| v.is_finite()) || !b.iter().all(|v| v.is_finite()) {
        return Err(SolveError::Precondition {
            reason: "pencil matrices must be finite",
        });
    }

    let ac = a.map(|v| C64::new(v, 0.0));
    let bc = b.map(|v| C64::new(v, 0.0));

    let a_scale = a.norm();
    let ratio = if a_scale == 0.0 { 1.0 } else { b.norm() / a_scale };
    // A zero b would put every candidate at zero; any nonzero scale works.
    let sigma = if ratio == 0.0 { 1.0 } else { ratio };
    let candidates = [
        0.0,
        sigma,
        -sigma,
        sigma / 3.0,
        -sigma / 3.0,
        3.0 * sigma,
        -3.0 * sigma,
        7.0 * sigma,
    ];

    let mut stalled_sweeps = None;
    for &d in &candidates {
        let bt = &bc + &ac * C64::new(d, 0.0);
        if singular_value_ratio(&bt) <= 1e-12 {
            continue;
        }

        let mut s = ac.clone();
        let mut t = bt;
        let mut q = DMatrix::<C64>::identity(n, n);
        let mut z = DMatrix::<C64>::identity(n, n);
        match reduce_and_iterate(&mut s, &mut t, &mut q, &mut z, settings) {
            Ok(()) => {
                // q * (bt - d * a) * z recovers the unshifted triangular t.
                let shift = C64::new(d, 0.0);
                for i in 0..n {
                    for j in i..n {
                        t[(i, j)] -= shift * s[(i, j)];
                    }
                }
                sort_ascending(&mut s, &mut t, &mut q, &mut z);

                let s_tiny = 1e-10 * (1.0 + s.norm());
                let t_tiny = 1e-10 * (1.0 + t.norm());
                let mut eigenvalues = Vec::with_capacity(n);
                for k in 0..n {
                    let alpha = s[(k, k)];
                    let beta = t[(k, k)];
                    if alpha.norm() <= s_tiny && beta.norm() <= t_tiny {
                        return Err(SolveError::NonInvertible {
                            what: "matrix pencil",
                        });
                    }
                    eigenvalues.push(GeneralizedEigenvalue { alpha, beta });
                }
                return Ok(QzDecomposition {
                    s,
                    t,
                    q,
                    z,
                    eigenvalues,
                });
            }
            Err(IterationFailure::Degenerate) => continue,
            Err(IterationFailure::NoConvergence { sweeps }) => {
                stalled_sweeps = Some(sweeps);
            }
        }
    }

    match stalled_sweeps {
        Some(sweeps) => Err(SolveError::SchurNoConvergence { sweeps }),
        None => Err(SolveError::NonInvertible {
            what: "matrix pencil",
        }),
    }
}

enum IterationFailure {
    /// A diagonal entry of the shifted `t` collapsed mid-iteration.
    Degenerate,
    NoConvergence { sweeps: usize },
}

/// Unitary row operation. Applied to rows `p`, `q` it maps
/// `row_p = c * row_p + s * row_q` and `row_q = c * row_q - conj(s) * row_p`;
/// applied to columns the roles of `s` and `conj(s)` swap.
#[derive(Clone, Copy)]
struct Rotation {
    c: f64,
    s: C64,
}

/// Rotation that annihilates `g` when applied to the rows holding `(f, g)`.
fn givens_left(f: C64, g: C64) -> Rotation {
    let gn = g.norm();
    if gn == 0.0 {
        return Rotation {
            c: 1.0,
            s: C64::zero(),
        };
    }
    let fn_ = f.norm();
    if fn_ == 0.0 {
        return Rotation {
            c: 0.0,
            s: g.conj() / gn,
        };
    }
    let h = fn_.hypot(gn);
    Rotation {
        c: fn_ / h,
        s: f * g.conj() / (fn_ * h),
    }
}

/// Rotation that annihilates `g` when applied to the columns holding `(f, g)`.
fn givens_right(f: C64, g: C64) -> Rotation {
    let gn = g.norm();
    if gn == 0.0 {
        return Rotation {
            c: 1.0,
            s: C64::zero(),
        };
    }
    let fn_ = f.norm();
    if fn_ == 0.0 {
        return Rotation {
            c: 0.0,
            s: g / gn,
        };
    }
    let h = fn_.hypot(gn);
    Rotation {
        c: fn_ / h,
        s: f.conj() * g / (fn_ * h),
    }
}

fn rotate_rows(m: &mut DMatrix<C64>, p: usize, q: usize, rot: Rotation) {
    for j in 0..m.ncols() {
        let a = m[(p, j)];
        let b = m[(q, j)];
        m[(p, j)] = a * rot.c + b * rot.s;
        m[(q, j)] = b * rot.c - a * rot.s.conj();
    }
}

fn rotate_cols(m: &mut DMatrix<C64>, p: usize, q: usize, rot: Rotation) {
    for i in 0..m.nrows() {
        let a = m[(i, p)];
        let b = m[(i, q)];
        m[(i, p)] = a * rot.c + b * rot.s.conj();
        m[(i, q)] = b * rot.c - a * rot.s;
    }
}

/// Reduces `(s, t)` to generalized Schur form in place, accumulating the
/// transformations into `q` and `z` so that `q * s_in * z = s_out` holds
/// throughout.
fn reduce_and_iterate(
    s: &mut DMatrix<C64>,
    t: &mut DMatrix<C64>,
    q: &mut DMatrix<C64>,
    z: &mut DMatrix<C64>,
    settings: &QzSettings,
) -> std::result::Result<(), IterationFailure> {
    let n = s.nrows();
    let s_scale = s.norm();
    let t_scale = t.norm();
    if t_scale == 0.0 {
        return Err(IterationFailure::Degenerate);
    }

    // Triangularize t with row rotations.
    for j in 0..n {
        for i in ((j + 1)..n).rev() {
            let rot = givens_left(t[(i - 1, j)], t[(i, j)]);
            rotate_rows(t, i - 1, i, rot);
            rotate_rows(s, i - 1, i, rot);
            rotate_rows(q, i - 1, i, rot);
            t[(i, j)] = C64::zero();
        }
    }

    // Reduce s to upper Hessenberg while keeping t triangular. Each row
    // rotation fills one t subdiagonal entry, restored by a column rotation
    // that only mixes columns the current pass has not reduced yet.
    for j in 0..n.saturating_sub(2) {
        for i in ((j + 2)..n).rev() {
            let rot = givens_left(s[(i - 1, j)], s[(i, j)]);
            rotate_rows(s, i - 1, i, rot);
            rotate_rows(t, i - 1, i, rot);
            rotate_rows(q, i - 1, i, rot);
            s[(i, j)] = C64::zero();

            let rot = givens_right(t[(i, i)], t[(i, i - 1)]);
            rotate_cols(t, i, i - 1, rot);
            rotate_cols(s, i, i - 1, rot);
            rotate_cols(z, i, i - 1, rot);
            t[(i, i - 1)] = C64::zero();
        }
    }

    let budget = settings.sweeps_per_eigenvalue * n;
    let tol = settings.deflation_tolerance;
    let mut sweeps = 0usize;
    let mut hi = n - 1;
    let mut window = (usize::MAX, usize::MAX);
    let mut stagnant = 0usize;

    loop {
        for i in 1..=hi {
            let neighbors = s[(i - 1, i - 1)].norm() + s[(i, i)].norm();
            let threshold = if neighbors > 0.0 {
                tol * neighbors
            } else {
                tol * s_scale
            };
            if s[(i, i - 1)].norm() <= threshold {
                s[(i, i - 1)] = C64::zero();
            }
        }
        while hi > 0 && s[(hi, hi - 1)].norm() == 0.0 {
            hi -= 1;
        }
        if hi == 0 {
            return Ok(());
        }
        let mut lo = hi;
        while lo > 0 && s[(lo, lo - 1)].norm() != 0.0 {
            lo -= 1;
        }

        for k in lo..=hi {
            if t[(k, k)].norm() <= tol * t_scale {
                return Err(IterationFailure::Degenerate);
            }
        }
        if sweeps >= budget {
            return Err(IterationFailure::NoConvergence { sweeps });
        }

        if window == (lo, hi) {
            stagnant += 1;
        } else {
            window = (lo, hi);
            stagnant = 0;
        }
        let shift = if stagnant > 0 && stagnant % 10 == 0 {
            (s[(hi, hi)] + s[(hi, hi - 1)] * 0.75) / t[(hi, hi)]
        } else {
            wilkinson_shift(s, t, hi)
        };

        single_shift_sweep(s, t, q, z, lo, hi, shift);
        sweeps += 1;
    }
}

/// Root of the trailing 2x2 pencil `det(s2 - shift * t2) = 0` closest to the
/// bottom-corner Rayleigh quotient.
fn wilkinson_shift(s: &DMatrix<C64>, t: &DMatrix<C64>, hi: usize) -> C64 {
    let s11 = s[(hi - 1, hi - 1)];
    let s12 = s[(hi - 1, hi)];
    let s21 = s[(hi, hi - 1)];
    let s22 = s[(hi, hi)];
    let t11 = t[(hi - 1, hi - 1)];
    let t12 = t[(hi - 1, hi)];
    let t22 = t[(hi, hi)];

    let a2 = t11 * t22;
    let a1 = -(s11 * t22 + s22 * t11) + t12 * s21;
    let a0 = s11 * s22 - s12 * s21;

    let disc = (a1 * a1 - a2 * a0 * 4.0).sqrt();
    let q_plus = (-a1 + disc) * 0.5;
    let q_minus = (-a1 - disc) * 0.5;
    let q_big = if q_plus.norm() >= q_minus.norm() {
        q_plus
    } else {
        q_minus
    };
    if q_big.norm() == 0.0 {
        return C64::zero();
    }

    let r1 = q_big / a2;
    let r2 = a0 / q_big;
    let target = s22 / t22;
    if (r1 - target).norm() <= (r2 - target).norm() {
        r1
    } else {
        r2
    }
}

/// One implicit single-shift QZ sweep on the window `lo..=hi`. The bulge is
/// created at the top row and chased off the bottom, alternating row
/// rotations on `s` with column rotations that keep `t` triangular.
fn single_shift_sweep(
    s: &mut DMatrix<C64>,
    t: &mut DMatrix<C64>,
    q: &mut DMatrix<C64>,
    z: &mut DMatrix<C64>,
    lo: usize,
    hi: usize,
    shift: C64,
) {
    let rot = givens_left(s[(lo, lo)] - shift * t[(lo, lo)], s[(lo + 1, lo)]);
    rotate_rows(s, lo, lo + 1, rot);
    rotate_rows(t, lo, lo + 1, rot);
    rotate_rows(q, lo, lo + 1, rot);

    for k in lo..hi {
        let rot = givens_right(t[(k + 1, k + 1)], t[(k + 1, k)]);
        rotate_cols(t, k + 1, k, rot);
        rotate_cols(s, k + 1, k, rot);
        rotate_cols(z, k + 1, k, rot);
        t[(k + 1, k)] = C64::zero();

        if k + 2 <= hi {
            let rot = givens_left(s[(k + 1, k)], s[(k + 2, k)]);
            rotate_rows(s, k + 1, k + 2, rot);
            rotate_rows(t, k + 1, k + 2, rot);
            rotate_rows(q, k + 1, k + 2, rot);
            s[(k + 2, k)] = C64::zero();
        }
    }
}

/// Bubble-sorts the diagonal pairs into ascending `|t_kk / s_kk|` using
/// cross-multiplied moduli, so infinite eigenvalues order last without any
/// division.
fn sort_ascending(
    s: &mut DMatrix<C64>,
    t: &mut DMatrix<C64>,
    q: &mut DMatrix<C64>,
    z: &mut DMatrix<C64>,
) {
    let n = s.nrows();
    if n < 2 {
        return;
    }
    loop {
        let mut swapped = false;
        for p in 0..n - 1 {
            let lhs = t[(p, p)].norm() * s[(p + 1, p + 1)].norm();
            let rhs = t[(p + 1, p + 1)].norm() * s[(p, p)].norm();
            if lhs > rhs && swap_adjacent(s, t, q, z, p) {
                swapped = true;
            }
        }
        if !swapped {
            break;
        }
    }
}

/// Exchanges the diagonal pairs at positions `p` and `p + 1` of a triangular
/// pencil with one column and one row rotation. Returns false when the pairs
/// are too close to separate.
fn swap_adjacent(
    s: &mut DMatrix<C64>,
    t: &mut DMatrix<C64>,
    q: &mut DMatrix<C64>,
    z: &mut DMatrix<C64>,
    p: usize,
) -> bool {
    let x = s[(p, p)] * t[(p + 1, p + 1)] - s[(p + 1, p + 1)] * t[(p, p)];
    let y = s[(p, p + 1)] * t[(p + 1, p + 1)] - s[(p + 1, p + 1)] * t[(p, p + 1)];
    let xn = x.norm();
    let yn = y.norm();
    let r = xn.hypot(yn);
    if r == 0.0 {
        return false;
    }

    let rot = if yn == 0.0 {
        Rotation {
            c: 0.0,
            s: -x.conj() / xn,
        }
    } else {
        Rotation {
            c: yn / r,
            s: -x.conj() * y / (yn * r),
        }
    };
    rotate_cols(s, p, p + 1, rot);
    rotate_cols(t, p, p + 1, rot);
    rotate_cols(z, p, p + 1, rot);

    let rot = givens_left(t[(p, p)], t[(p + 1, p)]);
    rotate_rows(t, p, p + 1, rot);
    rotate_rows(s, p, p + 1, rot);
    rotate_rows(q, p, p + 1, rot);
    s[(p + 1, p)] = C64::zero();
    t[(p + 1, p)] = C64::zero();
    true
}

/// Back-substitution solve of `u * x = rhs` for upper triangular `u`.
/// Returns `None` on a zero diagonal entry.
pub(crate) fn solve_upper(u: &DMatrix<C64>, rhs: &DMatrix<C64>) -> Option<DMatrix<C64>> {
    let n = u.nrows();
    let mut x = rhs.clone_owned();
    for col in 0..x.ncols() {
        for i in (0..n).rev() {
            let mut acc = x[(i, col)];
            for k in (i + 1)..n {
                acc -= u[(i, k)] * x[(k, col)];
            }
            let d = u[(i, i)];
            if d.norm() == 0.0 {
                return None;
            }
            x[(i, col)] = acc / d;
        }
    }
    Some(x)
}

/// Smallest over largest singular value, zero for the zero matrix.
pub(crate) fn singular_value_ratio(m: &DMatrix<C64>) -> f64 {
    let svd = m.clone().svd(false, false);
    let (mut smallest, mut largest) = (f64::INFINITY, 0.0f64);
    for &value in svd.singular_values.iter() {
        smallest = smallest.min(value);
        largest = largest.max(value);
    }
    if largest == 0.0 {
        0.0
    } else {
        smallest / largest
    }
}

#[cfg(test)]
mod tests {
    use super::{decompose, GeneralizedEigenvalue, QzDecomposition, QzSettings};
    use crate::error::SolveError;
    use nalgebra::DMatrix;
    use num_complex::Complex;

    fn promote(m: &DMatrix<f64>) -> DMatrix<Complex<f64>> {
        m.map(|v| Complex::new(v, 0.0))
    }

    fn assert_schur_invariants(a: &DMatrix<f64>, b: &DMatrix<f64>, out: &QzDecomposition) {
        let n = a.nrows();
        let scale = a.norm().max(b.norm()).max(1.0);

        let sa = &out.q * promote(a) * &out.z;
        let sb = &out.q * promote(b) * &out.z;
        assert!((&sa - &out.s).norm() <= 1e-10 * scale, "a reconstruction");
        assert!((&sb - &out.t).norm() <= 1e-10 * scale, "b reconstruction");

        let eye = DMatrix::<Complex<f64>>::identity(n, n);
        assert!((&out.q * out.q.adjoint() - &eye).norm() <= 1e-12 * n as f64);
        assert!((&out.z * out.z.adjoint() - &eye).norm() <= 1e-12 * n as f64);

        for i in 0..n {
            for j in 0..i {
                assert!(out.s[(i, j)].norm() <= 1e-10 * scale, "s triangular");
                assert!(out.t[(i, j)].norm() <= 1e-10 * scale, "t triangular");
            }
        }
        for k in 0..n - 1 {
            let lhs = out.eigenvalues[k].beta.norm() * out.eigenvalues[k + 1].alpha.norm();
            let rhs = out.eigenvalues[k + 1].beta.norm() * out.eigenvalues[k].alpha.norm();
            assert!(lhs <= rhs + 1e-9 * scale * scale, "ascending at {k}");
        }
    }

    fn sorted_moduli(out: &QzDecomposition) -> Vec<f64> {
        out.eigenvalues.iter().map(|e| e.modulus()).collect()
    }

    #[test]
    fn general_pencil_satisfies_the_schur_invariants() {
        let a = DMatrix::from_row_slice(
            4,
            4,
            &[
                2.0, 1.0, 0.0, 0.3, 1.0, 3.0, 1.0, 0.0, 0.0, 1.0, 4.0, 1.0, 0.2, 0.0, 1.0, 5.0,
            ],
        );
        let b = DMatrix::from_row_slice(
            4,
            4,
            &[
                1.0, 0.5, 0.0, 0.2, 0.0, 1.5, 0.3, 0.0, 0.4, 0.0, 2.5, 0.1, 0.0, 0.2, 0.0, 3.5,
            ],
        );
        let out = decompose(&a, &b, &QzSettings::default()).expect("decomposes");
        assert_schur_invariants(&a, &b, &out);
    }

    #[test]
    fn triangular_input_reorders_to_ascending_moduli() {
        let a = DMatrix::identity(3, 3);
        let b = DMatrix::from_row_slice(3, 3, &[2.0, 0.1, 0.0, 0.0, 0.5, 0.2, 0.0, 0.0, 0.3]);
        let out = decompose(&a, &b, &QzSettings::default()).expect("decomposes");
        assert_schur_invariants(&a, &b, &out);

        let moduli = sorted_moduli(&out);
        assert!((moduli[0] - 0.3).abs() < 1e-10);
        assert!((moduli[1] - 0.5).abs() < 1e-10);
        assert!((moduli[2] - 2.0).abs() < 1e-10);
    }

    #[test]
    fn two_by_two_eigenvalues_match_the_characteristic_roots() {
        let a = DMatrix::identity(2, 2);
        let b = DMatrix::from_row_slice(2, 2, &[0.5, 0.4, 0.3, 0.6]);
        let out = decompose(&a, &b, &QzSettings::default()).expect("decomposes");
        assert_schur_invariants(&a, &b, &out);

        let moduli = sorted_moduli(&out);
        assert!((moduli[0] - 0.2).abs() < 1e-8, "got {}", moduli[0]);
        assert!((moduli[1] - 0.9).abs() < 1e-8, "got {}", moduli[1]);
    }

    #[test]
    fn rotation_pencil_yields_a_conjugate_pair() {
        let theta = std::f64::consts::FRAC_PI_4;
        let a = DMatrix::identity(2, 2);
        let b = DMatrix::from_row_slice(
            2,
            2,
            &[
                0.5 * theta.cos(),
                -0.5 * theta.sin(),
                0.5 * theta.sin(),
                0.5 * theta.cos(),
            ],
        );
        let out = decompose(&a, &b, &QzSettings::default()).expect("decomposes");
        assert_schur_invariants(&a, &b, &out);

        let lambda: Vec<Complex<f64>> = out
            .eigenvalues
            .iter()
            .map(|e| e.beta / e.alpha)
            .collect();
        assert!((lambda[0].norm() - 0.5).abs() < 1e-8);
        assert!((lambda[1].norm() - 0.5).abs() < 1e-8);
        assert!((lambda[0].im + lambda[1].im).abs() < 1e-8, "conjugate pair");
        assert!(lambda[0].im.abs() > 0.3, "genuinely complex");
    }

    #[test]
    fn rank_deficient_forward_matrix_reports_an_infinite_eigenvalue() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 0.0]);
        let b = DMatrix::from_row_slice(2, 2, &[0.5, 0.0, 0.0, 1.0]);
        let out = decompose(&a, &b, &QzSettings::default()).expect("decomposes");

        assert!((out.eigenvalues[0].modulus() - 0.5).abs() < 1e-10);
        assert_eq!(out.eigenvalues[1].modulus(), f64::INFINITY);
        assert!(out.eigenvalues[1].alpha.norm() < 1e-10);
        assert!(!out.eigenvalues[1].is_stable());
    }

    #[test]
    fn singular_b_is_handled_by_the_substitute_pencil() {
        let a = DMatrix::identity(2, 2);
        let b = DMatrix::from_row_slice(2, 2, &[0.9, 0.0, 1.0, 0.0]);
        let out = decompose(&a, &b, &QzSettings::default()).expect("decomposes");
        assert_schur_invariants(&a, &b, &out);

        let moduli = sorted_moduli(&out);
        assert!(moduli[0].abs() < 1e-8, "zero eigenvalue, got {}", moduli[0]);
        assert!((moduli[1] - 0.9).abs() < 1e-8, "got {}", moduli[1]);
    }

    #[test]
    fn singular_pencils_are_rejected() {
        // Both matrices share the null vector e2, so every shifted
        // combination stays singular.
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 0.0]);
        let b = DMatrix::from_row_slice(2, 2, &[0.9, 0.0, 0.3, 0.0]);
        let err = decompose(&a, &b, &QzSettings::default()).expect_err("singular pencil");
        assert!(matches!(
            err,
            SolveError::NonInvertible {
                what: "matrix pencil"
            }
        ));
    }

    #[test]
    fn exhausted_sweep_budget_reports_no_convergence() {
        let a = DMatrix::identity(2, 2);
        let b = DMatrix::from_row_slice(2, 2, &[0.5, 0.4, 0.3, 0.6]);
        let settings = QzSettings {
            sweeps_per_eigenvalue: 0,
            ..Default::default()
        };
        let err = decompose(&a, &b, &settings).expect_err("budget exhausted");
        assert!(matches!(err, SolveError::SchurNoConvergence { sweeps: 0 }));
    }

    #[test]
    fn malformed_inputs_are_rejected_up_front() {
        let square = DMatrix::identity(2, 2);
        let tall = DMatrix::<f64>::zeros(3, 2);
        let err = decompose(&tall, &square, &QzSettings::default()).expect_err("not square");
        assert!(matches!(err, SolveError::Precondition { .. }));

        let small = DMatrix::identity(1, 1);
        let err = decompose(&small, &square, &QzSettings::default()).expect_err("mismatch");
        assert!(matches!(err, SolveError::Precondition { .. }));

        let mut poisoned = DMatrix::identity(2, 2);
        poisoned[(0, 1)] = f64::NAN;
        let err = decompose(&poisoned, &square, &QzSettings::default()).expect_err("nan");
        assert!(matches!(err, SolveError::Precondition { .. }));
    }

    #[test]
    fn stability_classification_handles_the_boundary() {
        let stable = GeneralizedEigenvalue {
            alpha: Complex::new(1.0, 0.0),
            beta: Complex::new(0.3, 0.0),
        };
        assert!(stable.is_stable());
        assert!(!stable.near_unit(1e-8));

        let boundary = GeneralizedEigenvalue {
            alpha: Complex::new(1.0, 0.0),
            beta: Complex::new(1.0 + 1e-10, 0.0),
        };
        assert!(boundary.near_unit(1e-8));

        let infinite = GeneralizedEigenvalue {
            alpha: Complex::new(0.0, 0.0),
            beta: Complex::new(2.0, 0.0),
        };
        assert!(!infinite.is_stable());
        assert!(!infinite.near_unit(1e-8));
        assert_eq!(infinite.modulus(), f64::INFINITY);
    }
}
