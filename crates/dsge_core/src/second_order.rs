use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SolveError};
use crate::klein::{Eigenstructure, FirstOrderPolicy};
use crate::model::ColumnLayout;
use crate::qz::solve_upper;

type C64 = Complex<f64>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SecondOrderSettings {
    /// Reciprocal pivot-ratio threshold below which a Sylvester column
    /// system counts as singular.
    pub pivot_tolerance: f64,
}

impl Default for SecondOrderSettings {
    fn default() -> Self {
        Self {
            pivot_tolerance: 1e-12,
        }
    }
}

/// Quadratic and risk corrections to the linear decision rules.
///
/// With `u = [x_{t-1}; eps_t]` the second-order rules read
///
/// ```text
/// x_t = P u + 1/2 (I (x) u') state_quad u + 1/2 state_risk
/// c_t = F u + 1/2 (I (x) u') control_quad u + 1/2 control_risk
/// ```
///
/// where the quadratic coefficients stack one symmetric block per output
/// row and the risk vectors carry the variance correction at unit shock
/// scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondOrderPolicy {
    /// `n_states` stacked blocks, each `m x m` over the augmented vector.
    pub state_quad: DMatrix<f64>,
    /// `n_controls` stacked blocks, each `m x m`.
    pub control_quad: DMatrix<f64>,
    pub state_risk: DVector<f64>,
    pub control_risk: DVector<f64>,
}

impl SecondOrderPolicy {
    /// Quadratic block of the `i`-th state transition.
    pub fn state_block(&self, i: usize) -> DMatrix<f64> {
        let m = self.state_quad.ncols();
        self.state_quad.view((i * m, 0), (m, m)).clone_owned()
    }

    /// Quadratic block of the `i`-th control rule.
    pub fn control_block(&self, i: usize) -> DMatrix<f64> {
        let m = self.control_quad.ncols();
        self.control_quad.view((i * m, 0), (m, m)).clone_owned()
    }
}

/// Extends a first-order solution with quadratic terms by the method of
/// Gomme and Klein.
///
/// The unknown blocks satisfy a generalized Sylvester equation that is
/// solved column by column against the stable Schur factors already held in
/// `eigen`, so no new eigendecomposition is required. The variance terms
/// then follow from one linear solve; a singular coefficient matrix there
/// is reported as [`SolveError::SylvesterSingular`] with the unit pair,
/// since constants propagate through the system with unit eigenvalue.
pub fn solve_second_order(
    jacobian: &DMatrix<f64>,
    hessian: &DMatrix<f64>,
    layout: &ColumnLayout,
    policy: &FirstOrderPolicy,
    eigen: &Eigenstructure,
    shock_covariance: &DMatrix<f64>,
    settings: &SecondOrderSettings,
) -> Result<SecondOrderPolicy> {
    let ns = layout.n_states();
    let nc = layout.n_controls();
    let ne = layout.n_shocks();
    let n_eq = ns + nc;
    let n_cols = layout.n_columns();
    let m = ns + ne;
    let n_aug = m + nc;

    if jacobian.nrows() != n_eq || jacobian.ncols() != n_cols {
        return Err(SolveError::Precondition {
            reason: "jacobian shape mismatches the column layout",
        });
    }
    if hessian.nrows() != n_eq || hessian.ncols() != n_cols * n_cols {
        return Err(SolveError::Precondition {
            reason: "hessian shape mismatches the column layout",
        });
    }
    if !jacobian.iter().all(|v| v.is_finite()) || !hessian.iter().all(|v| v.is_finite()) {
        return Err(SolveError::Precondition {
            reason: "derivative tables must be finite",
        });
    }
    if shock_covariance.nrows() != ne || shock_covariance.ncols() != ne {
        return Err(SolveError::Precondition {
            reason: "shock covariance shape mismatches the declarations",
        });
    }
    if policy.state_state.nrows() != ns
        || policy.state_shock.ncols() != ne
        || policy.control_state.nrows() != nc
    {
        return Err(SolveError::Precondition {
            reason: "policy dimensions mismatch the layout",
        });
    }
    if eigen.n_predetermined != m || eigen.qz.z.nrows() != n_aug {
        return Err(SolveError::Precondition {
            reason: "eigenstructure dimensions mismatch the layout",
        });
    }
    if settings.pivot_tolerance <= 0.0 {
        return Err(SolveError::Precondition {
            reason: "pivot tolerance must be positive",
        });
    }
    if m == 0 {
        return Ok(SecondOrderPolicy {
            state_quad: DMatrix::zeros(0, 0),
            control_quad: DMatrix::zeros(0, 0),
            state_risk: DVector::zeros(0),
            control_risk: DVector::zeros(nc),
        });
    }

    let lag = layout.states_lag_range().start;
    let cur = layout.states_current_range().start;
    let ctl = layout.controls_current_range().start;
    let lead = layout.controls_lead_range().start;
    let shk = layout.shocks_range().start;

    // Augmented first-order maps over u = [states; shocks].
    let mut hx = DMatrix::zeros(m, m);
    hx.view_mut((0, 0), (ns, ns)).copy_from(&policy.state_state);
    hx.view_mut((0, ns), (ns, ne)).copy_from(&policy.state_shock);
    let mut gx = DMatrix::zeros(nc, m);
    gx.view_mut((0, 0), (nc, ns))
        .copy_from(&policy.control_state);
    gx.view_mut((0, ns), (nc, ne))
        .copy_from(&policy.control_shock);

    // Forward and contemporaneous derivative blocks of the augmented
    // system, trivial innovation rows included.
    let mut d1f = DMatrix::zeros(n_aug, m);
    let mut d2f = DMatrix::zeros(n_aug, nc);
    let mut d4f = DMatrix::zeros(n_aug, nc);
    for i in 0..n_eq {
        for j in 0..ns {
            d1f[(i, j)] = jacobian[(i, cur + j)];
        }
        for j in 0..nc {
            d2f[(i, j)] = jacobian[(i, lead + j)];
            d4f[(i, j)] = jacobian[(i, ctl + j)];
        }
    }
    for k in 0..ne {
        d1f[(n_eq + k, ns + k)] = 1.0;
    }
    let a1 = &d1f + &d2f * &gx;

    // Chain rule map from the augmented vector to the equation columns.
    let mut chain = DMatrix::zeros(n_cols, m);
    for j in 0..ns {
        chain[(lag + j, j)] = 1.0;
    }
    chain.view_mut((cur, 0), (ns, m)).copy_from(&hx.view((0, 0), (ns, m)));
    chain.view_mut((ctl, 0), (nc, m)).copy_from(&gx);
    chain.view_mut((lead, 0), (nc, m)).copy_from(&(&gx * &hx));
    for j in 0..ne {
        chain[(shk + j, ns + j)] = 1.0;
    }

    let hessians: Vec<DMatrix<f64>> = (0..n_eq)
        .map(|i| unflatten_hessian(hessian, i, n_cols))
        .collect();

    let mut forcing = DMatrix::<f64>::zeros(n_aug * m, m);
    for (i, h_i) in hessians.iter().enumerate() {
        let block = chain.transpose() * h_i * &chain;
        forcing.view_mut((i * m, 0), (m, m)).copy_from(&block);
    }

    let eye_m = DMatrix::<f64>::identity(m, m);
    let mut w = DMatrix::<f64>::zeros(n_aug * m, n_aug * m);
    w.view_mut((0, 0), (n_aug * m, m * m))
        .copy_from(&a1.kronecker(&eye_m));
    w.view_mut((0, m * m), (n_aug * m, nc * m))
        .copy_from(&d4f.kronecker(&eye_m));
    let mut v = DMatrix::<f64>::zeros(n_aug * m, n_aug * m);
    v.view_mut((0, m * m), (n_aug * m, nc * m))
        .copy_from(&d2f.kronecker(&hx.transpose()));

    let s11 = eigen.qz.s.view((0, 0), (m, m)).clone_owned();
    let t11 = eigen.qz.t.view((0, 0), (m, m)).clone_owned();
    let z11 = eigen.qz.z.view((0, 0), (m, m)).clone_owned();
    let stable_dynamics = solve_upper(&s11, &t11).ok_or(SolveError::NonInvertible {
        what: "stable pencil block",
    })?;
    let z11_inv = z11
        .clone()
        .lu()
        .try_inverse()
        .ok_or(SolveError::NonInvertible {
            what: "stable invariant subspace block",
        })?;

    // Right-multiplying the Sylvester equation by z11 triangularizes the
    // transition, so the columns decouple in sequence.
    let w_c = promote(&w);
    let v_c = promote(&v);
    let rhs_all = -promote(&forcing) * &z11;

    let mut y = DMatrix::<C64>::zeros(n_aug * m, m);
    for j in 0..m {
        let mut carried = DVector::<C64>::zeros(n_aug * m);
        for k in 0..j {
            let weight = stable_dynamics[(k, j)];
            carried.axpy(weight, &y.column(k).clone_owned(), C64::new(1.0, 0.0));
        }
        let rhs_col = rhs_all.column(j) - &v_c * carried;

        let coeff = &w_c + &v_c * stable_dynamics[(j, j)];
        let lu = coeff.lu();
        let singular = SolveError::SylvesterSingular {
            alpha: s11[(j, j)],
            beta: t11[(j, j)],
        };
        if pivot_ratio(lu.u().view((0, 0), (n_aug * m, n_aug * m))) <= settings.pivot_tolerance {
            return Err(singular);
        }
        let column = lu.solve(&rhs_col).ok_or(singular)?;
        y.set_column(j, &column);
    }

    let x_c = y * &z11_inv;
    let real_scale = x_c.iter().map(|c| c.re.abs()).fold(0.0, f64::max);
    let imag_peak = x_c.iter().map(|c| c.im.abs()).fold(0.0, f64::max);
    if !real_scale.is_finite() || imag_peak > 1e-6 * (1.0 + real_scale) {
        return Err(SolveError::NonInvertible {
            what: "quadratic coefficient system",
        });
    }
    let mut x = x_c.map(|c| c.re);

    // Each output block is a Hessian of a scalar rule; enforce exact
    // symmetry against solver rounding.
    for blk in 0..n_aug {
        let block = x.view((blk * m, 0), (m, m)).clone_owned();
        let symmetric = (&block + block.transpose()) * 0.5;
        x.view_mut((blk * m, 0), (m, m)).copy_from(&symmetric);
    }

    let state_quad = x.view((0, 0), (ns * m, m)).clone_owned();
    let control_quad = x.view((m * m, 0), (nc * m, m)).clone_owned();

    let (state_risk, control_risk) = if ne == 0 {
        (DVector::zeros(ns), DVector::zeros(nc))
    } else {
        solve_risk_terms(
            jacobian,
            &hessians,
            layout,
            policy,
            &a1,
            &d2f,
            &d4f,
            &control_quad,
            shock_covariance,
            settings,
        )?
    };

    Ok(SecondOrderPolicy {
        state_quad,
        control_quad,
        state_risk,
        control_risk,
    })
}

/// Constant (variance) corrections from one linear solve. Trivial
/// innovation rows pin the shock components of the state correction to
/// zero, so only the genuine state and control entries survive.
#[allow(clippy::too_many_arguments)]
fn solve_risk_terms(
    jacobian: &DMatrix<f64>,
    hessians: &[DMatrix<f64>],
    layout: &ColumnLayout,
    policy: &FirstOrderPolicy,
    a1: &DMatrix<f64>,
    d2f: &DMatrix<f64>,
    d4f: &DMatrix<f64>,
    control_quad: &DMatrix<f64>,
    shock_covariance: &DMatrix<f64>,
    settings: &SecondOrderSettings,
) -> Result<(DVector<f64>, DVector<f64>)> {
    let ns = layout.n_states();
    let nc = layout.n_controls();
    let ne = layout.n_shocks();
    let n_eq = ns + nc;
    let m = ns + ne;
    let n_aug = m + nc;
    let lead = layout.controls_lead_range().start;

    // Expected curvature of each control rule under the innovation
    // distribution.
    let mut quad_variance = DVector::zeros(nc);
    for b in 0..nc {
        let block = control_quad.view((b * m + ns, ns), (ne, ne)).clone_owned();
        quad_variance[b] = (block * shock_covariance).trace();
    }

    let g_shock = &policy.control_shock;
    let mut rhs = DVector::zeros(n_aug);
    for (i, h_i) in hessians.iter().enumerate().take(n_eq) {
        let h_lead = h_i.view((lead, lead), (nc, nc)).clone_owned();
        let curvature = (g_shock.transpose() * h_lead * g_shock * shock_covariance).trace();
        let mut expected = 0.0;
        for b in 0..nc {
            expected += jacobian[(i, lead + b)] * quad_variance[b];
        }
        rhs[i] = -(curvature + expected);
    }

    let mut k_mat = DMatrix::<f64>::zeros(n_aug, n_aug);
    k_mat.view_mut((0, 0), (n_aug, m)).copy_from(a1);
    k_mat
        .view_mut((0, m), (n_aug, nc))
        .copy_from(&(d2f + d4f));

    let singular = SolveError::SylvesterSingular {
        alpha: C64::new(1.0, 0.0),
        beta: C64::new(1.0, 0.0),
    };
    let lu = k_mat.lu();
    let u = lu.u();
    let (mut smallest, mut largest) = (f64::INFINITY, 0.0f64);
    for k in 0..n_aug {
        let d = u[(k, k)].abs();
        smallest = smallest.min(d);
        largest = largest.max(d);
    }
    if largest == 0.0 || smallest / largest <= settings.pivot_tolerance {
        return Err(singular);
    }
    let solution = lu.solve(&rhs).ok_or(singular)?;

    let state_risk = solution.rows(0, ns).clone_owned();
    let control_risk = solution.rows(m, nc).clone_owned();
    Ok((state_risk, control_risk))
}

fn unflatten_hessian(hessian: &DMatrix<f64>, equation: usize, n_cols: usize) -> DMatrix<f64> {
    let mut out = DMatrix::zeros(n_cols, n_cols);
    for a in 0..n_cols {
        for b in 0..n_cols {
            out[(a, b)] = hessian[(equation, a * n_cols + b)];
        }
    }
    out
}

fn promote(m: &DMatrix<f64>) -> DMatrix<C64> {
    m.map(|v| C64::new(v, 0.0))
}

fn pivot_ratio(u: nalgebra::DMatrixView<C64>) -> f64 {
    let n = u.nrows();
    let (mut smallest, mut largest) = (f64::INFINITY, 0.0f64);
    for k in 0..n {
        let d = u[(k, k)].norm();
        smallest = smallest.min(d);
        largest = largest.max(d);
    }
    if largest == 0.0 {
        0.0
    } else {
        smallest / largest
    }
}
