use nalgebra::DMatrix;
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SolveError};
use crate::model::ColumnLayout;
use crate::qz::{
    decompose, singular_value_ratio, solve_upper, GeneralizedEigenvalue, QzDecomposition,
    QzSettings,
};

type C64 = Complex<f64>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KleinSettings {
    /// Eigenvalues whose modulus lies within this distance of one are
    /// treated as a boundary case rather than classified either way.
    pub unit_circle_tolerance: f64,
    /// Reciprocal condition threshold for the predetermined block of the
    /// stable invariant subspace.
    pub condition_tolerance: f64,
    pub qz: QzSettings,
}

impl Default for KleinSettings {
    fn default() -> Self {
        Self {
            unit_circle_tolerance: 1e-8,
            condition_tolerance: 1e-10,
            qz: QzSettings::default(),
        }
    }
}

/// Schur decomposition of the linearized system pencil together with the
/// saddle-path counts, kept for reuse by the quadratic expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Eigenstructure {
    pub qz: QzDecomposition,
    pub stable_count: usize,
    /// States plus shocks; the row count of the predetermined block.
    pub n_predetermined: usize,
}

/// Serializable summary of [`Eigenstructure`] without the Schur factors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EigenReport {
    pub eigenvalues: Vec<GeneralizedEigenvalue>,
    pub stable_count: usize,
    pub n_predetermined: usize,
}

impl From<&Eigenstructure> for EigenReport {
    fn from(eigen: &Eigenstructure) -> Self {
        Self {
            eigenvalues: eigen.qz.eigenvalues.clone(),
            stable_count: eigen.stable_count,
            n_predetermined: eigen.n_predetermined,
        }
    }
}

/// Linear decision rules around the deterministic fixed point, in
/// deviations. With states `x`, shocks `eps` and controls `c`:
///
/// ```text
/// x_t = state_state * x_{t-1} + state_shock * eps_t
/// c_t = control_state * x_{t-1} + control_shock * eps_t
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirstOrderPolicy {
    pub control_state: DMatrix<f64>,
    pub control_shock: DMatrix<f64>,
    pub state_state: DMatrix<f64>,
    pub state_shock: DMatrix<f64>,
}

/// Solves the linearized expectational system by the method of Klein.
///
/// The Jacobian is evaluated at the steady state and read in the fixed
/// column order of [`ColumnLayout`]. Shocks are folded into the
/// predetermined block by appending one trivial equation per innovation, so
/// the pencil has `states + shocks + controls` rows. Saddle-path determinacy
/// requires exactly `states + shocks` stable eigenvalues. A surplus is
/// reported as [`SolveError::Indeterminacy`] and a deficit as
/// [`SolveError::Instability`]; an eigenvalue too close to the unit circle
/// to classify becomes an indeterminacy report with an explanatory note.
pub fn solve_first_order(
    jacobian: &DMatrix<f64>,
    layout: &ColumnLayout,
    settings: &KleinSettings,
) -> Result<(FirstOrderPolicy, Eigenstructure)> {
    let ns = layout.n_states();
    let nc = layout.n_controls();
    let ne = layout.n_shocks();
    let n_eq = ns + nc;
    let m = ns + ne;
    let n_aug = m + nc;

    if jacobian.nrows() != n_eq || jacobian.ncols() != layout.n_columns() {
        return Err(SolveError::Precondition {
            reason: "jacobian shape mismatches the column layout",
        });
    }
    if !jacobian.iter().all(|v| v.is_finite()) {
        return Err(SolveError::Precondition {
            reason: "jacobian must be finite",
        });
    }

    let (forward, current) = assemble_pencil(jacobian, layout);
    let qz = decompose(&forward, &current, &settings.qz)?;

    for eigenvalue in &qz.eigenvalues {
        if eigenvalue.near_unit(settings.unit_circle_tolerance) {
            return Err(boundary_error(
                &qz,
                nc,
                "; an eigenvalue lies within tolerance of the unit circle",
            ));
        }
    }

    let stable_count = qz.eigenvalues.iter().filter(|e| e.is_stable()).count();
    if stable_count > m {
        return Err(boundary_error(&qz, nc, ""));
    }
    if stable_count < m {
        return Err(SolveError::Instability {
            unstable: n_aug - stable_count,
            controls: nc,
            eigenvalues: qz.eigenvalues.clone(),
        });
    }

    let eigen = Eigenstructure {
        qz,
        stable_count,
        n_predetermined: m,
    };
    if m == 0 {
        let policy = FirstOrderPolicy {
            control_state: DMatrix::zeros(nc, 0),
            control_shock: DMatrix::zeros(nc, 0),
            state_state: DMatrix::zeros(0, 0),
            state_shock: DMatrix::zeros(0, 0),
        };
        return Ok((policy, eigen));
    }

    let z11 = eigen.qz.z.view((0, 0), (m, m)).clone_owned();
    let z21 = eigen.qz.z.view((m, 0), (nc, m)).clone_owned();
    if singular_value_ratio(&z11) <= settings.condition_tolerance {
        return Err(boundary_error(
            &eigen.qz,
            nc,
            "; the predetermined block of the stable subspace is ill conditioned",
        ));
    }
    let z11_inv = z11
        .clone()
        .lu()
        .try_inverse()
        .ok_or(SolveError::NonInvertible {
            what: "stable invariant subspace block",
        })?;

    let s11 = eigen.qz.s.view((0, 0), (m, m)).clone_owned();
    let t11 = eigen.qz.t.view((0, 0), (m, m)).clone_owned();
    let stable_dynamics = solve_upper(&s11, &t11).ok_or(SolveError::NonInvertible {
        what: "stable pencil block",
    })?;

    let control_map = &z21 * &z11_inv;
    let state_map = &z11 * &stable_dynamics * &z11_inv;

    let control_real = take_real(&control_map, &eigen.qz, nc)?;
    let mut state_real = take_real(&state_map, &eigen.qz, nc)?;

    // The trivial innovation equations make the shock rows of the state map
    // exact zeros; scrub the rounding residue.
    for i in ns..m {
        for j in 0..m {
            state_real[(i, j)] = 0.0;
        }
    }

    let policy = FirstOrderPolicy {
        control_state: control_real.view((0, 0), (nc, ns)).clone_owned(),
        control_shock: control_real.view((0, ns), (nc, ne)).clone_owned(),
        state_state: state_real.view((0, 0), (ns, ns)).clone_owned(),
        state_shock: state_real.view((0, ns), (ns, ne)).clone_owned(),
    };
    Ok((policy, eigen))
}

/// Builds `forward * E[v_{t+1}] = current * v_t` over the augmented vector
/// `v = [states; shocks; controls]`.
fn assemble_pencil(jacobian: &DMatrix<f64>, layout: &ColumnLayout) -> (DMatrix<f64>, DMatrix<f64>) {
    let ns = layout.n_states();
    let nc = layout.n_controls();
    let ne = layout.n_shocks();
    let n_eq = ns + nc;
    let m = ns + ne;
    let n_aug = m + nc;

    let lag = layout.states_lag_range().start;
    let cur = layout.states_current_range().start;
    let ctl = layout.controls_current_range().start;
    let lead = layout.controls_lead_range().start;
    let shk = layout.shocks_range().start;

    let mut forward = DMatrix::zeros(n_aug, n_aug);
    let mut current = DMatrix::zeros(n_aug, n_aug);
    for i in 0..n_eq {
        for j in 0..ns {
            forward[(i, j)] = jacobian[(i, cur + j)];
            current[(i, j)] = -jacobian[(i, lag + j)];
        }
        for j in 0..ne {
            current[(i, ns + j)] = -jacobian[(i, shk + j)];
        }
        for j in 0..nc {
            forward[(i, m + j)] = jacobian[(i, lead + j)];
            current[(i, m + j)] = -jacobian[(i, ctl + j)];
        }
    }
    // One E[eps_{t+1}] = 0 row per innovation.
    for k in 0..ne {
        forward[(n_eq + k, ns + k)] = 1.0;
    }
    (forward, current)
}

fn boundary_error(qz: &QzDecomposition, controls: usize, note: &str) -> SolveError {
    SolveError::Indeterminacy {
        unstable: qz.eigenvalues.iter().filter(|e| !e.is_stable()).count(),
        controls,
        eigenvalues: qz.eigenvalues.clone(),
        note: note.to_owned(),
    }
}

/// Drops the imaginary parts after checking they are rounding residue. A
/// material imaginary component means a conjugate pair straddles the
/// stability boundary.
fn take_real(
    m: &DMatrix<C64>,
    qz: &QzDecomposition,
    controls: usize,
) -> Result<DMatrix<f64>> {
    let real_scale = m.iter().map(|c| c.re.abs()).fold(0.0, f64::max);
    let imag_peak = m.iter().map(|c| c.im.abs()).fold(0.0, f64::max);
    if !real_scale.is_finite() || !imag_peak.is_finite() {
        return Err(SolveError::NonInvertible {
            what: "stable invariant subspace block",
        });
    }
    if imag_peak > 1e-8 * (1.0 + real_scale) {
        return Err(boundary_error(
            qz,
            controls,
            "; the candidate decision rule has a nonvanishing imaginary component",
        ));
    }
    Ok(m.map(|c| c.re))
}

#[cfg(test)]
mod tests {
    use super::{solve_first_order, KleinSettings};
    use crate::error::SolveError;
    use crate::model::{ColumnLayout, VarRole, Variable};
    use nalgebra::DMatrix;

    /// One autoregressive driver `a`, one forward-looking control `c` and
    /// one innovation. Columns follow [a(-1), a, c, c(+1), e].
    fn driver_layout() -> ColumnLayout {
        ColumnLayout::from_variables(&[
            Variable::new("a", VarRole::State),
            Variable::new("c", VarRole::Control),
            Variable::new("e", VarRole::Shock),
        ])
    }

    fn driver_jacobian(rho: f64, lead: f64) -> DMatrix<f64> {
        DMatrix::from_row_slice(
            2,
            5,
            &[
                -rho, 1.0, 0.0, 0.0, -1.0, //
                0.0, -1.0, 1.0, -lead, 0.0,
            ],
        )
    }

    #[test]
    fn forward_solution_matches_the_geometric_sum() {
        let layout = driver_layout();
        let jacobian = driver_jacobian(0.9, 0.95);
        let (policy, eigen) =
            solve_first_order(&jacobian, &layout, &KleinSettings::default()).expect("determinate");

        // c_t = a_t + 0.95 E[c_{t+1}] discounts the whole expected path.
        let phi = 1.0 / (1.0 - 0.95 * 0.9);
        assert!((policy.control_state[(0, 0)] - 0.9 * phi).abs() < 1e-8);
        assert!((policy.control_shock[(0, 0)] - phi).abs() < 1e-8);
        assert!((policy.state_state[(0, 0)] - 0.9).abs() < 1e-8);
        assert!((policy.state_shock[(0, 0)] - 1.0).abs() < 1e-8);

        assert_eq!(eigen.n_predetermined, 2);
        assert_eq!(eigen.stable_count, 2);
        assert_eq!(eigen.qz.eigenvalues.len(), 3);
    }

    #[test]
    fn white_noise_driver_leaves_no_state_feedback() {
        let layout = driver_layout();
        let jacobian = driver_jacobian(0.0, 0.95);
        let (policy, _) =
            solve_first_order(&jacobian, &layout, &KleinSettings::default()).expect("determinate");

        assert!(policy.control_state[(0, 0)].abs() < 1e-9);
        assert!((policy.control_shock[(0, 0)] - 1.0).abs() < 1e-9);
        assert!(policy.state_state[(0, 0)].abs() < 1e-9);
        assert!((policy.state_shock[(0, 0)] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn explosive_driver_is_reported_as_instability() {
        let layout = driver_layout();
        let jacobian = driver_jacobian(1.1, 0.95);
        let err = solve_first_order(&jacobian, &layout, &KleinSettings::default())
            .expect_err("too few stable roots");
        match err {
            SolveError::Instability {
                unstable,
                controls,
                eigenvalues,
            } => {
                assert_eq!(unstable, 2);
                assert_eq!(controls, 1);
                assert_eq!(eigenvalues.len(), 3);
            }
            other => panic!("expected Instability, got {other:?}"),
        }
    }

    #[test]
    fn stable_forward_root_is_reported_as_indeterminacy() {
        let layout = driver_layout();
        let jacobian = driver_jacobian(0.9, 1.25);
        let err = solve_first_order(&jacobian, &layout, &KleinSettings::default())
            .expect_err("too many stable roots");
        match err {
            SolveError::Indeterminacy {
                unstable, controls, ..
            } => {
                assert_eq!(unstable, 0);
                assert_eq!(controls, 1);
            }
            other => panic!("expected Indeterminacy, got {other:?}"),
        }
    }

    #[test]
    fn boundary_eigenvalues_refuse_classification() {
        let layout = driver_layout();
        let jacobian = driver_jacobian(1.0 + 1e-10, 0.95);
        let err = solve_first_order(&jacobian, &layout, &KleinSettings::default())
            .expect_err("boundary root");
        let message = err.to_string();
        assert!(
            message.contains("unit circle"),
            "missing boundary note: {message}"
        );
    }

    #[test]
    fn degenerate_equations_surface_the_singular_pencil() {
        let layout = ColumnLayout::from_variables(&[
            Variable::new("a", VarRole::State),
            Variable::new("c", VarRole::Control),
        ]);
        // Second equation pins lagged a only; the pencil columns for c are
        // identically zero.
        let jacobian = DMatrix::from_row_slice(
            2,
            4,
            &[
                -0.9, 1.0, 0.0, 0.0, //
                -0.3, 0.0, 0.0, 0.0,
            ],
        );
        let err = solve_first_order(&jacobian, &layout, &KleinSettings::default())
            .expect_err("singular pencil");
        assert!(matches!(
            err,
            SolveError::NonInvertible {
                what: "matrix pencil"
            }
        ));
    }

    #[test]
    fn jacobian_shape_is_validated() {
        let layout = driver_layout();
        let jacobian = DMatrix::<f64>::zeros(3, 5);
        let err = solve_first_order(&jacobian, &layout, &KleinSettings::default())
            .expect_err("bad shape");
        assert!(matches!(err, SolveError::Precondition { .. }));
    }
}
