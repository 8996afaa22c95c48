use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::derivatives::DerivativeTables;
use crate::error::{Result, SolveError};
use crate::evaluator::{Bytecode, VM};
use crate::model::{ColumnLayout, VarRole};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SteadyStateSettings {
    /// Convergence threshold on the infinity norm of the full residual.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Step fraction applied to each Newton update.
    pub damping: f64,
}

impl Default for SteadyStateSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 100,
            damping: 1.0,
        }
    }
}

/// Fixed point of the deterministic system with shocks held at zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteadyState {
    /// One value per declared variable, in declaration order. Shock entries
    /// are always zero.
    pub values: Vec<f64>,
    pub residual_norm: f64,
    pub iterations: usize,
}

/// Solves the steady-state system obtained by collapsing every time offset
/// of a variable onto a single unknown.
///
/// `pinned` carries closed-form values by variable index. Pinned variables
/// are removed from the unknowns and the remaining system is solved in the
/// least-squares sense, judged on the full residual. When every non-shock
/// variable is pinned the routine only verifies the supplied point and fails
/// with [`SolveError::SteadyStateInconsistent`] if it does not satisfy the
/// equations.
pub fn resolve_steady_state(
    equations: &[Bytecode],
    tables: &DerivativeTables,
    layout: &ColumnLayout,
    params: &[f64],
    initial_guess: &[f64],
    pinned: &[(usize, f64)],
    settings: &SteadyStateSettings,
) -> Result<SteadyState> {
    let n_vars = layout.n_variables();
    if initial_guess.len() != n_vars {
        return Err(SolveError::Precondition {
            reason: "initial guess length mismatches declarations",
        });
    }
    if settings.tolerance <= 0.0 {
        return Err(SolveError::Precondition {
            reason: "steady-state tolerance must be positive",
        });
    }
    if settings.max_iterations == 0 {
        return Err(SolveError::Precondition {
            reason: "steady-state iteration budget must be positive",
        });
    }
    if settings.damping <= 0.0 {
        return Err(SolveError::Precondition {
            reason: "steady-state damping must be positive",
        });
    }

    let mut is_pinned = vec![false; n_vars];
    let mut values = initial_guess.to_vec();
    for &(var, value) in pinned {
        if var >= n_vars {
            return Err(SolveError::Precondition {
                reason: "pinned variable out of range",
            });
        }
        if layout.role(var) == VarRole::Shock {
            return Err(SolveError::Precondition {
                reason: "pinned value targets a shock",
            });
        }
        if is_pinned[var] {
            return Err(SolveError::Precondition {
                reason: "duplicate pinned variable",
            });
        }
        is_pinned[var] = true;
        values[var] = value;
    }
    for var in 0..n_vars {
        if layout.role(var) == VarRole::Shock {
            values[var] = 0.0;
        }
    }

    // Unknowns are the non-shock variables without a closed-form value.
    let unknowns: Vec<usize> = (0..n_vars)
        .filter(|&v| layout.role(v) != VarRole::Shock && !is_pinned[v])
        .collect();

    let mut stack = Vec::new();
    let mut cols = layout.broadcast_steady(&values);
    let mut residual = eval_residual(equations, &cols, params, &mut stack);
    let (worst, mut norm) = worst_entry(&residual);

    if unknowns.is_empty() {
        if norm <= settings.tolerance {
            return Ok(SteadyState {
                values,
                residual_norm: norm,
                iterations: 0,
            });
        }
        return Err(SolveError::SteadyStateInconsistent {
            residual_norm: norm,
            worst_equation: worst,
        });
    }

    let mut position = vec![usize::MAX; n_vars];
    for (j, &var) in unknowns.iter().enumerate() {
        position[var] = j;
    }

    let mut iterations = 0usize;
    loop {
        if norm <= settings.tolerance {
            break;
        }
        if !norm.is_finite() {
            return Err(SolveError::NoConvergence {
                iterations,
                residual_norm: norm,
                last_iterate: values,
            });
        }
        if iterations >= settings.max_iterations {
            return Err(SolveError::NoConvergence {
                iterations,
                residual_norm: norm,
                last_iterate: values,
            });
        }

        let full = tables.eval_jacobian(&cols, params);
        let collapsed = collapse_jacobian(&full, layout, &position, unknowns.len());
        let delta = solve_step(&collapsed, &residual)?;

        for (j, &var) in unknowns.iter().enumerate() {
            values[var] -= settings.damping * delta[j];
        }

        iterations += 1;
        cols = layout.broadcast_steady(&values);
        residual = eval_residual(equations, &cols, params, &mut stack);
        (_, norm) = worst_entry(&residual);
    }

    Ok(SteadyState {
        values,
        residual_norm: norm,
        iterations,
    })
}

fn eval_residual(
    equations: &[Bytecode],
    cols: &[f64],
    params: &[f64],
    stack: &mut Vec<f64>,
) -> DVector<f64> {
    DVector::from_iterator(
        equations.len(),
        equations
            .iter()
            .map(|code| VM::execute(code, cols, params, stack)),
    )
}

/// Largest absolute residual entry and its equation index. A NaN entry wins
/// outright so domain violations surface in diagnostics.
fn worst_entry(residual: &DVector<f64>) -> (usize, f64) {
    let mut worst = 0usize;
    let mut value = 0.0f64;
    for (i, r) in residual.iter().enumerate() {
        let a = r.abs();
        if a.is_nan() {
            return (i, f64::NAN);
        }
        if a > value {
            worst = i;
            value = a;
        }
    }
    (worst, value)
}

/// Sums the Jacobian columns of every offset of each unknown variable.
fn collapse_jacobian(
    full: &DMatrix<f64>,
    layout: &ColumnLayout,
    position: &[usize],
    n_unknowns: usize,
) -> DMatrix<f64> {
    let mut collapsed = DMatrix::zeros(full.nrows(), n_unknowns);
    for (slot, reference) in layout.columns().iter().enumerate() {
        let j = position[reference.var];
        if j == usize::MAX {
            continue;
        }
        for i in 0..full.nrows() {
            collapsed[(i, j)] += full[(i, slot)];
        }
    }
    collapsed
}

fn solve_step(collapsed: &DMatrix<f64>, residual: &DVector<f64>) -> Result<DVector<f64>> {
    if collapsed.nrows() == collapsed.ncols() {
        return collapsed
            .clone()
            .lu()
            .solve(residual)
            .ok_or(SolveError::NonInvertible {
                what: "collapsed steady-state Jacobian",
            });
    }

    // Partially pinned systems are overdetermined; take the least-squares
    // step and let the full residual decide convergence.
    let svd = collapsed.clone().svd(true, true);
    let largest = svd.singular_values.max();
    if largest == 0.0 {
        return Err(SolveError::NonInvertible {
            what: "collapsed steady-state Jacobian",
        });
    }
    svd.solve(residual, largest * 1e-12)
        .map_err(|_| SolveError::NonInvertible {
            what: "collapsed steady-state Jacobian",
        })
}

#[cfg(test)]
mod tests {
    use super::{resolve_steady_state, SteadyStateSettings};
    use crate::derivatives::{differentiate, DiffOrder};
    use crate::error::SolveError;
    use crate::evaluator::{compile, Bytecode};
    use crate::model::{ColumnLayout, Variable, VarRole};
    use crate::symbolic::{Expr, TimeOffset};

    const ALPHA: f64 = 0.3;
    const BETA: f64 = 0.96;

    fn growth_layout() -> ColumnLayout {
        ColumnLayout::from_variables(&[
            Variable::new("k", VarRole::State),
            Variable::new("c", VarRole::Control),
        ])
    }

    /// k = k(-1)^alpha - c together with the consumption Euler equation,
    /// log utility and full depreciation.
    fn growth_residuals() -> Vec<Expr> {
        let k_lag = Expr::var(0, TimeOffset::Lag);
        let k = Expr::var(0, TimeOffset::Current);
        let c = Expr::var(1, TimeOffset::Current);
        let c_lead = Expr::var(1, TimeOffset::Lead);
        let alpha = Expr::param(0);
        let beta = Expr::param(1);

        let resource = k.clone() + c.clone() - k_lag.pow(&alpha);
        let euler = Expr::constant(1.0) / c
            - beta * alpha.clone() * k.pow(&(alpha - Expr::constant(1.0))) / c_lead;
        vec![resource, euler]
    }

    fn compiled(residuals: &[Expr], layout: &ColumnLayout) -> Vec<Bytecode> {
        residuals
            .iter()
            .map(|r| compile(r, layout.slot_map()).expect("compiles"))
            .collect()
    }

    fn exact_steady_state() -> (f64, f64) {
        let k = (ALPHA * BETA).powf(1.0 / (1.0 - ALPHA));
        let c = k.powf(ALPHA) - k;
        (k, c)
    }

    #[test]
    fn newton_reaches_the_analytic_fixed_point() {
        let layout = growth_layout();
        let residuals = growth_residuals();
        let equations = compiled(&residuals, &layout);
        let tables = differentiate(&residuals, &layout, DiffOrder::First).expect("builds");

        let settings = SteadyStateSettings {
            tolerance: 1e-12,
            ..Default::default()
        };
        let out = resolve_steady_state(
            &equations,
            &tables,
            &layout,
            &[ALPHA, BETA],
            &[0.2, 0.5],
            &[],
            &settings,
        )
        .expect("converges");

        let (k_star, c_star) = exact_steady_state();
        assert!((out.values[0] - k_star).abs() < 1e-10, "k = {}", out.values[0]);
        assert!((out.values[1] - c_star).abs() < 1e-10, "c = {}", out.values[1]);
        assert!(out.residual_norm <= 1e-12);
        assert!(out.iterations > 0);
    }

    #[test]
    fn exact_closed_form_verifies_without_iterating() {
        let layout = growth_layout();
        let residuals = growth_residuals();
        let equations = compiled(&residuals, &layout);
        let tables = differentiate(&residuals, &layout, DiffOrder::First).expect("builds");

        let (k_star, c_star) = exact_steady_state();
        let out = resolve_steady_state(
            &equations,
            &tables,
            &layout,
            &[ALPHA, BETA],
            &[0.0, 0.0],
            &[(0, k_star), (1, c_star)],
            &SteadyStateSettings::default(),
        )
        .expect("verifies");
        assert_eq!(out.iterations, 0);
        assert!(out.residual_norm <= 1e-6);
    }

    #[test]
    fn wrong_closed_form_values_are_rejected() {
        let layout = growth_layout();
        let residuals = growth_residuals();
        let equations = compiled(&residuals, &layout);
        let tables = differentiate(&residuals, &layout, DiffOrder::First).expect("builds");

        let err = resolve_steady_state(
            &equations,
            &tables,
            &layout,
            &[ALPHA, BETA],
            &[0.0, 0.0],
            &[(0, 0.5), (1, 0.5)],
            &SteadyStateSettings::default(),
        )
        .expect_err("inconsistent point");
        assert!(matches!(
            err,
            SolveError::SteadyStateInconsistent { residual_norm, .. } if residual_norm > 1e-6
        ));
    }

    #[test]
    fn partial_pins_solve_the_remaining_unknowns() {
        let layout = growth_layout();
        let residuals = growth_residuals();
        let equations = compiled(&residuals, &layout);
        let tables = differentiate(&residuals, &layout, DiffOrder::First).expect("builds");

        let (k_star, c_star) = exact_steady_state();
        let settings = SteadyStateSettings {
            tolerance: 1e-12,
            ..Default::default()
        };
        let out = resolve_steady_state(
            &equations,
            &tables,
            &layout,
            &[ALPHA, BETA],
            &[0.0, 0.4],
            &[(0, k_star)],
            &settings,
        )
        .expect("solves for c");
        assert!((out.values[1] - c_star).abs() < 1e-10);
    }

    #[test]
    fn unit_root_systems_report_a_singular_jacobian() {
        // x = x(-1) + 1 has no fixed point and a zero collapsed Jacobian.
        let layout = ColumnLayout::from_variables(&[Variable::new("x", VarRole::State)]);
        let residual = Expr::var(0, TimeOffset::Current)
            - Expr::var(0, TimeOffset::Lag)
            - Expr::constant(1.0);
        let equations = compiled(std::slice::from_ref(&residual), &layout);
        let tables =
            differentiate(std::slice::from_ref(&residual), &layout, DiffOrder::First)
                .expect("builds");

        let err = resolve_steady_state(
            &equations,
            &tables,
            &layout,
            &[],
            &[0.0],
            &[],
            &SteadyStateSettings::default(),
        )
        .expect_err("no fixed point");
        assert!(matches!(
            err,
            SolveError::NonInvertible {
                what: "collapsed steady-state Jacobian"
            }
        ));
    }

    #[test]
    fn rootless_systems_exhaust_the_iteration_budget() {
        // x^2 + 1 = 0 has no real root; Newton wanders forever.
        let layout = ColumnLayout::from_variables(&[Variable::new("x", VarRole::State)]);
        let residual = Expr::var(0, TimeOffset::Current).powf(2.0) + Expr::constant(1.0);
        let equations = compiled(std::slice::from_ref(&residual), &layout);
        let tables =
            differentiate(std::slice::from_ref(&residual), &layout, DiffOrder::First)
                .expect("builds");

        let settings = SteadyStateSettings {
            max_iterations: 25,
            ..Default::default()
        };
        let err = resolve_steady_state(
            &equations,
            &tables,
            &layout,
            &[],
            &[3.0],
            &[],
            &settings,
        )
        .expect_err("cannot converge");
        match err {
            SolveError::NoConvergence {
                iterations,
                residual_norm,
                last_iterate,
            } => {
                assert_eq!(iterations, 25);
                assert!(residual_norm >= 1.0);
                assert_eq!(last_iterate.len(), 1);
            }
            other => panic!("expected NoConvergence, got {other:?}"),
        }
    }
}
