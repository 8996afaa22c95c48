use std::collections::HashMap;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SolveError};
use crate::evaluator::{self, Bytecode, VM};
use crate::model::ColumnLayout;
use crate::symbolic::Expr;

/// How deep the symbolic differentiation goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffOrder {
    First,
    Second,
}

/// One derivative entry. Structurally zero entries carry no bytecode, so
/// the zero pattern of the symbolic system is preserved exactly rather than
/// approximated by small floats.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Zero,
    Code(usize),
}

/// Compiled derivative tables for an equation system.
///
/// The Jacobian table has one row per equation and one column per evaluation
/// column of the layout. The Hessian table flattens the second index pair
/// row-major: the entry for columns `(a, b)` of equation `i` lives at flat
/// column `a * n_columns + b`. Entries are compiled once per distinct
/// expression; mirrored Hessian pairs share bytecode.
#[derive(Debug, Clone)]
pub struct DerivativeTables {
    n_equations: usize,
    n_columns: usize,
    codes: Vec<Bytecode>,
    jacobian: Vec<Slot>,
    hessian: Option<Vec<Slot>>,
}

/// Differentiates every residual against every evaluation column.
///
/// Fails with [`SolveError::MalformedEquation`] when a residual routes a
/// variable through an operator that has no derivative.
pub fn differentiate(
    residuals: &[Expr],
    layout: &ColumnLayout,
    order: DiffOrder,
) -> Result<DerivativeTables> {
    let n_columns = layout.n_columns();
    let n_equations = residuals.len();

    let mut codes = Vec::new();
    let mut cache: HashMap<usize, usize> = HashMap::new();
    // Interned expressions must stay alive while the cache is in use, or a
    // recycled allocation could alias a stale pointer key.
    let mut retained: Vec<Expr> = Vec::new();

    let mut jacobian = Vec::with_capacity(n_equations * n_columns);
    let mut firsts: Vec<Option<Expr>> = Vec::with_capacity(n_equations * n_columns);

    for (equation, residual) in residuals.iter().enumerate() {
        for &column in layout.columns() {
            let d = residual
                .diff(column)
                .map_err(|e| SolveError::MalformedEquation {
                    equation,
                    operator: e.operator,
                })?;
            if d.is_zero() {
                jacobian.push(Slot::Zero);
                firsts.push(None);
            } else {
                let idx = intern(&mut codes, &mut cache, &mut retained, &d, layout)?;
                jacobian.push(Slot::Code(idx));
                firsts.push(Some(d));
            }
        }
    }

    let hessian = match order {
        DiffOrder::First => None,
        DiffOrder::Second => {
            let mut slots = vec![Slot::Zero; n_equations * n_columns * n_columns];
            for equation in 0..n_equations {
                for a in 0..n_columns {
                    let Some(da) = &firsts[equation * n_columns + a] else {
                        continue;
                    };
                    for (b, &column_b) in layout.columns().iter().enumerate().skip(a) {
                        let dd = da
                            .diff(column_b)
                            .map_err(|e| SolveError::MalformedEquation {
                                equation,
                                operator: e.operator,
                            })?;
                        if dd.is_zero() {
                            continue;
                        }
                        let idx = intern(&mut codes, &mut cache, &mut retained, &dd, layout)?;
                        let row = equation * n_columns * n_columns;
                        slots[row + a * n_columns + b] = Slot::Code(idx);
                        slots[row + b * n_columns + a] = Slot::Code(idx);
                    }
                }
            }
            Some(slots)
        }
    };

    Ok(DerivativeTables {
        n_equations,
        n_columns,
        codes,
        jacobian,
        hessian,
    })
}

fn intern(
    codes: &mut Vec<Bytecode>,
    cache: &mut HashMap<usize, usize>,
    retained: &mut Vec<Expr>,
    expr: &Expr,
    layout: &ColumnLayout,
) -> Result<usize> {
    if let Some(&idx) = cache.get(&expr.ptr_id()) {
        return Ok(idx);
    }
    let code = evaluator::compile(expr, layout.slot_map())?;
    codes.push(code);
    let idx = codes.len() - 1;
    cache.insert(expr.ptr_id(), idx);
    retained.push(expr.clone());
    Ok(idx)
}

impl DerivativeTables {
    pub fn n_equations(&self) -> usize {
        self.n_equations
    }

    pub fn n_columns(&self) -> usize {
        self.n_columns
    }

    pub fn has_hessian(&self) -> bool {
        self.hessian.is_some()
    }

    /// True when the Jacobian entry is symbolically zero.
    pub fn is_structural_zero(&self, equation: usize, column: usize) -> bool {
        matches!(
            self.jacobian[equation * self.n_columns + column],
            Slot::Zero
        )
    }

    /// Evaluates the Jacobian at the given column values.
    pub fn eval_jacobian(&self, cols: &[f64], params: &[f64]) -> DMatrix<f64> {
        debug_assert_eq!(cols.len(), self.n_columns);
        let mut stack = Vec::new();
        let mut out = DMatrix::zeros(self.n_equations, self.n_columns);
        for i in 0..self.n_equations {
            for j in 0..self.n_columns {
                if let Slot::Code(idx) = self.jacobian[i * self.n_columns + j] {
                    out[(i, j)] = VM::execute(&self.codes[idx], cols, params, &mut stack);
                }
            }
        }
        out
    }

    /// Evaluates the flattened Hessian (one row per equation, column pairs
    /// flattened row-major). Returns `None` when the tables were built at
    /// first order only.
    pub fn eval_hessian(&self, cols: &[f64], params: &[f64]) -> Option<DMatrix<f64>> {
        let slots = self.hessian.as_ref()?;
        debug_assert_eq!(cols.len(), self.n_columns);
        let width = self.n_columns * self.n_columns;
        let mut stack = Vec::new();
        let mut out = DMatrix::zeros(self.n_equations, width);
        for i in 0..self.n_equations {
            for j in 0..width {
                if let Slot::Code(idx) = slots[i * width + j] {
                    out[(i, j)] = VM::execute(&self.codes[idx], cols, params, &mut stack);
                }
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::{differentiate, DiffOrder};
    use crate::error::SolveError;
    use crate::model::{ColumnLayout, Variable, VarRole};
    use crate::symbolic::{Expr, TimeOffset};

    fn layout() -> ColumnLayout {
        ColumnLayout::from_variables(&[
            Variable::new("x", VarRole::State),
            Variable::new("y", VarRole::Control),
            Variable::new("e", VarRole::Shock),
        ])
    }

    // Columns: [x(-1), x, y, y(+1), e]
    fn x_cur() -> Expr {
        Expr::var(0, TimeOffset::Current)
    }

    fn y_cur() -> Expr {
        Expr::var(1, TimeOffset::Current)
    }

    #[test]
    fn jacobian_entries_match_hand_derivatives() {
        // r0 = x * y^2, r1 = x(-1) + e
        let r0 = x_cur() * y_cur().powf(2.0);
        let r1 = Expr::var(0, TimeOffset::Lag) + Expr::var(2, TimeOffset::Current);
        let layout = layout();
        let tables = differentiate(&[r0, r1], &layout, DiffOrder::First).expect("builds");

        let cols = [0.0, 2.0, 3.0, 0.0, 0.0];
        let jac = tables.eval_jacobian(&cols, &[]);
        assert!((jac[(0, 1)] - 9.0).abs() < 1e-14, "d r0 / d x = y^2");
        assert!((jac[(0, 2)] - 12.0).abs() < 1e-14, "d r0 / d y = 2xy");
        assert!((jac[(1, 0)] - 1.0).abs() < 1e-14);
        assert!((jac[(1, 4)] - 1.0).abs() < 1e-14);
    }

    #[test]
    fn structural_zeros_survive_differentiation() {
        let r0 = x_cur() * y_cur().powf(2.0);
        let layout = layout();
        let tables = differentiate(&[r0], &layout, DiffOrder::First).expect("builds");

        // r0 never references the shock or the lagged state.
        assert!(tables.is_structural_zero(0, 0));
        assert!(tables.is_structural_zero(0, 4));
        assert!(!tables.is_structural_zero(0, 1));
    }

    #[test]
    fn hessian_is_symmetric_and_flattened_row_major() {
        let r0 = x_cur() * y_cur().powf(2.0);
        let layout = layout();
        let tables = differentiate(&[r0], &layout, DiffOrder::Second).expect("builds");

        let cols = [0.0, 2.0, 3.0, 0.0, 0.0];
        let hess = tables.eval_hessian(&cols, &[]).expect("second order");
        let n = layout.n_columns();
        // d2 r0 / dx dy = 2y at flat columns (1, 2) and (2, 1)
        assert!((hess[(0, n + 2)] - 6.0).abs() < 1e-14);
        assert!((hess[(0, 2 * n + 1)] - 6.0).abs() < 1e-14);
        // d2 r0 / dy dy = 2x
        assert!((hess[(0, 2 * n + 2)] - 4.0).abs() < 1e-14);
        // d2 r0 / dx dx = 0
        assert_eq!(hess[(0, n + 1)], 0.0);
    }

    #[test]
    fn non_differentiable_operators_report_the_equation() {
        let r0 = x_cur();
        let r1 = x_cur().abs() + y_cur();
        let layout = layout();
        let err = differentiate(&[r0, r1], &layout, DiffOrder::First).expect_err("abs");
        assert!(matches!(
            err,
            SolveError::MalformedEquation {
                equation: 1,
                operator: "abs"
            }
        ));
    }

    #[test]
    fn linear_systems_have_all_zero_hessians() {
        let r0 = x_cur() * Expr::param(0) - y_cur();
        let layout = layout();
        let tables = differentiate(&[r0], &layout, DiffOrder::Second).expect("builds");
        let hess = tables.eval_hessian(&[1.0; 5], &[3.0]).expect("second order");
        assert_eq!(hess.amax(), 0.0);
    }
}
