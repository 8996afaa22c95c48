use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Range;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::derivatives::{differentiate, DerivativeTables, DiffOrder};
use crate::error::{Result, SolveError};
use crate::evaluator::{compile, Bytecode};
use crate::klein::{solve_first_order, EigenReport, Eigenstructure, FirstOrderPolicy, KleinSettings};
use crate::second_order::{solve_second_order, SecondOrderPolicy, SecondOrderSettings};
use crate::steady_state::{resolve_steady_state, SteadyState, SteadyStateSettings};
use crate::symbolic::{Expr, TimeOffset, VarRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarRole {
    /// Enters with a one-period lag; its current value is chosen today.
    State,
    /// Jumps freely; may appear one period ahead under expectation.
    Control,
    /// Exogenous innovation, white noise with the declared covariance.
    Shock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    name: String,
    role: VarRole,
}

impl Variable {
    pub fn new(name: impl Into<String>, role: VarRole) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> VarRole {
        self.role
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    name: String,
    value: f64,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// A single model equation, stored as a residual that must vanish.
#[derive(Debug, Clone)]
pub struct Equation {
    residual: Expr,
}

impl Equation {
    pub fn new(residual: Expr) -> Self {
        Self { residual }
    }

    /// Builds the residual `lhs - rhs`.
    pub fn balance(lhs: Expr, rhs: Expr) -> Self {
        Self {
            residual: lhs - rhs,
        }
    }

    pub fn residual(&self) -> &Expr {
        &self.residual
    }
}

/// Fixed enumeration of the evaluation columns. Variables are grouped by
/// role and the blocks always appear in the order lagged states, current
/// states, current controls, led controls, current shocks; within a block
/// the declaration order is kept.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnLayout {
    roles: Vec<VarRole>,
    states: Vec<usize>,
    controls: Vec<usize>,
    shocks: Vec<usize>,
    columns: Vec<VarRef>,
    slots: HashMap<VarRef, usize>,
}

impl ColumnLayout {
    pub fn from_variables(variables: &[Variable]) -> Self {
        let roles: Vec<VarRole> = variables.iter().map(|v| v.role()).collect();
        let by_role = |wanted: VarRole| -> Vec<usize> {
            roles
                .iter()
                .enumerate()
                .filter(|(_, r)| **r == wanted)
                .map(|(i, _)| i)
                .collect()
        };
        let states = by_role(VarRole::State);
        let controls = by_role(VarRole::Control);
        let shocks = by_role(VarRole::Shock);

        let mut columns = Vec::with_capacity(2 * states.len() + 2 * controls.len() + shocks.len());
        for &var in &states {
            columns.push(VarRef {
                var,
                offset: TimeOffset::Lag,
            });
        }
        for &var in &states {
            columns.push(VarRef {
                var,
                offset: TimeOffset::Current,
            });
        }
        for &var in &controls {
            columns.push(VarRef {
                var,
                offset: TimeOffset::Current,
            });
        }
        for &var in &controls {
            columns.push(VarRef {
                var,
                offset: TimeOffset::Lead,
            });
        }
        for &var in &shocks {
            columns.push(VarRef {
                var,
                offset: TimeOffset::Current,
            });
        }
        let slots = columns.iter().enumerate().map(|(i, r)| (*r, i)).collect();
        Self {
            roles,
            states,
            controls,
            shocks,
            columns,
            slots,
        }
    }

    pub fn n_variables(&self) -> usize {
        self.roles.len()
    }

    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    pub fn n_controls(&self) -> usize {
        self.controls.len()
    }

    pub fn n_shocks(&self) -> usize {
        self.shocks.len()
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn role(&self, var: usize) -> VarRole {
        self.roles[var]
    }

    /// Declared indices of the state variables, in declaration order.
    pub fn states(&self) -> &[usize] {
        &self.states
    }

    pub fn controls(&self) -> &[usize] {
        &self.controls
    }

    pub fn shocks(&self) -> &[usize] {
        &self.shocks
    }

    pub fn columns(&self) -> &[VarRef] {
        &self.columns
    }

    pub fn slot_map(&self) -> &HashMap<VarRef, usize> {
        &self.slots
    }

    pub fn states_lag_range(&self) -> Range<usize> {
        0..self.n_states()
    }

    pub fn states_current_range(&self) -> Range<usize> {
        let ns = self.n_states();
        ns..2 * ns
    }

    pub fn controls_current_range(&self) -> Range<usize> {
        let start = 2 * self.n_states();
        start..start + self.n_controls()
    }

    pub fn controls_lead_range(&self) -> Range<usize> {
        let start = 2 * self.n_states() + self.n_controls();
        start..start + self.n_controls()
    }

    pub fn shocks_range(&self) -> Range<usize> {
        let start = 2 * self.n_states() + 2 * self.n_controls();
        start..start + self.n_shocks()
    }

    /// Replicates one value per variable across every column that refers to
    /// it, which is exactly the steady-state evaluation point.
    pub fn broadcast_steady(&self, values: &[f64]) -> Vec<f64> {
        self.columns.iter().map(|r| values[r.var]).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveOrder {
    First,
    Second,
}

/// Everything a solve run needs besides the model itself. Two runs with
/// equal settings on an unchanged model return the cached result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolveSettings {
    pub steady_state: SteadyStateSettings,
    pub klein: KleinSettings,
    pub second_order: SecondOrderSettings,
    /// Steady-state starting values by variable name. Unnamed variables
    /// start at one, shocks at zero.
    pub guess: Vec<(String, f64)>,
    /// Closed-form steady-state values by variable name; these are removed
    /// from the Newton unknowns and verified against the equations.
    pub pinned: Vec<(String, f64)>,
}

/// Decision rules in deviations from the steady state, evaluated at unit
/// shock scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyFunction {
    pub first: FirstOrderPolicy,
    pub second: Option<SecondOrderPolicy>,
}

impl PolicyFunction {
    /// Control deviations for the given state deviations and realized
    /// innovations. Lengths must match the declared states and shocks.
    pub fn project(&self, state_deviation: &DVector<f64>, shocks: &DVector<f64>) -> DVector<f64> {
        let mut out =
            &self.first.control_state * state_deviation + &self.first.control_shock * shocks;
        if let Some(second) = &self.second {
            let u = stack_augmented(state_deviation, shocks);
            for b in 0..out.len() {
                let block = second.control_block(b);
                out[b] += 0.5 * (u.transpose() * block * &u)[(0, 0)];
                out[b] += 0.5 * second.control_risk[b];
            }
        }
        out
    }

    /// Next-period state deviations under the same conventions.
    pub fn next_state(&self, state_deviation: &DVector<f64>, shocks: &DVector<f64>) -> DVector<f64> {
        let mut out =
            &self.first.state_state * state_deviation + &self.first.state_shock * shocks;
        if let Some(second) = &self.second {
            let u = stack_augmented(state_deviation, shocks);
            for i in 0..out.len() {
                let block = second.state_block(i);
                out[i] += 0.5 * (u.transpose() * block * &u)[(0, 0)];
                out[i] += 0.5 * second.state_risk[i];
            }
        }
        out
    }
}

fn stack_augmented(state_deviation: &DVector<f64>, shocks: &DVector<f64>) -> DVector<f64> {
    let ns = state_deviation.len();
    DVector::from_fn(ns + shocks.len(), |i, _| {
        if i < ns {
            state_deviation[i]
        } else {
            shocks[i - ns]
        }
    })
}

/// Complete output of a solve run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub steady_state: SteadyState,
    pub eigen: EigenReport,
    pub policy: PolicyFunction,
}

struct Derived {
    settings: SolveSettings,
    order: SolveOrder,
    solution: Solution,
    eigen: Eigenstructure,
    jacobian: DMatrix<f64>,
    cols: Vec<f64>,
}

/// A declared model together with its compiled equations and derivative
/// tables.
///
/// Construction validates the declarations, compiles every residual to
/// bytecode and builds the first-order tables; the Hessian tables are added
/// lazily the first time a second-order solve needs them. Solve results are
/// cached until a parameter or the shock covariance changes.
pub struct Model {
    variables: Vec<Variable>,
    parameters: Vec<Parameter>,
    equations: Vec<Equation>,
    layout: ColumnLayout,
    bytecode: Vec<Bytecode>,
    tables: DerivativeTables,
    param_values: Vec<f64>,
    shock_covariance: DMatrix<f64>,
    derived: Option<Derived>,
}

impl Model {
    /// Validates and compiles a model. Equation expressions refer to
    /// variables and parameters by declaration index.
    pub fn new(
        variables: Vec<Variable>,
        parameters: Vec<Parameter>,
        equations: Vec<Equation>,
    ) -> Result<Self> {
        if variables.is_empty() {
            return Err(SolveError::InvalidModel {
                reason: "at least one variable must be declared".to_owned(),
            });
        }
        let mut names = HashSet::new();
        for variable in &variables {
            if !names.insert(variable.name.as_str()) {
                return Err(SolveError::InvalidModel {
                    reason: format!("duplicate variable name `{}`", variable.name),
                });
            }
        }
        let mut parameter_names = HashSet::new();
        for parameter in &parameters {
            if !parameter_names.insert(parameter.name.as_str()) {
                return Err(SolveError::InvalidModel {
                    reason: format!("duplicate parameter name `{}`", parameter.name),
                });
            }
            if names.contains(parameter.name.as_str()) {
                return Err(SolveError::InvalidModel {
                    reason: format!(
                        "`{}` is declared as both a variable and a parameter",
                        parameter.name
                    ),
                });
            }
            if !parameter.value.is_finite() {
                return Err(SolveError::InvalidModel {
                    reason: format!("parameter `{}` has a non-finite value", parameter.name),
                });
            }
        }

        let layout = ColumnLayout::from_variables(&variables);
        let expected = layout.n_states() + layout.n_controls();
        if equations.len() != expected {
            return Err(SolveError::InvalidModel {
                reason: format!(
                    "{} equations declared for {} state and control variables",
                    equations.len(),
                    expected
                ),
            });
        }

        let mut used_variables = vec![false; variables.len()];
        let mut used_current = vec![false; variables.len()];
        let mut used_lead = vec![false; variables.len()];
        for (index, equation) in equations.iter().enumerate() {
            let mut references = BTreeSet::new();
            equation.residual.collect_var_refs(&mut references);
            for reference in references {
                if reference.var >= variables.len() {
                    return Err(SolveError::InvalidModel {
                        reason: format!(
                            "equation {index} references undeclared variable index {}",
                            reference.var
                        ),
                    });
                }
                let role = layout.role(reference.var);
                if !offset_allowed(role, reference.offset) {
                    return Err(SolveError::InvalidModel {
                        reason: format!(
                            "variable `{}` may not appear at offset {:?} in equation {index}",
                            variables[reference.var].name, reference.offset
                        ),
                    });
                }
                used_variables[reference.var] = true;
                match reference.offset {
                    TimeOffset::Current => used_current[reference.var] = true,
                    TimeOffset::Lead => used_lead[reference.var] = true,
                    TimeOffset::Lag => {}
                }
            }
            let mut parameter_refs = BTreeSet::new();
            equation.residual.collect_params(&mut parameter_refs);
            for reference in parameter_refs {
                if reference >= parameters.len() {
                    return Err(SolveError::InvalidModel {
                        reason: format!(
                            "equation {index} references undeclared parameter index {reference}"
                        ),
                    });
                }
            }
        }
        for (index, used) in used_variables.iter().enumerate() {
            if !used {
                return Err(SolveError::InvalidModel {
                    reason: format!(
                        "variable `{}` never appears in the equations",
                        variables[index].name
                    ),
                });
            }
        }
        for index in 0..variables.len() {
            if used_lead[index] && !used_current[index] {
                return Err(SolveError::InvalidModel {
                    reason: format!(
                        "control `{}` appears at t+1 but never at t",
                        variables[index].name
                    ),
                });
            }
        }

        let residuals: Vec<Expr> = equations.iter().map(|e| e.residual.clone()).collect();
        let bytecode = residuals
            .iter()
            .map(|r| compile(r, layout.slot_map()))
            .collect::<Result<Vec<_>>>()?;
        let tables = differentiate(&residuals, &layout, DiffOrder::First)?;
        let param_values = parameters.iter().map(|p| p.value).collect();
        let shock_covariance = DMatrix::identity(layout.n_shocks(), layout.n_shocks());

        Ok(Self {
            variables,
            parameters,
            equations,
            layout,
            bytecode,
            tables,
            param_values,
            shock_covariance,
            derived: None,
        })
    }

    pub fn layout(&self) -> &ColumnLayout {
        &self.layout
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<f64> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value)
    }

    pub fn shock_covariance(&self) -> &DMatrix<f64> {
        &self.shock_covariance
    }

    /// Updates one parameter and drops any cached solution.
    pub fn set_parameter(&mut self, name: &str, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(SolveError::Precondition {
                reason: "parameter value must be finite",
            });
        }
        let index = self
            .parameters
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| SolveError::InvalidModel {
                reason: format!("unknown parameter `{name}`"),
            })?;
        self.parameters[index].value = value;
        self.param_values[index] = value;
        self.derived = None;
        Ok(())
    }

    pub fn set_parameters(&mut self, values: &[(String, f64)]) -> Result<()> {
        for (name, value) in values {
            self.set_parameter(name, *value)?;
        }
        Ok(())
    }

    /// Replaces the innovation covariance. The matrix must be symmetric
    /// with one row per declared shock.
    pub fn set_shock_covariance(&mut self, covariance: DMatrix<f64>) -> Result<()> {
        let ne = self.layout.n_shocks();
        if covariance.nrows() != ne || covariance.ncols() != ne {
            return Err(SolveError::Precondition {
                reason: "shock covariance shape mismatches the declarations",
            });
        }
        if !covariance.iter().all(|v| v.is_finite()) {
            return Err(SolveError::Precondition {
                reason: "shock covariance must be finite",
            });
        }
        let scale = 1.0 + covariance.amax();
        if (&covariance - covariance.transpose()).amax() > 1e-12 * scale {
            return Err(SolveError::Precondition {
                reason: "shock covariance must be symmetric",
            });
        }
        self.shock_covariance = covariance;
        self.derived = None;
        Ok(())
    }

    /// Cached solution from the most recent successful solve, if the model
    /// has not been modified since.
    pub fn solution(&self) -> Option<&Solution> {
        self.derived.as_ref().map(|d| &d.solution)
    }

    /// Runs the pipeline up to the requested order, reusing cached results
    /// where the settings allow. A first-order solution cached under equal
    /// settings is extended in place when second order is requested; its
    /// steady state, Jacobian and Schur factors are not recomputed.
    pub fn solve(&mut self, order: SolveOrder, settings: &SolveSettings) -> Result<Solution> {
        match self.derived.take() {
            Some(cached) if cached.settings == *settings => {
                match (cached.order, order) {
                    (SolveOrder::First, SolveOrder::First)
                    | (SolveOrder::Second, SolveOrder::Second) => {
                        let solution = cached.solution.clone();
                        self.derived = Some(cached);
                        Ok(solution)
                    }
                    (SolveOrder::Second, SolveOrder::First) => {
                        let mut solution = cached.solution.clone();
                        solution.policy.second = None;
                        self.derived = Some(cached);
                        Ok(solution)
                    }
                    (SolveOrder::First, SolveOrder::Second) => self.upgrade_to_second(cached),
                }
            }
            _ => self.derive(order, settings),
        }
    }

    /// Applies parameter updates and solves in one call, the intended entry
    /// for parameter sweeps: the symbolic and compiled tables are reused
    /// untouched across every point of the sweep.
    pub fn resolve_with(
        &mut self,
        updates: &[(String, f64)],
        order: SolveOrder,
        settings: &SolveSettings,
    ) -> Result<Solution> {
        self.set_parameters(updates)?;
        self.solve(order, settings)
    }

    /// Computes a solution without reading or writing the cached slot. When
    /// the second-order tables have not been built yet they are derived for
    /// this call only and discarded.
    pub fn solve_fresh(&self, order: SolveOrder, settings: &SolveSettings) -> Result<Solution> {
        if order == SolveOrder::Second && !self.tables.has_hessian() {
            let residuals: Vec<Expr> = self.equations.iter().map(|e| e.residual.clone()).collect();
            let tables = differentiate(&residuals, &self.layout, DiffOrder::Second)?;
            return Ok(self.compute(&tables, order, settings)?.0);
        }
        Ok(self.compute(&self.tables, order, settings)?.0)
    }

    fn derive(&mut self, order: SolveOrder, settings: &SolveSettings) -> Result<Solution> {
        self.derived = None;
        if order == SolveOrder::Second {
            self.ensure_hessian()?;
        }
        let (solution, eigen, jacobian, cols) = self.compute(&self.tables, order, settings)?;
        self.derived = Some(Derived {
            settings: settings.clone(),
            order,
            solution: solution.clone(),
            eigen,
            jacobian,
            cols,
        });
        Ok(solution)
    }

    fn compute(
        &self,
        tables: &DerivativeTables,
        order: SolveOrder,
        settings: &SolveSettings,
    ) -> Result<(Solution, Eigenstructure, DMatrix<f64>, Vec<f64>)> {
        let guess = self.resolve_guess(&settings.guess)?;
        let pinned = self.resolve_pins(&settings.pinned)?;

        let steady_state = resolve_steady_state(
            &self.bytecode,
            tables,
            &self.layout,
            &self.param_values,
            &guess,
            &pinned,
            &settings.steady_state,
        )?;
        let cols = self.layout.broadcast_steady(&steady_state.values);
        let jacobian = tables.eval_jacobian(&cols, &self.param_values);
        let (first, eigen) = solve_first_order(&jacobian, &self.layout, &settings.klein)?;

        let second = if order == SolveOrder::Second {
            let hessian = tables.eval_hessian(&cols, &self.param_values).ok_or(
                SolveError::Precondition {
                    reason: "second-order derivative tables unavailable",
                },
            )?;
            Some(solve_second_order(
                &jacobian,
                &hessian,
                &self.layout,
                &first,
                &eigen,
                &self.shock_covariance,
                &settings.second_order,
            )?)
        } else {
            None
        };

        let solution = Solution {
            steady_state,
            eigen: EigenReport::from(&eigen),
            policy: PolicyFunction { first, second },
        };
        Ok((solution, eigen, jacobian, cols))
    }

    fn upgrade_to_second(&mut self, mut cached: Derived) -> Result<Solution> {
        self.ensure_hessian()?;
        let hessian = self
            .tables
            .eval_hessian(&cached.cols, &self.param_values)
            .ok_or(SolveError::Precondition {
                reason: "second-order derivative tables unavailable",
            })?;
        let second = solve_second_order(
            &cached.jacobian,
            &hessian,
            &self.layout,
            &cached.solution.policy.first,
            &cached.eigen,
            &self.shock_covariance,
            &cached.settings.second_order,
        )?;
        cached.solution.policy.second = Some(second);
        cached.order = SolveOrder::Second;
        let solution = cached.solution.clone();
        self.derived = Some(cached);
        Ok(solution)
    }

    fn ensure_hessian(&mut self) -> Result<()> {
        if self.tables.has_hessian() {
            return Ok(());
        }
        let residuals: Vec<Expr> = self.equations.iter().map(|e| e.residual.clone()).collect();
        self.tables = differentiate(&residuals, &self.layout, DiffOrder::Second)?;
        Ok(())
    }

    fn variable_index(&self, name: &str, context: &str) -> Result<usize> {
        self.variables
            .iter()
            .position(|v| v.name == name)
            .ok_or_else(|| SolveError::InvalidModel {
                reason: format!("unknown variable `{name}` in the {context}"),
            })
    }

    fn resolve_guess(&self, named: &[(String, f64)]) -> Result<Vec<f64>> {
        let mut guess: Vec<f64> = self
            .variables
            .iter()
            .map(|v| match v.role() {
                VarRole::Shock => 0.0,
                _ => 1.0,
            })
            .collect();
        for (name, value) in named {
            let index = self.variable_index(name, "initial guess")?;
            guess[index] = *value;
        }
        Ok(guess)
    }

    fn resolve_pins(&self, named: &[(String, f64)]) -> Result<Vec<(usize, f64)>> {
        named
            .iter()
            .map(|(name, value)| {
                self.variable_index(name, "closed-form values")
                    .map(|index| (index, *value))
            })
            .collect()
    }
}

fn offset_allowed(role: VarRole, offset: TimeOffset) -> bool {
    matches!(
        (role, offset),
        (VarRole::State, TimeOffset::Lag)
            | (VarRole::State, TimeOffset::Current)
            | (VarRole::Control, TimeOffset::Current)
            | (VarRole::Control, TimeOffset::Lead)
            | (VarRole::Shock, TimeOffset::Current)
    )
}
