use thiserror::Error;

use crate::qz::GeneralizedEigenvalue;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SolveError>;

/// Failure taxonomy for model construction and the solver pipeline.
///
/// Every fallible operation returns one of these variants; no stage papers
/// over a failure by substituting a default artifact.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveError {
    /// The declarations do not form a solvable system.
    #[error("invalid model: {reason}")]
    InvalidModel { reason: String },

    /// An equation applies an operator with no derivative (`abs`, `signum`)
    /// to a subexpression that depends on a variable.
    #[error("equation {equation} is not differentiable: `{operator}` applied to a variable expression")]
    MalformedEquation {
        equation: usize,
        operator: &'static str,
    },

    /// Closed-form steady-state values failed verification against the
    /// full equation system.
    #[error("supplied steady state leaves residual {residual_norm:.3e} (worst in equation {worst_equation})")]
    SteadyStateInconsistent {
        residual_norm: f64,
        worst_equation: usize,
    },

    /// The steady-state iteration ran out of steps. Carries the last iterate
    /// so callers can inspect where the search stalled.
    #[error("steady state did not converge after {iterations} iterations (residual {residual_norm:.3e})")]
    NoConvergence {
        iterations: usize,
        residual_norm: f64,
        last_iterate: Vec<f64>,
    },

    /// A matrix that must be inverted, or a pencil that must be regular,
    /// is singular.
    #[error("{what} is singular")]
    NonInvertible { what: &'static str },

    /// Too few unstable eigenvalues relative to forward-looking variables:
    /// the model admits multiple bounded solutions.
    #[error("indeterminate model: {unstable} unstable eigenvalues for {controls} forward-looking variables{note}")]
    Indeterminacy {
        unstable: usize,
        controls: usize,
        eigenvalues: Vec<GeneralizedEigenvalue>,
        note: String,
    },

    /// Too many unstable eigenvalues: no bounded solution exists.
    #[error("explosive model: {unstable} unstable eigenvalues for {controls} forward-looking variables")]
    Instability {
        unstable: usize,
        controls: usize,
        eigenvalues: Vec<GeneralizedEigenvalue>,
    },

    /// The QZ iteration exhausted its sweep budget before the pencil
    /// became triangular.
    #[error("generalized Schur iteration did not converge within {sweeps} sweeps")]
    SchurNoConvergence { sweeps: usize },

    /// An operation ran before its inputs were available or with inputs of
    /// the wrong shape.
    #[error("precondition violated: {reason}")]
    Precondition { reason: &'static str },

    /// A shifted second-order coefficient system is singular. Carries the
    /// eigenvalue pair whose shift produced the degenerate system; the risk
    /// correction reports the unit pair because constants propagate with
    /// unit eigenvalue.
    #[error("second-order coefficient system is singular at eigenvalue pair (alpha = {alpha}, beta = {beta})")]
    SylvesterSingular {
        alpha: num_complex::Complex<f64>,
        beta: num_complex::Complex<f64>,
    },
}
