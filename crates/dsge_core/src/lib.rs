pub mod derivatives;
pub mod error;
pub mod evaluator;
pub mod klein;
pub mod model;
pub mod qz;
pub mod second_order;
pub mod steady_state;
/// The `dsge_core` crate provides the solution engine for rational-expectations
/// models: declare variables, parameters and equilibrium equations, and obtain
/// perturbation decision rules around the deterministic steady state.
///
/// Key components:
/// - **Model**: declaration, validation and the solve pipeline with result caching.
/// - **Symbolic/Evaluator**: expression trees compiled to a small bytecode VM.
/// - **Derivatives**: analytic Jacobian and Hessian tables over the evaluation columns.
/// - **Steady state**: damped Newton with closed-form pinning and verification.
/// - **QZ/Klein**: complex generalized Schur decomposition and the first-order solver.
/// - **Second order**: quadratic policy coefficients and variance risk corrections.
pub mod symbolic;
