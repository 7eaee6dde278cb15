use thiserror::Error;

/// Failure taxonomy of the engine.
///
/// A rejected time step is *not* an error; the step controller reports it as
/// a [`crate::numerics::transient::StepDecision::Reject`] and the driver
/// retries with a smaller step.
#[derive(Debug, Error)]
pub enum Error {
    /// A residual or Jacobian stencil produced a non-finite intermediate.
    /// Always fatal: the assembled system would silently poison the solve.
    #[error("non-finite {variable} stencil in region `{region}` at node {node}")]
    StencilInvariantViolation {
        region: String,
        node: usize,
        variable: &'static str,
    },

    /// The damped Newton iteration ran out of iterations or recovery
    /// attempts without meeting the tolerance.
    #[error("nonlinear iteration diverged after {iterations} iterations (|f| = {residual:.3e})")]
    NonlinearDivergence { iterations: u32, residual: f64 },

    /// Inconsistent boundary setup detected before any assembly runs.
    #[error("boundary configuration: {0}")]
    BoundaryConfiguration(String),

    /// The Krylov backend failed or returned a non-finite update.
    #[error("linear solve failed")]
    LinearSolveFailed,
}
