use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure kinds surfaced at the step-solver boundary.
///
/// All four kinds are recoverable: the solver reports them in a
/// [`crate::step::StepReport`] (or returns them eagerly from validation)
/// instead of terminating the process.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum FailureKind {
    /// The linear system of a Newton or SQP iteration cannot be solved.
    /// Caused by a degenerate, redundant, or conflicting constraint set.
    #[error("singular Jacobian: degenerate or redundant constraint set")]
    SingularJacobian,

    /// The iteration cap was reached before the residual (or step) norm
    /// dropped below the required accuracy.
    #[error("failed to converge within the iteration cap")]
    MaxIterExceeded,

    /// A geometric quantity is undefined for the current configuration,
    /// e.g. a zero-length edge, collinear facet nodes, or a dihedral
    /// angle outside the representable (-pi/2, pi/2) range.
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    /// The combination of constraints, goal function and settings cannot
    /// be validated against the crease pattern.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}
