pub mod config;
pub mod constraints;
pub mod error;
pub mod goal;
pub mod history;
pub mod state;
/// The `pleat_core` crate provides the simulation engine for Pleat, a
/// crease-pattern forming toolkit. A folded shape is driven from a flat
/// (or pre-displaced) reference configuration by solving constrained
/// kinematics step by step over a pseudo-time interval.
///
/// Key components:
/// - **State**: `CreasePattern` (nodes, edges, facets, interior edges) and
///   `CreasePatternState` (displacement DOFs, lengths, dihedral angles and
///   their analytic gradients).
/// - **Constraints**: pluggable residual/Jacobian evaluators (`FixedDofs`,
///   `LinkedDofs`, `ConstantLength`, `PsiConstraints`).
/// - **Goal**: `PotentialEnergy` objective (point loads plus optional
///   bending springs) for the minimization mode.
/// - **Step**: `solve_step`, a Newton root-finder when no goal is set and
///   an equality-constrained SQP minimizer when one is.
/// - **History**: `run_steps`/`run_times`, marching the step solver over a
///   time sequence with warm starts.
pub mod step;

pub use config::{SimulationConfig, SolverSettings};
pub use constraints::{
    fix, fix_with, ConstantLength, Constraint, DofLink, DofTarget, FixedDofs, LinkedDofs,
    PsiConstraints, PsiGroup, Target,
};
pub use error::FailureKind;
pub use goal::{GoalFunction, PointLoad, PotentialEnergy};
pub use history::{run_steps, run_times, SimulationHistory};
pub use state::{dof, CreasePattern, CreasePatternState, InteriorEdge};
pub use step::{solve_step, StepReport};
