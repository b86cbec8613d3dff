//! Step configuration: the active constraint set, the optional goal
//! function, and the numerical settings of one simulation step.

use crate::constraints::Constraint;
use crate::error::FailureKind;
use crate::goal::GoalFunction;
use crate::state::CreasePatternState;
use serde::{Deserialize, Serialize};

/// Numerical knobs of the step solver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SolverSettings {
    /// Required accuracy: residual-norm tolerance in Newton mode, step
    /// and feasibility tolerance in SQP mode.
    pub acc: f64,
    /// Maximum number of iterations per step.
    pub max_iter: usize,
    /// Supply analytic constraint Jacobians to the minimizer. When off,
    /// the SQP mode falls back to finite differences.
    pub use_g_du: bool,
    /// Supply the analytic goal-function gradient to the minimizer.
    pub use_f_du: bool,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            acc: 1e-4,
            max_iter: 100,
            use_g_du: true,
            use_f_du: true,
        }
    }
}

/// Aggregates the constraint evaluators (in a stable, insertion-ordered
/// map, so residual stacking is deterministic), the optional goal
/// function and the solver settings.
pub struct SimulationConfig {
    constraints: Vec<(String, Box<dyn Constraint>)>,
    goal: Option<Box<dyn GoalFunction>>,
    pub settings: SolverSettings,
}

impl SimulationConfig {
    pub fn new() -> Self {
        Self {
            constraints: Vec::new(),
            goal: None,
            settings: SolverSettings::default(),
        }
    }

    pub fn with_constraint(
        mut self,
        name: impl Into<String>,
        constraint: Box<dyn Constraint>,
    ) -> Self {
        self.constraints.push((name.into(), constraint));
        self
    }

    pub fn with_goal(mut self, goal: Box<dyn GoalFunction>) -> Self {
        self.goal = Some(goal);
        self
    }

    pub fn with_settings(mut self, settings: SolverSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The active evaluators in stacking order.
    pub fn constraints(&self) -> impl Iterator<Item = &dyn Constraint> {
        self.constraints.iter().map(|(_, c)| c.as_ref())
    }

    pub fn constraint_names(&self) -> impl Iterator<Item = &str> {
        self.constraints.iter().map(|(n, _)| n.as_str())
    }

    pub fn goal(&self) -> Option<&dyn GoalFunction> {
        self.goal.as_deref()
    }

    /// Eagerly check that the configuration is solvable against a state:
    /// positive tolerance and iteration cap, and every evaluator's own
    /// index-range and conflict checks.
    pub fn validate(&self, state: &CreasePatternState) -> Result<(), FailureKind> {
        if !(self.settings.acc > 0.0) {
            return Err(FailureKind::InvalidConfiguration(
                "accuracy must be positive".into(),
            ));
        }
        if self.settings.max_iter == 0 {
            return Err(FailureKind::InvalidConfiguration(
                "max_iter must be greater than zero".into(),
            ));
        }
        for (name, constraint) in &self.constraints {
            constraint.validate(state).map_err(|e| match e {
                FailureKind::InvalidConfiguration(msg) => {
                    FailureKind::InvalidConfiguration(format!("constraint '{}': {}", name, msg))
                }
                other => other,
            })?;
        }
        if let Some(goal) = &self.goal {
            goal.validate(state)?;
        }
        Ok(())
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self::new()
    }
}
