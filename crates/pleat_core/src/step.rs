//! The simulation step solver.
//!
//! One step drives the crease-pattern state to the target time `t` in one
//! of two mutually exclusive modes, selected by the presence of a goal
//! function in the configuration:
//!
//! - **Newton-Raphson** (no goal): drive the stacked constraint residual
//!   to zero. Square systems are solved by LU; under-determined systems
//!   take the minimum-norm SVD update.
//! - **SQP** (goal present): minimize the goal subject to the residuals
//!   as equality constraints, by iterating on the unit-metric KKT system
//!   `[[I, A^T], [A, 0]] [d, lambda] = [-g, -c]`.
//!
//! Both modes mutate the DOF vector in place during the search and
//! restore it on every failure path, so a failed solve never leaves the
//! state partially updated. Non-convergence is reported in the
//! [`StepReport`], not raised; only eager validation returns an error.

use crate::config::SimulationConfig;
use crate::error::FailureKind;
use crate::goal::GoalFunction;
use crate::state::CreasePatternState;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Outcome of one step solve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    /// Target time of the step.
    pub t: f64,
    /// Flattened displacement vector after the solve. On failure this is
    /// the restored pre-solve vector.
    pub u: Vec<f64>,
    pub converged: bool,
    pub iterations: usize,
    /// Constraint residual norm at exit (`NaN` if never evaluated).
    pub residual_norm: f64,
    /// Goal-function value at exit; `None` in Newton mode.
    pub objective: Option<f64>,
    pub failure: Option<FailureKind>,
}

/// Solve one simulation step at time `t`, writing the converged
/// displacement back into the state.
///
/// Configuration and geometry problems that can be detected eagerly are
/// returned as `Err`; solver failures (singular system, iteration cap,
/// mid-iteration degeneracy) are reported in the `Ok` report with the
/// pre-solve displacement restored.
pub fn solve_step(
    state: &mut CreasePatternState,
    config: &SimulationConfig,
    t: f64,
) -> Result<StepReport, FailureKind> {
    config.validate(state)?;
    match config.goal() {
        None => Ok(solve_newton(state, config, t)),
        Some(goal) => Ok(solve_sqp(state, config, goal, t)),
    }
}

// ---------------------------------------------------------------------
// Residual / Jacobian stacking
// ---------------------------------------------------------------------

/// Vertical stacking of every evaluator's residual, in configuration
/// order. An empty active set yields a zero-row vector.
fn stack_residuals(
    state: &CreasePatternState,
    config: &SimulationConfig,
    t: f64,
) -> Result<DVector<f64>, FailureKind> {
    let parts: Vec<DVector<f64>> = config
        .constraints()
        .map(|c| c.residual(state, t))
        .collect::<Result<_, _>>()?;
    let rows = parts.iter().map(|p| p.len()).sum();
    let mut stacked = DVector::zeros(rows);
    let mut offset = 0;
    for part in parts {
        stacked.rows_mut(offset, part.len()).copy_from(&part);
        offset += part.len();
    }
    Ok(stacked)
}

/// Vertical stacking of every evaluator's Jacobian rows.
fn stack_jacobians(
    state: &CreasePatternState,
    config: &SimulationConfig,
    t: f64,
) -> Result<DMatrix<f64>, FailureKind> {
    let parts: Vec<DMatrix<f64>> = config
        .constraints()
        .map(|c| c.jacobian(state, t))
        .collect::<Result<_, _>>()?;
    let rows = parts.iter().map(|p| p.nrows()).sum();
    let mut stacked = DMatrix::zeros(rows, state.n_dofs());
    let mut offset = 0;
    for part in parts {
        stacked.rows_mut(offset, part.nrows()).copy_from(&part);
        offset += part.nrows();
    }
    Ok(stacked)
}

/// Solve `J * delta = rhs`. Square systems go through LU; rectangular
/// (under-determined) systems take the minimum-norm SVD solution, with a
/// row-rank check so redundant or conflicting constraints surface as a
/// singular system rather than a silent least-squares fit.
fn solve_linear(jacobian: &DMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>, FailureKind> {
    if jacobian.nrows() == jacobian.ncols() {
        return jacobian
            .clone()
            .lu()
            .solve(rhs)
            .ok_or(FailureKind::SingularJacobian);
    }
    let svd = jacobian.clone().svd(true, true);
    let max_sv = svd.singular_values.iter().cloned().fold(0.0_f64, f64::max);
    if !(max_sv > 0.0) {
        return Err(FailureKind::SingularJacobian);
    }
    let eps = max_sv * 1e-10;
    if svd.rank(eps) < jacobian.nrows() {
        return Err(FailureKind::SingularJacobian);
    }
    svd.solve(rhs, eps).map_err(|_| FailureKind::SingularJacobian)
}

// ---------------------------------------------------------------------
// Mode A: Newton-Raphson equality solve
// ---------------------------------------------------------------------

fn solve_newton(state: &mut CreasePatternState, config: &SimulationConfig, t: f64) -> StepReport {
    let settings = config.settings;
    let u_save = state.dof_vector();
    let mut iterations = 0usize;
    let mut residual_norm = f64::NAN;

    let fail = |state: &mut CreasePatternState, kind, iterations, residual_norm| {
        state.set_dof_vector(&u_save);
        StepReport {
            t,
            u: u_save.iter().copied().collect(),
            converged: false,
            iterations,
            residual_norm,
            objective: None,
            failure: Some(kind),
        }
    };

    loop {
        let residual = match stack_residuals(state, config, t) {
            Ok(r) => r,
            Err(kind) => return fail(state, kind, iterations, residual_norm),
        };
        if residual.is_empty() {
            // No active constraints: the step degenerates to a no-op.
            return StepReport {
                t,
                u: state.dof_vector().iter().copied().collect(),
                converged: true,
                iterations: 0,
                residual_norm: 0.0,
                objective: None,
                failure: None,
            };
        }
        residual_norm = residual.norm();
        if !residual_norm.is_finite() {
            return fail(
                state,
                FailureKind::DegenerateGeometry("non-finite constraint residual".into()),
                iterations,
                residual_norm,
            );
        }
        if residual_norm < settings.acc {
            return StepReport {
                t,
                u: state.dof_vector().iter().copied().collect(),
                converged: true,
                iterations,
                residual_norm,
                objective: None,
                failure: None,
            };
        }
        if iterations >= settings.max_iter {
            return fail(state, FailureKind::MaxIterExceeded, iterations, residual_norm);
        }

        let jacobian = match stack_jacobians(state, config, t) {
            Ok(j) => j,
            Err(kind) => return fail(state, kind, iterations, residual_norm),
        };
        let rhs = residual.map(|v| -v);
        let delta = match solve_linear(&jacobian, &rhs) {
            Ok(d) => d,
            Err(kind) => return fail(state, kind, iterations, residual_norm),
        };

        let u = state.dof_vector() + delta;
        state.set_dof_vector(&u);
        iterations += 1;
    }
}

// ---------------------------------------------------------------------
// Mode B: SQP-style constrained minimization
// ---------------------------------------------------------------------

fn solve_sqp(
    state: &mut CreasePatternState,
    config: &SimulationConfig,
    goal: &dyn GoalFunction,
    t: f64,
) -> StepReport {
    let settings = config.settings;
    let u_save = state.dof_vector();
    let n = state.n_dofs();
    let mut iterations = 0usize;
    let mut residual_norm = f64::NAN;
    let mut objective = f64::NAN;

    let fail = |state: &mut CreasePatternState, kind, iterations, residual_norm, objective: f64| {
        state.set_dof_vector(&u_save);
        StepReport {
            t,
            u: u_save.iter().copied().collect(),
            converged: false,
            iterations,
            residual_norm,
            objective: if objective.is_finite() {
                Some(objective)
            } else {
                None
            },
            failure: Some(kind),
        }
    };

    // Finite-difference step scaled to the initial objective magnitude.
    let f0 = match goal.value(state, t) {
        Ok(f) => f,
        Err(kind) => return fail(state, kind, iterations, residual_norm, objective),
    };
    let fd_eps = (f0.abs() * 1e-4).max(1e-8);

    loop {
        let constraint = match stack_residuals(state, config, t) {
            Ok(c) => c,
            Err(kind) => return fail(state, kind, iterations, residual_norm, objective),
        };
        residual_norm = if constraint.is_empty() {
            0.0
        } else {
            constraint.norm()
        };
        objective = match goal.value(state, t) {
            Ok(f) => f,
            Err(kind) => return fail(state, kind, iterations, residual_norm, objective),
        };
        if !residual_norm.is_finite() || !objective.is_finite() {
            return fail(
                state,
                FailureKind::DegenerateGeometry("non-finite objective or residual".into()),
                iterations,
                residual_norm,
                objective,
            );
        }

        let gradient = if settings.use_f_du {
            goal.gradient(state, t)
        } else {
            fd_gradient(state, goal, t, fd_eps)
        };
        let gradient = match gradient {
            Ok(g) => g,
            Err(kind) => return fail(state, kind, iterations, residual_norm, objective),
        };
        let jacobian = if settings.use_g_du {
            stack_jacobians(state, config, t)
        } else {
            fd_jacobian(state, config, t, fd_eps, constraint.len())
        };
        let jacobian = match jacobian {
            Ok(a) => a,
            Err(kind) => return fail(state, kind, iterations, residual_norm, objective),
        };

        // Unit-metric KKT system of the quadratic subproblem.
        let m = constraint.len();
        let mut kkt = DMatrix::zeros(n + m, n + m);
        for i in 0..n {
            kkt[(i, i)] = 1.0;
        }
        for row in 0..m {
            for col in 0..n {
                kkt[(n + row, col)] = jacobian[(row, col)];
                kkt[(col, n + row)] = jacobian[(row, col)];
            }
        }
        let mut rhs = DVector::zeros(n + m);
        for i in 0..n {
            rhs[i] = -gradient[i];
        }
        for row in 0..m {
            rhs[n + row] = -constraint[row];
        }

        let solution = match kkt.lu().solve(&rhs) {
            Some(s) => s,
            None => {
                return fail(
                    state,
                    FailureKind::SingularJacobian,
                    iterations,
                    residual_norm,
                    objective,
                )
            }
        };
        let step = solution.rows(0, n).into_owned();

        if step.norm() < settings.acc && residual_norm < settings.acc {
            return StepReport {
                t,
                u: state.dof_vector().iter().copied().collect(),
                converged: true,
                iterations,
                residual_norm,
                objective: Some(objective),
                failure: None,
            };
        }
        if iterations >= settings.max_iter {
            return fail(
                state,
                FailureKind::MaxIterExceeded,
                iterations,
                residual_norm,
                objective,
            );
        }

        let u = state.dof_vector() + step;
        state.set_dof_vector(&u);
        iterations += 1;
    }
}

/// Central finite-difference gradient of the goal function.
fn fd_gradient(
    state: &mut CreasePatternState,
    goal: &dyn GoalFunction,
    t: f64,
    eps: f64,
) -> Result<DVector<f64>, FailureKind> {
    let n = state.n_dofs();
    let mut g = DVector::zeros(n);
    for d in 0..n {
        let node = d / 3;
        let comp = d % 3;
        let base = state.u()[node][comp];

        state.u_mut()[node][comp] = base + eps;
        let fp = goal.value(state, t);
        state.u_mut()[node][comp] = base - eps;
        let fm = goal.value(state, t);
        state.u_mut()[node][comp] = base;

        g[d] = (fp? - fm?) / (2.0 * eps);
    }
    Ok(g)
}

/// Central finite-difference constraint Jacobian, one DOF column at a time.
fn fd_jacobian(
    state: &mut CreasePatternState,
    config: &SimulationConfig,
    t: f64,
    eps: f64,
    rows: usize,
) -> Result<DMatrix<f64>, FailureKind> {
    let n = state.n_dofs();
    let mut j = DMatrix::zeros(rows, n);
    for d in 0..n {
        let node = d / 3;
        let comp = d % 3;
        let base = state.u()[node][comp];

        state.u_mut()[node][comp] = base + eps;
        let rp = stack_residuals(state, config, t);
        state.u_mut()[node][comp] = base - eps;
        let rm = stack_residuals(state, config, t);
        state.u_mut()[node][comp] = base;

        let (rp, rm) = (rp?, rm?);
        for row in 0..rows {
            j[(row, d)] = (rp[row] - rm[row]) / (2.0 * eps);
        }
    }
    Ok(j)
}
