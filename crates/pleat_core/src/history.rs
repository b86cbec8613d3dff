//! Simulation history: marching the step solver over a time sequence.
//!
//! Each step is warm-started from the previous converged displacement,
//! and the trajectory of DOF vectors is collected. The first unrecovered
//! step failure aborts the whole run, surfaced with the failing time
//! value.

use crate::config::SimulationConfig;
use crate::state::{CreasePattern, CreasePatternState};
use crate::step::{solve_step, StepReport};
use anyhow::{bail, Context, Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Trajectory of one forming stage: one displacement vector per time
/// value, starting with the initial displacement at `t = 0`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationHistory {
    pub times: Vec<f64>,
    /// Flattened displacement vectors, index-aligned with `times`.
    pub u_t: Vec<Vec<f64>>,
}

impl SimulationHistory {
    /// Final displacement vector.
    pub fn u_1(&self) -> Option<&[f64]> {
        self.u_t.last().map(|u| u.as_slice())
    }

    /// Nodal positions per recorded time, `x_0 + u`.
    pub fn x_t(&self, pattern: &CreasePattern) -> Vec<Vec<Vector3<f64>>> {
        self.u_t
            .iter()
            .map(|u| {
                (0..pattern.n_nodes())
                    .map(|i| {
                        pattern.reference_position(i)
                            + Vector3::new(u[3 * i], u[3 * i + 1], u[3 * i + 2])
                    })
                    .collect()
            })
            .collect()
    }

    /// Final nodal positions.
    pub fn x_1(&self, pattern: &CreasePattern) -> Option<Vec<Vector3<f64>>> {
        self.x_t(pattern).pop()
    }
}

/// Solve over a uniform partition of `(0, 1]` with `n_steps` steps.
pub fn run_steps(
    state: &mut CreasePatternState,
    config: &SimulationConfig,
    n_steps: usize,
) -> Result<SimulationHistory> {
    if n_steps == 0 {
        bail!("n_steps must be greater than zero.");
    }
    let times: Vec<f64> = (1..=n_steps)
        .map(|k| k as f64 / n_steps as f64)
        .collect();
    run_times(state, config, &times)
}

/// Solve at each listed time value in increasing order, feeding each
/// converged displacement forward as the next starting point.
pub fn run_times(
    state: &mut CreasePatternState,
    config: &SimulationConfig,
    times: &[f64],
) -> Result<SimulationHistory> {
    if times.is_empty() {
        bail!("Time sequence is empty.");
    }
    let mut previous = 0.0;
    for &t in times {
        if !(0.0..=1.0).contains(&t) {
            bail!("Time value {} is outside [0, 1].", t);
        }
        if t < previous {
            bail!("Time sequence is not increasing at t = {}.", t);
        }
        previous = t;
    }

    let mut history = SimulationHistory {
        times: vec![0.0],
        u_t: vec![state.dof_vector().iter().copied().collect()],
    };

    for &t in times {
        let report = step_at(state, config, t)
            .with_context(|| format!("Simulation failed at t = {}.", t))?;
        history.times.push(t);
        history.u_t.push(report.u);
    }
    Ok(history)
}

fn step_at(state: &mut CreasePatternState, config: &SimulationConfig, t: f64) -> Result<StepReport> {
    let report = solve_step(state, config, t)?;
    if let Some(kind) = &report.failure {
        bail!(
            "Step did not converge after {} iterations (‖G‖ = {}): {}",
            report.iterations,
            report.residual_norm,
            kind
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SimulationConfig, SolverSettings};
    use crate::constraints::{fix, ConstantLength, DofTarget, FixedDofs, PsiConstraints, Target};
    use crate::state::{CreasePattern, CreasePatternState};
    use nalgebra::Vector3;
    use std::f64::consts::PI;

    fn hinge_state() -> CreasePatternState {
        let pattern = CreasePattern::new(
            vec![
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::new(0.5, 1.0, 0.0),
                Vector3::new(0.5, -1.0, 0.0),
            ],
            vec![[0, 1], [0, 2], [1, 2], [0, 3], [1, 3]],
            vec![vec![0, 1, 2], vec![0, 1, 3]],
        )
        .expect("valid pattern");
        CreasePatternState::new(pattern)
    }

    fn fold_config(acc: f64) -> SimulationConfig {
        let psi_max = 0.49 * PI;
        SimulationConfig::new()
            .with_constraint("cl", Box::new(ConstantLength::new()))
            .with_constraint(
                "psi",
                Box::new(PsiConstraints::single(0, move |t| -psi_max * t)),
            )
            .with_constraint(
                "dof",
                Box::new(FixedDofs::new(
                    [fix(&[0], &[0, 1, 2]), fix(&[1], &[1, 2]), fix(&[2], &[2])].concat(),
                )),
            )
            .with_settings(SolverSettings {
                acc,
                ..SolverSettings::default()
            })
    }

    #[test]
    fn hinge_folds_to_the_target_angle_over_25_steps() {
        let mut state = hinge_state();
        let history =
            run_steps(&mut state, &fold_config(1e-8), 25).expect("fold should converge");

        assert_eq!(history.times.len(), 26);
        assert_eq!(history.u_t.len(), 26);
        assert_eq!(history.times[0], 0.0);
        assert_eq!(*history.times.last().unwrap(), 1.0);

        let psi = state.dihedral_angle(0).expect("angle defined");
        assert!(
            (psi - (-0.49 * PI)).abs() < 1e-8,
            "psi = {} at t = 1",
            psi
        );

        // The recorded final displacement matches the state.
        let expected: Vec<f64> = state.dof_vector().iter().copied().collect();
        assert_eq!(history.u_1().unwrap(), expected.as_slice());
    }

    #[test]
    fn warm_starting_keeps_edge_lengths_constant_along_the_path() {
        let mut state = hinge_state();
        let history = run_steps(&mut state, &fold_config(1e-8), 10).expect("fold should converge");

        for e in 0..5 {
            assert!((state.edge_length(e) - state.reference_length(e)).abs() < 1e-8);
        }
        let x_t = history.x_t(state.pattern());
        assert_eq!(x_t.len(), 11);
        // Fixed nodes never move.
        for frame in &x_t {
            assert!((frame[0] - Vector3::new(0.0, 0.0, 0.0)).norm() < 1e-12);
        }
    }

    #[test]
    fn first_failure_aborts_with_the_failing_time() {
        let mut state = hinge_state();
        // Conflicting pins on the same DOF make every step singular.
        let config = SimulationConfig::new()
            .with_constraint("a", Box::new(FixedDofs::new(fix(&[3], &[2]))))
            .with_constraint(
                "b",
                Box::new(FixedDofs::new(vec![DofTarget {
                    node: 3,
                    component: 2,
                    target: Target::Const(0.5),
                }])),
            );

        let err = run_steps(&mut state, &config, 4).expect_err("run must fail");
        let message = format!("{:#}", err);
        assert!(
            message.contains("t = 0.25"),
            "expected failing time in \"{}\"",
            message
        );
        // The state is left at its pre-run displacement.
        assert!(state.u().iter().all(|u| u.norm() == 0.0));
    }

    #[test]
    fn run_times_rejects_a_decreasing_sequence() {
        let mut state = hinge_state();
        let err = run_times(&mut state, &fold_config(1e-8), &[0.5, 0.2])
            .expect_err("decreasing sequence");
        assert!(format!("{}", err).contains("not increasing"));
    }

    #[test]
    fn run_steps_rejects_zero_steps() {
        let mut state = hinge_state();
        assert!(run_steps(&mut state, &fold_config(1e-8), 0).is_err());
    }
}
