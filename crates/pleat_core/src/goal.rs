//! Goal functions for constrained minimization.
//!
//! A goal function turns the step solve into an equality-constrained
//! minimization (SQP mode) instead of pure constraint satisfaction.
//! The canonical variant is the total potential energy: external nodal
//! loads plus an optional dihedral bending energy.

use crate::constraints::Target;
use crate::error::FailureKind;
use crate::state::{dof, CreasePatternState};
use nalgebra::DVector;

/// Scalar objective with its gradient over the displacement DOFs.
pub trait GoalFunction {
    fn value(&self, state: &CreasePatternState, t: f64) -> Result<f64, FailureKind>;

    fn gradient(&self, state: &CreasePatternState, t: f64) -> Result<DVector<f64>, FailureKind>;

    /// Eager validation against the pattern; called once per solve.
    fn validate(&self, state: &CreasePatternState) -> Result<(), FailureKind>;
}

/// A generalized force applied at one displacement component, with a
/// constant or time-dependent magnitude. Contributes `-force(t) * u` to
/// the potential.
#[derive(Clone)]
pub struct PointLoad {
    pub node: usize,
    pub component: usize,
    pub magnitude: Target,
}

struct Bending {
    kappa: f64,
    /// Rest angles per interior edge, captured at configuration time.
    psi_0: Vec<f64>,
}

/// Total potential energy:
///
/// `f(u, t) = sum_ie 1/2 kappa (psi - psi_0)^2  -  sum_loads P(t) u[dof]`
pub struct PotentialEnergy {
    loads: Vec<PointLoad>,
    bending: Option<Bending>,
}

impl PotentialEnergy {
    /// Load potential only, no bending stiffness.
    pub fn new(loads: Vec<PointLoad>) -> Self {
        Self {
            loads,
            bending: None,
        }
    }

    /// Add bending springs on every interior edge, with the rest angles
    /// taken from the state's current configuration.
    pub fn with_bending(
        state: &CreasePatternState,
        kappa: f64,
        loads: Vec<PointLoad>,
    ) -> Result<Self, FailureKind> {
        if kappa <= 0.0 {
            return Err(FailureKind::InvalidConfiguration(
                "bending stiffness must be positive".into(),
            ));
        }
        let psi_0 = state.dihedral_angles()?;
        Ok(Self {
            loads,
            bending: Some(Bending { kappa, psi_0 }),
        })
    }
}

impl GoalFunction for PotentialEnergy {
    fn value(&self, state: &CreasePatternState, t: f64) -> Result<f64, FailureKind> {
        let mut f = 0.0;
        for load in &self.loads {
            f -= load.magnitude.at(t) * state.u()[load.node][load.component];
        }
        if let Some(bending) = &self.bending {
            for (ie, &psi_0) in bending.psi_0.iter().enumerate() {
                let phi = state.dihedral_angle(ie)? - psi_0;
                f += 0.5 * bending.kappa * phi * phi;
            }
        }
        Ok(f)
    }

    fn gradient(&self, state: &CreasePatternState, t: f64) -> Result<DVector<f64>, FailureKind> {
        let mut g = DVector::zeros(state.n_dofs());
        for load in &self.loads {
            g[dof(load.node, load.component)] -= load.magnitude.at(t);
        }
        if let Some(bending) = &self.bending {
            for (ie, &psi_0) in bending.psi_0.iter().enumerate() {
                let moment = bending.kappa * (state.dihedral_angle(ie)? - psi_0);
                for (node, grad) in state.dihedral_angle_gradient(ie)? {
                    for c in 0..3 {
                        g[dof(node, c)] += moment * grad[c];
                    }
                }
            }
        }
        Ok(g)
    }

    fn validate(&self, state: &CreasePatternState) -> Result<(), FailureKind> {
        let n_nodes = state.pattern().n_nodes();
        for load in &self.loads {
            if load.node >= n_nodes || load.component >= 3 {
                return Err(FailureKind::InvalidConfiguration(format!(
                    "point load references node {} component {}",
                    load.node, load.component
                )));
            }
        }
        if let Some(bending) = &self.bending {
            if bending.psi_0.len() != state.pattern().interior_edges().len() {
                return Err(FailureKind::InvalidConfiguration(
                    "bending rest angles do not match the interior-edge table".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CreasePattern, CreasePatternState};
    use nalgebra::Vector3;

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

    #[test]
    fn load_potential_is_minus_force_times_displacement() {
        let mut state = hinge_state();
        state.u_mut()[2].z = -0.5;
        let fu = PotentialEnergy::new(vec![PointLoad {
            node: 2,
            component: 2,
            magnitude: Target::Const(-9.81),
        }]);

        let f = fu.value(&state, 0.0).unwrap();
        assert!((f - (-9.81 * 0.5)).abs() < 1e-12);

        let g = fu.gradient(&state, 0.0).unwrap();
        assert!((g[dof(2, 2)] - 9.81).abs() < 1e-12);
        assert_eq!(g.iter().filter(|v| **v != 0.0).count(), 1);
    }

    #[test]
    fn bending_energy_vanishes_at_the_rest_angle() {
        let mut state = hinge_state();
        state.u_mut()[3].z = 0.2;
        let fu = PotentialEnergy::with_bending(&state, 1.0, Vec::new()).unwrap();

        let f = fu.value(&state, 0.0).unwrap();
        assert!(f.abs() < 1e-14);

        // Away from the rest angle the energy is positive.
        state.u_mut()[3].z = 0.0;
        assert!(fu.value(&state, 0.0).unwrap() > 1e-4);
    }

    #[test]
    fn potential_gradient_matches_finite_differences() {
        let mut state = hinge_state();
        let fu = PotentialEnergy::with_bending(
            &state,
            0.7,
            vec![PointLoad {
                node: 3,
                component: 2,
                magnitude: Target::Const(0.3),
            }],
        )
        .unwrap();
        state.u_mut()[2].z = 0.15;
        state.u_mut()[3].z = 0.1;

        let g = fu.gradient(&state, 0.0).unwrap();
        let h = 1e-6;
        for node in 0..4 {
            for comp in 0..3 {
                let base = state.u()[node][comp];
                state.u_mut()[node][comp] = base + h;
                let fp = fu.value(&state, 0.0).unwrap();
                state.u_mut()[node][comp] = base - h;
                let fm = fu.value(&state, 0.0).unwrap();
                state.u_mut()[node][comp] = base;

                let fd = (fp - fm) / (2.0 * h);
                assert!(
                    (g[dof(node, comp)] - fd).abs() < 1e-6,
                    "node {} comp {}: analytic {} vs fd {}",
                    node,
                    comp,
                    g[dof(node, comp)],
                    fd
                );
            }
        }
    }

    #[test]
    fn time_dependent_load_scales_with_t() {
        let mut state = hinge_state();
        state.u_mut()[2].z = 1.0;
        let fu = PotentialEnergy::new(vec![PointLoad {
            node: 2,
            component: 2,
            magnitude: Target::func(|t| 2.0 * t),
        }]);
        assert!(fu.value(&state, 0.0).unwrap().abs() < 1e-15);
        assert!((fu.value(&state, 0.5).unwrap() + 1.0).abs() < 1e-12);
    }
}
