//! Equality-constraint evaluators.
//!
//! Each evaluator produces a residual vector and its Jacobian with
//! respect to the global displacement vector at a given time `t`.
//! Evaluators hold only their static configuration; every call re-derives
//! from the current displacement, since the solver mutates the
//! displacement between calls.

use crate::error::FailureKind;
use crate::state::{dof, CreasePatternState};
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;

/// A fixed or time-dependent target value.
#[derive(Clone)]
pub enum Target {
    Const(f64),
    Fn(Arc<dyn Fn(f64) -> f64 + Send + Sync>),
}

impl Target {
    /// Wrap a time-dependent target function `t -> value`.
    pub fn func<F>(f: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        Target::Fn(Arc::new(f))
    }

    pub fn at(&self, t: f64) -> f64 {
        match self {
            Target::Const(v) => *v,
            Target::Fn(f) => f(t),
        }
    }
}

impl From<f64> for Target {
    fn from(v: f64) -> Self {
        Target::Const(v)
    }
}

/// Common contract of all constraint evaluators: a residual vector and
/// one Jacobian row per scalar constraint, both over the full DOF vector.
pub trait Constraint {
    fn residual(&self, state: &CreasePatternState, t: f64) -> Result<DVector<f64>, FailureKind>;

    fn jacobian(&self, state: &CreasePatternState, t: f64) -> Result<DMatrix<f64>, FailureKind>;

    /// Eager validation against the pattern; called once per solve.
    fn validate(&self, state: &CreasePatternState) -> Result<(), FailureKind>;
}

// ---------------------------------------------------------------------
// Fixed DOFs
// ---------------------------------------------------------------------

/// One prescribed displacement component.
#[derive(Clone)]
pub struct DofTarget {
    pub node: usize,
    pub component: usize,
    pub target: Target,
}

/// Prescribe displacement components, each to a constant or a
/// time-dependent target: residual `u[dof] - target(t)`.
pub struct FixedDofs {
    targets: Vec<DofTarget>,
}

impl FixedDofs {
    pub fn new(targets: Vec<DofTarget>) -> Self {
        Self { targets }
    }
}

/// Pin every listed component of every listed node to zero displacement.
/// Mirrors the usual `fix([nodes], [components])` pattern-building step.
pub fn fix(nodes: &[usize], components: &[usize]) -> Vec<DofTarget> {
    let mut targets = Vec::with_capacity(nodes.len() * components.len());
    for &node in nodes {
        for &component in components {
            targets.push(DofTarget {
                node,
                component,
                target: Target::Const(0.0),
            });
        }
    }
    targets
}

/// Like [`fix`], but driving every listed component along a shared
/// time-dependent target function.
pub fn fix_with<F>(nodes: &[usize], components: &[usize], f: F) -> Vec<DofTarget>
where
    F: Fn(f64) -> f64 + Send + Sync + 'static,
{
    let f: Arc<dyn Fn(f64) -> f64 + Send + Sync> = Arc::new(f);
    let mut targets = Vec::with_capacity(nodes.len() * components.len());
    for &node in nodes {
        for &component in components {
            targets.push(DofTarget {
                node,
                component,
                target: Target::Fn(f.clone()),
            });
        }
    }
    targets
}

impl Constraint for FixedDofs {
    fn residual(&self, state: &CreasePatternState, t: f64) -> Result<DVector<f64>, FailureKind> {
        let mut r = DVector::zeros(self.targets.len());
        for (i, c) in self.targets.iter().enumerate() {
            r[i] = state.u()[c.node][c.component] - c.target.at(t);
        }
        Ok(r)
    }

    fn jacobian(&self, state: &CreasePatternState, _t: f64) -> Result<DMatrix<f64>, FailureKind> {
        let mut j = DMatrix::zeros(self.targets.len(), state.n_dofs());
        for (i, c) in self.targets.iter().enumerate() {
            j[(i, dof(c.node, c.component))] = 1.0;
        }
        Ok(j)
    }

    fn validate(&self, state: &CreasePatternState) -> Result<(), FailureKind> {
        let n_nodes = state.pattern().n_nodes();
        let mut seen: Vec<usize> = Vec::with_capacity(self.targets.len());
        for c in &self.targets {
            if c.node >= n_nodes || c.component >= 3 {
                return Err(FailureKind::InvalidConfiguration(format!(
                    "fixed-DOF constraint references node {} component {}",
                    c.node, c.component
                )));
            }
            let d = dof(c.node, c.component);
            if seen.contains(&d) {
                return Err(FailureKind::InvalidConfiguration(format!(
                    "node {} component {} is constrained twice",
                    c.node, c.component
                )));
            }
            seen.push(d);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Linked DOFs
// ---------------------------------------------------------------------

/// A weighted equality between two displacement components:
/// `w_a * u[a] - w_b * u[b] = 0`.
#[derive(Debug, Clone, Copy)]
pub struct DofLink {
    pub node_a: usize,
    pub component_a: usize,
    pub weight_a: f64,
    pub node_b: usize,
    pub component_b: usize,
    pub weight_b: f64,
}

pub struct LinkedDofs {
    links: Vec<DofLink>,
}

impl LinkedDofs {
    pub fn new(links: Vec<DofLink>) -> Self {
        Self { links }
    }
}

impl Constraint for LinkedDofs {
    fn residual(&self, state: &CreasePatternState, _t: f64) -> Result<DVector<f64>, FailureKind> {
        let mut r = DVector::zeros(self.links.len());
        for (i, l) in self.links.iter().enumerate() {
            r[i] = l.weight_a * state.u()[l.node_a][l.component_a]
                - l.weight_b * state.u()[l.node_b][l.component_b];
        }
        Ok(r)
    }

    fn jacobian(&self, state: &CreasePatternState, _t: f64) -> Result<DMatrix<f64>, FailureKind> {
        let mut j = DMatrix::zeros(self.links.len(), state.n_dofs());
        for (i, l) in self.links.iter().enumerate() {
            j[(i, dof(l.node_a, l.component_a))] += l.weight_a;
            j[(i, dof(l.node_b, l.component_b))] -= l.weight_b;
        }
        Ok(j)
    }

    fn validate(&self, state: &CreasePatternState) -> Result<(), FailureKind> {
        let n_nodes = state.pattern().n_nodes();
        for l in &self.links {
            if l.node_a >= n_nodes
                || l.node_b >= n_nodes
                || l.component_a >= 3
                || l.component_b >= 3
            {
                return Err(FailureKind::InvalidConfiguration(
                    "linked-DOF constraint references a DOF out of range".into(),
                ));
            }
            if (l.node_a, l.component_a) == (l.node_b, l.component_b) {
                return Err(FailureKind::InvalidConfiguration(format!(
                    "link constrains node {} component {} against itself",
                    l.node_a, l.component_a
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Constant edge length
// ---------------------------------------------------------------------

/// Keep every edge (or a selected subset) at its reference length:
/// residual `length(e) - reference_length(e)` per edge.
pub struct ConstantLength {
    edges: Option<Vec<usize>>,
}

impl ConstantLength {
    /// Constrain all edges of the pattern.
    pub fn new() -> Self {
        Self { edges: None }
    }

    /// Constrain only the listed edges.
    pub fn for_edges(edges: Vec<usize>) -> Self {
        Self { edges: Some(edges) }
    }

    fn edge_indices(&self, state: &CreasePatternState) -> Vec<usize> {
        match &self.edges {
            Some(e) => e.clone(),
            None => (0..state.pattern().n_edges()).collect(),
        }
    }
}

impl Default for ConstantLength {
    fn default() -> Self {
        Self::new()
    }
}

impl Constraint for ConstantLength {
    fn residual(&self, state: &CreasePatternState, _t: f64) -> Result<DVector<f64>, FailureKind> {
        let edges = self.edge_indices(state);
        let mut r = DVector::zeros(edges.len());
        for (i, &e) in edges.iter().enumerate() {
            r[i] = state.edge_length(e) - state.reference_length(e);
        }
        Ok(r)
    }

    fn jacobian(&self, state: &CreasePatternState, _t: f64) -> Result<DMatrix<f64>, FailureKind> {
        let edges = self.edge_indices(state);
        let mut j = DMatrix::zeros(edges.len(), state.n_dofs());
        for (i, &e) in edges.iter().enumerate() {
            for (node, g) in state.edge_length_gradient(e)? {
                for c in 0..3 {
                    j[(i, dof(node, c))] += g[c];
                }
            }
        }
        Ok(j)
    }

    fn validate(&self, state: &CreasePatternState) -> Result<(), FailureKind> {
        if let Some(edges) = &self.edges {
            let n_edges = state.pattern().n_edges();
            if let Some(&e) = edges.iter().find(|&&e| e >= n_edges) {
                return Err(FailureKind::InvalidConfiguration(format!(
                    "constant-length constraint references edge {} of {}",
                    e, n_edges
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Prescribed dihedral angles
// ---------------------------------------------------------------------

/// One scalar dihedral constraint: a weighted sum of interior-edge
/// angles driven along a target function,
/// `sum_k w_k * psi(ie_k) - target(t) = 0`.
#[derive(Clone)]
pub struct PsiGroup {
    /// `(interior-edge index, weight)` terms.
    pub terms: Vec<(usize, f64)>,
    pub target: Target,
}

pub struct PsiConstraints {
    groups: Vec<PsiGroup>,
}

impl PsiConstraints {
    pub fn new(groups: Vec<PsiGroup>) -> Self {
        Self { groups }
    }

    /// Drive a single interior edge along a target-angle function.
    pub fn single<F>(interior_edge: usize, target: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        Self {
            groups: vec![PsiGroup {
                terms: vec![(interior_edge, 1.0)],
                target: Target::Fn(Arc::new(target)),
            }],
        }
    }
}

impl Constraint for PsiConstraints {
    fn residual(&self, state: &CreasePatternState, t: f64) -> Result<DVector<f64>, FailureKind> {
        let mut r = DVector::zeros(self.groups.len());
        for (i, group) in self.groups.iter().enumerate() {
            let mut value = 0.0;
            for &(ie, w) in &group.terms {
                value += w * state.dihedral_angle(ie)?;
            }
            r[i] = value - group.target.at(t);
        }
        Ok(r)
    }

    fn jacobian(&self, state: &CreasePatternState, _t: f64) -> Result<DMatrix<f64>, FailureKind> {
        let mut j = DMatrix::zeros(self.groups.len(), state.n_dofs());
        for (i, group) in self.groups.iter().enumerate() {
            for &(ie, w) in &group.terms {
                for (node, g) in state.dihedral_angle_gradient(ie)? {
                    for c in 0..3 {
                        j[(i, dof(node, c))] += w * g[c];
                    }
                }
            }
        }
        Ok(j)
    }

    fn validate(&self, state: &CreasePatternState) -> Result<(), FailureKind> {
        let n_interior = state.pattern().interior_edges().len();
        if n_interior == 0 {
            return Err(FailureKind::InvalidConfiguration(
                "dihedral constraints on a pattern with no interior edges".into(),
            ));
        }
        for group in &self.groups {
            if group.terms.is_empty() {
                return Err(FailureKind::InvalidConfiguration(
                    "empty dihedral constraint group".into(),
                ));
            }
            if let Some(&(ie, _)) = group.terms.iter().find(|&&(ie, _)| ie >= n_interior) {
                return Err(FailureKind::InvalidConfiguration(format!(
                    "dihedral constraint references interior edge {} of {}",
                    ie, n_interior
                )));
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
    fn fixed_dofs_track_a_time_dependent_target() {
        let mut state = hinge_state();
        state.u_mut()[2].z = 0.5;
        let gu = FixedDofs::new(fix_with(&[2], &[2], |t| t));

        let r = gu.residual(&state, 0.5).unwrap();
        assert_eq!(r.len(), 1);
        assert!((r[0] - 0.0).abs() < 1e-15);

        let r = gu.residual(&state, 0.2).unwrap();
        assert!((r[0] - 0.3).abs() < 1e-15);

        let j = gu.jacobian(&state, 0.2).unwrap();
        assert_eq!(j.nrows(), 1);
        assert_eq!(j[(0, dof(2, 2))], 1.0);
        assert_eq!(j.row(0).iter().filter(|v| **v != 0.0).count(), 1);
    }

    #[test]
    fn fix_expands_the_node_component_product() {
        let targets = fix(&[1, 2], &[0, 2]);
        assert_eq!(targets.len(), 4);
        assert_eq!(targets[0].node, 1);
        assert_eq!(targets[3].component, 2);
    }

    #[test]
    fn duplicate_fixed_dof_is_invalid() {
        let state = hinge_state();
        let mut targets = fix(&[0], &[2]);
        targets.extend(fix(&[0], &[2]));
        let gu = FixedDofs::new(targets);
        let err = gu.validate(&state).expect_err("duplicate must be rejected");
        assert!(matches!(err, FailureKind::InvalidConfiguration(_)));
    }

    #[test]
    fn linked_dofs_have_two_jacobian_entries() {
        let mut state = hinge_state();
        state.u_mut()[2].z = 0.4;
        state.u_mut()[3].z = 0.1;
        let gu = LinkedDofs::new(vec![DofLink {
            node_a: 2,
            component_a: 2,
            weight_a: 1.0,
            node_b: 3,
            component_b: 2,
            weight_b: 2.0,
        }]);

        let r = gu.residual(&state, 0.0).unwrap();
        assert!((r[0] - 0.2).abs() < 1e-15);

        let j = gu.jacobian(&state, 0.0).unwrap();
        assert_eq!(j[(0, dof(2, 2))], 1.0);
        assert_eq!(j[(0, dof(3, 2))], -2.0);
        assert_eq!(j.row(0).iter().filter(|v| **v != 0.0).count(), 2);
    }

    #[test]
    fn constant_length_residual_is_zero_at_reference() {
        let state = hinge_state();
        let gu = ConstantLength::new();
        let r = gu.residual(&state, 0.0).unwrap();
        assert_eq!(r.len(), 5);
        assert!(r.iter().all(|v| v.abs() < 1e-15));
    }

    #[test]
    fn constant_length_jacobian_matches_finite_differences() {
        let mut state = hinge_state();
        state.u_mut()[1] = Vector3::new(0.02, -0.05, 0.1);
        let gu = ConstantLength::new();

        let j = gu.jacobian(&state, 0.0).unwrap();
        let h = 1e-6;
        for d in 0..state.n_dofs() {
            let node = d / 3;
            let comp = d % 3;
            let base = state.u()[node][comp];

            state.u_mut()[node][comp] = base + h;
            let rp = gu.residual(&state, 0.0).unwrap();
            state.u_mut()[node][comp] = base - h;
            let rm = gu.residual(&state, 0.0).unwrap();
            state.u_mut()[node][comp] = base;

            for row in 0..j.nrows() {
                let fd = (rp[row] - rm[row]) / (2.0 * h);
                assert!(
                    (j[(row, d)] - fd).abs() < 1e-7,
                    "row {} dof {}: analytic {} vs fd {}",
                    row,
                    d,
                    j[(row, d)],
                    fd
                );
            }
        }
    }

    #[test]
    fn psi_constraint_jacobian_matches_finite_differences() {
        let mut state = hinge_state();
        state.u_mut()[3].z = 0.3;
        let gu = PsiConstraints::single(0, |t| -0.4 * t);

        let r = gu.residual(&state, 1.0).unwrap();
        let psi = state.dihedral_angle(0).unwrap();
        assert!((r[0] - (psi + 0.4)).abs() < 1e-14);

        let j = gu.jacobian(&state, 1.0).unwrap();
        let h = 1e-6;
        for node in 0..4 {
            for comp in 0..3 {
                let base = state.u()[node][comp];
                state.u_mut()[node][comp] = base + h;
                let rp = gu.residual(&state, 1.0).unwrap();
                state.u_mut()[node][comp] = base - h;
                let rm = gu.residual(&state, 1.0).unwrap();
                state.u_mut()[node][comp] = base;

                let fd = (rp[0] - rm[0]) / (2.0 * h);
                assert!(
                    (j[(0, dof(node, comp))] - fd).abs() < 1e-6,
                    "node {} comp {}: analytic {} vs fd {}",
                    node,
                    comp,
                    j[(0, dof(node, comp))],
                    fd
                );
            }
        }
    }

    #[test]
    fn psi_constraint_requires_interior_edges() {
        let pattern = CreasePattern::new(
            vec![
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(1.0, 0.0, 0.0),
                Vector3::new(0.5, 1.0, 0.0),
            ],
            vec![[0, 1], [1, 2], [2, 0]],
            vec![vec![0, 1, 2]],
        )
        .expect("valid pattern");
        let state = CreasePatternState::new(pattern);
        let gu = PsiConstraints::single(0, |_| 0.0);
        let err = gu.validate(&state).expect_err("no interior edges");
        assert!(matches!(err, FailureKind::InvalidConfiguration(_)));
    }
}
