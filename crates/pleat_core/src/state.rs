//! Crease-pattern geometry state.
//!
//! A [`CreasePattern`] holds the immutable inputs of one forming stage:
//! reference node positions, edge topology and facet topology, plus the
//! derived table of interior edges (edges shared by exactly two facets).
//! A [`CreasePatternState`] adds the nodal displacement field `u`, the
//! sole quantity a solver mutates. Current positions always satisfy
//! `x = x_0 + u`.
//!
//! Derived quantities (edge vectors and lengths, facet normals, dihedral
//! angles) and their first derivatives with respect to the displacement
//! degrees of freedom are recomputed on demand from the current
//! displacement; nothing is cached between solver iterations. Derivatives
//! are sparse in the node index: only nodes adjacent to an entity carry a
//! nonzero block, and the accessors return `(node, gradient)` pairs for
//! the caller to scatter into full-width Jacobian rows.

use crate::error::FailureKind;
use nalgebra::{DVector, Vector3};

/// Norms below this threshold make a normalization degenerate.
const DEGENERATE_TOL: f64 = 1e-12;

/// Index of one scalar displacement component: `3 * node + component`.
#[inline]
pub fn dof(node: usize, component: usize) -> usize {
    3 * node + component
}

/// An edge shared by exactly two facets, the site of a dihedral angle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InteriorEdge {
    /// Index into the pattern's edge list.
    pub edge: usize,
    /// The two adjacent facets, in facet-list order.
    pub facets: [usize; 2],
    /// One wing node per adjacent facet: the first node of the facet
    /// tuple that is not an endpoint of the shared edge.
    pub wings: [usize; 2],
}

/// Immutable topology and reference positions of one forming stage.
#[derive(Debug, Clone)]
pub struct CreasePattern {
    x_0: Vec<Vector3<f64>>,
    edges: Vec<[usize; 2]>,
    facets: Vec<Vec<usize>>,
    interior_edges: Vec<InteriorEdge>,
}

impl CreasePattern {
    /// Build a pattern from reference positions, an edge list and a facet
    /// list. Validates index ranges, edge/facet arity and non-degenerate
    /// reference geometry, and derives the interior-edge table.
    pub fn new(
        x_0: Vec<Vector3<f64>>,
        edges: Vec<[usize; 2]>,
        facets: Vec<Vec<usize>>,
    ) -> Result<Self, FailureKind> {
        let n_nodes = x_0.len();
        if n_nodes == 0 {
            return Err(FailureKind::InvalidConfiguration(
                "pattern has no nodes".into(),
            ));
        }
        for (i, e) in edges.iter().enumerate() {
            if e[0] >= n_nodes || e[1] >= n_nodes {
                return Err(FailureKind::InvalidConfiguration(format!(
                    "edge {} references a node out of range",
                    i
                )));
            }
            if e[0] == e[1] {
                return Err(FailureKind::InvalidConfiguration(format!(
                    "edge {} has identical endpoints",
                    i
                )));
            }
        }
        for (i, f) in facets.iter().enumerate() {
            if f.len() < 3 {
                return Err(FailureKind::InvalidConfiguration(format!(
                    "facet {} has fewer than three nodes",
                    i
                )));
            }
            if f.iter().any(|&n| n >= n_nodes) {
                return Err(FailureKind::InvalidConfiguration(format!(
                    "facet {} references a node out of range",
                    i
                )));
            }
        }

        // Reference geometry must be non-degenerate up front.
        for (i, e) in edges.iter().enumerate() {
            if (x_0[e[1]] - x_0[e[0]]).norm() < DEGENERATE_TOL {
                return Err(FailureKind::DegenerateGeometry(format!(
                    "edge {} has zero reference length",
                    i
                )));
            }
        }
        for (i, f) in facets.iter().enumerate() {
            let r = x_0[f[1]] - x_0[f[0]];
            let s = x_0[f[2]] - x_0[f[0]];
            if r.cross(&s).norm() < DEGENERATE_TOL {
                return Err(FailureKind::DegenerateGeometry(format!(
                    "facet {} has collinear reference nodes",
                    i
                )));
            }
        }

        let interior_edges = derive_interior_edges(&edges, &facets);
        Ok(Self {
            x_0,
            edges,
            facets,
            interior_edges,
        })
    }

    pub fn n_nodes(&self) -> usize {
        self.x_0.len()
    }

    pub fn n_edges(&self) -> usize {
        self.edges.len()
    }

    /// Total number of displacement degrees of freedom (`3 * n_nodes`).
    pub fn n_dofs(&self) -> usize {
        3 * self.x_0.len()
    }

    pub fn edges(&self) -> &[[usize; 2]] {
        &self.edges
    }

    pub fn facets(&self) -> &[Vec<usize>] {
        &self.facets
    }

    pub fn interior_edges(&self) -> &[InteriorEdge] {
        &self.interior_edges
    }

    pub fn reference_position(&self, node: usize) -> Vector3<f64> {
        self.x_0[node]
    }
}

/// Map each unordered facet-boundary pair to the facets it bounds, then
/// keep the edges bounded by exactly two facets.
fn derive_interior_edges(edges: &[[usize; 2]], facets: &[Vec<usize>]) -> Vec<InteriorEdge> {
    let mut interior = Vec::new();
    for (ei, e) in edges.iter().enumerate() {
        let key = (e[0].min(e[1]), e[0].max(e[1]));
        let mut adjacent: Vec<usize> = Vec::new();
        for (fi, f) in facets.iter().enumerate() {
            let n = f.len();
            for k in 0..n {
                let a = f[k];
                let b = f[(k + 1) % n];
                if (a.min(b), a.max(b)) == key {
                    adjacent.push(fi);
                    break;
                }
            }
        }
        if adjacent.len() == 2 {
            let wing = |fi: usize| {
                facets[fi]
                    .iter()
                    .copied()
                    .find(|&n| n != e[0] && n != e[1])
                    .expect("facet has at least three distinct boundary nodes")
            };
            interior.push(InteriorEdge {
                edge: ei,
                facets: [adjacent[0], adjacent[1]],
                wings: [wing(adjacent[0]), wing(adjacent[1])],
            });
        }
    }
    interior
}

/// Pattern plus the mutable displacement field advanced by the solver.
#[derive(Debug, Clone)]
pub struct CreasePatternState {
    pattern: CreasePattern,
    u: Vec<Vector3<f64>>,
}

impl CreasePatternState {
    /// Start a stage at zero displacement.
    pub fn new(pattern: CreasePattern) -> Self {
        let n = pattern.n_nodes();
        Self {
            pattern,
            u: vec![Vector3::zeros(); n],
        }
    }

    pub fn pattern(&self) -> &CreasePattern {
        &self.pattern
    }

    pub fn n_dofs(&self) -> usize {
        self.pattern.n_dofs()
    }

    /// Current position of a node: `x_0 + u`.
    pub fn x(&self, node: usize) -> Vector3<f64> {
        self.pattern.x_0[node] + self.u[node]
    }

    pub fn u(&self) -> &[Vector3<f64>] {
        &self.u
    }

    /// Mutable access to the displacement field, e.g. to seed an initial
    /// perturbation before a solve.
    pub fn u_mut(&mut self) -> &mut [Vector3<f64>] {
        &mut self.u
    }

    /// Flattened view of the displacement field, `[u0x, u0y, u0z, u1x, ..]`.
    pub fn dof_vector(&self) -> DVector<f64> {
        let mut v = DVector::zeros(self.n_dofs());
        for (i, ui) in self.u.iter().enumerate() {
            for c in 0..3 {
                v[dof(i, c)] = ui[c];
            }
        }
        v
    }

    /// Write a flattened displacement vector back into the per-node field.
    pub fn set_dof_vector(&mut self, v: &DVector<f64>) {
        debug_assert_eq!(v.len(), self.n_dofs());
        for (i, ui) in self.u.iter_mut().enumerate() {
            for c in 0..3 {
                ui[c] = v[dof(i, c)];
            }
        }
    }

    /// Freeze the current configuration: the displaced positions become
    /// the new reference and the displacement is zeroed. Current positions
    /// are preserved exactly; reference edge lengths change accordingly.
    pub fn reset_state(&mut self) {
        for (x0, ui) in self.pattern.x_0.iter_mut().zip(self.u.iter_mut()) {
            *x0 += *ui;
            *ui = Vector3::zeros();
        }
    }

    // ------------------------------------------------------------------
    // Derived quantities
    // ------------------------------------------------------------------

    /// Current edge vector `x[b] - x[a]`.
    pub fn edge_vector(&self, edge: usize) -> Vector3<f64> {
        let [a, b] = self.pattern.edges[edge];
        self.x(b) - self.x(a)
    }

    /// Current edge length.
    pub fn edge_length(&self, edge: usize) -> f64 {
        self.edge_vector(edge).norm()
    }

    /// Reference edge length, recomputed from `x_0` so that a
    /// [`reset_state`](Self::reset_state) is picked up immediately.
    pub fn reference_length(&self, edge: usize) -> f64 {
        let [a, b] = self.pattern.edges[edge];
        (self.pattern.x_0[b] - self.pattern.x_0[a]).norm()
    }

    /// Gradient of the edge length with respect to the two endpoint
    /// displacements: `(a, -e_hat)` and `(b, +e_hat)`.
    pub fn edge_length_gradient(
        &self,
        edge: usize,
    ) -> Result<[(usize, Vector3<f64>); 2], FailureKind> {
        let [a, b] = self.pattern.edges[edge];
        let v = self.edge_vector(edge);
        let len = v.norm();
        if len < DEGENERATE_TOL {
            return Err(FailureKind::DegenerateGeometry(format!(
                "edge {} collapsed to zero length",
                edge
            )));
        }
        let e_hat = v / len;
        Ok([(a, -e_hat), (b, e_hat)])
    }

    /// Unit normal of a facet, from the cross product of its first two
    /// edge vectors. The choice of edges is fixed by the facet's node
    /// ordering, so the sign is reproducible.
    pub fn facet_normal(&self, facet: usize) -> Result<Vector3<f64>, FailureKind> {
        let f = &self.pattern.facets[facet];
        let r = self.x(f[1]) - self.x(f[0]);
        let s = self.x(f[2]) - self.x(f[0]);
        let m = r.cross(&s);
        let norm = m.norm();
        if norm < DEGENERATE_TOL {
            return Err(FailureKind::DegenerateGeometry(format!(
                "facet {} has collinear nodes",
                facet
            )));
        }
        Ok(m / norm)
    }

    /// Signed dihedral angle at an interior edge (index into
    /// [`CreasePattern::interior_edges`]).
    ///
    /// Computed in the orthonormal frame `(e_hat, n0_hat, e_hat x n0_hat)`
    /// built from the unit edge vector and the first wing normal: the
    /// angle is the arcsine of the out-of-plane component of the second
    /// wing normal. By construction this represents angles in
    /// `(-pi/2, pi/2)` only; a fold at or beyond +-90 degrees is a checked
    /// precondition failure, not a wrapped value.
    pub fn dihedral_angle(&self, interior_edge: usize) -> Result<f64, FailureKind> {
        let frame = self.hinge_frame(interior_edge)?;
        Ok(frame.sin_psi.asin())
    }

    /// All current dihedral angles, in interior-edge order.
    pub fn dihedral_angles(&self) -> Result<Vec<f64>, FailureKind> {
        (0..self.pattern.interior_edges.len())
            .map(|ie| self.dihedral_angle(ie))
            .collect()
    }

    /// Gradient of the dihedral angle with respect to the displacements of
    /// the (up to four) nodes spanning the two wing triangles: the two
    /// edge endpoints and the two wing nodes. All other derivatives are
    /// exactly zero and are not materialized.
    pub fn dihedral_angle_gradient(
        &self,
        interior_edge: usize,
    ) -> Result<Vec<(usize, Vector3<f64>)>, FailureKind> {
        let ie = self.pattern.interior_edges[interior_edge];
        let [a, b] = self.pattern.edges[ie.edge];
        let [w0, w1] = ie.wings;
        let frame = self.hinge_frame(interior_edge)?;

        let cos_psi = (1.0 - frame.sin_psi * frame.sin_psi).sqrt();
        if cos_psi < DEGENERATE_TOL {
            return Err(FailureKind::DegenerateGeometry(format!(
                "dihedral angle at interior edge {} is at the +-90 degree limit",
                interior_edge
            )));
        }

        let e_hat = frame.e_hat;
        let n0 = frame.n0_hat;
        let n1 = frame.n1_hat;

        // sin(psi) = e_hat . (n0_hat x n1_hat). Differentiate through the
        // three normalizations; P_v = I - v v^T is the projector of each.
        let project = |v: &Vector3<f64>, c: Vector3<f64>| c - v * v.dot(&c);

        // Edge-direction term, distributed to the endpoints.
        let g_edge = project(&e_hat, n0.cross(&n1)) / frame.edge_len;

        // Normal terms. m0 = r x q0, m1 = q1 x r with r = x_b - x_a and
        // q_i = x_wi - x_a; the transposed cross-product (skew) maps below
        // scatter d(m)/d(x) onto each contributing node.
        let q0 = self.x(w0) - self.x(a);
        let q1 = self.x(w1) - self.x(a);
        let r = self.x(b) - self.x(a);
        let v0 = project(&n0, n1.cross(&e_hat)) / frame.m0_len;
        let v1 = project(&n1, e_hat.cross(&n0)) / frame.m1_len;

        let mut grads: Vec<(usize, Vector3<f64>)> = Vec::with_capacity(4);
        let mut add = |node: usize, g: Vector3<f64>| {
            if let Some(entry) = grads.iter_mut().find(|(n, _)| *n == node) {
                entry.1 += g;
            } else {
                grads.push((node, g));
            }
        };

        add(b, g_edge + q0.cross(&v0) - q1.cross(&v1));
        add(a, -g_edge + (r - q0).cross(&v0) + (q1 - r).cross(&v1));
        add(w0, -r.cross(&v0));
        add(w1, r.cross(&v1));

        // d(psi) = d(sin psi) / cos(psi).
        for (_, g) in grads.iter_mut() {
            *g /= cos_psi;
        }
        Ok(grads)
    }

    /// Orthonormal hinge frame at an interior edge: unit edge direction
    /// and the two wing normals, oriented so a flat configuration yields
    /// a zero angle regardless of facet node ordering.
    fn hinge_frame(&self, interior_edge: usize) -> Result<HingeFrame, FailureKind> {
        let ie = self.pattern.interior_edges[interior_edge];
        let [a, b] = self.pattern.edges[ie.edge];
        let [w0, w1] = ie.wings;

        let r = self.x(b) - self.x(a);
        let edge_len = r.norm();
        if edge_len < DEGENERATE_TOL {
            return Err(FailureKind::DegenerateGeometry(format!(
                "interior edge {} collapsed to zero length",
                interior_edge
            )));
        }
        let e_hat = r / edge_len;

        let m0 = r.cross(&(self.x(w0) - self.x(a)));
        let m1 = (self.x(w1) - self.x(a)).cross(&r);
        let m0_len = m0.norm();
        let m1_len = m1.norm();
        if m0_len < DEGENERATE_TOL || m1_len < DEGENERATE_TOL {
            return Err(FailureKind::DegenerateGeometry(format!(
                "wing facet of interior edge {} has collinear nodes",
                interior_edge
            )));
        }
        let n0_hat = m0 / m0_len;
        let n1_hat = m1 / m1_len;

        if n0_hat.dot(&n1_hat) <= 0.0 {
            return Err(FailureKind::DegenerateGeometry(format!(
                "dihedral angle at interior edge {} is outside (-90, 90) degrees",
                interior_edge
            )));
        }

        let sin_psi = e_hat.dot(&n0_hat.cross(&n1_hat)).clamp(-1.0, 1.0);
        Ok(HingeFrame {
            e_hat,
            n0_hat,
            n1_hat,
            edge_len,
            m0_len,
            m1_len,
            sin_psi,
        })
    }
}

struct HingeFrame {
    e_hat: Vector3<f64>,
    n0_hat: Vector3<f64>,
    n1_hat: Vector3<f64>,
    edge_len: f64,
    m0_len: f64,
    m1_len: f64,
    sin_psi: f64,
}
