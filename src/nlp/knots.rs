//! Append-only sequence of knot points with their constraints and costs.
use super::functions::{local_jacobian, local_weighted_hessian, LocalFunction};
use crate::error::{check_dim, check_shape, Result, ValueError};
use crate::hybrid::StateInputBounds;
use nalgebra::{DMatrix, DVector, DVectorView};
use std::rc::Rc;

/// Box constraints and quadratic cost weights of one mode.
///
/// The cost of a knot point in this mode is
/// `(x − x_desired)ᵀ·q·(x − x_desired) + uᵀ·r·u`.
#[derive(Clone, Debug)]
pub struct ModeSpec {
    pub bounds: StateInputBounds,
    pub q: Option<DMatrix<f64>>,
    pub x_desired: Option<DVector<f64>>,
    pub r: Option<DMatrix<f64>>,
}

impl ModeSpec {
    /// A mode without cost.
    pub fn new(bounds: StateInputBounds) -> Self {
        Self {
            bounds,
            q: None,
            x_desired: None,
            r: None,
        }
    }

    fn validate(&self, x_dim: usize, u_dim: usize) -> Result<()> {
        check_dim("mode x_lo", self.bounds.x_dim(), x_dim)?;
        check_dim("mode u_lo", self.bounds.u_dim(), u_dim)?;
        if let Some(q) = &self.q {
            check_shape("mode Q", q.shape(), (x_dim, x_dim))?;
        }
        if let Some(xd) = &self.x_desired {
            check_dim("mode x_desired", xd.len(), x_dim)?;
        }
        if let Some(r) = &self.r {
            check_shape("mode R", r.shape(), (u_dim, u_dim))?;
        }
        Ok(())
    }
}

/// One decision stage with variables `[x, u, dt]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KnotPoint {
    pub mode: usize,
}

/// Nonlinear constraint on the variables of `num_knots` consecutive knot
/// points starting at `knot`.
#[derive(Clone)]
pub(crate) struct KnotConstraint {
    pub(crate) knot: usize,
    pub(crate) f: Rc<dyn LocalFunction>,
    pub(crate) num_rows: usize,
    /// `f = 0` if true, `f ≥ 0` otherwise.
    pub(crate) equality: bool,
}

impl KnotConstraint {
    fn upper_bound(&self) -> f64 {
        if self.equality {
            0.0
        } else {
            f64::INFINITY
        }
    }
}

#[derive(Clone)]
pub(crate) struct KnotProgram {
    pub(crate) x_dim: usize,
    pub(crate) u_dim: usize,
    pub(crate) modes: Vec<ModeSpec>,
    pub(crate) dt_lo: f64,
    pub(crate) dt_up: f64,
    pub(crate) knots: Vec<KnotPoint>,
    pub(crate) constraints: Vec<KnotConstraint>,
    pub(crate) terminal_cost: Option<DMatrix<f64>>,
}

impl KnotProgram {
    pub(crate) fn new(modes: Vec<ModeSpec>, dt_lo: f64, dt_up: f64) -> Result<Self> {
        let Some(first) = modes.first() else {
            return Err(ValueError::Setup {
                what: "at least one mode is required".into(),
            });
        };
        let (x_dim, u_dim) = (first.bounds.x_dim(), first.bounds.u_dim());
        for mode in &modes {
            mode.validate(x_dim, u_dim)?;
        }
        if dt_lo > dt_up {
            return Err(ValueError::Setup {
                what: format!("time step bounds [{dt_lo}, {dt_up}] are empty"),
            });
        }
        Ok(Self {
            x_dim,
            u_dim,
            modes,
            dt_lo,
            dt_up,
            knots: Vec::new(),
            constraints: Vec::new(),
            terminal_cost: None,
        })
    }

    /// Number of variables `[x, u, dt]` per knot point.
    pub(crate) fn block(&self) -> usize {
        self.x_dim + self.u_dim + 1
    }

    pub(crate) fn num_variables(&self) -> usize {
        self.knots.len() * self.block()
    }

    pub(crate) fn num_constraints(&self) -> usize {
        self.constraints.iter().map(|c| c.num_rows).sum()
    }

    pub(crate) fn offset(&self, knot: usize) -> usize {
        knot * self.block()
    }

    pub(crate) fn add_knot_point(&mut self, mode: usize) -> Result<usize> {
        if mode >= self.modes.len() {
            return Err(ValueError::Setup {
                what: format!("mode {mode} of {} modes", self.modes.len()),
            });
        }
        self.knots.push(KnotPoint { mode });
        Ok(self.knots.len() - 1)
    }

    /// Attach a constraint to the knot points starting at `knot`.
    pub(crate) fn add_constraint(
        &mut self,
        knot: usize,
        f: Rc<dyn LocalFunction>,
        equality: bool,
    ) -> Result<()> {
        if knot + f.num_knots() > self.knots.len() {
            return Err(ValueError::Setup {
                what: format!("constraint on knot {knot} of {}", self.knots.len()),
            });
        }
        let num_rows = f.eval(&vec![0.0; f.num_knots() * self.block()]).len();
        self.constraints.push(KnotConstraint {
            knot,
            f,
            num_rows,
            equality,
        });
        Ok(())
    }

    /// Variable bounds; the initial state is pinned to `x0` if given.
    ///
    /// The pin is intersected with the state box of the first mode, so an
    /// `x0` outside of it yields an empty range (`lo > up`).
    pub(crate) fn variable_bounds(&self, x0: Option<&DVector<f64>>) -> (Vec<f64>, Vec<f64>) {
        let mut lo = Vec::with_capacity(self.num_variables());
        let mut up = Vec::with_capacity(self.num_variables());
        for knot in &self.knots {
            let b = &self.modes[knot.mode].bounds;
            lo.extend(b.x_lo.iter().chain(b.u_lo.iter()));
            lo.push(self.dt_lo);
            up.extend(b.x_up.iter().chain(b.u_up.iter()));
            up.push(self.dt_up);
        }
        if let Some(x0) = x0 {
            for (i, &x) in x0.iter().enumerate() {
                lo[i] = lo[i].max(x);
                up[i] = up[i].min(x);
            }
        }
        (lo, up)
    }

    /// Whether `x0` lies in the state box of the first knot point.
    pub(crate) fn admissible_initial_state(&self, x0: &DVector<f64>) -> bool {
        let (lo, up) = self.variable_bounds(Some(x0));
        lo[..self.x_dim].iter().zip(&up[..self.x_dim]).all(|(l, u)| l <= u)
    }

    pub(crate) fn constraint_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        let mut lo = Vec::with_capacity(self.num_constraints());
        let mut up = Vec::with_capacity(self.num_constraints());
        for c in &self.constraints {
            lo.extend(std::iter::repeat(0.0).take(c.num_rows));
            up.extend(std::iter::repeat(c.upper_bound()).take(c.num_rows));
        }
        (lo, up)
    }

    /// Variables the constraint depends on.
    fn local<'z>(&self, c: &KnotConstraint, z: &'z [f64]) -> &'z [f64] {
        let start = self.offset(c.knot);
        &z[start..start + c.f.num_knots() * self.block()]
    }

    pub(crate) fn constraint_values(&self, z: &[f64]) -> Vec<f64> {
        self.constraints
            .iter()
            .flat_map(|c| c.f.eval(self.local(c, z)))
            .collect()
    }

    /// Dense Jacobian of all constraints.
    pub(crate) fn constraint_jacobian(&self, z: &[f64]) -> DMatrix<f64> {
        let mut jac = DMatrix::zeros(self.num_constraints(), z.len());
        let mut row = 0;
        for c in &self.constraints {
            let local = local_jacobian(c.f.as_ref(), self.local(c, z), c.num_rows);
            jac.view_mut((row, self.offset(c.knot)), local.shape())
                .copy_from(&local);
            row += c.num_rows;
        }
        jac
    }

    /// Dense Hessian of `obj_factor·f + Σ_i lambda[i]·g_i`.
    pub(crate) fn lagrangian_hessian(&self, z: &[f64], obj_factor: f64, lambda: &[f64]) -> DMatrix<f64> {
        let mut hess = self.cost_hessian() * obj_factor;
        let mut row = 0;
        for c in &self.constraints {
            let weights = &lambda[row..row + c.num_rows];
            let local = local_weighted_hessian(c.f.as_ref(), self.local(c, z), weights);
            let start = self.offset(c.knot);
            let mut block = hess.view_mut((start, start), local.shape());
            block += &local;
            row += c.num_rows;
        }
        hess
    }

    /// Weights `(Q, x_desired, R)` of a knot point, with the terminal weight added to `Q`.
    fn knot_weights(&self, n: usize) -> (DMatrix<f64>, DVector<f64>, Option<&DMatrix<f64>>) {
        let mode = &self.modes[self.knots[n].mode];
        let mut q = mode
            .q
            .clone()
            .unwrap_or_else(|| DMatrix::zeros(self.x_dim, self.x_dim));
        if n + 1 == self.knots.len() {
            if let Some(qt) = &self.terminal_cost {
                q += qt;
            }
        }
        let xd = mode
            .x_desired
            .clone()
            .unwrap_or_else(|| DVector::zeros(self.x_dim));
        (q, xd, mode.r.as_ref())
    }

    /// Cost of knot point `n`.
    pub(crate) fn knot_cost(&self, n: usize, x: DVectorView<'_, f64>, u: DVectorView<'_, f64>) -> f64 {
        let (q, xd, r) = self.knot_weights(n);
        let dx = x - xd;
        let mut cost = dx.dot(&(&q * &dx));
        if let Some(r) = r {
            cost += u.dot(&(r * u));
        }
        cost
    }

    pub(crate) fn cost(&self, z: &[f64]) -> f64 {
        let z = DVectorView::from_slice(z, z.len());
        (0..self.knots.len())
            .map(|n| {
                let start = self.offset(n);
                self.knot_cost(
                    n,
                    z.rows(start, self.x_dim),
                    z.rows(start + self.x_dim, self.u_dim),
                )
            })
            .sum()
    }

    pub(crate) fn cost_gradient(&self, z: &[f64]) -> DVector<f64> {
        let z = DVectorView::from_slice(z, z.len());
        let mut grad = DVector::zeros(z.len());
        for n in 0..self.knots.len() {
            let start = self.offset(n);
            let (q, xd, r) = self.knot_weights(n);
            let dx = z.rows(start, self.x_dim) - xd;
            grad.rows_mut(start, self.x_dim)
                .copy_from(&((&q + q.transpose()) * dx));
            if let Some(r) = r {
                let u = z.rows(start + self.x_dim, self.u_dim);
                grad.rows_mut(start + self.x_dim, self.u_dim)
                    .copy_from(&((r + r.transpose()) * u));
            }
        }
        grad
    }

    /// The cost is quadratic, so its Hessian does not depend on the variables.
    pub(crate) fn cost_hessian(&self) -> DMatrix<f64> {
        let n_var = self.num_variables();
        let mut hess = DMatrix::zeros(n_var, n_var);
        for n in 0..self.knots.len() {
            let start = self.offset(n);
            let (q, _, r) = self.knot_weights(n);
            hess.view_mut((start, start), (self.x_dim, self.x_dim))
                .copy_from(&(&q + q.transpose()));
            if let Some(r) = r {
                let u = start + self.x_dim;
                hess.view_mut((u, u), (self.u_dim, self.u_dim))
                    .copy_from(&(r + r.transpose()));
            }
        }
        hess
    }

    /// Entries of the lower triangle of the Lagrangian Hessian that can be nonzero.
    pub(crate) fn hessian_structure(&self) -> Vec<(usize, usize)> {
        let mut entries = std::collections::BTreeSet::new();
        for n in 0..self.knots.len() {
            let start = self.offset(n);
            for (first, dim) in [(start, self.x_dim), (start + self.x_dim, self.u_dim)] {
                for row in first..first + dim {
                    entries.extend((first..=row).map(|col| (row, col)));
                }
            }
        }
        for c in &self.constraints {
            let start = self.offset(c.knot);
            let end = start + c.f.num_knots() * self.block();
            for row in start..end {
                entries.extend((start..=row).map(|col| (row, col)));
            }
        }
        entries.into_iter().collect()
    }

    /// Entries of the constraint Jacobian that can be nonzero, row by row.
    pub(crate) fn jacobian_structure(&self) -> Vec<(usize, usize)> {
        let mut entries = Vec::new();
        let mut row = 0;
        for c in &self.constraints {
            let start = self.offset(c.knot);
            let end = start + c.f.num_knots() * self.block();
            for r in row..row + c.num_rows {
                entries.extend((start..end).map(|col| (r, col)));
            }
            row += c.num_rows;
        }
        entries
    }

    /// `s = [u0, x1, u1, …]` and the mode of every knot point.
    pub(crate) fn split_solution(&self, z: &[f64]) -> (DVector<f64>, DVector<f64>) {
        let s = (0..self.knots.len()).flat_map(|n| {
            let start = self.offset(n);
            let first = if n == 0 { start + self.x_dim } else { start };
            z[first..start + self.x_dim + self.u_dim].iter().copied()
        });
        let alpha = self.knots.iter().map(|k| k.mode as f64);
        (
            DVector::from_iterator(self.knots.len() * (self.x_dim + self.u_dim) - self.x_dim, s),
            DVector::from_iterator(self.knots.len(), alpha),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hybrid::test::unit_bounds;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    fn two_knots() -> KnotProgram {
        let mut mode = ModeSpec::new(unit_bounds(2, 1));
        mode.q = Some(dmatrix![2.0, 1.0; 0.0, 1.0]);
        mode.x_desired = Some(dvector![0.5, -0.5]);
        mode.r = Some(dmatrix![3.0]);
        let mut prog = KnotProgram::new(vec![mode], 0.0, 0.1).unwrap();
        prog.add_knot_point(0).unwrap();
        prog.add_knot_point(0).unwrap();
        prog.terminal_cost = Some(DMatrix::identity(2, 2));
        prog
    }

    #[test]
    fn test_cost_derivatives() {
        let prog = two_knots();
        assert_eq!(prog.num_variables(), 8);
        let z = [0.1, 0.2, -0.3, 0.05, 0.4, -0.6, 0.7, 0.02];
        let grad = prog.cost_gradient(&z);
        let hess = prog.cost_hessian();
        let h = 1e-6;
        for j in 0..z.len() {
            let mut zp = z;
            let mut zm = z;
            zp[j] += h;
            zm[j] -= h;
            let fd = (prog.cost(&zp) - prog.cost(&zm)) / (2.0 * h);
            assert_relative_eq!(grad[j], fd, epsilon = 1e-6);
            let gp = prog.cost_gradient(&zp);
            let gm = prog.cost_gradient(&zm);
            for i in 0..z.len() {
                assert_relative_eq!(hess[(i, j)], (gp[i] - gm[i]) / (2.0 * h), epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_terminal_cost() {
        let prog = two_knots();
        let x = dvector![1.5, 0.5];
        let u = dvector![0.0];
        // (x − xd)ᵀ Q (x − xd) = 4, terminal adds |x − xd|² = 2
        assert_relative_eq!(prog.knot_cost(0, x.as_view(), u.as_view()), 4.0);
        assert_relative_eq!(prog.knot_cost(1, x.as_view(), u.as_view()), 6.0);
    }

    #[test]
    fn test_bounds_and_split() {
        let prog = two_knots();
        let (lo, up) = prog.variable_bounds(Some(&dvector![0.3, 0.4]));
        assert_eq!(lo, vec![0.3, 0.4, -1.0, 0.0, -1.0, -1.0, -1.0, 0.0]);
        assert_eq!(up, vec![0.3, 0.4, 1.0, 0.1, 1.0, 1.0, 1.0, 0.1]);

        let z = [0.3, 0.4, 0.5, 0.1, 0.6, 0.7, 0.8, 0.1];
        let (s, alpha) = prog.split_solution(&z);
        assert_eq!(s, dvector![0.5, 0.6, 0.7, 0.8]);
        assert_eq!(alpha, dvector![0.0, 0.0]);
    }

    #[test]
    fn test_initial_state_outside_box() {
        let prog = two_knots();
        let (lo, up) = prog.variable_bounds(Some(&dvector![2.0, 0.4]));
        assert!(lo[0] > up[0]);
        assert_eq!((lo[1], up[1]), (0.4, 0.4));
        assert!(!prog.admissible_initial_state(&dvector![2.0, 0.4]));
        assert!(!prog.admissible_initial_state(&dvector![0.0, -1.5]));
        assert!(prog.admissible_initial_state(&dvector![1.0, -1.0]));
    }

    #[test]
    fn test_structure() {
        let prog = two_knots();
        // a 2x2 lower triangle and a 1x1 block per knot
        assert_eq!(prog.hessian_structure().len(), 8);
        assert!(prog.jacobian_structure().is_empty());
        assert!(KnotProgram::new(vec![], 0.0, 0.1).is_err());
        assert!(KnotProgram::new(vec![ModeSpec::new(unit_bounds(1, 1))], 0.2, 0.1).is_err());
    }
}
