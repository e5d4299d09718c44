//! Interface between a knot program and IPOPT.
use super::knots::KnotProgram;
use ipopt::{BasicProblem, ConstrainedProblem};
use nalgebra::{DMatrix, DVector};
use std::cell::RefCell;

/// A knot program with its initial state pinned to `x0`.
///
/// Sparsity patterns are derived from the knot structure once; derivatives
/// are evaluated densely and the structural entries picked from them.
pub(crate) struct KnotProblem {
    program: KnotProgram,
    x0: DVector<f64>,
    con_jac_row_vec: Vec<i32>,
    con_jac_col_vec: Vec<i32>,
    hess_row_vec: Vec<i32>,
    hess_col_vec: Vec<i32>,
    jac_cache: RefCell<Option<DMatrix<f64>>>,
}

impl KnotProblem {
    pub(crate) fn new(program: KnotProgram, x0: DVector<f64>) -> Self {
        let (con_jac_row_vec, con_jac_col_vec) = program
            .jacobian_structure()
            .into_iter()
            .map(|(r, c)| (r as i32, c as i32))
            .unzip();
        let (hess_row_vec, hess_col_vec) = program
            .hessian_structure()
            .into_iter()
            .map(|(r, c)| (r as i32, c as i32))
            .unzip();
        Self {
            program,
            x0,
            con_jac_row_vec,
            con_jac_col_vec,
            hess_row_vec,
            hess_col_vec,
            jac_cache: RefCell::new(None),
        }
    }

    fn update_cache(&self, new_x: bool) {
        if new_x {
            *self.jac_cache.borrow_mut() = None;
        }
    }
}

impl BasicProblem for KnotProblem {
    fn num_variables(&self) -> usize {
        self.program.num_variables()
    }

    fn bounds(&self, x_l: &mut [f64], x_u: &mut [f64]) -> bool {
        let (lbnd, ubnd) = self.program.variable_bounds(Some(&self.x0));
        x_l.copy_from_slice(&lbnd);
        x_u.copy_from_slice(&ubnd);
        true
    }

    fn initial_point(&self, x: &mut [f64]) -> bool {
        x.fill(0.0);
        true
    }

    fn objective(&self, x: &[f64], new_x: bool, obj: &mut f64) -> bool {
        self.update_cache(new_x);
        *obj = self.program.cost(x);
        true
    }

    fn objective_grad(&self, x: &[f64], new_x: bool, grad_f: &mut [f64]) -> bool {
        self.update_cache(new_x);
        grad_f.copy_from_slice(self.program.cost_gradient(x).as_slice());
        true
    }
}

impl ConstrainedProblem for KnotProblem {
    fn num_constraints(&self) -> usize {
        self.program.num_constraints()
    }

    fn num_constraint_jacobian_non_zeros(&self) -> usize {
        self.con_jac_col_vec.len()
    }

    fn constraint(&self, x: &[f64], new_x: bool, g: &mut [f64]) -> bool {
        self.update_cache(new_x);
        g.copy_from_slice(&self.program.constraint_values(x));
        true
    }

    fn constraint_bounds(&self, g_l: &mut [f64], g_u: &mut [f64]) -> bool {
        let (lbnd, ubnd) = self.program.constraint_bounds();
        g_l.copy_from_slice(&lbnd);
        g_u.copy_from_slice(&ubnd);
        true
    }

    fn constraint_jacobian_indices(&self, rows: &mut [i32], cols: &mut [i32]) -> bool {
        rows.copy_from_slice(&self.con_jac_row_vec);
        cols.copy_from_slice(&self.con_jac_col_vec);
        true
    }

    fn constraint_jacobian_values(&self, x: &[f64], new_x: bool, vals: &mut [f64]) -> bool {
        self.update_cache(new_x);
        let mut cache = self.jac_cache.borrow_mut();
        let jac = cache.get_or_insert_with(|| self.program.constraint_jacobian(x));
        for ((v, &r), &c) in vals
            .iter_mut()
            .zip(&self.con_jac_row_vec)
            .zip(&self.con_jac_col_vec)
        {
            *v = jac[(r as usize, c as usize)];
        }
        true
    }

    fn num_hessian_non_zeros(&self) -> usize {
        self.hess_col_vec.len()
    }

    fn hessian_indices(&self, rows: &mut [i32], cols: &mut [i32]) -> bool {
        rows.copy_from_slice(&self.hess_row_vec);
        cols.copy_from_slice(&self.hess_col_vec);
        true
    }

    fn hessian_values(
        &self,
        x: &[f64],
        new_x: bool,
        obj_factor: f64,
        lambda: &[f64],
        vals: &mut [f64],
    ) -> bool {
        self.update_cache(new_x);
        let hess = self.program.lagrangian_hessian(x, obj_factor, lambda);
        for ((v, &r), &c) in vals
            .iter_mut()
            .zip(&self.hess_row_vec)
            .zip(&self.hess_col_vec)
        {
            *v = hess[(r as usize, c as usize)];
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hybrid::test::unit_bounds;
    use crate::nlp::functions::{Knot, KnotTransition, TransitionFn};
    use crate::nlp::knots::ModeSpec;
    use approx::assert_relative_eq;
    use nalgebra::dvector;
    use num_dual::DualNum;
    use std::rc::Rc;

    /// Forward Euler step of `ẋ = u − x³`.
    struct Cubic;

    impl KnotTransition for Cubic {
        fn residual<D: DualNum<f64> + Copy>(&self, from: Knot<'_, D>, to: Knot<'_, D>) -> Vec<D> {
            let x = from.x[0];
            vec![to.x[0] - x - from.dt * (from.u[0] - x * x * x)]
        }
    }

    fn cubic_problem() -> KnotProblem {
        let mode = ModeSpec::new(unit_bounds(1, 1));
        let mut program = KnotProgram::new(vec![mode], 0.1, 0.1).unwrap();
        program.add_knot_point(0).unwrap();
        program.add_knot_point(0).unwrap();
        let f = TransitionFn {
            f: Cubic,
            x_dim: 1,
            u_dim: 1,
        };
        program.add_constraint(0, Rc::new(f), true).unwrap();
        KnotProblem::new(program, dvector![0.0])
    }

    fn jacobian_values(problem: &KnotProblem, x: &[f64], new_x: bool) -> Vec<f64> {
        let mut vals = vec![0.0; problem.num_constraint_jacobian_non_zeros()];
        assert!(problem.constraint_jacobian_values(x, new_x, &mut vals));
        vals
    }

    #[test]
    fn test_jacobian_follows_new_point() {
        let problem = cubic_problem();
        let xa = [0.0, 0.0, 0.1, 0.0, 0.0, 0.1];
        let xb = [0.6, 0.5, 0.1, 0.3, 0.0, 0.1];
        let at_xa = jacobian_values(&problem, &xa, true);

        // IPOPT flags a new point only on the first callback that sees it
        let mut obj = 0.0;
        assert!(problem.objective(&xb, true, &mut obj));
        let at_xb = jacobian_values(&problem, &xb, false);
        assert_ne!(at_xa, at_xb);

        let dense = problem.program.constraint_jacobian(&xb);
        for ((v, &r), &c) in at_xb
            .iter()
            .zip(&problem.con_jac_row_vec)
            .zip(&problem.con_jac_col_vec)
        {
            assert_relative_eq!(*v, dense[(r as usize, c as usize)]);
        }
        // ∂r/∂x0 = −1 + 3·dt·x0²
        assert_relative_eq!(dense[(0, 0)], -1.0 + 0.3 * 0.36, epsilon = 1e-14);

        // same point, no new evaluation needed
        assert_eq!(jacobian_values(&problem, &xb, false), at_xb);
    }

    #[test]
    fn test_bounds_reject_initial_state_outside_box() {
        let problem = KnotProblem::new(cubic_problem().program, dvector![2.0]);
        let mut lo = vec![0.0; 6];
        let mut up = vec![0.0; 6];
        assert!(problem.bounds(&mut lo, &mut up));
        assert!(lo[0] > up[0]);
        assert_eq!(&lo[1..], &[-1.0, 0.1, -1.0, -1.0, 0.1]);
    }
}
