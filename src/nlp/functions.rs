//! Nonlinear knot constraints and their derivatives.
//!
//! Transition and guard functions are implemented once, generically for all
//! types implementing [DualNum]. Values, Jacobians and Hessians are then
//! obtained by evaluating them with `f64`, [Dual64] and [HyperDual64]
//! arguments respectively.
use nalgebra::DMatrix;
use num_dual::{Dual64, DualNum, HyperDual64};

/// State, input and time step of one knot point.
#[derive(Clone, Copy, Debug)]
pub struct Knot<'a, D> {
    pub x: &'a [D],
    pub u: &'a [D],
    pub dt: D,
}

impl<'a, D: Copy> Knot<'a, D> {
    /// Split a slice `[x, u, dt]`.
    fn split(z: &'a [D], x_dim: usize, u_dim: usize) -> Self {
        Self {
            x: &z[..x_dim],
            u: &z[x_dim..x_dim + u_dim],
            dt: z[x_dim + u_dim],
        }
    }
}

/// Constraint `residual(from, to) = 0` between two consecutive knot points.
///
/// The residual must have one entry per state.
///
/// ```
/// use hybrid_value_ad::nlp::{Knot, KnotTransition};
/// use num_dual::DualNum;
///
/// /// Forward Euler step of `ẋ = u`.
/// struct Integrator;
///
/// impl KnotTransition for Integrator {
///     fn residual<D: DualNum<f64> + Copy>(&self, from: Knot<'_, D>, to: Knot<'_, D>) -> Vec<D> {
///         vec![to.x[0] - from.x[0] - from.dt * from.u[0]]
///     }
/// }
/// ```
pub trait KnotTransition {
    fn residual<D: DualNum<f64> + Copy>(&self, from: Knot<'_, D>, to: Knot<'_, D>) -> Vec<D>;
}

/// Scalar guard function of a single knot point.
pub trait KnotGuard {
    fn value<D: DualNum<f64> + Copy>(&self, at: Knot<'_, D>) -> D;
}

/// Object-safe view of a knot constraint on a contiguous slice of
/// `[x, u, dt]` blocks.
pub(crate) trait LocalFunction {
    /// Number of knot points the function depends on.
    fn num_knots(&self) -> usize;

    fn eval(&self, z: &[f64]) -> Vec<f64>;

    fn eval_dual(&self, z: &[Dual64]) -> Vec<Dual64>;

    fn eval_hyper_dual(&self, z: &[HyperDual64]) -> Vec<HyperDual64>;
}

pub(crate) struct TransitionFn<T> {
    pub(crate) f: T,
    pub(crate) x_dim: usize,
    pub(crate) u_dim: usize,
}

impl<T: KnotTransition> TransitionFn<T> {
    fn call<D: DualNum<f64> + Copy>(&self, z: &[D]) -> Vec<D> {
        let block = self.x_dim + self.u_dim + 1;
        self.f.residual(
            Knot::split(&z[..block], self.x_dim, self.u_dim),
            Knot::split(&z[block..], self.x_dim, self.u_dim),
        )
    }
}

impl<T: KnotTransition> LocalFunction for TransitionFn<T> {
    fn num_knots(&self) -> usize {
        2
    }

    fn eval(&self, z: &[f64]) -> Vec<f64> {
        self.call(z)
    }

    fn eval_dual(&self, z: &[Dual64]) -> Vec<Dual64> {
        self.call(z)
    }

    fn eval_hyper_dual(&self, z: &[HyperDual64]) -> Vec<HyperDual64> {
        self.call(z)
    }
}

pub(crate) struct GuardFn<G> {
    pub(crate) f: G,
    pub(crate) x_dim: usize,
    pub(crate) u_dim: usize,
}

impl<G: KnotGuard> GuardFn<G> {
    fn call<D: DualNum<f64> + Copy>(&self, z: &[D]) -> Vec<D> {
        vec![self.f.value(Knot::split(z, self.x_dim, self.u_dim))]
    }
}

impl<G: KnotGuard> LocalFunction for GuardFn<G> {
    fn num_knots(&self) -> usize {
        1
    }

    fn eval(&self, z: &[f64]) -> Vec<f64> {
        self.call(z)
    }

    fn eval_dual(&self, z: &[Dual64]) -> Vec<Dual64> {
        self.call(z)
    }

    fn eval_hyper_dual(&self, z: &[HyperDual64]) -> Vec<HyperDual64> {
        self.call(z)
    }
}

/// Jacobian of `f` at `z`, one forward pass per column.
pub(crate) fn local_jacobian(f: &dyn LocalFunction, z: &[f64], num_outputs: usize) -> DMatrix<f64> {
    let mut jac = DMatrix::zeros(num_outputs, z.len());
    let mut z_dual: Vec<Dual64> = z.iter().map(|&zi| Dual64::from(zi)).collect();
    for j in 0..z.len() {
        z_dual[j].eps = 1.0;
        for (i, g) in f.eval_dual(&z_dual).into_iter().enumerate() {
            jac[(i, j)] = g.eps;
        }
        z_dual[j].eps = 0.0;
    }
    jac
}

/// Hessian of `Σ_i weights[i]·f_i` at `z`.
pub(crate) fn local_weighted_hessian(
    f: &dyn LocalFunction,
    z: &[f64],
    weights: &[f64],
) -> DMatrix<f64> {
    let n = z.len();
    let mut hess = DMatrix::zeros(n, n);
    let mut z_dual: Vec<HyperDual64> = z.iter().map(|&zi| HyperDual64::from(zi)).collect();
    for row in 0..n {
        for col in 0..=row {
            z_dual[row].eps1 = 1.0;
            z_dual[col].eps2 = 1.0;
            let h: f64 = f
                .eval_hyper_dual(&z_dual)
                .iter()
                .zip(weights)
                .map(|(g, &w)| g.eps1eps2 * w)
                .sum();
            hess[(row, col)] = h;
            hess[(col, row)] = h;
            z_dual[row].eps1 = 0.0;
            z_dual[col].eps2 = 0.0;
        }
    }
    hess
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::dmatrix;

    /// `x1 = x0 + dt0·(x0² + u0)` in one dimension.
    struct Quadratic;

    impl KnotTransition for Quadratic {
        fn residual<D: DualNum<f64> + Copy>(&self, from: Knot<'_, D>, to: Knot<'_, D>) -> Vec<D> {
            vec![to.x[0] - from.x[0] - from.dt * (from.x[0] * from.x[0] + from.u[0])]
        }
    }

    struct Circle;

    impl KnotGuard for Circle {
        fn value<D: DualNum<f64> + Copy>(&self, at: Knot<'_, D>) -> D {
            -(at.x[0] * at.x[0] + at.x[1] * at.x[1]) + 1.0
        }
    }

    #[test]
    fn test_transition_derivatives() {
        let f = TransitionFn {
            f: Quadratic,
            x_dim: 1,
            u_dim: 1,
        };
        // [x0, u0, dt0, x1, u1, dt1]
        let z = [2.0, 1.0, 0.1, 3.0, 0.0, 0.1];
        assert_relative_eq!(f.eval(&z)[0], 3.0 - 2.0 - 0.1 * 5.0);

        let jac = local_jacobian(&f, &z, 1);
        let expected = dmatrix![-1.0 - 0.1 * 4.0, -0.1, -5.0, 1.0, 0.0, 0.0];
        assert_relative_eq!(jac, expected, epsilon = 1e-14);

        let hess = local_weighted_hessian(&f, &z, &[2.0]);
        assert_relative_eq!(hess[(0, 0)], -2.0 * 0.2, epsilon = 1e-14);
        assert_relative_eq!(hess[(2, 0)], -2.0 * 4.0, epsilon = 1e-14);
        assert_relative_eq!(hess[(0, 2)], -2.0 * 4.0, epsilon = 1e-14);
        assert_relative_eq!(hess[(2, 1)], -2.0, epsilon = 1e-14);
        assert_relative_eq!(hess[(3, 3)], 0.0);
    }

    #[test]
    fn test_guard_derivatives() {
        let g = GuardFn {
            f: Circle,
            x_dim: 2,
            u_dim: 1,
        };
        let z = [0.5, -0.5, 3.0, 0.1];
        assert_eq!(g.num_knots(), 1);
        assert_relative_eq!(g.eval(&z)[0], 0.5);
        let jac = local_jacobian(&g, &z, 1);
        assert_relative_eq!(jac, dmatrix![-1.0, 1.0, 0.0, 0.0], epsilon = 1e-14);
        let hess = local_weighted_hessian(&g, &z, &[1.0]);
        assert_relative_eq!(
            hess,
            dmatrix![-2.0, 0.0, 0.0, 0.0;
                     0.0, -2.0, 0.0, 0.0;
                     0.0, 0.0, 0.0, 0.0;
                     0.0, 0.0, 0.0, 0.0],
            epsilon = 1e-14
        );
    }
}
