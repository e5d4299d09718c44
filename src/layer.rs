//! Forward/backward pair of a differentiable value function.
//!
//! The forward pass returns the flattened state trajectory and the cost-to-go
//! of every step but the last, together with a [LayerContext] that holds
//! exactly what the backward pass needs. Only the gradient w.r.t. the first
//! cost-to-go entry (the value itself) can be propagated back to `x0`.
use nalgebra::{DMatrix, DVector};

/// Outputs of the forward pass.
#[derive(Clone, Debug)]
pub struct LayerOutput {
    /// States `x[0], …, x[N-2]` stacked into one vector.
    pub x_traj_flat: DVector<f64>,
    /// `cost_to_go[n] = Σ_{k ≥ n} step_cost(k)` for `n = 0, …, N-2`.
    pub cost_to_go: DVector<f64>,
}

impl LayerOutput {
    /// Outputs of a failed forward pass.
    pub fn nan(x_dim: usize, horizon: usize) -> Self {
        let steps = horizon.saturating_sub(1);
        Self {
            x_traj_flat: DVector::from_element(x_dim * steps, f64::NAN),
            cost_to_go: DVector::from_element(steps, f64::NAN),
        }
    }
}

/// Information needed to compute `∂V/∂x0` after a successful forward pass.
#[derive(Clone, Debug)]
pub enum Sensitivity {
    /// Multipliers of the QP with the optimal modes fixed:
    /// `∂V/∂x0 = Aeq1ᵀ λ_eq + Ain1ᵀ λ_in + q1 + Q1 x0`.
    Duals {
        aeq1: DMatrix<f64>,
        ain1: DMatrix<f64>,
        eq_duals: DVector<f64>,
        in_duals: DVector<f64>,
        q1_mat: DMatrix<f64>,
        q1: DVector<f64>,
    },
    /// Gradient obtained by implicit differentiation of the KKT conditions.
    Implicit { dfdp: DVector<f64> },
}

/// State carried from the forward to the backward pass.
#[derive(Clone, Debug)]
pub struct LayerContext {
    x0: DVector<f64>,
    sensitivity: Option<Sensitivity>,
}

impl LayerContext {
    pub fn new(x0: DVector<f64>, sensitivity: Sensitivity) -> Self {
        Self {
            x0,
            sensitivity: Some(sensitivity),
        }
    }

    /// Context of a forward pass that did not find a solution.
    pub fn failed(x0: DVector<f64>) -> Self {
        Self {
            x0,
            sensitivity: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.sensitivity.is_some()
    }

    pub fn sensitivity(&self) -> Option<&Sensitivity> {
        self.sensitivity.as_ref()
    }

    /// Gradient of the value `cost_to_go[0]` w.r.t. `x0`, NaN after a failed forward pass.
    pub fn gradient(&self) -> DVector<f64> {
        match &self.sensitivity {
            None => DVector::from_element(self.x0.len(), f64::NAN),
            Some(Sensitivity::Implicit { dfdp }) => dfdp.clone(),
            Some(Sensitivity::Duals {
                aeq1,
                ain1,
                eq_duals,
                in_duals,
                q1_mat,
                q1,
            }) => {
                let q_sym = (q1_mat + q1_mat.transpose()) * 0.5;
                aeq1.tr_mul(eq_duals) + ain1.tr_mul(in_duals) + q1 + q_sym * &self.x0
            }
        }
    }

    /// Chain rule for upstream gradients of the forward outputs.
    ///
    /// # Panics
    /// If any upstream gradient other than the one of `cost_to_go[0]` is nonzero.
    pub fn backward(
        &self,
        grad_x_traj_flat: &DVector<f64>,
        grad_cost_to_go: &DVector<f64>,
    ) -> DVector<f64> {
        assert!(
            grad_x_traj_flat.iter().all(|&g| g == 0.0),
            "gradients w.r.t. the state trajectory are not supported"
        );
        assert!(
            grad_cost_to_go.iter().skip(1).all(|&g| g == 0.0),
            "only the gradient of the first cost-to-go entry is supported"
        );
        let g0 = grad_cost_to_go.get(0).copied().unwrap_or(0.0);
        self.gradient() * g0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};

    fn duals_context() -> LayerContext {
        LayerContext::new(
            dvector![1.0, -2.0],
            Sensitivity::Duals {
                aeq1: dmatrix![1.0, 0.0],
                ain1: dmatrix![0.0, 1.0; 1.0, 1.0],
                eq_duals: dvector![0.5],
                in_duals: dvector![2.0, 0.0],
                q1_mat: dmatrix![2.0, 0.0; 0.0, 1.0],
                q1: dvector![0.1, 0.2],
            },
        )
    }

    #[test]
    fn test_dual_gradient() {
        let ctx = duals_context();
        // [0.5, 0] + [0, 2] + [0.1, 0.2] + [2, -2]
        assert_relative_eq!(ctx.gradient(), dvector![2.6, 0.2], epsilon = 1e-12);
        let grad = ctx.backward(&DVector::zeros(4), &dvector![3.0, 0.0]);
        assert_relative_eq!(grad, dvector![7.8, 0.6], epsilon = 1e-12);
    }

    #[test]
    fn test_failed_gradient() {
        let ctx = LayerContext::failed(dvector![0.0, 0.0]);
        assert!(!ctx.is_success());
        let grad = ctx.backward(&DVector::zeros(2), &dvector![1.0]);
        assert!(grad.iter().all(|g| g.is_nan()));
    }

    #[test]
    #[should_panic]
    fn test_backward_trajectory_gradient() {
        duals_context().backward(&dvector![0.0, 1.0, 0.0, 0.0], &dvector![1.0, 0.0]);
    }

    #[test]
    #[should_panic]
    fn test_backward_later_cost_to_go() {
        duals_context().backward(&DVector::zeros(4), &dvector![1.0, 1.0]);
    }
}
