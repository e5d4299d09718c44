//! Quadratic tracking costs of the MIQP trajectory optimization.
use crate::error::{check_dim, check_shape, Result};
use nalgebra::{DMatrix, DVector, DVectorView};

/// Quadratic cost of one time step
/// ```text
/// ½ δxᵀ Q δx + ½ δuᵀ R δu + ½ δαᵀ Z δα + qᵀ δx + rᵀ δu + zᵀ δα
/// ```
/// where `δ` is the deviation from the reference trajectory (or the value
/// itself without reference). Absent components contribute nothing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuadraticCost {
    pub q_mat: Option<DMatrix<f64>>,
    pub r_mat: Option<DMatrix<f64>>,
    pub z_mat: Option<DMatrix<f64>>,
    pub q_vec: Option<DVector<f64>>,
    pub r_vec: Option<DVector<f64>>,
    pub z_vec: Option<DVector<f64>>,
}

impl QuadraticCost {
    /// Overwrite the components that are present in `other`.
    pub fn merge(&mut self, other: QuadraticCost) {
        let QuadraticCost {
            q_mat,
            r_mat,
            z_mat,
            q_vec,
            r_vec,
            z_vec,
        } = other;
        self.q_mat = q_mat.or(self.q_mat.take());
        self.r_mat = r_mat.or(self.r_mat.take());
        self.z_mat = z_mat.or(self.z_mat.take());
        self.q_vec = q_vec.or(self.q_vec.take());
        self.r_vec = r_vec.or(self.r_vec.take());
        self.z_vec = z_vec.or(self.z_vec.take());
    }

    pub(crate) fn validate(&self, name: &str, x_dim: usize, u_dim: usize, a_dim: usize) -> Result<()> {
        if let Some(m) = &self.q_mat {
            check_shape(&format!("{name} Q"), m.shape(), (x_dim, x_dim))?;
        }
        if let Some(m) = &self.r_mat {
            check_shape(&format!("{name} R"), m.shape(), (u_dim, u_dim))?;
        }
        if let Some(m) = &self.z_mat {
            check_shape(&format!("{name} Z"), m.shape(), (a_dim, a_dim))?;
        }
        if let Some(v) = &self.q_vec {
            check_dim(&format!("{name} q"), v.len(), x_dim)?;
        }
        if let Some(v) = &self.r_vec {
            check_dim(&format!("{name} r"), v.len(), u_dim)?;
        }
        if let Some(v) = &self.z_vec {
            check_dim(&format!("{name} z"), v.len(), a_dim)?;
        }
        Ok(())
    }
}

/// Stage cost (steps `0..N-1`) and terminal cost (step `N-1`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CostSpec {
    pub stage: QuadraticCost,
    pub terminal: QuadraticCost,
}

/// Reference trajectories, one column per step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReferenceTrajectory {
    pub x: Option<DMatrix<f64>>,
    pub u: Option<DMatrix<f64>>,
    pub alpha: Option<DMatrix<f64>>,
}

impl ReferenceTrajectory {
    pub(crate) fn validate(&self, x_dim: usize, u_dim: usize, a_dim: usize, n: usize) -> Result<()> {
        if let Some(m) = &self.x {
            check_shape("xtraj", m.shape(), (x_dim, n))?;
        }
        if let Some(m) = &self.u {
            check_shape("utraj", m.shape(), (u_dim, n))?;
        }
        if let Some(m) = &self.alpha {
            check_shape("alphatraj", m.shape(), (a_dim, n))?;
        }
        Ok(())
    }
}

/// Cost of one quadratic term `½ δᵀ M δ + mᵀ δ` with `δ = v − reference`.
fn term_cost(
    v: DVectorView<'_, f64>,
    reference: Option<DVectorView<'_, f64>>,
    mat: Option<&DMatrix<f64>>,
    vec: Option<&DVector<f64>>,
) -> f64 {
    let delta = match reference {
        Some(r) => v - r,
        None => v.clone_owned(),
    };
    let mut cost = 0.0;
    if let Some(m) = mat {
        cost += 0.5 * delta.dot(&(m * &delta));
    }
    if let Some(m) = vec {
        cost += m.dot(&delta);
    }
    cost
}

impl CostSpec {
    /// Cost of step `n` of a horizon of `horizon` steps; the last step uses the terminal cost.
    pub fn step_cost(
        &self,
        reference: &ReferenceTrajectory,
        horizon: usize,
        n: usize,
        x: DVectorView<'_, f64>,
        u: DVectorView<'_, f64>,
        alpha: Option<DVectorView<'_, f64>>,
    ) -> f64 {
        assert!(n < horizon, "step {n} outside horizon {horizon}");
        let cost = if n < horizon - 1 {
            &self.stage
        } else {
            &self.terminal
        };
        let mut obj = term_cost(
            x,
            reference.x.as_ref().map(|r| r.column(n)),
            cost.q_mat.as_ref(),
            cost.q_vec.as_ref(),
        );
        obj += term_cost(
            u,
            reference.u.as_ref().map(|r| r.column(n)),
            cost.r_mat.as_ref(),
            cost.r_vec.as_ref(),
        );
        if let Some(alpha) = alpha {
            obj += term_cost(
                alpha,
                reference.alpha.as_ref().map(|r| r.column(n)),
                cost.z_mat.as_ref(),
                cost.z_vec.as_ref(),
            );
        }
        obj
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::dvector;

    #[test]
    fn test_merge_keeps_absent_components() {
        let mut cost = QuadraticCost {
            q_mat: Some(DMatrix::identity(1, 1)),
            r_vec: Some(dvector![1.0]),
            ..Default::default()
        };
        cost.merge(QuadraticCost {
            r_vec: Some(dvector![2.0]),
            ..Default::default()
        });
        assert_eq!(cost.q_mat, Some(DMatrix::identity(1, 1)));
        assert_eq!(cost.r_vec, Some(dvector![2.0]));
    }

    #[test]
    fn test_step_cost_with_reference() {
        let cost_spec = CostSpec {
            stage: QuadraticCost {
                q_mat: Some(DMatrix::from_element(1, 1, 2.0)),
                q_vec: Some(dvector![1.0]),
                ..Default::default()
            },
            terminal: QuadraticCost {
                r_mat: Some(DMatrix::from_element(1, 1, 4.0)),
                ..Default::default()
            },
        };
        let reference = ReferenceTrajectory {
            x: Some(DMatrix::from_row_slice(1, 2, &[0.5, 0.0])),
            ..Default::default()
        };
        let (x, u) = (dvector![1.5], dvector![0.5]);
        // ½·2·1² + 1·1
        let c0 = cost_spec.step_cost(&reference, 2, 0, x.as_view(), u.as_view(), None);
        assert_relative_eq!(c0, 2.0);
        // ½·4·0.5²
        let c1 = cost_spec.step_cost(&reference, 2, 1, x.as_view(), u.as_view(), None);
        assert_relative_eq!(c1, 0.5);
    }
}
