//! Hybrid linear systems and their mixed-integer encoding.
use crate::error::{check_dim, check_shape, Result, ValueError};
use nalgebra::{DMatrix, DVector};

/// Box bounds on the states and inputs of a trajectory.
#[derive(Clone, Debug)]
pub struct StateInputBounds {
    pub x_lo: DVector<f64>,
    pub x_up: DVector<f64>,
    pub u_lo: DVector<f64>,
    pub u_up: DVector<f64>,
}

impl StateInputBounds {
    pub fn new(
        x_lo: DVector<f64>,
        x_up: DVector<f64>,
        u_lo: DVector<f64>,
        u_up: DVector<f64>,
    ) -> Result<Self> {
        check_dim("x_up", x_up.len(), x_lo.len())?;
        check_dim("u_up", u_up.len(), u_lo.len())?;
        Ok(Self {
            x_lo,
            x_up,
            u_lo,
            u_up,
        })
    }

    pub fn x_dim(&self) -> usize {
        self.x_lo.len()
    }

    pub fn u_dim(&self) -> usize {
        self.u_lo.len()
    }
}

/// Mixed-integer encoding of one step of a hybrid system:
/// ```text
/// x[n+1] = aeq_slack·slack + aeq_alpha·α
/// ain_x·x[n] + ain_u·u[n] + ain_slack·slack + ain_alpha·α ≤ rhs_in
/// ```
/// where `α` are the binary mode indicators of the step.
#[derive(Clone, Debug)]
pub struct MixedIntegerEncoding {
    pub aeq_slack: DMatrix<f64>,
    pub aeq_alpha: DMatrix<f64>,
    pub ain_x: DMatrix<f64>,
    pub ain_u: DMatrix<f64>,
    pub ain_slack: DMatrix<f64>,
    pub ain_alpha: DMatrix<f64>,
    pub rhs_in: DVector<f64>,
}

impl MixedIntegerEncoding {
    pub fn slack_dim(&self) -> usize {
        self.ain_slack.ncols()
    }

    pub fn alpha_dim(&self) -> usize {
        self.ain_alpha.ncols()
    }
}

/// A dynamical system with several discrete modes, each with affine dynamics
/// valid on a polyhedral region of the state/input space.
pub trait HybridLinearSystem {
    fn x_dim(&self) -> usize;

    fn u_dim(&self) -> usize;

    fn num_modes(&self) -> usize;

    /// Return the mixed-integer encoding of one step, valid for states and
    /// inputs within `bounds`.
    fn mixed_integer_constraints(&self, bounds: &StateInputBounds) -> Result<MixedIntegerEncoding>;
}

/// One mode `x[n+1] = A x[n] + B u[n] + c`, valid when `P [x; u] ≤ q`.
#[derive(Clone, Debug)]
pub struct AffineMode {
    pub a: DMatrix<f64>,
    pub b: DMatrix<f64>,
    pub c: DVector<f64>,
    pub p: DMatrix<f64>,
    pub q: DVector<f64>,
}

/// A piecewise-affine system given by a list of [AffineMode]s.
#[derive(Clone, Debug)]
pub struct PiecewiseAffineSystem {
    x_dim: usize,
    u_dim: usize,
    modes: Vec<AffineMode>,
}

impl PiecewiseAffineSystem {
    pub fn new(x_dim: usize, u_dim: usize) -> Self {
        Self {
            x_dim,
            u_dim,
            modes: Vec::new(),
        }
    }

    /// Add a mode and return its index.
    pub fn add_mode(&mut self, mode: AffineMode) -> Result<usize> {
        let (nx, nu) = (self.x_dim, self.u_dim);
        check_shape("A", mode.a.shape(), (nx, nx))?;
        check_shape("B", mode.b.shape(), (nx, nu))?;
        check_dim("c", mode.c.len(), nx)?;
        check_shape("P", mode.p.shape(), (mode.q.len(), nx + nu))?;
        self.modes.push(mode);
        Ok(self.modes.len() - 1)
    }

    pub fn modes(&self) -> &[AffineMode] {
        &self.modes
    }

    /// Successor state of mode `mode`.
    pub fn step(&self, mode: usize, x: &DVector<f64>, u: &DVector<f64>) -> Result<DVector<f64>> {
        let m = self.modes.get(mode).ok_or_else(|| ValueError::Dimension {
            what: format!("mode {mode} of {} modes", self.modes.len()),
        })?;
        check_dim("x", x.len(), self.x_dim)?;
        check_dim("u", u.len(), self.u_dim)?;
        Ok(&m.a * x + &m.b * u + &m.c)
    }

    /// Index of the first mode whose region contains `(x, u)`.
    pub fn active_mode(&self, x: &DVector<f64>, u: &DVector<f64>, tol: f64) -> Option<usize> {
        let xu = DVector::from_iterator(self.x_dim + self.u_dim, x.iter().chain(u.iter()).copied());
        self.modes.iter().position(|m| {
            (&m.p * &xu - &m.q).iter().all(|&v| v <= tol)
        })
    }
}

impl HybridLinearSystem for PiecewiseAffineSystem {
    fn x_dim(&self) -> usize {
        self.x_dim
    }

    fn u_dim(&self) -> usize {
        self.u_dim
    }

    fn num_modes(&self) -> usize {
        self.modes.len()
    }

    /// Big-M encoding with slack `[s_1 … s_K, t_1 … t_K]`, `s_i = α_i x`, `t_i = α_i u`:
    /// ```text
    /// x = Σ s_i,  u = Σ t_i
    /// P_i [s_i; t_i] ≤ q_i α_i
    /// x_lo α_i ≤ s_i ≤ x_up α_i,  u_lo α_i ≤ t_i ≤ u_up α_i
    /// x[n+1] = Σ A_i s_i + B_i t_i + c_i α_i
    /// ```
    fn mixed_integer_constraints(&self, bounds: &StateInputBounds) -> Result<MixedIntegerEncoding> {
        let (nx, nu, k) = (self.x_dim, self.u_dim, self.modes.len());
        check_dim("x bounds", bounds.x_dim(), nx)?;
        check_dim("u bounds", bounds.u_dim(), nu)?;
        if k == 0 {
            return Err(ValueError::Setup {
                what: "hybrid system without modes".to_string(),
            });
        }
        let all_bounds = [&bounds.x_lo, &bounds.x_up, &bounds.u_lo, &bounds.u_up];
        if all_bounds.iter().any(|b| b.iter().any(|v| !v.is_finite())) {
            return Err(ValueError::Setup {
                what: "the mixed-integer encoding needs finite state and input bounds".to_string(),
            });
        }

        let slack_dim = k * (nx + nu);
        let s_col = |i: usize| i * nx;
        let t_col = |i: usize| k * nx + i * nu;

        let mut aeq_slack = DMatrix::zeros(nx, slack_dim);
        let mut aeq_alpha = DMatrix::zeros(nx, k);
        for (i, m) in self.modes.iter().enumerate() {
            aeq_slack.view_mut((0, s_col(i)), (nx, nx)).copy_from(&m.a);
            aeq_slack.view_mut((0, t_col(i)), (nx, nu)).copy_from(&m.b);
            aeq_alpha.column_mut(i).copy_from(&m.c);
        }

        let num_region_rows: usize = self.modes.iter().map(|m| m.q.len()).sum();
        let num_rows = 2 * (nx + nu) + num_region_rows + 2 * k * (nx + nu);
        let mut ain_x = DMatrix::zeros(num_rows, nx);
        let mut ain_u = DMatrix::zeros(num_rows, nu);
        let mut ain_slack = DMatrix::zeros(num_rows, slack_dim);
        let mut ain_alpha = DMatrix::zeros(num_rows, k);
        let rhs_in = DVector::zeros(num_rows);
        let mut row = 0;

        // x = Σ s_i as x − Σ s_i ≤ 0 and −x + Σ s_i ≤ 0
        for sign in [1.0, -1.0] {
            for j in 0..nx {
                ain_x[(row + j, j)] = sign;
                for i in 0..k {
                    ain_slack[(row + j, s_col(i) + j)] = -sign;
                }
            }
            row += nx;
        }
        for sign in [1.0, -1.0] {
            for j in 0..nu {
                ain_u[(row + j, j)] = sign;
                for i in 0..k {
                    ain_slack[(row + j, t_col(i) + j)] = -sign;
                }
            }
            row += nu;
        }

        for (i, m) in self.modes.iter().enumerate() {
            let rows = m.q.len();
            ain_slack
                .view_mut((row, s_col(i)), (rows, nx))
                .copy_from(&m.p.columns(0, nx));
            ain_slack
                .view_mut((row, t_col(i)), (rows, nu))
                .copy_from(&m.p.columns(nx, nu));
            ain_alpha.view_mut((row, i), (rows, 1)).copy_from(&(-&m.q));
            row += rows;
        }

        for i in 0..k {
            for j in 0..nx {
                ain_slack[(row, s_col(i) + j)] = 1.0;
                ain_alpha[(row, i)] = -bounds.x_up[j];
                ain_slack[(row + 1, s_col(i) + j)] = -1.0;
                ain_alpha[(row + 1, i)] = bounds.x_lo[j];
                row += 2;
            }
            for j in 0..nu {
                ain_slack[(row, t_col(i) + j)] = 1.0;
                ain_alpha[(row, i)] = -bounds.u_up[j];
                ain_slack[(row + 1, t_col(i) + j)] = -1.0;
                ain_alpha[(row + 1, i)] = bounds.u_lo[j];
                row += 2;
            }
        }
        debug_assert_eq!(row, num_rows);

        Ok(MixedIntegerEncoding {
            aeq_slack,
            aeq_alpha,
            ain_x,
            ain_u,
            ain_slack,
            ain_alpha,
            rhs_in,
        })
    }
}
