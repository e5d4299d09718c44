//! Assembly of the finite-horizon trajectory optimization as a canonical MIQP.
use crate::cost::{CostSpec, QuadraticCost, ReferenceTrajectory};
use crate::error::{check_dim, Result, ValueError};
use crate::hybrid::{HybridLinearSystem, StateInputBounds};
use crate::qp::{stack_rows, stack_vec};
use nalgebra::{DMatrix, DVector};

/// Optional boundary conditions of the trajectory.
///
/// `NaN` entries of `x0` and `xn` leave the corresponding coordinate free.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoundarySpec {
    pub x0: Option<DVector<f64>>,
    pub xn: Option<DVector<f64>>,
    /// Inputs that must keep the same value over the whole horizon.
    pub constant_controls: Vec<usize>,
}

/// The trajectory optimization in the canonical form
/// ```text
/// min ½ xᵀ Q1 x + ½ sᵀ Q2 s + ½ αᵀ Q3 α + q1ᵀ x + q2ᵀ s + q3ᵀ α + c
/// s.t. Ain1 x + Ain2 s + Ain3 α ≤ rhs_in
///      Aeq1 x + Aeq2 s + Aeq3 α = rhs_eq
///      α ∈ {0,1}
/// ```
/// with `x = x[0]`, `s = [u[0], slack[0], x[1], u[1], slack[1], …, x[N-1], u[N-1], slack[N-1]]`
/// and `α = [α[0], …, α[N-1]]`.
#[derive(Clone, Debug, PartialEq)]
pub struct CanonicalProgram {
    pub ain1: DMatrix<f64>,
    pub ain2: DMatrix<f64>,
    pub ain3: DMatrix<f64>,
    pub rhs_in: DVector<f64>,
    pub aeq1: DMatrix<f64>,
    pub aeq2: DMatrix<f64>,
    pub aeq3: DMatrix<f64>,
    pub rhs_eq: DVector<f64>,
    pub q1_mat: DMatrix<f64>,
    pub q2_mat: DMatrix<f64>,
    pub q3_mat: DMatrix<f64>,
    pub q1: DVector<f64>,
    pub q2: DVector<f64>,
    pub q3: DVector<f64>,
    pub c: f64,
}

impl CanonicalProgram {
    pub fn x_dim(&self) -> usize {
        self.ain1.ncols()
    }

    pub fn s_dim(&self) -> usize {
        self.ain2.ncols()
    }

    pub fn alpha_dim(&self) -> usize {
        self.ain3.ncols()
    }

    /// Objective value at `(x, s, α)`.
    pub fn objective(&self, x: &DVector<f64>, s: &DVector<f64>, alpha: &DVector<f64>) -> f64 {
        0.5 * x.dot(&(&self.q1_mat * x))
            + 0.5 * s.dot(&(&self.q2_mat * s))
            + 0.5 * alpha.dot(&(&self.q3_mat * alpha))
            + self.q1.dot(x)
            + self.q2.dot(s)
            + self.q3.dot(alpha)
            + self.c
    }
}

/// Builds the [CanonicalProgram] of an `N`-step trajectory of a hybrid system.
pub struct TrajectoryProgramBuilder<'a, S> {
    pub system: &'a S,
    pub horizon: usize,
    pub bounds: &'a StateInputBounds,
    pub cost: &'a CostSpec,
    pub reference: &'a ReferenceTrajectory,
    pub boundary: &'a BoundarySpec,
}

/// Index ranges of the quantities of one step inside the stacked vector `[x; s]`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StepLayout {
    pub x_dim: usize,
    pub u_dim: usize,
    pub slack_dim: usize,
}

impl StepLayout {
    pub fn block(&self) -> usize {
        self.x_dim + self.u_dim + self.slack_dim
    }

    /// Offset of `x[n]` in `[x; s]`.
    pub fn x(&self, n: usize) -> usize {
        n * self.block()
    }

    /// Offset of `u[n]` in `[x; s]`.
    pub fn u(&self, n: usize) -> usize {
        n * self.block() + self.x_dim
    }
}

/// Add `½ δᵀ M δ + mᵀ δ` with `δ = v − reference` to the objective, where `v`
/// starts at `offset` of the variables described by `(mat, vec)`.
fn add_term(
    mat: &mut DMatrix<f64>,
    vec: &mut DVector<f64>,
    c: &mut f64,
    offset: usize,
    quad: Option<&DMatrix<f64>>,
    lin: Option<&DVector<f64>>,
    reference: Option<DVector<f64>>,
) {
    if let Some(m) = quad {
        let n = m.nrows();
        let mut block = mat.view_mut((offset, offset), (n, n));
        block += m;
        if let Some(r) = &reference {
            let mut v = vec.rows_mut(offset, n);
            v -= (m + m.transpose()) * r * 0.5;
            *c += 0.5 * r.dot(&(m * r));
        }
    }
    if let Some(m) = lin {
        let mut v = vec.rows_mut(offset, m.len());
        v += m;
        if let Some(r) = &reference {
            *c -= m.dot(r);
        }
    }
}

impl<'a, S: HybridLinearSystem> TrajectoryProgramBuilder<'a, S> {
    /// Assemble the canonical program.
    ///
    /// The result only depends on the inputs; repeated calls produce identical matrices.
    pub fn assemble(&self) -> Result<CanonicalProgram> {
        let n_steps = self.horizon;
        if n_steps < 2 {
            return Err(ValueError::Setup {
                what: format!("the horizon must have at least 2 steps, got {n_steps}"),
            });
        }
        let enc = self.system.mixed_integer_constraints(self.bounds)?;
        let x_dim = enc.ain_x.ncols();
        let u_dim = enc.ain_u.ncols();
        let slack_dim = enc.slack_dim();
        let a_dim = enc.alpha_dim();
        check_dim("encoding state", x_dim, self.system.x_dim())?;
        check_dim("encoding input", u_dim, self.system.u_dim())?;
        self.cost.stage.validate("stage cost", x_dim, u_dim, a_dim)?;
        self.cost.terminal.validate("terminal cost", x_dim, u_dim, a_dim)?;
        self.reference.validate(x_dim, u_dim, a_dim, n_steps)?;

        let layout = StepLayout {
            x_dim,
            u_dim,
            slack_dim,
        };
        let block = layout.block();
        let full_dim = block * n_steps;
        let s_dim = full_dim - x_dim;
        let alpha_dim = a_dim * n_steps;

        // dynamics inequalities, one block per step
        let num_in_dyn = enc.rhs_in.len();
        let mut ain = DMatrix::zeros(n_steps * num_in_dyn, full_dim);
        let mut ain3 = DMatrix::zeros(n_steps * num_in_dyn, alpha_dim);
        let mut rhs_in = DVector::zeros(n_steps * num_in_dyn);
        for i in 0..n_steps {
            let row = i * num_in_dyn;
            ain.view_mut((row, layout.x(i)), (num_in_dyn, x_dim))
                .copy_from(&enc.ain_x);
            ain.view_mut((row, layout.u(i)), (num_in_dyn, u_dim))
                .copy_from(&enc.ain_u);
            ain.view_mut((row, layout.u(i) + u_dim), (num_in_dyn, slack_dim))
                .copy_from(&enc.ain_slack);
            ain3.view_mut((row, i * a_dim), (num_in_dyn, a_dim))
                .copy_from(&enc.ain_alpha);
            rhs_in.rows_mut(row, num_in_dyn).copy_from(&enc.rhs_in);
        }

        // dynamics equalities x[i+1] = aeq_slack·slack[i] + aeq_alpha·α[i]
        let num_dyn_eq = (n_steps - 1) * x_dim;
        let mut aeq = DMatrix::zeros(num_dyn_eq + n_steps, full_dim);
        let mut aeq3 = DMatrix::zeros(num_dyn_eq + n_steps, alpha_dim);
        let mut rhs_eq = DVector::zeros(num_dyn_eq + n_steps);
        for i in 0..n_steps - 1 {
            let row = i * x_dim;
            aeq.view_mut((row, layout.u(i) + u_dim), (x_dim, slack_dim))
                .copy_from(&enc.aeq_slack);
            aeq.view_mut((row, layout.x(i + 1)), (x_dim, x_dim))
                .copy_from(&(-DMatrix::<f64>::identity(x_dim, x_dim)));
            aeq3.view_mut((row, i * a_dim), (x_dim, a_dim))
                .copy_from(&enc.aeq_alpha);
        }
        // exactly one active mode per step
        for i in 0..n_steps {
            let row = num_dyn_eq + i;
            aeq3.view_mut((row, i * a_dim), (1, a_dim)).fill(1.0);
            rhs_eq[row] = 1.0;
        }

        // box constraints on states and inputs (not on slack)
        let box_dim = x_dim + u_dim;
        let mut a_box = DMatrix::zeros(2 * n_steps * box_dim, full_dim);
        let mut rhs_box = DVector::zeros(2 * n_steps * box_dim);
        let upper = stack_vec(&self.bounds.x_up, &self.bounds.u_up);
        let lower = stack_vec(&self.bounds.x_lo, &self.bounds.u_lo);
        for i in 0..n_steps {
            for j in 0..box_dim {
                let row = i * box_dim + j;
                a_box[(row, layout.x(i) + j)] = 1.0;
                rhs_box[row] = upper[j];
                let row = (n_steps + i) * box_dim + j;
                a_box[(row, layout.x(i) + j)] = -1.0;
                rhs_box[row] = -lower[j];
            }
        }
        let ain = stack_rows(&ain, &a_box);
        let ain3 = stack_rows(&ain3, &DMatrix::zeros(a_box.nrows(), alpha_dim));
        let rhs_in = stack_vec(&rhs_in, &rhs_box);

        // boundary conditions and constant inputs
        let mut extra_rows: Vec<(DVector<f64>, f64)> = Vec::new();
        if let Some(x0) = &self.boundary.x0 {
            check_dim("initial state constraint", x0.len(), x_dim)?;
            for (j, v) in x0.iter().enumerate().filter(|(_, v)| !v.is_nan()) {
                let mut row = DVector::zeros(full_dim);
                row[layout.x(0) + j] = 1.0;
                extra_rows.push((row, *v));
            }
        }
        if let Some(xn) = &self.boundary.xn {
            check_dim("final state constraint", xn.len(), x_dim)?;
            for (j, v) in xn.iter().enumerate().filter(|(_, v)| !v.is_nan()) {
                let mut row = DVector::zeros(full_dim);
                row[layout.x(n_steps - 1) + j] = 1.0;
                extra_rows.push((row, *v));
            }
        }
        for &k in &self.boundary.constant_controls {
            if k >= u_dim {
                return Err(ValueError::Dimension {
                    what: format!("constant control index {k} for {u_dim} inputs"),
                });
            }
            for i in 0..n_steps - 1 {
                let mut row = DVector::zeros(full_dim);
                row[layout.u(i) + k] = 1.0;
                row[layout.u(i + 1) + k] = -1.0;
                extra_rows.push((row, 0.0));
            }
        }
        let mut a_extra = DMatrix::zeros(extra_rows.len(), full_dim);
        let mut rhs_extra = DVector::zeros(extra_rows.len());
        for (i, (row, v)) in extra_rows.iter().enumerate() {
            a_extra.row_mut(i).copy_from(&row.transpose());
            rhs_extra[i] = *v;
        }
        let aeq = stack_rows(&aeq, &a_extra);
        let aeq3 = stack_rows(&aeq3, &DMatrix::zeros(a_extra.nrows(), alpha_dim));
        let rhs_eq = stack_vec(&rhs_eq, &rhs_extra);

        // cost
        let (q_full, q_lin, c) = self.assemble_cost(layout, full_dim);
        let (q3_mat, q3, c_alpha) = self.assemble_alpha_cost(a_dim, alpha_dim);

        Ok(CanonicalProgram {
            ain1: ain.columns(0, x_dim).into_owned(),
            ain2: ain.columns(x_dim, s_dim).into_owned(),
            ain3,
            rhs_in,
            aeq1: aeq.columns(0, x_dim).into_owned(),
            aeq2: aeq.columns(x_dim, s_dim).into_owned(),
            aeq3,
            rhs_eq,
            q1_mat: q_full.view((0, 0), (x_dim, x_dim)).into_owned(),
            q2_mat: q_full.view((x_dim, x_dim), (s_dim, s_dim)).into_owned(),
            q3_mat,
            q1: q_lin.rows(0, x_dim).into_owned(),
            q2: q_lin.rows(x_dim, s_dim).into_owned(),
            q3,
            c: c + c_alpha,
        })
    }

    fn cost_at(&self, n: usize) -> &QuadraticCost {
        if n < self.horizon - 1 {
            &self.cost.stage
        } else {
            &self.cost.terminal
        }
    }

    /// State and input costs over the stacked vector `[x; s]`. States and
    /// inputs never share a quadratic term, so the `x`/`s` cross blocks are zero.
    fn assemble_cost(&self, layout: StepLayout, full_dim: usize) -> (DMatrix<f64>, DVector<f64>, f64) {
        let n_steps = self.horizon;
        let mut q_full = DMatrix::zeros(full_dim, full_dim);
        let mut q_lin = DVector::zeros(full_dim);
        let mut c = 0.0;
        let xref = |n: usize| self.reference.x.as_ref().map(|r| r.column(n).into_owned());
        let uref = |n: usize| self.reference.u.as_ref().map(|r| r.column(n).into_owned());

        for n in 0..n_steps {
            let cost = self.cost_at(n);
            add_term(
                &mut q_full,
                &mut q_lin,
                &mut c,
                layout.x(n),
                cost.q_mat.as_ref(),
                cost.q_vec.as_ref(),
                xref(n),
            );
            add_term(
                &mut q_full,
                &mut q_lin,
                &mut c,
                layout.u(n),
                cost.r_mat.as_ref(),
                cost.r_vec.as_ref(),
                uref(n),
            );
        }
        (q_full, q_lin, c)
    }

    fn assemble_alpha_cost(&self, a_dim: usize, alpha_dim: usize) -> (DMatrix<f64>, DVector<f64>, f64) {
        let n_steps = self.horizon;
        let mut q3_mat = DMatrix::zeros(alpha_dim, alpha_dim);
        let mut q3 = DVector::zeros(alpha_dim);
        let mut c = 0.0;
        for n in 0..n_steps {
            let cost = self.cost_at(n);
            add_term(
                &mut q3_mat,
                &mut q3,
                &mut c,
                n * a_dim,
                cost.z_mat.as_ref(),
                cost.z_vec.as_ref(),
                self.reference.alpha.as_ref().map(|r| r.column(n).into_owned()),
            );
        }
        (q3_mat, q3, c)
    }
}
