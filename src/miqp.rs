//! Value function of a hybrid linear system given by a parametric MIQP.
use crate::config::SolverSettings;
use crate::cost::{CostSpec, QuadraticCost, ReferenceTrajectory};
use crate::error::{check_dim, Result, ValueError};
use crate::hybrid::{HybridLinearSystem, StateInputBounds};
use crate::layer::{LayerContext, LayerOutput, Sensitivity};
use crate::program::{BoundarySpec, CanonicalProgram, TrajectoryProgramBuilder};
use crate::qp::{branch_and_bound, solve_qp, stack_rows, stack_vec, QpData, QpOutcome};
use crate::value::{
    sample_points, DifferentiableValueFn, Evaluation, SampleGrid, ValueFn, ValueFunction,
};
use nalgebra::{DMatrix, DVector, DVectorView};
use tracing::{debug, warn};

/// Boxed closure returned by [MiqpValueFunction::get_q_function].
pub type QFn<'a> = Box<dyn Fn(&DVector<f64>, &DVector<f64>) -> Result<Option<Evaluation>> + 'a>;

/// Optimal cost-to-go of an `N`-step trajectory optimization of a hybrid
/// linear system, as a function of the initial state `x0`.
///
/// The trajectory optimization is assembled into a [CanonicalProgram] in
/// which `x0` is a parameter. Gradients w.r.t. `x0` are recovered from the
/// multipliers of the continuous QP obtained by fixing the modes to the
/// optimal MIQP solution.
pub struct MiqpValueFunction<S> {
    system: S,
    horizon: usize,
    bounds: StateInputBounds,
    cost: CostSpec,
    reference: ReferenceTrajectory,
    boundary: BoundarySpec,
    settings: SolverSettings,
}

impl<S: HybridLinearSystem> MiqpValueFunction<S> {
    /// Value function over `horizon` steps with `x_lo ≤ x[n] ≤ x_up` and `u_lo ≤ u[n] ≤ u_up`.
    pub fn new(system: S, horizon: usize, bounds: StateInputBounds) -> Self {
        Self {
            system,
            horizon,
            bounds,
            cost: CostSpec::default(),
            reference: ReferenceTrajectory::default(),
            boundary: BoundarySpec::default(),
            settings: SolverSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: SolverSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    /// Set the components of the stage cost that are present in `cost`.
    pub fn set_cost(&mut self, cost: QuadraticCost) {
        self.cost.stage.merge(cost);
    }

    /// Set the components of the terminal cost that are present in `cost`.
    pub fn set_terminal_cost(&mut self, cost: QuadraticCost) {
        self.cost.terminal.merge(cost);
    }

    /// Constrain `x[0] = x0` and `x[N-1] = xn`; `NaN` entries stay free.
    pub fn set_constraints(&mut self, x0: Option<DVector<f64>>, xn: Option<DVector<f64>>) {
        if x0.is_some() {
            self.boundary.x0 = x0;
        }
        if xn.is_some() {
            self.boundary.xn = xn;
        }
    }

    /// Set the reference trajectories that are present in `reference`.
    pub fn set_traj(&mut self, reference: ReferenceTrajectory) {
        let ReferenceTrajectory { x, u, alpha } = reference;
        self.reference.x = x.or(self.reference.x.take());
        self.reference.u = u.or(self.reference.u.take());
        self.reference.alpha = alpha.or(self.reference.alpha.take());
    }

    /// Keep input `index` constant over the whole trajectory.
    pub fn set_constant_control(&mut self, index: usize) {
        self.boundary.constant_controls.push(index);
    }

    /// Assemble the trajectory optimization with the current costs and constraints.
    pub fn traj_opt_constraint(&self) -> Result<CanonicalProgram> {
        TrajectoryProgramBuilder {
            system: &self.system,
            horizon: self.horizon,
            bounds: &self.bounds,
            cost: &self.cost,
            reference: &self.reference,
            boundary: &self.boundary,
        }
        .assemble()
    }

    /// Optimal cost-to-go for the initial state `x0` and the first input `u0`.
    pub fn evaluate_q(&self, x0: &DVector<f64>, u0: &DVector<f64>) -> Result<Option<Evaluation>> {
        let q = self.get_q_function()?;
        q(x0, u0)
    }

    /// Return a closure that evaluates the Q-function `Q(x0, u0)`.
    pub fn get_q_function(&self) -> Result<QFn<'_>> {
        let prog = self.traj_opt_constraint()?;
        Ok(Box::new(move |x0: &DVector<f64>, u0: &DVector<f64>| {
            check_dim("u0", u0.len(), self.system.u_dim())?;
            self.solve_miqp(&prog, x0, Some(u0))
        }))
    }

    /// Evaluate the Q-function on a full factorial grid over states and first
    /// inputs and keep the feasible samples.
    pub fn get_q_sample_grid(
        &self,
        x_lo: &DVector<f64>,
        x_up: &DVector<f64>,
        x_num_breaks: &[usize],
        u_lo: &DVector<f64>,
        u_up: &DVector<f64>,
        u_num_breaks: &[usize],
    ) -> Result<SampleGrid> {
        let points = sample_points(&[(x_lo, x_up, x_num_breaks), (u_lo, u_up, u_num_breaks)])?;
        let q = self.get_q_function()?;
        let x_dim = x_lo.len();
        let mut grid = SampleGrid::default();
        for (k, xu) in points.into_iter().enumerate() {
            let x = xu.rows(0, x_dim).into_owned();
            let u = xu.rows(x_dim, xu.len() - x_dim).into_owned();
            if let Some(eval) = q(&x, &u)? {
                grid.x.push(x);
                grid.u.push(u);
                grid.v.push(eval.cost);
            }
            debug!("Q sample {k}: {} feasible", grid.len());
        }
        Ok(grid)
    }

    fn solve_miqp(
        &self,
        prog: &CanonicalProgram,
        x0: &DVector<f64>,
        u0: Option<&DVector<f64>>,
    ) -> Result<Option<Evaluation>> {
        check_dim("x0", x0.len(), prog.x_dim())?;
        let (mut qp, constant) = mixed_integer_qp(prog, x0);
        if let Some(u0) = u0 {
            let mut a = DMatrix::zeros(u0.len(), qp.num_variables());
            a.view_mut((0, 0), (u0.len(), u0.len()))
                .fill_with_identity();
            qp.push_equalities(&a, u0);
        }
        let s_dim = prog.s_dim();
        let binaries = s_dim..s_dim + prog.alpha_dim();
        match branch_and_bound(&qp, binaries, &self.settings)? {
            QpOutcome::Solved(sol) => {
                debug!("MIQP solved after {} nodes", sol.nodes);
                Ok(Some(Evaluation {
                    cost: sol.objective + constant,
                    s: sol.y.rows(0, s_dim).into_owned(),
                    alpha: sol.y.rows(s_dim, prog.alpha_dim()).into_owned(),
                }))
            }
            QpOutcome::Infeasible => {
                debug!("MIQP infeasible at x0 = {:?}", x0.as_slice());
                Ok(None)
            }
            QpOutcome::Unbounded => {
                warn!("MIQP unbounded at x0 = {:?}", x0.as_slice());
                Ok(None)
            }
            QpOutcome::Failed(why) => {
                warn!("MIQP solve failed: {why}");
                Ok(None)
            }
        }
    }

    /// Forward pass: solve the MIQP, then the QP with the optimal modes fixed.
    fn differentiable_forward(
        &self,
        prog: &CanonicalProgram,
        x0: &DVector<f64>,
    ) -> Result<(LayerOutput, LayerContext)> {
        let failed = || {
            (
                LayerOutput::nan(self.system.x_dim(), self.horizon),
                LayerContext::failed(x0.clone()),
            )
        };
        let Some(mi) = self.solve_miqp(prog, x0, None)? else {
            return Ok(failed());
        };
        let (qp, constant) = fixed_mode_qp(prog, x0, &mi.alpha);
        let sol = match solve_qp(&qp, &self.settings)? {
            QpOutcome::Solved(sol) => sol,
            outcome => {
                warn!("QP with fixed modes not solved: {outcome:?}");
                return Ok(failed());
            }
        };
        let v_qp = sol.objective + constant;
        if (mi.cost - v_qp).abs() > self.settings.consistency_tol * (1.0 + mi.cost.abs()) {
            return Err(ValueError::Inconsistent {
                miqp: mi.cost,
                qp: v_qp,
            });
        }
        let eval = Evaluation {
            cost: v_qp,
            s: sol.y,
            alpha: mi.alpha,
        };
        let output = self.layer_output(x0, &eval)?;
        let sensitivity = Sensitivity::Duals {
            aeq1: prog.aeq1.clone(),
            ain1: prog.ain1.clone(),
            eq_duals: sol.eq_duals,
            in_duals: sol.in_duals,
            q1_mat: prog.q1_mat.clone(),
            q1: prog.q1.clone(),
        };
        Ok((output, LayerContext::new(x0.clone(), sensitivity)))
    }
}

/// The MIQP over `y = [s; α]` for a fixed `x0`, and the constant part of its objective.
fn mixed_integer_qp(prog: &CanonicalProgram, x0: &DVector<f64>) -> (QpData, f64) {
    let (s_dim, a_dim) = (prog.s_dim(), prog.alpha_dim());
    let n = s_dim + a_dim;
    let mut p = DMatrix::zeros(n, n);
    p.view_mut((0, 0), (s_dim, s_dim)).copy_from(&prog.q2_mat);
    p.view_mut((s_dim, s_dim), (a_dim, a_dim))
        .copy_from(&prog.q3_mat);
    let qp = QpData {
        p,
        q: stack_vec(&prog.q2, &prog.q3),
        a_eq: hstack(&prog.aeq2, &prog.aeq3),
        b_eq: &prog.rhs_eq - &prog.aeq1 * x0,
        a_in: hstack(&prog.ain2, &prog.ain3),
        b_in: &prog.rhs_in - &prog.ain1 * x0,
    };
    (qp, parameter_cost(prog, x0))
}

/// The QP over `s` for fixed `x0` and `α`, and the constant part of its objective.
fn fixed_mode_qp(prog: &CanonicalProgram, x0: &DVector<f64>, alpha: &DVector<f64>) -> (QpData, f64) {
    let qp = QpData {
        p: prog.q2_mat.clone(),
        q: prog.q2.clone(),
        a_eq: prog.aeq2.clone(),
        b_eq: &prog.rhs_eq - &prog.aeq1 * x0 - &prog.aeq3 * alpha,
        a_in: prog.ain2.clone(),
        b_in: &prog.rhs_in - &prog.ain1 * x0 - &prog.ain3 * alpha,
    };
    let constant = parameter_cost(prog, x0)
        + 0.5 * alpha.dot(&(&prog.q3_mat * alpha))
        + prog.q3.dot(alpha);
    (qp, constant)
}

fn parameter_cost(prog: &CanonicalProgram, x0: &DVector<f64>) -> f64 {
    0.5 * x0.dot(&(&prog.q1_mat * x0)) + prog.q1.dot(x0) + prog.c
}

fn hstack(left: &DMatrix<f64>, right: &DMatrix<f64>) -> DMatrix<f64> {
    stack_rows(&left.transpose(), &right.transpose()).transpose()
}

impl<S: HybridLinearSystem> ValueFunction for MiqpValueFunction<S> {
    fn x_dim(&self) -> usize {
        self.system.x_dim()
    }

    fn u_dim(&self) -> usize {
        self.system.u_dim()
    }

    fn horizon(&self) -> usize {
        self.horizon
    }

    fn get_value_function(&self) -> Result<ValueFn<'_>> {
        let prog = self.traj_opt_constraint()?;
        Ok(Box::new(move |x0: &DVector<f64>| self.solve_miqp(&prog, x0, None)))
    }

    fn get_differentiable_value_function(&self) -> Result<DifferentiableValueFn<'_>> {
        let prog = self.traj_opt_constraint()?;
        Ok(Box::new(move |x0: &DVector<f64>| {
            self.differentiable_forward(&prog, x0)
        }))
    }

    fn step_cost(
        &self,
        n: usize,
        x: DVectorView<'_, f64>,
        u: DVectorView<'_, f64>,
        alpha: Option<DVectorView<'_, f64>>,
    ) -> f64 {
        self.cost
            .step_cost(&self.reference, self.horizon, n, x, u, alpha)
    }
}
