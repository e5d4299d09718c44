//! Value functions of nonlinear hybrid trajectory optimization problems.
//!
//! The program is built knot point by knot point. Each knot point carries
//! the variables `[x, u, dt]` and the box constraints and cost of its mode.
//! Consecutive knot points are coupled by [KnotTransition] constraints,
//! modes are restricted by [KnotGuard] functions. The resulting NLP is
//! solved with IPOPT and differentiated by implicit differentiation of its
//! KKT conditions.
//!
//! ```no_run
//! use hybrid_value_ad::nlp::{Knot, KnotTransition, ModeSpec, NlpValueFunction};
//! use hybrid_value_ad::{StateInputBounds, ValueFunction};
//! use nalgebra::{dmatrix, dvector};
//! use num_dual::DualNum;
//!
//! struct Integrator;
//!
//! impl KnotTransition for Integrator {
//!     fn residual<D: DualNum<f64> + Copy>(&self, from: Knot<'_, D>, to: Knot<'_, D>) -> Vec<D> {
//!         vec![to.x[0] - from.x[0] - from.dt * from.u[0]]
//!     }
//! }
//!
//! let bounds = StateInputBounds::new(dvector![-1.0], dvector![1.0], dvector![-1.0], dvector![1.0])?;
//! let mut mode = ModeSpec::new(bounds);
//! mode.q = Some(dmatrix![1.0]);
//! mode.r = Some(dmatrix![1.0]);
//! let mut vf = NlpValueFunction::new(vec![mode], 0.1, 0.1, 0)?;
//! vf.add_mode(4, Integrator)?;
//! vf.add_init_state_constraint()?;
//! let eval = vf.evaluate(&dvector![0.5])?.expect("feasible");
//! println!("V(0.5) = {}", eval.cost);
//! # Ok::<(), hybrid_value_ad::ValueError>(())
//! ```
mod functions;
mod knots;
mod problem;
mod sensitivity;

pub use functions::{Knot, KnotGuard, KnotTransition};
pub use knots::{KnotPoint, ModeSpec};

use crate::config::SolverSettings;
use crate::error::{check_dim, check_shape, Result, ValueError};
use crate::layer::{LayerContext, LayerOutput, Sensitivity};
use crate::value::{DifferentiableValueFn, Evaluation, ValueFn, ValueFunction};
use functions::{GuardFn, LocalFunction, TransitionFn};
use ipopt::{Ipopt, SolveStatus};
use knots::KnotProgram;
use nalgebra::{DMatrix, DVector, DVectorView};
use problem::KnotProblem;
use sensitivity::initial_state_gradient;
use std::rc::Rc;
use tracing::debug;

/// Primal solution and constraint multipliers of one solve.
struct NlpSolution {
    eval: Evaluation,
    z: Vec<f64>,
    lambda: Vec<f64>,
}

/// Value function of a trajectory optimization over an append-only
/// sequence of knot points.
pub struct NlpValueFunction {
    program: KnotProgram,
    init_state_constraint: bool,
    settings: SolverSettings,
}

impl NlpValueFunction {
    /// Create a value function with a single knot point in `init_mode`.
    ///
    /// All modes need the same state and input dimensions; the time step of
    /// every knot point is bounded by `[dt_lo, dt_up]`.
    pub fn new(modes: Vec<ModeSpec>, dt_lo: f64, dt_up: f64, init_mode: usize) -> Result<Self> {
        let mut program = KnotProgram::new(modes, dt_lo, dt_up)?;
        program.add_knot_point(init_mode)?;
        Ok(Self {
            program,
            init_state_constraint: false,
            settings: SolverSettings::default(),
        })
    }

    pub fn with_settings(mut self, settings: SolverSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn knots(&self) -> &[KnotPoint] {
        &self.program.knots
    }

    /// Append an unconstrained knot point and return its index.
    pub fn add_knot_point(&mut self, mode: usize) -> Result<usize> {
        self.program.add_knot_point(mode)
    }

    /// Append `n` knot points in the mode of the last knot point, each
    /// coupled to its predecessor by `dynamics`.
    pub fn add_mode<T: KnotTransition + 'static>(&mut self, n: usize, dynamics: T) -> Result<()> {
        let dynamics = self.transition_fn(dynamics)?;
        self.extend_mode(n, dynamics, None)
    }

    /// Like [NlpValueFunction::add_mode], with `guard ≥ 0` enforced at every
    /// new knot point.
    pub fn add_mode_with_guard<T, G>(&mut self, n: usize, dynamics: T, guard: G) -> Result<()>
    where
        T: KnotTransition + 'static,
        G: KnotGuard + 'static,
    {
        let dynamics = self.transition_fn(dynamics)?;
        let guard = self.guard_fn(guard);
        self.extend_mode(n, dynamics, Some(guard))
    }

    /// Append one knot point in `new_mode`, coupled to the last knot point by
    /// `transition`. The last knot point must lie on the guard surface
    /// `guard = 0`.
    pub fn add_transition<T, G>(&mut self, transition: T, guard: G, new_mode: usize) -> Result<()>
    where
        T: KnotTransition + 'static,
        G: KnotGuard + 'static,
    {
        let transition = self.transition_fn(transition)?;
        let guard = self.guard_fn(guard);
        let from = self.program.knots.len() - 1;
        self.program.add_knot_point(new_mode)?;
        self.program.add_constraint(from, transition, true)?;
        self.program.add_constraint(from, guard, true)
    }

    /// Make the state of the first knot point the parameter of the value function.
    pub fn add_init_state_constraint(&mut self) -> Result<()> {
        if self.init_state_constraint {
            return Err(ValueError::Setup {
                what: "initial state constraint added twice".into(),
            });
        }
        self.init_state_constraint = true;
        Ok(())
    }

    /// Add `(x − x_desired)ᵀ·qt·(x − x_desired)` for the state of the last
    /// knot point, with `x_desired` of its mode.
    pub fn add_terminal_state_cost(&mut self, qt: DMatrix<f64>) -> Result<()> {
        if self.program.terminal_cost.is_some() {
            return Err(ValueError::Setup {
                what: "terminal state cost added twice".into(),
            });
        }
        let x_dim = self.program.x_dim;
        check_shape("Qt", qt.shape(), (x_dim, x_dim))?;
        self.program.terminal_cost = Some(qt);
        Ok(())
    }

    fn transition_fn<T: KnotTransition + 'static>(&self, f: T) -> Result<Rc<dyn LocalFunction>> {
        let f = TransitionFn {
            f,
            x_dim: self.program.x_dim,
            u_dim: self.program.u_dim,
        };
        let rows = f.eval(&vec![0.0; 2 * self.program.block()]).len();
        check_dim("transition residual", rows, self.program.x_dim)?;
        Ok(Rc::new(f))
    }

    fn guard_fn<G: KnotGuard + 'static>(&self, f: G) -> Rc<dyn LocalFunction> {
        Rc::new(GuardFn {
            f,
            x_dim: self.program.x_dim,
            u_dim: self.program.u_dim,
        })
    }

    fn extend_mode(
        &mut self,
        n: usize,
        dynamics: Rc<dyn LocalFunction>,
        guard: Option<Rc<dyn LocalFunction>>,
    ) -> Result<()> {
        for _ in 0..n {
            let from = self.program.knots.len() - 1;
            let mode = self.program.knots[from].mode;
            let to = self.program.add_knot_point(mode)?;
            self.program.add_constraint(from, dynamics.clone(), true)?;
            if let Some(guard) = &guard {
                self.program.add_constraint(to, guard.clone(), false)?;
            }
        }
        Ok(())
    }

    fn check_ready(&self) -> Result<()> {
        if self.init_state_constraint {
            Ok(())
        } else {
            Err(ValueError::Setup {
                what: "the initial state constraint has not been added".into(),
            })
        }
    }

    /// Solve the NLP from a zero initial guess with the initial state pinned to `x0`.
    fn solve(&self, x0: &DVector<f64>) -> Result<Option<NlpSolution>> {
        check_dim("x0", x0.len(), self.program.x_dim)?;
        if !self.program.admissible_initial_state(x0) {
            debug!("initial state outside of the state box of the first knot point");
            return Ok(None);
        }
        let problem = KnotProblem::new(self.program.clone(), x0.clone());
        let mut ipopt = Ipopt::new(problem).map_err(|e| ValueError::SolverStatus {
            what: format!("IPOPT could not be created: {e:?}"),
        })?;
        ipopt.set_option("print_level", self.settings.nlp_print_level);
        ipopt.set_option("tol", self.settings.nlp_tol);
        ipopt.set_option("max_iter", self.settings.nlp_max_iter);
        ipopt.set_option("sb", "yes");
        let res = ipopt.solve();
        match res.status {
            SolveStatus::SolveSucceeded | SolveStatus::SolvedToAcceptableLevel => {}
            SolveStatus::InfeasibleProblemDetected
            | SolveStatus::SearchDirectionBecomesTooSmall
            | SolveStatus::DivergingIterates
            | SolveStatus::MaximumIterationsExceeded
            | SolveStatus::RestorationFailed
            | SolveStatus::ErrorInStepComputation
            | SolveStatus::MaximumCpuTimeExceeded => {
                debug!("NLP not solved: {:?}", res.status);
                return Ok(None);
            }
            _ => {
                return Err(ValueError::SolverStatus {
                    what: format!("{:?}", res.status),
                })
            }
        }
        let z = res.solver_data.solution.primal_variables.to_vec();
        let lambda = res.solver_data.solution.constraint_multipliers.to_vec();
        let (s, alpha) = self.program.split_solution(&z);
        debug!("NLP solved with cost {}", res.objective_value);
        Ok(Some(NlpSolution {
            eval: Evaluation {
                cost: res.objective_value,
                s,
                alpha,
            },
            z,
            lambda,
        }))
    }

    fn differentiable_forward(&self, x0: &DVector<f64>) -> Result<(LayerOutput, LayerContext)> {
        let Some(sol) = self.solve(x0)? else {
            return Ok((
                LayerOutput::nan(self.program.x_dim, self.horizon()),
                LayerContext::failed(x0.clone()),
            ));
        };
        let output = self.layer_output(x0, &sol.eval)?;
        let dfdp = initial_state_gradient(&self.program, &sol.z, &sol.lambda, &self.settings)?;
        Ok((
            output,
            LayerContext::new(x0.clone(), Sensitivity::Implicit { dfdp }),
        ))
    }
}

impl ValueFunction for NlpValueFunction {
    fn x_dim(&self) -> usize {
        self.program.x_dim
    }

    fn u_dim(&self) -> usize {
        self.program.u_dim
    }

    fn horizon(&self) -> usize {
        self.program.knots.len()
    }

    fn get_value_function(&self) -> Result<ValueFn<'_>> {
        self.check_ready()?;
        Ok(Box::new(move |x0: &DVector<f64>| {
            Ok(self.solve(x0)?.map(|sol| sol.eval))
        }))
    }

    fn get_differentiable_value_function(&self) -> Result<DifferentiableValueFn<'_>> {
        self.check_ready()?;
        Ok(Box::new(move |x0: &DVector<f64>| self.differentiable_forward(x0)))
    }

    /// Cost of knot point `n`; the mode is taken from the knot sequence.
    fn step_cost(
        &self,
        n: usize,
        x: DVectorView<'_, f64>,
        u: DVectorView<'_, f64>,
        _alpha: Option<DVectorView<'_, f64>>,
    ) -> f64 {
        self.program.knot_cost(n, x, u)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hybrid::StateInputBounds;
    use approx::assert_relative_eq;
    use nalgebra::{dmatrix, dvector};
    use num_dual::DualNum;

    /// Forward Euler step of `ẋ = u`.
    struct Integrator;

    impl KnotTransition for Integrator {
        fn residual<D: DualNum<f64> + Copy>(&self, from: Knot<'_, D>, to: Knot<'_, D>) -> Vec<D> {
            vec![to.x[0] - from.x[0] - from.dt * from.u[0]]
        }
    }

    /// Forward Euler step of `ẋ = u − x³`.
    struct Cubic;

    impl KnotTransition for Cubic {
        fn residual<D: DualNum<f64> + Copy>(&self, from: Knot<'_, D>, to: Knot<'_, D>) -> Vec<D> {
            let x = from.x[0];
            vec![to.x[0] - x - from.dt * (from.u[0] - x * x * x)]
        }
    }

    /// `x − level`
    struct Level(f64);

    impl KnotGuard for Level {
        fn value<D: DualNum<f64> + Copy>(&self, at: Knot<'_, D>) -> D {
            at.x[0] - self.0
        }
    }

    fn unit_mode(bound: f64) -> ModeSpec {
        let bounds = StateInputBounds::new(
            dvector![-bound],
            dvector![bound],
            dvector![-10.0],
            dvector![10.0],
        )
        .unwrap();
        let mut mode = ModeSpec::new(bounds);
        mode.q = Some(dmatrix![1.0]);
        mode.r = Some(dmatrix![1.0]);
        mode
    }

    fn integrator_value_function(bound: f64) -> NlpValueFunction {
        let mut vf = NlpValueFunction::new(vec![unit_mode(bound)], 0.1, 0.1, 0).unwrap();
        vf.add_mode(2, Integrator).unwrap();
        vf.add_init_state_constraint().unwrap();
        vf
    }

    #[test]
    fn test_integrator_value() {
        let vf = integrator_value_function(10.0);
        assert_eq!(vf.horizon(), 3);
        // V(x) = p·x² by dynamic programming, the last input is zero
        let a2 = 0.01;
        let p1 = 1.0 + 1.0 / (1.0 + a2);
        let p0 = 1.0 + p1 / (1.0 + a2 * p1);
        let x0 = dvector![0.5];
        let eval = vf.evaluate(&x0).unwrap().unwrap();
        assert_relative_eq!(eval.cost, p0 * 0.25, max_relative = 1e-6);
        assert_eq!(eval.s.len(), 5);
        assert_eq!(eval.alpha, dvector![0.0, 0.0, 0.0]);

        let traj = vf.sol_to_traj(&x0, &eval).unwrap();
        assert_relative_eq!(traj.u_traj()[(0, 2)], 0.0, epsilon = 1e-6);
        assert_relative_eq!(vf.traj_cost(&traj), eval.cost, max_relative = 1e-6);
        let (x0_flat, s_flat) = traj.to_flat();
        assert_eq!(x0_flat, x0);
        assert_eq!(s_flat, eval.s);

        let (output, ctx) = vf.differentiable_evaluate(&x0).unwrap();
        assert_eq!(output.x_traj_flat.len(), 2);
        assert_eq!(output.cost_to_go.len(), 2);
        assert_relative_eq!(output.cost_to_go[0], eval.cost, max_relative = 1e-6);
        assert_relative_eq!(ctx.gradient()[0], 2.0 * p0 * 0.5, max_relative = 1e-5);
    }

    #[test]
    fn test_gradient_finite_differences() {
        let mut vf = NlpValueFunction::new(vec![unit_mode(10.0)], 0.1, 0.1, 0).unwrap();
        vf.add_mode(3, Cubic).unwrap();
        vf.add_terminal_state_cost(dmatrix![5.0]).unwrap();
        vf.add_init_state_constraint().unwrap();
        let v = vf.get_value_function().unwrap();
        let dv = vf.get_differentiable_value_function().unwrap();

        for x in [0.7, -1.2] {
            let (_, ctx) = dv(&dvector![x]).unwrap();
            let h = 1e-4;
            let vp = v(&dvector![x + h]).unwrap().unwrap().cost;
            let vm = v(&dvector![x - h]).unwrap().unwrap().cost;
            assert_relative_eq!(ctx.gradient()[0], (vp - vm) / (2.0 * h), epsilon = 1e-4);
            let grad = ctx.backward(&DVector::zeros(3), &dvector![2.0, 0.0, 0.0]);
            assert_relative_eq!(grad[0], 2.0 * ctx.gradient()[0]);
        }
    }

    #[test]
    fn test_infeasible() {
        let vf = integrator_value_function(1.0);
        let x0 = dvector![2.0];
        assert!(!vf.program.admissible_initial_state(&x0));
        let (lo, up) = vf.program.variable_bounds(Some(&x0));
        assert!(lo[0] > up[0]);
        assert!(vf.program.admissible_initial_state(&dvector![1.0]));
        assert!(vf.evaluate(&x0).unwrap().is_none());
        let (output, ctx) = vf.differentiable_evaluate(&x0).unwrap();
        assert!(!ctx.is_success());
        assert!(output.x_traj_flat.iter().all(|x| x.is_nan()));
        assert!(output.cost_to_go.iter().all(|c| c.is_nan()));
        assert!(ctx.gradient()[0].is_nan());
    }

    #[test]
    fn test_transition() {
        let mut vf = NlpValueFunction::new(vec![unit_mode(10.0), unit_mode(10.0)], 0.1, 0.1, 0)
            .unwrap();
        vf.add_mode(1, Integrator).unwrap();
        vf.add_transition(Integrator, Level(0.2), 1).unwrap();
        vf.add_mode_with_guard(1, Integrator, Level(0.0)).unwrap();
        vf.add_init_state_constraint().unwrap();
        assert_eq!(
            vf.knots().iter().map(|k| k.mode).collect::<Vec<_>>(),
            vec![0, 0, 1, 1]
        );

        let x0 = dvector![0.5];
        let eval = vf.evaluate(&x0).unwrap().unwrap();
        let traj = vf.sol_to_traj(&x0, &eval).unwrap();
        assert_eq!(traj.alpha_traj(), &dmatrix![0.0, 0.0, 1.0, 1.0]);
        assert_relative_eq!(traj.x_traj()[(0, 1)], 0.2, epsilon = 1e-6);
        assert!(traj.x_traj()[(0, 3)] >= -1e-6);
        assert_relative_eq!(vf.traj_cost(&traj), eval.cost, max_relative = 1e-6);
    }

    #[test]
    fn test_guarded_transition_gradient() {
        let mut target = unit_mode(10.0);
        target.q = Some(dmatrix![100.0]);
        target.x_desired = Some(dvector![-1.0]);
        let mut vf = NlpValueFunction::new(vec![unit_mode(10.0), target], 0.1, 0.1, 0).unwrap();
        vf.add_mode(1, Integrator).unwrap();
        vf.add_transition(Integrator, Level(0.2), 1).unwrap();
        vf.add_mode_with_guard(1, Integrator, Level(0.0)).unwrap();
        vf.add_init_state_constraint().unwrap();
        let v = vf.get_value_function().unwrap();
        let dv = vf.get_differentiable_value_function().unwrap();

        for x in [0.5, -0.3] {
            let x0 = dvector![x];
            let eval = v(&x0).unwrap().unwrap();
            let traj = vf.sol_to_traj(&x0, &eval).unwrap();
            // the target pulls the last state onto the guard surface
            assert_relative_eq!(traj.x_traj()[(0, 3)], 0.0, epsilon = 1e-6);

            // only the first step depends on x0: x0² + (10·(0.2 − x0))²
            let (_, ctx) = dv(&x0).unwrap();
            assert!(ctx.is_success());
            assert_relative_eq!(ctx.gradient()[0], 2.0 * x + 200.0 * (x - 0.2), epsilon = 1e-4);
            let h = 1e-4;
            let vp = v(&dvector![x + h]).unwrap().unwrap().cost;
            let vm = v(&dvector![x - h]).unwrap().unwrap().cost;
            assert_relative_eq!(ctx.gradient()[0], (vp - vm) / (2.0 * h), epsilon = 1e-3);
        }
    }

    #[test]
    fn test_setup_errors() {
        let mut vf = NlpValueFunction::new(vec![unit_mode(1.0)], 0.1, 0.1, 0).unwrap();
        vf.add_mode(2, Integrator).unwrap();
        assert!(matches!(
            vf.get_value_function(),
            Err(ValueError::Setup { .. })
        ));
        assert!(vf.add_knot_point(3).is_err());
        assert!(vf.add_terminal_state_cost(dmatrix![1.0, 0.0]).is_err());
        vf.add_terminal_state_cost(dmatrix![1.0]).unwrap();
        assert!(vf.add_terminal_state_cost(dmatrix![1.0]).is_err());
        vf.add_init_state_constraint().unwrap();
        assert!(vf.add_init_state_constraint().is_err());
        assert!(matches!(
            vf.evaluate(&dvector![0.0, 0.0]),
            Err(ValueError::Dimension { .. })
        ));
        assert!(NlpValueFunction::new(vec![unit_mode(1.0)], 0.1, 0.1, 1).is_err());
    }
}
