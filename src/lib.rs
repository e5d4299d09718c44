//! # Hybrid-Value-AD - Differentiable value functions of hybrid trajectory optimization
//! This crate evaluates the optimal cost-to-go `V(x0)` of finite-horizon trajectory
//! optimization problems for hybrid systems, together with its gradient w.r.t. the
//! initial state, so that it can be used as a layer in a larger gradient computation.
//!
//! Two formulations are provided:
//! - [MiqpValueFunction]: piecewise-affine systems are encoded with binary mode
//!   variables into a mixed-integer quadratic program (MIQP) that is solved by
//!   branch-and-bound over [Clarabel](https://clarabel.org) QP relaxations. The
//!   gradient follows from the multipliers of the QP with the optimal modes fixed.
//! - [NlpValueFunction](nlp::NlpValueFunction): the trajectory is built knot point
//!   by knot point with nonlinear transition and guard functions, solved by
//!   [IPOPT](https://coin-or.github.io/Ipopt/index.html) and differentiated through
//!   its KKT conditions. Derivatives of the user functions are obtained by automatic
//!   differentiation using the [num-dual] crate, so the functions only have to be
//!   implemented generically for values implementing the [DualNum](num_dual::DualNum)
//!   trait.
//!
//! Both implement the [ValueFunction] interface. Infeasible initial states are not
//! errors: evaluations return `Ok(None)` and differentiable evaluations return NaN
//! outputs and gradients.
//!
//! ## Example: a two-mode piecewise-affine system
//! The system `x⁺ = x + u` for `x ≤ 0` and `x⁺ = 0.5·x + u` for `x ≥ 0` is
//! controlled over three steps with unit stage and terminal costs.
//! ```
//! use hybrid_value_ad::{
//!     AffineMode, MiqpValueFunction, PiecewiseAffineSystem, QuadraticCost, StateInputBounds,
//!     ValueFunction,
//! };
//! use nalgebra::{dmatrix, dvector, DVector};
//! use approx::assert_relative_eq;
//!
//! let mut system = PiecewiseAffineSystem::new(1, 1);
//! system.add_mode(AffineMode {
//!     a: dmatrix![1.0],
//!     b: dmatrix![1.0],
//!     c: dvector![0.0],
//!     p: dmatrix![1.0, 0.0],
//!     q: dvector![0.0],
//! })?;
//! system.add_mode(AffineMode {
//!     a: dmatrix![0.5],
//!     b: dmatrix![1.0],
//!     c: dvector![0.0],
//!     p: dmatrix![-1.0, 0.0],
//!     q: dvector![0.0],
//! })?;
//!
//! let bounds = StateInputBounds::new(dvector![-1.0], dvector![1.0], dvector![-1.0], dvector![1.0])?;
//! let mut vf = MiqpValueFunction::new(system, 3, bounds);
//! let unit = QuadraticCost {
//!     q_mat: Some(dmatrix![1.0]),
//!     r_mat: Some(dmatrix![1.0]),
//!     ..Default::default()
//! };
//! vf.set_cost(unit.clone());
//! vf.set_terminal_cost(unit);
//!
//! let x0 = dvector![0.5];
//! let eval = vf.evaluate(&x0)?.expect("feasible initial state");
//! let coeff = 0.5 + 0.25 * 0.28125 / 1.0625;
//! assert_relative_eq!(eval.cost, coeff * 0.25, epsilon = 1e-6);
//!
//! let (output, ctx) = vf.differentiable_evaluate(&x0)?;
//! assert_relative_eq!(output.cost_to_go[0], eval.cost, epsilon = 1e-6);
//! let grad = ctx.backward(&DVector::zeros(2), &dvector![1.0, 0.0]);
//! assert_relative_eq!(grad[0], 2.0 * coeff * 0.5, epsilon = 1e-4);
//! # Ok::<(), hybrid_value_ad::ValueError>(())
//! ```
pub mod bounds;
mod config;
mod cost;
mod error;
mod hybrid;
mod layer;
mod miqp;
pub mod nlp;
mod program;
mod qp;
mod value;

pub use config::SolverSettings;
pub use cost::{CostSpec, QuadraticCost, ReferenceTrajectory};
pub use error::{BoundError, Result, ValueError};
pub use hybrid::{
    AffineMode, HybridLinearSystem, MixedIntegerEncoding, PiecewiseAffineSystem,
    StateInputBounds,
};
pub use layer::{LayerContext, LayerOutput, Sensitivity};
pub use miqp::{MiqpValueFunction, QFn};
pub use program::{BoundarySpec, CanonicalProgram, TrajectoryProgramBuilder};
pub use qp::{branch_and_bound, solve_qp, MixedIntegerSolution, QpData, QpOutcome, QpSolution};
pub use value::{
    DifferentiableValueFn, Evaluation, SampleGrid, Trajectory, ValueFn, ValueFunction,
};

pub mod ipopt {
    //! Re-export of all functionalities in [ipopt-rs].
    pub use ipopt::*;
}
