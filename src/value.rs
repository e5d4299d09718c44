//! The interface shared by the MIQP and NLP value functions.
use crate::error::{check_dim, Result, ValueError};
use crate::layer::{LayerContext, LayerOutput};
use nalgebra::{DMatrix, DMatrixView, DVector, DVectorView};
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::debug;

/// Optimal solution of a value function evaluation.
#[derive(Clone, Debug)]
pub struct Evaluation {
    /// Optimal cost-to-go.
    pub cost: f64,
    /// Stacked decision variables following the initial state.
    pub s: DVector<f64>,
    /// Stacked mode variables.
    pub alpha: DVector<f64>,
}

/// A solution reshaped into one column per step.
#[derive(Clone, Debug, PartialEq)]
pub struct Trajectory {
    x_dim: usize,
    u_dim: usize,
    traj: DMatrix<f64>,
    alpha: DMatrix<f64>,
}

impl Trajectory {
    /// Reshape `[x0; s]` and `α` into `horizon` columns each.
    pub fn from_flat(
        x0: &DVector<f64>,
        s: &DVector<f64>,
        alpha: &DVector<f64>,
        x_dim: usize,
        u_dim: usize,
        horizon: usize,
    ) -> Result<Self> {
        check_dim("x0", x0.len(), x_dim)?;
        let total = x0.len() + s.len();
        if horizon == 0 || total % horizon != 0 || alpha.len() % horizon != 0 {
            return Err(ValueError::Dimension {
                what: format!(
                    "solution of length {total} with {} mode variables for {horizon} steps",
                    alpha.len()
                ),
            });
        }
        let block = total / horizon;
        if block < x_dim + u_dim {
            return Err(ValueError::Dimension {
                what: format!("step of length {block} for {x_dim} states and {u_dim} inputs"),
            });
        }
        let flat: Vec<f64> = x0.iter().chain(s.iter()).copied().collect();
        Ok(Self {
            x_dim,
            u_dim,
            traj: DMatrix::from_column_slice(block, horizon, &flat),
            alpha: DMatrix::from_column_slice(alpha.len() / horizon, horizon, alpha.as_slice()),
        })
    }

    pub fn horizon(&self) -> usize {
        self.traj.ncols()
    }

    pub fn x_traj(&self) -> DMatrixView<'_, f64> {
        self.traj.rows(0, self.x_dim)
    }

    pub fn u_traj(&self) -> DMatrixView<'_, f64> {
        self.traj.rows(self.x_dim, self.u_dim)
    }

    pub fn alpha_traj(&self) -> &DMatrix<f64> {
        &self.alpha
    }

    /// Inverse of [Trajectory::from_flat]: return `(x0, s)`.
    pub fn to_flat(&self) -> (DVector<f64>, DVector<f64>) {
        let flat = self.traj.as_slice();
        (
            DVector::from_column_slice(&flat[..self.x_dim]),
            DVector::from_column_slice(&flat[self.x_dim..]),
        )
    }

    /// States `x[0], …, x[N-2]` stacked into one vector.
    pub fn x_traj_flat(&self) -> DVector<f64> {
        let x = self.x_traj();
        let steps = self.horizon().saturating_sub(1);
        DVector::from_iterator(
            self.x_dim * steps,
            (0..steps).flat_map(|n| x.column(n).iter().copied().collect::<Vec<_>>()),
        )
    }
}

/// Feasible samples of a value function; `u` is empty for value samples.
#[derive(Clone, Debug, Default)]
pub struct SampleGrid {
    pub x: Vec<DVector<f64>>,
    pub u: Vec<DVector<f64>>,
    pub v: Vec<f64>,
}

impl SampleGrid {
    pub fn len(&self) -> usize {
        self.v.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v.is_empty()
    }

    fn push(&mut self, x: DVector<f64>, v: f64) {
        self.x.push(x);
        self.v.push(v);
    }
}

/// Boxed evaluation closure returned by [ValueFunction::get_value_function].
pub type ValueFn<'a> = Box<dyn Fn(&DVector<f64>) -> Result<Option<Evaluation>> + 'a>;

/// Boxed forward pass returned by [ValueFunction::get_differentiable_value_function].
pub type DifferentiableValueFn<'a> =
    Box<dyn Fn(&DVector<f64>) -> Result<(LayerOutput, LayerContext)> + 'a>;

/// Optimal cost-to-go of a finite-horizon trajectory optimization as a
/// function of the initial state.
pub trait ValueFunction {
    fn x_dim(&self) -> usize;

    fn u_dim(&self) -> usize;

    /// Number of steps (knot points) of the trajectory.
    fn horizon(&self) -> usize;

    /// Return a closure that solves the trajectory optimization for a given
    /// initial state. Infeasible or failed solves give `Ok(None)`.
    fn get_value_function(&self) -> Result<ValueFn<'_>>;

    /// Return the forward pass of the differentiable value function.
    fn get_differentiable_value_function(&self) -> Result<DifferentiableValueFn<'_>>;

    /// Reshape a solution into a [Trajectory].
    fn sol_to_traj(&self, x0: &DVector<f64>, eval: &Evaluation) -> Result<Trajectory> {
        Trajectory::from_flat(
            x0,
            &eval.s,
            &eval.alpha,
            self.x_dim(),
            self.u_dim(),
            self.horizon(),
        )
    }

    /// Cost of step `n` of a trajectory.
    fn step_cost(
        &self,
        n: usize,
        x: DVectorView<'_, f64>,
        u: DVectorView<'_, f64>,
        alpha: Option<DVectorView<'_, f64>>,
    ) -> f64;

    fn evaluate(&self, x0: &DVector<f64>) -> Result<Option<Evaluation>> {
        let value = self.get_value_function()?;
        value(x0)
    }

    fn differentiable_evaluate(&self, x0: &DVector<f64>) -> Result<(LayerOutput, LayerContext)> {
        let value = self.get_differentiable_value_function()?;
        value(x0)
    }

    /// Sum of the step costs of a trajectory.
    fn traj_cost(&self, traj: &Trajectory) -> f64 {
        self.cost_to_go(traj).get(0).copied().unwrap_or(0.0)
    }

    /// `cost_to_go[n] = Σ_{k ≥ n} step_cost(k)` for every step.
    fn cost_to_go(&self, traj: &Trajectory) -> DVector<f64> {
        let (x, u, alpha) = (traj.x_traj(), traj.u_traj(), traj.alpha_traj());
        let horizon = traj.horizon();
        let mut ctg = DVector::zeros(horizon);
        let mut acc = 0.0;
        for n in (0..horizon).rev() {
            acc += self.step_cost(n, x.column(n), u.column(n), Some(alpha.column(n)));
            ctg[n] = acc;
        }
        ctg
    }

    /// Outputs of a successful forward pass.
    fn layer_output(&self, x0: &DVector<f64>, eval: &Evaluation) -> Result<LayerOutput> {
        let traj = self.sol_to_traj(x0, eval)?;
        let ctg = self.cost_to_go(&traj);
        let steps = traj.horizon().saturating_sub(1);
        Ok(LayerOutput {
            x_traj_flat: traj.x_traj_flat(),
            cost_to_go: ctg.rows(0, steps).into_owned(),
        })
    }

    /// Evaluate the value function on a full factorial grid and keep the feasible samples.
    fn get_value_sample_grid(
        &self,
        x_lo: &DVector<f64>,
        x_up: &DVector<f64>,
        num_breaks: &[usize],
    ) -> Result<SampleGrid> {
        let points = sample_points(&[(x_lo, x_up, num_breaks)])?;
        let value = self.get_value_function()?;
        let mut grid = SampleGrid::default();
        for (k, x) in points.into_iter().enumerate() {
            if let Some(eval) = value(&x)? {
                grid.push(x, eval.cost);
            }
            debug!("value sample {k}: {} feasible", grid.len());
        }
        Ok(grid)
    }

    /// Like [ValueFunction::get_value_sample_grid], but also samples the
    /// states along the optimal trajectory of every grid point, optionally
    /// with `num_noisy_samples` Gaussian perturbations
    /// `(x_up − x_lo)·noisy_samples_var·N(0, 1)` of each of them. A trajectory
    /// is abandoned at its first infeasible state.
    fn get_rolled_out_sample_grid<R: Rng>(
        &self,
        x_lo: &DVector<f64>,
        x_up: &DVector<f64>,
        num_breaks: &[usize],
        num_noisy_samples: usize,
        noisy_samples_var: f64,
        rng: &mut R,
    ) -> Result<SampleGrid>
    where
        Self: Sized,
    {
        let points = sample_points(&[(x_lo, x_up, num_breaks)])?;
        let value = self.get_value_function()?;
        let range = x_up - x_lo;
        let mut grid = SampleGrid::default();
        for (k, x) in points.into_iter().enumerate() {
            let Some(eval) = value(&x)? else {
                continue;
            };
            let traj = self.sol_to_traj(&x, &eval)?;
            grid.push(x, eval.cost);
            for n in 1..traj.horizon() {
                let xn = traj.x_traj().column(n).into_owned();
                let Some(eval_n) = value(&xn)? else {
                    break;
                };
                grid.push(xn.clone(), eval_n.cost);
                for _ in 0..num_noisy_samples {
                    let noise = DVector::from_fn(xn.len(), |_, _| rng.sample::<f64, _>(StandardNormal));
                    let x_noisy = &xn + range.component_mul(&noise) * noisy_samples_var;
                    if let Some(eval_noisy) = value(&x_noisy)? {
                        grid.push(x_noisy, eval_noisy.cost);
                    }
                }
            }
            debug!("rolled-out sample {k}: {} feasible", grid.len());
        }
        Ok(grid)
    }
}

/// Full factorial grid of `linspace` points over the concatenation of the
/// given boxes; the last dimension varies fastest.
pub(crate) fn sample_points(
    boxes: &[(&DVector<f64>, &DVector<f64>, &[usize])],
) -> Result<Vec<DVector<f64>>> {
    let mut axes: Vec<Vec<f64>> = Vec::new();
    for (lo, up, breaks) in boxes {
        check_dim("upper sample bound", up.len(), lo.len())?;
        check_dim("number of breaks", breaks.len(), lo.len())?;
        for i in 0..lo.len() {
            axes.push(linspace(lo[i], up[i], breaks[i]));
        }
    }
    let mut points: Vec<Vec<f64>> = vec![Vec::new()];
    for axis in &axes {
        points = points
            .into_iter()
            .flat_map(|p| {
                axis.iter().map(move |&v| {
                    let mut p = p.clone();
                    p.push(v);
                    p
                })
            })
            .collect();
    }
    Ok(points.into_iter().map(DVector::from_vec).collect())
}

fn linspace(lo: f64, up: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![lo],
        _ => (0..n)
            .map(|i| lo + (up - lo) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::dvector;

    #[test]
    fn test_trajectory_round_trip() {
        let x0 = dvector![1.0, 2.0];
        // [u0, slack0, x1, u1, slack1]
        let s = dvector![3.0, 9.0, 4.0, 5.0, 6.0, 9.0];
        let alpha = dvector![1.0, 0.0, 0.0, 1.0];
        let traj = Trajectory::from_flat(&x0, &s, &alpha, 2, 1, 2).unwrap();
        assert_eq!(traj.x_traj().column(1).into_owned(), dvector![4.0, 5.0]);
        assert_eq!(traj.u_traj().column(0).into_owned(), dvector![3.0]);
        assert_eq!(traj.alpha_traj().column(1).into_owned(), dvector![0.0, 1.0]);
        assert_eq!(traj.x_traj_flat(), dvector![1.0, 2.0]);
        let (x0_flat, s_flat) = traj.to_flat();
        assert_eq!(x0_flat, x0);
        assert_eq!(s_flat, s);
    }

    #[test]
    fn test_trajectory_dimension() {
        let res = Trajectory::from_flat(&dvector![1.0], &dvector![1.0, 2.0], &DVector::zeros(0), 1, 1, 2);
        assert!(matches!(res, Err(ValueError::Dimension { .. })));
    }

    #[test]
    fn test_sample_points() {
        let (lo, up) = (dvector![0.0, -1.0], dvector![1.0, 1.0]);
        let points = sample_points(&[(&lo, &up, &[2, 3])]).unwrap();
        assert_eq!(points.len(), 6);
        assert_eq!(points[0], dvector![0.0, -1.0]);
        assert_eq!(points[1], dvector![0.0, 0.0]);
        assert_eq!(points[5], dvector![1.0, 1.0]);
    }
}
