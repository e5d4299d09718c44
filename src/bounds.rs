//! Output bounds of neural network layers for given input bounds.
//!
//! Interval arithmetic is implemented generically for [DualNum]s, so that the
//! bounds can be differentiated w.r.t. the layer parameters and input bounds.
//! Linear programming gives tighter bounds but the result carries no derivatives.
use crate::config::SolverSettings;
use crate::error::BoundError;
use crate::qp::{solve_qp, QpData, QpOutcome};
use nalgebra::{DMatrix, DVector, Scalar};
use num_dual::DualNum;

/// A layer whose output bounds can be propagated.
#[derive(Clone, Debug)]
pub enum Layer<D: Scalar = f64> {
    Relu,
    LeakyRelu { negative_slope: f64 },
    Linear {
        weight: DMatrix<D>,
        bias: Option<DVector<D>>,
    },
}

/// How bounds are propagated through a linear layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropagateMethod {
    /// Interval arithmetic.
    IA,
    /// Linear programming.
    LP,
}

/// Bounds of `y = A x + b` for `x_lo ≤ x ≤ x_up` by interval arithmetic.
///
/// # Example
/// ```
/// use hybrid_value_ad::bounds::compute_range_by_ia;
/// use nalgebra::{dmatrix, dvector};
/// let (lo, up) = compute_range_by_ia(
///     &dmatrix![1.0, -1.0],
///     &dvector![0.0],
///     &dvector![0.0, 0.0],
///     &dvector![1.0, 1.0],
/// )
/// .unwrap();
/// assert_eq!((lo[0], up[0]), (-1.0, 1.0));
/// ```
pub fn compute_range_by_ia<D: DualNum<f64> + Copy + Scalar>(
    a: &DMatrix<D>,
    b: &DVector<D>,
    x_lo: &DVector<D>,
    x_up: &DVector<D>,
) -> Result<(DVector<D>, DVector<D>), BoundError> {
    check_linear_dims(a, b.len(), x_lo.len(), x_up.len())?;
    let mut lo = b.clone();
    let mut up = b.clone();
    for j in 0..a.ncols() {
        for i in 0..a.nrows() {
            let w = a[(i, j)];
            if w.re() < 0.0 {
                lo[i] = lo[i] + w * x_up[j];
                up[i] = up[i] + w * x_lo[j];
            } else {
                lo[i] = lo[i] + w * x_lo[j];
                up[i] = up[i] + w * x_up[j];
            }
        }
    }
    Ok((lo, up))
}

/// Bounds of `y = A x + b` for `x_lo ≤ x ≤ x_up` and `C x ≤ d` by solving two
/// linear programs per output.
///
/// Infinite entries of `x_lo` and `x_up` leave the variable unbounded in that
/// direction. Unbounded programs give infinite bounds and infeasible programs
/// give the empty range (`lo = +∞`, `up = −∞`).
pub fn compute_range_by_lp(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
    x_lo: &DVector<f64>,
    x_up: &DVector<f64>,
    extra: Option<(&DMatrix<f64>, &DVector<f64>)>,
) -> Result<(DVector<f64>, DVector<f64>), BoundError> {
    check_linear_dims(a, b.len(), x_lo.len(), x_up.len())?;
    let n = a.ncols();

    let mut rows: Vec<(usize, f64, f64)> = Vec::new();
    for j in 0..n {
        if x_up[j].is_finite() {
            rows.push((j, 1.0, x_up[j]));
        }
        if x_lo[j].is_finite() {
            rows.push((j, -1.0, -x_lo[j]));
        }
    }
    let mut a_in = DMatrix::zeros(rows.len(), n);
    let mut b_in = DVector::zeros(rows.len());
    for (k, &(j, sign, rhs)) in rows.iter().enumerate() {
        a_in[(k, j)] = sign;
        b_in[k] = rhs;
    }
    let mut lp = QpData {
        p: DMatrix::zeros(n, n),
        q: DVector::zeros(n),
        a_eq: DMatrix::zeros(0, n),
        b_eq: DVector::zeros(0),
        a_in,
        b_in,
    };
    if let Some((c, d)) = extra {
        if c.ncols() != n || c.nrows() != d.len() {
            return Err(BoundError::Dimension {
                what: format!(
                    "extra constraints of shape {}x{} and {} for {n} inputs",
                    c.nrows(),
                    c.ncols(),
                    d.len()
                ),
            });
        }
        lp.push_inequalities(c, d);
    }

    let settings = SolverSettings::default();
    let mut lo = DVector::zeros(a.nrows());
    let mut up = DVector::zeros(a.nrows());
    for i in 0..a.nrows() {
        for sign in [1.0, -1.0] {
            // minimize sign·aᵢᵀx, so sign = −1 gives the maximum
            lp.q = a.row(i).transpose() * sign;
            let outcome = solve_qp(&lp, &settings).map_err(|e| BoundError::SolverStatus {
                what: e.to_string(),
            })?;
            let value = match outcome {
                QpOutcome::Solved(sol) => sign * sol.objective + b[i],
                QpOutcome::Unbounded => -sign * f64::INFINITY,
                QpOutcome::Infeasible => sign * f64::INFINITY,
                QpOutcome::Failed(status) => {
                    return Err(BoundError::SolverStatus { what: status });
                }
            };
            if sign > 0.0 {
                lo[i] = value;
            } else {
                up[i] = value;
            }
        }
    }
    Ok((lo, up))
}

/// Given the bounds of the layer input, return the bounds of its output.
///
/// Activations are monotonically increasing, so their bounds are the
/// activation of the input bounds. For [PropagateMethod::LP] the returned
/// bounds are constants without derivative information.
pub fn propagate<D: DualNum<f64> + Copy + Scalar>(
    layer: &Layer<D>,
    input_lo: &DVector<D>,
    input_up: &DVector<D>,
    method: PropagateMethod,
) -> Result<(DVector<D>, DVector<D>), BoundError> {
    match layer {
        Layer::Relu => Ok((input_lo.map(relu), input_up.map(relu))),
        Layer::LeakyRelu { negative_slope } => {
            if *negative_slope < 0.0 {
                return Err(BoundError::UnsupportedLayer {
                    what: format!("leaky ReLU with negative slope {negative_slope}"),
                });
            }
            let leaky = |v: D| {
                if v.re() < 0.0 {
                    v * D::from(*negative_slope)
                } else {
                    v
                }
            };
            Ok((input_lo.map(leaky), input_up.map(leaky)))
        }
        Layer::Linear { weight, bias } => {
            let bias = bias
                .clone()
                .unwrap_or_else(|| DVector::from_element(weight.nrows(), D::from(0.0)));
            match method {
                PropagateMethod::IA => compute_range_by_ia(weight, &bias, input_lo, input_up),
                PropagateMethod::LP => {
                    let re = |m: &DVector<D>| m.map(|v| v.re());
                    let (lo, up) = compute_range_by_lp(
                        &weight.map(|v| v.re()),
                        &re(&bias),
                        &re(input_lo),
                        &re(input_up),
                        None,
                    )?;
                    Ok((lo.map(|v| D::from(v)), up.map(|v| D::from(v))))
                }
            }
        }
    }
}

fn relu<D: DualNum<f64> + Copy>(v: D) -> D {
    if v.re() > 0.0 {
        v
    } else {
        D::from(0.0)
    }
}

fn check_linear_dims<D: Scalar>(
    a: &DMatrix<D>,
    b_len: usize,
    lo_len: usize,
    up_len: usize,
) -> Result<(), BoundError> {
    if a.nrows() != b_len || a.ncols() != lo_len || a.ncols() != up_len {
        return Err(BoundError::Dimension {
            what: format!(
                "layer of shape {}x{} with bias {b_len} and input bounds {lo_len}/{up_len}",
                a.nrows(),
                a.ncols()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector};
    use num_dual::Dual64;

    #[test]
    fn test_ia_linear() {
        let layer = Layer::Linear {
            weight: dmatrix![1.0, -1.0],
            bias: Some(dvector![0.0]),
        };
        let (lo, up) = propagate(
            &layer,
            &dvector![0.0, 0.0],
            &dvector![1.0, 1.0],
            PropagateMethod::IA,
        )
        .unwrap();
        assert_eq!(lo, dvector![-1.0]);
        assert_eq!(up, dvector![1.0]);
    }

    #[test]
    fn test_lp_linear() {
        let layer = Layer::Linear {
            weight: dmatrix![1.0, -1.0; 2.0, 1.0],
            bias: None,
        };
        let (lo, up) = propagate(
            &layer,
            &dvector![0.0, 0.0],
            &dvector![1.0, 1.0],
            PropagateMethod::LP,
        )
        .unwrap();
        assert_abs_diff_eq!(lo, dvector![-1.0, 0.0], epsilon = 1e-6);
        assert_abs_diff_eq!(up, dvector![1.0, 3.0], epsilon = 1e-6);
    }

    #[test]
    fn test_lp_tighter_with_correlation() {
        // x0 = x1 as two inequalities, so x0 − x1 is always zero
        let (a, b) = (dmatrix![1.0, -1.0], dvector![0.0]);
        let (x_lo, x_up) = (dvector![0.0, 0.0], dvector![1.0, 1.0]);
        let c = dmatrix![1.0, -1.0; -1.0, 1.0];
        let d = dvector![0.0, 0.0];
        let (lo, up) = compute_range_by_lp(&a, &b, &x_lo, &x_up, Some((&c, &d))).unwrap();
        assert_abs_diff_eq!(lo[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(up[0], 0.0, epsilon = 1e-6);
        let (lo_ia, up_ia) = compute_range_by_ia(&a, &b, &x_lo, &x_up).unwrap();
        assert!(lo_ia[0] < lo[0] - 0.5);
        assert!(up_ia[0] > up[0] + 0.5);
    }

    #[test]
    fn test_lp_unbounded_and_infeasible() {
        let (a, b) = (dmatrix![1.0, 1.0], dvector![0.5]);
        let x_lo = dvector![0.0, 0.0];
        let x_up = dvector![1.0, f64::INFINITY];
        let (lo, up) = compute_range_by_lp(&a, &b, &x_lo, &x_up, None).unwrap();
        assert_abs_diff_eq!(lo[0], 0.5, epsilon = 1e-6);
        assert_eq!(up[0], f64::INFINITY);

        // x0 ≥ 2 contradicts x0 ≤ 1
        let (c, d) = (dmatrix![-1.0, 0.0], dvector![-2.0]);
        let (lo, up) = compute_range_by_lp(&a, &b, &x_lo, &dvector![1.0, 1.0], Some((&c, &d)))
            .unwrap();
        assert_eq!(lo[0], f64::INFINITY);
        assert_eq!(up[0], f64::NEG_INFINITY);
    }

    #[test]
    fn test_activations() {
        let (lo, up) = (dvector![-2.0, 0.5], dvector![-1.0, 3.0]);
        let (out_lo, out_up) = propagate(&Layer::Relu, &lo, &up, PropagateMethod::IA).unwrap();
        assert_eq!(out_lo, dvector![0.0, 0.5]);
        assert_eq!(out_up, dvector![0.0, 3.0]);

        let leaky = Layer::LeakyRelu {
            negative_slope: 0.1,
        };
        let (out_lo, out_up) = propagate(&leaky, &lo, &up, PropagateMethod::LP).unwrap();
        assert_abs_diff_eq!(out_lo, dvector![-0.2, 0.5], epsilon = 1e-12);
        assert_abs_diff_eq!(out_up, dvector![-0.1, 3.0], epsilon = 1e-12);
    }

    #[test]
    fn test_negative_slope() {
        let layer = Layer::LeakyRelu {
            negative_slope: -0.1,
        };
        let res = propagate(&layer, &dvector![0.0], &dvector![1.0], PropagateMethod::IA);
        assert!(matches!(res, Err(BoundError::UnsupportedLayer { .. })));
    }

    #[test]
    fn test_dimension_mismatch() {
        let res = compute_range_by_ia(
            &dmatrix![1.0, 2.0],
            &dvector![0.0],
            &dvector![0.0],
            &dvector![1.0],
        );
        assert!(matches!(res, Err(BoundError::Dimension { .. })));
    }

    #[test]
    fn test_ia_derivative() {
        // d(up)/d(w01) for y = w00 x0 + w01 x1 with w01 < 0 is x_lo[1]
        let mut w01 = Dual64::from(-2.0);
        w01.eps = 1.0;
        let weight = DMatrix::from_row_slice(1, 2, &[Dual64::from(3.0), w01]);
        let bias = DVector::from_element(1, Dual64::from(1.0));
        let x_lo = DVector::from_vec(vec![Dual64::from(-1.0), Dual64::from(0.5)]);
        let x_up = DVector::from_vec(vec![Dual64::from(2.0), Dual64::from(4.0)]);
        let (lo, up) = compute_range_by_ia(&weight, &bias, &x_lo, &x_up).unwrap();
        assert_abs_diff_eq!(lo[0].re, 1.0 - 3.0 - 8.0);
        assert_abs_diff_eq!(up[0].re, 1.0 + 6.0 - 1.0);
        assert_abs_diff_eq!(lo[0].eps, 4.0);
        assert_abs_diff_eq!(up[0].eps, 0.5);
    }
}
