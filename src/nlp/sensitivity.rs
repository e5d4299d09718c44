//! Sensitivity of a knot program solution w.r.t. the initial state.
use super::knots::KnotProgram;
use crate::config::SolverSettings;
use crate::error::{Result, ValueError};
use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

/// Gradient of the optimal cost w.r.t. the initial state by implicit
/// differentiation of the KKT conditions at the solution `z` with
/// constraint multipliers `lambda`.
///
/// The active set consists of all equality constraints, the guard
/// inequalities with `g ≤ active_bound_tol`, the variable bounds within
/// `active_bound_tol` of the solution and the initial state, which is the
/// parameter. Solving
/// ```text
/// [H  Jᵀ] [dz/dx0]   [0    ]
/// [J  0 ] [dν/dx0] = [dg/dx0]
/// ```
/// gives `dz/dx0`, and the gradient is `∇f(z)ᵀ·dz/dx0`.
pub(crate) fn initial_state_gradient(
    program: &KnotProgram,
    z: &[f64],
    lambda: &[f64],
    settings: &SolverSettings,
) -> Result<DVector<f64>> {
    let n = program.num_variables();
    let x_dim = program.x_dim;
    let tol = settings.active_bound_tol;

    let jac = program.constraint_jacobian(z);
    let g = program.constraint_values(z);
    let (g_lo, g_up) = program.constraint_bounds();
    let mut rows: Vec<DVector<f64>> = Vec::new();
    let mut rhs_rows: Vec<DVector<f64>> = Vec::new();
    for i in 0..g.len() {
        if g_lo[i] == g_up[i] || (g[i] - g_lo[i]).abs() <= tol {
            rows.push(jac.row(i).transpose());
            rhs_rows.push(DVector::zeros(x_dim));
        }
    }
    let num_constraints = rows.len();

    let (z_lo, z_up) = program.variable_bounds(None);
    for i in 0..x_dim {
        rows.push(unit(n, i, 1.0));
        rhs_rows.push(unit(x_dim, i, 1.0));
    }
    for j in x_dim..n {
        if (z[j] - z_up[j]).abs() <= tol {
            rows.push(unit(n, j, 1.0));
        } else if (z[j] - z_lo[j]).abs() <= tol {
            rows.push(unit(n, j, -1.0));
        } else {
            continue;
        }
        rhs_rows.push(DVector::zeros(x_dim));
    }
    debug!(
        "KKT system with {n} variables, {num_constraints} active constraints and {} active bounds",
        rows.len() - num_constraints
    );

    let m = rows.len();
    let mut kkt = DMatrix::zeros(n + m, n + m);
    kkt.view_mut((0, 0), (n, n))
        .copy_from(&program.lagrangian_hessian(z, 1.0, lambda));
    let mut rhs = DMatrix::zeros(n + m, x_dim);
    for (k, (row, r)) in rows.iter().zip(&rhs_rows).enumerate() {
        kkt.view_mut((n + k, 0), (1, n)).copy_from(&row.transpose());
        kkt.view_mut((0, n + k), (n, 1)).copy_from(row);
        rhs.view_mut((n + k, 0), (1, x_dim)).copy_from(&r.transpose());
    }
    for i in 0..n + m {
        kkt[(i, i)] += settings.kkt_regularization;
    }

    let Some(sol) = kkt.lu().solve(&rhs) else {
        warn!("singular KKT matrix of dimension {}", n + m);
        return Err(ValueError::Numeric {
            what: format!("singular KKT matrix of dimension {}", n + m),
        });
    };
    let dzdp = sol.rows(0, n);
    Ok(dzdp.tr_mul(&program.cost_gradient(z)))
}

fn unit(n: usize, i: usize, value: f64) -> DVector<f64> {
    let mut e = DVector::zeros(n);
    e[i] = value;
    e
}
