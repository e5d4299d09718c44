//! Convex QP solves with dual recovery and a branch-and-bound MIQP solver.
//!
//! All programs are stated as
//! ```text
//! min ½ yᵀ P y + qᵀ y
//! s.t. A_eq y  = b_eq
//!      A_in y ≤ b_in
//! ```
//! and handed to Clarabel with the equality rows in a zero cone followed by the
//! inequality rows in the nonnegative cone. With Clarabel's sign convention the
//! returned duals `z` satisfy `P y + q + A_eqᵀ z_eq + A_inᵀ z_in = 0`, i.e. they
//! are the multipliers of the Lagrangian `f(y) + z_eqᵀ(A_eq y − b_eq) + z_inᵀ(A_in y − b_in)`.
use crate::config::SolverSettings;
use crate::error::{Result, ValueError};
use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus,
    SupportedConeT::{NonnegativeConeT, ZeroConeT},
};
use nalgebra::{DMatrix, DVector};
use std::ops::Range;
use tracing::{debug, warn};

/// Data of a convex quadratic program.
#[derive(Clone, Debug)]
pub struct QpData {
    pub p: DMatrix<f64>,
    pub q: DVector<f64>,
    pub a_eq: DMatrix<f64>,
    pub b_eq: DVector<f64>,
    pub a_in: DMatrix<f64>,
    pub b_in: DVector<f64>,
}

/// Primal and dual solution of a QP.
#[derive(Clone, Debug)]
pub struct QpSolution {
    pub y: DVector<f64>,
    pub objective: f64,
    /// Multipliers of the equality rows (zero for rows without variables).
    pub eq_duals: DVector<f64>,
    /// Multipliers of the inequality rows (zero for rows without variables).
    pub in_duals: DVector<f64>,
}

/// Termination of a QP or MIQP solve.
#[derive(Clone, Debug)]
pub enum QpOutcome<S> {
    Solved(S),
    Infeasible,
    Unbounded,
    /// The solver stopped without a certificate (iteration limit, numerical trouble).
    Failed(String),
}

impl QpData {
    pub fn num_variables(&self) -> usize {
        self.q.len()
    }

    /// Append the rows `a y = b` to the equality constraints.
    pub fn push_equalities(&mut self, a: &DMatrix<f64>, b: &DVector<f64>) {
        self.a_eq = stack_rows(&self.a_eq, a);
        self.b_eq = stack_vec(&self.b_eq, b);
    }

    /// Append the rows `a y ≤ b` to the inequality constraints.
    pub fn push_inequalities(&mut self, a: &DMatrix<f64>, b: &DVector<f64>) {
        self.a_in = stack_rows(&self.a_in, a);
        self.b_in = stack_vec(&self.b_in, b);
    }
}

/// Solve a convex QP with Clarabel.
///
/// Rows without any nonzero coefficient only involve parameters that were
/// already moved to the right-hand side. They are checked against
/// `feasibility_tol` and removed; their multipliers are reported as zero.
pub fn solve_qp(qp: &QpData, settings: &SolverSettings) -> Result<QpOutcome<QpSolution>> {
    let n = qp.num_variables();
    let tol = settings.feasibility_tol;

    let eq_rows = nonzero_rows(&qp.a_eq);
    for i in 0..qp.a_eq.nrows() {
        if !eq_rows.contains(&i) && qp.b_eq[i].abs() > tol {
            debug!("equality row {i} without variables is violated by {}", qp.b_eq[i]);
            return Ok(QpOutcome::Infeasible);
        }
    }
    let in_rows = nonzero_rows(&qp.a_in);
    for i in 0..qp.a_in.nrows() {
        if !in_rows.contains(&i) && qp.b_in[i] < -tol {
            debug!("inequality row {i} without variables is violated by {}", -qp.b_in[i]);
            return Ok(QpOutcome::Infeasible);
        }
    }

    let n_eq = eq_rows.len();
    let n_in = in_rows.len();
    let mut a_all = DMatrix::zeros(n_eq + n_in, n);
    let mut b_all = Vec::with_capacity(n_eq + n_in);
    for (k, &i) in eq_rows.iter().enumerate() {
        a_all.row_mut(k).copy_from(&qp.a_eq.row(i));
        b_all.push(qp.b_eq[i]);
    }
    for (k, &i) in in_rows.iter().enumerate() {
        a_all.row_mut(n_eq + k).copy_from(&qp.a_in.row(i));
        b_all.push(qp.b_in[i]);
    }

    let mut cones = Vec::new();
    if n_eq > 0 {
        cones.push(ZeroConeT(n_eq));
    }
    if n_in > 0 {
        cones.push(NonnegativeConeT(n_in));
    }

    let clarabel_settings = DefaultSettingsBuilder::default()
        .verbose(false)
        .max_iter(settings.qp_max_iter)
        .tol_gap_abs(settings.qp_tol)
        .tol_gap_rel(settings.qp_tol)
        .tol_feas(settings.qp_tol)
        .build()
        .map_err(|e| ValueError::Setup {
            what: format!("invalid QP solver settings: {e:?}"),
        })?;

    let p_csc = dmatrix_to_csc_upper_tri(&qp.p);
    let a_csc = dmatrix_to_csc(&a_all);
    let q_slice: Vec<f64> = qp.q.iter().copied().collect();

    let mut solver = DefaultSolver::new(&p_csc, &q_slice, &a_csc, &b_all, &cones, clarabel_settings)
        .map_err(|e| ValueError::Setup {
            what: format!("QP solver rejected the problem data: {e:?}"),
        })?;
    solver.solve();
    let sol = &solver.solution;

    match sol.status {
        SolverStatus::Solved | SolverStatus::AlmostSolved => {
            let mut eq_duals = DVector::zeros(qp.a_eq.nrows());
            for (k, &i) in eq_rows.iter().enumerate() {
                eq_duals[i] = sol.z[k];
            }
            let mut in_duals = DVector::zeros(qp.a_in.nrows());
            for (k, &i) in in_rows.iter().enumerate() {
                in_duals[i] = sol.z[n_eq + k];
            }
            Ok(QpOutcome::Solved(QpSolution {
                y: DVector::from_column_slice(&sol.x),
                objective: sol.obj_val,
                eq_duals,
                in_duals,
            }))
        }
        SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
            Ok(QpOutcome::Infeasible)
        }
        SolverStatus::DualInfeasible | SolverStatus::AlmostDualInfeasible => {
            Ok(QpOutcome::Unbounded)
        }
        SolverStatus::MaxIterations
        | SolverStatus::MaxTime
        | SolverStatus::NumericalError
        | SolverStatus::InsufficientProgress => Ok(QpOutcome::Failed(format!("{:?}", sol.status))),
        status => Err(ValueError::SolverStatus {
            what: format!("{status:?}"),
        }),
    }
}

/// Best integer-feasible point found by [branch_and_bound].
#[derive(Clone, Debug)]
pub struct MixedIntegerSolution {
    pub y: DVector<f64>,
    pub objective: f64,
    pub nodes: usize,
}

/// A node of the search tree: every binary is either free (relaxed to
/// `[0, 1]`) or fixed to a value.
struct Node {
    fixed: Vec<Option<bool>>,
    bound: f64,
}

/// Solve the QP with the variables in `binaries` restricted to `{0, 1}`.
///
/// Depth-first branch-and-bound over QP relaxations, branching on the most
/// fractional binary. Once a relaxation is integral the remaining free binaries
/// are fixed to their rounded values and the node is solved again, so the
/// incumbent always comes from a QP with every binary fixed.
pub fn branch_and_bound(
    qp: &QpData,
    binaries: Range<usize>,
    settings: &SolverSettings,
) -> Result<QpOutcome<MixedIntegerSolution>> {
    let num_binaries = binaries.len();
    let mut stack = vec![Node {
        fixed: vec![None; num_binaries],
        bound: f64::NEG_INFINITY,
    }];
    let mut incumbent: Option<MixedIntegerSolution> = None;
    let mut nodes = 0;

    let is_pruned = |bound: f64, incumbent: &Option<MixedIntegerSolution>| {
        incumbent
            .as_ref()
            .is_some_and(|inc| bound >= inc.objective - settings.qp_tol * (1.0 + inc.objective.abs()))
    };

    while let Some(node) = stack.pop() {
        if is_pruned(node.bound, &incumbent) {
            continue;
        }
        nodes += 1;
        if nodes > settings.max_nodes {
            warn!("branch-and-bound stopped after {} nodes", settings.max_nodes);
            return Ok(match incumbent {
                Some(inc) => QpOutcome::Solved(inc),
                None => QpOutcome::Failed(format!("node limit {} reached", settings.max_nodes)),
            });
        }

        let sol = match solve_qp(&node_relaxation(qp, &binaries, &node.fixed), settings)? {
            QpOutcome::Solved(sol) => sol,
            QpOutcome::Infeasible => continue,
            QpOutcome::Unbounded => return Ok(QpOutcome::Unbounded),
            QpOutcome::Failed(why) => return Ok(QpOutcome::Failed(why)),
        };
        if is_pruned(sol.objective, &incumbent) {
            continue;
        }

        let most_fractional = node
            .fixed
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_none())
            .map(|(k, _)| {
                let v = sol.y[binaries.start + k];
                (k, v, (v - v.round()).abs())
            })
            .max_by(|a, b| a.2.total_cmp(&b.2));

        match most_fractional {
            Some((k, v, frac)) if frac > settings.integrality_tol => {
                let mut down = node.fixed.clone();
                down[k] = Some(false);
                let mut up = node.fixed.clone();
                up[k] = Some(true);
                let (first, second) = if v >= 0.5 { (up, down) } else { (down, up) };
                stack.push(Node {
                    fixed: second,
                    bound: sol.objective,
                });
                stack.push(Node {
                    fixed: first,
                    bound: sol.objective,
                });
            }
            Some(_) => {
                let fixed = node
                    .fixed
                    .iter()
                    .enumerate()
                    .map(|(k, f)| f.or(Some(sol.y[binaries.start + k] >= 0.5)))
                    .collect();
                stack.push(Node {
                    fixed,
                    bound: sol.objective,
                });
            }
            None => {
                let mut y = sol.y;
                for (k, f) in node.fixed.iter().enumerate() {
                    y[binaries.start + k] = if f.unwrap_or(false) { 1.0 } else { 0.0 };
                }
                debug!("new incumbent {} at node {nodes}", sol.objective);
                incumbent = Some(MixedIntegerSolution {
                    y,
                    objective: sol.objective,
                    nodes,
                });
            }
        }
    }

    Ok(match incumbent {
        Some(mut inc) => {
            inc.nodes = nodes;
            QpOutcome::Solved(inc)
        }
        None => QpOutcome::Infeasible,
    })
}

/// The QP relaxation of a node: free binaries in `[0, 1]`, fixed binaries as equalities.
fn node_relaxation(qp: &QpData, binaries: &Range<usize>, fixed: &[Option<bool>]) -> QpData {
    let n = qp.num_variables();
    let num_fixed = fixed.iter().filter(|f| f.is_some()).count();
    let num_free = fixed.len() - num_fixed;

    let mut a_fix = DMatrix::zeros(num_fixed, n);
    let mut b_fix = DVector::zeros(num_fixed);
    let mut a_box = DMatrix::zeros(2 * num_free, n);
    let mut b_box = DVector::zeros(2 * num_free);
    let (mut i_fix, mut i_box) = (0, 0);
    for (k, f) in fixed.iter().enumerate() {
        let col = binaries.start + k;
        match f {
            Some(v) => {
                a_fix[(i_fix, col)] = 1.0;
                b_fix[i_fix] = if *v { 1.0 } else { 0.0 };
                i_fix += 1;
            }
            None => {
                a_box[(i_box, col)] = 1.0;
                b_box[i_box] = 1.0;
                a_box[(i_box + 1, col)] = -1.0;
                i_box += 2;
            }
        }
    }

    let mut relaxed = qp.clone();
    relaxed.push_equalities(&a_fix, &b_fix);
    relaxed.push_inequalities(&a_box, &b_box);
    relaxed
}

fn nonzero_rows(a: &DMatrix<f64>) -> Vec<usize> {
    (0..a.nrows())
        .filter(|&i| a.row(i).iter().any(|&v| v != 0.0))
        .collect()
}

/// Stack two matrices with the same number of columns on top of each other.
pub(crate) fn stack_rows(top: &DMatrix<f64>, bottom: &DMatrix<f64>) -> DMatrix<f64> {
    let mut out = DMatrix::zeros(top.nrows() + bottom.nrows(), top.ncols().max(bottom.ncols()));
    out.view_mut((0, 0), top.shape()).copy_from(top);
    out.view_mut((top.nrows(), 0), bottom.shape())
        .copy_from(bottom);
    out
}

/// Concatenate two vectors.
pub(crate) fn stack_vec(top: &DVector<f64>, bottom: &DVector<f64>) -> DVector<f64> {
    DVector::from_iterator(
        top.len() + bottom.len(),
        top.iter().chain(bottom.iter()).copied(),
    )
}

/// Convert a dense matrix to Clarabel's compressed sparse column format.
fn dmatrix_to_csc(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..nrows {
            let v = m[(i, j)];
            if v != 0.0 {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}

/// Convert the symmetric part of a square matrix to an upper-triangular CSC matrix.
fn dmatrix_to_csc_upper_tri(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let n = m.nrows();
    let mut colptr = vec![0usize; n + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..n {
        for i in 0..=j {
            let v = 0.5 * (m[(i, j)] + m[(j, i)]);
            if v != 0.0 {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(n, n, colptr, rowval, nzval)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn empty(n: usize) -> (DMatrix<f64>, DVector<f64>) {
        (DMatrix::zeros(0, n), DVector::zeros(0))
    }

    #[test]
    fn test_qp_duals() {
        // min ½(y0² + y1²) s.t. y0 + y1 = 2, y0 ≤ 0.5
        let (a_in, b_in) = (DMatrix::from_row_slice(1, 2, &[1.0, 0.0]), DVector::from_vec(vec![0.5]));
        let qp = QpData {
            p: DMatrix::identity(2, 2),
            q: DVector::zeros(2),
            a_eq: DMatrix::from_row_slice(1, 2, &[1.0, 1.0]),
            b_eq: DVector::from_vec(vec![2.0]),
            a_in,
            b_in,
        };
        let QpOutcome::Solved(sol) = solve_qp(&qp, &SolverSettings::default()).unwrap() else {
            panic!("QP should be feasible");
        };
        assert_abs_diff_eq!(sol.y[0], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(sol.y[1], 1.5, epsilon = 1e-6);
        assert_abs_diff_eq!(sol.objective, 0.5 * (0.25 + 2.25), epsilon = 1e-6);
        // stationarity: y + A_eqᵀ z_eq + A_inᵀ z_in = 0
        assert_abs_diff_eq!(sol.eq_duals[0], -1.5, epsilon = 1e-6);
        assert_abs_diff_eq!(sol.in_duals[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_rows_without_variables() {
        let (a_eq, b_eq) = empty(1);
        let qp = QpData {
            p: DMatrix::identity(1, 1),
            q: DVector::zeros(1),
            a_eq,
            b_eq,
            a_in: DMatrix::zeros(1, 1),
            b_in: DVector::from_vec(vec![-1.0]),
        };
        assert!(matches!(
            solve_qp(&qp, &SolverSettings::default()).unwrap(),
            QpOutcome::Infeasible
        ));
    }

    #[test]
    fn test_branch_and_bound() {
        // min ½(y0 − 0.7)² + ½(y1 − 0.2)² + ½(y2 - 3)², y0 + y1 ≤ 1.5, y0, y1 binary
        let (a_eq, b_eq) = empty(3);
        let qp = QpData {
            p: DMatrix::identity(3, 3),
            q: DVector::from_vec(vec![-0.7, -0.2, -3.0]),
            a_eq,
            b_eq,
            a_in: DMatrix::from_row_slice(1, 3, &[1.0, 1.0, 0.0]),
            b_in: DVector::from_vec(vec![1.5]),
        };
        let QpOutcome::Solved(sol) = branch_and_bound(&qp, 0..2, &SolverSettings::default()).unwrap()
        else {
            panic!("MIQP should be feasible");
        };
        assert_eq!(sol.y[0], 1.0);
        assert_eq!(sol.y[1], 0.0);
        assert_abs_diff_eq!(sol.y[2], 3.0, epsilon = 1e-6);
        let expected = 0.5 - 0.7 - 4.5;
        assert_abs_diff_eq!(sol.objective, expected, epsilon = 1e-6);
    }

    #[test]
    fn test_branch_and_bound_infeasible() {
        // y0 + y1 = 1.5 has no binary solution
        let (a_in, b_in) = empty(2);
        let qp = QpData {
            p: DMatrix::identity(2, 2),
            q: DVector::zeros(2),
            a_eq: DMatrix::from_row_slice(1, 2, &[1.0, 1.0]),
            b_eq: DVector::from_vec(vec![1.5]),
            a_in,
            b_in,
        };
        assert!(matches!(
            branch_and_bound(&qp, 0..2, &SolverSettings::default()).unwrap(),
            QpOutcome::Infeasible
        ));
    }
}
