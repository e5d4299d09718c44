//! Solver settings shared by the MIQP and NLP value functions.

/// Numerical settings of the underlying solvers and of the sensitivity computations.
#[derive(Clone, Debug)]
pub struct SolverSettings {
    /// Relative tolerance of the check that the MIQP objective equals the
    /// objective of the QP with the optimal modes fixed.
    pub consistency_tol: f64,
    /// Diagonal term added to the bordered KKT matrix before it is factorized.
    pub kkt_regularization: f64,
    /// Distance to a variable bound under which the bound is considered active.
    pub active_bound_tol: f64,
    /// Distance to 0 or 1 under which a relaxed binary variable is integral.
    pub integrality_tol: f64,
    /// Violation allowed for constraint rows that only involve parameters.
    pub feasibility_tol: f64,
    /// Maximum number of branch-and-bound nodes per MIQP solve.
    pub max_nodes: usize,
    /// Feasibility and gap tolerance of the QP solver.
    pub qp_tol: f64,
    /// Maximum number of interior-point iterations per QP.
    pub qp_max_iter: u32,
    /// Convergence tolerance passed to IPOPT.
    pub nlp_tol: f64,
    /// Maximum number of IPOPT iterations.
    pub nlp_max_iter: i32,
    /// IPOPT print level.
    pub nlp_print_level: i32,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            consistency_tol: 1e-5,
            kkt_regularization: 1e-12,
            active_bound_tol: 1e-4,
            integrality_tol: 1e-6,
            feasibility_tol: 1e-9,
            max_nodes: 10_000,
            qp_tol: 1e-9,
            qp_max_iter: 200,
            nlp_tol: 1e-9,
            nlp_max_iter: 3000,
            nlp_print_level: 0,
        }
    }
}
