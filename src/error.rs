//! Error types shared by the value functions.

use thiserror::Error;

/// Errors of the bound propagation utilities.
#[derive(Error, Debug)]
pub enum BoundError {
    #[error("unsupported layer: {what}")]
    UnsupportedLayer { what: String },

    #[error("dimension mismatch: {what}")]
    Dimension { what: String },

    #[error("unexpected LP solver status: {what}")]
    SolverStatus { what: String },
}

/// Errors that can occur while building or evaluating a value function.
///
/// Infeasible programs are not errors: they are reported as `Ok(None)` by the
/// evaluation functions.
#[derive(Error, Debug)]
pub enum ValueError {
    #[error("dimension mismatch: {what}")]
    Dimension { what: String },

    #[error("problem setup error: {what}")]
    Setup { what: String },

    #[error("unexpected solver status: {what}")]
    SolverStatus { what: String },

    #[error("MIQP objective {miqp} does not match the fixed-mode QP objective {qp}")]
    Inconsistent { miqp: f64, qp: f64 },

    #[error("numeric error: {what}")]
    Numeric { what: String },

    #[error("bound propagation error: {0}")]
    Bound(#[from] BoundError),
}

pub type Result<T> = std::result::Result<T, ValueError>;

/// Return a [ValueError::Dimension] unless `actual == expected`.
pub(crate) fn check_dim(what: &str, actual: usize, expected: usize) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(ValueError::Dimension {
            what: format!("{what} has dimension {actual}, expected {expected}"),
        })
    }
}

/// Return a [ValueError::Dimension] unless the matrix has the given shape.
pub(crate) fn check_shape(
    what: &str,
    actual: (usize, usize),
    expected: (usize, usize),
) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(ValueError::Dimension {
            what: format!(
                "{what} has shape {}x{}, expected {}x{}",
                actual.0, actual.1, expected.0, expected.1
            ),
        })
    }
}
