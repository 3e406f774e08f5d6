//! Unified error type for the remedial-action optimization crates.
//!
//! Solver infeasibility and sensitivity failures are *not* errors: the
//! optimizer reports them as terminal statuses on the result it was
//! building. [`RaoError`] covers what cannot be recovered from inside the
//! iteration loop, mostly configuration and consistency problems detected
//! when a component is constructed.
//!
//! # Example
//!
//! ```
//! use rao_core::{RaoError, RaoResult};
//!
//! fn check_gap(gap: f64) -> RaoResult<f64> {
//!     if !(0.0..1.0).contains(&gap) {
//!         return Err(RaoError::Config(format!("relative MIP gap {gap} outside [0, 1)")));
//!     }
//!     Ok(gap)
//! }
//!
//! assert!(check_gap(0.5).is_ok());
//! assert!(check_gap(2.0).is_err());
//! ```

use thiserror::Error;

/// Error type for all optimization-engine operations.
///
/// Messages always carry the identifier of the state, element or device
/// responsible so that an operator can trace the conflict.
#[derive(Error, Debug)]
pub enum RaoError {
    /// I/O errors (reading parameter files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing/deserialization errors
    #[error("Parse error: {0}")]
    Parse(String),

    /// Data consistency errors (unknown ids, malformed tap tables, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Linear solver errors that are not a solve status
    #[error("Solver error: {0}")]
    Solver(String),

    /// Conflicting or unsupported parameters
    #[error("Configuration error: {0}")]
    Config(String),

    /// The sensitivity oracle could not be invoked at all
    #[error("Sensitivity error: {0}")]
    Sensitivity(String),

    /// Generic errors (for wrapping external errors)
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Results using RaoError.
pub type RaoResult<T> = Result<T, RaoError>;

impl From<anyhow::Error> for RaoError {
    fn from(err: anyhow::Error) -> Self {
        RaoError::Other(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for RaoError {
    fn from(err: serde_json::Error) -> Self {
        RaoError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_identifier() {
        let err = RaoError::Validation("PST 'pst-be' has an empty tap table".into());
        assert!(err.to_string().starts_with("Validation error"));
        assert!(err.to_string().contains("pst-be"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "parameters.toml");
        let err: RaoError = io_err.into();
        assert!(matches!(err, RaoError::Io(_)));
    }

    #[test]
    fn test_anyhow_context_is_kept() {
        let inner = anyhow::anyhow!("bad value").context("reading [solver]");
        let err: RaoError = inner.into();
        assert_eq!(err.to_string(), "reading [solver]: bad value");
    }

    #[test]
    fn test_question_mark_operator() {
        fn inner() -> RaoResult<()> {
            Err(RaoError::Config("conflicting unoptimized-cnec rules".into()))
        }

        fn outer() -> RaoResult<()> {
            inner()?;
            Ok(())
        }

        assert!(matches!(outer(), Err(RaoError::Config(_))));
    }
}
