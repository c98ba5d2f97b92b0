//! Error types shared by every burn-ldm module

use thiserror::Error;

/// Errors raised while building a module or validating its inputs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LdmError {
    #[error("{module}: shape mismatch, expected {expected}, got {actual}")]
    ShapeMismatch {
        module: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LdmError>;

impl LdmError {
    /// Builds a shape mismatch from anything printable with `{:?}`
    pub fn shape(
        module: &'static str,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        LdmError::ShapeMismatch {
            module,
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}

/// Fails with a configuration error when `value` is zero
pub fn ensure_positive(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(LdmError::Config(format!("{name} must be positive")));
    }
    Ok(())
}

/// Fails with a configuration error when `value` is not a multiple of `divisor`
pub fn ensure_divisible(name: &str, value: usize, divisor_name: &str, divisor: usize) -> Result<()> {
    ensure_positive(divisor_name, divisor)?;
    if value % divisor != 0 {
        return Err(LdmError::Config(format!(
            "{name} ({value}) must be divisible by {divisor_name} ({divisor})"
        )));
    }
    Ok(())
}

/// Checks one dimension of an input tensor against the configured width
pub fn check_dim(module: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(LdmError::shape(module, expected, actual));
    }
    Ok(())
}
