//! Error types for admission primitives

use std::error::Error as StdError;
use thiserror::Error;

/// Invalid constructor arguments, raised eagerly at construction
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A value that must be strictly greater than zero was not
    #[error("{field} must be greater than 0 (got {value})")]
    NotPositive { field: &'static str, value: f64 },

    /// A value that must not be negative was
    #[error("{field} must not be negative (got {value})")]
    Negative { field: &'static str, value: f64 },

    /// A value fell outside its allowed range
    #[error("{field} must be within [{min}, {max}] (got {value})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

impl ConfigError {
    pub(crate) fn require_positive(field: &'static str, value: f64) -> Result<(), Self> {
        // NaN fails the comparison and is rejected as well
        if value > 0.0 {
            Ok(())
        } else {
            Err(ConfigError::NotPositive { field, value })
        }
    }

    pub(crate) fn require_non_negative(field: &'static str, value: f64) -> Result<(), Self> {
        if value >= 0.0 {
            Ok(())
        } else {
            Err(ConfigError::Negative { field, value })
        }
    }

    pub(crate) fn require_range(
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    ) -> Result<(), Self> {
        if (min..=max).contains(&value) {
            Ok(())
        } else {
            Err(ConfigError::OutOfRange {
                field,
                value,
                min,
                max,
            })
        }
    }
}

/// A call was not admitted, or a bounded wait ended without a decision
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("circuit '{circuit}' is open")]
    CircuitOpen { circuit: String },

    #[error("bulkhead is full (limit: {limit})")]
    BulkheadFull { limit: usize },

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("retry budget exhausted")]
    BudgetExhausted,

    #[error("concurrency limit reached (limit: {limit})")]
    ConcurrencyLimited { limit: usize },

    /// The wait was cancelled before a permit was acquired. No permit is held.
    #[error("wait cancelled before a permit was acquired")]
    Cancelled,
}

/// Errors that can occur during circuit breaker operations
#[derive(Debug, Error)]
pub enum CircuitError<E = Box<dyn StdError + Send + Sync>> {
    /// Circuit is open, calls are being rejected
    #[error("Circuit '{circuit}' is open (opened at {opened_at})")]
    Open { circuit: String, opened_at: f64 },

    /// Bulkhead is at capacity, cannot acquire permit
    #[error("Circuit '{circuit}' bulkhead is full (limit: {limit})")]
    BulkheadFull { circuit: String, limit: usize },

    /// The wrapped operation failed
    #[error("Circuit execution failed: {0}")]
    Execution(#[source] E),
}

impl<E> CircuitError<E> {
    /// Whether the call was rejected before the operation ran
    pub fn is_rejection(&self) -> bool {
        !matches!(self, CircuitError::Execution(_))
    }
}
