//! Error types shared by every resilience primitive
//!
//! The taxonomy is a closed sum type: callers can match exhaustively on
//! the ways a guarded call can fail without the operation itself failing.
//! User-operation errors travel through unchanged inside
//! [`ResilienceError::Underlying`].

use std::convert::Infallible;
use thiserror::Error;

/// Errors that can occur in resilience operations
///
/// `E` is the error type of the guarded operation. Construction-time
/// errors (config validation) use the default `Infallible` parameter,
/// since no operation is involved yet.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResilienceError<E = Infallible> {
    /// Circuit breaker is open, rejecting calls
    #[error("circuit breaker is open, rejecting calls")]
    BreakerOpen,

    /// Bulkhead waiting queue is full
    #[error("bulkhead is full, rejecting calls")]
    BulkheadFull,

    /// Waited longer than the bulkhead's maximum wait duration
    #[error("timed out waiting for a bulkhead permit")]
    BulkheadTimeout,

    /// Rate limiter rejected the call
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Time limiter's deadline expired before the operation finished
    #[error("operation timed out")]
    TimedOut,

    /// The caller or task was cancelled
    #[error("operation was cancelled")]
    Cancelled,

    /// A repeat-until loop exhausted its attempts without a satisfying value
    #[error("condition not met within the attempt budget")]
    ConditionNotMet,

    /// A saga step's forward action failed
    #[error("saga step `{step}` failed")]
    SagaStepFailed {
        /// Name of the failed step
        step: String,
        /// The error the step's action produced
        cause: Box<ResilienceError<E>>,
    },

    /// Configuration validation failure, raised at construction time
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The guarded operation itself failed; propagated unchanged
    #[error("underlying operation failed")]
    Underlying(E),
}

impl<E> ResilienceError<E> {
    /// Check if this error is an admission rejection (the operation never ran)
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            ResilienceError::BreakerOpen
                | ResilienceError::BulkheadFull
                | ResilienceError::BulkheadTimeout
                | ResilienceError::RateLimitExceeded
        )
    }

    /// Check if this error came from a deadline expiring
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ResilienceError::TimedOut | ResilienceError::BulkheadTimeout
        )
    }

    /// Check if this error wraps a user-operation error
    pub fn is_underlying(&self) -> bool {
        matches!(self, ResilienceError::Underlying(_))
    }

    /// Extract the user-operation error, if that is what this is
    pub fn into_underlying(self) -> Option<E> {
        match self {
            ResilienceError::Underlying(e) => Some(e),
            _ => None,
        }
    }

    /// Map the underlying error type, leaving every other variant intact
    pub fn map_underlying<F, G>(self, f: F) -> ResilienceError<G>
    where
        F: FnOnce(E) -> G,
    {
        match self {
            ResilienceError::Underlying(e) => ResilienceError::Underlying(f(e)),
            ResilienceError::BreakerOpen => ResilienceError::BreakerOpen,
            ResilienceError::BulkheadFull => ResilienceError::BulkheadFull,
            ResilienceError::BulkheadTimeout => ResilienceError::BulkheadTimeout,
            ResilienceError::RateLimitExceeded => ResilienceError::RateLimitExceeded,
            ResilienceError::TimedOut => ResilienceError::TimedOut,
            ResilienceError::Cancelled => ResilienceError::Cancelled,
            ResilienceError::ConditionNotMet => ResilienceError::ConditionNotMet,
            ResilienceError::SagaStepFailed { step, cause } => ResilienceError::SagaStepFailed {
                step,
                cause: Box::new(cause.map_underlying(f)),
            },
            ResilienceError::InvalidArgument(what) => ResilienceError::InvalidArgument(what),
        }
    }
}

impl ResilienceError<Infallible> {
    /// Widen a construction-time error into any operation error type
    ///
    /// Only variants that carry no underlying error can exist with
    /// `E = Infallible`, so this never needs to convert a payload.
    pub fn widen<E>(self) -> ResilienceError<E> {
        self.map_underlying(|never| match never {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let open: ResilienceError<String> = ResilienceError::BreakerOpen;
        assert!(open.is_admission_rejection());
        assert!(!open.is_timeout());
        assert!(!open.is_underlying());

        let timeout: ResilienceError<String> = ResilienceError::TimedOut;
        assert!(timeout.is_timeout());
        assert!(!timeout.is_admission_rejection());

        let wait: ResilienceError<String> = ResilienceError::BulkheadTimeout;
        assert!(wait.is_timeout());
        assert!(wait.is_admission_rejection());

        let inner = ResilienceError::Underlying("boom".to_string());
        assert!(inner.is_underlying());
        assert_eq!(inner.into_underlying(), Some("boom".to_string()));
    }

    #[test]
    fn test_map_underlying_preserves_structure() {
        let err: ResilienceError<&str> = ResilienceError::SagaStepFailed {
            step: "reserve".to_string(),
            cause: Box::new(ResilienceError::Underlying("no inventory")),
        };

        let mapped = err.map_underlying(String::from);
        match mapped {
            ResilienceError::SagaStepFailed { step, cause } => {
                assert_eq!(step, "reserve");
                assert_eq!(
                    *cause,
                    ResilienceError::Underlying("no inventory".to_string())
                );
            }
            other => panic!("expected SagaStepFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_widen_construction_error() {
        let err = ResilienceError::InvalidArgument("failure_threshold must be > 0".to_string());
        let widened: ResilienceError<String> = err.widen();
        assert!(matches!(widened, ResilienceError::InvalidArgument(_)));
    }

    #[test]
    fn test_display() {
        let err: ResilienceError<String> = ResilienceError::RateLimitExceeded;
        assert_eq!(err.to_string(), "rate limit exceeded");

        let err: ResilienceError<String> = ResilienceError::SagaStepFailed {
            step: "charge".to_string(),
            cause: Box::new(ResilienceError::TimedOut),
        };
        assert_eq!(err.to_string(), "saga step `charge` failed");
    }
}
