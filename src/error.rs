//! Error types for trajectory propagation.

use thiserror::Error;

/// Errors that can occur during propagation, stepping or recording.
#[derive(Debug, Error)]
pub enum IntegrationError {
    /// Invalid input parameters (negative step, bad tolerance, zero interval...).
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the invalid input
        message: String,
    },

    /// State vector length outside the supported range.
    #[error("state vector length {len} not supported (expected 6..=12)")]
    StateLayout {
        /// Requested number of components
        len: usize,
    },

    /// Speed too close to zero to convert an arc length into a time interval.
    #[error("degenerate velocity: speed {speed:e} is below the conversion threshold")]
    DegenerateVelocity {
        /// Speed at the start of the rejected step
        speed: f64,
    },

    /// A step was recorded before the tracker knew the starting speed.
    #[error("step tracker used before initialization")]
    TrackerNotInitialized,

    /// An arm token from an earlier arming was presented to the tracker.
    #[error("stale arm token: generation {token}, tracker is at {current}")]
    StaleArmToken {
        /// Generation carried by the token
        token: u64,
        /// Current generation of the tracker
        current: u64,
    },

    /// Sub-floor step collapsed to zero length.
    #[error("integration step became zero at arc length {x}")]
    StepBecameZero {
        /// Arc length at which the step vanished
        x: f64,
    },

    /// Failure while writing tracker output.
    #[error("tracker output failed: {0}")]
    Io(#[from] std::io::Error),
}

impl IntegrationError {
    /// Creates an invalid input error.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Returns true for errors caused by the caller's arguments.
    #[must_use]
    pub const fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput { .. }
                | Self::StateLayout { .. }
                | Self::TrackerNotInitialized
                | Self::StaleArmToken { .. }
        )
    }
}

/// Result type for propagation operations.
pub type Result<T> = std::result::Result<T, IntegrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IntegrationError::invalid_input("hstep is negative");
        assert!(err.to_string().contains("hstep is negative"));

        let err = IntegrationError::DegenerateVelocity { speed: 1e-15 };
        assert!(err.to_string().contains("degenerate velocity"));

        let err = IntegrationError::StaleArmToken {
            token: 3,
            current: 5,
        };
        assert!(err.to_string().contains("generation 3"));
    }

    #[test]
    fn test_usage_classification() {
        assert!(IntegrationError::invalid_input("x").is_usage_error());
        assert!(IntegrationError::StateLayout { len: 4 }.is_usage_error());
        assert!(!IntegrationError::DegenerateVelocity { speed: 0.0 }.is_usage_error());
        assert!(!IntegrationError::StepBecameZero { x: 1.0 }.is_usage_error());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: IntegrationError = io.into();
        assert!(matches!(err, IntegrationError::Io(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
