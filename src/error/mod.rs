//! Error definitions
//!
//! Every error in this crate describes a defect in test code or in the engine
//! itself, never an expected runtime condition. The core propagates them as
//! values with `?`; entry points that cannot hand them back (procedure body
//! APIs, the mock layer, destructors) escalate through [`fatal`].

use thiserror::Error;

/// Main error type for testkit-coro
#[derive(Error, Debug)]
pub enum Error {
    /// An operation was invoked in a state that does not allow it, for
    /// example returning a call twice or dropping a launch result.
    #[error("Usage error: {0}")]
    Usage(String),

    /// Two actors disagreed about the message protocol: a missing reply
    /// destination, an unexpected payload kind, a mismatched originator.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// An object was destroyed or reused at the wrong point of its life.
    #[error("Lifecycle violation: {0}")]
    Lifecycle(String),

    /// The OS refused to create a thread for a procedure.
    #[error("Failed to spawn procedure thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl Error {
    /// Create a usage error.
    #[must_use]
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    /// Create a protocol violation.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a lifecycle violation.
    #[must_use]
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle(message.into())
    }

    /// Returns true for [`Error::Usage`].
    #[must_use]
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    /// Returns true for [`Error::Protocol`].
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Returns true for [`Error::Lifecycle`].
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Lifecycle(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Logs `err` and panics with its message.
///
/// A panic raised on a procedure thread is captured by the fiber and re-raised
/// on the thread that advanced it, so the test harness sees it either way.
#[track_caller]
pub fn fatal(err: Error) -> ! {
    tracing::error!(error = %err, "unrecoverable engine violation");
    panic!("{err}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_category() {
        assert_eq!(
            Error::usage("double return").to_string(),
            "Usage error: double return"
        );
        assert_eq!(
            Error::protocol("no destination").to_string(),
            "Protocol violation: no destination"
        );
        assert_eq!(
            Error::lifecycle("still running").to_string(),
            "Lifecycle violation: still running"
        );
    }

    #[test]
    fn test_category_predicates() {
        assert!(Error::usage("x").is_usage());
        assert!(Error::protocol("x").is_protocol());
        assert!(Error::lifecycle("x").is_lifecycle());
        assert!(!Error::usage("x").is_protocol());
    }

    #[test]
    fn test_spawn_from_io() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "no threads").into();
        assert!(matches!(err, Error::Spawn(_)));
    }

    #[test]
    #[should_panic(expected = "Usage error: boom")]
    fn test_fatal_panics_with_message() {
        fatal(Error::usage("boom"));
    }
}
