//! Error types for packetbuddy-core.
//!
//! Everything in this crate talks to the operating system, so nearly all
//! failures are transient: an interface disappears between two polls, a
//! `/sys` file is briefly unreadable, a route lookup times out. Callers in
//! the monitor loops log these and try again on the next tick.
//!
//! | Error | Typical cause | Retry? |
//! |-------|---------------|--------|
//! | [`Error::Io`] | `/sys` or `/proc` read failed | Next tick |
//! | [`Error::CounterRead`] | OS refused to report interface counters | Next tick |
//! | [`Error::NoInterfaces`] | Only loopback/virtual interfaces present | Next tick |
//! | [`Error::Power`] | Power supply information malformed | Next tick |
//! | [`Error::InvalidConfig`] | Zero poll interval, zero anomaly threshold | Never |
//! | [`Error::Cancelled`] | Shutdown requested | Never |

use thiserror::Error;

/// Errors raised while reading counters or power state.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Interface counters could not be read.
    #[error("Failed to read interface counters: {0}")]
    CounterRead(String),

    /// No interface survived the virtual/loopback filter.
    #[error("No usable network interfaces found")]
    NoInterfaces,

    /// Power supply state could not be determined.
    #[error("Power state error: {0}")]
    Power(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias using packetbuddy-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the failure is worth retrying on the next tick.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Error::InvalidConfig(_) | Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::NoInterfaces.to_string(),
            "No usable network interfaces found"
        );
        assert!(
            Error::CounterRead("eth0 vanished".to_string())
                .to_string()
                .contains("eth0 vanished")
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::NoInterfaces.is_transient());
        assert!(Error::Io(std::io::Error::other("boom")).is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::InvalidConfig("poll".to_string()).is_transient());
    }
}
