//! Error types for the parts of the crate that can report failure to a
//! caller instead of panicking.
//!
//! Most of this crate's failure modes are programming errors (a violated
//! invariant, a call made out of order) and are handled by panicking with a
//! source location, matching the source's `REQUIRE`/`Panicker` discipline.
//! The one place a caller-supplied value can be wrong without it being a
//! bug is `Context::init`'s option parsing, since those strings originate
//! outside the process.

use thiserror::Error;

/// An error produced while validating the plugin's startup options.
///
/// Returned from [`crate::config::Config::parse`] as a plain string at the
/// FFI boundary, but kept typed internally so call sites can
/// match on the failure kind in tests.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown option '{0}'")]
    UnknownOption(String),

    #[error("invalid value for option '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("missing required option '{0}'")]
    MissingOption(String),
}

/// Panics with a source-location-tagged message, mirroring the source's
/// `REQUIRE(condition)` macro. Used for invariant violations that are
/// programming errors rather than recoverable conditions.
#[macro_export]
macro_rules! require {
    ($cond:expr) => {
        if !($cond) {
            panic!(
                "requirement violated at {}:{}: {}",
                file!(),
                line!(),
                stringify!($cond)
            );
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            panic!(
                "requirement violated at {}:{}: {}",
                file!(),
                line!(),
                format!($($arg)+)
            );
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_messages_are_descriptive() {
        let e = ConfigError::UnknownOption("bogus-flag".to_string());
        assert!(e.to_string().contains("bogus-flag"));

        let e = ConfigError::InvalidValue {
            key: "default-quality".to_string(),
            reason: "not in 10..=100 or PNG".to_string(),
        };
        assert!(e.to_string().contains("default-quality"));
        assert!(e.to_string().contains("not in 10..=100"));
    }

    #[test]
    #[should_panic(expected = "requirement violated")]
    fn require_panics_with_location() {
        require!(1 + 1 == 3);
    }

    #[test]
    fn require_passes_silently() {
        require!(1 + 1 == 2);
    }
}
