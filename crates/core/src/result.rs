//! Result type definition and extension traits.
//!
//! The combinators let log-and-continue call sites drop an error without
//! unwrap/expect/panic.

use std::fmt::Display;

use crate::error::Error;

/// The standard Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Logged fallbacks for any Result whose error can be displayed.
pub trait ResultExt<T, E> {
    /// Convert to an Option, logging the error at warn level under `context`.
    fn into_option_logged(self, context: &str) -> Option<T>;

    /// Get the value or `default`, logging the error under `context`.
    fn or_default_logged(self, default: T, context: &str) -> T;

    /// Inspect the error without consuming the Result.
    fn inspect_error<F: FnOnce(&E)>(self, f: F) -> Self;
}

impl<T, E: Display> ResultExt<T, E> for std::result::Result<T, E> {
    fn into_option_logged(self, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "{context}");
                None
            }
        }
    }

    fn or_default_logged(self, default: T, context: &str) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "{context}, using default");
                default
            }
        }
    }

    fn inspect_error<F: FnOnce(&E)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_option_logged() {
        let ok: Result<i32> = Ok(7);
        assert_eq!(ok.into_option_logged("reading"), Some(7));

        let failed: Result<i32> = Err(Error::toml_parse_failed("bad"));
        assert_eq!(failed.into_option_logged("reading"), None);
    }

    #[test]
    fn test_or_default_logged_works_for_foreign_errors() {
        let failed: std::result::Result<u32, String> = Err("boom".to_string());
        assert_eq!(failed.or_default_logged(3, "counting"), 3);
    }

    #[test]
    fn test_inspect_error_sees_only_errors() {
        let mut seen = Vec::new();
        let _ = Err::<(), _>("first").inspect_error(|e| seen.push(*e));
        let _ = Ok::<(), &str>(()).inspect_error(|e| seen.push(*e));
        assert_eq!(seen, vec!["first"]);
    }
}
