//! Error type, result combinators, backoff arithmetic and TOML config
//! loading shared by the Echo operator crates.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod result;

pub use backoff::{backoff_delay, calculate_backoff};
pub use config::{load_toml_file, parse_toml, to_toml_string};
pub use error::Error;
pub use result::{Result, ResultExt};
