//! # Echo operator
//!
//! Command-line surface and configuration of the `echo-operator` binary.
//! The control loop itself lives in `echo-reconciler`.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod cli;
pub mod config;
