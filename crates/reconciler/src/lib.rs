//! Control-loop reconciliation for Echo resources.
//!
//! This crate implements the controller pattern for the `Echo` kind:
//!
//! - **Phase machine**: a pure decision over the stored phase and the
//!   observed job state
//! - **Reconciler**: one pass for one key: fetch, decide, apply, persist
//! - **Work queue**: deduplicated keys, never processed twice at once
//! - **Trigger binding**: Echo and owned Job changes enqueue Echo keys
//! - **Controller**: a worker pool draining the queue
//!
//! # Key Concepts
//!
//! ## Phases
//!
//! An Echo moves forward only: unset, `Pending`, `Running`, then `Completed`
//! or `Failed`. Terminal phases are never touched again. An unrecognized
//! stored phase is reset to `Pending`.
//!
//! ## Requeue
//!
//! Every pass ends in an [`Action`]: requeue now, requeue after a delay, or
//! wait for the next change. Failed passes are retried with per-key
//! exponential backoff.
//!
//! # Example
//!
//! ```ignore
//! use echo_cluster::{ChangeBus, EchoSpec, InMemoryJobBackend, InMemoryResourceStore};
//! use echo_reconciler::{Controller, ControllerConfig, ReconcilerBuilder};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = Arc::new(ChangeBus::default());
//!     let store = Arc::new(InMemoryResourceStore::with_bus(bus.clone()));
//!     let backend = Arc::new(InMemoryJobBackend::with_bus(bus.clone()));
//!
//!     let reconciler = ReconcilerBuilder::new()
//!         .with_store(store.clone())
//!         .with_backend(backend)
//!         .build()
//!         .unwrap();
//!     let controller = Controller::new(Arc::new(reconciler), ControllerConfig::default()).unwrap();
//!
//!     store.create("default", "hello", EchoSpec::new("hello").unwrap()).await.unwrap();
//!
//!     // Run until stopped
//!     // controller.run(&bus).await;
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod controller;
pub mod error;
pub mod phase;
pub mod queue;
pub mod reconciler;
pub mod trigger;
pub mod types;

// Re-export main types
pub use controller::{Controller, ControllerConfig, ControllerStats, ControllerStopper, StatsSnapshot};
pub use error::{Error, Result};
pub use phase::PhaseMachine;
pub use echo_core::calculate_backoff;
pub use queue::{BackoffPolicy, WorkQueue};
pub use reconciler::{Reconciler, ReconcilerBuilder, ReconcilerConfig};
pub use trigger::{Trigger, TriggerBinding, TriggerReason, WatchSource, resync_all};
pub use types::{Action, Decision, DecisionInput, Effect, Fault, ReconcileResult, Requeue};
