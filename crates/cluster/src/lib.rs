//! Cluster-facing collaborators of the Echo operator.
//!
//! This crate provides everything the reconciler talks to:
//!
//! - **Resource model**: the `Echo` resource, its spec, status and conditions
//! - **Job model**: job specs, deterministic job naming, execution states
//! - **Resource store**: get/update-status/list with resource-version fencing
//! - **Job backends**: create/inspect/delete of execution units
//! - **Change bus**: watch notifications for both kinds
//! - **Garbage collection**: owner-reference cleanup of jobs
//!
//! # Example
//!
//! ```ignore
//! use echo_cluster::{ChangeBus, EchoSpec, InMemoryResourceStore, ResourceStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = Arc::new(ChangeBus::default());
//!     let store = InMemoryResourceStore::with_bus(bus.clone());
//!     let mut watch = bus.subscribe();
//!
//!     let spec = EchoSpec::new("hello").unwrap();
//!     let echo = store.create("default", "hello", spec).await.unwrap();
//!
//!     let event = watch.recv().await.unwrap();
//!     assert_eq!(event.key, echo.key());
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod backend;
pub mod bus;
pub mod error;
pub mod fault;
pub mod gc;
pub mod job;
pub mod process;
pub mod store;
pub mod types;

// Re-export main types
pub use backend::{InMemoryJobBackend, JobBackend, JobRecord};
pub use bus::{ChangeBus, ChangeKind, WatchEvent, WatchSubscription};
pub use error::{Error, Result};
pub use fault::FaultInjector;
pub use gc::OwnerGarbageCollector;
pub use job::{JobSpec, JobState, JobTemplate, OwnerReference, job_key_for, job_name_for};
pub use process::LocalProcessJobBackend;
pub use store::{InMemoryResourceStore, ResourceStore};
pub use types::{
    Condition, ConditionStatus, ECHO_KIND, Echo, EchoPhase, EchoSpec, EchoStatus, EchoSummary,
    ObjectKey, ObjectMeta, ResourceKind, ResourceVersion, condition_types,
};
