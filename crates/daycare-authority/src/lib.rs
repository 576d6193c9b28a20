//! Authority side of the daycare protocol.
//!
//! Keeps the [`registry::DaycareRegistry`] of live hosts fed by heartbeats,
//! picks a host for a problem type, [`dispatch::dispatch`]es signed bundles to
//! it and verifies what comes back. Downstream delivery of grades goes
//! through [`retry::retry_with_backoff`].

pub mod dispatch;
pub mod registry;
pub mod retry;
pub mod routes;

pub use dispatch::{dispatch, socket_url, verify_returned_bundle, DispatchError, DispatchOutcome};
pub use registry::{DaycareRegistry, RegistryError};
pub use retry::{retry_with_backoff, spawn_with_backoff, BackoffPolicy};
