//! imgpull - download container and VM filesystem images.
//!
//! The library crate carries the pull-orchestration and policy layer:
//!
//! - **Policy**: [`policy`] folds command-line overrides into an immutable
//!   download policy (flags, verification mode, image root).
//! - **Name resolution**: [`name`] derives and validates the local
//!   destination name and polices collisions against the store.
//! - **Store**: [`store`] answers the one question this layer asks of the
//!   local image store: does this name exist?
//! - **Puller seam**: [`puller`] is the narrow interface to the transfer/
//!   verification/materialization service; [`fetch`] is the built-in HTTP
//!   transport behind it.
//! - **Orchestrator**: [`orchestrator`] drives one pull to its terminal
//!   outcome on a single-threaded event loop with cooperative,
//!   signal-driven cancellation.

pub mod fetch;
pub mod name;
pub mod orchestrator;
pub mod policy;
pub mod puller;
pub mod store;

pub use fetch::HttpFetcher;
pub use name::NameError;
pub use orchestrator::{PullOutcome, PullPhase};
pub use policy::{ImageKind, PolicyOverride, PullFlags, PullPolicy, VerifyMode};
pub use puller::{PullError, PullRequest, Puller};
pub use store::{DirStore, ImageStore, StoreError};
