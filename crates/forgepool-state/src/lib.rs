//! forgepool-state — embedded instance store for Forgepool.
//!
//! Backed by [redb](https://docs.rs/redb), persists the record of every
//! compute instance the pool believes it owns. The store is the single
//! source of truth the reconcile loop, reaper, and pinger converge the
//! provider against; it must survive process restarts.
//!
//! # Architecture
//!
//! Instance records are JSON-serialized into redb's `&[u8]` value column,
//! keyed by instance id. Every record carries a `version` counter; state
//! transitions go through [`InstanceStore::cas_state`], which fails with
//! [`StateError::Conflict`] when another task moved the record first.
//!
//! The `InstanceStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::InstanceStore;
pub use types::*;
