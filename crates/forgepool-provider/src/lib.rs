//! forgepool-provider — compute provider seam for Forgepool.
//!
//! The pool never talks to a cloud SDK directly: every launch, terminate,
//! and describe goes through the [`Provider`] trait, so the reconciliation
//! algorithm can be driven deterministically against the in-memory
//! implementation and any concrete cloud binding stays behind one seam.
//!
//! Two implementations ship here:
//! - [`HttpProvider`] — REST adapter to a provisioning endpoint.
//! - [`MemoryProvider`] — deterministic in-memory provider for tests and
//!   dev runs, with injectable failures.

pub mod error;
pub mod http;
pub mod memory;
pub mod types;

pub use error::{ProviderError, ProviderResult};
pub use http::HttpProvider;
pub use memory::MemoryProvider;
pub use types::*;

use async_trait::async_trait;

/// A compute provider the pool launches instances through.
///
/// Contract notes:
/// - `launch` creates an instance identified by `spec.name` and returns
///   that id. Launching an already-existing name is an idempotent no-op.
/// - `terminate` of an unknown id fails with [`ProviderError::NotFound`];
///   callers treat that as "already gone".
/// - Adapters own their I/O timeouts; a timeout is always
///   [`ProviderError::Transient`], never `NotFound`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Launch an instance; returns its provider id.
    async fn launch(&self, spec: &LaunchSpec) -> ProviderResult<String>;

    /// Terminate an instance.
    async fn terminate(&self, id: &str) -> ProviderResult<()>;

    /// List every instance carrying the pool tag, terminated ones included.
    async fn list_tagged(&self, pool_tag: &str) -> ProviderResult<Vec<ProviderInstance>>;

    /// Describe a single instance.
    async fn describe(&self, id: &str) -> ProviderResult<ProviderInstance>;
}
