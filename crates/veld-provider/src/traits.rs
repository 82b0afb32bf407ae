//! Capability traits for provider leaf clients
//!
//! Each trait covers one CRUD capability for a single [`LeafKind`]. A client
//! that implements all four automatically implements the [`LeafClient`]
//! marker trait through a blanket impl. The engine looks clients up by kind
//! through a [`ProviderDirectory`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProviderResult;
use crate::types::{LeafKind, LeafPayload, ObservedLeaf, ProviderId};

/// Capability to create leaf resources.
#[async_trait]
pub trait CreateLeaf: Send + Sync {
    /// Creates a resource from the payload and returns the observed result,
    /// including the provider-assigned identifier and any provider-populated
    /// fields (DNS names, repository URIs).
    async fn create(&self, payload: &LeafPayload) -> ProviderResult<ObservedLeaf>;
}

/// Capability to read leaf resources.
#[async_trait]
pub trait ReadLeaf: Send + Sync {
    /// Reads one resource by provider identifier. Returns `Ok(None)` when
    /// the resource does not exist.
    async fn read(&self, id: &ProviderId) -> ProviderResult<Option<ObservedLeaf>>;

    /// Lists all resources of this client's kind.
    async fn list(&self) -> ProviderResult<Vec<ObservedLeaf>>;
}

/// Capability to update leaf resources in place.
#[async_trait]
pub trait UpdateLeaf: Send + Sync {
    /// Updates the resource to match the payload and returns the observed
    /// result.
    async fn update(&self, id: &ProviderId, payload: &LeafPayload) -> ProviderResult<ObservedLeaf>;
}

/// Capability to delete leaf resources.
#[async_trait]
pub trait DeleteLeaf: Send + Sync {
    /// Deletes the resource. Deleting a resource that no longer exists is
    /// an error ([`crate::ProviderError::NotFound`]); callers that want
    /// idempotent deletes treat that error as success.
    async fn delete(&self, id: &ProviderId) -> ProviderResult<()>;
}

/// Marker trait for clients supporting all CRUD capabilities.
///
/// Automatically implemented for any type implementing all four capability
/// traits.
pub trait LeafClient: CreateLeaf + ReadLeaf + UpdateLeaf + DeleteLeaf {}

impl<T: CreateLeaf + ReadLeaf + UpdateLeaf + DeleteLeaf> LeafClient for T {}

/// Lookup of leaf clients by kind.
///
/// The engine owns one directory per provider account/region pair. A
/// directory may decline to serve a kind (for example, a provider without a
/// managed image registry); provisioning steps for that kind are skipped.
pub trait ProviderDirectory: Send + Sync {
    /// Returns the client managing the given kind, or `None` when the
    /// provider does not support it.
    fn client(&self, kind: LeafKind) -> Option<Arc<dyn LeafClient>>;
}
