//! Provider abstraction for the veld reconciliation engine.
//!
//! This crate defines everything the engine needs to talk to a cloud
//! provider without knowing which one: the set of leaf resource kinds a
//! composite decomposes into, typed payloads for each kind, capability
//! traits for clients that manage one kind, the deterministic naming scheme
//! that ties provider-side resources back to their logical composite, and
//! resilience primitives (retry with exponential backoff, circuit breaker)
//! for calls that cross the network.

pub mod error;
pub mod naming;
pub mod resilience;
pub mod traits;
pub mod types;

pub use error::{ProviderError, ProviderResult};
pub use naming::ResourceNamer;
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSet, CircuitState, RetryConfig,
    RetryExecutor,
};
pub use traits::{CreateLeaf, DeleteLeaf, LeafClient, ProviderDirectory, ReadLeaf, UpdateLeaf};
pub use types::{
    AccessRuleSetSpec, ClusterSpec, CpuMem, ExecutionRoleSpec, ImageRef, ImageRepositorySpec,
    LeafKind, LeafPayload, ListenerSpec, LoadBalancerSpec, LogSinkSpec, NetworkBoundarySpec,
    ObservedLeaf, ProviderId, RoutingTargetSpec, ServiceSpec, TaskTemplateSpec,
};
