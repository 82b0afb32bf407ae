//! Leaf resource types
//!
//! A composite application decomposes into a fixed set of leaf resources.
//! [`LeafKind`] enumerates the kinds, [`LeafPayload`] carries the typed
//! desired state for one leaf, and [`ObservedLeaf`] pairs a payload with the
//! provider-assigned identifier of the live resource behind it.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// The kinds of leaf resources a composite decomposes into.
///
/// The discriminant order is the provisioning dependency order: every kind
/// may reference identifiers of kinds listed before it, never after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafKind {
    /// Isolated network (VPC-like) the composite lives in.
    NetworkBoundary,
    /// Firewall rule set admitting traffic on the application port.
    AccessRuleSet,
    /// Group of backends the load balancer forwards to.
    RoutingTarget,
    /// Public entry point distributing traffic.
    LoadBalancer,
    /// Binding of a load balancer port to a routing target.
    Listener,
    /// Log collection endpoint for container output.
    LogSink,
    /// Private container image registry.
    ImageRepository,
    /// Identity the container runtime assumes to pull images and ship logs.
    ExecutionRole,
    /// Compute cluster the service is scheduled on.
    Cluster,
    /// Versioned template describing the container to run.
    TaskTemplate,
    /// Long-running service keeping N copies of the task alive.
    Service,
}

impl LeafKind {
    /// All kinds in provisioning dependency order.
    pub const ALL: [LeafKind; 11] = [
        LeafKind::NetworkBoundary,
        LeafKind::AccessRuleSet,
        LeafKind::RoutingTarget,
        LeafKind::LoadBalancer,
        LeafKind::Listener,
        LeafKind::LogSink,
        LeafKind::ImageRepository,
        LeafKind::ExecutionRole,
        LeafKind::Cluster,
        LeafKind::TaskTemplate,
        LeafKind::Service,
    ];

    /// Stable string form, used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            LeafKind::NetworkBoundary => "network_boundary",
            LeafKind::AccessRuleSet => "access_rule_set",
            LeafKind::RoutingTarget => "routing_target",
            LeafKind::LoadBalancer => "load_balancer",
            LeafKind::Listener => "listener",
            LeafKind::LogSink => "log_sink",
            LeafKind::ImageRepository => "image_repository",
            LeafKind::ExecutionRole => "execution_role",
            LeafKind::Cluster => "cluster",
            LeafKind::TaskTemplate => "task_template",
            LeafKind::Service => "service",
        }
    }

    /// Suffix appended to the logical name when naming provider resources
    /// of this kind.
    pub fn name_suffix(&self) -> &'static str {
        match self {
            LeafKind::NetworkBoundary => "-net",
            LeafKind::AccessRuleSet => "-rules",
            LeafKind::RoutingTarget => "-target",
            LeafKind::LoadBalancer => "-lb",
            LeafKind::Listener => "-listener",
            LeafKind::LogSink => "-logs",
            LeafKind::ImageRepository => "-repo",
            LeafKind::ExecutionRole => "-role",
            LeafKind::Cluster => "-cluster",
            LeafKind::TaskTemplate => "-task",
            LeafKind::Service => "-svc",
        }
    }
}

impl Display for LeafKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque provider-assigned identifier for a live resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProviderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ProviderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Allowed CPU/memory pairings for a task template.
///
/// Serverless container runtimes only accept specific combinations, so the
/// pairing is a closed enum rather than two free-form numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CpuMem {
    #[serde(rename = "vCPU0.25-0.5GB")]
    Cpu025Mem05,
    #[serde(rename = "vCPU0.25-1GB")]
    Cpu025Mem1,
    #[serde(rename = "vCPU0.25-2GB")]
    Cpu025Mem2,
    #[serde(rename = "vCPU0.5-1GB")]
    Cpu05Mem1,
    #[serde(rename = "vCPU0.5-2GB")]
    Cpu05Mem2,
    #[serde(rename = "vCPU0.5-4GB")]
    Cpu05Mem4,
    #[serde(rename = "vCPU1-2GB")]
    Cpu1Mem2,
    #[serde(rename = "vCPU1-4GB")]
    Cpu1Mem4,
    #[serde(rename = "vCPU1-8GB")]
    Cpu1Mem8,
    #[serde(rename = "vCPU2-4GB")]
    Cpu2Mem4,
    #[serde(rename = "vCPU2-8GB")]
    Cpu2Mem8,
    #[serde(rename = "vCPU2-16GB")]
    Cpu2Mem16,
    #[serde(rename = "vCPU4-8GB")]
    Cpu4Mem8,
    #[serde(rename = "vCPU4-16GB")]
    Cpu4Mem16,
    #[serde(rename = "vCPU4-30GB")]
    Cpu4Mem30,
}

impl CpuMem {
    /// CPU units (1 vCPU = 1024 units).
    pub fn cpu_units(&self) -> u32 {
        match self {
            CpuMem::Cpu025Mem05 | CpuMem::Cpu025Mem1 | CpuMem::Cpu025Mem2 => 256,
            CpuMem::Cpu05Mem1 | CpuMem::Cpu05Mem2 | CpuMem::Cpu05Mem4 => 512,
            CpuMem::Cpu1Mem2 | CpuMem::Cpu1Mem4 | CpuMem::Cpu1Mem8 => 1024,
            CpuMem::Cpu2Mem4 | CpuMem::Cpu2Mem8 | CpuMem::Cpu2Mem16 => 2048,
            CpuMem::Cpu4Mem8 | CpuMem::Cpu4Mem16 | CpuMem::Cpu4Mem30 => 4096,
        }
    }

    /// Memory in MiB.
    pub fn memory_mib(&self) -> u32 {
        match self {
            CpuMem::Cpu025Mem05 => 512,
            CpuMem::Cpu025Mem1 | CpuMem::Cpu05Mem1 => 1024,
            CpuMem::Cpu025Mem2 | CpuMem::Cpu05Mem2 | CpuMem::Cpu1Mem2 => 2048,
            CpuMem::Cpu05Mem4 | CpuMem::Cpu1Mem4 | CpuMem::Cpu2Mem4 => 4096,
            CpuMem::Cpu1Mem8 | CpuMem::Cpu2Mem8 | CpuMem::Cpu4Mem8 => 8192,
            CpuMem::Cpu2Mem16 | CpuMem::Cpu4Mem16 => 16384,
            CpuMem::Cpu4Mem30 => 30720,
        }
    }
}

/// Reference to a container image, either in a managed repository or an
/// external registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Registry/repository URI without tag or digest.
    pub uri: String,
    /// Optional tag. Ignored when a digest is set.
    pub tag: Option<String>,
    /// Optional content digest, pinning an exact image.
    pub digest: Option<String>,
}

impl ImageRef {
    /// Fully qualified image reference. A digest wins over a tag; with
    /// neither, `latest` is assumed.
    pub fn qualified(&self) -> String {
        if let Some(digest) = &self.digest {
            format!("{}@{}", self.uri, digest)
        } else if let Some(tag) = &self.tag {
            format!("{}:{}", self.uri, tag)
        } else {
            format!("{}:latest", self.uri)
        }
    }
}

/// Desired state of a network boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkBoundarySpec {
    pub name: String,
    pub cidr_block: String,
}

/// Desired state of an access rule set: admit TCP on the application port,
/// allow all egress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRuleSetSpec {
    pub name: String,
    pub ingress_port: u16,
    /// Boundary the rule set is attached to; filled in during provisioning.
    pub boundary_id: Option<ProviderId>,
}

/// Desired state of a routing target group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTargetSpec {
    pub name: String,
    pub port: u16,
    pub health_check_path: String,
    pub boundary_id: Option<ProviderId>,
}

/// Desired state of a load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    pub name: String,
    pub boundary_id: Option<ProviderId>,
    pub access_rule_set_id: Option<ProviderId>,
    /// Public DNS name, populated by the provider after creation.
    pub dns_name: Option<String>,
}

/// Desired state of a listener binding a load balancer port to a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerSpec {
    pub port: u16,
    pub load_balancer_id: Option<ProviderId>,
    pub routing_target_id: Option<ProviderId>,
}

/// Desired state of a log sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSinkSpec {
    pub name: String,
}

/// Desired state of a container image repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRepositorySpec {
    pub name: String,
    /// Pull URI, populated by the provider after creation.
    pub repository_uri: Option<String>,
}

/// Desired state of an execution role the container runtime assumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRoleSpec {
    pub name: String,
}

/// Desired state of a compute cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
}

/// Desired state of a task template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTemplateSpec {
    pub family: String,
    pub container_name: String,
    pub image: ImageRef,
    pub port: u16,
    pub cpu_mem: CpuMem,
    pub log_sink_id: Option<ProviderId>,
    pub execution_role_id: Option<ProviderId>,
}

/// Desired state of a running service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub replicas: u32,
    pub port: u16,
    pub assign_public_ip: bool,
    pub cluster_id: Option<ProviderId>,
    pub task_template_id: Option<ProviderId>,
    pub routing_target_id: Option<ProviderId>,
    pub access_rule_set_id: Option<ProviderId>,
}

/// Typed desired state for one leaf resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LeafPayload {
    NetworkBoundary(NetworkBoundarySpec),
    AccessRuleSet(AccessRuleSetSpec),
    RoutingTarget(RoutingTargetSpec),
    LoadBalancer(LoadBalancerSpec),
    Listener(ListenerSpec),
    LogSink(LogSinkSpec),
    ImageRepository(ImageRepositorySpec),
    ExecutionRole(ExecutionRoleSpec),
    Cluster(ClusterSpec),
    TaskTemplate(TaskTemplateSpec),
    Service(ServiceSpec),
}

impl LeafPayload {
    /// The kind of leaf this payload describes.
    pub fn kind(&self) -> LeafKind {
        match self {
            LeafPayload::NetworkBoundary(_) => LeafKind::NetworkBoundary,
            LeafPayload::AccessRuleSet(_) => LeafKind::AccessRuleSet,
            LeafPayload::RoutingTarget(_) => LeafKind::RoutingTarget,
            LeafPayload::LoadBalancer(_) => LeafKind::LoadBalancer,
            LeafPayload::Listener(_) => LeafKind::Listener,
            LeafPayload::LogSink(_) => LeafKind::LogSink,
            LeafPayload::ImageRepository(_) => LeafKind::ImageRepository,
            LeafPayload::ExecutionRole(_) => LeafKind::ExecutionRole,
            LeafPayload::Cluster(_) => LeafKind::Cluster,
            LeafPayload::TaskTemplate(_) => LeafKind::TaskTemplate,
            LeafPayload::Service(_) => LeafKind::Service,
        }
    }

    /// Provider-facing name of the resource, when this kind carries one.
    ///
    /// Listeners are addressed through their load balancer and have no name
    /// of their own.
    pub fn name(&self) -> Option<&str> {
        match self {
            LeafPayload::NetworkBoundary(s) => Some(&s.name),
            LeafPayload::AccessRuleSet(s) => Some(&s.name),
            LeafPayload::RoutingTarget(s) => Some(&s.name),
            LeafPayload::LoadBalancer(s) => Some(&s.name),
            LeafPayload::Listener(_) => None,
            LeafPayload::LogSink(s) => Some(&s.name),
            LeafPayload::ImageRepository(s) => Some(&s.name),
            LeafPayload::ExecutionRole(s) => Some(&s.name),
            LeafPayload::Cluster(s) => Some(&s.name),
            LeafPayload::TaskTemplate(s) => Some(&s.family),
            LeafPayload::Service(s) => Some(&s.name),
        }
    }
}

/// A live leaf resource as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedLeaf {
    /// Provider-assigned identifier.
    pub provider_id: ProviderId,
    /// The observed state, in the same shape as desired payloads.
    pub payload: LeafPayload,
}
