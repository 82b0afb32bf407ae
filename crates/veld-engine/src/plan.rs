//! Provisioning plans
//!
//! A [`ProvisioningPlan`] lays out the ordered leaf-creation steps for one
//! service record and renders the payload for each step, threading
//! provider identifiers from completed steps into the payloads of later
//! ones. The order is fixed by [`LeafKind::ALL`]; the only variable part is
//! whether the managed image repository step is present.

use thiserror::Error;

use veld_provider::{
    AccessRuleSetSpec, ClusterSpec, ExecutionRoleSpec, ImageRepositorySpec, LeafKind, LeafPayload,
    ListenerSpec, LoadBalancerSpec, LogSinkSpec, NetworkBoundarySpec, ObservedLeaf, ProviderId,
    ResourceNamer, RoutingTargetSpec, ServiceSpec, TaskTemplateSpec,
};

use crate::record::ServiceRecord;

/// Address block for a composite's network boundary.
const DEFAULT_CIDR_BLOCK: &str = "10.0.0.0/16";

/// Health check path the routing target probes on backends.
const HEALTH_CHECK_PATH: &str = "/health";

/// Failure while rendering a step payload.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A step referenced the identifier of a step that has not completed.
    #[error("step {step} requires the identifier of {dependency}, which has not been provisioned")]
    MissingDependency {
        step: LeafKind,
        dependency: LeafKind,
    },

    /// The record has no external registry and no managed repository was
    /// provisioned, so there is no image to run.
    #[error("no image source for '{app_name}'")]
    MissingImageSource { app_name: String },
}

/// Leaves available to reference during one provisioning run, keyed by kind.
///
/// Besides identifiers this keeps the two provider-populated fields later
/// steps need: the managed repository's pull URI and the load balancer's
/// DNS name.
#[derive(Debug, Default)]
pub struct ProvisionedLeaves {
    ids: std::collections::BTreeMap<LeafKind, ProviderId>,
    repository_uri: Option<String>,
    load_balancer_dns: Option<String>,
}

impl ProvisionedLeaves {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a completed step, capturing provider-populated fields.
    pub fn insert(&mut self, observed: &ObservedLeaf) {
        match &observed.payload {
            LeafPayload::ImageRepository(spec) => {
                self.repository_uri = spec.repository_uri.clone();
            }
            LeafPayload::LoadBalancer(spec) => {
                self.load_balancer_dns = spec.dns_name.clone();
            }
            _ => {}
        }
        self.ids
            .insert(observed.payload.kind(), observed.provider_id.clone());
    }

    /// Records a leaf known only by identifier (an already-live leaf from a
    /// previous run).
    pub fn insert_id(&mut self, kind: LeafKind, provider_id: ProviderId) {
        self.ids.insert(kind, provider_id);
    }

    /// Identifier of a known leaf, when present.
    pub fn id(&self, kind: LeafKind) -> Option<&ProviderId> {
        self.ids.get(&kind)
    }

    /// Pull URI of the managed image repository, once known.
    pub fn repository_uri(&self) -> Option<&str> {
        self.repository_uri.as_deref()
    }

    /// DNS name of the load balancer, once known.
    pub fn load_balancer_dns(&self) -> Option<&str> {
        self.load_balancer_dns.as_deref()
    }

    fn require(&self, step: LeafKind, dependency: LeafKind) -> Result<ProviderId, PlanError> {
        self.id(dependency)
            .cloned()
            .ok_or(PlanError::MissingDependency { step, dependency })
    }
}

/// Ordered creation steps and payload rendering for one record.
#[derive(Debug)]
pub struct ProvisioningPlan<'a> {
    record: &'a ServiceRecord,
    namer: &'a ResourceNamer,
    steps: Vec<LeafKind>,
}

impl<'a> ProvisioningPlan<'a> {
    /// Builds the plan for a record.
    ///
    /// Records pointing at an external registry skip the managed image
    /// repository step.
    pub fn for_record(record: &'a ServiceRecord, namer: &'a ResourceNamer) -> Self {
        let steps = LeafKind::ALL
            .into_iter()
            .filter(|kind| {
                *kind != LeafKind::ImageRepository || record.needs_image_repository()
            })
            .collect();
        Self {
            record,
            namer,
            steps,
        }
    }

    /// The steps in creation order.
    pub fn steps(&self) -> &[LeafKind] {
        &self.steps
    }

    fn name(&self, kind: LeafKind) -> String {
        self.namer.leaf_name(kind, &self.record.app_name)
    }

    /// Renders the payload for one step, resolving references to leaves
    /// created by earlier steps.
    pub fn payload_for(
        &self,
        step: LeafKind,
        done: &ProvisionedLeaves,
    ) -> Result<LeafPayload, PlanError> {
        let record = self.record;
        let payload = match step {
            LeafKind::NetworkBoundary => LeafPayload::NetworkBoundary(NetworkBoundarySpec {
                name: self.name(step),
                cidr_block: DEFAULT_CIDR_BLOCK.to_string(),
            }),
            LeafKind::AccessRuleSet => LeafPayload::AccessRuleSet(AccessRuleSetSpec {
                name: self.name(step),
                ingress_port: record.app_port,
                boundary_id: Some(done.require(step, LeafKind::NetworkBoundary)?),
            }),
            LeafKind::RoutingTarget => LeafPayload::RoutingTarget(RoutingTargetSpec {
                name: self.name(step),
                port: record.app_port,
                health_check_path: HEALTH_CHECK_PATH.to_string(),
                boundary_id: Some(done.require(step, LeafKind::NetworkBoundary)?),
            }),
            LeafKind::LoadBalancer => LeafPayload::LoadBalancer(LoadBalancerSpec {
                name: self.name(step),
                boundary_id: Some(done.require(step, LeafKind::NetworkBoundary)?),
                access_rule_set_id: Some(done.require(step, LeafKind::AccessRuleSet)?),
                dns_name: None,
            }),
            LeafKind::Listener => LeafPayload::Listener(ListenerSpec {
                port: record.app_port,
                load_balancer_id: Some(done.require(step, LeafKind::LoadBalancer)?),
                routing_target_id: Some(done.require(step, LeafKind::RoutingTarget)?),
            }),
            LeafKind::LogSink => LeafPayload::LogSink(LogSinkSpec {
                name: self.name(step),
            }),
            LeafKind::ImageRepository => LeafPayload::ImageRepository(ImageRepositorySpec {
                name: self.name(step),
                repository_uri: None,
            }),
            LeafKind::ExecutionRole => LeafPayload::ExecutionRole(ExecutionRoleSpec {
                name: self.name(step),
            }),
            LeafKind::Cluster => LeafPayload::Cluster(ClusterSpec {
                name: self.name(step),
            }),
            LeafKind::TaskTemplate => {
                let image = record.image_ref(done.repository_uri()).ok_or_else(|| {
                    PlanError::MissingImageSource {
                        app_name: record.app_name.clone(),
                    }
                })?;
                LeafPayload::TaskTemplate(TaskTemplateSpec {
                    family: self.name(step),
                    container_name: record.app_name.clone(),
                    image,
                    port: record.app_port,
                    cpu_mem: record.cpu_mem,
                    log_sink_id: Some(done.require(step, LeafKind::LogSink)?),
                    execution_role_id: Some(done.require(step, LeafKind::ExecutionRole)?),
                })
            }
            LeafKind::Service => LeafPayload::Service(ServiceSpec {
                name: self.name(step),
                replicas: record.desired_count,
                port: record.app_port,
                assign_public_ip: record.public_ip,
                cluster_id: Some(done.require(step, LeafKind::Cluster)?),
                task_template_id: Some(done.require(step, LeafKind::TaskTemplate)?),
                routing_target_id: Some(done.require(step, LeafKind::RoutingTarget)?),
                access_rule_set_id: Some(done.require(step, LeafKind::AccessRuleSet)?),
            }),
        };
        Ok(payload)
    }
}
