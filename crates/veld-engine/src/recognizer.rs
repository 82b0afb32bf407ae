//! Composite recognition
//!
//! The provider only knows individual leaf resources. The recognizer
//! rebuilds the observed set of composites from raw listings: leaves whose
//! names follow the engine's naming scheme are grouped by logical name,
//! each group is validated against the shape a managed composite must have,
//! and every valid group becomes one observed [`ServiceRecord`].
//!
//! Recognition is strict. A group missing leaves, carrying extras, or
//! internally inconsistent (mismatched ports, a service pointing at a task
//! template outside the group) is excluded from the observed set rather
//! than reported as a half-broken record. The one hard error is two
//! service leaves claiming the same logical name, which no amount of
//! waiting will fix.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use veld_provider::{
    CircuitBreakerSet, LeafKind, LeafPayload, ObservedLeaf, ProviderDirectory, ProviderId,
    ResourceNamer, RetryExecutor,
};

use crate::error::{EngineError, EngineResult};
use crate::record::ServiceRecord;

/// One logical name's worth of leaves, before validation.
#[derive(Debug, Default)]
struct CandidateGroup {
    leaves: BTreeMap<LeafKind, Vec<ObservedLeaf>>,
}

impl CandidateGroup {
    fn push(&mut self, leaf: ObservedLeaf) {
        self.leaves.entry(leaf.payload.kind()).or_default().push(leaf);
    }

    fn count(&self, kind: LeafKind) -> usize {
        self.leaves.get(&kind).map_or(0, Vec::len)
    }

    fn single(&self, kind: LeafKind) -> Option<&ObservedLeaf> {
        match self.leaves.get(&kind) {
            Some(leaves) if leaves.len() == 1 => leaves.first(),
            _ => None,
        }
    }
}

/// Rebuilds observed composites from provider listings.
pub struct CompositeRecognizer {
    directory: Arc<dyn ProviderDirectory>,
    namer: ResourceNamer,
    retry: RetryExecutor,
    breakers: Arc<CircuitBreakerSet>,
}

impl CompositeRecognizer {
    pub fn new(
        directory: Arc<dyn ProviderDirectory>,
        namer: ResourceNamer,
        retry: RetryExecutor,
        breakers: Arc<CircuitBreakerSet>,
    ) -> Self {
        Self {
            directory,
            namer,
            retry,
            breakers,
        }
    }

    /// Lists every supported leaf kind and returns the valid composites,
    /// sorted by logical name.
    pub async fn observe(&self) -> EngineResult<Vec<ServiceRecord>> {
        let mut groups: BTreeMap<String, CandidateGroup> = BTreeMap::new();
        let mut unnamed_listeners: Vec<ObservedLeaf> = Vec::new();

        for kind in LeafKind::ALL {
            let Some(client) = self.directory.client(kind) else {
                continue;
            };
            let leaves = self
                .retry
                .execute_with_circuit_breaker(self.breakers.breaker(kind), || client.list())
                .await?;

            for leaf in leaves {
                match leaf.payload.name() {
                    Some(name) => {
                        if let Some(logical) = self.namer.parse_logical(kind, name) {
                            groups.entry(logical.to_string()).or_default().push(leaf);
                        }
                    }
                    // Listeners carry no name; they are attached to a group
                    // through their load balancer below.
                    None => unnamed_listeners.push(leaf),
                }
            }
        }

        self.attach_listeners(&mut groups, unnamed_listeners);

        // Duplicate anchors are a conflict, not a partial composite: two
        // services cannot both be "the" composite for one logical name.
        for (logical, group) in &groups {
            if group.count(LeafKind::Service) > 1 {
                return Err(EngineError::AnchorConflict {
                    logical_name: logical.clone(),
                });
            }
        }

        let mut observed = Vec::new();
        for (logical, group) in groups {
            if group.count(LeafKind::Service) == 0 {
                debug!(logical_name = %logical, "Skipping group without a service anchor");
                continue;
            }
            match self.assemble(&logical, &group) {
                Some(record) => observed.push(record),
                None => {
                    warn!(
                        logical_name = %logical,
                        "Excluding inconsistent composite from observed set"
                    );
                }
            }
        }

        Ok(observed)
    }

    /// Attaches nameless listeners to the group owning their load balancer.
    fn attach_listeners(
        &self,
        groups: &mut BTreeMap<String, CandidateGroup>,
        listeners: Vec<ObservedLeaf>,
    ) {
        let mut lb_to_logical: BTreeMap<ProviderId, String> = BTreeMap::new();
        for (logical, group) in groups.iter() {
            if let Some(leaves) = group.leaves.get(&LeafKind::LoadBalancer) {
                for lb in leaves {
                    lb_to_logical.insert(lb.provider_id.clone(), logical.clone());
                }
            }
        }

        for listener in listeners {
            let LeafPayload::Listener(spec) = &listener.payload else {
                continue;
            };
            let Some(logical) = spec
                .load_balancer_id
                .as_ref()
                .and_then(|id| lb_to_logical.get(id))
            else {
                continue;
            };
            if let Some(group) = groups.get_mut(logical.as_str()) {
                group.push(listener);
            }
        }
    }

    /// Validates one anchored group and assembles its observed record.
    /// Returns `None` when the group is not a well-formed composite.
    fn assemble(&self, logical: &str, group: &CandidateGroup) -> Option<ServiceRecord> {
        // Exactly one of every required kind; the image repository is the
        // only optional leaf.
        for kind in LeafKind::ALL {
            let required = kind != LeafKind::ImageRepository && self.directory.client(kind).is_some();
            if required && group.count(kind) != 1 {
                return None;
            }
        }
        if group.count(LeafKind::ImageRepository) > 1 {
            return None;
        }

        let service_leaf = group.single(LeafKind::Service)?;
        let LeafPayload::Service(service) = &service_leaf.payload else {
            return None;
        };
        let task_leaf = group.single(LeafKind::TaskTemplate)?;
        let LeafPayload::TaskTemplate(task) = &task_leaf.payload else {
            return None;
        };
        let listener = group.single(LeafKind::Listener).and_then(|l| match &l.payload {
            LeafPayload::Listener(s) => Some(s),
            _ => None,
        });

        // Port consistency across every leaf that bakes the port in.
        let ports_agree = [
            group.single(LeafKind::AccessRuleSet).and_then(|l| match &l.payload {
                LeafPayload::AccessRuleSet(s) => Some(s.ingress_port),
                _ => None,
            }),
            group.single(LeafKind::RoutingTarget).and_then(|l| match &l.payload {
                LeafPayload::RoutingTarget(s) => Some(s.port),
                _ => None,
            }),
            listener.map(|s| s.port),
            Some(task.port),
        ]
        .into_iter()
        .all(|port| port == Some(service.port));
        if !ports_agree {
            return None;
        }

        // Every inter-leaf reference must resolve inside the group. A leaf
        // pointing at another composite's (or a hand-made) resource means
        // the group is only partially owned, and adopting it would put
        // foreign resources under this engine's lifecycle.
        let single_id = |kind: LeafKind| group.single(kind).map(|l| &l.provider_id);
        let refs_agree = service.task_template_id.as_ref() == Some(&task_leaf.provider_id)
            && service.cluster_id.as_ref() == single_id(LeafKind::Cluster)
            && service.routing_target_id.as_ref() == single_id(LeafKind::RoutingTarget)
            && service.access_rule_set_id.as_ref() == single_id(LeafKind::AccessRuleSet)
            && task.execution_role_id.as_ref() == single_id(LeafKind::ExecutionRole)
            && listener.map_or(true, |s| {
                s.load_balancer_id.as_ref() == single_id(LeafKind::LoadBalancer)
                    && s.routing_target_id.as_ref() == single_id(LeafKind::RoutingTarget)
            });
        if !refs_agree {
            return None;
        }

        // Decide whether the image comes from the group's own repository or
        // an external registry.
        let managed_uri = group.single(LeafKind::ImageRepository).and_then(|l| {
            match &l.payload {
                LeafPayload::ImageRepository(s) => s.repository_uri.clone(),
                _ => None,
            }
        });
        let repository_uri = if managed_uri.as_deref() == Some(task.image.uri.as_str()) {
            None
        } else {
            Some(task.image.uri.clone())
        };

        let load_balancer_dns = group.single(LeafKind::LoadBalancer).and_then(|l| {
            match &l.payload {
                LeafPayload::LoadBalancer(s) => s.dns_name.clone(),
                _ => None,
            }
        });

        let mut provider_ids = BTreeMap::new();
        for (kind, leaves) in &group.leaves {
            if let [leaf] = leaves.as_slice() {
                provider_ids.insert(*kind, leaf.provider_id.clone());
            }
        }

        Some(ServiceRecord {
            app_name: logical.to_string(),
            app_port: service.port,
            desired_count: service.replicas,
            cpu_mem: task.cpu_mem,
            repository_uri,
            image_tag: task.image.tag.clone(),
            image_digest: task.image.digest.clone(),
            public_ip: service.assign_public_ip,
            load_balancer_dns,
            provider_ids,
        })
    }
}
