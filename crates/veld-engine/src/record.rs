//! Composite service records
//!
//! A [`ServiceRecord`] is the engine's unit of desired state: one
//! containerized application with a public port, a replica count, and an
//! image source, backed on the provider side by a fixed set of leaf
//! resources. Records are validated and normalized at construction through
//! [`ServiceRecordDraft`], so every `ServiceRecord` in the system is
//! well-formed by the time anything else touches it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use veld_core::{Record, RecordMapper, UpdateKind};
use veld_provider::{CpuMem, ImageRef, LeafKind, ProviderId};

/// Validation failure while building a [`ServiceRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordValidationError {
    #[error("app name must not be empty")]
    EmptyAppName,

    #[error("app name '{0}' contains invalid characters (expected [a-z0-9-])")]
    InvalidAppName(String),

    #[error("app port must be non-zero")]
    ZeroPort,

    #[error("desired count must be at least 1")]
    ZeroDesiredCount,
}

/// Unvalidated input for a service record.
///
/// Optional fields fall back to defaults during [`build`](Self::build):
/// one replica, `vCPU2-8GB`, private placement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceRecordDraft {
    pub app_name: String,
    pub app_port: u16,
    pub desired_count: Option<u32>,
    pub cpu_mem: Option<CpuMem>,
    pub repository_uri: Option<String>,
    pub image_tag: Option<String>,
    pub image_digest: Option<String>,
    pub public_ip: Option<bool>,
}

impl ServiceRecordDraft {
    /// Validates and normalizes the draft into a record.
    ///
    /// The app name is trimmed and lowercased before validation, so
    /// `"Orders "` and `"orders"` denote the same composite.
    pub fn build(self) -> Result<ServiceRecord, RecordValidationError> {
        let app_name = self.app_name.trim().to_lowercase();
        if app_name.is_empty() {
            return Err(RecordValidationError::EmptyAppName);
        }
        if !app_name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(RecordValidationError::InvalidAppName(app_name));
        }
        if self.app_port == 0 {
            return Err(RecordValidationError::ZeroPort);
        }
        let desired_count = self.desired_count.unwrap_or(1);
        if desired_count == 0 {
            return Err(RecordValidationError::ZeroDesiredCount);
        }

        Ok(ServiceRecord {
            app_name,
            app_port: self.app_port,
            desired_count,
            cpu_mem: self.cpu_mem.unwrap_or(CpuMem::Cpu2Mem8),
            repository_uri: self.repository_uri,
            image_tag: self.image_tag,
            image_digest: self.image_digest,
            public_ip: self.public_ip.unwrap_or(false),
            load_balancer_dns: None,
            provider_ids: BTreeMap::new(),
        })
    }
}

/// One containerized application managed as a composite of leaf resources.
///
/// The first block of fields is user-controlled and participates in
/// equality. `load_balancer_dns` and `provider_ids` are populated by the
/// engine as leaves come alive and never cause a record to be seen as
/// changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub app_name: String,
    pub app_port: u16,
    pub desired_count: u32,
    pub cpu_mem: CpuMem,
    /// External image location. When unset, the composite gets its own
    /// managed image repository.
    pub repository_uri: Option<String>,
    pub image_tag: Option<String>,
    pub image_digest: Option<String>,
    pub public_ip: bool,

    /// DNS name of the composite's load balancer, once it exists.
    pub load_balancer_dns: Option<String>,
    /// Provider identifiers of the leaves backing this record.
    #[serde(default)]
    pub provider_ids: BTreeMap<LeafKind, ProviderId>,
}

impl ServiceRecord {
    /// Whether the composite needs a managed image repository.
    ///
    /// A record pointing at an external registry skips that leaf entirely.
    pub fn needs_image_repository(&self) -> bool {
        self.repository_uri.is_none()
    }

    /// The image reference the task template should run.
    ///
    /// Records without an external registry URI use the managed
    /// repository's pull URI, which only exists after that leaf is created.
    pub fn image_ref(&self, managed_repository_uri: Option<&str>) -> Option<ImageRef> {
        let uri = self
            .repository_uri
            .as_deref()
            .or(managed_repository_uri)?
            .to_string();
        Some(ImageRef {
            uri,
            tag: self.image_tag.clone(),
            digest: self.image_digest.clone(),
        })
    }

    /// Provider identifier of one backing leaf, when known.
    pub fn provider_id(&self, kind: LeafKind) -> Option<&ProviderId> {
        self.provider_ids.get(&kind)
    }
}

impl Record for ServiceRecord {
    fn entity_id(&self) -> String {
        self.app_name.clone()
    }
}

/// Comparison and change classification for [`ServiceRecord`]s.
///
/// A port or placement change forces recreating the composite (half its
/// leaves bake the port or the public-IP flag in at creation time); any
/// other divergence is absorbed by registering a new task template and
/// pointing the running service at it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceMapper;

impl RecordMapper for ServiceMapper {
    type Item = ServiceRecord;

    fn equals(&self, desired: &ServiceRecord, observed: &ServiceRecord) -> bool {
        desired.app_port == observed.app_port
            && desired.desired_count == observed.desired_count
            && desired.cpu_mem == observed.cpu_mem
            && desired.repository_uri == observed.repository_uri
            && desired.image_tag == observed.image_tag
            && desired.image_digest == observed.image_digest
            && desired.public_ip == observed.public_ip
    }

    fn update_or_replace(&self, desired: &ServiceRecord, observed: &ServiceRecord) -> UpdateKind {
        if desired.app_port != observed.app_port || desired.public_ip != observed.public_ip {
            UpdateKind::Replace
        } else {
            UpdateKind::Update
        }
    }
}
