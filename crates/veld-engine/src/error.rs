//! Engine error types

use std::fmt::{Display, Formatter};

use thiserror::Error;

use veld_provider::{LeafKind, ProviderError};

use crate::plan::PlanError;
use crate::record::RecordValidationError;
use crate::rollback::RollbackReport;

/// Error raised while provisioning a composite, carrying the outcome of the
/// compensating rollback that followed.
///
/// The display form appends the rollback outcome when the unwind could not
/// delete everything, so leaked resources are visible in the primary error
/// and not just in logs.
#[derive(Debug)]
pub struct ProvisionError {
    /// The step that failed.
    pub step: LeafKind,
    /// Why it failed.
    pub source: ProviderError,
    /// What the rollback managed to undo.
    pub rollback: RollbackReport,
}

impl Display for ProvisionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "provisioning failed at {}: {}", self.step, self.source)?;
        if !self.rollback.fully_unwound() {
            write!(f, "; {}", self.rollback)?;
        }
        Ok(())
    }
}

impl std::error::Error for ProvisionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Error that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Record store (database) error.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Provider call failed outside of a provisioning run.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Provisioning failed and was rolled back.
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// A step payload could not be rendered.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// A record failed validation.
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] RecordValidationError),

    /// The provider directory has no client for a required leaf kind.
    #[error("provider does not support leaf kind {kind}")]
    UnsupportedLeafKind { kind: LeafKind },

    /// Two observed service leaves resolve to the same logical name.
    #[error("conflicting composites: multiple services claim logical name '{logical_name}'")]
    AnchorConflict { logical_name: String },

    /// A module was registered twice.
    #[error("module '{name}' is already registered")]
    DuplicateModule { name: String },

    /// A module depends on a module that is not registered.
    #[error("module '{module}' depends on unknown module '{dependency}'")]
    UnknownDependency { module: String, dependency: String },

    /// Module dependencies form a cycle.
    #[error("module dependency cycle involving '{module}'")]
    DependencyCycle { module: String },

    /// The pass was cancelled before this operation ran.
    #[error("operation cancelled")]
    Cancelled,

    /// The engine builder is missing a required component.
    #[error("engine builder missing {component}")]
    BuilderIncomplete { component: &'static str },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollback::RollbackFailure;
    use veld_provider::ProviderId;

    #[test]
    fn test_provision_error_display_without_leaks() {
        let err = ProvisionError {
            step: LeafKind::Cluster,
            source: ProviderError::operation_failed("quota exceeded"),
            rollback: RollbackReport {
                attempted: 3,
                deleted: 3,
                failures: vec![],
            },
        };
        assert_eq!(
            err.to_string(),
            "provisioning failed at cluster: operation failed: quota exceeded"
        );
    }

    #[test]
    fn test_provision_error_display_appends_leaks() {
        let err = ProvisionError {
            step: LeafKind::Service,
            source: ProviderError::operation_failed("boom"),
            rollback: RollbackReport {
                attempted: 2,
                deleted: 1,
                failures: vec![RollbackFailure {
                    kind: LeafKind::LoadBalancer,
                    provider_id: ProviderId::new("lb-1"),
                    error: ProviderError::DependencyViolation {
                        message: "listener attached".into(),
                    },
                }],
            },
        };
        let text = err.to_string();
        assert!(text.starts_with("provisioning failed at service: operation failed: boom;"));
        assert!(text.contains("could not roll back all created leaves"));
        assert!(text.contains("lb-1"));
    }
}
