//! Compensating rollback
//!
//! When provisioning fails midway, every leaf created so far is torn down
//! in reverse creation order. The unwind is best-effort: a failed delete is
//! recorded and the unwind moves on to the next leaf, so one stuck resource
//! does not strand everything created before it.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use tracing::{info, warn};

use veld_provider::{LeafKind, ProviderDirectory, ProviderError, ProviderId, RetryExecutor};

/// One created leaf, as remembered for potential rollback.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub kind: LeafKind,
    pub provider_id: ProviderId,
}

/// Creation-ordered log of leaves created during one provisioning run.
#[derive(Debug, Default)]
pub struct RollbackLedger {
    entries: Vec<LedgerEntry>,
}

impl RollbackLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a created leaf. Must be called in creation order.
    pub fn push(&mut self, kind: LeafKind, provider_id: ProviderId) {
        self.entries.push(LedgerEntry { kind, provider_id });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries in reverse creation order, the order they must be deleted in.
    pub fn unwind_order(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter().rev()
    }
}

/// A delete that failed during rollback.
#[derive(Debug)]
pub struct RollbackFailure {
    pub kind: LeafKind,
    pub provider_id: ProviderId,
    pub error: ProviderError,
}

/// Outcome of one rollback run.
#[derive(Debug, Default)]
pub struct RollbackReport {
    /// Leaves the unwind attempted to delete.
    pub attempted: usize,
    /// Leaves confirmed gone (deleted, or already absent).
    pub deleted: usize,
    /// Deletes that failed; these leaves may still exist on the provider.
    pub failures: Vec<RollbackFailure>,
}

impl RollbackReport {
    /// True when every created leaf is confirmed gone.
    pub fn fully_unwound(&self) -> bool {
        self.failures.is_empty()
    }
}

impl Display for RollbackReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.fully_unwound() {
            write!(f, "rolled back {} of {} leaves", self.deleted, self.attempted)
        } else {
            write!(
                f,
                "could not roll back all created leaves ({} of {} deleted):",
                self.deleted, self.attempted
            )?;
            for failure in &self.failures {
                write!(
                    f,
                    " [{} {}: {}]",
                    failure.kind, failure.provider_id, failure.error
                )?;
            }
            Ok(())
        }
    }
}

/// Tears down created leaves in reverse order.
pub struct RollbackCoordinator {
    directory: Arc<dyn ProviderDirectory>,
    retry: RetryExecutor,
}

impl RollbackCoordinator {
    pub fn new(directory: Arc<dyn ProviderDirectory>, retry: RetryExecutor) -> Self {
        Self { directory, retry }
    }

    /// Deletes every ledger entry in reverse creation order.
    ///
    /// Never returns an error: failures are collected in the report so the
    /// caller can attach them to the primary provisioning error. A leaf the
    /// provider no longer knows counts as deleted.
    pub async fn unwind(&self, ledger: &RollbackLedger) -> RollbackReport {
        let mut report = RollbackReport {
            attempted: ledger.len(),
            ..Default::default()
        };

        for entry in ledger.unwind_order() {
            let Some(client) = self.directory.client(entry.kind) else {
                report.failures.push(RollbackFailure {
                    kind: entry.kind,
                    provider_id: entry.provider_id.clone(),
                    error: ProviderError::internal(format!(
                        "no client for {} during rollback",
                        entry.kind
                    )),
                });
                continue;
            };

            let result = self
                .retry
                .execute(|| client.delete(&entry.provider_id))
                .await;

            match result {
                Ok(()) | Err(ProviderError::NotFound { .. }) => {
                    report.deleted += 1;
                }
                Err(error) => {
                    warn!(
                        kind = %entry.kind,
                        provider_id = %entry.provider_id,
                        error = %error,
                        "Rollback delete failed, continuing with remaining leaves"
                    );
                    report.failures.push(RollbackFailure {
                        kind: entry.kind,
                        provider_id: entry.provider_id.clone(),
                        error,
                    });
                }
            }
        }

        info!(
            attempted = report.attempted,
            deleted = report.deleted,
            failed = report.failures.len(),
            "Rollback finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use veld_provider::{
        CreateLeaf, DeleteLeaf, LeafClient, LeafPayload, ObservedLeaf, ProviderResult, ReadLeaf,
        UpdateLeaf,
    };

    /// Client that records delete calls and fails for configured ids.
    struct RecordingClient {
        deletes: Arc<Mutex<Vec<String>>>,
        fail_ids: Vec<String>,
        missing_ids: Vec<String>,
    }

    #[async_trait]
    impl CreateLeaf for RecordingClient {
        async fn create(&self, _payload: &LeafPayload) -> ProviderResult<ObservedLeaf> {
            unimplemented!("not used in rollback tests")
        }
    }

    #[async_trait]
    impl ReadLeaf for RecordingClient {
        async fn read(&self, _id: &ProviderId) -> ProviderResult<Option<ObservedLeaf>> {
            Ok(None)
        }
        async fn list(&self) -> ProviderResult<Vec<ObservedLeaf>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl UpdateLeaf for RecordingClient {
        async fn update(
            &self,
            _id: &ProviderId,
            _payload: &LeafPayload,
        ) -> ProviderResult<ObservedLeaf> {
            unimplemented!("not used in rollback tests")
        }
    }

    #[async_trait]
    impl DeleteLeaf for RecordingClient {
        async fn delete(&self, id: &ProviderId) -> ProviderResult<()> {
            self.deletes.lock().unwrap().push(id.to_string());
            if self.fail_ids.iter().any(|f| f == id.as_str()) {
                return Err(ProviderError::DependencyViolation {
                    message: "still referenced".into(),
                });
            }
            if self.missing_ids.iter().any(|m| m == id.as_str()) {
                return Err(ProviderError::not_found(id.to_string()));
            }
            Ok(())
        }
    }

    struct SingleClientDirectory {
        client: Arc<dyn LeafClient>,
    }

    impl ProviderDirectory for SingleClientDirectory {
        fn client(&self, _kind: LeafKind) -> Option<Arc<dyn LeafClient>> {
            Some(Arc::clone(&self.client))
        }
    }

    fn setup(
        fail_ids: Vec<String>,
        missing_ids: Vec<String>,
    ) -> (RollbackCoordinator, Arc<Mutex<Vec<String>>>) {
        let deletes = Arc::new(Mutex::new(Vec::new()));
        let client = Arc::new(RecordingClient {
            deletes: Arc::clone(&deletes),
            fail_ids,
            missing_ids,
        });
        let directory = Arc::new(SingleClientDirectory { client });
        (
            RollbackCoordinator::new(directory, RetryExecutor::with_defaults()),
            deletes,
        )
    }

    fn ledger() -> RollbackLedger {
        let mut ledger = RollbackLedger::new();
        ledger.push(LeafKind::NetworkBoundary, ProviderId::new("net-1"));
        ledger.push(LeafKind::AccessRuleSet, ProviderId::new("rules-1"));
        ledger.push(LeafKind::Cluster, ProviderId::new("cluster-1"));
        ledger
    }

    #[tokio::test]
    async fn test_unwind_deletes_in_reverse_order() {
        let (coordinator, deletes) = setup(vec![], vec![]);

        let report = coordinator.unwind(&ledger()).await;

        assert!(report.fully_unwound());
        assert_eq!(report.deleted, 3);
        assert_eq!(
            deletes.lock().unwrap().as_slice(),
            &["cluster-1", "rules-1", "net-1"]
        );
    }

    #[tokio::test]
    async fn test_unwind_continues_past_failures() {
        let (coordinator, deletes) = setup(vec!["rules-1".into()], vec![]);

        let report = coordinator.unwind(&ledger()).await;

        assert!(!report.fully_unwound());
        assert_eq!(report.deleted, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, LeafKind::AccessRuleSet);
        // The failure in the middle did not stop the earlier leaf's delete.
        assert_eq!(
            deletes.lock().unwrap().as_slice(),
            &["cluster-1", "rules-1", "net-1"]
        );
    }

    #[tokio::test]
    async fn test_unwind_treats_missing_as_deleted() {
        let (coordinator, _) = setup(vec![], vec!["cluster-1".into()]);

        let report = coordinator.unwind(&ledger()).await;

        assert!(report.fully_unwound());
        assert_eq!(report.deleted, 3);
    }

    #[test]
    fn test_report_display_lists_failures() {
        let report = RollbackReport {
            attempted: 2,
            deleted: 1,
            failures: vec![RollbackFailure {
                kind: LeafKind::Cluster,
                provider_id: ProviderId::new("cluster-1"),
                error: ProviderError::DependencyViolation {
                    message: "still referenced".into(),
                },
            }],
        };
        let text = report.to_string();
        assert!(text.contains("could not roll back all created leaves"));
        assert!(text.contains("cluster-1"));
    }
}
