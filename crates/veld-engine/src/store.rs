//! Record stores
//!
//! The desired set lives in a [`RecordStore`]. The engine ships two
//! implementations: an in-memory store for tests and embedding, and a
//! Postgres-backed store for durable deployments.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::record::ServiceRecord;

/// Durable home of the desired record set.
///
/// The engine also writes provider identifiers back through the store as
/// leaves come alive, so a crash mid-provisioning leaves enough state to
/// recognize and finish (or tear down) the partial composite on the next
/// pass.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All desired records.
    async fn list(&self) -> EngineResult<Vec<ServiceRecord>>;

    /// One record by entity id.
    async fn get(&self, app_name: &str) -> EngineResult<Option<ServiceRecord>>;

    /// Inserts or fully replaces a record.
    async fn upsert(&self, record: &ServiceRecord) -> EngineResult<()>;

    /// Removes a record. Returns whether a record existed.
    async fn delete(&self, app_name: &str) -> EngineResult<bool>;
}

/// In-memory record store.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<String, ServiceRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn list(&self) -> EngineResult<Vec<ServiceRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn get(&self, app_name: &str) -> EngineResult<Option<ServiceRecord>> {
        Ok(self.records.read().await.get(app_name).cloned())
    }

    async fn upsert(&self, record: &ServiceRecord) -> EngineResult<()> {
        self.records
            .write()
            .await
            .insert(record.app_name.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, app_name: &str) -> EngineResult<bool> {
        Ok(self.records.write().await.remove(app_name).is_some())
    }
}

/// Postgres-backed record store.
///
/// Expects a `service_records` table:
///
/// ```sql
/// CREATE TABLE service_records (
///     app_name          TEXT PRIMARY KEY,
///     app_port          INTEGER NOT NULL,
///     desired_count     INTEGER NOT NULL,
///     cpu_mem           TEXT NOT NULL,
///     repository_uri    TEXT,
///     image_tag         TEXT,
///     image_digest      TEXT,
///     public_ip         BOOLEAN NOT NULL,
///     load_balancer_dns TEXT,
///     provider_ids      JSONB NOT NULL DEFAULT '{}',
///     updated_at        TIMESTAMPTZ NOT NULL
/// );
/// ```
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ServiceRecordRow {
    app_name: String,
    app_port: i32,
    desired_count: i32,
    cpu_mem: String,
    repository_uri: Option<String>,
    image_tag: Option<String>,
    image_digest: Option<String>,
    public_ip: bool,
    load_balancer_dns: Option<String>,
    provider_ids: serde_json::Value,
}

impl ServiceRecordRow {
    fn into_record(self) -> EngineResult<ServiceRecord> {
        let app_port = u16::try_from(self.app_port)
            .map_err(|_| decode_error(format!("app_port {} out of range", self.app_port)))?;
        let desired_count = u32::try_from(self.desired_count).map_err(|_| {
            decode_error(format!("desired_count {} out of range", self.desired_count))
        })?;
        let cpu_mem = serde_json::from_value(serde_json::Value::String(self.cpu_mem))?;
        let provider_ids = serde_json::from_value(self.provider_ids)?;

        Ok(ServiceRecord {
            app_name: self.app_name,
            app_port,
            desired_count,
            cpu_mem,
            repository_uri: self.repository_uri,
            image_tag: self.image_tag,
            image_digest: self.image_digest,
            public_ip: self.public_ip,
            load_balancer_dns: self.load_balancer_dns,
            provider_ids,
        })
    }
}

fn decode_error(message: String) -> EngineError {
    EngineError::Store(sqlx::Error::Decode(message.into()))
}

fn encode_error(message: String) -> EngineError {
    EngineError::Store(sqlx::Error::Encode(message.into()))
}

fn cpu_mem_text(record: &ServiceRecord) -> EngineResult<String> {
    match serde_json::to_value(record.cpu_mem)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(encode_error(format!("unexpected cpu_mem encoding: {other}"))),
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn list(&self) -> EngineResult<Vec<ServiceRecord>> {
        let rows: Vec<ServiceRecordRow> = sqlx::query_as(
            r"
            SELECT app_name, app_port, desired_count, cpu_mem, repository_uri,
                   image_tag, image_digest, public_ip, load_balancer_dns, provider_ids
            FROM service_records
            ORDER BY app_name
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ServiceRecordRow::into_record).collect()
    }

    async fn get(&self, app_name: &str) -> EngineResult<Option<ServiceRecord>> {
        let row: Option<ServiceRecordRow> = sqlx::query_as(
            r"
            SELECT app_name, app_port, desired_count, cpu_mem, repository_uri,
                   image_tag, image_digest, public_ip, load_balancer_dns, provider_ids
            FROM service_records
            WHERE app_name = $1
            ",
        )
        .bind(app_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ServiceRecordRow::into_record).transpose()
    }

    async fn upsert(&self, record: &ServiceRecord) -> EngineResult<()> {
        sqlx::query(
            r"
            INSERT INTO service_records (
                app_name, app_port, desired_count, cpu_mem, repository_uri,
                image_tag, image_digest, public_ip, load_balancer_dns,
                provider_ids, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (app_name) DO UPDATE SET
                app_port = EXCLUDED.app_port,
                desired_count = EXCLUDED.desired_count,
                cpu_mem = EXCLUDED.cpu_mem,
                repository_uri = EXCLUDED.repository_uri,
                image_tag = EXCLUDED.image_tag,
                image_digest = EXCLUDED.image_digest,
                public_ip = EXCLUDED.public_ip,
                load_balancer_dns = EXCLUDED.load_balancer_dns,
                provider_ids = EXCLUDED.provider_ids,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(&record.app_name)
        .bind(i32::from(record.app_port))
        .bind(
            i32::try_from(record.desired_count)
                .map_err(|_| encode_error("desired_count out of range".into()))?,
        )
        .bind(cpu_mem_text(record)?)
        .bind(&record.repository_uri)
        .bind(&record.image_tag)
        .bind(&record.image_digest)
        .bind(record.public_ip)
        .bind(&record.load_balancer_dns)
        .bind(serde_json::to_value(&record.provider_ids)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, app_name: &str) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM service_records WHERE app_name = $1")
            .bind(app_name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ServiceRecordDraft;
    use veld_provider::{LeafKind, ProviderId};

    fn record(name: &str) -> ServiceRecord {
        ServiceRecordDraft {
            app_name: name.into(),
            app_port: 8080,
            ..Default::default()
        }
        .build()
        .unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemoryRecordStore::new();

        assert!(store.list().await.unwrap().is_empty());

        store.upsert(&record("orders")).await.unwrap();
        store.upsert(&record("billing")).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
        // List order follows entity id.
        assert_eq!(all[0].app_name, "billing");

        let fetched = store.get("orders").await.unwrap().unwrap();
        assert_eq!(fetched.app_port, 8080);

        assert!(store.delete("orders").await.unwrap());
        assert!(!store.delete("orders").await.unwrap());
        assert!(store.get("orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_upsert_replaces() {
        let store = MemoryRecordStore::new();
        store.upsert(&record("orders")).await.unwrap();

        let mut updated = record("orders");
        updated.desired_count = 3;
        updated
            .provider_ids
            .insert(LeafKind::Cluster, ProviderId::new("cluster-1"));
        store.upsert(&updated).await.unwrap();

        let fetched = store.get("orders").await.unwrap().unwrap();
        assert_eq!(fetched.desired_count, 3);
        assert_eq!(
            fetched.provider_id(LeafKind::Cluster),
            Some(&ProviderId::new("cluster-1"))
        );
    }

    #[test]
    fn test_out_of_range_count_is_an_encode_error() {
        // Conversion guard used when binding desired_count on the upsert path.
        let err = i32::try_from(u32::MAX)
            .map_err(|_| encode_error("desired_count out of range".into()))
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(sqlx::Error::Encode(_))));
    }

    #[test]
    fn test_row_conversion_rejects_bad_port() {
        let row = ServiceRecordRow {
            app_name: "orders".into(),
            app_port: 70000,
            desired_count: 1,
            cpu_mem: "vCPU2-8GB".into(),
            repository_uri: None,
            image_tag: None,
            image_digest: None,
            public_ip: false,
            load_balancer_dns: None,
            provider_ids: serde_json::json!({}),
        };
        assert!(row.into_record().is_err());
    }

    #[test]
    fn test_row_conversion_roundtrip() {
        let row = ServiceRecordRow {
            app_name: "orders".into(),
            app_port: 8080,
            desired_count: 2,
            cpu_mem: "vCPU1-2GB".into(),
            repository_uri: Some("registry.example.com/orders".into()),
            image_tag: Some("v2".into()),
            image_digest: None,
            public_ip: true,
            load_balancer_dns: Some("orders.lb.example.com".into()),
            provider_ids: serde_json::json!({ "cluster": "cluster-1" }),
        };
        let record = row.into_record().unwrap();
        assert_eq!(record.desired_count, 2);
        assert!(record.public_ip);
        assert_eq!(
            record.provider_id(LeafKind::Cluster),
            Some(&ProviderId::new("cluster-1"))
        );
    }
}
