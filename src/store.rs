//! Profile and report persistence
//!
//! Keyed upsert/select by external user key on two records: profile
//! fields and report history. Uses Postgres when configured and falls
//! back to in-memory storage for development.

use crate::error::AdvisoryError;
use crate::Result;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// One persisted advisory report.
#[derive(Debug, Clone)]
pub struct ReportRecord {
    pub topic: String,
    pub report: String,
    pub created_at: DateTime<Utc>,
}

/// Trait for profile/report persistence
#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    async fn load_profile(&self, user_id: &str) -> Result<Map<String, Value>>;
    async fn save_profile(&self, user_id: &str, profile: &Map<String, Value>) -> Result<()>;
    async fn save_report(&self, user_id: &str, topic: &str, report: &str) -> Result<()>;
    async fn list_reports(&self, user_id: &str) -> Result<Vec<ReportRecord>>;
}

enum StoreBackend {
    InMemory {
        profiles: Arc<RwLock<HashMap<String, Map<String, Value>>>>,
        reports: Arc<RwLock<HashMap<String, Vec<ReportRecord>>>>,
    },
    Postgres {
        pool: PgPool,
        schema_ready: Arc<OnceCell<()>>,
    },
}

/// Store for user profiles and report history.
pub struct AdvisoryStore {
    backend: StoreBackend,
}

impl AdvisoryStore {
    /// Build from environment: Postgres when `POSTGRES_URL`/`DATABASE_URL`
    /// is set and the pool initializes, in-memory otherwise.
    pub fn from_env() -> Self {
        let database_url = env::var("POSTGRES_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok();

        if let Some(url) = database_url {
            match sqlx::postgres::PgPoolOptions::new()
                .max_connections(5)
                .connect_lazy(&url)
            {
                Ok(pool) => {
                    info!("Advisory store backend: postgres");
                    return Self {
                        backend: StoreBackend::Postgres {
                            pool,
                            schema_ready: Arc::new(OnceCell::new()),
                        },
                    };
                }
                Err(error) => {
                    warn!(
                        "Failed to initialize postgres store, falling back to in-memory: {}",
                        error
                    );
                }
            }
        }

        info!("Advisory store backend: in-memory");
        Self::in_memory()
    }

    pub fn in_memory() -> Self {
        Self {
            backend: StoreBackend::InMemory {
                profiles: Arc::new(RwLock::new(HashMap::new())),
                reports: Arc::new(RwLock::new(HashMap::new())),
            },
        }
    }

    async fn ensure_schema_if_needed(&self) -> Result<()> {
        let StoreBackend::Postgres { pool, schema_ready } = &self.backend else {
            return Ok(());
        };

        schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS user_profiles (
                      external_user_key TEXT PRIMARY KEY,
                      profile JSONB NOT NULL DEFAULT '{}'::jsonb,
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS advisory_reports (
                      report_id UUID PRIMARY KEY,
                      external_user_key TEXT NOT NULL,
                      topic TEXT NOT NULL,
                      report TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_advisory_reports_user_time
                    ON advisory_reports (external_user_key, created_at);
                    "#,
                )
                .execute(pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                AdvisoryError::StoreError(format!("Failed to initialize store schema: {}", e))
            })?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl ProfileStore for AdvisoryStore {
    async fn load_profile(&self, user_id: &str) -> Result<Map<String, Value>> {
        match &self.backend {
            StoreBackend::InMemory { profiles, .. } => {
                let locked = profiles.read().await;
                Ok(locked.get(user_id).cloned().unwrap_or_default())
            }
            StoreBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;

                let row = sqlx::query(
                    "SELECT profile FROM user_profiles WHERE external_user_key = $1",
                )
                .bind(user_id)
                .fetch_optional(pool)
                .await
                .map_err(|e| {
                    AdvisoryError::StoreError(format!("Failed to load profile: {}", e))
                })?;

                let Some(row) = row else {
                    return Ok(Map::new());
                };

                let value: Value = row.try_get("profile").map_err(|e| {
                    AdvisoryError::StoreError(format!("Malformed profile row: {}", e))
                })?;

                Ok(value.as_object().cloned().unwrap_or_default())
            }
        }
    }

    async fn save_profile(&self, user_id: &str, profile: &Map<String, Value>) -> Result<()> {
        match &self.backend {
            StoreBackend::InMemory { profiles, .. } => {
                let mut locked = profiles.write().await;
                locked.insert(user_id.to_string(), profile.clone());
                Ok(())
            }
            StoreBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;

                sqlx::query(
                    r#"
                    INSERT INTO user_profiles (external_user_key, profile, updated_at)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (external_user_key)
                    DO UPDATE SET profile = $2, updated_at = $3
                    "#,
                )
                .bind(user_id)
                .bind(Value::Object(profile.clone()))
                .bind(Utc::now())
                .execute(pool)
                .await
                .map_err(|e| {
                    AdvisoryError::StoreError(format!("Failed to save profile: {}", e))
                })?;

                Ok(())
            }
        }
    }

    async fn save_report(&self, user_id: &str, topic: &str, report: &str) -> Result<()> {
        match &self.backend {
            StoreBackend::InMemory { reports, .. } => {
                let mut locked = reports.write().await;
                locked
                    .entry(user_id.to_string())
                    .or_default()
                    .push(ReportRecord {
                        topic: topic.to_string(),
                        report: report.to_string(),
                        created_at: Utc::now(),
                    });
                Ok(())
            }
            StoreBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;

                sqlx::query(
                    r#"
                    INSERT INTO advisory_reports
                      (report_id, external_user_key, topic, report, created_at)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(user_id)
                .bind(topic)
                .bind(report)
                .bind(Utc::now())
                .execute(pool)
                .await
                .map_err(|e| {
                    AdvisoryError::StoreError(format!("Failed to save report: {}", e))
                })?;

                Ok(())
            }
        }
    }

    async fn list_reports(&self, user_id: &str) -> Result<Vec<ReportRecord>> {
        match &self.backend {
            StoreBackend::InMemory { reports, .. } => {
                let locked = reports.read().await;
                Ok(locked.get(user_id).cloned().unwrap_or_default())
            }
            StoreBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;

                let rows = sqlx::query(
                    r#"
                    SELECT topic, report, created_at
                    FROM advisory_reports
                    WHERE external_user_key = $1
                    ORDER BY created_at ASC
                    "#,
                )
                .bind(user_id)
                .fetch_all(pool)
                .await
                .map_err(|e| {
                    AdvisoryError::StoreError(format!("Failed to list reports: {}", e))
                })?;

                let mut records = Vec::with_capacity(rows.len());
                for row in rows {
                    records.push(ReportRecord {
                        topic: row.try_get("topic").unwrap_or_default(),
                        report: row.try_get("report").unwrap_or_default(),
                        created_at: row
                            .try_get("created_at")
                            .unwrap_or_else(|_| Utc::now()),
                    });
                }
                Ok(records)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_profile_upsert_roundtrip() {
        let store = AdvisoryStore::in_memory();

        assert!(store.load_profile("user_ext_001").await.unwrap().is_empty());

        let mut profile = Map::new();
        profile.insert("name_display".to_string(), json!("Dana"));
        store.save_profile("user_ext_001", &profile).await.unwrap();

        profile.insert("age_range".to_string(), json!("30-39"));
        store.save_profile("user_ext_001", &profile).await.unwrap();

        let loaded = store.load_profile("user_ext_001").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["name_display"], json!("Dana"));
    }

    #[tokio::test]
    async fn test_report_history_appends() {
        let store = AdvisoryStore::in_memory();
        store
            .save_report("user_ext_001", "Nvidia analysis", "# Report A")
            .await
            .unwrap();
        store
            .save_report("user_ext_001", "Samsung Electronics", "# Report B")
            .await
            .unwrap();

        let reports = store.list_reports("user_ext_001").await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].topic, "Nvidia analysis");
        assert_eq!(reports[1].report, "# Report B");

        assert!(store.list_reports("someone_else").await.unwrap().is_empty());
    }
}
