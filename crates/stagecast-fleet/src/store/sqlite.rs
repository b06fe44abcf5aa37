// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed instance store for development and tests.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::{Error, Result};
use crate::store::{InstanceRecord, InstanceRow, InstanceStatus, Store, record_from_row};

const SELECT_COLUMNS: &str = "instance_id, name, description, port, status, config, \
     owner_user_id, organization_id, created_at, updated_at";

/// Instance store backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if necessary) a database file and apply the schema.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    /// In-memory database. Pinned to a single persistent connection so the
    /// schema survives for the life of the pool.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.apply_schema().await?;
        Ok(store)
    }

    async fn apply_schema(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../../migrations/schema.sqlite.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_instance(&self, record: &InstanceRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO instances \
             (instance_id, name, description, port, status, config, \
              owner_user_id, organization_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.instance_id)
        .bind(&record.name)
        .bind(&record.description)
        .bind(i32::from(record.port))
        .bind(record.status.as_str())
        .bind(&record.config)
        .bind(&record.owner_user_id)
        .bind(&record.organization_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let row: Option<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM instances WHERE instance_id = ?"
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    async fn list_instances(
        &self,
        owner_user_id: Option<&str>,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<InstanceRecord>> {
        let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new(format!(
            "SELECT {SELECT_COLUMNS} FROM instances WHERE 1=1"
        ));
        if let Some(owner) = owner_user_id {
            builder.push(" AND owner_user_id = ");
            builder.push_bind(owner);
        }
        if let Some(status) = status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        }
        builder.push(" ORDER BY created_at DESC");

        let rows: Vec<InstanceRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(record_from_row).collect()
    }

    async fn list_ports(&self) -> Result<Vec<u16>> {
        let rows: Vec<(i32,)> = sqlx::query_as("SELECT port FROM instances")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|(port,)| {
                u16::try_from(port).map_err(|_| Error::Other(format!("invalid port {port}")))
            })
            .collect()
    }

    async fn update_status(&self, instance_id: &str, status: InstanceStatus) -> Result<()> {
        let result =
            sqlx::query("UPDATE instances SET status = ?, updated_at = ? WHERE instance_id = ?")
                .bind(status.as_str())
                .bind(Utc::now())
                .bind(instance_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound {
                instance_id: instance_id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_instance(
        &self,
        instance_id: &str,
        name: &str,
        description: Option<&str>,
        config: &serde_json::Value,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE instances SET name = ?, description = ?, config = ?, updated_at = ? \
             WHERE instance_id = ?",
        )
        .bind(name)
        .bind(description)
        .bind(config)
        .bind(Utc::now())
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound {
                instance_id: instance_id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM instances WHERE instance_id = ?")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound {
                instance_id: instance_id.to_string(),
            });
        }
        Ok(())
    }

    async fn count_instances(&self, owner_user_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM instances WHERE owner_user_id = ?")
                .bind(owner_user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn health_check_db(&self) -> Result<bool> {
        Ok(sqlx::query("SELECT 1").execute(&self.pool).await.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_record(id: &str, port: u16) -> InstanceRecord {
        let now = Utc::now();
        InstanceRecord {
            instance_id: id.to_string(),
            name: format!("instance {id}"),
            description: None,
            port,
            status: InstanceStatus::Stopped,
            config: json!({}),
            owner_user_id: "user-1".to_string(),
            organization_id: "org-1".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_instance(&sample_record("a", 5656)).await.unwrap();

        let record = store.get_instance("a").await.unwrap().unwrap();
        assert_eq!(record.instance_id, "a");
        assert_eq!(record.port, 5656);
        assert_eq!(record.status, InstanceStatus::Stopped);
        assert_eq!(record.config, json!({}));

        assert!(store.get_instance("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_port_uniqueness_enforced() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_instance(&sample_record("a", 5656)).await.unwrap();

        let err = store.create_instance(&sample_record("b", 5656)).await;
        assert!(matches!(err, Err(Error::Database(_))));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut other_owner = sample_record("b", 5657);
        other_owner.owner_user_id = "user-2".to_string();
        store.create_instance(&sample_record("a", 5656)).await.unwrap();
        store.create_instance(&other_owner).await.unwrap();
        store
            .update_status("a", InstanceStatus::Running)
            .await
            .unwrap();

        let all = store.list_instances(None, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let mine = store.list_instances(Some("user-1"), None).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].instance_id, "a");

        let running = store
            .list_instances(None, Some(InstanceStatus::Running))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].instance_id, "a");
    }

    #[tokio::test]
    async fn test_list_ports() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_instance(&sample_record("a", 5656)).await.unwrap();
        store.create_instance(&sample_record("b", 5658)).await.unwrap();

        let mut ports = store.list_ports().await.unwrap();
        ports.sort_unstable();
        assert_eq!(ports, vec![5656, 5658]);
    }

    #[tokio::test]
    async fn test_update_status_bumps_updated_at() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_instance(&sample_record("a", 5656)).await.unwrap();
        let before = store.get_instance("a").await.unwrap().unwrap();

        store
            .update_status("a", InstanceStatus::Running)
            .await
            .unwrap();
        let after = store.get_instance("a").await.unwrap().unwrap();
        assert_eq!(after.status, InstanceStatus::Running);
        assert!(after.updated_at >= before.updated_at);

        let err = store.update_status("missing", InstanceStatus::Running).await;
        assert!(matches!(err, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_update_instance_fields() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_instance(&sample_record("a", 5656)).await.unwrap();

        store
            .update_instance("a", "renamed", Some("desc"), &json!({"theme": "dark"}))
            .await
            .unwrap();

        let record = store.get_instance("a").await.unwrap().unwrap();
        assert_eq!(record.name, "renamed");
        assert_eq!(record.description.as_deref(), Some("desc"));
        assert_eq!(record.config, json!({"theme": "dark"}));
        // Immutable fields untouched.
        assert_eq!(record.port, 5656);
        assert_eq!(record.owner_user_id, "user-1");
    }

    #[tokio::test]
    async fn test_delete_releases_port() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_instance(&sample_record("a", 5656)).await.unwrap();
        store.delete_instance("a").await.unwrap();

        assert!(store.get_instance("a").await.unwrap().is_none());
        assert!(store.list_ports().await.unwrap().is_empty());
        // Port is reusable afterwards.
        store.create_instance(&sample_record("b", 5656)).await.unwrap();

        let err = store.delete_instance("a").await;
        assert!(matches!(err, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_count_instances() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert_eq!(store.count_instances("user-1").await.unwrap(), 0);
        store.create_instance(&sample_record("a", 5656)).await.unwrap();
        store.create_instance(&sample_record("b", 5657)).await.unwrap();
        assert_eq!(store.count_instances("user-1").await.unwrap(), 2);
        assert_eq!(store.count_instances("user-2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_from_path_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.db");

        let store = SqliteStore::from_path(&path).await.unwrap();
        store.create_instance(&sample_record("a", 5656)).await.unwrap();
        drop(store);

        let reopened = SqliteStore::from_path(&path).await.unwrap();
        let record = reopened.get_instance("a").await.unwrap().unwrap();
        assert_eq!(record.port, 5656);
    }

    #[tokio::test]
    async fn test_health_check() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.health_check_db().await.unwrap());
    }
}
