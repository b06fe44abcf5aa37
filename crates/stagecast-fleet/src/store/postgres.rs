// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed instance store. Production backend.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::{Error, Result};
use crate::store::{InstanceRecord, InstanceRow, InstanceStatus, Store, record_from_row};

const SELECT_COLUMNS: &str = "instance_id, name, description, port, status, config, \
     owner_user_id, organization_id, created_at, updated_at";

/// Instance store backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the given database URL with a small pool.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Access the underlying pool (schema application, ad-hoc queries).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema. Idempotent.
    pub async fn apply_schema(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../../migrations/schema.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_instance(&self, record: &InstanceRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO instances \
             (instance_id, name, description, port, status, config, \
              owner_user_id, organization_id, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
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
            "SELECT {SELECT_COLUMNS} FROM instances WHERE instance_id = $1"
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
        let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(format!(
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
            sqlx::query("UPDATE instances SET status = $1, updated_at = $2 WHERE instance_id = $3")
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
            "UPDATE instances SET name = $1, description = $2, config = $3, updated_at = $4 \
             WHERE instance_id = $5",
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
        let result = sqlx::query("DELETE FROM instances WHERE instance_id = $1")
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
            sqlx::query_as("SELECT COUNT(*) FROM instances WHERE owner_user_id = $1")
                .bind(owner_user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn health_check_db(&self) -> Result<bool> {
        Ok(sqlx::query("SELECT 1").execute(&self.pool).await.is_ok())
    }
}
