//! SQLite-backed deployment store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::config::{DatabaseConfig, PortsConfig};
use crate::error::{ControlError, ControlResult};
use crate::types::{Deployment, DeploymentId, DeploymentStatus, PortAllocation};

use super::{find_free_base, DeploymentFilter, DeploymentStore};

/// Deployment store backed by a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    ports: PortsConfig,
}

impl SqliteStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: SqlitePool, ports: PortsConfig) -> Self {
        Self { pool, ports }
    }

    /// Connect to the configured database and ensure the schema exists.
    pub async fn connect(config: &DatabaseConfig, ports: PortsConfig) -> ControlResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        let store = Self::new(pool, ports);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> ControlResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                tester_email TEXT NOT NULL,
                primary_version TEXT NOT NULL,
                dependency_versions TEXT NOT NULL DEFAULT '{}',
                environment TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                port_base INTEGER NOT NULL DEFAULT 0,
                subdomain TEXT NOT NULL,
                modules_installed TEXT NOT NULL DEFAULT '[]',
                last_action TEXT,
                notes TEXT,
                auth_password TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_deployments_tester_email
             ON deployments (tester_email)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_deployments_status
             ON deployments (status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_deployments_created_at
             ON deployments (created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS port_allocations (
                port_base INTEGER PRIMARY KEY,
                deployment_id TEXT NOT NULL,
                allocated_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        debug!("database schema ensured");
        Ok(())
    }
}

fn row_to_deployment(row: &SqliteRow) -> ControlResult<Deployment> {
    let status_raw: String = row.try_get("status")?;
    let status: DeploymentStatus = status_raw
        .parse()
        .map_err(ControlError::Serialization)?;

    let environment_raw: String = row.try_get("environment")?;
    let environment = environment_raw
        .parse()
        .map_err(ControlError::Serialization)?;

    let dependency_versions: String = row.try_get("dependency_versions")?;
    let modules_installed: String = row.try_get("modules_installed")?;

    let port_base: i64 = row.try_get("port_base")?;
    let port_base = u16::try_from(port_base)
        .map_err(|_| ControlError::Serialization(format!("port_base out of range: {port_base}")))?;

    Ok(Deployment {
        id: DeploymentId::new(row.try_get::<String, _>("id")?),
        name: row.try_get("name")?,
        tester_email: row.try_get("tester_email")?,
        primary_version: row.try_get("primary_version")?,
        dependency_versions: serde_json::from_str(&dependency_versions)?,
        environment,
        status,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        last_updated: row.try_get::<DateTime<Utc>, _>("last_updated")?,
        port_base,
        subdomain: row.try_get("subdomain")?,
        modules_installed: serde_json::from_str(&modules_installed)?,
        last_action: row.try_get("last_action")?,
        notes: row.try_get("notes")?,
        auth_password: row.try_get("auth_password")?,
    })
}

const UPSERT_SQL: &str = r"
    INSERT INTO deployments (
        id, name, tester_email, primary_version, dependency_versions,
        environment, status, created_at, last_updated, port_base,
        subdomain, modules_installed, last_action, notes, auth_password
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        name = excluded.name,
        tester_email = excluded.tester_email,
        primary_version = excluded.primary_version,
        dependency_versions = excluded.dependency_versions,
        environment = excluded.environment,
        status = excluded.status,
        last_updated = excluded.last_updated,
        port_base = excluded.port_base,
        subdomain = excluded.subdomain,
        modules_installed = excluded.modules_installed,
        last_action = excluded.last_action,
        notes = excluded.notes,
        auth_password = excluded.auth_password
";

fn bind_deployment<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    deployment: &'q Deployment,
    dependency_versions: &'q str,
    modules_installed: &'q str,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(deployment.id.as_str())
        .bind(&deployment.name)
        .bind(&deployment.tester_email)
        .bind(&deployment.primary_version)
        .bind(dependency_versions)
        .bind(deployment.environment.as_str())
        .bind(deployment.status.as_str())
        .bind(deployment.created_at)
        .bind(deployment.last_updated)
        .bind(i64::from(deployment.port_base))
        .bind(&deployment.subdomain)
        .bind(modules_installed)
        .bind(&deployment.last_action)
        .bind(&deployment.notes)
        .bind(&deployment.auth_password)
}

#[async_trait]
impl DeploymentStore for SqliteStore {
    async fn save(&self, deployment: &Deployment) -> ControlResult<()> {
        let dependency_versions = serde_json::to_string(&deployment.dependency_versions)?;
        let modules_installed = serde_json::to_string(&deployment.modules_installed)?;

        bind_deployment(
            sqlx::query(UPSERT_SQL),
            deployment,
            &dependency_versions,
            &modules_installed,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<Deployment>> {
        let row = sqlx::query("SELECT * FROM deployments WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_deployment).transpose()
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<Deployment>> {
        let mut sql = String::from("SELECT * FROM deployments");
        let mut conditions = Vec::new();
        if filter.tester_email.is_some() {
            conditions.push("tester_email = ?");
        }
        if filter.status.is_some() {
            conditions.push("status = ?");
        }
        if filter.environment.is_some() {
            conditions.push("environment = ?");
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC");
        if filter.limit.is_some() || filter.offset.is_some() {
            // SQLite requires a LIMIT clause before OFFSET; -1 means no limit.
            sql.push_str(" LIMIT ? OFFSET ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(email) = &filter.tester_email {
            query = query.bind(email);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(environment) = filter.environment {
            query = query.bind(environment.as_str());
        }
        if filter.limit.is_some() || filter.offset.is_some() {
            query = query
                .bind(filter.limit.map_or(-1_i64, i64::from))
                .bind(i64::from(filter.offset.unwrap_or(0)));
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_deployment).collect()
    }

    async fn delete(&self, id: &DeploymentId) -> ControlResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM deployments WHERE id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ControlError::NotFound(id.to_string()));
        }

        sqlx::query("DELETE FROM port_allocations WHERE deployment_id = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn count_for_tester(&self, email: &str) -> ControlResult<u32> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM deployments WHERE tester_email = ?")
            .bind(email)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("n")?;
        u32::try_from(count).map_err(|_| ControlError::internal("deployment count overflow"))
    }

    async fn update_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        last_action: Option<&str>,
    ) -> ControlResult<()> {
        let result = sqlx::query(
            "UPDATE deployments
             SET status = ?, last_action = COALESCE(?, last_action), last_updated = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(last_action)
        .bind(Utc::now())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn allocate_port(&self, deployment: &Deployment, increment: u16) -> ControlResult<u16> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT port_base FROM port_allocations
             WHERE port_base >= ? AND port_base < ?
             ORDER BY port_base",
        )
        .bind(i64::from(self.ports.range_start))
        .bind(i64::from(self.ports.range_end))
        .fetch_all(&mut *tx)
        .await?;

        let mut allocated = Vec::with_capacity(rows.len());
        for row in &rows {
            let base: i64 = row.try_get("port_base")?;
            allocated.push(u16::try_from(base).map_err(|_| {
                ControlError::Serialization(format!("port_base out of range: {base}"))
            })?);
        }

        let ports = PortsConfig {
            increment,
            ..self.ports.clone()
        };
        let base = find_free_base(&allocated, &ports).ok_or(ControlError::ResourceExhausted {
            start: self.ports.range_start,
            end: self.ports.range_end,
            increment,
        })?;

        sqlx::query(
            "INSERT INTO port_allocations (port_base, deployment_id, allocated_at)
             VALUES (?, ?, ?)",
        )
        .bind(i64::from(base))
        .bind(deployment.id.as_str())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let mut record = deployment.clone();
        record.port_base = base;
        record.last_updated = Utc::now();
        let dependency_versions = serde_json::to_string(&record.dependency_versions)?;
        let modules_installed = serde_json::to_string(&record.modules_installed)?;
        bind_deployment(
            sqlx::query(UPSERT_SQL),
            &record,
            &dependency_versions,
            &modules_installed,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(deployment_id = %deployment.id, port_base = base, "allocated port block");
        Ok(base)
    }

    async fn list_allocations(&self) -> ControlResult<Vec<PortAllocation>> {
        let rows = sqlx::query(
            "SELECT port_base, deployment_id, allocated_at
             FROM port_allocations ORDER BY port_base",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut allocations = Vec::with_capacity(rows.len());
        for row in &rows {
            let base: i64 = row.try_get("port_base")?;
            allocations.push(PortAllocation {
                port_base: u16::try_from(base).map_err(|_| {
                    ControlError::Serialization(format!("port_base out of range: {base}"))
                })?,
                deployment_id: DeploymentId::new(row.try_get::<String, _>("deployment_id")?),
                allocated_at: row.try_get::<DateTime<Utc>, _>("allocated_at")?,
            });
        }
        Ok(allocations)
    }
}
