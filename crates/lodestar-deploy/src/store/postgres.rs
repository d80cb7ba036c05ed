//! PostgreSQL deployment store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::config::DatabaseConfig;
use crate::error::{DeployError, DeployResult};
use crate::types::{
    CustomServerId, CustomServerRecord, DeploymentId, DeploymentRecord, DeploymentStatus,
    InstanceId, InstanceRecord, LogEntry, ManagedProject, OAuthConfigId, ProviderInstance,
    StepId, StepRecord, StepStatus, VersionId, VersionRecord, VersionStatus,
};

use super::{DeploymentStore, PublishRequest};

const DEPLOYMENT_COLUMNS: &str =
    "id, custom_server_id, version_id, status, started_at, ended_at, created_at";
const STEP_COLUMNS: &str =
    "id, deployment_id, step_type, status, step_index, started_at, ended_at, logs";
const VERSION_COLUMNS: &str =
    "id, custom_server_id, instance_id, status, snapshot, created_at";
const INSTANCE_COLUMNS: &str =
    "id, custom_server_id, kind, provider, security_token, assets, oauth_config_id";

/// PostgreSQL-backed deployment store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn connect(url: &str, config: &DatabaseConfig) -> DeployResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .connect(url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> DeployResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> DeployResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS lodestar_servers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                current_version_id TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS lodestar_instances (
                id TEXT PRIMARY KEY,
                custom_server_id TEXT NOT NULL,
                kind JSONB NOT NULL,
                provider JSONB,
                security_token TEXT NOT NULL,
                assets JSONB NOT NULL DEFAULT '{}'::jsonb,
                oauth_config_id TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS lodestar_versions (
                id TEXT PRIMARY KEY,
                custom_server_id TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                status TEXT NOT NULL,
                snapshot JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS lodestar_deployments (
                id TEXT PRIMARY KEY,
                custom_server_id TEXT NOT NULL,
                version_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TIMESTAMPTZ,
                ended_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS lodestar_deployment_steps (
                id TEXT PRIMARY KEY,
                deployment_id TEXT NOT NULL REFERENCES lodestar_deployments(id) ON DELETE CASCADE,
                step_type TEXT NOT NULL,
                status TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                ended_at TIMESTAMPTZ,
                logs JSONB NOT NULL DEFAULT '[]'::jsonb,
                seq BIGSERIAL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS lodestar_managed_projects (
                custom_server_id TEXT PRIMARY KEY,
                external_project_id TEXT NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_lodestar_steps_deployment
            ON lodestar_deployment_steps (deployment_id, seq)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_lodestar_versions_instance
            ON lodestar_versions (instance_id)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_lodestar_deployments_version
            ON lodestar_deployments (version_id)
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    fn row_to_deployment(row: &PgRow) -> DeployResult<DeploymentRecord> {
        let id: String = row.get("id");
        let custom_server_id: String = row.get("custom_server_id");
        let version_id: String = row.get("version_id");
        let status: DeploymentStatus = parse_column(row, "status")?;

        Ok(DeploymentRecord {
            id: DeploymentId::new(id),
            custom_server_id: CustomServerId::new(custom_server_id),
            version_id: VersionId::new(version_id),
            status,
            started_at: row.get("started_at"),
            ended_at: row.get("ended_at"),
            created_at: row.get("created_at"),
        })
    }

    fn row_to_step(row: &PgRow) -> DeployResult<StepRecord> {
        let id: String = row.get("id");
        let deployment_id: String = row.get("deployment_id");
        let index: i32 = row.get("step_index");
        let logs: serde_json::Value = row.get("logs");

        Ok(StepRecord {
            id: StepId::new(id),
            deployment_id: DeploymentId::new(deployment_id),
            step_type: parse_column(row, "step_type")?,
            status: parse_column(row, "status")?,
            index: u32::try_from(index).map_err(|e| {
                DeployError::Serialisation(format!("invalid step index {index}: {e}"))
            })?,
            started_at: row.get("started_at"),
            ended_at: row.get("ended_at"),
            logs: from_json(logs, "logs")?,
        })
    }

    fn row_to_version(row: &PgRow) -> DeployResult<VersionRecord> {
        let id: String = row.get("id");
        let custom_server_id: String = row.get("custom_server_id");
        let instance_id: String = row.get("instance_id");
        let snapshot: Option<serde_json::Value> = row.get("snapshot");

        Ok(VersionRecord {
            id: VersionId::new(id),
            custom_server_id: CustomServerId::new(custom_server_id),
            instance_id: InstanceId::new(instance_id),
            status: parse_column::<VersionStatus>(row, "status")?,
            snapshot: snapshot.map(|s| from_json(s, "snapshot")).transpose()?,
            created_at: row.get("created_at"),
        })
    }

    fn row_to_instance(row: &PgRow) -> DeployResult<InstanceRecord> {
        let id: String = row.get("id");
        let custom_server_id: String = row.get("custom_server_id");
        let kind: serde_json::Value = row.get("kind");
        let provider: Option<serde_json::Value> = row.get("provider");
        let assets: serde_json::Value = row.get("assets");
        let oauth_config_id: Option<String> = row.get("oauth_config_id");

        Ok(InstanceRecord {
            id: InstanceId::new(id),
            custom_server_id: CustomServerId::new(custom_server_id),
            kind: from_json(kind, "kind")?,
            provider: provider.map(|p| from_json(p, "provider")).transpose()?,
            security_token: row.get("security_token"),
            assets: from_json(assets, "assets")?,
            oauth_config_id: oauth_config_id.map(OAuthConfigId::new),
        })
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> DeployResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(column);
    raw.parse().map_err(|e| {
        DeployError::Serialisation(format!("failed to parse {column} '{raw}': {e}"))
    })
}

/// Explain why a guarded deployment update matched no row.
async fn rejected_transition(
    executor: impl sqlx::PgExecutor<'_>,
    id: &DeploymentId,
    to: DeploymentStatus,
) -> DeployError {
    let row = sqlx::query("SELECT status FROM lodestar_deployments WHERE id = $1")
        .bind(id.as_str())
        .fetch_optional(executor)
        .await;

    match row {
        Ok(Some(row)) => match parse_column::<DeploymentStatus>(&row, "status") {
            Ok(from) => DeployError::InvalidStateTransition {
                from: from.as_str(),
                to: to.as_str(),
            },
            Err(e) => e,
        },
        Ok(None) => DeployError::NotFound(format!("deployment {id}")),
        Err(e) => e.into(),
    }
}

fn to_json<T: Serialize>(value: &T, what: &str) -> DeployResult<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| DeployError::Serialisation(format!("failed to serialise {what}: {e}")))
}

fn from_json<T: DeserializeOwned>(value: serde_json::Value, what: &str) -> DeployResult<T> {
    serde_json::from_value(value)
        .map_err(|e| DeployError::Serialisation(format!("failed to deserialise {what}: {e}")))
}

fn step_index(index: u32) -> DeployResult<i32> {
    i32::try_from(index)
        .map_err(|e| DeployError::Serialisation(format!("step index {index} out of range: {e}")))
}

#[async_trait]
impl DeploymentStore for PostgresStore {
    async fn insert_deployment(&self, record: &DeploymentRecord) -> DeployResult<()> {
        sqlx::query(
            r#"
            INSERT INTO lodestar_deployments (
                id, custom_server_id, version_id, status, started_at, ended_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.custom_server_id.as_str())
        .bind(record.version_id.as_str())
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_deployment(&self, id: &DeploymentId) -> DeployResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM lodestar_deployments WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_deployment).transpose()
    }

    async fn deployment_for_version(
        &self,
        version_id: &VersionId,
    ) -> DeployResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM lodestar_deployments
             WHERE version_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(version_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_deployment).transpose()
    }

    async fn update_deployment(&self, record: &DeploymentRecord) -> DeployResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE lodestar_deployments
            SET status = $1, started_at = $2, ended_at = $3
            WHERE id = $4 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(rejected_transition(&self.pool, &record.id, record.status).await);
        }

        Ok(())
    }

    async fn insert_step(&self, step: &StepRecord) -> DeployResult<()> {
        sqlx::query(
            r#"
            INSERT INTO lodestar_deployment_steps (
                id, deployment_id, step_type, status, step_index, started_at, ended_at, logs
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(step.id.as_str())
        .bind(step.deployment_id.as_str())
        .bind(step.step_type.as_str())
        .bind(step.status.as_str())
        .bind(step_index(step.index)?)
        .bind(step.started_at)
        .bind(step.ended_at)
        .bind(to_json(&step.logs, "logs")?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finish_step(
        &self,
        id: &StepId,
        status: StepStatus,
        ended_at: DateTime<Utc>,
        logs: &[LogEntry],
    ) -> DeployResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE lodestar_deployment_steps
            SET status = $1, ended_at = $2, logs = logs || $3
            WHERE id = $4 AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(ended_at)
        .bind(to_json(&logs, "logs")?)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_step_log(&self, id: &StepId, entry: &LogEntry) -> DeployResult<()> {
        // The entry is itself an array, so wrap it to append one element.
        let result = sqlx::query(
            r#"
            UPDATE lodestar_deployment_steps
            SET logs = logs || jsonb_build_array($1::jsonb)
            WHERE id = $2
            "#,
        )
        .bind(to_json(entry, "log entry")?)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DeployError::NotFound(format!("step {id}")));
        }

        Ok(())
    }

    async fn fail_running_steps(
        &self,
        deployment_id: &DeploymentId,
        ended_at: DateTime<Utc>,
    ) -> DeployResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE lodestar_deployment_steps
            SET status = 'failed', ended_at = $1
            WHERE deployment_id = $2 AND status = 'running'
            "#,
        )
        .bind(ended_at)
        .bind(deployment_id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_steps(&self, deployment_id: &DeploymentId) -> DeployResult<Vec<StepRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM lodestar_deployment_steps
             WHERE deployment_id = $1 ORDER BY seq"
        ))
        .bind(deployment_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_step).collect()
    }

    async fn insert_version(&self, version: &VersionRecord) -> DeployResult<()> {
        let snapshot = version
            .snapshot
            .as_ref()
            .map(|s| to_json(s, "snapshot"))
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO lodestar_versions (
                id, custom_server_id, instance_id, status, snapshot, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(version.id.as_str())
        .bind(version.custom_server_id.as_str())
        .bind(version.instance_id.as_str())
        .bind(version.status.as_str())
        .bind(snapshot)
        .bind(version.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_version(&self, id: &VersionId) -> DeployResult<Option<VersionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM lodestar_versions WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_version).transpose()
    }

    async fn version_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> DeployResult<Option<VersionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM lodestar_versions
             WHERE instance_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(instance_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_version).transpose()
    }

    async fn mark_version_failed(&self, id: &VersionId) -> DeployResult<()> {
        // An activated version stays available.
        let result = sqlx::query(
            r#"
            UPDATE lodestar_versions
            SET status = CASE WHEN status = $1 THEN status ELSE $2 END
            WHERE id = $3
            "#,
        )
        .bind(VersionStatus::Available.as_str())
        .bind(VersionStatus::DeploymentFailed.as_str())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DeployError::NotFound(format!("version {id}")));
        }

        Ok(())
    }

    async fn insert_server(&self, server: &CustomServerRecord) -> DeployResult<()> {
        sqlx::query(
            "INSERT INTO lodestar_servers (id, name, current_version_id) VALUES ($1, $2, $3)",
        )
        .bind(server.id.as_str())
        .bind(&server.name)
        .bind(server.current_version_id.as_ref().map(VersionId::as_str))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_server(&self, id: &CustomServerId) -> DeployResult<Option<CustomServerRecord>> {
        let row = sqlx::query(
            "SELECT id, name, current_version_id FROM lodestar_servers WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let id: String = r.get("id");
            let current: Option<String> = r.get("current_version_id");
            CustomServerRecord {
                id: CustomServerId::new(id),
                name: r.get("name"),
                current_version_id: current.map(VersionId::new),
            }
        }))
    }

    async fn insert_instance(&self, instance: &InstanceRecord) -> DeployResult<()> {
        let provider = instance
            .provider
            .as_ref()
            .map(|p| to_json(p, "provider"))
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO lodestar_instances (
                id, custom_server_id, kind, provider, security_token, assets, oauth_config_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(instance.id.as_str())
        .bind(instance.custom_server_id.as_str())
        .bind(to_json(&instance.kind, "kind")?)
        .bind(provider)
        .bind(&instance.security_token)
        .bind(to_json(&instance.assets, "assets")?)
        .bind(instance.oauth_config_id.as_ref().map(OAuthConfigId::as_str))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_instance(&self, id: &InstanceId) -> DeployResult<Option<InstanceRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM lodestar_instances WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_instance).transpose()
    }

    async fn set_instance_provider(
        &self,
        id: &InstanceId,
        provider: &ProviderInstance,
    ) -> DeployResult<()> {
        let result = sqlx::query("UPDATE lodestar_instances SET provider = $1 WHERE id = $2")
            .bind(to_json(provider, "provider")?)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DeployError::NotFound(format!("instance {id}")));
        }

        Ok(())
    }

    async fn link_oauth_config(
        &self,
        id: &InstanceId,
        config_id: &OAuthConfigId,
    ) -> DeployResult<()> {
        let result =
            sqlx::query("UPDATE lodestar_instances SET oauth_config_id = $1 WHERE id = $2")
                .bind(config_id.as_str())
                .bind(id.as_str())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(DeployError::NotFound(format!("instance {id}")));
        }

        Ok(())
    }

    async fn find_managed_project(
        &self,
        custom_server_id: &CustomServerId,
    ) -> DeployResult<Option<ManagedProject>> {
        let row = sqlx::query(
            r#"
            SELECT custom_server_id, external_project_id
            FROM lodestar_managed_projects
            WHERE custom_server_id = $1
            "#,
        )
        .bind(custom_server_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let server: String = r.get("custom_server_id");
            ManagedProject {
                custom_server_id: CustomServerId::new(server),
                external_project_id: r.get("external_project_id"),
            }
        }))
    }

    async fn insert_managed_project(&self, project: &ManagedProject) -> DeployResult<()> {
        sqlx::query(
            r#"
            INSERT INTO lodestar_managed_projects (custom_server_id, external_project_id)
            VALUES ($1, $2)
            "#,
        )
        .bind(project.custom_server_id.as_str())
        .bind(&project.external_project_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn publish(&self, request: &PublishRequest) -> DeployResult<()> {
        let mut tx = self.pool.begin().await?;

        let version = sqlx::query(
            "UPDATE lodestar_versions SET status = $1, snapshot = $2 WHERE id = $3",
        )
        .bind(VersionStatus::Available.as_str())
        .bind(to_json(&request.snapshot, "snapshot")?)
        .bind(request.version_id.as_str())
        .execute(&mut *tx)
        .await?;
        if version.rows_affected() == 0 {
            return Err(DeployError::NotFound(format!("version {}", request.version_id)));
        }

        let server =
            sqlx::query("UPDATE lodestar_servers SET current_version_id = $1 WHERE id = $2")
                .bind(request.version_id.as_str())
                .bind(request.custom_server_id.as_str())
                .execute(&mut *tx)
                .await?;
        if server.rows_affected() == 0 {
            return Err(DeployError::NotFound(format!(
                "server {}",
                request.custom_server_id
            )));
        }

        let deployment = sqlx::query(
            r#"
            UPDATE lodestar_deployments
            SET status = 'completed', ended_at = $1
            WHERE id = $2 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(request.ended_at)
        .bind(request.deployment_id.as_str())
        .execute(&mut *tx)
        .await?;
        if deployment.rows_affected() == 0 {
            return Err(rejected_transition(
                &mut *tx,
                &request.deployment_id,
                DeploymentStatus::Completed,
            )
            .await);
        }

        sqlx::query(
            r#"
            UPDATE lodestar_deployment_steps
            SET status = 'completed', ended_at = $1
            WHERE deployment_id = $2 AND status = 'running'
            "#,
        )
        .bind(request.ended_at)
        .bind(request.deployment_id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
