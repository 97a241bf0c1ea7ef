//! Postgres-backed check store.
//!
//! Deduplication rests on the partial unique index `uq_checks_active`; the
//! insert path never holds a lock of its own.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scanplane_model::{
    BaseResourceType, BaseResourceTypeId, Check, CheckId, CheckOutcome,
    CheckOwner, CheckState, PipelineId, Plan, PlanFingerprint, Resource,
    ResourceId, ResourceType, ResourceTypeId, Source, Version,
};
use sqlx::{PgPool, types::Json};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{CheckStore, NewCheck};
use crate::error::{BackendError, BackendResult};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

macro_rules! check_columns {
    () => {
        "id, owner_kind, owner_id, resource_id, resource_type_id, \
         base_resource_type_id, plan, plan_fingerprint, state, create_time, \
         start_time, end_time"
    };
}

#[derive(sqlx::FromRow)]
struct CheckRow {
    id: Uuid,
    owner_kind: String,
    owner_id: i64,
    resource_id: Option<i64>,
    resource_type_id: Option<i64>,
    base_resource_type_id: Option<i64>,
    plan: serde_json::Value,
    plan_fingerprint: String,
    state: String,
    create_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl TryFrom<CheckRow> for Check {
    type Error = BackendError;

    fn try_from(row: CheckRow) -> Result<Self, Self::Error> {
        let plan = serde_json::from_value::<Plan>(row.plan).map_err(|err| {
            BackendError::Corrupt(format!("check {} plan: {err}", row.id))
        })?;
        Ok(Check {
            id: CheckId(row.id),
            owner: CheckOwner::from_parts(&row.owner_kind, row.owner_id)?,
            resource_id: row.resource_id.map(ResourceId),
            resource_type_id: row.resource_type_id.map(ResourceTypeId),
            base_resource_type_id: row
                .base_resource_type_id
                .map(BaseResourceTypeId),
            plan,
            plan_fingerprint: PlanFingerprint(row.plan_fingerprint),
            state: row.state.parse()?,
            create_time: row.create_time,
            start_time: row.start_time,
            end_time: row.end_time,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResourceRow {
    id: i64,
    pipeline_id: i64,
    name: String,
    type_name: String,
    source: Json<Source>,
    tags: Vec<String>,
    pinned_version: Option<Json<Version>>,
    check_timeout_secs: Option<i64>,
    config_version: i64,
}

impl From<ResourceRow> for Resource {
    fn from(row: ResourceRow) -> Self {
        Resource {
            id: ResourceId(row.id),
            pipeline_id: PipelineId(row.pipeline_id),
            name: row.name,
            type_name: row.type_name,
            source: row.source.0,
            tags: row.tags,
            pinned_version: row.pinned_version.map(|version| version.0),
            check_timeout_secs: row
                .check_timeout_secs
                .and_then(|secs| u64::try_from(secs).ok()),
            config_version: row.config_version,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ResourceTypeRow {
    id: i64,
    pipeline_id: i64,
    name: String,
    type_name: String,
    source: Json<Source>,
    tags: Vec<String>,
    privileged: bool,
    version: Option<Json<Version>>,
    config_version: i64,
}

impl From<ResourceTypeRow> for ResourceType {
    fn from(row: ResourceTypeRow) -> Self {
        ResourceType {
            id: ResourceTypeId(row.id),
            pipeline_id: PipelineId(row.pipeline_id),
            name: row.name,
            type_name: row.type_name,
            source: row.source.0,
            tags: row.tags,
            privileged: row.privileged,
            version: row.version.map(|version| version.0),
            config_version: row.config_version,
        }
    }
}

/// Durable check store backed by Postgres.
#[derive(Clone)]
pub struct PostgresCheckStore {
    pool: PgPool,
    insert_retry_limit: u32,
}

impl fmt::Debug for PostgresCheckStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresCheckStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("insert_retry_limit", &self.insert_retry_limit)
            .finish()
    }
}

impl PostgresCheckStore {
    pub const DEFAULT_INSERT_RETRY_LIMIT: u32 = 3;

    /// Connects the store and verifies that the dedupe index exists.
    pub async fn new(pool: PgPool) -> BackendResult<Self> {
        Self::new_with_retry_limit(pool, Self::DEFAULT_INSERT_RETRY_LIMIT).await
    }

    pub async fn new_with_retry_limit(
        pool: PgPool,
        insert_retry_limit: u32,
    ) -> BackendResult<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                BackendError::Unavailable(format!(
                    "check store failed Postgres health check: {e}"
                ))
            })?;
        info!("check store connected to Postgres");

        let index_exists = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM pg_indexes WHERE indexname = $1 LIMIT 1",
        )
        .bind("uq_checks_active")
        .fetch_optional(&pool)
        .await?
        .is_some();

        if !index_exists {
            return Err(BackendError::Unavailable(
                "required index uq_checks_active is missing; run migrations"
                    .into(),
            ));
        }

        Ok(Self {
            pool,
            insert_retry_limit: insert_retry_limit.max(1),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn try_insert(
        &self,
        check: &NewCheck,
    ) -> BackendResult<Option<Check>> {
        // Configuration removal flips `active`, which the foreign keys do not
        // see; the guard keeps deactivated owners from gaining checks.
        let inserted = sqlx::query_as::<_, CheckRow>(concat!(
            "INSERT INTO checks (id, owner_kind, owner_id, resource_id, \
             resource_type_id, base_resource_type_id, plan, plan_fingerprint, \
             state, create_time) \
             SELECT $1, $2, $3, $4, $5, $6, $7, $8, 'pending', NOW() \
             WHERE ($4::BIGINT IS NULL OR EXISTS \
                    (SELECT 1 FROM resources WHERE id = $4 AND active)) \
               AND ($5::BIGINT IS NULL OR EXISTS \
                    (SELECT 1 FROM resource_types WHERE id = $5 AND active)) \
             ON CONFLICT (owner_kind, owner_id, plan_fingerprint) \
             WHERE state IN ('pending', 'started') DO NOTHING \
             RETURNING ",
            check_columns!()
        ))
        .bind(CheckId::new().to_uuid())
        .bind(check.owner.kind())
        .bind(check.owner.raw_id())
        .bind(check.resource_id)
        .bind(check.resource_type_id)
        .bind(check.base_resource_type_id)
        .bind(Json(&check.plan))
        .bind(check.plan_fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| map_insert_error(err, check))?;

        inserted.map(Check::try_from).transpose()
    }

    /// First reference of `check` that is absent or deactivated, in owner
    /// precedence order.
    async fn missing_reference(
        &self,
        check: &NewCheck,
    ) -> BackendResult<Option<CheckOwner>> {
        let (resource, resource_type, base) =
            sqlx::query_as::<_, (bool, bool, bool)>(
                "SELECT \
                   ($1::BIGINT IS NOT NULL AND NOT EXISTS \
                     (SELECT 1 FROM resources WHERE id = $1 AND active)), \
                   ($2::BIGINT IS NOT NULL AND NOT EXISTS \
                     (SELECT 1 FROM resource_types WHERE id = $2 AND active)), \
                   ($3::BIGINT IS NOT NULL AND NOT EXISTS \
                     (SELECT 1 FROM base_resource_types WHERE id = $3))",
            )
            .bind(check.resource_id)
            .bind(check.resource_type_id)
            .bind(check.base_resource_type_id)
            .fetch_one(&self.pool)
            .await?;

        let missing = if resource {
            check.resource_id.map(CheckOwner::Resource)
        } else if resource_type {
            check.resource_type_id.map(CheckOwner::ResourceType)
        } else if base {
            check.base_resource_type_id.map(CheckOwner::BaseResourceType)
        } else {
            None
        };
        Ok(missing)
    }

    async fn find_active(
        &self,
        check: &NewCheck,
    ) -> BackendResult<Option<Check>> {
        let existing = sqlx::query_as::<_, CheckRow>(concat!(
            "SELECT ",
            check_columns!(),
            " FROM checks \
              WHERE owner_kind = $1 AND owner_id = $2 \
                AND plan_fingerprint = $3 \
                AND state IN ('pending', 'started') \
              ORDER BY create_time ASC LIMIT 1"
        ))
        .bind(check.owner.kind())
        .bind(check.owner.raw_id())
        .bind(check.plan_fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await?;

        existing.map(Check::try_from).transpose()
    }
}

fn map_insert_error(err: sqlx::Error, check: &NewCheck) -> BackendError {
    let sqlx::Error::Database(db_err) = &err else {
        return BackendError::Database(err);
    };
    if db_err.code().as_deref() != Some(FOREIGN_KEY_VIOLATION) {
        return BackendError::Database(err);
    }

    let missing = match db_err.constraint() {
        Some("fk_checks_resource") => {
            check.resource_id.map(CheckOwner::Resource)
        }
        Some("fk_checks_resource_type") => {
            check.resource_type_id.map(CheckOwner::ResourceType)
        }
        Some("fk_checks_base_resource_type") => check
            .base_resource_type_id
            .map(CheckOwner::BaseResourceType),
        _ => None,
    };
    BackendError::MissingReference(missing.unwrap_or(check.owner))
}

fn is_unique_violation(err: &BackendError) -> bool {
    matches!(
        err,
        BackendError::Database(sqlx::Error::Database(db_err))
            if db_err.code().as_deref() == Some(UNIQUE_VIOLATION)
    )
}

#[async_trait]
impl CheckStore for PostgresCheckStore {
    async fn insert_check_if_absent(
        &self,
        check: NewCheck,
    ) -> BackendResult<CheckOutcome> {
        for attempt in 1..=self.insert_retry_limit {
            match self.try_insert(&check).await {
                Ok(Some(created)) => {
                    trace!(
                        check_id = %created.id,
                        owner = %created.owner,
                        "inserted pending check"
                    );
                    return Ok(CheckOutcome::Created(created));
                }
                Ok(None) => {}
                // A concurrent primary key collision is vanishingly rare but
                // resolves the same way as a dedupe conflict.
                Err(err) if is_unique_violation(&err) => {}
                Err(err) => return Err(err),
            }

            if let Some(missing) = self.missing_reference(&check).await? {
                return Err(BackendError::MissingReference(missing));
            }

            if let Some(existing) = self.find_active(&check).await? {
                debug!(
                    check_id = %existing.id,
                    owner = %check.owner,
                    "merged into existing active check"
                );
                return Ok(CheckOutcome::AlreadyExists(existing));
            }

            // The conflicting row left the active set between our insert and
            // lookup; try again.
            warn!(
                owner = %check.owner,
                attempt,
                "active check finished during insert; retrying"
            );
        }

        Err(BackendError::Contended {
            owner: check.owner,
            attempts: self.insert_retry_limit,
        })
    }

    async fn list_resource_types(&self) -> BackendResult<Vec<ResourceType>> {
        let rows = sqlx::query_as::<_, ResourceTypeRow>(
            "SELECT id, pipeline_id, name, type_name, source, tags, \
                    privileged, version, config_version \
             FROM resource_types WHERE active ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ResourceType::from).collect())
    }

    async fn list_resources(&self) -> BackendResult<Vec<Resource>> {
        let rows = sqlx::query_as::<_, ResourceRow>(
            "SELECT id, pipeline_id, name, type_name, source, tags, \
                    pinned_version, check_timeout_secs, config_version \
             FROM resources WHERE active ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Resource::from).collect())
    }

    async fn list_base_resource_types(
        &self,
    ) -> BackendResult<Vec<BaseResourceType>> {
        let rows = sqlx::query_as::<_, (i64, String)>(
            "SELECT id, name FROM base_resource_types ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name)| BaseResourceType {
                id: BaseResourceTypeId(id),
                name,
            })
            .collect())
    }

    async fn list_checks_by_state(
        &self,
        state: CheckState,
    ) -> BackendResult<Vec<Check>> {
        let rows = sqlx::query_as::<_, CheckRow>(concat!(
            "SELECT ",
            check_columns!(),
            " FROM checks WHERE state = $1 ORDER BY create_time ASC"
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Check::try_from).collect()
    }

    async fn find_check(&self, id: CheckId) -> BackendResult<Option<Check>> {
        let row = sqlx::query_as::<_, CheckRow>(concat!(
            "SELECT ",
            check_columns!(),
            " FROM checks WHERE id = $1"
        ))
        .bind(id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Check::try_from).transpose()
    }

    async fn transition_check(
        &self,
        id: CheckId,
        to: CheckState,
    ) -> BackendResult<Check> {
        let allowed_from: Vec<String> = CheckState::all()
            .iter()
            .filter(|from| from.can_transition_to(to))
            .map(|from| from.as_str().to_string())
            .collect();

        let updated = sqlx::query_as::<_, CheckRow>(concat!(
            "UPDATE checks \
             SET state = $2, \
                 start_time = CASE WHEN $2 = 'started' \
                                   THEN NOW() ELSE start_time END, \
                 end_time = CASE \
                                WHEN $2 IN ('succeeded', 'errored', 'skipped') \
                                THEN NOW() ELSE end_time END \

             WHERE id = $1 AND state = ANY($3) \
             RETURNING ",
            check_columns!()
        ))
        .bind(id.to_uuid())
        .bind(to.as_str())
        .bind(allowed_from)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Check::try_from(row);
        }

        match self.find_check(id).await? {
            Some(current) => Err(BackendError::InvalidTransition {
                check_id: id,
                from: current.state,
                to,
            }),
            None => Err(BackendError::CheckNotFound(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanplane_model::{CheckPlan, CheckSubject, PlanStep, TypeImage};

    fn row(plan: serde_json::Value) -> CheckRow {
        CheckRow {
            id: Uuid::now_v7(),
            owner_kind: "resource".into(),
            owner_id: 42,
            resource_id: Some(42),
            resource_type_id: None,
            base_resource_type_id: Some(7),
            plan,
            plan_fingerprint: "abc".into(),
            state: "started".into(),
            create_time: Utc::now(),
            start_time: Some(Utc::now()),
            end_time: None,
        }
    }

    #[test]
    fn row_decodes_into_check() {
        let plan = Plan::new(
            "resource-42",
            PlanStep::Check(CheckPlan {
                name: "repo".into(),
                type_name: "git".into(),
                source: Source::new(),
                tags: Vec::new(),
                timeout_secs: None,
                from_version: None,
                type_image: TypeImage::base("git"),
                on_behalf_of: CheckSubject::Resource("repo".into()),
            }),
        );

        let check =
            Check::try_from(row(serde_json::to_value(&plan).unwrap())).unwrap();

        assert_eq!(check.owner, CheckOwner::Resource(ResourceId(42)));
        assert_eq!(check.state, CheckState::Started);
        assert_eq!(check.plan, plan);
    }

    #[test]
    fn undecodable_plan_is_reported_as_corrupt() {
        let err = Check::try_from(row(serde_json::json!({"step": "nope"})))
            .unwrap_err();

        assert!(matches!(err, BackendError::Corrupt(_)));
        assert!(!err.is_transient());
    }
}
