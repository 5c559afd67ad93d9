use crate::errors::{AppError, AppResult};
use crate::models::{
    Claim, ClaimSource, ClaimStatus, Granularity, MetricSnapshot, MetricSpec, MetricType, NewTaskPayload,
    OwnerRef, Scope, TaskFact, TaskStatus, UpdatePolicy, ValueType,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

const METRIC_TYPE_COLUMNS: &str = "id, key, scope, value_type, granularity, update_policy, decay_days, unit, description, created_at, updated_at";
const SNAPSHOT_COLUMNS: &str = "id, type_id, owner_kind, owner_id, window_start, window_end, value_num, computed_at";
const CLAIM_COLUMNS: &str =
    "id, type_id, owner_kind, owner_id, value_num, source, status, valid_from, valid_to, created_at, updated_at";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        Self::open(path, DEFAULT_BUSY_TIMEOUT_MS)
    }

    pub fn open(path: &Path, busy_timeout_ms: u64) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connection(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn with_transaction<T>(&self, work: impl FnOnce(&Transaction<'_>) -> AppResult<T>) -> AppResult<T> {
        self.transact(true, work)
    }

    pub fn with_discarded_transaction<T>(
        &self,
        work: impl FnOnce(&Transaction<'_>) -> AppResult<T>,
    ) -> AppResult<T> {
        self.transact(false, work)
    }

    fn transact<T>(&self, commit: bool, work: impl FnOnce(&Transaction<'_>) -> AppResult<T>) -> AppResult<T> {
        let mut conn = self.connection()?;
        // Take the write lock up front so concurrent writers wait on the busy
        // timeout instead of failing a lock upgrade.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = work(&tx)?;
        if commit {
            tx.commit()?;
        } else {
            tx.rollback()?;
        }
        Ok(result)
    }

    // ─── Owners & Tasks ─────────────────────────────────────────────────────

    pub fn insert_workspace(&self, id: &str, name: &str) -> AppResult<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO workspaces (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![id, name, format_time(Utc::now())],
        )?;
        Ok(())
    }

    pub fn insert_user(&self, id: &str, name: &str) -> AppResult<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO users (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![id, name, format_time(Utc::now())],
        )?;
        Ok(())
    }

    pub fn insert_task(&self, payload: NewTaskPayload) -> AppResult<TaskFact> {
        let id = payload.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO tasks (id, workspace_id, user_id, status, points, created_at, updated_at, due_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                payload.workspace_id,
                payload.user_id,
                payload.status.as_str(),
                payload.points,
                format_time(payload.created_at),
                format_time(payload.updated_at),
                payload.due_date.map(format_time),
            ],
        )?;

        Ok(TaskFact {
            id,
            created_at: payload.created_at,
            updated_at: payload.updated_at,
            status: payload.status,
            due_date: payload.due_date,
        })
    }

    pub fn list_workspace_ids(&self) -> AppResult<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT id FROM workspaces ORDER BY id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub fn list_user_ids(&self) -> AppResult<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT id FROM users ORDER BY id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub fn list_tasks_for_owner(&self, owner: &OwnerRef) -> AppResult<Vec<TaskFact>> {
        let query = match owner.kind {
            Scope::Workspace => {
                "SELECT id, created_at, updated_at, status, due_date FROM tasks WHERE workspace_id = ?1"
            }
            Scope::User => "SELECT id, created_at, updated_at, status, due_date FROM tasks WHERE user_id = ?1",
        };
        let conn = self.connection()?;
        let mut stmt = conn.prepare(query)?;
        let tasks = stmt
            .query_map([owner.id.as_str()], parse_task_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    // ─── Metric Types ───────────────────────────────────────────────────────

    pub fn list_metric_types(&self) -> AppResult<Vec<MetricType>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {METRIC_TYPE_COLUMNS} FROM metric_types ORDER BY scope ASC, key ASC"
        ))?;
        let types = stmt
            .query_map([], parse_metric_type_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(types)
    }

    pub fn get_metric_type(&self, id: &str) -> AppResult<Option<MetricType>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!("SELECT {METRIC_TYPE_COLUMNS} FROM metric_types WHERE id = ?1"),
            [id],
            parse_metric_type_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    // ─── Snapshots & Claims ─────────────────────────────────────────────────

    pub fn list_snapshots(&self, type_id: &str, owner: &OwnerRef) -> AppResult<Vec<MetricSnapshot>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM metric_snapshots
             WHERE type_id = ?1 AND owner_kind = ?2 AND owner_id = ?3
             ORDER BY window_end DESC"
        ))?;
        let snapshots = stmt
            .query_map(
                params![type_id, owner.kind.as_str(), owner.id],
                parse_metric_snapshot_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(snapshots)
    }

    pub fn get_active_claim(&self, type_id: &str, owner: &OwnerRef) -> AppResult<Option<Claim>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!(
                "SELECT {CLAIM_COLUMNS} FROM metric_claims
                 WHERE type_id = ?1 AND owner_kind = ?2 AND owner_id = ?3 AND status = 'ACTIVE'
                 ORDER BY updated_at DESC, created_at DESC
                 LIMIT 1"
            ),
            params![type_id, owner.kind.as_str(), owner.id],
            parse_claim_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_claims(&self, type_id: &str, owner: &OwnerRef) -> AppResult<Vec<Claim>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CLAIM_COLUMNS} FROM metric_claims
             WHERE type_id = ?1 AND owner_kind = ?2 AND owner_id = ?3
             ORDER BY created_at ASC"
        ))?;
        let claims = stmt
            .query_map(params![type_id, owner.kind.as_str(), owner.id], parse_claim_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(claims)
    }

    pub fn record_explicit_claim(&self, type_id: &str, owner: &OwnerRef, value: f64) -> AppResult<Claim> {
        let now = Utc::now();
        let claim_id = self.with_transaction(|tx| {
            let scope = metric_type_scope(tx, type_id)?;
            if scope != owner.kind {
                return Err(AppError::Config(format!(
                    "metric type {type_id} is {scope} scoped but owner is {}",
                    owner.kind
                )));
            }
            supersede_active_claims(tx, type_id, owner, now)?;
            insert_claim(tx, type_id, owner, value, ClaimSource::Explicit, now)
        })?;

        self.get_claim(&claim_id)?
            .ok_or_else(|| AppError::Internal(format!("claim {claim_id} vanished after insert")))
    }

    pub fn get_claim(&self, id: &str) -> AppResult<Option<Claim>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!("SELECT {CLAIM_COLUMNS} FROM metric_claims WHERE id = ?1"),
            [id],
            parse_claim_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Marks one claim STALE without a replacement. Retiring a claim that is
    /// already stale leaves it untouched.
    pub fn retire_claim(&self, claim_id: &str, owner: &OwnerRef) -> AppResult<Claim> {
        let claim = self
            .get_claim(claim_id)?
            .ok_or_else(|| AppError::NotFound(format!("claim {claim_id}")))?;
        if claim.owner != *owner {
            return Err(AppError::InvalidData(format!(
                "claim {claim_id} belongs to {} not {owner}",
                claim.owner
            )));
        }
        if claim.status == ClaimStatus::Stale {
            return Ok(claim);
        }

        let now = format_time(Utc::now());
        self.connection()?.execute(
            "UPDATE metric_claims SET status = ?1, valid_to = ?2, updated_at = ?2
             WHERE id = ?3 AND status = 'ACTIVE'",
            params![ClaimStatus::Stale.as_str(), now, claim_id],
        )?;
        tracing::info!(claim_id = %claim_id, owner = %owner, "claim retired");

        self.get_claim(claim_id)?
            .ok_or_else(|| AppError::NotFound(format!("claim {claim_id}")))
    }
}

// ─── Statements shared by registrar and reconciler ─────────────────────────
//
// These take a bare connection so callers can compose them inside one
// transaction (`Transaction` derefs to `Connection`).

pub fn find_metric_type_id(conn: &Connection, key: &str, scope: Scope) -> AppResult<Option<String>> {
    conn.query_row(
        "SELECT id FROM metric_types WHERE key = ?1 AND scope = ?2",
        params![key, scope.as_str()],
        |row| row.get(0),
    )
    .optional()
    .map_err(AppError::from)
}

pub fn insert_metric_type_if_absent(conn: &Connection, spec: &MetricSpec, now: DateTime<Utc>) -> AppResult<usize> {
    let now = format_time(now);
    let inserted = conn.execute(
        "INSERT INTO metric_types
           (id, key, scope, value_type, unit, granularity, update_policy, decay_days, description, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, ?7, NULL, ?8, ?8)
         ON CONFLICT(key, scope) DO NOTHING",
        params![
            Uuid::new_v4().to_string(),
            spec.key,
            spec.scope.as_str(),
            spec.value_type.as_str(),
            spec.granularity.as_str(),
            UpdatePolicy::Derived.as_str(),
            spec.decay_days,
            now,
        ],
    )?;
    Ok(inserted)
}

pub fn metric_type_decay_days(conn: &Connection, type_id: &str) -> AppResult<Option<u32>> {
    let raw: Option<Option<i64>> = conn
        .query_row(
            "SELECT decay_days FROM metric_types WHERE id = ?1",
            [type_id],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(days) => Ok(days.and_then(|days| u32::try_from(days).ok())),
        None => Err(AppError::NotFound(format!("metric type {type_id}"))),
    }
}

pub fn metric_type_scope(conn: &Connection, type_id: &str) -> AppResult<Scope> {
    let raw: Option<String> = conn
        .query_row("SELECT scope FROM metric_types WHERE id = ?1", [type_id], |row| row.get(0))
        .optional()?;
    let raw = raw.ok_or_else(|| AppError::NotFound(format!("metric type {type_id}")))?;
    parse_scope(&raw).map_err(AppError::from)
}

pub fn find_snapshot_id(
    conn: &Connection,
    type_id: &str,
    owner: &OwnerRef,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> AppResult<Option<String>> {
    conn.query_row(
        "SELECT id FROM metric_snapshots
         WHERE type_id = ?1 AND owner_kind = ?2 AND owner_id = ?3
           AND window_start = ?4 AND window_end = ?5",
        params![
            type_id,
            owner.kind.as_str(),
            owner.id,
            format_time(window_start),
            format_time(window_end)
        ],
        |row| row.get(0),
    )
    .optional()
    .map_err(AppError::from)
}

pub fn update_snapshot_value(conn: &Connection, id: &str, value: f64, computed_at: DateTime<Utc>) -> AppResult<()> {
    conn.execute(
        "UPDATE metric_snapshots SET value_num = ?1, computed_at = ?2 WHERE id = ?3",
        params![value, format_time(computed_at), id],
    )?;
    Ok(())
}

pub fn insert_snapshot(
    conn: &Connection,
    type_id: &str,
    owner: &OwnerRef,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    value: f64,
    computed_at: DateTime<Utc>,
) -> AppResult<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO metric_snapshots
           (id, type_id, owner_kind, owner_id, window_start, window_end, value_num, computed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            type_id,
            owner.kind.as_str(),
            owner.id,
            format_time(window_start),
            format_time(window_end),
            value,
            format_time(computed_at),
        ],
    )?;
    Ok(id)
}

pub fn find_active_claim(conn: &Connection, type_id: &str, owner: &OwnerRef) -> AppResult<Option<(String, Option<f64>)>> {
    conn.query_row(
        "SELECT id, value_num FROM metric_claims
         WHERE type_id = ?1 AND owner_kind = ?2 AND owner_id = ?3 AND status = 'ACTIVE'
         ORDER BY updated_at DESC, created_at DESC
         LIMIT 1",
        params![type_id, owner.kind.as_str(), owner.id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(AppError::from)
}

pub fn update_claim_value(conn: &Connection, id: &str, value: f64, now: DateTime<Utc>) -> AppResult<()> {
    conn.execute(
        "UPDATE metric_claims SET value_num = ?1, updated_at = ?2 WHERE id = ?3",
        params![value, format_time(now), id],
    )?;
    Ok(())
}

pub fn insert_claim(
    conn: &Connection,
    type_id: &str,
    owner: &OwnerRef,
    value: f64,
    source: ClaimSource,
    now: DateTime<Utc>,
) -> AppResult<String> {
    let id = Uuid::new_v4().to_string();
    let now = format_time(now);
    conn.execute(
        "INSERT INTO metric_claims
           (id, type_id, owner_kind, owner_id, value_num, source, status, valid_from, valid_to, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?8, ?8)",
        params![
            id,
            type_id,
            owner.kind.as_str(),
            owner.id,
            value,
            source.as_str(),
            ClaimStatus::Active.as_str(),
            now,
        ],
    )?;
    Ok(id)
}

pub fn supersede_active_claims(conn: &Connection, type_id: &str, owner: &OwnerRef, now: DateTime<Utc>) -> AppResult<usize> {
    let now = format_time(now);
    let changed = conn.execute(
        "UPDATE metric_claims SET status = ?1, valid_to = ?2, updated_at = ?2
         WHERE type_id = ?3 AND owner_kind = ?4 AND owner_id = ?5 AND status = 'ACTIVE'",
        params![ClaimStatus::Stale.as_str(), now, type_id, owner.kind.as_str(), owner.id],
    )?;
    Ok(changed)
}

// ─── Row parsing ────────────────────────────────────────────────────────────

// Fixed-width UTC so stored timestamps compare correctly as text.
pub fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| invalid_text(error.to_string()))
}

fn parse_optional_time(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|raw| parse_time(&raw)).transpose()
}

fn invalid_text(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_scope(raw: &str) -> rusqlite::Result<Scope> {
    match raw {
        "WORKSPACE" => Ok(Scope::Workspace),
        "USER" => Ok(Scope::User),
        other => Err(invalid_text(format!("Unknown scope '{}'", other))),
    }
}

fn parse_value_type(raw: &str) -> rusqlite::Result<ValueType> {
    match raw {
        "NUMBER" => Ok(ValueType::Number),
        "DURATION_MS" => Ok(ValueType::DurationMs),
        "RATIO" => Ok(ValueType::Ratio),
        other => Err(invalid_text(format!("Unsupported value type '{}'", other))),
    }
}

fn parse_granularity(raw: &str) -> rusqlite::Result<Granularity> {
    match raw {
        "daily" => Ok(Granularity::Daily),
        other => Err(invalid_text(format!("Unsupported granularity '{}'", other))),
    }
}

fn parse_update_policy(raw: &str) -> rusqlite::Result<UpdatePolicy> {
    match raw {
        "derived" => Ok(UpdatePolicy::Derived),
        other => Err(invalid_text(format!("Unsupported update policy '{}'", other))),
    }
}

fn parse_claim_status(raw: &str) -> rusqlite::Result<ClaimStatus> {
    match raw {
        "ACTIVE" => Ok(ClaimStatus::Active),
        "STALE" => Ok(ClaimStatus::Stale),
        other => Err(invalid_text(format!("Unknown claim status '{}'", other))),
    }
}

fn parse_claim_source(raw: &str) -> rusqlite::Result<ClaimSource> {
    match raw {
        "INFERRED" => Ok(ClaimSource::Inferred),
        "EXPLICIT" => Ok(ClaimSource::Explicit),
        other => Err(invalid_text(format!("Unknown claim source '{}'", other))),
    }
}

fn parse_task_status(raw: &str) -> rusqlite::Result<TaskStatus> {
    match raw {
        "BACKLOG" => Ok(TaskStatus::Backlog),
        "SPRINT" => Ok(TaskStatus::Sprint),
        "DONE" => Ok(TaskStatus::Done),
        other => Err(invalid_text(format!("Unknown task status '{}'", other))),
    }
}

fn parse_owner(kind: &str, id: String) -> rusqlite::Result<OwnerRef> {
    Ok(OwnerRef {
        kind: parse_scope(kind)?,
        id,
    })
}

fn parse_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskFact> {
    Ok(TaskFact {
        id: row.get(0)?,
        created_at: parse_time(&row.get::<_, String>(1)?)?,
        updated_at: parse_time(&row.get::<_, String>(2)?)?,
        status: parse_task_status(&row.get::<_, String>(3)?)?,
        due_date: parse_optional_time(row.get(4)?)?,
    })
}

fn parse_metric_type_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricType> {
    Ok(MetricType {
        id: row.get(0)?,
        key: row.get(1)?,
        scope: parse_scope(&row.get::<_, String>(2)?)?,
        value_type: parse_value_type(&row.get::<_, String>(3)?)?,
        granularity: parse_granularity(&row.get::<_, String>(4)?)?,
        update_policy: parse_update_policy(&row.get::<_, String>(5)?)?,
        decay_days: row
            .get::<_, Option<i64>>(6)?
            .and_then(|days| u32::try_from(days).ok()),
        unit: row.get(7)?,
        description: row.get(8)?,
        created_at: parse_time(&row.get::<_, String>(9)?)?,
        updated_at: parse_time(&row.get::<_, String>(10)?)?,
    })
}

fn parse_metric_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricSnapshot> {
    Ok(MetricSnapshot {
        id: row.get(0)?,
        type_id: row.get(1)?,
        owner: parse_owner(&row.get::<_, String>(2)?, row.get(3)?)?,
        window_start: parse_time(&row.get::<_, String>(4)?)?,
        window_end: parse_time(&row.get::<_, String>(5)?)?,
        value: row.get(6)?,
        computed_at: parse_time(&row.get::<_, String>(7)?)?,
    })
}

fn parse_claim_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Claim> {
    Ok(Claim {
        id: row.get(0)?,
        type_id: row.get(1)?,
        owner: parse_owner(&row.get::<_, String>(2)?, row.get(3)?)?,
        value: row.get(4)?,
        source: parse_claim_source(&row.get::<_, String>(5)?)?,
        status: parse_claim_status(&row.get::<_, String>(6)?)?,
        valid_from: parse_time(&row.get::<_, String>(7)?)?,
        valid_to: parse_optional_time(row.get(8)?)?,
        created_at: parse_time(&row.get::<_, String>(9)?)?,
        updated_at: parse_time(&row.get::<_, String>(10)?)?,
    })
}
