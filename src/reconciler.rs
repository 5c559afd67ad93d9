use crate::db;
use crate::decay::{alpha_for_decay, blend, DEFAULT_DECAY_DAYS};
use crate::errors::{AppError, AppResult};
use crate::models::{ClaimSource, OwnerRef};
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use rusqlite::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// The UTC day containing `now`, from its midnight to the next one.
pub fn snapshot_window(now: DateTime<Utc>) -> SnapshotWindow {
    let day_start = Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN));
    SnapshotWindow {
        start: day_start,
        end: day_start + Duration::days(1),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotWrite {
    Inserted { id: String },
    Updated { id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimMerge {
    pub claim_id: String,
    pub previous: Option<f64>,
    pub value: f64,
    pub alpha: f64,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Skipped,
    Written {
        window: SnapshotWindow,
        snapshot: SnapshotWrite,
        claim: ClaimMerge,
    },
}

impl ReconcileOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }
}

pub fn reconcile(
    conn: &Connection,
    type_id: &str,
    owner: &OwnerRef,
    value: Option<f64>,
    now: DateTime<Utc>,
) -> AppResult<ReconcileOutcome> {
    let Some(value) = value else {
        return Ok(ReconcileOutcome::Skipped);
    };
    if !value.is_finite() {
        return Err(AppError::InvalidData(format!(
            "refusing to record non-finite value {value} for {owner}"
        )));
    }

    let scope = db::metric_type_scope(conn, type_id)?;
    if scope != owner.kind {
        return Err(AppError::Config(format!(
            "metric type {type_id} is {scope} scoped but owner is {owner}"
        )));
    }

    let window = snapshot_window(now);
    let snapshot = upsert_snapshot(conn, type_id, owner, window, value, now)?;
    let claim = merge_claim(conn, type_id, owner, value, now)?;

    tracing::debug!(
        type_id = %type_id,
        owner = %owner,
        value,
        claim_value = claim.value,
        "reconciled metric"
    );

    Ok(ReconcileOutcome::Written {
        window,
        snapshot,
        claim,
    })
}

fn upsert_snapshot(
    conn: &Connection,
    type_id: &str,
    owner: &OwnerRef,
    window: SnapshotWindow,
    value: f64,
    now: DateTime<Utc>,
) -> AppResult<SnapshotWrite> {
    match db::find_snapshot_id(conn, type_id, owner, window.start, window.end)? {
        Some(id) => {
            db::update_snapshot_value(conn, &id, value, now)?;
            Ok(SnapshotWrite::Updated { id })
        }
        None => {
            let id = db::insert_snapshot(conn, type_id, owner, window.start, window.end, value, now)?;
            Ok(SnapshotWrite::Inserted { id })
        }
    }
}

fn merge_claim(
    conn: &Connection,
    type_id: &str,
    owner: &OwnerRef,
    value: f64,
    now: DateTime<Utc>,
) -> AppResult<ClaimMerge> {
    let decay_days = db::metric_type_decay_days(conn, type_id)?.unwrap_or(DEFAULT_DECAY_DAYS);
    let alpha = alpha_for_decay(decay_days);

    match db::find_active_claim(conn, type_id, owner)? {
        Some((claim_id, previous)) => {
            // A claim stored without a value blends as zero.
            let merged = blend(previous.unwrap_or(0.0), value, alpha);
            db::update_claim_value(conn, &claim_id, merged, now)?;
            Ok(ClaimMerge {
                claim_id,
                previous,
                value: merged,
                alpha,
                created: false,
            })
        }
        None => {
            let claim_id = db::insert_claim(conn, type_id, owner, value, ClaimSource::Inferred, now)?;
            Ok(ClaimMerge {
                claim_id,
                previous: None,
                value,
                alpha,
                created: true,
            })
        }
    }
}
