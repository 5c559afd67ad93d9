use crate::aggregator::compute_owner_metrics;
use crate::catalog::MetricCatalog;
use crate::db::Database;
use crate::errors::AppResult;
use crate::models::OwnerRef;
use crate::reconciler::{reconcile, ReconcileOutcome};
use crate::registrar::{TypeRegistrar, TypeRegistry};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub workspaces: usize,
    pub users: usize,
    pub written: usize,
    pub skipped: usize,
}

impl JobReport {
    fn absorb(&mut self, owner: &OwnerReport) {
        self.written += owner.written;
        self.skipped += owner.skipped;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReport {
    pub owner: OwnerRef,
    pub written: usize,
    pub skipped: usize,
}

pub struct MetricsJob<'a> {
    db: &'a Database,
    catalog: MetricCatalog,
    dry_run: bool,
}

impl<'a> MetricsJob<'a> {
    pub fn new(db: &'a Database, catalog: MetricCatalog) -> Self {
        Self {
            db,
            catalog,
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn register_types(&self) -> AppResult<TypeRegistry> {
        TypeRegistrar::new(self.db).ensure_all(&self.catalog)
    }

    pub fn run(&self) -> AppResult<JobReport> {
        self.run_at(Utc::now())
    }

    pub fn run_at(&self, now: DateTime<Utc>) -> AppResult<JobReport> {
        let registry = self.register_types()?;
        let workspaces = self.db.list_workspace_ids()?;
        let users = self.db.list_user_ids()?;
        tracing::info!(
            workspaces = workspaces.len(),
            users = users.len(),
            dry_run = self.dry_run,
            "metrics job started"
        );

        let mut report = JobReport::default();
        for workspace_id in &workspaces {
            let owner = self.run_for_owner(&registry, &OwnerRef::workspace(workspace_id.as_str()), now)?;
            report.absorb(&owner);
            report.workspaces += 1;
        }
        for user_id in &users {
            let owner = self.run_for_owner(&registry, &OwnerRef::user(user_id.as_str()), now)?;
            report.absorb(&owner);
            report.users += 1;
        }

        tracing::info!(
            workspaces = report.workspaces,
            users = report.users,
            written = report.written,
            skipped = report.skipped,
            "metrics job finished"
        );
        Ok(report)
    }

    /// Every metric of one owner commits or rolls back together.
    pub fn run_for_owner(&self, registry: &TypeRegistry, owner: &OwnerRef, now: DateTime<Utc>) -> AppResult<OwnerReport> {
        let tasks = self.db.list_tasks_for_owner(owner)?;
        let metrics = compute_owner_metrics(&tasks, owner.kind, now);
        tracing::debug!(owner = %owner, tasks = tasks.len(), ?metrics, "computed owner metrics");

        self.reconcile_values(registry, owner, &metrics.values(), now)
            .inspect_err(|error| {
                tracing::error!(owner = %owner, error = %error, "owner reconciliation failed");
            })
    }

    fn reconcile_values(
        &self,
        registry: &TypeRegistry,
        owner: &OwnerRef,
        values: &[(&str, Option<f64>)],
        now: DateTime<Utc>,
    ) -> AppResult<OwnerReport> {
        let work = |tx: &rusqlite::Transaction<'_>| -> AppResult<OwnerReport> {
            let mut report = OwnerReport {
                owner: owner.clone(),
                written: 0,
                skipped: 0,
            };
            for (key, value) in values {
                if self.catalog.find(key, owner.kind).is_none() {
                    continue;
                }
                let type_id = registry.require(key, owner.kind)?;
                match reconcile(tx, type_id, owner, *value, now)? {
                    ReconcileOutcome::Skipped => {
                        tracing::debug!(owner = %owner, metric = %key, "no value this run");
                        report.skipped += 1;
                    }
                    ReconcileOutcome::Written { claim, .. } => {
                        tracing::info!(
                            owner = %owner,
                            metric = %key,
                            value = value.unwrap_or_default(),
                            claim = claim.value,
                            "metric recorded"
                        );
                        report.written += 1;
                    }
                }
            }
            Ok(report)
        };

        if self.dry_run {
            self.db.with_discarded_transaction(work)
        } else {
            self.db.with_transaction(work)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MetricsJob;
    use crate::catalog::{MetricCatalog, FLOW_STATE, THROUGHPUT_14D};
    use crate::db::Database;
    use crate::models::{MetricSpec, NewTaskPayload, OwnerRef, Scope, TaskStatus, ValueType};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 20, 6, 0, 0).single().expect("valid time")
    }

    fn seeded_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("metrics.db")).expect("db");
        db.insert_workspace("ws-1", "Team").expect("workspace");
        db.insert_user("user-1", "Ada").expect("user");
        db.insert_task(NewTaskPayload {
            id: None,
            workspace_id: "ws-1".to_string(),
            user_id: Some("user-1".to_string()),
            status: TaskStatus::Done,
            points: None,
            created_at: now() - Duration::days(3),
            updated_at: now() - Duration::days(1),
            due_date: None,
        })
        .expect("task");
        (dir, db)
    }

    #[test]
    fn dry_run_persists_nothing_but_types() {
        let (_dir, db) = seeded_db();
        let job = MetricsJob::new(&db, MetricCatalog::default()).dry_run(true);
        let report = job.run_at(now()).expect("run");
        assert!(report.written > 0);

        let registry = job.register_types().expect("registry");
        let type_id = registry.require(THROUGHPUT_14D, Scope::Workspace).expect("type");
        assert!(db
            .list_snapshots(type_id, &OwnerRef::workspace("ws-1"))
            .expect("snapshots")
            .is_empty());
    }

    #[test]
    fn alternate_catalog_limits_written_metrics() {
        let (_dir, db) = seeded_db();
        let catalog = MetricCatalog::new(vec![MetricSpec::daily(
            THROUGHPUT_14D,
            Scope::Workspace,
            ValueType::Number,
            7,
        )])
        .expect("catalog");
        let job = MetricsJob::new(&db, catalog);
        let report = job.run_at(now()).expect("run");

        assert_eq!(report.workspaces, 1);
        assert_eq!(report.users, 1);
        assert_eq!(report.written, 1);
        assert_eq!(db.list_metric_types().expect("types").len(), 1);

        let registry = job.register_types().expect("registry");
        assert!(registry.get(FLOW_STATE, Scope::Workspace).is_none());
        let type_id = registry.require(THROUGHPUT_14D, Scope::Workspace).expect("type");
        let snapshots = db
            .list_snapshots(type_id, &OwnerRef::workspace("ws-1"))
            .expect("snapshots");
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].value, Some(1.0));
    }

    #[test]
    fn workspace_run_covers_every_workspace_metric() {
        let (_dir, db) = seeded_db();
        let job = MetricsJob::new(&db, MetricCatalog::default());
        let registry = job.register_types().expect("registry");

        let workspace = job
            .run_for_owner(&registry, &OwnerRef::workspace("ws-1"), now())
            .expect("workspace run");
        // throughput, lead time, wip and flow are written; adherence and ai trust have no value
        assert_eq!((workspace.written, workspace.skipped), (4, 2));

        let user = job
            .run_for_owner(&registry, &OwnerRef::user("user-1"), now())
            .expect("user run");
        assert_eq!((user.written, user.skipped), (3, 1));

        let report = job.run_at(now()).expect("run");
        assert_eq!((report.written, report.skipped), (7, 3));
    }
}
