use chrono::{DateTime, Duration, TimeZone, Utc};
use task_memory_metrics_lib::catalog::{
    AI_TRUST_STATE, DEADLINE_ADHERENCE_30D, FLOW_STATE, LEAD_TIME_MEDIAN_30D, THROUGHPUT_14D, WIP_AVG_14D,
};
use task_memory_metrics_lib::models::{ClaimSource, NewTaskPayload, OwnerRef, Scope, TaskStatus};
use task_memory_metrics_lib::{Database, MetricCatalog, MetricsJob};

const DAY_MS: f64 = 86_400_000.0;

fn run_clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 3, 30, 0).single().expect("valid time")
}

fn task(workspace: &str, user: Option<&str>, status: TaskStatus, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> NewTaskPayload {
    NewTaskPayload {
        id: None,
        workspace_id: workspace.to_string(),
        user_id: user.map(ToString::to_string),
        status,
        points: None,
        created_at,
        updated_at,
        due_date: None,
    }
}

/// Three tasks finished in the last two weeks with lead times of one, two and
/// three days, plus two tasks in progress.
fn seed_reference_workspace(db: &Database) {
    db.insert_workspace("ws-1", "Platform").expect("workspace");
    db.insert_user("user-1", "Ada").expect("user");
    seed_tasks(db, "ws-1", Some("user-1"));
}

fn seed_tasks(db: &Database, workspace: &str, assignee: Option<&str>) {
    let now = run_clock();
    for (offset, lead_days) in [(1, 1), (3, 2), (5, 3)] {
        let updated_at = now - Duration::days(offset);
        db.insert_task(task(
            workspace,
            assignee,
            TaskStatus::Done,
            updated_at - Duration::days(lead_days),
            updated_at,
        ))
        .expect("done task");
    }
    for _ in 0..2 {
        db.insert_task(task(
            workspace,
            None,
            TaskStatus::Sprint,
            now - Duration::days(4),
            now - Duration::days(1),
        ))
        .expect("sprint task");
    }
    db.insert_task(task(
        workspace,
        None,
        TaskStatus::Backlog,
        now - Duration::days(40),
        now - Duration::days(40),
    ))
    .expect("backlog task");
}

#[test]
fn reference_scenario_records_expected_values() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::new(&dir.path().join("metrics.db")).expect("db");
    seed_reference_workspace(&db);

    let job = MetricsJob::new(&db, MetricCatalog::default());
    let report = job.run_at(run_clock()).expect("run");
    assert_eq!(report.workspaces, 1);
    assert_eq!(report.users, 1);

    let registry = job.register_types().expect("registry");
    let workspace = OwnerRef::workspace("ws-1");
    let latest = |key: &str| {
        let type_id = registry.require(key, Scope::Workspace).expect("type id");
        db.list_snapshots(type_id, &workspace)
            .expect("snapshots")
            .first()
            .and_then(|snapshot| snapshot.value)
    };

    assert_eq!(latest(THROUGHPUT_14D), Some(3.0));
    assert_eq!(latest(LEAD_TIME_MEDIAN_30D), Some(2.0 * DAY_MS));
    assert_eq!(latest(DEADLINE_ADHERENCE_30D), None);
    assert_eq!(latest(WIP_AVG_14D), Some(2.0));
    assert_eq!(latest(AI_TRUST_STATE), None);
    let flow = latest(FLOW_STATE).expect("flow state");
    assert!((flow - (4.0 / 3.0 - 0.2)).abs() < 1e-9);

    // User scope sees only its own tasks and never records flow state.
    let user = OwnerRef::user("user-1");
    let user_wip = registry.require(WIP_AVG_14D, Scope::User).expect("type id");
    let user_snapshots = db.list_snapshots(user_wip, &user).expect("snapshots");
    assert_eq!(user_snapshots[0].value, Some(0.0));
    assert!(registry.get(FLOW_STATE, Scope::User).is_none());
}

#[test]
fn rerunning_the_same_day_converges() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::new(&dir.path().join("metrics.db")).expect("db");
    seed_reference_workspace(&db);

    let job = MetricsJob::new(&db, MetricCatalog::default());
    let first = job.run_at(run_clock()).expect("first run");
    let second = job.run_at(run_clock() + Duration::hours(6)).expect("second run");
    assert_eq!(first, second);

    let registry = job.register_types().expect("registry");
    let workspace = OwnerRef::workspace("ws-1");
    let flow_type = registry.require(FLOW_STATE, Scope::Workspace).expect("type id");

    let snapshots = db.list_snapshots(flow_type, &workspace).expect("snapshots");
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].computed_at, run_clock() + Duration::hours(6));

    let claims = db.list_claims(flow_type, &workspace).expect("claims");
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].source, ClaimSource::Inferred);
    let expected = 4.0 / 3.0 - 0.2;
    assert!((claims[0].value.expect("claim value") - expected).abs() < 1e-9);

    let trust_type = registry.require(AI_TRUST_STATE, Scope::Workspace).expect("type id");
    assert!(db.get_active_claim(trust_type, &workspace).expect("claim").is_none());
}

#[test]
fn claims_decay_toward_new_observations_across_days() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::new(&dir.path().join("metrics.db")).expect("db");
    seed_reference_workspace(&db);

    let job = MetricsJob::new(&db, MetricCatalog::default());
    job.run_at(run_clock()).expect("day one");

    let registry = job.register_types().expect("registry");
    let workspace = OwnerRef::workspace("ws-1");
    let wip_type = registry.require(WIP_AVG_14D, Scope::Workspace).expect("type id");

    // Two more tasks enter the sprint before the next run.
    for _ in 0..2 {
        db.insert_task(task(
            "ws-1",
            None,
            TaskStatus::Sprint,
            run_clock(),
            run_clock(),
        ))
        .expect("sprint task");
    }
    job.run_at(run_clock() + Duration::days(1)).expect("day two");

    let claim = db
        .get_active_claim(wip_type, &workspace)
        .expect("claim")
        .expect("claim exists");
    let value = claim.value.expect("claim value");
    assert!(value > 2.0 && value < 4.0, "claim {value} should sit between observations");
    assert_eq!(db.list_snapshots(wip_type, &workspace).expect("snapshots").len(), 2);
}

#[test]
fn failing_owner_rolls_back_alone() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("metrics.db");
    let db = Database::new(&path).expect("db");
    seed_reference_workspace(&db);
    db.insert_workspace("ws-2", "Research").expect("workspace");
    seed_tasks(&db, "ws-2", None);

    // Flow state is the last metric ws-2 writes, after its other snapshots and
    // claims already went through inside the same transaction.
    let side = rusqlite::Connection::open(&path).expect("side connection");
    side.execute_batch(
        "CREATE TRIGGER reject_ws2_flow_claim BEFORE INSERT ON metric_claims
         WHEN NEW.owner_id = 'ws-2'
          AND NEW.type_id = (SELECT id FROM metric_types WHERE key = 'flow_state' AND scope = 'WORKSPACE')
         BEGIN
           SELECT RAISE(ABORT, 'flow claims rejected');
         END;",
    )
    .expect("trigger");
    drop(side);

    let job = MetricsJob::new(&db, MetricCatalog::default());
    let result = job.run_at(run_clock());
    assert!(result.is_err());

    let registry = job.register_types().expect("registry");
    let committed = OwnerRef::workspace("ws-1");
    let failed = OwnerRef::workspace("ws-2");
    for key in [THROUGHPUT_14D, LEAD_TIME_MEDIAN_30D, WIP_AVG_14D, FLOW_STATE] {
        let type_id = registry.require(key, Scope::Workspace).expect("type id");
        assert_eq!(db.list_snapshots(type_id, &committed).expect("snapshots").len(), 1, "{key}");
        assert_eq!(db.list_claims(type_id, &committed).expect("claims").len(), 1, "{key}");
        assert!(db.list_snapshots(type_id, &failed).expect("snapshots").is_empty(), "{key}");
        assert!(db.list_claims(type_id, &failed).expect("claims").is_empty(), "{key}");
    }

    // Users come after workspaces, so the aborted run never reached them.
    let user_type = registry.require(THROUGHPUT_14D, Scope::User).expect("type id");
    assert!(db
        .list_snapshots(user_type, &OwnerRef::user("user-1"))
        .expect("snapshots")
        .is_empty());
}
