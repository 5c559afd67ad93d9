use crate::catalog::{AI_TRUST_STATE, DEADLINE_ADHERENCE_30D, FLOW_STATE, LEAD_TIME_MEDIAN_30D, THROUGHPUT_14D, WIP_AVG_14D};
use crate::models::{Scope, TaskFact, TaskStatus};
use chrono::{DateTime, Duration, Utc};

pub const MS_PER_DAY: f64 = 86_400_000.0;
pub const THROUGHPUT_WINDOW_DAYS: i64 = 14;
pub const LEAD_TIME_WINDOW_DAYS: i64 = 30;

const WIP_PENALTY: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct WindowSummary<'a> {
    pub window_days: i64,
    pub done: Vec<&'a TaskFact>,
}

impl WindowSummary<'_> {
    pub fn throughput(&self) -> u64 {
        self.done.len() as u64
    }

    pub fn lead_time_median(&self) -> Option<f64> {
        lead_time_median(&self.done)
    }

    pub fn deadline_adherence(&self) -> Option<f64> {
        deadline_adherence(&self.done)
    }
}

pub fn summarize_window(tasks: &[TaskFact], window_days: i64, now: DateTime<Utc>) -> WindowSummary<'_> {
    let cutoff = now - Duration::days(window_days);
    let done = tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Done)
        .filter(|task| task.updated_at >= cutoff && task.updated_at <= now)
        .collect();
    WindowSummary { window_days, done }
}

pub fn throughput(tasks: &[TaskFact], window_days: i64, now: DateTime<Utc>) -> u64 {
    summarize_window(tasks, window_days, now).throughput()
}

pub fn lead_time_median(done: &[&TaskFact]) -> Option<f64> {
    let mut lead_times: Vec<f64> = done
        .iter()
        .map(|task| (task.updated_at - task.created_at).num_milliseconds() as f64)
        .collect();
    median(&mut lead_times)
}

pub fn deadline_adherence(done: &[&TaskFact]) -> Option<f64> {
    let (due, on_time) = done
        .iter()
        .filter_map(|task| task.due_date.map(|due_date| task.updated_at <= due_date))
        .fold((0u64, 0u64), |(due, on_time), hit| (due + 1, on_time + u64::from(hit)));
    if due == 0 {
        return None;
    }
    Some(on_time as f64 / due as f64)
}

pub fn wip(tasks: &[TaskFact]) -> u64 {
    tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Sprint)
        .count() as u64
}

pub fn flow_state(lead_time_ms: Option<f64>, wip: u64, throughput: u64) -> Option<f64> {
    let lead_days = lead_time_ms? / MS_PER_DAY;
    if lead_days <= 0.0 || lead_days.is_nan() {
        return None;
    }
    let raw = (throughput as f64 + 1.0) / (lead_days + 1.0) - WIP_PENALTY * wip as f64;
    Some(raw.max(0.0))
}

// No approval/apply signal is recorded yet.
pub fn ai_trust_state() -> Option<f64> {
    None
}

pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OwnerMetrics {
    pub scope: Scope,
    pub throughput_14d: u64,
    pub lead_time_median_30d: Option<f64>,
    pub deadline_adherence_30d: Option<f64>,
    pub wip: u64,
    pub flow_state: Option<f64>,
    pub ai_trust_state: Option<f64>,
}

impl OwnerMetrics {
    pub fn values(&self) -> Vec<(&'static str, Option<f64>)> {
        let mut values = vec![
            (THROUGHPUT_14D, Some(self.throughput_14d as f64)),
            (LEAD_TIME_MEDIAN_30D, self.lead_time_median_30d),
            (DEADLINE_ADHERENCE_30D, self.deadline_adherence_30d),
            (WIP_AVG_14D, Some(self.wip as f64)),
        ];
        if self.scope == Scope::Workspace {
            values.push((FLOW_STATE, self.flow_state));
            values.push((AI_TRUST_STATE, self.ai_trust_state));
        }
        values
    }
}

pub fn compute_owner_metrics(tasks: &[TaskFact], scope: Scope, now: DateTime<Utc>) -> OwnerMetrics {
    let month = summarize_window(tasks, LEAD_TIME_WINDOW_DAYS, now);
    let throughput_14d = throughput(tasks, THROUGHPUT_WINDOW_DAYS, now);
    let lead_time_median_30d = month.lead_time_median();
    let wip = wip(tasks);
    let (flow_state, ai_trust_state) = match scope {
        Scope::Workspace => (flow_state(lead_time_median_30d, wip, throughput_14d), ai_trust_state()),
        Scope::User => (None, None),
    };

    OwnerMetrics {
        scope,
        throughput_14d,
        lead_time_median_30d,
        deadline_adherence_30d: month.deadline_adherence(),
        wip,
        flow_state,
        ai_trust_state,
    }
}
