use crate::errors::{AppError, AppResult};
use crate::models::{MetricSpec, Scope, ValueType};
use std::collections::HashSet;

pub const THROUGHPUT_14D: &str = "throughput_14d";
pub const LEAD_TIME_MEDIAN_30D: &str = "lead_time_median_30d";
pub const DEADLINE_ADHERENCE_30D: &str = "deadline_adherence_30d";
pub const WIP_AVG_14D: &str = "wip_avg_14d";
pub const FLOW_STATE: &str = "flow_state";
pub const AI_TRUST_STATE: &str = "ai_trust_state";

#[derive(Debug, Clone)]
pub struct MetricCatalog {
    specs: Vec<MetricSpec>,
}

impl MetricCatalog {
    pub fn new(specs: Vec<MetricSpec>) -> AppResult<Self> {
        let mut seen = HashSet::new();
        for spec in &specs {
            if spec.key.trim().is_empty() {
                return Err(AppError::Config("metric key must not be empty".to_string()));
            }
            if spec.decay_days == 0 {
                return Err(AppError::Config(format!(
                    "metric '{}' ({}) has a zero decay window",
                    spec.key, spec.scope
                )));
            }
            if !seen.insert((spec.key.as_str(), spec.scope)) {
                return Err(AppError::Config(format!(
                    "duplicate metric definition '{}' ({})",
                    spec.key, spec.scope
                )));
            }
        }
        Ok(Self { specs })
    }

    pub fn list_specs(&self) -> &[MetricSpec] {
        &self.specs
    }

    pub fn find(&self, key: &str, scope: Scope) -> Option<&MetricSpec> {
        self.specs
            .iter()
            .find(|spec| spec.key == key && spec.scope == scope)
    }

    pub fn specs_for_scope(&self, scope: Scope) -> impl Iterator<Item = &MetricSpec> {
        self.specs.iter().filter(move |spec| spec.scope == scope)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl Default for MetricCatalog {
    fn default() -> Self {
        Self {
            specs: vec![
                MetricSpec::daily(THROUGHPUT_14D, Scope::Workspace, ValueType::Number, 14),
                MetricSpec::daily(LEAD_TIME_MEDIAN_30D, Scope::Workspace, ValueType::DurationMs, 30),
                MetricSpec::daily(DEADLINE_ADHERENCE_30D, Scope::Workspace, ValueType::Ratio, 30),
                MetricSpec::daily(WIP_AVG_14D, Scope::Workspace, ValueType::Number, 14),
                MetricSpec::daily(THROUGHPUT_14D, Scope::User, ValueType::Number, 14),
                MetricSpec::daily(LEAD_TIME_MEDIAN_30D, Scope::User, ValueType::DurationMs, 30),
                MetricSpec::daily(DEADLINE_ADHERENCE_30D, Scope::User, ValueType::Ratio, 30),
                MetricSpec::daily(WIP_AVG_14D, Scope::User, ValueType::Number, 14),
                MetricSpec::daily(FLOW_STATE, Scope::Workspace, ValueType::Number, 30),
                MetricSpec::daily(AI_TRUST_STATE, Scope::Workspace, ValueType::Number, 30),
            ],
        }
    }
}
