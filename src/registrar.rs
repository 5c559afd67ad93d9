use crate::catalog::MetricCatalog;
use crate::db::{self, Database};
use crate::errors::{AppError, AppResult};
use crate::models::{MetricSpec, Scope};
use chrono::Utc;
use rusqlite::Connection;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    ids: HashMap<(String, Scope), String>,
}

impl TypeRegistry {
    pub fn get(&self, key: &str, scope: Scope) -> Option<&str> {
        self.ids.get(&(key.to_string(), scope)).map(String::as_str)
    }

    pub fn require(&self, key: &str, scope: Scope) -> AppResult<&str> {
        self.get(key, scope)
            .ok_or_else(|| AppError::Config(format!("metric type '{key}' ({scope}) is not registered")))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

pub struct TypeRegistrar<'a> {
    db: &'a Database,
}

impl<'a> TypeRegistrar<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn ensure_type(&self, spec: &MetricSpec) -> AppResult<String> {
        self.db.with_transaction(|tx| ensure_type_in(tx, spec))
    }

    pub fn ensure_all(&self, catalog: &MetricCatalog) -> AppResult<TypeRegistry> {
        let ids = self.db.with_transaction(|tx| {
            let mut ids = HashMap::with_capacity(catalog.len());
            for spec in catalog.list_specs() {
                let id = ensure_type_in(tx, spec)?;
                ids.insert((spec.key.clone(), spec.scope), id);
            }
            Ok(ids)
        })?;
        tracing::info!(count = ids.len(), "metric types registered");
        Ok(TypeRegistry { ids })
    }
}

// A concurrent writer may win the insert; the unique (key, scope) index makes
// ours a no-op and the refetch returns the winner's row.
pub fn ensure_type_in(conn: &Connection, spec: &MetricSpec) -> AppResult<String> {
    if let Some(id) = db::find_metric_type_id(conn, &spec.key, spec.scope)? {
        return Ok(id);
    }

    let inserted = db::insert_metric_type_if_absent(conn, spec, Utc::now())?;
    if inserted > 0 {
        tracing::debug!(metric = %spec.key, scope = %spec.scope, "created metric type");
    }

    db::find_metric_type_id(conn, &spec.key, spec.scope)?.ok_or_else(|| {
        AppError::Persistence(format!(
            "metric type '{}' ({}) missing after insert",
            spec.key, spec.scope
        ))
    })
}
