use crate::db::DEFAULT_BUSY_TIMEOUT_MS;
use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobConfig {
    pub database_path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
    pub log_filter: String,
    pub log_dir: Option<PathBuf>,
    pub dry_run: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            log_filter: "info".to_string(),
            log_dir: None,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub database_path: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub dry_run: bool,
}

impl JobConfig {
    pub fn from_file(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("cannot read {}: {err}", path.to_string_lossy())))?;
        serde_json::from_str(&raw)
            .map_err(|err| AppError::Config(format!("invalid config {}: {err}", path.to_string_lossy())))
    }

    pub fn load(file: Option<&Path>, overrides: ConfigOverrides) -> AppResult<Self> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(path) = overrides.database_path {
            self.database_path = Some(path);
        }
        if let Some(dir) = overrides.log_dir {
            self.log_dir = Some(dir);
        }
        self.dry_run |= overrides.dry_run;
    }

    pub fn validate(&self) -> AppResult<()> {
        match &self.database_path {
            Some(path) if !path.as_os_str().is_empty() => {}
            _ => return Err(AppError::Config("database path is required".to_string())),
        }
        if self.log_filter.trim().is_empty() {
            return Err(AppError::Config("log filter must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn database_path(&self) -> AppResult<&Path> {
        self.database_path
            .as_deref()
            .ok_or_else(|| AppError::Config("database path is required".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigOverrides, JobConfig};
    use std::path::PathBuf;

    #[test]
    fn missing_database_path_is_a_config_error() {
        let result = JobConfig::load(None, ConfigOverrides::default());
        assert!(matches!(result, Err(crate::errors::AppError::Config(_))));
    }

    #[test]
    fn overrides_win_over_file_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("job.json");
        std::fs::write(
            &file,
            serde_json::json!({
                "databasePath": "/from/file.db",
                "busyTimeoutMs": 250,
                "logFilter": "debug"
            })
            .to_string(),
        )
        .expect("write config");

        let config = JobConfig::load(
            Some(&file),
            ConfigOverrides {
                database_path: Some(PathBuf::from("/from/cli.db")),
                log_dir: None,
                dry_run: true,
            },
        )
        .expect("load");
        assert_eq!(config.database_path, Some(PathBuf::from("/from/cli.db")));
        assert_eq!(config.busy_timeout_ms, 250);
        assert_eq!(config.log_filter, "debug");
        assert!(config.dry_run);
    }

    #[test]
    fn unreadable_file_is_reported() {
        let result = JobConfig::from_file(std::path::Path::new("/definitely/not/here.json"));
        assert!(result.is_err());
    }
}
