//! Scanner configuration.
//!
//! All fields carry defaults so deployments only override what they tune.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, anyhow, bail};
use scanplane_model::PipelineId;
use serde::{Deserialize, Serialize};

use crate::lock::LockScope;

const CONFIG_PATH_ENV: &str = "SCANPLANE_CONFIG_PATH";
const CONFIG_JSON_ENV: &str = "SCANPLANE_CONFIG_JSON";
const DEFAULT_CONFIG_FILE: &str = "scanplane.toml";

/// Source that produced the scanner configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScannerConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Polling cadence (ms) between scanning cycles. Losing the lock race
    /// simply waits for the next tick.
    pub interval_ms: u64,
    /// Started checks older than this are reported as stuck.
    pub stuck_check_after_secs: u64,
    /// Restrict this scanner to one pipeline. Unset scans every pipeline under
    /// the global lock.
    pub pipeline_id: Option<PipelineId>,
    /// Insert attempts when an equivalent check finishes mid-insert.
    pub insert_retry_limit: u32,
    /// Check creations issued concurrently within one cycle.
    pub create_concurrency: usize,
    pub database: DatabaseConfig,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            stuck_check_after_secs: 60 * 60,
            pipeline_id: None,
            insert_retry_limit: 3,
            create_concurrency: 4,
            database: DatabaseConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Includes one connection per held scanning lock.
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl ScannerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stuck_check_after(&self) -> chrono::Duration {
        i64::try_from(self.stuck_check_after_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn lock_scope(&self) -> LockScope {
        self.pipeline_id
            .map_or(LockScope::Global, LockScope::Pipeline)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_ms == 0 {
            bail!("interval_ms must be greater than zero");
        }
        if self.insert_retry_limit == 0 {
            bail!("insert_retry_limit must be at least 1");
        }
        if self.create_concurrency == 0 {
            bail!("create_concurrency must be at least 1");
        }
        if self.database.max_connections < 2 {
            bail!(
                "database.max_connections must be at least 2 \
                 (one is pinned by the scanning lock)"
            );
        }
        Ok(())
    }

    /// Load scanner configuration.
    /// Evaluation order:
    /// 1) `$SCANPLANE_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$SCANPLANE_CONFIG_JSON` (inline JSON),
    /// 3) `scanplane.toml` in the working directory,
    /// 4) defaults.
    pub fn load_from_env() -> anyhow::Result<(Self, ScannerConfigSource)> {
        if let Ok(path_str) = env::var(CONFIG_PATH_ENV)
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, ScannerConfigSource::EnvPath(path)));
        }

        if let Ok(raw) = env::var(CONFIG_JSON_ENV)
            && !raw.trim().is_empty()
        {
            let parsed = Self::parse_json(&raw)
                .with_context(|| format!("failed to parse {CONFIG_JSON_ENV}"))?;
            return Ok((parsed, ScannerConfigSource::EnvInline));
        }

        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        if default_path.is_file() {
            let config = Self::load_from_file(&default_path)?;
            return Ok((config, ScannerConfigSource::File(default_path)));
        }

        Ok((Self::default(), ScannerConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read scanner config from {}", path.display())
        })?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents).with_context(|| {
                format!("invalid scanner config {}", path.display())
            })?,
            _ => toml::from_str(&contents).map_err(|err| {
                anyhow!("invalid scanner config {}: {}", path.display(), err)
            })?,
        };
        config.validate()?;
        Ok(config)
    }

    fn parse_json(raw: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }
}
