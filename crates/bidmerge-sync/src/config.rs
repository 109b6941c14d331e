use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bidmerge_core::SchemaRegistry;

#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub outputs_dir: PathBuf,
    /// Unset disables the destination-store copy entirely.
    pub database_url: Option<String>,
    pub db_timeout_secs: u64,
    pub io_timeout_secs: u64,
    pub profiles_file: Option<PathBuf>,
    pub web_port: u16,
}

impl MergeConfig {
    pub fn from_env() -> Self {
        Self {
            outputs_dir: std::env::var("BIDMERGE_OUTPUTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./outputs/gem")),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            db_timeout_secs: std::env::var("BIDMERGE_DB_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            io_timeout_secs: std::env::var("BIDMERGE_IO_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            profiles_file: std::env::var("BIDMERGE_PROFILES_FILE").ok().map(PathBuf::from),
            web_port: std::env::var("BIDMERGE_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5002),
        }
    }

    /// Defaults rooted at `outputs_dir`, with no destination store.
    pub fn with_outputs_dir(outputs_dir: impl Into<PathBuf>) -> Self {
        Self {
            outputs_dir: outputs_dir.into(),
            database_url: None,
            db_timeout_secs: 10,
            io_timeout_secs: 120,
            profiles_file: None,
            web_port: 5002,
        }
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_secs(self.db_timeout_secs.max(1))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs.max(1))
    }

    /// The built-in registry, or the YAML file named by `profiles_file`.
    pub fn load_registry(&self) -> Result<SchemaRegistry> {
        let registry = match &self.profiles_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_yaml::from_str::<SchemaRegistry>(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => SchemaRegistry::builtin(),
        };
        registry.validate().context("validating schema registry")?;
        Ok(registry)
    }
}
