//! Workflow configuration.
//!
//! Loaded from a TOML file, with `MAT_CONFIG_`-prefixed environment
//! variables optionally overriding individual values.

use std::collections::BTreeMap;
use std::path::PathBuf;

use figment::{
    providers::{Env, Format as _, Toml},
    Figment,
};
use serde::Deserialize;
use url::Url;

use crate::Error;

const ENV_PREFIX: &str = "MAT_CONFIG_";

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    /// Base connection URL; the database path segment is swapped per logical
    /// database.
    pub database_url: String,
    pub graph_service_url: String,
    pub volume_service_url: String,

    /// Chunk size for the resolution pipeline.
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: i64,

    /// Per-schema chunk-size overrides; high-row-count schemas get larger
    /// chunks.
    #[serde(default = "default_chunk_size_overrides")]
    pub chunk_size_overrides: BTreeMap<String, i64>,

    /// Parallel chunk tasks per workflow run.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Server-side cap on query result size.
    #[serde(default = "default_query_limit_ceiling")]
    pub query_limit_ceiling: i64,

    /// Template database frozen snapshot databases are created from.
    #[serde(default = "default_snapshot_template")]
    pub snapshot_template: String,

    /// Default lifetime of a frozen snapshot, in days. `None` never expires.
    #[serde(default)]
    pub days_to_expire: Option<i64>,
}

fn default_chunk_size() -> i64 {
    10_000
}

fn default_chunk_size_overrides() -> BTreeMap<String, i64> {
    BTreeMap::from([("synapse".to_owned(), 20_000)])
}

fn default_worker_concurrency() -> usize {
    8
}

fn default_query_limit_ceiling() -> i64 {
    query_engine::DEFAULT_LIMIT_CEILING
}

fn default_snapshot_template() -> String {
    "template_postgis".to_owned()
}

/// Parsed and validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Url,
    pub graph_service_url: Url,
    pub volume_service_url: Url,
    pub default_chunk_size: i64,
    pub chunk_size_overrides: BTreeMap<String, i64>,
    pub worker_concurrency: usize,
    pub query_limit_ceiling: i64,
    pub snapshot_template: String,
    pub days_to_expire: Option<i64>,
}

impl Config {
    /// Loads the config file, merging `MAT_CONFIG_`-prefixed env vars over it
    /// when `env_override` is set.
    pub fn load(file: impl Into<PathBuf>, env_override: bool) -> Result<Self, Error> {
        let path: PathBuf = file.into();
        let mut figment = Figment::new().merge(Toml::file(&path));
        if env_override {
            figment = figment.merge(Env::prefixed(ENV_PREFIX));
        }
        let file: ConfigFile = figment.extract().map_err(|err| Error::Config(err.to_string()))?;
        Self::from_file(file)
    }

    pub fn from_file(file: ConfigFile) -> Result<Self, Error> {
        let parse_url = |value: &str| {
            value
                .parse::<Url>()
                .map_err(|err| Error::Config(format!("invalid url {value}: {err}")))
        };
        Ok(Self {
            database_url: parse_url(&file.database_url)?,
            graph_service_url: parse_url(&file.graph_service_url)?,
            volume_service_url: parse_url(&file.volume_service_url)?,
            default_chunk_size: file.default_chunk_size,
            chunk_size_overrides: file.chunk_size_overrides,
            worker_concurrency: file.worker_concurrency,
            query_limit_ceiling: file.query_limit_ceiling,
            snapshot_template: file.snapshot_template,
            days_to_expire: file.days_to_expire,
        })
    }

    /// The chunk size for a schema type.
    pub fn chunk_size_for(&self, schema_type: &str) -> i64 {
        self.chunk_size_overrides
            .get(schema_type)
            .copied()
            .unwrap_or(self.default_chunk_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_file() -> ConfigFile {
        ConfigFile {
            database_url: "postgres://postgres:pw@localhost:5432/minnie65".into(),
            graph_service_url: "https://graph.example.com/".into(),
            volume_service_url: "https://volume.example.com/".into(),
            default_chunk_size: default_chunk_size(),
            chunk_size_overrides: default_chunk_size_overrides(),
            worker_concurrency: default_worker_concurrency(),
            query_limit_ceiling: default_query_limit_ceiling(),
            snapshot_template: default_snapshot_template(),
            days_to_expire: None,
        }
    }

    #[test]
    fn synapse_schema_gets_larger_chunks() {
        let config = Config::from_file(config_file()).unwrap();

        assert_eq!(config.chunk_size_for("synapse"), 20_000);
        assert_eq!(config.chunk_size_for("cell_type"), 10_000);
    }

    #[test]
    fn invalid_urls_are_config_errors() {
        let mut file = config_file();
        file.graph_service_url = "not a url".into();

        assert!(Config::from_file(file).is_err());
    }
}
