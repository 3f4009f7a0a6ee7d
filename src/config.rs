// src/config.rs

//! TOML configuration
//!
//! Every section and field is optional. A minimal file declares fetchers:
//!
//! ```toml
//! [[fetcher]]
//! source = "json-index"
//! distribution = "alpine"
//! args = ["/srv/index/alpine.jsonl"]
//! ```

use crate::build::BuildOrchestrator;
use crate::cache::{ObjectCache, SqliteMirror};
use crate::error::{Error, Result};
use crate::fetch::{FetchStore, Fetcher, FetcherDecl, SchedulerOptions, builtin_source};
use crate::hash::HashAlgorithm;
use crate::index::{PackageIndex, SearchProvider};
use crate::plan::PlanOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MosaicConfig {
    pub paths: PathsConfig,
    pub fetch: FetchConfig,
    pub plan: PlanOptions,
    pub build: BuildConfig,
    /// Mirror name -> base URLs, for `mirror://<name>/...`
    pub mirrors: BTreeMap<String, Vec<String>>,
    #[serde(rename = "fetcher")]
    pub fetchers: Vec<SourceConfig>,
    #[serde(rename = "search_provider")]
    pub search_providers: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub build_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// SQLite file mirroring every fetched package
    pub mirror_db: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = default_base_dir();
        Self {
            build_dir: base.join("build"),
            cache_dir: base.join("cache"),
            mirror_db: None,
        }
    }
}

fn default_base_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mosaic")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub ttl_secs: u64,
    pub force_refresh: bool,
    pub no_parallel: bool,
    /// Concurrent fetches during auto refresh
    pub workers: usize,
    pub refresh_interval_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 7200,
            force_refresh: false,
            no_parallel: false,
            workers: 4,
            refresh_interval_secs: 3600,
        }
    }
}

impl FetchConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            force_refresh: self.force_refresh,
            no_parallel: self.no_parallel,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub always_rebuild: bool,
    pub hash_algorithm: HashAlgorithm,
}

/// A `[[fetcher]]` or `[[search_provider]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub distribution: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_source() -> String {
    "json-index".to_string()
}

impl SourceConfig {
    pub fn decl(&self) -> FetcherDecl {
        FetcherDecl::new(&self.source, &self.distribution, self.args.clone())
    }
}

impl MosaicConfig {
    /// Load from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.fetch.workers == 0 {
            return Err(Error::ConfigError("fetch.workers must be at least 1".into()));
        }
        for (name, urls) in &self.mirrors {
            if urls.is_empty() {
                return Err(Error::ConfigError(format!("mirror {} has no urls", name)));
            }
        }
        Ok(())
    }

    /// Declare every configured fetcher and search provider
    pub fn package_index(&self) -> Result<PackageIndex> {
        let mut index = PackageIndex::new();

        for entry in &self.fetchers {
            let source = builtin_source(&entry.source)?;
            index.add_fetcher(Fetcher::new(entry.decl(), source));
        }
        for entry in &self.search_providers {
            let source = builtin_source(&entry.source)?;
            index.add_search_provider(SearchProvider::new(entry.decl(), source));
        }

        Ok(index)
    }

    /// Object cache plus the optional SQLite mirror
    pub fn fetch_store(&self) -> Result<FetchStore> {
        let cache = ObjectCache::new(&self.paths.cache_dir)?;
        let mut store = FetchStore::new(cache).with_ttl(self.fetch.ttl());

        if let Some(db) = &self.paths.mirror_db {
            store = store.with_mirror(Arc::new(SqliteMirror::open(db)?));
        }

        Ok(store)
    }

    pub fn orchestrator(&self) -> Result<BuildOrchestrator> {
        let mut orchestrator =
            BuildOrchestrator::with_algorithm(&self.paths.build_dir, self.build.hash_algorithm)?;
        for (name, urls) in &self.mirrors {
            orchestrator.add_mirror(name, urls.clone());
        }
        Ok(orchestrator)
    }
}
