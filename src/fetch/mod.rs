// src/fetch/mod.rs

//! Fetchers: keyed producers of package records
//!
//! A fetcher is declared as a source id plus bound arguments
//! ([`FetcherDecl`]). The declaration hashes to the fetcher's key, which
//! names its entry in the object cache. The work itself is done by a
//! [`FetchSource`], which reports packages back through a
//! [`FetcherHandle`].
//!
//! Only one fetch per fetcher runs at a time. Readers never see a partially
//! loaded package list: the fetched set replaces the old one in one step.

mod scheduler;
mod source;

pub use scheduler::{AutoRefresh, FetchScheduler, SchedulerOptions};
pub use source::{JsonIndexSource, builtin_source};

use crate::cache::{ObjectCache, PackageMirror};
use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, Hasher};
use crate::package::{Package, PackageName, validate_architecture};
use crate::version;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum_macros::{Display, EnumString};
use tracing::{debug, info, warn};

/// Format version of cached package records
pub const METADATA_VERSION: u32 = 1;

/// Default freshness window of a fetch result
pub const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Identity of a fetcher: which source to run, and with what
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetcherDecl {
    pub source_id: String,
    /// Distribution stamped onto records that do not carry one
    #[serde(default)]
    pub distribution: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl FetcherDecl {
    pub fn new(
        source_id: impl Into<String>,
        distribution: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            distribution: distribution.into(),
            args,
        }
    }

    /// Stable cache key: SHA-256 of the source id and every bound argument
    ///
    /// The distribution counts as a bound argument when set.
    pub fn key(&self) -> String {
        let mut hasher = Hasher::new(HashAlgorithm::Sha256);
        hasher.update(self.source_id.as_bytes());
        let distribution = Some(&self.distribution).filter(|d| !d.is_empty());
        for token in distribution.into_iter().chain(&self.args) {
            hasher.update(b"_");
            hasher.update(token.as_bytes());
        }
        hasher.finalize()
    }
}

impl fmt::Display for FetcherDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut args: Vec<&str> = Vec::new();
        if !self.distribution.is_empty() {
            args.push(&self.distribution);
        }
        args.extend(self.args.iter().map(String::as_str));
        write!(f, "{}({})", self.source_id, args.join(", "))
    }
}

/// Work behind a fetcher
///
/// Implementations call [`FetcherHandle::add_package`] once per discovered
/// package. Anything the source returns as an error fails the fetch.
pub trait FetchSource: Send + Sync {
    fn fetch(&self, handle: &mut FetcherHandle<'_>, args: &[String]) -> Result<()>;

    /// Answer a single query for a search provider
    ///
    /// The default loads everything and lets the provider filter.
    fn search(
        &self,
        handle: &mut FetcherHandle<'_>,
        _query: &PackageName,
        args: &[String],
    ) -> Result<()> {
        self.fetch(handle, args)
    }
}

/// Fetcher lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize)]
pub enum FetchStatus {
    #[default]
    NotLoaded,
    Loading,
    Loaded,
    Error,
}

/// One timestamped line of a fetcher's log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub time: DateTime<Utc>,
    pub message: String,
}

/// Per-fetch log buffer
#[derive(Debug, Default, Clone)]
pub struct FetchLog {
    messages: Vec<LogMessage>,
    counters: BTreeMap<String, u64>,
}

impl FetchLog {
    fn log(&mut self, message: impl Into<String>) {
        self.messages.push(LogMessage {
            time: Utc::now(),
            message: message.into(),
        });
    }

    fn count(&mut self, message: impl Into<String>) {
        *self.counters.entry(message.into()).or_default() += 1;
    }
}

/// Callback surface handed to a [`FetchSource`]
pub struct FetcherHandle<'a> {
    decl: &'a FetcherDecl,
    packages: Vec<Package>,
    ids: HashSet<String>,
    log: FetchLog,
    pledge_semver: bool,
}

impl<'a> FetcherHandle<'a> {
    pub fn new(decl: &'a FetcherDecl) -> Self {
        Self {
            decl,
            packages: Vec::new(),
            ids: HashSet::new(),
            log: FetchLog::default(),
            pledge_semver: false,
        }
    }

    pub fn distribution(&self) -> &str {
        &self.decl.distribution
    }

    /// Promise that this source emits semver-like versions
    ///
    /// Versions are canonicalised from then on. Versions that cannot be
    /// canonicalised are kept as-is and counted.
    pub fn pledge_semver(&mut self) {
        self.pledge_semver = true;
    }

    /// Append a line to the fetcher log
    pub fn log(&mut self, message: impl Into<String>) {
        self.log.log(message);
    }

    /// Count a repeated condition instead of logging every occurrence
    pub fn count(&mut self, message: impl Into<String>) {
        self.log.count(message);
    }

    /// Build a validated name in this fetcher's distribution
    pub fn name(&mut self, name: &str, version: &str, architecture: &str) -> Result<PackageName> {
        self.validate_name(PackageName::new(
            self.decl.distribution.clone(),
            name,
            version,
            architecture,
        ))
    }

    fn validate_name(&mut self, mut name: PackageName) -> Result<PackageName> {
        if name.distribution.is_empty() {
            name.distribution = self.decl.distribution.clone();
        }

        validate_architecture(&name.architecture)?;

        if self.pledge_semver && !name.version.is_empty() {
            match version::canonicalize(&name.version) {
                Ok(canonical) => name.version = canonical,
                Err(e) => self.log.count(format!("invalid semver: {}", e)),
            }
        }

        Ok(name)
    }

    /// Record a package
    ///
    /// The name and aliases are validated and inherit the fetcher's
    /// distribution. A second package with an identical name is dropped and
    /// counted; aliases repeating the package's own name are removed.
    pub fn add_package(&mut self, mut package: Package) -> Result<()> {
        package.name = self.validate_name(package.name)?;

        let aliases = std::mem::take(&mut package.aliases);
        let mut seen = HashSet::from([package.name.clone()]);
        for alias in aliases {
            let alias = self.validate_name(alias)?;
            if seen.insert(alias.clone()) {
                package.aliases.push(alias);
            }
        }

        if !self.ids.insert(package.id()) {
            self.log.count("duplicate package");
            return Ok(());
        }

        self.packages.push(package);
        Ok(())
    }

    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    pub(crate) fn into_parts(self) -> (Vec<Package>, FetchLog) {
        (self.packages, self.log)
    }
}

/// Where fetch results are persisted
#[derive(Clone)]
pub struct FetchStore {
    pub cache: ObjectCache,
    pub mirror: Option<Arc<dyn PackageMirror>>,
    pub ttl: Duration,
}

impl FetchStore {
    pub fn new(cache: ObjectCache) -> Self {
        Self {
            cache,
            mirror: None,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn PackageMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

#[derive(Default)]
struct FetcherState {
    packages: Vec<Arc<Package>>,
    distributions: Option<HashSet<String>>,
    architectures: Option<HashSet<String>>,
    status: FetchStatus,
    last_updated: Option<DateTime<Utc>>,
    last_update_time: Option<Duration>,
    log: FetchLog,
}

/// Snapshot of a fetcher for status displays
#[derive(Debug, Clone, Serialize)]
pub struct FetcherStatus {
    pub key: String,
    pub name: String,
    pub status: FetchStatus,
    pub package_count: usize,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_update_ms: Option<u128>,
    pub messages: Vec<LogMessage>,
    pub counters: BTreeMap<String, u64>,
}

/// A declared fetcher and its current results
pub struct Fetcher {
    decl: FetcherDecl,
    key: String,
    source: Arc<dyn FetchSource>,
    update_lock: Mutex<()>,
    state: RwLock<FetcherState>,
}

impl Fetcher {
    pub fn new(decl: FetcherDecl, source: Arc<dyn FetchSource>) -> Self {
        let key = decl.key();
        Self {
            decl,
            key,
            source,
            update_lock: Mutex::new(()),
            state: RwLock::new(FetcherState::default()),
        }
    }

    pub fn decl(&self) -> &FetcherDecl {
        &self.decl
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn status(&self) -> FetchStatus {
        self.state.read().status
    }

    /// Current package list
    pub fn packages(&self) -> Vec<Arc<Package>> {
        self.state.read().packages.clone()
    }

    /// Run the source, or load its cached result
    ///
    /// Concurrent calls on the same fetcher run one after another.
    pub fn fetch_with_key(&self, store: &FetchStore, force_refresh: bool) -> Result<()> {
        let _guard = self.update_lock.lock();

        {
            let mut state = self.state.write();
            state.packages.clear();
            state.distributions = None;
            state.architectures = None;
            state.log = FetchLog::default();
            state.last_updated = Some(Utc::now());
            state.status = FetchStatus::Loading;
        }

        let started = Instant::now();
        let expire = if force_refresh { Duration::ZERO } else { store.ttl };

        let mut packages = Vec::new();
        let mut distributions = HashSet::new();
        let mut architectures = HashSet::new();
        let mut fetch_log = None;

        let result = store.cache.cache_objects::<Package, _, _>(
            &self.key,
            METADATA_VERSION,
            expire,
            |write| {
                info!("Fetching {}", self.decl);
                let mut handle = FetcherHandle::new(&self.decl);
                let fetched = self.source.fetch(&mut handle, &self.decl.args);
                let (produced, log) = handle.into_parts();
                fetch_log = Some(log);
                fetched?;

                for pkg in &produced {
                    write(pkg)?;
                }
                Ok(())
            },
            |pkg| {
                distributions.insert(pkg.name.distribution.clone());
                architectures.insert(pkg.name.architecture.clone());
                packages.push(Arc::new(pkg));
                Ok(())
            },
        );

        if let Err(e) = result {
            let mut state = self.state.write();
            state.status = FetchStatus::Error;
            if let Some(log) = fetch_log {
                state.log = log;
            }
            state.log.log(format!("fetch failed: {}", e));
            return Err(match e {
                e @ Error::FetchFailed { .. } => e,
                other => Error::fetch_failed(self.decl.to_string(), other),
            });
        }

        if let Some(mirror) = &store.mirror {
            let refs: Vec<&Package> = packages.iter().map(Arc::as_ref).collect();
            if let Err(e) = mirror.put_packages(&refs) {
                warn!("Failed to mirror packages from {}: {}", self.decl, e);
            }
        }

        let elapsed = started.elapsed();
        debug!(
            "Loaded {} packages from {} in {:?}",
            packages.len(),
            self.decl,
            elapsed
        );

        let mut state = self.state.write();
        state.packages = packages;
        state.distributions = Some(distributions);
        state.architectures = Some(architectures);
        if let Some(log) = fetch_log {
            state.log = log;
        }
        state.last_update_time = Some(elapsed);
        state.status = FetchStatus::Loaded;

        Ok(())
    }

    /// Cheap pre-filter run before scanning this fetcher's packages
    ///
    /// Before the first successful load nothing is known and every query
    /// passes.
    pub fn matches(&self, query: &PackageName) -> bool {
        let state = self.state.read();

        if !query.distribution.is_empty()
            && let Some(distributions) = &state.distributions
            && !distributions.contains(&query.distribution)
        {
            return false;
        }

        if !query.architecture.is_empty()
            && let Some(architectures) = &state.architectures
            && !architectures.contains(&query.architecture)
        {
            return false;
        }

        true
    }

    /// Distributions seen in the last load
    pub fn distributions(&self) -> Vec<String> {
        self.state
            .read()
            .distributions
            .as_ref()
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Architectures seen in the last load
    pub fn architectures(&self) -> Vec<String> {
        self.state
            .read()
            .architectures
            .as_ref()
            .map(|a| a.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn report(&self) -> FetcherStatus {
        let state = self.state.read();
        FetcherStatus {
            key: self.key.clone(),
            name: self.decl.to_string(),
            status: state.status,
            package_count: state.packages.len(),
            last_updated: state.last_updated,
            last_update_ms: state.last_update_time.map(|d| d.as_millis()),
            messages: state.log.messages.clone(),
            counters: state.log.counters.clone(),
        }
    }
}

impl fmt::Display for Fetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.decl, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct ListSource {
        names: Vec<&'static str>,
        calls: AtomicUsize,
    }

    impl ListSource {
        fn new(names: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                names,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl FetchSource for ListSource {
        fn fetch(&self, handle: &mut FetcherHandle<'_>, _args: &[String]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            handle.log("listing");
            for name in &self.names {
                let name = handle.name(name, "1.0", "x86_64")?;
                handle.add_package(Package::new(name))?;
            }
            Ok(())
        }
    }

    struct FailingSource;

    impl FetchSource for FailingSource {
        fn fetch(&self, _handle: &mut FetcherHandle<'_>, _args: &[String]) -> Result<()> {
            Err(Error::DownloadError("connection refused".into()))
        }
    }

    fn store(dir: &TempDir) -> FetchStore {
        FetchStore::new(ObjectCache::new(dir.path()).unwrap())
    }

    #[test]
    fn test_key_and_display() {
        let a = FetcherDecl::new("json-index", "alpine", vec!["a.jsonl".into()]);
        let b = FetcherDecl::new("json-index", "alpine", vec!["b.jsonl".into()]);
        assert_eq!(a.key(), a.clone().key());
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), crate::hash::sha256(b"json-index_alpine_a.jsonl"));
        let bare = FetcherDecl::new("json-index", "", vec!["a.jsonl".into()]);
        assert_eq!(bare.key(), crate::hash::sha256(b"json-index_a.jsonl"));
        assert_eq!(a.to_string(), "json-index(alpine, a.jsonl)");
    }

    #[test]
    fn test_fetch_then_cached() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let source = ListSource::new(vec!["zlib", "musl"]);
        let fetcher = Fetcher::new(
            FetcherDecl::new("list", "alpine", vec![]),
            source.clone(),
        );

        assert_eq!(fetcher.status(), FetchStatus::NotLoaded);
        fetcher.fetch_with_key(&store, false).unwrap();
        assert_eq!(fetcher.status(), FetchStatus::Loaded);
        assert_eq!(fetcher.packages().len(), 2);
        assert_eq!(fetcher.packages()[0].name.distribution, "alpine");

        fetcher.fetch_with_key(&store, false).unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.packages().len(), 2);

        fetcher.fetch_with_key(&store, true).unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fetch_failure_sets_error() {
        let dir = TempDir::new().unwrap();
        let fetcher = Fetcher::new(
            FetcherDecl::new("broken", "", vec![]),
            Arc::new(FailingSource),
        );

        let err = fetcher.fetch_with_key(&store(&dir), false).unwrap_err();
        assert!(matches!(err, Error::FetchFailed { .. }));
        assert!(err.to_string().contains("broken()"));
        assert_eq!(fetcher.status(), FetchStatus::Error);
        assert!(!fetcher.report().messages.is_empty());
    }

    #[test]
    fn test_matches_prefilter() {
        let dir = TempDir::new().unwrap();
        let fetcher = Fetcher::new(
            FetcherDecl::new("list", "alpine", vec![]),
            ListSource::new(vec!["zlib"]),
        );

        assert!(fetcher.matches(&PackageName::parse("debian/zlib")));

        fetcher.fetch_with_key(&store(&dir), false).unwrap();
        assert!(fetcher.matches(&PackageName::parse("alpine/zlib")));
        assert!(fetcher.matches(&PackageName::parse("zlib")));
        assert!(!fetcher.matches(&PackageName::parse("debian/zlib")));
        assert!(!fetcher.matches(&PackageName::parse("zlib").with_architecture("aarch64")));
    }

    #[test]
    fn test_handle_validation() {
        let decl = FetcherDecl::new("list", "alpine", vec![]);
        let mut handle = FetcherHandle::new(&decl);

        assert!(matches!(
            handle.name("zlib", "1.0", "amd64"),
            Err(Error::InvalidArchitecture(_))
        ));

        handle.pledge_semver();
        assert_eq!(handle.name("zlib", "v1.02", "").unwrap().version, "1.2.0");
        assert_eq!(handle.name("zlib", "1.2-r0~x!", "").unwrap().version, "1.2-r0~x!");

        let mut pkg = Package::new(PackageName::new("", "zlib", "1.0.0", ""));
        pkg.aliases.push(PackageName::new("", "zlib", "1.0.0", ""));
        pkg.aliases.push(PackageName::new("", "libz", "", ""));
        handle.add_package(pkg.clone()).unwrap();
        handle.add_package(pkg).unwrap();

        assert_eq!(handle.packages().len(), 1);
        assert_eq!(handle.packages()[0].aliases.len(), 1);
        assert_eq!(handle.packages()[0].aliases[0].distribution, "alpine");

        let (_, log) = handle.into_parts();
        assert_eq!(log.counters.get("duplicate package"), Some(&1));
        assert_eq!(log.counters.len(), 2);
    }
}
