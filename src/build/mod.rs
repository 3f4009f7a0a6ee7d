// src/build/mod.rs

//! Content-addressed build cache
//!
//! Every [`BuildDefinition`] is identified by its tag. The artifact for a
//! tag lives at `<build_dir>/<hash(tag)>.bin`; the tag itself is written
//! next to it as `<hash>.def` for inspection.
//!
//! Publishing is rename-only: output is written to `<hash>.bin.tmp` and
//! renamed over the final path once complete. Any failure removes the
//! temporary file, so the final path holds either nothing, the previous
//! artifact, or the complete new one.

mod defs;

pub use defs::{FetchHttp, PackageContents, StaticContents, fetch_contents};

use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use strum_macros::Display;
use tracing::{debug, info};

/// A unit of cacheable work
pub trait BuildDefinition: Send + Sync {
    /// Stable identity derived from the definition's inputs
    fn tag(&self) -> String;

    /// Decide whether an artifact cached at `cached_at` is stale
    fn needs_build(&self, ctx: &mut BuildContext<'_>, cached_at: SystemTime) -> Result<bool>;

    /// Produce the artifact
    ///
    /// `Ok(None)` keeps the existing cached artifact; only valid when
    /// [`BuildContext::has_cached`] is true.
    fn build(&self, ctx: &mut BuildContext<'_>) -> Result<Option<Box<dyn BuildResult>>>;
}

/// Lazily written build output
pub trait BuildResult: Send {
    /// Write every byte of the artifact
    fn write_to(self: Box<Self>, out: &mut dyn Write) -> Result<()>;

    /// Called instead of `write_to` when the definition already wrote its
    /// output through [`BuildContext::create_output`]
    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// In-memory build result
pub struct BytesResult(pub Vec<u8>);

impl BuildResult for BytesResult {
    fn write_to(self: Box<Self>, out: &mut dyn Write) -> Result<()> {
        out.write_all(&self.0)?;
        Ok(())
    }
}

/// Result for definitions that wrote their output directly
pub struct WrittenOutput;

impl BuildResult for WrittenOutput {
    fn write_to(self: Box<Self>, _out: &mut dyn Write) -> Result<()> {
        Err(Error::CacheError(
            "output was written directly but no output file exists".to_string(),
        ))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Skip the freshness check and always run the build
    pub always_rebuild: bool,
}

/// How the last request for a tag was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BuildState {
    Built,
    Cached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStatus {
    pub state: BuildState,
    /// Tags of the child builds requested during this build
    pub children: Vec<String>,
}

/// Per-build state handed to a definition
pub struct BuildContext<'a> {
    orchestrator: &'a BuildOrchestrator,
    tag: String,
    temp_path: Option<PathBuf>,
    output: Option<File>,
    has_cached: bool,
    children: Vec<String>,
}

impl<'a> BuildContext<'a> {
    fn new(orchestrator: &'a BuildOrchestrator, tag: &str, temp_path: Option<PathBuf>) -> Self {
        Self {
            orchestrator,
            tag: tag.to_string(),
            temp_path,
            output: None,
            has_cached: false,
            children: Vec::new(),
        }
    }

    pub fn orchestrator(&self) -> &'a BuildOrchestrator {
        self.orchestrator
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// True when a stale artifact exists for this tag
    pub fn has_cached(&self) -> bool {
        self.has_cached
    }

    pub fn is_in_memory(&self) -> bool {
        self.temp_path.is_none()
    }

    /// Open the temporary output file for direct writing
    ///
    /// The orchestrator publishes this file instead of streaming the
    /// result. Only one output may be created per build.
    pub fn create_output(&mut self) -> Result<&mut File> {
        let Some(path) = &self.temp_path else {
            return Err(Error::CacheError(
                "in-memory builds cannot create output files".to_string(),
            ));
        };
        if self.output.is_some() {
            return Err(Error::CacheError(format!(
                "output for {} already created",
                self.tag
            )));
        }

        let file = File::create(path)?;
        Ok(self.output.insert(file))
    }

    pub fn has_created_output(&self) -> bool {
        self.output.is_some()
    }

    /// Build a dependency, recording it as a child of this build
    pub fn build_child(&mut self, def: &dyn BuildDefinition) -> Result<PathBuf> {
        self.children.push(def.tag());
        self.orchestrator.build(def)
    }

    /// Whether a dependency would be rebuilt if requested now
    pub fn needs_build(&mut self, def: &dyn BuildDefinition) -> Result<bool> {
        let tag = def.tag();
        let output = self.orchestrator.output_path(&tag);

        match modified_time(&output) {
            Some(cached_at) => {
                let temp = self.orchestrator.temp_path(&tag);
                let mut child = BuildContext::new(self.orchestrator, &tag, Some(temp));
                def.needs_build(&mut child, cached_at)
            }
            None => Ok(true),
        }
    }

    pub fn children(&self) -> &[String] {
        &self.children
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Runs build definitions against the on-disk cache
pub struct BuildOrchestrator {
    build_dir: PathBuf,
    algorithm: HashAlgorithm,
    mirrors: HashMap<String, Vec<String>>,
    memory: Mutex<HashMap<String, Arc<Vec<u8>>>>,
    statuses: Mutex<HashMap<String, BuildStatus>>,
    tag_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BuildOrchestrator {
    pub fn new<P: AsRef<Path>>(build_dir: P) -> Result<Self> {
        Self::with_algorithm(build_dir, HashAlgorithm::Sha256)
    }

    pub fn with_algorithm<P: AsRef<Path>>(build_dir: P, algorithm: HashAlgorithm) -> Result<Self> {
        let build_dir = build_dir.as_ref().to_path_buf();
        if !build_dir.exists() {
            fs::create_dir_all(&build_dir)?;
            debug!(
                "Created build directory: {:?} (algorithm: {})",
                build_dir, algorithm
            );
        }

        Ok(Self {
            build_dir,
            algorithm,
            mirrors: HashMap::new(),
            memory: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            tag_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    /// Register base URLs for `mirror://<name>/...`
    pub fn add_mirror(&mut self, name: impl Into<String>, urls: Vec<String>) {
        self.mirrors.insert(name.into(), urls);
    }

    /// Expand a `mirror://` URL into one URL per mirror base
    ///
    /// Any other URL is returned unchanged.
    pub fn urls_for(&self, url: &str) -> Result<Vec<String>> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::ParseError(format!("invalid url {}: {}", url, e)))?;

        if parsed.scheme() != "mirror" {
            return Ok(vec![url.to_string()]);
        }

        let name = parsed.host_str().unwrap_or_default();
        let suffix = url
            .strip_prefix(&format!("mirror://{}", name))
            .unwrap_or_default();

        let bases = self
            .mirrors
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("mirror {} not defined", name)))?;

        Ok(bases.iter().map(|base| format!("{}{}", base, suffix)).collect())
    }

    fn hash_tag(&self, tag: &str) -> String {
        hash::hash_bytes(self.algorithm, tag.as_bytes())
    }

    /// Final artifact path for a tag
    pub fn output_path(&self, tag: &str) -> PathBuf {
        self.build_dir.join(format!("{}.bin", self.hash_tag(tag)))
    }

    fn temp_path(&self, tag: &str) -> PathBuf {
        self.build_dir.join(format!("{}.bin.tmp", self.hash_tag(tag)))
    }

    /// Run `f` holding the lock for `tag`
    ///
    /// The lock entry is dropped again once no other build is waiting on it.
    fn with_tag_lock<T>(&self, tag: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = Arc::clone(self.tag_locks.lock().entry(tag.to_string()).or_default());
        let result = {
            let _guard = lock.lock();
            f()
        };

        let mut locks = self.tag_locks.lock();
        if Arc::strong_count(&lock) == 2 {
            locks.remove(tag);
        }
        result
    }

    /// How the most recent request for `tag` was satisfied
    pub fn status(&self, tag: &str) -> Option<BuildStatus> {
        self.statuses.lock().get(tag).cloned()
    }

    fn record(&self, tag: &str, state: BuildState, children: Vec<String>) {
        self.statuses
            .lock()
            .insert(tag.to_string(), BuildStatus { state, children });
    }

    pub fn build(&self, def: &dyn BuildDefinition) -> Result<PathBuf> {
        self.build_with_options(def, BuildOptions::default())
    }

    /// Return the artifact for `def`, building it if missing or stale
    pub fn build_with_options(
        &self,
        def: &dyn BuildDefinition,
        options: BuildOptions,
    ) -> Result<PathBuf> {
        let tag = def.tag();
        self.with_tag_lock(&tag, || self.build_locked(def, options, &tag))
    }

    fn build_locked(
        &self,
        def: &dyn BuildDefinition,
        options: BuildOptions,
        tag: &str,
    ) -> Result<PathBuf> {
        let output = self.output_path(tag);
        let temp = self.temp_path(tag);

        let mut ctx = BuildContext::new(self, tag, Some(temp.clone()));

        if !options.always_rebuild
            && let Some(cached_at) = modified_time(&output)
        {
            let stale = def
                .needs_build(&mut ctx, cached_at)
                .map_err(|e| Error::build_failed(tag, e))?;
            if !stale {
                debug!("Using cached build: {}", tag);
                self.record(tag, BuildState::Cached, ctx.children);
                return Ok(output);
            }
            ctx.has_cached = true;
            info!("Rebuild requested: {}", tag);
        } else {
            info!("Building {}", tag);
        }

        let published = self.run_build(def, &mut ctx, &temp, &output);
        if published.is_err() {
            let _ = fs::remove_file(&temp);
        }

        match published.map_err(|e| Error::build_failed(tag, e))? {
            true => self.record(tag, BuildState::Built, ctx.children),
            false => self.record(tag, BuildState::Cached, ctx.children),
        }

        if let Err(e) = fs::write(self.build_dir.join(format!("{}.def", self.hash_tag(tag))), tag) {
            debug!("Failed to write definition for {}: {}", tag, e);
        }

        Ok(output)
    }

    /// Build and publish; `Ok(false)` means the cached artifact was kept
    fn run_build(
        &self,
        def: &dyn BuildDefinition,
        ctx: &mut BuildContext<'_>,
        temp: &Path,
        output: &Path,
    ) -> Result<bool> {
        let Some(result) = def.build(ctx)? else {
            if !ctx.has_cached || !output.exists() {
                return Err(Error::CacheError(
                    "build produced no result and nothing is cached".to_string(),
                ));
            }
            let _ = fs::remove_file(temp);
            return Ok(false);
        };

        match ctx.output.take() {
            Some(file) => {
                result.finish()?;
                file.sync_all()?;
            }
            None => {
                let mut writer = BufWriter::new(File::create(temp)?);
                result.write_to(&mut writer)?;
                let file = writer
                    .into_inner()
                    .map_err(|e| Error::CacheError(e.to_string()))?;
                file.sync_all()?;
            }
        }

        fs::rename(temp, output)?;
        Ok(true)
    }

    /// Build into a process-local cache instead of the build directory
    ///
    /// In-memory artifacts are never considered stale.
    pub fn build_in_memory(&self, def: &dyn BuildDefinition) -> Result<Arc<Vec<u8>>> {
        let tag = def.tag();
        let key = self.hash_tag(&tag);

        if let Some(contents) = self.memory.lock().get(&key).cloned() {
            self.record(&tag, BuildState::Cached, Vec::new());
            return Ok(contents);
        }

        let mut ctx = BuildContext::new(self, &tag, None);
        let result = def
            .build(&mut ctx)
            .map_err(|e| Error::build_failed(&tag, e))?
            .ok_or_else(|| Error::build_failed(&tag, "build produced no result"))?;

        let mut buf = Vec::new();
        result
            .write_to(&mut buf)
            .map_err(|e| Error::build_failed(&tag, e))?;

        let contents = Arc::new(buf);
        self.memory.lock().insert(key, Arc::clone(&contents));
        self.record(&tag, BuildState::Built, ctx.children);

        Ok(contents)
    }
}
