// src/cache/mod.rs

//! Versioned, TTL-bounded object cache
//!
//! Entries live at `<root>/managed/<key>_<version>.bin` and are streams of
//! JSON lines. An entry younger than the expiry is read back as-is; anything
//! else is regenerated through the miss callback into a `.tmp` sibling and
//! renamed into place once the write completes.

mod mirror;

pub use mirror::{PackageMirror, SqliteMirror};

use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Durable cache for fetch results
#[derive(Debug, Clone)]
pub struct ObjectCache {
    root: PathBuf,
}

impl ObjectCache {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("managed"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the entry for `key` at `version`
    pub fn entry_path(&self, key: &str, version: u32) -> PathBuf {
        self.root
            .join("managed")
            .join(format!("{}_{}.bin", key, version))
    }

    /// True if the entry exists and is younger than `expire`
    pub fn is_fresh(&self, key: &str, version: u32, expire: Duration) -> bool {
        let path = self.entry_path(key, version);
        fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age < expire)
    }

    /// Open a fresh entry, or regenerate it through `miss`
    ///
    /// A zero `expire` always regenerates.
    pub fn cache<F>(&self, key: &str, version: u32, expire: Duration, miss: F) -> Result<File>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let path = self.entry_path(key, version);

        if self.is_fresh(key, version, expire) {
            debug!("Object cache hit: {}", path.display());
            return Ok(File::open(&path)?);
        }

        let temp_path = path.with_extension("bin.tmp");
        let result = (|| {
            let mut writer = BufWriter::new(File::create(&temp_path)?);
            miss(&mut writer)?;
            let file = writer
                .into_inner()
                .map_err(|e| Error::CacheError(e.to_string()))?;
            file.sync_all()?;
            fs::rename(&temp_path, &path)?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        debug!("Object cache refreshed: {}", path.display());
        Ok(File::open(&path)?)
    }

    /// Cache a sequence of objects as JSON lines
    ///
    /// `miss` receives a writer callback to call once per object. The entry
    /// is then read back and every object is handed to `read`, on both the
    /// hit and the miss path.
    pub fn cache_objects<T, M, R>(
        &self,
        key: &str,
        version: u32,
        expire: Duration,
        miss: M,
        mut read: R,
    ) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
        M: FnOnce(&mut dyn FnMut(&T) -> Result<()>) -> Result<()>,
        R: FnMut(T) -> Result<()>,
    {
        let file = self.cache(key, version, expire, |w| {
            let mut write = |obj: &T| -> Result<()> {
                serde_json::to_writer(&mut *w, obj)?;
                w.write_all(b"\n")?;
                Ok(())
            };
            miss(&mut write)
        })?;

        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            read(serde_json::from_str(&line)?)?;
        }

        Ok(())
    }
}
