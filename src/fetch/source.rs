// src/fetch/source.rs

//! Built-in fetch sources
//!
//! `json-index` reads JSON-lines package records from local files or
//! HTTP(S) URLs, one record per line, blank lines ignored.

use super::{FetchSource, FetcherHandle};
use crate::error::{Error, Result};
use crate::package::{Package, PackageName};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Look up a built-in source by id
pub fn builtin_source(source_id: &str) -> Result<Arc<dyn FetchSource>> {
    match source_id {
        JsonIndexSource::ID => Ok(Arc::new(JsonIndexSource::new())),
        other => Err(Error::ConfigError(format!("unknown fetch source: {}", other))),
    }
}

/// Package records stored as JSON lines
#[derive(Debug, Clone)]
pub struct JsonIndexSource {
    timeout: Duration,
}

impl Default for JsonIndexSource {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonIndexSource {
    pub const ID: &'static str = "json-index";

    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }

    fn read_location(&self, location: &str) -> Result<String> {
        if location.starts_with("http://") || location.starts_with("https://") {
            debug!("Downloading index {}", location);
            let client = reqwest::blocking::Client::builder()
                .timeout(self.timeout)
                .build()?;
            let response = client.get(location).send()?.error_for_status()?;
            Ok(response.text()?)
        } else {
            let path = location.strip_prefix("file://").unwrap_or(location);
            fs::read_to_string(path).map_err(|e| {
                Error::DownloadError(format!("failed to read index {}: {}", path, e))
            })
        }
    }

    fn load(
        &self,
        handle: &mut FetcherHandle<'_>,
        args: &[String],
        mut keep: impl FnMut(&Package) -> bool,
    ) -> Result<()> {
        for location in args {
            let contents = self.read_location(location)?;
            let mut added = 0usize;

            for (lineno, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }

                let package: Package = serde_json::from_str(line).map_err(|e| {
                    Error::ParseError(format!("{}:{}: {}", location, lineno + 1, e))
                })?;

                if keep(&package) {
                    handle.add_package(package)?;
                    added += 1;
                }
            }

            handle.log(format!("loaded {} records from {}", added, location));
        }

        Ok(())
    }
}

impl FetchSource for JsonIndexSource {
    fn fetch(&self, handle: &mut FetcherHandle<'_>, args: &[String]) -> Result<()> {
        self.load(handle, args, |_| true)
    }

    fn search(
        &self,
        handle: &mut FetcherHandle<'_>,
        query: &PackageName,
        args: &[String],
    ) -> Result<()> {
        let distribution = handle.distribution().to_string();
        self.load(handle, args, |pkg| {
            let mut pkg = pkg.clone();
            if pkg.name.distribution.is_empty() {
                pkg.name.distribution = distribution.clone();
            }
            pkg.matches(query)
        })
    }
}
