// src/build/defs.rs

//! Built-in build definitions

use super::{BuildContext, BuildDefinition, BuildOrchestrator, BuildResult, BytesResult};
use crate::error::{Error, Result};
use crate::hash;
use crate::package::{Downloader, Package};
use rayon::prelude::*;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Buffer size for streaming downloads (8 KB)
const STREAM_BUFFER_SIZE: usize = 8192;

/// Fixed bytes; never stale once built
#[derive(Debug, Clone)]
pub struct StaticContents {
    name: String,
    contents: Vec<u8>,
}

impl StaticContents {
    pub fn new(name: impl Into<String>, contents: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            contents,
        }
    }
}

impl BuildDefinition for StaticContents {
    fn tag(&self) -> String {
        format!("static:{}:{}", self.name, hash::sha256(&self.contents))
    }

    fn needs_build(&self, _ctx: &mut BuildContext<'_>, _cached_at: SystemTime) -> Result<bool> {
        Ok(false)
    }

    fn build(&self, _ctx: &mut BuildContext<'_>) -> Result<Option<Box<dyn BuildResult>>> {
        Ok(Some(Box::new(BytesResult(self.contents.clone()))))
    }
}

/// Download a URL into the build cache
///
/// `mirror://` URLs are expanded through the orchestrator's mirror table
/// and tried in order. `file://` URLs are read from the local filesystem.
#[derive(Debug, Clone)]
pub struct FetchHttp {
    url: String,
    expire: Option<Duration>,
    expected_size: Option<u64>,
}

impl FetchHttp {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            expire: None,
            expected_size: None,
        }
    }

    /// Treat the cached download as stale after `expire`
    pub fn with_expire(mut self, expire: Duration) -> Self {
        self.expire = Some(expire);
        self
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

enum Attempt {
    Found(Box<dyn BuildResult>),
    NotFound,
    Failed,
}

impl FetchHttp {
    fn attempt(&self, client: &Client, url: &str) -> Attempt {
        if let Some(path) = url.strip_prefix("file://") {
            return match File::open(path) {
                Ok(file) => Attempt::Found(Box::new(StreamResult::new(url, file, self.expected_size))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Attempt::NotFound,
                Err(e) => {
                    warn!("Failed to open {}: {}", path, e);
                    Attempt::Failed
                }
            };
        }

        match client.get(url).send() {
            Ok(response) if response.status() == StatusCode::OK => {
                Attempt::Found(Box::new(StreamResult::new(url, response, self.expected_size)))
            }
            Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                debug!("HTTP 404 from {}", url);
                Attempt::NotFound
            }
            Ok(response) => {
                warn!("HTTP {} from {}", response.status(), url);
                Attempt::Failed
            }
            Err(e) => {
                warn!("Failed to fetch {}: {}", url, e);
                Attempt::Failed
            }
        }
    }
}

impl BuildDefinition for FetchHttp {
    fn tag(&self) -> String {
        self.url.clone()
    }

    fn needs_build(&self, _ctx: &mut BuildContext<'_>, cached_at: SystemTime) -> Result<bool> {
        let Some(expire) = self.expire else {
            return Ok(false);
        };

        Ok(SystemTime::now()
            .duration_since(cached_at)
            .map(|age| age > expire)
            .unwrap_or(false))
    }

    fn build(&self, ctx: &mut BuildContext<'_>) -> Result<Option<Box<dyn BuildResult>>> {
        let urls = ctx.orchestrator().urls_for(&self.url)?;
        let client = Client::builder().build()?;

        let mut only_not_found = true;
        for url in &urls {
            info!("Downloading {}", url);
            match self.attempt(&client, url) {
                Attempt::Found(result) => return Ok(Some(result)),
                Attempt::NotFound => continue,
                Attempt::Failed => only_not_found = false,
            }
        }

        if only_not_found {
            return Err(Error::DownloadError(format!("HTTP 404: Not Found {}", self.url)));
        }

        if ctx.has_cached() {
            warn!("All sources for {} failed, keeping cached copy", self.url);
            return Ok(None);
        }

        Err(Error::DownloadError(format!(
            "unable to find options to fetch {}",
            self.url
        )))
    }
}

/// Streams a download body, enforcing the expected size if one is known
struct StreamResult<R> {
    url: String,
    reader: R,
    expected_size: Option<u64>,
}

impl<R: Read + Send> StreamResult<R> {
    fn new(url: &str, reader: R, expected_size: Option<u64>) -> Self {
        Self {
            url: url.to_string(),
            reader,
            expected_size,
        }
    }
}

impl<R: Read + Send> BuildResult for StreamResult<R> {
    fn write_to(mut self: Box<Self>, out: &mut dyn Write) -> Result<()> {
        let mut written: u64 = 0;
        let mut buffer = [0u8; STREAM_BUFFER_SIZE];

        loop {
            let n = self.reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n])?;
            written += n as u64;
        }

        if let Some(expected) = self.expected_size
            && expected != written
        {
            return Err(Error::DownloadError(format!(
                "size mismatch for {}: expected {} bytes, got {}",
                self.url, expected, written
            )));
        }

        Ok(())
    }
}

/// Contents of a package from its preferred downloader
#[derive(Debug, Clone)]
pub struct PackageContents {
    package: String,
    fetch: FetchHttp,
}

impl PackageContents {
    pub fn new(package: &Package) -> Result<Self> {
        let downloader = package.preferred_downloader().ok_or_else(|| {
            Error::NotFound(format!("package {} has no downloaders", package.name))
        })?;

        let fetch = match downloader {
            Downloader::Http { url, expected_size } => {
                let fetch = FetchHttp::new(url);
                match expected_size {
                    Some(size) => fetch.with_expected_size(size),
                    None => fetch,
                }
            }
            Downloader::Content { url, .. } => FetchHttp::new(url),
        };

        Ok(Self {
            package: package.id(),
            fetch,
        })
    }

    pub fn package(&self) -> &str {
        &self.package
    }
}

impl BuildDefinition for PackageContents {
    fn tag(&self) -> String {
        self.fetch.tag()
    }

    fn needs_build(&self, ctx: &mut BuildContext<'_>, cached_at: SystemTime) -> Result<bool> {
        self.fetch.needs_build(ctx, cached_at)
    }

    fn build(&self, ctx: &mut BuildContext<'_>) -> Result<Option<Box<dyn BuildResult>>> {
        debug!("Fetching contents of {}", self.package);
        self.fetch.build(ctx)
    }
}

/// Fetch the contents of every package in parallel
///
/// Paths are returned in the order of `packages`.
pub fn fetch_contents(
    orchestrator: &BuildOrchestrator,
    packages: &[Arc<Package>],
) -> Result<Vec<PathBuf>> {
    let defs = packages
        .iter()
        .map(|pkg| PackageContents::new(pkg))
        .collect::<Result<Vec<_>>>()?;

    defs.par_iter()
        .map(|def| orchestrator.build(def))
        .collect::<Result<Vec<_>>>()
}
