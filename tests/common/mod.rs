// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use mosaic::cache::ObjectCache;
use mosaic::fetch::{FetchSource, FetchStore, Fetcher, FetcherDecl, FetcherHandle};
use mosaic::{FetchScheduler, Package, PackageIndex, PackageName, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// Fetch source that returns a fixed package list
///
/// Tracks how many fetches ran and the largest number that overlapped.
#[derive(Default)]
pub struct StaticSource {
    packages: Vec<Package>,
    delay: Duration,
    pub calls: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl StaticSource {
    pub fn new(packages: Vec<Package>) -> Self {
        Self {
            packages,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl FetchSource for StaticSource {
    fn fetch(&self, handle: &mut FetcherHandle<'_>, _args: &[String]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        thread::sleep(self.delay);
        let result = self
            .packages
            .iter()
            .try_for_each(|pkg| handle.add_package(pkg.clone()));

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// `test/<name>@1.0`
pub fn pkg(name: &str) -> Package {
    Package::new(PackageName::new("test", name, "1.0", ""))
}

pub fn query(name: &str) -> PackageName {
    PackageName::parse(&format!("test/{}", name))
}

/// Dependency or conflict groups from names
pub fn groups(list: &[&[&str]]) -> Vec<Vec<PackageName>> {
    list.iter()
        .map(|group| group.iter().map(|name| query(name)).collect())
        .collect()
}

pub fn store(dir: &TempDir) -> FetchStore {
    FetchStore::new(ObjectCache::new(dir.path().join("cache")).unwrap())
}

/// Index backed by one fetcher over `packages`, already fetched
pub fn index_of(dir: &TempDir, packages: Vec<Package>) -> Arc<PackageIndex> {
    let mut index = PackageIndex::new();
    index.add_fetcher(Fetcher::new(
        FetcherDecl::new("static", "test", vec![]),
        Arc::new(StaticSource::new(packages)),
    ));

    let scheduler = FetchScheduler::new(Arc::new(index), store(dir));
    scheduler
        .fetch_all(&mosaic::progress::SilentProgress::new())
        .unwrap();
    Arc::clone(scheduler.index())
}

pub fn names(packages: &[Arc<Package>]) -> Vec<String> {
    packages.iter().map(|p| p.name.name.clone()).collect()
}
