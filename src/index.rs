// src/index.rs

//! Consolidated package index
//!
//! The index holds every declared fetcher and a snapshot of their packages.
//! The snapshot sits behind a single lock: a full fetch cycle replaces it in
//! one write, an auto-refresh merges one fetcher's slot at a time, and
//! searches scan it under the read lock. A search never observes a
//! half-merged state.
//!
//! When the snapshot has nothing for a query, search providers registered
//! for the query's distribution get a chance to answer it.

use crate::error::{Error, Result};
use crate::fetch::{FetchSource, Fetcher, FetcherDecl, FetcherHandle, FetcherStatus};
use crate::package::{Package, PackageName};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::sync::Arc;
use tracing::debug;

/// Search limits
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Stop after this many results; 0 means unlimited
    pub max_results: usize,
}

impl QueryOptions {
    pub fn with_max_results(max_results: usize) -> Self {
        Self { max_results }
    }

    fn is_full(&self, found: usize) -> bool {
        self.max_results != 0 && found >= self.max_results
    }
}

/// Fallback resolver for queries the index cannot answer
///
/// Packages a provider produces are remembered, so a repeated query is
/// answered without calling the source again.
pub struct SearchProvider {
    decl: FetcherDecl,
    source: Arc<dyn FetchSource>,
    packages: Mutex<Vec<Arc<Package>>>,
}

impl SearchProvider {
    pub fn new(decl: FetcherDecl, source: Arc<dyn FetchSource>) -> Self {
        Self {
            decl,
            source,
            packages: Mutex::new(Vec::new()),
        }
    }

    pub fn distribution(&self) -> &str {
        &self.decl.distribution
    }

    fn search_existing(&self, query: &PackageName, opts: &QueryOptions) -> Vec<Arc<Package>> {
        let mut ret = Vec::new();
        for pkg in self.packages.lock().iter() {
            if pkg.matches(query) {
                ret.push(Arc::clone(pkg));
                if opts.is_full(ret.len()) {
                    break;
                }
            }
        }
        ret
    }

    pub fn search(&self, query: &PackageName, opts: &QueryOptions) -> Result<Vec<Arc<Package>>> {
        let existing = self.search_existing(query, opts);
        if !existing.is_empty() {
            return Ok(existing);
        }

        debug!("Search provider {} queried for {}", self.decl, query);

        let mut handle = FetcherHandle::new(&self.decl);
        self.source
            .search(&mut handle, query, &self.decl.args)
            .map_err(|e| Error::fetch_failed(self.decl.to_string(), e))?;
        let (produced, _) = handle.into_parts();

        {
            let mut packages = self.packages.lock();
            for pkg in produced {
                if !packages.iter().any(|p| p.name == pkg.name) {
                    packages.push(Arc::new(pkg));
                }
            }
        }

        Ok(self.search_existing(query, opts))
    }
}

#[derive(Default)]
struct IndexTable {
    /// One slot per fetcher, in declaration order
    slots: Vec<Vec<Arc<Package>>>,
    by_id: HashMap<String, Arc<Package>>,
}

impl IndexTable {
    /// Rebuild the id map; the first slot holding an id wins
    fn reindex(&mut self) {
        let mut by_id = HashMap::new();
        for pkg in self.slots.iter().flatten() {
            by_id.entry(pkg.id()).or_insert_with(|| Arc::clone(pkg));
        }
        self.by_id = by_id;
    }
}

/// Lock-guarded table of every fetcher's packages
pub struct PackageIndex {
    fetchers: Vec<Arc<Fetcher>>,
    providers: Vec<SearchProvider>,
    table: RwLock<IndexTable>,
}

impl Default for PackageIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageIndex {
    pub fn new() -> Self {
        Self {
            fetchers: Vec::new(),
            providers: Vec::new(),
            table: RwLock::new(IndexTable::default()),
        }
    }

    /// Declare a fetcher; search order follows declaration order
    pub fn add_fetcher(&mut self, fetcher: Fetcher) -> Arc<Fetcher> {
        let fetcher = Arc::new(fetcher);
        self.fetchers.push(Arc::clone(&fetcher));
        self.table.get_mut().slots.push(Vec::new());
        fetcher
    }

    pub fn add_search_provider(&mut self, provider: SearchProvider) {
        self.providers.push(provider);
    }

    pub fn fetchers(&self) -> &[Arc<Fetcher>] {
        &self.fetchers
    }

    /// Replace the whole snapshot from every fetcher's current packages
    pub fn rebuild(&self) {
        let slots: Vec<Vec<Arc<Package>>> = self.fetchers.iter().map(|f| f.packages()).collect();

        let mut table = self.table.write();
        table.slots = slots;
        table.reindex();

        debug!("Package index rebuilt: {} packages", table.by_id.len());
    }

    /// Replace one fetcher's slot, leaving every other fetcher untouched
    pub fn merge_fetcher(&self, fetcher: &Arc<Fetcher>) -> Result<()> {
        let position = self
            .fetchers
            .iter()
            .position(|f| Arc::ptr_eq(f, fetcher))
            .ok_or_else(|| Error::NotFound(format!("fetcher {} is not indexed", fetcher)))?;
        let packages = fetcher.packages();

        let mut table = self.table.write();
        table.slots[position] = packages;
        table.reindex();

        debug!("Merged {} into package index", fetcher);
        Ok(())
    }

    /// Linear scan in fetcher order, then search providers if nothing matched
    pub fn search(&self, query: &PackageName, opts: &QueryOptions) -> Result<Vec<Arc<Package>>> {
        let mut ret = Vec::new();

        {
            let table = self.table.read();
            'outer: for (fetcher, slot) in self.fetchers.iter().zip(table.slots.iter()) {
                if !fetcher.matches(query) {
                    continue;
                }

                for pkg in slot {
                    if pkg.matches(query) {
                        ret.push(Arc::clone(pkg));
                        if opts.is_full(ret.len()) {
                            break 'outer;
                        }
                    }
                }
            }
        }

        if ret.is_empty() {
            return self.search_with_providers(query, opts);
        }
        Ok(ret)
    }

    fn search_with_providers(
        &self,
        query: &PackageName,
        opts: &QueryOptions,
    ) -> Result<Vec<Arc<Package>>> {
        match self
            .providers
            .iter()
            .find(|p| p.distribution() == query.distribution)
        {
            Some(provider) => provider.search(query, opts),
            None => Ok(Vec::new()),
        }
    }

    /// Look a package up by its full identity string
    pub fn get(&self, id: &str) -> Option<Arc<Package>> {
        self.table.read().by_id.get(id).cloned()
    }

    /// Every indexed package, in search order
    pub fn packages(&self) -> Vec<Arc<Package>> {
        self.table.read().slots.iter().flatten().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.table.read().slots.iter().map(Vec::len).sum()
    }

    /// Primary names of every indexed package
    pub fn all_names(&self) -> Vec<PackageName> {
        self.table
            .read()
            .slots
            .iter()
            .flatten()
            .map(|pkg| pkg.name.clone())
            .collect()
    }

    /// Write every name and alias as JSON lines
    pub fn write_names(&self, w: &mut dyn Write) -> Result<()> {
        let table = self.table.read();
        for pkg in table.slots.iter().flatten() {
            for name in pkg.names() {
                serde_json::to_writer(&mut *w, name)?;
                w.write_all(b"\n")?;
            }
        }
        Ok(())
    }

    /// Sorted distributions known to any fetcher, always including `""`
    pub fn distribution_list(&self) -> Vec<String> {
        let mut set = BTreeSet::from([String::new()]);
        for fetcher in &self.fetchers {
            set.extend(fetcher.distributions());
        }
        set.into_iter().collect()
    }

    /// Sorted architectures known to any fetcher, always including `""`
    pub fn architecture_list(&self) -> Vec<String> {
        let mut set = BTreeSet::from([String::new()]);
        for fetcher in &self.fetchers {
            set.extend(fetcher.architectures());
        }
        set.into_iter().collect()
    }

    pub fn fetcher_status(&self) -> Vec<FetcherStatus> {
        self.fetchers.iter().map(|f| f.report()).collect()
    }

    pub fn get_fetcher(&self, key: &str) -> Option<Arc<Fetcher>> {
        self.fetchers.iter().find(|f| f.key() == key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ObjectCache;
    use crate::fetch::FetchStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Names(Vec<&'static str>);

    impl FetchSource for Names {
        fn fetch(&self, handle: &mut FetcherHandle<'_>, _args: &[String]) -> Result<()> {
            for name in &self.0 {
                let name = handle.name(name, "1.0", "x86_64")?;
                handle.add_package(Package::new(name))?;
            }
            Ok(())
        }
    }

    struct CountingSearch(AtomicUsize);

    impl FetchSource for CountingSearch {
        fn fetch(&self, _handle: &mut FetcherHandle<'_>, _args: &[String]) -> Result<()> {
            Ok(())
        }

        fn search(
            &self,
            handle: &mut FetcherHandle<'_>,
            query: &PackageName,
            _args: &[String],
        ) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            let name = handle.name(&query.name, "9.9", "")?;
            handle.add_package(Package::new(name))
        }
    }

    fn loaded_index(dir: &TempDir) -> PackageIndex {
        let store = FetchStore::new(ObjectCache::new(dir.path()).unwrap());
        let mut index = PackageIndex::new();
        let a = index.add_fetcher(Fetcher::new(
            FetcherDecl::new("names", "alpine", vec!["a".into()]),
            Arc::new(Names(vec!["zlib", "musl"])),
        ));
        let b = index.add_fetcher(Fetcher::new(
            FetcherDecl::new("names", "debian", vec!["b".into()]),
            Arc::new(Names(vec!["zlib"])),
        ));
        a.fetch_with_key(&store, false).unwrap();
        b.fetch_with_key(&store, false).unwrap();
        index.rebuild();
        index
    }

    #[test]
    fn test_search_in_fetcher_order() {
        let dir = TempDir::new().unwrap();
        let index = loaded_index(&dir);

        let found = index
            .search(&PackageName::parse("zlib"), &QueryOptions::default())
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name.distribution, "alpine");
        assert_eq!(found[1].name.distribution, "debian");

        let found = index
            .search(&PackageName::parse("zlib"), &QueryOptions::with_max_results(1))
            .unwrap();
        assert_eq!(found.len(), 1);

        let found = index
            .search(&PackageName::parse("debian/musl"), &QueryOptions::default())
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_queries() {
        let dir = TempDir::new().unwrap();
        let index = loaded_index(&dir);

        assert_eq!(index.count(), 3);
        assert_eq!(index.all_names().len(), 3);
        assert_eq!(index.distribution_list(), vec!["", "alpine", "debian"]);
        assert_eq!(index.architecture_list(), vec!["", "x86_64"]);
        assert!(index.get("alpine/zlib@1.0:x86_64").is_some());
        assert!(index.get("alpine/zlib@2.0:x86_64").is_none());

        let key = index.fetchers()[1].key().to_string();
        assert_eq!(index.get_fetcher(&key).unwrap().decl().distribution, "debian");
        assert_eq!(index.fetcher_status().len(), 2);

        let mut out = Vec::new();
        index.write_names(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_merge_touches_one_slot() {
        let dir = TempDir::new().unwrap();
        let index = loaded_index(&dir);
        let store = FetchStore::new(ObjectCache::new(dir.path()).unwrap());

        let debian = Arc::clone(&index.fetchers()[1]);
        debian.fetch_with_key(&store, true).unwrap();
        index.merge_fetcher(&debian).unwrap();

        assert_eq!(index.count(), 3);
        assert!(index.get("debian/zlib@1.0:x86_64").is_some());
        assert!(index.get("alpine/musl@1.0:x86_64").is_some());

        let stray = Arc::new(Fetcher::new(
            FetcherDecl::new("names", "", vec![]),
            Arc::new(Names(vec![])),
        ));
        assert!(index.merge_fetcher(&stray).is_err());
    }

    /// Lists its names on the first fetch only
    struct Dropping {
        names: Vec<&'static str>,
        fetched: AtomicUsize,
    }

    impl FetchSource for Dropping {
        fn fetch(&self, handle: &mut FetcherHandle<'_>, _args: &[String]) -> Result<()> {
            if self.fetched.fetch_add(1, Ordering::SeqCst) > 0 {
                return Ok(());
            }
            for name in &self.names {
                let name = handle.name(name, "1.0", "x86_64")?;
                handle.add_package(Package::new(name))?;
            }
            Ok(())
        }
    }

    #[test]
    fn test_merge_keeps_ids_shared_with_other_fetchers() {
        let dir = TempDir::new().unwrap();
        let store = FetchStore::new(ObjectCache::new(dir.path()).unwrap());
        let mut index = PackageIndex::new();
        let first = index.add_fetcher(Fetcher::new(
            FetcherDecl::new("dropping", "alpine", vec!["main".into()]),
            Arc::new(Dropping {
                names: vec!["zlib"],
                fetched: AtomicUsize::new(0),
            }),
        ));
        let second = index.add_fetcher(Fetcher::new(
            FetcherDecl::new("names", "alpine", vec!["community".into()]),
            Arc::new(Names(vec!["zlib"])),
        ));
        first.fetch_with_key(&store, false).unwrap();
        second.fetch_with_key(&store, false).unwrap();
        index.rebuild();

        let id = "alpine/zlib@1.0:x86_64";
        let before = index.get(id).unwrap();
        assert!(Arc::ptr_eq(&before, &index.packages()[0]));

        first.fetch_with_key(&store, true).unwrap();
        assert!(first.packages().is_empty());
        index.merge_fetcher(&first).unwrap();

        assert_eq!(index.count(), 1);
        let after = index.get(id).expect("still held by the second fetcher");
        assert!(Arc::ptr_eq(&after, &second.packages()[0]));
    }

    #[test]
    fn test_search_provider_fallback_is_cached() {
        let dir = TempDir::new().unwrap();
        let mut index = loaded_index(&dir);
        let source = Arc::new(CountingSearch(AtomicUsize::new(0)));
        index.add_search_provider(SearchProvider::new(
            FetcherDecl::new("pypi", "pypi", vec![]),
            source.clone(),
        ));

        let query = PackageName::parse("pypi/requests");
        for _ in 0..2 {
            let found = index.search(&query, &QueryOptions::default()).unwrap();
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].name.version, "9.9");
        }
        assert_eq!(source.0.load(Ordering::SeqCst), 1);

        // Providers only answer for their own distribution
        let found = index
            .search(&PackageName::parse("requests"), &QueryOptions::default())
            .unwrap();
        assert!(found.is_empty());
    }
}
