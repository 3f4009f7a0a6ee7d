// src/fetch/scheduler.rs

//! Fetch scheduling
//!
//! Two modes over the fetchers declared in a [`PackageIndex`]:
//! - one-shot: every fetcher once, in parallel or sequentially, followed by
//!   a full index rebuild
//! - auto-refresh: per-fetcher timers feed a bounded queue drained by a
//!   fixed worker pool; each successful fetch is merged into the index on
//!   its own

use super::{FetchStore, Fetcher};
use crate::error::{Error, Result};
use crate::index::PackageIndex;
use crate::progress::ProgressTracker;
use flume::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Scheduler behaviour switches
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerOptions {
    /// Ignore cached fetch results
    pub force_refresh: bool,
    /// Run one-shot fetches one after another on the calling thread
    pub no_parallel: bool,
}

/// Runs fetchers and keeps the package index current
pub struct FetchScheduler {
    index: Arc<PackageIndex>,
    store: FetchStore,
    options: SchedulerOptions,
}

impl FetchScheduler {
    pub fn new(index: Arc<PackageIndex>, store: FetchStore) -> Self {
        Self {
            index,
            store,
            options: SchedulerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn index(&self) -> &Arc<PackageIndex> {
        &self.index
    }

    /// Fetch every fetcher once, then rebuild the index
    ///
    /// The first failure is returned as soon as it is seen. Fetches still in
    /// flight run to completion but the index is not rebuilt.
    pub fn fetch_all(&self, progress: &dyn ProgressTracker) -> Result<()> {
        let fetchers = self.index.fetchers();
        let force = self.options.force_refresh;
        progress.set_length(fetchers.len() as u64);

        if self.options.no_parallel {
            for fetcher in fetchers {
                progress.set_message(&fetcher.to_string());
                if let Err(e) = fetcher.fetch_with_key(&self.store, force) {
                    progress.finish_with_error(&e.to_string());
                    return Err(e);
                }
                progress.increment(1);
            }
        } else {
            let (done_tx, done_rx) = flume::unbounded::<Result<()>>();

            for fetcher in fetchers {
                let fetcher = Arc::clone(fetcher);
                let store = self.store.clone();
                let done_tx = done_tx.clone();

                thread::Builder::new()
                    .name(format!("fetch-{}", &fetcher.key()[..8]))
                    .spawn(move || {
                        let result = fetcher.fetch_with_key(&store, force);
                        let _ = done_tx.send(result);
                    })?;
            }
            drop(done_tx);

            for _ in 0..fetchers.len() {
                match done_rx.recv() {
                    Ok(Ok(())) => progress.increment(1),
                    Ok(Err(e)) => {
                        progress.finish_with_error(&e.to_string());
                        return Err(e);
                    }
                    Err(_) => {
                        return Err(Error::FetchFailed {
                            fetcher: "scheduler".to_string(),
                            reason: "fetch thread exited without reporting".to_string(),
                        });
                    }
                }
            }
        }

        self.index.rebuild();
        progress.finish_with_message(&format!("loaded {} packages", self.index.count()));
        info!(
            "Fetched {} fetchers, {} packages indexed",
            fetchers.len(),
            self.index.count()
        );

        Ok(())
    }

    /// Start periodic refresh of every fetcher
    ///
    /// Each fetcher is queued once immediately (forced only if
    /// `force_refresh` is set) and then forcibly every `interval`. At most
    /// `workers` fetches run at the same time.
    pub fn start_auto_refresh(&self, workers: usize, interval: Duration) -> Result<AutoRefresh> {
        let fetchers = self.index.fetchers();
        let workers = workers.max(1);

        let (request_tx, request_rx) = flume::bounded::<RefreshRequest>(fetchers.len().max(1));
        let (stop_tx, stop_rx) = flume::bounded::<()>(0);
        let running = Arc::new(AtomicBool::new(true));

        let mut threads = Vec::with_capacity(fetchers.len() + workers);

        for fetcher in fetchers {
            let fetcher = Arc::clone(fetcher);
            let request_tx = request_tx.clone();
            let stop_rx = stop_rx.clone();
            let initial_force = self.options.force_refresh;

            threads.push(
                thread::Builder::new()
                    .name(format!("refresh-timer-{}", &fetcher.key()[..8]))
                    .spawn(move || refresh_timer(fetcher, initial_force, interval, request_tx, stop_rx))?,
            );
        }
        drop(request_tx);

        for id in 0..workers {
            let request_rx = request_rx.clone();
            let index = Arc::clone(&self.index);
            let store = self.store.clone();

            threads.push(
                thread::Builder::new()
                    .name(format!("refresh-worker-{}", id))
                    .spawn(move || refresh_worker(id, index, store, request_rx))?,
            );
        }

        info!(
            "[refresh] Auto refresh started: {} fetchers, {} workers, every {:?}",
            fetchers.len(),
            workers,
            interval
        );

        Ok(AutoRefresh {
            stop_tx: Some(stop_tx),
            running,
            threads,
        })
    }
}

struct RefreshRequest {
    fetcher: Arc<Fetcher>,
    force: bool,
}

fn refresh_timer(
    fetcher: Arc<Fetcher>,
    initial_force: bool,
    interval: Duration,
    request_tx: Sender<RefreshRequest>,
    stop_rx: Receiver<()>,
) {
    let mut force = initial_force;

    loop {
        let request = RefreshRequest {
            fetcher: Arc::clone(&fetcher),
            force,
        };
        if request_tx.send(request).is_err() {
            break;
        }
        force = true;

        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("[refresh] Timer for {} stopped", fetcher);
}

fn refresh_worker(
    id: usize,
    index: Arc<PackageIndex>,
    store: FetchStore,
    request_rx: Receiver<RefreshRequest>,
) {
    while let Ok(request) = request_rx.recv() {
        let fetcher = request.fetcher;
        match fetcher.fetch_with_key(&store, request.force) {
            Ok(()) => {
                if let Err(e) = index.merge_fetcher(&fetcher) {
                    warn!("[refresh] Failed to merge {}: {}", fetcher, e);
                }
            }
            Err(e) => warn!("[refresh] Failed to refresh {}: {}", fetcher, e),
        }
    }

    debug!("[refresh] Worker {} stopped", id);
}

/// Handle to a running auto-refresh
///
/// Dropping the handle stops the refresh and waits for in-flight fetches.
pub struct AutoRefresh {
    stop_tx: Option<Sender<()>>,
    running: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl AutoRefresh {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the timers, drain queued requests and join every thread
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Disconnecting the stop channel wakes every timer
        self.stop_tx = None;

        for handle in self.threads.drain(..) {
            if let Err(e) = handle.join() {
                error!("[refresh] Thread panicked: {:?}", e);
            }
        }

        info!("[refresh] Auto refresh stopped");
    }
}

impl Drop for AutoRefresh {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ObjectCache;
    use crate::fetch::{FetchSource, FetcherDecl, FetcherHandle};
    use crate::package::{Package, PackageName};
    use crate::progress::SilentProgress;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct One(&'static str);

    impl FetchSource for One {
        fn fetch(&self, handle: &mut FetcherHandle<'_>, _args: &[String]) -> Result<()> {
            let name = handle.name(self.0, "1.0", "")?;
            handle.add_package(Package::new(name))
        }
    }

    struct Broken;

    impl FetchSource for Broken {
        fn fetch(&self, _handle: &mut FetcherHandle<'_>, _args: &[String]) -> Result<()> {
            Err(Error::DownloadError("unreachable mirror".into()))
        }
    }

    /// Counts its own calls and the peak overlap across a shared gauge
    struct Gauged {
        name: &'static str,
        calls: AtomicUsize,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl FetchSource for Gauged {
        fn fetch(&self, handle: &mut FetcherHandle<'_>, _args: &[String]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            self.active.fetch_sub(1, Ordering::SeqCst);

            let name = handle.name(self.name, "1.0", "")?;
            handle.add_package(Package::new(name))
        }
    }

    fn source<S: FetchSource + 'static>(s: S) -> Arc<dyn FetchSource> {
        Arc::new(s)
    }

    fn scheduler(dir: &TempDir, sources: Vec<(&str, Arc<dyn FetchSource>)>) -> FetchScheduler {
        let mut index = PackageIndex::new();
        for (dist, source) in sources {
            index.add_fetcher(Fetcher::new(FetcherDecl::new("test", dist, vec![]), source));
        }
        let store = FetchStore::new(ObjectCache::new(dir.path()).unwrap());
        FetchScheduler::new(Arc::new(index), store)
    }

    #[test]
    fn test_fetch_all_parallel_and_sequential() {
        for no_parallel in [false, true] {
            let dir = TempDir::new().unwrap();
            let scheduler = scheduler(
                &dir,
                vec![("alpine", source(One("zlib"))), ("debian", source(One("libc6")))],
            )
            .with_options(SchedulerOptions {
                no_parallel,
                ..Default::default()
            });

            let progress = SilentProgress::new();
            scheduler.fetch_all(&progress).unwrap();

            assert_eq!(progress.position(), 2);
            assert!(progress.is_finished());
            assert_eq!(scheduler.index().count(), 2);
        }
    }

    #[test]
    fn test_fetch_all_first_error_skips_rebuild() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(
            &dir,
            vec![("alpine", source(One("zlib"))), ("broken", source(Broken))],
        );

        let err = scheduler.fetch_all(&SilentProgress::new()).unwrap_err();
        assert!(err.to_string().contains("unreachable mirror"));
        assert_eq!(scheduler.index().count(), 0);
    }

    #[test]
    fn test_auto_refresh_merges_and_survives_failures() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(
            &dir,
            vec![("alpine", source(One("zlib"))), ("broken", source(Broken))],
        );

        let mut refresh = scheduler
            .start_auto_refresh(2, Duration::from_secs(3600))
            .unwrap();
        assert!(refresh.is_running());

        let query = PackageName::parse("alpine/zlib");
        let mut found = false;
        for _ in 0..200 {
            if !scheduler
                .index()
                .search(&query, &Default::default())
                .unwrap()
                .is_empty()
            {
                found = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        refresh.stop();
        assert!(!refresh.is_running());
        assert!(found);
    }

    #[test]
    fn test_auto_refresh_repeats_within_worker_bound() {
        let dir = TempDir::new().unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let sources: Vec<Arc<Gauged>> = ["zlib", "musl", "curl"]
            .into_iter()
            .map(|name| {
                Arc::new(Gauged {
                    name,
                    calls: AtomicUsize::new(0),
                    active: Arc::clone(&active),
                    peak: Arc::clone(&peak),
                })
            })
            .collect();

        let scheduler = scheduler(
            &dir,
            sources
                .iter()
                .zip(["alpine", "debian", "fedora"])
                .map(|(s, dist)| (dist, Arc::clone(s) as Arc<dyn FetchSource>))
                .collect(),
        );

        let mut refresh = scheduler
            .start_auto_refresh(1, Duration::from_millis(20))
            .unwrap();

        let repeated = |s: &Arc<Gauged>| s.calls.load(Ordering::SeqCst) >= 2;
        for _ in 0..300 {
            if sources.iter().all(repeated) {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        refresh.stop();

        assert!(sources.iter().all(repeated));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.index().count(), 3);
    }
}
