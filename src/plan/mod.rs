// src/plan/mod.rs

//! Installation planning
//!
//! A plan resolves package queries against a [`PackageIndex`] into an ordered
//! package list, dependencies before dependents. Each `(distribution, name)`
//! is installed at most once per plan; later queries for an installed name
//! only add a graph edge.
//!
//! Resolution of one query:
//! 1. already installed: record the edge, done
//! 2. search, pick a candidate (preferred architecture first, else the first
//!    result in index order)
//! 3. register the primary name, check the candidate's conflicts against
//!    everything installed and every chosen package's conflicts against the
//!    candidate, then register its aliases
//! 4. resolve each dependency group, taking the first alternative that is
//!    found
//! 5. append the candidate
//!
//! A failed top-level request is rolled back, so an incremental plan stays
//! usable after an error.
//!
//! A plan is not synchronised. Drive it from one thread; concurrent planning
//! uses separate plans.

use crate::directive::Directive;
use crate::error::{Error, Result};
use crate::index::{PackageIndex, QueryOptions};
use crate::package::{Package, PackageName};
use crate::progress::ProgressTracker;
use crate::version::version_matches;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Planner settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanOptions {
    /// Architecture to narrow to when several candidates match
    pub prefer_architecture: String,
    /// Skip dependency alternatives marked as recommended
    pub exclude_recommends: bool,
}

/// Outcome of resolving one query
///
/// Domain failures are values so the alternatives loop can inspect them;
/// `Err` is reserved for infrastructure failures.
#[derive(Debug)]
pub enum Resolution {
    /// Resolved; carries the packages newly added by this call
    Resolved(Vec<Arc<Package>>),
    NotFound(PackageName),
    Conflict {
        package: PackageName,
        conflicts_with: PackageName,
    },
    NoCandidate {
        package: PackageName,
        options: Vec<PackageName>,
    },
}

impl Resolution {
    pub fn into_result(self) -> Result<Vec<Arc<Package>>> {
        match self {
            Resolution::Resolved(added) => Ok(added),
            Resolution::NotFound(query) => Err(Error::PackageNotFound(query)),
            Resolution::Conflict {
                package,
                conflicts_with,
            } => Err(Error::Conflict {
                package,
                conflicts_with,
            }),
            Resolution::NoCandidate { package, options } => {
                Err(Error::NoCandidate { package, options })
            }
        }
    }
}

/// One dependency edge; `None` parent is a top-level request
pub type Edge = (Option<Arc<Package>>, Arc<Package>);

/// Plan state captured before a top-level request
struct Checkpoint {
    installed: HashMap<String, String>,
    installed_packages: HashMap<String, Arc<Package>>,
    bare_names: HashMap<String, String>,
    picked: usize,
    packages: usize,
    graph: usize,
}

/// An accumulating installation plan
pub struct InstallationPlan {
    index: Arc<PackageIndex>,
    options: PlanOptions,
    /// short name -> installed version
    installed: HashMap<String, String>,
    installed_packages: HashMap<String, Arc<Package>>,
    /// bare name -> short name, for queries without a distribution
    bare_names: HashMap<String, String>,
    /// Every chosen package in pick order, dependencies possibly pending
    picked: Vec<Arc<Package>>,
    packages: Vec<Arc<Package>>,
    graph: Vec<Edge>,
    base_image: Option<String>,
}

impl InstallationPlan {
    /// Empty plan; call [`add_package`](Self::add_package) as often as needed
    pub fn incremental(index: Arc<PackageIndex>, options: PlanOptions) -> Self {
        Self {
            index,
            options,
            installed: HashMap::new(),
            installed_packages: HashMap::new(),
            bare_names: HashMap::new(),
            picked: Vec::new(),
            packages: Vec::new(),
            graph: Vec::new(),
            base_image: None,
        }
    }

    /// Plan for a fixed list of queries, failing on the first error
    pub fn for_packages(
        index: Arc<PackageIndex>,
        queries: &[PackageName],
        options: PlanOptions,
    ) -> Result<Self> {
        let mut plan = Self::incremental(index, options);
        for query in queries {
            plan.add_package(query)?;
        }
        Ok(plan)
    }

    pub fn with_base_image(mut self, image: impl Into<String>) -> Self {
        self.base_image = Some(image.into());
        self
    }

    pub fn set_base_image(&mut self, image: impl Into<String>) {
        self.base_image = Some(image.into());
    }

    pub fn options(&self) -> &PlanOptions {
        &self.options
    }

    /// Packages in install order
    pub fn packages(&self) -> &[Arc<Package>] {
        &self.packages
    }

    pub fn edges(&self) -> &[Edge] {
        &self.graph
    }

    /// Version installed under the query's short name, if any
    pub fn installed_version(&self, query: &PackageName) -> Option<&str> {
        self.lookup_key(query)
            .and_then(|key| self.installed.get(key))
            .map(String::as_str)
    }

    /// Resolve a top-level request
    ///
    /// Returns the packages this call added, in the order they were picked.
    /// A failed request leaves the plan as it was before the call.
    pub fn add_package(&mut self, query: &PackageName) -> Result<Vec<Arc<Package>>> {
        let checkpoint = self.checkpoint();
        match self.resolve(None, query) {
            Ok(Resolution::Resolved(added)) => Ok(added),
            Ok(failure) => {
                self.restore(checkpoint);
                failure.into_result()
            }
            Err(e) => {
                self.restore(checkpoint);
                Err(e)
            }
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            installed: self.installed.clone(),
            installed_packages: self.installed_packages.clone(),
            bare_names: self.bare_names.clone(),
            picked: self.picked.len(),
            packages: self.packages.len(),
            graph: self.graph.len(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.installed = checkpoint.installed;
        self.installed_packages = checkpoint.installed_packages;
        self.bare_names = checkpoint.bare_names;
        self.picked.truncate(checkpoint.picked);
        self.packages.truncate(checkpoint.packages);
        self.graph.truncate(checkpoint.graph);
    }

    /// Resolve a request, keeping domain failures as values
    pub fn resolve(
        &mut self,
        parent: Option<&Arc<Package>>,
        query: &PackageName,
    ) -> Result<Resolution> {
        if let Some(existing) = self.installed_package(query) {
            self.graph.push((parent.cloned(), existing));
            return Ok(Resolution::Resolved(Vec::new()));
        }

        let results = self.index.search(query, &QueryOptions::default())?;
        let Some(pkg) = self.pick_package(query, &results, false) else {
            return Ok(Resolution::NotFound(query.clone()));
        };
        debug!("Resolved {} to {}", query, pkg.name);

        self.graph.push((parent.cloned(), Arc::clone(&pkg)));
        let mut added = vec![Arc::clone(&pkg)];

        self.add_name(&pkg, &pkg.name);

        for group in &pkg.conflicts {
            for option in group {
                if let Some(version) = self.installed_version(option)
                    && version_matches(version, &option.version)
                {
                    warn!("{} conflicts with installed {}", pkg.name, option);
                    return Ok(Resolution::Conflict {
                        package: pkg.name.clone(),
                        conflicts_with: option.clone(),
                    });
                }
            }
        }

        if let Some((other, option)) = self.declared_conflict(&pkg) {
            warn!("Installed {} conflicts with {}", other, pkg.name);
            return Ok(Resolution::Conflict {
                package: other,
                conflicts_with: option,
            });
        }
        self.picked.push(Arc::clone(&pkg));

        // Aliases go in after the conflict check so a package never
        // conflicts with its own names.
        for alias in &pkg.aliases {
            self.add_name(&pkg, alias);
        }

        for group in &pkg.depends {
            let options: Vec<&PackageName> = group
                .iter()
                .filter(|o| !(o.recommended && self.options.exclude_recommends))
                .collect();

            if options.is_empty() && !group.is_empty() {
                debug!("Skipping recommended dependencies of {}", pkg.name);
                continue;
            }

            let mut satisfied = false;
            for option in options {
                match self.resolve(Some(&pkg), option)? {
                    Resolution::Resolved(more) => {
                        added.extend(more);
                        satisfied = true;
                        break;
                    }
                    Resolution::NotFound(_) => continue,
                    failure => return Ok(failure),
                }
            }

            if !satisfied {
                return Ok(Resolution::NoCandidate {
                    package: pkg.name.clone(),
                    options: group.clone(),
                });
            }
        }

        self.packages.push(pkg);
        Ok(Resolution::Resolved(added))
    }

    fn pick_package(
        &self,
        query: &PackageName,
        results: &[Arc<Package>],
        filtered: bool,
    ) -> Option<Arc<Package>> {
        if results.len() <= 1 {
            return results.first().cloned();
        }

        let prefer = &self.options.prefer_architecture;
        if !prefer.is_empty() && !filtered {
            let arch_query = query.clone().with_architecture(prefer.clone());
            let narrowed: Vec<Arc<Package>> = results
                .iter()
                .filter(|pkg| pkg.matches(&arch_query))
                .cloned()
                .collect();

            if !narrowed.is_empty() {
                return self.pick_package(query, &narrowed, true);
            }
        }

        results.first().cloned()
    }

    /// First conflict an already chosen package declares against `pkg`
    fn declared_conflict(&self, pkg: &Arc<Package>) -> Option<(PackageName, PackageName)> {
        self.picked
            .iter()
            .filter(|other| !Arc::ptr_eq(*other, pkg))
            .find_map(|other| {
                other
                    .conflicts
                    .iter()
                    .flatten()
                    .find(|option| pkg.matches(option))
                    .map(|option| (other.name.clone(), option.clone()))
            })
    }

    fn lookup_key(&self, query: &PackageName) -> Option<&String> {
        if query.distribution.is_empty() {
            self.bare_names.get(&query.name)
        } else {
            let key = query.short_name();
            self.installed.get_key_value(&key).map(|(k, _)| k)
        }
    }

    fn installed_package(&self, query: &PackageName) -> Option<Arc<Package>> {
        self.lookup_key(query)
            .and_then(|key| self.installed_packages.get(key))
            .cloned()
    }

    fn add_name(&mut self, pkg: &Arc<Package>, name: &PackageName) {
        let key = name.short_name();
        self.installed.insert(key.clone(), name.version.clone());
        self.installed_packages.insert(key.clone(), Arc::clone(pkg));
        self.bare_names.entry(name.name.clone()).or_insert(key);
    }

    /// Base image, then every package's directives in install order
    pub fn directives(&self) -> Vec<Directive> {
        let mut ret = Vec::new();
        if let Some(image) = &self.base_image {
            ret.push(Directive::base_image(image.clone()));
        }
        for pkg in &self.packages {
            ret.extend(pkg.directives.iter().cloned());
        }
        ret
    }

    /// Write the dependency graph as Graphviz DOT
    pub fn dump_graph(&self, w: &mut dyn Write) -> Result<()> {
        writeln!(w, "digraph G {{")?;
        for (parent, child) in &self.graph {
            let from = match parent {
                Some(p) => p.name.to_string(),
                None => "<root>".to_string(),
            };
            writeln!(w, "  \"{}\" -> \"{}\";", from, child.name)?;
        }
        writeln!(w, "}}")?;
        Ok(())
    }
}

/// Try a fresh single-package plan for every indexed package
///
/// Returns `(working, broken)`.
pub fn test_all_packages(
    index: &Arc<PackageIndex>,
    options: &PlanOptions,
    progress: &dyn ProgressTracker,
) -> Result<(usize, usize)> {
    let packages = index.packages();
    progress.set_length(packages.len() as u64);

    let mut working = 0;
    let mut broken = 0;

    for pkg in &packages {
        let mut plan = InstallationPlan::incremental(Arc::clone(index), options.clone());
        match plan.add_package(&pkg.name) {
            Ok(_) => working += 1,
            Err(
                e @ (Error::PackageNotFound(_) | Error::Conflict { .. } | Error::NoCandidate { .. }),
            ) => {
                warn!("Failed to make installation plan for {}: {}", pkg.name, e);
                broken += 1;
            }
            Err(e) => return Err(e),
        }
        progress.increment(1);
    }

    progress.finish_with_message(&format!("{} working, {} broken", working, broken));
    info!(
        "Tested installation plans: {} working, {} broken, {} total",
        working,
        broken,
        packages.len()
    );

    Ok((working, broken))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ObjectCache;
    use crate::fetch::{FetchSource, FetchStore, Fetcher, FetcherDecl, FetcherHandle};
    use crate::progress::SilentProgress;
    use tempfile::TempDir;

    struct Fixed(Vec<Package>);

    impl FetchSource for Fixed {
        fn fetch(&self, handle: &mut FetcherHandle<'_>, _args: &[String]) -> Result<()> {
            for pkg in &self.0 {
                handle.add_package(pkg.clone())?;
            }
            Ok(())
        }
    }

    fn pkg(name: &str, arch: &str) -> Package {
        Package::new(PackageName::new("", name, "1.0", arch))
    }

    fn index_of(dir: &TempDir, packages: Vec<Package>) -> Arc<PackageIndex> {
        let store = FetchStore::new(ObjectCache::new(dir.path()).unwrap());
        let mut index = PackageIndex::new();
        let fetcher = index.add_fetcher(Fetcher::new(
            FetcherDecl::new("fixed", "test", vec![]),
            Arc::new(Fixed(packages)),
        ));
        fetcher.fetch_with_key(&store, false).unwrap();
        index.rebuild();
        Arc::new(index)
    }

    fn names(plan: &InstallationPlan) -> Vec<String> {
        plan.packages().iter().map(|p| p.name.name.clone()).collect()
    }

    #[test]
    fn test_prefer_architecture() {
        let dir = TempDir::new().unwrap();
        let index = index_of(&dir, vec![pkg("zlib", "aarch64"), pkg("zlib", "x86_64")]);

        let plan = InstallationPlan::for_packages(
            Arc::clone(&index),
            &[PackageName::parse("zlib")],
            PlanOptions::default(),
        )
        .unwrap();
        assert_eq!(plan.packages()[0].name.architecture, "aarch64");

        let plan = InstallationPlan::for_packages(
            index,
            &[PackageName::parse("zlib")],
            PlanOptions {
                prefer_architecture: "x86_64".into(),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(plan.packages()[0].name.architecture, "x86_64");
    }

    #[test]
    fn test_exclude_recommends() {
        let dir = TempDir::new().unwrap();
        let mut a = pkg("a", "");
        a.depends = vec![vec![PackageName::parse("docs").recommended()]];
        let index = index_of(&dir, vec![a, pkg("docs", "")]);

        let plan = InstallationPlan::for_packages(
            Arc::clone(&index),
            &[PackageName::parse("a")],
            PlanOptions::default(),
        )
        .unwrap();
        assert_eq!(names(&plan), vec!["docs", "a"]);

        let plan = InstallationPlan::for_packages(
            index,
            &[PackageName::parse("a")],
            PlanOptions {
                exclude_recommends: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(names(&plan), vec!["a"]);
    }

    #[test]
    fn test_incremental_reuses_installed() {
        let dir = TempDir::new().unwrap();
        let mut a = pkg("a", "");
        a.depends = vec![vec![PackageName::parse("c")]];
        let mut b = pkg("b", "");
        b.depends = vec![vec![PackageName::parse("c")]];
        let index = index_of(&dir, vec![a, b, pkg("c", "")]);

        let mut plan = InstallationPlan::incremental(index, PlanOptions::default());
        let added = plan.add_package(&PackageName::parse("a")).unwrap();
        assert_eq!(added.len(), 2);

        let added = plan.add_package(&PackageName::parse("b")).unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(names(&plan), vec!["c", "a", "b"]);
        assert_eq!(plan.edges().len(), 4);
        assert_eq!(plan.installed_version(&PackageName::parse("test/c")), Some("1.0"));

        let added = plan.add_package(&PackageName::parse("test/a")).unwrap();
        assert!(added.is_empty());
        assert_eq!(plan.packages().len(), 3);
    }

    #[test]
    fn test_alias_satisfies_dependency() {
        let dir = TempDir::new().unwrap();
        let mut libz = pkg("zlib", "");
        libz.aliases = vec![PackageName::new("", "so:libz.so.1", "", "")];
        let mut app = pkg("app", "");
        app.depends = vec![vec![PackageName::parse("so:libz.so.1")]];
        let index = index_of(&dir, vec![libz, app]);

        let mut plan = InstallationPlan::incremental(index, PlanOptions::default());
        plan.add_package(&PackageName::parse("zlib")).unwrap();
        let added = plan.add_package(&PackageName::parse("app")).unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(names(&plan), vec!["zlib", "app"]);
    }

    #[test]
    fn test_directives_and_graph() {
        let dir = TempDir::new().unwrap();
        let mut a = pkg("a", "");
        a.depends = vec![vec![PackageName::parse("b")]];
        a.directives = vec![Directive::run("setup-a")];
        let mut b = pkg("b", "");
        b.directives = vec![Directive::run("setup-b")];
        let index = index_of(&dir, vec![a, b]);

        let plan = InstallationPlan::for_packages(
            index,
            &[PackageName::parse("a")],
            PlanOptions::default(),
        )
        .unwrap()
        .with_base_image("alpine:3.20");

        assert_eq!(
            plan.directives(),
            vec![
                Directive::base_image("alpine:3.20"),
                Directive::run("setup-b"),
                Directive::run("setup-a"),
            ]
        );

        let mut out = Vec::new();
        plan.dump_graph(&mut out).unwrap();
        let dot = String::from_utf8(out).unwrap();
        assert_eq!(
            dot,
            "digraph G {\n  \"<root>\" -> \"test/a@1.0:\";\n  \"test/a@1.0:\" -> \"test/b@1.0:\";\n}\n"
        );
    }

    #[test]
    fn test_all_packages_counts() {
        let dir = TempDir::new().unwrap();
        let mut broken = pkg("broken", "");
        broken.depends = vec![vec![PackageName::parse("missing")]];
        let index = index_of(&dir, vec![pkg("ok", ""), broken]);

        let (working, broken) =
            test_all_packages(&index, &PlanOptions::default(), &SilentProgress::new()).unwrap();
        assert_eq!((working, broken), (1, 1));
    }
}
