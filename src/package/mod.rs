// src/package/mod.rs

//! Package identities and package records
//!
//! A `PackageName` doubles as an identity and as a query. As a query an
//! empty field matches anything, a non-empty field must match exactly, and
//! `version` also understands `<v` / `>v`.

use crate::directive::Directive;
use crate::error::{Error, Result};
use crate::version::VersionQuery;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// CPU architectures a fetcher is allowed to emit
///
/// The empty string is accepted and means "unspecified".
pub const VALID_ARCHITECTURES: &[&str] = &[
    "",
    "aarch64",
    "armhf",
    "armv7",
    "mips",
    "mipsel",
    "mipsn32",
    "mipsn32el",
    "mipsn32r6",
    "mipsn32r6el",
    "mipsr6",
    "mipsr6el",
    "mips64",
    "mips64el",
    "mips64r6",
    "mips64r6el",
    "powerpc",
    "ppc64le",
    "ppc64el",
    "riscv64",
    "s390x",
    "i386",
    "i586",
    "i686",
    "x32",
    "x86_64",
    "any",
    "src",
    "noarch",
    "all",
];

/// Check an architecture string against [`VALID_ARCHITECTURES`]
pub fn validate_architecture(arch: &str) -> Result<()> {
    if VALID_ARCHITECTURES.contains(&arch) {
        Ok(())
    } else {
        Err(Error::InvalidArchitecture(arch.to_string()))
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Identity of a package, also used as a search query
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageName {
    #[serde(default)]
    pub distribution: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub architecture: String,
    /// Marks a dependency alternative that `exclude_recommends` may skip
    #[serde(default, skip_serializing_if = "is_false")]
    pub recommended: bool,
}

impl PackageName {
    pub fn new(
        distribution: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        architecture: impl Into<String>,
    ) -> Self {
        Self {
            distribution: distribution.into(),
            name: name.into(),
            version: version.into(),
            architecture: architecture.into(),
            recommended: false,
        }
    }

    /// Parse `distribution/name` or a bare `name`
    pub fn parse(s: &str) -> Self {
        match s.split_once('/') {
            Some((distribution, name)) => Self::new(distribution, name, "", ""),
            None => Self::new("", s, "", ""),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = architecture.into();
        self
    }

    pub fn recommended(mut self) -> Self {
        self.recommended = true;
        self
    }

    /// Check whether this name satisfies `query`
    pub fn matches(&self, query: &PackageName) -> bool {
        if !query.distribution.is_empty() && query.distribution != self.distribution {
            return false;
        }
        if !query.architecture.is_empty() && query.architecture != self.architecture {
            return false;
        }
        if !query.name.is_empty() && query.name != self.name {
            return false;
        }
        VersionQuery::parse(&query.version).matches(&self.version)
    }

    /// Planning key: distribution and name only
    pub fn short_name(&self) -> String {
        format!("{}/{}", self.distribution, self.name)
    }

    /// Path segments used by the secondary mirror:
    /// `[name, version, distro, distro_version, arch]`
    pub fn path(&self) -> [String; 5] {
        let (distro, distro_version) = match self.distribution.split_once('@') {
            Some((d, v)) => (d, v),
            None => (self.distribution.as_str(), "latest"),
        };

        [
            self.name.clone(),
            self.version.clone(),
            distro.to_string(),
            distro_version.to_string(),
            self.architecture.clone(),
        ]
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}:{}",
            self.distribution, self.name, self.version, self.architecture
        )
    }
}

/// Where the contents of a package can be obtained from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Downloader {
    /// Plain HTTP(S) download, optionally size-checked
    Http {
        url: String,
        #[serde(default)]
        expected_size: Option<u64>,
    },
    /// Contents served by another fetcher's source
    Content { fetcher: String, url: String },
}

impl Downloader {
    pub fn url(&self) -> &str {
        match self {
            Downloader::Http { url, .. } => url,
            Downloader::Content { url, .. } => url,
        }
    }
}

/// One resolvable package record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Package {
    pub name: PackageName,
    pub description: String,
    pub license: String,
    pub size: u64,
    pub installed_size: u64,
    pub download_urls: Vec<String>,
    pub downloaders: Vec<Downloader>,
    pub metadata: BTreeMap<String, String>,
    /// Dependency groups; each group lists alternatives in preference order
    pub depends: Vec<Vec<PackageName>>,
    /// Same shape as `depends`, forbidding co-installation
    pub conflicts: Vec<Vec<PackageName>>,
    pub aliases: Vec<PackageName>,
    pub directives: Vec<Directive>,
}

impl Package {
    pub fn new(name: PackageName) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    /// Index identity
    pub fn id(&self) -> String {
        self.name.to_string()
    }

    /// True if the primary name or any alias satisfies `query`
    pub fn matches(&self, query: &PackageName) -> bool {
        self.names().any(|n| n.matches(query))
    }

    /// Primary name followed by every alias
    pub fn names(&self) -> impl Iterator<Item = &PackageName> {
        std::iter::once(&self.name).chain(self.aliases.iter())
    }

    /// First content source, falling back to the first plain URL
    pub fn preferred_downloader(&self) -> Option<Downloader> {
        self.downloaders.first().cloned().or_else(|| {
            self.download_urls.first().map(|url| Downloader::Http {
                url: url.clone(),
                expected_size: (self.size > 0).then_some(self.size),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let name = PackageName::parse("alpine/zlib");
        assert_eq!(name.distribution, "alpine");
        assert_eq!(name.name, "zlib");
        assert_eq!(name.to_string(), "alpine/zlib@:");

        let name = PackageName::parse("zlib").with_version("1.3").with_architecture("x86_64");
        assert_eq!(name.to_string(), "/zlib@1.3:x86_64");
        assert_eq!(name.short_name(), "/zlib");
    }

    #[test]
    fn test_matches_partial_query() {
        let name = PackageName::new("alpine", "zlib", "1.3.1", "x86_64");

        assert!(name.matches(&PackageName::parse("zlib")));
        assert!(name.matches(&PackageName::parse("alpine/zlib")));
        assert!(!name.matches(&PackageName::parse("debian/zlib")));
        assert!(name.matches(&PackageName::parse("zlib").with_version("<2.0")));
        assert!(!name.matches(&PackageName::parse("zlib").with_version(">2.0")));
        assert!(!name.matches(&PackageName::parse("zlib").with_architecture("aarch64")));
        assert!(name.matches(&PackageName::default()));
    }

    #[test]
    fn test_path() {
        let name = PackageName::new("alpine@3.20", "zlib", "1.3.1", "x86_64");
        assert_eq!(name.path(), ["zlib", "1.3.1", "alpine", "3.20", "x86_64"]);

        let name = PackageName::new("arch", "zlib", "1.3.1", "x86_64");
        assert_eq!(name.path()[3], "latest");
    }

    #[test]
    fn test_package_matches_alias() {
        let mut pkg = Package::new(PackageName::new("alpine", "so:libz.so.1", "", ""));
        pkg.aliases.push(PackageName::new("alpine", "zlib", "1.3.1", ""));

        assert!(pkg.matches(&PackageName::parse("alpine/zlib")));
        assert!(!pkg.matches(&PackageName::parse("alpine/openssl")));
    }

    #[test]
    fn test_architecture_validation() {
        assert!(validate_architecture("x86_64").is_ok());
        assert!(validate_architecture("").is_ok());
        assert!(validate_architecture("mips64r6el").is_ok());
        assert!(matches!(
            validate_architecture("amd64"),
            Err(Error::InvalidArchitecture(_))
        ));
    }

    #[test]
    fn test_package_record_defaults() {
        let pkg: Package =
            serde_json::from_str(r#"{"name":{"name":"zlib"},"download_urls":["https://x/z.apk"],"size":10}"#)
                .unwrap();
        assert_eq!(pkg.name.distribution, "");
        assert!(pkg.depends.is_empty());
        assert_eq!(
            pkg.preferred_downloader(),
            Some(Downloader::Http {
                url: "https://x/z.apk".into(),
                expected_size: Some(10)
            })
        );
    }
}
