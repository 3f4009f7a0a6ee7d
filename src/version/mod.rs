// src/version/mod.rs

//! Version ordering and version queries
//!
//! Package versions come from many distributions and rarely agree on a
//! format. Ordering first tries to canonicalise both sides into semver; when
//! that fails it falls back to a segment-wise comparison where numeric runs
//! compare numerically and everything else compares lexically.
//!
//! A `-suffix` is a distribution release (`1.2.3-r10`, `1.0-1`), not a semver
//! prerelease, so versions carrying one always take the segment-wise path.
//!
//! A version query is the `version` field of a `PackageName` used as a
//! search key: empty matches anything, `<v` and `>v` compare against `v`,
//! anything else must match exactly.

use crate::error::{Error, Result};
use semver::Version;
use std::cmp::Ordering;
use std::fmt;

/// A version string with its best-effort semver interpretation
#[derive(Debug, Clone)]
pub struct PackageVersion {
    raw: String,
    semver: Option<Version>,
}

impl PackageVersion {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let semver = canonicalize(&raw)
            .ok()
            .and_then(|canonical| Version::parse(&canonical).ok())
            .filter(|v| v.pre.is_empty());
        Self { raw, semver }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Compare two versions
    pub fn compare(&self, other: &PackageVersion) -> Ordering {
        match (&self.semver, &other.semver) {
            (Some(a), Some(b)) => a
                .cmp_precedence(b)
                .then_with(|| compare_segments(a.build.as_str(), b.build.as_str())),
            _ => compare_segments(&self.raw, &other.raw),
        }
    }
}

impl PartialEq for PackageVersion {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for PackageVersion {}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// A parsed version query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionQuery {
    /// Empty query, any version is acceptable
    Any,
    /// Must equal this string exactly
    Exact(String),
    /// `<v`
    LessThan(PackageVersion),
    /// `>v`
    GreaterThan(PackageVersion),
}

impl VersionQuery {
    pub fn parse(s: &str) -> Self {
        if s.is_empty() {
            VersionQuery::Any
        } else if let Some(rest) = s.strip_prefix('<') {
            VersionQuery::LessThan(PackageVersion::new(rest.trim()))
        } else if let Some(rest) = s.strip_prefix('>') {
            VersionQuery::GreaterThan(PackageVersion::new(rest.trim()))
        } else {
            VersionQuery::Exact(s.to_string())
        }
    }

    /// Check whether a candidate version satisfies this query
    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            VersionQuery::Any => true,
            VersionQuery::Exact(v) => v == candidate,
            VersionQuery::LessThan(v) => PackageVersion::new(candidate) < *v,
            VersionQuery::GreaterThan(v) => PackageVersion::new(candidate) > *v,
        }
    }
}

impl fmt::Display for VersionQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionQuery::Any => Ok(()),
            VersionQuery::Exact(v) => write!(f, "{}", v),
            VersionQuery::LessThan(v) => write!(f, "<{}", v),
            VersionQuery::GreaterThan(v) => write!(f, ">{}", v),
        }
    }
}

/// Shorthand for `VersionQuery::parse(query).matches(candidate)`
pub fn version_matches(candidate: &str, query: &str) -> bool {
    VersionQuery::parse(query).matches(candidate)
}

/// Rewrite a distribution version into a valid semver string
///
/// - leading `<`, `>`, `~` and `v` are dropped
/// - a `_suffix` and a single trailing letter move into build metadata
/// - leading zeros are stripped from each component
/// - missing minor/patch components become `0`, extra components move into
///   build metadata
///
/// Examples: `1.2` → `1.2.0`, `1.2.3a` → `1.2.3+a`, `2.4_p1` → `2.4.0+p1`,
/// `1.02.3.4` → `1.2.3+4`.
pub fn canonicalize(version: &str) -> Result<String> {
    let original = version;

    let version = version.trim_start_matches(['<', '>', '~']);
    let version = version.strip_prefix('v').unwrap_or(version);

    if Version::parse(version).is_ok() {
        return Ok(version.to_string());
    }

    let (mut version, mut build) = match version.split_once('_') {
        Some((v, b)) => (v.to_string(), b.to_string()),
        None => (version.to_string(), String::new()),
    };

    if let Some(last) = version.chars().last().filter(|c| c.is_ascii_lowercase()) {
        version.pop();
        build = if build.is_empty() {
            last.to_string()
        } else {
            format!("{last}{build}")
        };
    }

    if version.is_empty() {
        return Err(Error::ParseError(format!("could not canonicalize: {original}")));
    }

    let mut tokens: Vec<String> = version
        .split('.')
        .map(|t| {
            let t = t.trim_start_matches('0');
            if t.is_empty() { "0".to_string() } else { t.to_string() }
        })
        .collect();

    while tokens.len() < 3 {
        tokens.push("0".to_string());
    }

    if tokens.len() > 3 {
        let extra = tokens.split_off(3).join(".");
        build = if build.is_empty() {
            extra
        } else {
            format!("{build}.{extra}")
        };
    }

    let mut canonical = tokens.join(".");
    if !build.is_empty() {
        canonical = format!("{canonical}+{build}");
    }

    match Version::parse(&canonical) {
        Ok(_) => Ok(canonical),
        Err(_) => Err(Error::ParseError(format!(
            "could not canonicalize: old={original} new={canonical}"
        ))),
    }
}

/// Segment-wise comparison used when either side is not semver-like
fn compare_segments(a: &str, b: &str) -> Ordering {
    let sa = segments(a);
    let sb = segments(b);

    for (x, y) in sa.iter().zip(sb.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            // Numeric segments sort after alphabetic ones, as in rpmvercmp
            (Ok(_), Err(_)) => Ordering::Greater,
            (Err(_), Ok(_)) => Ordering::Less,
            (Err(_), Err(_)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    sa.len().cmp(&sb.len())
}

fn segments(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = None;
    let mut numeric = false;

    for (i, c) in s.char_indices() {
        if !c.is_ascii_alphanumeric() {
            if let Some(st) = start.take() {
                out.push(&s[st..i]);
            }
            continue;
        }

        match start {
            Some(st) if c.is_ascii_digit() != numeric => {
                out.push(&s[st..i]);
                start = Some(i);
                numeric = c.is_ascii_digit();
            }
            Some(_) => {}
            None => {
                start = Some(i);
                numeric = c.is_ascii_digit();
            }
        }
    }

    if let Some(st) = start {
        out.push(&s[st..]);
    }

    out
}
