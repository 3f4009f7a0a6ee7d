// src/error.rs

//! Error types for mosaic
//!
//! Resolution failures (`PackageNotFound`, `Conflict`, `NoCandidate`) are
//! domain errors and reach the caller verbatim. Everything else is an
//! infrastructure error and carries enough context (fetcher, tag, path) to
//! be diagnosed from the message alone.

use crate::package::PackageName;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A query resolved to zero candidates
    #[error("package {0} not found")]
    PackageNotFound(PackageName),

    /// A chosen package conflicts with one already in the plan
    #[error("found conflict between {package} and {conflicts_with}")]
    Conflict {
        package: PackageName,
        conflicts_with: PackageName,
    },

    /// Every alternative of a dependency group was missing
    #[error("could not find installation candidate for {package} among options: {}", format_options(.options))]
    NoCandidate {
        package: PackageName,
        options: Vec<PackageName>,
    },

    /// The emitter has no rendering for this directive kind
    #[error("directive {0} not handled for this emitter")]
    UnsupportedDirective(String),

    #[error("failed to load {fetcher}: {reason}")]
    FetchFailed { fetcher: String, reason: String },

    #[error("build of {tag} failed: {reason}")]
    BuildFailed { tag: String, reason: String },

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Download error: {0}")]
    DownloadError(String),

    #[error("invalid architecture: {0}")]
    InvalidArchitecture(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// True for the one error the dependency-alternatives loop may skip past
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::PackageNotFound(_))
    }

    /// Attach the fetcher description to an error raised during a fetch
    pub fn fetch_failed(fetcher: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Error::FetchFailed {
            fetcher: fetcher.into(),
            reason: err.to_string(),
        }
    }

    /// Attach the build tag to an error raised during a build
    pub fn build_failed(tag: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Error::BuildFailed {
            tag: tag.into(),
            reason: err.to_string(),
        }
    }
}

fn format_options(options: &[PackageName]) -> String {
    options
        .iter()
        .map(|o| o.to_string())
        .collect::<Vec<_>>()
        .join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_recoverable() {
        let err = Error::PackageNotFound(PackageName::parse("alpine/zlib"));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "package alpine/zlib@: not found");

        let err = Error::NotFound("zlib".to_string());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_no_candidate_lists_options() {
        let err = Error::NoCandidate {
            package: PackageName::parse("a"),
            options: vec![PackageName::parse("b"), PackageName::parse("c")],
        };
        let msg = err.to_string();
        assert!(msg.contains("/b@:"));
        assert!(msg.contains(" | "));
    }
}
