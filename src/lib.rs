// src/lib.rs

//! Mosaic: package metadata acquisition and image assembly
//!
//! Fetchers pull package records from many sources into a shared
//! [`index::PackageIndex`]. An [`plan::InstallationPlan`] resolves requested
//! names against that index into an ordered, conflict-checked package list
//! whose directives can be rendered by a [`directive::DirectiveEmitter`].
//! Downloads and other build steps go through the content-addressed
//! [`build::BuildOrchestrator`].
//!
//! # Architecture
//!
//! - Fetch results are cached per fetcher key with a TTL
//! - The package index is rebuilt wholesale after a one-shot fetch, or merged
//!   per fetcher during auto refresh
//! - Build artifacts are published by atomic rename only

pub mod build;
pub mod cache;
pub mod config;
pub mod directive;
mod error;
pub mod fetch;
pub mod hash;
pub mod index;
pub mod package;
pub mod plan;
pub mod progress;
pub mod version;

pub use build::{BuildDefinition, BuildOrchestrator, BuildResult};
pub use config::MosaicConfig;
pub use directive::{Directive, DirectiveEmitter, Dockerfile};
pub use error::{Error, Result};
pub use fetch::{FetchScheduler, Fetcher, FetcherDecl};
pub use hash::HashAlgorithm;
pub use index::PackageIndex;
pub use package::{Package, PackageName};
pub use plan::{InstallationPlan, PlanOptions, Resolution};
