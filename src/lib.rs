// src/lib.rs

//! keel — dependency resolution core for the keel package manager.
//!
//! This crate turns a root package manifest (`keel.yaml`) plus an optional
//! previous lock file (`keel.lock`) into a deterministic set of concrete
//! package versions, fetches and verifies their archives, and persists the
//! lock file and the generated package configuration.
//!
//! # Architecture
//!
//! - `version`: semver constraint algebra (ranges, unions, differences)
//! - `package`: names, source descriptions, ranges, resolved ids
//! - `manifest`: the `keel.yaml` document
//! - `source`: hosted / git / path / sdk drivers behind one registry
//! - `cache`: content-addressed archive storage with hash sidecars
//! - `fetch`: the retrying, checksum-validated HTTP pipeline
//! - `lockfile`: the `keel.lock` document
//! - `solver`: the conflict-driven version solver
//! - `report`: machine-driven upgrade planning
//! - `project`: the "bring this directory up to date" coordinator

pub mod cache;
mod error;
pub mod fetch;
pub mod lockfile;
pub mod manifest;
pub mod package;
pub mod project;
pub mod report;
pub mod solver;
pub mod source;
pub mod version;

pub use error::{Error, Result, EXIT_DATA, EXIT_GENERIC, EXIT_SUCCESS, EXIT_UNAVAILABLE};
pub use lockfile::{DependencyKind, LockFile, LockFileError, LockedPackage, LOCK_FILE};
pub use manifest::{Manifest, ManifestError, MANIFEST_FILE};
pub use package::{
    Description, PackageId, PackageRange, PackageRef, ResolvedDescription, SourceKind,
};
pub use project::Project;
pub use report::{DependencyReporter, PackageChange};
pub use solver::{resolve_versions, ConstraintAndCause, SolveFailure, SolveResult, SolveType};
pub use version::{Version, VersionConstraint, VersionExt, VersionRange};
