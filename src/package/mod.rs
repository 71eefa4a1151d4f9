// src/package/mod.rs

//! Package identities: names, source descriptions, constrained ranges, and
//! concrete resolved ids.
//!
//! A [`Description`] says where a package comes from, without pinning it.
//! A [`PackageRange`] pairs a description with a version constraint (what a
//! manifest declares). A [`PackageId`] pairs a description with a concrete
//! version and, where applicable, resolution detail (content hash for hosted
//! packages, commit for git packages) — what a lock file records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use crate::version::{Version, VersionConstraint};

/// The source families a package description can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Hosted,
    Git,
    Path,
    Sdk,
    /// The root package itself; never listed, downloaded, or locked.
    Root,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Hosted => "hosted",
            SourceKind::Git => "git",
            SourceKind::Path => "path",
            SourceKind::Sdk => "sdk",
            SourceKind::Root => "root",
        };
        write!(f, "{name}")
    }
}

/// Where a package comes from. Two descriptions are equal iff all of their
/// components are structurally equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Description {
    /// A package served by a hosted registry.
    Hosted { name: String, url: String },
    /// A package in a git repository, optionally in a subdirectory, at an
    /// optional reference (branch, tag, or revision; `None` means HEAD).
    Git {
        url: String,
        path: String,
        reference: Option<String>,
    },
    /// A package in a local directory. `relative` records whether the path
    /// was written relative to its containing file.
    Path { path: PathBuf, relative: bool },
    /// A package bundled with an installed SDK.
    Sdk { sdk: String },
    /// The root package.
    Root,
}

impl Description {
    pub fn kind(&self) -> SourceKind {
        match self {
            Description::Hosted { .. } => SourceKind::Hosted,
            Description::Git { .. } => SourceKind::Git,
            Description::Path { .. } => SourceKind::Path,
            Description::Sdk { .. } => SourceKind::Sdk,
            Description::Root => SourceKind::Root,
        }
    }
}

/// A description plus the resolution detail a lock file needs to reproduce
/// an exact package: the archive content hash for hosted packages, the
/// pinned commit for git packages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedDescription {
    Hosted {
        name: String,
        url: String,
        /// SHA-256 of the package archive, lower-case hex (64 chars), when
        /// known. Filled lazily when the archive is downloaded.
        sha256: Option<String>,
    },
    Git {
        url: String,
        path: String,
        reference: Option<String>,
        commit: String,
    },
    Path {
        path: PathBuf,
        relative: bool,
    },
    Sdk {
        sdk: String,
    },
    Root,
}

impl ResolvedDescription {
    /// Strip the resolution detail back down to a plain [`Description`].
    pub fn description(&self) -> Description {
        match self {
            ResolvedDescription::Hosted { name, url, .. } => Description::Hosted {
                name: name.clone(),
                url: url.clone(),
            },
            ResolvedDescription::Git {
                url,
                path,
                reference,
                ..
            } => Description::Git {
                url: url.clone(),
                path: path.clone(),
                reference: reference.clone(),
            },
            ResolvedDescription::Path { path, relative } => Description::Path {
                path: path.clone(),
                relative: *relative,
            },
            ResolvedDescription::Sdk { sdk } => Description::Sdk { sdk: sdk.clone() },
            ResolvedDescription::Root => Description::Root,
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.description().kind()
    }

    /// The archive content hash, for hosted descriptions that carry one.
    pub fn sha256(&self) -> Option<&str> {
        match self {
            ResolvedDescription::Hosted { sha256, .. } => sha256.as_deref(),
            _ => None,
        }
    }

    /// A copy of this description with the content hash replaced.
    pub fn with_sha256(&self, hash: Option<String>) -> ResolvedDescription {
        match self {
            ResolvedDescription::Hosted { name, url, .. } => ResolvedDescription::Hosted {
                name: name.clone(),
                url: url.clone(),
                sha256: hash,
            },
            other => other.clone(),
        }
    }
}

/// A named reference to a package at a particular source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageRef {
    pub name: String,
    pub description: Description,
}

impl PackageRef {
    pub fn new(name: impl Into<String>, description: Description) -> Self {
        Self {
            name: name.into(),
            description,
        }
    }

    /// A hosted reference at the given registry URL.
    pub fn hosted(name: impl Into<String>, url: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            description: Description::Hosted {
                name: name.clone(),
                url: url.into(),
            },
            name,
        }
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.description.kind() {
            SourceKind::Hosted | SourceKind::Root => write!(f, "{}", self.name),
            kind => write!(f, "{} from {kind}", self.name),
        }
    }
}

/// A package reference with a version constraint and a feature selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRange {
    pub name: String,
    pub description: Description,
    pub constraint: VersionConstraint,
    pub features: BTreeSet<String>,
}

impl PackageRange {
    pub fn new(
        name: impl Into<String>,
        description: Description,
        constraint: VersionConstraint,
    ) -> Self {
        Self {
            name: name.into(),
            description,
            constraint,
            features: BTreeSet::new(),
        }
    }

    /// The range for the root package itself: exactly its own version.
    pub fn root(name: impl Into<String>, version: &Version) -> Self {
        Self::new(
            name,
            Description::Root,
            VersionConstraint::exact(version.clone()),
        )
    }

    pub fn to_ref(&self) -> PackageRef {
        PackageRef::new(self.name.clone(), self.description.clone())
    }

    /// Whether `id` names the same package from the same source and its
    /// version satisfies this range's constraint.
    pub fn allows(&self, id: &PackageId) -> bool {
        self.name == id.name
            && self.description == id.description.description()
            && self.constraint.allows(&id.version)
    }

    /// This range with a different constraint.
    pub fn with_constraint(&self, constraint: VersionConstraint) -> PackageRange {
        PackageRange {
            name: self.name.clone(),
            description: self.description.clone(),
            constraint,
            features: self.features.clone(),
        }
    }
}

impl fmt::Display for PackageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.constraint)?;
        match self.description.kind() {
            SourceKind::Hosted | SourceKind::Root => Ok(()),
            kind => write!(f, " from {kind}"),
        }
    }
}

/// A package pinned to a concrete version from a concrete source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageId {
    pub name: String,
    pub version: Version,
    pub description: ResolvedDescription,
}

impl PackageId {
    pub fn new(
        name: impl Into<String>,
        version: Version,
        description: ResolvedDescription,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            description,
        }
    }

    /// The id of the root package.
    pub fn root(name: impl Into<String>, version: Version) -> Self {
        Self::new(name, version, ResolvedDescription::Root)
    }

    pub fn is_root(&self) -> bool {
        matches!(self.description, ResolvedDescription::Root)
    }

    pub fn to_ref(&self) -> PackageRef {
        PackageRef::new(self.name.clone(), self.description.description())
    }

    /// This id as a range allowing exactly its own version.
    pub fn as_range(&self) -> PackageRange {
        PackageRange::new(
            self.name.clone(),
            self.description.description(),
            VersionConstraint::exact(self.version.clone()),
        )
    }

    /// Whether `other` pins the same package version from the same source,
    /// ignoring lazily-filled detail such as the content hash.
    pub fn same_resolution(&self, other: &PackageId) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.description.description() == other.description.description()
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)?;
        match self.description.kind() {
            SourceKind::Hosted | SourceKind::Root => Ok(()),
            kind => write!(f, " from {kind}"),
        }
    }
}
