// src/source/mod.rs

//! Package sources.
//!
//! A [`Source`] knows how to enumerate versions of a package, produce the
//! manifest for a concrete version, materialize a version on disk, and
//! convert lock-file descriptions to and from resolved package ids. The
//! [`SourceRegistry`] owns one driver per source family and dispatches on a
//! description's [`SourceKind`].

mod git;
mod hosted;
mod path;
mod sdk;

pub use git::GitSource;
pub use hosted::HostedSource;
pub use path::PathSource;
pub use sdk::{SdkInstallation, SdkSource};

use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::SystemCache;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::package::{PackageId, PackageRef, SourceKind};
use crate::version::Version;

/// Capability set shared by all source drivers.
pub trait Source {
    fn kind(&self) -> SourceKind;

    /// All selectable versions of the referenced package, oldest first.
    /// Retracted versions are not listed.
    fn list_versions(&self, package: &PackageRef) -> Result<Vec<PackageId>>;

    /// The manifest of a concrete version. Idempotent and cacheable.
    fn describe(&self, id: &PackageId) -> Result<Manifest>;

    /// Make the package's content available on disk and return its
    /// directory.
    fn download(&self, id: &PackageId) -> Result<PathBuf>;

    /// Parse a lock-file `description` block into a resolved id. The inverse
    /// of [`Source::serialize_description`]. `containing_dir` anchors
    /// relative paths and is the directory of the file being parsed.
    fn parse_description(
        &self,
        name: &str,
        version: &Version,
        description: &Value,
        containing_dir: Option<&Path>,
    ) -> Result<PackageId>;

    /// Serialize the resolved description of `id` for the lock file.
    fn serialize_description(&self, id: &PackageId) -> Value;
}

/// The table of source drivers.
pub struct SourceRegistry {
    hosted: HostedSource,
    git: GitSource,
    path: PathSource,
    sdk: SdkSource,
}

impl SourceRegistry {
    pub fn new(cache: Arc<SystemCache>, sdks: BTreeMap<String, sdk::SdkInstallation>) -> Self {
        // Bare hosted dependencies in any manifest resolve against the
        // configured default registry.
        let default_url = cache.fetch().config().hosted_url.clone();
        Self {
            hosted: HostedSource::new(Arc::clone(&cache)),
            git: GitSource::new(cache.root().join("git"), default_url.clone()),
            path: PathSource::new(default_url.clone()),
            sdk: SdkSource::new(sdks, default_url),
        }
    }

    /// A registry with no network access. Description parsing and the local
    /// sources still work; anything that would hit the network fails
    /// immediately. Used to inspect lock files without a configured cache.
    pub fn offline(cache_root: impl Into<PathBuf>) -> Self {
        struct OfflineTransport;
        impl crate::fetch::HttpTransport for OfflineTransport {
            fn execute(
                &self,
                request: crate::fetch::TransportRequest,
            ) -> std::result::Result<crate::fetch::TransportResponse, crate::fetch::TransportError>
            {
                Err(crate::fetch::TransportError(format!(
                    "network access is disabled (requested {})",
                    request.url
                )))
            }
        }

        let mut config = crate::fetch::HttpConfig::from_env();
        config.max_retries = 0;
        let fetch = crate::fetch::Fetch::new(
            config,
            Arc::new(OfflineTransport),
            crate::fetch::TokenStore::empty(),
        );
        let cache = Arc::new(SystemCache::new(cache_root, Arc::new(fetch)));
        Self::new(cache, BTreeMap::new())
    }

    /// The configured SDK versions, for environment-constraint checks.
    pub fn sdk_versions(&self) -> BTreeMap<String, Version> {
        self.sdk.versions()
    }

    fn source(&self, kind: SourceKind) -> Result<&dyn Source> {
        match kind {
            SourceKind::Hosted => Ok(&self.hosted),
            SourceKind::Git => Ok(&self.git),
            SourceKind::Path => Ok(&self.path),
            SourceKind::Sdk => Ok(&self.sdk),
            SourceKind::Root => Err(Error::Internal(
                "the root package has no source driver".to_string(),
            )),
        }
    }

    pub fn list_versions(&self, package: &PackageRef) -> Result<Vec<PackageId>> {
        self.source(package.description.kind())?
            .list_versions(package)
    }

    pub fn describe(&self, id: &PackageId) -> Result<Manifest> {
        self.source(id.description.kind())?.describe(id)
    }

    pub fn download(&self, id: &PackageId) -> Result<PathBuf> {
        self.source(id.description.kind())?.download(id)
    }

    pub fn parse_lock_description(
        &self,
        kind: SourceKind,
        name: &str,
        version: &Version,
        description: &Value,
        containing_dir: Option<&Path>,
    ) -> Result<PackageId> {
        self.source(kind)?
            .parse_description(name, version, description, containing_dir)
    }

    pub fn serialize_lock_description(&self, id: &PackageId) -> Result<Value> {
        Ok(self
            .source(id.description.kind())?
            .serialize_description(id))
    }
}
