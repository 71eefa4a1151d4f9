// src/project/mod.rs

//! The entrypoint coordinator.
//!
//! A [`Project`] ties the other components together to answer "bring this
//! directory to a consistent state": load the manifest, decide whether the
//! lock file is still valid, run the solver if not, fetch the selected
//! archives, and persist both the lock file and the generated
//! package-configuration file.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::SystemCache;
use crate::error::{Error, Result};
use crate::lockfile::{LockFile, DEFAULT_SDK, LOCK_FILE};
use crate::manifest::Manifest;
use crate::solver::{resolve_versions, SolveResult, SolveType};
use crate::source::{SdkInstallation, SourceRegistry};

/// Directory holding generated project state, next to the manifest.
pub const STATE_DIR: &str = ".keel";

/// The generated package-configuration file inside [`STATE_DIR`].
pub const PACKAGE_CONFIG_FILE: &str = "package_config.json";

/// Language version assumed when a manifest declares no SDK constraint.
const DEFAULT_LANGUAGE_VERSION: &str = "2.0";

#[derive(Serialize)]
struct PackageConfig {
    #[serde(rename = "configVersion")]
    config_version: u32,
    packages: Vec<PackageConfigEntry>,
    generated: String,
    generator: String,
}

#[derive(Serialize)]
struct PackageConfigEntry {
    name: String,
    #[serde(rename = "rootUri")]
    root_uri: String,
    #[serde(rename = "packageUri")]
    package_uri: String,
    #[serde(rename = "languageVersion")]
    language_version: String,
}

/// A project directory: manifest, lock file, and generated state.
pub struct Project {
    root_dir: PathBuf,
    manifest: Manifest,
    cache: Arc<SystemCache>,
    registry: SourceRegistry,
}

impl Project {
    /// Load the project in `root_dir`.
    pub fn load(
        root_dir: impl Into<PathBuf>,
        cache: Arc<SystemCache>,
        sdks: BTreeMap<String, SdkInstallation>,
    ) -> Result<Self> {
        let root_dir = root_dir.into();
        let manifest = Manifest::load(&root_dir, &cache.fetch().config().hosted_url)?;
        let registry = SourceRegistry::new(Arc::clone(&cache), sdks);
        Ok(Self {
            root_dir,
            manifest,
            cache,
            registry,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root_dir.join(LOCK_FILE)
    }

    pub fn package_config_path(&self) -> PathBuf {
        self.root_dir.join(STATE_DIR).join(PACKAGE_CONFIG_FILE)
    }

    /// The parsed lock file and its raw text, if one exists. A lock file
    /// that fails to parse counts as missing: the caller will resolve from
    /// scratch and overwrite it.
    pub fn read_lock(&self) -> Option<(LockFile, String)> {
        let text = fs::read_to_string(self.lock_path()).ok()?;
        match LockFile::parse(&text, Some(&self.root_dir), &self.registry) {
            Ok(lock) => Some((lock, text)),
            Err(e) => {
                warn!("ignoring unreadable {LOCK_FILE}: {e}");
                None
            }
        }
    }

    /// Run the solver for this project.
    pub fn resolve(
        &self,
        solve_type: SolveType,
        unlock: &[String],
        lock: Option<&LockFile>,
    ) -> Result<SolveResult> {
        resolve_versions(
            solve_type,
            &self.registry,
            &self.manifest,
            lock,
            unlock,
            Vec::new(),
        )
    }

    /// Whether the on-disk state is already consistent with the manifest:
    /// lock file and package config both exist, the manifest has not been
    /// edited since the lock was written, and the lock still satisfies
    /// every direct dependency and SDK constraint.
    pub fn is_up_to_date(&self) -> bool {
        let lock_path = self.lock_path();
        if !lock_path.is_file() || !self.package_config_path().is_file() {
            return false;
        }
        let manifest_mtime = modified(&self.root_dir.join(crate::manifest::MANIFEST_FILE));
        let lock_mtime = modified(&lock_path);
        let manifest_newer = match (manifest_mtime, lock_mtime) {
            (Some(manifest), Some(lock)) => manifest > lock,
            _ => true,
        };
        if manifest_newer {
            return false;
        }
        let Some((lock, _)) = self.read_lock() else {
            return false;
        };
        self.lock_satisfies_manifest(&lock)
    }

    fn lock_satisfies_manifest(&self, lock: &LockFile) -> bool {
        for (name, range) in self.manifest.effective_dependencies(true) {
            match lock.package(&name) {
                Some(id) if range.allows(id) => {}
                _ => {
                    debug!("{LOCK_FILE} no longer satisfies the constraint on {name}");
                    return false;
                }
            }
        }
        let sdk_versions = self.registry.sdk_versions();
        for (sdk, constraint) in &lock.sdks {
            if let Some(installed) = sdk_versions.get(sdk) {
                if !constraint.allows(installed) {
                    debug!("{LOCK_FILE} requires the {sdk} SDK {constraint}");
                    return false;
                }
            }
        }
        true
    }

    /// Bring the project to a consistent state: resolve if the lock file is
    /// missing or stale, download the selected packages, and write the lock
    /// file and package configuration.
    pub fn ensure_up_to_date(&self) -> Result<()> {
        if self.is_up_to_date() {
            debug!("{} is already up to date", self.root_dir.display());
            return Ok(());
        }

        let previous = self.read_lock();
        let result = self.resolve(SolveType::Get, &[], previous.as_ref().map(|(lock, _)| lock))?;
        info!(
            "resolved {} packages for {}",
            result.packages.len(),
            self.manifest.name
        );
        self.write_resolution(&result, previous.as_ref().map(|(_, text)| text.as_str()))
    }

    /// Persist a resolution: fetch every package into the cache, then write
    /// the lock file and the package configuration atomically.
    pub fn write_resolution(&self, result: &SolveResult, previous: Option<&str>) -> Result<()> {
        let mut package_dirs = Vec::with_capacity(result.packages.len());
        for id in &result.packages {
            let dir = self.registry.download(id)?;
            package_dirs.push((id, dir));
        }

        let lock = result.lock_file(&self.manifest);
        let text = lock.serialize(&self.registry, Some(&self.cache), previous)?;
        write_atomic(&self.lock_path(), text.as_bytes())?;

        let config = self.package_config(result, &package_dirs)?;
        let config_path = self.package_config_path();
        fs::create_dir_all(
            config_path
                .parent()
                .expect("package config path always has a parent"),
        )?;
        let json = serde_json::to_string_pretty(&config)
            .map_err(|e| Error::Internal(format!("could not encode package config: {e}")))?;
        write_atomic(&config_path, json.as_bytes())?;
        debug!("wrote {LOCK_FILE} and {PACKAGE_CONFIG_FILE}");
        Ok(())
    }

    fn package_config(
        &self,
        result: &SolveResult,
        package_dirs: &[(&crate::package::PackageId, PathBuf)],
    ) -> Result<PackageConfig> {
        let mut packages = Vec::with_capacity(package_dirs.len() + 1);
        // The root package itself, relative to the state directory.
        packages.push(PackageConfigEntry {
            name: self.manifest.name.clone(),
            root_uri: "../".to_string(),
            package_uri: "lib/".to_string(),
            language_version: language_version_of(&self.manifest),
        });
        for (id, dir) in package_dirs {
            let manifest = result.manifests.get(&id.name);
            packages.push(PackageConfigEntry {
                name: id.name.clone(),
                root_uri: file_uri(dir),
                package_uri: "lib/".to_string(),
                language_version: manifest
                    .map(language_version_of)
                    .unwrap_or_else(|| DEFAULT_LANGUAGE_VERSION.to_string()),
            });
        }
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(PackageConfig {
            config_version: 2,
            packages,
            generated: Utc::now().to_rfc3339(),
            generator: format!("keel {}", env!("CARGO_PKG_VERSION")),
        })
    }
}

/// The language version a manifest opts into: the lower bound of its SDK
/// constraint, as `major.minor`.
fn language_version_of(manifest: &Manifest) -> String {
    manifest
        .environment
        .get(DEFAULT_SDK)
        .and_then(|constraint| constraint.min())
        .map(|(version, _)| format!("{}.{}", version.major, version.minor))
        .unwrap_or_else(|| DEFAULT_LANGUAGE_VERSION.to_string())
}

fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

fn modified(path: &Path) -> Option<std::time::SystemTime> {
    fs::metadata(path).and_then(|metadata| metadata.modified()).ok()
}

/// Write a file atomically: temp in the same directory, then rename.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("{} has no parent", path.display())))?;
    let mut file = tempfile::NamedTempFile::new_in(parent)?;
    file.write_all(contents)?;
    file.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
