// src/source/git.rs

//! The git source driver.
//!
//! A git dependency pins a repository (optionally a subdirectory of it) at a
//! reference. Listing versions resolves the reference to a single commit;
//! the lock file then records that commit so later runs reproduce it
//! exactly. Repositories are mirrored once under `<cache>/git/cache/` and
//! commits are checked out under `<cache>/git/checkouts/`.

use serde_yaml::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::package::{Description, PackageId, PackageRef, ResolvedDescription, SourceKind};
use crate::source::Source;
use crate::version::Version;

pub struct GitSource {
    root: PathBuf,
    default_hosted_url: String,
    /// `(url, reference)` to commit, resolved once per run.
    resolved: Mutex<HashMap<(String, String), String>>,
}

impl GitSource {
    pub fn new(root: impl Into<PathBuf>, default_hosted_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            default_hosted_url: default_hosted_url.into(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    fn mirror_dir(&self, url: &str) -> PathBuf {
        self.root.join("cache").join(sanitize_url(url))
    }

    fn checkout_dir(&self, url: &str, commit: &str) -> PathBuf {
        let short = &commit[..commit.len().min(12)];
        self.root
            .join("checkouts")
            .join(format!("{}-{short}", sanitize_url(url)))
    }

    fn ensure_mirror(&self, url: &str) -> Result<PathBuf> {
        let dir = self.mirror_dir(url);
        if !dir.is_dir() {
            info!("cloning {url}");
            std::fs::create_dir_all(dir.parent().expect("mirror dir has a parent"))?;
            run_git(None, &["clone", "--mirror", url, &dir.to_string_lossy()])?;
        }
        Ok(dir)
    }

    /// Resolve a reference (branch, tag, revision; `None` means HEAD) to a
    /// commit hash, fetching the mirror when the reference is unknown.
    fn resolve_reference(&self, url: &str, reference: Option<&str>) -> Result<String> {
        let reference = reference.unwrap_or("HEAD");
        let key = (url.to_string(), reference.to_string());
        if let Some(commit) = self.resolved.lock().expect("resolved map poisoned").get(&key) {
            return Ok(commit.clone());
        }

        let mirror = self.ensure_mirror(url)?;
        let rev_parse = |dir: &Path| {
            run_git(Some(dir), &["rev-parse", &format!("{reference}^{{commit}}")])
        };
        let commit = match rev_parse(&mirror) {
            Ok(commit) => commit,
            Err(_) => {
                // The mirror may be stale; refresh and retry once.
                debug!("reference {reference} not found in mirror of {url}; fetching");
                run_git(Some(&mirror), &["fetch", "--prune", "origin"])?;
                rev_parse(&mirror)?
            }
        };
        let commit = commit.trim().to_string();

        self.resolved
            .lock()
            .expect("resolved map poisoned")
            .insert(key, commit.clone());
        Ok(commit)
    }

    fn ensure_checkout(&self, url: &str, commit: &str) -> Result<PathBuf> {
        let dir = self.checkout_dir(url, commit);
        if dir.is_dir() {
            return Ok(dir);
        }
        let mirror = self.ensure_mirror(url)?;
        std::fs::create_dir_all(dir.parent().expect("checkout dir has a parent"))?;
        run_git(
            None,
            &[
                "clone",
                "--no-checkout",
                &mirror.to_string_lossy(),
                &dir.to_string_lossy(),
            ],
        )?;
        run_git(Some(&dir), &["checkout", "--detach", commit])?;
        Ok(dir)
    }

    fn git_parts<'a>(
        &self,
        description: &'a Description,
    ) -> Result<(&'a str, &'a str, Option<&'a str>)> {
        match description {
            Description::Git {
                url,
                path,
                reference,
            } => Ok((url, path, reference.as_deref())),
            other => Err(Error::Internal(format!(
                "git source asked about a {} description",
                other.kind()
            ))),
        }
    }

    fn resolved_parts<'a>(
        &self,
        id: &'a PackageId,
    ) -> Result<(&'a str, &'a str, &'a str)> {
        match &id.description {
            ResolvedDescription::Git {
                url, path, commit, ..
            } => Ok((url, path, commit)),
            other => Err(Error::Internal(format!(
                "git source asked about a {} id",
                other.kind()
            ))),
        }
    }

    fn package_root(&self, url: &str, path: &str, commit: &str) -> Result<PathBuf> {
        let checkout = self.ensure_checkout(url, commit)?;
        Ok(if path.is_empty() {
            checkout
        } else {
            checkout.join(path)
        })
    }
}

impl Source for GitSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Git
    }

    fn list_versions(&self, package: &PackageRef) -> Result<Vec<PackageId>> {
        let (url, path, reference) = self.git_parts(&package.description)?;
        let commit = self.resolve_reference(url, reference)?;
        let dir = self.package_root(url, path, &commit)?;
        let manifest = Manifest::load(&dir, &self.default_hosted_url)?;
        if manifest.name != package.name {
            return Err(Error::Data(format!(
                "the manifest at {url} names the package \"{}\", not \"{}\"",
                manifest.name, package.name
            )));
        }
        Ok(vec![PackageId::new(
            package.name.clone(),
            manifest.version_or_zero(),
            ResolvedDescription::Git {
                url: url.to_string(),
                path: path.to_string(),
                reference: reference.map(str::to_string),
                commit,
            },
        )])
    }

    fn describe(&self, id: &PackageId) -> Result<Manifest> {
        let (url, path, commit) = self.resolved_parts(id)?;
        let dir = self.package_root(url, path, commit)?;
        Ok(Manifest::load(&dir, &self.default_hosted_url)?)
    }

    fn download(&self, id: &PackageId) -> Result<PathBuf> {
        let (url, path, commit) = self.resolved_parts(id)?;
        self.package_root(url, path, commit)
    }

    fn parse_description(
        &self,
        name: &str,
        version: &Version,
        description: &Value,
        _containing_dir: Option<&Path>,
    ) -> Result<PackageId> {
        let map = description.as_mapping().ok_or_else(|| {
            Error::Data(format!("git description for {name} must be a map"))
        })?;
        let url = map
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Data(format!("git description for {name} is missing \"url\"")))?
            .to_string();
        let commit = map
            .get("resolved-ref")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Data(format!(
                    "git description for {name} is missing \"resolved-ref\""
                ))
            })?
            .to_string();
        let path = map
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let reference = map.get("ref").and_then(Value::as_str).map(str::to_string);
        Ok(PackageId::new(
            name,
            version.clone(),
            ResolvedDescription::Git {
                url,
                path,
                reference,
                commit,
            },
        ))
    }

    fn serialize_description(&self, id: &PackageId) -> Value {
        let mut map = serde_yaml::Mapping::new();
        if let ResolvedDescription::Git {
            url,
            path,
            reference,
            commit,
        } = &id.description
        {
            if !path.is_empty() {
                map.insert("path".into(), Value::String(path.clone()));
            }
            if let Some(reference) = reference {
                map.insert("ref".into(), Value::String(reference.clone()));
            }
            map.insert("resolved-ref".into(), Value::String(commit.clone()));
            map.insert("url".into(), Value::String(url.clone()));
        }
        Value::Mapping(map)
    }
}

/// Run a git command, returning stdout on success.
fn run_git(cwd: Option<&Path>, args: &[&str]) -> Result<String> {
    let mut command = Command::new("git");
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    let output = command
        .args(args)
        .output()
        .map_err(|e| Error::Data(format!("could not run git: {e}")))?;
    if !output.status.success() {
        return Err(Error::Data(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// A directory name for a repository URL.
fn sanitize_url(url: &str) -> String {
    url.trim_end_matches(".git")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
