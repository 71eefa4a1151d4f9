// src/lockfile/mod.rs

//! The lock file (`keel.lock`).
//!
//! A lock file pins every transitive dependency of a project to a single
//! resolved package id so that later runs reproduce the same tree. The
//! document is YAML: a `packages` map (name to pinned entry) and an `sdks`
//! map (the SDK constraints the pinned set requires).
//!
//! Serialization is deliberately stable: package names are emitted in
//! alphabetical order, the original header comment and newline convention
//! of the file being replaced are preserved, and hosted entries pick up
//! their archive content hash from the system cache.

use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::cache::SystemCache;
use crate::error::{Error, Result};
use crate::package::{PackageId, SourceKind};
use crate::source::SourceRegistry;
use crate::version::{parse_version, VersionConstraint};

/// File name of the lock file.
pub const LOCK_FILE: &str = "keel.lock";

/// Header written when the file being replaced has none of its own.
const DEFAULT_HEADER: &str = "# Generated by keel. Do not edit by hand.";

/// Name of the language SDK, used for the legacy top-level `sdk` key.
pub const DEFAULT_SDK: &str = "keel";

#[derive(Error, Debug)]
pub enum LockFileError {
    #[error("invalid lock file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid lock file at {location}: {message}")]
    Format { location: String, message: String },

    #[error(
        "the lock file pins {package} to content hash {locked}, but the downloaded archive \
         hashes to {cached}; if the package was republished, delete keel.lock and resolve again"
    )]
    HashMismatch {
        package: String,
        locked: String,
        cached: String,
    },
}

impl LockFileError {
    fn format(location: impl fmt::Display, message: impl Into<String>) -> Self {
        LockFileError::Format {
            location: location.to_string(),
            message: message.into(),
        }
    }
}

/// How the root package depends on a locked package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    DirectMain,
    DirectDev,
    DirectOverridden,
    Transitive,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DependencyKind::DirectMain => "direct main",
            DependencyKind::DirectDev => "direct dev",
            DependencyKind::DirectOverridden => "direct overridden",
            DependencyKind::Transitive => "transitive",
        };
        write!(f, "{text}")
    }
}

impl serde::Serialize for DependencyKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl FromStr for DependencyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "direct main" => Ok(DependencyKind::DirectMain),
            "direct dev" => Ok(DependencyKind::DirectDev),
            "direct overridden" => Ok(DependencyKind::DirectOverridden),
            "transitive" => Ok(DependencyKind::Transitive),
            other => Err(format!("unknown dependency kind \"{other}\"")),
        }
    }
}

/// One pinned entry of the lock file.
#[derive(Debug, Clone, PartialEq)]
pub struct LockedPackage {
    pub id: PackageId,
    pub kind: DependencyKind,
}

/// The parsed lock file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LockFile {
    /// Pinned packages by name. Never contains the root package.
    pub packages: BTreeMap<String, LockedPackage>,
    /// SDK constraints: the intersection over all pinned packages.
    pub sdks: BTreeMap<String, VersionConstraint>,
}

impl LockFile {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// The pinned id for `name`, if any.
    pub fn package(&self, name: &str) -> Option<&PackageId> {
        self.packages.get(name).map(|locked| &locked.id)
    }

    /// Parse a lock file document. `dir` anchors relative path descriptions
    /// and is the directory containing the file.
    pub fn parse(text: &str, dir: Option<&Path>, registry: &SourceRegistry) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::empty());
        }
        let doc: Value = serde_yaml::from_str(text).map_err(LockFileError::from)?;
        if doc.is_null() {
            return Ok(Self::empty());
        }
        let root = doc.as_mapping().ok_or_else(|| {
            Error::LockFile(LockFileError::format("<root>", "lock file must be a map"))
        })?;

        let mut lock = Self::empty();

        if let Some(sdks) = root.get("sdks") {
            let map = sdks.as_mapping().ok_or_else(|| {
                Error::LockFile(LockFileError::format("sdks", "must be a map"))
            })?;
            for (key, value) in map {
                let (sdk, constraint) = parse_sdk_entry(key, value)?;
                lock.sdks.insert(sdk, constraint);
            }
        }
        // Legacy single-SDK form.
        if let Some(value) = root.get("sdk") {
            if !lock.sdks.contains_key(DEFAULT_SDK) {
                let (sdk, constraint) =
                    parse_sdk_entry(&Value::String(DEFAULT_SDK.to_string()), value)?;
                lock.sdks.insert(sdk, constraint);
            }
        }

        if let Some(packages) = root.get("packages") {
            let map = packages.as_mapping().ok_or_else(|| {
                Error::LockFile(LockFileError::format("packages", "must be a map"))
            })?;
            for (key, entry) in map {
                let name = key.as_str().ok_or_else(|| {
                    Error::LockFile(LockFileError::format(
                        "packages",
                        "package names must be strings",
                    ))
                })?;
                let locked = parse_package_entry(name, entry, dir, registry)?;
                lock.packages.insert(name.to_string(), locked);
            }
        }

        Ok(lock)
    }

    /// Serialize the lock file.
    ///
    /// When `cache` is given, hosted entries pick up the archive hash the
    /// cache recorded; a hash already pinned here that disagrees with the
    /// cache fails with [`LockFileError::HashMismatch`]. `previous` is the
    /// on-disk text being replaced; its header comment and newline
    /// convention carry over.
    pub fn serialize(
        &self,
        registry: &SourceRegistry,
        cache: Option<&SystemCache>,
        previous: Option<&str>,
    ) -> Result<String> {
        let mut out = String::new();
        for line in header_lines(previous) {
            out.push_str(line);
            out.push('\n');
        }

        out.push_str("packages:");
        if self.packages.is_empty() {
            out.push_str(" {}\n");
        } else {
            out.push('\n');
            // BTreeMap iteration gives the stable alphabetical order.
            for (name, locked) in &self.packages {
                let id = self.entry_with_cache_hash(name, locked, cache)?;
                out.push_str(&format!("  {name}:\n"));
                out.push_str(&format!(
                    "    dependency: {}\n",
                    yaml_quote(&locked.kind.to_string())
                ));
                let description = registry.serialize_lock_description(&id)?;
                out.push_str("    description:");
                render_value(&mut out, &description, 3);
                out.push_str(&format!("    source: {}\n", id.description.kind()));
                out.push_str(&format!(
                    "    version: {}\n",
                    yaml_quote(&id.version.to_string())
                ));
            }
        }

        out.push_str("sdks:");
        if self.sdks.is_empty() {
            out.push_str(" {}\n");
        } else {
            out.push('\n');
            for (sdk, constraint) in &self.sdks {
                out.push_str(&format!(
                    "  {sdk}: {}\n",
                    yaml_quote(&constraint.to_string())
                ));
            }
        }

        if uses_crlf(previous) {
            out = out.replace('\n', "\r\n");
        }
        Ok(out)
    }

    fn entry_with_cache_hash(
        &self,
        name: &str,
        locked: &LockedPackage,
        cache: Option<&SystemCache>,
    ) -> Result<PackageId> {
        let id = &locked.id;
        if id.description.kind() != SourceKind::Hosted {
            return Ok(id.clone());
        }
        let Some(cache) = cache else {
            return Ok(id.clone());
        };
        let Some(cached) = cache.sha256_from_cache(id) else {
            return Ok(id.clone());
        };
        if let Some(locked_hash) = id.description.sha256() {
            if locked_hash != cached {
                return Err(Error::LockFile(LockFileError::HashMismatch {
                    package: name.to_string(),
                    locked: locked_hash.to_string(),
                    cached,
                }));
            }
        }
        Ok(PackageId::new(
            id.name.clone(),
            id.version.clone(),
            id.description.with_sha256(Some(cached)),
        ))
    }

    /// Whether both lock files pin the same package set (ignoring
    /// lazily-filled content hashes). Two such lock files are equivalent
    /// for reuse.
    pub fn same_packages(&self, other: &LockFile) -> bool {
        self.packages.len() == other.packages.len()
            && self.packages.iter().all(|(name, locked)| {
                other
                    .packages
                    .get(name)
                    .map_or(false, |o| o.id.same_resolution(&locked.id))
            })
    }

    /// Differences between this lock file and a newer one.
    pub fn diff(&self, newer: &LockFile) -> LockFileDiff {
        let mut diff = LockFileDiff::default();
        for (name, locked) in &newer.packages {
            match self.packages.get(name) {
                None => diff.added.push(locked.id.clone()),
                Some(old) if !old.id.same_resolution(&locked.id) => {
                    diff.changed.push((old.id.clone(), locked.id.clone()));
                }
                Some(_) => {}
            }
        }
        for (name, locked) in &self.packages {
            if !newer.packages.contains_key(name) {
                diff.removed.push(locked.id.clone());
            }
        }
        diff
    }
}

/// Added/removed/changed pins between two lock files.
#[derive(Debug, Default)]
pub struct LockFileDiff {
    pub added: Vec<PackageId>,
    pub removed: Vec<PackageId>,
    pub changed: Vec<(PackageId, PackageId)>,
}

impl LockFileDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

fn parse_sdk_entry(key: &Value, value: &Value) -> Result<(String, VersionConstraint)> {
    let sdk = key.as_str().ok_or_else(|| {
        Error::LockFile(LockFileError::format("sdks", "SDK names must be strings"))
    })?;
    let text = value.as_str().ok_or_else(|| {
        Error::LockFile(LockFileError::format(
            format!("sdks.{sdk}"),
            "must be a constraint string",
        ))
    })?;
    let constraint = VersionConstraint::parse(text).map_err(|e| {
        Error::LockFile(LockFileError::format(format!("sdks.{sdk}"), e.to_string()))
    })?;
    Ok((sdk.to_string(), constraint))
}

fn parse_package_entry(
    name: &str,
    entry: &Value,
    dir: Option<&Path>,
    registry: &SourceRegistry,
) -> Result<LockedPackage> {
    let location = format!("packages.{name}");
    let map = entry.as_mapping().ok_or_else(|| {
        Error::LockFile(LockFileError::format(&location, "entry must be a map"))
    })?;

    let version_text = map.get("version").and_then(Value::as_str).ok_or_else(|| {
        Error::LockFile(LockFileError::format(&location, "missing \"version\""))
    })?;
    let version = parse_version(version_text).map_err(|e| {
        Error::LockFile(LockFileError::format(
            format!("{location}.version"),
            e.to_string(),
        ))
    })?;

    let source_text = map.get("source").and_then(Value::as_str).ok_or_else(|| {
        Error::LockFile(LockFileError::format(&location, "missing \"source\""))
    })?;
    let kind = match source_text {
        "hosted" => SourceKind::Hosted,
        "git" => SourceKind::Git,
        "path" => SourceKind::Path,
        "sdk" => SourceKind::Sdk,
        other => {
            return Err(Error::LockFile(LockFileError::format(
                format!("{location}.source"),
                format!("unknown source \"{other}\""),
            )))
        }
    };

    let description = map.get("description").ok_or_else(|| {
        Error::LockFile(LockFileError::format(&location, "missing \"description\""))
    })?;
    let id = registry.parse_lock_description(kind, name, &version, description, dir)?;

    let dependency = match map.get("dependency") {
        None => DependencyKind::Transitive,
        Some(value) => {
            let text = value.as_str().ok_or_else(|| {
                Error::LockFile(LockFileError::format(
                    format!("{location}.dependency"),
                    "must be a string",
                ))
            })?;
            text.parse().map_err(|e: String| {
                Error::LockFile(LockFileError::format(format!("{location}.dependency"), e))
            })?
        }
    };

    Ok(LockedPackage {
        id,
        kind: dependency,
    })
}

/// The header comment to write: the previous file's leading comment lines,
/// or the default header.
fn header_lines(previous: Option<&str>) -> Vec<&str> {
    if let Some(previous) = previous {
        let lines: Vec<&str> = previous
            .lines()
            .take_while(|line| line.starts_with('#'))
            .collect();
        if !lines.is_empty() {
            return lines;
        }
    }
    vec![DEFAULT_HEADER]
}

/// Whether the previous on-disk text uses CRLF as its majority line ending.
fn uses_crlf(previous: Option<&str>) -> bool {
    let Some(text) = previous else {
        return false;
    };
    let total = text.matches('\n').count();
    let crlf = text.matches("\r\n").count();
    total > 0 && crlf * 2 > total
}

/// Double-quote a YAML scalar, escaping what needs escaping.
fn yaml_quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Render a description value at the given indent depth (two spaces per
/// level). Scalars render inline after the key; maps render as a block.
fn render_value(out: &mut String, value: &Value, depth: usize) {
    let pad = "  ".repeat(depth);
    match value {
        Value::Mapping(map) => {
            out.push('\n');
            for (key, entry) in map {
                let key = key.as_str().unwrap_or_default();
                match entry {
                    Value::String(s) => {
                        out.push_str(&format!("{pad}{key}: {}\n", yaml_quote(s)));
                    }
                    Value::Bool(b) => out.push_str(&format!("{pad}{key}: {b}\n")),
                    Value::Number(n) => out.push_str(&format!("{pad}{key}: {n}\n")),
                    other => {
                        out.push_str(&format!("{pad}{key}:"));
                        render_value(out, other, depth + 1);
                    }
                }
            }
        }
        Value::String(s) => out.push_str(&format!(" {}\n", yaml_quote(s))),
        Value::Bool(b) => out.push_str(&format!(" {b}\n")),
        Value::Number(n) => out.push_str(&format!(" {n}\n")),
        _ => out.push_str(" null\n"),
    }
}
