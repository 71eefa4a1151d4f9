// src/manifest/mod.rs

//! The package manifest (`keel.yaml`).
//!
//! A manifest declares a package's name, optional version, its dependency
//! maps (regular, dev, and overrides), and the SDK constraints under
//! `environment`. Manifests are loaded once per directory and never mutated;
//! resolution works on copies.

use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::package::{Description, PackageRange};
use crate::version::{parse_version, Version, VersionConstraint};

/// File name of the package manifest.
pub const MANIFEST_FILE: &str = "keel.yaml";

/// Error produced when a manifest cannot be read or is malformed.
///
/// Format errors carry the dotted location of the offending field so the
/// message points at the exact entry (`dependencies.foo.version`).
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("could not read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid manifest at {location}: {message}")]
    Format { location: String, message: String },
}

impl ManifestError {
    fn format(location: impl fmt::Display, message: impl Into<String>) -> Self {
        ManifestError::Format {
            location: location.to_string(),
            message: message.into(),
        }
    }
}

/// A parsed package manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub name: String,
    pub version: Option<Version>,
    pub dependencies: BTreeMap<String, PackageRange>,
    pub dev_dependencies: BTreeMap<String, PackageRange>,
    /// Overrides shadow entries of both dependency maps.
    pub dependency_overrides: BTreeMap<String, PackageRange>,
    /// SDK name to required constraint.
    pub environment: BTreeMap<String, VersionConstraint>,
}

impl Manifest {
    /// A manifest with a name and nothing else. Used for packages whose
    /// source has no manifest of its own (SDK-bundled packages) and in
    /// tests.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            dependencies: BTreeMap::new(),
            dev_dependencies: BTreeMap::new(),
            dependency_overrides: BTreeMap::new(),
            environment: BTreeMap::new(),
        }
    }

    /// Load `keel.yaml` from `dir`.
    pub fn load(dir: &Path, default_hosted_url: &str) -> Result<Self, ManifestError> {
        let path = dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&path).map_err(|source| ManifestError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(&text, Some(dir), default_hosted_url)
    }

    /// Parse a manifest document. `dir`, when given, anchors relative path
    /// dependencies.
    pub fn parse(
        text: &str,
        dir: Option<&Path>,
        default_hosted_url: &str,
    ) -> Result<Self, ManifestError> {
        let doc: Value = serde_yaml::from_str(text)?;
        let root = doc
            .as_mapping()
            .ok_or_else(|| ManifestError::format("<root>", "manifest must be a map"))?;

        let name = match root.get("name").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(ManifestError::format("name", "missing package name")),
        };

        let version = match root.get("version") {
            None => None,
            Some(Value::String(s)) => Some(
                parse_version(s)
                    .map_err(|e| ManifestError::format("version", e.to_string()))?,
            ),
            Some(_) => return Err(ManifestError::format("version", "must be a string")),
        };

        let mut manifest = Manifest::empty(&name);
        manifest.version = version;
        manifest.dependencies =
            parse_dependency_map(root.get("dependencies"), "dependencies", dir, default_hosted_url)?;
        manifest.dev_dependencies = parse_dependency_map(
            root.get("dev_dependencies"),
            "dev_dependencies",
            dir,
            default_hosted_url,
        )?;
        manifest.dependency_overrides = parse_dependency_map(
            root.get("dependency_overrides"),
            "dependency_overrides",
            dir,
            default_hosted_url,
        )?;

        if let Some(env) = root.get("environment") {
            let map = env.as_mapping().ok_or_else(|| {
                ManifestError::format("environment", "must be a map of SDK constraints")
            })?;
            for (key, value) in map {
                let sdk = key
                    .as_str()
                    .ok_or_else(|| ManifestError::format("environment", "SDK names must be strings"))?;
                let text = value.as_str().ok_or_else(|| {
                    ManifestError::format(format!("environment.{sdk}"), "must be a string")
                })?;
                let constraint = VersionConstraint::parse(text).map_err(|e| {
                    ManifestError::format(format!("environment.{sdk}"), e.to_string())
                })?;
                manifest.environment.insert(sdk.to_string(), constraint);
            }
        }

        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        for name in self.dependencies.keys() {
            if *name == self.name {
                return Err(ManifestError::format(
                    format!("dependencies.{name}"),
                    "a package cannot depend on itself",
                ));
            }
            if self.dev_dependencies.contains_key(name) {
                return Err(ManifestError::format(
                    format!("dev_dependencies.{name}"),
                    "already listed under dependencies",
                ));
            }
        }
        if self.dev_dependencies.contains_key(&self.name) {
            return Err(ManifestError::format(
                format!("dev_dependencies.{}", self.name),
                "a package cannot depend on itself",
            ));
        }
        Ok(())
    }

    /// The declared version, or `0.0.0` for versionless root manifests.
    pub fn version_or_zero(&self) -> Version {
        self.version.clone().unwrap_or_else(|| Version::new(0, 0, 0))
    }

    /// The dependencies the solver sees for the root package: regular plus
    /// (optionally) dev dependencies, with overrides shadowing both.
    pub fn effective_dependencies(&self, include_dev: bool) -> BTreeMap<String, PackageRange> {
        let mut deps = self.dependencies.clone();
        if include_dev {
            deps.extend(
                self.dev_dependencies
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        for (name, range) in &self.dependency_overrides {
            deps.insert(name.clone(), range.clone());
        }
        deps
    }
}

/// Parse one dependency map (`dependencies`, `dev_dependencies`, or
/// `dependency_overrides`).
fn parse_dependency_map(
    value: Option<&Value>,
    location: &str,
    dir: Option<&Path>,
    default_hosted_url: &str,
) -> Result<BTreeMap<String, PackageRange>, ManifestError> {
    let mut out = BTreeMap::new();
    let Some(value) = value else {
        return Ok(out);
    };
    if value.is_null() {
        return Ok(out);
    }
    let map = value
        .as_mapping()
        .ok_or_else(|| ManifestError::format(location, "must be a map of dependencies"))?;

    for (key, spec) in map {
        let name = key
            .as_str()
            .ok_or_else(|| ManifestError::format(location, "dependency names must be strings"))?;
        let range = parse_dependency(
            name,
            spec,
            &format!("{location}.{name}"),
            dir,
            default_hosted_url,
        )?;
        out.insert(name.to_string(), range);
    }
    Ok(out)
}

/// Parse a single dependency entry.
///
/// Short form is a bare constraint string for a default-registry hosted
/// package. Long form is a map with an optional `version` and at most one
/// source key (`hosted`, `git`, `path`, `sdk`).
fn parse_dependency(
    name: &str,
    spec: &Value,
    location: &str,
    dir: Option<&Path>,
    default_hosted_url: &str,
) -> Result<PackageRange, ManifestError> {
    let default_hosted = || Description::Hosted {
        name: name.to_string(),
        url: default_hosted_url.to_string(),
    };

    match spec {
        // `foo: ^1.2.0` and `foo:` (any version, default registry).
        Value::Null => Ok(PackageRange::new(
            name,
            default_hosted(),
            VersionConstraint::any(),
        )),
        Value::String(constraint) => {
            let constraint = VersionConstraint::parse(constraint)
                .map_err(|e| ManifestError::format(location, e.to_string()))?;
            Ok(PackageRange::new(name, default_hosted(), constraint))
        }
        Value::Mapping(map) => {
            let constraint = match map.get("version") {
                None => VersionConstraint::any(),
                Some(Value::String(s)) => VersionConstraint::parse(s)
                    .map_err(|e| ManifestError::format(format!("{location}.version"), e.to_string()))?,
                Some(_) => {
                    return Err(ManifestError::format(
                        format!("{location}.version"),
                        "must be a string",
                    ))
                }
            };

            let mut sources = Vec::new();
            if let Some(hosted) = map.get("hosted") {
                sources.push(parse_hosted(name, hosted, location, default_hosted_url)?);
            }
            if let Some(git) = map.get("git") {
                sources.push(parse_git(git, location)?);
            }
            if let Some(path) = map.get("path") {
                sources.push(parse_path(path, location, dir)?);
            }
            if let Some(sdk) = map.get("sdk") {
                let sdk = sdk.as_str().ok_or_else(|| {
                    ManifestError::format(format!("{location}.sdk"), "must be a string")
                })?;
                sources.push(Description::Sdk {
                    sdk: sdk.to_string(),
                });
            }

            let description = match sources.len() {
                0 => default_hosted(),
                1 => sources.pop().expect("checked length"),
                _ => {
                    return Err(ManifestError::format(
                        location,
                        "a dependency may only have one source",
                    ))
                }
            };
            Ok(PackageRange::new(name, description, constraint))
        }
        _ => Err(ManifestError::format(
            location,
            "must be a version constraint or a map",
        )),
    }
}

fn parse_hosted(
    name: &str,
    value: &Value,
    location: &str,
    default_hosted_url: &str,
) -> Result<Description, ManifestError> {
    match value {
        // `hosted: https://private.example.org`
        Value::String(url) => Ok(Description::Hosted {
            name: name.to_string(),
            url: url.trim_end_matches('/').to_string(),
        }),
        // `hosted: {name: upstream-name, url: ...}`
        Value::Mapping(map) => {
            let hosted_name = match map.get("name") {
                None => name.to_string(),
                Some(Value::String(s)) => s.clone(),
                Some(_) => {
                    return Err(ManifestError::format(
                        format!("{location}.hosted.name"),
                        "must be a string",
                    ))
                }
            };
            let url = match map.get("url") {
                None => default_hosted_url.to_string(),
                Some(Value::String(s)) => s.trim_end_matches('/').to_string(),
                Some(_) => {
                    return Err(ManifestError::format(
                        format!("{location}.hosted.url"),
                        "must be a string",
                    ))
                }
            };
            Ok(Description::Hosted {
                name: hosted_name,
                url,
            })
        }
        _ => Err(ManifestError::format(
            format!("{location}.hosted"),
            "must be a url or a map",
        )),
    }
}

fn parse_git(value: &Value, location: &str) -> Result<Description, ManifestError> {
    match value {
        Value::String(url) => Ok(Description::Git {
            url: url.clone(),
            path: String::new(),
            reference: None,
        }),
        Value::Mapping(map) => {
            let url = map
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ManifestError::format(format!("{location}.git.url"), "missing repository url")
                })?
                .to_string();
            let path = map
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let reference = map
                .get("ref")
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok(Description::Git {
                url,
                path,
                reference,
            })
        }
        _ => Err(ManifestError::format(
            format!("{location}.git"),
            "must be a url or a map",
        )),
    }
}

fn parse_path(
    value: &Value,
    location: &str,
    dir: Option<&Path>,
) -> Result<Description, ManifestError> {
    let text = value.as_str().ok_or_else(|| {
        ManifestError::format(format!("{location}.path"), "must be a string")
    })?;
    let raw = PathBuf::from(text);
    let relative = raw.is_relative();
    let path = match (relative, dir) {
        (true, Some(dir)) => dir.join(&raw),
        _ => raw,
    };
    Ok(Description::Path { path, relative })
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = "https://packages.example.org";

    fn parse(text: &str) -> Manifest {
        Manifest::parse(text, None, REGISTRY).unwrap()
    }

    #[test]
    fn test_parse_minimal() {
        let manifest = parse("name: app\n");
        assert_eq!(manifest.name, "app");
        assert!(manifest.version.is_none());
        assert!(manifest.dependencies.is_empty());
        assert_eq!(manifest.version_or_zero(), Version::new(0, 0, 0));
    }

    #[test]
    fn test_parse_short_form_dependency() {
        let manifest = parse("name: app\ndependencies:\n  foo: ^1.2.0\n");
        let foo = &manifest.dependencies["foo"];
        assert_eq!(
            foo.constraint,
            VersionConstraint::parse("^1.2.0").unwrap()
        );
        assert_eq!(
            foo.description,
            Description::Hosted {
                name: "foo".to_string(),
                url: REGISTRY.to_string(),
            }
        );
    }

    #[test]
    fn test_parse_hosted_long_form() {
        let manifest = parse(
            "name: app\ndependencies:\n  foo:\n    hosted:\n      name: upstream\n      url: https://other.example.org\n    version: \">=2.0.0 <3.0.0\"\n",
        );
        let foo = &manifest.dependencies["foo"];
        assert_eq!(
            foo.description,
            Description::Hosted {
                name: "upstream".to_string(),
                url: "https://other.example.org".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_git_dependency() {
        let manifest = parse(
            "name: app\ndependencies:\n  bar:\n    git:\n      url: https://git.example.org/bar\n      ref: main\n      path: packages/bar\n",
        );
        assert_eq!(
            manifest.dependencies["bar"].description,
            Description::Git {
                url: "https://git.example.org/bar".to_string(),
                path: "packages/bar".to_string(),
                reference: Some("main".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_path_dependency_resolves_against_dir() {
        let manifest = Manifest::parse(
            "name: app\ndependencies:\n  local:\n    path: ../local\n",
            Some(Path::new("/work/app")),
            REGISTRY,
        )
        .unwrap();
        assert_eq!(
            manifest.dependencies["local"].description,
            Description::Path {
                path: PathBuf::from("/work/app/../local"),
                relative: true,
            }
        );
    }

    #[test]
    fn test_environment_constraints() {
        let manifest = parse("name: app\nenvironment:\n  keel: \">=2.0.0 <3.0.0\"\n");
        assert!(manifest.environment["keel"].allows(&Version::new(2, 5, 0)));
        assert!(!manifest.environment["keel"].allows(&Version::new(3, 0, 0)));
    }

    #[test]
    fn test_overrides_shadow_both_maps() {
        let manifest = parse(
            "name: app\ndependencies:\n  foo: ^1.0.0\ndev_dependencies:\n  bar: ^1.0.0\ndependency_overrides:\n  foo: 2.0.0\n  bar: 2.0.0\n",
        );
        let deps = manifest.effective_dependencies(true);
        assert_eq!(
            deps["foo"].constraint,
            VersionConstraint::exact(Version::new(2, 0, 0))
        );
        assert_eq!(
            deps["bar"].constraint,
            VersionConstraint::exact(Version::new(2, 0, 0))
        );
    }

    #[test]
    fn test_rejects_self_dependency() {
        let err = Manifest::parse("name: app\ndependencies:\n  app: ^1.0.0\n", None, REGISTRY)
            .unwrap_err();
        assert!(err.to_string().contains("depend on itself"), "{err}");
    }

    #[test]
    fn test_rejects_duplicate_across_dep_maps() {
        let err = Manifest::parse(
            "name: app\ndependencies:\n  foo: ^1.0.0\ndev_dependencies:\n  foo: ^1.0.0\n",
            None,
            REGISTRY,
        )
        .unwrap_err();
        assert!(err.to_string().contains("already listed"), "{err}");
    }

    #[test]
    fn test_missing_name_is_positional_error() {
        let err = Manifest::parse("dependencies:\n  foo: ^1.0.0\n", None, REGISTRY).unwrap_err();
        assert!(err.to_string().contains("name"), "{err}");
    }
}
