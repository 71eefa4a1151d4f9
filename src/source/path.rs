// src/source/path.rs

//! The local-directory source driver.
//!
//! A path dependency points at a directory containing a manifest. There is
//! nothing to download and exactly one version: whatever the manifest in
//! the directory declares.

use serde_yaml::Value;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::package::{Description, PackageId, PackageRef, ResolvedDescription, SourceKind};
use crate::source::Source;
use crate::version::Version;

pub struct PathSource {
    default_hosted_url: String,
}

impl PathSource {
    pub fn new(default_hosted_url: impl Into<String>) -> Self {
        Self {
            default_hosted_url: default_hosted_url.into(),
        }
    }

    fn parts<'a>(&self, description: &'a Description) -> Result<(&'a Path, bool)> {
        match description {
            Description::Path { path, relative } => Ok((path, *relative)),
            other => Err(Error::Internal(format!(
                "path source asked about a {} description",
                other.kind()
            ))),
        }
    }

    fn load_manifest(&self, name: &str, dir: &Path) -> Result<Manifest> {
        if !dir.is_dir() {
            return Err(Error::Data(format!(
                "could not find package {name} at {}",
                dir.display()
            )));
        }
        let manifest = Manifest::load(dir, &self.default_hosted_url)?;
        if manifest.name != name {
            return Err(Error::Data(format!(
                "the manifest at {} names the package \"{}\", not \"{name}\"",
                dir.display(),
                manifest.name
            )));
        }
        Ok(manifest)
    }
}

impl Source for PathSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Path
    }

    fn list_versions(&self, package: &PackageRef) -> Result<Vec<PackageId>> {
        let (path, relative) = self.parts(&package.description)?;
        let manifest = self.load_manifest(&package.name, path)?;
        Ok(vec![PackageId::new(
            package.name.clone(),
            manifest.version_or_zero(),
            ResolvedDescription::Path {
                path: path.to_path_buf(),
                relative,
            },
        )])
    }

    fn describe(&self, id: &PackageId) -> Result<Manifest> {
        match &id.description {
            ResolvedDescription::Path { path, .. } => self.load_manifest(&id.name, path),
            other => Err(Error::Internal(format!(
                "path source asked about a {} id",
                other.kind()
            ))),
        }
    }

    fn download(&self, id: &PackageId) -> Result<PathBuf> {
        match &id.description {
            ResolvedDescription::Path { path, .. } if path.is_dir() => Ok(path.clone()),
            ResolvedDescription::Path { path, .. } => Err(Error::Data(format!(
                "could not find package {} at {}",
                id.name,
                path.display()
            ))),
            other => Err(Error::Internal(format!(
                "path source asked about a {} id",
                other.kind()
            ))),
        }
    }

    fn parse_description(
        &self,
        name: &str,
        version: &Version,
        description: &Value,
        containing_dir: Option<&Path>,
    ) -> Result<PackageId> {
        let map = description.as_mapping().ok_or_else(|| {
            Error::Data(format!("path description for {name} must be a map"))
        })?;
        let text = map.get("path").and_then(Value::as_str).ok_or_else(|| {
            Error::Data(format!("path description for {name} is missing \"path\""))
        })?;
        let relative = map
            .get("relative")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| Path::new(text).is_relative());
        let raw = PathBuf::from(text);
        let path = match (raw.is_relative(), containing_dir) {
            (true, Some(dir)) => dir.join(&raw),
            _ => raw,
        };
        Ok(PackageId::new(
            name,
            version.clone(),
            ResolvedDescription::Path { path, relative },
        ))
    }

    fn serialize_description(&self, id: &PackageId) -> Value {
        let mut map = serde_yaml::Mapping::new();
        if let ResolvedDescription::Path { path, relative } = &id.description {
            map.insert(
                "path".into(),
                Value::String(path.to_string_lossy().into_owned()),
            );
            map.insert("relative".into(), Value::Bool(*relative));
        }
        Value::Mapping(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, name: &str, version: &str) {
        std::fs::write(
            dir.join("keel.yaml"),
            format!("name: {name}\nversion: {version}\n"),
        )
        .unwrap();
    }

    #[test]
    fn test_list_versions_reads_manifest() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "local", "0.3.0");

        let source = PathSource::new("https://packages.test");
        let package = PackageRef::new(
            "local",
            Description::Path {
                path: dir.path().to_path_buf(),
                relative: false,
            },
        );
        let versions = source.list_versions(&package).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, Version::new(0, 3, 0));
    }

    #[test]
    fn test_name_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "other", "0.3.0");

        let source = PathSource::new("https://packages.test");
        let package = PackageRef::new(
            "local",
            Description::Path {
                path: dir.path().to_path_buf(),
                relative: false,
            },
        );
        let err = source.list_versions(&package).unwrap_err();
        assert!(err.to_string().contains("names the package"), "{err}");
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let source = PathSource::new("https://packages.test");
        let package = PackageRef::new(
            "local",
            Description::Path {
                path: PathBuf::from("/nonexistent/nowhere"),
                relative: false,
            },
        );
        assert!(source.list_versions(&package).is_err());
    }

    #[test]
    fn test_parse_description_resolves_relative_paths() {
        let source = PathSource::new("https://packages.test");
        let description: Value = serde_yaml::from_str("path: ../local\nrelative: true").unwrap();
        let id = source
            .parse_description(
                "local",
                &Version::new(0, 1, 0),
                &description,
                Some(Path::new("/work/app")),
            )
            .unwrap();
        assert_eq!(
            id.description,
            ResolvedDescription::Path {
                path: PathBuf::from("/work/app/../local"),
                relative: true,
            }
        );
    }
}
