// src/source/sdk.rs

//! The SDK source driver.
//!
//! Some packages ship inside an installed SDK rather than on a registry.
//! The driver is configured with the installed SDKs (version plus the
//! directories of the packages they bundle) and answers from that table;
//! nothing is ever downloaded.

use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::package::{Description, PackageId, PackageRef, ResolvedDescription, SourceKind};
use crate::source::Source;
use crate::version::Version;

/// An installed SDK: its version and the packages bundled with it.
#[derive(Debug, Clone)]
pub struct SdkInstallation {
    pub version: Version,
    /// Bundled package name to its directory.
    pub packages: BTreeMap<String, PathBuf>,
}

impl SdkInstallation {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            packages: BTreeMap::new(),
        }
    }
}

pub struct SdkSource {
    sdks: BTreeMap<String, SdkInstallation>,
    default_hosted_url: String,
}

impl SdkSource {
    pub fn new(
        sdks: BTreeMap<String, SdkInstallation>,
        default_hosted_url: impl Into<String>,
    ) -> Self {
        Self {
            sdks,
            default_hosted_url: default_hosted_url.into(),
        }
    }

    /// Installed SDK versions, for environment-constraint checks.
    pub fn versions(&self) -> BTreeMap<String, Version> {
        self.sdks
            .iter()
            .map(|(name, sdk)| (name.clone(), sdk.version.clone()))
            .collect()
    }

    fn sdk_name<'a>(&self, description: &'a Description) -> Result<&'a str> {
        match description {
            Description::Sdk { sdk } => Ok(sdk),
            other => Err(Error::Internal(format!(
                "sdk source asked about a {} description",
                other.kind()
            ))),
        }
    }

    fn package_dir(&self, sdk: &str, package: &str) -> Result<&Path> {
        let installation = self.sdks.get(sdk).ok_or_else(|| {
            Error::Data(format!(
                "package {package} requires the {sdk} SDK, which is not installed"
            ))
        })?;
        installation
            .packages
            .get(package)
            .map(PathBuf::as_path)
            .ok_or_else(|| {
                Error::Data(format!(
                    "the {sdk} SDK does not bundle a package named {package}"
                ))
            })
    }

    fn manifest_for(&self, sdk: &str, package: &str) -> Result<Manifest> {
        let dir = self.package_dir(sdk, package)?;
        Ok(Manifest::load(dir, &self.default_hosted_url)?)
    }
}

impl Source for SdkSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Sdk
    }

    fn list_versions(&self, package: &PackageRef) -> Result<Vec<PackageId>> {
        let sdk = self.sdk_name(&package.description)?;
        let manifest = self.manifest_for(sdk, &package.name)?;
        Ok(vec![PackageId::new(
            package.name.clone(),
            manifest.version_or_zero(),
            ResolvedDescription::Sdk {
                sdk: sdk.to_string(),
            },
        )])
    }

    fn describe(&self, id: &PackageId) -> Result<Manifest> {
        match &id.description {
            ResolvedDescription::Sdk { sdk } => self.manifest_for(sdk, &id.name),
            other => Err(Error::Internal(format!(
                "sdk source asked about a {} id",
                other.kind()
            ))),
        }
    }

    fn download(&self, id: &PackageId) -> Result<PathBuf> {
        match &id.description {
            ResolvedDescription::Sdk { sdk } => {
                Ok(self.package_dir(sdk, &id.name)?.to_path_buf())
            }
            other => Err(Error::Internal(format!(
                "sdk source asked about a {} id",
                other.kind()
            ))),
        }
    }

    fn parse_description(
        &self,
        name: &str,
        version: &Version,
        description: &Value,
        _containing_dir: Option<&Path>,
    ) -> Result<PackageId> {
        let sdk = match description {
            Value::String(sdk) => sdk.clone(),
            Value::Mapping(map) => map
                .get("sdk")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    Error::Data(format!("sdk description for {name} is missing \"sdk\""))
                })?
                .to_string(),
            _ => {
                return Err(Error::Data(format!(
                    "sdk description for {name} must be a string or a map"
                )))
            }
        };
        Ok(PackageId::new(
            name,
            version.clone(),
            ResolvedDescription::Sdk { sdk },
        ))
    }

    fn serialize_description(&self, id: &PackageId) -> Value {
        match &id.description {
            ResolvedDescription::Sdk { sdk } => Value::String(sdk.clone()),
            _ => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_with_bundled_package() -> (SdkSource, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("keel.yaml"),
            "name: platform_ui\nversion: 0.9.0\n",
        )
        .unwrap();
        let mut sdk = SdkInstallation::new(Version::new(2, 4, 0));
        sdk.packages
            .insert("platform_ui".to_string(), dir.path().to_path_buf());
        let mut sdks = BTreeMap::new();
        sdks.insert("keel".to_string(), sdk);
        (SdkSource::new(sdks, "https://packages.test"), dir)
    }

    #[test]
    fn test_lists_bundled_package_version() {
        let (source, _dir) = source_with_bundled_package();
        let package = PackageRef::new(
            "platform_ui",
            Description::Sdk {
                sdk: "keel".to_string(),
            },
        );
        let versions = source.list_versions(&package).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, Version::new(0, 9, 0));
    }

    #[test]
    fn test_unknown_sdk_is_actionable() {
        let (source, _dir) = source_with_bundled_package();
        let package = PackageRef::new(
            "widgets",
            Description::Sdk {
                sdk: "flutter".to_string(),
            },
        );
        let err = source.list_versions(&package).unwrap_err();
        assert!(err.to_string().contains("not installed"), "{err}");
    }

    #[test]
    fn test_description_round_trip() {
        let (source, _dir) = source_with_bundled_package();
        let id = PackageId::new(
            "platform_ui",
            Version::new(0, 9, 0),
            ResolvedDescription::Sdk {
                sdk: "keel".to_string(),
            },
        );
        let serialized = source.serialize_description(&id);
        let parsed = source
            .parse_description("platform_ui", &id.version, &serialized, None)
            .unwrap();
        assert_eq!(parsed, id);
    }
}
