// src/source/hosted.rs

//! The hosted-registry source driver.
//!
//! Speaks the registry JSON protocol: `GET <url>/api/packages/<name>`
//! returns the version listing (with per-version archive URLs, optional
//! archive hashes, and manifests). Listings are fetched once per package
//! per run; archives are materialized through the system cache.

use serde::Deserialize;
use serde_yaml::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::cache::SystemCache;
use crate::error::{Error, Result};
use crate::manifest::{Manifest, ManifestError};
use crate::package::{Description, PackageId, PackageRef, ResolvedDescription, SourceKind};
use crate::source::Source;
use crate::version::{parse_version, Version};

/// One entry of a registry version listing, as served by the API.
#[derive(Deserialize)]
struct ListedVersion {
    version: String,
    archive_url: String,
    #[serde(default)]
    archive_sha256: Option<String>,
    #[serde(default)]
    retracted: bool,
    /// The package manifest for this version. Older registries omit it, in
    /// which case describing a version falls back to downloading it.
    #[serde(default)]
    manifest: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct VersionListing {
    versions: Vec<ListedVersion>,
}

/// A listing entry after validation.
struct KnownVersion {
    id: PackageId,
    archive_url: String,
    manifest: Option<Manifest>,
}

pub struct HostedSource {
    cache: Arc<SystemCache>,
    /// Version listings fetched this run, keyed by `(url, name)`.
    listings: Mutex<HashMap<(String, String), Arc<Vec<KnownVersion>>>>,
}

impl HostedSource {
    pub fn new(cache: Arc<SystemCache>) -> Self {
        Self {
            cache,
            listings: Mutex::new(HashMap::new()),
        }
    }

    fn listing(&self, name: &str, url: &str) -> Result<Arc<Vec<KnownVersion>>> {
        let key = (url.to_string(), name.to_string());
        if let Some(listing) = self.listings.lock().expect("listing map poisoned").get(&key) {
            return Ok(Arc::clone(listing));
        }

        let listing_url = format!("{url}/api/packages/{name}");
        debug!("fetching version listing for {name} from {url}");
        let listing: VersionListing = self
            .cache
            .fetch()
            .get(&listing_url)
            .api()
            .run_json()?;

        // Bare dependencies inside fetched manifests resolve against the
        // configured default registry, same as in the root manifest.
        let default_url = self.cache.fetch().config().hosted_url.clone();
        let mut known = Vec::with_capacity(listing.versions.len());
        for entry in listing.versions {
            if entry.retracted {
                continue;
            }
            let version = parse_version(&entry.version).map_err(|e| {
                Error::Data(format!("registry listed a bad version for {name}: {e}"))
            })?;
            let sha256 = match entry.archive_sha256 {
                Some(hash) => Some(validate_sha256(name, hash)?),
                None => None,
            };
            let manifest = entry
                .manifest
                .map(|raw| manifest_from_listing(name, &raw, &default_url))
                .transpose()?;
            known.push(KnownVersion {
                id: PackageId::new(
                    name,
                    version,
                    ResolvedDescription::Hosted {
                        name: name.to_string(),
                        url: url.to_string(),
                        sha256,
                    },
                ),
                archive_url: entry.archive_url,
                manifest,
            });
        }
        known.sort_by(|a, b| a.id.version.cmp(&b.id.version));

        let known = Arc::new(known);
        self.listings
            .lock()
            .expect("listing map poisoned")
            .insert(key, Arc::clone(&known));
        Ok(known)
    }

    fn hosted_parts<'a>(&self, description: &'a Description) -> Result<(&'a str, &'a str)> {
        match description {
            Description::Hosted { name, url } => Ok((name, url)),
            other => Err(Error::Internal(format!(
                "hosted source asked about a {} description",
                other.kind()
            ))),
        }
    }

    fn entry_for(&self, id: &PackageId) -> Result<(String, Option<Manifest>)> {
        let (name, url) = match &id.description {
            ResolvedDescription::Hosted { name, url, .. } => (name.clone(), url.clone()),
            other => {
                return Err(Error::Internal(format!(
                    "hosted source asked about a {} id",
                    other.kind()
                )))
            }
        };
        let listing = self.listing(&name, &url)?;
        let entry = listing
            .iter()
            .find(|known| known.id.version == id.version)
            .ok_or_else(|| {
                Error::Data(format!(
                    "the registry at {url} does not list version {} of {name}",
                    id.version
                ))
            })?;
        Ok((entry.archive_url.clone(), entry.manifest.clone()))
    }
}

impl Source for HostedSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Hosted
    }

    fn list_versions(&self, package: &PackageRef) -> Result<Vec<PackageId>> {
        let (name, url) = self.hosted_parts(&package.description)?;
        let listing = self.listing(name, url)?;
        Ok(listing.iter().map(|known| known.id.clone()).collect())
    }

    fn describe(&self, id: &PackageId) -> Result<Manifest> {
        let (_, manifest) = self.entry_for(id)?;
        if let Some(manifest) = manifest {
            return Ok(manifest);
        }
        // Legacy registries serve no manifests in listings; the archive is
        // the only place to learn the dependencies.
        let dir = self.download(id)?;
        Ok(Manifest::load(
            &dir,
            &self.cache.fetch().config().hosted_url,
        )?)
    }

    fn download(&self, id: &PackageId) -> Result<PathBuf> {
        let (archive_url, _) = self.entry_for(id)?;
        let downloaded = self.cache.download_package(id, &archive_url)?;
        Ok(self
            .cache
            .package_dir(&downloaded)
            .expect("hosted ids always map to a cache directory"))
    }

    fn parse_description(
        &self,
        name: &str,
        version: &Version,
        description: &Value,
        _containing_dir: Option<&Path>,
    ) -> Result<PackageId> {
        let map = description.as_mapping().ok_or_else(|| {
            bad_description(name, "hosted description must be a map")
        })?;
        let hosted_name = map
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| bad_description(name, "hosted description is missing \"name\""))?;
        let url = map
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| bad_description(name, "hosted description is missing \"url\""))?;
        let sha256 = match map.get("sha256") {
            None => None,
            Some(value) => {
                let text = value.as_str().ok_or_else(|| {
                    bad_description(name, "\"sha256\" must be a string")
                })?;
                Some(validate_sha256(name, text.to_string())?)
            }
        };
        Ok(PackageId::new(
            name,
            version.clone(),
            ResolvedDescription::Hosted {
                name: hosted_name.to_string(),
                url: url.trim_end_matches('/').to_string(),
                sha256,
            },
        ))
    }

    fn serialize_description(&self, id: &PackageId) -> Value {
        let mut map = serde_yaml::Mapping::new();
        if let ResolvedDescription::Hosted { name, url, sha256 } = &id.description {
            map.insert("name".into(), Value::String(name.clone()));
            if let Some(hash) = sha256 {
                map.insert("sha256".into(), Value::String(hash.clone()));
            }
            map.insert("url".into(), Value::String(url.clone()));
        }
        Value::Mapping(map)
    }
}

fn bad_description(name: &str, message: &str) -> Error {
    Error::Manifest(ManifestError::Format {
        location: format!("packages.{name}.description"),
        message: message.to_string(),
    })
}

/// Validate a hex sha256 string from a listing or lock file.
fn validate_sha256(name: &str, hash: String) -> Result<String> {
    let hash = hash.to_ascii_lowercase();
    if hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(hash)
    } else {
        Err(Error::Data(format!(
            "invalid sha256 for {name}: expected 64 hex characters"
        )))
    }
}

/// Convert the JSON manifest embedded in a listing into a [`Manifest`].
fn manifest_from_listing(
    name: &str,
    raw: &serde_json::Value,
    default_url: &str,
) -> Result<Manifest> {
    let yaml = serde_yaml::to_string(raw)
        .map_err(|e| Error::Data(format!("bad manifest in listing for {name}: {e}")))?;
    Ok(Manifest::parse(&yaml, None, default_url)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{
        Fetch, HttpConfig, HttpTransport, TokenStore, TransportError, TransportRequest,
        TransportResponse,
    };
    use std::sync::Mutex as StdMutex;

    /// Serves a canned listing body for every request, counting hits.
    struct ListingServer {
        body: String,
        hits: StdMutex<usize>,
    }

    impl HttpTransport for ListingServer {
        fn execute(
            &self,
            _request: TransportRequest,
        ) -> std::result::Result<TransportResponse, TransportError> {
            *self.hits.lock().unwrap() += 1;
            Ok(TransportResponse {
                status: 200,
                headers: Vec::new(),
                body: Box::new(std::io::Cursor::new(self.body.clone().into_bytes())),
            })
        }
    }

    fn source_over(body: &str) -> (HostedSource, Arc<ListingServer>) {
        let server = Arc::new(ListingServer {
            body: body.to_string(),
            hits: StdMutex::new(0),
        });
        let mut fetch = Fetch::new(
            HttpConfig::for_tests("https://packages.test"),
            Arc::clone(&server) as Arc<dyn HttpTransport>,
            TokenStore::empty(),
        );
        fetch.set_sleep_fn(|_| {});
        let dir = tempfile::tempdir().unwrap();
        let cache = SystemCache::new(dir.path(), Arc::new(fetch));
        (HostedSource::new(Arc::new(cache)), server)
    }

    const LISTING: &str = r#"{
        "versions": [
            {"version": "1.2.0", "archive_url": "https://packages.test/a/foo-1.2.0.tar.gz",
             "manifest": {"name": "foo", "version": "1.2.0"}},
            {"version": "2.0.0", "archive_url": "https://packages.test/a/foo-2.0.0.tar.gz",
             "retracted": true,
             "manifest": {"name": "foo", "version": "2.0.0"}},
            {"version": "1.2.1", "archive_url": "https://packages.test/a/foo-1.2.1.tar.gz",
             "archive_sha256": "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff",
             "manifest": {"name": "foo", "version": "1.2.1", "dependencies": {"bar": "^1.0.0"}}}
        ]
    }"#;

    fn foo_ref() -> PackageRef {
        PackageRef::hosted("foo", "https://packages.test")
    }

    #[test]
    fn test_list_versions_sorted_and_retracted_filtered() {
        let (source, _) = source_over(LISTING);
        let versions = source.list_versions(&foo_ref()).unwrap();
        let listed: Vec<String> = versions.iter().map(|id| id.version.to_string()).collect();
        assert_eq!(listed, vec!["1.2.0", "1.2.1"]);
    }

    #[test]
    fn test_listing_fetched_once() {
        let (source, server) = source_over(LISTING);
        source.list_versions(&foo_ref()).unwrap();
        source.list_versions(&foo_ref()).unwrap();
        assert_eq!(*server.hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_listing_carries_archive_hash() {
        let (source, _) = source_over(LISTING);
        let versions = source.list_versions(&foo_ref()).unwrap();
        assert_eq!(versions[0].description.sha256(), None);
        assert_eq!(
            versions[1].description.sha256(),
            Some("00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff")
        );
    }

    #[test]
    fn test_describe_uses_listing_manifest() {
        let (source, _) = source_over(LISTING);
        let versions = source.list_versions(&foo_ref()).unwrap();
        let manifest = source.describe(&versions[1]).unwrap();
        assert_eq!(manifest.name, "foo");
        assert!(manifest.dependencies.contains_key("bar"));
    }

    #[test]
    fn test_description_round_trip() {
        let (source, _) = source_over(LISTING);
        let versions = source.list_versions(&foo_ref()).unwrap();
        let id = &versions[1];
        let serialized = source.serialize_description(id);
        let parsed = source
            .parse_description("foo", &id.version, &serialized, None)
            .unwrap();
        assert_eq!(&parsed, id);
    }

    #[test]
    fn test_parse_description_missing_url() {
        let (source, _) = source_over(LISTING);
        let description: Value = serde_yaml::from_str("name: foo").unwrap();
        let err = source
            .parse_description("foo", &Version::new(1, 0, 0), &description, None)
            .unwrap_err();
        assert!(err.to_string().contains("url"), "{err}");
    }
}
