// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.
//!
//! The centerpiece is [`FakeRegistry`]: an in-memory hosted registry that
//! implements the fetch pipeline's transport seam. It serves version
//! listings and tar.gz archives (with correct CRC32C headers and content
//! hashes) without touching the network, so the whole stack from solver to
//! cache can run end to end in tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use keel::cache::SystemCache;
use keel::fetch::{
    Fetch, HttpConfig, HttpTransport, TokenStore, TransportError, TransportRequest,
    TransportResponse, GOOG_HASH_HEADER,
};
use keel::manifest::Manifest;
use keel::source::{SdkInstallation, SourceRegistry};
use keel::{Description, PackageRange, VersionConstraint};

/// Origin all test fixtures use.
pub const REGISTRY_URL: &str = "https://packages.test";

struct FakeVersion {
    version: String,
    manifest: serde_json::Value,
    archive: Vec<u8>,
    sha256: String,
}

/// An in-memory hosted registry serving the JSON protocol and archives.
pub struct FakeRegistry {
    packages: Mutex<HashMap<String, Vec<FakeVersion>>>,
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            packages: Mutex::new(HashMap::new()),
        })
    }

    /// Publish a version with plain hosted dependencies.
    pub fn publish(&self, name: &str, version: &str, deps: &[(&str, &str)]) {
        let dependencies: serde_json::Map<String, serde_json::Value> = deps
            .iter()
            .map(|(dep, constraint)| ((*dep).to_string(), serde_json::json!(constraint)))
            .collect();
        self.publish_manifest(
            name,
            version,
            serde_json::json!({
                "name": name,
                "version": version,
                "dependencies": dependencies,
            }),
        );
    }

    /// Publish a version with full control over the manifest document.
    pub fn publish_manifest(&self, name: &str, version: &str, manifest: serde_json::Value) {
        let manifest_yaml = serde_yaml::to_string(&manifest).expect("manifest serializes");
        let archive = tar_gz(&[("keel.yaml", manifest_yaml.as_bytes())]);
        let sha256 = format!("{:x}", Sha256::digest(&archive));
        self.packages
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push(FakeVersion {
                version: version.to_string(),
                manifest,
                archive,
                sha256,
            });
    }

    fn listing_body(&self, name: &str) -> Option<Vec<u8>> {
        let packages = self.packages.lock().unwrap();
        let versions = packages.get(name)?;
        let entries: Vec<serde_json::Value> = versions
            .iter()
            .map(|v| {
                serde_json::json!({
                    "version": v.version,
                    "archive_url": format!("{REGISTRY_URL}/archives/{name}-{}.tar.gz", v.version),
                    "archive_sha256": v.sha256,
                    "manifest": v.manifest,
                })
            })
            .collect();
        Some(
            serde_json::to_vec(&serde_json::json!({ "versions": entries }))
                .expect("listing serializes"),
        )
    }

    fn archive_body(&self, file: &str) -> Option<Vec<u8>> {
        let packages = self.packages.lock().unwrap();
        for (name, versions) in packages.iter() {
            for v in versions {
                if file == format!("{name}-{}.tar.gz", v.version) {
                    return Some(v.archive.clone());
                }
            }
        }
        None
    }
}

impl HttpTransport for FakeRegistry {
    // The origin is ignored: the same package table answers for any
    // registry URL, which lets tests exercise multi-registry descriptions.
    fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let path = match request.url.find("/api/") {
            Some(at) => &request.url[at + 1..],
            None => match request.url.find("/archives/") {
                Some(at) => &request.url[at + 1..],
                None => {
                    return Err(TransportError(format!(
                        "unexpected url {}",
                        request.url
                    )))
                }
            },
        };

        if let Some(name) = path.strip_prefix("api/packages/") {
            return match self.listing_body(name) {
                Some(body) => Ok(ok_response(body, None)),
                None => Ok(TransportResponse {
                    status: 404,
                    headers: Vec::new(),
                    body: Box::new(Cursor::new(
                        serde_json::to_vec(&serde_json::json!({
                            "error": {"message": format!("could not find package {name}")}
                        }))
                        .unwrap(),
                    )),
                }),
            };
        }
        if let Some(file) = path.strip_prefix("archives/") {
            return match self.archive_body(file) {
                Some(body) => {
                    let crc = crc32c::crc32c(&body);
                    Ok(ok_response(body, Some(crc)))
                }
                None => Ok(TransportResponse {
                    status: 404,
                    headers: Vec::new(),
                    body: Box::new(Cursor::new(Vec::new())),
                }),
            };
        }
        Err(TransportError(format!("unexpected path {path}")))
    }
}

fn ok_response(body: Vec<u8>, crc32c: Option<u32>) -> TransportResponse {
    let mut headers = vec![("content-length".to_string(), body.len().to_string())];
    if let Some(crc) = crc32c {
        headers.push((
            GOOG_HASH_HEADER.to_string(),
            format!(
                "crc32c={}",
                base64::engine::general_purpose::STANDARD.encode(crc.to_be_bytes())
            ),
        ));
    }
    TransportResponse {
        status: 200,
        headers,
        body: Box::new(Cursor::new(body)),
    }
}

/// Build a tar.gz archive from `(path, contents)` pairs.
pub fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
        Vec::new(),
        flate2::Compression::default(),
    ));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_path(path).unwrap();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, *contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Everything a test needs to run the stack against a [`FakeRegistry`].
pub struct TestContext {
    pub dir: TempDir,
    pub server: Arc<FakeRegistry>,
    pub cache: Arc<SystemCache>,
    pub sources: SourceRegistry,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_sdks(BTreeMap::new())
    }

    pub fn with_sdks(sdks: BTreeMap<String, SdkInstallation>) -> Self {
        let server = FakeRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(build_cache(&server, &dir));
        let sources = SourceRegistry::new(Arc::clone(&cache), sdks);
        Self {
            dir,
            server,
            cache,
            sources,
        }
    }

    /// A fresh source registry over the same cache and server; listings are
    /// memoized per registry, so this simulates a new run of the tool.
    pub fn fresh_sources(&self) -> SourceRegistry {
        SourceRegistry::new(Arc::clone(&self.cache), BTreeMap::new())
    }

    /// Parse a manifest against the test registry URL.
    pub fn manifest(&self, text: &str) -> Manifest {
        Manifest::parse(text, None, REGISTRY_URL).unwrap()
    }
}

fn build_cache(server: &Arc<FakeRegistry>, dir: &TempDir) -> SystemCache {
    let mut fetch = Fetch::new(
        HttpConfig::for_tests(REGISTRY_URL),
        Arc::clone(server) as Arc<dyn HttpTransport>,
        TokenStore::empty(),
    );
    fetch.set_sleep_fn(|_| {});
    SystemCache::new(dir.path().join("cache"), Arc::new(fetch))
}

/// A hosted range on the test registry.
pub fn hosted_range(name: &str, constraint: &str) -> PackageRange {
    PackageRange::new(
        name,
        Description::Hosted {
            name: name.to_string(),
            url: REGISTRY_URL.to_string(),
        },
        VersionConstraint::parse(constraint).unwrap(),
    )
}
