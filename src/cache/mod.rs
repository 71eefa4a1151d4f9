// src/cache/mod.rs

//! The system cache: content-addressed on-disk storage of downloaded
//! package archives.
//!
//! Layout under the cache root:
//!
//! ```text
//! hosted/<host>/<name>-<version>/        unpacked package tree
//! hosted/<host>/<name>-<version>.sha256  archive content hash (hex)
//! keel-tokens.json                       registry credentials (read-only)
//! ```
//!
//! Writes are atomic (download to temp, rename into place) and concurrent
//! downloads of the same package are deduplicated with an advisory file
//! lock, so several processes can safely share one cache root.

use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fetch::{DecodeError, Fetch};
use crate::package::{PackageId, ResolvedDescription};

/// Read buffer for streaming archive downloads.
const DOWNLOAD_BUFFER_SIZE: usize = 64 * 1024;

/// Hard cap on accepted archive sizes (declared content length).
pub const MAX_ARCHIVE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Content-addressed cache of package archives and their hashes.
pub struct SystemCache {
    root: PathBuf,
    fetch: Arc<Fetch>,
}

impl SystemCache {
    pub fn new(root: impl Into<PathBuf>, fetch: Arc<Fetch>) -> Self {
        Self {
            root: root.into(),
            fetch,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fetch(&self) -> &Arc<Fetch> {
        &self.fetch
    }

    /// Directory holding the unpacked tree for a hosted package, or `None`
    /// for ids from sources the cache does not manage.
    pub fn package_dir(&self, id: &PackageId) -> Option<PathBuf> {
        match &id.description {
            ResolvedDescription::Hosted { url, .. } => Some(
                self.root
                    .join("hosted")
                    .join(host_dir_name(url))
                    .join(format!("{}-{}", id.name, id.version)),
            ),
            _ => None,
        }
    }

    fn sha256_path(&self, id: &PackageId) -> Option<PathBuf> {
        self.package_dir(id)
            .map(|dir| dir.with_extension("sha256"))
    }

    /// The recorded archive hash for `id`, if the archive has ever been
    /// downloaded into this cache.
    pub fn sha256_from_cache(&self, id: &PackageId) -> Option<String> {
        let path = self.sha256_path(id)?;
        let text = fs::read_to_string(path).ok()?;
        let hash = text.trim().to_ascii_lowercase();
        if hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(hash)
        } else {
            None
        }
    }

    /// Whether the unpacked tree for `id` is present.
    pub fn contains(&self, id: &PackageId) -> bool {
        self.package_dir(id).map_or(false, |dir| dir.is_dir())
    }

    /// Download, verify, and unpack the archive for a hosted package.
    ///
    /// Returns the id with its content hash filled in. The archive bytes are
    /// always hashed here; the lock file picks the hash up from the cache at
    /// serialize time. If the registry declared a hash for this version and
    /// the downloaded bytes disagree, the download is treated as corrupted
    /// and retried by the fetch pipeline.
    pub fn download_package(&self, id: &PackageId, archive_url: &str) -> Result<PackageId> {
        let dir = self
            .package_dir(id)
            .ok_or_else(|| Error::Internal(format!("{id} is not a hosted package")))?;
        let parent = dir.parent().expect("package dir always has a parent");
        fs::create_dir_all(parent)?;

        // Cross-process dedup: whoever holds the lock downloads; everyone
        // else finds the finished tree after acquiring it.
        let lock_path = dir.with_extension("lock");
        let lock_file = fs::File::create(&lock_path)?;
        lock_file.lock_exclusive()?;

        if dir.is_dir() {
            if let Some(hash) = self.sha256_from_cache(id) {
                debug!("{id} already cached");
                return Ok(PackageId::new(
                    id.name.clone(),
                    id.version.clone(),
                    id.description.with_sha256(Some(hash)),
                ));
            }
        }

        info!("downloading {id}");
        let declared = id.description.sha256().map(str::to_string);
        let (archive, computed) = self
            .fetch
            .get(archive_url)
            .dependency_type("package")
            .max_bytes(MAX_ARCHIVE_BYTES)
            .run(|body, _info| {
                let mut file = tempfile::NamedTempFile::new_in(parent)?;
                let mut hasher = Sha256::new();
                let mut buf = [0u8; DOWNLOAD_BUFFER_SIZE];
                loop {
                    let n = body.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    file.write_all(&buf[..n])?;
                }
                let computed = format!("{:x}", hasher.finalize());
                if let Some(expected) = &declared {
                    if *expected != computed {
                        return Err(DecodeError::Format(format!(
                            "archive hash {computed} does not match the hash the registry declared ({expected})"
                        )));
                    }
                }
                Ok((file, computed))
            })?;

        // Unpack next to the destination, then move into place atomically.
        let staging = tempfile::tempdir_in(parent)?;
        extract_tar_gz(archive.path(), staging.path())?;
        let staged = staging.into_path();
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::rename(&staged, &dir)?;

        write_atomic(
            &self.sha256_path(id).expect("hosted id has a hash path"),
            computed.as_bytes(),
        )?;
        debug!("unpacked {id} into {}", dir.display());

        Ok(PackageId::new(
            id.name.clone(),
            id.version.clone(),
            id.description.with_sha256(Some(computed)),
        ))
    }
}

/// Directory name for a registry host, derived from its URL.
fn host_dir_name(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host = rest.split('/').next().unwrap_or(rest);
    host.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '%'
            }
        })
        .collect()
}

/// Unpack a gzipped tarball into `dest`.
fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);
    // tar's unpack refuses entries that would escape the destination.
    tar.unpack(dest)?;
    Ok(())
}

/// Write a small file atomically: temp in the same directory, then rename.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("{} has no parent", path.display())))?;
    let mut file = tempfile::NamedTempFile::new_in(parent)?;
    file.write_all(contents)?;
    file.persist(path)
        .map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{
        HttpConfig, HttpTransport, TokenStore, TransportError, TransportRequest,
        TransportResponse,
    };
    use crate::version::Version;
    use std::sync::Mutex;

    /// Serves one tar.gz archive body any number of times.
    struct ArchiveServer {
        body: Vec<u8>,
        hits: Mutex<usize>,
    }

    impl HttpTransport for ArchiveServer {
        fn execute(
            &self,
            _request: TransportRequest,
        ) -> std::result::Result<TransportResponse, TransportError> {
            *self.hits.lock().unwrap() += 1;
            Ok(TransportResponse {
                status: 200,
                headers: vec![(
                    "content-length".to_string(),
                    self.body.len().to_string(),
                )],
                body: Box::new(std::io::Cursor::new(self.body.clone())),
            })
        }
    }

    fn tar_gz_with_manifest(name: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        let manifest = format!("name: {name}\nversion: 1.0.0\n");
        let mut header = tar::Header::new_gnu();
        header.set_path("keel.yaml").unwrap();
        header.set_size(manifest.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, manifest.as_bytes()).unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn hosted_id(name: &str, hash: Option<String>) -> PackageId {
        PackageId::new(
            name,
            Version::new(1, 0, 0),
            ResolvedDescription::Hosted {
                name: name.to_string(),
                url: "https://packages.test".to_string(),
                sha256: hash,
            },
        )
    }

    fn cache_over(server: Arc<ArchiveServer>, root: &Path) -> SystemCache {
        let mut fetch = Fetch::new(
            HttpConfig::for_tests("https://packages.test"),
            server,
            TokenStore::empty(),
        );
        fetch.set_sleep_fn(|_| {});
        SystemCache::new(root, Arc::new(fetch))
    }

    #[test]
    fn test_download_unpacks_and_records_hash() {
        let body = tar_gz_with_manifest("foo");
        let expected = format!("{:x}", Sha256::digest(&body));
        let server = Arc::new(ArchiveServer {
            body,
            hits: Mutex::new(0),
        });
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_over(Arc::clone(&server), dir.path());

        let id = hosted_id("foo", None);
        let downloaded = cache
            .download_package(&id, "https://packages.test/archives/foo-1.0.0.tar.gz")
            .unwrap();

        assert_eq!(downloaded.description.sha256(), Some(expected.as_str()));
        assert_eq!(cache.sha256_from_cache(&id), Some(expected.clone()));
        // On-disk hash sidecar matches the archive bytes actually stored.
        let tree = cache.package_dir(&id).unwrap();
        assert!(tree.join("keel.yaml").is_file());
    }

    #[test]
    fn test_second_download_hits_cache() {
        let body = tar_gz_with_manifest("foo");
        let server = Arc::new(ArchiveServer {
            body,
            hits: Mutex::new(0),
        });
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_over(Arc::clone(&server), dir.path());

        let id = hosted_id("foo", None);
        cache
            .download_package(&id, "https://packages.test/archives/foo-1.0.0.tar.gz")
            .unwrap();
        cache
            .download_package(&id, "https://packages.test/archives/foo-1.0.0.tar.gz")
            .unwrap();
        assert_eq!(*server.hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_declared_hash_mismatch_fails() {
        let body = tar_gz_with_manifest("foo");
        let server = Arc::new(ArchiveServer {
            body,
            hits: Mutex::new(0),
        });
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_over(Arc::clone(&server), dir.path());

        let id = hosted_id("foo", Some("0".repeat(64)));
        let err = cache
            .download_package(&id, "https://packages.test/archives/foo-1.0.0.tar.gz")
            .unwrap_err();
        assert!(err.to_string().contains("does not match"), "{err}");
        assert!(!cache.contains(&id));
    }

    #[test]
    fn test_host_dir_name() {
        assert_eq!(
            host_dir_name("https://packages.example.org"),
            "packages.example.org"
        );
        assert_eq!(
            host_dir_name("https://packages.example.org:8080/path"),
            "packages.example.org%8080"
        );
    }

    #[test]
    fn test_sha256_from_cache_rejects_garbage() {
        let server = Arc::new(ArchiveServer {
            body: Vec::new(),
            hits: Mutex::new(0),
        });
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_over(server, dir.path());
        let id = hosted_id("foo", None);

        let path = cache.sha256_path(&id).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not a hash").unwrap();
        assert_eq!(cache.sha256_from_cache(&id), None);
    }
}
