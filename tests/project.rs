// tests/project.rs

//! End-to-end "bring this project up to date" scenarios: manifest in,
//! lock file and package configuration out, archives fetched and verified
//! through the cache.

mod common;

use common::{TestContext, REGISTRY_URL};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use keel::cache::SystemCache;
use keel::fetch::{Fetch, HttpConfig, HttpTransport, TokenStore};
use keel::project::{Project, PACKAGE_CONFIG_FILE, STATE_DIR};
use keel::{LockFile, Version, LOCK_FILE};

/// A project directory with the given manifest, sharing the context's
/// registry server and cache root.
fn project_in(ctx: &TestContext, manifest: &str) -> (tempfile::TempDir, Project) {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("keel.yaml"), manifest).unwrap();

    let mut fetch = Fetch::new(
        HttpConfig::for_tests(REGISTRY_URL),
        Arc::clone(&ctx.server) as Arc<dyn HttpTransport>,
        TokenStore::empty(),
    );
    fetch.set_sleep_fn(|_| {});
    let cache = Arc::new(SystemCache::new(
        ctx.dir.path().join("cache"),
        Arc::new(fetch),
    ));
    let project = Project::load(dir.path(), cache, BTreeMap::new()).unwrap();
    (dir, project)
}

#[test]
fn test_ensure_up_to_date_writes_lock_and_package_config() {
    let ctx = TestContext::new();
    ctx.server.publish("foo", "1.2.1", &[]);
    let (dir, project) = project_in(&ctx, "name: app\ndependencies:\n  foo: ^1.2.0\n");

    project.ensure_up_to_date().unwrap();

    let lock_text = fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
    assert!(lock_text.contains("foo"));
    assert!(lock_text.contains("\"1.2.1\""));
    // The archive was downloaded, so its content hash lands in the lock.
    assert!(lock_text.contains("sha256"));

    let config_text =
        fs::read_to_string(dir.path().join(STATE_DIR).join(PACKAGE_CONFIG_FILE)).unwrap();
    let config: serde_json::Value = serde_json::from_str(&config_text).unwrap();
    assert_eq!(config["configVersion"], 2);
    let names: Vec<&str> = config["packages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["app", "foo"]);
    assert!(config["generated"].is_string());
}

#[test]
fn test_ensure_up_to_date_is_idempotent() {
    let ctx = TestContext::new();
    ctx.server.publish("foo", "1.0.0", &[]);
    let (dir, project) = project_in(&ctx, "name: app\ndependencies:\n  foo: ^1.0.0\n");

    project.ensure_up_to_date().unwrap();
    assert!(project.is_up_to_date());

    let first = fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
    project.ensure_up_to_date().unwrap();
    let second = fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_stale_lock_is_resolved_again() {
    let ctx = TestContext::new();
    ctx.server.publish("foo", "1.0.0", &[]);
    ctx.server.publish("bar", "1.0.0", &[]);
    let (dir, project) = project_in(&ctx, "name: app\ndependencies:\n  foo: ^1.0.0\n");
    project.ensure_up_to_date().unwrap();

    // The manifest grows a dependency the lock doesn't cover.
    fs::write(
        dir.path().join("keel.yaml"),
        "name: app\ndependencies:\n  foo: ^1.0.0\n  bar: ^1.0.0\n",
    )
    .unwrap();
    let project = {
        // Reload to pick up the edited manifest.
        let mut fetch = Fetch::new(
            HttpConfig::for_tests(REGISTRY_URL),
            Arc::clone(&ctx.server) as Arc<dyn HttpTransport>,
            TokenStore::empty(),
        );
        fetch.set_sleep_fn(|_| {});
        let cache = Arc::new(SystemCache::new(
            ctx.dir.path().join("cache"),
            Arc::new(fetch),
        ));
        Project::load(dir.path(), cache, BTreeMap::new()).unwrap()
    };
    assert!(!project.is_up_to_date());

    project.ensure_up_to_date().unwrap();
    let lock_text = fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
    assert!(lock_text.contains("bar"));
    // The untouched pin is carried over from the previous lock.
    assert!(lock_text.contains("foo"));
}

#[test]
fn test_lock_preserves_crlf_convention() {
    let ctx = TestContext::new();
    ctx.server.publish("foo", "1.0.0", &[]);
    let (dir, project) = project_in(&ctx, "name: app\ndependencies:\n  foo: ^1.0.0\n");

    // Seed a CRLF lock file, as a Windows checkout would have.
    fs::write(
        dir.path().join(LOCK_FILE),
        "# keep me\r\npackages: {}\r\nsdks: {}\r\n",
    )
    .unwrap();

    project.ensure_up_to_date().unwrap();
    let lock_text = fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
    assert!(lock_text.starts_with("# keep me\r\n"));
    assert_eq!(
        lock_text.matches('\n').count(),
        lock_text.matches("\r\n").count()
    );
}

#[test]
fn test_lock_parse_round_trip_through_project() {
    let ctx = TestContext::new();
    ctx.server.publish("foo", "1.2.1", &[("bar", "^1.0.0")]);
    ctx.server.publish("bar", "1.0.3", &[]);
    let (dir, project) = project_in(&ctx, "name: app\ndependencies:\n  foo: ^1.0.0\n");
    project.ensure_up_to_date().unwrap();

    let text = fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
    let lock = LockFile::parse(&text, Some(dir.path()), project.registry()).unwrap();
    assert_eq!(lock.package("foo").unwrap().version, Version::new(1, 2, 1));
    assert_eq!(lock.package("bar").unwrap().version, Version::new(1, 0, 3));
    // The archive hashes were promoted into the lock at serialize time.
    assert!(lock.package("foo").unwrap().description.sha256().is_some());
    assert!(lock.package("bar").unwrap().description.sha256().is_some());
}
