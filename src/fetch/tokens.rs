// src/fetch/tokens.rs

//! Read-only access to the credential store (`keel-tokens.json`).
//!
//! Token acquisition and file management belong to an external collaborator;
//! this module only consumes the file to attach `Authorization` headers to
//! hosted-registry requests.

use serde::Deserialize;
use std::path::Path;
use tracing::warn;

use crate::fetch::url_within;

/// File name of the credential store inside the cache root.
pub const TOKEN_FILE: &str = "keel-tokens.json";

#[derive(Deserialize)]
struct TokenFile {
    version: u32,
    #[serde(default)]
    hosted: Vec<TokenEntry>,
}

#[derive(Deserialize, Clone)]
struct TokenEntry {
    url: String,
    token: String,
}

/// Credentials for hosted registries, keyed by URL prefix.
#[derive(Clone, Default)]
pub struct TokenStore {
    entries: Vec<TokenEntry>,
}

impl TokenStore {
    /// A store with no credentials.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load `keel-tokens.json`. A missing file yields an empty store; a
    /// malformed or unsupported file is ignored with a warning rather than
    /// failing the command.
    pub fn load(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return Self::empty(),
        };
        match serde_json::from_str::<TokenFile>(&text) {
            Ok(file) if file.version == 1 => Self {
                entries: file.hosted,
            },
            Ok(file) => {
                warn!(
                    "ignoring {}: unsupported version {}",
                    path.display(),
                    file.version
                );
                Self::empty()
            }
            Err(e) => {
                warn!("ignoring malformed {}: {}", path.display(), e);
                Self::empty()
            }
        }
    }

    /// The token for the longest configured URL prefix matching `url`.
    ///
    /// Matches must end at a URL boundary so a token configured for one
    /// host is never sent to a lookalike host sharing the prefix.
    pub fn token_for(&self, url: &str) -> Option<&str> {
        self.entries
            .iter()
            .filter(|e| url_within(url, &e.url))
            .max_by_key(|e| e.url.len())
            .map(|e| e.token.as_str())
    }
}
