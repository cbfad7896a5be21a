use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

const DIGEST_HEX_LEN: usize = 12;

/// Per-executable code versions, hashed once per process.
#[derive(Debug, Default)]
pub struct CodeVersions {
    cache: Mutex<HashMap<PathBuf, String>>,
}

impl CodeVersions {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<crate version>+<sha256 prefix of the executable>`, or just the crate version
    /// when the executable is not a readable file (e.g. resolved through `PATH`).
    pub fn version_of(&self, executable: Option<&str>) -> String {
        let Some(exe) = executable else {
            return env!("CARGO_PKG_VERSION").to_string();
        };
        let path = PathBuf::from(exe);
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache
            .entry(path)
            .or_insert_with_key(|p| match digest_prefix(p) {
                Some(d) => format!("{}+{}", env!("CARGO_PKG_VERSION"), d),
                None => env!("CARGO_PKG_VERSION").to_string(),
            })
            .clone()
    }
}

fn digest_prefix(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let digest = hex::encode(Sha256::digest(&bytes));
    Some(digest[..DIGEST_HEX_LEN].to_string())
}
