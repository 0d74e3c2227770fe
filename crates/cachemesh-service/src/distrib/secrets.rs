//! Shared-key store for control-message authentication.
//!
//! Keys live in a flat file of `sid hexkey` lines (`#` starts a comment).
//! The first entry is the signing key for outgoing messages; incoming
//! messages may name any entry, which lets a deployment roll keys without
//! a flag day. `refresh()` re-reads the file when its modification time
//! changes and is driven by the coordinator's regular maintenance.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};

/// HMAC-SHA-256 key length.
const KEY_LEN: usize = 32;

#[derive(Debug, Default)]
struct Inner {
    keys: HashMap<String, Vec<u8>>,
    signing_sid: Option<String>,
    mtime: Option<SystemTime>,
}

#[derive(Debug)]
pub struct SecretStore {
    path: Option<PathBuf>,
    inner: RwLock<Inner>,
}

impl SecretStore {
    pub fn load(path: PathBuf) -> Result<Self> {
        let inner = read_key_file(&path)?;
        Ok(SecretStore {
            path: Some(path),
            inner: RwLock::new(inner),
        })
    }

    /// The key to sign outgoing messages with, if any.
    pub fn signing_key(&self) -> Option<(String, Vec<u8>)> {
        let inner = self.inner.read().unwrap();
        let sid = inner.signing_sid.clone()?;
        let key = inner.keys.get(&sid)?.clone();
        Some((sid, key))
    }

    /// The key for a secret-id named by an incoming message.
    pub fn get(&self, sid: &str) -> Option<Vec<u8>> {
        self.inner.read().unwrap().keys.get(sid).cloned()
    }

    /// Re-read the key file if it changed on disk. Errors are logged and
    /// the previous keys stay in effect; a fat-fingered key file must not
    /// take the control plane down.
    pub fn refresh(&self) {
        let Some(path) = &self.path else { return };
        let mtime = fs::metadata(path).and_then(|md| md.modified()).ok();
        if mtime.is_some() && mtime == self.inner.read().unwrap().mtime {
            return;
        }
        match read_key_file(path) {
            Ok(fresh) => {
                tracing::info!(path = %path.display(), keys = fresh.keys.len(), "reloaded secret store");
                *self.inner.write().unwrap() = fresh;
            }
            Err(err) => {
                tracing::error!(
                    path = %path.display(),
                    error = %err,
                    "failed to reload secret store, keeping previous keys"
                );
            }
        }
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn for_testing(entries: &[(&str, &[u8; 32])]) -> Self {
        let mut inner = Inner::default();
        for (sid, key) in entries {
            inner
                .signing_sid
                .get_or_insert_with(|| sid.to_string());
            inner.keys.insert(sid.to_string(), key.to_vec());
        }
        SecretStore {
            path: None,
            inner: RwLock::new(inner),
        }
    }
}

fn read_key_file(path: &std::path::Path) -> Result<Inner> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read secret file {}", path.display()))?;
    let mtime = fs::metadata(path).and_then(|md| md.modified()).ok();

    let mut inner = Inner {
        mtime,
        ..Inner::default()
    };
    for (lineno, line) in raw.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((sid, hexkey)) = line.split_once(char::is_whitespace) else {
            bail!("secret file line {}: expected `sid hexkey`", lineno + 1);
        };
        let key = hex::decode(hexkey.trim())
            .with_context(|| format!("secret file line {}: bad hex", lineno + 1))?;
        if key.len() < KEY_LEN {
            bail!(
                "secret file line {}: key too short ({} bytes, need {KEY_LEN})",
                lineno + 1,
                key.len()
            );
        }
        inner.signing_sid.get_or_insert_with(|| sid.to_string());
        inner.keys.insert(sid.to_string(), key);
    }
    if inner.keys.is_empty() {
        bail!("secret file {} holds no keys", path.display());
    }
    Ok(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_and_refreshes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# deployment keys").unwrap();
        writeln!(file, "k2024 {}", "ab".repeat(32)).unwrap();
        writeln!(file, "k2023 {}", "cd".repeat(32)).unwrap();
        file.flush().unwrap();

        let store = SecretStore::load(file.path().to_path_buf()).unwrap();
        let (sid, key) = store.signing_key().unwrap();
        assert_eq!(sid, "k2024");
        assert_eq!(key, hex::decode("ab".repeat(32)).unwrap());
        assert!(store.get("k2023").is_some());
        assert!(store.get("k1999").is_none());

        // A rewrite with a new signing key takes effect on refresh.
        writeln!(file, "k2025 {}", "ef".repeat(32)).unwrap();
        file.flush().unwrap();
        store.refresh();
        assert!(store.get("k2025").is_some());
    }

    #[test]
    fn rejects_short_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "weak 0011").unwrap();
        file.flush().unwrap();
        assert!(SecretStore::load(file.path().to_path_buf()).is_err());
    }
}
