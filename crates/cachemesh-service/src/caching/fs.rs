//! Filesystem layout of the reply cache.
//!
//! Records live under hashed paths so that arbitrary URL stems (slashes,
//! query strings, unicode) never meet the filesystem directly.

use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::BackendError;
use crate::types::Reply;

/// Bump together with the record layout in [`Reply::to_record`].
const LAYOUT_VERSION: u32 = 0;

/// Returns the relative record path for a URL stem.
///
/// The path is a sha-256 hash hex-formatted like so:
/// `v$version/aa/bbccdd/eeff...`
pub fn record_path(urlstem: &str) -> String {
    let hash = Sha256::digest(urlstem.as_bytes());
    let mut path = format!("v{LAYOUT_VERSION}/{:02x}/", hash[0]);
    for b in &hash[1..4] {
        path.write_fmt(format_args!("{b:02x}")).unwrap();
    }
    path.push('/');
    for b in &hash[4..] {
        path.write_fmt(format_args!("{b:02x}")).unwrap();
    }
    path
}

/// Load a record. `Ok(None)` when there is no record for this stem; a
/// record that fails validation is removed and reads as absent.
pub fn read_record(cache_dir: &Path, urlstem: &str) -> Result<Option<Reply>, BackendError> {
    let path = cache_dir.join(record_path(urlstem));
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match Reply::from_record(&data) {
        Ok(reply) => Ok(Some(reply)),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "removing unreadable cache record"
            );
            remove_record(cache_dir, urlstem);
            Ok(None)
        }
    }
}

/// Persist a record via a tempfile so that readers never observe a
/// partial write.
pub fn write_record(cache_dir: &Path, urlstem: &str, reply: &Reply) -> Result<(), BackendError> {
    let path = cache_dir.join(record_path(urlstem));
    let parent = path
        .parent()
        .ok_or(BackendError::InternalError)?
        .to_path_buf();

    // A concurrent cleanup may remove the directory between create and
    // persist, so retry the pair once.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;
        fs::create_dir_all(&parent)?;
        let mut temp_file = tempfile::NamedTempFile::new_in(&parent)?;
        std::io::Write::write_all(&mut temp_file, &reply.to_record())?;
        match temp_file.persist(&path) {
            Ok(_) => return Ok(()),
            Err(e) if retries < MAX_RETRIES => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e.error,
                    "failed to persist cache record, retrying"
                );
            }
            Err(e) => return Err(e.error.into()),
        }
    }
}

pub fn remove_record(cache_dir: &Path, urlstem: &str) {
    let _ = fs::remove_file(cache_dir.join(record_path(urlstem)));
}

/// Every record file under `cache_dir`, with size and modification time.
pub fn walk_records(cache_dir: &Path) -> Vec<(PathBuf, u64, std::time::SystemTime)> {
    let mut out = Vec::new();
    let mut pending = vec![cache_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => pending.push(path),
                Ok(ft) if ft.is_file() => {
                    if let Ok(md) = entry.metadata() {
                        let mtime = md.modified().unwrap_or(std::time::UNIX_EPOCH);
                        out.push((path, md.len(), mtime));
                    }
                }
                _ => {}
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_paths_are_stable_and_distinct() {
        let a = record_path("/a/root");
        let b = record_path("/a/root?x=1");
        assert_eq!(a, record_path("/a/root"));
        assert_ne!(a, b);
        assert!(a.starts_with("v0/"));
        assert_eq!(a.split('/').count(), 4);
    }

    #[test]
    fn read_write_remove() {
        let dir = tempfile::tempdir().unwrap();
        let mut reply = Reply::validator_only(7);
        reply.set_content(bytes::Bytes::from_static(b"abc"), crate::types::ContentEncoding::Identity);
        reply.set_times(
            std::time::Duration::ZERO,
            std::time::Duration::from_secs(60),
            std::time::Duration::ZERO,
        );

        assert!(read_record(dir.path(), "/x").unwrap().is_none());
        write_record(dir.path(), "/x", &reply).unwrap();
        let restored = read_record(dir.path(), "/x").unwrap().unwrap();
        assert_eq!(restored.content, reply.content);
        assert_eq!(restored.etag64, 7);

        remove_record(dir.path(), "/x");
        assert!(read_record(dir.path(), "/x").unwrap().is_none());
    }

    #[test]
    fn corrupt_records_read_as_absent_and_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(record_path("/y"));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"not a record").unwrap();

        assert!(read_record(dir.path(), "/y").unwrap().is_none());
        assert!(!path.exists());
    }
}
