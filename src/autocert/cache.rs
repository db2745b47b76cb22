//! Persistent certificate cache.
//!
//! A directory keyed by hostname. Writes go to a temp file and are
//! renamed into place so a crash never leaves a torn entry. The stored
//! bytes are whatever the issuing authority returned; entries survive
//! process restarts and are reused by later listeners pointed at the same
//! location.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const ACCOUNT_FILE: &str = "account.json";

/// Directory-backed store for issued certificate material and the issuer
/// account credentials.
#[derive(Debug, Clone)]
pub struct CertCache {
    dir: PathBuf,
}

impl CertCache {
    /// Cache rooted at `dir`. The directory is created on first write or
    /// by [`CertCache::ensure`].
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the cache directory if missing.
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// Cache directory location.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read the stored entry for `host`, if any.
    pub fn get(&self, host: &str) -> io::Result<Option<Vec<u8>>> {
        read_optional(&self.entry_path(host))
    }

    /// Atomically write the entry for `host`.
    pub fn put(&self, host: &str, data: &[u8]) -> io::Result<()> {
        self.write_atomic(&self.entry_path(host), data)
    }

    /// Read the stored issuer account credentials, if any.
    pub fn get_account(&self) -> io::Result<Option<Vec<u8>>> {
        read_optional(&self.dir.join(ACCOUNT_FILE))
    }

    /// Atomically write the issuer account credentials.
    pub fn put_account(&self, data: &[u8]) -> io::Result<()> {
        self.write_atomic(&self.dir.join(ACCOUNT_FILE), data)
    }

    fn entry_path(&self, host: &str) -> PathBuf {
        self.dir.join(format!("{host}.pem"))
    }

    // Write atomically (write to temp file, then rename).
    fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.ensure()?;
        let temp = path.with_extension("tmp");
        fs::write(&temp, data)?;
        fs::rename(&temp, path)
    }
}

fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CertCache::new(dir.path().join("certs"));

        assert_eq!(cache.get("example.com").unwrap(), None);
        cache.put("example.com", b"material").unwrap();
        assert_eq!(
            cache.get("example.com").unwrap().as_deref(),
            Some(&b"material"[..])
        );

        cache.put("example.com", b"refreshed").unwrap();
        assert_eq!(
            cache.get("example.com").unwrap().as_deref(),
            Some(&b"refreshed"[..])
        );
    }

    #[test]
    fn test_account_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CertCache::new(dir.path());

        assert_eq!(cache.get_account().unwrap(), None);
        cache.put_account(b"{\"key\":\"value\"}").unwrap();
        assert!(cache.get_account().unwrap().is_some());
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        CertCache::new(dir.path())
            .put("example.com", b"persisted")
            .unwrap();
        let reopened = CertCache::new(dir.path());
        assert_eq!(
            reopened.get("example.com").unwrap().as_deref(),
            Some(&b"persisted"[..])
        );
    }
}
