//! Content-addressed artifact cache
//!
//! Archives live at `<dir>/<sha256>.zip` with a `<sha256>.json` sidecar that
//! records where the bytes came from. Installed plugins hold references on
//! their artifact; an artifact is only evicted once nothing references it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactOrigin {
    Local,
    Remote { url: String },
}

/// A plugin archive resident in the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub local_path: PathBuf,
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the archive bytes
    pub sha256: String,
    pub downloaded_from: ArtifactOrigin,
    pub cached_at: DateTime<Utc>,
}

pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[derive(Debug)]
pub struct ArtifactCache {
    dir: PathBuf,
    refs: Mutex<HashMap<String, usize>>,
}

impl ArtifactCache {
    pub fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            refs: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn archive_path(&self, sha256: &str) -> PathBuf {
        self.dir.join(format!("{}.zip", sha256))
    }

    fn sidecar_path(&self, sha256: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sha256))
    }

    /// Find a cached archive by content hash
    pub fn lookup(&self, sha256: &str) -> Option<ArtifactRecord> {
        let sha256 = sha256.to_ascii_lowercase();
        if !is_sha256_hex(&sha256) {
            return None;
        }
        let archive = self.archive_path(&sha256);
        if !archive.is_file() {
            return None;
        }
        let sidecar = fs::read(self.sidecar_path(&sha256)).ok()?;
        match serde_json::from_slice::<ArtifactRecord>(&sidecar) {
            Ok(record) if record.local_path == archive => Some(record),
            Ok(_) => None,
            Err(e) => {
                warn!(sha256 = %sha256, error = %e, "Ignoring unreadable cache sidecar");
                None
            }
        }
    }

    /// Fresh path for an in-progress download
    pub fn staging_path(&self) -> PathBuf {
        self.dir.join(format!(".partial-{}", uuid::Uuid::new_v4()))
    }

    /// Move a fully written and hashed file into the cache.
    ///
    /// If the same content is already cached the staged copy is discarded and
    /// the existing record returned.
    pub fn commit(
        &self,
        staged: &Path,
        sha256: &str,
        size_bytes: u64,
        origin: ArtifactOrigin,
    ) -> io::Result<ArtifactRecord> {
        if let Some(existing) = self.lookup(sha256) {
            let _ = fs::remove_file(staged);
            debug!(sha256, "Artifact already cached");
            return Ok(existing);
        }

        let local_path = self.archive_path(sha256);
        fs::rename(staged, &local_path)?;

        let record = ArtifactRecord {
            local_path,
            size_bytes,
            sha256: sha256.to_string(),
            downloaded_from: origin,
            cached_at: Utc::now(),
        };
        let mut sidecar = File::create(self.sidecar_path(sha256))?;
        sidecar.write_all(&serde_json::to_vec_pretty(&record)?)?;
        sidecar.sync_all()?;

        info!(sha256, size_bytes, "Cached artifact");
        Ok(record)
    }

    /// Copy a local archive into the cache, hashing as it goes
    pub fn import_local(&self, source: &Path) -> io::Result<ArtifactRecord> {
        let mut input = File::open(source)?;
        let staged = self.staging_path();

        let result = (|| {
            let mut output = File::create(&staged)?;
            let mut hasher = Sha256::new();
            let mut buf = vec![0u8; COPY_CHUNK];
            let mut total = 0u64;
            loop {
                let n = input.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                output.write_all(&buf[..n])?;
                total += n as u64;
            }
            output.sync_all()?;
            Ok::<_, io::Error>((hex::encode(hasher.finalize()), total))
        })();

        match result {
            Ok((sha256, total)) => self.commit(&staged, &sha256, total, ArtifactOrigin::Local),
            Err(e) => {
                let _ = fs::remove_file(&staged);
                Err(e)
            }
        }
    }

    /// Take a reference on a cached artifact
    pub fn retain(&self, sha256: &str) -> io::Result<()> {
        if !self.archive_path(sha256).is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("artifact {} is not cached", sha256),
            ));
        }
        let mut refs = self.refs.lock().unwrap_or_else(PoisonError::into_inner);
        *refs.entry(sha256.to_string()).or_insert(0) += 1;
        Ok(())
    }

    /// Re-establish references held by persisted plugins
    pub fn restore_refs<'a>(&self, hashes: impl IntoIterator<Item = &'a str>) {
        let mut refs = self.refs.lock().unwrap_or_else(PoisonError::into_inner);
        for sha256 in hashes {
            *refs.entry(sha256.to_string()).or_insert(0) += 1;
        }
    }

    pub fn ref_count(&self, sha256: &str) -> usize {
        let refs = self.refs.lock().unwrap_or_else(PoisonError::into_inner);
        refs.get(sha256).copied().unwrap_or(0)
    }

    /// Drop one reference and evict the artifact when none remain.
    /// Returns true if the archive was removed.
    pub fn release(&self, sha256: &str) -> io::Result<bool> {
        let mut refs = self.refs.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = match refs.get_mut(sha256) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining > 0 {
            return Ok(false);
        }
        refs.remove(sha256);
        self.evict(sha256)
    }

    /// Remove an artifact nobody holds, e.g. one that failed validation
    pub fn collect_garbage(&self, sha256: &str) -> io::Result<bool> {
        let refs = self.refs.lock().unwrap_or_else(PoisonError::into_inner);
        if refs.get(sha256).is_some_and(|count| *count > 0) {
            return Ok(false);
        }
        self.evict(sha256)
    }

    // Callers hold the refs lock
    fn evict(&self, sha256: &str) -> io::Result<bool> {
        if !is_sha256_hex(sha256) {
            return Ok(false);
        }
        let archive = self.archive_path(sha256);
        let removed = match fs::remove_file(&archive) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };
        match fs::remove_file(self.sidecar_path(sha256)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        if removed {
            info!(sha256, "Evicted artifact");
        }
        Ok(removed)
    }
}
