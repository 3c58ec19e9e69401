use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use reach_core::canon::{is_hex_digest, sha256_hex};
use reach_core::error::{ReachError, Result};
use reach_core::types::Artifact;

/// Content-addressed blob store on the local filesystem.
///
/// Objects live at `<root>/objects/<first two hex chars>/<rest>`. Writes go
/// to `<root>/tmp` first and are renamed into place, so a reader never sees
/// a partial object.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("tmp"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, cid: &str) -> Result<PathBuf> {
        if !is_hex_digest(cid) {
            return Err(ReachError::InvalidInput(format!("not a content id: {}", cid)));
        }
        let (prefix, rest) = cid.split_at(2);
        Ok(self.root.join("objects").join(prefix).join(rest))
    }

    /// Store `bytes` and return their content id. Storing the same bytes
    /// twice is a no-op.
    pub fn put(&self, bytes: &[u8]) -> Result<String> {
        let cid = sha256_hex(bytes);
        let path = self.object_path(&cid)?;
        if path.exists() {
            debug!(cid = %cid, "Object already present");
            return Ok(cid);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self
            .root
            .join("tmp")
            .join(uuid::Uuid::new_v4().to_string());
        write_atomic(&tmp, &path, bytes)
            .map_err(|e| ReachError::Storage(format!("commit {}: {}", cid, e)))?;
        debug!(cid = %cid, size = bytes.len(), "Object stored");
        Ok(cid)
    }

    /// Fetch an object, re-hashing it on the way out.
    pub fn get(&self, cid: &str) -> Result<Vec<u8>> {
        let path = self.object_path(cid)?;
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ReachError::CasNotFound(cid.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let actual = sha256_hex(&bytes);
        if actual != cid {
            error!(cid = %cid, actual = %actual, "CAS object failed integrity check");
            return Err(ReachError::CasIntegrity {
                cid: cid.to_string(),
                actual,
            });
        }
        Ok(bytes)
    }

    pub fn contains(&self, cid: &str) -> bool {
        self.object_path(cid).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Store an artifact's content, checking it against its declared hash.
    pub fn put_artifact(&self, artifact: &Artifact) -> Result<String> {
        let cid = self.put(&artifact.content)?;
        if cid != artifact.hash {
            return Err(ReachError::CasIntegrity {
                cid: artifact.hash.clone(),
                actual: cid,
            });
        }
        Ok(cid)
    }

    pub fn get_artifact(&self, id: &str, cid: &str) -> Result<Artifact> {
        Ok(Artifact::new(id, self.get(cid)?))
    }
}

/// Write `bytes` to `tmp`, sync, and rename over `path`. `tmp` is gone
/// afterwards whether or not this succeeds.
fn write_atomic(tmp: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let written = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(tmp, path)
    })();
    if written.is_err() {
        let _ = fs::remove_file(tmp);
    }
    written
}
