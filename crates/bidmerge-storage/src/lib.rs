//! Run workspaces, write-once artifact storage and merge locks for bidmerge.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidmerge-storage";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid run identifier `{0}`")]
    InvalidRunIdentifier(String),
    #[error("invalid file name `{0}`")]
    InvalidFileName(String),
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Reject anything that could escape the workspace root. No sanitizing.
pub fn validate_run_id(run_id: &str) -> Result<(), WorkspaceError> {
    if run_id.is_empty()
        || run_id == "."
        || run_id.contains("..")
        || run_id.contains('/')
        || run_id.contains('\\')
        || run_id.contains('\0')
    {
        return Err(WorkspaceError::InvalidRunIdentifier(run_id.to_string()));
    }
    Ok(())
}

fn validate_file_name(file_name: &str) -> Result<(), WorkspaceError> {
    if file_name.is_empty()
        || file_name == "."
        || file_name.contains("..")
        || file_name.contains('/')
        || file_name.contains('\\')
        || file_name.contains('\0')
    {
        return Err(WorkspaceError::InvalidFileName(file_name.to_string()));
    }
    Ok(())
}

/// Maps run identifiers onto directories below a fixed root.
#[derive(Debug, Clone)]
pub struct RunWorkspace {
    root: PathBuf,
}

impl RunWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate `run_id` and make sure its directory exists.
    pub async fn resolve(&self, run_id: &str) -> Result<RunDir, WorkspaceError> {
        validate_run_id(run_id)?;
        let path = self.root.join(run_id);
        fs::create_dir_all(&path)
            .await
            .map_err(|e| WorkspaceError::io(format!("creating {}", path.display()), e))?;
        Ok(RunDir {
            run_id: run_id.to_string(),
            path,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunDir {
    run_id: String,
    path: PathBuf,
}

impl RunDir {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn artifacts(&self) -> ArtifactStore {
        ArtifactStore::new(self.path.clone())
    }

    pub fn file_path(&self, file_name: &str) -> Result<PathBuf, WorkspaceError> {
        validate_file_name(file_name)?;
        Ok(self.path.join(file_name))
    }

    /// Regular files whose extension matches one of `extensions`
    /// (case-insensitive), sorted by name.
    pub async fn list_files(&self, extensions: &[&str]) -> Result<Vec<String>, WorkspaceError> {
        let mut entries = fs::read_dir(&self.path)
            .await
            .map_err(|e| WorkspaceError::io(format!("listing {}", self.path.display()), e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkspaceError::io(format!("listing {}", self.path.display()), e))?
        {
            let is_file = entry.file_type().await.map(|ft| ft.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if has_extension(&name, extensions) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn read_file(&self, file_name: &str) -> Result<Vec<u8>, WorkspaceError> {
        let path = self.file_path(file_name)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(WorkspaceError::NotFound(file_name.to_string()))
            }
            Err(err) => Err(WorkspaceError::io(format!("reading {}", path.display()), err)),
        }
    }

    pub async fn delete_file(&self, file_name: &str) -> Result<(), WorkspaceError> {
        let path = self.file_path(file_name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(run_id = %self.run_id, file = file_name, "deleted run file");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(WorkspaceError::NotFound(file_name.to_string()))
            }
            Err(err) => Err(WorkspaceError::io(format!("deleting {}", path.display()), err)),
        }
    }
}

pub fn has_extension(name: &str, extensions: &[&str]) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|want| ext.eq_ignore_ascii_case(want)))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub file_name: String,
    pub absolute_path: PathBuf,
    pub content_hash: String,
    pub bytes: Vec<u8>,
    /// True when the artifact already existed and nothing was written.
    pub cached: bool,
}

impl StoredArtifact {
    pub fn byte_size(&self) -> usize {
        self.bytes.len()
    }
}

/// Write-once artifact files inside one run directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Return the artifact if it has already been published.
    pub async fn load(&self, file_name: &str) -> anyhow::Result<Option<StoredArtifact>> {
        validate_file_name(file_name)?;
        let absolute_path = self.dir.join(file_name);
        match fs::read(&absolute_path).await {
            Ok(bytes) => Ok(Some(StoredArtifact {
                file_name: file_name.to_string(),
                content_hash: Self::sha256_hex(&bytes),
                absolute_path,
                bytes,
                cached: true,
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("reading artifact {}", absolute_path.display()))
            }
        }
    }

    /// Publish `bytes` under `file_name` unless an artifact is already there.
    ///
    /// The bytes go to a hidden temp file first and are hard-linked into place,
    /// so a reader never sees a partial artifact and an existing one is never
    /// replaced. On failure nothing visible is left behind.
    pub async fn store_once(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let absolute_path = self.dir.join(file_name);
        if let Some(existing) = self.load(file_name).await? {
            return Ok(existing);
        }

        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating artifact directory {}", self.dir.display()))?;

        let temp_path = self
            .dir
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let written = write_temp(&temp_path, bytes).await;
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        let published = fs::hard_link(&temp_path, &absolute_path).await;
        let _ = fs::remove_file(&temp_path).await;
        match published {
            Ok(()) => {
                let content_hash = Self::sha256_hex(bytes);
                debug!(file = file_name, bytes = bytes.len(), %content_hash, "published artifact");
                Ok(StoredArtifact {
                    file_name: file_name.to_string(),
                    absolute_path,
                    content_hash,
                    bytes: bytes.to_vec(),
                    cached: false,
                })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => self
                .load(file_name)
                .await?
                .with_context(|| format!("artifact {} vanished after publish race", absolute_path.display())),
            Err(err) => Err(err).with_context(|| {
                format!(
                    "publishing temp artifact {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            }),
        }
    }
}

async fn write_temp(temp_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp artifact file {}", temp_path.display()))?;
    Ok(())
}

/// In-process advisory locks keyed by artifact identity.
#[derive(Debug, Default)]
pub struct MergeLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MergeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries nobody holds or waits on are pruned here, so the map only
    /// tracks keys with a merge in flight.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
