use std::sync::Arc;

use anyhow::Result;
use bidmerge_adapters::{AdapterError, DatasetLoader, TableReader};
use bidmerge_core::{ArtifactFormat, ProfileId, ProfileSpec, RegistryError, SchemaRegistry};
use bidmerge_storage::{MergeLocks, RunDir, RunWorkspace, StoredArtifact, WorkspaceError};
use thiserror::Error;
use tracing::{info, info_span, Instrument};

use crate::bulk::{BulkLoader, DestinationStore, PgDestinationStore, StoreError};
use crate::config::MergeConfig;
use crate::consolidate::{consolidate, ConsolidationStats};
use crate::encode::encode;

/// Extensions reported by [`MergePipeline::list_artifacts`].
pub const LISTED_EXTENSIONS: &[&str] = &["xlsx", "csv"];

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("invalid run identifier `{0}`")]
    InvalidRunIdentifier(String),
    #[error("invalid file name `{0}`")]
    InvalidFileName(String),
    #[error("no files to merge for run {run_id} ({unreadable} unreadable)")]
    NoInputFiles { run_id: String, unreadable: usize },
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error("writing artifact {file}: {reason}")]
    ArtifactWriteFailure { file: String, reason: String },
    #[error("merging run {run_id} did not finish within {timeout_secs}s")]
    TimedOut { run_id: String, timeout_secs: u64 },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("workspace error: {0}")]
    Workspace(String),
}

impl From<WorkspaceError> for MergeError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::InvalidRunIdentifier(id) => MergeError::InvalidRunIdentifier(id),
            WorkspaceError::InvalidFileName(name) => MergeError::InvalidFileName(name),
            WorkspaceError::NotFound(name) => MergeError::NotFound(name),
            other @ WorkspaceError::Io { .. } => MergeError::Workspace(other.to_string()),
        }
    }
}

/// The caller-facing result of a merge. Nothing about the destination-store
/// load is reported here.
#[derive(Debug, Clone)]
pub struct MergedArtifact {
    pub run_id: String,
    pub profile: ProfileId,
    pub file_name: String,
    pub content_hash: String,
    pub bytes: Vec<u8>,
    /// True when served from an existing artifact without recomputation.
    pub cached: bool,
    /// Present only when the dataset was computed by this call.
    pub stats: Option<ConsolidationStats>,
}

impl MergedArtifact {
    fn from_stored(
        run: &RunDir,
        profile: ProfileId,
        stored: StoredArtifact,
        stats: Option<ConsolidationStats>,
    ) -> Self {
        Self {
            run_id: run.run_id().to_string(),
            profile,
            file_name: stored.file_name,
            content_hash: stored.content_hash,
            bytes: stored.bytes,
            cached: stored.cached,
            stats,
        }
    }
}

pub struct MergePipeline {
    config: MergeConfig,
    registry: SchemaRegistry,
    workspace: RunWorkspace,
    loader: DatasetLoader,
    bulk: BulkLoader,
    locks: MergeLocks,
}

impl MergePipeline {
    pub fn new(config: MergeConfig) -> Result<Self> {
        let registry = config.load_registry()?;
        let workspace = RunWorkspace::new(config.outputs_dir.clone());
        let bulk = match &config.database_url {
            Some(url) => BulkLoader::new(
                Arc::new(PgDestinationStore::new(url.clone(), config.db_timeout())),
                config.db_timeout(),
            ),
            None => BulkLoader::disabled(),
        };
        Ok(Self {
            config,
            registry,
            workspace,
            loader: DatasetLoader::xlsx(),
            bulk,
            locks: MergeLocks::new(),
        })
    }

    pub fn with_reader(mut self, reader: Arc<dyn TableReader>) -> Self {
        self.loader = DatasetLoader::new(reader);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn DestinationStore>) -> Self {
        self.bulk = BulkLoader::new(store, self.config.db_timeout());
        self
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Return the run's CSV artifact for `profile`, producing it (and loading
    /// the destination store) only if it does not exist yet.
    pub async fn merge_or_fetch(
        &self,
        run_id: &str,
        profile: ProfileId,
    ) -> Result<MergedArtifact, MergeError> {
        let run = self.workspace.resolve(run_id).await?;
        self.produce(&run, profile, ArtifactFormat::Csv, true).await
    }

    /// Write-once tender-bid workbook; never touches the destination store.
    pub async fn merge_workbook(&self, run_id: &str) -> Result<MergedArtifact, MergeError> {
        let run = self.workspace.resolve(run_id).await?;
        self.produce(&run, ProfileId::TenderBid, ArtifactFormat::Xlsx, false)
            .await
    }

    pub async fn list_artifacts(&self, run_id: &str) -> Result<Vec<String>, MergeError> {
        let run = self.workspace.resolve(run_id).await?;
        run.list_files(LISTED_EXTENSIONS).await.map_err(MergeError::from)
    }

    pub async fn read_file(&self, run_id: &str, file_name: &str) -> Result<Vec<u8>, MergeError> {
        let run = self.workspace.resolve(run_id).await?;
        run.read_file(file_name).await.map_err(MergeError::from)
    }

    pub async fn delete_file(&self, run_id: &str, file_name: &str) -> Result<(), MergeError> {
        let run = self.workspace.resolve(run_id).await?;
        run.delete_file(file_name).await.map_err(MergeError::from)
    }

    /// Create every destination table without merging anything.
    pub async fn provision_tables(&self) -> Result<usize, StoreError> {
        self.bulk.provision(&self.registry).await
    }

    /// Every artifact name this system can produce for `run_id`; never read
    /// back as source input.
    fn artifact_names(&self, run_id: &str) -> Vec<String> {
        self.registry
            .profiles
            .iter()
            .flat_map(|p| {
                [ArtifactFormat::Csv, ArtifactFormat::Xlsx]
                    .into_iter()
                    .map(move |format| p.artifact_file_name(run_id, format))
            })
            .collect()
    }

    async fn cached(
        &self,
        run: &RunDir,
        profile: ProfileId,
        file_name: &str,
    ) -> Result<Option<MergedArtifact>, MergeError> {
        let stored = run
            .artifacts()
            .load(file_name)
            .await
            .map_err(|e| MergeError::Workspace(format!("{e:#}")))?;
        Ok(stored.map(|s| {
            info!(run_id = %run.run_id(), file = %s.file_name, "serving cached artifact");
            MergedArtifact::from_stored(run, profile, s, None)
        }))
    }

    async fn produce(
        &self,
        run: &RunDir,
        profile_id: ProfileId,
        format: ArtifactFormat,
        load_store: bool,
    ) -> Result<MergedArtifact, MergeError> {
        let profile = self.registry.get(profile_id)?.clone();
        let file_name = profile.artifact_file_name(run.run_id(), format);

        if let Some(hit) = self.cached(run, profile_id, &file_name).await? {
            return Ok(hit);
        }

        let _guard = self
            .locks
            .acquire(&format!("{}/{}", run.run_id(), file_name))
            .await;
        // Another request may have published while we waited.
        if let Some(hit) = self.cached(run, profile_id, &file_name).await? {
            return Ok(hit);
        }

        let span = info_span!("merge", run_id = %run.run_id(), profile = %profile_id, file = %file_name);
        self.compute(run, profile, file_name, format, load_store)
            .instrument(span)
            .await
    }

    async fn compute(
        &self,
        run: &RunDir,
        profile: ProfileSpec,
        file_name: String,
        format: ArtifactFormat,
        load_store: bool,
    ) -> Result<MergedArtifact, MergeError> {
        let loader = self.loader.clone();
        let dir = run.path().to_path_buf();
        let exclude = self.artifact_names(run.run_id());
        let task_profile = profile.clone();
        let task = tokio::task::spawn_blocking(move || {
            let report = loader.load(&dir, &exclude)?;
            let (dataset, mut stats) = consolidate(&report.tables, &task_profile);
            stats.files_failed = report.failures.len();
            Ok::<_, AdapterError>((dataset, stats))
        });

        let joined = tokio::time::timeout(self.config.io_timeout(), task)
            .await
            .map_err(|_| MergeError::TimedOut {
                run_id: run.run_id().to_string(),
                timeout_secs: self.config.io_timeout().as_secs(),
            })?;
        let loaded = joined.map_err(|e| MergeError::Workspace(format!("merge task failed: {e}")))?;
        let (dataset, stats) = loaded.map_err(|err| match err {
            AdapterError::NoInputFiles { failed } => MergeError::NoInputFiles {
                run_id: run.run_id().to_string(),
                unreadable: failed,
            },
            other => MergeError::Workspace(other.to_string()),
        })?;

        info!(
            files_read = stats.files_read,
            files_failed = stats.files_failed,
            rows_in = stats.rows_in,
            rows_out = stats.rows_out,
            headers_dropped = stats.headers_dropped,
            empty_rows_dropped = stats.dropped_by("empty_rows"),
            duplicate_rows_dropped = stats.dropped_by("duplicate_rows"),
            "consolidated run"
        );

        let bytes = encode(&dataset, format).map_err(|e| MergeError::ArtifactWriteFailure {
            file: file_name.clone(),
            reason: e.to_string(),
        })?;
        let stored = run
            .artifacts()
            .store_once(&file_name, &bytes)
            .await
            .map_err(|e| MergeError::ArtifactWriteFailure {
                file: file_name.clone(),
                reason: format!("{e:#}"),
            })?;
        info!(
            bytes = stored.byte_size(),
            sha256 = %stored.content_hash,
            cached = stored.cached,
            "artifact ready"
        );

        if load_store && !stored.cached {
            // Outcome is logged by the loader and never reaches the caller.
            self.bulk.load(&profile, &dataset).await;
        }

        Ok(MergedArtifact::from_stored(run, profile.id, stored, Some(stats)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn artifact_names_cover_both_profiles_and_formats() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = MergePipeline::new(MergeConfig::with_outputs_dir(dir.path())).unwrap();
        let names = pipeline.artifact_names("r9");
        assert_eq!(
            names,
            vec![
                "merged_data_r9.csv",
                "merged_data_r9.xlsx",
                "ireps_merged_data_r9.csv",
                "ireps_merged_data_r9.xlsx",
            ]
        );
    }

    #[tokio::test]
    async fn invalid_run_id_is_surfaced_before_any_io() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = MergePipeline::new(MergeConfig::with_outputs_dir(dir.path().join("gem"))).unwrap();
        let err = pipeline
            .merge_or_fetch("../etc", ProfileId::TenderBid)
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::InvalidRunIdentifier(_)));
        assert!(!dir.path().join("gem").exists());
    }
}
