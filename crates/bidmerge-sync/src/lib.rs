//! Merge pipeline: consolidate a run's spreadsheets into one canonical
//! artifact and a best-effort copy in the destination store.

pub mod bulk;
pub mod config;
pub mod consolidate;
pub mod encode;
pub mod pipeline;

use anyhow::Result;
use bidmerge_core::ProfileId;

pub use bulk::{create_table_sql, BulkLoader, DestinationStore, LoadOutcome, PgDestinationStore, StoreError};
pub use config::MergeConfig;
pub use consolidate::{consolidate, cleanup_rules, ConsolidationStats, RowCleanup};
pub use encode::{encode, encode_csv, encode_xlsx, EncodeError};
pub use pipeline::{MergeError, MergePipeline, MergedArtifact};

pub const CRATE_NAME: &str = "bidmerge-sync";

pub async fn merge_once_from_env(run_id: &str, profile: ProfileId) -> Result<MergedArtifact> {
    let pipeline = MergePipeline::new(MergeConfig::from_env())?;
    Ok(pipeline.merge_or_fetch(run_id, profile).await?)
}
