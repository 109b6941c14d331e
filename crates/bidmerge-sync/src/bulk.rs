use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bidmerge_core::{CellValue, ConsolidatedDataset, ProfileSpec, SchemaRegistry};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

// 16 binds per gem_data row keeps a batch well under the 65535 bind limit.
const INSERT_BATCH_ROWS: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to destination store: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("destination store query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("destination store did not answer within {0:?}")]
    Timeout(Duration),
}

/// The relational copy of consolidated datasets.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Create the profile's table if it is absent. Never alters an existing one.
    async fn ensure_table(&self, profile: &ProfileSpec) -> Result<(), StoreError>;

    /// Append every row; returns the number of rows inserted.
    async fn insert_rows(
        &self,
        profile: &ProfileSpec,
        dataset: &ConsolidatedDataset,
    ) -> Result<u64, StoreError>;
}

pub fn create_table_sql(profile: &ProfileSpec) -> String {
    let columns = profile
        .fields
        .iter()
        .map(|field| format!("    \"{field}\" TEXT"))
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" (\n    id BIGSERIAL PRIMARY KEY,\n{columns},\n    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()\n)",
        profile.table
    )
}

fn insert_prefix(profile: &ProfileSpec) -> String {
    let columns = profile
        .fields
        .iter()
        .map(|field| format!("\"{field}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO \"{}\" ({columns}) ", profile.table)
}

/// Postgres store with a lazily created pool.
///
/// A failed connect leaves the pool unset so the next load tries again.
pub struct PgDestinationStore {
    database_url: String,
    timeout: Duration,
    pool: OnceCell<PgPool>,
}

impl PgDestinationStore {
    pub fn new(database_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            database_url: database_url.into(),
            timeout,
            pool: OnceCell::new(),
        }
    }

    async fn pool(&self) -> Result<&PgPool, StoreError> {
        self.pool
            .get_or_try_init(|| async {
                PgPoolOptions::new()
                    .max_connections(5)
                    .acquire_timeout(self.timeout)
                    .connect(&self.database_url)
                    .await
                    .map_err(StoreError::Connect)
            })
            .await
    }
}

#[async_trait]
impl DestinationStore for PgDestinationStore {
    async fn ensure_table(&self, profile: &ProfileSpec) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        sqlx::query(&create_table_sql(profile)).execute(pool).await?;
        Ok(())
    }

    async fn insert_rows(
        &self,
        profile: &ProfileSpec,
        dataset: &ConsolidatedDataset,
    ) -> Result<u64, StoreError> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await?;
        let mut inserted = 0u64;

        for chunk in dataset.rows.chunks(INSERT_BATCH_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(insert_prefix(profile));
            builder.push_values(chunk, |mut values, row| {
                for cell in row.values() {
                    values.push_bind(cell.as_ref().map(CellValue::render));
                }
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadOutcome {
    /// No destination store configured.
    Disabled,
    /// Nothing to insert.
    Skipped,
    Inserted { table: String, rows: u64 },
    Failed { table: String, reason: String },
}

/// Best-effort loader: every failure is logged and returned as
/// [`LoadOutcome::Failed`], never as an error.
#[derive(Clone)]
pub struct BulkLoader {
    store: Option<Arc<dyn DestinationStore>>,
    deadline: Duration,
}

impl BulkLoader {
    pub fn new(store: Arc<dyn DestinationStore>, deadline: Duration) -> Self {
        Self {
            store: Some(store),
            deadline,
        }
    }

    pub fn disabled() -> Self {
        Self {
            store: None,
            deadline: Duration::from_secs(10),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub async fn load(&self, profile: &ProfileSpec, dataset: &ConsolidatedDataset) -> LoadOutcome {
        let Some(store) = &self.store else {
            debug!(profile = %profile.id, "no destination store configured; skipping load");
            return LoadOutcome::Disabled;
        };
        if dataset.is_empty() {
            return LoadOutcome::Skipped;
        }

        let attempt = async {
            store.ensure_table(profile).await?;
            store.insert_rows(profile, dataset).await
        };
        let result = match tokio::time::timeout(self.deadline, attempt).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.deadline)),
        };

        match result {
            Ok(rows) => {
                info!(table = %profile.table, rows, "inserted merged rows into destination store");
                LoadOutcome::Inserted {
                    table: profile.table.clone(),
                    rows,
                }
            }
            Err(err) => {
                error!(table = %profile.table, error = %err, "destination store load failed");
                LoadOutcome::Failed {
                    table: profile.table.clone(),
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Create every registered table; used by provisioning, not by merges.
    pub async fn provision(&self, registry: &SchemaRegistry) -> Result<usize, StoreError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        for profile in &registry.profiles {
            tokio::time::timeout(self.deadline, store.ensure_table(profile))
                .await
                .map_err(|_| StoreError::Timeout(self.deadline))??;
            info!(table = %profile.table, "destination table ready");
        }
        Ok(registry.profiles.len())
    }
}
