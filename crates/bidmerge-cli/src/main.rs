use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bidmerge_core::ProfileId;
use bidmerge_sync::{MergeConfig, MergePipeline, MergedArtifact};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bidmerge-cli")]
#[command(about = "Merge a run's tender spreadsheets into one canonical artifact")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Produce (or fetch) the run's CSV artifact and load the destination store.
    Merge {
        run_id: String,
        #[arg(long, default_value = "tender-bid")]
        profile: ProfileId,
        /// Also copy the artifact bytes to this path.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Produce (or fetch) the tender-bid workbook.
    Workbook { run_id: String },
    /// List spreadsheet and CSV files in a run directory.
    List { run_id: String },
    /// Delete one file from a run directory.
    Delete { run_id: String, filename: String },
    /// Create the destination tables.
    Migrate,
    /// Run the HTTP API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn report(artifact: &MergedArtifact) {
    println!(
        "merge complete: run_id={} profile={} file={} bytes={} sha256={} cached={}",
        artifact.run_id,
        artifact.profile,
        artifact.file_name,
        artifact.bytes.len(),
        artifact.content_hash,
        artifact.cached
    );
    if let Some(stats) = &artifact.stats {
        println!(
            "  files_read={} files_failed={} rows_in={} rows_out={} headers_dropped={}",
            stats.files_read, stats.files_failed, stats.rows_in, stats.rows_out, stats.headers_dropped
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = MergeConfig::from_env();
    let web_port = config.web_port;
    let pipeline = MergePipeline::new(config)?;

    match cli.command {
        Commands::Merge {
            run_id,
            profile,
            out,
        } => {
            let artifact = pipeline.merge_or_fetch(&run_id, profile).await?;
            report(&artifact);
            if let Some(path) = out {
                tokio::fs::write(&path, &artifact.bytes)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?;
                info!(path = %path.display(), "copied artifact");
            }
        }
        Commands::Workbook { run_id } => {
            let artifact = pipeline.merge_workbook(&run_id).await?;
            report(&artifact);
        }
        Commands::List { run_id } => {
            for name in pipeline.list_artifacts(&run_id).await? {
                println!("{name}");
            }
        }
        Commands::Delete { run_id, filename } => {
            pipeline.delete_file(&run_id, &filename).await?;
            println!("deleted {filename} from {run_id}");
        }
        Commands::Migrate => {
            let tables = pipeline.provision_tables().await?;
            if tables == 0 {
                eprintln!("DATABASE_URL is not set; nothing to migrate");
            } else {
                println!("migrate complete: tables={tables}");
            }
        }
        Commands::Serve { port } => {
            bidmerge_web::serve(Arc::new(pipeline), port.unwrap_or(web_port)).await?;
        }
    }

    Ok(())
}
