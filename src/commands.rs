use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::time::sleep;
use tracing::info;

use crate::config::PublicAppConfig;
use crate::errors::AppResult;
use crate::queue::QueueState;
use crate::report::write_suspicious_csv;
use crate::store::RecordId;
use crate::GeocoderApp;

const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
pub struct AppStatus {
    pub db_path: String,
    pub journal_path: Option<String>,
    pub journal_pending: usize,
    pub backlog: usize,
    pub cache_entries: usize,
    pub queue: QueueState,
    pub config: PublicAppConfig,
}

#[derive(Debug, Parser)]
#[command(name = "property-geocoder")]
#[command(about = "Resolve property addresses to coordinates", long_about = None)]
pub struct Cli {
    /// Override GEOCODER_DATA_DIR
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Resolve one bounded batch of the backlog
    Step {
        /// Records to process; defaults to GEOCODER_BATCH_SIZE
        #[arg(long)]
        max: Option<usize>,
    },
    /// Control the background queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Re-resolve one record if its address changed
    Resolve { id: RecordId },
    /// Re-apply the bounds check to every geocoded record
    Revalidate,
    /// List records flagged as outside the target region
    Suspicious {
        /// Write CSV to this path instead of JSON to stdout
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Print backlog, cache and queue status
    Status,
    /// Delete expired cache entries
    PurgeCache,
}

#[derive(Debug, Subcommand)]
pub enum QueueAction {
    /// Activate the queue and drive it until the backlog drains or it is stopped
    Start,
    /// Continue a queue left active by an earlier process
    Resume,
    /// Clear the persisted active flag
    Stop,
    /// Print the persisted queue state
    Status,
}

pub async fn dispatch(command: Commands, app: &GeocoderApp) -> AppResult<()> {
    match command {
        Commands::Step { max } => print_json(&app.step_batch(max).await?),
        Commands::Queue { action } => match action {
            QueueAction::Start => {
                app.start_queue()?;
                drive_queue(app).await?;
                print_json(&app.status()?)
            }
            QueueAction::Resume => {
                if app.resume_queue()? {
                    drive_queue(app).await?;
                } else {
                    info!("queue is not active; nothing to resume");
                }
                print_json(&app.status()?)
            }
            QueueAction::Stop => print_json(&app.stop_queue()?),
            QueueAction::Status => print_json(&app.queue().state()?),
        },
        Commands::Resolve { id } => print_json(&app.resolve_one(id).await?),
        Commands::Revalidate => print_json(&app.revalidate_all()?),
        Commands::Suspicious { csv } => {
            let records = app.suspicious_records()?;
            match csv {
                Some(path) => {
                    let rows = write_suspicious_csv(&records, File::create(&path)?)?;
                    info!(rows, path = %path.display(), "suspicious records exported");
                    Ok(())
                }
                None => print_json(&records),
            }
        }
        Commands::Status => print_json(&app.status()?),
        Commands::PurgeCache => print_json(&serde_json::json!({ "removed": app.purge_cache()? })),
    }
}

/// Keeps the process alive while the queue's scheduled ticks run.
async fn drive_queue(app: &GeocoderApp) -> AppResult<()> {
    while app.queue().state()?.active {
        sleep(QUEUE_POLL_INTERVAL).await;
    }
    app.flush_journal();
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> AppResult<()> {
    serde_json::to_writer_pretty(io::stdout().lock(), value)?;
    println!();
    Ok(())
}
