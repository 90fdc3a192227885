pub mod address;
pub mod bounds;
pub mod cache;
pub mod commands;
pub mod config;
pub mod db;
pub mod errors;
pub mod geocoder;
pub mod journal;
pub mod pipeline;
pub mod queue;
pub mod report;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::address::{AddressNormalizer, RegionProfile};
use crate::bounds::BoundsValidator;
use crate::cache::GeocodeCache;
use crate::commands::AppStatus;
use crate::db::{bootstrap, DatabaseContext};
use crate::geocoder::{GeocodeClient, GeocodeClientSettings, Geocoder};
use crate::journal::DiagnosticsJournal;
use crate::pipeline::{GeocodePipeline, Pacing, RecordResolution};
use crate::queue::{QueueSettings, QueueState, Scheduler, TokioScheduler};
use crate::store::{RecordId, SqliteFlagStore, SqliteRecordStore};

pub use crate::config::AppConfig;
pub use crate::errors::{AppError, AppResult};
pub use crate::pipeline::{BatchRunStats, RevalidationSummary};
pub use crate::queue::BackgroundQueue;
pub use crate::report::SuspiciousRecord;

/// Everything wired from one [`AppConfig`]: sqlite stores, cache, provider
/// client, pipeline and background queue.
pub struct GeocoderApp {
    config: AppConfig,
    db_path: PathBuf,
    store: Arc<SqliteRecordStore>,
    cache: GeocodeCache,
    pipeline: Arc<GeocodePipeline>,
    queue: BackgroundQueue,
    journal: DiagnosticsJournal,
}

impl GeocoderApp {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        let bounds = BoundsValidator::new(config.bounds);
        let client = GeocodeClient::new(GeocodeClientSettings::from_config(&config), bounds)?;
        Self::with_components(config, Arc::new(client), Arc::new(TokioScheduler))
    }

    /// Same wiring as [`GeocoderApp::initialize`] with the provider and
    /// scheduler supplied by the caller.
    pub fn with_components(
        config: AppConfig,
        geocoder: Arc<dyn Geocoder>,
        scheduler: Arc<dyn Scheduler>,
    ) -> AppResult<Self> {
        init_tracing();
        let DatabaseContext { connection, path } =
            bootstrap(&config.data_dir, &config.database_file_name)?;
        let db = Arc::new(parking_lot::Mutex::new(connection));
        let journal = DiagnosticsJournal::new(&config.data_dir, &config)?;

        let store = Arc::new(SqliteRecordStore::new(Arc::clone(&db)));
        let flags = Arc::new(SqliteFlagStore::new(Arc::clone(&db)));
        let cache = GeocodeCache::new(Arc::clone(&db), config.cache_ttl());
        let pipeline = Arc::new(GeocodePipeline::new(
            store.clone(),
            cache.clone(),
            geocoder,
            AddressNormalizer::new(RegionProfile::from_config(&config)),
            BoundsValidator::new(config.bounds),
            Pacing::from_config(&config),
            journal.clone(),
        ));
        let queue = BackgroundQueue::new(
            Arc::clone(&pipeline),
            flags,
            scheduler,
            QueueSettings {
                batch_size: config.batch_size,
                interval: config.queue_interval(),
            },
            journal.clone(),
        );

        info!(
            db = %path.display(),
            endpoint = %config.geocoder_endpoint,
            region = %config.home_region,
            "geocoder initialized"
        );
        Ok(Self {
            config,
            db_path: path,
            store,
            cache,
            pipeline,
            queue,
            journal,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SqliteRecordStore> {
        &self.store
    }

    pub fn queue(&self) -> &BackgroundQueue {
        &self.queue
    }

    /// One bounded batch; `None` uses the configured batch size.
    pub async fn step_batch(&self, max_size: Option<usize>) -> AppResult<BatchRunStats> {
        let stats = self
            .pipeline
            .step_batch(max_size.unwrap_or(self.config.batch_size))
            .await?;
        self.flush_journal();
        Ok(stats)
    }

    pub async fn resolve_one(&self, id: RecordId) -> AppResult<RecordResolution> {
        self.pipeline.resolve_one(id).await
    }

    pub fn start_queue(&self) -> AppResult<QueueState> {
        self.queue.start()
    }

    pub fn stop_queue(&self) -> AppResult<QueueState> {
        let state = self.queue.stop()?;
        self.flush_journal();
        Ok(state)
    }

    pub fn resume_queue(&self) -> AppResult<bool> {
        self.queue.resume()
    }

    pub fn revalidate_all(&self) -> AppResult<RevalidationSummary> {
        let summary = self.pipeline.revalidate_all()?;
        self.flush_journal();
        Ok(summary)
    }

    pub fn suspicious_records(&self) -> AppResult<Vec<SuspiciousRecord>> {
        report::suspicious_records(self.store.as_ref())
    }

    pub fn purge_cache(&self) -> AppResult<usize> {
        let removed = self.cache.purge_expired()?;
        info!(removed, "expired geocode cache entries purged");
        Ok(removed)
    }

    pub fn status(&self) -> AppResult<AppStatus> {
        Ok(AppStatus {
            db_path: self.db_path.to_string_lossy().to_string(),
            journal_path: self
                .journal
                .path()
                .map(|path| path.to_string_lossy().to_string()),
            journal_pending: self.journal.pending(),
            backlog: self.pipeline.backlog_size()?,
            cache_entries: self.cache.entry_count()?,
            queue: self.queue.state()?,
            config: self.config.public_profile(),
        })
    }

    pub fn flush_journal(&self) {
        if let Err(err) = self.journal.flush() {
            warn!(?err, "failed to flush diagnostics journal");
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,property_geocoder=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressFields;
    use crate::pipeline::tests::{resolved, ScriptedGeocoder};
    use tempfile::tempdir;

    fn open_app(dir: &std::path::Path, geocoder: Arc<ScriptedGeocoder>) -> GeocoderApp {
        let config = AppConfig {
            data_dir: dir.to_path_buf(),
            inter_call_delay_ms: 0,
            ..AppConfig::default()
        };
        GeocoderApp::with_components(config, geocoder, Arc::new(TokioScheduler)).unwrap()
    }

    #[tokio::test]
    async fn status_reflects_backlog_cache_and_queue() {
        let dir = tempdir().unwrap();
        let geocoder = Arc::new(ScriptedGeocoder::default());
        geocoder.answer("1 Main St, Boston, MA", resolved(42.36, -71.06));
        let app = open_app(dir.path(), geocoder);
        app.store()
            .insert_record(&AddressFields::new("1 Main St, Boston, MA"))
            .unwrap();
        app.store()
            .insert_record(&AddressFields::new(""))
            .unwrap();

        let status = app.status().unwrap();
        assert_eq!(status.backlog, 2);
        assert_eq!(status.cache_entries, 0);
        assert!(!status.queue.active);
        assert!(status.db_path.ends_with("property-geocoder.db"));

        let stats = app.step_batch(None).await.unwrap();
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.failed, 1);

        let status = app.status().unwrap();
        assert_eq!(status.backlog, 1);
        assert_eq!(status.cache_entries, 1);
        assert_eq!(status.journal_pending, 0);
        assert!(!status.config.has_geocoder_api_key);
    }

    #[tokio::test]
    async fn reopening_keeps_records_and_cache() {
        let dir = tempdir().unwrap();
        let geocoder = Arc::new(ScriptedGeocoder::default());
        geocoder.answer("1 Main St, Boston, MA", resolved(42.36, -71.06));
        {
            let app = open_app(dir.path(), geocoder.clone());
            app.store()
                .insert_record(&AddressFields::new("1 Main St, Boston, MA"))
                .unwrap();
            app.step_batch(None).await.unwrap();
        }

        let app = open_app(dir.path(), geocoder.clone());
        let id = app
            .store()
            .insert_record(&AddressFields::new("1 main st, boston, ma"))
            .unwrap();
        app.step_batch(None).await.unwrap();
        assert_eq!(geocoder.calls(), 1);
        assert!(app.suspicious_records().unwrap().is_empty());
        assert_eq!(app.purge_cache().unwrap(), 0);
        let resolution = app.resolve_one(id).await.unwrap();
        assert!(!resolution.made_network_call());
    }
}
