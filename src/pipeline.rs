use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::address::{AddressNormalizer, CanonicalAddress};
use crate::bounds::BoundsValidator;
use crate::cache::GeocodeCache;
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::geocoder::{FailureKind, Geocoder, GeocodeResult, ResolutionOutcome, SkipReason};
use crate::journal::DiagnosticsJournal;
use crate::store::{RecordId, RecordStore};

pub const NO_ADDRESS_REASON: &str = "no address information";

#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub inter_call_delay: Duration,
    pub rate_limit_cooldown: Duration,
}

impl Pacing {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            inter_call_delay: config.inter_call_delay(),
            rate_limit_cooldown: config.rate_limit_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Cache,
    Network,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordResolution {
    pub record_id: RecordId,
    pub outcome: ResolutionOutcome,
    pub source: Option<ResolutionSource>,
}

impl RecordResolution {
    fn new(record_id: RecordId, outcome: ResolutionOutcome, source: Option<ResolutionSource>) -> Self {
        Self {
            record_id,
            outcome,
            source,
        }
    }

    pub fn made_network_call(&self) -> bool {
        self.source == Some(ResolutionSource::Network)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordFailure {
    pub record_id: RecordId,
    pub kind: FailureKind,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchRunStats {
    pub processed: usize,
    pub resolved: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cache_hits: usize,
    pub network_calls: usize,
    pub suspicious: usize,
    pub has_more: bool,
    pub failures: Vec<RecordFailure>,
}

impl BatchRunStats {
    fn absorb(&mut self, resolution: &RecordResolution) {
        self.processed += 1;
        match resolution.source {
            Some(ResolutionSource::Cache) => self.cache_hits += 1,
            Some(ResolutionSource::Network) => self.network_calls += 1,
            None => {}
        }
        match &resolution.outcome {
            ResolutionOutcome::Resolved(result) => {
                self.resolved += 1;
                if result.suspicious {
                    self.suspicious += 1;
                }
            }
            ResolutionOutcome::Skipped(_) => self.skipped += 1,
            ResolutionOutcome::Failed { kind, detail } => {
                self.failed += 1;
                self.failures.push(RecordFailure {
                    record_id: resolution.record_id,
                    kind: *kind,
                    detail: detail.clone(),
                });
            }
        }
    }

    pub fn merge(&mut self, other: BatchRunStats) {
        self.processed += other.processed;
        self.resolved += other.resolved;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.cache_hits += other.cache_hits;
        self.network_calls += other.network_calls;
        self.suspicious += other.suspicious;
        self.has_more = other.has_more;
        self.failures.extend(other.failures);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RevalidationSummary {
    pub checked: usize,
    pub suspicious: usize,
    pub changed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolveMode {
    Backlog,
    Refresh,
}

pub struct GeocodePipeline {
    store: Arc<dyn RecordStore>,
    cache: GeocodeCache,
    geocoder: Arc<dyn Geocoder>,
    normalizer: AddressNormalizer,
    bounds: BoundsValidator,
    pacing: Pacing,
    journal: DiagnosticsJournal,
    guard: AsyncMutex<()>,
}

impl GeocodePipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cache: GeocodeCache,
        geocoder: Arc<dyn Geocoder>,
        normalizer: AddressNormalizer,
        bounds: BoundsValidator,
        pacing: Pacing,
        journal: DiagnosticsJournal,
    ) -> Self {
        Self {
            store,
            cache,
            geocoder,
            normalizer,
            bounds,
            pacing,
            journal,
            guard: AsyncMutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn cache(&self) -> &GeocodeCache {
        &self.cache
    }

    pub fn backlog_size(&self) -> AppResult<usize> {
        self.store.backlog_size()
    }

    pub async fn step_batch(&self, max_size: usize) -> AppResult<BatchRunStats> {
        let _lock = self.guard.lock().await;
        let ids = self.store.list_needing_geocode(max_size.max(1))?;
        let total = ids.len();
        let mut stats = BatchRunStats::default();

        for (index, id) in ids.into_iter().enumerate() {
            let resolution = match self.resolve_record(id, ResolveMode::Backlog).await {
                Ok(resolution) => resolution,
                Err(err) => {
                    warn!(target: "geocode_batch", ?err, record_id = id, "failed to resolve record");
                    RecordResolution::new(
                        id,
                        ResolutionOutcome::transient(format!("storage error: {err}")),
                        None,
                    )
                }
            };
            stats.absorb(&resolution);

            if resolution.outcome.is_rate_limited() {
                debug!(target: "geocode_batch", cooldown = ?self.pacing.rate_limit_cooldown, "backing off after rate limit");
                sleep(self.pacing.rate_limit_cooldown).await;
            }
            if resolution.made_network_call() && index + 1 < total {
                sleep(self.pacing.inter_call_delay).await;
            }
        }

        stats.has_more = self.store.backlog_size()? > 0;
        info!(
            target: "geocode_batch",
            processed = stats.processed,
            resolved = stats.resolved,
            failed = stats.failed,
            skipped = stats.skipped,
            cache_hits = stats.cache_hits,
            has_more = stats.has_more,
            "geocode batch finished"
        );
        self.journal_event(
            "batch_completed",
            json!({
                "processed": stats.processed,
                "resolved": stats.resolved,
                "failed": stats.failed,
                "skipped": stats.skipped,
                "cache_hits": stats.cache_hits,
                "network_calls": stats.network_calls,
                "has_more": stats.has_more,
            }),
        );
        Ok(stats)
    }

    /// Re-resolves only if the canonical address differs from the one last geocoded.
    pub async fn resolve_one(&self, id: RecordId) -> AppResult<RecordResolution> {
        let _lock = self.guard.lock().await;
        self.resolve_record(id, ResolveMode::Refresh).await
    }

    pub fn revalidate_all(&self) -> AppResult<RevalidationSummary> {
        let mut summary = RevalidationSummary {
            checked: 0,
            suspicious: 0,
            changed: 0,
        };
        for record in self.store.list_geocoded()? {
            summary.checked += 1;
            let suspicious = self.bounds.is_suspicious(record.latitude, record.longitude);
            if suspicious {
                summary.suspicious += 1;
            }
            if suspicious != record.suspicious {
                self.store.set_suspicious(record.id, suspicious)?;
                summary.changed += 1;
            }
        }
        info!(
            target: "geocode_batch",
            checked = summary.checked,
            suspicious = summary.suspicious,
            changed = summary.changed,
            "bounds revalidation finished"
        );
        self.journal_event(
            "revalidation_completed",
            json!({
                "checked": summary.checked,
                "suspicious": summary.suspicious,
                "changed": summary.changed,
            }),
        );
        Ok(summary)
    }

    async fn resolve_record(&self, id: RecordId, mode: ResolveMode) -> AppResult<RecordResolution> {
        let stored = self.store.stored_coordinates(id)?;
        if mode == ResolveMode::Backlog && stored.is_some() {
            return Ok(RecordResolution::new(
                id,
                ResolutionOutcome::Skipped(SkipReason::AlreadyGeocoded),
                None,
            ));
        }

        let Some(fields) = self.store.address_fields(id)? else {
            return Ok(self.fail(id, ResolutionOutcome::permanent("record no longer exists"), None));
        };
        let Some(address) = self.normalizer.normalize(&fields) else {
            return Ok(self.fail(id, ResolutionOutcome::permanent(NO_ADDRESS_REASON), None));
        };

        if let Some(previous) = stored.as_ref().and_then(|s| s.geocoded_address.as_deref()) {
            if address.matches(previous) {
                return Ok(RecordResolution::new(
                    id,
                    ResolutionOutcome::Skipped(SkipReason::UpToDate),
                    None,
                ));
            }
        }

        if let Some(result) = self.cache.get(&address)? {
            self.persist(id, &address, &result)?;
            debug!(target: "geocode_batch", record_id = id, %address, "resolved from cache");
            return Ok(RecordResolution::new(
                id,
                ResolutionOutcome::Resolved(result),
                Some(ResolutionSource::Cache),
            ));
        }

        let outcome = self.geocoder.resolve(&address).await;
        let source = Some(ResolutionSource::Network);
        match outcome {
            ResolutionOutcome::Resolved(result) => {
                let stored = self
                    .cache
                    .put(&address, &result)
                    .and_then(|_| self.persist(id, &address, &result));
                if let Err(err) = stored {
                    warn!(target: "geocode_batch", ?err, record_id = id, "failed to store resolved coordinates");
                    let outcome = ResolutionOutcome::transient(format!("storage error: {err}"));
                    return Ok(self.fail(id, outcome, source));
                }
                if result.suspicious {
                    info!(
                        target: "geocode_batch",
                        record_id = id,
                        %address,
                        latitude = result.latitude,
                        longitude = result.longitude,
                        "resolved coordinates fall outside the target region"
                    );
                }
                Ok(RecordResolution::new(id, ResolutionOutcome::Resolved(result), source))
            }
            failed => Ok(self.fail(id, failed, source)),
        }
    }

    fn persist(&self, id: RecordId, address: &CanonicalAddress, result: &GeocodeResult) -> AppResult<()> {
        self.store.set_coordinates(
            id,
            result.latitude,
            result.longitude,
            address.as_str(),
            result.suspicious,
        )
    }

    fn fail(
        &self,
        id: RecordId,
        outcome: ResolutionOutcome,
        source: Option<ResolutionSource>,
    ) -> RecordResolution {
        if let ResolutionOutcome::Failed { kind, detail } = &outcome {
            warn!(target: "geocode_batch", record_id = id, ?kind, %detail, "record not geocoded");
            if let Err(err) = self.store.record_failure(id, detail) {
                warn!(target: "geocode_batch", ?err, record_id = id, "failed to note geocode failure");
            }
            self.journal_event(
                "record_failed",
                json!({ "record_id": id, "kind": kind, "detail": detail }),
            );
        }
        RecordResolution::new(id, outcome, source)
    }

    fn journal_event(&self, name: &str, payload: serde_json::Value) {
        if let Err(err) = self.journal.record(name, payload) {
            warn!(?err, event = name, "failed to journal geocode event");
        }
    }
}
