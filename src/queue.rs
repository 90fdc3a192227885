use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::errors::AppResult;
use crate::journal::DiagnosticsJournal;
use crate::pipeline::{BatchRunStats, GeocodePipeline};
use crate::store::FlagStore;

pub const QUEUE_ACTIVE_FLAG: &str = "queue_active";

pub trait Scheduler: Send + Sync {
    fn schedule_once(&self, delay: Duration, task: BoxFuture<'static, ()>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            task.await;
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueState {
    pub active: bool,
    pub tick_pending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Inactive,
    Drained(BatchRunStats),
    Rescheduled(BatchRunStats),
    Stopped(BatchRunStats),
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub batch_size: usize,
    pub interval: Duration,
}

#[derive(Clone)]
pub struct BackgroundQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    pipeline: Arc<GeocodePipeline>,
    flags: Arc<dyn FlagStore>,
    scheduler: Arc<dyn Scheduler>,
    settings: QueueSettings,
    journal: DiagnosticsJournal,
    scheduled: AtomicBool,
}

impl BackgroundQueue {
    pub fn new(
        pipeline: Arc<GeocodePipeline>,
        flags: Arc<dyn FlagStore>,
        scheduler: Arc<dyn Scheduler>,
        settings: QueueSettings,
        journal: DiagnosticsJournal,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                pipeline,
                flags,
                scheduler,
                settings,
                journal,
                scheduled: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> AppResult<QueueState> {
        Ok(QueueState {
            active: self.is_active()?,
            tick_pending: self.inner.scheduled.load(Ordering::SeqCst),
        })
    }

    pub fn start(&self) -> AppResult<QueueState> {
        self.inner.flags.set_flag(QUEUE_ACTIVE_FLAG, true)?;
        info!(target: "geocode_queue", "background geocoding started");
        self.journal_event(
            "queue_started",
            json!({ "backlog": self.inner.pipeline.backlog_size()? }),
        );
        self.schedule_tick(Duration::ZERO);
        self.state()
    }

    /// Clears the active flag. A pending tick still fires but does nothing.
    pub fn stop(&self) -> AppResult<QueueState> {
        self.inner.flags.delete_flag(QUEUE_ACTIVE_FLAG)?;
        info!(target: "geocode_queue", "background geocoding stopped");
        self.journal_event("queue_stopped", json!({}));
        self.state()
    }

    pub fn resume(&self) -> AppResult<bool> {
        if !self.is_active()? {
            return Ok(false);
        }
        debug!(target: "geocode_queue", "resuming background geocoding");
        self.schedule_tick(Duration::ZERO);
        Ok(true)
    }

    /// One scheduler-driven step. Safe to call spuriously: it re-checks the
    /// active flag and the backlog before doing any work.
    pub fn tick(&self) -> BoxFuture<'static, AppResult<TickOutcome>> {
        let queue = self.clone();
        async move { queue.run_tick().await }.boxed()
    }

    async fn run_tick(&self) -> AppResult<TickOutcome> {
        if !self.is_active()? {
            debug!(target: "geocode_queue", "tick ignored; queue inactive");
            return Ok(TickOutcome::Inactive);
        }
        if self.inner.pipeline.backlog_size()? == 0 {
            self.go_idle(&BatchRunStats::default())?;
            return Ok(TickOutcome::Drained(BatchRunStats::default()));
        }

        let stats = match self.inner.pipeline.step_batch(self.inner.settings.batch_size).await {
            Ok(stats) => stats,
            Err(err) => {
                warn!(target: "geocode_queue", ?err, "batch failed; retrying next tick");
                if self.is_active()? {
                    self.schedule_tick(self.inner.settings.interval);
                }
                return Err(err);
            }
        };

        if !stats.has_more {
            self.go_idle(&stats)?;
            return Ok(TickOutcome::Drained(stats));
        }
        if !self.is_active()? {
            return Ok(TickOutcome::Stopped(stats));
        }
        self.schedule_tick(self.inner.settings.interval);
        Ok(TickOutcome::Rescheduled(stats))
    }

    fn go_idle(&self, stats: &BatchRunStats) -> AppResult<()> {
        self.inner.flags.delete_flag(QUEUE_ACTIVE_FLAG)?;
        info!(target: "geocode_queue", resolved = stats.resolved, "backlog drained; queue idle");
        self.journal_event("queue_drained", json!({ "resolved": stats.resolved }));
        Ok(())
    }

    fn schedule_tick(&self, delay: Duration) {
        if self.inner.scheduled.swap(true, Ordering::SeqCst) {
            debug!(target: "geocode_queue", "tick already pending");
            return;
        }
        let queue = self.clone();
        let task = async move {
            queue.inner.scheduled.store(false, Ordering::SeqCst);
            if let Err(err) = queue.tick().await {
                warn!(target: "geocode_queue", ?err, "scheduled tick failed");
            }
        }
        .boxed();
        self.inner.scheduler.schedule_once(delay, task);
    }

    fn is_active(&self) -> AppResult<bool> {
        Ok(self.inner.flags.get_flag(QUEUE_ACTIVE_FLAG)?.unwrap_or(false))
    }

    fn journal_event(&self, name: &str, payload: serde_json::Value) {
        if let Err(err) = self.inner.journal.record(name, payload) {
            warn!(?err, event = name, "failed to journal queue event");
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::address::AddressFields;
    use crate::db::open_in_memory;
    use crate::pipeline::tests::{harness, resolved, Harness};
    use crate::store::SqliteFlagStore;

    #[derive(Default)]
    struct ManualScheduler {
        pending: Mutex<Vec<(Duration, BoxFuture<'static, ()>)>>,
    }

    impl ManualScheduler {
        fn delays(&self) -> Vec<Duration> {
            self.pending.lock().iter().map(|(delay, _)| *delay).collect()
        }

        async fn run_next(&self) -> bool {
            let next = {
                let mut pending = self.pending.lock();
                if pending.is_empty() {
                    None
                } else {
                    Some(pending.remove(0))
                }
            };
            match next {
                Some((_, task)) => {
                    task.await;
                    true
                }
                None => false,
            }
        }
    }

    impl Scheduler for ManualScheduler {
        fn schedule_once(&self, delay: Duration, task: BoxFuture<'static, ()>) {
            self.pending.lock().push((delay, task));
        }
    }

    struct Fixture {
        harness: Harness,
        flags: Arc<SqliteFlagStore>,
        scheduler: Arc<ManualScheduler>,
        queue: BackgroundQueue,
    }

    fn fixture() -> Fixture {
        let harness = harness();
        let flags = Arc::new(SqliteFlagStore::new(open_in_memory().unwrap()));
        let scheduler = Arc::new(ManualScheduler::default());
        let queue = queue_for(&harness, flags.clone(), scheduler.clone());
        Fixture {
            harness,
            flags,
            scheduler,
            queue,
        }
    }

    fn queue_for(
        harness: &Harness,
        flags: Arc<SqliteFlagStore>,
        scheduler: Arc<ManualScheduler>,
    ) -> BackgroundQueue {
        BackgroundQueue::new(
            harness.pipeline.clone(),
            flags,
            scheduler,
            QueueSettings {
                batch_size: 2,
                interval: Duration::from_secs(15),
            },
            DiagnosticsJournal::disabled(),
        )
    }

    fn seed(harness: &Harness, count: usize) {
        for n in 1..=count {
            let address = format!("{n} Main St, Boston, MA");
            harness
                .store
                .insert_record(&AddressFields::new(address.as_str()))
                .unwrap();
            harness.geocoder.answer(&address, resolved(42.3, -71.0));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_persists_flag_and_schedules_one_tick() {
        let f = fixture();
        let state = f.queue.start().unwrap();
        assert!(state.active);
        assert!(state.tick_pending);
        assert_eq!(f.flags.get_flag(QUEUE_ACTIVE_FLAG).unwrap(), Some(true));

        f.queue.start().unwrap();
        assert_eq!(f.scheduler.delays(), vec![Duration::ZERO]);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_until_backlog_drains_then_goes_idle() {
        let f = fixture();
        seed(&f.harness, 3);
        f.queue.start().unwrap();

        assert!(f.scheduler.run_next().await);
        assert_eq!(f.harness.pipeline.backlog_size().unwrap(), 1);
        assert_eq!(f.scheduler.delays(), vec![Duration::from_secs(15)]);

        assert!(f.scheduler.run_next().await);
        assert_eq!(f.harness.pipeline.backlog_size().unwrap(), 0);
        assert!(f.scheduler.delays().is_empty());
        assert_eq!(f.flags.get_flag(QUEUE_ACTIVE_FLAG).unwrap(), None);
        assert!(!f.queue.state().unwrap().active);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_turns_pending_tick_into_a_no_op() {
        let f = fixture();
        seed(&f.harness, 2);
        f.queue.start().unwrap();
        f.queue.stop().unwrap();

        assert!(f.scheduler.run_next().await);
        assert_eq!(f.harness.geocoder.calls(), 0);
        assert_eq!(f.harness.pipeline.backlog_size().unwrap(), 2);
        assert!(f.scheduler.delays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn spurious_ticks_do_not_duplicate_the_schedule() {
        let f = fixture();
        seed(&f.harness, 5);

        assert_eq!(f.queue.tick().await.unwrap(), TickOutcome::Inactive);
        assert!(f.scheduler.delays().is_empty());

        f.queue.start().unwrap();
        let outcome = f.queue.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Rescheduled(ref stats) if stats.resolved == 2));
        assert_eq!(f.scheduler.delays(), vec![Duration::ZERO]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_backlog_drains_immediately() {
        let f = fixture();
        f.queue.start().unwrap();
        let outcome = f.queue.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Drained(BatchRunStats::default()));
        assert!(!f.queue.state().unwrap().active);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_do_not_halt_the_queue() {
        let f = fixture();
        f.harness
            .store
            .insert_record(&AddressFields::new(""))
            .unwrap();
        seed(&f.harness, 2);
        f.queue.start().unwrap();

        for _ in 0..3 {
            assert!(f.scheduler.run_next().await);
        }
        assert_eq!(f.harness.pipeline.backlog_size().unwrap(), 1);
        assert!(f.queue.state().unwrap().active);
        assert_eq!(f.scheduler.delays(), vec![Duration::from_secs(15)]);
        assert_eq!(f.harness.geocoder.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_picks_up_a_persisted_active_flag() {
        let f = fixture();
        seed(&f.harness, 1);
        assert!(!f.queue.resume().unwrap());

        f.flags.set_flag(QUEUE_ACTIVE_FLAG, true).unwrap();
        let scheduler = Arc::new(ManualScheduler::default());
        let restarted = queue_for(&f.harness, f.flags.clone(), scheduler.clone());
        assert!(restarted.resume().unwrap());
        assert!(scheduler.run_next().await);
        assert_eq!(f.harness.pipeline.backlog_size().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_runs_after_delay() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        TokioScheduler.schedule_once(
            Duration::from_secs(15),
            async move {
                let _ = tx.send(tokio::time::Instant::now());
            }
            .boxed(),
        );
        let start = tokio::time::Instant::now();
        let fired = rx.await.unwrap();
        assert!(fired.duration_since(start) >= Duration::from_secs(15));
    }
}
