//! Trigger — fires scale cycles for applications whose time has come.
//!
//! Every tick, each application with `next_run_at <= now` is rescheduled to
//! `now + scale_interarrival` and handed to the job on its own task.
//!
//! At most one cycle per application runs at a time. If the previous cycle
//! still holds the application's lock when it falls due again, that run is
//! skipped; the application has already been rescheduled, so nothing is
//! lost but a tick.
//!
//! On shutdown the loop stops ticking and waits for every cycle already in
//! flight, so no cycle is cut off between a driver call and its state write.
//!
//! Failed cycles back off: after `n` consecutive failures the next run is
//! pushed to `now + scale_interarrival * 2^n`, capped at `max_backoff`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use vdigrid_state::{Application, RecordStore};

use crate::cycle::{epoch_secs, ScheduledJob};
use crate::error::AutoscaleResult;

/// Dispatches scheduled jobs for due applications.
pub struct Trigger {
    store: Arc<dyn RecordStore>,
    job: Arc<dyn ScheduledJob>,
    tick_interval: Duration,
    max_backoff: Duration,
    /// One lock per application id, held for the duration of a cycle.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Consecutive failures per application id.
    failures: Arc<Mutex<HashMap<String, u32>>>,
}

impl Trigger {
    pub fn new(store: Arc<dyn RecordStore>, job: Arc<dyn ScheduledJob>) -> Self {
        Self {
            store,
            job,
            tick_interval: Duration::from_secs(5),
            max_backoff: Duration::from_secs(600),
            locks: Mutex::new(HashMap::new()),
            failures: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Schedule every application due at `now`.
    ///
    /// Returns the set of spawned cycles.
    pub async fn tick(&self, now: u64) -> AutoscaleResult<JoinSet<()>> {
        let mut cycles = JoinSet::new();
        self.tick_into(now, &mut cycles).await?;
        Ok(cycles)
    }

    /// Schedule every application due at `now`, spawning cycles into
    /// `cycles`. Returns how many were spawned.
    pub async fn tick_into(&self, now: u64, cycles: &mut JoinSet<()>) -> AutoscaleResult<usize> {
        let mut spawned = 0;

        for mut app in self.store.list_applications()? {
            if !app.is_due(now) {
                continue;
            }

            app.next_run_at = now.saturating_add(app.scale_interarrival);
            app.updated_at = now;
            self.store.put_application(&app)?;

            let lock = self.lock_for(&app.id).await;
            let Ok(guard) = lock.try_lock_owned() else {
                debug!(app = %app.name, "previous cycle still running, skipping");
                continue;
            };

            let job = self.job.clone();
            let store = self.store.clone();
            let failures = self.failures.clone();
            let max_backoff = self.max_backoff;

            spawned += 1;
            cycles.spawn(async move {
                let _guard = guard;
                match job.execute(&app, now).await {
                    Ok(summary) => {
                        failures.lock().await.remove(&app.id);
                        debug!(app = %app.name, %summary, "cycle finished");
                    }
                    Err(e) => {
                        let count = {
                            let mut failures = failures.lock().await;
                            let count = failures.entry(app.id.clone()).or_insert(0);
                            *count += 1;
                            *count
                        };
                        error!(app = %app.name, failures = count, error = %e, "cycle failed");
                        let deferred =
                            defer_after_failure(store.as_ref(), &app.id, now, count, max_backoff);
                        if let Err(e) = deferred {
                            warn!(app = %app.name, error = %e, "could not record backoff");
                        }
                    }
                }
            });
        }

        Ok(spawned)
    }

    /// Run the tick loop until `shutdown` flips, then wait for the cycles
    /// still running.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.tick_interval.as_millis() as u64, "trigger started");
        let mut cycles = JoinSet::new();
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "scale cycle task failed");
                    }
                    continue;
                }
                _ = shutdown.changed() => {
                    info!(in_flight = cycles.len(), "trigger shutting down");
                    break;
                }
            }

            if let Err(e) = self.tick_into(epoch_secs(), &mut cycles).await {
                error!(error = %e, "trigger tick failed");
            }
        }

        while let Some(joined) = cycles.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "scale cycle task failed");
            }
        }
        info!("trigger stopped");
    }

    /// Consecutive failures currently recorded for `app_id`.
    pub async fn failure_count(&self, app_id: &str) -> u32 {
        self.failures.lock().await.get(app_id).copied().unwrap_or(0)
    }

    async fn lock_for(&self, app_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(app_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Delay before the next run after `failures` consecutive failures.
pub fn backoff_delay(interarrival: u64, failures: u32, max_backoff: Duration) -> u64 {
    let factor = 1u64.checked_shl(failures.min(32)).unwrap_or(u64::MAX);
    let delay = interarrival.saturating_mul(factor);
    delay.min(max_backoff.as_secs()).max(interarrival)
}

/// Push an application's next run out after a failed cycle.
fn defer_after_failure(
    store: &dyn RecordStore,
    app_id: &str,
    now: u64,
    failures: u32,
    max_backoff: Duration,
) -> AutoscaleResult<()> {
    let Some(mut app) = store.get_application(app_id)? else {
        return Ok(());
    };
    let retry_at = now.saturating_add(backoff_delay(app.scale_interarrival, failures, max_backoff));
    if retry_at > app.next_run_at {
        app.next_run_at = retry_at;
        app.updated_at = now;
        store.put_application(&app)?;
        debug!(app = %app.name, retry_at, "cycle deferred");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use vdigrid_state::StateStore;

    use crate::error::AutoscaleError;

    #[derive(Default)]
    struct CountingJob {
        runs: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl ScheduledJob for CountingJob {
        async fn execute(&self, app: &Application, _now: u64) -> AutoscaleResult<String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AutoscaleError::InvalidConfig {
                    app: app.name.clone(),
                    reason: "boom".to_string(),
                });
            }
            Ok(format!("{} ok", app.name))
        }
    }

    /// Blocks until released, to hold an application's lock.
    struct BlockingJob {
        release: Arc<Notify>,
        runs: AtomicU32,
    }

    #[async_trait]
    impl ScheduledJob for BlockingJob {
        async fn execute(&self, _: &Application, _: u64) -> AutoscaleResult<String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(String::new())
        }
    }

    fn app(id: &str, next_run_at: u64) -> Application {
        Application {
            id: id.to_string(),
            name: id.to_string(),
            scale_interarrival: 30,
            users_per_small: 4,
            cluster_headroom: 4,
            next_run_at,
            ssh_key: format!("{id}.pem"),
            created_at: 0,
            updated_at: 0,
        }
    }

    async fn join(mut cycles: JoinSet<()>) {
        while let Some(joined) = cycles.join_next().await {
            joined.unwrap();
        }
    }

    #[tokio::test]
    async fn due_applications_are_rescheduled_and_run() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        store.put_application(&app("due", 100)).unwrap();
        store.put_application(&app("later", 500)).unwrap();
        let job = Arc::new(CountingJob::default());
        let trigger = Trigger::new(store.clone(), job.clone());

        join(trigger.tick(100).await.unwrap()).await;

        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_application("due").unwrap().unwrap().next_run_at, 130);
        assert_eq!(store.get_application("later").unwrap().unwrap().next_run_at, 500);
    }

    #[tokio::test]
    async fn not_due_again_until_interarrival_elapses() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        store.put_application(&app("office", 0)).unwrap();
        let job = Arc::new(CountingJob::default());
        let trigger = Trigger::new(store.clone(), job.clone());

        join(trigger.tick(100).await.unwrap()).await;
        join(trigger.tick(105).await.unwrap()).await;
        join(trigger.tick(129).await.unwrap()).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);

        join(trigger.tick(130).await.unwrap()).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn overlapping_cycle_for_same_application_is_skipped() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let mut a = app("office", 0);
        a.scale_interarrival = 0;
        store.put_application(&a).unwrap();
        let release = Arc::new(Notify::new());
        let job = Arc::new(BlockingJob {
            release: release.clone(),
            runs: AtomicU32::new(0),
        });
        let trigger = Trigger::new(store.clone(), job.clone());

        let first = trigger.tick(100).await.unwrap();
        assert_eq!(first.len(), 1);
        // Let the first cycle take its lock and park.
        while job.runs.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second = trigger.tick(101).await.unwrap();
        assert!(second.is_empty());
        // Still rescheduled even though the run was skipped.
        assert_eq!(store.get_application("office").unwrap().unwrap().next_run_at, 101);

        release.notify_one();
        join(first).await;

        let third = trigger.tick(102).await.unwrap();
        assert_eq!(third.len(), 1);
        release.notify_one();
        join(third).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_back_off_and_success_resets() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        store.put_application(&app("office", 0)).unwrap();
        let job = Arc::new(CountingJob {
            runs: AtomicU32::new(0),
            fail: true,
        });
        let trigger = Trigger::new(store.clone(), job.clone());

        join(trigger.tick(100).await.unwrap()).await;
        assert_eq!(trigger.failure_count("office").await, 1);
        // 30s interarrival doubled once.
        assert_eq!(store.get_application("office").unwrap().unwrap().next_run_at, 160);

        join(trigger.tick(160).await.unwrap()).await;
        assert_eq!(trigger.failure_count("office").await, 2);
        assert_eq!(store.get_application("office").unwrap().unwrap().next_run_at, 280);

        let ok_job = Arc::new(CountingJob::default());
        let trigger = Trigger {
            job: ok_job,
            ..trigger
        };
        join(trigger.tick(280).await.unwrap()).await;
        assert_eq!(trigger.failure_count("office").await, 0);
        assert_eq!(store.get_application("office").unwrap().unwrap().next_run_at, 310);
    }

    #[tokio::test]
    async fn shutdown_waits_for_running_cycle() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        store.put_application(&app("office", 0)).unwrap();
        let release = Arc::new(Notify::new());
        let job = Arc::new(BlockingJob {
            release: release.clone(),
            runs: AtomicU32::new(0),
        });
        let trigger = Arc::new(
            Trigger::new(store.clone(), job.clone()).with_tick_interval(Duration::from_millis(10)),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = {
            let trigger = trigger.clone();
            tokio::spawn(async move { trigger.run(shutdown_rx).await })
        };

        while job.runs.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!running.is_finished());

        release.notify_one();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rescheduling_saturates_instead_of_overflowing() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let mut a = app("office", 0);
        a.scale_interarrival = u64::MAX;
        store.put_application(&a).unwrap();
        let trigger = Trigger::new(store.clone(), Arc::new(CountingJob::default()));

        join(trigger.tick(100).await.unwrap()).await;
        assert_eq!(store.get_application("office").unwrap().unwrap().next_run_at, u64::MAX);
    }

    #[test]
    fn backoff_delay_caps_at_max() {
        let max = Duration::from_secs(600);
        assert_eq!(backoff_delay(30, 0, max), 30);
        assert_eq!(backoff_delay(30, 1, max), 60);
        assert_eq!(backoff_delay(30, 3, max), 240);
        assert_eq!(backoff_delay(30, 10, max), 600);
        assert_eq!(backoff_delay(30, 200, max), 600);
    }

    #[test]
    fn backoff_never_shorter_than_interarrival() {
        assert_eq!(backoff_delay(900, 2, Duration::from_secs(600)), 900);
    }
}
