use chrono::{DateTime, Utc};
use flowrun_core::{Result, TimerKind};
use flowrun_state_store::{load, save, StateStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::job::{job_key, FireEvent, PersistedJob, TimerFire, TimerJob};
use crate::schedule::{add_secs, next_cron_after, next_interval_after, parse_cron};

struct ActiveTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

type ActiveMap = Arc<Mutex<HashMap<String, ActiveTimer>>>;

fn lock(active: &ActiveMap) -> MutexGuard<'_, HashMap<String, ActiveTimer>> {
    active.lock().unwrap_or_else(|e| e.into_inner())
}

fn deliver(tx: &mpsc::UnboundedSender<TimerFire>, fire: TimerFire) {
    let (job_id, event) = (fire.job_id.clone(), fire.event);
    if tx.send(fire).is_err() {
        warn!(job_id = %job_id, ?event, "Timer misfire: no receiver for timer events");
    }
}

/// Arms timer jobs and delivers their fires.
///
/// One task per job key. Job definitions and their next fire time live in
/// the state store so `restore` can re-arm them after a restart.
pub struct TimerService {
    store: Arc<dyn StateStore>,
    namespace: String,
    fire_tx: mpsc::UnboundedSender<TimerFire>,
    active: ActiveMap,
    generation: AtomicU64,
}

impl TimerService {
    pub fn new(
        store: Arc<dyn StateStore>,
        namespace: impl Into<String>,
        fire_tx: mpsc::UnboundedSender<TimerFire>,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            fire_tx,
            active: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Validate, persist and arm a job. Any job already owned by the same
    /// node is cancelled first. Returns the job id.
    pub async fn schedule_timer(&self, job: TimerJob) -> Result<String> {
        job.validate()?;
        let key = job.key();
        self.cleanup_timer(&job.flow_run_id, &job.node_id).await?;

        let now = Utc::now();
        if job.is_expired_at(now) {
            info!(
                job_id = %key,
                end_date = ?job.end_date,
                "End date is in the past, not arming recurring timer"
            );
            deliver(&self.fire_tx, TimerFire::new(&job, FireEvent::Expired, 0));
            return Ok(key);
        }

        let next_fire_at = first_fire(&job, now)?;
        let persisted = PersistedJob {
            job,
            next_fire_at,
            fires: 0,
        };
        save(self.store.as_ref(), &self.namespace, &key, &persisted, None).await?;
        info!(
            job_id = %key,
            kind = ?persisted.job.kind,
            next_fire_at = %next_fire_at,
            "Timer scheduled"
        );
        self.arm(persisted);
        Ok(key)
    }

    /// Cancel the node's job and remove its record. Idempotent.
    pub async fn cleanup_timer(&self, flow_run_id: &str, node_id: &str) -> Result<()> {
        let key = job_key(flow_run_id, node_id);
        if let Some(active) = lock(&self.active).remove(&key) {
            active.handle.abort();
            debug!(job_id = %key, "Timer cancelled");
        }
        self.store.delete(&self.namespace, &key).await?;
        Ok(())
    }

    /// Cancel every job of a run
    pub async fn cleanup_run(&self, flow_run_id: &str) -> Result<usize> {
        let prefix = job_key(flow_run_id, "");
        let keys = self
            .store
            .keys(&self.namespace, &format!("{}*", prefix))
            .await?;
        let mut removed = 0;
        for key in keys {
            if let Some(node_id) = key.strip_prefix(&prefix) {
                self.cleanup_timer(flow_run_id, node_id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Re-arm persisted jobs after a restart.
    ///
    /// Overdue timeouts fire once right away. Overdue recurring jobs skip
    /// the ticks they missed and resync to the next future tick.
    pub async fn restore(&self) -> Result<usize> {
        let keys = self.store.keys(&self.namespace, "timer:*").await?;
        let mut restored = 0;

        for key in keys {
            if lock(&self.active).contains_key(&key) {
                continue;
            }
            let Some(mut persisted) =
                load::<PersistedJob>(self.store.as_ref(), &self.namespace, &key).await?
            else {
                continue;
            };

            let now = Utc::now();
            if persisted.job.is_expired_at(now) {
                self.store.delete(&self.namespace, &key).await?;
                deliver(
                    &self.fire_tx,
                    TimerFire::new(&persisted.job, FireEvent::Expired, persisted.fires),
                );
                continue;
            }

            if persisted.next_fire_at <= now {
                match resync(&persisted, now) {
                    Ok(next) => persisted.next_fire_at = next,
                    Err(e) => {
                        error!(job_id = %key, error = %e, "Dropping unrestorable timer");
                        self.store.delete(&self.namespace, &key).await?;
                        continue;
                    }
                }
                save(self.store.as_ref(), &self.namespace, &key, &persisted, None).await?;
            }

            info!(
                job_id = %key,
                next_fire_at = %persisted.next_fire_at,
                "Timer restored"
            );
            self.arm(persisted);
            restored += 1;
        }

        Ok(restored)
    }

    pub fn is_active(&self, flow_run_id: &str, node_id: &str) -> bool {
        lock(&self.active).contains_key(&job_key(flow_run_id, node_id))
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// Stop all armed tasks, keeping persisted records for `restore`
    pub fn shutdown(&self) {
        let mut active = lock(&self.active);
        for (_, timer) in active.drain() {
            timer.handle.abort();
        }
        info!("Timer service stopped");
    }

    fn arm(&self, persisted: PersistedJob) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let key = persisted.job.key();
        let task = TimerTask {
            store: self.store.clone(),
            namespace: self.namespace.clone(),
            fire_tx: self.fire_tx.clone(),
            active: self.active.clone(),
            generation,
            key: key.clone(),
        };
        // Hold the map while spawning so a task that finishes immediately
        // cannot race its own registration.
        let mut active = lock(&self.active);
        let handle = tokio::spawn(task.run(persisted));
        if let Some(previous) = active.insert(key, ActiveTimer { generation, handle }) {
            previous.handle.abort();
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        for (_, timer) in lock(&self.active).drain() {
            timer.handle.abort();
        }
    }
}

fn first_fire(job: &TimerJob, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match job.kind {
        TimerKind::Timeout => add_secs(now, job.timeout.unwrap_or(0)),
        TimerKind::Interval => add_secs(now, job.interval.unwrap_or(1)),
        TimerKind::Cron => {
            let schedule = parse_cron(job.expression.as_deref().unwrap_or_default())?;
            next_cron_after(&schedule, now)
        }
    }
}

/// Next fire for an overdue job
fn resync(persisted: &PersistedJob, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let job = &persisted.job;
    match job.kind {
        TimerKind::Timeout => Ok(now),
        TimerKind::Interval => {
            next_interval_after(persisted.next_fire_at, job.interval.unwrap_or(1), now)
        }
        TimerKind::Cron => {
            let schedule = parse_cron(job.expression.as_deref().unwrap_or_default())?;
            next_cron_after(&schedule, now)
        }
    }
}

struct TimerTask {
    store: Arc<dyn StateStore>,
    namespace: String,
    fire_tx: mpsc::UnboundedSender<TimerFire>,
    active: ActiveMap,
    generation: u64,
    key: String,
}

impl TimerTask {
    async fn run(self, mut persisted: PersistedJob) {
        // Wall-clock fire times are mapped onto the tokio clock from a
        // single anchor, so consecutive ticks never drift.
        let anchor_wall = Utc::now();
        let anchor = Instant::now();
        let deadline = |at: DateTime<Utc>| -> Instant {
            anchor + (at - anchor_wall).to_std().unwrap_or(Duration::ZERO)
        };

        let schedule = match persisted.job.kind {
            TimerKind::Cron => {
                match parse_cron(persisted.job.expression.as_deref().unwrap_or_default()) {
                    Ok(schedule) => Some(schedule),
                    Err(e) => {
                        error!(job_id = %self.key, error = %e, "Timer has an invalid cron expression");
                        self.finish().await;
                        return;
                    }
                }
            }
            _ => None,
        };

        loop {
            let next = persisted.next_fire_at;
            if let Some(end) = persisted.job.end_date.filter(|_| persisted.job.is_recurring()) {
                if next > end {
                    tokio::time::sleep_until(deadline(end)).await;
                    info!(job_id = %self.key, fires = persisted.fires, "Timer reached its end date");
                    deliver(
                        &self.fire_tx,
                        TimerFire::new(&persisted.job, FireEvent::Expired, persisted.fires),
                    );
                    self.finish().await;
                    return;
                }
            }

            tokio::time::sleep_until(deadline(next)).await;
            persisted.fires += 1;
            debug!(job_id = %self.key, tick = persisted.fires, "Timer fired");
            deliver(
                &self.fire_tx,
                TimerFire::new(&persisted.job, FireEvent::Tick, persisted.fires),
            );

            persisted.next_fire_at = match (&persisted.job.kind, &schedule) {
                (TimerKind::Timeout, _) => {
                    self.finish().await;
                    return;
                }
                (TimerKind::Interval, _) => match add_secs(next, persisted.job.interval.unwrap_or(1)) {
                    Ok(at) => at,
                    Err(e) => {
                        warn!(job_id = %self.key, error = %e, "Interval schedule exhausted");
                        self.finish().await;
                        return;
                    }
                },
                (TimerKind::Cron, Some(schedule)) => match next_cron_after(schedule, next) {
                    Ok(at) => at,
                    Err(e) => {
                        warn!(job_id = %self.key, error = %e, "Cron schedule exhausted");
                        self.finish().await;
                        return;
                    }
                },
                (TimerKind::Cron, None) => {
                    self.finish().await;
                    return;
                }
            };

            if !self.is_current() {
                return;
            }
            if let Err(e) = save(
                self.store.as_ref(),
                &self.namespace,
                &self.key,
                &persisted,
                None,
            )
            .await
            {
                warn!(job_id = %self.key, error = %e, "Failed to persist next fire time");
            }
        }
    }

    fn is_current(&self) -> bool {
        lock(&self.active)
            .get(&self.key)
            .map_or(false, |t| t.generation == self.generation)
    }

    /// Natural completion: unregister and drop the record unless a newer
    /// job took over the key.
    async fn finish(&self) {
        let owned = {
            let mut active = lock(&self.active);
            match active.get(&self.key) {
                Some(t) if t.generation == self.generation => {
                    active.remove(&self.key);
                    true
                }
                _ => false,
            }
        };
        if owned {
            if let Err(e) = self.store.delete(&self.namespace, &self.key).await {
                warn!(job_id = %self.key, error = %e, "Failed to remove finished timer");
            }
        }
    }
}
