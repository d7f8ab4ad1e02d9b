//! Cron-driven triggers
//!
//! Each trigger is a task that sleeps until the next fire time of its cron
//! schedule and then runs its job in a separate task, so a panicking job is
//! logged and the trigger keeps firing. A fire that would overlap a still
//! running job of the same trigger is skipped.

use chrono::Utc;
use cron::Schedule;
use forecache_common::{Error, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Work run on every fire
pub type TriggerJob = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Parse a six-field cron expression
pub fn parse_schedule(name: &str, expression: &str) -> Result<Schedule> {
    Schedule::from_str(expression).map_err(|e| Error::InvalidSchedule {
        model: name.to_string(),
        reason: format!("'{expression}': {e}"),
    })
}

/// Owns the trigger tasks
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    triggers: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            triggers: Mutex::new(Vec::new()),
        }
    }

    /// Start a trigger firing on `expression`
    pub fn add_trigger(&self, name: &str, expression: &str, job: TriggerJob) -> Result<()> {
        let schedule = parse_schedule(name, expression)?;
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(run_trigger(name.to_string(), schedule, job, shutdown));
        self.triggers.lock().push(handle);
        info!("Scheduled {} with '{}'", name, expression);
        Ok(())
    }

    pub fn trigger_count(&self) -> usize {
        self.triggers.lock().len()
    }

    /// Cancel every trigger and wait for jobs already running
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let triggers: Vec<_> = self.triggers.lock().drain(..).collect();
        for handle in triggers {
            if let Err(e) = handle.await {
                error!("Trigger task failed: {}", e);
            }
        }
    }
}

async fn run_trigger(
    name: String,
    schedule: Schedule,
    job: TriggerJob,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        let now = Utc::now();
        let Some(next) = schedule.after(&now).next() else {
            info!("Schedule for {} has no further fire times", name);
            return;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => return,
        }

        debug!("Trigger {} fired", name);
        if let Err(e) = tokio::spawn(job()).await {
            error!("Job for {} failed: {}", name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn counting_job(counter: &Arc<AtomicU64>) -> TriggerJob {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[test]
    fn test_parse_schedule() {
        assert!(parse_schedule("gfs", "0 */5 * * * *").is_ok());
        assert!(matches!(
            parse_schedule("gfs", "every five minutes"),
            Err(Error::InvalidSchedule { model, .. }) if model == "gfs"
        ));
    }

    #[tokio::test]
    async fn test_invalid_expression_creates_no_trigger() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU64::new(0));
        assert!(scheduler.add_trigger("bad", "not cron", counting_job(&counter)).is_err());
        assert_eq!(scheduler.trigger_count(), 0);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_trigger_fires_and_stops() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU64::new(0));
        scheduler
            .add_trigger("every-second", "* * * * * *", counting_job(&counter))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2200)).await;
        scheduler.stop().await;
        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 1);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), fired);
    }

    #[tokio::test]
    async fn test_panicking_job_keeps_trigger_alive() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU64::new(0));
        let job_counter = Arc::clone(&counter);
        let job: TriggerJob = Arc::new(move || {
            let counter = Arc::clone(&job_counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                assert!(n > 0, "first run fails");
            }
            .boxed()
        });
        scheduler.add_trigger("flaky", "* * * * * *", job).unwrap();

        tokio::time::sleep(Duration::from_millis(3200)).await;
        scheduler.stop().await;
        assert!(counter.load(Ordering::SeqCst) >= 2);
    }
}
