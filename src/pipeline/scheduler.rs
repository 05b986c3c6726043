//! Named background jobs for exposure checks
//!
//! Jobs are keyed by name. Scheduling a job under a name that is already
//! taken aborts the old job first, so at most one periodic and one one-time
//! check exist at any moment. The pipeline's own run lock keeps the two from
//! overlapping.

use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

/// Job name of the periodic exposure check
pub const PERIODIC_JOB: &str = "exposure-check-periodic";

/// Job name of a manually triggered exposure check
pub const ONE_TIME_JOB: &str = "exposure-check-now";

#[derive(Default)]
pub struct JobScheduler {
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        // A panic while holding the map cannot leave it inconsistent
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn replace(&self, name: &str, handle: JoinHandle<()>) {
        if let Some(previous) = self.jobs().insert(name.to_string(), handle) {
            if !previous.is_finished() {
                log::info!("🔁 Replacing scheduled job {}", name);
            }
            previous.abort();
        }
    }

    /// Run `job` every `every`, starting after a random delay up to `jitter`
    ///
    /// Arguments:
    /// - `name`: Unique job name; an existing job with this name is replaced
    /// - `every`: Interval between runs
    /// - `jitter`: Upper bound of the random initial delay
    /// - `job`: Factory for one run
    pub fn schedule_periodic<F, Fut>(&self, name: &str, every: Duration, jitter: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let jitter_ms = jitter.as_millis() as u64;
        let initial_delay = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };

        log::info!(
            "⏰ Scheduling {} every {:?} (first run in {:?})",
            name,
            every,
            initial_delay
        );

        let job_name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + initial_delay, every);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                timer.tick().await;
                log::debug!("Running job {}", job_name);
                job().await;
            }
        });

        self.replace(name, handle);
    }

    /// Run `job` once, replacing a pending one-time job of the same name
    pub fn run_now<Fut>(&self, name: &str, job: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        log::info!("▶️  Triggering job {}", name);
        let handle = tokio::spawn(job);
        self.replace(name, handle);
    }

    /// Abort a job, returning whether one was registered
    pub fn cancel(&self, name: &str) -> bool {
        match self.jobs().remove(name) {
            Some(handle) => {
                handle.abort();
                log::info!("🛑 Cancelled job {}", name);
                true
            }
            None => false,
        }
    }

    /// Whether a job with this name is registered and still running
    pub fn is_active(&self, name: &str) -> bool {
        self.jobs().get(name).map_or(false, |handle| !handle.is_finished())
    }

    pub fn cancel_all(&self) {
        for (name, handle) in self.jobs().drain() {
            handle.abort();
            log::debug!("Cancelled job {}", name);
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
