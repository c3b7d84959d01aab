//! Periodic sweep over mailbox configs. Each tick collects the configs
//! whose poll interval has elapsed and hands them to the pipeline on a
//! bounded worker pool. A config whose previous cycle is still running is
//! skipped, not queued; it becomes eligible again once that cycle ends.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::interval;
use uuid::Uuid;

use crate::ingest::IngestPipeline;
use crate::mailbox::{ConfigStore, MailboxConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    AlreadyRunning,
}

/// Per-config execution locks. At most one poll cycle per mailbox config at
/// any time, whether the tick or a manual trigger started it.
pub struct CycleLocks {
    running: Mutex<HashSet<Uuid>>,
}

impl CycleLocks {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_running(&self, id: Uuid) -> bool {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        running.contains(&id)
    }

    /// Claim the lock for `id`. Returns `None` when a cycle for that config
    /// is already in flight. The claim is released when the guard drops.
    pub fn try_begin(locks: &Arc<CycleLocks>, id: Uuid) -> Option<CycleGuard> {
        let mut running = locks.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.insert(id) {
            Some(CycleGuard {
                locks: Arc::clone(locks),
                id,
            })
        } else {
            None
        }
    }
}

impl Default for CycleLocks {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CycleGuard {
    locks: Arc<CycleLocks>,
    id: Uuid,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        let mut running = self
            .locks
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        running.remove(&self.id);
    }
}

pub struct MailboxSweeper {
    configs: Arc<dyn ConfigStore>,
    pipeline: Arc<IngestPipeline>,
    locks: Arc<CycleLocks>,
    workers: Arc<Semaphore>,
    tick_interval: Duration,
}

impl MailboxSweeper {
    pub fn new(
        configs: Arc<dyn ConfigStore>,
        pipeline: Arc<IngestPipeline>,
        tick_interval: Duration,
        max_workers: usize,
    ) -> Self {
        Self {
            configs,
            pipeline,
            locks: Arc::new(CycleLocks::new()),
            workers: Arc::new(Semaphore::new(max_workers)),
            tick_interval,
        }
    }

    pub fn is_polling(&self, id: Uuid) -> bool {
        self.locks.is_running(id)
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Mailbox sweeper started, tick every {}s",
                self.tick_interval.as_secs()
            );
            let mut tick = interval(self.tick_interval);
            loop {
                tick.tick().await;
                self.sweep(Utc::now());
            }
        })
    }

    /// One pass: start a cycle for every due config that is not already
    /// running, until the worker pool is exhausted. Leftover due configs
    /// simply come around again on the next tick.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let due = match self.configs.list_due(now) {
            Ok(due) => due,
            Err(e) => {
                error!("Could not load due mailbox configs: {e}");
                return;
            }
        };
        if due.is_empty() {
            return;
        }
        debug!("{} mailbox config(s) due for polling", due.len());

        for config in due {
            let permit = match self.workers.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("worker pool saturated, deferring remaining due configs");
                    break;
                }
            };
            match CycleLocks::try_begin(&self.locks, config.id) {
                Some(guard) => self.start_cycle(config, guard, Some(permit)),
                None => {
                    debug!(
                        "mailbox {} still busy from a previous cycle, skipping",
                        config.name
                    );
                }
            }
        }
    }

    /// Start a cycle outside the tick, for the manual poll endpoint. Honors
    /// the per-config lock but not the worker pool.
    pub fn trigger(&self, config: MailboxConfig) -> TriggerOutcome {
        match CycleLocks::try_begin(&self.locks, config.id) {
            Some(guard) => {
                info!("manual poll requested for mailbox {}", config.name);
                self.start_cycle(config, guard, None);
                TriggerOutcome::Started
            }
            None => TriggerOutcome::AlreadyRunning,
        }
    }

    fn start_cycle(
        &self,
        config: MailboxConfig,
        guard: CycleGuard,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let pipeline = self.pipeline.clone();
        let configs = self.configs.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let _permit = permit;
            let started = Utc::now();
            let outcome = pipeline.run_cycle(&config).await;
            // The poll marker only moves after a clean cycle, so a mailbox
            // that failed outright is retried at the next tick.
            if outcome.is_success() {
                if let Err(e) = configs.mark_polled(config.id, started) {
                    error!("Could not advance poll marker for {}: {e}", config.name);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_on_the_same_config_is_rejected() {
        let locks = Arc::new(CycleLocks::new());
        let id = Uuid::new_v4();

        let guard = CycleLocks::try_begin(&locks, id);
        assert!(guard.is_some());
        assert!(locks.is_running(id));
        assert!(CycleLocks::try_begin(&locks, id).is_none());

        drop(guard);
        assert!(!locks.is_running(id));
        assert!(CycleLocks::try_begin(&locks, id).is_some());
    }

    #[test]
    fn claims_on_distinct_configs_are_independent() {
        let locks = Arc::new(CycleLocks::new());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let _guard_a = CycleLocks::try_begin(&locks, a).unwrap();
        assert!(CycleLocks::try_begin(&locks, b).is_some());
    }
}
