//! Status scheduler
//!
//! A periodic sweep that keeps every time-bounded record's `status`
//! consistent with wall-clock time and executes commands whose run time
//! has arrived. Each tick, in order: purge old audit entries, complete
//! expired records, roll recurring records forward to their next
//! occurrence, activate records whose window contains "now", demote
//! records whose window moved back into the future, then run due deferred
//! commands.
//!
//! A failed step is logged and the sweep moves on; the next tick retries.
//! Sweeps are idempotent - re-running against unchanged rows is a no-op.

mod sweeps;

use std::time::Duration;

use sqlx::SqlitePool;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use beacon_common::db::setting_i64;

use crate::db::RecordStore;

/// Scheduler tunables, settings-table backed
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep between sweeps (default 30s)
    pub sweep_interval: Duration,
    /// Audit entries older than this are purged (default 365 days)
    pub audit_retention_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            audit_retention_days: 365,
        }
    }
}

impl SchedulerConfig {
    /// Load scheduler configuration from the settings table, falling back
    /// to defaults
    pub async fn from_database(pool: &SqlitePool) -> Self {
        let defaults = Self::default();
        Self {
            sweep_interval: Duration::from_secs(
                setting_i64(pool, "sweep_interval_secs", defaults.sweep_interval.as_secs() as i64)
                    .await
                    .max(1) as u64,
            ),
            audit_retention_days: setting_i64(
                pool,
                "audit_retention_days",
                defaults.audit_retention_days,
            )
            .await,
        }
    }
}

/// The periodic lifecycle sweep over all tracked records
pub struct StatusScheduler {
    store: RecordStore,
    config: SchedulerConfig,
}

impl StatusScheduler {
    pub fn new(store: RecordStore, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    /// Run sweeps on the configured interval until cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Status scheduler started (interval: {}s, audit retention: {} days)",
            self.config.sweep_interval.as_secs(),
            self.config.audit_retention_days
        );

        let mut timer = interval(self.config.sweep_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => self.sweep().await,
            }
        }
        info!("Status scheduler stopped");
    }

    /// One full pass over all tracked records
    ///
    /// Public so tests (and operators via a future admin surface) can force
    /// a sweep without waiting out the interval.
    pub async fn sweep(&self) {
        let now = beacon_common::time::unix_now();

        let cutoff = now - self.config.audit_retention_days * 86_400;
        if let Err(e) = crate::db::audit::purge_older_than(self.store.pool(), cutoff).await {
            error!("Audit purge failed: {}", e);
        }

        match sweeps::complete_expired(&self.store, now).await {
            Ok(n) if n > 0 => debug!("Completed {} expired records", n),
            Ok(_) => {}
            Err(e) => error!("Completion sweep failed: {}", e),
        }

        match sweeps::complete_expired_recurring(&self.store, now).await {
            Ok(n) if n > 0 => debug!("Completed {} recurring records past their end", n),
            Ok(_) => {}
            Err(e) => error!("Recurring completion sweep failed: {}", e),
        }

        match sweeps::roll_recurring(&self.store, now).await {
            Ok(n) if n > 0 => debug!("Rolled {} recurring records forward", n),
            Ok(_) => {}
            Err(e) => error!("Rollover sweep failed: {}", e),
        }

        match sweeps::activate_current(&self.store, now).await {
            Ok(n) if n > 0 => debug!("Activated {} records", n),
            Ok(_) => {}
            Err(e) => error!("Activation sweep failed: {}", e),
        }

        match sweeps::demote_future(&self.store, now).await {
            Ok(n) if n > 0 => debug!("Demoted {} records back to pending", n),
            Ok(_) => {}
            Err(e) => error!("Demotion sweep failed: {}", e),
        }

        match sweeps::run_due_commands(&self.store, now).await {
            Ok(n) if n > 0 => debug!("Executed {} deferred commands", n),
            Ok(_) => {}
            Err(e) => error!("Deferred command sweep failed: {}", e),
        }
    }
}
