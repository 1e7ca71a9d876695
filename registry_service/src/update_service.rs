use crate::chain::{BlockRef, RegistryReader};
use crate::config::Config;
use crate::metrics::RegistryMetrics;
use crate::reconciler::Reconciler;
use parking_lot::RwLock;
use slog::{crit, info, warn, Logger};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Ceiling on how often the watchdog re-checks the last-success instant.
pub const WATCHDOG_POLL_CEILING: Duration = Duration::from_secs(60);

/// True once the deadline since the last successful cycle has passed.
pub fn stalled(last_success: Instant, timeout: Duration) -> bool {
    last_success.elapsed() >= timeout
}

pub struct UpdateService {}

impl UpdateService {
    /// Kick an immediate update, then one per interval. A trigger that
    /// arrives while a cycle is still running is dropped, not queued. A
    /// separate watchdog task ends the process once no cycle has succeeded
    /// within the configured timeout; the surrounding deployment is
    /// expected to restart it.
    pub fn spawn<R: RegistryReader + 'static>(
        logger: Logger,
        config: &Config,
        reconciler: Arc<Reconciler<R>>,
        metrics: Arc<RegistryMetrics>,
    ) {
        let interval = Duration::from_millis(config.update_interval_ms);
        let timeout = Duration::from_millis(config.update_timeout_ms);
        let in_flight = Arc::new(Mutex::new(()));
        let last_success = Arc::new(RwLock::new(Instant::now()));
        let last_block = Arc::new(AtomicU64::new(0));

        {
            let logger = logger.clone();
            let last_success = last_success.clone();
            let last_block = last_block.clone();
            tokio::spawn(async move {
                let mut ticks = tokio::time::interval(interval);
                ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticks.tick().await;
                    // each trigger runs in its own task so a tick landing
                    // mid-cycle is genuinely dropped rather than queued
                    let logger = logger.clone();
                    let in_flight = in_flight.clone();
                    let reconciler = reconciler.clone();
                    let metrics = metrics.clone();
                    let last_success = last_success.clone();
                    let last_block = last_block.clone();
                    tokio::spawn(async move {
                        let _guard = match in_flight.try_lock() {
                            Ok(guard) => guard,
                            Err(_) => {
                                warn!(logger, "previous update still running, dropping trigger");
                                return;
                            }
                        };
                        match reconciler.update(BlockRef::Finalized).await {
                            Ok(Some(meta)) => {
                                metrics.record_cycle(&meta);
                                last_block.store(meta.block_number, Ordering::Relaxed);
                                *last_success.write() = Instant::now();
                                info!(
                                    logger,
                                    "update cycle complete";
                                    "block" => meta.block_number,
                                    "block timestamp" => meta.timestamp,
                                );
                            }
                            Ok(None) => {
                                *last_success.write() = Instant::now();
                            }
                            Err(e) => {
                                warn!(logger, "update cycle failed"; "error" => %e);
                            }
                        }
                    });
                }
            });
        }

        tokio::spawn(async move {
            let poll = (timeout / 4).clamp(Duration::from_millis(250), WATCHDOG_POLL_CEILING);
            let mut ticks = tokio::time::interval(poll);
            loop {
                ticks.tick().await;
                if stalled(*last_success.read(), timeout) {
                    crit!(
                        logger,
                        "validators outdated, no successful update within the deadline";
                        "last block" => last_block.load(Ordering::Relaxed),
                        "timeout ms" => timeout.as_millis() as u64,
                    );
                    std::process::exit(1);
                }
            }
        });
    }
}
