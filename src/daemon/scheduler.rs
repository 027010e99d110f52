//! Background eviction of expired shares
//!
//! Sweeps on a fixed interval, or sooner when the registry reports a share
//! that expires before the next tick.

use crate::daemon::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Shortest sleep between sweeps, so a failing store cannot spin the loop.
const MIN_WAIT: Duration = Duration::from_millis(250);

/// Periodic sweeper driving `Registry::sweep`.
#[derive(Clone)]
pub struct ExpiryScheduler {
    registry: Arc<Registry>,
    interval: Duration,
}

impl ExpiryScheduler {
    pub fn new(registry: Arc<Registry>, interval: Duration) -> Self {
        Self {
            registry,
            interval: interval.max(MIN_WAIT),
        }
    }

    /// Run a single sweep, returning how many shares were evicted.
    pub fn run_once(&self) -> usize {
        match self.registry.sweep() {
            Ok(expired) => {
                if !expired.is_empty() {
                    info!(count = expired.len(), "Evicted expired shares");
                }
                expired.len()
            }
            Err(e) => {
                error!("Expiry sweep failed: {}", e);
                0
            }
        }
    }

    /// Time until the next sweep is due.
    pub fn next_wait(&self) -> Duration {
        let next_expiry = match self.registry.next_expiry() {
            Ok(next) => next,
            Err(e) => {
                error!("Failed to read next expiry: {}", e);
                None
            }
        };

        match next_expiry {
            Some(expires_at) => {
                let until = (expires_at - self.registry.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                until.clamp(MIN_WAIT, self.interval)
            }
            None => self.interval,
        }
    }

    /// Sweep on the blocking pool and compute the next wait.
    async fn sweep_blocking(&self) -> Duration {
        let scheduler = self.clone();
        let task = tokio::task::spawn_blocking(move || {
            scheduler.run_once();
            scheduler.next_wait()
        });
        match task.await {
            Ok(wait) => wait,
            Err(e) => {
                error!("Expiry sweep task failed: {}", e);
                self.interval
            }
        }
    }

    /// Start the sweep loop. It sweeps immediately, then runs until the
    /// shutdown channel fires.
    pub fn spawn(self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let notifier = self.registry.expiry_notifier();

        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Expiry scheduler started");
            loop {
                let wait = self.sweep_blocking().await;
                debug!(wait_ms = wait.as_millis() as u64, "Next expiry sweep scheduled");

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = notifier.notified() => {
                        debug!("Share added, rescheduling sweep");
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
            info!("Expiry scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::clock::ManualClock;
    use crate::daemon::protocol::AccessModes;
    use crate::daemon::registry::{AddShare, RegistryOptions};
    use crate::daemon::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn create_registry() -> (Arc<Registry>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let registry = Arc::new(Registry::new(
            Box::new(MemoryStore::new()),
            clock.clone(),
            RegistryOptions::default(),
        ));
        (registry, clock)
    }

    fn add_share(registry: &Registry, dir: &TempDir, hours: i64) -> crate::daemon::protocol::ShareRecord {
        let path = dir.path().join("shared.txt");
        std::fs::write(&path, b"hello").unwrap();
        registry
            .add(AddShare {
                owner: "uid:1000".to_string(),
                path,
                name: None,
                duration: chrono::Duration::hours(hours),
                modes: AccessModes::ALL,
            })
            .unwrap()
    }

    #[test]
    fn test_run_once_evicts_expired() {
        let dir = TempDir::new().unwrap();
        let (registry, clock) = create_registry();
        let scheduler = ExpiryScheduler::new(Arc::clone(&registry), Duration::from_secs(60));

        add_share(&registry, &dir, 1);
        assert_eq!(scheduler.run_once(), 0);

        clock.advance(chrono::Duration::hours(1));
        assert_eq!(scheduler.run_once(), 1);
        assert!(registry.list("uid:1000").unwrap().is_empty());
    }

    #[test]
    fn test_next_wait_bounds() {
        let dir = TempDir::new().unwrap();
        let (registry, clock) = create_registry();
        let scheduler = ExpiryScheduler::new(Arc::clone(&registry), Duration::from_secs(60));

        // Nothing stored: wait a full interval
        assert_eq!(scheduler.next_wait(), Duration::from_secs(60));

        // Expiry far away: capped by the interval
        add_share(&registry, &dir, 1);
        assert_eq!(scheduler.next_wait(), Duration::from_secs(60));

        // Expiry close: wake exactly then
        clock.advance(chrono::Duration::hours(1) - chrono::Duration::seconds(10));
        assert_eq!(scheduler.next_wait(), Duration::from_secs(10));

        // Already overdue: floor at the minimum wait
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(scheduler.next_wait(), MIN_WAIT);
    }

    #[tokio::test]
    async fn test_spawn_sweeps_on_startup_and_stops() {
        let dir = TempDir::new().unwrap();
        let (registry, clock) = create_registry();
        let record = add_share(&registry, &dir, 1);
        clock.advance(chrono::Duration::hours(2));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = ExpiryScheduler::new(Arc::clone(&registry), Duration::from_secs(3600))
            .spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.get_active(record.id).is_err());
        assert_eq!(registry.next_expiry().unwrap(), None);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_spawn_wakes_when_share_added() {
        let dir = TempDir::new().unwrap();
        let (registry, clock) = create_registry();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = ExpiryScheduler::new(Arc::clone(&registry), Duration::from_secs(3600))
            .spawn(shutdown_rx);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let first = add_share(&registry, &dir, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        clock.advance(chrono::Duration::hours(2));

        // The second add wakes the loop, which evicts the first share
        let second = add_share(&registry, &dir, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let remaining = registry.next_expiry().unwrap();
        assert_eq!(remaining, Some(second.expires_at));
        assert!(registry.get_active(first.id).is_err());

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
