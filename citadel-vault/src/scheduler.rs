//! Background tick drivers. Both ticks are fixed-delay, not fixed-rate: the
//! next sleep starts only after the previous tick finishes, so a slow tick
//! never queues up a backlog of overlapping runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::lease::LeaseService;
use crate::rotation::RotationService;

pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_LEASE_EXPIRY_INTERVAL: Duration = Duration::from_secs(30);

pub struct Scheduler {
    rotation: Arc<RotationService>,
    leases: Arc<LeaseService>,
    rotation_interval: Duration,
    lease_expiry_interval: Duration,
}

impl Scheduler {
    pub fn new(rotation: Arc<RotationService>, leases: Arc<LeaseService>) -> Self {
        Self {
            rotation,
            leases,
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            lease_expiry_interval: DEFAULT_LEASE_EXPIRY_INTERVAL,
        }
    }

    pub fn with_intervals(mut self, rotation_interval: Duration, lease_expiry_interval: Duration) -> Self {
        self.rotation_interval = rotation_interval;
        self.lease_expiry_interval = lease_expiry_interval;
        self
    }

    /// Spawns the two background tick loops. Dropping both handles' owning
    /// task (or calling `.abort()` on them) is the only way to stop them.
    pub fn spawn(self: Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let rotation_task = {
            let scheduler = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(scheduler.rotation_interval).await;
                    if let Err(e) = scheduler.rotation.rotate_due(Utc::now()) {
                        tracing::error!(error = %e, "rotation tick failed");
                    }
                }
            })
        };

        let lease_task = {
            let scheduler = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(scheduler.lease_expiry_interval).await;
                    if let Err(e) = scheduler.leases.expire_due(Utc::now()) {
                        tracing::error!(error = %e, "lease expiry tick failed");
                    }
                }
            })
        };

        (rotation_task, lease_task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::lease::LeaseServiceConfig;
    use crate::seal::SealService;
    use crate::secret::SecretService;
    use crate::storage::InMemoryStore;

    #[tokio::test(start_paused = true)]
    async fn rotation_tick_runs_on_fixed_delay_and_survives_one_failure() {
        let seal = Arc::new(SealService::new(vec![0x55u8; 32], 5, 3, true).unwrap());
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let secrets = Arc::new(SecretService::new(seal.clone(), store.clone(), store.clone(), store.clone(), audit.clone()));
        let rotation = Arc::new(RotationService::new(secrets.clone(), store.clone(), store.clone(), audit.clone()));
        let leases = Arc::new(LeaseService::new(seal, secrets, store, audit, LeaseServiceConfig::default()));

        let scheduler = Arc::new(
            Scheduler::new(rotation, leases)
                .with_intervals(Duration::from_millis(10), Duration::from_secs(3600)),
        );
        let (rotation_task, lease_task) = scheduler.spawn();

        tokio::time::advance(Duration::from_millis(35)).await;
        rotation_task.abort();
        lease_task.abort();
    }
}
