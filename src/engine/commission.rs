use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::commission::{is_valid_rate, CommissionDetails};

#[async_trait]
pub trait CommissionResolver: Send + Sync {
    async fn get_rate(&self, driver_id: Uuid) -> Result<CommissionDetails, AppError>;

    async fn update_rate(&self, driver_id: Uuid, details: CommissionDetails) -> Result<(), AppError>;
}

pub struct StaticCommissionResolver {
    default_rate: f64,
    overrides: DashMap<Uuid, CommissionDetails>,
}

impl StaticCommissionResolver {
    pub fn new(default_rate: f64) -> Self {
        Self {
            default_rate,
            overrides: DashMap::new(),
        }
    }

    pub fn set_custom_rate(&self, driver_id: Uuid, rate: f64) -> Result<(), AppError> {
        if !is_valid_rate(rate) {
            return Err(AppError::BadRequest(format!(
                "commission rate must be in [0, 1), got {rate}"
            )));
        }
        self.overrides.insert(driver_id, CommissionDetails::custom(rate));
        Ok(())
    }

    pub fn clear_custom_rate(&self, driver_id: Uuid) {
        self.overrides.remove(&driver_id);
    }
}

#[async_trait]
impl CommissionResolver for StaticCommissionResolver {
    async fn get_rate(&self, driver_id: Uuid) -> Result<CommissionDetails, AppError> {
        Ok(match self.overrides.get(&driver_id) {
            Some(details) => *details,
            None => CommissionDetails::default_rate(self.default_rate),
        })
    }

    async fn update_rate(&self, driver_id: Uuid, details: CommissionDetails) -> Result<(), AppError> {
        if !is_valid_rate(details.commission_rate) {
            return Err(AppError::BadRequest(format!(
                "commission rate must be in [0, 1), got {}",
                details.commission_rate
            )));
        }
        if details == CommissionDetails::default_rate(self.default_rate) {
            self.clear_custom_rate(driver_id);
        } else {
            self.overrides.insert(driver_id, details);
        }
        Ok(())
    }
}

pub struct CommissionCache {
    tx: watch::Sender<CommissionDetails>,
}

impl CommissionCache {
    pub fn new(initial: CommissionDetails) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> CommissionDetails {
        *self.tx.borrow()
    }

    pub fn rate_changed(&self, details: CommissionDetails) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == details {
                return false;
            }
            *current = details;
            true
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<CommissionDetails> {
        self.tx.subscribe()
    }
}

// A failed poll keeps the last known rate.
pub fn spawn_poller(
    resolver: Arc<dyn CommissionResolver>,
    driver_id: Uuid,
    cache: Arc<CommissionCache>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;
            match resolver.get_rate(driver_id).await {
                Ok(details) => {
                    if cache.rate_changed(details) {
                        info!(
                            driver_id = %driver_id,
                            commission_rate = details.commission_rate,
                            "commission rate changed"
                        );
                    } else {
                        debug!(driver_id = %driver_id, "commission rate unchanged");
                    }
                }
                Err(err) => {
                    warn!(driver_id = %driver_id, error = %err, "commission poll failed; keeping last rate");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use uuid::Uuid;

    use super::{spawn_poller, CommissionCache, CommissionResolver, StaticCommissionResolver};
    use crate::models::commission::{CommissionDetails, RateSource};

    #[tokio::test]
    async fn custom_rate_overrides_default() {
        let resolver = StaticCommissionResolver::new(0.2);
        let driver = Uuid::new_v4();
        resolver.set_custom_rate(driver, 0.1).unwrap();

        let custom = resolver.get_rate(driver).await.unwrap();
        let default = resolver.get_rate(Uuid::new_v4()).await.unwrap();

        assert_eq!(custom.rate_source, RateSource::Custom);
        assert_eq!(custom.commission_rate, 0.1);
        assert_eq!(default.rate_source, RateSource::Default);
        assert!(resolver.set_custom_rate(driver, 1.5).is_err());
    }

    #[tokio::test]
    async fn pushing_the_default_back_clears_the_override() {
        let resolver = StaticCommissionResolver::new(0.2);
        let driver = Uuid::new_v4();
        resolver
            .update_rate(driver, CommissionDetails::custom(0.12))
            .await
            .unwrap();
        assert_eq!(resolver.get_rate(driver).await.unwrap(), CommissionDetails::custom(0.12));

        resolver
            .update_rate(driver, CommissionDetails::default_rate(0.2))
            .await
            .unwrap();
        assert_eq!(
            resolver.get_rate(driver).await.unwrap(),
            CommissionDetails::default_rate(0.2)
        );
        assert!(resolver
            .update_rate(driver, CommissionDetails::custom(-0.1))
            .await
            .is_err());
    }

    #[test]
    fn pushing_the_same_rate_is_not_a_change() {
        let cache = CommissionCache::new(CommissionDetails::default_rate(0.2));

        assert!(!cache.rate_changed(CommissionDetails::default_rate(0.2)));
        assert!(cache.rate_changed(CommissionDetails::custom(0.15)));
        assert_eq!(cache.current().commission_rate, 0.15);
    }

    #[tokio::test(start_paused = true)]
    async fn poller_picks_up_new_rate_on_next_tick() {
        let resolver = Arc::new(StaticCommissionResolver::new(0.2));
        let driver = Uuid::new_v4();
        let cache = Arc::new(CommissionCache::new(CommissionDetails::default_rate(0.2)));
        let mut changes = cache.subscribe();

        let poller = spawn_poller(resolver.clone(), driver, cache.clone(), Duration::from_secs(300));
        resolver.set_custom_rate(driver, 0.05).unwrap();

        changes.changed().await.unwrap();
        assert_eq!(cache.current(), CommissionDetails::custom(0.05));
        poller.abort();
    }
}
