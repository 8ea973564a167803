use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::AbortHandle;
use tracing::info;
use uuid::Uuid;

use crate::engine::commission::{spawn_poller, CommissionCache, CommissionResolver};
use crate::error::AppError;
use crate::models::commission::{is_valid_rate, CommissionDetails};

pub struct DriverSession {
    pub driver_id: Uuid,
    pub started_at: DateTime<Utc>,
    commission: Arc<CommissionCache>,
    poller: AbortHandle,
}

impl DriverSession {
    pub fn commission(&self) -> CommissionDetails {
        self.commission.current()
    }

    pub fn driver_earnings(&self, total_price: f64) -> f64 {
        self.commission().driver_earnings(total_price)
    }

    fn end(&self) {
        self.poller.abort();
    }
}

impl Drop for DriverSession {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub driver_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub commission: CommissionDetails,
    pub active_delivery: Option<Uuid>,
}

pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<DriverSession>>,
    // driver id -> delivery id
    active_jobs: DashMap<Uuid, Uuid>,
    resolver: Arc<dyn CommissionResolver>,
    poll_interval: Duration,
}

impl SessionRegistry {
    pub fn new(resolver: Arc<dyn CommissionResolver>, poll_interval: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            active_jobs: DashMap::new(),
            resolver,
            poll_interval,
        }
    }

    pub async fn login(&self, driver_id: Uuid) -> Result<Arc<DriverSession>, AppError> {
        if let Some(existing) = self.sessions.get(&driver_id) {
            return Ok(existing.clone());
        }

        let initial = self.resolver.get_rate(driver_id).await?;

        let session = self
            .sessions
            .entry(driver_id)
            .or_insert_with(|| {
                let commission = Arc::new(CommissionCache::new(initial));
                let poller = spawn_poller(
                    self.resolver.clone(),
                    driver_id,
                    commission.clone(),
                    self.poll_interval,
                );
                info!(driver_id = %driver_id, "driver session started");
                Arc::new(DriverSession {
                    driver_id,
                    started_at: Utc::now(),
                    commission,
                    poller: poller.abort_handle(),
                })
            })
            .clone();

        Ok(session)
    }

    pub fn logout(&self, driver_id: Uuid) -> Result<(), AppError> {
        let (_, session) = self
            .sessions
            .remove(&driver_id)
            .ok_or_else(|| no_session(driver_id))?;
        session.end();
        info!(driver_id = %driver_id, "driver session ended");
        Ok(())
    }

    pub fn get(&self, driver_id: Uuid) -> Result<Arc<DriverSession>, AppError> {
        self.sessions
            .get(&driver_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| no_session(driver_id))
    }

    pub fn view(&self, driver_id: Uuid) -> Result<SessionView, AppError> {
        let session = self.get(driver_id)?;
        Ok(SessionView {
            driver_id,
            started_at: session.started_at,
            commission: session.commission(),
            active_delivery: self.active_delivery(driver_id),
        })
    }

    pub async fn rate_changed(&self, driver_id: Uuid, details: CommissionDetails) -> Result<bool, AppError> {
        if !is_valid_rate(details.commission_rate) {
            return Err(AppError::BadRequest(format!(
                "commission rate must be in [0, 1), got {}",
                details.commission_rate
            )));
        }
        let session = self.get(driver_id)?;
        self.resolver.update_rate(driver_id, details).await?;
        Ok(session.commission.rate_changed(details))
    }

    pub fn active_delivery(&self, driver_id: Uuid) -> Option<Uuid> {
        self.active_jobs.get(&driver_id).map(|entry| *entry.value())
    }

    pub fn reserve(&self, driver_id: Uuid, delivery_id: Uuid) -> Result<bool, AppError> {
        match self.active_jobs.entry(driver_id) {
            Entry::Occupied(held) if *held.get() == delivery_id => Ok(false),
            Entry::Occupied(held) => Err(AppError::Conflict(format!(
                "driver {driver_id} already has active delivery {}",
                held.get()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(delivery_id);
                Ok(true)
            }
        }
    }

    pub fn release(&self, driver_id: Uuid, delivery_id: Uuid) {
        self.active_jobs
            .remove_if(&driver_id, |_, active| *active == delivery_id);
    }

    pub fn release_delivery(&self, delivery_id: Uuid) {
        self.active_jobs.retain(|_, active| *active != delivery_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn no_session(driver_id: Uuid) -> AppError {
    AppError::NotFound(format!("driver {driver_id} has no active session"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use uuid::Uuid;

    use super::SessionRegistry;
    use crate::engine::commission::StaticCommissionResolver;
    use crate::models::commission::CommissionDetails;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(
            Arc::new(StaticCommissionResolver::new(0.2)),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn login_is_idempotent_and_logout_destroys_session() {
        let sessions = registry();
        let driver = Uuid::new_v4();

        let first = sessions.login(driver).await.unwrap();
        let second = sessions.login(driver).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(sessions.len(), 1);

        sessions.logout(driver).unwrap();
        assert!(sessions.get(driver).is_err());
        assert!(sessions.logout(driver).is_err());
    }

    #[tokio::test]
    async fn pushed_rate_changes_earnings_immediately() {
        let sessions = registry();
        let driver = Uuid::new_v4();
        let session = sessions.login(driver).await.unwrap();
        assert_eq!(session.driver_earnings(50.0), 40.0);

        let changed = sessions
            .rate_changed(driver, CommissionDetails::custom(0.1))
            .await
            .unwrap();

        assert!(changed);
        assert_eq!(session.driver_earnings(50.0), 45.0);
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_rate_survives_the_next_poll() {
        let sessions = registry();
        let driver = Uuid::new_v4();
        let session = sessions.login(driver).await.unwrap();

        sessions
            .rate_changed(driver, CommissionDetails::custom(0.1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(session.commission(), CommissionDetails::custom(0.1));

        sessions
            .rate_changed(driver, CommissionDetails::default_rate(0.2))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(session.commission(), CommissionDetails::default_rate(0.2));
    }

    #[test]
    fn a_driver_holds_one_job_slot_at_a_time() {
        let sessions = registry();
        let driver = Uuid::new_v4();
        let (job_a, job_b) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(sessions.reserve(driver, job_a).unwrap());
        assert!(!sessions.reserve(driver, job_a).unwrap());
        assert!(matches!(
            sessions.reserve(driver, job_b),
            Err(crate::error::AppError::Conflict(_))
        ));

        sessions.release(driver, job_b);
        assert_eq!(sessions.active_delivery(driver), Some(job_a));
        sessions.release(driver, job_a);
        assert!(sessions.reserve(driver, job_b).unwrap());
    }

    #[tokio::test]
    async fn releasing_a_delivery_clears_only_its_driver() {
        let sessions = registry();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (job_a, job_b) = (Uuid::new_v4(), Uuid::new_v4());
        sessions.reserve(a, job_a).unwrap();
        sessions.reserve(b, job_b).unwrap();

        sessions.release_delivery(job_a);

        assert_eq!(sessions.active_delivery(a), None);
        assert_eq!(sessions.active_delivery(b), Some(job_b));
    }
}
