//! Shared helpers for integration tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use txguard::config::ConnectionConfig;
use txguard::service::{MockQueryService, QueryService, ServiceFactory};
use txguard::{Connection, Driver, Result};

pub const MARKERS: &str = "txguard_markers";

/// Factory that always hands out the same scripted mock.
pub struct SharedMockFactory {
    pub service: Arc<MockQueryService>,
}

#[async_trait]
impl ServiceFactory for SharedMockFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Arc<dyn QueryService>> {
        Ok(self.service.clone())
    }
}

/// Factory that builds a new mock per call and remembers all of them.
#[derive(Default)]
pub struct CountingFactory {
    pub delay: Duration,
    pub built: Mutex<Vec<Arc<MockQueryService>>>,
}

impl CountingFactory {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            built: Mutex::new(Vec::new()),
        }
    }

    pub fn constructed(&self) -> usize {
        self.built.lock().len()
    }

    /// Services that were built and then closed.
    pub fn discarded(&self) -> usize {
        self.built.lock().iter().filter(|s| s.is_closed()).count()
    }
}

#[async_trait]
impl ServiceFactory for CountingFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Arc<dyn QueryService>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let service = Arc::new(MockQueryService::new());
        self.built.lock().push(service.clone());
        Ok(service)
    }
}

/// Explicit-transaction config with a marker table.
pub fn validated_config(name: &str) -> ConnectionConfig {
    let mut config = ConnectionConfig::memory(name).with_validation_table(MARKERS);
    config.auto_commit = false;
    config
}

/// Opens a connection backed by a fresh scripted mock.
pub async fn scripted_connection(name: &str) -> (Arc<MockQueryService>, Driver, Connection) {
    let service = Arc::new(MockQueryService::new());
    let driver = Driver::with_factory(Arc::new(SharedMockFactory {
        service: service.clone(),
    }));
    let conn = driver.connect(&validated_config(name)).await.unwrap();
    (service, driver, conn)
}
