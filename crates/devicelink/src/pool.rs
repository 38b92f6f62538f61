use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::{LinkConfig, LinkCredential};
use crate::error::LinkError;
use crate::link::{DeviceLink, MethodHandler};

/// Opens device links, bounding how many are open at once.
///
/// Each open link owns one permit; closing or dropping the link returns it.
/// A `max_pool_size` of zero means unbounded.
pub struct LinkPool {
    config: Arc<LinkConfig>,
    permits: Arc<Semaphore>,
    methods: Option<MethodHandler>,
}

impl LinkPool {
    pub fn new(config: LinkConfig) -> Self {
        let size = match config.max_pool_size {
            0 => Semaphore::MAX_PERMITS,
            size => size,
        };

        Self {
            config: Arc::new(config),
            permits: Arc::new(Semaphore::new(size)),
            methods: None,
        }
    }

    /// Answer cloud-to-device method calls with `handler` on every link opened
    /// while `methods_enabled` is set.
    pub fn with_method_handler(mut self, handler: MethodHandler) -> Self {
        self.methods = Some(handler);
        self
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Number of links that can still be opened without waiting.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Open a link for `device_id`, waiting up to the operation timeout for a permit.
    pub async fn open(
        &self,
        device_id: &str,
        credential: &LinkCredential,
    ) -> Result<DeviceLink, LinkError> {
        let permit = self.acquire().await?;
        debug!(
            device_id = %device_id,
            available = self.available(),
            "Pool permit acquired"
        );

        let timeout = self.config.operation_timeout;
        tokio::time::timeout(
            timeout,
            DeviceLink::connect(
                Arc::clone(&self.config),
                device_id,
                credential,
                permit,
                self.methods.clone(),
            ),
        )
        .await
        .map_err(|_| LinkError::Timeout(timeout))?
    }

    pub(crate) async fn acquire(&self) -> Result<OwnedSemaphorePermit, LinkError> {
        let exhausted = || LinkError::PoolExhausted {
            max_pool_size: self.config.max_pool_size,
        };

        match tokio::time::timeout(
            self.config.operation_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(exhausted()),
            Err(_) => {
                warn!(
                    max_pool_size = self.config.max_pool_size,
                    "Timed out waiting for a pool permit"
                );
                Err(exhausted())
            }
        }
    }
}
