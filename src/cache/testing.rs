//! In-process stand-ins for the connection factory and device connections.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::auth::Credential;
use crate::cache::{ConnectionFactory, DeviceConnection};
use crate::error::HandleError;

#[derive(Debug, Error)]
#[error("{0}")]
pub(crate) struct MockError(pub String);

#[derive(Debug)]
pub(crate) struct MockConnection {
    pub serial: usize,
    pub device_id: String,
    pub credential: Credential,
    pub events: Mutex<Vec<Bytes>>,
    pub properties: Mutex<Vec<String>>,
    pub lost: AtomicBool,
    pub rejecting: AtomicBool,
    pub closed: AtomicBool,
}

impl MockConnection {
    fn check(&self) -> Result<(), HandleError> {
        if self.closed.load(Ordering::SeqCst) || self.lost.load(Ordering::SeqCst) {
            return Err(HandleError::ConnectionLost(format!(
                "link {} gone",
                self.serial
            )));
        }
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(HandleError::Rejected("throttled".into()));
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceConnection for MockConnection {
    async fn send_event(&self, payload: Bytes) -> Result<(), HandleError> {
        self.check()?;
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(payload);
        Ok(())
    }

    async fn update_reported_properties(&self, properties: String) -> Result<(), HandleError> {
        self.check()?;
        self.properties
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(properties);
        Ok(())
    }

    async fn twin(&self) -> Result<String, HandleError> {
        self.check()?;
        Ok(format!(
            r#"{{"deviceId":"{}","version":{}}}"#,
            self.device_id, self.serial
        ))
    }

    async fn close(&self) -> Result<(), HandleError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Counts opens; can stall, fail, or hang forever for one device.
#[derive(Debug, Default)]
pub(crate) struct MockFactory {
    opens: AtomicUsize,
    fail_next: AtomicUsize,
    delay: Duration,
    stuck_device: Option<String>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Opens for this device never complete.
    pub fn with_stuck_device(mut self, device_id: &str) -> Self {
        self.stuck_device = Some(device_id.to_owned());
        self
    }

    /// The next `n` opens fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;
    type Error = MockError;

    async fn open(
        &self,
        device_id: &str,
        credential: &Credential,
    ) -> Result<MockConnection, MockError> {
        let serial = self.opens.fetch_add(1, Ordering::SeqCst) + 1;

        if self.stuck_device.as_deref() == Some(device_id) {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MockError(format!("device {device_id} refused")));
        }

        Ok(MockConnection {
            serial,
            device_id: device_id.to_owned(),
            credential: credential.clone(),
            events: Mutex::default(),
            properties: Mutex::default(),
            lost: AtomicBool::new(false),
            rejecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}
