//! Device operations on top of the connection cache.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{error, info};

use crate::auth::{AuthMode, AuthResolver};
use crate::cache::{ConnectionFactory, DeviceConnection, DeviceConnectionCache};
use crate::error::{GatewayError, HandleError};

const SEND_EVENT: &str = "send event";
const UPDATE_PROPERTIES: &str = "update reported properties";
const GET_TWIN: &str = "get twin";

/// Sends messages, reported properties and twin reads on behalf of devices.
///
/// A request with a credential is token-scoped; one without is account-scoped.
/// Whether account-scoped requests are allowed is decided before calling in.
pub struct Gateway<F: ConnectionFactory> {
    cache: DeviceConnectionCache<F>,
    auth: AuthResolver,
}

impl<F: ConnectionFactory> Gateway<F> {
    pub fn new(cache: DeviceConnectionCache<F>) -> Self {
        let auth = AuthResolver::new(cache.clock(), cache.settings().default_lifetime);
        Self { cache, auth }
    }

    pub fn cache(&self) -> &DeviceConnectionCache<F> {
        &self.cache
    }

    pub fn registered_devices(&self) -> BTreeSet<String> {
        self.cache.registered_devices()
    }

    pub async fn send_event(
        &self,
        device_id: &str,
        payload: Bytes,
        credential: Option<&str>,
    ) -> Result<(), GatewayError> {
        let (handle, mode) = self.connect(device_id, credential, SEND_EVENT).await?;

        let bytes = payload.len();
        let result = handle.send_event(payload).await;
        self.settle(device_id, SEND_EVENT, &handle, result).await?;

        info!(device_id = %device_id, mode = ?mode, bytes, "Event sent to device");
        Ok(())
    }

    pub async fn update_reported_properties(
        &self,
        device_id: &str,
        properties: String,
        credential: Option<&str>,
    ) -> Result<(), GatewayError> {
        let (handle, mode) = self.connect(device_id, credential, UPDATE_PROPERTIES).await?;

        let result = handle.update_reported_properties(properties).await;
        self.settle(device_id, UPDATE_PROPERTIES, &handle, result)
            .await?;

        info!(device_id = %device_id, mode = ?mode, "Properties sent to device");
        Ok(())
    }

    pub async fn get_twin(
        &self,
        device_id: &str,
        credential: Option<&str>,
    ) -> Result<String, GatewayError> {
        let (handle, mode) = self.connect(device_id, credential, GET_TWIN).await?;

        let result = handle.twin().await;
        let twin = self.settle(device_id, GET_TWIN, &handle, result).await?;

        info!(device_id = %device_id, mode = ?mode, "Twin retrieved from device");
        Ok(twin)
    }

    async fn connect(
        &self,
        device_id: &str,
        credential: Option<&str>,
        operation: &'static str,
    ) -> Result<(Arc<F::Connection>, AuthMode), GatewayError> {
        let auth = self.auth.resolve(device_id, credential);

        match self
            .cache
            .resolve(device_id, auth.credential.token(), Some(auth.expires_at))
            .await
        {
            Ok(handle) => Ok((handle, auth.mode())),
            Err(e) => {
                error!(device_id = %device_id, operation, error = %e, "Could not connect device");
                Err(e.into())
            }
        }
    }

    /// Log a failed operation and drop the handle from the cache if its connection is gone.
    async fn settle<T>(
        &self,
        device_id: &str,
        operation: &'static str,
        handle: &Arc<F::Connection>,
        result: Result<T, HandleError>,
    ) -> Result<T, GatewayError> {
        let source = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        error!(device_id = %device_id, operation, error = %source, "Device operation failed");
        if source.is_connection_lost() {
            self.cache.invalidate_handle(device_id, handle).await;
        }

        Err(GatewayError::Operation {
            device_id: device_id.to_owned(),
            operation,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSettings;
    use crate::cache::testing::MockFactory;
    use crate::clock::ManualClock;
    use crate::error::ConnectionError;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, UNIX_EPOCH};

    fn gateway(factory: MockFactory) -> Gateway<MockFactory> {
        let clock = Arc::new(ManualClock::at_unix(1_699_990_000));
        let settings = CacheSettings {
            default_lifetime: Duration::from_secs(30 * 60),
            open_timeout: Duration::from_secs(1),
        };
        Gateway::new(DeviceConnectionCache::with_clock(factory, settings, clock))
    }

    #[tokio::test]
    async fn test_send_event_with_token() {
        let gateway = gateway(MockFactory::new());
        let token = "SharedAccessSignature sr=hub%2Fdevices%2Fdev1&sig=abc&se=1700000000";

        gateway
            .send_event("dev1", Bytes::from_static(br#"{"temp":21}"#), Some(token))
            .await
            .unwrap();

        let info = gateway.cache().entry_info("dev1").unwrap();
        assert_eq!(info.auth_mode, AuthMode::TokenScoped);
        assert_eq!(info.expires_at, UNIX_EPOCH + Duration::from_secs(1_700_000_000));

        let handle = gateway.cache().resolve("dev1", None, None).await.unwrap();
        assert_eq!(
            handle.events.lock().unwrap().as_slice(),
            &[Bytes::from_static(br#"{"temp":21}"#)]
        );
        assert_eq!(gateway.registered_devices().len(), 1);
    }

    #[tokio::test]
    async fn test_operations_share_one_connection() {
        let gateway = gateway(MockFactory::new());

        gateway
            .update_reported_properties("dev1", r#"{"fw":"1.2"}"#.into(), None)
            .await
            .unwrap();
        let twin = gateway.get_twin("dev1", None).await.unwrap();

        assert!(twin.contains(r#""deviceId":"dev1""#));
        assert_eq!(gateway.cache().factory().opens(), 1);
        assert_eq!(
            gateway.cache().entry_info("dev1").unwrap().auth_mode,
            AuthMode::AccountScoped
        );
    }

    #[tokio::test]
    async fn test_connection_lost_invalidates_handle() {
        let gateway = gateway(MockFactory::new());
        gateway
            .send_event("dev1", Bytes::from_static(b"{}"), None)
            .await
            .unwrap();

        let first = gateway.cache().resolve("dev1", None, None).await.unwrap();
        first.lost.store(true, Ordering::SeqCst);

        let err = gateway
            .send_event("dev1", Bytes::from_static(b"{}"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Operation {
                operation: SEND_EVENT,
                source: HandleError::ConnectionLost(_),
                ..
            }
        ));
        assert!(gateway.registered_devices().is_empty());
        assert!(first.is_closed());

        gateway
            .send_event("dev1", Bytes::from_static(b"{}"), None)
            .await
            .unwrap();
        let second = gateway.cache().resolve("dev1", None, None).await.unwrap();
        assert_eq!(second.serial, 2);
    }

    #[tokio::test]
    async fn test_rejected_operation_keeps_handle() {
        let gateway = gateway(MockFactory::new());
        let handle = gateway.cache().resolve("dev1", None, None).await.unwrap();
        handle.rejecting.store(true, Ordering::SeqCst);

        let err = gateway.get_twin("dev1", None).await.unwrap_err();
        assert_eq!(err.device_id(), Some("dev1"));
        assert!(matches!(
            err,
            GatewayError::Operation {
                source: HandleError::Rejected(_),
                ..
            }
        ));

        let again = gateway.cache().resolve("dev1", None, None).await.unwrap();
        assert!(Arc::ptr_eq(&handle, &again));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let factory = MockFactory::new();
        factory.fail_next(1);
        let gateway = gateway(factory);

        let err = gateway
            .send_event("dev1", Bytes::from_static(b"{}"), Some("token"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GatewayError::Connection(ConnectionError::Factory { .. })
        ));
        assert_eq!(err.device_id(), Some("dev1"));
        assert!(gateway.registered_devices().is_empty());
    }

    #[tokio::test]
    async fn test_missing_device_id() {
        let gateway = gateway(MockFactory::new());
        let err = gateway.get_twin("", None).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Connection(ConnectionError::MissingDeviceId)
        ));
    }
}
