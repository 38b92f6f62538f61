use async_trait::async_trait;
use bytes::Bytes;

use crate::auth::Credential;
use crate::error::HandleError;

/// A live, exclusively owned connection to one device.
///
/// The cache only ever calls [`close`](DeviceConnection::close); the other
/// operations are driven by the gateway through a resolved handle.
#[async_trait]
pub trait DeviceConnection: Send + Sync + 'static {
    /// Send a device-to-cloud message. The payload is forwarded untouched.
    async fn send_event(&self, payload: Bytes) -> Result<(), HandleError>;

    /// Publish a reported-properties JSON document.
    async fn update_reported_properties(&self, properties: String) -> Result<(), HandleError>;

    /// Fetch the device twin as a JSON document.
    async fn twin(&self) -> Result<String, HandleError>;

    /// Close the connection. Best effort; errors are logged by the caller.
    async fn close(&self) -> Result<(), HandleError>;
}

/// Opens device connections. One call per creation attempt.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: DeviceConnection;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn open(
        &self,
        device_id: &str,
        credential: &Credential,
    ) -> Result<Self::Connection, Self::Error>;
}
