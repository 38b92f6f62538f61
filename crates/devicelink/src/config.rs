use std::time::Duration;

use bon::Builder;
use url::Url;

use crate::error::LinkError;
use crate::path::DevicePath;

/// Configuration shared by every device link opened through a [`LinkPool`].
///
/// [`LinkPool`]: crate::LinkPool
#[derive(Debug, Clone, Builder)]
pub struct LinkConfig {
    /// Relay endpoint every device session connects to.
    pub relay_url: Url,

    /// Prefix for device broadcasts (e.g., "device").
    /// Devices publish at `{device_prefix}/{device_id}`.
    #[builder(into, default = String::from("device"))]
    pub device_prefix: String,

    /// Prefix for cloud broadcasts (e.g., "hub").
    /// Twin documents and method calls arrive from `{cloud_prefix}/{device_id}`.
    #[builder(into, default = String::from("hub"))]
    pub cloud_prefix: String,

    #[builder(into, default = String::from("events"))]
    pub events_track: String,

    #[builder(into, default = String::from("properties"))]
    pub properties_track: String,

    #[builder(into, default = String::from("twin"))]
    pub twin_track: String,

    #[builder(into, default = String::from("methods"))]
    pub methods_track: String,

    #[builder(into, default = String::from("method-responses"))]
    pub method_responses_track: String,

    /// Upper bound on simultaneously open links.
    #[builder(default = 100)]
    pub max_pool_size: usize,

    /// Bound on opening a link, waiting for a pool permit and reading the twin.
    #[builder(default = Duration::from_secs(10))]
    pub operation_timeout: Duration,

    /// Listen for cloud-to-device method calls on every link.
    #[builder(default = false)]
    pub methods_enabled: bool,
}

/// How a device link authenticates with the relay.
#[derive(Clone, PartialEq, Eq)]
pub enum LinkCredential {
    /// A short-lived token issued for the device.
    Token(String),
    /// The account-wide shared access policy.
    AccessPolicy { name: String, key: String },
}

impl std::fmt::Debug for LinkCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkCredential::Token(_) => f.write_str("Token(..)"),
            LinkCredential::AccessPolicy { name, .. } => f
                .debug_struct("AccessPolicy")
                .field("name", name)
                .finish_non_exhaustive(),
        }
    }
}

impl LinkConfig {
    /// Build the device broadcast path.
    pub fn device_path(&self, device_id: &str) -> DevicePath {
        DevicePath::new(&self.device_prefix, device_id)
    }

    /// Build the cloud broadcast path the device listens on.
    pub fn cloud_path(&self, device_id: &str) -> DevicePath {
        DevicePath::new(&self.cloud_prefix, device_id)
    }

    /// Build the relay URL carrying the device credential.
    pub fn relay_url_for(
        &self,
        device_id: &str,
        credential: &LinkCredential,
    ) -> Result<Url, LinkError> {
        DevicePath::validate_device_id(device_id)
            .map_err(|e| LinkError::InvalidUrl(e.to_string()))?;

        let mut url = self.relay_url.clone();
        if url.cannot_be_a_base() {
            return Err(LinkError::InvalidUrl(format!(
                "relay url cannot be a base: '{}'",
                self.relay_url
            )));
        }

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("device", device_id);
            match credential {
                LinkCredential::Token(token) => {
                    query.append_pair("jwt", token);
                }
                LinkCredential::AccessPolicy { name, key } => {
                    query.append_pair("policy", name);
                    query.append_pair("key", key);
                }
            }
        }

        Ok(url)
    }
}
