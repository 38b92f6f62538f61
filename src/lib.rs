//! HTTP gateway for devices that are only reachable through a long-lived,
//! authenticated per-device connection.
//!
//! Requests resolve a device id into a live connection through the
//! [`DeviceConnectionCache`], which opens at most one connection per device,
//! shares the opening attempt between concurrent callers, and closes entries
//! when their credential expires or is replaced.

pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod link_factory;
pub mod registry;

pub use auth::{AuthMode, AuthResolver, Credential, ResolvedAuth, token_expiry};
pub use cache::{
    CacheSettings, ConnectionFactory, DeviceConnection, DeviceConnectionCache, EntryInfo,
    EntryState, EvictionEvent, EvictionReason,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AccessPolicy, GatewayConfig};
pub use error::{ConfigError, ConnectionError, GatewayError, HandleError};
pub use gateway::Gateway;
pub use registry::RegisteredDevices;
