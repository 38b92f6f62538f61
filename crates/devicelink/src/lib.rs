//! Device links over a MoQ relay.
//!
//! A [`DeviceLink`] is one authenticated relay session acting for one device
//! identity. It publishes `{device_prefix}/{device_id}` with an `events` and a
//! `properties` track, and follows `{cloud_prefix}/{device_id}` for the twin
//! document and, optionally, cloud-to-device method calls.
//!
//! # Example
//!
//! ```ignore
//! use devicelink::{LinkConfig, LinkCredential, LinkPool};
//!
//! let config = LinkConfig::builder()
//!     .relay_url("https://localhost:4443".parse()?)
//!     .max_pool_size(50)
//!     .build();
//! let pool = LinkPool::new(config);
//!
//! let link = pool
//!     .open("thermostat-01", &LinkCredential::Token(sas_token))
//!     .await?;
//! link.send_event(br#"{"temp":21.5}"#, "application/json", "utf-8").await?;
//! let twin = link.twin().await?;
//! link.close().await;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod link;
pub mod messages;
pub mod path;
pub mod pool;
pub mod relay;

pub use config::{LinkConfig, LinkCredential};
pub use error::{LinkError, LinkOpError, LinkPathError, LinkWireError};
pub use link::{DeviceLink, MethodHandler};
pub use messages::{DeviceEvent, MethodRequest, MethodResponse, ReportedProperties, TwinDocument};
pub use path::DevicePath;
pub use pool::LinkPool;
pub use relay::{RelaySession, connect_relay};
