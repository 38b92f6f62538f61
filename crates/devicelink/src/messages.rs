//! Protobuf messages carried on device and cloud tracks.

use std::time::{SystemTime, UNIX_EPOCH};

/// A device-to-cloud message, published on the `events` track.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceEvent {
    #[prost(string, tag = "1")]
    pub message_id: String,
    #[prost(string, tag = "2")]
    pub device_id: String,
    #[prost(bytes = "vec", tag = "3")]
    pub body: Vec<u8>,
    #[prost(string, tag = "4")]
    pub content_type: String,
    #[prost(string, tag = "5")]
    pub content_encoding: String,
    #[prost(uint64, tag = "6")]
    pub timestamp_ms: u64,
}

/// A reported-properties patch (JSON), published on the `properties` track.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ReportedProperties {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(string, tag = "2")]
    pub json: String,
    #[prost(uint64, tag = "3")]
    pub timestamp_ms: u64,
}

/// The device twin as maintained by the cloud, received on the `twin` track.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TwinDocument {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(string, tag = "2")]
    pub json: String,
    #[prost(uint64, tag = "3")]
    pub version: u64,
}

/// A cloud-to-device method invocation, received on the `methods` track.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MethodRequest {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(string, tag = "2")]
    pub method_name: String,
    #[prost(string, tag = "3")]
    pub payload_json: String,
}

/// The answer to a [`MethodRequest`], published on the `method-responses` track.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MethodResponse {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(int32, tag = "2")]
    pub status: i32,
    #[prost(string, tag = "3")]
    pub payload_json: String,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
