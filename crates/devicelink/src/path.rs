use std::fmt;

use crate::error::LinkPathError;

/// A parsed broadcast path: `{prefix}/{device_id}`
///
/// Example: `device/thermostat-01`
/// - `prefix`: `device`
/// - `device_id`: `thermostat-01`
///
/// The prefix may itself contain slashes (`fleet/east/device`); the device id
/// may not, so the path is split on the last slash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DevicePath {
    pub prefix: String,
    pub device_id: String,
}

impl DevicePath {
    pub fn new(prefix: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            device_id: device_id.into(),
        }
    }

    /// Parse a path string into a DevicePath.
    ///
    /// Expected format: `{prefix}/{device_id}`
    pub fn parse(path: &str) -> Result<Self, LinkPathError> {
        let path = path.strip_prefix('/').unwrap_or(path);

        let (prefix, device_id) = path
            .rsplit_once('/')
            .ok_or_else(|| LinkPathError::Invalid(format!("path must contain '/': '{path}'")))?;

        if prefix.is_empty() || device_id.is_empty() {
            return Err(LinkPathError::Invalid(format!(
                "prefix and device id must both be non-empty: '{path}'"
            )));
        }

        Ok(DevicePath::new(prefix, device_id))
    }

    /// Check a device id can be used as the last path segment.
    pub fn validate_device_id(device_id: &str) -> Result<(), LinkPathError> {
        if device_id.is_empty() {
            return Err(LinkPathError::Invalid("device id must not be empty".into()));
        }
        if device_id.contains('/') {
            return Err(LinkPathError::Invalid(format!(
                "device id must not contain '/': '{device_id}'"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.prefix, self.device_id)
    }
}
