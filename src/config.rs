//! Process configuration, read from environment variables.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use devicelink::LinkConfig;
use url::Url;

use crate::cache::CacheSettings;
use crate::clock::MAX_LIFETIME;
use crate::error::ConfigError;

pub const LISTEN_ADDR: &str = "GATEWAY_LISTEN_ADDR";
pub const LOG_LEVEL: &str = "GATEWAY_LOG_LEVEL";
pub const RELAY_URL: &str = "RELAY_URL";
pub const MAX_POOL_SIZE: &str = "GATEWAY_MAX_POOL_SIZE";
pub const DEVICE_OPERATION_TIMEOUT_MS: &str = "GATEWAY_DEVICE_OPERATION_TIMEOUT_MS";
pub const DEFAULT_DEVICE_CACHE_MINUTES: &str = "GATEWAY_DEFAULT_DEVICE_CACHE_MINUTES";
pub const SHARED_ACCESS_ENABLED: &str = "GATEWAY_SHARED_ACCESS_ENABLED";
pub const ACCESS_POLICY_NAME: &str = "GATEWAY_ACCESS_POLICY_NAME";
pub const ACCESS_POLICY_KEY: &str = "GATEWAY_ACCESS_POLICY_KEY";
pub const DIRECT_METHODS_ENABLED: &str = "GATEWAY_DIRECT_METHODS_ENABLED";

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_RELAY_URL: &str = "https://localhost:4443";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_MAX_POOL_SIZE: usize = 100;
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CACHE_MINUTES: u64 = 30;

/// The account-wide credential used for account-scoped device links.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    pub name: String,
    pub key: String,
}

impl fmt::Debug for AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessPolicy")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    /// Log filter used when `RUST_LOG` is not set.
    pub log_level: String,
    pub link: LinkConfig,
    pub default_device_cache: Duration,
    /// Accept requests without a device token, connecting with `access_policy`.
    pub shared_access_enabled: bool,
    pub access_policy: Option<AccessPolicy>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup. Unset or empty keys take their default.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let listen_addr: SocketAddr = parse(&get, LISTEN_ADDR, DEFAULT_LISTEN_ADDR.parse().ok())?;
        let log_level = get(LOG_LEVEL).unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned());

        let relay_url = match get(RELAY_URL) {
            Some(raw) => Url::parse(&raw).map_err(|e| ConfigError::Invalid {
                key: RELAY_URL,
                value: raw,
                reason: e.to_string(),
            })?,
            None => Url::parse(DEFAULT_RELAY_URL).map_err(|e| ConfigError::Invalid {
                key: RELAY_URL,
                value: DEFAULT_RELAY_URL.to_owned(),
                reason: e.to_string(),
            })?,
        };

        let max_pool_size = parse(&get, MAX_POOL_SIZE, Some(DEFAULT_MAX_POOL_SIZE))?;
        let operation_timeout_ms = positive(
            DEVICE_OPERATION_TIMEOUT_MS,
            parse(&get, DEVICE_OPERATION_TIMEOUT_MS, Some(DEFAULT_OPERATION_TIMEOUT_MS))?,
        )?;
        let cache_minutes = positive(
            DEFAULT_DEVICE_CACHE_MINUTES,
            parse(&get, DEFAULT_DEVICE_CACHE_MINUTES, Some(DEFAULT_CACHE_MINUTES))?,
        )?;
        let default_device_cache = cache_lifetime(cache_minutes)?;
        let shared_access_enabled = flag(&get, SHARED_ACCESS_ENABLED)?;
        let methods_enabled = flag(&get, DIRECT_METHODS_ENABLED)?;

        let access_policy = match (get(ACCESS_POLICY_NAME), get(ACCESS_POLICY_KEY)) {
            (Some(name), Some(key)) => Some(AccessPolicy { name, key }),
            (None, _) if shared_access_enabled => {
                return Err(ConfigError::MissingAccessPolicy(ACCESS_POLICY_NAME));
            }
            (_, None) if shared_access_enabled => {
                return Err(ConfigError::MissingAccessPolicy(ACCESS_POLICY_KEY));
            }
            _ => None,
        };

        let link = LinkConfig::builder()
            .relay_url(relay_url)
            .max_pool_size(max_pool_size)
            .operation_timeout(Duration::from_millis(operation_timeout_ms))
            .methods_enabled(methods_enabled)
            .build();

        Ok(Self {
            listen_addr,
            log_level,
            link,
            default_device_cache,
            shared_access_enabled,
            access_policy,
        })
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            default_lifetime: self.default_device_cache,
            open_timeout: self.link.operation_timeout,
        }
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: Option<T>) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match (get(key), default) {
        (Some(raw), _) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(ConfigError::Invalid {
            key,
            value: String::new(),
            reason: "no value and no default".into(),
        }),
    }
}

fn positive(key: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(value)
}

fn cache_lifetime(minutes: u64) -> Result<Duration, ConfigError> {
    minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .filter(|lifetime| *lifetime <= MAX_LIFETIME)
        .ok_or_else(|| ConfigError::Invalid {
            key: DEFAULT_DEVICE_CACHE_MINUTES,
            value: minutes.to_string(),
            reason: format!("must be at most {} minutes", MAX_LIFETIME.as_secs() / 60),
        })
}

fn flag<G>(get: &G, key: &'static str) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(false);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "expected true or false".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<GatewayConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:5000".parse().unwrap());
        assert_eq!(config.log_level, "info");
        assert_eq!(config.link.relay_url.as_str(), "https://localhost:4443/");
        assert_eq!(config.link.max_pool_size, 100);
        assert_eq!(config.link.operation_timeout, Duration::from_secs(10));
        assert!(!config.link.methods_enabled);
        assert_eq!(config.default_device_cache, Duration::from_secs(30 * 60));
        assert!(!config.shared_access_enabled);
        assert!(config.access_policy.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            (LISTEN_ADDR, "127.0.0.1:8080"),
            (RELAY_URL, "https://relay.example:4443"),
            (MAX_POOL_SIZE, "8"),
            (DEVICE_OPERATION_TIMEOUT_MS, "2500"),
            (DEFAULT_DEVICE_CACHE_MINUTES, "5"),
            (DIRECT_METHODS_ENABLED, "TRUE"),
        ])
        .unwrap();

        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.link.relay_url.host_str(), Some("relay.example"));
        assert_eq!(config.link.max_pool_size, 8);
        assert_eq!(config.link.operation_timeout, Duration::from_millis(2500));
        assert!(config.link.methods_enabled);

        let settings = config.cache_settings();
        assert_eq!(settings.default_lifetime, Duration::from_secs(300));
        assert_eq!(settings.open_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn test_invalid_number() {
        let err = config(&[(MAX_POOL_SIZE, "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: MAX_POOL_SIZE, .. }));
    }

    #[test]
    fn test_zero_cache_duration_rejected() {
        let err = config(&[(DEFAULT_DEVICE_CACHE_MINUTES, "0")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: DEFAULT_DEVICE_CACHE_MINUTES,
                ..
            }
        ));
    }

    #[test]
    fn test_oversized_cache_duration_rejected() {
        for minutes in [u64::MAX.to_string(), "60000000".to_string()] {
            let err = config(&[(DEFAULT_DEVICE_CACHE_MINUTES, minutes.as_str())]).unwrap_err();
            assert!(matches!(
                err,
                ConfigError::Invalid {
                    key: DEFAULT_DEVICE_CACHE_MINUTES,
                    ..
                }
            ));
        }

        let max_minutes = (MAX_LIFETIME.as_secs() / 60).to_string();
        let config = config(&[(DEFAULT_DEVICE_CACHE_MINUTES, max_minutes.as_str())]).unwrap();
        assert!(config.default_device_cache <= MAX_LIFETIME);
    }

    #[test]
    fn test_invalid_flag() {
        let err = config(&[(SHARED_ACCESS_ENABLED, "maybe")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: SHARED_ACCESS_ENABLED, .. }));
    }

    #[test]
    fn test_shared_access_requires_policy() {
        let err = config(&[(SHARED_ACCESS_ENABLED, "true")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingAccessPolicy(ACCESS_POLICY_NAME)));

        let err = config(&[
            (SHARED_ACCESS_ENABLED, "true"),
            (ACCESS_POLICY_NAME, "gateway"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingAccessPolicy(ACCESS_POLICY_KEY)));

        let config = config(&[
            (SHARED_ACCESS_ENABLED, "1"),
            (ACCESS_POLICY_NAME, "gateway"),
            (ACCESS_POLICY_KEY, "secret"),
        ])
        .unwrap();
        assert!(config.shared_access_enabled);
        assert_eq!(
            config.access_policy,
            Some(AccessPolicy {
                name: "gateway".into(),
                key: "secret".into(),
            })
        );
    }

    #[test]
    fn test_access_policy_debug_redacts_key() {
        let policy = AccessPolicy {
            name: "gateway".into(),
            key: "secret".into(),
        };
        let debug = format!("{policy:?}");
        assert!(debug.contains("gateway"));
        assert!(!debug.contains("secret"));
    }
}
