//! Turns a per-request credential into the credential and expiry a cache entry is created with.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::clock::{Clock, expiry_after};

/// Field of a shared access signature holding its expiry, in seconds since the Unix epoch.
pub const EXPIRY_FIELD: &str = "se=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMode {
    /// Authenticated with a short-lived token issued for the device.
    TokenScoped,
    /// Authenticated with the gateway's account-wide access policy.
    AccountScoped,
}

/// The credential a device connection is opened with.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Token(String),
    Account,
}

impl Credential {
    /// An absent or empty credential selects account-scoped access.
    pub fn from_raw(raw: Option<&str>) -> Self {
        match raw {
            Some(token) if !token.is_empty() => Credential::Token(token.to_owned()),
            _ => Credential::Account,
        }
    }

    pub fn mode(&self) -> AuthMode {
        match self {
            Credential::Token(_) => AuthMode::TokenScoped,
            Credential::Account => AuthMode::AccountScoped,
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Credential::Token(token) => Some(token),
            Credential::Account => None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Token(_) => f.write_str("Token(..)"),
            Credential::Account => f.write_str("Account"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAuth {
    pub credential: Credential,
    pub expires_at: SystemTime,
}

impl ResolvedAuth {
    pub fn mode(&self) -> AuthMode {
        self.credential.mode()
    }
}

/// Resolves a device id plus optional raw credential into a [`ResolvedAuth`].
///
/// Never fails: a token without a readable expiry gets `now + default_lifetime`.
/// Whether account-scoped access is allowed at all is decided by the caller.
#[derive(Debug, Clone)]
pub struct AuthResolver {
    clock: Arc<dyn Clock>,
    default_lifetime: Duration,
}

impl AuthResolver {
    pub fn new(clock: Arc<dyn Clock>, default_lifetime: Duration) -> Self {
        Self {
            clock,
            default_lifetime,
        }
    }

    pub fn default_lifetime(&self) -> Duration {
        self.default_lifetime
    }

    pub fn resolve(&self, device_id: &str, raw_credential: Option<&str>) -> ResolvedAuth {
        let credential = Credential::from_raw(raw_credential);
        let embedded = credential.token().and_then(token_expiry);

        let expires_at = match embedded {
            Some(at) => at,
            None => expiry_after(self.clock.now(), self.default_lifetime),
        };

        debug!(
            device_id = %device_id,
            mode = ?credential.mode(),
            embedded_expiry = embedded.is_some(),
            "Resolved device credential"
        );

        ResolvedAuth {
            credential,
            expires_at,
        }
    }
}

/// Read the expiry embedded in a shared access signature.
///
/// Uses the last `se=` field, i.e. one at the start of the token or following
/// `&`, `?` or whitespace. Its value runs to the next `&` and must be an
/// unsigned number of seconds since the Unix epoch.
pub fn token_expiry(token: &str) -> Option<SystemTime> {
    let bytes = token.as_bytes();
    let (start, _) = token
        .match_indices(EXPIRY_FIELD)
        .filter(|(i, _)| {
            *i == 0 || matches!(bytes[*i - 1], b'&' | b'?') || bytes[*i - 1].is_ascii_whitespace()
        })
        .last()?;

    let value = &token[start + EXPIRY_FIELD.len()..];
    let value = value.split('&').next().unwrap_or(value);
    let secs: u64 = value.trim().parse().ok()?;

    UNIX_EPOCH.checked_add(Duration::from_secs(secs))
}
