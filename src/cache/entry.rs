use std::sync::Arc;
use std::time::SystemTime;

use futures::future::{BoxFuture, Shared};
use tokio::task::AbortHandle;

use crate::auth::{AuthMode, Credential};
use crate::error::ConnectionError;

/// The shared result of one creation attempt. Every waiter polls a clone.
pub(crate) type Outcome<C> = Shared<BoxFuture<'static, Result<Arc<C>, ConnectionError>>>;

/// What the cache holds for a device id.
///
/// An evicted entry is removed from the map and consumed by the evicting
/// path, so it can never be observed or reused.
pub(crate) enum Slot<C> {
    Creating(Flight<C>),
    Live(LiveEntry<C>),
}

pub(crate) struct Flight<C> {
    pub generation: u64,
    pub credential: Credential,
    pub expires_at: SystemTime,
    pub outcome: Outcome<C>,
}

pub(crate) struct LiveEntry<C> {
    pub generation: u64,
    pub handle: Arc<C>,
    pub credential: Credential,
    pub expires_at: SystemTime,
    pub timer: AbortHandle,
}

impl<C> LiveEntry<C> {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }
}

impl<C> Slot<C> {
    pub fn live_generation(&self) -> Option<u64> {
        match self {
            Slot::Live(live) => Some(live.generation),
            Slot::Creating(_) => None,
        }
    }

    pub fn creating_generation(&self) -> Option<u64> {
        match self {
            Slot::Creating(flight) => Some(flight.generation),
            Slot::Live(_) => None,
        }
    }

    pub fn info(&self, device_id: &str) -> EntryInfo {
        let (credential, expires_at, state) = match self {
            Slot::Creating(flight) => (&flight.credential, flight.expires_at, EntryState::Creating),
            Slot::Live(live) => (&live.credential, live.expires_at, EntryState::Live),
        };

        EntryInfo {
            device_id: device_id.to_owned(),
            auth_mode: credential.mode(),
            expires_at,
            state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// A connection attempt is in flight.
    Creating,
    /// The connection is open and usable.
    Live,
}

/// Observability view of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub device_id: String,
    pub auth_mode: AuthMode,
    pub expires_at: SystemTime,
    pub state: EntryState,
}
