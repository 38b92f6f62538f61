//! Single-flight, expiry-aware cache of device connections.
//!
//! Each device id maps to at most one slot, either a creation attempt in
//! flight or a live connection. Callers racing on a fresh device share one
//! factory call; callers on different devices only meet on the map's shard
//! locks, which are never held across an await.

mod entry;
mod eviction;
mod factory;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::auth::Credential;
use crate::clock::{Clock, SystemClock, expiry_after};
use crate::error::ConnectionError;
use crate::registry::RegisteredDevices;

use entry::{Flight, LiveEntry, Outcome, Slot};
pub use entry::{EntryInfo, EntryState};
use eviction::EvictionNotifier;
pub use eviction::{EvictionEvent, EvictionReason};
pub use factory::{ConnectionFactory, DeviceConnection};

const EVICTION_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    /// Lifetime of entries without a credential-supplied expiry.
    pub default_lifetime: Duration,
    /// Bound on a single factory open.
    pub open_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_lifetime: Duration::from_secs(30 * 60),
            open_timeout: Duration::from_secs(10),
        }
    }
}

/// Maps device ids to live connections opened through a [`ConnectionFactory`].
///
/// Cloning is cheap and every clone shares the same entries.
pub struct DeviceConnectionCache<F: ConnectionFactory> {
    inner: Arc<CacheInner<F>>,
}

impl<F: ConnectionFactory> Clone for DeviceConnectionCache<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CacheInner<F: ConnectionFactory> {
    factory: F,
    slots: DashMap<String, Slot<F::Connection>, ahash::RandomState>,
    registry: Arc<RegisteredDevices>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
    evictions: EvictionNotifier,
    generations: AtomicU64,
}

enum Step<C> {
    /// Attach to a creation attempt that was opened with this credential.
    Wait(Outcome<C>, Credential),
    Evict(u64, EvictionReason),
    /// The requested credential has already expired.
    Reject,
}

impl<F: ConnectionFactory> DeviceConnectionCache<F> {
    pub fn new(factory: F, settings: CacheSettings) -> Self {
        Self::with_clock(factory, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(factory: F, settings: CacheSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                factory,
                slots: DashMap::with_hasher(ahash::RandomState::new()),
                registry: Arc::new(RegisteredDevices::new()),
                clock,
                settings,
                evictions: EvictionNotifier::new(EVICTION_CHANNEL_CAPACITY),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// Devices with a live connection. Maintained by the cache only.
    pub fn registry(&self) -> &Arc<RegisteredDevices> {
        &self.inner.registry
    }

    pub fn registered_devices(&self) -> BTreeSet<String> {
        self.inner.registry.snapshot()
    }

    pub fn subscribe_evictions(&self) -> broadcast::Receiver<EvictionEvent> {
        self.inner.evictions.subscribe()
    }

    pub fn entry_info(&self, device_id: &str) -> Option<EntryInfo> {
        self.inner
            .slots
            .get(device_id)
            .map(|slot| slot.info(device_id))
    }

    /// Resolve a device id into a live connection, opening one if needed.
    ///
    /// `credential` absent means account-scoped access; `expiry` only applies
    /// to token-scoped requests. A live entry is reused unless it has expired
    /// or the request carries a different credential, in which case it is
    /// evicted and a new connection is opened.
    pub async fn resolve(
        &self,
        device_id: &str,
        credential: Option<&str>,
        expiry: Option<SystemTime>,
    ) -> Result<Arc<F::Connection>, ConnectionError> {
        if device_id.is_empty() {
            return Err(ConnectionError::MissingDeviceId);
        }
        let requested = credential
            .filter(|token| !token.is_empty())
            .map(|token| Credential::Token(token.to_owned()));

        loop {
            let now = self.inner.clock.now();
            let credential = requested.clone().unwrap_or(Credential::Account);
            let expires_at = match (&credential, expiry) {
                (Credential::Token(_), Some(at)) => at,
                _ => expiry_after(now, self.inner.settings.default_lifetime),
            };
            let stale = expires_at <= now;
            let replaces = |current: &Credential| requested.as_ref().is_some_and(|c| c != current);

            let step = match self.inner.slots.entry(device_id.to_owned()) {
                Entry::Occupied(occupied) => match occupied.get() {
                    Slot::Live(live) if live.is_expired(now) => {
                        Step::Evict(live.generation, EvictionReason::Expired)
                    }
                    Slot::Live(live) if replaces(&live.credential) => {
                        if stale {
                            Step::Reject
                        } else {
                            Step::Evict(live.generation, EvictionReason::Replaced)
                        }
                    }
                    Slot::Live(live) => return Ok(Arc::clone(&live.handle)),
                    Slot::Creating(flight) if stale && replaces(&flight.credential) => Step::Reject,
                    Slot::Creating(flight) => {
                        Step::Wait(flight.outcome.clone(), flight.credential.clone())
                    }
                },
                Entry::Vacant(_) if stale => Step::Reject,
                Entry::Vacant(vacant) => {
                    let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
                    let outcome = self.inner.start_flight(
                        device_id,
                        generation,
                        credential.clone(),
                        expires_at,
                    );
                    vacant.insert(Slot::Creating(Flight {
                        generation,
                        credential: credential.clone(),
                        expires_at,
                        outcome: outcome.clone(),
                    }));
                    Step::Wait(outcome, credential)
                }
            };

            match step {
                Step::Wait(outcome, flight_credential) => {
                    let handle = outcome.await?;
                    if requested.as_ref().is_none_or(|c| *c == flight_credential) {
                        return Ok(handle);
                    }
                    // Opened for someone else's credential; the next pass replaces it.
                }
                Step::Evict(generation, reason) => {
                    self.inner.evict(device_id, generation, reason).await;
                }
                Step::Reject => {
                    let error = ConnectionError::CredentialExpired {
                        device_id: device_id.to_owned(),
                    };
                    self.inner
                        .evictions
                        .notify(device_id, EvictionReason::CreationFailed);
                    warn!(device_id = %device_id, error = %error, "Refusing to connect device");
                    return Err(error);
                }
            }
        }
    }

    /// Evict the entry for `device_id` if it still holds `handle`.
    ///
    /// Used when a handle reports its connection lost. Returns false if the
    /// entry was already replaced or evicted.
    pub async fn invalidate_handle(&self, device_id: &str, handle: &Arc<F::Connection>) -> bool {
        let generation = match self.inner.slots.get(device_id).as_deref() {
            Some(Slot::Live(live)) if Arc::ptr_eq(&live.handle, handle) => live.generation,
            _ => return false,
        };
        self.inner
            .evict(device_id, generation, EvictionReason::Replaced)
            .await
    }

    /// Evict every live entry whose expiry has passed. Returns how many were evicted.
    pub async fn purge_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let expired: Vec<(String, u64)> = self
            .inner
            .slots
            .iter()
            .filter_map(|slot| match slot.value() {
                Slot::Live(live) if live.is_expired(now) => {
                    Some((slot.key().clone(), live.generation))
                }
                _ => None,
            })
            .collect();

        let mut evicted = 0;
        for (device_id, generation) in expired {
            if self
                .inner
                .evict(&device_id, generation, EvictionReason::Expired)
                .await
            {
                evicted += 1;
            }
        }
        evicted
    }

    /// Close every connection. Attempts still in flight end with
    /// [`ConnectionError::Aborted`]. Returns the number of live entries closed.
    pub async fn shutdown(&self) -> usize {
        let device_ids: Vec<String> = self
            .inner
            .slots
            .iter()
            .map(|slot| slot.key().clone())
            .collect();

        let mut closed = 0;
        for device_id in device_ids {
            match self.inner.take(&device_id, |_| true) {
                Some(Slot::Live(live)) => {
                    self.inner
                        .retire(&device_id, live, EvictionReason::Shutdown)
                        .await;
                    closed += 1;
                }
                Some(Slot::Creating(_)) => {
                    debug!(device_id = %device_id, "Dropped connection attempt on shutdown");
                }
                None => {}
            }
        }
        closed
    }
}

impl<F: ConnectionFactory> CacheInner<F> {
    /// The shared outcome of a new creation attempt.
    ///
    /// The factory call runs in its own task, spawned on first poll, so it
    /// completes even if every waiter goes away.
    fn start_flight(
        self: &Arc<Self>,
        device_id: &str,
        generation: u64,
        credential: Credential,
        expires_at: SystemTime,
    ) -> Outcome<F::Connection> {
        let cache = Arc::downgrade(self);
        let device_id = device_id.to_owned();

        async move {
            let aborted = ConnectionError::Aborted {
                device_id: device_id.clone(),
            };
            let Some(inner) = cache.upgrade() else {
                return Err(aborted);
            };

            let task = tokio::spawn(inner.create(
                device_id.clone(),
                generation,
                credential,
                expires_at,
            ));
            match task.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    debug!(device_id = %device_id, error = %join_error, "Connection task ended without an outcome");
                    match cache.upgrade() {
                        Some(inner) => Err(inner.abandon(&device_id, generation, aborted)),
                        None => Err(aborted),
                    }
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn create(
        self: Arc<Self>,
        device_id: String,
        generation: u64,
        credential: Credential,
        expires_at: SystemTime,
    ) -> Result<Arc<F::Connection>, ConnectionError> {
        let timeout = self.settings.open_timeout;
        let opened =
            tokio::time::timeout(timeout, self.factory.open(&device_id, &credential)).await;

        let connection = match opened {
            Ok(Ok(connection)) => Arc::new(connection),
            Ok(Err(e)) => {
                let error = ConnectionError::Factory {
                    device_id: device_id.clone(),
                    reason: e.to_string(),
                };
                return Err(self.abandon(&device_id, generation, error));
            }
            Err(_) => {
                let error = ConnectionError::Timeout {
                    device_id: device_id.clone(),
                    timeout,
                };
                return Err(self.abandon(&device_id, generation, error));
            }
        };

        self.promote(&device_id, generation, connection, credential, expires_at)
            .await
    }

    /// Turn the attempt's slot into a live entry.
    async fn promote(
        self: &Arc<Self>,
        device_id: &str,
        generation: u64,
        connection: Arc<F::Connection>,
        credential: Credential,
        expires_at: SystemTime,
    ) -> Result<Arc<F::Connection>, ConnectionError> {
        let remaining = expires_at
            .duration_since(self.clock.now())
            .unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            self.close_quietly(device_id, &connection).await;
            let error = ConnectionError::CredentialExpired {
                device_id: device_id.to_owned(),
            };
            return Err(self.abandon(device_id, generation, error));
        }

        let mode = credential.mode();
        let promoted = match self.slots.get_mut(device_id) {
            Some(mut slot) if slot.creating_generation() == Some(generation) => {
                *slot = Slot::Live(LiveEntry {
                    generation,
                    handle: Arc::clone(&connection),
                    credential,
                    expires_at,
                    timer: self.arm_expiry(device_id, generation, expires_at),
                });
                self.registry.add(device_id);
                true
            }
            _ => false,
        };

        if !promoted {
            // The attempt was discarded while the factory was running.
            self.close_quietly(device_id, &connection).await;
            return Err(ConnectionError::Aborted {
                device_id: device_id.to_owned(),
            });
        }

        info!(
            device_id = %device_id,
            mode = ?mode,
            expires_in_secs = remaining.as_secs(),
            "Connection to device established"
        );
        Ok(connection)
    }

    /// Drop the attempt's slot and report the failure.
    fn abandon(&self, device_id: &str, generation: u64, error: ConnectionError) -> ConnectionError {
        let discarded = self
            .take(device_id, |slot| slot.creating_generation() == Some(generation))
            .is_some();
        if discarded {
            self.evictions
                .notify(device_id, EvictionReason::CreationFailed);
        }
        warn!(device_id = %device_id, error = %error, "Failed to create device connection");
        error
    }

    fn arm_expiry(
        self: &Arc<Self>,
        device_id: &str,
        generation: u64,
        expires_at: SystemTime,
    ) -> AbortHandle {
        let cache: Weak<Self> = Arc::downgrade(self);
        let device_id = device_id.to_owned();

        tokio::spawn(async move {
            loop {
                let Some(inner) = cache.upgrade() else {
                    return;
                };
                let remaining = expires_at
                    .duration_since(inner.clock.now())
                    .unwrap_or(Duration::ZERO);
                drop(inner);

                if remaining.is_zero() {
                    break;
                }
                tokio::time::sleep(remaining).await;
            }

            if let Some(inner) = cache.upgrade() {
                inner
                    .evict(&device_id, generation, EvictionReason::Expired)
                    .await;
            }
        })
        .abort_handle()
    }

    /// Evict the live entry of this generation. Returns false if it is gone already.
    async fn evict(&self, device_id: &str, generation: u64, reason: EvictionReason) -> bool {
        match self.take(device_id, |slot| slot.live_generation() == Some(generation)) {
            Some(Slot::Live(live)) => {
                self.retire(device_id, live, reason).await;
                true
            }
            _ => false,
        }
    }

    /// Remove the slot if `matches` holds, unregistering the device under the same shard lock.
    fn take(
        &self,
        device_id: &str,
        matches: impl Fn(&Slot<F::Connection>) -> bool,
    ) -> Option<Slot<F::Connection>> {
        match self.slots.entry(device_id.to_owned()) {
            Entry::Occupied(slot) if matches(slot.get()) => {
                self.registry.remove(device_id);
                Some(slot.remove())
            }
            _ => None,
        }
    }

    async fn retire(&self, device_id: &str, live: LiveEntry<F::Connection>, reason: EvictionReason) {
        // An expiry eviction may be running on the timer task itself.
        if reason != EvictionReason::Expired {
            live.timer.abort();
        }
        self.evictions.notify(device_id, reason);
        info!(device_id = %device_id, reason = %reason, "Evicted device connection");

        self.close_quietly(device_id, &live.handle).await;
    }

    async fn close_quietly(&self, device_id: &str, connection: &F::Connection) {
        if let Err(e) = connection.close().await {
            warn!(device_id = %device_id, error = %e, "Failed to close device connection");
        }
    }
}
