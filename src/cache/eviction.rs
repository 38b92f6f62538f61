use std::fmt;

use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    /// The entry's expiry instant was reached.
    Expired,
    /// A different credential arrived for the device, or the caller invalidated the handle.
    Replaced,
    /// The creation attempt failed; the entry never became live.
    CreationFailed,
    /// The cache was shut down.
    Shutdown,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            EvictionReason::Expired => "expired",
            EvictionReason::Replaced => "replaced",
            EvictionReason::CreationFailed => "creation-failed",
            EvictionReason::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionEvent {
    pub device_id: String,
    pub reason: EvictionReason,
}

/// Fan-out of eviction events to any number of observers.
#[derive(Debug)]
pub(crate) struct EvictionNotifier {
    sender: broadcast::Sender<EvictionEvent>,
}

impl EvictionNotifier {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<EvictionEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn notify(&self, device_id: &str, reason: EvictionReason) {
        // No subscribers is fine.
        let _ = self.sender.send(EvictionEvent {
            device_id: device_id.to_owned(),
            reason,
        });
    }
}
