//! Outgoing peer resolution. A client-kind span's attributes may identify
//! an external service that emits no telemetry of its own; the resolver
//! (owned by the surrounding application) maps those attributes to a peer
//! name, and the repository materializes the peer as a resource with no
//! instance id. Resolution is repeated for stored spans whenever the
//! resolver signals a change.

use tokio::sync::watch;

use crate::repo::attributes::KeyValuePair;

pub trait OutgoingPeerResolver: Send + Sync {
    /// Maps a span's limited attributes to the name of an uninstrumented
    /// peer, or `None` when the attributes name nothing known.
    fn resolve_peer(&self, attributes: &[KeyValuePair]) -> Option<String>;

    /// Change signal. Each observed version bump triggers re-resolution of
    /// every stored client-kind span.
    fn subscribe_changes(&self) -> watch::Receiver<u64>;
}

/// Resolver that never matches; used when the application has no peer
/// configuration.
pub struct NoopOutgoingPeerResolver {
    changes: watch::Sender<u64>,
}

impl Default for NoopOutgoingPeerResolver {
    fn default() -> Self {
        let (changes, _) = watch::channel(0);
        Self { changes }
    }
}

impl NoopOutgoingPeerResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutgoingPeerResolver for NoopOutgoingPeerResolver {
    fn resolve_peer(&self, _attributes: &[KeyValuePair]) -> Option<String> {
        None
    }

    fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
