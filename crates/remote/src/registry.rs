//! Process-wide registries shared by every mounted client.
//!
//! Both registries outlive individual client instances: the same token can be
//! mounted, unmounted and remounted in quick succession, and neither a
//! duplicate connect nor a retry against a permanently failed token may
//! result from that churn.

use once_cell::sync::Lazy;
use sessionview_core::{CapabilityToken, ProtocolFamily};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

/// Identifies one client instance holding a registry entry.
pub type OwnerId = u64;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Global registries used when no explicit instance is injected.
static GLOBAL: Lazy<Arc<Registries>> = Lazy::new(|| Arc::new(Registries::new()));

pub fn next_owner_id() -> OwnerId {
    NEXT_OWNER.fetch_add(1, Ordering::SeqCst)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tokens known to be permanently unusable.
#[derive(Default)]
pub struct FatalErrorSet {
    tokens: Mutex<HashSet<CapabilityToken>>,
}

impl FatalErrorSet {
    /// Returns true only the first time a token is marked.
    pub fn mark(&self, token: &CapabilityToken) -> bool {
        lock(&self.tokens).insert(token.clone())
    }

    pub fn contains(&self, token: &CapabilityToken) -> bool {
        lock(&self.tokens).contains(token)
    }

    pub fn len(&self) -> usize {
        lock(&self.tokens).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self) {
        lock(&self.tokens).clear();
    }
}

struct Registration {
    owner: OwnerId,
    /// Flipped to true when another instance takes the token over.
    evict: watch::Sender<bool>,
}

/// At most one live session per token.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<CapabilityToken, Registration>>,
}

impl ConnectionRegistry {
    /// Register `owner` for `token`, tearing down whichever instance held it.
    ///
    /// Returns the evicted owner, if any.
    pub fn register(
        &self,
        token: &CapabilityToken,
        owner: OwnerId,
        evict: watch::Sender<bool>,
    ) -> Option<OwnerId> {
        let previous = lock(&self.entries).insert(token.clone(), Registration { owner, evict });
        previous.map(|prev| {
            debug!(token = %token, evicted = prev.owner, owner, "Replacing registered session");
            let _ = prev.evict.send(true);
            prev.owner
        })
    }

    /// Tear down and forget whatever is registered for `token`.
    pub fn evict(&self, token: &CapabilityToken) -> Option<OwnerId> {
        let previous = lock(&self.entries).remove(token);
        previous.map(|prev| {
            let _ = prev.evict.send(true);
            prev.owner
        })
    }

    /// Remove the entry only when `owner` still holds it.
    pub fn remove_if_owner(&self, token: &CapabilityToken, owner: OwnerId) -> bool {
        let mut entries = lock(&self.entries);
        match entries.get(token) {
            Some(reg) if reg.owner == owner => {
                entries.remove(token);
                true
            }
            _ => false,
        }
    }

    pub fn owner_of(&self, token: &CapabilityToken) -> Option<OwnerId> {
        lock(&self.entries).get(token).map(|reg| reg.owner)
    }

    pub fn is_owner(&self, token: &CapabilityToken, owner: OwnerId) -> bool {
        self.owner_of(token) == Some(owner)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self) {
        let drained: Vec<Registration> = lock(&self.entries).drain().map(|(_, reg)| reg).collect();
        for reg in drained {
            let _ = reg.evict.send(true);
        }
    }
}

/// Fatal-error sets and connection registries for every protocol family.
#[derive(Default)]
pub struct Registries {
    screencast_fatal: FatalErrorSet,
    framebuffer_fatal: FatalErrorSet,
    terminal_fatal: FatalErrorSet,
    screencast_connections: ConnectionRegistry,
    framebuffer_connections: ConnectionRegistry,
    terminal_connections: ConnectionRegistry,
}

impl Registries {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide instance.
    pub fn global() -> Arc<Registries> {
        GLOBAL.clone()
    }

    pub fn fatal(&self, family: ProtocolFamily) -> &FatalErrorSet {
        match family {
            ProtocolFamily::Screencast => &self.screencast_fatal,
            ProtocolFamily::Framebuffer => &self.framebuffer_fatal,
            ProtocolFamily::Terminal => &self.terminal_fatal,
        }
    }

    pub fn connections(&self, family: ProtocolFamily) -> &ConnectionRegistry {
        match family {
            ProtocolFamily::Screencast => &self.screencast_connections,
            ProtocolFamily::Framebuffer => &self.framebuffer_connections,
            ProtocolFamily::Terminal => &self.terminal_connections,
        }
    }

    /// Forget every fatal token and evict every registered session.
    pub fn reset(&self) {
        for family in ProtocolFamily::ALL {
            self.fatal(family).clear();
            self.connections(family).clear();
        }
    }
}

/// A client's claim on one registry entry.
#[derive(Clone)]
pub(crate) struct Ownership {
    pub registries: Arc<Registries>,
    pub family: ProtocolFamily,
    pub token: CapabilityToken,
    pub owner: OwnerId,
}

impl Ownership {
    pub fn is_fatal(&self) -> bool {
        self.registries.fatal(self.family).contains(&self.token)
    }

    pub fn mark_fatal(&self) -> bool {
        self.registries.fatal(self.family).mark(&self.token)
    }

    pub fn is_current(&self) -> bool {
        self.registries.connections(self.family).is_owner(&self.token, self.owner)
    }

    pub fn release(&self) -> bool {
        self.registries
            .connections(self.family)
            .remove_if_owner(&self.token, self.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(s: &str) -> CapabilityToken {
        CapabilityToken::new(s)
    }

    #[test]
    fn test_fatal_mark_is_reported_once() {
        let set = FatalErrorSet::default();
        assert!(set.mark(&token("bad")));
        assert!(!set.mark(&token("bad")));
        assert!(set.contains(&token("bad")));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_register_evicts_previous_owner() {
        let registry = ConnectionRegistry::default();
        let (tx1, rx1) = watch::channel(false);
        let (tx2, rx2) = watch::channel(false);

        assert_eq!(registry.register(&token("t"), 1, tx1), None);
        assert_eq!(registry.register(&token("t"), 2, tx2), Some(1));

        assert!(*rx1.borrow());
        assert!(!*rx2.borrow());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.owner_of(&token("t")), Some(2));
    }

    #[test]
    fn test_stale_teardown_does_not_evict_newer_session() {
        let registry = ConnectionRegistry::default();
        let (tx1, _rx1) = watch::channel(false);
        let (tx2, _rx2) = watch::channel(false);
        registry.register(&token("t"), 1, tx1);
        registry.register(&token("t"), 2, tx2);

        assert!(!registry.remove_if_owner(&token("t"), 1));
        assert!(registry.is_owner(&token("t"), 2));
        assert!(registry.remove_if_owner(&token("t"), 2));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_many_registrations_settle_to_one() {
        let registry = ConnectionRegistry::default();
        let mut receivers = Vec::new();
        for owner in 1..=10 {
            let (tx, rx) = watch::channel(false);
            registry.register(&token("same"), owner, tx);
            receivers.push(rx);
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.owner_of(&token("same")), Some(10));
        let evicted = receivers.iter().filter(|rx| *rx.borrow()).count();
        assert_eq!(evicted, 9);
    }

    #[test]
    fn test_reset_signals_and_clears() {
        let registries = Registries::new();
        let (tx, rx) = watch::channel(false);
        registries
            .connections(ProtocolFamily::Terminal)
            .register(&token("t"), 7, tx);
        registries.fatal(ProtocolFamily::Screencast).mark(&token("x"));

        registries.reset();

        assert!(*rx.borrow());
        assert!(registries.connections(ProtocolFamily::Terminal).is_empty());
        assert!(registries.fatal(ProtocolFamily::Screencast).is_empty());
    }

    #[test]
    fn test_families_are_independent() {
        let registries = Registries::new();
        registries.fatal(ProtocolFamily::Framebuffer).mark(&token("t"));
        assert!(!registries.fatal(ProtocolFamily::Screencast).contains(&token("t")));
        assert!(registries.fatal(ProtocolFamily::Framebuffer).contains(&token("t")));
    }
}
