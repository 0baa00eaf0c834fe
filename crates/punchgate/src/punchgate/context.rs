use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};

use crate::punchgate::{bootstrap::Directory, config::Config, ids::PeerId};

/// Per-proxy shared state handed to every component at construction.
///
/// The directory and this node's own identity live here instead of in
/// process-wide statics, so two proxies in one process never share them.
pub struct ProxyContext {
    pub config: Arc<Config>,
    directory: ArcSwap<Directory>,
    identity: ArcSwapOption<PeerId>,
}

impl std::fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyContext")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

impl ProxyContext {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            directory: ArcSwap::from_pointee(Directory::default()),
            identity: ArcSwapOption::empty(),
        })
    }

    pub fn directory(&self) -> Arc<Directory> {
        self.directory.load_full()
    }

    /// Replaces the whole directory; readers see either the old or the new one.
    pub fn install_directory(&self, dir: Directory) {
        tracing::info!(
            hangouts = dir.hangouts.len(),
            peers = dir.peers.len(),
            "bootstrap: directory installed"
        );
        self.directory.store(Arc::new(dir));
    }

    pub fn identity(&self) -> Option<PeerId> {
        self.identity.load_full().map(|id| (*id).clone())
    }

    pub fn set_identity(&self, id: PeerId) {
        self.identity.store(Some(Arc::new(id)));
    }

    pub fn is_self(&self, peer: &PeerId) -> bool {
        self.identity
            .load()
            .as_deref()
            .is_some_and(|own| own == peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_per_context() {
        let a = ProxyContext::new(Config::default());
        let b = ProxyContext::new(Config::default());
        a.set_identity(PeerId::from("alice"));

        assert_eq!(a.identity(), Some(PeerId::from("alice")));
        assert!(a.is_self(&PeerId::from("alice")));
        assert!(!a.is_self(&PeerId::from("bob")));
        assert_eq!(b.identity(), None);
    }
}
