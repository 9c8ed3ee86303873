//! Peer directory
//!
//! The delivery core treats the DHT as an opaque lookup service: it needs a
//! random peer to try as proxy router, and identity documents by idurl.

use crate::identity::{IdUrl, Identity, IdentityError};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::sync::Arc;

#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Some reachable peer not listed in `exclude`.
    async fn find_random_peer(&self, exclude: &[IdUrl]) -> Option<IdUrl>;

    /// The published identity document of `idurl`.
    async fn lookup(&self, idurl: &IdUrl) -> Option<Vec<u8>>;

    /// Make a new revision of our own identity visible to others.
    fn announce(&self, _identity: &Identity) -> Result<(), IdentityError> {
        Ok(())
    }
}

/// In-process directory with an explicit peer list.
#[derive(Clone, Default)]
pub struct StaticDirectory {
    documents: Arc<RwLock<BTreeMap<IdUrl, Vec<u8>>>>,
    /// Peers offered by `find_random_peer`
    routers: Arc<RwLock<Vec<IdUrl>>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, identity: &Identity) -> Result<(), IdentityError> {
        self.documents
            .write()
            .insert(identity.idurl().clone(), identity.to_json()?);
        Ok(())
    }

    /// Store raw bytes under `idurl`, valid or not.
    pub fn publish_raw(&self, idurl: IdUrl, document: Vec<u8>) {
        self.documents.write().insert(idurl, document);
    }

    pub fn unpublish(&self, idurl: &IdUrl) {
        self.documents.write().remove(idurl);
    }

    pub fn add_router(&self, idurl: IdUrl) {
        let mut routers = self.routers.write();
        if !routers.contains(&idurl) {
            routers.push(idurl);
        }
    }
}

#[async_trait]
impl PeerDirectory for StaticDirectory {
    async fn find_random_peer(&self, exclude: &[IdUrl]) -> Option<IdUrl> {
        let candidates: Vec<IdUrl> = self
            .routers
            .read()
            .iter()
            .filter(|peer| !exclude.contains(peer))
            .cloned()
            .collect();
        candidates.choose(&mut rand::thread_rng()).cloned()
    }

    async fn lookup(&self, idurl: &IdUrl) -> Option<Vec<u8>> {
        self.documents.read().get(idurl).cloned()
    }

    fn announce(&self, identity: &Identity) -> Result<(), IdentityError> {
        self.publish(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeys;

    #[tokio::test]
    async fn test_random_peer_respects_exclusions() {
        let directory = StaticDirectory::new();
        assert!(directory.find_random_peer(&[]).await.is_none());

        directory.add_router(IdUrl::from("http://id/r1"));
        directory.add_router(IdUrl::from("http://id/r2"));
        let picked = directory
            .find_random_peer(&[IdUrl::from("http://id/r1")])
            .await;
        assert_eq!(picked, Some(IdUrl::from("http://id/r2")));
    }

    #[tokio::test]
    async fn test_publish_and_lookup() {
        let directory = StaticDirectory::new();
        let keys = IdentityKeys::generate();
        let identity = Identity::create(&keys, IdUrl::from("http://id/a"), vec![], vec![], 1);
        directory.publish(&identity).unwrap();

        let raw = directory.lookup(identity.idurl()).await.unwrap();
        assert_eq!(Identity::from_json(&raw).unwrap(), identity);

        directory.unpublish(identity.idurl());
        assert!(directory.lookup(identity.idurl()).await.is_none());
    }
}
