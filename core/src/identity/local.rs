// The node's own identity document

use super::{Contact, IdUrl, Identity, IdentityKeys};
use crate::crypto::KeyRing;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::info;

type ChangeHook = Arc<dyn Fn(&Arc<Identity>) + Send + Sync>;

struct LocalInner {
    keyring: KeyRing,
    current: RwLock<Arc<Identity>>,
    hooks: Mutex<Vec<ChangeHook>>,
}

/// Signed identity of this node. Every re-signed revision is handed to the
/// registered hooks, which typically publish it.
#[derive(Clone)]
pub struct LocalIdentity {
    inner: Arc<LocalInner>,
}

impl LocalIdentity {
    pub fn new(keys: IdentityKeys, idurl: IdUrl, contacts: Vec<Contact>) -> Self {
        let identity = Identity::create(&keys, idurl.clone(), vec![idurl], contacts, 1);
        Self::from_identity(KeyRing::new(keys), identity)
    }

    pub fn from_identity(keyring: KeyRing, identity: Identity) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                keyring,
                current: RwLock::new(Arc::new(identity)),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn idurl(&self) -> IdUrl {
        self.inner.current.read().idurl().clone()
    }

    pub fn keyring(&self) -> &KeyRing {
        &self.inner.keyring
    }

    pub fn get(&self) -> Arc<Identity> {
        self.inner.current.read().clone()
    }

    /// Re-sign with new contacts unless they are already current.
    pub fn set_contacts(&self, contacts: Vec<Contact>) -> Arc<Identity> {
        let updated = {
            let mut current = self.inner.current.write();
            if current.contacts() == contacts.as_slice() {
                return current.clone();
            }
            let updated = Arc::new(current.with_contacts(self.inner.keyring.keys(), contacts));
            *current = updated.clone();
            updated
        };
        info!(
            "Local identity {} now at revision {} with {} contact(s)",
            updated.idurl(),
            updated.revision(),
            updated.contacts().len()
        );
        let hooks: Vec<ChangeHook> = self.inner.hooks.lock().clone();
        for hook in hooks {
            hook(&updated);
        }
        updated
    }

    /// Called with every new revision.
    pub fn on_change(&self, hook: impl Fn(&Arc<Identity>) + Send + Sync + 'static) {
        self.inner.hooks.lock().push(Arc::new(hook));
    }
}
