// Identity cache gate: resolve idurl → identity with single-flight fetches

use super::{IdUrl, Identity, IdentityError, IdentityFetcher};
use crate::automat::Runtime;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub type ResolveCallback = Box<dyn FnOnce(Result<Arc<Identity>, IdentityError>) + Send>;

/// Cached identity documents of remote nodes.
///
/// Concurrent resolves of the same idurl share one fetch; callbacks always
/// run on the runtime's loop, never on the caller's stack.
#[derive(Clone)]
pub struct IdentityCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    runtime: Runtime,
    fetcher: Arc<dyn IdentityFetcher>,
    cached: RwLock<HashMap<IdUrl, Arc<Identity>>>,
    overrides: RwLock<HashMap<IdUrl, Arc<Identity>>>,
    in_flight: Mutex<HashMap<IdUrl, Vec<ResolveCallback>>>,
    fetches: AtomicU64,
}

impl IdentityCache {
    pub fn new(runtime: &Runtime, fetcher: Arc<dyn IdentityFetcher>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                runtime: runtime.clone(),
                fetcher,
                cached: RwLock::new(HashMap::new()),
                overrides: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                fetches: AtomicU64::new(0),
            }),
        }
    }

    /// Current document of `idurl`; an override wins over the cached copy.
    pub fn get(&self, idurl: &IdUrl) -> Option<Arc<Identity>> {
        if let Some(identity) = self.inner.overrides.read().get(idurl) {
            return Some(identity.clone());
        }
        self.inner.cached.read().get(idurl).cloned()
    }

    /// The cached copy, ignoring overrides.
    pub fn get_original(&self, idurl: &IdUrl) -> Option<Arc<Identity>> {
        self.inner.cached.read().get(idurl).cloned()
    }

    pub fn contains(&self, idurl: &IdUrl) -> bool {
        self.get(idurl).is_some()
    }

    /// Insert a document obtained some other way. It must validate.
    pub fn remember(&self, identity: Identity) -> Result<Arc<Identity>, IdentityError> {
        identity.validate()?;
        let identity = Arc::new(identity);
        let previous = self
            .inner
            .cached
            .write()
            .insert(identity.idurl().clone(), identity.clone());
        if previous.map_or(true, |p| p.revision() != identity.revision()) {
            debug!("Cached identity {}", identity);
        }
        Ok(identity)
    }

    pub fn forget(&self, idurl: &IdUrl) {
        self.inner.cached.write().remove(idurl);
    }

    /// Serve `identity` for its idurl instead of the cached copy.
    pub fn override_identity(&self, identity: Identity) -> Result<(), IdentityError> {
        identity.validate()?;
        info!("Identity override for {}", identity.idurl());
        self.inner
            .overrides
            .write()
            .insert(identity.idurl().clone(), Arc::new(identity));
        Ok(())
    }

    pub fn stop_override(&self, idurl: &IdUrl) -> bool {
        let removed = self.inner.overrides.write().remove(idurl).is_some();
        if removed {
            info!("Identity override for {} removed", idurl);
        }
        removed
    }

    pub fn is_overridden(&self, idurl: &IdUrl) -> bool {
        self.inner.overrides.read().contains_key(idurl)
    }

    /// How many network fetches were started so far.
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    pub fn is_fetching(&self, idurl: &IdUrl) -> bool {
        self.inner.in_flight.lock().contains_key(idurl)
    }

    /// Resolve `idurl`, fetching it when not cached.
    pub fn resolve(
        &self,
        idurl: &IdUrl,
        callback: impl FnOnce(Result<Arc<Identity>, IdentityError>) + Send + 'static,
    ) {
        if let Some(identity) = self.get(idurl) {
            self.inner.runtime.post(move || callback(Ok(identity)));
            return;
        }
        self.fetch(idurl, Box::new(callback));
    }

    /// Fetch `idurl` again even when cached.
    pub fn refresh(
        &self,
        idurl: &IdUrl,
        callback: impl FnOnce(Result<Arc<Identity>, IdentityError>) + Send + 'static,
    ) {
        self.fetch(idurl, Box::new(callback));
    }

    pub async fn resolve_async(&self, idurl: &IdUrl) -> Result<Arc<Identity>, IdentityError> {
        let (tx, rx) = oneshot::channel();
        self.resolve(idurl, move |result| {
            let _ = tx.send(result);
        });
        rx.await.map_err(|_| IdentityError::FetchFailed {
            idurl: idurl.clone(),
            reason: "resolver dropped".to_string(),
        })?
    }

    fn fetch(&self, idurl: &IdUrl, callback: ResolveCallback) {
        {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(waiters) = in_flight.get_mut(idurl) {
                debug!("Joining in-flight fetch of {}", idurl);
                waiters.push(callback);
                return;
            }
            in_flight.insert(idurl.clone(), vec![callback]);
        }
        self.inner.fetches.fetch_add(1, Ordering::SeqCst);

        let urls = match self.get_original(idurl) {
            Some(known) => known.source_urls(),
            None => vec![idurl.clone()],
        };
        let fetcher = self.inner.fetcher.clone();
        let cache = self.clone();
        let target = idurl.clone();
        debug!("Fetching identity {} from {} source(s)", idurl, urls.len());
        self.inner.runtime.spawn_io(
            async move {
                let mut last_error = None;
                for url in &urls {
                    match fetcher.fetch(url).await {
                        Ok(body) => return Ok(body),
                        Err(e) => {
                            debug!("Source {} failed: {}", url, e);
                            last_error = Some(e);
                        }
                    }
                }
                Err(last_error.unwrap_or(IdentityError::NotCached(target)))
            },
            {
                let idurl = idurl.clone();
                move |result| cache.fetch_finished(idurl, result)
            },
        );
    }

    fn fetch_finished(&self, idurl: IdUrl, body: Result<Vec<u8>, IdentityError>) {
        // The entry goes before any callback runs so callbacks may resolve again.
        let waiters = self.inner.in_flight.lock().remove(&idurl).unwrap_or_default();

        let result = body.and_then(|bytes| self.accept(&idurl, &bytes));
        match &result {
            Ok(identity) => debug!("Resolved {} for {} caller(s)", identity, waiters.len()),
            Err(e) => warn!("Identity fetch of {} failed: {}", idurl, e),
        }
        for waiter in waiters {
            waiter(result.clone());
        }
    }

    fn accept(&self, idurl: &IdUrl, bytes: &[u8]) -> Result<Arc<Identity>, IdentityError> {
        let identity = Identity::from_json(bytes)?;
        if identity.idurl() != idurl {
            return Err(IdentityError::Mismatch {
                expected: idurl.clone(),
                found: identity.idurl().clone(),
            });
        }
        self.remember(identity)?;
        self.get(idurl).ok_or_else(|| IdentityError::NotCached(idurl.clone()))
    }
}

impl std::fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCache")
            .field("cached", &self.inner.cached.read().len())
            .field("overrides", &self.inner.overrides.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Contact, IdentityKeys};
    use crate::transport::Protocol;
    use async_trait::async_trait;

    struct MapFetcher {
        documents: RwLock<HashMap<IdUrl, Vec<u8>>>,
    }

    #[async_trait]
    impl IdentityFetcher for MapFetcher {
        async fn fetch(&self, url: &IdUrl) -> Result<Vec<u8>, IdentityError> {
            tokio::task::yield_now().await;
            self.documents
                .read()
                .get(url)
                .cloned()
                .ok_or_else(|| IdentityError::FetchFailed {
                    idurl: url.clone(),
                    reason: "404".into(),
                })
        }
    }

    fn identity(keys: &IdentityKeys, name: &str, revision: u64) -> Identity {
        Identity::create(
            keys,
            IdUrl::from(format!("http://id.example/{}.xml", name)),
            vec![],
            vec![Contact::new(Protocol::Tcp, format!("{}:7771", name))],
            revision,
        )
    }

    fn cache_with(documents: Vec<(IdUrl, Vec<u8>)>) -> (Runtime, IdentityCache) {
        let runtime = Runtime::new();
        let fetcher = Arc::new(MapFetcher {
            documents: RwLock::new(documents.into_iter().collect()),
        });
        let cache = IdentityCache::new(&runtime, fetcher);
        (runtime, cache)
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_fetch() {
        let keys = IdentityKeys::generate();
        let bob = identity(&keys, "bob", 1);
        let (runtime, cache) = cache_with(vec![(bob.idurl().clone(), bob.to_json().unwrap())]);

        let results = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..5 {
            let results = results.clone();
            cache.resolve(bob.idurl(), move |r| results.lock().push(r));
        }
        assert!(results.lock().is_empty(), "callbacks never run on the caller's stack");
        runtime.settle().await;

        assert_eq!(cache.fetch_count(), 1);
        let results = results.lock();
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.as_ref().unwrap().revision() == 1));
        assert!(cache.contains(bob.idurl()));
    }

    #[tokio::test]
    async fn test_failure_reaches_every_caller_once() {
        let (runtime, cache) = cache_with(vec![]);
        let idurl = IdUrl::from("http://id.example/ghost.xml");

        let errors = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let errors = errors.clone();
            cache.resolve(&idurl, move |r| errors.lock().push(r.unwrap_err()));
        }
        runtime.settle().await;

        assert_eq!(errors.lock().len(), 3);
        assert!(!cache.is_fetching(&idurl));

        cache.resolve(&idurl, |_| {});
        runtime.settle().await;
        assert_eq!(cache.fetch_count(), 2, "a later resolve starts a new fetch");
    }

    #[tokio::test]
    async fn test_invalid_document_does_not_replace_cached_copy() {
        let keys = IdentityKeys::generate();
        let bob = identity(&keys, "bob", 1);
        let mut forged = serde_json::to_value(identity(&keys, "bob", 2)).unwrap();
        forged["revision"] = serde_json::json!(3);
        let (runtime, cache) = cache_with(vec![(
            bob.idurl().clone(),
            serde_json::to_vec(&forged).unwrap(),
        )]);
        cache.remember(bob.clone()).unwrap();

        let outcome = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        cache.refresh(bob.idurl(), move |r| *slot.lock() = Some(r));
        runtime.settle().await;

        assert!(matches!(
            outcome.lock().take(),
            Some(Err(IdentityError::BadSignature(_)))
        ));
        assert_eq!(cache.get(bob.idurl()).unwrap().revision(), 1);
    }

    #[tokio::test]
    async fn test_overrides_take_precedence() {
        let keys = IdentityKeys::generate();
        let original = identity(&keys, "carol", 1);
        let (_runtime, cache) = cache_with(vec![]);
        cache.remember(original.clone()).unwrap();

        let routed = original.with_contacts(&keys, vec![Contact::new(Protocol::Udp, "1.2.3.4:9")]);
        cache.override_identity(routed).unwrap();
        assert_eq!(cache.get(original.idurl()).unwrap().revision(), 2);
        assert_eq!(cache.get_original(original.idurl()).unwrap().revision(), 1);

        assert!(cache.stop_override(original.idurl()));
        assert_eq!(cache.get(original.idurl()).unwrap().revision(), 1);
        assert!(!cache.stop_override(original.idurl()));
    }

    #[tokio::test]
    async fn test_mismatched_document_is_rejected() {
        let keys = IdentityKeys::generate();
        let dave = identity(&keys, "dave", 1);
        let asked = IdUrl::from("http://id.example/eve.xml");
        let (_runtime, cache) = cache_with(vec![(asked.clone(), dave.to_json().unwrap())]);
        let runtime = cache.inner.runtime.clone();

        let task = tokio::spawn({
            let cache = cache.clone();
            let asked = asked.clone();
            async move { cache.resolve_async(&asked).await }
        });
        runtime.settle().await;
        let result = task.await.unwrap();
        assert!(matches!(result, Err(IdentityError::Mismatch { .. })));
        assert!(!cache.contains(&asked));
    }
}
