// Runtime: the event loop and instance registry shared by every machine

use super::machine::{Automat, Shared};
use super::Machine;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Quiet rounds `settle()` waits for before it decides the loop is idle.
const SETTLE_QUIET_ROUNDS: usize = 16;

/// Unit of work executed on the event loop.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

type StateHook = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Notification emitted for every state change of every machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub id: u64,
    pub name: String,
    pub old: String,
    pub new: String,
}

/// Snapshot of one registered machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub id: u64,
    pub name: String,
    pub state: String,
}

/// Type-erased view of a registered machine.
pub(crate) trait Registered: Send + Sync {
    fn id(&self) -> u64;
    fn name(&self) -> &str;
    fn state_label(&self) -> String;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Explicit runtime context: event queue, machine registry, global hooks.
///
/// Cloning is cheap; all clones drive the same loop. Independent runtimes
/// never see each other's machines.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    next_id: AtomicU64,
    registry: Mutex<HashMap<u64, Arc<dyn Registered>>>,
    tx: mpsc::UnboundedSender<Task>,
    rx: Mutex<mpsc::UnboundedReceiver<Task>>,
    hooks: Mutex<Vec<StateHook>>,
}

impl Runtime {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(RuntimeInner {
                next_id: AtomicU64::new(1),
                registry: Mutex::new(HashMap::new()),
                tx,
                rx: Mutex::new(rx),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Queue a task on the event loop. Never runs it on the caller's stack.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        if self.inner.tx.send(Box::new(task)).is_err() {
            warn!("Event loop is gone, task dropped");
        }
    }

    /// Run `fut` off the loop and deliver its output back on the loop.
    pub fn spawn_io<F, T, D>(&self, fut: F, deliver: D)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        D: FnOnce(T) + Send + 'static,
    {
        let runtime = self.clone();
        tokio::spawn(async move {
            let output = fut.await;
            runtime.post(move || deliver(output));
        });
    }

    /// Run a blocking closure on the blocking pool and deliver its result on the loop.
    pub fn spawn_blocking<F, T, D>(&self, work: F, deliver: D)
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
        D: FnOnce(T) + Send + 'static,
    {
        let runtime = self.clone();
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(work).await {
                Ok(output) => runtime.post(move || deliver(output)),
                Err(e) => warn!("Blocking task failed: {}", e),
            }
        });
    }

    /// Execute queued tasks until the queue is empty. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut executed = 0;
        loop {
            // The receiver lock is released before the task runs.
            let next = self.inner.rx.lock().try_recv().ok();
            match next {
                Some(task) => {
                    task();
                    executed += 1;
                }
                None => return executed,
            }
        }
    }

    /// Drain the queue, yielding to the tokio scheduler in between, until
    /// nothing new arrives for a while.
    pub async fn settle(&self) {
        let mut quiet = 0;
        while quiet < SETTLE_QUIET_ROUNDS {
            if self.run_until_idle() == 0 {
                quiet += 1;
            } else {
                quiet = 0;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Drive the loop forever.
    pub async fn run(&self) {
        loop {
            let next = futures::future::poll_fn(|cx| self.inner.rx.lock().poll_recv(cx)).await;
            match next {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Spawn [`Runtime::run`] on the current tokio runtime.
    pub fn start(&self) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move { runtime.run().await })
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn register(&self, entry: Arc<dyn Registered>) {
        trace!("Registered {}({})", entry.name(), entry.id());
        self.inner.registry.lock().insert(entry.id(), entry);
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.inner.registry.lock().remove(&id);
    }

    /// Find a live machine of type `M` by id.
    pub fn lookup<M: Machine>(&self, id: u64) -> Option<Automat<M>> {
        let entry = self.inner.registry.lock().get(&id).cloned()?;
        entry
            .as_any()
            .downcast::<Shared<M>>()
            .ok()
            .map(Automat::from_shared)
    }

    /// Ids of every live machine with the given name.
    pub fn find(&self, name: &str) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .inner
            .registry
            .lock()
            .values()
            .filter(|entry| entry.name() == name)
            .map(|entry| entry.id())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_alive(&self, id: u64) -> bool {
        self.inner.registry.lock().contains_key(&id)
    }

    pub fn instances(&self) -> Vec<InstanceInfo> {
        let entries: Vec<Arc<dyn Registered>> =
            self.inner.registry.lock().values().cloned().collect();
        let mut infos: Vec<InstanceInfo> = entries
            .iter()
            .map(|entry| InstanceInfo {
                id: entry.id(),
                name: entry.name().to_string(),
                state: entry.state_label(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Register a hook called after any machine of this runtime changes state.
    pub fn add_state_hook(&self, hook: impl Fn(&StateChange) + Send + Sync + 'static) {
        self.inner.hooks.lock().push(Arc::new(hook));
    }

    pub(crate) fn notify_state_change(&self, change: StateChange) {
        let hooks: Vec<StateHook> = self.inner.hooks.lock().clone();
        for hook in hooks {
            hook(&change);
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("instances", &self.inner.registry.lock().len())
            .finish()
    }
}
