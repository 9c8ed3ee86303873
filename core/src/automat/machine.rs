// Automat: one registered state machine instance

use super::runtime::{Registered, Runtime, StateChange};
use super::{Machine, StateFilter, TimerSpec};
use parking_lot::{Mutex, MutexGuard};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

type ObserverFn<S> = Arc<dyn Fn(S, S) + Send + Sync>;

/// Handle returned by [`Automat::add_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Observer<S> {
    id: ObserverId,
    filter: StateFilter<S>,
    callback: ObserverFn<S>,
}

struct Core<M: Machine> {
    machine: M,
    timers: Vec<TimerSpec<M>>,
    armed: Vec<JoinHandle<()>>,
}

pub(crate) struct Shared<M: Machine> {
    id: u64,
    name: String,
    runtime: Runtime,
    fast: bool,
    state: Mutex<M::State>,
    core: Mutex<Core<M>>,
    observers: Mutex<Vec<Observer<M::State>>>,
    next_observer: AtomicU64,
    timer_epoch: AtomicU64,
    destroyed: AtomicBool,
    destroy_pending: AtomicBool,
}

impl<M: Machine> Registered for Shared<M> {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn state_label(&self) -> String {
        format!("{:?}", *self.state.lock())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Handle to a running state machine. Clones share the same instance.
pub struct Automat<M: Machine> {
    shared: Arc<Shared<M>>,
}

impl<M: Machine> Clone for Automat<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: Machine> fmt::Debug for Automat<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({})[{:?}]",
            self.shared.name,
            self.shared.id,
            *self.shared.state.lock()
        )
    }
}

/// Passed to every transition; lets actions post follow-up events and
/// request their own destruction.
pub struct Context<'a, M: Machine> {
    automat: &'a Automat<M>,
    destroy: bool,
}

impl<'a, M: Machine> Context<'a, M> {
    pub fn id(&self) -> u64 {
        self.automat.id()
    }

    pub fn handle(&self) -> Automat<M> {
        self.automat.clone()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.automat.shared.runtime
    }

    /// Queue an event for this machine; it runs after the current transition.
    pub fn post(&self, event: M::Event) {
        self.automat.post(event);
    }

    /// Destroy the machine once the current transition completes.
    pub fn destroy(&mut self) {
        self.destroy = true;
    }
}

impl<M: Machine> Automat<M> {
    /// Build a machine that queues every posted event on the loop.
    pub fn new(runtime: &Runtime, name: impl Into<String>, initial: M::State, machine: M) -> Self {
        Self::build(runtime, name.into(), initial, machine, false)
    }

    /// Build a machine that handles posted events synchronously when possible.
    pub fn new_fast(
        runtime: &Runtime,
        name: impl Into<String>,
        initial: M::State,
        machine: M,
    ) -> Self {
        Self::build(runtime, name.into(), initial, machine, true)
    }

    fn build(runtime: &Runtime, name: String, initial: M::State, machine: M, fast: bool) -> Self {
        let timers = machine.timers();
        let shared = Arc::new(Shared {
            id: runtime.next_id(),
            name,
            runtime: runtime.clone(),
            fast,
            state: Mutex::new(initial),
            core: Mutex::new(Core {
                machine,
                timers,
                armed: Vec::new(),
            }),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            timer_epoch: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            destroy_pending: AtomicBool::new(false),
        });
        runtime.register(shared.clone());
        let automat = Self { shared };
        {
            let mut core = automat.shared.core.lock();
            automat.arm_timers(&mut core, initial);
        }
        debug!("{:?} created", automat);
        automat
    }

    pub(crate) fn from_shared(shared: Arc<Shared<M>>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> M::State {
        *self.shared.state.lock()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.shared.runtime
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Post an event. Queued unless the machine is fast and idle.
    pub fn post(&self, event: M::Event) {
        if self.shared.fast {
            if let Some(core) = self.shared.core.try_lock() {
                self.dispatch_locked(core, event);
                return;
            }
        }
        let this = self.clone();
        self.shared.runtime.post(move || this.dispatch(event));
    }

    /// Run the machine inside a closure with exclusive access to its data.
    pub fn with<R>(&self, f: impl FnOnce(&M) -> R) -> R {
        let core = self.shared.core.lock();
        f(&core.machine)
    }

    fn dispatch(&self, event: M::Event) {
        let core = self.shared.core.lock();
        self.dispatch_locked(core, event);
    }

    fn dispatch_locked(&self, mut core: MutexGuard<'_, Core<M>>, event: M::Event) {
        if self.is_destroyed() {
            trace!("{}({}) destroyed, dropping {:?}", self.shared.name, self.shared.id, event);
            return;
        }
        let old = self.state();
        trace!("{}({}) {:?} <- {:?}", self.shared.name, self.shared.id, old, event);

        let mut ctx = Context {
            automat: self,
            destroy: false,
        };
        let new = core.machine.transition(&mut ctx, old, event);
        *self.shared.state.lock() = new;

        if new != old {
            core.machine.state_changed(&mut ctx, old, new);
            if !ctx.destroy && !self.shared.destroy_pending.load(Ordering::SeqCst) {
                self.arm_timers(&mut core, new);
            }
        } else {
            core.machine.state_not_changed(&mut ctx, new);
        }
        let destroy = ctx.destroy || self.shared.destroy_pending.swap(false, Ordering::SeqCst);
        drop(core);

        if new != old {
            debug!("{}({}): {:?} -> {:?}", self.shared.name, self.shared.id, old, new);
            let callbacks: Vec<ObserverFn<M::State>> = self
                .shared
                .observers
                .lock()
                .iter()
                .filter(|observer| observer.filter.matches(old, new))
                .map(|observer| observer.callback.clone())
                .collect();
            for callback in callbacks {
                callback(old, new);
            }
            self.shared.runtime.notify_state_change(StateChange {
                id: self.shared.id,
                name: self.shared.name.clone(),
                old: format!("{:?}", old),
                new: format!("{:?}", new),
            });
        }

        if destroy {
            self.destroy();
        }
    }

    fn arm_timers(&self, core: &mut Core<M>, state: M::State) {
        for handle in core.armed.drain(..) {
            handle.abort();
        }
        let epoch = self.shared.timer_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        for spec in core.timers.iter().filter(|spec| spec.armed_in(state)) {
            if spec.interval.is_zero() {
                continue;
            }
            let Ok(tokio_handle) = tokio::runtime::Handle::try_current() else {
                warn!(
                    "{}({}) timer {} not armed: no tokio runtime",
                    self.shared.name, self.shared.id, spec.name
                );
                return;
            };
            let weak = Arc::downgrade(&self.shared);
            let interval = spec.interval;
            let make_event = spec.event;
            let timer_name = spec.name;
            core.armed.push(tokio_handle.spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(shared) = weak.upgrade() else {
                        break;
                    };
                    let runtime = shared.runtime.clone();
                    runtime.post(move || {
                        if shared.timer_epoch.load(Ordering::SeqCst) == epoch {
                            trace!("{}({}) timer {} fired", shared.name, shared.id, timer_name);
                            Automat::from_shared(shared).dispatch(make_event());
                        }
                    });
                }
            }));
        }
    }

    /// Subscribe to state changes matching `filter`.
    pub fn add_observer(
        &self,
        filter: StateFilter<M::State>,
        callback: impl Fn(M::State, M::State) + Send + Sync + 'static,
    ) -> ObserverId {
        let id = ObserverId(self.shared.next_observer.fetch_add(1, Ordering::SeqCst));
        self.shared.observers.lock().push(Observer {
            id,
            filter,
            callback: Arc::new(callback),
        });
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.shared.observers.lock();
        let before = observers.len();
        observers.retain(|observer| observer.id != id);
        observers.len() != before
    }

    /// Stop timers and leave the registry. Idempotent; when called while the
    /// machine is mid-transition the destruction happens right after it.
    pub fn destroy(&self) {
        let Some(mut core) = self.shared.core.try_lock() else {
            self.shared.destroy_pending.store(true, Ordering::SeqCst);
            return;
        };
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in core.armed.drain(..) {
            handle.abort();
        }
        self.shared.timer_epoch.fetch_add(1, Ordering::SeqCst);
        drop(core);
        self.shared.observers.lock().clear();
        self.shared.runtime.unregister(self.shared.id);
        debug!("{}({}) destroyed", self.shared.name, self.shared.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Lamp {
        Off,
        On,
        Broken,
    }

    #[derive(Debug)]
    enum Switch {
        Toggle,
        Tick,
        Smash,
        Noop,
    }

    #[derive(Default)]
    struct LampMachine {
        log: Vec<String>,
        ticks: Arc<AtomicUsize>,
        unchanged: usize,
    }

    impl Machine for LampMachine {
        type State = Lamp;
        type Event = Switch;

        fn timers(&self) -> Vec<TimerSpec<Self>> {
            vec![TimerSpec::new("tick", Duration::from_secs(5), &[Lamp::On], || Switch::Tick)]
        }

        fn transition(&mut self, ctx: &mut Context<'_, Self>, state: Lamp, event: Switch) -> Lamp {
            self.log.push(format!("{:?}/{:?}", state, event));
            match (state, event) {
                (Lamp::Off, Switch::Toggle) => Lamp::On,
                (Lamp::On, Switch::Toggle) => Lamp::Off,
                (Lamp::On, Switch::Tick) => {
                    self.ticks.fetch_add(1, Ordering::SeqCst);
                    Lamp::On
                }
                (_, Switch::Smash) => {
                    // destroying from inside an action must be safe, twice
                    ctx.destroy();
                    ctx.handle().destroy();
                    Lamp::Broken
                }
                (state, _) => state,
            }
        }

        fn state_not_changed(&mut self, _ctx: &mut Context<'_, Self>, _state: Lamp) {
            self.unchanged += 1;
        }
    }

    #[test]
    fn test_events_are_queued_in_order() {
        let runtime = Runtime::new();
        let lamp = Automat::new(&runtime, "lamp", Lamp::Off, LampMachine::default());

        lamp.post(Switch::Toggle);
        lamp.post(Switch::Toggle);
        lamp.post(Switch::Toggle);
        assert_eq!(lamp.state(), Lamp::Off, "post must not run on caller's stack");

        assert_eq!(runtime.run_until_idle(), 3);
        assert_eq!(lamp.state(), Lamp::On);
        lamp.with(|m| {
            assert_eq!(m.log, vec!["Off/Toggle", "On/Toggle", "Off/Toggle"]);
        });
    }

    #[test]
    fn test_fast_dispatch_runs_synchronously() {
        let runtime = Runtime::new();
        let lamp = Automat::new_fast(&runtime, "lamp", Lamp::Off, LampMachine::default());
        lamp.post(Switch::Toggle);
        assert_eq!(lamp.state(), Lamp::On);
        assert_eq!(runtime.run_until_idle(), 0);
    }

    #[test]
    fn test_state_not_changed_hook() {
        let runtime = Runtime::new();
        let lamp = Automat::new(&runtime, "lamp", Lamp::Off, LampMachine::default());
        lamp.post(Switch::Noop);
        runtime.run_until_idle();
        lamp.with(|m| assert_eq!(m.unchanged, 1));
    }

    #[test]
    fn test_observers_respect_filters() {
        let runtime = Runtime::new();
        let lamp = Automat::new(&runtime, "lamp", Lamp::Off, LampMachine::default());
        let entered_on = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let counter = entered_on.clone();
        lamp.add_observer(StateFilter::entering(Lamp::On), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = all.clone();
        let any = lamp.add_observer(StateFilter::any(), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..4 {
            lamp.post(Switch::Toggle);
        }
        runtime.run_until_idle();
        assert_eq!(entered_on.load(Ordering::SeqCst), 2);
        assert_eq!(all.load(Ordering::SeqCst), 4);

        assert!(lamp.remove_observer(any));
        lamp.post(Switch::Toggle);
        runtime.run_until_idle();
        assert_eq!(all.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_destroy_from_action_is_idempotent() {
        let runtime = Runtime::new();
        let lamp = Automat::new(&runtime, "lamp", Lamp::Off, LampMachine::default());
        let id = lamp.id();
        assert!(runtime.lookup::<LampMachine>(id).is_some());

        lamp.post(Switch::Smash);
        lamp.post(Switch::Toggle);
        runtime.run_until_idle();

        assert!(lamp.is_destroyed());
        assert_eq!(lamp.state(), Lamp::Broken);
        assert!(!runtime.is_alive(id));
        assert!(runtime.lookup::<LampMachine>(id).is_none());
        lamp.destroy();
        lamp.with(|m| assert_eq!(m.log.len(), 1, "events after destroy are dropped"));
    }

    #[test]
    fn test_runtimes_are_independent() {
        let first = Runtime::new();
        let second = Runtime::new();
        let a = Automat::new(&first, "lamp", Lamp::Off, LampMachine::default());
        let _b = Automat::new(&second, "lamp", Lamp::Off, LampMachine::default());

        assert_eq!(first.find("lamp"), vec![a.id()]);
        assert_eq!(second.find("lamp").len(), 1);

        a.post(Switch::Toggle);
        assert_eq!(second.run_until_idle(), 0);
        assert_eq!(first.run_until_idle(), 1);
    }

    #[test]
    fn test_state_hook_sees_every_change() {
        let runtime = Runtime::new();
        let changes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = changes.clone();
        runtime.add_state_hook(move |change| sink.lock().push(change.new.clone()));

        let lamp = Automat::new(&runtime, "lamp", Lamp::Off, LampMachine::default());
        lamp.post(Switch::Toggle);
        lamp.post(Switch::Toggle);
        runtime.run_until_idle();
        assert_eq!(*changes.lock(), vec!["On".to_string(), "Off".to_string()]);

        let infos = runtime.instances();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].state, "Off");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_follow_states() {
        let runtime = Runtime::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let machine = LampMachine {
            ticks: ticks.clone(),
            ..Default::default()
        };
        let lamp = Automat::new(&runtime, "lamp", Lamp::Off, machine);

        tokio::time::sleep(Duration::from_secs(12)).await;
        runtime.settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0, "timer is not armed in Off");

        lamp.post(Switch::Toggle);
        runtime.settle().await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        runtime.settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        lamp.post(Switch::Toggle);
        runtime.settle().await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        runtime.settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2, "timer stops when leaving On");

        lamp.post(Switch::Toggle);
        lamp.post(Switch::Smash);
        runtime.settle().await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        runtime.settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2, "destroyed machine never ticks");
    }
}
