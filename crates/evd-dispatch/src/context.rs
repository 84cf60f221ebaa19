//! Dispatch contexts: queues, worker threads and teardown.

use crate::config::{Callbacks, ContextConfig, LockPolicy, Mode};
use crate::error::{DispatchError, Result};
use crate::event::{Event, Unlink};
use crate::timer::{self, Timer};
use crate::worker;
use evd_list::{ListArena, ListId, NodeId};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, warn};

// ============================================================================
// State
// ============================================================================

/// Lifecycle of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Accepting and running events.
    Running,
    /// Teardown started; workers are exiting.
    Destroying,
    /// Teardown finished; outstanding events were canceled.
    Destroyed,
    /// Construction failed.
    Error,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Queues
// ============================================================================

/// Arena entry for a queued event.
pub(crate) struct Queued {
    event: Event,
    deadline: Option<SystemTime>,
}

/// Ready, timer and per-tick lists threaded through one arena.
pub(crate) struct Queues {
    arena: ListArena<Queued>,
    ready: ListId,
    timers: ListId,
    handled: ListId,
}

impl Queues {
    pub(crate) fn new() -> Self {
        let mut arena = ListArena::new();
        let ready = arena.new_list();
        let timers = arena.new_list();
        let handled = arena.new_list();
        Self {
            arena,
            ready,
            timers,
            handled,
        }
    }

    fn link(&mut self, event: Event, deadline: Option<SystemTime>) -> NodeId {
        let node = self.arena.insert(Queued { event, deadline });
        // Forced removal during teardown goes through cancellation.
        let _ = self.arena.set_destructor(node, |queued: Queued| {
            queued.event.clear_placement();
            queued.event.cancel_detached();
        });
        node
    }

    /// Append to the ready queue.
    pub(crate) fn push_ready(&mut self, event: &Event, owner: Weak<dyn Unlink>) {
        let node = self.link(event.clone(), None);
        let _ = self.arena.push(self.ready, node);
        event.place(owner, node);
    }

    /// Insert into the timer queue, after every entry due no later.
    pub(crate) fn push_timed(
        &mut self,
        event: &Event,
        deadline: SystemTime,
        owner: Weak<dyn Unlink>,
    ) {
        let at = timer::insertion_cursor(&self.arena, self.timers, deadline, |q| q.deadline);
        let node = self.link(event.clone(), Some(deadline));
        let _ = self.arena.insert_after(at, node);
        event.place(owner, node);
    }

    /// Keep a not-yet-done periodic event until the current tick ends.
    pub(crate) fn park_handled(&mut self, event: &Event, owner: Weak<dyn Unlink>) {
        let node = self.link(event.clone(), None);
        let _ = self.arena.push(self.handled, node);
        event.place(owner, node);
    }

    /// Move every parked event back to the tail of the ready queue.
    pub(crate) fn requeue_handled(&mut self) {
        while let Some(node) = self.arena.pop(self.handled) {
            let _ = self.arena.push(self.ready, node);
        }
    }

    pub(crate) fn pop_ready(&mut self) -> Option<Event> {
        let node = self.arena.first(self.ready)?;
        self.take(node)
    }

    pub(crate) fn pop_timer(&mut self) -> Option<Event> {
        let node = self.arena.first(self.timers)?;
        self.take(node)
    }

    /// Deadline of the earliest timed event.
    pub(crate) fn next_deadline(&self) -> Option<SystemTime> {
        let node = self.arena.first(self.timers)?;
        self.arena.get(node).and_then(|q| q.deadline)
    }

    #[cfg(test)]
    fn has_ready(&self) -> bool {
        !self.arena.is_empty(self.ready)
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        self.arena.is_empty(self.ready) && self.arena.is_empty(self.timers)
    }

    /// Events waiting in any queue.
    pub(crate) fn len(&self) -> usize {
        self.arena.len(self.ready) + self.arena.len(self.timers) + self.arena.len(self.handled)
    }

    /// Unlink `event` if it sits at `node` in this arena.
    fn remove(&mut self, node: NodeId, event: &Event) -> bool {
        let owned = self
            .arena
            .get(node)
            .is_some_and(|q| Event::ptr_eq(&q.event, event));
        owned && self.take(node).is_some()
    }

    fn take(&mut self, node: NodeId) -> Option<Event> {
        let queued = self.arena.take(node)?;
        queued.event.clear_placement();
        Some(queued.event)
    }

    /// Cancel every event still queued. Must run without the context lock,
    /// since cancellation may run user destructors.
    pub(crate) fn cancel_all(mut self) {
        for list in [self.ready, self.timers, self.handled] {
            self.arena.destroy_all(list);
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

/// State guarded by the context lock.
pub(crate) struct Core {
    pub(crate) state: ContextState,
    pub(crate) queues: Queues,
    pub(crate) period_count: u64,
    pub(crate) overrun: bool,
    pub(crate) overrun_count: u64,
}

/// Everything workers and submitters share.
pub(crate) struct Shared {
    pub(crate) core: Mutex<Core>,
    pub(crate) condvar: Condvar,
    pub(crate) callbacks: Callbacks,
    pub(crate) mode: Mode,
    pub(crate) interval: Option<Duration>,
    lock: LockPolicy,
    /// Thread running the `on_queued` hook, which holds the context lock.
    hook_thread: Mutex<Option<ThreadId>>,
}

impl Shared {
    fn new(config: &ContextConfig) -> Self {
        Self {
            core: Mutex::new(Core {
                state: ContextState::Running,
                queues: Queues::new(),
                period_count: 0,
                overrun: false,
                overrun_count: 0,
            }),
            condvar: Condvar::new(),
            callbacks: config.callbacks.clone(),
            mode: config.mode,
            interval: config.interval,
            lock: config.lock,
            hook_thread: Mutex::new(None),
        }
    }

    /// Run the `on_queued` hook for `event`, then drop it from the queues
    /// again if the hook canceled it.
    fn run_queued_hook(&self, core: &mut Core, event: &Event) {
        let scope = HookScope::enter(&self.hook_thread);
        self.callbacks.queued(event);
        drop(scope);

        if event.is_terminal() {
            if let Some(node) = event.placed_node() {
                core.queues.remove(node, event);
            }
        }
    }

    fn in_queued_hook(&self) -> bool {
        *self.hook_thread.lock() == Some(thread::current().id())
    }

    /// Release the context lock according to the configured policy.
    pub(crate) fn release(&self, guard: MutexGuard<'_, Core>) {
        match self.lock {
            LockPolicy::Default => drop(guard),
            LockPolicy::Fair => MutexGuard::unlock_fair(guard),
        }
    }

    /// Run `f` with the context lock temporarily released.
    pub(crate) fn unlocked<R>(&self, guard: &mut MutexGuard<'_, Core>, f: impl FnOnce() -> R) -> R {
        match self.lock {
            LockPolicy::Default => MutexGuard::unlocked(guard, f),
            LockPolicy::Fair => MutexGuard::unlocked_fair(guard, f),
        }
    }

    /// Stop accepting work and wake every worker.
    fn shut_down(&self, to: ContextState) -> bool {
        let mut core = self.core.lock();
        let was_running = core.state == ContextState::Running;
        if was_running {
            core.state = to;
            self.condvar.notify_all();
        }
        self.release(core);
        was_running
    }
}

/// Marks the current thread as running the queued hook until dropped.
struct HookScope<'a>(&'a Mutex<Option<ThreadId>>);

impl<'a> HookScope<'a> {
    fn enter(slot: &'a Mutex<Option<ThreadId>>) -> Self {
        *slot.lock() = Some(thread::current().id());
        Self(slot)
    }
}

impl Drop for HookScope<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

impl Unlink for Shared {
    fn unlink(&self, event: &Event) {
        // The hook already holds the lock; `post` unlinks once it returns.
        if self.in_queued_hook() {
            return;
        }
        let mut core = self.core.lock();
        if let Some(node) = event.placed_node() {
            core.queues.remove(node, event);
        }
        self.release(core);
    }
}

// ============================================================================
// Context
// ============================================================================

/// A dispatch context: owns the queues and worker threads that run posted
/// events.
///
/// Dropping a context tears it down without joining its workers; call
/// [`Context::destroy`] with `join = true` to wait for them.
pub struct Context {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Vec<ThreadId>,
    worker_count: usize,
}

impl Context {
    /// Create a context with one worker and a timer queue.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ThreadCreateFailed`] if the worker cannot be
    /// started.
    pub fn single(callbacks: Callbacks) -> Result<Self> {
        Self::with_config(ContextConfig::single(callbacks))
    }

    /// Create a context with `workers` threads sharing its queues.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidArgument`] unless
    /// `1 <= workers <= MAX_WORKERS`, and
    /// [`DispatchError::ThreadCreateFailed`] if a worker cannot be started.
    pub fn pool(callbacks: Callbacks, workers: usize) -> Result<Self> {
        Self::with_config(ContextConfig::pool(callbacks, workers))
    }

    /// Create a context that runs its ready queue once every `interval`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidArgument`] for a zero interval and
    /// [`DispatchError::ThreadCreateFailed`] if the worker cannot be
    /// started.
    pub fn periodic(callbacks: Callbacks, interval: Duration) -> Result<Self> {
        Self::with_config(ContextConfig::periodic(callbacks, interval))
    }

    /// Create a context from a full configuration.
    ///
    /// If a worker fails to start, the context is marked
    /// [`ContextState::Error`] and the workers already running are stopped
    /// and joined before the error is returned.
    ///
    /// # Errors
    ///
    /// See [`Context::single`], [`Context::pool`] and [`Context::periodic`].
    pub fn with_config(config: ContextConfig) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared::new(&config));
        let mut handles = Vec::with_capacity(config.workers);

        for index in 0..config.workers {
            let worker_shared = Arc::clone(&shared);
            let mut builder = thread::Builder::new().name(format!("{}-{index}", config.thread_name));
            if let Some(size) = config.stack_size {
                builder = builder.stack_size(size);
            }

            match builder.spawn(move || worker::run(&worker_shared, index)) {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    error!(worker = index, error = %source, "failed to spawn worker thread");
                    shared.shut_down(ContextState::Error);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(DispatchError::ThreadCreateFailed { index, source });
                }
            }
        }

        debug!(mode = ?config.mode, workers = config.workers, "context created");

        Ok(Self {
            thread_ids: handles.iter().map(|h| h.thread().id()).collect(),
            worker_count: handles.len(),
            workers: Mutex::new(handles),
            shared,
        })
    }

    /// Submit an event.
    ///
    /// Immediate events are appended to the ready queue. Timed events are
    /// ordered by deadline, with relative timers resolved against the wall
    /// clock now; a periodic context treats every event as immediate.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Finished`] if the event already completed or was
    ///   canceled, and [`DispatchError::AlreadyQueued`] if it was posted
    ///   before, to this or any other context, and is still queued, running
    ///   or suspended. The event is left untouched.
    /// - [`DispatchError::InvalidState`] if the context is not running, and
    ///   [`DispatchError::InvalidArgument`] if a relative timer overflows the
    ///   clock. In both cases the event is canceled so no waiter hangs.
    pub fn post(&self, event: &Event) -> Result<()> {
        let mut core = self.shared.core.lock();

        if event.is_terminal() {
            self.shared.release(core);
            return Err(DispatchError::Finished(event.id()));
        }
        if !event.claim() {
            self.shared.release(core);
            return Err(DispatchError::AlreadyQueued(event.id()));
        }
        if core.state != ContextState::Running {
            let state = core.state;
            self.shared.release(core);
            warn!(event = %event.id(), %state, "post rejected");
            event.cancel_detached();
            return Err(DispatchError::InvalidState(state));
        }

        let timer = match self.shared.mode {
            Mode::Periodic => Timer::Immediate,
            Mode::Normal | Mode::Pool => event.timer(),
        };
        let Ok(deadline) = timer.resolve(SystemTime::now()) else {
            self.shared.release(core);
            event.cancel_detached();
            return Err(DispatchError::InvalidArgument("timer overflows the clock"));
        };

        let owner: Weak<dyn Unlink> = Arc::downgrade(&self.shared) as Weak<dyn Unlink>;
        match deadline {
            None => {
                core.queues.push_ready(event, owner);
                self.shared.condvar.notify_one();
            }
            Some(deadline) => {
                core.queues.push_timed(event, deadline, owner);
                // The earliest deadline may have moved; every sleeper must
                // recompute its timeout.
                self.shared.condvar.notify_all();
            }
        }
        self.shared.run_queued_hook(&mut core, event);
        self.shared.release(core);
        Ok(())
    }

    /// Tear the context down.
    ///
    /// Stops accepting events, wakes every worker and then joins (`join =
    /// true`) or detaches them. Events still waiting in a queue are
    /// canceled; a handler already running is not interrupted and finishes
    /// normally. Calling this again is harmless.
    pub fn destroy(&self, join: bool) {
        if self.shared.shut_down(ContextState::Destroying) {
            debug!(join, "context teardown started");
        }

        let handles = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in handles {
            // A handler tearing down its own context cannot join itself.
            if join && handle.thread().id() != current && handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }

        let drained = {
            let mut core = self.shared.core.lock();
            let drained = std::mem::replace(&mut core.queues, Queues::new());
            core.state = ContextState::Destroyed;
            self.shared.release(core);
            drained
        };
        let outstanding = drained.len();
        drained.cancel_all();
        if outstanding > 0 {
            debug!(canceled = outstanding, "canceled outstanding events");
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContextState {
        self.shared.core.lock().state
    }

    /// Scheduling mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.shared.mode
    }

    /// Number of worker threads started.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Thread IDs of the workers.
    #[must_use]
    pub fn worker_threads(&self) -> &[ThreadId] {
        &self.thread_ids
    }

    /// Tick interval of a periodic context.
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.shared.interval
    }

    /// Events currently waiting in any queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.core.lock().queues.len()
    }

    /// Ticks elapsed in a periodic context.
    #[must_use]
    pub fn period_count(&self) -> u64 {
        self.shared.core.lock().period_count
    }

    /// Whether the most recent tick overran into the next one.
    #[must_use]
    pub fn overrun(&self) -> bool {
        self.shared.core.lock().overrun
    }

    /// Total ticks that overran.
    #[must_use]
    pub fn overrun_count(&self) -> u64 {
        self.shared.core.lock().overrun_count
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.destroy(false);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("mode", &self.shared.mode)
            .field("state", &self.state())
            .field("workers", &self.worker_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn owner() -> Weak<dyn Unlink> {
        struct Nobody;
        impl Unlink for Nobody {
            fn unlink(&self, _: &Event) {}
        }
        let owner: Weak<dyn Unlink> = Weak::<Nobody>::new();
        owner
    }

    #[test]
    fn test_queues_order_timers_by_deadline() {
        let mut queues = Queues::new();
        let base = SystemTime::now();
        let late = Event::new(|_| true);
        let early = Event::new(|_| true);

        queues.push_timed(&late, base + Duration::from_secs(2), owner());
        queues.push_timed(&early, base + Duration::from_secs(1), owner());
        assert_eq!(queues.next_deadline(), Some(base + Duration::from_secs(1)));

        let first = queues.pop_timer().unwrap();
        assert!(Event::ptr_eq(&first, &early));
        assert!(!first.is_queued());
        assert!(late.is_queued());
    }

    #[test]
    fn test_remove_checks_identity() {
        let mut queues = Queues::new();
        let a = Event::new(|_| true);
        let b = Event::new(|_| true);
        queues.push_ready(&a, owner());

        let node = a.placed_node().unwrap();
        assert!(!queues.remove(node, &b));
        assert!(queues.remove(node, &a));
        assert!(!a.is_queued());
        assert!(!queues.has_ready());
    }

    #[test]
    fn test_requeue_handled_appends_to_ready() {
        let mut queues = Queues::new();
        let parked = Event::new(|_| false);
        let fresh = Event::new(|_| true);

        queues.park_handled(&parked, owner());
        queues.push_ready(&fresh, owner());
        queues.requeue_handled();

        assert!(Event::ptr_eq(&queues.pop_ready().unwrap(), &fresh));
        assert!(Event::ptr_eq(&queues.pop_ready().unwrap(), &parked));
        assert!(queues.is_idle());
    }

    #[test]
    fn test_cancel_all_cancels_each_event_once() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let mut queues = Queues::new();
        let events: Vec<Event> = (0..3)
            .map(|_| {
                let counter = Arc::clone(&destroyed);
                Event::new(|_| true)
                    .auto_destruct(true)
                    .on_destroy(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
            })
            .collect();

        queues.push_ready(&events[0], owner());
        queues.push_timed(&events[1], SystemTime::now(), owner());
        queues.park_handled(&events[2], owner());
        assert_eq!(queues.len(), 3);

        queues.cancel_all();
        for event in &events {
            assert!(event.is_canceled());
            assert!(!event.is_queued());
        }
        assert_eq!(destroyed.load(Ordering::SeqCst), 3);
    }
}
