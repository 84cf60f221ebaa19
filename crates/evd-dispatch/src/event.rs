//! Events: the schedulable unit of work.
//!
//! An [`Event`] is a cheap, clonable handle. The submitter keeps one clone
//! to wait on, and the context holds another while the event is queued.
//!
//! # Lifecycle
//!
//! ```text
//!   post        pop            handler -> true
//! +-------+    +------+    +---------+    +------+
//! |Pending| -> |Queued| -> | Running | -> | Done |
//! +-------+    +------+    +---------+    +------+
//!                  |            |  handler -> false
//!                  |            +--> Pending (suspended, or requeued
//!                  | cancel /        next tick in periodic mode)
//!                  | teardown
//!                  v
//!             +--------+
//!             |Canceled|
//!             +--------+
//! ```
//!
//! The first transition into `Done` or `Canceled` wins; it posts the
//! completion signal exactly once and, for auto-destructing events, runs
//! the destructor.
//!
//! An event is posted at most once. A suspended event still belongs to
//! its context; finish it with [`Event::mark_done`] or [`Event::cancel`]
//! rather than posting it again.

use crate::error::{DispatchError, Result};
use crate::sync::Semaphore;
use crate::timer::Timer;
use evd_list::NodeId;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::trace;

/// Handler run by a worker. Returns `true` once the event is fully done.
pub type Handler = Box<dyn FnMut(&Event) -> bool + Send>;

/// Cleanup run at most once for an event.
pub type Destructor = Box<dyn FnOnce(&Event) + Send>;

// ============================================================================
// Identity and State
// ============================================================================

/// Process-unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u64);

impl EventId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event({})", self.0)
    }
}

/// Completion state of an event.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    /// Not finished: waiting in a queue, running, or suspended.
    Pending = 0,
    /// The handler (or an external caller) marked it done.
    Done = 1,
    /// Canceled explicitly or by context teardown.
    Canceled = 2,
}

impl EventState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Done,
            2 => Self::Canceled,
            _ => Self::Pending,
        }
    }

    /// Whether no further execution will happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Canceled)
    }
}

// ============================================================================
// Queue placement
// ============================================================================

/// Something that can pull a queued event back out of its queue.
pub(crate) trait Unlink: Send + Sync {
    fn unlink(&self, event: &Event);
}

/// Where a queued event currently sits.
pub(crate) struct Placement {
    pub(crate) owner: Weak<dyn Unlink>,
    pub(crate) node: NodeId,
}

// ============================================================================
// Event
// ============================================================================

struct EventInner {
    id: EventId,
    handler: Mutex<Handler>,
    param: Option<Arc<dyn Any + Send + Sync>>,
    state: AtomicU8,
    completion: Semaphore,
    timer: Mutex<Timer>,
    auto_destruct: AtomicBool,
    /// Set by the first accepted post; never cleared.
    claimed: AtomicBool,
    destructor: Mutex<Option<Destructor>>,
    placement: Mutex<Option<Placement>>,
}

/// A unit of work posted to a [`Context`](crate::Context).
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    /// Create an event without a parameter.
    pub fn new<F>(handler: F) -> Self
    where
        F: FnMut(&Event) -> bool + Send + 'static,
    {
        Self::build(Box::new(handler), None)
    }

    /// Create an event carrying `param`, readable from the handler through
    /// [`Event::param`].
    pub fn with_param<F, P>(handler: F, param: P) -> Self
    where
        F: FnMut(&Event) -> bool + Send + 'static,
        P: Any + Send + Sync,
    {
        Self::build(Box::new(handler), Some(Arc::new(param)))
    }

    fn build(handler: Handler, param: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        Self {
            inner: Arc::new(EventInner {
                id: EventId::new(),
                handler: Mutex::new(handler),
                param,
                state: AtomicU8::new(EventState::Pending as u8),
                completion: Semaphore::new(0),
                timer: Mutex::new(Timer::Immediate),
                auto_destruct: AtomicBool::new(false),
                claimed: AtomicBool::new(false),
                destructor: Mutex::new(None),
                placement: Mutex::new(None),
            }),
        }
    }

    /// Run the destructor automatically once the event is terminal.
    #[must_use]
    pub fn auto_destruct(self, enabled: bool) -> Self {
        self.set_auto_destruct(enabled);
        self
    }

    /// Install the destructor.
    #[must_use]
    pub fn on_destroy<F>(self, destructor: F) -> Self
    where
        F: FnOnce(&Event) + Send + 'static,
    {
        self.set_destructor(destructor);
        self
    }

    /// Replace the destructor.
    pub fn set_destructor<F>(&self, destructor: F)
    where
        F: FnOnce(&Event) + Send + 'static,
    {
        *self.inner.destructor.lock() = Some(Box::new(destructor));
    }

    /// Change the auto-destruct policy.
    pub fn set_auto_destruct(&self, enabled: bool) {
        self.inner.auto_destruct.store(enabled, Ordering::Release);
    }

    /// Set when the event becomes eligible to run. Takes effect on the next
    /// [`post`](crate::Context::post).
    pub fn set_timer(&self, timer: Timer) {
        *self.inner.timer.lock() = timer;
    }

    /// The configured timer.
    #[must_use]
    pub fn timer(&self) -> Timer {
        *self.inner.timer.lock()
    }

    /// The event's unique ID.
    #[must_use]
    pub fn id(&self) -> EventId {
        self.inner.id
    }

    /// Borrow the parameter if it has type `P`.
    #[must_use]
    pub fn param<P: Any>(&self) -> Option<&P> {
        self.inner.param.as_deref()?.downcast_ref::<P>()
    }

    /// Current completion state.
    #[must_use]
    pub fn state(&self) -> EventState {
        EventState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Whether the event completed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state() == EventState::Done
    }

    /// Whether the event was canceled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.state() == EventState::Canceled
    }

    /// Whether the event is done or canceled.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether the event is currently linked into a context queue.
    #[must_use]
    pub fn is_queued(&self) -> bool {
        self.inner.placement.lock().is_some()
    }

    /// Whether two handles refer to the same event.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    // ------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------

    /// Block until the event is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Canceled`] if the event was canceled rather
    /// than completed.
    pub fn wait_done(&self) -> Result<()> {
        self.inner.completion.wait();
        self.relay()
    }

    /// Check for completion without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NotDone`] while pending and
    /// [`DispatchError::Canceled`] if canceled.
    pub fn try_wait_done(&self) -> Result<()> {
        if !self.inner.completion.try_wait() {
            return Err(DispatchError::NotDone);
        }
        self.relay()
    }

    /// Block until the event is terminal or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NotDone`] on timeout and
    /// [`DispatchError::Canceled`] if canceled.
    pub fn wait_done_timeout(&self, timeout: Duration) -> Result<()> {
        if !self.inner.completion.wait_for(timeout) {
            return Err(DispatchError::NotDone);
        }
        self.relay()
    }

    /// Hand the consumed permit back so every later wait also succeeds,
    /// then report the outcome.
    fn relay(&self) -> Result<()> {
        self.inner.completion.post();
        match self.state() {
            EventState::Done => Ok(()),
            EventState::Canceled => Err(DispatchError::Canceled),
            EventState::Pending => Err(DispatchError::NotDone),
        }
    }

    // ------------------------------------------------------------------
    // Terminal transitions
    // ------------------------------------------------------------------

    /// Complete the event from outside its handler.
    ///
    /// Used to resume an event whose handler returned `false` once the
    /// missing input arrives. No effect if already terminal.
    pub fn mark_done(&self) {
        self.finish(EventState::Done);
    }

    /// Cancel the event.
    ///
    /// A queued event is unlinked from its context first, so it will not
    /// run. Waiters are released with [`DispatchError::Canceled`]. No effect
    /// if already terminal; a handler that is already running is not
    /// interrupted.
    pub fn cancel(&self) {
        let owner = self
            .inner
            .placement
            .lock()
            .as_ref()
            .and_then(|p| p.owner.upgrade());
        if let Some(owner) = owner {
            owner.unlink(self);
        }
        self.cancel_detached();
    }

    /// Run the destructor if it has not run yet.
    ///
    /// The event should be unlinked and terminal first.
    pub fn destroy(&self) {
        let destructor = self.inner.destructor.lock().take();
        if let Some(destructor) = destructor {
            destructor(self);
        }
    }

    /// Cancel without touching any queue; the caller has already unlinked
    /// the event or never linked it.
    pub(crate) fn cancel_detached(&self) {
        self.finish(EventState::Canceled);
    }

    pub(crate) fn complete(&self) {
        self.finish(EventState::Done);
    }

    fn finish(&self, to: EventState) -> bool {
        let won = self
            .inner
            .state
            .compare_exchange(
                EventState::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !won {
            return false;
        }
        trace!(event = %self.inner.id, state = ?to, "event finished");
        self.inner.completion.post();
        if self.inner.auto_destruct.load(Ordering::Acquire) {
            self.destroy();
        }
        true
    }

    // ------------------------------------------------------------------
    // Dispatch internals
    // ------------------------------------------------------------------

    /// Take ownership for one context. Only the first caller succeeds, so
    /// an event is never in two queues or run by two workers at once.
    pub(crate) fn claim(&self) -> bool {
        !self.inner.claimed.swap(true, Ordering::AcqRel)
    }

    /// Run the handler once. `None` if the event finished before the
    /// handler could start.
    pub(crate) fn invoke(&self) -> Option<bool> {
        let mut handler = self.inner.handler.lock();
        if self.is_terminal() {
            return None;
        }
        let handler = &mut *handler;
        Some(handler(self))
    }

    pub(crate) fn place(&self, owner: Weak<dyn Unlink>, node: NodeId) {
        *self.inner.placement.lock() = Some(Placement { owner, node });
    }

    pub(crate) fn placed_node(&self) -> Option<NodeId> {
        self.inner.placement.lock().as_ref().map(|p| p.node)
    }

    pub(crate) fn clear_placement(&self) {
        *self.inner.placement.lock() = None;
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("timer", &self.timer())
            .field("queued", &self.is_queued())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_event_id_uniqueness() {
        let a = Event::new(|_| true);
        let b = Event::new(|_| true);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_new_event_is_pending() {
        let event = Event::new(|_| true);
        assert_eq!(event.state(), EventState::Pending);
        assert_eq!(event.timer(), Timer::Immediate);
        assert!(!event.is_queued());
        assert!(matches!(event.try_wait_done(), Err(DispatchError::NotDone)));
    }

    #[test]
    fn test_param_downcast() {
        let event = Event::with_param(|_| true, 42u32);
        assert_eq!(event.param::<u32>(), Some(&42));
        assert_eq!(event.param::<i64>(), None);
        assert_eq!(Event::new(|_| true).param::<u32>(), None);
    }

    #[test]
    fn test_cancel_then_wait_does_not_block() {
        let event = Event::new(|_| true);
        event.cancel();
        assert!(matches!(event.wait_done(), Err(DispatchError::Canceled)));
        assert!(matches!(event.wait_done(), Err(DispatchError::Canceled)));
        assert!(matches!(event.try_wait_done(), Err(DispatchError::Canceled)));
    }

    #[test]
    fn test_first_terminal_transition_wins() {
        let event = Event::new(|_| true);
        event.mark_done();
        event.cancel();
        assert!(event.is_done());
        assert!(event.wait_done().is_ok());
    }

    #[test]
    fn test_auto_destruct_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let event = Event::new(|_| true)
            .auto_destruct(true)
            .on_destroy(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        event.cancel();
        event.cancel();
        event.destroy();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_destructor_without_auto_destruct_waits_for_destroy() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let event = Event::new(|_| true).on_destroy(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        event.mark_done();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        event.destroy();
        event.destroy();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mark_done_from_other_thread_releases_waiter() {
        let event = Event::new(|_| false);
        let remote = event.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.mark_done();
        });
        assert!(event.wait_done().is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_reports_not_done() {
        let event = Event::new(|_| true);
        assert!(matches!(
            event.wait_done_timeout(Duration::from_millis(10)),
            Err(DispatchError::NotDone)
        ));
    }

    #[test]
    fn test_invoke_passes_event_to_handler() {
        let event = Event::with_param(
            |ev| ev.param::<&'static str>().is_some_and(|s| *s == "ready"),
            "ready",
        );
        assert_eq!(event.invoke(), Some(true));
    }

    #[test]
    fn test_invoke_skips_finished_event() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let event = Event::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        event.mark_done();
        assert_eq!(event.invoke(), None);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_claim_succeeds_once() {
        let event = Event::new(|_| true);
        assert!(event.claim());
        assert!(!event.claim());
        assert!(!event.clone().claim());
    }
}
