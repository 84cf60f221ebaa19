//! Context configuration and lifecycle callbacks.

use crate::error::{DispatchError, Result};
use crate::event::Event;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on worker threads in a pool context.
pub const MAX_WORKERS: usize = 256;

/// How a context schedules its events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One worker; ready queue plus timer queue.
    Normal,
    /// Several workers sharing the ready and timer queues.
    Pool,
    /// One worker running the ready queue once per fixed tick.
    Periodic,
}

/// How the context lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockPolicy {
    /// Plain release; the releasing thread may re-acquire immediately.
    #[default]
    Default,
    /// Fair release: the lock is handed to the longest waiting thread, so a
    /// busy worker cannot starve submitters blocked in `post`.
    Fair,
}

/// Callback invoked with the event it concerns.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Optional hooks around queuing and execution.
///
/// `on_queued` runs while the context lock is held and must not post to
/// the same context; canceling the event it was given is allowed. `on_begin` and `on_end` run on the worker, outside the
/// lock, immediately before and after the handler.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub(crate) on_queued: Option<EventCallback>,
    pub(crate) on_begin: Option<EventCallback>,
    pub(crate) on_end: Option<EventCallback>,
}

impl Callbacks {
    /// No callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when an event has been linked into a queue.
    #[must_use]
    pub fn on_queued<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.on_queued = Some(Arc::new(f));
        self
    }

    /// Called before each handler invocation.
    #[must_use]
    pub fn on_begin<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.on_begin = Some(Arc::new(f));
        self
    }

    /// Called after each handler invocation.
    #[must_use]
    pub fn on_end<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.on_end = Some(Arc::new(f));
        self
    }

    pub(crate) fn queued(&self, event: &Event) {
        if let Some(f) = &self.on_queued {
            f(event);
        }
    }

    pub(crate) fn begin(&self, event: &Event) {
        if let Some(f) = &self.on_begin {
            f(event);
        }
    }

    pub(crate) fn end(&self, event: &Event) {
        if let Some(f) = &self.on_end {
            f(event);
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_queued", &self.on_queued.is_some())
            .field("on_begin", &self.on_begin.is_some())
            .field("on_end", &self.on_end.is_some())
            .finish()
    }
}

/// Configuration for a dispatch context.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Scheduling mode.
    pub mode: Mode,
    /// Number of worker threads. Must be 1 unless `mode` is [`Mode::Pool`].
    pub workers: usize,
    /// Tick interval, required for [`Mode::Periodic`].
    pub interval: Option<Duration>,
    /// Prefix for worker thread names.
    pub thread_name: String,
    /// Stack size for worker threads; platform default when `None`.
    pub stack_size: Option<usize>,
    /// Lock release policy.
    pub lock: LockPolicy,
    /// Lifecycle hooks.
    pub callbacks: Callbacks,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Normal,
            workers: 1,
            interval: None,
            thread_name: "evd-worker".to_string(),
            stack_size: None,
            lock: LockPolicy::Default,
            callbacks: Callbacks::default(),
        }
    }
}

impl ContextConfig {
    /// Single-worker configuration.
    #[must_use]
    pub fn single(callbacks: Callbacks) -> Self {
        Self {
            callbacks,
            ..Default::default()
        }
    }

    /// Worker-pool configuration.
    #[must_use]
    pub fn pool(callbacks: Callbacks, workers: usize) -> Self {
        Self {
            mode: Mode::Pool,
            workers,
            callbacks,
            ..Default::default()
        }
    }

    /// Periodic configuration ticking every `interval`.
    #[must_use]
    pub fn periodic(callbacks: Callbacks, interval: Duration) -> Self {
        Self {
            mode: Mode::Periodic,
            interval: Some(interval),
            callbacks,
            ..Default::default()
        }
    }

    /// Check the configuration before any thread is started.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(DispatchError::InvalidArgument(
                "worker count must be between 1 and MAX_WORKERS",
            ));
        }
        match self.mode {
            Mode::Normal | Mode::Periodic if self.workers != 1 => Err(
                DispatchError::InvalidArgument("only pool contexts may have more than one worker"),
            ),
            Mode::Periodic => match self.interval {
                Some(interval)
                    if !interval.is_zero() && Instant::now().checked_add(interval).is_some() =>
                {
                    Ok(())
                }
                _ => Err(DispatchError::InvalidArgument(
                    "periodic contexts need a non-zero interval",
                )),
            },
            Mode::Normal | Mode::Pool => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_single_worker() {
        let config = ContextConfig::default();
        assert_eq!(config.mode, Mode::Normal);
        assert_eq!(config.workers, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_bounds() {
        assert!(ContextConfig::pool(Callbacks::new(), 1).validate().is_ok());
        assert!(ContextConfig::pool(Callbacks::new(), MAX_WORKERS)
            .validate()
            .is_ok());
        assert!(matches!(
            ContextConfig::pool(Callbacks::new(), 0).validate(),
            Err(DispatchError::InvalidArgument(_))
        ));
        assert!(matches!(
            ContextConfig::pool(Callbacks::new(), MAX_WORKERS + 1).validate(),
            Err(DispatchError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_periodic_needs_interval() {
        assert!(ContextConfig::periodic(Callbacks::new(), Duration::from_millis(5))
            .validate()
            .is_ok());
        assert!(matches!(
            ContextConfig::periodic(Callbacks::new(), Duration::ZERO).validate(),
            Err(DispatchError::InvalidArgument(_))
        ));
        let missing = ContextConfig {
            mode: Mode::Periodic,
            ..Default::default()
        };
        assert!(missing.validate().is_err());
    }

    #[test]
    fn test_single_rejects_extra_workers() {
        let config = ContextConfig {
            workers: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
