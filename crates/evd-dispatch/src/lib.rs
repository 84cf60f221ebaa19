//! Embeddable event dispatch for the evd runtime.
//!
//! Callers submit [`Event`]s to a [`Context`], which runs them on its own
//! worker threads. Three modes are available:
//!
//! - **Normal** - one worker, a FIFO ready queue and a deadline-ordered
//!   timer queue
//! - **Pool** - up to [`MAX_WORKERS`] workers sharing the same queues
//! - **Periodic** - one worker that drains the ready queue once per fixed,
//!   drift-free tick; handlers may take several ticks to finish
//!
//! # Example
//!
//! ```
//! use evd_dispatch::{Callbacks, Context, Event};
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//!
//! let ctx = Context::single(Callbacks::new()).unwrap();
//! let total = Arc::new(AtomicU32::new(0));
//!
//! let sum = Arc::clone(&total);
//! let event = Event::with_param(
//!     move |ev| {
//!         let n = *ev.param::<u32>().unwrap();
//!         sum.fetch_add(n, Ordering::SeqCst);
//!         true
//!     },
//!     5u32,
//! );
//!
//! ctx.post(&event).unwrap();
//! event.wait_done().unwrap();
//! assert_eq!(total.load(Ordering::SeqCst), 5);
//!
//! ctx.destroy(true);
//! ```
//!
//! # Suspension
//!
//! A handler that returns `false` is not finished. In normal and pool mode
//! the event stays pending until someone calls [`Event::mark_done`] or
//! [`Event::cancel`]; in periodic mode it runs again on the next tick.
//!
//! # Teardown
//!
//! [`Context::destroy`] stops intake, lets running handlers finish and
//! cancels everything still queued. Waiters of canceled events get
//! [`DispatchError::Canceled`].

#![warn(missing_docs)]

mod config;
mod context;
mod error;
mod event;
mod sync;
mod timer;
mod worker;

pub use config::{Callbacks, ContextConfig, EventCallback, LockPolicy, Mode, MAX_WORKERS};
pub use context::{Context, ContextState};
pub use error::{DispatchError, Result};
pub use event::{Destructor, Event, EventId, EventState, Handler};
pub use timer::Timer;

/// Intrusive list utilities backing the context queues.
pub use evd_list as list;
