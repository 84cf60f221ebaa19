//! Worker loops.
//!
//! Each worker holds the context lock while choosing work and releases it
//! only to run a handler or to block on the condition variable. The loop
//! exits as soon as it observes a state other than `Running`.

use crate::config::Mode;
use crate::context::{ContextState, Core, Queues, Shared};
use crate::event::{Event, Unlink};
use crate::timer::{self, TickSchedule};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, trace, warn};

/// Entry point of a worker thread.
pub(crate) fn run(shared: &Arc<Shared>, worker: usize) {
    debug!(worker, mode = ?shared.mode, "worker started");
    match shared.mode {
        Mode::Normal | Mode::Pool => run_queued(shared, worker),
        Mode::Periodic => run_periodic(shared, worker),
    }
    debug!(worker, "worker exiting");
}

// ============================================================================
// Normal and pool mode
// ============================================================================

/// What a worker does next.
enum Step {
    Run(Event),
    Wait,
    WaitFor(Duration),
}

/// Pick the next actionable event.
///
/// A due timer wins; otherwise ready work runs before sleeping toward a
/// future deadline, so immediate events never starve behind a timer.
fn next_step(queues: &mut Queues, now: SystemTime) -> Step {
    if let Some(deadline) = queues.next_deadline() {
        if timer::is_due(deadline, now) {
            if let Some(event) = queues.pop_timer() {
                return Step::Run(event);
            }
        }
        if let Some(event) = queues.pop_ready() {
            return Step::Run(event);
        }
        return Step::WaitFor(timer::remaining(deadline, now));
    }
    queues.pop_ready().map_or(Step::Wait, Step::Run)
}

fn run_queued(shared: &Shared, worker: usize) {
    let mut core = shared.core.lock();
    while core.state == ContextState::Running {
        match next_step(&mut core.queues, SystemTime::now()) {
            Step::Run(event) => {
                shared.unlocked(&mut core, || dispatch(shared, &event, worker));
            }
            Step::Wait => shared.condvar.wait(&mut core),
            Step::WaitFor(timeout) => {
                let _ = shared.condvar.wait_for(&mut core, timeout);
            }
        }
    }
    shared.release(core);
}

// ============================================================================
// Periodic mode
// ============================================================================

fn run_periodic(shared: &Arc<Shared>, worker: usize) {
    let Some(interval) = shared.interval else {
        error!(worker, "periodic context without an interval");
        return;
    };
    let owner: Weak<dyn Unlink> = Arc::downgrade(shared) as Weak<dyn Unlink>;
    let mut schedule = TickSchedule::start(Instant::now(), interval);

    let mut core = shared.core.lock();
    'ticks: loop {
        // Sleep until the tick; only teardown cuts it short.
        while core.state == ContextState::Running && Instant::now() < schedule.deadline() {
            let _ = shared.condvar.wait_until(&mut core, schedule.deadline());
        }
        if core.state != ContextState::Running {
            break;
        }
        core.period_count += 1;

        // Drain the ready queue, including events posted during the tick.
        while let Some(event) = core.queues.pop_ready() {
            let done = shared.unlocked(&mut core, || dispatch(shared, &event, worker));
            if !done && !event.is_terminal() {
                if core.state == ContextState::Running {
                    core.queues.park_handled(&event, owner.clone());
                } else {
                    shared.unlocked(&mut core, || event.cancel_detached());
                }
            }
            if core.state != ContextState::Running {
                break 'ticks;
            }
        }
        core.queues.requeue_handled();

        let overran = schedule.advance(Instant::now());
        note_overrun(&mut core, overran, worker);
    }
    shared.release(core);
}

fn note_overrun(core: &mut Core, overran: bool, worker: usize) {
    core.overrun = overran;
    if overran {
        core.overrun_count += 1;
        warn!(
            worker,
            tick = core.period_count,
            overruns = core.overrun_count,
            "tick overran its interval"
        );
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Run one event outside the lock. Returns whether the handler reported
/// the event done.
fn dispatch(shared: &Shared, event: &Event, worker: usize) -> bool {
    // Canceled between pop and run.
    if event.is_terminal() {
        return false;
    }
    trace!(event = %event.id(), worker, "dispatching event");

    shared.callbacks.begin(event);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| event.invoke()));
    shared.callbacks.end(event);

    match outcome {
        Ok(Some(true)) => {
            event.complete();
            true
        }
        Ok(None) => {
            trace!(event = %event.id(), worker, "event finished before its handler ran");
            false
        }
        Ok(Some(false)) => {
            trace!(event = %event.id(), worker, "event suspended");
            false
        }
        Err(_) => {
            error!(event = %event.id(), worker, "event handler panicked; canceling event");
            event.cancel_detached();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> Weak<dyn Unlink> {
        struct Nobody;
        impl Unlink for Nobody {
            fn unlink(&self, _: &Event) {}
        }
        let owner: Weak<dyn Unlink> = Weak::<Nobody>::new();
        owner
    }

    #[test]
    fn test_idle_queues_wait() {
        let mut queues = Queues::new();
        assert!(matches!(next_step(&mut queues, SystemTime::now()), Step::Wait));
    }

    #[test]
    fn test_due_timer_beats_ready() {
        let mut queues = Queues::new();
        let now = SystemTime::now();
        let ready = Event::new(|_| true);
        let timed = Event::new(|_| true);
        queues.push_ready(&ready, owner());
        queues.push_timed(&timed, now, owner());

        match next_step(&mut queues, now) {
            Step::Run(event) => assert!(Event::ptr_eq(&event, &timed)),
            _ => panic!("expected the due timer to run"),
        }
    }

    #[test]
    fn test_ready_runs_before_future_timer() {
        let mut queues = Queues::new();
        let now = SystemTime::now();
        let ready = Event::new(|_| true);
        let timed = Event::new(|_| true);
        queues.push_timed(&timed, now + Duration::from_secs(60), owner());
        queues.push_ready(&ready, owner());

        match next_step(&mut queues, now) {
            Step::Run(event) => assert!(Event::ptr_eq(&event, &ready)),
            _ => panic!("expected ready work to run"),
        }
        match next_step(&mut queues, now) {
            Step::WaitFor(timeout) => assert_eq!(timeout, Duration::from_secs(60)),
            _ => panic!("expected a timed wait"),
        }
    }
}
