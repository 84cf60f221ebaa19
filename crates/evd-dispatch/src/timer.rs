//! Deadline ordering and tick arithmetic.
//!
//! Timed events are kept on wall-clock deadlines ([`SystemTime`]); periodic
//! ticks are anchored on the monotonic clock ([`Instant`]).

use evd_list::{Cursor, ListArena, ListId};
use std::time::{Duration, Instant, SystemTime};

/// When an event becomes eligible to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timer {
    /// Run as soon as a worker is free.
    #[default]
    Immediate,
    /// Run once this much wall-clock time has passed since the event was
    /// posted.
    After(Duration),
    /// Run at or after this wall-clock time.
    At(SystemTime),
}

impl Timer {
    /// Resolve to an absolute deadline against `now`.
    ///
    /// Returns `Ok(None)` for [`Timer::Immediate`] and `Err(())` if a
    /// relative offset overflows the clock.
    pub(crate) fn resolve(self, now: SystemTime) -> Result<Option<SystemTime>, ()> {
        match self {
            Self::Immediate => Ok(None),
            Self::After(offset) => now.checked_add(offset).map(Some).ok_or(()),
            Self::At(at) => Ok(Some(at)),
        }
    }
}

/// Whether `a` must run strictly before `b`.
pub(crate) fn is_nearer(a: SystemTime, b: SystemTime) -> bool {
    a < b
}

/// Whether `deadline` has been reached at `now`.
pub(crate) fn is_due(deadline: SystemTime, now: SystemTime) -> bool {
    deadline <= now
}

/// Time left until `deadline`, zero if already past.
pub(crate) fn remaining(deadline: SystemTime, now: SystemTime) -> Duration {
    deadline.duration_since(now).unwrap_or(Duration::ZERO)
}

/// Position after which an entry with `deadline` keeps `list` ordered.
///
/// The entry goes before the first element with a strictly later deadline,
/// so equal deadlines run in arrival order.
pub(crate) fn insertion_cursor<T>(
    arena: &ListArena<T>,
    list: ListId,
    deadline: SystemTime,
    deadline_of: impl Fn(&T) -> Option<SystemTime>,
) -> Cursor {
    let mut current = arena.iterator(list);
    while let Some(next) = arena.next(current) {
        let later = arena
            .get(next)
            .and_then(&deadline_of)
            .is_some_and(|other| is_nearer(deadline, other));
        if later {
            break;
        }
        current = Cursor::Node(next);
    }
    current
}

// ============================================================================
// Periodic ticks
// ============================================================================

/// Absolute tick deadlines for a periodic worker.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TickSchedule {
    interval: Duration,
    deadline: Instant,
}

impl TickSchedule {
    /// First tick one interval after `now`.
    pub(crate) fn start(now: Instant, interval: Duration) -> Self {
        Self {
            interval,
            deadline: advance_instant(now, interval),
        }
    }

    /// Deadline of the upcoming tick.
    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Move to the next tick once the current one has been processed.
    ///
    /// The next deadline is the previous one plus the interval. If that has
    /// already passed at `now`, the tick overran: the schedule is rebased to
    /// `now + interval` and `true` is returned.
    pub(crate) fn advance(&mut self, now: Instant) -> bool {
        let next = advance_instant(self.deadline, self.interval);
        if next < now {
            self.deadline = advance_instant(now, self.interval);
            true
        } else {
            self.deadline = next;
            false
        }
    }
}

fn advance_instant(at: Instant, by: Duration) -> Instant {
    at.checked_add(by).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_adds_offset() {
        let now = SystemTime::now();
        let offset = Duration::from_millis(250);
        assert_eq!(Timer::After(offset).resolve(now), Ok(Some(now + offset)));
        assert_eq!(Timer::Immediate.resolve(now), Ok(None));
        assert_eq!(Timer::At(now).resolve(now), Ok(Some(now)));
    }

    #[test]
    fn test_due_and_remaining() {
        let now = SystemTime::now();
        let later = now + Duration::from_millis(10);
        assert!(is_due(now, now));
        assert!(!is_due(later, now));
        assert_eq!(remaining(later, now), Duration::from_millis(10));
        assert_eq!(remaining(now, later), Duration::ZERO);
    }

    #[test]
    fn test_insertion_is_stable_for_equal_deadlines() {
        let base = SystemTime::now();
        let mut arena: ListArena<(u32, SystemTime)> = ListArena::new();
        let list = arena.new_list();

        let entries = [
            (0, base + Duration::from_millis(20)),
            (1, base + Duration::from_millis(10)),
            (2, base + Duration::from_millis(20)),
            (3, base + Duration::from_millis(10)),
            (4, base),
        ];
        for entry in entries {
            let at = insertion_cursor(&arena, list, entry.1, |e| Some(e.1));
            let node = arena.insert(entry);
            arena.insert_after(at, node).unwrap();
        }

        let order: Vec<u32> = arena.iter(list).map(|(_, e)| e.0).collect();
        assert_eq!(order, [4, 1, 3, 0, 2]);
    }

    #[test]
    fn test_tick_schedule_is_anchored() {
        let start = Instant::now();
        let interval = Duration::from_millis(10);
        let mut schedule = TickSchedule::start(start, interval);
        assert_eq!(schedule.deadline(), start + interval);

        // Processing finished before the following deadline.
        assert!(!schedule.advance(start + interval + Duration::from_millis(3)));
        assert_eq!(schedule.deadline(), start + interval * 2);
    }

    #[test]
    fn test_tick_schedule_rebases_after_overrun() {
        let start = Instant::now();
        let interval = Duration::from_millis(10);
        let mut schedule = TickSchedule::start(start, interval);

        let late = start + Duration::from_millis(35);
        assert!(schedule.advance(late));
        assert_eq!(schedule.deadline(), late + interval);
    }
}
