//! Single-threaded cooperative scheduler.
//!
//! All router work — event handlers, timers, deferred calls — runs to
//! completion on one thread. Handlers never block; long-running or
//! self-referential work is split across ticks with [`Poller::call_later`]
//! or [`Poller::add_timer_event`].
//!
//! Deferred calls queued while a handler runs execute *after* it returns,
//! in FIFO order. That is what makes "remove this peer" safe to request
//! from inside one of the peer's own event handlers.
//!
//! The poller keeps a virtual monotonic clock. The production loop advances
//! it by real elapsed time; tests advance it explicitly, which makes timer
//! behaviour deterministic.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

type Deferred<C> = Box<dyn FnOnce(&mut C, &mut Poller<C>)>;

struct Timer<C> {
    id: u64,
    deadline: Duration,
    cancelled: Rc<Cell<bool>>,
    callback: Deferred<C>,
}

/// Handle to a scheduled timer. Dropping it cancels the timer; the
/// callback of a cancelled timer is discarded at its deadline.
#[derive(Debug)]
pub struct TimerHandle {
    cancelled: Rc<Cell<bool>>,
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancelled.set(true);
    }
}

/// Cooperative scheduler for a context value of type `C`.
///
/// The context (the router) and the poller are separate values owned by
/// the run loop, so a callback receives mutable access to both.
pub struct Poller<C> {
    deferred: VecDeque<Deferred<C>>,
    timers: Vec<Timer<C>>,
    now: Duration,
    next_timer_id: u64,
}

impl<C> Poller<C> {
    pub fn new() -> Self {
        Poller {
            deferred: VecDeque::new(),
            timers: Vec::new(),
            now: Duration::ZERO,
            next_timer_id: 0,
        }
    }

    /// Queue `callback` to run after the current handler returns.
    pub fn call_later(&mut self, callback: impl FnOnce(&mut C, &mut Poller<C>) + 'static) {
        self.deferred.push_back(Box::new(callback));
    }

    /// Schedule `callback` to fire once, `after` from now.
    ///
    /// The returned handle cancels the timer when dropped, so callers must
    /// keep it alive until the tick. Callbacks should capture stable ids
    /// and re-look-up their target, tolerating absence.
    #[must_use]
    pub fn add_timer_event(
        &mut self,
        after: Duration,
        callback: impl FnOnce(&mut C, &mut Poller<C>) + 'static,
    ) -> TimerHandle {
        let cancelled = Rc::new(Cell::new(false));
        self.next_timer_id += 1;
        self.timers.push(Timer {
            id: self.next_timer_id,
            deadline: self.now + after,
            cancelled: cancelled.clone(),
            callback: Box::new(callback),
        });
        TimerHandle { cancelled }
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Time until the next live timer, if any. The production loop uses
    /// this as its event-wait timeout.
    pub fn until_next_timer(&self) -> Option<Duration> {
        self.timers
            .iter()
            .filter(|t| !t.cancelled.get())
            .map(|t| t.deadline.saturating_sub(self.now))
            .min()
    }

    /// Number of queued deferred calls (used by tests).
    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Run queued deferred calls in FIFO order until none remain.
    ///
    /// Calls queued by a running callback execute in the same drain, after
    /// everything queued before them.
    pub fn process(&mut self, ctx: &mut C) {
        while let Some(callback) = self.deferred.pop_front() {
            callback(ctx, self);
        }
    }

    /// Advance the clock by `dt`, firing due timers in deadline order,
    /// then drain deferred calls.
    pub fn advance(&mut self, ctx: &mut C, dt: Duration) {
        self.now += dt;

        loop {
            // One at a time: a firing timer may schedule new timers.
            let due = self
                .timers
                .iter()
                .enumerate()
                .filter(|(_, t)| !t.cancelled.get() && t.deadline <= self.now)
                .min_by_key(|(_, t)| (t.deadline, t.id))
                .map(|(i, _)| i);
            let Some(index) = due else { break };
            let timer = self.timers.remove(index);
            (timer.callback)(ctx, self);
        }
        self.timers.retain(|t| !t.cancelled.get());

        self.process(ctx);
    }
}

impl<C> Default for Poller<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_calls_run_fifo() {
        let mut poller: Poller<Vec<u32>> = Poller::new();
        let mut log = Vec::new();
        poller.call_later(|log, poller| {
            log.push(1);
            // Queued during a drain: runs after everything already queued.
            poller.call_later(|log, _| log.push(3));
        });
        poller.call_later(|log, _| log.push(2));
        poller.process(&mut log);
        assert_eq!(log, vec![1, 2, 3]);
    }

    #[test]
    fn timer_fires_at_deadline() {
        let mut poller: Poller<Vec<u32>> = Poller::new();
        let mut log = Vec::new();
        let handle = poller.add_timer_event(Duration::from_secs(1), |log: &mut Vec<u32>, _| {
            log.push(7);
        });
        poller.advance(&mut log, Duration::from_millis(999));
        assert!(log.is_empty());
        poller.advance(&mut log, Duration::from_millis(1));
        assert_eq!(log, vec![7]);
        drop(handle);
    }

    #[test]
    fn dropping_handle_cancels_timer() {
        let mut poller: Poller<Vec<u32>> = Poller::new();
        let mut log = Vec::new();
        let handle = poller.add_timer_event(Duration::from_secs(1), |log: &mut Vec<u32>, _| {
            log.push(7);
        });
        drop(handle);
        poller.advance(&mut log, Duration::from_secs(2));
        assert!(log.is_empty());
        assert!(poller.until_next_timer().is_none());
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut poller: Poller<Vec<u32>> = Poller::new();
        let mut log = Vec::new();
        let h2 = poller.add_timer_event(Duration::from_secs(2), |log: &mut Vec<u32>, _| {
            log.push(2);
        });
        let h1 = poller.add_timer_event(Duration::from_secs(1), |log: &mut Vec<u32>, _| {
            log.push(1);
        });
        poller.advance(&mut log, Duration::from_secs(3));
        assert_eq!(log, vec![1, 2]);
        drop((h1, h2));
    }

    #[test]
    fn until_next_timer_reports_soonest() {
        let mut poller: Poller<()> = Poller::new();
        let _h1 = poller.add_timer_event(Duration::from_secs(5), |_, _| {});
        let _h2 = poller.add_timer_event(Duration::from_secs(2), |_, _| {});
        assert_eq!(poller.until_next_timer(), Some(Duration::from_secs(2)));
    }
}
