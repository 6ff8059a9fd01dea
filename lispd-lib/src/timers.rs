use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

type Callback<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Monotonic-time timer wheel. Callbacks fire on the daemon thread, one at
/// a time in deadline order (FIFO among equal deadlines), so a callback
/// that cancels a later timer wins even within the same tick.
///
/// The heap is lazy: cancel and restart leave stale heap entries behind
/// that are skipped when popped, keyed against the live deadline table.
pub struct TimerWheel<C> {
    next_id: u64,
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    live: HashMap<u64, (Instant, Callback<C>)>,
}

impl<C> Default for TimerWheel<C> {
    fn default() -> Self {
        TimerWheel { next_id: 0, heap: BinaryHeap::new(), live: HashMap::new() }
    }
}

impl<C> TimerWheel<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule<F>(&mut self, after: Duration, callback: F) -> TimerId
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        let deadline = Instant::now() + after;
        self.heap.push(Reverse((deadline, id)));
        self.live.insert(id, (deadline, Box::new(callback)));
        TimerId(id)
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.live.remove(&id.0);
    }

    /// Re-arm a pending timer with a new deadline, keeping its callback.
    /// A timer that already fired or was cancelled stays dead.
    pub fn restart(&mut self, id: TimerId, after: Duration) {
        if let Some((deadline, _)) = self.live.get_mut(&id.0) {
            *deadline = Instant::now() + after;
            let deadline = *deadline;
            self.heap.push(Reverse((deadline, id.0)));
        }
    }

    /// The earliest live deadline, discarding stale heap entries on the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            match self.live.get(&id) {
                Some((live_deadline, _)) if *live_deadline == deadline => return Some(deadline),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Take the next callback due at or before `now`, removing it from the
    /// wheel. Returns `None` once nothing else is due this tick.
    pub fn pop_due(&mut self, now: Instant) -> Option<Callback<C>> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                // Stale entries ahead of a live one can hide an earlier
                // live deadline only if they are due too, so stopping at
                // the first future entry needs the stale check first.
                match self.live.get(&id) {
                    Some((live_deadline, _)) if *live_deadline == deadline => return None,
                    _ => {
                        self.heap.pop();
                        continue;
                    }
                }
            }
            self.heap.pop();
            match self.live.remove(&id) {
                Some((live_deadline, callback)) if live_deadline == deadline => {
                    return Some(callback);
                }
                // A stale heap entry for a restarted timer: put it back.
                Some(entry) => {
                    self.live.insert(id, entry);
                }
                None => {}
            }
        }
        None
    }

    pub fn cancel_all(&mut self) {
        self.live.clear();
        self.heap.clear();
    }

    pub fn pending(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Trace(Vec<&'static str>);

    #[tokio::test(start_paused = true)]
    async fn fires_in_deadline_then_fifo_order() {
        let mut wheel: TimerWheel<Trace> = TimerWheel::new();
        wheel.schedule(Duration::from_millis(20), |t: &mut Trace| t.0.push("b"));
        wheel.schedule(Duration::from_millis(10), |t: &mut Trace| t.0.push("a"));
        wheel.schedule(Duration::from_millis(20), |t: &mut Trace| t.0.push("c"));

        tokio::time::advance(Duration::from_millis(25)).await;
        let mut trace = Trace::default();
        while let Some(cb) = wheel.pop_due(Instant::now()) {
            cb(&mut trace);
        }
        assert_eq!(trace.0, vec!["a", "b", "c"]);
        assert_eq!(wheel.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let mut wheel: TimerWheel<Trace> = TimerWheel::new();
        let id = wheel.schedule(Duration::from_millis(10), |t: &mut Trace| t.0.push("dead"));
        wheel.cancel(id);

        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(wheel.pop_due(Instant::now()).is_none());
        assert!(wheel.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_moves_the_deadline_and_keeps_the_callback() {
        let mut wheel: TimerWheel<Trace> = TimerWheel::new();
        let id = wheel.schedule(Duration::from_millis(10), |t: &mut Trace| t.0.push("x"));
        wheel.restart(id, Duration::from_millis(50));

        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(wheel.pop_due(Instant::now()).is_none());

        tokio::time::advance(Duration::from_millis(40)).await;
        let mut trace = Trace::default();
        let cb = wheel.pop_due(Instant::now()).expect("due after restart");
        cb(&mut trace);
        assert_eq!(trace.0, vec!["x"]);
    }

    #[tokio::test(start_paused = true)]
    async fn a_callback_can_cancel_a_sibling_in_the_same_tick() {
        let mut wheel: TimerWheel<Trace> = TimerWheel::new();
        let victim = wheel.schedule(Duration::from_millis(10), |t: &mut Trace| t.0.push("victim"));
        wheel.schedule(Duration::from_millis(5), |t: &mut Trace| t.0.push("killer"));

        tokio::time::advance(Duration::from_millis(20)).await;
        let mut trace = Trace::default();
        // First due callback runs, then decides to cancel the second.
        let cb = wheel.pop_due(Instant::now()).unwrap();
        cb(&mut trace);
        wheel.cancel(victim);
        assert!(wheel.pop_due(Instant::now()).is_none());
        assert_eq!(trace.0, vec!["killer"]);
    }
}
