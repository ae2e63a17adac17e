//! Monotonic time points and single-shot timers.
//!
//! The wheel does not tick by itself: the embedder (or a test) advances it
//! explicitly, which keeps everything built on top deterministic. Callbacks
//! run with the wheel unlocked, so they are free to arm or disarm timers.

use core::cmp;
use core::ops;
use core::time::Duration;
use std::cell::RefCell;
use std::collections::{BinaryHeap, HashMap};
use std::rc::{Rc, Weak};

/// A point on a [`TimerWheel`]'s monotonic timeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(Duration);

impl Instant {
    pub const ZERO: Instant = Instant(Duration::ZERO);
    /// Sentinel meaning "no deadline"; arming a timer at `MAX` is skipped.
    pub const MAX: Instant = Instant(Duration::MAX);
}

impl ops::Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_add(rhs))
    }
}

impl ops::AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl ops::Sub<Duration> for Instant {
    type Output = Instant;
    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_sub(rhs))
    }
}

impl ops::SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, rhs: Duration) {
        *self = *self - rhs;
    }
}

impl ops::Sub<Instant> for Instant {
    type Output = Duration;
    fn sub(self, rhs: Instant) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

// Min-heap entry; ties fire in arm order.
struct Expiry {
    at: Instant,
    seq: u64,
}

impl PartialEq for Expiry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Expiry {}

impl Ord for Expiry {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.at
            .cmp(&other.at)
            .then(self.seq.cmp(&other.seq))
            .reverse()
    }
}
impl PartialOrd for Expiry {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

type Callback = Box<dyn FnOnce()>;

struct WheelState {
    now: Instant,
    queue: BinaryHeap<Expiry>,
    // Disarming removes the slot; the matching heap entry becomes a dud.
    slots: HashMap<u64, Callback>,
    next_seq: u64,
}

/// Single-shot timer service, advanced manually. Cheap to clone; clones share
/// one timeline.
#[derive(Clone)]
pub struct TimerWheel {
    state: Rc<RefCell<WheelState>>,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            state: Rc::new(RefCell::new(WheelState {
                now: Instant::ZERO,
                queue: BinaryHeap::new(),
                slots: HashMap::new(),
                next_seq: 0,
            })),
        }
    }

    pub fn now(&self) -> Instant {
        self.state.borrow().now
    }

    /// Arm a timer at `at`. The callback fires during the first advancement
    /// reaching `at`; it never fires early. Dropping the returned handle
    /// disarms.
    pub fn arm(&self, at: Instant, callback: impl FnOnce() + 'static) -> TimerHandle {
        let mut state = self.state.borrow_mut();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Expiry { at, seq });
        state.slots.insert(seq, Box::new(callback));
        TimerHandle {
            wheel: Rc::downgrade(&self.state),
            seq,
        }
    }

    pub fn advance(&self, by: Duration) {
        let to = self.now() + by;
        self.advance_to(to);
    }

    /// Move the timeline forward to `to`, firing every due callback in
    /// deadline order. Entries popped one at a time with the wheel unlocked
    /// in between, so a callback disarming a sibling timer still wins.
    pub fn advance_to(&self, to: Instant) {
        loop {
            let fired = {
                let mut state = self.state.borrow_mut();
                let due = state.queue.peek().map_or(false, |expiry| expiry.at <= to);
                if !due {
                    state.now = state.now.max(to);
                    break;
                }
                let expiry = state.queue.pop().unwrap();
                state.now = state.now.max(expiry.at);
                state.slots.remove(&expiry.seq).map(|cb| (expiry.seq, cb))
            };
            if let Some((seq, callback)) = fired {
                log::trace!("timer {} fired at {:?}", seq, self.now());
                callback();
            }
        }
    }
}

impl Default for TimerWheel {
    fn default() -> TimerWheel {
        TimerWheel::new()
    }
}

/// Handle to an armed timer; dropping it disarms. A fired or disarmed handle
/// is inert.
pub struct TimerHandle {
    wheel: Weak<RefCell<WheelState>>,
    seq: u64,
}

impl TimerHandle {
    pub fn disarm(self) {}
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(wheel) = self.wheel.upgrade() {
            wheel.borrow_mut().slots.remove(&self.seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    const MS: Duration = Duration::from_millis(1);

    fn recorder() -> (Rc<RefCell<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnOnce()>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mk = {
            let log = log.clone();
            move |tag: u32| -> Box<dyn FnOnce()> {
                let log = log.clone();
                Box::new(move || log.borrow_mut().push(tag))
            }
        };
        (log, mk)
    }

    #[test]
    fn fires_in_deadline_order() {
        let wheel = TimerWheel::new();
        let (log, mk) = recorder();
        let _a = wheel.arm(Instant::ZERO + 30 * MS, mk(3));
        let _b = wheel.arm(Instant::ZERO + 10 * MS, mk(1));
        let _c = wheel.arm(Instant::ZERO + 20 * MS, mk(2));
        wheel.advance(50 * MS);
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
        assert_eq!(wheel.now(), Instant::ZERO + 50 * MS);
    }

    #[test]
    fn partial_advance_only_fires_due_timers() {
        let wheel = TimerWheel::new();
        let (log, mk) = recorder();
        let _a = wheel.arm(Instant::ZERO + 10 * MS, mk(1));
        let _b = wheel.arm(Instant::ZERO + 20 * MS, mk(2));
        wheel.advance(10 * MS);
        assert_eq!(*log.borrow(), vec![1]);
        wheel.advance(10 * MS);
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn disarm_by_drop() {
        let wheel = TimerWheel::new();
        let (log, mk) = recorder();
        let armed = wheel.arm(Instant::ZERO + 5 * MS, mk(1));
        drop(armed);
        wheel.advance(10 * MS);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn past_deadline_fires_on_next_advance() {
        let wheel = TimerWheel::new();
        let (log, mk) = recorder();
        wheel.advance(100 * MS);
        let _a = wheel.arm(Instant::ZERO + 5 * MS, mk(1));
        assert!(log.borrow().is_empty());
        wheel.advance(Duration::ZERO);
        assert_eq!(*log.borrow(), vec![1]);
    }

    #[test]
    fn callback_may_arm_within_the_same_advance() {
        let wheel = TimerWheel::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let handles = Rc::new(RefCell::new(Vec::new()));
        {
            let wheel2 = wheel.clone();
            let log = log.clone();
            let handles2 = handles.clone();
            handles.borrow_mut().push(wheel.arm(Instant::ZERO + 10 * MS, move || {
                log.borrow_mut().push(1);
                let log = log.clone();
                let inner = wheel2.arm(Instant::ZERO + 20 * MS, move || log.borrow_mut().push(2));
                handles2.borrow_mut().push(inner);
            }));
        }
        wheel.advance(30 * MS);
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn callback_may_disarm_a_sibling() {
        let wheel = TimerWheel::new();
        let (log, mk) = recorder();
        let victim = Rc::new(RefCell::new(None));
        let _killer = {
            let victim = victim.clone();
            let log = log.clone();
            wheel.arm(Instant::ZERO + 5 * MS, move || {
                log.borrow_mut().push(1);
                *victim.borrow_mut() = None::<TimerHandle>;
            })
        };
        *victim.borrow_mut() = Some(wheel.arm(Instant::ZERO + 5 * MS, mk(2)));
        wheel.advance(10 * MS);
        assert_eq!(*log.borrow(), vec![1]);
    }

    #[test]
    fn saturating_instant_arithmetic() {
        assert_eq!(Instant::MAX + MS, Instant::MAX);
        assert_eq!(Instant::ZERO - MS, Instant::ZERO);
        assert_eq!((Instant::ZERO + 10 * MS) - (Instant::ZERO + 4 * MS), 6 * MS);
    }
}
