//! External cancellation of pending operations.
//!
//! An [`AbortSource`] is a cancellation token: interested parties subscribe a
//! one-shot callback, and the first abort request notifies all of them, in
//! subscription order, with an optional [`Fault`] payload.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::fault::Fault;
use crate::timer::{Instant, TimerHandle, TimerWheel};

type AbortCallback = Box<dyn FnOnce(Option<Fault>)>;

struct SourceState {
    // Some once an abort was requested; the payload or the default fault.
    fault: Option<Fault>,
    // BTreeMap over monotonically growing ids gives subscription-order
    // notification.
    subscribers: BTreeMap<u64, AbortCallback>,
    next_id: u64,
}

fn request_abort_on(state: &Rc<RefCell<SourceState>>, payload: Option<Fault>) {
    let subscribers = {
        let mut state = state.borrow_mut();
        if state.fault.is_some() {
            return;
        }
        state.fault = Some(
            payload
                .clone()
                .unwrap_or(Fault::Aborted { name: None }),
        );
        std::mem::take(&mut state.subscribers)
    };
    log::trace!("abort requested, notifying {} subscribers", subscribers.len());
    for (_, callback) in subscribers {
        callback(payload.clone());
    }
}

/// A cancellation token. Only the first abort request has any effect.
pub struct AbortSource {
    state: Rc<RefCell<SourceState>>,
}

impl AbortSource {
    pub fn new() -> AbortSource {
        AbortSource {
            state: Rc::new(RefCell::new(SourceState {
                fault: None,
                subscribers: BTreeMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Register a callback to run on abort. Returns `None` if the abort was
    /// already requested; dropping the subscription unregisters.
    pub fn subscribe(
        &self,
        callback: impl FnOnce(Option<Fault>) + 'static,
    ) -> Option<AbortSubscription> {
        let mut state = self.state.borrow_mut();
        if state.fault.is_some() {
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(id, Box::new(callback));
        Some(AbortSubscription {
            source: Rc::downgrade(&self.state),
            id,
        })
    }

    pub fn request_abort(&self) {
        request_abort_on(&self.state, None);
    }

    pub fn request_abort_with(&self, fault: Fault) {
        request_abort_on(&self.state, Some(fault));
    }

    pub fn abort_requested(&self) -> bool {
        self.state.borrow().fault.is_some()
    }

    /// `Err` with a copy of the stored fault once aborted.
    pub fn check(&self) -> Result<(), Fault> {
        match &self.state.borrow().fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }

    pub fn fault(&self) -> Option<Fault> {
        self.state.borrow().fault.clone()
    }
}

impl Default for AbortSource {
    fn default() -> AbortSource {
        AbortSource::new()
    }
}

/// Registration handle returned by [`AbortSource::subscribe`]; dropping it
/// unregisters the callback.
pub struct AbortSubscription {
    source: Weak<RefCell<SourceState>>,
    id: u64,
}

impl Drop for AbortSubscription {
    fn drop(&mut self) {
        if let Some(source) = self.source.upgrade() {
            source.borrow_mut().subscribers.remove(&self.id);
        }
    }
}

/// Ties a deadline to an abort source, so a fiber written against
/// [`AbortSource`] cancellation also supports timeouts.
pub struct AbortOnExpiry {
    source: AbortSource,
    // Shared with the parent subscription, which clears it to disarm.
    _timer: Rc<RefCell<Option<TimerHandle>>>,
    _parent: Option<AbortSubscription>,
}

impl AbortOnExpiry {
    /// An abort source that trips by itself once `deadline` is reached.
    pub fn new(wheel: &TimerWheel, deadline: Instant) -> AbortOnExpiry {
        let source = AbortSource::new();
        let state = Rc::downgrade(&source.state);
        let timer = wheel.arm(deadline, move || {
            if let Some(state) = state.upgrade() {
                request_abort_on(&state, None);
            }
        });
        AbortOnExpiry {
            source,
            _timer: Rc::new(RefCell::new(Some(timer))),
            _parent: None,
        }
    }

    /// As [`new`](AbortOnExpiry::new), additionally chained to a parent
    /// source: a parent abort disarms the timer and is forwarded, payload
    /// included. An already-aborted parent trips immediately.
    pub fn chained(wheel: &TimerWheel, deadline: Instant, parent: &AbortSource) -> AbortOnExpiry {
        let source = AbortSource::new();
        let state = Rc::downgrade(&source.state);
        let timer = Rc::new(RefCell::new(None));
        let subscription = {
            let state = state.clone();
            let timer = timer.clone();
            parent.subscribe(move |payload| {
                *timer.borrow_mut() = None::<TimerHandle>;
                if let Some(state) = state.upgrade() {
                    request_abort_on(&state, payload);
                }
            })
        };
        match subscription {
            Some(subscription) => {
                *timer.borrow_mut() = Some(wheel.arm(deadline, move || {
                    if let Some(state) = state.upgrade() {
                        request_abort_on(&state, None);
                    }
                }));
                AbortOnExpiry {
                    source,
                    _timer: timer,
                    _parent: Some(subscription),
                }
            }
            None => {
                request_abort_on(&source.state, parent.fault());
                AbortOnExpiry {
                    source,
                    _timer: timer,
                    _parent: None,
                }
            }
        }
    }

    pub fn abort_source(&self) -> &AbortSource {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;
    use std::cell::Cell;

    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn notifies_subscriber_once() {
        let signalled = Rc::new(Cell::new(0));
        let source = AbortSource::new();
        let sub = {
            let signalled = signalled.clone();
            source.subscribe(move |_| signalled.set(signalled.get() + 1))
        };
        assert!(sub.is_some());
        source.request_abort();
        source.request_abort();
        assert_eq!(signalled.get(), 1);
        assert!(source.abort_requested());
        assert_eq!(source.check(), Err(Fault::Aborted { name: None }));
    }

    #[test]
    fn dropped_subscription_is_not_notified() {
        let signalled = Rc::new(Cell::new(false));
        let source = AbortSource::new();
        let sub = {
            let signalled = signalled.clone();
            source.subscribe(move |_| signalled.set(true))
        };
        drop(sub);
        source.request_abort();
        assert!(!signalled.get());
    }

    #[test]
    fn rejects_subscription_after_abort() {
        let source = AbortSource::new();
        source.request_abort();
        assert!(source.subscribe(|_| {}).is_none());
    }

    #[test]
    fn payload_reaches_subscribers_and_check() {
        let seen = Rc::new(RefCell::new(None));
        let source = AbortSource::new();
        let _sub = {
            let seen = seen.clone();
            source.subscribe(move |payload| *seen.borrow_mut() = payload)
        };
        source.request_abort_with(Fault::custom("expected"));
        assert_eq!(*seen.borrow(), Some(Fault::custom("expected")));
        assert_eq!(source.check(), Err(Fault::custom("expected")));
        // First abort wins.
        source.request_abort_with(Fault::custom("late"));
        assert_eq!(source.fault(), Some(Fault::custom("expected")));
    }

    #[test]
    fn notification_in_subscription_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let source = AbortSource::new();
        let subs: Vec<_> = (0..3)
            .map(|i| {
                let order = order.clone();
                source.subscribe(move |_| order.borrow_mut().push(i))
            })
            .collect();
        assert!(subs.iter().all(Option::is_some));
        source.request_abort();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn expiry_trips_the_source() {
        let wheel = TimerWheel::new();
        let expiry = AbortOnExpiry::new(&wheel, Instant::ZERO + 10 * MS);
        assert!(!expiry.abort_source().abort_requested());
        wheel.advance(10 * MS);
        assert!(expiry.abort_source().abort_requested());
    }

    #[test]
    fn dropping_the_expiry_disarms_it() {
        let wheel = TimerWheel::new();
        let expiry = AbortOnExpiry::new(&wheel, Instant::ZERO + 10 * MS);
        drop(expiry);
        wheel.advance(20 * MS);
    }

    #[test]
    fn chained_parent_abort_forwards_payload() {
        let wheel = TimerWheel::new();
        let parent = AbortSource::new();
        let expiry = AbortOnExpiry::chained(&wheel, Instant::ZERO + 10 * MS, &parent);
        parent.request_abort_with(Fault::custom("parent says stop"));
        assert_eq!(
            expiry.abort_source().fault(),
            Some(Fault::custom("parent says stop"))
        );
        // The timer was disarmed; advancing must not re-abort or panic.
        wheel.advance(20 * MS);
    }

    #[test]
    fn chained_timer_fires_without_parent_abort() {
        let wheel = TimerWheel::new();
        let parent = AbortSource::new();
        let expiry = AbortOnExpiry::chained(&wheel, Instant::ZERO + 10 * MS, &parent);
        wheel.advance(10 * MS);
        assert!(expiry.abort_source().abort_requested());
        assert!(!parent.abort_requested());
    }

    #[test]
    fn chained_deadline_survives_a_dropped_parent() {
        let wheel = TimerWheel::new();
        let expiry = {
            let parent = AbortSource::new();
            AbortOnExpiry::chained(&wheel, Instant::ZERO + 10 * MS, &parent)
        };
        wheel.advance(10 * MS);
        assert!(expiry.abort_source().abort_requested());
    }

    #[test]
    fn chained_to_already_aborted_parent() {
        let wheel = TimerWheel::new();
        let parent = AbortSource::new();
        parent.request_abort_with(Fault::custom("too late"));
        let expiry = AbortOnExpiry::chained(&wheel, Instant::ZERO + 10 * MS, &parent);
        assert_eq!(
            expiry.abort_source().fault(),
            Some(Fault::custom("too late"))
        );
    }
}
