//! One-shot producer/consumer completion pair.
//!
//! An [`Eventual`] either carries its result inline (the ready constructors,
//! which involve no shared allocation and resolve on the first poll) or
//! shares a cell with the [`Promise`] that will resolve it.

use core::future::Future;
use core::mem::replace;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::cell::RefCell;
use std::rc::Rc;

use crate::fault::Fault;

enum State<T> {
    Pending { waker: Option<Waker> },
    Ready(Result<T, Fault>),
    Consumed,
    Abandoned,
}

type Core<T> = Rc<RefCell<State<T>>>;

/// Producer half. Resolving consumes the promise; exactly one of
/// [`set_value`](Promise::set_value) or [`set_fault`](Promise::set_fault) may
/// be called over its lifetime.
pub struct Promise<T> {
    core: Core<T>,
}

impl<T> Promise<T> {
    pub fn set_value(self, value: T) {
        self.resolve(Ok(value));
    }

    pub fn set_fault(self, fault: Fault) {
        self.resolve(Err(fault));
    }

    fn resolve(self, result: Result<T, Fault>) {
        let mut state = self.core.borrow_mut();
        match replace(&mut *state, State::Ready(result)) {
            State::Pending { waker } => {
                if let Some(waker) = waker {
                    waker.wake();
                }
            }
            _ => panic!("BUG: eventual resolved twice"),
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        let mut state = self.core.borrow_mut();
        if let State::Pending { waker } = &mut *state {
            // Wake the consumer so it observes the abandonment instead of
            // pending forever.
            let waker = waker.take();
            *state = State::Abandoned;
            drop(state);
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

enum Repr<T> {
    Immediate(Option<Result<T, Fault>>),
    Shared(Core<T>),
}

/// Consumer half; a future yielding `Result<T, Fault>` exactly once.
#[must_use = "Future do nothing unless awaited"]
pub struct Eventual<T> {
    repr: Repr<T>,
}

impl<T> Eventual<T> {
    /// An eventual that is already successfully completed.
    pub fn ready(value: T) -> Eventual<T> {
        Eventual {
            repr: Repr::Immediate(Some(Ok(value))),
        }
    }

    /// An eventual that is already failed.
    pub fn faulted(fault: Fault) -> Eventual<T> {
        Eventual {
            repr: Repr::Immediate(Some(Err(fault))),
        }
    }
}

impl<T> Future for Eventual<T> {
    type Output = Result<T, Fault>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut unsafe { self.get_unchecked_mut() }.repr {
            Repr::Immediate(slot) => match slot.take() {
                Some(result) => Poll::Ready(result),
                None => panic!("BUG: eventual polled after completion"),
            },
            Repr::Shared(core) => {
                let mut state = core.borrow_mut();
                match replace(&mut *state, State::Consumed) {
                    State::Pending { .. } => {
                        *state = State::Pending {
                            waker: Some(cx.waker().clone()),
                        };
                        Poll::Pending
                    }
                    State::Ready(result) => Poll::Ready(result),
                    State::Consumed => panic!("BUG: eventual polled after completion"),
                    State::Abandoned => panic!("BUG: promise dropped without resolving"),
                }
            }
        }
    }
}

/// Create a connected promise/eventual pair.
pub fn eventual<T>() -> (Promise<T>, Eventual<T>) {
    let core = Rc::new(RefCell::new(State::Pending { waker: None }));
    (
        Promise { core: core.clone() },
        Eventual {
            repr: Repr::Shared(core),
        },
    )
}
