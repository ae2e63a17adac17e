//! Synchronization primitives for the weft fiber runtime.
//!
//! Everything in this crate is affine to one cooperatively scheduled
//! executor: fibers suspend on [`Eventual`] completions instead of blocking
//! threads, so none of the types are `Send` and no locks are involved. The
//! centerpiece is [`Semaphore`], a counting semaphore with FIFO wakeups,
//! RAII [`Units`] ownership, deadline/abort cancellation and a terminal
//! broken state.

pub mod abort;
pub mod eventual;
pub mod fault;
pub mod sem;
pub mod timer;

pub use abort::{AbortOnExpiry, AbortSource, AbortSubscription};
pub use eventual::{eventual, Eventual, Promise};
pub use fault::{DefaultFaults, ExcessUnits, Fault, FaultFactory, NamedFaults};
pub use sem::{
    acquire, acquire_abortable, acquire_for, acquire_until, consume_into, try_acquire,
    with_semaphore, with_semaphore_for, NamedSemaphore, Semaphore, Units,
};
pub use timer::{Instant, TimerHandle, TimerWheel};
