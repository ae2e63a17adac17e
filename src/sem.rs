//! Counting semaphore for cooperatively scheduled fibers.
//!
//! The counter can be deposited into ([`signal`](Semaphore::signal)) and
//! taken from ([`wait`](Semaphore::wait)/[`acquire`](Semaphore::acquire));
//! takers suspend while short on units. Waits are serviced strictly in
//! arrival order and can be bounded by a deadline or an [`AbortSource`].
//! [`broken`](Semaphore::broken) fails every current and future waiter,
//! which makes all fibers blocked on the semaphore resume with a fault.
//!
//! Everything here is affine to one scheduler; none of it may cross threads.

use core::cell::Cell;
use core::future::Future;
use core::mem::replace;
use core::time::Duration;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};

use crate::abort::{AbortSource, AbortSubscription};
use crate::eventual::{eventual, Eventual, Promise};
use crate::fault::{DefaultFaults, ExcessUnits, Fault, FaultFactory, NamedFaults};
use crate::timer::{Instant, TimerHandle, TimerWheel};

enum ResolveAs<F: FaultFactory> {
    Signal(Promise<()>),
    Grant(Promise<Units<F>>),
}

enum CancelGuard {
    None,
    Timer(TimerHandle),
    Abort(AbortSubscription),
}

// One queued acquisition. Owned by the wait list; cancellation callbacks keep
// weak back-references and check linkage before acting.
struct Waiter<F: FaultFactory> {
    link: LinkedListLink,
    nr: Cell<usize>,
    outcome: RefCell<Option<ResolveAs<F>>>,
    guard: RefCell<CancelGuard>,
}

intrusive_adapter!(WaiterAdapter<F> = Rc<Waiter<F>>: Waiter<F> { link: LinkedListLink } where F: FaultFactory);

impl<F: FaultFactory> Waiter<F> {
    fn unarmed() -> Waiter<F> {
        Waiter {
            link: LinkedListLink::new(),
            nr: Cell::new(0),
            outcome: RefCell::new(None),
            guard: RefCell::new(CancelGuard::None),
        }
    }

    fn resolve_granted(&self, sem: &SemRc<F>) {
        *self.guard.borrow_mut() = CancelGuard::None;
        match self.outcome.borrow_mut().take() {
            Some(ResolveAs::Signal(promise)) => promise.set_value(()),
            Some(ResolveAs::Grant(promise)) => {
                promise.set_value(Units::granted(Rc::downgrade(sem), self.nr.get()))
            }
            None => panic!("BUG: waiter resolved twice"),
        }
    }

    fn resolve_faulted(&self, fault: Fault) {
        *self.guard.borrow_mut() = CancelGuard::None;
        match self.outcome.borrow_mut().take() {
            Some(ResolveAs::Signal(promise)) => promise.set_fault(fault),
            Some(ResolveAs::Grant(promise)) => promise.set_fault(fault),
            None => panic!("BUG: waiter resolved twice"),
        }
    }
}

struct SemState<F: FaultFactory> {
    // Signed: consume() may drive it negative.
    count: isize,
    fault: Option<Fault>,
    wait_list: LinkedList<WaiterAdapter<F>>,
    freelist: Vec<Rc<Waiter<F>>>,
    factory: F,
}

type SemRc<F> = Rc<RefCell<SemState<F>>>;

impl<F: FaultFactory> SemState<F> {
    fn has_available(&self, nr: usize) -> bool {
        self.count >= 0 && self.count as usize >= nr
    }

    fn may_proceed(&self, nr: usize) -> bool {
        self.has_available(nr) && self.wait_list.is_empty()
    }

    fn node(&mut self) -> Rc<Waiter<F>> {
        self.freelist
            .pop()
            .unwrap_or_else(|| Rc::new(Waiter::unarmed()))
    }
}

// FIFO grant loop: the head is granted while satisfiable. A large request at
// the head blocks smaller ones behind it; that is what keeps large requests
// from starving.
fn grant_ready<F: FaultFactory>(sem: &SemRc<F>) {
    let mut granted = Vec::new();
    {
        let mut state = sem.borrow_mut();
        let state = &mut *state;
        loop {
            let nr = match state.wait_list.front().get() {
                Some(head) => head.nr.get(),
                None => break,
            };
            if !state.has_available(nr) {
                break;
            }
            state.count -= nr as isize;
            granted.push(state.wait_list.pop_front().unwrap());
        }
    }
    // Resolve with the state unborrowed; waking a consumer must not observe a
    // half-updated semaphore.
    for waiter in granted {
        waiter.resolve_granted(sem);
    }
}

fn signal_on<F: FaultFactory>(sem: &SemRc<F>, nr: usize) {
    {
        let mut state = sem.borrow_mut();
        if state.fault.is_some() {
            return;
        }
        state.count += nr as isize;
    }
    grant_ready(sem);
}

// Unlink `waiter` if it is still queued and fail it. A stale callback finds
// the waiter unlinked (or already freed) and drops out: first to act wins.
fn cancel_waiter<F: FaultFactory>(
    sem: &Weak<RefCell<SemState<F>>>,
    waiter: &Weak<Waiter<F>>,
    fault: impl FnOnce(&SemState<F>) -> Fault,
) {
    let (Some(sem), Some(waiter)) = (sem.upgrade(), waiter.upgrade()) else {
        return;
    };
    let (node, fault) = {
        let mut state = sem.borrow_mut();
        if !waiter.link.is_linked() {
            return;
        }
        let node = unsafe {
            state
                .wait_list
                .cursor_mut_from_ptr(Rc::as_ptr(&waiter))
                .remove()
                .unwrap()
        };
        (node, fault(&*state))
    };
    // Removing a queued request can make the new head satisfiable.
    grant_ready(&sem);
    node.resolve_faulted(fault);
}

enum ArmKind<'a> {
    Never,
    Deadline(&'a TimerWheel, Instant),
    Abort(&'a AbortSource),
}

fn pre_armed_fault<F: FaultFactory>(state: &SemState<F>, arm: &ArmKind<'_>) -> Option<Fault> {
    match arm {
        ArmKind::Never => None,
        ArmKind::Deadline(wheel, deadline) => (*deadline != Instant::MAX
            && wheel.now() >= *deadline)
            .then(|| state.factory.timeout()),
        ArmKind::Abort(abort) => abort.abort_requested().then(|| state.factory.aborted()),
    }
}

/// Counted resource guard for fibers.
///
/// Start the counter at 1 for an unlocked mutex, at N for a bounded resource
/// pool, at 0 for pure signalling. The fault policy `F` decides what failed
/// waits resolve to; [`NamedSemaphore`] labels every fault with the
/// semaphore's name.
pub struct Semaphore<F: FaultFactory = DefaultFaults> {
    state: SemRc<F>,
}

/// Semaphore whose faults carry an identifying label.
pub type NamedSemaphore = Semaphore<NamedFaults>;

impl Semaphore<DefaultFaults> {
    pub fn new(count: usize) -> Semaphore<DefaultFaults> {
        Semaphore::with_factory(count, DefaultFaults)
    }
}

impl Semaphore<NamedFaults> {
    pub fn named(count: usize, name: impl Into<Rc<str>>) -> NamedSemaphore {
        Semaphore::with_factory(count, NamedFaults::new(name))
    }
}

impl<F: FaultFactory> Semaphore<F> {
    pub fn with_factory(count: usize, factory: F) -> Semaphore<F> {
        debug_assert!(count <= Self::max_counter());
        Semaphore {
            state: Rc::new(RefCell::new(SemState {
                count: count as isize,
                fault: None,
                wait_list: LinkedList::new(WaiterAdapter::new()),
                freelist: Vec::new(),
                factory,
            })),
        }
    }

    /// Largest value the unit counter can hold.
    pub const fn max_counter() -> usize {
        isize::MAX as usize
    }

    /// Units available right now, ignoring waiters; never negative.
    pub fn current(&self) -> usize {
        self.state.borrow().count.max(0) as usize
    }

    /// The raw counter; negative after [`consume`](Semaphore::consume) debt.
    pub fn available_units(&self) -> isize {
        self.state.borrow().count
    }

    /// Current wait-queue depth.
    pub fn waiters(&self) -> usize {
        self.state.borrow().wait_list.iter().count()
    }

    /// The stored fault, once broken.
    pub fn fault(&self) -> Option<Fault> {
        self.state.borrow().fault.clone()
    }

    /// Opportunistically take `nr` units. Succeeds only if the units are
    /// available *and* nobody is queued; opportunistic callers may not jump
    /// the queue. Always fails on a broken semaphore.
    pub fn try_wait(&self, nr: usize) -> bool {
        let mut state = self.state.borrow_mut();
        if state.fault.is_some() {
            return false;
        }
        if state.may_proceed(nr) {
            state.count -= nr as isize;
            true
        } else {
            false
        }
    }

    /// Take `nr` units, suspending until they are available.
    pub fn wait(&self, nr: usize) -> Eventual<()> {
        self.wait_inner(nr, ArmKind::Never)
    }

    /// As [`wait`](Semaphore::wait), failing with the policy's timeout fault
    /// if not granted by `deadline`. `Instant::MAX` means no deadline.
    pub fn wait_until(&self, nr: usize, wheel: &TimerWheel, deadline: Instant) -> Eventual<()> {
        self.wait_inner(nr, ArmKind::Deadline(wheel, deadline))
    }

    /// As [`wait_until`](Semaphore::wait_until) with a relative timeout.
    pub fn wait_for(&self, nr: usize, wheel: &TimerWheel, timeout: Duration) -> Eventual<()> {
        self.wait_inner(nr, ArmKind::Deadline(wheel, wheel.now() + timeout))
    }

    /// As [`wait`](Semaphore::wait), cancellable through `abort`. The fault
    /// delivered is the abort payload if one was given, otherwise the
    /// policy's aborted fault.
    pub fn wait_abortable(&self, nr: usize, abort: &AbortSource) -> Eventual<()> {
        self.wait_inner(nr, ArmKind::Abort(abort))
    }

    /// Take `nr` units as an RAII [`Units`] handle that returns them on drop.
    pub fn acquire(&self, nr: usize) -> Eventual<Units<F>> {
        self.acquire_inner(nr, ArmKind::Never)
    }

    pub fn acquire_until(
        &self,
        nr: usize,
        wheel: &TimerWheel,
        deadline: Instant,
    ) -> Eventual<Units<F>> {
        self.acquire_inner(nr, ArmKind::Deadline(wheel, deadline))
    }

    pub fn acquire_for(
        &self,
        nr: usize,
        wheel: &TimerWheel,
        timeout: Duration,
    ) -> Eventual<Units<F>> {
        self.acquire_inner(nr, ArmKind::Deadline(wheel, wheel.now() + timeout))
    }

    pub fn acquire_abortable(&self, nr: usize, abort: &AbortSource) -> Eventual<Units<F>> {
        self.acquire_inner(nr, ArmKind::Abort(abort))
    }

    /// Deposit `nr` units and grant queued waiters in FIFO order. Every
    /// waiter satisfiable from the new counter value is resolved before this
    /// returns. No-op on a broken semaphore.
    pub fn signal(&self, nr: usize) {
        signal_on(&self.state, nr);
    }

    /// Take `nr` units unconditionally; the counter may go negative. Wakes
    /// nobody. No-op on a broken semaphore.
    pub fn consume(&self, nr: usize) {
        let mut state = self.state.borrow_mut();
        if state.fault.is_some() {
            return;
        }
        state.count -= nr as isize;
    }

    /// Break the semaphore with the policy's broken fault; see
    /// [`broken_with`](Semaphore::broken_with).
    pub fn broken(&self) {
        let fault = self.state.borrow().factory.broken();
        self.broken_with(fault);
    }

    /// Terminally break the semaphore: zero the counter and fail every queued
    /// waiter, in arrival order, with a copy of `fault`. Subsequent waits
    /// fail immediately with further copies; `signal` and `consume` become
    /// no-ops.
    pub fn broken_with(&self, fault: Fault) {
        let drained = {
            let mut state = self.state.borrow_mut();
            state.fault = Some(fault.clone());
            state.count = 0;
            state.freelist.clear();
            let mut drained = Vec::new();
            while let Some(waiter) = state.wait_list.pop_front() {
                drained.push(waiter);
            }
            drained
        };
        if !drained.is_empty() {
            log::debug!(
                "semaphore broken, failing {} waiters: {}",
                drained.len(),
                fault
            );
        }
        for waiter in drained {
            waiter.resolve_faulted(fault.clone());
        }
    }

    /// Preallocate waiter storage so the next `n` enqueues draw from the
    /// freelist instead of allocating.
    pub fn ensure_space_for_waiters(&self, n: usize) {
        let mut state = self.state.borrow_mut();
        state.freelist.reserve(n);
        for _ in 0..n {
            state.freelist.push(Rc::new(Waiter::unarmed()));
        }
    }

    fn wait_inner(&self, nr: usize, arm: ArmKind<'_>) -> Eventual<()> {
        {
            let mut state = self.state.borrow_mut();
            if let Some(fault) = &state.fault {
                return Eventual::faulted(fault.clone());
            }
            if state.may_proceed(nr) {
                state.count -= nr as isize;
                return Eventual::ready(());
            }
            if let Some(fault) = pre_armed_fault(&state, &arm) {
                return Eventual::faulted(fault);
            }
        }
        let (promise, completion) = eventual();
        self.enqueue(nr, ResolveAs::Signal(promise), arm);
        completion
    }

    fn acquire_inner(&self, nr: usize, arm: ArmKind<'_>) -> Eventual<Units<F>> {
        {
            let mut state = self.state.borrow_mut();
            if let Some(fault) = &state.fault {
                return Eventual::faulted(fault.clone());
            }
            if state.may_proceed(nr) {
                state.count -= nr as isize;
                return Eventual::ready(Units::granted(Rc::downgrade(&self.state), nr));
            }
            if let Some(fault) = pre_armed_fault(&state, &arm) {
                return Eventual::faulted(fault);
            }
        }
        let (promise, completion) = eventual();
        self.enqueue(nr, ResolveAs::Grant(promise), arm);
        completion
    }

    fn enqueue(&self, nr: usize, outcome: ResolveAs<F>, arm: ArmKind<'_>) {
        let node = {
            let mut state = self.state.borrow_mut();
            let node = state.node();
            node.nr.set(nr);
            *node.outcome.borrow_mut() = Some(outcome);
            state.wait_list.push_back(node.clone());
            node
        };
        let sem = Rc::downgrade(&self.state);
        let waiter = Rc::downgrade(&node);
        match arm {
            ArmKind::Never => {}
            ArmKind::Deadline(wheel, deadline) => {
                if deadline != Instant::MAX {
                    let handle = wheel.arm(deadline, move || {
                        cancel_waiter(&sem, &waiter, |state| state.factory.timeout());
                    });
                    *node.guard.borrow_mut() = CancelGuard::Timer(handle);
                }
            }
            ArmKind::Abort(abort) => {
                // abort_requested() was checked just above, with no
                // suspension point in between.
                let subscription = abort
                    .subscribe(move |payload| {
                        cancel_waiter(&sem, &waiter, move |state| {
                            payload
                                .or_else(|| state.fault.clone())
                                .unwrap_or_else(|| state.factory.aborted())
                        });
                    })
                    .unwrap();
                *node.guard.borrow_mut() = CancelGuard::Abort(subscription);
            }
        }
    }
}

impl<F: FaultFactory> Drop for Semaphore<F> {
    fn drop(&mut self) {
        // Fail queued waiters rather than leaving their promises to hang.
        self.broken();
    }
}

/// RAII ownership of semaphore units; the units return on drop. Returning to
/// a broken (or destroyed) semaphore silently discards them.
#[must_use = "units are returned to the semaphore on drop"]
pub struct Units<F: FaultFactory = DefaultFaults> {
    sem: Weak<RefCell<SemState<F>>>,
    held: usize,
}

impl<F: FaultFactory> std::fmt::Debug for Units<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Units").field("held", &self.held).finish()
    }
}

impl<F: FaultFactory> PartialEq for Units<F> {
    fn eq(&self, other: &Self) -> bool {
        self.held == other.held
    }
}

impl<F: FaultFactory> Units<F> {
    fn granted(sem: Weak<RefCell<SemState<F>>>, held: usize) -> Units<F> {
        Units { sem, held }
    }

    pub fn count(&self) -> usize {
        self.held
    }

    pub fn is_engaged(&self) -> bool {
        self.held != 0
    }

    /// Give `nr` of the held units back, signalling the semaphore. Returns
    /// the remaining held count.
    pub fn return_units(&mut self, nr: usize) -> Result<usize, ExcessUnits> {
        if nr > self.held {
            return Err(ExcessUnits {
                requested: nr,
                held: self.held,
            });
        }
        self.held -= nr;
        self.signal_back(nr);
        Ok(self.held)
    }

    pub fn return_all(&mut self) {
        let held = replace(&mut self.held, 0);
        self.signal_back(held);
    }

    /// Disown the held units without signalling; the debt transfers to the
    /// caller. Returns the count that was held.
    pub fn release(&mut self) -> usize {
        replace(&mut self.held, 0)
    }

    /// Carve `nr` units out into a new handle on the same semaphore.
    pub fn split(&mut self, nr: usize) -> Result<Units<F>, ExcessUnits> {
        if nr > self.held {
            return Err(ExcessUnits {
                requested: nr,
                held: self.held,
            });
        }
        self.held -= nr;
        Ok(Units {
            sem: self.sem.clone(),
            held: nr,
        })
    }

    /// The inverse of [`split`](Units::split): take over `other`'s units.
    /// Both handles must belong to the same semaphore.
    pub fn adopt(&mut self, mut other: Units<F>) {
        assert!(
            Weak::ptr_eq(&self.sem, &other.sem),
            "BUG: adopting units of a different semaphore"
        );
        self.held += other.release();
    }

    /// The owning semaphore's stored fault, if it was broken and still
    /// exists.
    pub fn fault(&self) -> Option<Fault> {
        self.sem.upgrade().and_then(|sem| sem.borrow().fault.clone())
    }

    fn signal_back(&self, nr: usize) {
        if nr == 0 {
            return;
        }
        if let Some(sem) = self.sem.upgrade() {
            signal_on(&sem, nr);
        }
    }
}

impl<F: FaultFactory> Drop for Units<F> {
    fn drop(&mut self) {
        self.return_all();
    }
}

/// [`Semaphore::acquire`] as a free function.
pub fn acquire<F: FaultFactory>(sem: &Semaphore<F>, nr: usize) -> Eventual<Units<F>> {
    sem.acquire(nr)
}

pub fn acquire_until<F: FaultFactory>(
    sem: &Semaphore<F>,
    nr: usize,
    wheel: &TimerWheel,
    deadline: Instant,
) -> Eventual<Units<F>> {
    sem.acquire_until(nr, wheel, deadline)
}

pub fn acquire_for<F: FaultFactory>(
    sem: &Semaphore<F>,
    nr: usize,
    wheel: &TimerWheel,
    timeout: Duration,
) -> Eventual<Units<F>> {
    sem.acquire_for(nr, wheel, timeout)
}

pub fn acquire_abortable<F: FaultFactory>(
    sem: &Semaphore<F>,
    nr: usize,
    abort: &AbortSource,
) -> Eventual<Units<F>> {
    sem.acquire_abortable(nr, abort)
}

/// `Some` handle iff the units were immediately available (and nobody was
/// queued).
pub fn try_acquire<F: FaultFactory>(sem: &Semaphore<F>, nr: usize) -> Option<Units<F>> {
    sem.try_wait(nr)
        .then(|| Units::granted(Rc::downgrade(&sem.state), nr))
}

/// Consume `nr` units unconditionally and hold them in a handle, so a
/// pre-charged debt is repaid when the handle drops.
pub fn consume_into<F: FaultFactory>(sem: &Semaphore<F>, nr: usize) -> Units<F> {
    sem.consume(nr);
    Units::granted(Rc::downgrade(&sem.state), nr)
}

/// Run `run` while holding `nr` units; the units return on every exit path,
/// including panics unwinding through the closure's future.
pub async fn with_semaphore<F, Run, Fut, R>(
    sem: &Semaphore<F>,
    nr: usize,
    run: Run,
) -> Result<R, Fault>
where
    F: FaultFactory,
    Run: FnOnce() -> Fut,
    Fut: Future<Output = R>,
{
    let held = sem.acquire(nr).await?;
    let value = run().await;
    drop(held);
    Ok(value)
}

/// As [`with_semaphore`], giving up with the policy's timeout fault if the
/// units are not granted within `timeout`.
pub async fn with_semaphore_for<F, Run, Fut, R>(
    sem: &Semaphore<F>,
    nr: usize,
    wheel: &TimerWheel,
    timeout: Duration,
    run: Run,
) -> Result<R, Fault>
where
    F: FaultFactory,
    Run: FnOnce() -> Fut,
    Fut: Future<Output = R>,
{
    let held = sem.acquire_for(nr, wheel, timeout).await?;
    let value = run().await;
    drop(held);
    Ok(value)
}
