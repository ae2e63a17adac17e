//! Failure values produced by the synchronization primitives.

use core::fmt;
use std::rc::Rc;

/// A failure delivered through an [`Eventual`](crate::eventual::Eventual).
///
/// `Fault` is cheap to clone; a broken semaphore hands a copy of its stored
/// fault to every subsequent waiter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The semaphore was broken and permanently rejects all waiters.
    Broken { name: Option<Rc<str>> },
    /// The wait exceeded its deadline.
    TimedOut { name: Option<Rc<str>> },
    /// The wait was cancelled through an abort source.
    Aborted { name: Option<Rc<str>> },
    /// Embedder-supplied failure, e.g. an abort payload.
    Custom(Rc<str>),
}

impl Fault {
    pub fn custom(msg: impl Into<Rc<str>>) -> Fault {
        Fault::Custom(msg.into())
    }

    pub fn is_broken(&self) -> bool {
        matches!(self, Fault::Broken { .. })
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Fault::TimedOut { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Fault::Aborted { .. })
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Broken { name: Some(name) } => write!(f, "{}: semaphore broken", name),
            Fault::Broken { name: None } => write!(f, "semaphore broken"),
            Fault::TimedOut { name: Some(name) } => write!(f, "{}: semaphore timed out", name),
            Fault::TimedOut { name: None } => write!(f, "semaphore timed out"),
            Fault::Aborted { name: Some(name) } => write!(f, "{}: semaphore aborted", name),
            Fault::Aborted { name: None } => write!(f, "semaphore aborted"),
            Fault::Custom(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for Fault {}

/// Policy producing the faults a semaphore reports on timeout, breakage and
/// abort. `aborted` has a default so minimal policies only define the first
/// two.
pub trait FaultFactory: 'static {
    fn timeout(&self) -> Fault;
    fn broken(&self) -> Fault;
    fn aborted(&self) -> Fault {
        Fault::Aborted { name: None }
    }
}

/// The anonymous fault policy.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultFaults;

impl FaultFactory for DefaultFaults {
    fn timeout(&self) -> Fault {
        Fault::TimedOut { name: None }
    }

    fn broken(&self) -> Fault {
        Fault::Broken { name: None }
    }
}

/// A fault policy that embeds a label into every fault it produces, so
/// failures surfaced far from the semaphore still identify it.
#[derive(Clone, Debug)]
pub struct NamedFaults {
    name: Rc<str>,
}

impl NamedFaults {
    pub fn new(name: impl Into<Rc<str>>) -> NamedFaults {
        NamedFaults { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FaultFactory for NamedFaults {
    fn timeout(&self) -> Fault {
        Fault::TimedOut {
            name: Some(self.name.clone()),
        }
    }

    fn broken(&self) -> Fault {
        Fault::Broken {
            name: Some(self.name.clone()),
        }
    }

    fn aborted(&self) -> Fault {
        Fault::Aborted {
            name: Some(self.name.clone()),
        }
    }
}

/// Synchronous error for unit arithmetic that asks for more units than a
/// handle currently holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExcessUnits {
    pub requested: usize,
    pub held: usize,
}

impl fmt::Display for ExcessUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "asked for {} units but only {} are held",
            self.requested, self.held
        )
    }
}

impl std::error::Error for ExcessUnits {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_the_label() {
        let named = NamedFaults::new("flush_limit");
        assert_eq!(named.timeout().to_string(), "flush_limit: semaphore timed out");
        assert_eq!(named.broken().to_string(), "flush_limit: semaphore broken");
        assert_eq!(named.aborted().to_string(), "flush_limit: semaphore aborted");
        assert_eq!(DefaultFaults.broken().to_string(), "semaphore broken");
        assert_eq!(Fault::custom("disk gone").to_string(), "disk gone");
    }

    #[test]
    fn default_aborted_is_anonymous() {
        struct Minimal;
        impl FaultFactory for Minimal {
            fn timeout(&self) -> Fault {
                Fault::TimedOut { name: None }
            }
            fn broken(&self) -> Fault {
                Fault::Broken { name: None }
            }
        }
        assert_eq!(Minimal.aborted(), Fault::Aborted { name: None });
    }

    #[test]
    fn kind_predicates() {
        assert!(DefaultFaults.broken().is_broken());
        assert!(DefaultFaults.timeout().is_timed_out());
        assert!(DefaultFaults.aborted().is_aborted());
        assert!(!Fault::custom("x").is_aborted());
    }
}
