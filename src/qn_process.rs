//! Cooperative processes
//!
//! A process is a state machine the scheduler resumes. Each call to
//! [`Process::resume`] runs the body up to its next suspension point and
//! returns a [`Suspend`] naming what it waits on: a delay, a resource grant,
//! another process finishing, or the first of several of those. The scheduler
//! resumes the process exactly once per satisfied suspension; when the process
//! waited on several events, the ones that did not fire are simply dropped.
//!
//! An interrupt is delivered at the current suspension point on the next
//! scheduler step as [`Wake::Interrupted`], which also discards every pending
//! wait of that suspension.

use std::fmt;

use crate::qn_interface::{GrantId, ProcessId, ServerId};
use crate::qn_scheduler::Context;

/// Cause carried by an interrupt
#[derive(Clone, Debug, PartialEq)]
pub enum Interrupt {
    /// The grant was evicted by a more urgent request
    Preempted { grant: GrantId, server: ServerId },
    Timeout,
    /// Application defined cause
    Error(String),
}

impl Interrupt {
    pub fn is_preemption(&self) -> bool {
        matches!(self, Interrupt::Preempted { .. })
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Preempted { .. } => write!(f, "preempted"),
            Interrupt::Timeout => write!(f, "timeout"),
            Interrupt::Error(cause) => write!(f, "{}", cause),
        }
    }
}

/// Something a process can wait on
#[derive(Clone, Debug, PartialEq)]
pub enum Wait {
    /// Virtual time delay
    Delay(f64),
    /// Grant becoming held
    Grant(GrantId),
    /// Another process finishing
    Process(ProcessId),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Suspend {
    On(Wait),
    /// First of several. An empty set never fires.
    AnyOf(Vec<Wait>),
    Done,
}

impl Suspend {
    pub fn sleep(delay: f64) -> Self {
        Suspend::On(Wait::Delay(delay))
    }

    pub fn grant(grant: GrantId) -> Self {
        Suspend::On(Wait::Grant(grant))
    }

    pub fn join(process: ProcessId) -> Self {
        Suspend::On(Wait::Process(process))
    }
}

/// Why a process was resumed
#[derive(Clone, Debug, PartialEq)]
pub enum Wake {
    Start,
    /// `index` is the position of `wait` in the suspension (0 for `Suspend::On`)
    Fired { index: usize, wait: Wait },
    Interrupted(Interrupt),
}

impl Wake {
    pub fn label(&self) -> &'static str {
        match self {
            Wake::Start => "start",
            Wake::Fired {
                wait: Wait::Delay(_),
                ..
            } => "delay",
            Wake::Fired {
                wait: Wait::Grant(_),
                ..
            } => "grant",
            Wake::Fired {
                wait: Wait::Process(_),
                ..
            } => "process",
            Wake::Interrupted(_) => "interrupt",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Pending,
    Running,
    Suspended,
    Completed,
    /// Finished right after receiving an interrupt
    Interrupted,
}

impl ProcessState {
    pub fn is_finished(&self) -> bool {
        matches!(self, ProcessState::Completed | ProcessState::Interrupted)
    }
}

pub trait Process {
    fn name(&self) -> &str;

    fn resume(&mut self, ctx: &mut Context<'_>, wake: Wake) -> Suspend;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_causes() {
        let preempted = Interrupt::Preempted {
            grant: 1,
            server: ServerId { pool: 0, index: 0 },
        };
        assert!(preempted.is_preemption());
        assert_eq!(preempted.to_string(), "preempted");
        assert_eq!(Interrupt::Timeout.to_string(), "timeout");
        assert_eq!(Interrupt::Error("disk".into()).to_string(), "disk");
    }

    #[test]
    fn test_wake_labels() {
        assert_eq!(Wake::Start.label(), "start");
        assert_eq!(
            Wake::Fired {
                index: 1,
                wait: Wait::Grant(3)
            }
            .label(),
            "grant"
        );
        assert_eq!(Wake::Interrupted(Interrupt::Timeout).label(), "interrupt");
        assert!(ProcessState::Interrupted.is_finished());
        assert!(!ProcessState::Suspended.is_finished());
    }
}
