//! Interruption primitives shared by the execution engine and task bodies.
//!
//! Cooperative cancellation (the task's token, checked via
//! `TaskContext::checkpoint`) is the primary mechanism. [`ForceStop`] is the
//! optional last resort the engine tries when a task ignores its token for
//! longer than the grace window.

use std::fmt;

use crate::types::{Error, Result};

/// Panic payload that unwinds a task body as an interruption.
///
/// Bodies that cannot thread a `Result` back to the engine may call
/// [`InterruptSignal::raise`]; the recovery boundary maps it to
/// [`Error::Interrupted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptSignal;

impl InterruptSignal {
    pub fn raise() -> ! {
        std::panic::panic_any(InterruptSignal)
    }
}

/// Snapshot of the task the worker is currently running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningTask {
    pub id: u64,
    pub name: String,
}

/// Forced termination of a task that did not stop cooperatively.
///
/// Implementations are best-effort. Returning an error is expected on
/// runtimes that cannot stop a thread; the engine logs it and moves on.
pub trait ForceStop: Send + Sync {
    fn force_stop(&self, task: &RunningTask) -> Result<()>;
}

impl<F> ForceStop for F
where
    F: Fn(&RunningTask) -> Result<()> + Send + Sync,
{
    fn force_stop(&self, task: &RunningTask) -> Result<()> {
        self(task)
    }
}

/// Default capability: threads cannot be killed, so always report unsupported.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedForceStop;

impl ForceStop for UnsupportedForceStop {
    fn force_stop(&self, task: &RunningTask) -> Result<()> {
        Err(Error::ForceStopUnsupported(format!(
            "cannot terminate task {} ({}) on a native thread",
            task.id, task.name
        )))
    }
}

impl fmt::Display for RunningTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_force_stop_reports_error() {
        let task = RunningTask {
            id: 3,
            name: "cell-3".to_string(),
        };
        let err = UnsupportedForceStop.force_stop(&task).unwrap_err();
        assert_eq!(err.ename(), "ForceStopUnsupported");
        assert!(err.to_string().contains("cell-3"));
    }

    #[test]
    fn test_closure_force_stop() {
        let stop = |task: &RunningTask| {
            if task.id == 1 {
                Ok(())
            } else {
                Err(Error::internal("wrong task"))
            }
        };
        let task = RunningTask {
            id: 1,
            name: "x".to_string(),
        };
        assert!(stop.force_stop(&task).is_ok());
        assert_eq!(task.to_string(), "x#1");
    }
}
