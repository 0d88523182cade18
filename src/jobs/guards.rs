//! Per-job in-flight guards for operator actions.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Operator action a guard protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Start,
    Stop,
    Restart,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        })
    }
}

type Held = Arc<Mutex<HashMap<String, Operation>>>;

/// Operations currently being handled, keyed by job. At most one operator
/// action per job at a time. Owned by one lifecycle manager; never
/// process-global.
#[derive(Debug, Clone, Default)]
pub struct InFlightGuards {
    held: Held,
}

impl InFlightGuards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `job_id` for `op`. On conflict returns the operation already in
    /// flight for the job.
    ///
    /// Synchronous so two racing callers are ordered before either awaits.
    pub fn try_acquire(&self, op: Operation, job_id: &str) -> Result<InFlightGuard, Operation> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(&active) = held.get(job_id) {
            debug!(job_id, op = %op, active = %active, "Operation already in flight");
            return Err(active);
        }
        held.insert(job_id.to_string(), op);
        Ok(InFlightGuard {
            held: Arc::clone(&self.held),
            job_id: job_id.to_string(),
        })
    }

    /// Operation in flight for `job_id`, if any.
    pub fn active(&self, job_id: &str) -> Option<Operation> {
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(job_id)
            .copied()
    }
}

/// Releases its claim when dropped, on every exit path.
#[derive(Debug)]
pub struct InFlightGuard {
    held: Held,
    job_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        held.remove(&self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let guards = InFlightGuards::new();
        let first = guards.try_acquire(Operation::Restart, "j1").unwrap();
        assert_eq!(
            guards.try_acquire(Operation::Restart, "j1").unwrap_err(),
            Operation::Restart
        );
        assert_eq!(guards.active("j1"), Some(Operation::Restart));

        drop(first);
        assert_eq!(guards.active("j1"), None);
        assert!(guards.try_acquire(Operation::Restart, "j1").is_ok());
    }

    #[test]
    fn operations_on_one_job_exclude_each_other() {
        let guards = InFlightGuards::new();
        let _stop = guards.try_acquire(Operation::Stop, "j1").unwrap();
        assert_eq!(
            guards.try_acquire(Operation::Start, "j1").unwrap_err(),
            Operation::Stop
        );
        assert_eq!(
            guards.try_acquire(Operation::Restart, "j1").unwrap_err(),
            Operation::Stop
        );
        assert!(guards.try_acquire(Operation::Stop, "j2").is_ok());
    }

    #[test]
    fn released_when_protected_section_errors() {
        fn protected(guards: &InFlightGuards) -> Result<(), String> {
            let _guard = guards
                .try_acquire(Operation::Start, "j1")
                .map_err(|op| format!("{op} in flight"))?;
            Err("boom".into())
        }
        let guards = InFlightGuards::new();
        assert!(protected(&guards).is_err());
        assert_eq!(guards.active("j1"), None);
    }
}
