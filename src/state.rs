//! Lifecycle state machine for BallistaCluster
//!
//! ```text
//!   New ──► Pending ◄──► Running
//!             ▲  │         │
//!             │  ▼         ▼
//!             Unknown ◄────┘
//!
//!   any ──► Terminating (deletion intent, handled by the cleanup path)
//! ```
//!
//! [`decide`] is pure: it never talks to the API server. The dispatcher
//! applies the returned actions and then calls [`Decision::settle`] with
//! whether those actions changed anything.

use crate::crd::ClusterState;
use crate::status::Observation;

/// Child action requested by the state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildAction {
    /// Create the scheduler pod if it is missing
    EnsureScheduler,
    /// Scale executor pods to the desired count
    ScaleExecutors,
}

/// Next state and the actions to take in this run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    /// State to report once the actions succeeded
    pub next: ClusterState,
    /// Actions in execution order
    pub actions: Vec<ChildAction>,
}

impl Decision {
    fn new(next: ClusterState, actions: Vec<ChildAction>) -> Self {
        Self { next, actions }
    }

    /// Decision for a spec that failed validation
    pub fn invalid() -> Self {
        Self::new(ClusterState::Unknown, Vec::new())
    }

    /// Final state once the actions ran
    ///
    /// A run that created or deleted pods has not observed the result yet,
    /// so it cannot claim Running.
    pub fn settle(&self, changed: bool) -> ClusterState {
        match self.next {
            ClusterState::Running if changed => ClusterState::Pending,
            next => next,
        }
    }
}

/// Map the current state and observation to the next state and actions
pub fn decide(current: ClusterState, observation: &Observation) -> Decision {
    use ChildAction::{EnsureScheduler, ScaleExecutors};

    match (current, observation) {
        (ClusterState::Terminating, _) => Decision::new(ClusterState::Terminating, Vec::new()),

        // New only ever moves to Pending; without an answer from the index
        // the scheduler cannot be created safely, so wait.
        (ClusterState::New, Observation::Failed(_)) => Decision::new(ClusterState::New, Vec::new()),
        (ClusterState::New, Observation::Healthy(_)) => {
            Decision::new(ClusterState::Pending, vec![EnsureScheduler])
        }

        (_, Observation::Failed(_)) => Decision::new(ClusterState::Unknown, Vec::new()),

        (_, Observation::Healthy(summary)) => {
            let next = if summary.is_running() {
                ClusterState::Running
            } else {
                ClusterState::Pending
            };
            Decision::new(next, vec![EnsureScheduler, ScaleExecutors])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::HealthSummary;

    fn healthy(scheduler_ready: bool, ready: u32, desired: u32) -> Observation {
        Observation::Healthy(HealthSummary {
            scheduler_present: true,
            scheduler_ready,
            executors_present: ready,
            executors_ready: ready,
            executors_desired: desired,
            excess_executors: 0,
        })
    }

    fn failed() -> Observation {
        Observation::Failed("pod index out of sync".to_string())
    }

    /// Story: A new cluster first gets its scheduler and moves to Pending
    #[test]
    fn story_new_cluster_goes_pending() {
        let decision = decide(ClusterState::New, &healthy(false, 0, 3));
        assert_eq!(decision.next, ClusterState::Pending);
        assert_eq!(decision.actions, vec![ChildAction::EnsureScheduler]);
    }

    /// Story: New never skips Pending, even if pods happen to be ready already
    #[test]
    fn story_new_never_skips_pending() {
        let decision = decide(ClusterState::New, &healthy(true, 3, 3));
        assert_eq!(decision.next, ClusterState::Pending);

        let decision = decide(ClusterState::New, &failed());
        assert_eq!(decision.next, ClusterState::New);
        assert!(decision.actions.is_empty());
    }

    /// Story: Pending becomes Running once the scheduler and all executors are ready
    #[test]
    fn story_pending_to_running() {
        let decision = decide(ClusterState::Pending, &healthy(true, 2, 3));
        assert_eq!(decision.next, ClusterState::Pending);
        assert_eq!(
            decision.actions,
            vec![ChildAction::EnsureScheduler, ChildAction::ScaleExecutors]
        );

        let decision = decide(ClusterState::Pending, &healthy(true, 3, 3));
        assert_eq!(decision.next, ClusterState::Running);
    }

    /// Story: Running falls back to Pending when an executor stops being ready
    #[test]
    fn story_running_to_pending_on_degradation() {
        let decision = decide(ClusterState::Running, &healthy(true, 2, 3));
        assert_eq!(decision.next, ClusterState::Pending);

        let decision = decide(ClusterState::Running, &healthy(false, 3, 3));
        assert_eq!(decision.next, ClusterState::Pending);
    }

    /// Story: A failed observation drives Unknown with no actions
    #[test]
    fn story_observation_failure_goes_unknown() {
        for current in [ClusterState::Pending, ClusterState::Running, ClusterState::Unknown] {
            let decision = decide(current, &failed());
            assert_eq!(decision.next, ClusterState::Unknown);
            assert!(decision.actions.is_empty());
        }
    }

    /// Story: Unknown recovers to whichever state the observation supports
    #[test]
    fn story_unknown_recovers() {
        assert_eq!(
            decide(ClusterState::Unknown, &healthy(true, 3, 3)).next,
            ClusterState::Running
        );
        assert_eq!(
            decide(ClusterState::Unknown, &healthy(true, 1, 3)).next,
            ClusterState::Pending
        );
    }

    #[test]
    fn test_terminating_is_terminal() {
        let decision = decide(ClusterState::Terminating, &healthy(true, 3, 3));
        assert_eq!(decision.next, ClusterState::Terminating);
        assert!(decision.actions.is_empty());
    }

    #[test]
    fn test_changes_prevent_running() {
        let decision = decide(ClusterState::Running, &healthy(true, 3, 3));
        assert_eq!(decision.settle(false), ClusterState::Running);
        assert_eq!(decision.settle(true), ClusterState::Pending);

        let decision = decide(ClusterState::Unknown, &failed());
        assert_eq!(decision.settle(true), ClusterState::Unknown);
    }

    #[test]
    fn test_invalid_spec_decision() {
        let decision = Decision::invalid();
        assert_eq!(decision.next, ClusterState::Unknown);
        assert!(decision.actions.is_empty());
    }
}
