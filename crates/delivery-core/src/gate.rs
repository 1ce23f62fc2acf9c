//! Phase gate: decides whether a goal may run for a commit.
//!
//! Pure functions over a [`Pipeline`] and a [`StatusSnapshot`]. Callers retry
//! the surrounding event, never these checks.

use crate::goals::Pipeline;
use crate::types::{StatusSnapshot, StatusState};

/// Outcome of evaluating the gate for one goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Predecessor satisfied and our status is still pending.
    Run,
    /// Our status already moved past pending; a redelivered event.
    AlreadyHandled,
    /// Predecessor has not succeeded yet.
    Blocked,
    /// The goal is not part of the pipeline.
    Undeclared,
}

impl GateDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::AlreadyHandled => "already_handled",
            Self::Blocked => "blocked",
            Self::Undeclared => "undeclared",
        }
    }
}

/// True when the goal for `our_context` has no predecessor, or its
/// predecessor's latest status is `success`.
///
/// Fails closed: a goal missing from the pipeline never passes, and a
/// predecessor with no reported status counts as not yet satisfied.
pub fn previous_phase_succeeded(
    pipeline: &Pipeline,
    our_context: &str,
    snapshot: &StatusSnapshot,
) -> bool {
    let Some(goal) = pipeline.goal(our_context) else {
        return false;
    };
    let Some(predecessor) = &goal.predecessor else {
        return true;
    };
    snapshot
        .latest(predecessor)
        .is_some_and(|s| s.state == StatusState::Success)
}

/// True when `our_context` has no status yet or its latest status is `pending`.
pub fn current_phase_is_still_pending(our_context: &str, snapshot: &StatusSnapshot) -> bool {
    snapshot
        .latest(our_context)
        .is_none_or(|s| s.state == StatusState::Pending)
}

/// Combine both checks for the context the snapshot is evaluated for.
pub fn evaluate(pipeline: &Pipeline, snapshot: &StatusSnapshot) -> GateDecision {
    let ours = snapshot.context.as_str();
    if pipeline.goal(ours).is_none() {
        return GateDecision::Undeclared;
    }
    if !previous_phase_succeeded(pipeline, ours, snapshot) {
        return GateDecision::Blocked;
    }
    if !current_phase_is_still_pending(ours, snapshot) {
        return GateDecision::AlreadyHandled;
    }
    GateDecision::Run
}
