//! Approval gate - human decision routing
//!
//! Entering an approval node suspends the instance: the engine emits
//! `ApprovalRequested`, persists a pending-approval row with its deadline,
//! and stops scheduling work until a decision arrives or the deadline
//! passes. The routing rules live here as pure functions so they are
//! testable without an engine.

use chrono::{DateTime, Duration, Utc};

use sagaflow_journal::{ApprovalDecision, PendingApproval};

use crate::graph::{CompiledNode, NodeId, NodeKind};

/// Where control flows after a decision lands on an approval node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalRouting {
    /// Approved: resume at the approval's continuation
    Resume,
    /// Rejected with a rejection path: run it, then terminate rejected
    RunRejection(NodeId),
    /// Rejected without a rejection path: terminate rejected immediately
    Rejected,
    /// Escalate into the configured path (which may chain approvals)
    RunEscalation(NodeId),
    /// Escalate with no configured path: re-request the same approval
    ReRequest,
}

/// Apply the decision table for an approval node
///
/// Returns `None` when the node is not an approval.
pub fn route_decision(node: &CompiledNode, decision: &ApprovalDecision) -> Option<ApprovalRouting> {
    let NodeKind::Approval {
        escalation,
        rejection,
        ..
    } = &node.kind
    else {
        return None;
    };
    Some(match decision {
        ApprovalDecision::Approve { .. } => ApprovalRouting::Resume,
        ApprovalDecision::Reject { .. } => match rejection {
            Some(entry) => ApprovalRouting::RunRejection(entry.clone()),
            None => ApprovalRouting::Rejected,
        },
        ApprovalDecision::Escalate => match escalation {
            Some(entry) => ApprovalRouting::RunEscalation(entry.clone()),
            None => ApprovalRouting::ReRequest,
        },
    })
}

/// Build the pending-approval row for an approval node entered at `now`
pub fn pending_for(
    workflow_id: &str,
    node: &CompiledNode,
    now: DateTime<Utc>,
) -> Option<PendingApproval> {
    let NodeKind::Approval {
        approver,
        options,
        timeout,
        ..
    } = &node.kind
    else {
        return None;
    };
    Some(PendingApproval {
        workflow_id: workflow_id.to_string(),
        approver: approver.clone(),
        options: options.clone(),
        deadline: timeout.map(|t| now + t),
        requested_at: now,
    })
}

/// Whether a pending approval has passed its deadline
pub fn timed_out(pending: &PendingApproval, now: DateTime<Utc>) -> bool {
    pending.deadline.map_or(false, |deadline| deadline <= now)
}

/// Deadline helper for re-armed approvals (escalate with no path)
pub fn re_armed_deadline(
    original: &PendingApproval,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    original
        .deadline
        .map(|deadline| now + (deadline - original.requested_at).max(Duration::zero()))
}
