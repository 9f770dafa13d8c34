//! Requester-side registry of in-flight requests keyed by request ID.
//!
//! Written by the submitting caller and the reply listener, read by pollers.
//! Entries live in a sharded `DashMap`; no caller ever holds a lock across an
//! await point.

use std::time::Duration;

use courier_core::{ContentReference, Reply, ReplyStatus, Request};
use dashmap::DashMap;
use tokio::time::Instant;

/// What the tracker knows about one request.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub request: Request,
    /// Latest accepted reply; a synthetic `Pending` reply until one arrives.
    pub last_reply: Reply,
    pub created_at: Instant,
    pub updated_at: Instant,
    /// Submitted through `submit_async`; removed by the poll that sees it finish.
    pub asynchronous: bool,
}

/// Result of feeding a reply to [`CorrelationTracker::record_reply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// No pending operation has this request ID.
    Orphaned,
    /// The reply would move the status backwards or past a terminal status.
    Ignored { current: ReplyStatus },
    Updated { status: ReplyStatus },
}

/// Point-in-time view of a pending operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub request_id: String,
    pub status: ReplyStatus,
    pub progress: Option<f32>,
    pub detail: Option<String>,
    pub job_id: Option<String>,
    pub target_refs: Vec<ContentReference>,
}

impl ProgressSnapshot {
    fn of(op: &PendingOperation) -> Self {
        let reply = &op.last_reply;
        Self {
            request_id: op.request.id.clone(),
            status: reply.status,
            progress: reply.progress,
            detail: reply.detail.clone(),
            job_id: reply.job_id.clone(),
            target_refs: reply.target_refs.clone(),
        }
    }

    /// Returns `true` once the request completed or failed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Concurrent map of [`PendingOperation`]s.
#[derive(Debug, Default)]
pub struct CorrelationTracker {
    pending: DashMap<String, PendingOperation>,
}

impl CorrelationTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `request`. A second registration of the same ID
    /// replaces the first.
    pub fn register(&self, request: Request, asynchronous: bool) {
        let now = Instant::now();
        let id = request.id.clone();
        let op = PendingOperation {
            last_reply: Reply::pending(id.clone()),
            request,
            created_at: now,
            updated_at: now,
            asynchronous,
        };
        self.pending.insert(id, op);
    }

    /// Applies `reply` if it is a legal status transition.
    pub fn record_reply(&self, reply: Reply) -> ReplyOutcome {
        let Some(mut op) = self.pending.get_mut(&reply.request_id) else {
            return ReplyOutcome::Orphaned;
        };
        let current = op.last_reply.status;
        if !current.can_transition_to(reply.status) {
            return ReplyOutcome::Ignored { current };
        }
        let status = reply.status;
        op.last_reply = reply;
        op.updated_at = Instant::now();
        ReplyOutcome::Updated { status }
    }

    /// Latest state of a request without collecting it.
    #[must_use]
    pub fn snapshot(&self, request_id: &str) -> Option<ProgressSnapshot> {
        self.pending.get(request_id).map(|op| ProgressSnapshot::of(&op))
    }

    /// Snapshot for a poller. An asynchronous operation that has reached a
    /// terminal status is removed by the poll that observes it.
    #[must_use]
    pub fn poll(&self, request_id: &str) -> Option<ProgressSnapshot> {
        let snapshot = self.snapshot(request_id)?;
        if snapshot.is_terminal() {
            self.pending
                .remove_if(request_id, |_, op| op.asynchronous && op.last_reply.status.is_terminal());
        }
        Some(snapshot)
    }

    /// Removes the operation whatever its status and returns it.
    pub fn remove(&self, request_id: &str) -> Option<PendingOperation> {
        self.pending.remove(request_id).map(|(_, op)| op)
    }

    /// Drops unfinished operations older than `pending_ttl` and finished ones
    /// nobody collected within `completed_ttl`. Returns how many were dropped.
    pub fn evict_expired(&self, pending_ttl: Duration, completed_ttl: Duration) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, op| {
            if op.last_reply.status.is_terminal() {
                op.updated_at.elapsed() < completed_ttl
            } else {
                op.created_at.elapsed() < pending_ttl
            }
        });
        before.saturating_sub(self.pending.len())
    }

    /// Returns `true` if the request is tracked.
    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Number of tracked requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
