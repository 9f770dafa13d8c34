//! Request dispatch: the requester's correlation tracking and the worker's
//! reply protocol.

pub mod requester;
pub mod tracker;
pub mod worker;

pub use requester::{Dispatcher, ReplyListener, ResultContent, SourceContent, Submission, SyncOutcome};
pub use tracker::{CorrelationTracker, PendingOperation, ProgressSnapshot, ReplyOutcome};
pub use worker::{Handoff, ProcessingContext, ReplyEmitter, RequestProcessor, RequestWorker};
