//! Admission control subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request
//!     → middleware.rs (classify path: exempt requests pass straight through)
//!     → context.rs (RequestContext: id, arrival time, continuation, channel)
//!     → controller.rs
//!         ├─ slot free: insert into active set, resume continuation
//!         │      wrapped in hook.rs (CompletionHook)
//!         └─ full: append to FIFO queue, write 202 acknowledgment
//!
//! CompletionHook fires (first of send/json/end/finish/drop)
//!     → controller.on_completion: release slot, drain ≤1 queued entry
//!     → drained entry resumes with its own CompletionHook
//!     → its response lands in results.rs (the caller's channel is spent)
//! ```
//!
//! # Design Decisions
//! - One mutex for the active set and the queue; no lock held across await
//! - Unbounded queue, no expiry, no cancellation of queued entries
//! - Completion is idempotent per request id

pub mod context;
pub mod controller;
pub mod hook;
pub mod id;
pub mod middleware;
pub mod results;

pub use context::{continuation_from_next, Classification, Continuation, ExemptPaths, RequestContext};
pub use controller::{Admission, AdmissionController, Decision, GateError, GateStatus, QueueTicket};
pub use hook::{CompletionHook, CompletionSignal, Delivery, ResponseChannel, ResponseReceiver};
pub use id::RequestId;
pub use middleware::admission_middleware;
pub use results::{DeferredResults, DeferredSlot, Lookup};
