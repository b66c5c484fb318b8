#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::cast_possible_truncation)]

//! Relais Core - Change-Data-Capture & Webhook Delivery Pipeline
//!
//! This crate implements the event pipeline that turns host-application
//! mutations (create, write, unlink) into durable change events and delivers
//! them to external HTTP subscribers.
//!
//! # Architecture
//!
//! ```text
//! Host mutation (create/write/unlink)
//!     ↓
//! Interception hook (Engine::on_created / on_written / on_deleted)
//!     ├─ Rule registry lookup (O(1) early exit for untracked models)
//!     ├─ Debounce (create/write share a window per record)
//!     ├─ Per-rule filter + tracked-field match
//!     └─ Payload builder (field policy, _metadata, templates)
//!         ↓
//! Event log append (monotonic ids, create/write supersession)   → pull API
//!         ↓
//! Dispatch queue (one record per enabled subscriber)
//!     ├─ Due selection (priority DESC, timestamp ASC)
//!     ├─ HTTP delivery (auth, timeout, TLS policy)
//!     ├─ Exponential backoff retries (base 60s × 2^n)
//!     └─ Dead letter queue after max retries
//! ```
//!
//! # Key Features
//!
//! - **Rule-driven interception**: track any model from configuration, no
//!   per-model code
//! - **Ordered pull log**: strictly monotone event ids, cursor-based pulls,
//!   idempotent acknowledgement
//! - **Supersession**: a `create` absorbs later `write`s and purges earlier
//!   ones for the same record
//! - **Reliable push**: per-subscriber retry with exponential backoff, rate
//!   limiting, and dead-lettering
//! - **Fail-safe**: nothing in the hook path ever propagates into the host's
//!   commit; failures land in an error sink
//! - **Testable**: storage, delivery, and entity access are traits with
//!   in-memory and mock implementations

pub mod audit;
pub mod config;
pub mod debounce;
pub mod delivery;
pub mod dispatch;
pub mod engine;
pub mod entity;
pub mod error;
pub mod event;
pub mod filter;
mod hook;
pub mod maintenance;
pub mod payload;
pub mod rules;
pub mod store;
pub mod subscriber;
pub mod sync;
pub mod template;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export common types at crate level
pub use audit::{AuditAction, AuditRecord};
pub use config::EngineConfig;
pub use debounce::{DebounceStats, Debouncer};
pub use delivery::{DeliveryOutcome, DeliveryTransport, HttpDeliveryClient};
pub use dispatch::{DispatchFailure, DispatchRecord, DispatchStatus, Dispatcher, NewDispatch};
pub use engine::Engine;
pub use entity::{
    EntityCatalog, EntityRecord, FieldDescriptor, FieldKind, HookContext, RefValue, TypedValue,
};
pub use error::{DeliveryErrorKind, PipelineError, PipelineErrorCode, Result};
pub use event::{
    AppendOutcome, Category, EventLogEntry, EventOp, LogStats, NewEvent, Priority, PullBatch,
    PullQuery,
};
pub use filter::{FilterAst, FilterParser};
pub use payload::PayloadBuilder;
pub use rules::{RuleRegistry, TrackingRule};
pub use store::{memory::MemoryStorage, Storage};
pub use subscriber::{AuthKind, Subscriber};
pub use sync::SyncState;
pub use template::{PlaceholderRenderer, TemplateRenderer};

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn test_event_op_round_trip() {
        assert_eq!(EventOp::Create.as_str(), "create");
        assert_eq!(EventOp::Write.as_str(), "write");
        assert_eq!(EventOp::Unlink.as_str(), "unlink");
    }

    #[test]
    fn test_error_classification() {
        let err = PipelineError::DeliveryFailed {
            kind:    DeliveryErrorKind::Timeout,
            code:    None,
            message: "request timed out".to_string(),
        };
        assert!(err.is_transient());
        assert_eq!(err.code(), PipelineErrorCode::DeliveryFailed);
    }

    #[test]
    fn test_priority_ordering_for_dispatch() {
        assert!(Priority::High.rank() > Priority::Medium.rank());
        assert!(Priority::Medium.rank() > Priority::Low.rank());
    }
}
