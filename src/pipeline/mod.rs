//! Document lifecycle pipeline.
//!
//! Two stages move a document through storage and anonymization:
//!
//! - [`ingest`]: accepts an upload, stages it, and queues a work item
//! - [`transform`]: consumes work items, invokes the anonymizer, and
//!   emits completion events
//!
//! The stages share only the broker and the object store; neither holds
//! state of its own.

pub mod document;
pub mod ingest;
pub mod transform;

pub use document::{DocumentMessage, DocumentStatus};
pub use ingest::{IngestService, SubmitReceipt};
pub use transform::TransformService;
