//! Session state store
//!
//! Durable, process-external session facts. Every command invocation is a
//! fresh process, so anything another invocation needs to know lives here:
//! - one flat file per key under the state directory
//! - process liveness checks for recorded capture PIDs

pub mod process;
pub mod records;

pub use process::{ProcessController, ProcessStatus, Signal, UnixProcessController};
pub use records::{RecordKey, SourceRecord, StateStore, StoreError, StoreResult};
