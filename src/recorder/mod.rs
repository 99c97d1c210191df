//! Recording session coordination
//!
//! - StartCoordinator launches the enabled sources behind a shared barrier
//! - TeardownCoordinator stops them concurrently with a bounded grace period
//! - SessionController runs the lifecycle on top of the persisted records

pub mod coordinator;
pub mod error;
pub mod start;
pub mod state;
pub mod stop;

pub use coordinator::{
    PauseReport, ProcessingSummary, RecordingEvent, SessionController, StartReport, StopMode,
    StopOptions, StopOutcome, StopReport,
};
pub use error::{RecordingError, RecordingResult, SourceWarning, WarningLevel};
pub use start::{StartCoordinator, StartOutcome, StartRequest};
pub use state::{RecordingState, SessionStatus, SourceStatus, StartOptions};
pub use stop::{TeardownCoordinator, TeardownOutcome};
