//! Upload lifecycle: the process-wide state machine that straddles invocations.

pub mod manager;
pub mod policy;
pub mod report;
pub mod timeouts;

pub use manager::{InvocationContext, PendingUploads, UploadLifecycleManager};
pub use policy::{LifecycleConfig, LifecycleState, UploadMode};
pub use report::{SinkOutcome, SinkStatus, UploadReport};
