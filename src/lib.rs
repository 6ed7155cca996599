//! bepstream: Build Event Protocol upload lifecycle
//!
//! Streams the structured event log of a build invocation to local files and a
//! remote ingestion backend, and manages the close/acknowledgment handshake with
//! each destination across consecutive invocations of a long-lived server.

pub mod cli;
pub mod config;
pub mod encoding;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod logging;
pub mod module;
pub mod outerr;
pub mod reporter;
pub mod sinks;
pub mod streamer;
pub mod transport;
pub mod types;

pub use error::{AbruptExit, ConfigurationError, ExitCode, SinkError, UploadError};
pub use event::{AbortReason, BuildEvent};
pub use lifecycle::{LifecycleConfig, LifecycleState, UploadLifecycleManager, UploadMode};
pub use module::{CommandEnvironment, UploadModule};
pub use outerr::OutErr;
pub use reporter::{Message, MessageKind, Notification, Reporter};
pub use streamer::{EventBus, Streamer};
pub use transport::{CloseFuture, FutureMap, Transport};
