//! Run-lifecycle client for the verification coach backend.
//!
//! One `RunSession` owns the lifecycle of a single verification run:
//! it starts the run over HTTP, follows it on a reconnecting live event
//! channel, backstops the channel with status polling, merges both feeds
//! monotonically, and exposes cancellation. Consumers read the latest
//! session snapshot from a watch channel and render it however they like.

pub mod channel;
pub mod diag;
pub mod error;
pub mod merge;
pub mod session;
pub mod transport;
pub mod upload;

pub use channel::{ChannelConfig, ConnectionState, ConnectionStatus, DisconnectReason, EventChannel, ReconnectPolicy};
pub use diag::{DiagnosticEvent, DiagnosticSink, RecordingSink, TracingSink};
pub use error::{ClientError, Result};
pub use merge::{merge, MergeOutcome, UpdateSource};
pub use session::{RunBackend, RunSession, SessionConfig, SessionNotice, SessionPhase, SessionState};
pub use transport::RunApi;
pub use upload::{upload_files, BatchSender, UploadFile, UploadOutcome, UPLOAD_BATCH_SIZE};
