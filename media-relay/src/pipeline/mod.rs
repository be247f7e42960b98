//! Retrieval and transcode pipeline.
//!
//! A session spawns the retriever (and, for audio, the transcoder), relays the
//! terminal output to the client and guarantees that every child is gone and
//! the workspace removed once the session closes.

pub mod diagnostics;
pub mod lifecycle;
pub mod orchestrator;
pub mod process;
pub mod relay;
pub mod workspace;

pub use lifecycle::{
    SessionEvent, SessionMonitor, SessionState, SessionStateMachine, SessionStatus,
    TerminalOutcome,
};
pub use orchestrator::{Orchestrator, PipelineSession};
pub use process::{ChildProcessHandle, ExitOutcome};
pub use relay::{DeliveryMetadata, Relay};
pub use workspace::Workspace;
