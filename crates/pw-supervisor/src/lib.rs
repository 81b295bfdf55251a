//! pw-supervisor: Tunnel and download-client supervisor for portwarden
//!
//! The supervisor keeps a VPN tunnel process and a download-client process
//! running, keeps the client's listening port in sync with the port the VPN
//! provider forwards, and restarts both when that sync fails or on a daily
//! maintenance schedule.

pub mod cleaner;
pub mod orchestrator;
pub mod process;
pub mod retry;
pub mod sync;

pub use cleaner::{CleanerState, TorrentCleaner};
pub use orchestrator::{run, Orchestrator, OrchestratorError, OrchestratorState, StartError};
pub use process::{ManagedProcess, ProcessError};
pub use retry::{BackoffPolicy, RetryExecutor, RetryOutcome};
pub use sync::{PortBinding, PortSyncPipeline, PublishMode, SyncError};
