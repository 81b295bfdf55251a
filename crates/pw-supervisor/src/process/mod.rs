//! Supervision of external OS processes
//!
//! - [`launcher`] is the narrow seam over OS process creation: launch,
//!   signal, wait and exit information.
//! - [`sink`] holds the line-oriented output sinks process output is copied to.
//! - [`managed`] contains [`ManagedProcess`], which starts a process, streams
//!   its output, restarts it when it exits on its own and stops it
//!   gracefully.

pub mod launcher;
pub mod managed;
pub mod sink;

#[cfg(test)]
pub(crate) mod fake;

pub use launcher::{
    locate_executable, ChildProcess, ExitInfo, LaunchSpec, OutputStream, ProcessLauncher,
    StopSignal, TokioLauncher,
};
pub use managed::{
    ManagedProcess, ProcessState, ProcessStatus, StopHandle, SupervisionOptions, Termination,
};
pub use sink::{MemorySink, OutputSink, StdoutSink, TracingSink};

use thiserror::Error;

/// Errors starting a process; never retried by the supervisor itself
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The launch command is empty
    #[error("Bad command: {0:?}")]
    InvalidCommand(String),

    /// The executable could not be located
    #[error("Executable not found: {0}")]
    NotFound(String),

    /// The OS refused to start the process
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The instance was already started or stopped
    #[error("Process {0} cannot be started again")]
    AlreadyStarted(String),
}
