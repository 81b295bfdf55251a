//! Process launch seam
//!
//! [`ManagedProcess`](super::ManagedProcess) never touches
//! `tokio::process` directly. It goes through [`ProcessLauncher`] and
//! [`ChildProcess`] so supervision logic can be driven by a fake in tests.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use super::ProcessError;

/// A child's standard output or standard error
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// What to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable name or path
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// OS (uid, gid) to run as
    pub credentials: Option<(u32, u32)>,
}

impl LaunchSpec {
    /// Parse a whitespace-separated command line
    pub fn parse(command_line: &str) -> Result<Self, ProcessError> {
        let mut fields = command_line.split_whitespace().map(str::to_string);
        let program = fields
            .next()
            .ok_or_else(|| ProcessError::InvalidCommand(command_line.to_string()))?;

        Ok(Self {
            program,
            args: fields.collect(),
            credentials: None,
        })
    }
}

/// Signals used to stop a child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Ask the process to shut down (SIGTERM)
    Terminate,
    /// Kill it outright (SIGKILL)
    Kill,
}

/// How a child exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    /// Exit code, if it exited normally
    pub code: Option<i32>,
    /// Terminating signal, if it was killed by one
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// A launched OS process
#[async_trait]
pub trait ChildProcess: Send {
    /// OS process id, `None` once reaped
    fn id(&self) -> Option<u32>;

    /// Take the standard output pipe
    fn take_stdout(&mut self) -> Option<OutputStream>;

    /// Take the standard error pipe
    fn take_stderr(&mut self) -> Option<OutputStream>;

    /// Deliver a stop signal; a no-op once the child has been reaped
    fn signal(&mut self, signal: StopSignal) -> io::Result<()>;

    /// Wait for the child to exit
    async fn wait(&mut self) -> io::Result<ExitInfo>;

    /// Exit information if the child has already exited
    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>>;
}

/// Creates OS processes
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ChildProcess>, ProcessError>;
}

/// Find an executable on `PATH`, or check a path containing a separator
pub fn locate_executable(program: &str) -> Option<PathBuf> {
    if program.contains(std::path::MAIN_SEPARATOR) {
        let path = Path::new(program);
        return is_executable(path).then(|| path.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Launcher backed by `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ChildProcess>, ProcessError> {
        let path = locate_executable(&spec.program)
            .ok_or_else(|| ProcessError::NotFound(spec.program.clone()))?;

        let mut cmd = tokio::process::Command::new(&path);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            if let Some((uid, gid)) = spec.credentials {
                cmd.uid(uid).gid(gid);
            }
        }

        let child = cmd.spawn().map_err(|source| ProcessError::Launch {
            program: path.display().to_string(),
            source,
        })?;

        Ok(Box::new(TokioChild { child }))
    }
}

struct TokioChild {
    child: tokio::process::Child,
}

#[async_trait]
impl ChildProcess for TokioChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as OutputStream)
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as OutputStream)
    }

    fn signal(&mut self, signal: StopSignal) -> io::Result<()> {
        match signal {
            #[cfg(unix)]
            StopSignal::Terminate => {
                let Some(pid) = self.child.id() else {
                    return Ok(());
                };
                // SAFETY: kill(2) with a pid we own and have not reaped yet
                if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            }
            #[cfg(not(unix))]
            StopSignal::Terminate => self.child.start_kill().or_else(ignore_reaped),
            StopSignal::Kill => self.child.start_kill().or_else(ignore_reaped),
        }
    }

    async fn wait(&mut self) -> io::Result<ExitInfo> {
        self.child.wait().await.map(ExitInfo::from)
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>> {
        Ok(self.child.try_wait()?.map(ExitInfo::from))
    }
}

/// `start_kill` on an already-reaped child reports `InvalidInput`
fn ignore_reaped(e: io::Error) -> io::Result<()> {
    if e.kind() == io::ErrorKind::InvalidInput {
        Ok(())
    } else {
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_line() {
        let spec = LaunchSpec::parse("  openvpn --config /etc/openvpn/pia.conf ").unwrap();
        assert_eq!(spec.program, "openvpn");
        assert_eq!(spec.args, vec!["--config", "/etc/openvpn/pia.conf"]);
        assert_eq!(spec.credentials, None);
    }

    #[test]
    fn test_parse_empty_command() {
        assert!(matches!(
            LaunchSpec::parse("   "),
            Err(ProcessError::InvalidCommand(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_executable() {
        assert!(locate_executable("sh").is_some());
        assert_eq!(locate_executable("/bin/sh"), Some(PathBuf::from("/bin/sh")));
        assert!(locate_executable("pw-no-such-binary-anywhere").is_none());
        assert!(locate_executable("/etc/passwd").is_none());
    }

    #[test]
    fn test_exit_info_display() {
        let code = ExitInfo {
            code: Some(3),
            signal: None,
        };
        let killed = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert_eq!(code.to_string(), "exit code 3");
        assert_eq!(killed.to_string(), "signal 9");
        assert!(!code.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_launcher_not_found() {
        let spec = LaunchSpec::parse("pw-no-such-binary-anywhere --flag").unwrap();
        assert!(matches!(
            TokioLauncher.launch(&spec),
            Err(ProcessError::NotFound(p)) if p == "pw-no-such-binary-anywhere"
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_launcher_terminate() {
        let spec = LaunchSpec::parse("sleep 30").unwrap();
        let mut child = TokioLauncher.launch(&spec).unwrap();
        assert!(child.id().is_some());

        child.signal(StopSignal::Terminate).unwrap();
        let exit = child.wait().await.unwrap();
        assert_eq!(exit.signal, Some(libc::SIGTERM));

        // Reaped: further signals are no-ops
        child.signal(StopSignal::Terminate).unwrap();
        child.signal(StopSignal::Kill).unwrap();
    }
}
