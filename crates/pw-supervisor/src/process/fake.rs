//! Scripted launcher for supervision tests

use std::collections::HashMap;
use std::io::{self, Cursor};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use super::launcher::{ChildProcess, ExitInfo, LaunchSpec, OutputStream, ProcessLauncher, StopSignal};
use super::ProcessError;

/// Launches in-memory children keyed by program name
#[derive(Default)]
pub(crate) struct FakeLauncher {
    programs: Mutex<HashMap<String, Program>>,
}

#[derive(Default)]
struct Program {
    launches: u32,
    failing: bool,
    ignore_terminate: bool,
    output: Vec<u8>,
    specs: Vec<LaunchSpec>,
    children: Vec<Arc<Control>>,
}

struct Control {
    pid: u32,
    exit: watch::Sender<Option<ExitInfo>>,
    signals: Mutex<Vec<StopSignal>>,
}

impl Control {
    fn exit_with(&self, info: ExitInfo) {
        self.exit.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(info);
                true
            } else {
                false
            }
        });
    }
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_program<R>(&self, program: &str, f: impl FnOnce(&mut Program) -> R) -> R {
        let mut programs = self.programs.lock().unwrap();
        f(programs.entry(program.to_string()).or_default())
    }

    pub fn launches(&self, program: &str) -> u32 {
        self.with_program(program, |p| p.launches)
    }

    /// Children that have not exited yet
    pub fn alive(&self, program: &str) -> usize {
        self.with_program(program, |p| {
            p.children
                .iter()
                .filter(|c| c.exit.borrow().is_none())
                .count()
        })
    }

    pub fn set_failing(&self, program: &str, failing: bool) {
        self.with_program(program, |p| p.failing = failing);
    }

    pub fn ignore_terminate(&self, program: &str) {
        self.with_program(program, |p| p.ignore_terminate = true);
    }

    pub fn set_output(&self, program: &str, output: &str) {
        self.with_program(program, |p| p.output = output.as_bytes().to_vec());
    }

    /// Make the newest child exit on its own
    pub fn exit(&self, program: &str, code: i32) {
        self.with_program(program, |p| {
            if let Some(child) = p.children.last() {
                child.exit_with(ExitInfo {
                    code: Some(code),
                    signal: None,
                });
            }
        });
    }

    /// Signals delivered to the newest child
    pub fn signals(&self, program: &str) -> Vec<StopSignal> {
        self.with_program(program, |p| {
            p.children
                .last()
                .map(|c| c.signals.lock().unwrap().clone())
                .unwrap_or_default()
        })
    }

    pub fn last_spec(&self, program: &str) -> Option<LaunchSpec> {
        self.with_program(program, |p| p.specs.last().cloned())
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ChildProcess>, ProcessError> {
        self.with_program(&spec.program, |p| {
            if p.failing {
                return Err(ProcessError::NotFound(spec.program.clone()));
            }

            p.launches += 1;
            p.specs.push(spec.clone());
            let (tx, rx) = watch::channel(None);
            let control = Arc::new(Control {
                pid: 1000 + p.launches,
                exit: tx,
                signals: Mutex::new(Vec::new()),
            });
            p.children.push(control.clone());

            let stdout = (!p.output.is_empty())
                .then(|| Box::new(Cursor::new(p.output.clone())) as OutputStream);

            Ok(Box::new(FakeChild {
                control,
                exit: rx,
                ignore_terminate: p.ignore_terminate,
                stdout,
            }) as Box<dyn ChildProcess>)
        })
    }
}

struct FakeChild {
    control: Arc<Control>,
    exit: watch::Receiver<Option<ExitInfo>>,
    ignore_terminate: bool,
    stdout: Option<OutputStream>,
}

#[async_trait]
impl ChildProcess for FakeChild {
    fn id(&self) -> Option<u32> {
        self.exit
            .borrow()
            .is_none()
            .then_some(self.control.pid)
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        None
    }

    fn signal(&mut self, signal: StopSignal) -> io::Result<()> {
        self.control.signals.lock().unwrap().push(signal);
        match signal {
            StopSignal::Terminate if self.ignore_terminate => {}
            StopSignal::Terminate => self.control.exit_with(ExitInfo {
                code: None,
                signal: Some(15),
            }),
            StopSignal::Kill => self.control.exit_with(ExitInfo {
                code: None,
                signal: Some(9),
            }),
        }
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<ExitInfo> {
        let exit = self
            .exit
            .wait_for(Option::is_some)
            .await
            .map(|exit| *exit)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "launcher dropped"))?;
        Ok(exit.unwrap_or_default())
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>> {
        Ok(*self.exit.borrow())
    }
}
