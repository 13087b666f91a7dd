//! External capture viewer processes.

use crate::channel::CaptureKind;
use std::io::{self, Write};
use std::process::{Child, Command, Stdio};
use tracing::debug;

/// A running viewer reading a capture stream on its input.
pub trait ViewerProcess: Send {
    /// Hand over the viewer's input stream. Yields it once.
    fn take_input(&mut self) -> Option<Box<dyn Write + Send>>;

    /// Non-blocking check whether the process has exited.
    fn has_exited(&mut self) -> io::Result<bool>;

    fn terminate(&mut self) -> io::Result<()>;

    fn wait(&mut self) -> io::Result<()>;
}

pub trait ViewerLauncher: Send + Sync {
    fn launch(&self, kind: CaptureKind) -> io::Result<Box<dyn ViewerProcess>>;
}

/// Spawns a command line with a piped stdin, `wireshark -k -i -` by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        CommandLauncher {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line. `None` if it is empty.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

impl Default for CommandLauncher {
    fn default() -> Self {
        CommandLauncher::new("wireshark", vec!["-k".into(), "-i".into(), "-".into()])
    }
}

impl ViewerLauncher for CommandLauncher {
    fn launch(&self, kind: CaptureKind) -> io::Result<Box<dyn ViewerProcess>> {
        debug!("Spawning {} viewer: {} {:?}", kind, self.program, self.args);
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .spawn()?;
        Ok(Box::new(ChildViewer(child)))
    }
}

struct ChildViewer(Child);

impl ViewerProcess for ChildViewer {
    fn take_input(&mut self) -> Option<Box<dyn Write + Send>> {
        self.0
            .stdin
            .take()
            .map(|stdin| Box::new(stdin) as Box<dyn Write + Send>)
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.0.try_wait()?.is_some())
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.0.kill()
    }

    fn wait(&mut self) -> io::Result<()> {
        self.0.wait().map(|_| ())
    }
}
