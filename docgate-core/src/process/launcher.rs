use std::{
    fmt, io,
    process::{Child, Command, ExitStatus, Stdio},
};

use super::{EngineConfig, PORT_PLACEHOLDER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Code(i32),
    Signal,
}

impl From<ExitStatus> for Exit {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Exit::Code(code),
            None => Exit::Signal,
        }
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exit::Code(code) => write!(f, "exit code {code}"),
            Exit::Signal => f.write_str("terminated by signal"),
        }
    }
}

/// A running worker process, as seen by the supervisor.
pub trait ChildProcess: Send {
    fn id(&self) -> Option<u32>;
    /// Non blocking exit check.
    fn try_wait(&mut self) -> io::Result<Option<Exit>>;
    fn kill(&mut self) -> io::Result<()>;
}

pub trait Launcher: Send + Sync {
    fn launch(&self, engine: &EngineConfig, port: u16) -> io::Result<Box<dyn ChildProcess>>;
}

/// Spawns engine commands as OS processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLauncher;

impl Launcher for CommandLauncher {
    fn launch(&self, engine: &EngineConfig, port: u16) -> io::Result<Box<dyn ChildProcess>> {
        let port = port.to_string();
        let mut argv = engine
            .command
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port));
        let program = argv.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("engine '{}' has an empty command", engine.name),
            )
        })?;
        let child = Command::new(program)
            .args(argv)
            .stdin(Stdio::null())
            .spawn()?;
        Ok(Box::new(OsChild(child)))
    }
}

struct OsChild(Child);

impl ChildProcess for OsChild {
    fn id(&self) -> Option<u32> {
        Some(self.0.id())
    }

    fn try_wait(&mut self) -> io::Result<Option<Exit>> {
        Ok(self.0.try_wait()?.map(Exit::from))
    }

    fn kill(&mut self) -> io::Result<()> {
        self.0.kill()?;
        // reap it
        self.0.wait().map(|_| ())
    }
}
