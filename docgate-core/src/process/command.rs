use std::{
    io,
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use super::Exit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Exited(Exit),
    TimedOut,
}

/// Runs `argv` to completion, killing it once `deadline` has elapsed. The
/// child is polled every `poll` without blocking the runtime thread.
pub async fn run(argv: &[String], deadline: Duration, poll: Duration) -> io::Result<CommandOutcome> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(CommandOutcome::Exited(status.into()));
        }
        let elapsed = started.elapsed();
        if elapsed >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(CommandOutcome::TimedOut);
        }
        monoio::time::sleep(poll.min(deadline - elapsed)).await;
    }
}
