use std::{path::Path, time::Duration};

use tokio::process::{Child, Command};
use tracing::debug;

/// `program args... <descriptor>`: the child receives the task descriptor path as last argument.
pub fn cmd_program(program: &str, args: &[String], descriptor: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args.iter().map(|s| s.as_str()));
    cmd.arg(descriptor);
    cmd
}

/// Ask the child to terminate, then kill it if it is still alive after `grace`.
#[cfg(unix)]
pub async fn kill_graceful(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    if let Some(id) = child.id() {
        // SAFETY: plain syscall on the pid of a child we have not reaped yet.
        let _ = unsafe { libc::kill(id as libc::pid_t, libc::SIGTERM) };
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            debug!(pid = id, "child exited after SIGTERM");
            return Ok(());
        }
        debug!(pid = id, "child ignored SIGTERM; killing");
        return child.kill().await;
    }
    // Already reaped.
    Ok(())
}

#[cfg(not(unix))]
pub async fn kill_graceful(child: &mut Child, _grace: Duration) -> std::io::Result<()> {
    if child.id().is_none() {
        return Ok(());
    }
    child.kill().await
}
