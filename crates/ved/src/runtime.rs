//! Daemon runtime files: single-instance PID file, socket, port, and log.
//!
//! One daemon per project, identified by `.ve/orchestrator.pid`. A stale PID
//! file (process gone) is deleted and startup continues; a live one aborts
//! with `AlreadyRunning`.

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};
use ve_core::project::{
    orchestrator_pid_path, orchestrator_port_path, orchestrator_sock_path, ve_dir,
};
use ve_core::{Result, VeError};

/// Whether a process with the given pid is alive (`kill -0`).
pub fn process_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Enforce the single-instance rule, clearing a stale PID file if present.
pub fn check_single_instance(project_dir: &Path) -> Result<()> {
    let pid_path = orchestrator_pid_path(project_dir);
    let Ok(content) = std::fs::read_to_string(&pid_path) else {
        return Ok(());
    };
    match content.trim().parse::<u32>() {
        Ok(pid) if process_alive(pid) => Err(VeError::AlreadyRunning { pid }),
        _ => {
            warn!(path = %pid_path.display(), "removing stale pid file");
            std::fs::remove_file(&pid_path)
                .map_err(|e| VeError::io(pid_path.display().to_string(), e))?;
            Ok(())
        }
    }
}

/// Write the PID and port files for a freshly started daemon.
pub fn write_runtime_files(project_dir: &Path, pid: u32, port: u16) -> Result<()> {
    let dir = ve_dir(project_dir);
    std::fs::create_dir_all(&dir).map_err(|e| VeError::io(dir.display().to_string(), e))?;

    let pid_path = orchestrator_pid_path(project_dir);
    std::fs::write(&pid_path, format!("{pid}\n"))
        .map_err(|e| VeError::io(pid_path.display().to_string(), e))?;

    let port_path = orchestrator_port_path(project_dir);
    std::fs::write(&port_path, format!("{port}\n"))
        .map_err(|e| VeError::io(port_path.display().to_string(), e))?;

    info!(pid, port, "runtime files written");
    Ok(())
}

/// Remove PID, socket, and port files on shutdown.
pub fn remove_runtime_files(project_dir: &Path) {
    for path in [
        orchestrator_pid_path(project_dir),
        orchestrator_sock_path(project_dir),
        orchestrator_port_path(project_dir),
    ] {
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove runtime file");
            }
        }
    }
}

/// Read the TCP port of a (presumably) running daemon.
pub fn read_port(project_dir: &Path) -> Option<u16> {
    let content = std::fs::read_to_string(orchestrator_port_path(project_dir)).ok()?;
    content.trim().parse().ok()
}

/// Path of the Unix domain socket the daemon also serves on.
pub fn socket_path(project_dir: &Path) -> PathBuf {
    orchestrator_sock_path(project_dir)
}
