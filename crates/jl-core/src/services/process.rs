use std::path::Path;
use std::process::Stdio;

use crate::error::{ClusterError, Result};

/// Spawn a long-lived helper process that survives the CLI exiting.
/// Stdout/stderr go nowhere; helpers write their own log files.
pub fn spawn_detached(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    workdir: Option<&Path>,
) -> Result<u32> {
    // std::process rather than tokio: the child must not be tied to the
    // runtime's reaper, it outlives this process.
    let mut cmd = std::process::Command::new(program);
    cmd.args(args)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        // CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP
        cmd.creation_flags(0x08000000 | 0x00000200);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // New process group so a Ctrl-C aimed at the CLI does not reach it.
        cmd.process_group(0);
    }

    let child = cmd
        .spawn()
        .map_err(|e| ClusterError::Tunnel(format!("failed to spawn {program}: {e}")))?;
    Ok(child.id())
}

pub fn is_pid_alive(pid: u32) -> bool {
    #[cfg(windows)]
    {
        use std::os::windows::io::FromRawHandle;
        unsafe {
            let handle = windows_sys::Win32::System::Threading::OpenProcess(0x00100000, 0, pid); // SYNCHRONIZE
            if handle.is_null() {
                false
            } else {
                let _ = std::os::windows::io::OwnedHandle::from_raw_handle(handle as *mut _);
                true
            }
        }
    }
    #[cfg(unix)]
    {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
}

pub fn kill_pid(pid: u32) {
    #[cfg(windows)]
    {
        use std::os::windows::io::FromRawHandle;
        unsafe {
            let handle = windows_sys::Win32::System::Threading::OpenProcess(0x0001, 0, pid); // PROCESS_TERMINATE
            if !handle.is_null() {
                windows_sys::Win32::System::Threading::TerminateProcess(handle, 1);
                let _ = std::os::windows::io::OwnedHandle::from_raw_handle(handle as *mut _);
            }
        }
    }
    #[cfg(unix)]
    {
        if pid == 0 || pid > i32::MAX as u32 {
            return;
        }
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(is_pid_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_is_never_alive() {
        assert!(!is_pid_alive(0));
    }
}
