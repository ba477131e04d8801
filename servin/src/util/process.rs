//! Process liveness and signalling helpers.

/// Check if a process with the given PID exists.
///
/// Uses `kill(pid, 0)` which sends a null signal to check existence.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Send a signal to a process. Returns `false` when the process does not
/// exist or the signal could not be delivered.
pub fn signal_process(pid: u32, signal: i32) -> bool {
    if pid == 0 {
        return false;
    }
    unsafe { libc::kill(pid as i32, signal) == 0 }
}

/// Kill a process with SIGKILL.
///
/// Returns `true` when the process was killed or is already gone.
pub fn kill_process(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, libc::SIGKILL) == 0 || !is_process_alive(pid) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_alive_current() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_invalid() {
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(999_999_999));
    }
}
