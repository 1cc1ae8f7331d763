//! Process signalling and exit status helpers.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Send `signal` to `pid`.
///
/// # Returns
/// * `Ok(())` - Signal delivered
/// * `Err(Errno::ESRCH)` - Process no longer exists
/// * `Err(_)` - Any other failure (e.g. permission denied)
pub fn send_signal(pid: u32, signal: Signal) -> nix::Result<()> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Check if a process with the given PID exists.
///
/// Sends the null signal, which performs error checking only.
///
/// # Returns
/// * `true` - Process exists
/// * `false` - Process does not exist or permission denied
pub fn is_process_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Exit code of a finished process. A process terminated by signal `s`
/// reports `-s`.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => -sig,
        (None, None) => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_is_process_alive_current() {
        // Current process should always be alive
        let current_pid = std::process::id();
        assert!(is_process_alive(current_pid));
    }

    #[test]
    fn test_is_process_alive_invalid() {
        // Use very high PIDs unlikely to exist
        assert!(!is_process_alive(999999999));
        assert!(!is_process_alive(888888888));
    }

    #[test]
    fn test_send_signal_missing_process() {
        assert_eq!(
            send_signal(999999999, Signal::SIGTERM),
            Err(nix::errno::Errno::ESRCH)
        );
    }

    #[test]
    fn test_exit_code_normal_and_signalled() {
        let status = Command::new("sh").args(["-c", "exit 3"]).status().unwrap();
        assert_eq!(exit_code(status), 3);

        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        send_signal(child.id(), Signal::SIGTERM).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(exit_code(status), -(Signal::SIGTERM as i32));
    }
}
