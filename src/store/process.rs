//! OS process inspection and signalling
//!
//! Liveness of a recorded PID is the authoritative answer to "is this source
//! still running", so the checks go straight to the kernel.

use std::io;

/// Signals sent to capture processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful stop (SIGINT), lets the capture tool finalize its file
    Interrupt,
    /// Forced stop (SIGKILL)
    Kill,
}

/// Result of probing a process id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    NotFound,
    /// Exists but belongs to someone we may not signal
    NoPermission,
}

/// Seam over process inspection so coordinators can be tested without real processes
pub trait ProcessController: Send + Sync {
    fn check_process(&self, pid: u32) -> io::Result<ProcessStatus>;
    fn send_signal(&self, pid: u32, signal: Signal) -> io::Result<()>;

    /// Whether the process exists and can be signalled
    fn is_alive(&self, pid: u32) -> bool {
        matches!(self.check_process(pid), Ok(ProcessStatus::Running))
    }
}

/// Process controller backed by `kill(2)` / `waitpid(2)`
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixProcessController;

/// PIDs 0 and 1 (and anything that overflows `pid_t`) address process groups
/// or init, never a capture tool.
#[cfg(unix)]
fn to_pid(pid: u32) -> io::Result<libc::pid_t> {
    match libc::pid_t::try_from(pid) {
        Ok(p) if p > 1 => Ok(p),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to address pid {pid}"),
        )),
    }
}

#[cfg(unix)]
impl ProcessController for UnixProcessController {
    fn check_process(&self, pid: u32) -> io::Result<ProcessStatus> {
        let pid = to_pid(pid)?;

        // An exited child of this process stays signalable as a zombie until reaped.
        let mut wait_status: libc::c_int = 0;
        let reaped = unsafe { libc::waitpid(pid, &mut wait_status, libc::WNOHANG) };
        if reaped == pid {
            return Ok(ProcessStatus::NotFound);
        }

        if unsafe { libc::kill(pid, 0) } == 0 {
            return Ok(ProcessStatus::Running);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Ok(ProcessStatus::NotFound),
            Some(libc::EPERM) => Ok(ProcessStatus::NoPermission),
            _ => Err(err),
        }
    }

    fn send_signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        let pid = to_pid(pid)?;
        let signo = match signal {
            Signal::Interrupt => libc::SIGINT,
            Signal::Kill => libc::SIGKILL,
        };

        if unsafe { libc::kill(pid, signo) } == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // Already gone
            Some(libc::ESRCH) => Ok(()),
            _ => Err(err),
        }
    }
}

#[cfg(not(unix))]
impl ProcessController for UnixProcessController {
    fn check_process(&self, _pid: u32) -> io::Result<ProcessStatus> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process control is only implemented for unix",
        ))
    }

    fn send_signal(&self, _pid: u32, _signal: Signal) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process control is only implemented for unix",
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::{Duration, Instant};

    fn wait_until_gone(controller: &UnixProcessController, pid: u32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if !controller.is_alive(pid) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_running_child_is_alive_until_killed() {
        let controller = UnixProcessController;
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();

        assert_eq!(controller.check_process(pid).unwrap(), ProcessStatus::Running);

        controller.send_signal(pid, Signal::Kill).unwrap();
        // The zombie left behind must be reaped and reported as gone
        assert!(wait_until_gone(&controller, pid));
    }

    #[test]
    fn test_interrupt_stops_cooperative_process() {
        let controller = UnixProcessController;
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();

        controller.send_signal(pid, Signal::Interrupt).unwrap();
        assert!(wait_until_gone(&controller, pid));
    }

    #[test]
    fn test_signalling_exited_process_is_ok() {
        let controller = UnixProcessController;
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert!(controller.send_signal(pid, Signal::Interrupt).is_ok());
        assert!(!controller.is_alive(pid));
    }

    #[test]
    fn test_reserved_pids_are_rejected() {
        let controller = UnixProcessController;
        assert!(controller.check_process(0).is_err());
        assert!(controller.send_signal(1, Signal::Kill).is_err());
        assert!(!controller.is_alive(0));
    }
}
