//! Process-level knobs: CPU and I/O scheduling priority, signal
//! disposition.

use anyhow::{bail, Context};
use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, Signal};

// From <linux/ioprio.h>; there is no libc wrapper for ioprio_set.
const IOPRIO_WHO_PROCESS: libc::c_int = 1;
const IOPRIO_CLASS_IDLE: libc::c_int = 3;
const IOPRIO_CLASS_SHIFT: libc::c_int = 13;

/// Lowers the CPU niceness by 10 and moves the process into the idle I/O
/// scheduling class, as if started under `nice` and `ionice -c 3`.
pub fn be_nice() -> anyhow::Result<()> {
    // nice() may legitimately return -1, so only the errno tells failure
    // apart from a resulting niceness of -1.
    Errno::clear();
    if unsafe { libc::nice(10) } == -1 && Errno::last() != Errno::UnknownErrno {
        bail!(
            "could not make the process nice in terms of CPU usage: {}",
            Errno::last()
        );
    }
    let prio = IOPRIO_CLASS_IDLE << IOPRIO_CLASS_SHIFT;
    let pid = nix::unistd::getpid().as_raw();
    if unsafe { libc::syscall(libc::SYS_ioprio_set, IOPRIO_WHO_PROCESS, pid, prio) } == -1 {
        bail!(
            "could not make the process nice in terms of I/O priority: {}",
            Errno::last()
        );
    }
    Ok(())
}

/// With SIGPIPE ignored a closed pipe surfaces as EPIPE from write(), which
/// the writer treats as a normal end of stream.
pub fn ignore_sigpipe() -> anyhow::Result<()> {
    unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("could not ignore SIGPIPE")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigpipe_can_be_ignored() {
        ignore_sigpipe().unwrap();
    }
}
