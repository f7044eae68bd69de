//! Shutdown signals
//!
//! SIGINT and SIGTERM set a process-wide flag that the event loop checks
//! once per iteration. The handlers are installed without `SA_RESTART`,
//! so a blocked `epoll_wait` returns early with EINTR.

use core::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use urdma_core::error::Result;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Install the SIGINT/SIGTERM handlers and ignore SIGPIPE
pub fn install() -> Result<()> {
    let shutdown = SigAction::new(
        SigHandler::Handler(on_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());

    // Safety: the handler only stores to an atomic
    unsafe {
        sigaction(Signal::SIGINT, &shutdown)?;
        sigaction(Signal::SIGTERM, &shutdown)?;
        sigaction(Signal::SIGPIPE, &ignore)?;
    }
    Ok(())
}

#[inline]
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

/// Ask the event loop to stop, as a signal would
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigterm_sets_flag() {
        install().unwrap();
        assert!(!shutdown_requested());
        nix::sys::signal::raise(Signal::SIGTERM).unwrap();
        assert!(shutdown_requested());
        SHUTDOWN.store(false, Ordering::Relaxed);
    }
}
