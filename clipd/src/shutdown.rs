// Graceful shutdown: SIGTERM/SIGINT feed the same CancelFlag the daemon
// threads through its dispatcher, watcher and sampler tasks

use clipd_core::CancelFlag;
use std::sync::OnceLock;

/// Flag handed to `install_signal_handlers`; the signal handler can only
/// reach it through process-global state
static SHUTDOWN_FLAG: OnceLock<CancelFlag> = OnceLock::new();

/// Route SIGTERM and SIGINT (Ctrl+C) into the given cancel flag
///
/// Every task polling a clone of the flag winds down on its own, so
/// in-flight jobs get to finish their current step.
pub fn install_signal_handlers(flag: CancelFlag) {
    let _ = SHUTDOWN_FLAG.set(flag);

    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
    }
}

// Only the atomic store inside CancelFlag::cancel happens here; that is
// async-signal-safe
extern "C" fn handle_signal(_signal: i32) {
    if let Some(flag) = SHUTDOWN_FLAG.get() {
        flag.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_cancels_the_installed_flag() {
        let flag = CancelFlag::new();
        install_signal_handlers(flag.clone());
        assert!(!flag.is_cancelled());

        handle_signal(libc::SIGTERM);
        assert!(flag.is_cancelled());
    }
}
