//! Shutdown signal handling so Ctrl-C ends the engine loop at the next state boundary.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cleared by SIGINT/SIGTERM; the engine and the binary poll it between iterations.
static RUNNING: AtomicBool = AtomicBool::new(true);

pub fn running_flag() -> &'static AtomicBool {
    &RUNNING
}

pub fn request_shutdown() {
    RUNNING.store(false, Ordering::SeqCst);
}

#[cfg(unix)]
extern "C" fn handle_shutdown_signal(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Install handlers for SIGINT and SIGTERM.
#[cfg(unix)]
pub fn install_shutdown_handlers() -> io::Result<()> {
    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
        // `sigemptyset` and `sigaction` receive initialized pointers and their
        // return codes are checked.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_flags = libc::SA_RESTART;
            action.sa_sigaction = handle_shutdown_signal as *const () as usize;
            if libc::sigemptyset(&mut action.sa_mask) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn install_shutdown_handlers() -> io::Result<()> {
    Ok(())
}
