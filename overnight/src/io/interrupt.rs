//! SIGINT handling.
//!
//! Ctrl-C sets a single process-wide flag. The executor wait loop and the
//! session poll it; nothing else happens in signal context.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Flag observed by the executor wait loop.
pub fn flag() -> &'static AtomicBool {
    &INTERRUPTED
}

pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Install the SIGINT handler. Call once at process start.
#[allow(unsafe_code)]
pub fn install() {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
}

extern "C" fn on_sigint(_signal: libc::c_int) {
    // Async-signal-safe: a single atomic store.
    INTERRUPTED.store(true, Ordering::SeqCst);
}

#[cfg(test)]
pub fn reset_for_test() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_sets_flag_once() {
        reset_for_test();
        assert!(!is_interrupted());
        on_sigint(libc::SIGINT);
        assert!(is_interrupted());
        assert!(flag().load(Ordering::SeqCst));
        reset_for_test();
        assert!(!is_interrupted());
    }
}
