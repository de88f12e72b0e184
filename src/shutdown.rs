use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::handle::Handle;
use crate::logging;

/// Set once SIGINT or SIGTERM arrived.
pub static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Signal that triggered shutdown: 0 = none, 1 = SIGINT, 2 = SIGTERM
pub static SIGNAL_TYPE: AtomicU8 = AtomicU8::new(0);

pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Records the signal; logging happens off the signal path.
pub fn request_shutdown_with_signal(signal_type: u8) {
    SIGNAL_TYPE.store(signal_type, Ordering::SeqCst);
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Get the signal type that triggered shutdown
///
/// # Returns
/// * `None` if no signal received
/// * `Some(1)` for SIGINT (Ctrl+C)
/// * `Some(2)` for SIGTERM
pub fn get_signal_type() -> Option<u8> {
    match SIGNAL_TYPE.load(Ordering::SeqCst) {
        0 => None,
        signal_type => Some(signal_type),
    }
}

/// Aborts whatever `handle` is running when SIGINT or SIGTERM arrives.
///
/// The abort completes the operation with `OperationAborted`, so the
/// caller waiting on the completion wakes up and can exit.
pub fn abort_on_signal(handle: Handle) -> io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::spawn(move || {
        for sig in signals.forever() {
            let signal_type = if sig == SIGTERM { 2 } else { 1 };
            request_shutdown_with_signal(signal_type);
            let _ = logging::log(&format!("signal {} received, aborting", sig));
            if let Err(e) = handle.abort() {
                let _ = logging::log(&format!("nothing to abort: {}", e));
            }
        }
    });
    Ok(())
}

/// Reset the shutdown flag between test cases
#[cfg(test)]
pub fn reset_shutdown_for_tests() {
    SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
    SIGNAL_TYPE.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_signal_type_recorded() {
        reset_shutdown_for_tests();
        assert!(!is_shutdown_requested());
        assert_eq!(get_signal_type(), None);
        request_shutdown_with_signal(2);
        assert!(is_shutdown_requested());
        assert_eq!(get_signal_type(), Some(2));
        reset_shutdown_for_tests();
    }
}
