//! Error mapping guide:
//! - Map io::ErrorKind::NotFound to exit code 127; all others to 1.
//! - A held instance lock maps to 111 so callers can tell it from a launch failure.
use std::io;

/// Map an io::Error to a process exit code:
/// - 127 for NotFound (command not found)
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}

/// Map a lock acquisition error to a process exit code:
/// - 111 when another instance already holds the lock (WouldBlock)
/// - 1 for all other errors
pub fn exit_code_for_lock_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::WouldBlock {
        111
    } else {
        1
    }
}
