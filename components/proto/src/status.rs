//! Stable status codes used on the wire and surfaced through completions.
//! Errors are negative errno values; zero is success.

pub const NONE: i32 = 0;
pub const PARAMETERS: i32 = -libc::EINVAL;
pub const TRY_AGAIN: i32 = -libc::EAGAIN;
pub const FAULT: i32 = -libc::EFAULT;
pub const NO_ENTRY: i32 = -libc::ENOENT;
pub const READ_ONLY: i32 = -libc::EROFS;
pub const SEEK: i32 = -libc::ESPIPE;
pub const IO: i32 = -libc::EIO;
pub const PERMISSION: i32 = -libc::EPERM;

/// Reported by a transport when its own connection-retry budget is exhausted.
/// Out of the errno range so it can never collide with a server status.
pub const MAX_RETRY_REACHED: i32 = -10_060;

pub fn is_error(status: i32) -> bool {
    status != NONE
}

/// Statuses are negative by convention; a positive value is defensively
/// folded into the negative range.
pub fn normalize(status: i32) -> i32 {
    if status > 0 {
        -status
    } else {
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct() {
        let all = [
            PARAMETERS,
            TRY_AGAIN,
            FAULT,
            NO_ENTRY,
            READ_ONLY,
            SEEK,
            IO,
            PERMISSION,
            MAX_RETRY_REACHED,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(*a < 0);
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(!is_error(NONE));
        assert!(is_error(IO));
        assert_eq!(normalize(5), -5);
        assert_eq!(normalize(-5), -5);
    }
}
