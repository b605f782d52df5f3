//! Small utilities shared across the crate: timestamps, byte-size formatting,
//! and the integer arithmetic the ext4 writer leans on repeatedly.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Returns the current time as a `(seconds, nanoseconds)` pair since the Unix epoch.
///
/// Used both for inode timestamps (which pack the nanosecond part into the
/// inode's extra-isize area) and for `TimeSyncer`'s host→guest clock pushes.
pub fn now() -> (u64, u32) {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch");
    (d.as_secs(), d.subsec_nanos())
}

/// Returns the current timestamp since the Unix epoch as a [`Duration`].
pub fn get_timestamp() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
}

/// Ceiling integer division.
pub const fn ceil_division(n: u64, d: u64) -> u64 {
    n.div_ceil(d)
}

/// `log2` for integers. Returns `None` for `0`, where the result is undefined.
pub fn log2(n: u64) -> Option<u32> {
    if n == 0 {
        None
    } else {
        Some(63 - n.leading_zeros())
    }
}

/// Returns `2^n`.
pub const fn pow2(n: u32) -> u64 {
    1u64 << n
}

/// Rounds `n` up to the next multiple of `align` (`align` must be a power of two).
pub const fn align_up(n: u64, align: u64) -> u64 {
    (n + align - 1) & !(align - 1)
}

/// Structure representing a number of bytes, for human-readable display in logs.
pub struct ByteSize(pub u64);

impl fmt::Display for ByteSize {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut order = log2(self.0.max(1)).unwrap_or(0) / log2(1024).unwrap();
        let suffix = match order {
            0 => "bytes",
            1 => "KiB",
            2 => "MiB",
            3 => "GiB",
            4 => "TiB",
            _ => {
                order = 0;
                "bytes"
            }
        };
        let unit = 1024u64.pow(order);
        write!(fmt, "{} {}", self.0 / unit, suffix)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bytesize() {
        assert_eq!(format!("{}", ByteSize(0)), "0 bytes");
        assert_eq!(format!("{}", ByteSize(1023)), "1023 bytes");
        assert_eq!(format!("{}", ByteSize(1024)), "1 KiB");
        assert_eq!(format!("{}", ByteSize(1024 * 1024)), "1 MiB");
        assert_eq!(format!("{}", ByteSize(1024 * 1024 * 1024)), "1 GiB");
    }

    #[test]
    fn log2_values() {
        assert_eq!(log2(1), Some(0));
        assert_eq!(log2(1024), Some(10));
        assert_eq!(log2(0), None);
    }

    #[test]
    fn ceil_division_values() {
        assert_eq!(ceil_division(10, 3), 4);
        assert_eq!(ceil_division(9, 3), 3);
        assert_eq!(ceil_division(0, 3), 0);
    }

    #[test]
    fn align_up_values() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }
}
