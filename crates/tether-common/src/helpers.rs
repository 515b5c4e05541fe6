//! Common helper functions for Tether.

use std::sync::OnceLock;
use std::time::Instant;

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds on a process-wide monotonic clock.
///
/// All pose, frame and latency timestamps on the host side use this clock so
/// they can be compared without wall-clock jumps.
pub fn monotonic_ns() -> u64 {
    let epoch = CLOCK_EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Stable 64-bit id for a device path such as `/user/hand/left`.
///
/// FNV-1a, so host and headset agree on ids without sharing a table.
pub fn path_id(path: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    path.bytes()
        .fold(OFFSET, |acc, b| (acc ^ b as u64).wrapping_mul(PRIME))
}

pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_id_is_stable() {
        assert_eq!(path_id("/user/head"), path_id("/user/head"));
        assert_ne!(path_id("/user/hand/left"), path_id("/user/hand/right"));
    }

    #[test]
    fn test_path_id_known_value() {
        // FNV-1a of the empty string is the offset basis.
        assert_eq!(path_id(""), 0xcbf2_9ce4_8422_2325);
    }

    #[test]
    fn test_monotonic_ns_never_goes_backwards() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_env_bool_default() {
        assert!(env_bool("TETHER_TEST_UNSET_FLAG_XYZ", true));
        assert!(!env_bool("TETHER_TEST_UNSET_FLAG_XYZ", false));
    }
}
