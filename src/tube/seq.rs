//! Sequence-number unwrapping
//!
//! Frame and ack numbers travel as `u32` but are tracked as `u64` so that the
//! reorder heap and the sender's buffer never see a rollover.

const EPOCH: u64 = 1 << 32;

/// Map a 32-bit wire value to the 64-bit number nearest to `counter`.
///
/// The two candidates are the value placed in the counter's 2^32 epoch and the
/// same value one epoch away (below when the counter sits in the lower half of
/// its epoch, above otherwise). Ties go to the lower candidate.
pub fn unwrap(counter: u64, value: u32) -> u64 {
    let epoch = counter / EPOCH;
    let (lower, upper) = if counter % EPOCH < EPOCH / 2 {
        match epoch.checked_sub(1) {
            Some(prev) => (prev * EPOCH + value as u64, epoch * EPOCH + value as u64),
            None => (value as u64, EPOCH + value as u64),
        }
    } else {
        (epoch * EPOCH + value as u64, (epoch + 1) * EPOCH + value as u64)
    };

    if upper.abs_diff(counter) < lower.abs_diff(counter) {
        upper
    } else {
        lower
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_identity_near_zero() {
        assert_eq!(unwrap(0, 0), 0);
        assert_eq!(unwrap(1, 1), 1);
        assert_eq!(unwrap(1, 130), 130);
    }

    #[test]
    fn test_unwrap_across_rollover() {
        let max = u32::MAX as u64;
        for counter in [max, max + 1, max + 2] {
            // Values just past the rollover belong to the next epoch
            assert_eq!(unwrap(counter, 0), EPOCH);
            assert_eq!(unwrap(counter, 5), EPOCH + 5);
            // Values just before it belong to the current one
            assert_eq!(unwrap(counter, u32::MAX), max);
            assert_eq!(unwrap(counter, u32::MAX - 10), max - 10);
        }
    }

    #[test]
    fn test_unwrap_picks_closest_candidate() {
        let counter = 3 * EPOCH + 100;
        assert_eq!(unwrap(counter, 90), 3 * EPOCH + 90);
        assert_eq!(unwrap(counter, u32::MAX), 3 * EPOCH - 1);

        let counter = 3 * EPOCH + (EPOCH - 100);
        assert_eq!(unwrap(counter, 10), 4 * EPOCH + 10);
    }

    #[test]
    fn test_unwrap_tie_goes_low() {
        let counter = EPOCH + EPOCH / 2;
        assert_eq!(unwrap(counter, 0), EPOCH);
    }
}
