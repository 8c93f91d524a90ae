//! Epoch-second clock helpers.
//!
//! Every periodic job (repair, proofs, economics) schedules against Unix
//! epoch seconds. The economics day is the epoch-day number, so day
//! boundaries fall on 00:00 UTC.

/// Seconds in one day.
pub const SECS_PER_DAY: u64 = 86_400;

/// Current Unix time in seconds.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The epoch-day number a timestamp falls in.
pub fn day_of(secs: u64) -> u64 {
    secs / SECS_PER_DAY
}

/// First second of the given epoch-day.
pub fn day_start(day: u64) -> u64 {
    day * SECS_PER_DAY
}

/// Seconds until the next UTC day boundary.
pub fn seconds_until_next_day(now: u64) -> u64 {
    SECS_PER_DAY - (now % SECS_PER_DAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_of() {
        assert_eq!(day_of(0), 0);
        assert_eq!(day_of(SECS_PER_DAY - 1), 0);
        assert_eq!(day_of(SECS_PER_DAY), 1);
        assert_eq!(day_of(SECS_PER_DAY * 10 + 5), 10);
    }

    #[test]
    fn test_day_start_round_trip() {
        let day = day_of(1_700_000_000);
        assert!(day_start(day) <= 1_700_000_000);
        assert!(day_start(day + 1) > 1_700_000_000);
    }

    #[test]
    fn test_seconds_until_next_day() {
        assert_eq!(seconds_until_next_day(0), SECS_PER_DAY);
        assert_eq!(seconds_until_next_day(SECS_PER_DAY - 1), 1);
        assert_eq!(seconds_until_next_day(SECS_PER_DAY + 10), SECS_PER_DAY - 10);
    }

    #[test]
    fn test_now_is_reasonable() {
        // Any date after 2023.
        assert!(now_secs() > 1_672_531_200);
        assert!(now_millis() / 1000 >= now_secs() - 1);
    }
}
