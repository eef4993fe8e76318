/// Delay before retrying a failed persistence write.
///
/// Attempt 1: immediate (0ms)
/// Attempt 2: 250ms
/// Attempt 3: 1s
/// Attempt 4+: 5s (caller gives up after its own max attempts)
pub fn retry_backoff_ms(attempt_number: u32) -> u64 {
    match attempt_number {
        0 | 1 => 0,
        2 => 250,
        3 => 1_000,
        _ => 5_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_grows_then_caps() {
        assert_eq!(retry_backoff_ms(1), 0);
        assert_eq!(retry_backoff_ms(2), 250);
        assert_eq!(retry_backoff_ms(3), 1_000);
        assert_eq!(retry_backoff_ms(4), 5_000);
        assert_eq!(retry_backoff_ms(10), 5_000);
    }
}
