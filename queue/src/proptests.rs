#[cfg(test)]
mod proptests {
    use crate::retry::{RetryDecision, RetryPolicy};
    use chrono::Utc;
    use config::RetryConfig;
    use proptest::prelude::*;

    proptest! {
        // Delay bounds: [0.9, 1.1] * min(B * 2^n, M) for every attempt.
        #[test]
        fn test_delay_within_jitter_bounds(n in 0u32..16) {
            let policy = RetryPolicy::new(RetryConfig::default());
            let expected = (1000u64.saturating_mul(2u64.saturating_pow(n))).min(60_000) as f64;
            let delay = policy.delay_for_attempt(n).num_milliseconds() as f64;
            prop_assert!(delay >= expected * 0.9 - 1.0);
            prop_assert!(delay <= expected * 1.1 + 1.0);
        }

        // Any code in [400, 500) fails terminally with no deadline.
        #[test]
        fn test_client_errors_terminal(code in 400u16..500, retry_count in 0u32..3) {
            let policy = RetryPolicy::new(RetryConfig::default());
            let decision = policy.decide(retry_count, Some(code), Some(100), Utc::now());
            prop_assert_eq!(decision, RetryDecision::Terminal);
        }

        // Codes outside [400, 500) retry until the budget runs out.
        #[test]
        fn test_server_errors_schedule(code in prop::sample::select(vec![500u16, 502, 503, 504, 599]), retry_count in 0u32..5) {
            let policy = RetryPolicy::new(RetryConfig::default());
            let decision = policy.decide(retry_count, Some(code), Some(100), Utc::now());
            let is_schedule = matches!(decision, RetryDecision::Schedule { .. });
            prop_assert!(is_schedule);
        }

        // The battery gate pauses instead of scheduling, for any
        // retryable error.
        #[test]
        fn test_low_battery_always_pauses(battery in 0u8..15, retry_count in 0u32..5) {
            let policy = RetryPolicy::new(RetryConfig::default());
            let decision = policy.decide(retry_count, Some(500), Some(battery), Utc::now());
            prop_assert_eq!(decision, RetryDecision::PausedLowBattery);
        }
    }
}
