//! Rate limiter behavior at the burst boundary.

use agentgate::config::RateConfig;
use agentgate::ratelimit::{Admission, RateLimiter};

#[test]
fn test_burst_plus_one_admits_exactly_burst() {
    let burst = 5_u32;
    let limiter = RateLimiter::new(RateConfig {
        rps: 0.001, // effectively no refill during the test
        burst,
    });

    let mut allowed = 0_u32;
    let mut denied = 0_u32;
    for _ in 0..burst.saturating_add(1) {
        match limiter.admit("op") {
            Admission::Allowed => allowed = allowed.saturating_add(1),
            Admission::Denied { retry_after } => {
                denied = denied.saturating_add(1);
                assert!(retry_after > 0.0);
            }
        }
    }
    assert_eq!(allowed, burst);
    assert_eq!(denied, 1);
}

#[test]
fn test_other_principals_unaffected_by_exhausted_bucket() {
    let limiter = RateLimiter::new(RateConfig {
        rps: 0.001,
        burst: 1,
    });
    assert!(limiter.admit("op").is_allowed());
    assert!(!limiter.admit("op").is_allowed());
    assert!(limiter.admit("other").is_allowed());
}
