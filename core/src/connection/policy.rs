//! Disconnect-code policy classification and reconnect backoff math.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectPolicy {
    /// code 401 — clear all credentials, go back to pairing.
    PermanentLoggedOut,
    /// code 440 — terminal, no reconnect.
    ReplacedByAnotherClient,
    /// code 515 — reconnect immediately, zero delay.
    RestartRequired,
    /// code 403 — clear credentials, reset to pairing.
    Forbidden,
    /// anything else — exponential backoff with jitter.
    TransientDefault,
}

impl DisconnectPolicy {
    pub fn classify(code: i32) -> Self {
        match code {
            401 => DisconnectPolicy::PermanentLoggedOut,
            440 => DisconnectPolicy::ReplacedByAnotherClient,
            515 => DisconnectPolicy::RestartRequired,
            403 => DisconnectPolicy::Forbidden,
            _ => DisconnectPolicy::TransientDefault,
        }
    }
}

/// `delay(n) = min(base * 2^n, max) * U(0.8, 1.2)`.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64, jitter: f64) -> Duration {
    let exp = base_ms.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX).max(1));
    let exp = exp.min(max_ms);
    let low = 1.0 - jitter;
    let high = 1.0 + jitter;
    let factor = rand::thread_rng().gen_range(low..=high);
    Duration::from_millis(((exp as f64) * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_codes() {
        assert_eq!(DisconnectPolicy::classify(401), DisconnectPolicy::PermanentLoggedOut);
        assert_eq!(DisconnectPolicy::classify(440), DisconnectPolicy::ReplacedByAnotherClient);
        assert_eq!(DisconnectPolicy::classify(515), DisconnectPolicy::RestartRequired);
        assert_eq!(DisconnectPolicy::classify(403), DisconnectPolicy::Forbidden);
        assert_eq!(DisconnectPolicy::classify(999), DisconnectPolicy::TransientDefault);
    }

    #[test]
    fn backoff_is_bounded_by_jitter_envelope() {
        for attempt in 0..10 {
            let delay = backoff_delay(attempt, 1_000, 60_000, 0.2);
            let base = (1_000u64.saturating_mul(1 << attempt)).min(60_000) as f64;
            assert!(delay.as_millis() as f64 >= base * 0.8 - 1.0);
            assert!(delay.as_millis() as f64 <= base * 1.2 + 1.0);
        }
    }

    #[test]
    fn backoff_saturates_at_max() {
        let delay = backoff_delay(20, 1_000, 60_000, 0.0);
        assert_eq!(delay, Duration::from_millis(60_000));
    }
}
