//! Reconnection pacing shared by every adapter that talks to the network.

use std::time::{Duration, Instant};

const INITIAL: Duration = Duration::from_secs(2);
const CAP: Duration = Duration::from_secs(120);
const RESET_AFTER: Duration = Duration::from_secs(30 * 60);

/// Exponential-style backoff: the first call returns immediately and arms the
/// delay to 2 s; each following call grows the delay by 15% (capped at two
/// minutes) and sleeps for it. A quiet period longer than 30 minutes resets
/// the cycle.
pub struct Backoff {
    duration: Duration,
    last: Option<Instant>,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            last: None,
        }
    }

    /// Waits for the current backoff delay, then advances it.
    pub async fn next(&mut self) {
        if let Some(delay) = self.advance(Instant::now()) {
            log::info!("backoff delay {:.2}s", delay.as_secs_f64());
            tokio::time::sleep(delay).await;
        }
    }

    // Pure state transition, split out so the growth law is testable
    // without a clock.
    fn advance(&mut self, now: Instant) -> Option<Duration> {
        match self.last {
            Some(last) if now.duration_since(last) <= RESET_AFTER => {}
            _ => {
                self.reset(now);
                return None;
            }
        }

        if self.duration < CAP {
            self.duration += self.duration.mul_f64(0.15);
            self.last = Some(now);
        }

        Some(self.duration)
    }

    fn reset(&mut self, now: Instant) {
        self.duration = INITIAL;
        self.last = Some(now);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_is_free() {
        let mut b = Backoff::new();
        assert_eq!(b.advance(Instant::now()), None);
        assert_eq!(b.duration, INITIAL);
    }

    #[test]
    fn grows_geometrically() {
        let mut b = Backoff::new();
        let now = Instant::now();
        assert_eq!(b.advance(now), None);

        let first = b.advance(now).unwrap();
        assert_eq!(first, INITIAL.mul_f64(1.15));

        let mut prev = first;
        for _ in 0..10 {
            let next = b.advance(now).unwrap();
            assert!(next > prev);
            assert!((next.as_secs_f64() - prev.as_secs_f64() * 1.15).abs() < 0.01);
            prev = next;
        }
    }

    #[test]
    fn caps_at_two_minutes() {
        let mut b = Backoff::new();
        let now = Instant::now();
        b.advance(now);
        let mut last = Duration::ZERO;
        for _ in 0..200 {
            last = b.advance(now).unwrap();
        }
        // one growth step past the cap at most
        assert!(last <= CAP.mul_f64(1.15));
        let after = b.advance(now).unwrap();
        assert_eq!(after, last);
    }

    #[test]
    fn resets_after_quiet_period() {
        let mut b = Backoff::new();
        let start = Instant::now();
        b.advance(start);
        b.advance(start);
        assert!(b.duration > INITIAL);

        let later = start + RESET_AFTER + Duration::from_secs(1);
        assert_eq!(b.advance(later), None);
        assert_eq!(b.duration, INITIAL);
    }
}
