use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RatePolicy {
    Unthrottled,
    FixedDelay(Duration),
    TokenBucket { burst: u32, interval: Duration },
}

impl RatePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RatePolicy::Unthrottled => "none",
            RatePolicy::FixedDelay(_) => "fixed",
            RatePolicy::TokenBucket { .. } => "token_bucket",
        }
    }
}

#[derive(Debug)]
pub struct Throttle {
    policy: RatePolicy,
    last: Option<Instant>,
    tokens: f64,
}

impl Throttle {
    pub fn new(policy: RatePolicy) -> Self {
        let tokens = match policy {
            RatePolicy::TokenBucket { burst, .. } => f64::from(burst.max(1)),
            _ => 0.0,
        };
        Self {
            policy,
            last: None,
            tokens,
        }
    }

    pub fn policy(&self) -> RatePolicy {
        self.policy
    }

    /// Delay owed before a submission at `now`, and book that submission.
    pub fn next_delay(&mut self, now: Instant) -> Duration {
        match self.policy {
            RatePolicy::Unthrottled => Duration::ZERO,
            RatePolicy::FixedDelay(gap) => {
                let delay = match self.last {
                    None => Duration::ZERO,
                    Some(last) => (last + gap).saturating_duration_since(now),
                };
                self.last = Some(now + delay);
                delay
            }
            RatePolicy::TokenBucket { burst, interval } => {
                let capacity = f64::from(burst.max(1));
                if let Some(last) = self.last {
                    if !interval.is_zero() {
                        let elapsed = now.saturating_duration_since(last);
                        self.tokens = (self.tokens
                            + elapsed.as_secs_f64() / interval.as_secs_f64())
                        .min(capacity);
                    } else {
                        self.tokens = capacity;
                    }
                }
                if self.tokens >= 1.0 {
                    self.tokens -= 1.0;
                    self.last = Some(now);
                    Duration::ZERO
                } else {
                    let delay = interval.mul_f64(1.0 - self.tokens);
                    self.tokens = 0.0;
                    self.last = Some(now + delay);
                    delay
                }
            }
        }
    }

    pub fn wait(&mut self) {
        let delay = self.next_delay(Instant::now());
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "throttling submission");
            thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_spares_the_first_submission() {
        let mut t = Throttle::new(RatePolicy::FixedDelay(Duration::from_secs(60)));
        let t0 = Instant::now();
        assert_eq!(t.next_delay(t0), Duration::ZERO);
        assert_eq!(t.next_delay(t0), Duration::from_secs(60));
        // the second submission was booked at t0+60s
        assert_eq!(
            t.next_delay(t0 + Duration::from_secs(90)),
            Duration::from_secs(30)
        );
        assert_eq!(t.next_delay(t0 + Duration::from_secs(500)), Duration::ZERO);
    }

    #[test]
    fn token_bucket_allows_burst_then_paces() {
        let mut t = Throttle::new(RatePolicy::TokenBucket {
            burst: 2,
            interval: Duration::from_secs(10),
        });
        let t0 = Instant::now();
        assert_eq!(t.next_delay(t0), Duration::ZERO);
        assert_eq!(t.next_delay(t0), Duration::ZERO);
        assert_eq!(t.next_delay(t0), Duration::from_secs(10));
        // after a long idle period the bucket is full again, capped at burst
        let later = t0 + Duration::from_secs(1000);
        assert_eq!(t.next_delay(later), Duration::ZERO);
        assert_eq!(t.next_delay(later), Duration::ZERO);
        assert!(t.next_delay(later) > Duration::ZERO);
    }

    #[test]
    fn unthrottled_never_waits() {
        let mut t = Throttle::new(RatePolicy::Unthrottled);
        let t0 = Instant::now();
        for _ in 0..5 {
            assert_eq!(t.next_delay(t0), Duration::ZERO);
        }
    }
}
