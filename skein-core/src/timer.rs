use std::time::{Duration, Instant};

/// Exponential-backoff deadline, the shape shared by the retransmission
/// timer and the peer reconnection timer.
///
/// The timer is pure state: it never sleeps. The owner asks for
/// [`deadline`](Self::deadline), waits however it likes (a tokio sleep, a
/// virtual clock step in the simulator), then reports expiry with
/// [`poll`](Self::poll). Each expiry consumes the current interval from a
/// failure budget; once the budget is gone the expiry is flagged as a
/// failure, which the flow layer turns into a terminal link-down.
#[derive(Debug, Clone)]
pub struct BackoffTimer {
    interval: Duration,
    deadline: Option<Instant>,
    budget: Duration,
    max_interval: Duration,
    fail_budget: Duration,
}

impl BackoffTimer {
    pub fn new(max_interval: Duration, fail_budget: Duration) -> Self {
        Self {
            interval: Duration::ZERO,
            deadline: None,
            budget: fail_budget,
            max_interval,
            fail_budget,
        }
    }

    /// Arm the timer with a fresh interval, resetting the failure budget.
    pub fn start(&mut self, now: Instant, interval: Duration) {
        self.interval = interval.min(self.max_interval);
        self.budget = self.fail_budget;
        self.deadline = Some(now + self.interval);
    }

    /// Re-arm after an expiry with the interval doubled, up to the cap.
    /// Does not reset the failure budget.
    pub fn restart(&mut self, now: Instant) {
        self.interval = (self.interval * 2).min(self.max_interval);
        self.deadline = Some(now + self.interval);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Check for expiry. Returns `Some(failed)` when the deadline has
    /// passed and disarms the timer; the caller restarts it if the
    /// condition persists. `failed` is true once the cumulative intervals
    /// consumed since `start` exceed the failure budget.
    pub fn poll(&mut self, now: Instant) -> Option<bool> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        self.deadline = None;
        let failed = match self.budget.checked_sub(self.interval) {
            Some(rest) => {
                self.budget = rest;
                self.budget.is_zero()
            }
            None => {
                self.budget = Duration::ZERO;
                true
            }
        };
        Some(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: Duration = Duration::from_secs(10);
    const FAIL: Duration = Duration::from_secs(30);

    #[test]
    fn fires_only_at_deadline() {
        let t0 = Instant::now();
        let mut timer = BackoffTimer::new(MAX, FAIL);
        timer.start(t0, Duration::from_millis(500));
        assert!(timer.poll(t0 + Duration::from_millis(499)).is_none());
        assert_eq!(timer.poll(t0 + Duration::from_millis(500)), Some(false));
        // Disarmed until restarted.
        assert!(!timer.is_active());
        assert!(timer.poll(t0 + Duration::from_secs(60)).is_none());
    }

    #[test]
    fn restart_doubles_up_to_cap() {
        let t0 = Instant::now();
        let mut timer = BackoffTimer::new(MAX, FAIL);
        timer.start(t0, Duration::from_secs(4));
        assert_eq!(timer.poll(t0 + Duration::from_secs(4)), Some(false));
        timer.restart(t0);
        assert_eq!(timer.interval(), Duration::from_secs(8));
        timer.restart(t0);
        assert_eq!(timer.interval(), MAX);
    }

    #[test]
    fn budget_exhaustion_reports_failure() {
        let t0 = Instant::now();
        let mut timer = BackoffTimer::new(MAX, Duration::from_secs(15));
        timer.start(t0, Duration::from_secs(10));
        let mut now = t0;
        now += timer.interval();
        assert_eq!(timer.poll(now), Some(false)); // 5s of budget left
        timer.restart(now);
        now += timer.interval();
        assert_eq!(timer.poll(now), Some(true)); // budget gone
    }

    #[test]
    fn start_resets_budget() {
        let t0 = Instant::now();
        let mut timer = BackoffTimer::new(MAX, Duration::from_secs(10));
        timer.start(t0, Duration::from_secs(10));
        assert_eq!(timer.poll(t0 + Duration::from_secs(10)), Some(true));
        timer.start(t0 + Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(
            timer.poll(t0 + Duration::from_secs(11)),
            Some(false),
            "fresh start must begin with a full failure budget"
        );
    }
}
