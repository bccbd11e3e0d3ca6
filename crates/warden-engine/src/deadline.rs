//! Composed run/step deadlines.
//!
//! One [`Deadline`] value is built at run start and threaded to every
//! suspension point; each primitive races against
//! `min(step deadline, run deadline)`. There are no ambient cancellation
//! tokens.

use std::time::Duration;

use tokio::time::Instant;

/// The run's hard deadline plus the currently-open step's deadline.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    run_deadline: Instant,
    step_deadline: Option<Instant>,
}

impl Deadline {
    /// Start the run clock.
    pub fn start_run(run_budget: Duration) -> Self {
        Self {
            run_deadline: Instant::now() + run_budget,
            step_deadline: None,
        }
    }

    /// Open a step window; replaces any previous step deadline.
    pub fn begin_step(&mut self, step_budget: Duration) {
        self.step_deadline = Some(Instant::now() + step_budget);
    }

    pub fn clear_step(&mut self) {
        self.step_deadline = None;
    }

    pub fn run_expired(&self) -> bool {
        Instant::now() >= self.run_deadline
    }

    pub fn step_expired(&self) -> bool {
        self.step_deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn expired(&self) -> bool {
        self.run_expired() || self.step_expired()
    }

    /// Remaining time until the nearest deadline.
    pub fn remaining(&self) -> Duration {
        let now = Instant::now();
        let run = self.run_deadline.saturating_duration_since(now);
        match self.step_deadline {
            Some(step) => run.min(step.saturating_duration_since(now)),
            None => run,
        }
    }

    /// Clamp a primitive's own budget to the nearest deadline, with a small
    /// floor so a primitive at the edge still gets one real attempt.
    pub fn effective_budget(&self, primitive: Duration) -> Duration {
        primitive.min(self.remaining()).max(Duration::from_millis(250))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn shorter_timer_wins() {
        let mut deadline = Deadline::start_run(Duration::from_secs(120));
        deadline.begin_step(Duration::from_secs(20));
        // Step window is the binding constraint.
        assert!(deadline.effective_budget(Duration::from_secs(60)) <= Duration::from_secs(20));
        // The primitive's own budget binds when smaller.
        assert_eq!(
            deadline.effective_budget(Duration::from_secs(8)),
            Duration::from_secs(8)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_tracks_both_clocks() {
        let mut deadline = Deadline::start_run(Duration::from_secs(100));
        deadline.begin_step(Duration::from_secs(5));
        assert!(!deadline.expired());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(deadline.step_expired());
        assert!(!deadline.run_expired());
        assert!(deadline.expired());

        deadline.clear_step();
        assert!(!deadline.expired());

        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(deadline.run_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn effective_budget_has_floor() {
        let mut deadline = Deadline::start_run(Duration::from_secs(1));
        deadline.begin_step(Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        // Expired, but a racing primitive still gets the floor budget so it
        // can fail with a real attempt instead of a zero timeout.
        assert_eq!(
            deadline.effective_budget(Duration::from_secs(8)),
            Duration::from_millis(250)
        );
    }
}
