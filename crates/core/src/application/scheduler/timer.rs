//! Single shared wake timer of the scheduler loop.
//!
//! The timer is always armed for the earliest due time the scheduler knows
//! about. An "edgy" timer is one whose tick may not have seen every due job
//! (the last claim batch was full, or a new due time arrived since); while edgy,
//! every reschedule request collapses to an immediate re-check.

use crate::application::constants::{TIMER_MAX_DUR, TIMER_MIN_DUR};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, Instant, Sleep};

pub struct SchedulerTimer {
    timer_at: i64,
    sleep: Pin<Box<Sleep>>,
    edgy: bool,
}

impl SchedulerTimer {
    /// Must be called inside a Tokio runtime.
    pub fn new() -> Self {
        Self {
            timer_at: 0,
            sleep: Box::pin(sleep(TIMER_MAX_DUR)),
            edgy: false,
        }
    }

    /// Arm the timer for `at` (epoch ms).
    ///
    /// A missing, past or imminent `at` is clamped to [`TIMER_MIN_DUR`] so the
    /// timer never fires with a non-positive duration; a far away one is
    /// clamped to [`TIMER_MAX_DUR`].
    pub fn reset_at(&mut self, now: i64, at: Option<i64>, edgy: bool) -> Duration {
        let dur = at
            .map(|at| millis_until(now, at))
            .unwrap_or(Duration::ZERO)
            .clamp(TIMER_MIN_DUR, TIMER_MAX_DUR);

        self.arm(now, dur, edgy)
    }

    /// Re-arm for `at` only if it is earlier than the current deadline.
    ///
    /// Returns the new wait, or zero when the timer was left alone.
    pub fn reschedule_earlier(&mut self, now: i64, at: Option<i64>) -> Duration {
        let dur = if self.edgy {
            TIMER_MIN_DUR
        } else {
            match at {
                None => return Duration::ZERO,
                Some(at) if at >= self.timer_at => return Duration::ZERO,
                Some(at) => millis_until(now, at).max(TIMER_MIN_DUR),
            }
        };

        self.arm(now, dur, true)
    }

    pub fn is_edgy(&self) -> bool {
        self.edgy
    }

    /// Epoch ms the timer is armed for
    pub fn armed_at(&self) -> i64 {
        self.timer_at
    }

    /// Completes when the armed deadline is reached.
    pub async fn fired(&mut self) {
        self.sleep.as_mut().await
    }

    fn arm(&mut self, now: i64, dur: Duration, edgy: bool) -> Duration {
        self.edgy = edgy;
        self.timer_at = now + dur.as_millis() as i64;
        self.sleep.as_mut().reset(Instant::now() + dur);
        dur
    }
}

fn millis_until(now: i64, at: i64) -> Duration {
    Duration::from_millis(at.saturating_sub(now).max(0) as u64)
}
