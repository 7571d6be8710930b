// Local countdowns for the turn clock and the time-to-start clock.
//
// The countdown never invents a deadline: every `start` takes a value that
// came from the server, and the value only moves down in fixed steps.

use std::future;
use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval};

/// Step between ticks.
pub const TICK: Duration = Duration::from_millis(1000);

const TICK_MS: u64 = TICK.as_millis() as u64;

/// Pure countdown state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Countdown {
    remaining_ms: u64,
    running: bool,
}

impl Countdown {
    /// Reset to `remaining_ms` and run. Starting at zero leaves it stopped.
    pub fn start(&mut self, remaining_ms: u64) {
        self.remaining_ms = remaining_ms;
        self.running = remaining_ms > 0;
    }

    pub fn stop(&mut self) {
        self.remaining_ms = 0;
        self.running = false;
    }

    /// Advance one step. Returns the new value, or `None` once halted.
    pub fn tick(&mut self) -> Option<u64> {
        if !self.running {
            return None;
        }
        self.remaining_ms = self.remaining_ms.saturating_sub(TICK_MS);
        if self.remaining_ms == 0 {
            self.running = false;
        }
        Some(self.remaining_ms)
    }

    pub fn remaining_ms(&self) -> u64 {
        self.remaining_ms
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

pub fn format_mm_ss(ms: u64) -> String {
    let minutes = ms / 60_000;
    let seconds = (ms % 60_000) / 1000;
    format!("{minutes:02}:{seconds:02}")
}

/// A `Countdown` driven by a tokio interval. Only the session loop owns one.
#[derive(Debug, Default)]
pub struct CountdownTimer {
    countdown: Countdown,
    interval: Option<Interval>,
}

impl CountdownTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear any running timer and start a fresh one from `remaining_ms`.
    pub fn start(&mut self, remaining_ms: u64) {
        self.countdown.start(remaining_ms);
        self.interval = if self.countdown.is_running() {
            Some(interval_at(Instant::now() + TICK, TICK))
        } else {
            None
        };
    }

    pub fn stop(&mut self) {
        self.countdown.stop();
        self.interval = None;
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Wait for the next step and return the new value. Pends forever while
    /// stopped, so it can sit in a `select!` unconditionally.
    pub async fn tick(&mut self) -> u64 {
        let Some(interval) = self.interval.as_mut() else {
            return future::pending().await;
        };
        interval.tick().await;
        match self.countdown.tick() {
            Some(ms) => {
                if !self.countdown.is_running() {
                    self.interval = None;
                }
                ms
            }
            None => {
                self.interval = None;
                future::pending().await
            }
        }
    }
}
