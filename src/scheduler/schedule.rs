//! Tick schedule: fixed interval or cron expression

use anyhow::Result;
use chrono::Utc;
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub enum TickSchedule {
    Interval(Duration),
    Cron(Box<Schedule>),
}

impl TickSchedule {
    /// Parse and validate a cron expression (seconds field included)
    pub fn cron(expr: &str) -> Result<Self> {
        let schedule = Schedule::from_str(expr)
            .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expr, e))?;
        Ok(Self::Cron(Box::new(schedule)))
    }

    /// Time to wait before the next tick
    pub fn until_next(&self) -> Duration {
        match self {
            TickSchedule::Interval(every) => *every,
            TickSchedule::Cron(schedule) => schedule
                .upcoming(Utc)
                .next()
                .and_then(|at| (at - Utc::now()).to_std().ok())
                .unwrap_or(Duration::ZERO),
        }
    }

    /// Deadline of the tick after one due at `previous`.
    ///
    /// Intervals keep a fixed cadence from the first deadline and never
    /// schedule into the past; cron deadlines are recomputed from the clock.
    pub fn next_deadline(&self, previous: Instant) -> Instant {
        let now = Instant::now();
        match self {
            TickSchedule::Interval(every) => (previous + *every).max(now),
            TickSchedule::Cron(_) => now + self.until_next(),
        }
    }
}

impl std::fmt::Display for TickSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TickSchedule::Interval(every) => write!(f, "every {}s", every.as_secs()),
            TickSchedule::Cron(schedule) => write!(f, "cron '{}'", schedule),
        }
    }
}
