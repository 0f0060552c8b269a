//! C6: the respawn controller -- the burst/delay/limit state machine, with
//! monotonic-clock hardening.
//!
//! Ported from `spawn_child()` in `original_source/daemon/daemon.c`: on each
//! respawn, if the previous run lasted less than `acceptable`, bump the
//! attempt counter; once attempts are exhausted, either give up (burst limit
//! reached) or sleep `delay` seconds and start a fresh burst.

use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::signals::SignalFlags;

pub const DEFAULT_ACCEPTABLE: u64 = 300;
pub const MIN_ACCEPTABLE: u64 = 10;
pub const DEFAULT_ATTEMPTS: u32 = 5;
pub const MIN_ATTEMPTS: u32 = 0;
pub const MAX_ATTEMPTS: u32 = 100;
pub const DEFAULT_DELAY: u64 = 300;
pub const MIN_DELAY: u64 = 10;
pub const DEFAULT_LIMIT: u32 = 0;

#[derive(Debug, Clone, Copy)]
pub struct RespawnPolicy {
    pub acceptable: Duration,
    pub attempts_max: u32,
    pub delay: Duration,
    pub limit_bursts: u32,
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        RespawnPolicy {
            acceptable: Duration::from_secs(DEFAULT_ACCEPTABLE),
            attempts_max: DEFAULT_ATTEMPTS,
            delay: Duration::from_secs(DEFAULT_DELAY),
            limit_bursts: DEFAULT_LIMIT,
        }
    }
}

/// Clamps bounds-sensitive options, unless `idiot_mode` was granted (only
/// possible when real uid is 0), matching spec.md §4.6 / §9.
impl RespawnPolicy {
    pub fn clamp(&mut self, idiot_mode: bool) {
        if idiot_mode {
            return;
        }
        if self.acceptable < Duration::from_secs(MIN_ACCEPTABLE) {
            self.acceptable = Duration::from_secs(MIN_ACCEPTABLE);
        }
        self.attempts_max = self.attempts_max.clamp(MIN_ATTEMPTS, MAX_ATTEMPTS);
        if self.delay < Duration::from_secs(MIN_DELAY) {
            self.delay = Duration::from_secs(MIN_DELAY);
        }
    }
}

pub enum Outcome {
    /// Proceed to spawn the child now.
    Proceed,
    /// The supervisor should exit with failure: the burst limit was hit.
    GaveUp,
    /// A TERM arrived while waiting out a burst delay.
    Terminated,
}

/// Tracks attempt/burst counters and the timestamp of the last spawn.
pub struct RespawnController {
    policy: RespawnPolicy,
    last_spawn: Option<Instant>,
    attempt_count: u32,
    burst_count: u32,
}

impl RespawnController {
    pub fn new(policy: RespawnPolicy) -> Self {
        RespawnController {
            policy,
            last_spawn: None,
            attempt_count: 0,
            burst_count: 0,
        }
    }

    /// `USR1` resets all counters so an operator-requested restart is never
    /// mistaken for a crash loop.
    pub fn reset_on_usr1(&mut self) {
        self.last_spawn = None;
        self.attempt_count = 0;
        self.burst_count = 0;
    }

    /// Runs the algorithm of spec.md §4.6 ahead of a `spawn_child`
    /// invocation. `sleep_with_signals` is called (possibly repeatedly, on
    /// `EINTR`) to perform the burst delay; it returns `true` if the sleep
    /// was interrupted by termination.
    pub fn prepare_spawn(
        &mut self,
        flags: &SignalFlags,
        mut sleep_with_signals: impl FnMut(Duration) -> bool,
    ) -> Outcome {
        let now = Instant::now();

        if let Some(last) = self.last_spawn {
            // Clock regression: `Instant` is itself monotonic so this branch
            // is defensive, but it documents the invariant spec.md §9 calls
            // for explicitly.
            let elapsed = now.checked_duration_since(last).unwrap_or(Duration::ZERO);

            if elapsed < self.policy.acceptable {
                info!(
                    elapsed_secs = elapsed.as_secs(),
                    "previous instance lived less than the acceptable threshold"
                );
                self.attempt_count += 1;

                if self.attempt_count >= self.policy.attempts_max {
                    if self.policy.limit_bursts != 0 {
                        self.burst_count += 1;
                        if self.burst_count >= self.policy.limit_bursts {
                            error!(
                                limit = self.policy.limit_bursts,
                                "reached respawn attempt burst limit, giving up"
                            );
                            return Outcome::GaveUp;
                        }
                    }

                    error!(delay_secs = self.policy.delay.as_secs(), "terminating too quickly, waiting");
                    if sleep_with_signals(self.policy.delay) || flags.is_terminated() {
                        return Outcome::Terminated;
                    }
                    info!("end of respawn attempt burst delay");
                    self.attempt_count = 0;
                }
            }
        }

        self.last_spawn = Some(Instant::now());
        Outcome::Proceed
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn burst_count(&self) -> u32 {
        self.burst_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> SignalFlags {
        SignalFlags::default()
    }

    #[test]
    fn first_spawn_always_proceeds() {
        let mut ctl = RespawnController::new(RespawnPolicy::default());
        let f = flags();
        let outcome = ctl.prepare_spawn(&f, |_| false);
        assert!(matches!(outcome, Outcome::Proceed));
    }

    #[test]
    fn burst_then_gives_up_at_limit() {
        let policy = RespawnPolicy {
            acceptable: Duration::from_secs(3600), // always "too fast"
            attempts_max: 2,
            delay: Duration::from_secs(10),
            limit_bursts: 1,
        };
        let mut ctl = RespawnController::new(policy);
        let f = flags();

        assert!(matches!(ctl.prepare_spawn(&f, |_| false), Outcome::Proceed));
        assert!(matches!(ctl.prepare_spawn(&f, |_| false), Outcome::Proceed));
        // Third spawn: attempt_count reaches attempts_max=2, limit_bursts=1 is hit immediately.
        assert!(matches!(ctl.prepare_spawn(&f, |_| false), Outcome::GaveUp));
    }

    #[test]
    fn burst_delay_then_resets_and_proceeds() {
        let policy = RespawnPolicy {
            acceptable: Duration::from_secs(3600),
            attempts_max: 1,
            delay: Duration::from_secs(10),
            limit_bursts: 0,
        };
        let mut ctl = RespawnController::new(policy);
        let f = flags();

        assert!(matches!(ctl.prepare_spawn(&f, |_| false), Outcome::Proceed));
        // Second spawn hits attempts_max=1 immediately, sleeps, and resumes.
        let mut slept = false;
        assert!(matches!(
            ctl.prepare_spawn(&f, |_| {
                slept = true;
                false
            }),
            Outcome::Proceed
        ));
        assert!(slept);
        assert_eq!(ctl.attempt_count(), 0);
    }

    #[test]
    fn usr1_resets_counters() {
        let mut ctl = RespawnController::new(RespawnPolicy::default());
        ctl.attempt_count = 3;
        ctl.burst_count = 2;
        ctl.reset_on_usr1();
        assert_eq!(ctl.attempt_count(), 0);
        assert_eq!(ctl.burst_count(), 0);
    }

    #[test]
    fn termination_during_delay_is_reported() {
        let policy = RespawnPolicy {
            acceptable: Duration::from_secs(3600),
            attempts_max: 1,
            delay: Duration::from_secs(10),
            limit_bursts: 0,
        };
        let mut ctl = RespawnController::new(policy);
        let f = flags();
        ctl.prepare_spawn(&f, |_| false);
        assert!(matches!(ctl.prepare_spawn(&f, |_| true), Outcome::Terminated));
    }
}
