use std::time::{Duration, Instant};

use crate::config::SdConfig;

/// Announcement phases of one offered (or searched) service.
///
/// Offers walk initial wait, repetition with doubling delays, then the
/// cyclic main phase. Find campaigns walk the same machine but finish after
/// the repetition phase instead of turning cyclic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    InitialWait { due: Instant },
    Repetition { step: u32, due: Instant },
    Main { due: Instant },
    Finished,
}

/// Timer state machine for one announcement campaign.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    phase: Phase,
    /// Offers are cyclic, find campaigns are not.
    cyclic: bool,
    /// Set once the service reached the main phase at least once.
    pub is_in_mainphase: bool,
}

impl PhaseMachine {
    pub fn start(now: Instant, initial_delay: Duration, cyclic: bool) -> Self {
        PhaseMachine {
            phase: Phase::InitialWait {
                due: now + initial_delay,
            },
            cyclic,
            is_in_mainphase: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::InitialWait { due } | Phase::Repetition { due, .. } | Phase::Main { due } => {
                Some(due)
            }
            Phase::Finished => None,
        }
    }

    /// Re-enters the repetition phase (routing state RESUMED, peer reboot).
    /// The next announcement goes out immediately.
    pub fn restart(&mut self, now: Instant) {
        self.phase = Phase::InitialWait { due: now };
        self.is_in_mainphase = false;
    }

    /// Advances the machine. Returns true when an announcement is due now;
    /// callers invoke this from their timer handler.
    pub fn fire(&mut self, now: Instant, config: &SdConfig) -> bool {
        match self.deadline() {
            Some(due) if due <= now => {}
            _ => return false,
        }

        match self.phase {
            Phase::InitialWait { .. } => {
                self.phase = self.after_repetition_step(now, 0, config);
            }
            Phase::Repetition { step, .. } => {
                self.phase = self.after_repetition_step(now, step + 1, config);
            }
            Phase::Main { .. } => {
                self.phase = Phase::Main {
                    due: now + config.cyclic_offer_delay,
                };
            }
            Phase::Finished => return false,
        }

        if matches!(self.phase, Phase::Main { .. }) {
            self.is_in_mainphase = true;
        }
        true
    }

    fn after_repetition_step(&self, now: Instant, next_step: u32, config: &SdConfig) -> Phase {
        if next_step >= config.repetitions_max {
            if self.cyclic {
                Phase::Main {
                    due: now + config.cyclic_offer_delay,
                }
            } else {
                Phase::Finished
            }
        } else {
            // base, 2*base, 4*base, ...
            let delay = config.repetitions_base_delay * 2u32.pow(next_step);
            Phase::Repetition {
                step: next_step,
                due: now + delay,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> SdConfig {
        SdConfig {
            repetitions_max: 3,
            repetitions_base_delay: Duration::from_millis(200),
            cyclic_offer_delay: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Drives the machine to completion and collects the relative fire
    /// times.
    fn run(machine: &mut PhaseMachine, start: Instant, rounds: usize) -> Vec<Duration> {
        let config = config();
        let mut fired = vec![];
        for _ in 0..rounds {
            let due = match machine.deadline() {
                Some(d) => d,
                None => break,
            };
            assert!(machine.fire(due, &config));
            fired.push(due - start);
        }
        fired
    }

    #[test]
    fn test_offer_phase_progression() {
        let start = Instant::now();
        let mut m = PhaseMachine::start(start, Duration::from_millis(50), true);

        let fired = run(&mut m, start, 6);
        assert_eq!(
            fired,
            vec![
                Duration::from_millis(50),   // initial wait
                Duration::from_millis(250),  // base
                Duration::from_millis(650),  // + 2*base
                Duration::from_millis(1450), // + 4*base
                Duration::from_millis(3450), // main phase
                Duration::from_millis(5450),
            ]
        );
        assert!(m.is_in_mainphase);
    }

    #[test]
    fn test_find_campaign_finishes() {
        let start = Instant::now();
        let mut m = PhaseMachine::start(start, Duration::from_millis(10), false);

        let fired = run(&mut m, start, 10);
        assert_eq!(fired.len(), 4); // initial + 3 repetitions
        assert_eq!(m.deadline(), None);
        assert!(!m.is_in_mainphase);
    }

    #[test]
    fn test_restart_reenters_repetition() {
        let start = Instant::now();
        let mut m = PhaseMachine::start(start, Duration::from_millis(10), true);
        let _ = run(&mut m, start, 5);
        assert!(m.is_in_mainphase);

        let resumed = start + Duration::from_secs(60);
        m.restart(resumed);
        assert!(!m.is_in_mainphase);

        let fired = run(&mut m, resumed, 4);
        assert_eq!(
            fired,
            vec![
                Duration::ZERO,
                Duration::from_millis(200),
                Duration::from_millis(600),
                Duration::from_millis(1400),
            ]
        );
    }

    #[test]
    fn test_fire_before_deadline_is_noop() {
        let start = Instant::now();
        let mut m = PhaseMachine::start(start, Duration::from_millis(100), true);
        assert!(!m.fire(start, &config()));
        assert_eq!(
            m.deadline(),
            Some(start + Duration::from_millis(100))
        );
    }
}
