//! The FEC-level ladder: a held, monotonically-bumped integer that decays
//! back to zero once conditions settle.

use std::time::{Duration, Instant};

/// Hold duration after a bump before decay resumes.
const HOLD: Duration = Duration::from_secs(1);

/// Thresholds mapping the controller's rolling FEC counters to a suggested
/// ladder level. Configurable rather than hard-coded so either of the
/// source's differing quality-mapping variants can be reproduced.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct FecThresholds {
    pub lost_to_5: u32,
    pub recovered_to_4: u32,
    pub recovered_to_3: u32,
    pub recovered_to_2: u32,
    pub recovered_to_1: u32,
}

impl Default for FecThresholds {
    fn default() -> Self {
        FecThresholds {
            lost_to_5: 2,
            recovered_to_4: 30,
            recovered_to_3: 24,
            recovered_to_2: 14,
            recovered_to_1: 8,
        }
    }
}

impl FecThresholds {
    pub fn level_for(&self, recovered: u32, lost: u32) -> u8 {
        if lost > self.lost_to_5 {
            5
        } else if recovered > self.recovered_to_4 {
            4
        } else if recovered > self.recovered_to_3 {
            3
        } else if recovered > self.recovered_to_2 {
            2
        } else if recovered > self.recovered_to_1 {
            1
        } else {
            0
        }
    }
}

/// Integer level in `[0, 5]` with a one-second hold after every bump and a
/// one-level-per-elapsed-tick decay once the hold expires.
pub struct FecLadder {
    value: u8,
    last_change: Option<Instant>,
}

impl Default for FecLadder {
    fn default() -> Self {
        Self::new()
    }
}

impl FecLadder {
    pub fn new() -> Self {
        FecLadder {
            value: 0,
            last_change: None,
        }
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    /// Raise the level if `candidate` exceeds the current one; never lowers it.
    pub fn bump(&mut self, candidate: u8, now: Instant) {
        if candidate > self.value {
            self.value = candidate;
            self.last_change = Some(now);
        }
    }

    /// Subtract one per whole hold-tick elapsed since the last change,
    /// floored at zero, advancing the change timestamp by however many
    /// ticks were consumed so decay rate stays exactly one-per-second.
    pub fn decay(&mut self, now: Instant) {
        let last_change = match self.last_change {
            Some(t) => t,
            None => return,
        };
        if now < last_change {
            return;
        }
        let elapsed = now.duration_since(last_change);
        let ticks = (elapsed.as_secs_f64() / HOLD.as_secs_f64()).floor() as u64;
        if ticks == 0 {
            return;
        }
        let ticks = ticks.min(self.value as u64);
        self.value -= ticks as u8;
        self.last_change = Some(last_change + HOLD * ticks as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_never_lowers_level() {
        let mut ladder = FecLadder::new();
        let t0 = Instant::now();
        ladder.bump(3, t0);
        ladder.bump(2, t0);
        assert_eq!(ladder.value(), 3);
    }

    #[test]
    fn decay_holds_for_one_second_then_drops_one_per_tick() {
        let mut ladder = FecLadder::new();
        let t0 = Instant::now();
        ladder.bump(4, t0);
        ladder.decay(t0 + Duration::from_millis(500));
        assert_eq!(ladder.value(), 4, "still within the hold window");
        ladder.decay(t0 + Duration::from_millis(1500));
        assert_eq!(ladder.value(), 3);
        ladder.decay(t0 + Duration::from_millis(3600));
        assert_eq!(ladder.value(), 1);
    }

    #[test]
    fn decay_floors_at_zero() {
        let mut ladder = FecLadder::new();
        let t0 = Instant::now();
        ladder.bump(1, t0);
        ladder.decay(t0 + Duration::from_secs(10));
        assert_eq!(ladder.value(), 0);
    }

    #[test]
    fn thresholds_pick_expected_level() {
        let t = FecThresholds::default();
        assert_eq!(t.level_for(0, 3), 5);
        assert_eq!(t.level_for(31, 0), 4);
        assert_eq!(t.level_for(25, 0), 3);
        assert_eq!(t.level_for(15, 0), 2);
        assert_eq!(t.level_for(9, 0), 1);
        assert_eq!(t.level_for(0, 0), 0);
    }
}
