use serde::Serialize;

/// Rate multiple of the base period that the tracker may lock to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lane {
    Half,
    Same,
    OneAndHalf,
    Double,
}

impl Lane {
    pub const ALL: [Lane; 4] = [Lane::Half, Lane::Same, Lane::OneAndHalf, Lane::Double];

    /// Multiplier applied to the base period (a faster lane has a shorter period).
    pub fn period_multiplier(self) -> f32 {
        match self {
            Lane::Half => 2.0,
            Lane::Same => 1.0,
            Lane::OneAndHalf => 2.0 / 3.0,
            Lane::Double => 0.5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Lane::Half => "0.5x",
            Lane::Same => "1x",
            Lane::OneAndHalf => "1.5x",
            Lane::Double => "2x",
        }
    }

    /// Position in `Lane::ALL`.
    pub fn index(self) -> usize {
        match self {
            Lane::Half => 0,
            Lane::Same => 1,
            Lane::OneAndHalf => 2,
            Lane::Double => 3,
        }
    }
}

impl Default for Lane {
    fn default() -> Self {
        Lane::Same
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LaneCandidate {
    pub lane: Lane,
    pub period: f32,
    pub bpm: f32,
    pub prominence: f32,
    pub phase_low: f32,
    pub phase_hm: f32,
    /// Frames since the last beat of this candidate's best grid (mix stream).
    pub grid_offset: f32,
    pub score: f32,
}

impl LaneCandidate {
    pub fn new(
        lane: Lane,
        period: f32,
        bpm: f32,
        prominence: f32,
        phase_low: f32,
        phase_hm: f32,
        grid_offset: f32,
    ) -> Self {
        let phase_blend = PHASE_WEIGHT_LOW * phase_low + PHASE_WEIGHT_HM * phase_hm;
        Self {
            lane,
            period,
            bpm,
            prominence,
            phase_low,
            phase_hm,
            grid_offset,
            score: PROMINENCE_WEIGHT * prominence + (1.0 - PROMINENCE_WEIGHT) * phase_blend,
        }
    }
}

const PROMINENCE_WEIGHT: f32 = 0.6;
const PHASE_WEIGHT_LOW: f32 = 0.6;
const PHASE_WEIGHT_HM: f32 = 0.4;

const SWITCH_UP_MIN_DELTA: f32 = 0.04;
const SWITCH_DOWN_MIN_DELTA: f32 = 0.08;
const HM_PHASE_ADVANCE_FOR_GEAR_UP: f32 = 0.03;
const STICKY_BIAS: f32 = 0.03;
const STICKY_AFTER_FRAMES: u32 = 125;
/// Candidates within this many BPM count as the same speed.
const SAME_SPEED_BPM: f32 = 0.5;

/// Hysteretic lane selection: the incumbent is kept unless a challenger wins
/// by a direction-dependent margin.
#[derive(Debug, Clone, Default)]
pub struct LaneArbiter {
    current: Lane,
    held_frames: u32,
}

impl LaneArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Lane {
        self.current
    }

    pub fn held_frames(&self) -> u32 {
        self.held_frames
    }

    pub fn reset(&mut self) {
        self.current = Lane::Same;
        self.held_frames = 0;
    }

    /// Picks a lane from `candidates` (indexed like `Lane::ALL`). `elapsed_frames`
    /// is the number of ticks since the previous arbitration.
    pub fn select(&mut self, candidates: &[LaneCandidate; 4], elapsed_frames: u32) -> Lane {
        let incumbent = &candidates[self.current.index()];
        let mut biased = incumbent.score;
        if self.held_frames > STICKY_AFTER_FRAMES {
            biased += STICKY_BIAS;
        }

        let mut chosen = self.current;
        let mut chosen_score = incumbent.score;
        for cand in candidates.iter().filter(|c| c.lane != self.current) {
            let faster = cand.bpm > incumbent.bpm + SAME_SPEED_BPM;
            let slower = cand.bpm + SAME_SPEED_BPM < incumbent.bpm;
            let wins = if faster {
                cand.score - biased >= SWITCH_UP_MIN_DELTA
                    && cand.phase_hm - incumbent.phase_hm >= HM_PHASE_ADVANCE_FOR_GEAR_UP
            } else if slower {
                cand.score - biased >= SWITCH_DOWN_MIN_DELTA
            } else {
                true
            };
            if wins && cand.score > chosen_score {
                chosen = cand.lane;
                chosen_score = cand.score;
            }
        }

        if chosen == self.current {
            self.held_frames = self.held_frames.saturating_add(elapsed_frames);
        } else {
            self.held_frames = 0;
        }
        self.current = chosen;
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(scores: [f32; 4], phase_hm: [f32; 4]) -> [LaneCandidate; 4] {
        let base = 60.0f32;
        let mut out = [LaneCandidate::new(Lane::Same, base, 125.0, 0.0, 0.0, 0.0, 0.0); 4];
        for (i, lane) in Lane::ALL.iter().enumerate() {
            let period = base * lane.period_multiplier();
            out[i] = LaneCandidate {
                lane: *lane,
                period,
                bpm: 7500.0 / period,
                prominence: 0.0,
                phase_low: 0.0,
                phase_hm: phase_hm[i],
                grid_offset: 0.0,
                score: scores[i],
            };
        }
        out
    }

    #[test]
    fn test_score_blend() {
        let c = LaneCandidate::new(Lane::Same, 60.0, 125.0, 1.0, 1.0, 1.0, 0.0);
        assert!((c.score - 1.0).abs() < 1.0e-6);
        let c = LaneCandidate::new(Lane::Same, 60.0, 125.0, 0.5, 0.0, 1.0, 0.0);
        assert!((c.score - (0.3 + 0.4 * 0.4)).abs() < 1.0e-6);
    }

    #[test]
    fn test_faster_lane_needs_margin_and_hm_advance() {
        let mut arbiter = LaneArbiter::new();
        // Better score but no mid/high phase advance: stay.
        let c = candidates([0.1, 0.5, 0.6, 0.1], [0.0, 0.5, 0.5, 0.0]);
        assert_eq!(arbiter.select(&c, 2), Lane::Same);
        // Better score and phase advance: switch up.
        let c = candidates([0.1, 0.5, 0.6, 0.1], [0.0, 0.5, 0.6, 0.0]);
        assert_eq!(arbiter.select(&c, 2), Lane::OneAndHalf);
        assert_eq!(arbiter.held_frames(), 0);
    }

    #[test]
    fn test_slower_lane_needs_larger_margin() {
        let mut arbiter = LaneArbiter::new();
        let c = candidates([0.56, 0.5, 0.0, 0.0], [0.0; 4]);
        assert_eq!(arbiter.select(&c, 2), Lane::Same);
        let c = candidates([0.59, 0.5, 0.0, 0.0], [0.0; 4]);
        assert_eq!(arbiter.select(&c, 2), Lane::Half);
    }

    #[test]
    fn test_incumbent_becomes_sticky_after_a_second() {
        let mut arbiter = LaneArbiter::new();
        let hold = candidates([0.0, 0.5, 0.0, 0.0], [0.0; 4]);
        for _ in 0..70 {
            arbiter.select(&hold, 2);
        }
        assert!(arbiter.held_frames() > 125);
        // 0.09 over the raw score is only 0.06 over the biased one.
        let c = candidates([0.59, 0.5, 0.0, 0.0], [0.0; 4]);
        assert_eq!(arbiter.select(&c, 2), Lane::Same);
    }
}
