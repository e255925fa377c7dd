//! Tempo engine: spectral-flux onsets, median-baseline novelty, an
//! autocorrelation tempogram, multi-rate lane arbitration and a small PLL for
//! beat phase.

pub mod lanes;
pub mod onset;
pub mod tempogram;

use anyhow::{anyhow, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::fixed::Q16;
use super::FRAME_RATE_HZ;
use lanes::{Lane, LaneArbiter, LaneCandidate};
use onset::{BandBaseline, OnsetDetector, MEDIAN_WINDOWS, ONSET_BANDS};
use tempogram::{grid_alignment, is_harmonic, prominence, NoveltyRing, Tempogram, HISTORY_FRAMES};

const TEMPOGRAM_ALPHA: f32 = 0.15;
const NOVELTY_WEIGHTS: [f32; ONSET_BANDS] = [0.28, 0.32, 0.24, 0.16];
/// Onset band feeding the mid/high stream.
const HM_BAND: usize = 2;
/// Mid/high peak replaces the mix peak when the mix tempogram there is this strong.
const HM_PREFERENCE: f32 = 0.90;
/// A shorter period of the same harmonic family replaces the base period when
/// its peak is at least this strong relative to the base.
const SUBHARMONIC_PREFERENCE: f32 = 0.90;

const PLL_KAPPA: f32 = 0.18;
const PLL_MAX_NUDGE: f32 = 0.10;
const BEAT_WINDOW_FRACTION: f32 = 0.12;
const MAX_PERIOD_SLEW_PER_SEC: f32 = 0.04;

const CONFIDENCE_ALPHA: f32 = 0.20;
pub const CONFIDENCE_ON: f32 = 0.60;
pub const CONFIDENCE_OFF: f32 = 0.42;
pub const SILENCE_FLOOR: f32 = 1.0e-4;

const PHASE_EVAL_FRAMES: usize = 250;
const ENERGY_EVAL_FRAMES: usize = 125;
/// Frames of low-band novelty inspected when gating a beat pulse.
const BEAT_ONSET_LOOKBACK: usize = 3;
const MAX_BPM_OUT: f32 = 400.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoConfig {
    pub min_bpm: f32,
    pub max_bpm: f32,
    /// Heavy analysis (tempogram, lanes, PLL correction) runs every N ticks.
    pub heavy_interval: u32,
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            min_bpm: 80.0,
            max_bpm: 180.0,
            heavy_interval: 2,
        }
    }
}

impl TempoConfig {
    pub fn min_period_frames(&self) -> usize {
        (60.0 * FRAME_RATE_HZ / self.max_bpm).round() as usize
    }

    pub fn max_period_frames(&self) -> usize {
        (60.0 * FRAME_RATE_HZ / self.min_bpm).round() as usize
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.min_bpm.is_finite() && self.max_bpm.is_finite()) {
            return Err(anyhow!("Tempo range must be finite"));
        }
        if self.min_bpm < 40.0 || self.max_bpm > 240.0 || self.min_bpm >= self.max_bpm {
            return Err(anyhow!(
                "Tempo range {}..{} BPM must satisfy 40 <= min < max <= 240",
                self.min_bpm,
                self.max_bpm
            ));
        }
        if self.heavy_interval == 0 {
            return Err(anyhow!("heavy_interval must be at least 1"));
        }
        if self.max_period_frames() + 2 > HISTORY_FRAMES / 2 {
            return Err(anyhow!("Slowest period does not fit the novelty history"));
        }
        Ok(())
    }
}

/// Per-tick tempo result. All fields are zero except confidence and silence
/// until the novelty history has filled.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TempoOutput {
    pub bpm: Q16,
    pub phase: Q16,
    pub strength: Q16,
    pub confidence: Q16,
    pub silence: Q16,
    pub beat: bool,
    pub ready: bool,
}

pub struct TempoEngine {
    config: TempoConfig,
    min_period: f32,
    max_period: f32,

    onsets: OnsetDetector,
    baselines: [BandBaseline; ONSET_BANDS],

    mix: NoveltyRing,
    low: NoveltyRing,
    hm: NoveltyRing,
    tempogram_mix: Tempogram,
    tempogram_hm: Tempogram,

    arbiter: LaneArbiter,
    has_lock: bool,
    target_period: f32,
    period: f32,
    phase: f32,
    grid_offset: f32,
    /// Heavy updates in a row with the grid outside the beat window.
    unlocked_updates: u32,
    strength: f32,

    confidence: f32,
    beat_enabled: bool,
    silence: bool,
    silence_level: f32,

    tick: u64,
    heavy_runs: u64,
}

impl TempoEngine {
    pub fn new(config: TempoConfig) -> Result<Self> {
        config.validate()?;
        let min_period = config.min_period_frames();
        let max_period = config.max_period_frames();

        info!(
            "Tempo engine: {:.0}-{:.0} BPM ({}..{} frames), heavy every {} ticks",
            config.min_bpm, config.max_bpm, min_period, max_period, config.heavy_interval
        );

        Ok(Self {
            config,
            min_period: min_period as f32,
            max_period: max_period as f32,
            onsets: OnsetDetector::new(),
            baselines: [
                BandBaseline::new(MEDIAN_WINDOWS[0]),
                BandBaseline::new(MEDIAN_WINDOWS[1]),
                BandBaseline::new(MEDIAN_WINDOWS[2]),
                BandBaseline::new(MEDIAN_WINDOWS[3]),
            ],
            mix: NoveltyRing::new(HISTORY_FRAMES),
            low: NoveltyRing::new(HISTORY_FRAMES),
            hm: NoveltyRing::new(HISTORY_FRAMES),
            tempogram_mix: Tempogram::new(min_period, max_period, TEMPOGRAM_ALPHA),
            tempogram_hm: Tempogram::new(min_period, max_period, TEMPOGRAM_ALPHA),
            arbiter: LaneArbiter::new(),
            has_lock: false,
            target_period: 0.0,
            period: 0.0,
            phase: 0.0,
            grid_offset: 0.0,
            unlocked_updates: 0,
            strength: 0.0,
            confidence: 0.0,
            beat_enabled: false,
            silence: true,
            silence_level: 1.0,
            tick: 0,
            heavy_runs: 0,
        })
    }

    pub fn config(&self) -> &TempoConfig {
        &self.config
    }

    pub fn reset(&mut self) {
        self.onsets.reset();
        self.baselines.iter_mut().for_each(BandBaseline::reset);
        self.mix.clear();
        self.low.clear();
        self.hm.clear();
        self.tempogram_mix.reset();
        self.tempogram_hm.reset();
        self.arbiter.reset();
        self.has_lock = false;
        self.target_period = 0.0;
        self.period = 0.0;
        self.phase = 0.0;
        self.grid_offset = 0.0;
        self.unlocked_updates = 0;
        self.strength = 0.0;
        self.confidence = 0.0;
        self.beat_enabled = false;
        self.silence = true;
        self.silence_level = 1.0;
        self.tick = 0;
        self.heavy_runs = 0;
    }

    /// Feeds one DC-free Q24 chunk. Every call contributes exactly one novelty
    /// frame, including the zero frames recorded while the FFT window fills.
    pub fn ingest(&mut self, chunk: &[i32]) {
        let flux = self.onsets.process(chunk);
        self.ingest_onsets(flux);
    }

    /// Feeds per-band onset strengths directly, bypassing the FFT front-end.
    pub fn ingest_onsets(&mut self, onsets: [f32; ONSET_BANDS]) {
        let mut novelty = [0.0f32; ONSET_BANDS];
        for (b, value) in novelty.iter_mut().enumerate() {
            *value = self.baselines[b].novelty(onsets[b]);
        }
        let mix: f32 = novelty
            .iter()
            .zip(NOVELTY_WEIGHTS.iter())
            .map(|(n, w)| n * w)
            .sum();

        self.mix.push(mix);
        self.low.push(novelty[0]);
        self.hm.push(novelty[HM_BAND]);
    }

    pub fn is_ready(&self) -> bool {
        self.mix.is_full()
    }

    pub fn is_silent(&self) -> bool {
        self.silence
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn beat_enabled(&self) -> bool {
        self.beat_enabled
    }

    pub fn period_frames(&self) -> f32 {
        self.period
    }

    pub fn current_lane(&self) -> Lane {
        self.arbiter.current()
    }

    pub fn heavy_runs(&self) -> u64 {
        self.heavy_runs
    }

    /// Mean mix novelty over the last second.
    pub fn recent_novelty(&self) -> f32 {
        self.mix.mean_recent(ENERGY_EVAL_FRAMES)
    }

    /// Advances one tick and produces this tick's tempo output.
    pub fn update(&mut self) -> TempoOutput {
        self.tick = self.tick.wrapping_add(1);
        self.update_silence();

        let mut out = TempoOutput {
            confidence: Q16::from_fraction(self.confidence),
            silence: Q16::from_fraction(self.silence_level),
            ..TempoOutput::default()
        };

        // Light work first so a heavy update sees the phase of the newest frame.
        let wrapped = if self.has_lock {
            self.slew_period();
            self.advance_phase()
        } else {
            false
        };

        let interval = self.config.heavy_interval as u64;
        let heavy_due = !self.has_lock || self.tick % interval == 0;
        if heavy_due && self.tempogram_mix.update(&self.mix) {
            self.tempogram_hm.update(&self.hm);
            if self.is_ready() {
                self.heavy_update();
            }
        }

        if !self.is_ready() || !self.has_lock {
            return out;
        }

        let phase_norm = if self.period > 0.0 {
            (self.phase / self.period).rem_euclid(1.0)
        } else {
            0.0
        };

        out.bpm = Q16::from_f32((60.0 * FRAME_RATE_HZ / self.period).clamp(0.0, MAX_BPM_OUT));
        out.phase = Q16::from_unit(phase_norm);
        out.strength = Q16::from_fraction(self.strength);
        out.confidence = Q16::from_fraction(self.confidence);
        out.ready = true;
        out.beat = wrapped
            && !self.silence
            && self.beat_enabled
            && self.low.max_recent(BEAT_ONSET_LOOKBACK) > SILENCE_FLOOR;
        out
    }

    fn update_silence(&mut self) {
        if self.mix.len() < ENERGY_EVAL_FRAMES {
            self.silence = true;
            self.silence_level = 1.0;
            return;
        }
        let mean = self.mix.mean_recent(ENERGY_EVAL_FRAMES);
        self.silence_level = (1.0 - 5.0 * mean).clamp(0.0, 1.0);
        self.silence = mean < SILENCE_FLOOR;
    }

    fn heavy_update(&mut self) {
        let peaks_mix = self.tempogram_mix.peaks();
        let Some(primary) = peaks_mix.first() else {
            return;
        };
        self.heavy_runs += 1;

        let mut base_period = primary.period;
        if let Some(hm_peak) = self.tempogram_hm.peaks().first() {
            if self.tempogram_mix.height_at(hm_peak.period) >= HM_PREFERENCE * primary.height {
                base_period = hm_peak.period;
            }
        }
        let base_height = self.tempogram_mix.height_at(base_period);
        if let Some(shorter) = peaks_mix
            .as_slice()
            .iter()
            .filter(|p| {
                p.period < base_period - 1.0
                    && is_harmonic(p.period, base_period)
                    && p.height >= SUBHARMONIC_PREFERENCE * base_height
            })
            .map(|p| p.period)
            .min_by(|a, b| a.total_cmp(b))
        {
            base_period = shorter;
        }
        let base_period = base_period.clamp(self.min_period, self.max_period);

        let mut candidates = [LaneCandidate::new(Lane::Same, base_period, 0.0, 0.0, 0.0, 0.0, 0.0); 4];
        for (slot, &lane) in candidates.iter_mut().zip(Lane::ALL.iter()) {
            let period = (base_period * lane.period_multiplier()).clamp(self.min_period, self.max_period);
            let height = self.tempogram_mix.height_at(period);
            let low = grid_alignment(&self.low, period, PHASE_EVAL_FRAMES);
            let hm = grid_alignment(&self.hm, period, PHASE_EVAL_FRAMES);
            let mix = grid_alignment(&self.mix, period, PHASE_EVAL_FRAMES);
            *slot = LaneCandidate::new(
                lane,
                period,
                60.0 * FRAME_RATE_HZ / period,
                prominence(height, peaks_mix.unrelated_runner_up(period)),
                low.score,
                hm.score,
                mix.offset,
            );
        }

        let previous = self.arbiter.current();
        let lane = self.arbiter.select(&candidates, self.config.heavy_interval);
        let chosen = candidates[lane.index()];
        if lane != previous {
            debug!(
                "Tempo lane {} -> {} ({:.1} BPM, score {:.2})",
                previous.name(),
                lane.name(),
                chosen.bpm,
                chosen.score
            );
        }

        self.target_period = chosen.period;
        self.grid_offset = chosen.grid_offset;
        self.strength = chosen.score.clamp(0.0, 1.0);

        if !self.has_lock {
            self.period = self.target_period;
            self.phase = self.grid_offset;
            self.has_lock = true;
            info!("Tempo locked at {:.1} BPM", chosen.bpm);
        } else {
            self.correct_phase();
        }

        self.confidence += CONFIDENCE_ALPHA * (self.strength - self.confidence);
        if self.confidence >= CONFIDENCE_ON {
            if !self.beat_enabled {
                debug!("Beat output enabled (confidence {:.2})", self.confidence);
            }
            self.beat_enabled = true;
        } else if self.confidence <= CONFIDENCE_OFF {
            if self.beat_enabled {
                debug!("Beat output disabled (confidence {:.2})", self.confidence);
            }
            self.beat_enabled = false;
        }
    }

    /// Pulls the phase toward the observed grid. While beats are not yet
    /// enabled, or after a second of persistent disagreement, the phase is
    /// re-acquired outright.
    fn correct_phase(&mut self) {
        let period = self.period;
        if period <= 0.0 {
            return;
        }
        let mut error = (self.grid_offset - self.phase).rem_euclid(period);
        if error >= 0.5 * period {
            error -= period;
        }

        let reacquire_after = (FRAME_RATE_HZ / self.config.heavy_interval as f32) as u32;
        if error.abs() <= BEAT_WINDOW_FRACTION * period {
            self.unlocked_updates = 0;
            let limit = PLL_MAX_NUDGE * period;
            self.phase += (PLL_KAPPA * error).clamp(-limit, limit);
        } else if !self.beat_enabled || self.unlocked_updates >= reacquire_after {
            self.unlocked_updates = 0;
            self.phase = self.grid_offset;
        } else {
            self.unlocked_updates += 1;
        }
        self.phase = self.phase.rem_euclid(period);
    }

    fn slew_period(&mut self) {
        if self.period <= 0.0 {
            self.period = self.target_period;
            return;
        }
        let max_step = self.period * MAX_PERIOD_SLEW_PER_SEC / FRAME_RATE_HZ;
        let delta = (self.target_period - self.period).clamp(-max_step, max_step);
        self.period = (self.period + delta).clamp(self.min_period, self.max_period);
    }

    /// Advances one frame; true when a beat boundary was crossed.
    fn advance_phase(&mut self) -> bool {
        if self.period <= 0.0 {
            return false;
        }
        self.phase += 1.0;
        let mut wrapped = false;
        while self.phase >= self.period {
            self.phase -= self.period;
            wrapped = true;
        }
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impulse(frame: usize, period: usize) -> [f32; ONSET_BANDS] {
        if frame % period == 0 {
            [1.0; ONSET_BANDS]
        } else {
            [0.0; ONSET_BANDS]
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(TempoConfig::default().validate().is_ok());
        let bad = TempoConfig {
            min_bpm: 150.0,
            max_bpm: 100.0,
            ..TempoConfig::default()
        };
        assert!(TempoEngine::new(bad).is_err());
        let bad = TempoConfig {
            heavy_interval: 0,
            ..TempoConfig::default()
        };
        assert!(bad.validate().is_err());

        let cfg = TempoConfig::default();
        assert_eq!(cfg.min_period_frames(), 42);
        assert_eq!(cfg.max_period_frames(), 94);
    }

    #[test]
    fn test_not_ready_until_history_fills() {
        let mut engine = TempoEngine::new(TempoConfig::default()).unwrap();
        for frame in 0..HISTORY_FRAMES - 1 {
            engine.ingest_onsets(impulse(frame, 60));
            let out = engine.update();
            assert!(!out.ready);
            assert_eq!(out.bpm, Q16::ZERO);
            assert!(!out.beat);
        }
        engine.ingest_onsets(impulse(HISTORY_FRAMES - 1, 60));
        assert!(engine.is_ready());
        assert!(engine.update().ready);
    }

    #[test]
    fn test_impulse_train_converges() {
        let mut engine = TempoEngine::new(TempoConfig::default()).unwrap();
        let mut last = TempoOutput::default();
        let mut beats = 0;
        for frame in 0..HISTORY_FRAMES + 5 * 125 {
            engine.ingest_onsets(impulse(frame, 60));
            last = engine.update();
            if frame > HISTORY_FRAMES + 3 * 125 && last.beat {
                beats += 1;
                assert_eq!(frame % 60, 0, "beat off the grid at frame {}", frame);
            }
        }
        let bpm = last.bpm.to_f32();
        assert!((bpm - 125.0).abs() <= 2.0, "bpm {}", bpm);
        assert!(last.confidence.to_f32() > CONFIDENCE_ON);
        assert!(engine.beat_enabled());
        assert!(beats >= 2);
    }

    #[test]
    fn test_impulse_trains_across_the_tempo_window() {
        let config = TempoConfig::default();
        for period in config.min_period_frames()..=config.max_period_frames() {
            let mut engine = TempoEngine::new(config).unwrap();
            let mut last = TempoOutput::default();
            for frame in 0..HISTORY_FRAMES + 2 * 125 {
                engine.ingest_onsets(impulse(frame, period));
                last = engine.update();
            }
            let expected = 60.0 * FRAME_RATE_HZ / period as f32;
            let bpm = last.bpm.to_f32();
            let confidence = last.confidence.to_f32();
            assert!(last.ready, "period {} never locked", period);
            assert!(
                (bpm - expected).abs() <= 2.0,
                "period {}: bpm {} expected {}",
                period,
                bpm,
                expected
            );
            assert!(
                confidence > CONFIDENCE_ON,
                "period {}: confidence {}",
                period,
                confidence
            );
        }
    }

    #[test]
    fn test_period_stays_in_bounds_for_noise() {
        let mut engine = TempoEngine::new(TempoConfig::default()).unwrap();
        let mut state: u32 = 0x1234_5678;
        for _ in 0..HISTORY_FRAMES + 500 {
            let mut onsets = [0.0; ONSET_BANDS];
            for o in onsets.iter_mut() {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                *o = (state % 1000) as f32 / 1000.0;
            }
            engine.ingest_onsets(onsets);
            let out = engine.update();
            if out.ready {
                let p = engine.period_frames();
                assert!((42.0..=94.0).contains(&p), "period {}", p);
            }
        }
    }

    #[test]
    fn test_silence_suppresses_beats() {
        let mut engine = TempoEngine::new(TempoConfig::default()).unwrap();
        for frame in 0..HISTORY_FRAMES + 3 * 125 {
            engine.ingest_onsets(impulse(frame, 60));
            engine.update();
        }
        assert!(engine.beat_enabled());

        for frame in 0..4 * 125 {
            engine.ingest_onsets([0.0; ONSET_BANDS]);
            let out = engine.update();
            if frame >= 125 {
                assert!(!out.beat);
                assert_eq!(out.silence, Q16::ONE);
            }
        }
        assert!(engine.is_silent());
    }

    #[test]
    fn test_zero_audio_is_silent() {
        let mut engine = TempoEngine::new(TempoConfig::default()).unwrap();
        let chunk = [0i32; crate::audio::CHUNK_SIZE];
        for _ in 0..HISTORY_FRAMES + 10 {
            engine.ingest(&chunk);
            let out = engine.update();
            assert!(!out.beat);
            assert_eq!(out.silence, Q16::ONE);
        }
        assert!(engine.is_ready());
        assert!(engine.is_silent());
    }
}
