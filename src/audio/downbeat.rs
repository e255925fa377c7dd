use log::debug;
use serde::{Deserialize, Serialize};

use super::fixed::Q16;
use super::AudioFrame;

pub const MAX_BEATS_PER_BAR: usize = 8;
/// Bars of per-beat energy kept for the downbeat vote.
const BAR_HISTORY: usize = 8;
const BAR_FORGETTING: f32 = 0.85;

const ARM_SILENCE_BELOW: f32 = 0.7;
const DISARM_SILENCE_AT: f32 = 0.9;
/// Linear low-band level mapping to half scale in the energy blend.
const LOW_BAND_KNEE: f32 = 3.8;

const IDLE_BAR_DECAY: f32 = 0.95;
const IDLE_HISTORY_DECAY: f32 = 0.97;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DownbeatConfig {
    pub beats_per_bar: u8,
    pub conf_on: f32,
    pub conf_off: f32,
    /// Accent envelope multiplier applied every tick.
    pub env_decay: f32,
}

impl Default for DownbeatConfig {
    fn default() -> Self {
        Self {
            beats_per_bar: 4,
            conf_on: 0.60,
            conf_off: 0.42,
            env_decay: 0.92,
        }
    }
}

impl DownbeatConfig {
    /// Brings every field into its safe range; bad bar lengths fall back to 4.
    pub fn clamped(self) -> Self {
        let beats_per_bar = if (1..=MAX_BEATS_PER_BAR as u8).contains(&self.beats_per_bar) {
            self.beats_per_bar
        } else {
            4
        };
        let (conf_on, conf_off) = clamp_thresholds(self.conf_on, self.conf_off);
        Self {
            beats_per_bar,
            conf_on,
            conf_off,
            env_decay: clamp_decay(self.env_decay),
        }
    }
}

fn clamp_thresholds(on: f32, off: f32) -> (f32, f32) {
    let on = if on.is_finite() { on.clamp(0.1, 0.95) } else { 0.60 };
    let off = if off.is_finite() { off.max(0.0) } else { 0.42 };
    (on, off.min(on - 0.05))
}

/// Per-beat energy: beat strength blended with a soft-compressed low band.
fn beat_energy(strength: f32, low_band: f32) -> f32 {
    let low = low_band.abs();
    (0.6 * strength + 0.4 * low / (low + LOW_BAND_KNEE)).clamp(0.0, 1.0)
}

fn clamp_decay(decay: f32) -> f32 {
    if decay.is_finite() {
        decay.clamp(0.80, 0.99)
    } else {
        0.92
    }
}

/// Per-tick downbeat signals.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DownbeatOutput {
    /// Set only on the tick whose beat is the estimated downbeat.
    pub downbeat: bool,
    /// Beat within the bar, counted from the downbeat.
    pub beat_in_bar: u8,
    /// Estimated downbeat position in the free-running beat counter.
    pub downbeat_index: u8,
    pub bar_phase: Q16,
    pub accent: f32,
    pub armed: bool,
}

/// Finds the strongest recurring beat position in the bar and marks it as the
/// downbeat. Consumes tempo and band fields of each frame.
pub struct DownbeatEstimator {
    config: DownbeatConfig,
    armed: bool,
    /// Position of the next expected beat, `0..beats_per_bar`.
    next_beat: usize,
    downbeat_index: usize,
    bar_energy: [f32; MAX_BEATS_PER_BAR],
    history: [[f32; BAR_HISTORY]; MAX_BEATS_PER_BAR],
    bar_head: usize,
    bars_seen: u32,
    accent: f32,
    output: DownbeatOutput,
}

impl DownbeatEstimator {
    pub fn new(config: DownbeatConfig) -> Self {
        Self {
            config: config.clamped(),
            armed: false,
            next_beat: 0,
            downbeat_index: 0,
            bar_energy: [0.0; MAX_BEATS_PER_BAR],
            history: [[0.0; BAR_HISTORY]; MAX_BEATS_PER_BAR],
            bar_head: 0,
            bars_seen: 0,
            accent: 0.0,
            output: DownbeatOutput::default(),
        }
    }

    pub fn config(&self) -> DownbeatConfig {
        self.config
    }

    pub fn set_thresholds(&mut self, on: f32, off: f32) {
        let (on, off) = clamp_thresholds(on, off);
        self.config.conf_on = on;
        self.config.conf_off = off;
    }

    pub fn set_env_decay(&mut self, decay: f32) {
        self.config.env_decay = clamp_decay(decay);
    }

    /// Changes the bar length and forgets the current estimate.
    pub fn set_beats_per_bar(&mut self, beats: u8) {
        let config = DownbeatConfig {
            beats_per_bar: beats,
            ..self.config
        }
        .clamped();
        if config.beats_per_bar != self.config.beats_per_bar {
            self.config = config;
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.armed = false;
        self.next_beat = 0;
        self.downbeat_index = 0;
        self.bar_energy = [0.0; MAX_BEATS_PER_BAR];
        self.history = [[0.0; BAR_HISTORY]; MAX_BEATS_PER_BAR];
        self.bar_head = 0;
        self.bars_seen = 0;
        self.accent = 0.0;
        self.output = DownbeatOutput::default();
    }

    pub fn output(&self) -> DownbeatOutput {
        self.output
    }

    pub fn bars_seen(&self) -> u32 {
        self.bars_seen
    }

    pub fn ingest(&mut self, frame: &AudioFrame) -> DownbeatOutput {
        let bpb = self.config.beats_per_bar as usize;
        let confidence = frame.tempo_confidence.to_f32();
        let silence = frame.tempo_silence.to_f32();

        if !self.armed {
            if confidence >= self.config.conf_on && silence < ARM_SILENCE_BELOW {
                self.armed = true;
                debug!("Downbeat armed (confidence {:.2})", confidence);
            }
        } else if confidence <= self.config.conf_off || silence >= DISARM_SILENCE_AT {
            self.armed = false;
            debug!(
                "Downbeat disarmed (confidence {:.2}, silence {:.2})",
                confidence, silence
            );
        }

        self.accent *= self.config.env_decay;

        let strength = frame.beat_strength.to_f32().clamp(0.0, 1.0);
        let energy = beat_energy(strength, frame.bands[0].to_f32());

        let mut edge = false;
        if frame.is_beat() && self.armed {
            let position = self.next_beat;
            if position == self.downbeat_index {
                edge = true;
                self.accent = self.accent.max((0.75 + 0.25 * strength).min(1.0));
                self.commit_bar();
            } else {
                self.accent = self.accent.max((0.35 + 0.30 * strength).min(1.0));
            }
            self.bar_energy[position] += energy;
            self.next_beat = (position + 1) % bpb;
        }

        if !self.armed {
            for pos in 0..bpb {
                self.bar_energy[pos] *= IDLE_BAR_DECAY;
                for bar in self.history[pos].iter_mut() {
                    *bar *= IDLE_HISTORY_DECAY;
                }
            }
        }

        // The beat we are currently inside is the one before `next_beat`.
        let current = (self.next_beat + bpb - 1) % bpb;
        let beat_in_bar = (current + bpb - self.downbeat_index) % bpb;
        let beat_phase = frame.beat_phase.to_f32().clamp(0.0, 1.0);
        let bar_phase = ((beat_in_bar as f32 + beat_phase) / bpb as f32).rem_euclid(1.0);

        self.output = DownbeatOutput {
            downbeat: edge,
            beat_in_bar: beat_in_bar as u8,
            downbeat_index: self.downbeat_index as u8,
            bar_phase: Q16::from_unit(bar_phase),
            accent: self.accent.clamp(0.0, 1.0),
            armed: self.armed,
        };
        self.output
    }

    /// Rotates the finished bar into history and re-elects the downbeat as the
    /// position with the largest geometrically discounted energy.
    fn commit_bar(&mut self) {
        let bpb = self.config.beats_per_bar as usize;
        for pos in 0..bpb {
            self.history[pos][self.bar_head] = self.bar_energy[pos];
            self.bar_energy[pos] = 0.0;
        }
        self.bar_head = (self.bar_head + 1) % BAR_HISTORY;
        self.bars_seen = self.bars_seen.saturating_add(1);

        let mut best = -1.0f32;
        let mut best_pos = self.downbeat_index;
        for pos in 0..bpb {
            let mut weight = 1.0;
            let mut total = 0.0;
            for age in 0..BAR_HISTORY {
                let idx = (self.bar_head + BAR_HISTORY - 1 - age) % BAR_HISTORY;
                total += weight * self.history[pos][idx];
                weight *= BAR_FORGETTING;
            }
            if total > best {
                best = total;
                best_pos = pos;
            }
        }
        if best_pos != self.downbeat_index {
            debug!("Downbeat moved {} -> {}", self.downbeat_index, best_pos);
        }
        self.downbeat_index = best_pos;
    }
}

impl Default for DownbeatEstimator {
    fn default() -> Self {
        Self::new(DownbeatConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(beat: bool, strength: f32, confidence: f32, silence: f32) -> AudioFrame {
        let mut f = AudioFrame::default();
        f.beat_flag = beat as u8;
        f.beat_strength = Q16::from_fraction(strength);
        f.tempo_confidence = Q16::from_fraction(confidence);
        f.tempo_silence = Q16::from_fraction(silence);
        f
    }

    /// Drives `bars` bars of 4/4 where beat `strong` of each bar is accented,
    /// with a few idle ticks between beats. Returns the beat positions (counted
    /// from the first beat) that raised a downbeat edge.
    fn drive(est: &mut DownbeatEstimator, bars: usize, strong: usize) -> Vec<usize> {
        let mut edges = Vec::new();
        for beat in 0..bars * 4 {
            let strength = if beat % 4 == strong { 0.9 } else { 0.3 };
            if est.ingest(&frame(true, strength, 0.8, 0.1)).downbeat {
                edges.push(beat);
            }
            for _ in 0..5 {
                assert!(!est.ingest(&frame(false, 0.3, 0.8, 0.1)).downbeat);
            }
        }
        edges
    }

    #[test]
    fn test_converges_to_accented_beat() {
        let mut est = DownbeatEstimator::default();
        let edges = drive(&mut est, 6, 0);
        assert_eq!(est.output().downbeat_index, 0);
        assert!(edges.len() >= 5);
        assert!(edges.iter().all(|b| b % 4 == 0));
    }

    #[test]
    fn test_moves_to_a_later_accent() {
        let mut est = DownbeatEstimator::default();
        let edges = drive(&mut est, 8, 2);
        assert_eq!(est.output().downbeat_index, 2);
        let late: Vec<_> = edges.iter().filter(|&&b| b >= 16).collect();
        assert!(!late.is_empty());
        assert!(late.iter().all(|&&b| b % 4 == 2));
    }

    #[test]
    fn test_beat_in_bar_counts_from_downbeat() {
        let mut est = DownbeatEstimator::default();
        drive(&mut est, 4, 0);
        let out = est.ingest(&frame(true, 0.9, 0.8, 0.1));
        assert!(out.downbeat);
        assert_eq!(out.beat_in_bar, 0);
        let out = est.ingest(&frame(true, 0.3, 0.8, 0.1));
        assert_eq!(out.beat_in_bar, 1);
        assert!(out.bar_phase >= Q16::from_f32(0.25));
    }

    #[test]
    fn test_needs_confidence_and_sound_to_arm() {
        let mut est = DownbeatEstimator::default();
        assert!(!est.ingest(&frame(true, 0.9, 0.5, 0.1)).armed);
        assert!(!est.ingest(&frame(true, 0.9, 0.9, 0.8)).armed);
        assert!(est.ingest(&frame(true, 0.9, 0.9, 0.1)).armed);
        // Between the thresholds the armed state holds.
        assert!(est.ingest(&frame(false, 0.9, 0.5, 0.1)).armed);
        assert!(!est.ingest(&frame(false, 0.9, 0.5, 0.95)).armed);
    }

    #[test]
    fn test_beat_energy_blend() {
        assert!((beat_energy(1.0, 0.0) - 0.6).abs() < 1.0e-6);
        // The low band reaches half weight at the knee.
        assert!((beat_energy(0.0, 3.8) - 0.2).abs() < 1.0e-6);
        assert!((beat_energy(0.0, -3.8) - 0.2).abs() < 1.0e-6);
        assert!(beat_energy(1.0, 1.0e6) <= 1.0);
    }

    #[test]
    fn test_accent_decays() {
        let mut est = DownbeatEstimator::default();
        let first = est.ingest(&frame(true, 1.0, 0.9, 0.0));
        assert!(first.downbeat);
        assert!((first.accent - 1.0).abs() < 1.0e-6);
        let next = est.ingest(&frame(false, 1.0, 0.9, 0.0));
        assert!((next.accent - 0.92).abs() < 1.0e-6);
    }

    #[test]
    fn test_settings_are_clamped() {
        let mut est = DownbeatEstimator::default();
        est.set_thresholds(2.0, 1.5);
        est.set_env_decay(0.1);
        let c = est.config();
        assert_eq!(c.conf_on, 0.95);
        assert!((c.conf_off - 0.90).abs() < 1.0e-6);
        assert_eq!(c.env_decay, 0.80);

        est.set_beats_per_bar(0);
        assert_eq!(est.config().beats_per_bar, 4);
        est.set_beats_per_bar(3);
        assert_eq!(est.config().beats_per_bar, 3);
    }
}
