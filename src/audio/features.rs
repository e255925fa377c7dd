//! Per-tick feature extraction on top of the filterbank: pitch-class energy,
//! four-band summary, spectral novelty and level meters.

use super::fixed::{Q16, Q24_FULL_SCALE};
use super::{bin_center_hz, FREQ_BINS, NUM_BANDS, PITCH_CLASSES};

/// Novelty ceiling: 1.25 in linear units.
pub const FLUX_CEILING: Q16 = Q16(81_920);

/// Bin index ranges `[start, end)` of the low, low-mid, presence and high bands.
pub const BAND_RANGES: [(usize, usize); NUM_BANDS] = [(0, 11), (11, 33), (33, 54), (54, 64)];
pub const BAND_NAMES: [&str; NUM_BANDS] = ["Low", "Low-Mid", "Presence", "High"];

/// Nearest equal-tempered pitch class (C = 0) for a frequency.
pub fn pitch_class_of(freq_hz: f32) -> usize {
    if freq_hz <= 0.0 {
        return 0;
    }
    let midi = 12.0 * (freq_hz / 440.0).log2() + 69.0;
    (midi.round() as i32).rem_euclid(12) as usize
}

/// Bin-to-pitch-class lookup built once from the bin table.
#[derive(Debug, Clone)]
pub struct PitchClassMap {
    classes: [u8; FREQ_BINS],
}

impl PitchClassMap {
    pub fn new() -> Self {
        let mut classes = [0u8; FREQ_BINS];
        for (k, c) in classes.iter_mut().enumerate() {
            *c = pitch_class_of(bin_center_hz(k)) as u8;
        }
        Self { classes }
    }

    pub fn class_of_bin(&self, bin: usize) -> usize {
        self.classes[bin] as usize
    }

    pub fn accumulate(&self, raw: &[Q16; FREQ_BINS], chroma: &mut [Q16; PITCH_CLASSES]) {
        *chroma = [Q16::ZERO; PITCH_CLASSES];
        for (k, &value) in raw.iter().enumerate() {
            let pc = self.classes[k] as usize;
            chroma[pc] = chroma[pc].saturating_add(value);
        }
    }
}

impl Default for PitchClassMap {
    fn default() -> Self {
        Self::new()
    }
}

pub fn summarize_bands(smooth: &[Q16; FREQ_BINS], bands: &mut [Q16; NUM_BANDS]) {
    for (band, &(start, end)) in bands.iter_mut().zip(BAND_RANGES.iter()) {
        *band = Q16::saturating_sum(smooth[start..end].iter().copied());
    }
}

/// Lower and upper edge of a band in Hz, from its first and last bin centres.
pub fn band_edges_hz(band: usize) -> Option<(f32, f32)> {
    BAND_RANGES
        .get(band)
        .map(|&(start, end)| (bin_center_hz(start), bin_center_hz(end - 1)))
}

/// Half-wave rectified spectral difference against the previous tick.
#[derive(Debug, Clone)]
pub struct FluxDetector {
    prev: [Q16; FREQ_BINS],
}

impl FluxDetector {
    pub fn new() -> Self {
        Self {
            prev: [Q16::ZERO; FREQ_BINS],
        }
    }

    pub fn reset(&mut self) {
        self.prev = [Q16::ZERO; FREQ_BINS];
    }

    pub fn compute(&mut self, raw: &[Q16; FREQ_BINS]) -> Q16 {
        let mut sum: i64 = 0;
        for (prev, &cur) in self.prev.iter_mut().zip(raw.iter()) {
            let d = cur.raw() as i64 - prev.raw() as i64;
            if d > 0 {
                sum += d;
            }
            *prev = cur;
        }
        Q16(sum.min(FLUX_CEILING.raw() as i64) as i32)
    }
}

impl Default for FluxDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Subtracts the chunk mean in place and returns the removed offset.
pub fn remove_dc(samples: &mut [i32]) -> i32 {
    if samples.is_empty() {
        return 0;
    }
    let mean = samples.iter().map(|&s| s as i64).sum::<i64>() / samples.len() as i64;
    for s in samples.iter_mut() {
        *s = (*s as i64 - mean).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    }
    mean as i32
}

/// Peak |x| relative to full scale, clamped to 1.0.
pub fn peak_level(samples: &[i32]) -> Q16 {
    let peak = samples.iter().map(|&s| s.unsigned_abs()).max().unwrap_or(0);
    Q16::from_fraction(peak as f32 / Q24_FULL_SCALE as f32)
}

/// RMS after mean removal relative to full scale, clamped to 1.0.
pub fn rms_level(samples: &[i32]) -> Q16 {
    if samples.is_empty() {
        return Q16::ZERO;
    }
    let n = samples.len() as f64;
    let (sum, sq) = samples.iter().fold((0.0f64, 0.0f64), |(sum, sq), &s| {
        let v = s as f64;
        (sum + v, sq + v * v)
    });
    let mean = sum / n;
    let var = (sq / n - mean * mean).max(0.0);
    Q16::from_fraction((var.sqrt() / Q24_FULL_SCALE as f64) as f32)
}
