use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::audio::fixed::Q24_FULL_SCALE;
use crate::audio::{CHUNK_SIZE, SAMPLE_RATE};

pub const FFT_SIZE: usize = 512;
pub const FFT_BINS: usize = FFT_SIZE / 2 + 1;
pub const ONSET_BANDS: usize = 4;

/// Onset band edges in Hz: sub/kick, low-mid, mid/presence, high.
pub const BAND_EDGES_HZ: [f32; ONSET_BANDS + 1] = [40.0, 160.0, 640.0, 2500.0, 6000.0];
/// Median baseline depth per band.
pub const MEDIAN_WINDOWS: [usize; ONSET_BANDS] = [6, 5, 3, 3];
pub const MAX_MEDIAN_WINDOW: usize = 8;

/// Short-time spectral flux front-end of the tempo engine.
///
/// Keeps a 512-sample sliding window advanced by one chunk per call and
/// reports, per onset band, the summed positive magnitude change against the
/// previous spectrum. Magnitudes are raw FFT magnitudes of the windowed
/// full-scale signal (a full-scale sine at a bin centre reads about 128), the
/// scale the silence gate and novelty floor are set for.
pub struct OnsetDetector {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    ring: Vec<f32>,
    head: usize,
    samples_seen: usize,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    prev_mag: Vec<f32>,
    has_prev: bool,
    /// Inclusive bin ranges; a bin on a shared edge belongs to the lower band.
    band_bins: [(usize, usize); ONSET_BANDS],
}

impl OnsetDetector {
    pub fn new() -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        let scratch_len = fft.get_inplace_scratch_len();

        let window = Self::hann_window(FFT_SIZE);

        Self {
            fft,
            window,
            ring: vec![0.0; FFT_SIZE],
            head: 0,
            samples_seen: 0,
            buffer: vec![Complex::new(0.0, 0.0); FFT_SIZE],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            prev_mag: vec![0.0; FFT_BINS],
            has_prev: false,
            band_bins: Self::compute_band_bins(),
        }
    }

    fn hann_window(size: usize) -> Vec<f32> {
        (0..size)
            .map(|i| {
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos())
            })
            .collect()
    }

    fn compute_band_bins() -> [(usize, usize); ONSET_BANDS] {
        let bin_hz = SAMPLE_RATE as f32 / FFT_SIZE as f32;
        let nyquist = SAMPLE_RATE as f32 * 0.5;
        let mut bins = [(0, 0); ONSET_BANDS];
        for (b, range) in bins.iter_mut().enumerate() {
            let lo = BAND_EDGES_HZ[b];
            let hi = BAND_EDGES_HZ[b + 1].min(nyquist);
            let start = ((lo / bin_hz + 0.5).floor() as usize).max(1);
            let end = ((hi / bin_hz + 0.5).floor() as usize).min(FFT_BINS - 1).max(start);
            *range = (start, end);
        }
        bins
    }

    pub fn band_bins(&self) -> &[(usize, usize); ONSET_BANDS] {
        &self.band_bins
    }

    /// True once a full analysis window has been collected.
    pub fn is_primed(&self) -> bool {
        self.samples_seen >= FFT_SIZE
    }

    pub fn reset(&mut self) {
        self.ring.iter_mut().for_each(|s| *s = 0.0);
        self.prev_mag.iter_mut().for_each(|m| *m = 0.0);
        self.head = 0;
        self.samples_seen = 0;
        self.has_prev = false;
    }

    /// Pushes one chunk and returns the per-band positive flux. Returns zeros
    /// while the window is still filling and on the first full window.
    pub fn process(&mut self, chunk: &[i32]) -> [f32; ONSET_BANDS] {
        for &sample in chunk.iter().take(CHUNK_SIZE) {
            self.ring[self.head] = sample as f32 / Q24_FULL_SCALE as f32;
            self.head = (self.head + 1) % FFT_SIZE;
            self.samples_seen = self.samples_seen.saturating_add(1);
        }

        let mut flux = [0.0f32; ONSET_BANDS];
        if !self.is_primed() {
            return flux;
        }

        // Oldest sample sits at `head` once the ring has wrapped.
        let mut idx = self.head;
        for n in 0..FFT_SIZE {
            self.buffer[n] = Complex::new(self.ring[idx] * self.window[n], 0.0);
            idx = (idx + 1) % FFT_SIZE;
        }
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        for bin in 1..FFT_BINS {
            let mag = self.buffer[bin].norm();
            let diff = mag - self.prev_mag[bin];
            self.prev_mag[bin] = mag;
            if !self.has_prev || diff <= 0.0 {
                continue;
            }
            if let Some(band) = self
                .band_bins
                .iter()
                .position(|&(start, end)| bin >= start && bin <= end)
            {
                flux[band] += diff;
            }
        }
        self.has_prev = true;

        flux
    }
}

impl Default for OnsetDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded ring of recent onset values with a running median baseline.
#[derive(Debug, Clone)]
pub struct BandBaseline {
    history: [f32; MAX_MEDIAN_WINDOW],
    window: usize,
    head: usize,
    count: usize,
}

impl BandBaseline {
    pub fn new(window: usize) -> Self {
        Self {
            history: [0.0; MAX_MEDIAN_WINDOW],
            window: window.clamp(1, MAX_MEDIAN_WINDOW),
            head: 0,
            count: 0,
        }
    }

    pub fn reset(&mut self) {
        self.history = [0.0; MAX_MEDIAN_WINDOW];
        self.head = 0;
        self.count = 0;
    }

    pub fn median(&self) -> f32 {
        if self.count == 0 {
            return 0.0;
        }
        let mut sorted = [0.0f32; MAX_MEDIAN_WINDOW];
        sorted[..self.count].copy_from_slice(&self.history[..self.count]);
        let values = &mut sorted[..self.count];
        values.sort_unstable_by(|a, b| a.total_cmp(b));

        let mid = self.count / 2;
        if self.count % 2 == 1 {
            values[mid]
        } else {
            0.5 * (values[mid - 1] + values[mid])
        }
    }

    /// Records `onset` and returns how far it rises above the median baseline.
    pub fn novelty(&mut self, onset: f32) -> f32 {
        let onset = onset.max(0.0);
        self.history[self.head] = onset;
        self.head = (self.head + 1) % self.window;
        self.count = (self.count + 1).min(self.window);
        (onset - self.median()).max(0.0)
    }
}
