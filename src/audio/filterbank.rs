use anyhow::{anyhow, Result};
use log::debug;

use super::fixed::{Q16, Q24_FULL_SCALE};
use super::window::Window;
use super::{bin_centers, CHUNK_SIZE, FREQ_BINS};

/// Bank of 64 Goertzel resonators tuned to the semitone bin table.
///
/// All trigonometry happens at construction; `compute` streams the chunk once
/// and runs the two-tap recurrence for every bin in lockstep.
pub struct Filterbank {
    window: [f32; CHUNK_SIZE],
    coeff: [f32; FREQ_BINS],
    cos_w: [f32; FREQ_BINS],
    sin_w: [f32; FREQ_BINS],
    norm: f32,
    s1: [f32; FREQ_BINS],
    s2: [f32; FREQ_BINS],
}

impl Filterbank {
    pub fn new(window: &Window, sample_rate: u32) -> Result<Self> {
        Self::with_centers(window, sample_rate, &bin_centers())
    }

    /// Builds a bank for an explicit bin table. Every centre must sit strictly
    /// between 0 Hz and Nyquist.
    pub fn with_centers(
        window: &Window,
        sample_rate: u32,
        centers: &[f32; FREQ_BINS],
    ) -> Result<Self> {
        if sample_rate == 0 {
            return Err(anyhow!("Sample rate must be non-zero"));
        }
        let nyquist = sample_rate as f32 * 0.5;
        if let Some((k, f)) = centers
            .iter()
            .enumerate()
            .find(|(_, &f)| !(f > 0.0 && f < nyquist))
        {
            return Err(anyhow!(
                "Bin {} centre {:.1} Hz is outside (0, {:.1}) Hz",
                k,
                f,
                nyquist
            ));
        }

        let mean = window.mean();
        if mean <= 0.0 {
            return Err(anyhow!("Window has zero mean, cannot normalise filterbank"));
        }
        let norm = 1.0 / (CHUNK_SIZE as f32 * 0.5 * mean);

        let mut gains = [0.0; CHUNK_SIZE];
        for (n, g) in gains.iter_mut().enumerate() {
            *g = window.gain(n);
        }

        let mut coeff = [0.0; FREQ_BINS];
        let mut cos_w = [0.0; FREQ_BINS];
        let mut sin_w = [0.0; FREQ_BINS];
        for k in 0..FREQ_BINS {
            let w = 2.0 * std::f32::consts::PI * centers[k] / sample_rate as f32;
            cos_w[k] = w.cos();
            sin_w[k] = w.sin();
            coeff[k] = 2.0 * cos_w[k];
        }

        debug!(
            "Filterbank ready: {} bins {:.1}..{:.1} Hz, norm {:.5}",
            FREQ_BINS,
            centers[0],
            centers[FREQ_BINS - 1],
            norm
        );

        Ok(Self {
            window: gains,
            coeff,
            cos_w,
            sin_w,
            norm,
            s1: [0.0; FREQ_BINS],
            s2: [0.0; FREQ_BINS],
        })
    }

    /// Computes linear bin magnitudes in `[0, 1)` as Q16.
    ///
    /// Buffers of the wrong size are tolerated: only the common prefix is
    /// processed and remaining outputs are left untouched.
    pub fn compute(&mut self, samples: &[i32], out: &mut [Q16]) {
        self.s1 = [0.0; FREQ_BINS];
        self.s2 = [0.0; FREQ_BINS];

        let n = samples.len().min(CHUNK_SIZE);
        for (i, &sample) in samples[..n].iter().enumerate() {
            let x = sample as f32 / Q24_FULL_SCALE as f32 * self.window[i];
            for k in 0..FREQ_BINS {
                let s0 = x + self.coeff[k] * self.s1[k] - self.s2[k];
                self.s2[k] = self.s1[k];
                self.s1[k] = s0;
            }
        }

        let bins = out.len().min(FREQ_BINS);
        for k in 0..bins {
            let re = self.s1[k] - self.s2[k] * self.cos_w[k];
            let im = self.s2[k] * self.sin_w[k];
            let mag = (re * re + im * im).sqrt();
            out[k] = Q16::from_unit(mag * self.norm);
        }
    }
}
