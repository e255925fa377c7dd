use serde::{Deserialize, Serialize};

use super::fixed::Q16;
use super::{bin_centers, FRAME_RATE_HZ, FREQ_BINS};

const MIN_CORNER_HZ: f32 = 0.1;
const MAX_CORNER_HZ: f32 = 60.0;

/// Settings for the perceptual post-processor. Out-of-range values are
/// clamped when applied, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerceptualConfig {
    pub attack_hz: f32,
    pub release_hz: f32,
    pub knee: f32,
    pub floor_tc_s: f32,
}

impl Default for PerceptualConfig {
    fn default() -> Self {
        Self {
            attack_hz: 35.0,
            release_hz: 8.0,
            knee: 0.65,
            floor_tc_s: 2.5,
        }
    }
}

impl PerceptualConfig {
    pub fn clamped(self) -> Self {
        Self {
            attack_hz: sanitize(self.attack_hz, 35.0).clamp(MIN_CORNER_HZ, MAX_CORNER_HZ),
            release_hz: sanitize(self.release_hz, 8.0).clamp(MIN_CORNER_HZ, MAX_CORNER_HZ),
            knee: sanitize(self.knee, 0.65).clamp(0.1, 0.95),
            floor_tc_s: sanitize(self.floor_tc_s, 2.5).clamp(0.5, 10.0),
        }
    }
}

fn sanitize(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// IEC 61672 A-weighting curve as a linear gain (about 1.0 at 1 kHz).
pub fn a_weight(freq_hz: f32) -> f32 {
    if freq_hz <= 0.0 {
        return 0.0;
    }
    let f2 = (freq_hz as f64).powi(2);
    let num = 12200.0f64.powi(2) * f2 * f2;
    let den = (f2 + 20.6f64.powi(2))
        * ((f2 + 107.7f64.powi(2)) * (f2 + 737.9f64.powi(2))).sqrt()
        * (f2 + 12200.0f64.powi(2));
    let ra = num / (den + 1e-30);
    let db = 2.0 + 20.0 * (ra + 1e-30).log10();
    let lin = 10f64.powf(db / 20.0);
    if lin.is_finite() && lin > 0.0 {
        lin as f32
    } else {
        0.0
    }
}

/// Per-bin perceptual shaping: A-weighting, adaptive noise floor, soft-knee
/// compression and attack/release smoothing.
pub struct PerceptualProcessor {
    config: PerceptualConfig,
    weights: [f32; FREQ_BINS],
    floor: [f32; FREQ_BINS],
    env: [f32; FREQ_BINS],
    scratch: [f32; FREQ_BINS],
    attack_alpha: f32,
    release_alpha: f32,
    floor_alpha: f32,
    knee_c: f32,
}

impl PerceptualProcessor {
    pub fn new(config: PerceptualConfig) -> Self {
        let mut weights = [0.0; FREQ_BINS];
        for (w, f) in weights.iter_mut().zip(bin_centers().iter()) {
            *w = a_weight(*f);
        }

        let mut processor = Self {
            config: PerceptualConfig::default(),
            weights,
            floor: [0.0; FREQ_BINS],
            env: [0.0; FREQ_BINS],
            scratch: [0.0; FREQ_BINS],
            attack_alpha: 0.0,
            release_alpha: 0.0,
            floor_alpha: 0.0,
            knee_c: 0.0,
        };
        processor.configure(config);
        processor
    }

    pub fn configure(&mut self, config: PerceptualConfig) {
        let config = config.clamped();
        self.set_attack_release(config.attack_hz, config.release_hz);
        self.set_knee(config.knee);
        self.set_floor_tc(config.floor_tc_s);
    }

    pub fn config(&self) -> PerceptualConfig {
        self.config
    }

    pub fn set_attack_release(&mut self, attack_hz: f32, release_hz: f32) {
        let attack = sanitize(attack_hz, 35.0).clamp(MIN_CORNER_HZ, MAX_CORNER_HZ);
        let release = sanitize(release_hz, 8.0).clamp(MIN_CORNER_HZ, MAX_CORNER_HZ);
        self.attack_alpha = corner_alpha(attack);
        self.release_alpha = corner_alpha(release);
        self.config.attack_hz = attack;
        self.config.release_hz = release;
    }

    pub fn set_knee(&mut self, knee: f32) {
        let knee = sanitize(knee, 0.65).clamp(0.1, 0.95);
        self.knee_c = (1.0 - knee) / (knee + 1e-6);
        self.config.knee = knee;
    }

    pub fn set_floor_tc(&mut self, tc_s: f32) {
        let tc = sanitize(tc_s, 2.5).clamp(0.5, 10.0);
        self.floor_alpha = 1.0 - (-1.0 / (tc * FRAME_RATE_HZ)).exp();
        self.config.floor_tc_s = tc;
    }

    pub fn reset(&mut self) {
        self.floor = [0.0; FREQ_BINS];
        self.env = [0.0; FREQ_BINS];
    }

    pub fn noise_floor(&self) -> &[f32; FREQ_BINS] {
        &self.floor
    }

    pub fn process(&mut self, bins: &[Q16; FREQ_BINS], out: &mut [Q16; FREQ_BINS]) {
        for k in 0..FREQ_BINS {
            let x = bins[k].to_f32().max(0.0) * self.weights[k];
            self.floor[k] += self.floor_alpha * (x - self.floor[k]);
            let above = (x - self.floor[k]).max(0.0);
            self.scratch[k] = above / (above + self.knee_c + 1e-9);
        }

        for k in 0..FREQ_BINS {
            let x = self.scratch[k];
            let alpha = if x > self.env[k] {
                self.attack_alpha
            } else {
                self.release_alpha
            };
            self.env[k] += alpha * (x - self.env[k]);
            out[k] = Q16::from_unit(self.env[k]);
        }
    }
}

impl Default for PerceptualProcessor {
    fn default() -> Self {
        Self::new(PerceptualConfig::default())
    }
}

/// Plain per-bin exponential average with a Q16 coefficient.
#[derive(Debug, Clone)]
pub struct EmaSmoother {
    alpha_q16: u32,
    state: [Q16; FREQ_BINS],
}

impl EmaSmoother {
    pub fn new(alpha_q16: u32) -> Self {
        Self {
            alpha_q16: alpha_q16.min(0xFFFF),
            state: [Q16::ZERO; FREQ_BINS],
        }
    }

    pub fn alpha_q16(&self) -> u32 {
        self.alpha_q16
    }

    pub fn set_alpha_q16(&mut self, alpha_q16: u32) {
        self.alpha_q16 = alpha_q16.min(0xFFFF);
    }

    pub fn reset(&mut self) {
        self.state = [Q16::ZERO; FREQ_BINS];
    }

    pub fn process(&mut self, bins: &[Q16; FREQ_BINS], out: &mut [Q16; FREQ_BINS]) {
        let alpha = self.alpha_q16 as i64;
        for ((state, &x), o) in self.state.iter_mut().zip(bins.iter()).zip(out.iter_mut()) {
            let delta = x.raw() as i64 - state.raw() as i64;
            let next = state.raw() as i64 + ((delta * alpha) >> 16);
            *state = Q16::from_raw(next.clamp(0, Q16::UNIT_MAX.raw() as i64) as i32);
            *o = *state;
        }
    }
}

fn corner_alpha(corner_hz: f32) -> f32 {
    1.0 - (-2.0 * std::f32::consts::PI * corner_hz / FRAME_RATE_HZ).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_a_weight_reference_points() {
        assert!((a_weight(1000.0) - 1.0).abs() < 0.02);
        assert!(a_weight(110.0) < 0.2);
        assert_eq!(a_weight(0.0), 0.0);
    }

    #[test]
    fn test_zero_input_drives_output_to_zero() {
        let mut p = PerceptualProcessor::default();
        let mut out = [Q16::ZERO; FREQ_BINS];

        let loud = [Q16::from_f32(0.5); FREQ_BINS];
        for _ in 0..20 {
            p.process(&loud, &mut out);
        }
        assert!(out.iter().any(|&b| b > Q16::ZERO));

        let silent = [Q16::ZERO; FREQ_BINS];
        for _ in 0..3000 {
            p.process(&silent, &mut out);
        }
        assert!(out.iter().all(|&b| b == Q16::ZERO));
        assert!(p.noise_floor().iter().all(|&f| f < 1.0e-4));
    }

    #[test]
    fn test_steady_tone_is_absorbed_by_the_floor() {
        let mut p = PerceptualProcessor::default();
        let mut out = [Q16::ZERO; FREQ_BINS];
        let mut bins = [Q16::ZERO; FREQ_BINS];
        bins[40] = Q16::from_f32(0.6);

        let mut early = 0.0f32;
        for i in 0..3000 {
            p.process(&bins, &mut out);
            if i == 10 {
                early = out[40].to_f32();
            }
        }
        assert!(early > 0.1);
        assert!(out[40].to_f32() < early * 0.1);
    }

    #[test]
    fn test_ema_smoother_converges() {
        let mut ema = EmaSmoother::new(6553);
        let mut out = [Q16::ZERO; FREQ_BINS];
        let bins = [Q16::from_f32(0.5); FREQ_BINS];
        ema.process(&bins, &mut out);
        assert!((out[0].to_f32() - 0.05).abs() < 0.001);
        for _ in 0..200 {
            ema.process(&bins, &mut out);
        }
        assert!((out[10].to_f32() - 0.5).abs() < 0.001);
        ema.reset();
        ema.process(&[Q16::ZERO; FREQ_BINS], &mut out);
        assert!(out.iter().all(|&b| b == Q16::ZERO));
    }

    #[test]
    fn test_settings_are_clamped() {
        let mut p = PerceptualProcessor::default();
        p.set_knee(5.0);
        p.set_floor_tc(0.0);
        p.set_attack_release(-3.0, 1000.0);
        let c = p.config();
        assert_eq!(c.knee, 0.95);
        assert_eq!(c.floor_tc_s, 0.5);
        assert_eq!(c.attack_hz, MIN_CORNER_HZ);
        assert_eq!(c.release_hz, MAX_CORNER_HZ);
    }
}
