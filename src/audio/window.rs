use serde::{Deserialize, Serialize};

use super::fixed::Q15;
use super::CHUNK_SIZE;

/// Analysis window applied to each capture chunk before the resonator bank.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WindowKind {
    Hann,
    /// Gaussian with `sigma` relative to the half-length (0.4 is a good default).
    Gaussian { sigma: f32 },
}

impl Default for WindowKind {
    fn default() -> Self {
        WindowKind::Hann
    }
}

/// Precomputed Q1.15 window table sized to one chunk.
#[derive(Debug, Clone)]
pub struct Window {
    kind: WindowKind,
    coeffs: [Q15; CHUNK_SIZE],
}

impl Window {
    pub fn new(kind: WindowKind) -> Self {
        let n = CHUNK_SIZE as f32;
        let mut coeffs = [Q15::ZERO; CHUNK_SIZE];

        match kind {
            WindowKind::Hann => {
                let denom = (n - 1.0).max(1.0);
                for (i, c) in coeffs.iter_mut().enumerate() {
                    let w = 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / denom).cos();
                    *c = Q15::from_f32(w);
                }
            }
            WindowKind::Gaussian { sigma } => {
                let sigma = if sigma > 0.0 { sigma } else { 0.4 };
                let half = (n - 1.0) * 0.5;
                for (i, c) in coeffs.iter_mut().enumerate() {
                    let t = (i as f32 - half) / (sigma * half);
                    *c = Q15::from_f32((-0.5 * t * t).exp());
                }
            }
        }

        Self { kind, coeffs }
    }

    pub fn kind(&self) -> WindowKind {
        self.kind
    }

    pub fn coeffs(&self) -> &[Q15; CHUNK_SIZE] {
        &self.coeffs
    }

    /// Window value as a float gain in `[0, 1]`.
    pub fn gain(&self, index: usize) -> f32 {
        self.coeffs[index].to_f32()
    }

    pub fn mean(&self) -> f32 {
        self.coeffs.iter().map(|c| c.to_f32()).sum::<f32>() / CHUNK_SIZE as f32
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::new(WindowKind::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hann_shape() {
        let w = Window::new(WindowKind::Hann);
        assert_eq!(w.coeffs()[0], Q15::ZERO);
        assert_eq!(w.coeffs()[CHUNK_SIZE - 1], Q15::ZERO);
        assert!(w.gain(CHUNK_SIZE / 2) > 0.99);
        assert!((w.mean() - 0.496).abs() < 0.01);
    }

    #[test]
    fn test_gaussian_is_symmetric_and_peaks_in_the_middle() {
        let w = Window::new(WindowKind::Gaussian { sigma: 0.4 });
        for i in 0..CHUNK_SIZE / 2 {
            assert_eq!(w.coeffs()[i], w.coeffs()[CHUNK_SIZE - 1 - i]);
        }
        assert!(w.gain(63) > 0.99);
        assert!(w.gain(0) < 0.05);
    }

    #[test]
    fn test_gaussian_falls_back_on_bad_sigma() {
        let bad = Window::new(WindowKind::Gaussian { sigma: -1.0 });
        let good = Window::new(WindowKind::Gaussian { sigma: 0.4 });
        assert_eq!(bad.coeffs(), good.coeffs());
    }
}
