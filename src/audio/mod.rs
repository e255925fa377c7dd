pub mod bus;
pub mod diagnostics;
pub mod downbeat;
pub mod engine;
pub mod features;
pub mod filterbank;
pub mod fixed;
pub mod params;
pub mod perceptual;
pub mod producer;
pub mod tempo;
pub mod window;

pub use bus::{FrameBus, FramePublisher, FrameReader};
pub use downbeat::{DownbeatConfig, DownbeatEstimator, DownbeatOutput};
pub use engine::{AudioEngine, CaptureChunk};
pub use fixed::{Q15, Q16};
pub use params::{AudioParams, Tunables};
pub use producer::{AudioProducer, ProducerConfig, SpectralSmoothing};
pub use tempo::{TempoConfig, TempoEngine, TempoOutput};

use bytemuck::{Pod, Zeroable};

pub const SAMPLE_RATE: u32 = 16_000;
pub const CHUNK_SIZE: usize = 128;
pub const FREQ_BINS: usize = 64;
pub const PITCH_CLASSES: usize = 12;
pub const NUM_BANDS: usize = 4;

/// Producer ticks per second (one tick per chunk).
pub const FRAME_RATE_HZ: f32 = SAMPLE_RATE as f32 / CHUNK_SIZE as f32;
/// Wall-clock budget of one tick in microseconds.
pub const TICK_BUDGET_US: u64 = (CHUNK_SIZE as u64 * 1_000_000) / SAMPLE_RATE as u64;

/// Lowest resonator centre (A2); each following bin is one semitone higher.
pub const BASE_FREQ_HZ: f32 = 110.0;

/// Semitone-spaced bin centres, A2 (110 Hz) up to C8 (~4186 Hz).
pub fn bin_center_hz(bin: usize) -> f32 {
    BASE_FREQ_HZ * 2f32.powf(bin as f32 / 12.0)
}

pub fn bin_centers() -> [f32; FREQ_BINS] {
    let mut centers = [0.0; FREQ_BINS];
    for (k, c) in centers.iter_mut().enumerate() {
        *c = bin_center_hz(k);
    }
    centers
}

/// One tick's worth of analysis, published to consumers through the frame bus.
///
/// The layout is plain data with no padding so the bus can move it as raw words.
/// Magnitudes are linear and clamped; tempo fields only carry meaning while
/// `tempo_ready` is set.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AudioFrame {
    /// Incremented on every publish. Zero means nothing has been published yet.
    pub epoch: u32,
    pub t_ms: u32,

    pub waveform: [Q15; CHUNK_SIZE],
    pub vu_peak: Q16,
    pub vu_rms: Q16,

    pub raw_spectral: [Q16; FREQ_BINS],
    pub smooth_spectral: [Q16; FREQ_BINS],
    pub chroma: [Q16; PITCH_CLASSES],
    pub bands: [Q16; NUM_BANDS],
    pub flux: Q16,

    pub tempo_bpm: Q16,
    pub beat_phase: Q16,
    pub beat_strength: Q16,
    pub tempo_confidence: Q16,
    pub tempo_silence: Q16,
    pub beat_flag: u8,
    pub tempo_ready: u8,
    pub _pad: [u8; 2],
}

impl AudioFrame {
    pub fn is_tempo_ready(&self) -> bool {
        self.tempo_ready != 0
    }

    pub fn is_beat(&self) -> bool {
        self.beat_flag != 0
    }

    pub fn bpm(&self) -> f32 {
        self.tempo_bpm.to_f32()
    }
}

impl Default for AudioFrame {
    fn default() -> Self {
        Zeroable::zeroed()
    }
}

const _: () = assert!(std::mem::size_of::<AudioFrame>() % 4 == 0);
