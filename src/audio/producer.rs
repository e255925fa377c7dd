use std::time::Instant;

use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};

use super::bus::{FrameBus, FramePublisher, FrameReader};
use super::diagnostics::{Telemetry, DEFAULT_REPORT_INTERVAL};
use super::downbeat::{DownbeatConfig, DownbeatEstimator, DownbeatOutput};
use super::features::{peak_level, remove_dc, rms_level, summarize_bands, FluxDetector, PitchClassMap};
use super::filterbank::Filterbank;
use super::fixed::{Q15, Q16};
use super::params::{clamp_smoothing_alpha_q16, Tunables, SMOOTHING_ALPHA_Q16_DEFAULT};
use super::perceptual::{EmaSmoother, PerceptualConfig, PerceptualProcessor};
use super::tempo::{TempoConfig, TempoEngine, TempoOutput};
use super::window::{Window, WindowKind};
use super::{AudioFrame, CHUNK_SIZE, FREQ_BINS, SAMPLE_RATE};

/// How the published smoothed spectrum is derived from the raw bins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpectralSmoothing {
    Perceptual,
    Ema { alpha_q16: u32 },
}

impl Default for SpectralSmoothing {
    fn default() -> Self {
        SpectralSmoothing::Perceptual
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub window: WindowKind,
    pub smoothing: SpectralSmoothing,
    pub perceptual: PerceptualConfig,
    pub tempo: TempoConfig,
    /// `None` leaves the downbeat estimator out of the pipeline.
    pub downbeat: Option<DownbeatConfig>,
    /// Publish the DC-free chunk as an oscilloscope view.
    pub capture_waveform: bool,
    /// Ticks between telemetry reports, 0 to disable them.
    pub report_interval: u32,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            window: WindowKind::default(),
            smoothing: SpectralSmoothing::default(),
            perceptual: PerceptualConfig::default(),
            tempo: TempoConfig::default(),
            downbeat: Some(DownbeatConfig::default()),
            capture_waveform: true,
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }
}

impl ProducerConfig {
    /// Takes every persisted tunable; an EMA smoothing mode picks up the stored alpha.
    pub fn with_tunables(mut self, tunables: &Tunables) -> Self {
        let t = tunables.clamped();
        self.perceptual = t.perceptual;
        self.tempo = t.tempo;
        if self.downbeat.is_some() {
            self.downbeat = Some(t.downbeat);
        }
        if let SpectralSmoothing::Ema { .. } = self.smoothing {
            self.smoothing = SpectralSmoothing::Ema {
                alpha_q16: t.smoothing_alpha_q16,
            };
        }
        self
    }
}

enum Smoother {
    Perceptual(PerceptualProcessor),
    Ema(EmaSmoother),
}

impl Smoother {
    fn new(mode: SpectralSmoothing, perceptual: PerceptualConfig) -> Self {
        match mode {
            SpectralSmoothing::Perceptual => Smoother::Perceptual(PerceptualProcessor::new(perceptual)),
            SpectralSmoothing::Ema { alpha_q16 } => {
                Smoother::Ema(EmaSmoother::new(clamp_smoothing_alpha_q16(alpha_q16)))
            }
        }
    }

    fn process(&mut self, raw: &[Q16; FREQ_BINS], out: &mut [Q16; FREQ_BINS]) {
        match self {
            Smoother::Perceptual(p) => p.process(raw, out),
            Smoother::Ema(e) => e.process(raw, out),
        }
    }

    fn reset(&mut self) {
        match self {
            Smoother::Perceptual(p) => p.reset(),
            Smoother::Ema(e) => e.reset(),
        }
    }
}

/// Runs the whole analysis chain once per chunk and publishes the result.
///
/// All buffers live in the struct; `tick` does not allocate.
pub struct AudioProducer {
    config: ProducerConfig,
    filterbank: Filterbank,
    smoother: Smoother,
    pitch_classes: PitchClassMap,
    flux: FluxDetector,
    tempo: TempoEngine,
    downbeat: Option<DownbeatEstimator>,
    publisher: FramePublisher,

    chunk: [i32; CHUNK_SIZE],
    raw: [Q16; FREQ_BINS],
    smooth: [Q16; FREQ_BINS],
    staging: AudioFrame,
    last_tempo: TempoOutput,
    last_downbeat: DownbeatOutput,
    telemetry: Telemetry,
}

impl AudioProducer {
    pub fn new(config: ProducerConfig, publisher: FramePublisher) -> Result<Self> {
        let window = Window::new(config.window);
        let filterbank = Filterbank::new(&window, SAMPLE_RATE)?;
        let tempo = TempoEngine::new(config.tempo)?;

        info!(
            "Audio producer: {} Hz, {} samples/chunk, {} bins, {:?} window, {:?} smoothing, downbeat {}",
            SAMPLE_RATE,
            CHUNK_SIZE,
            FREQ_BINS,
            config.window,
            config.smoothing,
            if config.downbeat.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            config,
            filterbank,
            smoother: Smoother::new(config.smoothing, config.perceptual),
            pitch_classes: PitchClassMap::new(),
            flux: FluxDetector::new(),
            tempo,
            downbeat: config.downbeat.map(DownbeatEstimator::new),
            publisher,
            chunk: [0; CHUNK_SIZE],
            raw: [Q16::ZERO; FREQ_BINS],
            smooth: [Q16::ZERO; FREQ_BINS],
            staging: AudioFrame::default(),
            last_tempo: TempoOutput::default(),
            last_downbeat: DownbeatOutput::default(),
            telemetry: Telemetry::new(config.report_interval),
        })
    }

    /// Builds a producer on a fresh bus and hands back a reader for it.
    pub fn with_bus(config: ProducerConfig) -> Result<(Self, FrameReader)> {
        let (publisher, reader) = FrameBus::new();
        Ok((Self::new(config, publisher)?, reader))
    }

    /// Analyses one chunk of Q24 samples and publishes the frame. Short input
    /// is zero-padded and extra samples are ignored. Returns the new epoch.
    pub fn tick(&mut self, samples: &[i32], t_ms: u32) -> u32 {
        let started = Instant::now();

        let n = samples.len().min(CHUNK_SIZE);
        self.chunk[..n].copy_from_slice(&samples[..n]);
        self.chunk[n..].iter_mut().for_each(|s| *s = 0);
        remove_dc(&mut self.chunk);

        let frame = &mut self.staging;
        frame.t_ms = t_ms;
        if self.config.capture_waveform {
            for (w, &s) in frame.waveform.iter_mut().zip(self.chunk.iter()) {
                *w = Q15::from_q24(s);
            }
        }
        frame.vu_peak = peak_level(&self.chunk);
        frame.vu_rms = rms_level(&self.chunk);

        self.filterbank.compute(&self.chunk, &mut self.raw);
        self.smoother.process(&self.raw, &mut self.smooth);

        frame.raw_spectral = self.raw;
        frame.smooth_spectral = self.smooth;
        self.pitch_classes.accumulate(&self.raw, &mut frame.chroma);
        summarize_bands(&self.smooth, &mut frame.bands);
        frame.flux = self.flux.compute(&self.raw);

        self.tempo.ingest(&self.chunk);
        let tempo = self.tempo.update();
        frame.tempo_bpm = tempo.bpm;
        frame.beat_phase = tempo.phase;
        frame.beat_strength = tempo.strength;
        frame.tempo_confidence = tempo.confidence;
        frame.tempo_silence = tempo.silence;
        frame.beat_flag = tempo.beat as u8;
        frame.tempo_ready = tempo.ready as u8;
        self.last_tempo = tempo;

        if let Some(downbeat) = self.downbeat.as_mut() {
            self.last_downbeat = downbeat.ingest(frame);
        }

        let epoch = self.publisher.publish(frame);
        frame.epoch = epoch;

        self.telemetry.record(
            started.elapsed().as_micros() as u64,
            frame.flux,
            tempo.bpm.to_f32(),
            tempo.confidence.to_f32(),
        );
        epoch
    }

    /// Pushes runtime tunables into the live pipeline. The tempo range is
    /// fixed at construction and is left alone.
    pub fn apply_tunables(&mut self, tunables: &Tunables) {
        let t = tunables.clamped();
        match &mut self.smoother {
            Smoother::Perceptual(p) => p.configure(t.perceptual),
            Smoother::Ema(e) => e.set_alpha_q16(t.smoothing_alpha_q16),
        }
        self.config.perceptual = t.perceptual;
        if let SpectralSmoothing::Ema { .. } = self.config.smoothing {
            self.config.smoothing = SpectralSmoothing::Ema {
                alpha_q16: t.smoothing_alpha_q16,
            };
        }

        if let Some(downbeat) = self.downbeat.as_mut() {
            downbeat.set_thresholds(t.downbeat.conf_on, t.downbeat.conf_off);
            downbeat.set_env_decay(t.downbeat.env_decay);
            downbeat.set_beats_per_bar(t.downbeat.beats_per_bar);
            self.config.downbeat = Some(downbeat.config());
        }
    }

    /// Clears all analysis state; the bus epoch keeps counting.
    pub fn reset(&mut self) {
        self.smoother.reset();
        self.flux.reset();
        self.tempo.reset();
        if let Some(downbeat) = self.downbeat.as_mut() {
            downbeat.reset();
        }
        self.staging = AudioFrame {
            epoch: self.publisher.epoch(),
            ..AudioFrame::default()
        };
        self.last_tempo = TempoOutput::default();
        self.last_downbeat = DownbeatOutput::default();
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// The frame most recently published.
    pub fn frame(&self) -> &AudioFrame {
        &self.staging
    }

    pub fn tempo_output(&self) -> TempoOutput {
        self.last_tempo
    }

    pub fn tempo(&self) -> &TempoEngine {
        &self.tempo
    }

    /// `None` when the estimator is not part of the pipeline.
    pub fn downbeat(&self) -> Option<DownbeatOutput> {
        self.downbeat.as_ref().map(|_| self.last_downbeat)
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn epoch(&self) -> u32 {
        self.publisher.epoch()
    }

    pub fn reader(&self) -> FrameReader {
        self.publisher.reader()
    }
}

/// Default alpha of the EMA smoothing mode.
pub fn default_ema() -> SpectralSmoothing {
    SpectralSmoothing::Ema {
        alpha_q16: SMOOTHING_ALPHA_Q16_DEFAULT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::features::FLUX_CEILING;
    use crate::audio::fixed::q24_from_f32;
    use crate::audio::params::SMOOTHING_ALPHA_Q16_MAX;

    fn quiet_config() -> ProducerConfig {
        ProducerConfig {
            report_interval: 0,
            ..ProducerConfig::default()
        }
    }

    fn sine_chunk(freq: f32, amp: f32, start: usize) -> [i32; CHUNK_SIZE] {
        let mut chunk = [0i32; CHUNK_SIZE];
        for (i, s) in chunk.iter_mut().enumerate() {
            let t = (start + i) as f32 / SAMPLE_RATE as f32;
            *s = q24_from_f32(amp * (2.0 * std::f32::consts::PI * freq * t).sin());
        }
        chunk
    }

    #[test]
    fn test_tick_publishes_increasing_epochs() {
        let (mut producer, mut reader) = AudioProducer::with_bus(quiet_config()).unwrap();
        assert!(reader.snapshot().is_none());
        for i in 0..5u32 {
            let epoch = producer.tick(&[0; CHUNK_SIZE], i * 8);
            assert_eq!(epoch, i + 1);
            let frame = reader.snapshot().unwrap();
            assert_eq!(frame.epoch, epoch);
            assert_eq!(frame.t_ms, i * 8);
            assert!(!frame.is_tempo_ready());
        }
        assert_eq!(producer.frame().epoch, 5);
        assert_eq!(producer.telemetry().ticks, 5);
    }

    #[test]
    fn test_tone_lands_in_its_pitch_class() {
        let (mut producer, mut reader) = AudioProducer::with_bus(quiet_config()).unwrap();
        for i in 0..20 {
            producer.tick(&sine_chunk(1760.0, 0.8, i * CHUNK_SIZE), i as u32 * 8);
        }
        let frame = reader.snapshot().unwrap();
        let (best, _) = frame
            .chroma
            .iter()
            .enumerate()
            .max_by_key(|(_, v)| v.raw())
            .unwrap();
        assert_eq!(best, 9);
        assert!(frame.vu_peak.to_f32() > 0.75);
        assert!((frame.vu_rms.to_f32() - 0.8 / 2f32.sqrt()).abs() < 0.05);
        assert!(frame.flux >= Q16::ZERO && frame.flux <= FLUX_CEILING);
        assert!(frame.waveform.iter().any(|w| w.0 != 0));
        assert!(frame.bands[2] > frame.bands[0]);
    }

    #[test]
    fn test_dc_offset_is_removed() {
        let (mut producer, mut reader) = AudioProducer::with_bus(quiet_config()).unwrap();
        producer.tick(&[q24_from_f32(0.5); CHUNK_SIZE], 0);
        let frame = reader.snapshot().unwrap();
        assert_eq!(frame.vu_peak, Q16::ZERO);
        assert!(frame.raw_spectral.iter().all(|&b| b == Q16::ZERO));
    }

    #[test]
    fn test_waveform_disabled_and_downbeat_off() {
        let config = ProducerConfig {
            capture_waveform: false,
            downbeat: None,
            smoothing: default_ema(),
            ..quiet_config()
        };
        let (mut producer, mut reader) = AudioProducer::with_bus(config).unwrap();
        producer.tick(&sine_chunk(1000.0, 0.5, 0), 0);
        let frame = reader.snapshot().unwrap();
        assert!(frame.waveform.iter().all(|w| w.0 == 0));
        assert!(producer.downbeat().is_none());
        // First EMA step is alpha times the raw bin.
        let raw = frame.raw_spectral.iter().map(|b| b.raw()).max().unwrap();
        let smooth = frame.smooth_spectral.iter().map(|b| b.raw()).max().unwrap();
        assert!(smooth < raw / 5);
    }

    #[test]
    fn test_apply_tunables_clamps() {
        let config = ProducerConfig {
            smoothing: default_ema(),
            ..quiet_config()
        };
        let (mut producer, _reader) = AudioProducer::with_bus(config).unwrap();
        let mut t = Tunables::default();
        t.smoothing_alpha_q16 = 65535;
        t.downbeat.beats_per_bar = 3;
        t.downbeat.conf_on = 2.0;
        producer.apply_tunables(&t);
        assert_eq!(
            producer.config().smoothing,
            SpectralSmoothing::Ema {
                alpha_q16: SMOOTHING_ALPHA_Q16_MAX
            }
        );
        let db = producer.config().downbeat.unwrap();
        assert_eq!(db.beats_per_bar, 3);
        assert_eq!(db.conf_on, 0.95);
    }

    #[test]
    fn test_invalid_tempo_range_fails_construction() {
        let mut config = quiet_config();
        config.tempo.min_bpm = 200.0;
        assert!(AudioProducer::with_bus(config).is_err());
    }
}
