use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use lumen_audio::audio::diagnostics::Telemetry;
use lumen_audio::audio::features::BAND_NAMES;
use lumen_audio::audio::fixed::q24_from_f32;
use lumen_audio::audio::producer::{default_ema, SpectralSmoothing};
use lumen_audio::audio::{
    AudioFrame, AudioProducer, FrameReader, ProducerConfig, Tunables, CHUNK_SIZE, FRAME_RATE_HZ,
    SAMPLE_RATE,
};

#[derive(Parser)]
#[command(name = "lumen-audio-analyzer")]
#[command(about = "Runs a WAV file through the analysis pipeline and writes a JSON report")]
struct Args {
    /// WAV file to analyze
    audio_file: PathBuf,

    /// Output JSON file path
    #[arg(long, short, default_value = "analysis_results.json")]
    output: PathBuf,

    /// Include frame-by-frame data (large, useful for tuning)
    #[arg(long)]
    frame_by_frame: bool,

    /// Tunables JSON file (smoothing, perceptual, downbeat, tempo range)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the plain EMA smoother instead of perceptual smoothing
    #[arg(long)]
    ema: bool,

    /// Beats per bar for the downbeat estimator (0 disables it)
    #[arg(long)]
    beats_per_bar: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AudioFeatureStats {
    min: f32,
    max: f32,
    mean: f32,
    median: f32,
    std_dev: f32,
    samples: usize,
    histogram: Vec<(f32, usize)>, // (bin start, count)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrameData {
    timestamp: f32,
    epoch: u32,
    vu_peak: f32,
    vu_rms: f32,
    bands: [f32; 4],
    flux: f32,
    bpm: f32,
    beat_phase: f32,
    confidence: f32,
    silence: f32,
    beat: bool,
    downbeat: bool,
    beat_in_bar: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BeatEvent {
    timestamp: f32,
    strength: f32,
    bpm: f32,
    beat_in_bar: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileInfo {
    filename: String,
    source_sample_rate: u32,
    source_channels: u16,
    duration_seconds: f32,
    total_frames: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct BeatStats {
    total_beats: usize,
    total_downbeats: usize,
    average_bpm: f32,
    bpm_variance: f32,
    beat_consistency: f32, // 0-1, how regular the beat intervals are
    strongest_beat: f32,
    weakest_beat: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct TempoSummary {
    first_ready_seconds: Option<f32>,
    ready_fraction: f32,
    final_bpm: f32,
    final_confidence: f32,
    silent_fraction: f32,
}

#[derive(Debug, Serialize)]
struct AnalysisResults {
    file_info: FileInfo,
    tunables: Tunables,
    smoothing: SpectralSmoothing,

    band_stats: BTreeMap<String, AudioFeatureStats>,
    level_stats: BTreeMap<String, AudioFeatureStats>,
    tempo_stats: BTreeMap<String, AudioFeatureStats>,
    tempo_summary: TempoSummary,
    beat_stats: BeatStats,

    beat_events: Vec<BeatEvent>,
    downbeat_events: Vec<BeatEvent>,
    telemetry: Telemetry,

    frame_data: Option<Vec<FrameData>>,
}

struct DecodedAudio {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

/// Reads a WAV file and mixes every channel down to mono.
fn load_wav(path: &Path) -> Result<DecodedAudio> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()?
        }
    };

    let samples = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();

    info!(
        "Loaded {}: {} Hz, {} channels, {} bits",
        path.display(),
        spec.sample_rate,
        spec.channels,
        spec.bits_per_sample
    );

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Linear-interpolation resampler to the pipeline rate.
fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = input[idx.min(input.len() - 1)];
            let b = input[(idx + 1).min(input.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

struct AnalysisSession {
    producer: AudioProducer,
    reader: FrameReader,
    feature_collectors: BTreeMap<String, Vec<f32>>,
    frame_data: Vec<FrameData>,
    beat_events: Vec<BeatEvent>,
    downbeat_events: Vec<BeatEvent>,
    first_ready: Option<f32>,
    ready_frames: usize,
    silent_frames: usize,
}

impl AnalysisSession {
    fn new(config: ProducerConfig) -> Result<Self> {
        let (producer, reader) = AudioProducer::with_bus(config)?;
        Ok(Self {
            producer,
            reader,
            feature_collectors: BTreeMap::new(),
            frame_data: Vec::new(),
            beat_events: Vec::new(),
            downbeat_events: Vec::new(),
            first_ready: None,
            ready_frames: 0,
            silent_frames: 0,
        })
    }

    fn run(&mut self, samples: &[f32], include_frames: bool) -> Result<usize> {
        let mut chunk = [0i32; CHUNK_SIZE];
        let mut frame_count = 0;
        let total_duration = samples.len() as f32 / SAMPLE_RATE as f32;

        for block in samples.chunks_exact(CHUNK_SIZE) {
            for (dst, &src) in chunk.iter_mut().zip(block.iter()) {
                *dst = q24_from_f32(src);
            }
            let t_ms = (frame_count as f32 * 1000.0 / FRAME_RATE_HZ) as u32;
            self.producer.tick(&chunk, t_ms);

            let frame = self
                .reader
                .snapshot()
                .ok_or_else(|| anyhow!("No frame on the bus after tick {}", frame_count))?;
            let timestamp = frame_count as f32 / FRAME_RATE_HZ;
            self.collect_frame_statistics(&frame, timestamp, include_frames);

            frame_count += 1;
            if frame_count % 1250 == 0 {
                info!(
                    "Processed {} frames ({:.1}s of {:.1}s), {:.1} BPM",
                    frame_count,
                    timestamp,
                    total_duration,
                    frame.bpm()
                );
            }
        }
        Ok(frame_count)
    }

    fn collect_frame_statistics(&mut self, frame: &AudioFrame, timestamp: f32, include_frames: bool) {
        for (name, band) in BAND_NAMES.iter().zip(frame.bands.iter()) {
            self.add_sample(name, band.to_f32());
        }
        self.add_sample("vu_peak", frame.vu_peak.to_f32());
        self.add_sample("vu_rms", frame.vu_rms.to_f32());
        self.add_sample("flux", frame.flux.to_f32());
        self.add_sample("tempo_confidence", frame.tempo_confidence.to_f32());
        self.add_sample("tempo_silence", frame.tempo_silence.to_f32());

        if frame.tempo_silence.to_f32() >= 0.999 {
            self.silent_frames += 1;
        }
        if frame.is_tempo_ready() {
            self.ready_frames += 1;
            self.first_ready.get_or_insert(timestamp);
            self.add_sample("bpm", frame.bpm());
            self.add_sample("beat_strength", frame.beat_strength.to_f32());
        }

        let downbeat = self.producer.downbeat();
        let beat_in_bar = downbeat.filter(|d| d.armed).map(|d| d.beat_in_bar);
        if frame.is_beat() {
            let event = BeatEvent {
                timestamp,
                strength: frame.beat_strength.to_f32(),
                bpm: frame.bpm(),
                beat_in_bar,
            };
            if downbeat.map_or(false, |d| d.downbeat) {
                self.downbeat_events.push(event.clone());
            }
            self.beat_events.push(event);
        }

        if include_frames {
            self.frame_data.push(FrameData {
                timestamp,
                epoch: frame.epoch,
                vu_peak: frame.vu_peak.to_f32(),
                vu_rms: frame.vu_rms.to_f32(),
                bands: frame.bands.map(|b| b.to_f32()),
                flux: frame.flux.to_f32(),
                bpm: frame.bpm(),
                beat_phase: frame.beat_phase.to_f32(),
                confidence: frame.tempo_confidence.to_f32(),
                silence: frame.tempo_silence.to_f32(),
                beat: frame.is_beat(),
                downbeat: downbeat.map_or(false, |d| d.downbeat),
                beat_in_bar,
            });
        }
    }

    fn add_sample(&mut self, feature_name: &str, value: f32) {
        self.feature_collectors
            .entry(feature_name.to_string())
            .or_default()
            .push(value);
    }

    fn stats_for(&self, names: &[&str]) -> BTreeMap<String, AudioFeatureStats> {
        names
            .iter()
            .filter_map(|name| {
                self.feature_collectors
                    .get(*name)
                    .map(|data| (name.to_string(), calculate_stats(data)))
            })
            .collect()
    }

    fn calculate_beat_stats(&self) -> BeatStats {
        if self.beat_events.is_empty() {
            return BeatStats {
                total_beats: 0,
                total_downbeats: 0,
                average_bpm: 0.0,
                bpm_variance: 0.0,
                beat_consistency: 0.0,
                strongest_beat: 0.0,
                weakest_beat: 0.0,
            };
        }

        let bpms: Vec<f32> = self.beat_events.iter().map(|b| b.bpm).collect();
        let average_bpm = bpms.iter().sum::<f32>() / bpms.len() as f32;
        let bpm_variance = bpms
            .iter()
            .map(|&bpm| (bpm - average_bpm).powi(2))
            .sum::<f32>()
            / bpms.len() as f32;

        let intervals: Vec<f32> = self
            .beat_events
            .windows(2)
            .map(|w| w[1].timestamp - w[0].timestamp)
            .collect();
        let beat_consistency = if intervals.len() > 1 {
            let mean_interval = intervals.iter().sum::<f32>() / intervals.len() as f32;
            let cv = calculate_stats(&intervals).std_dev / mean_interval.max(1.0e-6);
            1.0 / (1.0 + cv)
        } else {
            0.0
        };

        let strengths = self.beat_events.iter().map(|b| b.strength);
        BeatStats {
            total_beats: self.beat_events.len(),
            total_downbeats: self.downbeat_events.len(),
            average_bpm,
            bpm_variance,
            beat_consistency,
            strongest_beat: strengths.clone().fold(0.0f32, f32::max),
            weakest_beat: strengths.fold(f32::INFINITY, f32::min),
        }
    }

    fn generate_results(
        self,
        file_info: FileInfo,
        tunables: Tunables,
        frame_count: usize,
        include_frames: bool,
    ) -> AnalysisResults {
        let band_stats = self.stats_for(&BAND_NAMES);
        let level_stats = self.stats_for(&["vu_peak", "vu_rms", "flux"]);
        let tempo_stats =
            self.stats_for(&["bpm", "beat_strength", "tempo_confidence", "tempo_silence"]);
        let beat_stats = self.calculate_beat_stats();

        let last = self.producer.frame();
        let frames = frame_count.max(1) as f32;
        let tempo_summary = TempoSummary {
            first_ready_seconds: self.first_ready,
            ready_fraction: self.ready_frames as f32 / frames,
            final_bpm: last.bpm(),
            final_confidence: last.tempo_confidence.to_f32(),
            silent_fraction: self.silent_frames as f32 / frames,
        };

        AnalysisResults {
            file_info,
            tunables,
            smoothing: self.producer.config().smoothing,
            band_stats,
            level_stats,
            tempo_stats,
            tempo_summary,
            beat_stats,
            telemetry: self.producer.telemetry().clone(),
            frame_data: include_frames.then_some(self.frame_data),
            beat_events: self.beat_events,
            downbeat_events: self.downbeat_events,
        }
    }
}

fn calculate_stats(data: &[f32]) -> AudioFeatureStats {
    if data.is_empty() {
        return AudioFeatureStats {
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            median: 0.0,
            std_dev: 0.0,
            samples: 0,
            histogram: Vec::new(),
        };
    }

    let mut sorted_data = data.to_vec();
    sorted_data.sort_by(|a, b| a.total_cmp(b));

    let min = sorted_data[0];
    let max = sorted_data[sorted_data.len() - 1];
    let mean = data.iter().sum::<f32>() / data.len() as f32;
    let median = sorted_data[sorted_data.len() / 2];

    let variance = data.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / data.len() as f32;
    let std_dev = variance.sqrt();

    // 20-bin histogram; the top bin is closed so `max` is counted.
    let mut histogram = Vec::new();
    if max > min {
        let bin_size = (max - min) / 20.0;
        let mut counts = [0usize; 20];
        for &x in data {
            let bin = (((x - min) / bin_size) as usize).min(19);
            counts[bin] += 1;
        }
        for (i, &count) in counts.iter().enumerate() {
            histogram.push((min + i as f32 * bin_size, count));
        }
    }

    AudioFeatureStats {
        min,
        max,
        mean,
        median,
        std_dev,
        samples: data.len(),
        histogram,
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let tunables = match &args.config {
        Some(path) => Tunables::load(path)?,
        None => Tunables::default(),
    };

    let mut config = ProducerConfig {
        smoothing: if args.ema {
            default_ema()
        } else {
            SpectralSmoothing::Perceptual
        },
        ..ProducerConfig::default()
    }
    .with_tunables(&tunables);
    match args.beats_per_bar {
        Some(0) => config.downbeat = None,
        Some(bpb) => {
            if let Some(downbeat) = config.downbeat.as_mut() {
                downbeat.beats_per_bar = bpb;
            }
        }
        None => {}
    }

    let decoded = load_wav(&args.audio_file)?;
    let samples = resample_linear(&decoded.samples, decoded.sample_rate, SAMPLE_RATE);
    let duration = samples.len() as f32 / SAMPLE_RATE as f32;
    info!("Analyzing {:.2}s of audio at {} Hz", duration, SAMPLE_RATE);

    let mut session = AnalysisSession::new(config)?;
    let frame_count = session.run(&samples, args.frame_by_frame)?;

    let file_info = FileInfo {
        filename: args.audio_file.display().to_string(),
        source_sample_rate: decoded.sample_rate,
        source_channels: decoded.channels,
        duration_seconds: duration,
        total_frames: frame_count,
    };
    let results = session.generate_results(file_info, tunables, frame_count, args.frame_by_frame);

    info!(
        "Analysis complete: {} frames, {} beats, {} downbeats, final tempo {:.1} BPM",
        frame_count,
        results.beat_stats.total_beats,
        results.beat_stats.total_downbeats,
        results.tempo_summary.final_bpm
    );

    let json = serde_json::to_string_pretty(&results)?;
    let mut file = File::create(&args.output)
        .with_context(|| format!("Failed to create {}", args.output.display()))?;
    file.write_all(json.as_bytes())?;
    info!("Results written to {}", args.output.display());

    Ok(())
}
