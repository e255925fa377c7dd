//! End-to-end tests: synthetic audio in, published frames out

use lumen_audio::audio::features::FLUX_CEILING;
use lumen_audio::audio::fixed::{q24_from_f32, Q16};
use lumen_audio::audio::params::{AudioParams, MemoryStore, SmoothingProfile};
use lumen_audio::audio::{
    AudioEngine, AudioFrame, AudioProducer, CaptureChunk, FrameReader, ProducerConfig, Tunables,
    CHUNK_SIZE, SAMPLE_RATE,
};

const CLICK_BPM: usize = 120;
const SAMPLES_PER_BEAT: usize = SAMPLE_RATE as usize * 60 / CLICK_BPM;
/// One 4/4 bar at 120 BPM is exactly 250 chunks.
const CHUNKS_PER_BAR: usize = 4 * SAMPLES_PER_BEAT / CHUNK_SIZE;

/// Decaying 100 Hz + 1 kHz burst at sample `n`, restarting on every beat.
fn click(n: usize, amplitude: f32) -> f32 {
    let t = (n % SAMPLES_PER_BEAT) as f32 / SAMPLE_RATE as f32;
    let tone = 0.5 * (2.0 * std::f32::consts::PI * 100.0 * t).sin()
        + 0.5 * (2.0 * std::f32::consts::PI * 1000.0 * t).sin();
    amplitude * (-t * 60.0).exp() * tone
}

/// Clicks at amplitude 0.8, twice per second.
fn click_chunk(chunk_index: usize) -> [i32; CHUNK_SIZE] {
    let mut chunk = [0i32; CHUNK_SIZE];
    for (i, s) in chunk.iter_mut().enumerate() {
        *s = q24_from_f32(click(chunk_index * CHUNK_SIZE + i, 0.8));
    }
    chunk
}

/// Clicks at amplitude 0.5 with a 180 Hz kick under the first beat of every bar.
fn accented_chunk(chunk_index: usize) -> [i32; CHUNK_SIZE] {
    let mut chunk = [0i32; CHUNK_SIZE];
    for (i, s) in chunk.iter_mut().enumerate() {
        let n = chunk_index * CHUNK_SIZE + i;
        let mut v = click(n, 0.5);
        if (n / SAMPLES_PER_BEAT) % 4 == 0 {
            let t = (n % SAMPLES_PER_BEAT) as f32 / SAMPLE_RATE as f32;
            v += 0.45 * (-t * 20.0).exp() * (2.0 * std::f32::consts::PI * 180.0 * t).sin();
        }
        *s = q24_from_f32(v);
    }
    chunk
}

fn quiet_producer() -> (AudioProducer, FrameReader) {
    let config = ProducerConfig {
        report_interval: 0,
        ..ProducerConfig::default()
    };
    AudioProducer::with_bus(config).unwrap()
}

fn run_clicks(producer: &mut AudioProducer, reader: &mut FrameReader, chunks: usize) -> Vec<AudioFrame> {
    (0..chunks)
        .map(|i| {
            producer.tick(&click_chunk(i), i as u32 * 8);
            reader.snapshot().unwrap()
        })
        .collect()
}

#[test]
fn test_click_track_reports_120_bpm_once_history_fills() {
    let (mut producer, mut reader) = quiet_producer();
    let frames = run_clicks(&mut producer, &mut reader, 750);

    assert!(frames[..749].iter().all(|f| !f.is_tempo_ready()));
    let last = frames[749];
    assert!(last.is_tempo_ready());
    let bpm = last.tempo_bpm.to_f32();
    assert!((bpm - 120.0).abs() <= 2.0, "bpm {}", bpm);
    assert!((last.tempo_bpm.raw() - 120 * 65536).abs() <= 2 * 65536);
}

#[test]
fn test_click_track_gains_confidence_and_beats() {
    let (mut producer, mut reader) = quiet_producer();
    let frames = run_clicks(&mut producer, &mut reader, 1500);

    let last = frames[frames.len() - 1];
    assert!(last.tempo_confidence.to_f32() > 0.6, "confidence {}", last.tempo_confidence.to_f32());
    assert!(
        last.tempo_silence < Q16::from_f32(0.7),
        "silence {}",
        last.tempo_silence.to_f32()
    );
    assert!((last.bpm() - 120.0).abs() <= 2.0);

    let beats: Vec<usize> = frames
        .iter()
        .enumerate()
        .filter(|(_, f)| f.is_beat())
        .map(|(i, _)| i)
        .collect();
    assert!(beats.len() >= 5, "only {} beats", beats.len());
    let regular = beats
        .windows(2)
        .filter(|w| (60..=65).contains(&(w[1] - w[0])))
        .count();
    assert!(regular * 5 >= (beats.len() - 1) * 4, "beats at {:?}", beats);
}

#[test]
fn test_accented_first_beat_becomes_the_downbeat() {
    let (mut producer, mut reader) = quiet_producer();
    let mut armed_ticks = 0;
    let mut edges = Vec::new();
    let mut downbeat_indices = Vec::new();

    for i in 0..3000 {
        producer.tick(&accented_chunk(i), i as u32 * 8);
        let frame = reader.snapshot().unwrap();
        let downbeat = producer.downbeat().unwrap();
        if downbeat.armed {
            armed_ticks += 1;
        }
        if downbeat.downbeat {
            assert!(frame.is_beat(), "downbeat edge without a beat at chunk {}", i);
            edges.push(i);
        }
        downbeat_indices.push(downbeat.downbeat_index);
    }

    assert!(armed_ticks > 1000, "armed for only {} ticks", armed_ticks);
    let late: Vec<usize> = edges.iter().copied().filter(|&i| i >= 2000).collect();
    assert!(late.len() >= 3, "downbeats at {:?}", edges);
    // Each late downbeat trails a kick by at most a few chunks.
    assert!(
        late.iter().all(|&i| i % CHUNKS_PER_BAR < 10),
        "downbeats at {:?}",
        edges
    );
    assert!(
        downbeat_indices[2000..].windows(2).all(|w| w[0] == w[1]),
        "downbeat index still moving"
    );
}

#[test]
fn test_noise_keeps_every_field_in_range() {
    let (mut producer, mut reader) = quiet_producer();
    let mut state = 0x1234_5678u32;
    let mut last_epoch = 0;

    for i in 0..400u32 {
        let mut chunk = [0i32; CHUNK_SIZE];
        for s in chunk.iter_mut() {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            *s = q24_from_f32((state >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0);
        }
        let epoch = producer.tick(&chunk, i * 8);
        assert!(epoch > last_epoch);
        last_epoch = epoch;

        let frame = reader.snapshot().unwrap();
        assert_eq!(frame.epoch, epoch);
        assert!(frame.flux >= Q16::ZERO && frame.flux <= FLUX_CEILING);
        assert!(frame.raw_spectral.iter().all(|b| (0..=0xFFFF).contains(&b.raw())));
        assert!(frame.smooth_spectral.iter().all(|b| (0..=0xFFFF).contains(&b.raw())));
        assert!(frame.vu_peak <= Q16::ONE && frame.vu_rms <= frame.vu_peak);
        assert!(frame.tempo_silence >= Q16::ZERO && frame.tempo_silence <= Q16::ONE);
        assert!(!frame.is_tempo_ready());
    }
}

#[test]
fn test_silence_never_beats() {
    let (mut producer, mut reader) = quiet_producer();
    for i in 0..900u32 {
        producer.tick(&[0; CHUNK_SIZE], i * 8);
        let frame = reader.snapshot().unwrap();
        assert!(!frame.is_beat());
        assert_eq!(frame.flux, Q16::ZERO);
    }
    let frame = reader.snapshot().unwrap();
    assert_eq!(frame.tempo_silence, Q16::ONE);
}

#[test]
fn test_engine_streams_clicks_from_another_thread() {
    let config = ProducerConfig {
        report_interval: 0,
        ..ProducerConfig::default()
    };
    let engine = AudioEngine::start(config, 1024).unwrap();
    let mut reader = engine.reader();
    for i in 0..800 {
        assert!(engine.try_submit(CaptureChunk {
            samples: click_chunk(i),
            t_ms: i as u32 * 8,
        }));
    }
    let telemetry = engine.shutdown().unwrap();
    assert_eq!(telemetry.ticks, 800);

    let frame = reader.snapshot().unwrap();
    assert_eq!(frame.epoch, 800);
    assert!(frame.is_tempo_ready());
    assert!((frame.bpm() - 120.0).abs() <= 2.0);
}

#[test]
fn test_persisted_profile_drives_producer() {
    let mut params = AudioParams::load(MemoryStore::new(), Tunables::default(), 0);
    params.set_smoothing_profile(SmoothingProfile::Silk, 5000);
    let config = ProducerConfig {
        smoothing: lumen_audio::audio::producer::default_ema(),
        report_interval: 0,
        ..ProducerConfig::default()
    }
    .with_tunables(&params.tunables());

    assert_eq!(
        config.smoothing,
        lumen_audio::audio::SpectralSmoothing::Ema { alpha_q16: 5243 }
    );
    let (mut producer, mut reader) = AudioProducer::with_bus(config).unwrap();
    producer.tick(&click_chunk(0), 0);
    assert!(reader.snapshot().is_some());
}
