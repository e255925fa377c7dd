//! Cost of one producer tick against the 8 ms chunk budget

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lumen_audio::audio::fixed::q24_from_f32;
use lumen_audio::audio::{AudioProducer, ProducerConfig, CHUNK_SIZE, SAMPLE_RATE};

fn music_like_chunks(count: usize) -> Vec<[i32; CHUNK_SIZE]> {
    (0..count)
        .map(|c| {
            let mut chunk = [0i32; CHUNK_SIZE];
            for (i, s) in chunk.iter_mut().enumerate() {
                let n = c * CHUNK_SIZE + i;
                let t = n as f32 / SAMPLE_RATE as f32;
                let kick = if n % 8000 < 800 { (-((n % 8000) as f32) / 200.0).exp() } else { 0.0 };
                let v = 0.3 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()
                    + 0.2 * (2.0 * std::f32::consts::PI * 1318.5 * t).sin()
                    + 0.4 * kick * (2.0 * std::f32::consts::PI * 60.0 * t).sin();
                *s = q24_from_f32(v);
            }
            chunk
        })
        .collect()
}

fn bench_producer_tick(c: &mut Criterion) {
    let chunks = music_like_chunks(1000);
    let config = ProducerConfig {
        report_interval: 0,
        ..ProducerConfig::default()
    };
    let (mut producer, _reader) = AudioProducer::with_bus(config).expect("producer");

    // Fill the novelty history so heavy tempo updates are part of the measurement.
    for (i, chunk) in chunks.iter().cycle().take(800).enumerate() {
        producer.tick(chunk, i as u32 * 8);
    }

    let mut i = 0usize;
    c.bench_function("producer_tick_steady_state", |b| {
        b.iter(|| {
            let chunk = &chunks[i % chunks.len()];
            i += 1;
            black_box(producer.tick(black_box(chunk), i as u32 * 8));
        });
    });
}

criterion_group!(benches, bench_producer_tick);
criterion_main!(benches);
