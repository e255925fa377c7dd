use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{info, warn};

use super::bus::FrameReader;
use super::diagnostics::Telemetry;
use super::fixed::q24_from_f32;
use super::params::Tunables;
use super::producer::{AudioProducer, ProducerConfig};
use super::CHUNK_SIZE;

/// One capture period of Q24 samples with its capture timestamp.
#[derive(Debug, Clone, Copy)]
pub struct CaptureChunk {
    pub samples: [i32; CHUNK_SIZE],
    pub t_ms: u32,
}

impl CaptureChunk {
    /// Converts float samples in [-1, 1]; missing samples read as silence.
    pub fn from_f32(samples: &[f32], t_ms: u32) -> Self {
        let mut chunk = Self {
            samples: [0; CHUNK_SIZE],
            t_ms,
        };
        for (dst, &src) in chunk.samples.iter_mut().zip(samples.iter()) {
            *dst = q24_from_f32(src);
        }
        chunk
    }
}

enum EngineMessage {
    Chunk(CaptureChunk),
    Tunables(Tunables),
}

/// Runs an [`AudioProducer`] on its own thread, fed through a bounded channel.
/// The capture side never blocks: chunks that do not fit are dropped and counted.
pub struct AudioEngine {
    sender: Option<Sender<EngineMessage>>,
    worker: Option<JoinHandle<Telemetry>>,
    reader: FrameReader,
    submitted: AtomicU64,
    dropped: AtomicU64,
}

impl AudioEngine {
    pub fn start(config: ProducerConfig, capacity: usize) -> Result<Self> {
        let (producer, reader) = AudioProducer::with_bus(config)?;
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));

        let worker = thread::Builder::new()
            .name("audio-producer".into())
            .spawn(move || Self::run(producer, receiver))
            .map_err(|e| anyhow!("Failed to spawn producer thread: {}", e))?;

        info!("Audio engine started (queue depth {})", capacity.max(1));
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            reader,
            submitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    fn run(mut producer: AudioProducer, receiver: Receiver<EngineMessage>) -> Telemetry {
        for message in receiver.iter() {
            match message {
                EngineMessage::Chunk(chunk) => {
                    producer.tick(&chunk.samples, chunk.t_ms);
                }
                EngineMessage::Tunables(tunables) => producer.apply_tunables(&tunables),
            }
        }
        info!("Audio producer stopped after {} ticks", producer.telemetry().ticks);
        producer.telemetry().clone()
    }

    /// Queues a chunk without blocking. Returns false if it was dropped.
    pub fn try_submit(&self, chunk: CaptureChunk) -> bool {
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };
        self.submitted.fetch_add(1, Ordering::Relaxed);
        match sender.try_send(EngineMessage::Chunk(chunk)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!("Producer queue full, {} chunks dropped so far", dropped);
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn submit_f32(&self, samples: &[f32], t_ms: u32) -> bool {
        self.try_submit(CaptureChunk::from_f32(samples, t_ms))
    }

    /// Hands new tunables to the producer thread. Waits for queue space
    /// rather than dropping them.
    pub fn update_tunables(&self, tunables: Tunables) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("Audio engine is shut down"))?;
        sender
            .send(EngineMessage::Tunables(tunables))
            .map_err(|_| anyhow!("Producer thread has exited"))
    }

    /// A new reader on the engine's frame bus.
    pub fn reader(&self) -> FrameReader {
        self.reader.clone()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drains queued chunks, stops the producer thread and returns its telemetry.
    pub fn shutdown(mut self) -> Result<Telemetry> {
        self.stop()
            .ok_or_else(|| anyhow!("Audio engine already stopped"))?
    }

    fn stop(&mut self) -> Option<Result<Telemetry>> {
        self.sender.take();
        self.worker.take().map(|worker| {
            worker
                .join()
                .map_err(|_| anyhow!("Producer thread panicked"))
        })
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        if let Some(Err(e)) = self.stop() {
            warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProducerConfig {
        ProducerConfig {
            report_interval: 0,
            ..ProducerConfig::default()
        }
    }

    #[test]
    fn test_chunks_flow_to_the_bus() {
        let engine = AudioEngine::start(config(), 64).unwrap();
        let mut reader = engine.reader();
        for i in 0..10u32 {
            assert!(engine.try_submit(CaptureChunk {
                samples: [0; CHUNK_SIZE],
                t_ms: i * 8,
            }));
        }
        let telemetry = engine.shutdown().unwrap();
        assert_eq!(telemetry.ticks, 10);

        let frame = reader.snapshot().unwrap();
        assert_eq!(frame.epoch, 10);
        assert_eq!(frame.t_ms, 72);
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let engine = AudioEngine::start(config(), 1).unwrap();
        let chunk = CaptureChunk::from_f32(&[0.25; CHUNK_SIZE], 0);
        let accepted = (0..500).filter(|_| engine.try_submit(chunk)).count() as u64;
        assert_eq!(engine.submitted(), 500);
        assert_eq!(engine.dropped(), 500 - accepted);
        let telemetry = engine.shutdown().unwrap();
        assert_eq!(telemetry.ticks, accepted);
    }

    #[test]
    fn test_f32_conversion_pads_with_silence() {
        let chunk = CaptureChunk::from_f32(&[1.0, -1.0], 5);
        assert_eq!(chunk.samples[0], crate::audio::fixed::Q24_FULL_SCALE);
        assert_eq!(chunk.samples[1], -crate::audio::fixed::Q24_FULL_SCALE);
        assert!(chunk.samples[2..].iter().all(|&s| s == 0));
        assert_eq!(chunk.t_ms, 5);
    }

    #[test]
    fn test_tunables_reach_the_producer() {
        let engine = AudioEngine::start(config(), 4).unwrap();
        let mut t = Tunables::default();
        t.downbeat.beats_per_bar = 3;
        engine.update_tunables(t).unwrap();
        engine.submit_f32(&[0.0; CHUNK_SIZE], 0);
        assert!(engine.shutdown().is_ok());
    }
}
