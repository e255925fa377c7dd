//! Audio analysis core for an audio-reactive lighting controller.
//!
//! Chunks of Q24 PCM go in, one [`audio::AudioFrame`] per 8 ms tick comes out
//! on a lock-free frame bus: a semitone filterbank spectrum, pitch-class and
//! band energies, novelty, tempo with beat phase, and an optional downbeat.

pub mod audio;

pub use audio::{
    AudioEngine, AudioFrame, AudioParams, AudioProducer, CaptureChunk, FrameReader,
    ProducerConfig, Tunables,
};
