use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use super::AudioFrame;

/// Size of one frame in 32-bit words.
pub const FRAME_WORDS: usize = std::mem::size_of::<AudioFrame>() / 4;

/// Default retry budget for [`FrameReader::snapshot`].
pub const DEFAULT_SNAPSHOT_ATTEMPTS: u32 = 3;

/// Single-slot, lock-free publication point for the latest [`AudioFrame`].
///
/// The slot is guarded by a sequence counter that is odd while a write is in
/// flight. Readers copy the slot and accept it only if the counter was even and
/// unchanged across the copy, so a snapshot never mixes two ticks.
pub struct FrameBus {
    seq: AtomicU64,
    epoch: AtomicU32,
    words: [AtomicU32; FRAME_WORDS],
}

impl FrameBus {
    /// Creates a bus and returns its only publisher plus a cloneable reader.
    pub fn new() -> (FramePublisher, FrameReader) {
        let bus = Arc::new(FrameBus {
            seq: AtomicU64::new(0),
            epoch: AtomicU32::new(0),
            words: std::array::from_fn(|_| AtomicU32::new(0)),
        });
        (
            FramePublisher {
                bus: Arc::clone(&bus),
                epoch: 0,
            },
            FrameReader {
                bus,
                last_epoch: 0,
                misses: 0,
            },
        )
    }

    /// Epoch of the most recent complete publish, 0 before the first one.
    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }
}

/// Write side of the bus. Not `Clone`: there is exactly one producer.
pub struct FramePublisher {
    bus: Arc<FrameBus>,
    epoch: u32,
}

impl FramePublisher {
    /// Copies `frame` into the slot with a fresh epoch and returns that epoch.
    /// The epoch becomes visible only after every word of the frame.
    pub fn publish(&mut self, frame: &AudioFrame) -> u32 {
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            self.epoch = 1;
        }

        let mut stamped = *frame;
        stamped.epoch = self.epoch;
        let words: [u32; FRAME_WORDS] = bytemuck::cast(stamped);

        let seq = self.bus.seq.load(Ordering::Relaxed);
        self.bus.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        for (slot, &word) in self.bus.words.iter().zip(words.iter()) {
            slot.store(word, Ordering::Relaxed);
        }
        self.bus.epoch.store(self.epoch, Ordering::Release);
        self.bus.seq.store(seq.wrapping_add(2), Ordering::Release);

        self.epoch
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn reader(&self) -> FrameReader {
        FrameReader {
            bus: Arc::clone(&self.bus),
            last_epoch: 0,
            misses: 0,
        }
    }
}

/// Read side of the bus. Cheap to clone; readers never block the publisher.
#[derive(Clone)]
pub struct FrameReader {
    bus: Arc<FrameBus>,
    last_epoch: u32,
    misses: u64,
}

impl FrameReader {
    /// Copies the latest frame into `out`. Returns false, leaving `out`
    /// untouched, if nothing was published yet or every attempt raced a write.
    pub fn snapshot_into(&mut self, out: &mut AudioFrame, max_attempts: u32) -> bool {
        let mut words = [0u32; FRAME_WORDS];
        for _ in 0..max_attempts.max(1) {
            let before = self.bus.seq.load(Ordering::Acquire);
            if before == 0 {
                return false;
            }
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }

            for (word, slot) in words.iter_mut().zip(self.bus.words.iter()) {
                *word = slot.load(Ordering::Relaxed);
            }
            fence(Ordering::Acquire);
            let after = self.bus.seq.load(Ordering::Relaxed);
            if before != after {
                std::hint::spin_loop();
                continue;
            }

            let frame: AudioFrame = bytemuck::cast(words);
            if frame.epoch == 0 {
                continue;
            }
            self.last_epoch = frame.epoch;
            *out = frame;
            return true;
        }
        self.misses += 1;
        false
    }

    pub fn snapshot(&mut self) -> Option<AudioFrame> {
        let mut frame = AudioFrame::default();
        self.snapshot_into(&mut frame, DEFAULT_SNAPSHOT_ATTEMPTS)
            .then_some(frame)
    }

    /// Returns a frame only if it is newer than the last one this reader saw.
    pub fn poll_new(&mut self) -> Option<AudioFrame> {
        let seen = self.last_epoch;
        if self.bus.epoch() == seen {
            return None;
        }
        self.snapshot().filter(|f| f.epoch != seen)
    }

    /// Epoch currently published on the bus.
    pub fn bus_epoch(&self) -> u32 {
        self.bus.epoch()
    }

    /// Epoch of the last frame this reader returned.
    pub fn last_epoch(&self) -> u32 {
        self.last_epoch
    }

    /// True when the bus has moved on since this reader's last snapshot.
    pub fn is_stale(&self) -> bool {
        self.bus.epoch() != self.last_epoch
    }

    /// Snapshot attempts that gave up after racing the publisher.
    pub fn misses(&self) -> u64 {
        self.misses
    }
}
