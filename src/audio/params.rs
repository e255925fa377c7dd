//! Runtime tunables and their persistence through a small key/value store.
//!
//! Values are stored as `u32` words. Fractional settings use Q16.16 so a
//! store that only understands integers can hold every tunable.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::downbeat::DownbeatConfig;
use super::perceptual::PerceptualConfig;
use super::tempo::TempoConfig;
use super::{CHUNK_SIZE, SAMPLE_RATE};

pub const SMOOTHING_ALPHA_Q16_DEFAULT: u32 = 6553;
pub const SMOOTHING_ALPHA_Q16_MIN: u32 = 1310;
pub const SMOOTHING_ALPHA_Q16_MAX: u32 = 39321;

/// Minimum spacing between persisted writes of the same key.
pub const PERSIST_INTERVAL_MS: u32 = 1000;

pub mod keys {
    pub const SMOOTHING_ALPHA: &str = "smoothing_alpha_q16";
    pub const PERCEPT_ATTACK: &str = "percept_attack_hz";
    pub const PERCEPT_RELEASE: &str = "percept_release_hz";
    pub const PERCEPT_KNEE: &str = "percept_knee";
    pub const PERCEPT_FLOOR_TC: &str = "percept_floor_tc";
    pub const DOWNBEAT_CONF_ON: &str = "downbeat_conf_on";
    pub const DOWNBEAT_CONF_OFF: &str = "downbeat_conf_off";
    pub const DOWNBEAT_ENV_DECAY: &str = "downbeat_env_decay";
    pub const DOWNBEAT_BEATS_PER_BAR: &str = "downbeat_bpb";
}

/// Named EMA smoothing presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmoothingProfile {
    Silk,
    Default,
    Snappy,
}

impl SmoothingProfile {
    pub fn alpha(self) -> f32 {
        match self {
            SmoothingProfile::Silk => 0.08,
            SmoothingProfile::Default => 0.10,
            SmoothingProfile::Snappy => 0.25,
        }
    }
}

pub fn clamp_smoothing_alpha_q16(alpha_q16: u32) -> u32 {
    alpha_q16.clamp(SMOOTHING_ALPHA_Q16_MIN, SMOOTHING_ALPHA_Q16_MAX)
}

/// EMA coefficient (Q16, unclamped) for a time constant at the tick rate.
pub fn alpha_q16_from_tau_ms(tau_ms: u32) -> u32 {
    let tau = tau_ms.max(1) as f64;
    let dt_ms = 1000.0 * CHUNK_SIZE as f64 / SAMPLE_RATE as f64;
    let alpha = 1.0 - (-dt_ms / tau).exp();
    if alpha >= 0.999_969_5 {
        65535
    } else if alpha > 0.0 {
        (alpha * 65536.0 + 0.5) as u32
    } else {
        0
    }
}

fn encode_q16(value: f32) -> u32 {
    (value.max(0.0) as f64 * 65536.0).round().min(u32::MAX as f64) as u32
}

fn decode_q16(word: u32) -> f32 {
    (word as f64 / 65536.0) as f32
}

/// Every runtime-adjustable setting of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// EMA coefficient of the legacy smoothing path, Q16.
    pub smoothing_alpha_q16: u32,
    pub perceptual: PerceptualConfig,
    pub downbeat: DownbeatConfig,
    /// Applied when a producer is built; not changeable while running.
    pub tempo: TempoConfig,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            smoothing_alpha_q16: SMOOTHING_ALPHA_Q16_DEFAULT,
            perceptual: PerceptualConfig::default(),
            downbeat: DownbeatConfig::default(),
            tempo: TempoConfig::default(),
        }
    }
}

impl Tunables {
    pub fn clamped(self) -> Self {
        Self {
            smoothing_alpha_q16: clamp_smoothing_alpha_q16(self.smoothing_alpha_q16),
            perceptual: self.perceptual.clamped(),
            downbeat: self.downbeat.clamped(),
            tempo: self.tempo,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write tunables to {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tunables from {}", path.display()))?;
        let tunables: Tunables = serde_json::from_str(&json)?;
        Ok(tunables.clamped())
    }
}

/// Persisted settings collaborator.
pub trait KeyValueStore {
    fn read(&self, key: &str) -> Option<u32>;
    /// Returns false when the value could not be stored.
    fn write(&mut self, key: &str, value: u32) -> bool;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: HashMap<String, u32>,
    writes: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes, debounced or not.
    pub fn write_count(&self) -> u64 {
        self.writes
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, key: &str) -> Option<u32> {
        self.values.get(key).copied()
    }

    fn write(&mut self, key: &str, value: u32) -> bool {
        self.values.insert(key.to_string(), value);
        self.writes += 1;
        true
    }
}

/// Key/value store backed by a pretty-printed JSON object on disk.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: BTreeMap<String, u32>,
}

impl JsonFileStore {
    /// Opens `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read store {}", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("Malformed store {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        info!("Settings store {} ({} keys)", path.display(), values.len());
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.values)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn read(&self, key: &str) -> Option<u32> {
        self.values.get(key).copied()
    }

    fn write(&mut self, key: &str, value: u32) -> bool {
        self.values.insert(key.to_string(), value);
        match self.persist() {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to persist {} to {}: {}", key, self.path.display(), e);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    value: u32,
    pending: bool,
    last_write_ms: Option<u32>,
    min_interval_ms: u32,
}

/// Rate-limits writes per key. A debounced write lands immediately when the
/// key has not been written for `min_interval_ms`; otherwise it is parked and
/// flushed by a later [`DebouncedStore::poll`].
pub struct DebouncedStore<S: KeyValueStore> {
    inner: S,
    slots: HashMap<String, PendingWrite>,
}

impl<S: KeyValueStore> DebouncedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            slots: HashMap::new(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Reads a parked value first, then the backing store.
    pub fn read(&self, key: &str) -> Option<u32> {
        match self.slots.get(key) {
            Some(slot) if slot.pending => Some(slot.value),
            _ => self.inner.read(key),
        }
    }

    /// Writes through immediately, bypassing the debounce.
    pub fn write(&mut self, key: &str, value: u32, now_ms: u32) -> bool {
        let ok = self.inner.write(key, value);
        if ok {
            let slot = self.slots.entry(key.to_string()).or_insert(PendingWrite {
                value,
                pending: false,
                last_write_ms: None,
                min_interval_ms: 0,
            });
            slot.value = value;
            slot.pending = false;
            slot.last_write_ms = Some(now_ms);
        }
        ok
    }

    pub fn write_debounced(
        &mut self,
        key: &str,
        value: u32,
        min_interval_ms: u32,
        force: bool,
        now_ms: u32,
    ) {
        if force || min_interval_ms == 0 {
            self.write(key, value, now_ms);
            return;
        }

        let slot = self.slots.entry(key.to_string()).or_insert(PendingWrite {
            value,
            pending: false,
            last_write_ms: None,
            min_interval_ms,
        });
        slot.value = value;
        slot.min_interval_ms = min_interval_ms;
        slot.pending = true;

        let due = slot
            .last_write_ms
            .map_or(true, |last| now_ms.wrapping_sub(last) >= min_interval_ms);
        if due {
            self.write(key, value, now_ms);
        }
    }

    /// Flushes every parked write whose interval has elapsed. Returns how many
    /// keys were written.
    pub fn poll(&mut self, now_ms: u32) -> usize {
        let due: Vec<(String, u32)> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                slot.pending
                    && slot
                        .last_write_ms
                        .map_or(true, |last| now_ms.wrapping_sub(last) >= slot.min_interval_ms)
            })
            .map(|(key, slot)| (key.clone(), slot.value))
            .collect();

        let mut written = 0;
        for (key, value) in due {
            if self.write(&key, value, now_ms) {
                written += 1;
            }
        }
        if written > 0 {
            debug!("Flushed {} pending settings", written);
        }
        written
    }

    pub fn has_pending(&self) -> bool {
        self.slots.values().any(|slot| slot.pending)
    }
}

/// Live tunables backed by a debounced store. Every setter clamps its input
/// and returns the value actually applied.
pub struct AudioParams<S: KeyValueStore> {
    store: DebouncedStore<S>,
    tunables: Tunables,
}

impl<S: KeyValueStore> AudioParams<S> {
    /// Reads every key, clamping stored values and writing defaults for
    /// missing keys.
    pub fn load(store: S, defaults: Tunables, now_ms: u32) -> Self {
        let mut params = Self {
            store: DebouncedStore::new(store),
            tunables: defaults.clamped(),
        };
        let mut t = params.tunables;

        t.smoothing_alpha_q16 = clamp_smoothing_alpha_q16(params.load_word(
            keys::SMOOTHING_ALPHA,
            t.smoothing_alpha_q16,
            now_ms,
        ));

        t.perceptual = PerceptualConfig {
            attack_hz: params.load_fraction(keys::PERCEPT_ATTACK, t.perceptual.attack_hz, now_ms),
            release_hz: params.load_fraction(keys::PERCEPT_RELEASE, t.perceptual.release_hz, now_ms),
            knee: params.load_fraction(keys::PERCEPT_KNEE, t.perceptual.knee, now_ms),
            floor_tc_s: params.load_fraction(keys::PERCEPT_FLOOR_TC, t.perceptual.floor_tc_s, now_ms),
        }
        .clamped();

        t.downbeat = DownbeatConfig {
            beats_per_bar: params.load_word(
                keys::DOWNBEAT_BEATS_PER_BAR,
                t.downbeat.beats_per_bar as u32,
                now_ms,
            )
            .min(u8::MAX as u32) as u8,
            conf_on: params.load_fraction(keys::DOWNBEAT_CONF_ON, t.downbeat.conf_on, now_ms),
            conf_off: params.load_fraction(keys::DOWNBEAT_CONF_OFF, t.downbeat.conf_off, now_ms),
            env_decay: params.load_fraction(keys::DOWNBEAT_ENV_DECAY, t.downbeat.env_decay, now_ms),
        }
        .clamped();

        params.tunables = t;
        info!(
            "Loaded tunables: alpha {:.3}, knee {:.2}, downbeat {:.2}/{:.2}",
            t.smoothing_alpha_q16 as f32 / 65536.0,
            t.perceptual.knee,
            t.downbeat.conf_on,
            t.downbeat.conf_off
        );
        params
    }

    fn load_word(&mut self, key: &str, default: u32, now_ms: u32) -> u32 {
        match self.store.read(key) {
            Some(value) => value,
            None => {
                self.store.write_debounced(key, default, 0, true, now_ms);
                default
            }
        }
    }

    fn load_fraction(&mut self, key: &str, default: f32, now_ms: u32) -> f32 {
        decode_q16(self.load_word(key, encode_q16(default), now_ms))
    }

    fn persist(&mut self, key: &str, value: u32, now_ms: u32) {
        self.store
            .write_debounced(key, value, PERSIST_INTERVAL_MS, false, now_ms);
    }

    pub fn tunables(&self) -> Tunables {
        self.tunables
    }

    pub fn store(&self) -> &DebouncedStore<S> {
        &self.store
    }

    pub fn smoothing_alpha_q16(&self) -> u32 {
        self.tunables.smoothing_alpha_q16
    }

    pub fn set_smoothing_alpha_q16(&mut self, alpha_q16: u32, now_ms: u32) -> u32 {
        let alpha = clamp_smoothing_alpha_q16(alpha_q16);
        self.tunables.smoothing_alpha_q16 = alpha;
        self.persist(keys::SMOOTHING_ALPHA, alpha, now_ms);
        alpha
    }

    pub fn set_smoothing_tau_ms(&mut self, tau_ms: u32, now_ms: u32) -> u32 {
        self.set_smoothing_alpha_q16(alpha_q16_from_tau_ms(tau_ms), now_ms)
    }

    pub fn set_smoothing_profile(&mut self, profile: SmoothingProfile, now_ms: u32) -> u32 {
        let alpha_q16 = (profile.alpha() as f64 * 65536.0 + 0.5) as u32;
        self.set_smoothing_alpha_q16(alpha_q16, now_ms)
    }

    pub fn set_perceptual(&mut self, config: PerceptualConfig, now_ms: u32) -> PerceptualConfig {
        let c = config.clamped();
        self.tunables.perceptual = c;
        self.persist(keys::PERCEPT_ATTACK, encode_q16(c.attack_hz), now_ms);
        self.persist(keys::PERCEPT_RELEASE, encode_q16(c.release_hz), now_ms);
        self.persist(keys::PERCEPT_KNEE, encode_q16(c.knee), now_ms);
        self.persist(keys::PERCEPT_FLOOR_TC, encode_q16(c.floor_tc_s), now_ms);
        c
    }

    pub fn set_downbeat(&mut self, config: DownbeatConfig, now_ms: u32) -> DownbeatConfig {
        let c = config.clamped();
        self.tunables.downbeat = c;
        self.persist(keys::DOWNBEAT_CONF_ON, encode_q16(c.conf_on), now_ms);
        self.persist(keys::DOWNBEAT_CONF_OFF, encode_q16(c.conf_off), now_ms);
        self.persist(keys::DOWNBEAT_ENV_DECAY, encode_q16(c.env_decay), now_ms);
        self.persist(keys::DOWNBEAT_BEATS_PER_BAR, c.beats_per_bar as u32, now_ms);
        c
    }

    /// Flushes parked writes whose debounce interval has passed.
    pub fn poll(&mut self, now_ms: u32) -> usize {
        self.store.poll(now_ms)
    }
}
