/// Novelty history depth: six seconds at the tick rate.
pub const HISTORY_FRAMES: usize = 750;

const EPSILON: f32 = 1.0e-6;
/// Peaks closer than this many lags to a stronger peak are dropped.
const PEAK_SUPPRESS_LAGS: usize = 4;
/// Largest integer ratio treated as a harmonic of a period.
const MAX_HARMONIC: u32 = 4;
/// Slack, in lags, when matching a period against an integer multiple.
const HARMONIC_TOLERANCE_LAGS: f32 = 1.0;
/// Upper bound on grid slots, i.e. on the slowest supported period in frames.
pub const MAX_GRID_SLOTS: usize = 256;

/// Fixed-size ring of novelty values, newest last.
#[derive(Debug, Clone)]
pub struct NoveltyRing {
    values: Vec<f32>,
    head: usize,
    full: bool,
}

impl NoveltyRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: vec![0.0; capacity.max(1)],
            head: 0,
            full: false,
        }
    }

    pub fn push(&mut self, value: f32) {
        self.values[self.head] = value;
        self.head = (self.head + 1) % self.values.len();
        if self.head == 0 {
            self.full = true;
        }
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    pub fn len(&self) -> usize {
        if self.full {
            self.values.len()
        } else {
            self.head
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Value `age` frames ago (0 = newest). Out-of-range ages read as zero.
    pub fn recent(&self, age: usize) -> f32 {
        if age >= self.len() {
            return 0.0;
        }
        let cap = self.values.len();
        self.values[(self.head + cap - 1 - age) % cap]
    }

    pub fn mean_recent(&self, frames: usize) -> f32 {
        let n = frames.min(self.len());
        if n == 0 {
            return 0.0;
        }
        (0..n).map(|age| self.recent(age)).sum::<f32>() / n as f32
    }

    pub fn max_recent(&self, frames: usize) -> f32 {
        (0..frames.min(self.len()))
            .map(|age| self.recent(age))
            .fold(0.0, f32::max)
    }

    /// Copies the newest `out.len()` values into `out`, newest first.
    pub fn copy_newest_first(&self, out: &mut [f32]) {
        for (age, v) in out.iter_mut().enumerate() {
            *v = self.recent(age);
        }
    }

    pub fn clear(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0.0);
        self.head = 0;
        self.full = false;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Peak {
    /// Period in frames, refined to sub-frame precision.
    pub period: f32,
    pub height: f32,
}

pub const MAX_PEAKS: usize = 4;

/// Fixed-capacity list of tempogram peaks, strongest first.
#[derive(Debug, Clone, Copy, Default)]
pub struct Peaks {
    items: [Peak; MAX_PEAKS],
    len: usize,
}

impl Peaks {
    pub fn as_slice(&self) -> &[Peak] {
        &self.items[..self.len]
    }

    pub fn first(&self) -> Option<Peak> {
        self.as_slice().first().copied()
    }

    pub fn get(&self, index: usize) -> Option<Peak> {
        self.as_slice().get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Height of the strongest peak that is not a multiple or divisor of
    /// `period`. Zero when every peak belongs to that family.
    pub fn unrelated_runner_up(&self, period: f32) -> f32 {
        self.as_slice()
            .iter()
            .filter(|p| !is_harmonic(p.period, period))
            .map(|p| p.height)
            .fold(0.0, f32::max)
    }
}

/// True when one period is within a lag of an integer multiple (up to
/// `MAX_HARMONIC`) of the other. A period is its own first harmonic.
pub fn is_harmonic(a: f32, b: f32) -> bool {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    if lo < 1.0 {
        return false;
    }
    let k = (hi / lo).round();
    k >= 1.0 && k <= MAX_HARMONIC as f32 && (hi - k * lo).abs() <= HARMONIC_TOLERANCE_LAGS
}

/// Exponentially smoothed, max-normalised autocorrelation of one novelty stream
/// over the lag range `[min_period, max_period]`.
#[derive(Debug, Clone)]
pub struct Tempogram {
    min_period: usize,
    max_period: usize,
    alpha: f32,
    smoothed: Vec<f32>,
    normalized: Vec<f32>,
    history: Vec<f32>,
}

impl Tempogram {
    pub fn new(min_period: usize, max_period: usize, alpha: f32) -> Self {
        let lags = max_period.saturating_sub(min_period) + 1;
        Self {
            min_period,
            max_period,
            alpha,
            smoothed: vec![0.0; lags],
            normalized: vec![0.0; lags],
            history: vec![0.0; HISTORY_FRAMES],
        }
    }

    pub fn lag_count(&self) -> usize {
        self.smoothed.len()
    }

    pub fn min_period(&self) -> usize {
        self.min_period
    }

    pub fn max_period(&self) -> usize {
        self.max_period
    }

    pub fn values(&self) -> &[f32] {
        &self.normalized
    }

    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|v| *v = 0.0);
        self.normalized.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Folds the current autocorrelation of `ring` into the smoothed tempogram.
    /// Returns false (leaving state untouched) while history is too short.
    pub fn update(&mut self, ring: &NoveltyRing) -> bool {
        let avail = ring.len();
        if avail < self.max_period + 2 {
            return false;
        }

        if self.history.len() < avail {
            self.history.resize(avail, 0.0);
        }
        let history = &mut self.history[..avail];
        ring.copy_newest_first(history);

        let mut max_val = EPSILON;
        for (lag_idx, acc) in self.smoothed.iter_mut().enumerate() {
            let period = self.min_period + lag_idx;
            let samples = avail - period;
            let sum: f32 = history[..samples]
                .iter()
                .zip(history[period..].iter())
                .map(|(a, b)| a * b)
                .sum();
            let acf = sum / samples as f32;
            *acc = (1.0 - self.alpha) * *acc + self.alpha * acf;
            max_val = max_val.max(*acc);
        }

        let inv = 1.0 / max_val;
        for (norm, &raw) in self.normalized.iter_mut().zip(self.smoothed.iter()) {
            *norm = raw * inv;
        }
        true
    }

    /// Normalised height at the lag nearest to `period`, clamped into range.
    pub fn height_at(&self, period: f32) -> f32 {
        if self.normalized.is_empty() {
            return 0.0;
        }
        let lag = (period.round() as isize - self.min_period as isize)
            .clamp(0, self.normalized.len() as isize - 1) as usize;
        self.normalized[lag]
    }

    /// Up to `MAX_PEAKS` local maxima, strongest first, with weaker neighbours
    /// inside the suppression radius removed. The first and last lag count as
    /// maxima when they are not below their single neighbour.
    pub fn peaks(&self) -> Peaks {
        let acf = &self.normalized;
        let mut out = Peaks::default();
        let mut taken = [0usize; MAX_PEAKS];

        while out.len < MAX_PEAKS {
            let mut best: Option<usize> = None;
            for i in 0..acf.len() {
                let left = if i > 0 { acf[i - 1] } else { 0.0 };
                let right = acf.get(i + 1).copied().unwrap_or(0.0);
                let is_max = acf[i] > 0.0 && acf[i] >= left && acf[i] >= right;
                if !is_max || taken[..out.len].iter().any(|&k| k.abs_diff(i) <= PEAK_SUPPRESS_LAGS) {
                    continue;
                }
                if best.map_or(true, |b| acf[i] > acf[b]) {
                    best = Some(i);
                }
            }
            let Some(idx) = best else {
                break;
            };
            taken[out.len] = idx;
            out.items[out.len] = Peak {
                period: self.min_period as f32 + idx as f32 + self.interpolate(idx),
                height: acf[idx],
            };
            out.len += 1;
        }
        out
    }

    /// Parabolic offset of the true maximum around `idx`, in `[-0.5, 0.5]`.
    fn interpolate(&self, idx: usize) -> f32 {
        let acf = &self.normalized;
        if idx == 0 || idx + 1 >= acf.len() {
            return 0.0;
        }
        let (a, b, c) = (acf[idx - 1], acf[idx], acf[idx + 1]);
        let denom = a - 2.0 * b + c;
        if denom.abs() <= EPSILON {
            return 0.0;
        }
        (0.5 * (a - c) / denom).clamp(-0.5, 0.5)
    }
}

/// Margin of `height` over the runner-up peak, relative to `height`.
pub fn prominence(height: f32, runner_up: f32) -> f32 {
    if height <= EPSILON {
        return 0.0;
    }
    let diff = height - runner_up;
    if diff <= 0.0 {
        return 0.0;
    }
    (diff / (height + EPSILON)).min(1.0)
}

/// How well a beat grid of `period` frames explains the recent novelty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridAlignment {
    /// Fraction of novelty energy landing within the tolerance of the best grid.
    pub score: f32,
    /// Frames elapsed since the most recent grid line of the best grid.
    pub offset: f32,
}

/// Scores every grid offset over the last `window` frames of `ring` and keeps
/// the best. Tolerance is 5% of the period, at least one frame.
pub fn grid_alignment(ring: &NoveltyRing, period: f32, window: usize) -> GridAlignment {
    let none = GridAlignment {
        score: 0.0,
        offset: 0.0,
    };
    if period < 1.0 {
        return none;
    }
    let frames = window.min(ring.len());
    if frames == 0 {
        return none;
    }

    let slots = (period.ceil() as usize).min(MAX_GRID_SLOTS);
    let mut histogram = [0.0f32; MAX_GRID_SLOTS];
    let mut total = 0.0f32;
    for age in 0..frames {
        let v = ring.recent(age);
        if v <= 0.0 {
            continue;
        }
        let slot = ((age as f32 % period) as usize).min(slots - 1);
        histogram[slot] += v;
        total += v;
    }
    if total <= EPSILON {
        return none;
    }

    let tolerance = ((0.05 * period).round() as usize).max(1);
    let mut best_slot = 0;
    let mut best_energy = -1.0f32;
    for center in 0..slots {
        let mut energy = 0.0;
        for d in 0..=(2 * tolerance) {
            let slot = (center + slots + d - tolerance) % slots;
            energy += histogram[slot];
        }
        let tie = (energy - best_energy).abs() <= EPSILON;
        if energy > best_energy + EPSILON || (tie && histogram[center] > histogram[best_slot]) {
            best_energy = energy;
            best_slot = center;
        }
    }

    GridAlignment {
        score: (best_energy / total).clamp(0.0, 1.0),
        offset: best_slot as f32,
    }
}
