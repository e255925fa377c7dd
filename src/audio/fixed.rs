use bytemuck::{Pod, Zeroable};

/// Full-scale magnitude of a 24-bit capture sample carried in an `i32`.
pub const Q24_FULL_SCALE: i32 = 8_388_607;

/// Signed Q16.16 fixed-point value.
///
/// Every arithmetic helper saturates instead of wrapping, so a runaway
/// accumulation pins at the rail rather than flipping sign.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
pub struct Q16(pub i32);

impl Q16 {
    pub const FRAC_BITS: u32 = 16;
    pub const ZERO: Q16 = Q16(0);
    pub const ONE: Q16 = Q16(1 << 16);
    /// Largest value strictly below 1.0.
    pub const UNIT_MAX: Q16 = Q16(0xFFFF);
    pub const MAX: Q16 = Q16(i32::MAX);
    pub const MIN: Q16 = Q16(i32::MIN);

    pub fn from_raw(raw: i32) -> Self {
        Q16(raw)
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    /// Round-to-nearest conversion. NaN maps to zero, out-of-range values saturate.
    pub fn from_f32(value: f32) -> Self {
        if value.is_nan() {
            return Q16::ZERO;
        }
        let scaled = (value as f64 * 65536.0).round();
        if scaled >= i32::MAX as f64 {
            Q16::MAX
        } else if scaled <= i32::MIN as f64 {
            Q16::MIN
        } else {
            Q16(scaled as i32)
        }
    }

    /// Encodes a linear magnitude clamped to `[0, 1)`.
    pub fn from_unit(value: f32) -> Self {
        let q = Self::from_f32(value);
        Q16(q.0.clamp(0, Self::UNIT_MAX.0))
    }

    /// Encodes a fraction clamped to `[0, 1]` inclusive.
    pub fn from_fraction(value: f32) -> Self {
        let q = Self::from_f32(value);
        Q16(q.0.clamp(0, Self::ONE.0))
    }

    pub fn to_f32(self) -> f32 {
        self.0 as f32 / 65536.0
    }

    pub fn saturating_add(self, rhs: Q16) -> Q16 {
        Q16(self.0.saturating_add(rhs.0))
    }

    pub fn saturating_sub(self, rhs: Q16) -> Q16 {
        Q16(self.0.saturating_sub(rhs.0))
    }

    pub fn saturating_mul(self, rhs: Q16) -> Q16 {
        let wide = (self.0 as i64 * rhs.0 as i64) >> Self::FRAC_BITS;
        Q16(wide.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
    }

    /// Sums in 64-bit and saturates once at the end.
    pub fn saturating_sum<I: IntoIterator<Item = Q16>>(values: I) -> Q16 {
        let total: i64 = values.into_iter().map(|v| v.0 as i64).sum();
        Q16(total.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
    }

    pub fn clamp(self, lo: Q16, hi: Q16) -> Q16 {
        Q16(self.0.clamp(lo.0, hi.0))
    }
}

/// Signed Q1.15 fixed-point value, used for windows and the waveform view.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
pub struct Q15(pub i16);

impl Q15 {
    pub const ZERO: Q15 = Q15(0);
    pub const MAX: Q15 = Q15(i16::MAX);

    pub fn from_f32(value: f32) -> Self {
        if value.is_nan() {
            return Q15::ZERO;
        }
        let scaled = (value * 32767.0).round();
        Q15(scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16)
    }

    /// Narrows a Q24 capture sample by dropping eight bits, with rounding.
    pub fn from_q24(sample: i32) -> Self {
        let rounded = (sample as i64 + 128) >> 8;
        Q15(rounded.clamp(i16::MIN as i64, i16::MAX as i64) as i16)
    }

    pub fn to_f32(self) -> f32 {
        self.0 as f32 / 32767.0
    }
}

/// Converts a float sample in `[-1, 1]` to the Q24 capture format.
pub fn q24_from_f32(sample: f32) -> i32 {
    if sample.is_nan() {
        return 0;
    }
    (sample.clamp(-1.0, 1.0) * Q24_FULL_SCALE as f32).round() as i32
}
