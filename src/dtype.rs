// file: src/dtype.rs
// description: OCP microscaling element and scale types (FP4 E2M1, E8M0) and the 32-wide MX block.
// author: cipher-rc5
// created: 2026-02-21
// modified: 2026-10-19
use bytemuck::{Pod, Zeroable};
use std::fmt;

use crate::error::{Result, SchemeError};

/// Number of contiguous elements sharing one scale in the OCP MX formats.
pub const OCP_MX_BLOCK_SIZE: usize = 32;

/// Largest power of two representable by an E2M1 element (6.0 = 1.5 * 2^2).
pub const E2M1_EMAX: i32 = 2;

pub const E2M1_MAX: f32 = 6.0;

/// FP4 E2M1 values indexed by nibble. Bit layout: `[s | e1 | e0 | m]`.
pub const FP4_LUT: [f32; 16] = [
    0.0, 0.5, 1.0, 1.5, 2.0, 3.0, 4.0, 6.0, //
    0.0, -0.5, -1.0, -1.5, -2.0, -3.0, -4.0, -6.0,
];

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct MxFp4(u8);

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct F8E8M0(u8);

impl MxFp4 {
    pub const MAX: Self = Self(0x07);

    pub fn new(code: u8) -> Self {
        Self(code & 0x0F)
    }

    pub fn code(self) -> u8 {
        self.0
    }

    /// Round to the nearest E2M1 value, ties to the even code, saturating at ±6.
    pub fn from_f32(value: f32) -> Self {
        if value.is_nan() {
            return Self(0);
        }
        let sign = if value.is_sign_negative() { 0x08 } else { 0x00 };
        let abs_val = value.abs();
        if abs_val >= E2M1_MAX {
            return Self(sign | Self::MAX.0);
        }

        let mut best = 0u8;
        let mut best_err = f32::INFINITY;
        for (code, &magnitude) in FP4_LUT[..8].iter().enumerate() {
            let err = (abs_val - magnitude).abs();
            if err < best_err || (err == best_err && code % 2 == 0) {
                best = code as u8;
                best_err = err;
            }
        }

        Self(sign | best)
    }

    pub fn to_f32(self) -> f32 {
        FP4_LUT[self.0 as usize]
    }

    /// First element in the low nibble, second in the high nibble.
    pub fn pack_pair(a: MxFp4, b: MxFp4) -> u8 {
        (a.0 & 0x0F) | ((b.0 & 0x0F) << 4)
    }

    pub fn unpack_pair(packed: u8) -> (MxFp4, MxFp4) {
        (MxFp4(packed & 0x0F), MxFp4((packed >> 4) & 0x0F))
    }
}

impl F8E8M0 {
    pub const BIAS: i32 = 127;
    pub const NAN: Self = Self(0xFF);
    pub const ONE: Self = Self(127);

    pub fn new(code: u8) -> Self {
        Self(code)
    }

    pub fn code(self) -> u8 {
        self.0
    }

    pub fn from_exponent(exp: i32) -> Self {
        Self((exp.clamp(-Self::BIAS, Self::BIAS) + Self::BIAS) as u8)
    }

    pub fn from_f32(value: f32) -> Self {
        if value.is_nan() {
            return Self::NAN;
        }
        if value <= 0.0 {
            return Self(0);
        }
        Self::from_exponent(floor_log2(value))
    }

    pub fn exponent(self) -> i32 {
        self.0 as i32 - Self::BIAS
    }

    /// Bit-exact power of two; code 0 is the f32 subnormal 2^-127.
    pub fn to_f32(self) -> f32 {
        match self.0 {
            0xFF => f32::NAN,
            0 => f32::from_bits(0x0040_0000),
            code => f32::from_bits((code as u32) << 23),
        }
    }
}

/// `floor(log2(value))` for a positive value, exact for subnormals too.
pub(crate) fn floor_log2(value: f32) -> i32 {
    let bits = value.to_bits();
    let exp = ((bits >> 23) & 0xFF) as i32;
    if exp == 0 {
        let mantissa = bits & 0x007F_FFFF;
        return 31 - mantissa.leading_zeros() as i32 - 149;
    }
    exp - 127
}

/// Shared block scale per the OCP MX recipe: `2^(floor(log2(amax)) - emax)`.
pub fn shared_scale(block: &[f32]) -> F8E8M0 {
    let amax = block
        .iter()
        .filter(|v| v.is_finite())
        .fold(0.0f32, |acc, v| acc.max(v.abs()));
    if amax == 0.0 {
        return F8E8M0(0);
    }
    F8E8M0::from_exponent(floor_log2(amax) - E2M1_EMAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MxBlock {
    pub scale: F8E8M0,
    pub values: [MxFp4; OCP_MX_BLOCK_SIZE],
}

impl MxBlock {
    pub const PACKED_BYTES: usize = 1 + OCP_MX_BLOCK_SIZE / 2;

    pub fn new(scale: F8E8M0) -> Self {
        Self {
            scale,
            values: [MxFp4(0); OCP_MX_BLOCK_SIZE],
        }
    }

    pub fn from_f32_slice(values: &[f32]) -> Result<Self> {
        if values.len() != OCP_MX_BLOCK_SIZE {
            return Err(SchemeError::shape(format!(
                "MxBlock requires exactly {OCP_MX_BLOCK_SIZE} values, got {}",
                values.len()
            )));
        }

        let scale = shared_scale(values);
        let scale_f32 = scale.to_f32();
        let mut block = Self::new(scale);
        for (slot, &value) in block.values.iter_mut().zip(values) {
            *slot = MxFp4::from_f32(value / scale_f32);
        }
        Ok(block)
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        let scale = self.scale.to_f32();
        self.values.iter().map(|v| v.to_f32() * scale).collect()
    }

    /// Scale byte followed by 16 packed element bytes.
    pub fn pack(&self) -> Vec<u8> {
        let mut packed = Vec::with_capacity(Self::PACKED_BYTES);
        packed.push(self.scale.0);
        for pair in self.values.chunks_exact(2) {
            packed.push(MxFp4::pack_pair(pair[0], pair[1]));
        }
        packed
    }

    pub fn unpack(data: &[u8]) -> Option<Self> {
        if data.len() < Self::PACKED_BYTES {
            return None;
        }

        let mut block = Self::new(F8E8M0(data[0]));
        for (i, &byte) in data[1..Self::PACKED_BYTES].iter().enumerate() {
            let (a, b) = MxFp4::unpack_pair(byte);
            block.values[i * 2] = a;
            block.values[i * 2 + 1] = b;
        }
        Some(block)
    }
}

impl fmt::Display for MxFp4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f32())
    }
}

impl fmt::Display for F8E8M0 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "2^{}", self.exponent())
    }
}
