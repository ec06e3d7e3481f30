use std::fmt;

// DType — numeric formats the engine plans memory for
//
// Every tensor carries a DType that determines its element byte size and
// whether it needs a quantization-parameter block alongside its data:
//
//   F32 — 32-bit IEEE float, the training workhorse
//   Q7  — 8-bit fixed point, activations and weights on integer-only targets
//   Q31 — 32-bit fixed point, accumulators and biases paired with Q7 weights
//
// The fixed-point encoding is power-of-two scaled:
//
//   real ≈ (q - zero) / 2^shift
//
// so rescaling between layers is a shift, never a divide — the target
// hardware may have no FPU and no fast divider.

/// Enum of all supported element data types.
///
/// Stored inside every tensor so the planner can compute byte requirements
/// and the engine can dispatch to the correct typed kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    Q7,
    Q31,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::Q7 => 1,
            DType::Q31 => 4,
        }
    }

    /// Byte size of the per-tensor quantization-parameter block, if the
    /// format needs one. Float tensors carry no parameter block.
    pub fn quant_params_size(&self) -> Option<usize> {
        match self {
            DType::F32 => None,
            DType::Q7 | DType::Q31 => Some(std::mem::size_of::<QuantParams>()),
        }
    }

    /// Whether this dtype is a fixed-point format.
    pub fn is_quantized(&self) -> bool {
        self.quant_params_size().is_some()
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::Q7 => "q7",
            DType::Q31 => "q31",
        };
        write!(f, "{}", s)
    }
}

// QuantParams — the opaque per-tensor metadata block of the fixed-point
// formats. POD so it can live in a planned byte region and be read back
// without any serialization step.

/// Fixed-point quantization parameters: `real ≈ (q - zero) / 2^shift`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct QuantParams {
    /// Scale as a left shift: one unit of `q` is `2^-shift` in real terms.
    pub shift: u32,
    /// Zero point: the integer value that represents real 0.
    pub zero: i32,
}

impl QuantParams {
    /// Identity parameters (shift 0, zero 0).
    pub const NONE: QuantParams = QuantParams { shift: 0, zero: 0 };

    /// Derive parameters for an i8 target covering `[min, max]`.
    ///
    /// Picks the largest shift whose step still spans the range with 255
    /// levels, then anchors `min` at -128. Ranges wider than 255 saturate at
    /// shift 0; precision degrades but values stay representable.
    pub fn from_range(min: f32, max: f32) -> QuantParams {
        let range = (max - min).max(f32::EPSILON);
        let mut shift = 0u32;
        while shift < 31 && (range * (1u32 << (shift + 1)) as f32) <= 255.0 {
            shift += 1;
        }
        let zero = (-128.0 - min * (1u32 << shift) as f32).round() as i32;
        QuantParams { shift, zero }
    }

    /// Derive symmetric parameters (zero = 0) for an i8 target covering
    /// `[-max_abs, max_abs]`. Used for weights.
    pub fn from_symmetric_max(max_abs: f32) -> QuantParams {
        let max_abs = max_abs.max(f32::EPSILON);
        let mut shift = 0u32;
        while shift < 31 && (max_abs * (1u32 << (shift + 1)) as f32) <= 127.0 {
            shift += 1;
        }
        QuantParams { shift, zero: 0 }
    }

    /// Quantize a real value to the integer grid (unclamped width; the
    /// caller clamps to its storage type).
    pub fn quantize_f32(&self, v: f32) -> i32 {
        (v * (1u64 << self.shift) as f32).round() as i32 + self.zero
    }

    /// Recover the approximate real value of a grid point.
    pub fn dequantize_to_f32(&self, q: i32) -> f32 {
        (q - self.zero) as f32 / (1u64 << self.shift) as f32
    }

    /// Smallest real value representable by an i8 under these parameters.
    pub fn min_f32(&self) -> f32 {
        self.dequantize_to_f32(i8::MIN as i32)
    }

    /// Largest real value representable by an i8 under these parameters.
    pub fn max_f32(&self) -> f32 {
        self.dequantize_to_f32(i8::MAX as i32)
    }
}

// Element — trait connecting Rust storage types to the DType enum
//
// The bridge between Rust's type system and the runtime descriptor, so
// generic code can resolve a region into the right slice type.

/// Trait implemented by Rust types that can back a tensor region.
pub trait Element:
    Copy + Send + Sync + 'static + bytemuck::Pod + num_traits::NumCast + fmt::Debug
{
    /// The corresponding DType enum variant.
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}

impl Element for i8 {
    const DTYPE: DType = DType::Q7;
}

impl Element for i32 {
    const DTYPE: DType = DType::Q31;
}
