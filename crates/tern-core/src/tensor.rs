// Tensor — a borrowed view over planned memory
//
// A tensor here is a descriptor, never an owner: dtype + shape + two
// offset-based regions, one for element data and one for the optional
// fixed-point parameter block. Shapes are written once by shape inference;
// regions are bound once by memory placement (the engine re-binds only the
// input layer's data region, sliding it across the caller's dataset slice
// micro-batch by micro-batch). Values are reached by resolving the regions
// against a live `Memory`.

use crate::arena::{cast, cast_mut, Memory, Region};
use crate::dtype::{DType, Element, QuantParams};
use crate::error::{Error, Result};
use crate::shape::Shape;

/// A tensor view: dtype, shape, and planned memory regions.
#[derive(Debug, Clone)]
pub struct Tensor {
    dtype: DType,
    shape: Shape,
    data: Option<Region>,
    qparams: Option<Region>,
}

impl Tensor {
    /// A tensor descriptor with no shape and no memory yet.
    pub fn unbound(dtype: DType) -> Self {
        Tensor {
            dtype,
            shape: Shape::empty(),
            data: None,
            qparams: None,
        }
    }

    /// A tensor descriptor with a known shape and no memory yet.
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Tensor {
            dtype,
            shape,
            data: None,
            qparams: None,
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Bytes of element data this tensor's shape requires.
    pub fn byte_len(&self) -> usize {
        self.elem_count() * self.dtype.size_in_bytes()
    }

    /// Set the shape. Shape inference calls this exactly once per compile;
    /// re-running inference must produce the same value (idempotence).
    pub fn set_shape(&mut self, shape: Shape) {
        self.shape = shape;
    }

    /// The bound data region.
    pub fn data(&self) -> Result<Region> {
        self.data.ok_or(Error::UnboundTensor)
    }

    /// Whether placement has bound element data yet.
    pub fn is_bound(&self) -> bool {
        self.data.is_some()
    }

    /// Bind the element-data region.
    pub fn bind_data(&mut self, region: Region) {
        self.data = Some(region);
    }

    /// The bound quantization-parameter region.
    pub fn qparams_region(&self) -> Result<Region> {
        self.qparams.ok_or(Error::UnboundTensor)
    }

    /// Whether a quantization-parameter block is bound.
    pub fn has_qparams(&self) -> bool {
        self.qparams.is_some()
    }

    /// Bind the quantization-parameter region.
    pub fn bind_qparams(&mut self, region: Region) {
        self.qparams = Some(region);
    }

    /// Read the quantization parameters from memory.
    pub fn quant_params(&self, mem: &Memory) -> Result<QuantParams> {
        mem.qparams(self.qparams_region()?)
    }

    /// Resolve the element data as a typed slice; the storage type must
    /// match the tensor's declared dtype.
    pub fn as_slice<'m, T: Element>(&self, mem: &'m Memory) -> Result<&'m [T]> {
        self.expect_dtype(T::DTYPE)?;
        cast(mem.bytes(self.data()?)?)
    }

    /// Mutable counterpart of [`Tensor::as_slice`].
    pub fn as_slice_mut<'m, T: Element>(&self, mem: &'m mut Memory) -> Result<&'m mut [T]> {
        self.expect_dtype(T::DTYPE)?;
        cast_mut(mem.bytes_mut(self.data()?)?)
    }

    /// Resolve the element data as f32.
    pub fn as_f32<'m>(&self, mem: &'m Memory) -> Result<&'m [f32]> {
        self.as_slice::<f32>(mem)
    }

    /// Resolve the element data as mutable f32.
    pub fn as_f32_mut<'m>(&self, mem: &'m mut Memory) -> Result<&'m mut [f32]> {
        self.as_slice_mut::<f32>(mem)
    }

    /// Resolve the element data as i8.
    pub fn as_i8<'m>(&self, mem: &'m Memory) -> Result<&'m [i8]> {
        self.as_slice::<i8>(mem)
    }

    /// Resolve the element data as mutable i8.
    pub fn as_i8_mut<'m>(&self, mem: &'m mut Memory) -> Result<&'m mut [i8]> {
        self.as_slice_mut::<i8>(mem)
    }

    /// Resolve the element data as i32.
    pub fn as_i32<'m>(&self, mem: &'m Memory) -> Result<&'m [i32]> {
        self.as_slice::<i32>(mem)
    }

    /// Resolve the element data as mutable i32.
    pub fn as_i32_mut<'m>(&self, mem: &'m mut Memory) -> Result<&'m mut [i32]> {
        self.as_slice_mut::<i32>(mem)
    }

    fn expect_dtype(&self, expected: DType) -> Result<()> {
        if self.dtype != expected {
            return Err(Error::DTypeMismatch {
                expected,
                got: self.dtype,
            });
        }
        Ok(())
    }
}
