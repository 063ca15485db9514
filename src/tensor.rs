use crate::error::MlaError;

/// Storage precision of a host tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    BF16,
}

/// Scalar storage type for queries, the KV buffer and outputs.
///
/// Arithmetic is never done in the storage type: values are widened with
/// [`Element::to_f32`] on load and narrowed with [`Element::from_f32`] on store.
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;

    fn to_f32(self) -> f32;

    fn from_f32(value: f32) -> Self;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Element for half::f16 {
    const DTYPE: DType = DType::F16;

    #[inline]
    fn to_f32(self) -> f32 {
        half::f16::to_f32(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        half::f16::from_f32(value)
    }
}

impl Element for half::bf16 {
    const DTYPE: DType = DType::BF16;

    #[inline]
    fn to_f32(self) -> f32 {
        half::bf16::to_f32(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        half::bf16::from_f32(value)
    }
}

/// Contiguous row-major rank-3 view: `[dim0, dim1, dim2]`.
#[derive(Debug, Clone, Copy)]
pub struct Tensor3D<'a, T> {
    pub data: &'a [T],
    pub dim0: usize,
    pub dim1: usize,
    pub dim2: usize,
}

impl<'a, T> Tensor3D<'a, T> {
    pub fn new(data: &'a [T], dim0: usize, dim1: usize, dim2: usize) -> Self {
        Self {
            data,
            dim0,
            dim1,
            dim2,
        }
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.dim0, self.dim1, self.dim2]
    }

    pub(crate) fn validate(&self, name: &'static str) -> Result<(), MlaError> {
        check_len(name, self.data.len(), &self.dims())
    }
}

/// Mutable counterpart of [`Tensor3D`], used for caller-owned outputs.
#[derive(Debug)]
pub struct Tensor3DMut<'a, T> {
    pub data: &'a mut [T],
    pub dim0: usize,
    pub dim1: usize,
    pub dim2: usize,
}

impl<'a, T> Tensor3DMut<'a, T> {
    pub fn new(data: &'a mut [T], dim0: usize, dim1: usize, dim2: usize) -> Self {
        Self {
            data,
            dim0,
            dim1,
            dim2,
        }
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.dim0, self.dim1, self.dim2]
    }

    pub(crate) fn validate(&self, name: &'static str) -> Result<(), MlaError> {
        check_len(name, self.data.len(), &self.dims())
    }
}

/// Paged KV buffer view: `[num_pages, page_size, num_kv_heads, head_dim]`.
///
/// `head_dim` holds the fused latent row, `kv_lora_rank + qk_rope_head_dim`.
/// In absorbed form the value vector is the leading `kv_lora_rank` features.
#[derive(Debug, Clone, Copy)]
pub struct Tensor4D<'a, T> {
    pub data: &'a [T],
    pub dim0: usize,
    pub dim1: usize,
    pub dim2: usize,
    pub dim3: usize,
}

impl<'a, T> Tensor4D<'a, T> {
    pub fn new(data: &'a [T], dim0: usize, dim1: usize, dim2: usize, dim3: usize) -> Self {
        Self {
            data,
            dim0,
            dim1,
            dim2,
            dim3,
        }
    }

    pub fn dims(&self) -> [usize; 4] {
        [self.dim0, self.dim1, self.dim2, self.dim3]
    }

    pub(crate) fn validate(&self, name: &'static str) -> Result<(), MlaError> {
        check_len(name, self.data.len(), &self.dims())
    }
}

fn check_len(name: &'static str, len: usize, dims: &[usize]) -> Result<(), MlaError> {
    let mut expected = 1_usize;
    for &dim in dims {
        if dim == 0 {
            return Err(MlaError::invalid_argument(format!(
                "{name} dimensions must be positive, got {dims:?}"
            )));
        }
        expected = expected
            .checked_mul(dim)
            .ok_or_else(|| MlaError::invalid_argument(format!("{name} element count overflow")))?;
    }
    if len != expected {
        return Err(MlaError::shape_mismatch(
            name,
            format!("{expected} elements for {dims:?}"),
            format!("{len} elements"),
        ));
    }
    Ok(())
}
