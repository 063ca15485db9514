use std::ffi::{CStr, c_void};
use std::os::raw::c_char;

use crate::tensor::DType;

pub const KDL_CPU: i32 = 1;

pub const KDL_INT: u8 = 0;
pub const KDL_FLOAT: u8 = 2;
pub const KDL_BFLOAT: u8 = 4;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DLDevice {
    pub device_type: i32,
    pub device_id: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DLDataType {
    pub code: u8,
    pub bits: u8,
    pub lanes: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DLTensor {
    pub data: *mut c_void,
    pub device: DLDevice,
    pub ndim: i32,
    pub dtype: DLDataType,
    pub shape: *mut i64,
    pub strides: *mut i64,
    pub byte_offset: u64,
}

/// Argument block passed to the exported kernels:
///
/// ```c
/// int32_t mla_decode_stage1_fwd(const MlaStage1Args *args);
/// int32_t mla_prefill_fwd(const MlaStage1Args *args);      /* optional */
/// const char *mla_last_error(void);                          /* optional */
/// ```
///
/// Both return `0` on success.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct MlaStage1Args {
    pub q: DLTensor,
    pub kv_buffer: DLTensor,
    pub qo_indptr: DLTensor,
    pub kv_indptr: DLTensor,
    pub kv_indices: DLTensor,
    pub kv_last_page_lens: DLTensor,
    pub partial_out: DLTensor,
    pub partial_lse: DLTensor,
    pub max_seqlen_q: i32,
    pub num_kv_splits: i32,
    pub min_chunk_size: i32,
    pub sm_scale: f32,
}

pub type MlaStage1Fn = unsafe extern "C" fn(*const MlaStage1Args) -> i32;
pub type MlaLastErrorFn = unsafe extern "C" fn() -> *const c_char;

/// Shape and strides backing a [`DLTensor`]; must outlive the descriptor.
#[derive(Debug, Clone, Copy)]
pub struct HostTensorShape<const N: usize> {
    pub shape: [i64; N],
    pub strides: [i64; N],
}

impl<const N: usize> HostTensorShape<N> {
    pub fn contiguous(dims: [usize; N]) -> Self {
        let shape = dims.map(|d| d as i64);
        let mut strides = [1_i64; N];
        for i in (0..N.saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        Self { shape, strides }
    }

    /// Descriptor over host memory at `data`.
    pub fn describe(&mut self, data: *const c_void, dtype: DLDataType) -> DLTensor {
        DLTensor {
            data: data.cast_mut(),
            device: DLDevice {
                device_type: KDL_CPU,
                device_id: 0,
            },
            ndim: N as i32,
            dtype,
            shape: self.shape.as_mut_ptr(),
            strides: self.strides.as_mut_ptr(),
            byte_offset: 0,
        }
    }
}

pub fn dl_dtype(dtype: DType) -> DLDataType {
    match dtype {
        DType::F32 => DLDataType {
            code: KDL_FLOAT,
            bits: 32,
            lanes: 1,
        },
        DType::F16 => DLDataType {
            code: KDL_FLOAT,
            bits: 16,
            lanes: 1,
        },
        DType::BF16 => DLDataType {
            code: KDL_BFLOAT,
            bits: 16,
            lanes: 1,
        },
    }
}

pub fn dl_dtype_i32() -> DLDataType {
    DLDataType {
        code: KDL_INT,
        bits: 32,
        lanes: 1,
    }
}

/// Copies a NUL-terminated message owned by the kernel library.
///
/// # Safety
/// `ptr` must be null or point to a valid NUL-terminated string.
pub unsafe fn c_str_to_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: caller guarantees `ptr` is a valid C string.
    unsafe { CStr::from_ptr(ptr) }
        .to_string_lossy()
        .into_owned()
}
