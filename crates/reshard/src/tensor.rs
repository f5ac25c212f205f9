use core::fmt;

use serde::{Deserialize, Serialize};

/// Element type of a stored tensor.
///
/// Dtypes are carried through a conversion untouched; only whole elements are ever moved.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DType {
    /// 64-bit float.
    F64,
    /// 32-bit float.
    F32,
    /// IEEE half precision.
    F16,
    /// bfloat16.
    BF16,
    /// 64-bit signed integer.
    I64,
    /// 32-bit signed integer.
    I32,
    /// 8-bit signed integer.
    I8,
    /// 8-bit unsigned integer.
    U8,
}

impl DType {
    /// Size of one element in bytes. Also the natural alignment inside a shard blob.
    pub const fn size(self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I8 | DType::U8 => 1,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F64 => "F64",
            DType::F32 => "F32",
            DType::F16 => "F16",
            DType::BF16 => "BF16",
            DType::I64 => "I64",
            DType::I32 => "I32",
            DType::I8 => "I8",
            DType::U8 => "U8",
        };
        f.write_str(name)
    }
}

/// Number of elements described by `shape`.
pub fn num_elements(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Bytes taken by a `dtype` tensor of `shape`, or `None` when that overflows `usize`.
pub fn checked_byte_len(dtype: DType, shape: &[usize]) -> Option<usize> {
    shape
        .iter()
        .try_fold(dtype.size(), |len, &dim| len.checked_mul(dim))
}

/// Raw contents of one parameter shard: dtype, shape and little-endian bytes.
///
/// The resharding engine never interprets the values. Merging and splitting are byte
/// moves at element granularity, so every dtype round-trips bit for bit.
#[derive(Clone, PartialEq, Eq)]
pub struct TensorData {
    dtype: DType,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl fmt::Debug for TensorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorData")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("num_bytes", &self.bytes.len())
            .finish()
    }
}

impl TensorData {
    /// Wraps raw bytes, returning `None` when their length does not match `shape` and `dtype`.
    pub fn new(dtype: DType, shape: Vec<usize>, bytes: Vec<u8>) -> Option<Self> {
        (checked_byte_len(dtype, &shape) == Some(bytes.len())).then_some(Self {
            dtype,
            shape,
            bytes,
        })
    }

    /// A zero-filled tensor.
    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Self {
        let len = num_elements(&shape) * dtype.size();
        Self {
            dtype,
            shape,
            bytes: vec![0; len],
        }
    }

    /// Builds an `F32` tensor from values.
    ///
    /// # Panics
    ///
    /// Panics if `values.len()` does not match `shape`.
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Self {
        assert_eq!(
            num_elements(&shape),
            values.len(),
            "value count does not match shape {shape:?}"
        );
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self {
            dtype: DType::F32,
            shape,
            bytes,
        }
    }

    /// Decodes the bytes as `f32` values, if the dtype is `F32`.
    pub fn to_f32(&self) -> Option<Vec<f32>> {
        (self.dtype == DType::F32).then(|| {
            self.bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect()
        })
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Dimensions.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Raw little-endian bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the tensor, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Length in bytes.
    pub fn num_bytes(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes spanned by one index of the leading dimension.
    fn leading_stride(&self) -> usize {
        num_elements(&self.shape[1..]) * self.dtype.size()
    }

    /// Bytes spanned by the trailing dimension, i.e. one contiguous "row" in trailing order.
    fn trailing_stride(&self) -> usize {
        self.shape.last().copied().unwrap_or(1) * self.dtype.size()
    }

    /// Concatenates along the leading dimension.
    ///
    /// Callers guarantee that every part shares dtype and all non-leading dimensions.
    pub(crate) fn concat_leading(parts: &[TensorData]) -> TensorData {
        let first = &parts[0];
        let mut shape = first.shape.clone();
        shape[0] = parts.iter().map(|p| p.shape[0]).sum();
        let mut bytes = Vec::with_capacity(parts.iter().map(|p| p.bytes.len()).sum());
        for part in parts {
            bytes.extend_from_slice(&part.bytes);
        }
        TensorData {
            dtype: first.dtype,
            shape,
            bytes,
        }
    }

    /// Concatenates along the trailing dimension.
    ///
    /// Callers guarantee that every part shares dtype and all non-trailing dimensions.
    pub(crate) fn concat_trailing(parts: &[TensorData]) -> TensorData {
        let first = &parts[0];
        let last = first.shape.len() - 1;
        let mut shape = first.shape.clone();
        shape[last] = parts.iter().map(|p| p.shape[last]).sum();
        let outer = num_elements(&first.shape[..last]);
        let mut bytes = Vec::with_capacity(parts.iter().map(|p| p.bytes.len()).sum());
        for row in 0..outer {
            for part in parts {
                let stride = part.trailing_stride();
                bytes.extend_from_slice(&part.bytes[row * stride..(row + 1) * stride]);
            }
        }
        TensorData {
            dtype: first.dtype,
            shape,
            bytes,
        }
    }

    /// Splits the leading dimension into chunks of `sizes[i]` indices each.
    pub(crate) fn split_leading(&self, sizes: &[usize]) -> Vec<TensorData> {
        let stride = self.leading_stride();
        let mut offset = 0;
        sizes
            .iter()
            .map(|&size| {
                let mut shape = self.shape.clone();
                shape[0] = size;
                let bytes = self.bytes[offset * stride..(offset + size) * stride].to_vec();
                offset += size;
                TensorData {
                    dtype: self.dtype,
                    shape,
                    bytes,
                }
            })
            .collect()
    }

    /// Splits the trailing dimension into `parts` equal chunks.
    pub(crate) fn split_trailing(&self, parts: usize) -> Vec<TensorData> {
        let last = self.shape.len() - 1;
        let chunk = self.shape[last] / parts;
        let outer = num_elements(&self.shape[..last]);
        let row_stride = self.trailing_stride();
        let chunk_stride = chunk * self.dtype.size();

        (0..parts)
            .map(|part| {
                let mut shape = self.shape.clone();
                shape[last] = chunk;
                let mut bytes = Vec::with_capacity(outer * chunk_stride);
                for row in 0..outer {
                    let start = row * row_stride + part * chunk_stride;
                    bytes.extend_from_slice(&self.bytes[start..start + chunk_stride]);
                }
                TensorData {
                    dtype: self.dtype,
                    shape,
                    bytes,
                }
            })
            .collect()
    }

    /// Resizes the leading dimension to `rows`, truncating or appending zero rows.
    pub(crate) fn resize_leading(mut self, rows: usize) -> TensorData {
        let stride = self.leading_stride();
        self.bytes.resize(rows * stride, 0);
        self.shape[0] = rows;
        self
    }
}
