use bytes::Bytes;
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda { device_id: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    I64,
    I32,
    U8,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 => 2,
            DType::I64 => 8,
            DType::U8 => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn rank(&self) -> usize {
        self.0.len()
    }
    pub fn numel(&self) -> usize {
        self.0.iter().product::<usize>().max(1)
    }
    pub fn dims(&self) -> &[usize] {
        &self.0
    }
}

#[derive(Clone, Debug)]
pub struct TensorDesc {
    pub dtype: DType,
    pub shape: Shape,
    pub device: Device,
}

#[derive(Clone, Debug)]
pub struct PinnedBuf {
    pub bytes: Bytes,
}

#[derive(Clone, Debug)]
pub struct CudaBuf {
    pub device_id: u32,
    pub bytes: Bytes, // placeholder (real impl = device pointer + drop)
}

/// Owns the storage for a tensor.
/// CPU variants hold refcounted buffers; cloning never copies contents.
#[derive(Clone, Debug)]
pub enum TensorStorage {
    CpuBytes(Bytes),
    CpuPinned(PinnedBuf),
    CudaDevice(CudaBuf),
}

#[derive(Clone, Debug)]
pub struct Tensor {
    pub desc: TensorDesc,
    pub storage: TensorStorage,
    pub byte_len: usize,
}

impl Tensor {
    pub fn from_cpu_bytes(dtype: DType, shape: Shape, bytes: Bytes) -> Self {
        let byte_len = bytes.len();
        Self {
            desc: TensorDesc {
                dtype,
                shape,
                device: Device::Cpu,
            },
            storage: TensorStorage::CpuBytes(bytes),
            byte_len,
        }
    }

    /// Contents as host memory; `None` for device tensors.
    pub fn host_bytes(&self) -> Option<&Bytes> {
        match &self.storage {
            TensorStorage::CpuBytes(bytes) => Some(bytes),
            TensorStorage::CpuPinned(p) => Some(&p.bytes),
            TensorStorage::CudaDevice(_) => None,
        }
    }

    /// Byte length implied by shape and dtype; `byte_len` holds the actual
    /// buffer length.
    pub fn expected_byte_len(&self) -> usize {
        self.desc.shape.numel() * self.desc.dtype.size_in_bytes()
    }
}
