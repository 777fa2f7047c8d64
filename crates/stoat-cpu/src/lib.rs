//! # stoat-cpu
//!
//! A minimal dense CPU tensor implementing the [`stoat_core::Tensor`]
//! contract. The integration tests run the engine against it, and an
//! embedder adapting a real tensor library can use it as a template.

use std::any::Any;
use std::sync::{Arc, RwLock};

use stoat_core::{bail, Device, Error, Result, Tensor};

// CpuTensor — Dense one-dimensional f64 storage
//
// Storage sits behind Arc<RwLock<..>> so that shallow clones share it: an
// in-place write through one handle is visible through all of them, which
// is exactly the aliasing behaviour version counters exist to police.
//
// The `device` field is carried verbatim rather than derived from the
// storage. Tests (and embedders without a real accelerator runtime) place
// tensors on numbered devices to exercise the engine's routing; the values
// still live in host memory.

pub struct CpuTensor {
    storage: Arc<RwLock<Vec<f64>>>,
    device: Device,
}

impl CpuTensor {
    /// Dense tensor over the given values, on the CPU.
    pub fn from_vec(values: Vec<f64>) -> CpuTensor {
        CpuTensor {
            storage: Arc::new(RwLock::new(values)),
            device: Device::Cpu,
        }
    }

    /// Dense zero tensor of length `len`.
    pub fn zeros(len: usize) -> CpuTensor {
        CpuTensor::from_vec(vec![0.0; len])
    }

    /// Same tensor, reported as living on `device`.
    pub fn with_device(self, device: Device) -> CpuTensor {
        CpuTensor {
            storage: self.storage,
            device,
        }
    }

    pub fn len(&self) -> usize {
        self.storage.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the values.
    pub fn to_vec(&self) -> Vec<f64> {
        self.storage.read().unwrap().clone()
    }

    /// In-place write of a single element. The caller is responsible for
    /// bumping the owning variable's version counter.
    pub fn set(&self, index: usize, value: f64) {
        self.storage.write().unwrap()[index] = value;
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<f64>> {
        self.storage.read().unwrap()
    }
}

// Manual Clone: shares storage, like clone_shallow.
impl Clone for CpuTensor {
    fn clone(&self) -> Self {
        CpuTensor {
            storage: Arc::clone(&self.storage),
            device: self.device,
        }
    }
}

impl std::fmt::Debug for CpuTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CpuTensor(len={}, device={})", self.len(), self.device)
    }
}

/// Values of `other` as a dense vector, whatever its concrete type.
fn dense_values(other: &dyn Tensor) -> Result<Vec<f64>> {
    match other.as_any().downcast_ref::<CpuTensor>() {
        Some(t) => Ok(t.to_vec()),
        None => bail!("CpuTensor cannot operate with {:?}", other),
    }
}

impl Tensor for CpuTensor {
    fn empty_like(&self) -> Box<dyn Tensor> {
        Box::new(CpuTensor::from_vec(Vec::new()).with_device(self.device))
    }

    fn clone_shallow(&self) -> Box<dyn Tensor> {
        Box::new(self.clone())
    }

    fn add_assign(&mut self, other: &dyn Tensor) -> Result<()> {
        let rhs = dense_values(other)?;
        let mut lhs = self.storage.write().unwrap();
        if lhs.is_empty() {
            *lhs = rhs;
            return Ok(());
        }
        if lhs.len() != rhs.len() {
            bail!(
                "length mismatch in add_assign: {} vs {}",
                lhs.len(),
                rhs.len()
            );
        }
        for (l, r) in lhs.iter_mut().zip(rhs) {
            *l += r;
        }
        Ok(())
    }

    fn add_out(&self, other: &dyn Tensor) -> Result<Box<dyn Tensor>> {
        let rhs = dense_values(other)?;
        let lhs = self.read();
        if lhs.len() != rhs.len() {
            return Err(Error::msg(format!(
                "length mismatch in add_out: {} vs {}",
                lhs.len(),
                rhs.len()
            )));
        }
        let sum: Vec<f64> = lhs.iter().zip(rhs).map(|(l, r)| l + r).collect();
        Ok(Box::new(CpuTensor::from_vec(sum).with_device(self.device)))
    }

    fn is_sparse(&self) -> bool {
        false
    }

    fn device(&self) -> Device {
        self.device
    }

    fn nbytes(&self) -> usize {
        self.len() * std::mem::size_of::<f64>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
