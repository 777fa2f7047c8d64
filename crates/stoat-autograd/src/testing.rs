//! Test doubles shared by the unit tests: a tensor with controllable device
//! and sparsity, plus a no-op graph node.

use std::any::Any;
use std::sync::{Arc, RwLock};

use stoat_core::{bail, Device, Result, Tensor};

use crate::function::{Edge, Function, FunctionFlags, FunctionMeta};
use crate::variable::{Variable, VariableList};

pub(crate) struct TestTensor {
    storage: Arc<RwLock<Vec<f64>>>,
    device: Device,
    sparse: bool,
}

impl TestTensor {
    pub(crate) fn new(values: &[f64], device: Device, sparse: bool) -> TestTensor {
        TestTensor {
            storage: Arc::new(RwLock::new(values.to_vec())),
            device,
            sparse,
        }
    }

    fn to_vec(&self) -> Vec<f64> {
        self.storage.read().unwrap().clone()
    }

    /// In-place write; the caller is responsible for bumping the owning
    /// variable's version counter.
    pub(crate) fn set(&self, index: usize, value: f64) {
        self.storage.write().unwrap()[index] = value;
    }
}

impl std::fmt::Debug for TestTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestTensor({:?})", self.to_vec())
    }
}

fn dense_values(other: &dyn Tensor) -> Result<Vec<f64>> {
    match other.as_any().downcast_ref::<TestTensor>() {
        Some(t) => Ok(t.to_vec()),
        None => bail!("TestTensor cannot operate with {:?}", other),
    }
}

impl Tensor for TestTensor {
    fn empty_like(&self) -> Box<dyn Tensor> {
        Box::new(TestTensor::new(&[], self.device, false))
    }

    fn clone_shallow(&self) -> Box<dyn Tensor> {
        Box::new(TestTensor {
            storage: Arc::clone(&self.storage),
            device: self.device,
            sparse: self.sparse,
        })
    }

    fn add_assign(&mut self, other: &dyn Tensor) -> Result<()> {
        let rhs = dense_values(other)?;
        let mut lhs = self.storage.write().unwrap();
        if lhs.is_empty() {
            *lhs = rhs;
            return Ok(());
        }
        if lhs.len() != rhs.len() {
            bail!("length mismatch: {} vs {}", lhs.len(), rhs.len());
        }
        for (l, r) in lhs.iter_mut().zip(rhs) {
            *l += r;
        }
        Ok(())
    }

    fn add_out(&self, other: &dyn Tensor) -> Result<Box<dyn Tensor>> {
        let rhs = dense_values(other)?;
        let lhs = self.to_vec();
        if lhs.len() != rhs.len() {
            bail!("length mismatch: {} vs {}", lhs.len(), rhs.len());
        }
        let sum: Vec<f64> = lhs.iter().zip(rhs).map(|(l, r)| l + r).collect();
        Ok(Box::new(TestTensor::new(&sum, self.device, false)))
    }

    fn is_sparse(&self) -> bool {
        self.sparse
    }

    fn device(&self) -> Device {
        self.device
    }

    fn nbytes(&self) -> usize {
        self.storage.read().unwrap().len() * std::mem::size_of::<f64>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn tensor(values: &[f64]) -> Box<dyn Tensor> {
    Box::new(TestTensor::new(values, Device::Cpu, false))
}

pub(crate) fn leaf(values: &[f64], requires_grad: bool, is_volatile: bool) -> Variable {
    Variable::leaf(tensor(values), requires_grad, is_volatile)
}

pub(crate) fn leaf_on(values: &[f64], device: Device) -> Variable {
    Variable::leaf(
        Box::new(TestTensor::new(values, device, false)),
        false,
        false,
    )
}

pub(crate) fn sparse_leaf(values: &[f64]) -> Variable {
    Variable::leaf(
        Box::new(TestTensor::new(values, Device::Cpu, true)),
        false,
        false,
    )
}

pub(crate) fn values(var: &Variable) -> Vec<f64> {
    var.data()
        .as_any()
        .downcast_ref::<TestTensor>()
        .expect("not a TestTensor")
        .to_vec()
}

/// Graph node that produces `n` empty outputs; used where tests only need
/// node identity and flags.
pub(crate) struct NoopFn {
    meta: FunctionMeta,
}

impl NoopFn {
    pub(crate) fn new(num_outputs: usize) -> NoopFn {
        let meta = FunctionMeta::with_flags(FunctionFlags {
            is_executable: false,
            is_volatile: false,
            next_functions: vec![Edge::dead(); num_outputs],
        });
        NoopFn { meta }
    }

    pub(crate) fn executable(self) -> NoopFn {
        self.meta.set_executable(true);
        self
    }
}

impl Function for NoopFn {
    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn apply(&self, _inputs: &VariableList) -> Result<VariableList> {
        Ok(vec![None; self.meta.num_outputs()])
    }

    fn name(&self) -> &'static str {
        "NoopFn"
    }
}
