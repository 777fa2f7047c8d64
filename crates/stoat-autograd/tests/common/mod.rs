//! Differentiable test operations built against the public surface, the
//! way an embedding tensor library would write them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use stoat_autograd::functions::wrap_outputs;
use stoat_autograd::{
    Device, Error, Function, FunctionMeta, Result, SavedVariable, Variable, VariableList,
};
use stoat_core::Tensor;
use stoat_cpu::CpuTensor;

/// Leaf over dense CPU values.
pub fn leaf(values: &[f64], requires_grad: bool) -> Variable {
    Variable::leaf(Box::new(CpuTensor::from_vec(values.to_vec())), requires_grad, false)
}

/// A volatile gradient, as a caller would seed backward with.
pub fn grad_of(values: &[f64]) -> Variable {
    Variable::leaf(Box::new(CpuTensor::from_vec(values.to_vec())), false, true)
}

/// A volatile gradient placed on a specific device.
pub fn grad_on(values: &[f64], device: Device) -> Variable {
    let data = CpuTensor::from_vec(values.to_vec()).with_device(device);
    Variable::leaf(Box::new(data), false, true)
}

/// Dense values of a variable's data.
pub fn values(var: &Variable) -> Vec<f64> {
    var.data()
        .as_any()
        .downcast_ref::<CpuTensor>()
        .expect("not a CpuTensor")
        .to_vec()
}

/// The concrete CPU tensor behind a variable, for in-place mutation.
pub fn cpu(var: &Variable) -> CpuTensor {
    var.data()
        .as_any()
        .downcast_ref::<CpuTensor>()
        .expect("not a CpuTensor")
        .clone()
}

fn boxed(values: Vec<f64>, device: Device) -> Box<dyn Tensor> {
    Box::new(CpuTensor::from_vec(values).with_device(device))
}

fn grad_values(grad: &Option<Variable>) -> Option<Vec<f64>> {
    grad.as_ref().map(|g| values(g))
}

// square — y = x * x, saving x for backward

struct SquareBackward {
    meta: FunctionMeta,
    saved: Mutex<Option<SavedVariable>>,
}

impl Function for SquareBackward {
    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn apply(&self, grads: &VariableList) -> Result<VariableList> {
        let saved = self.saved.lock().unwrap();
        let saved = saved
            .as_ref()
            .ok_or_else(|| Error::msg("saved variables have been freed"))?;
        let x = saved
            .unpack()?
            .ok_or_else(|| Error::msg("saved variable is empty"))?;
        let Some(g) = grad_values(&grads[0]) else {
            return Ok(vec![None]);
        };
        let x_vals = values(&x);
        let out: Vec<f64> = x_vals.iter().zip(g).map(|(x, g)| 2.0 * x * g).collect();
        Ok(vec![Some(grad_of(&out))])
    }

    fn release_variables(&self) {
        *self.saved.lock().unwrap() = None;
    }

    fn name(&self) -> &'static str {
        "SquareBackward"
    }
}

/// y = x²; the backward needs x, so it is saved and version-checked.
pub fn square(x: &Variable) -> Variable {
    let inputs = vec![Some(x.clone())];
    let out: Vec<f64> = values(x).iter().map(|v| v * v).collect();
    let saved = Mutex::new(Some(SavedVariable::new(x, false)));
    let outputs = wrap_outputs(&inputs, vec![boxed(out, Device::Cpu)], move |flags| {
        let backward: Arc<dyn Function> = Arc::new(SquareBackward {
            meta: FunctionMeta::with_flags(flags),
            saved,
        });
        backward
    });
    outputs.into_iter().next().flatten().unwrap()
}

// passthrough — identity that counts backward invocations

pub struct PassThroughBackward {
    meta: FunctionMeta,
    pub invocations: AtomicUsize,
    pub saw_missing_slots: AtomicUsize,
}

impl Function for PassThroughBackward {
    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn apply(&self, grads: &VariableList) -> Result<VariableList> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.saw_missing_slots
            .fetch_add(grads.iter().filter(|g| g.is_none()).count(), Ordering::SeqCst);
        Ok(vec![grads[0].clone()])
    }

    fn name(&self) -> &'static str {
        "PassThroughBackward"
    }
}

/// y = x, with an instrumented backward. Returns the output together with
/// the backward node so tests can read its counters.
pub fn passthrough(x: &Variable) -> (Variable, Arc<PassThroughBackward>) {
    let inputs = vec![Some(x.clone())];
    let out = values(x);
    let device = x.data().device();
    let mut node = None;
    let outputs = wrap_outputs(&inputs, vec![boxed(out, device)], |flags| {
        let backward = Arc::new(PassThroughBackward {
            meta: FunctionMeta::with_flags(flags),
            invocations: AtomicUsize::new(0),
            saw_missing_slots: AtomicUsize::new(0),
        });
        node = Some(Arc::clone(&backward));
        let backward: Arc<dyn Function> = backward;
        backward
    });
    let y = outputs.into_iter().next().flatten().unwrap();
    (y, node.unwrap())
}

// scale — y = factor * x, producing its backward gradient on a chosen device

struct ScaleBackward {
    meta: FunctionMeta,
    factor: f64,
    device: Device,
}

impl Function for ScaleBackward {
    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn apply(&self, grads: &VariableList) -> Result<VariableList> {
        let Some(g) = grad_values(&grads[0]) else {
            return Ok(vec![None]);
        };
        let out: Vec<f64> = g.iter().map(|g| self.factor * g).collect();
        Ok(vec![Some(grad_on(&out, self.device))])
    }

    fn name(&self) -> &'static str {
        "ScaleBackward"
    }
}

/// y = factor · x, with both the output and the backward's gradient placed
/// on `device`. Used to drive multi-device routing.
pub fn scale(x: &Variable, factor: f64, device: Device) -> Variable {
    let inputs = vec![Some(x.clone())];
    let out: Vec<f64> = values(x).iter().map(|v| factor * v).collect();
    let outputs = wrap_outputs(&inputs, vec![boxed(out, device)], |flags| {
        let backward: Arc<dyn Function> = Arc::new(ScaleBackward {
            meta: FunctionMeta::with_flags(flags),
            factor,
            device,
        });
        backward
    });
    outputs.into_iter().next().flatten().unwrap()
}

// fork — one input, two outputs; backward records which slots arrived

pub struct ForkBackward {
    meta: FunctionMeta,
    pub observed: Mutex<Vec<Vec<bool>>>,
}

impl Function for ForkBackward {
    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn apply(&self, grads: &VariableList) -> Result<VariableList> {
        self.observed
            .lock()
            .unwrap()
            .push(grads.iter().map(|g| g.is_some()).collect());
        // Missing gradients are zero; sum whatever arrived.
        let mut total: Option<Vec<f64>> = None;
        for g in grads.iter().flatten() {
            let vals = values(g);
            total = Some(match total {
                None => vals,
                Some(acc) => acc.iter().zip(vals).map(|(a, b)| a + b).collect(),
            });
        }
        Ok(vec![total.map(|t| grad_of(&t))])
    }

    fn name(&self) -> &'static str {
        "ForkBackward"
    }
}

/// (y0, y1) = (x, x): two outputs wired to one backward node.
pub fn fork(x: &Variable) -> (Variable, Variable, Arc<ForkBackward>) {
    let inputs = vec![Some(x.clone())];
    let out0 = values(x);
    let out1 = values(x);
    let mut node = None;
    let outputs = wrap_outputs(
        &inputs,
        vec![boxed(out0, Device::Cpu), boxed(out1, Device::Cpu)],
        |flags| {
            let backward = Arc::new(ForkBackward {
                meta: FunctionMeta::with_flags(flags),
                observed: Mutex::new(Vec::new()),
            });
            node = Some(Arc::clone(&backward));
            let backward: Arc<dyn Function> = backward;
            backward
        },
    );
    let mut outputs = outputs.into_iter();
    let y0 = outputs.next().flatten().unwrap();
    let y1 = outputs.next().flatten().unwrap();
    (y0, y1, node.unwrap())
}

// sample — stochastic node: runs unconditionally, ignores incoming grads

pub struct SampleBackward {
    meta: FunctionMeta,
    pub invocations: AtomicUsize,
    reward: f64,
}

impl Function for SampleBackward {
    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn apply(&self, grads: &VariableList) -> Result<VariableList> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        // Scheduled directly by the engine: no gradient ever arrives.
        assert!(grads.is_empty() || grads.iter().all(|g| g.is_none()));
        let n = self.meta.num_outputs();
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(Some(grad_of(&[self.reward])));
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "SampleBackward"
    }
}

/// A sampling op: y = x + noise. Its backward is stochastic
/// (reward-driven), so the engine must run it even when nothing consumes
/// its gradient.
pub fn sample(x: &Variable, reward: f64) -> (Variable, Arc<SampleBackward>) {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let inputs = vec![Some(x.clone())];
    let out: Vec<f64> = values(x)
        .iter()
        .map(|v| v + rng.gen_range(-0.5..0.5))
        .collect();
    let mut node = None;
    let outputs = wrap_outputs(&inputs, vec![boxed(out, Device::Cpu)], |flags| {
        let meta = FunctionMeta::with_flags(flags).stochastic();
        let backward = Arc::new(SampleBackward {
            meta,
            invocations: AtomicUsize::new(0),
            reward,
        });
        node = Some(Arc::clone(&backward));
        let backward: Arc<dyn Function> = backward;
        backward
    });
    let y = outputs.into_iter().next().flatten().unwrap();
    (y, node.unwrap())
}

// failing — backward that always errors

struct FailingBackward {
    meta: FunctionMeta,
    message: &'static str,
}

impl Function for FailingBackward {
    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn apply(&self, _grads: &VariableList) -> Result<VariableList> {
        Err(Error::msg(self.message))
    }

    fn name(&self) -> &'static str {
        "FailingBackward"
    }
}

/// y = x whose backward fails with `message`.
pub fn failing(x: &Variable, message: &'static str) -> Variable {
    let inputs = vec![Some(x.clone())];
    let out = values(x);
    let outputs = wrap_outputs(&inputs, vec![boxed(out, Device::Cpu)], |flags| {
        let backward: Arc<dyn Function> = Arc::new(FailingBackward {
            meta: FunctionMeta::with_flags(flags),
            message,
        });
        backward
    });
    outputs.into_iter().next().flatten().unwrap()
}

// bad_count — backward producing the wrong number of outputs

struct BadCountBackward {
    meta: FunctionMeta,
}

impl Function for BadCountBackward {
    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn apply(&self, _grads: &VariableList) -> Result<VariableList> {
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "BadCountBackward"
    }
}

/// y = x whose backward forgets to produce its gradient.
pub fn bad_count(x: &Variable) -> Variable {
    let inputs = vec![Some(x.clone())];
    let out = values(x);
    let outputs = wrap_outputs(&inputs, vec![boxed(out, Device::Cpu)], |flags| {
        let backward: Arc<dyn Function> = Arc::new(BadCountBackward {
            meta: FunctionMeta::with_flags(flags),
        });
        backward
    });
    outputs.into_iter().next().flatten().unwrap()
}
