use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use stoat_core::{Result, Tensor};

use crate::function::Function;
use crate::functions::accumulate_grad::AccumulateGrad;
use crate::version::VersionCounter;

// Variable — A tensor participating in the autograd graph
//
// A Variable is a handle (cheap to clone) over shared state: the tensor
// data, the accumulated gradient, the function that produced it, and the
// version counter policing in-place mutation. Gradient lists flowing
// through the engine are `Vec<Option<Variable>>`, where `None` stands for
// a zero gradient that was never materialised.
//
// OWNERSHIP:
//
//   - `data` is exclusively owned by this variable (behind a lock because
//     gradient accumulation mutates it in place on worker threads).
//   - `grad` is shared: users may hold the gradient variable directly.
//   - `grad_fn` is shared with the graph and with sibling outputs of the
//     same operation; it is fixed at construction.
//   - the gradient accumulator of a leaf is cached weakly so the graph
//     alone keeps it alive, never the leaf itself.

/// Gradient/variable list; `None` means a zero gradient.
pub type VariableList = Vec<Option<Variable>>;

/// Hook attached to a leaf variable; runs inside gradient accumulation and
/// may replace the incoming gradient.
pub trait VariableHook: Send + Sync {
    fn call(&self, grad: Variable) -> Result<Variable>;
}

pub(crate) struct VariableInner {
    data: RwLock<Box<dyn Tensor>>,
    grad: Mutex<Option<Variable>>,
    grad_fn: Option<Arc<dyn Function>>,
    version_counter: VersionCounter,
    requires_grad: bool,
    is_volatile: bool,
    output_nr: usize,
    grad_accumulator: Mutex<Option<Weak<dyn Function>>>,
    hooks: RwLock<Vec<Arc<dyn VariableHook>>>,
}

/// A tensor plus the autograd state that connects it to the graph.
pub struct Variable {
    inner: Arc<VariableInner>,
}

// Manual Clone: Arc::clone is cheap (just increments the refcount).
impl Clone for Variable {
    fn clone(&self) -> Self {
        Variable {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Variable {
    /// A leaf variable: an input to the forward graph.
    ///
    /// Volatile variables never require grad; volatility spreads to every
    /// result computed from them and suppresses graph construction.
    pub fn leaf(data: Box<dyn Tensor>, requires_grad: bool, is_volatile: bool) -> Variable {
        debug_assert!(
            !(requires_grad && is_volatile),
            "a volatile variable cannot require grad"
        );
        Variable::build(data, None, requires_grad, is_volatile, 0)
    }

    /// A non-leaf variable wrapping output slot `k` of `grad_fn`, where `k`
    /// is the number of outputs wired to the function so far. Claims the
    /// slot by incrementing the function's input count.
    pub fn from_fn(data: Box<dyn Tensor>, grad_fn: Arc<dyn Function>) -> Variable {
        let output_nr = grad_fn.meta().attach_input();
        let requires_grad = grad_fn.meta().is_executable();
        Variable::build(data, Some(grad_fn), requires_grad, false, output_nr)
    }

    /// Reconstruction used when unpacking a saved variable: all state is
    /// restored explicitly, including a previously captured accumulator.
    pub(crate) fn unpacked(
        data: Box<dyn Tensor>,
        grad_fn: Option<Arc<dyn Function>>,
        requires_grad: bool,
        is_volatile: bool,
        output_nr: usize,
        grad_accumulator: Option<&Arc<dyn Function>>,
    ) -> Variable {
        let var = Variable::build(data, grad_fn, requires_grad, is_volatile, output_nr);
        *var.inner.grad_accumulator.lock().unwrap() =
            grad_accumulator.map(|acc| Arc::downgrade(acc));
        var
    }

    fn build(
        data: Box<dyn Tensor>,
        grad_fn: Option<Arc<dyn Function>>,
        requires_grad: bool,
        is_volatile: bool,
        output_nr: usize,
    ) -> Variable {
        Variable {
            inner: Arc::new(VariableInner {
                data: RwLock::new(data),
                grad: Mutex::new(None),
                grad_fn,
                version_counter: VersionCounter::new(),
                requires_grad,
                is_volatile,
                output_nr,
                grad_accumulator: Mutex::new(None),
                hooks: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Read access to the tensor data.
    pub fn data(&self) -> RwLockReadGuard<'_, Box<dyn Tensor>> {
        self.inner.data.read().unwrap()
    }

    /// Write access to the tensor data. Replacing or mutating data through
    /// this guard does not bump the version counter; in-place tensor ops
    /// must call [`Variable::bump_version`] themselves.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<dyn Tensor>> {
        self.inner.data.write().unwrap()
    }

    /// The accumulated gradient, if any.
    pub fn grad(&self) -> Option<Variable> {
        self.inner.grad.lock().unwrap().clone()
    }

    pub(crate) fn grad_slot(&self) -> &Mutex<Option<Variable>> {
        &self.inner.grad
    }

    /// The function that produced this variable; `None` for leaves.
    pub fn grad_fn(&self) -> Option<&Arc<dyn Function>> {
        self.inner.grad_fn.as_ref()
    }

    pub fn requires_grad(&self) -> bool {
        self.inner.requires_grad
    }

    pub fn is_volatile(&self) -> bool {
        self.inner.is_volatile
    }

    /// Which output slot of `grad_fn` this variable was.
    pub fn output_nr(&self) -> usize {
        self.inner.output_nr
    }

    pub fn version_counter(&self) -> &VersionCounter {
        &self.inner.version_counter
    }

    /// Record an in-place mutation of the data. Called by the tensor
    /// library after any destructive op; the engine only observes.
    pub fn bump_version(&self) -> u64 {
        self.inner.version_counter.bump()
    }

    /// The gradient accumulator terminating backward at this leaf.
    ///
    /// Returns `None` as soon as `grad_fn` is set — before the
    /// `requires_grad` check — so only true leaves ever report one. For a
    /// leaf requiring grad, the same accumulator instance is returned for
    /// the variable's whole lifetime, created lazily and cached weakly so
    /// that only the graph keeps it alive.
    pub fn get_grad_accumulator(&self) -> Option<Arc<dyn Function>> {
        if self.inner.grad_fn.is_some() {
            return None;
        }
        if !self.inner.requires_grad {
            return None;
        }

        let mut cached = self.inner.grad_accumulator.lock().unwrap();
        if let Some(acc) = cached.as_ref().and_then(Weak::upgrade) {
            return Some(acc);
        }
        let acc: Arc<dyn Function> = Arc::new(AccumulateGrad::new(self));
        *cached = Some(Arc::downgrade(&acc));
        Some(acc)
    }

    /// Append a hook; hooks run in insertion order during accumulation.
    pub fn add_hook(&self, hook: Arc<dyn VariableHook>) {
        self.inner.hooks.write().unwrap().push(hook);
    }

    pub(crate) fn hooks(&self) -> Vec<Arc<dyn VariableHook>> {
        self.inner.hooks.read().unwrap().clone()
    }

    pub(crate) fn downgrade(&self) -> Weak<VariableInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<VariableInner>) -> Variable {
        Variable { inner }
    }

    /// True iff `other` is a handle to this same variable.
    pub fn same_as(&self, other: &Variable) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Variable(data={:?}, requires_grad={}, is_volatile={}, output_nr={}, leaf={})",
            &**self.data(),
            self.inner.requires_grad,
            self.inner.is_volatile,
            self.inner.output_nr,
            self.inner.grad_fn.is_none(),
        )
    }
}
