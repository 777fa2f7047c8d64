use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use stoat_core::Result;

use crate::variable::{Variable, VariableList};

// Function — Polymorphic graph node
//
// A Function is a single operation from one or more variables to one or
// more variables. Subclasses may represent "forward" or "backward"
// operations (a forward op and its derivative are both Functions; some
// nodes serve as both). The engine drives every node through the same
// narrow interface: `apply` to run it, `next_functions` to know where its
// outputs flow, and a pair of flags deciding whether and when it runs.
//
// Shared node state lives in FunctionMeta, which every implementation
// embeds and exposes through `meta()`. That is the trait-object rendition
// of shared base-class fields: the engine reads flags and edges without
// knowing the concrete node type.

/// One outgoing edge in the reverse graph: the target function, and which
/// of its input slots this edge feeds.
#[derive(Clone)]
pub struct Edge {
    /// Gradient sink, or `None` for a dead edge that only preserves
    /// positional alignment with the source's outputs.
    pub function: Option<Arc<dyn Function>>,
    /// Input slot of `function` this edge feeds.
    pub input_nr: usize,
}

impl Edge {
    pub fn new(function: Arc<dyn Function>, input_nr: usize) -> Edge {
        Edge {
            function: Some(function),
            input_nr,
        }
    }

    /// An edge that drops its gradient.
    pub fn dead() -> Edge {
        Edge {
            function: None,
            input_nr: 0,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.function.is_none()
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(func) => write!(f, "Edge({} #{})", func.name(), self.input_nr),
            None => write!(f, "Edge(dead)"),
        }
    }
}

/// Pointer-identity key for hash maps over graph nodes.
///
/// Two keys are equal iff they were taken from handles to the same node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionKey(usize);

impl FunctionKey {
    pub fn of(function: &Arc<dyn Function>) -> FunctionKey {
        FunctionKey(Arc::as_ptr(function) as *const () as usize)
    }

    pub fn of_ref(function: &dyn Function) -> FunctionKey {
        FunctionKey(function as *const dyn Function as *const () as usize)
    }
}

/// Hook run before a function's apply; receives the gathered input
/// gradients and returns a list of the same length.
pub trait FunctionPreHook: Send + Sync {
    fn call(&self, grads: VariableList) -> Result<VariableList>;
}

/// Hook run after a function's apply; may replace the outputs.
pub trait FunctionPostHook: Send + Sync {
    fn call(&self, outputs: VariableList, inputs: &VariableList) -> Result<VariableList>;
}

/// Flags computed from an operation's forward inputs, deciding how the
/// resulting node participates in backward.
///
/// - any volatile input poisons the node: not executable, no edges;
/// - otherwise the node is executable iff any input requires grad, and
///   carries one edge per input (dead where the input does not require
///   grad) so edge positions line up with apply's outputs.
pub struct FunctionFlags {
    pub is_executable: bool,
    pub is_volatile: bool,
    pub next_functions: Vec<Edge>,
}

impl FunctionFlags {
    pub fn of(inputs: &[Option<Variable>]) -> FunctionFlags {
        let mut is_executable = false;
        let mut is_volatile = false;
        for var in inputs.iter().flatten() {
            is_executable |= var.requires_grad();
            is_volatile |= var.is_volatile();
        }
        if is_volatile || !is_executable {
            return FunctionFlags {
                is_executable: false,
                is_volatile,
                next_functions: Vec::new(),
            };
        }

        let next_functions = inputs
            .iter()
            .map(|var| match var {
                Some(var) => {
                    if let Some(grad_fn) = var.grad_fn() {
                        Edge::new(grad_fn.clone(), var.output_nr())
                    } else if var.requires_grad() {
                        // A leaf that requires grad always yields an
                        // accumulator here (grad_fn is None).
                        var.get_grad_accumulator()
                            .map_or_else(Edge::dead, |acc| Edge::new(acc, 0))
                    } else {
                        Edge::dead()
                    }
                }
                None => Edge::dead(),
            })
            .collect();

        FunctionFlags {
            is_executable: true,
            is_volatile: false,
            next_functions,
        }
    }
}

/// Shared state of a graph node. Every [`Function`] implementation embeds
/// one and returns it from [`Function::meta`].
pub struct FunctionMeta {
    /// How many upstream edges point at this node, i.e. how many gradient
    /// slots its input buffer has. Grows as output variables are wired up.
    num_inputs: AtomicUsize,
    /// Outgoing edges of the reverse graph; one per apply output.
    next_functions: RwLock<Vec<Edge>>,
    /// True iff some reachable leaf requires grad.
    is_executable: AtomicBool,
    /// True iff this node must run even when nothing consumes its result.
    is_stochastic: bool,
    pre_hooks: RwLock<Vec<Arc<dyn FunctionPreHook>>>,
    post_hooks: RwLock<Vec<Arc<dyn FunctionPostHook>>>,
}

impl FunctionMeta {
    pub fn new() -> FunctionMeta {
        FunctionMeta {
            num_inputs: AtomicUsize::new(0),
            next_functions: RwLock::new(Vec::new()),
            is_executable: AtomicBool::new(false),
            is_stochastic: false,
            pre_hooks: RwLock::new(Vec::new()),
            post_hooks: RwLock::new(Vec::new()),
        }
    }

    /// Node state seeded from flag propagation.
    pub fn with_flags(flags: FunctionFlags) -> FunctionMeta {
        let meta = FunctionMeta::new();
        meta.set_flags(flags);
        meta
    }

    /// Mark the node stochastic. Only meaningful before the node is shared.
    pub fn stochastic(mut self) -> FunctionMeta {
        self.is_stochastic = true;
        self
    }

    /// Install executability and edges computed by [`FunctionFlags::of`].
    pub fn set_flags(&self, flags: FunctionFlags) {
        self.is_executable
            .store(flags.is_executable, Ordering::SeqCst);
        *self.next_functions.write().unwrap() = flags.next_functions;
    }

    pub(crate) fn set_executable(&self, executable: bool) {
        self.is_executable.store(executable, Ordering::SeqCst);
    }

    pub fn is_executable(&self) -> bool {
        self.is_executable.load(Ordering::SeqCst)
    }

    pub fn is_stochastic(&self) -> bool {
        self.is_stochastic
    }

    pub fn num_inputs(&self) -> usize {
        self.num_inputs.load(Ordering::SeqCst)
    }

    pub(crate) fn set_num_inputs(&self, n: usize) {
        self.num_inputs.store(n, Ordering::SeqCst);
    }

    /// Claim the next input slot; called when an output variable is wired
    /// to this node. Returns the slot index, which becomes the variable's
    /// `output_nr`.
    pub(crate) fn attach_input(&self) -> usize {
        self.num_inputs.fetch_add(1, Ordering::SeqCst)
    }

    /// Snapshot of the outgoing edges.
    pub fn next_functions(&self) -> Vec<Edge> {
        self.next_functions.read().unwrap().clone()
    }

    /// Number of output slots apply must produce.
    pub fn num_outputs(&self) -> usize {
        self.next_functions.read().unwrap().len()
    }

    /// True iff output slot `i` flows to an executable node; implementors
    /// may skip gradient work for slots where this is false.
    pub fn should_compute_output(&self, i: usize) -> bool {
        self.next_functions.read().unwrap().get(i).is_some_and(|e| {
            e.function
                .as_ref()
                .is_some_and(|f| f.meta().is_executable())
        })
    }

    pub fn add_pre_hook(&self, hook: Arc<dyn FunctionPreHook>) {
        self.pre_hooks.write().unwrap().push(hook);
    }

    pub fn add_post_hook(&self, hook: Arc<dyn FunctionPostHook>) {
        self.post_hooks.write().unwrap().push(hook);
    }

    pub(crate) fn pre_hooks(&self) -> Vec<Arc<dyn FunctionPreHook>> {
        self.pre_hooks.read().unwrap().clone()
    }

    pub(crate) fn post_hooks(&self) -> Vec<Arc<dyn FunctionPostHook>> {
        self.post_hooks.read().unwrap().clone()
    }
}

impl Default for FunctionMeta {
    fn default() -> Self {
        FunctionMeta::new()
    }
}

impl fmt::Debug for FunctionMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionMeta")
            .field("num_inputs", &self.num_inputs())
            .field("num_outputs", &self.num_outputs())
            .field("is_executable", &self.is_executable())
            .field("is_stochastic", &self.is_stochastic)
            .finish()
    }
}

/// A node in the reverse graph.
///
/// Implementations hold whatever saved state their backward needs (usually
/// [`crate::SavedVariable`]s packed at construction) and compute gradients
/// in `apply`. A `None` entry in a gradient list means a zero gradient.
pub trait Function: Send + Sync {
    /// Shared node state (edges, flags, hooks, input count).
    fn meta(&self) -> &FunctionMeta;

    /// Run the node: map input gradients to output gradients. Must produce
    /// exactly `meta().num_outputs()` entries.
    fn apply(&self, inputs: &VariableList) -> Result<VariableList>;

    /// Drop saved variables; called after apply when the graph will not be
    /// reused.
    fn release_variables(&self) {}

    /// Node name for diagnostics.
    fn name(&self) -> &'static str;
}
