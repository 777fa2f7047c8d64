use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

use stoat_core::{bail, device, Device, Error, Result};

use crate::function::{Function, FunctionKey};
use crate::input_buffer::InputBuffer;
use crate::variable::VariableList;

// Engine — Multi-threaded backward executor
//
// One ready queue and one dedicated worker thread per device (queue 0 is
// the CPU). execute() seeds the queues with the root functions, counts how
// many gradient arrivals each reachable function needs, and blocks until
// the workers drain. Workers pop a task, run the function, and route each
// output gradient to the downstream function's input buffer; a function is
// enqueued on its buffer-device's queue the moment its arrival count hits
// zero.
//
// XXX: Changes to the way multithreading works here must be made with
// great care. The implementation guarantees that a single function's apply
// is never entered concurrently, even when multiple graphs execute at the
// same time: the dependency count reaches zero exactly once per execute,
// and a function always lands on the single worker owning its buffer's
// device. AccumulateGrad depends on this guarantee.

/// Per-execute interception: return `false` to skip the function (its
/// outputs are treated as zero gradients).
pub type Callback = Box<dyn Fn(&dyn Function, &VariableList) -> bool + Send + Sync>;

/// Callbacks keyed by the function they intercept.
pub type CallbackMap = HashMap<FunctionKey, Callback>;

/// A runnable unit: one function together with its gathered inputs and the
/// execution it belongs to.
struct FunctionTask {
    base: Arc<GraphTask>,
    func: Arc<dyn Function>,
    inputs: InputBuffer,
}

/// Thread-safe queue of runnable tasks. Producers add at the front and
/// bump the owning execution's outstanding count; the single worker thread
/// drains from the back, blocking while empty.
struct ReadyQueue {
    queue: Mutex<VecDeque<FunctionTask>>,
    not_empty: Condvar,
}

impl ReadyQueue {
    fn new() -> ReadyQueue {
        ReadyQueue {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    fn push_front(&self, task: FunctionTask) {
        {
            let mut queue = self.queue.lock().unwrap();
            task.base.outstanding_tasks.fetch_add(1, Ordering::SeqCst);
            queue.push_front(task);
        }
        self.not_empty.notify_one();
    }

    fn pop_back(&self) -> FunctionTask {
        let mut queue = self.queue.lock().unwrap();
        loop {
            match queue.pop_back() {
                Some(task) => return task,
                None => queue = self.not_empty.wait(queue).unwrap(),
            }
        }
    }
}

/// State guarded by the per-execution mutex.
struct GraphState {
    /// Remaining gradient arrivals per reachable function. An entry is
    /// removed when its count reaches zero.
    dependencies: HashMap<FunctionKey, usize>,
    /// Functions still gathering inputs, with their partial buffers.
    not_ready: HashMap<FunctionKey, InputBuffer>,
    /// First failure observed by any worker.
    exception: Option<Error>,
}

/// Book-keeping for one execute() call.
struct GraphTask {
    keep_graph: bool,
    has_error: AtomicBool,
    outstanding_tasks: AtomicU64,
    has_any_work: AtomicBool,
    state: Mutex<GraphState>,
    not_done: Condvar,
    callbacks: CallbackMap,
}

impl GraphTask {
    fn new(keep_graph: bool, callbacks: CallbackMap) -> GraphTask {
        GraphTask {
            keep_graph,
            has_error: AtomicBool::new(false),
            outstanding_tasks: AtomicU64::new(0),
            has_any_work: AtomicBool::new(false),
            state: Mutex::new(GraphState {
                dependencies: HashMap::new(),
                not_ready: HashMap::new(),
                exception: None,
            }),
            not_done: Condvar::new(),
            callbacks,
        }
    }

    /// Record a failure; the first one wins and later ones are dropped.
    fn set_error(&self, err: Error) {
        let mut state = self.state.lock().unwrap();
        if !self.has_error.load(Ordering::SeqCst) {
            state.exception = Some(err);
            self.has_error.store(true, Ordering::SeqCst);
        } else {
            log::debug!("suppressing additional backward error: {err}");
        }
    }
}

struct EngineInner {
    /// Queue per device; index 0 is the CPU, 1..=N the accelerators.
    ready_queues: Vec<Arc<ReadyQueue>>,
}

/// The backward executor.
///
/// A process normally uses the shared [`Engine::global`] instance: the
/// no-concurrent-apply guarantee spans every execution routed through one
/// engine, because each device has exactly one worker. Separate instances
/// (from [`Engine::new`]) each own their threads and only guarantee it for
/// their own executions; they exist for isolated testing.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Start an engine with one CPU queue plus `num_accelerators` device
    /// queues. Worker threads are detached and live for the process.
    pub fn new(num_accelerators: usize) -> Engine {
        let ready_queues: Vec<Arc<ReadyQueue>> = (0..=num_accelerators)
            .map(|_| Arc::new(ReadyQueue::new()))
            .collect();
        let inner = Arc::new(EngineInner { ready_queues });
        for (index, queue) in inner.ready_queues.iter().enumerate() {
            let dev = Device::from_queue_index(index);
            let inner = Arc::clone(&inner);
            let queue = Arc::clone(queue);
            thread::Builder::new()
                .name(format!("stoat-autograd-{}", dev.name()))
                .spawn(move || EngineInner::thread_main(inner, queue, dev))
                .expect("failed to spawn autograd worker thread");
        }
        Engine { inner }
    }

    /// The process-wide engine, started on first use with the registered
    /// accelerator count.
    pub fn global() -> &'static Engine {
        static GLOBAL: OnceLock<Engine> = OnceLock::new();
        GLOBAL.get_or_init(|| Engine::new(device::accelerator_count()))
    }

    /// Run backward from `input_roots` — pairs of (function, input slot) —
    /// feeding each root the matching gradient from `grads`.
    ///
    /// Blocks until every scheduled function ran, then rethrows the first
    /// failure if any occurred. With `keep_graph` false, functions release
    /// their saved variables as they run and the graph cannot be executed
    /// again.
    pub fn execute(
        &self,
        input_roots: &[(Arc<dyn Function>, usize)],
        grads: VariableList,
        keep_graph: bool,
        callbacks: CallbackMap,
    ) -> Result<()> {
        self.inner.execute(input_roots, grads, keep_graph, callbacks)
    }
}

impl EngineInner {
    fn execute(
        &self,
        input_roots: &[(Arc<dyn Function>, usize)],
        grads: VariableList,
        keep_graph: bool,
        callbacks: CallbackMap,
    ) -> Result<()> {
        if input_roots.len() != grads.len() {
            bail!(
                "expected one gradient per root edge: {} roots, {} gradients",
                input_roots.len(),
                grads.len()
            );
        }

        let task = Arc::new(GraphTask::new(keep_graph, callbacks));
        // Hold the task mutex through setup: seeded workers that finish
        // early block on it until the caller reaches the wait below.
        let mut state = task.state.lock().unwrap();
        log::debug!("backward pass over {} root edges", input_roots.len());

        let mut roots = self.find_roots(&task, input_roots, grads)?;
        self.find_stochastic_functions(&task, &mut roots)?;

        if !task.has_any_work.load(Ordering::SeqCst) {
            return Err(Error::NoExecutableRoots);
        }

        compute_dependencies(roots, &mut state);

        state = task
            .not_done
            .wait_while(state, |_| {
                task.outstanding_tasks.load(Ordering::SeqCst) != 0
            })
            .unwrap();

        if task.has_error.load(Ordering::SeqCst) {
            let err = state
                .exception
                .take()
                .unwrap_or_else(|| Error::msg("backward failed with an unreported error"));
            return Err(err);
        }
        if !state.not_ready.is_empty() {
            return Err(Error::UncomputedDependencies);
        }
        Ok(())
    }

    /// Group the root edges by function, gather their seed gradients into
    /// one input buffer per distinct executable root, and enqueue those on
    /// the device queue matching each buffer. Returns the distinct roots.
    fn find_roots(
        &self,
        task: &Arc<GraphTask>,
        input_roots: &[(Arc<dyn Function>, usize)],
        grads: VariableList,
    ) -> Result<Vec<Arc<dyn Function>>> {
        let mut buffers: HashMap<FunctionKey, (Arc<dyn Function>, Option<InputBuffer>)> =
            HashMap::new();
        for ((root, input_nr), grad) in input_roots.iter().zip(grads) {
            let entry = buffers
                .entry(FunctionKey::of(root))
                .or_insert_with(|| (Arc::clone(root), None));
            if root.meta().is_executable() {
                let buffer = entry
                    .1
                    .get_or_insert_with(|| InputBuffer::new(root.meta().num_inputs()));
                buffer.add(*input_nr, grad)?;
            }
        }

        let mut roots = Vec::with_capacity(buffers.len());
        for (_, (root, buffer)) in buffers {
            // Non-executable roots join the traversal frontier but get no
            // task.
            let Some(buffer) = buffer else {
                roots.push(root);
                continue;
            };
            let queue = self.ready_queue(buffer.device())?;
            queue.push_front(FunctionTask {
                base: Arc::clone(task),
                func: Arc::clone(&root),
                inputs: buffer,
            });
            task.has_any_work.store(true, Ordering::SeqCst);
            roots.push(root);
        }
        Ok(roots)
    }

    /// Walk the graph from the roots and schedule every executable
    /// stochastic function directly — they run even when no consumer asks
    /// for their gradient. Scheduled nodes join `roots` so dependency
    /// counting covers the paths below them.
    fn find_stochastic_functions(
        &self,
        task: &Arc<GraphTask>,
        roots: &mut Vec<Arc<dyn Function>>,
    ) -> Result<()> {
        let mut seen: HashSet<FunctionKey> = HashSet::new();
        let mut search: Vec<Arc<dyn Function>> = roots.clone();
        while let Some(func) = search.pop() {
            for edge in func.meta().next_functions() {
                let Some(next) = edge.function else { continue };
                let key = FunctionKey::of(&next);
                let meta = next.meta();
                if meta.is_stochastic() && meta.is_executable() && !seen.contains(&key) {
                    log::trace!("scheduling stochastic function {}", next.name());
                    self.ready_queue(Device::Cpu)?.push_front(FunctionTask {
                        base: Arc::clone(task),
                        func: Arc::clone(&next),
                        inputs: InputBuffer::new(0),
                    });
                    roots.push(Arc::clone(&next));
                    task.has_any_work.store(true, Ordering::SeqCst);
                }
                if seen.insert(key) {
                    search.push(next);
                }
            }
        }
        Ok(())
    }

    fn ready_queue(&self, device: Device) -> Result<&Arc<ReadyQueue>> {
        match self.ready_queues.get(device.queue_index()) {
            Some(queue) => Ok(queue),
            None => bail!(
                "no ready queue for device {} (engine started with {} queues)",
                device,
                self.ready_queues.len()
            ),
        }
    }

    fn thread_main(inner: Arc<EngineInner>, queue: Arc<ReadyQueue>, dev: Device) {
        device::bind_thread(dev);
        log::debug!("autograd worker started on {dev}");
        loop {
            let task = queue.pop_back();
            let base = Arc::clone(&task.base);
            // A failed execution drains without evaluating further tasks.
            if !base.has_error.load(Ordering::SeqCst) {
                if let Err(err) = inner.evaluate_function(task) {
                    base.set_error(err);
                }
            }
            if base.outstanding_tasks.fetch_sub(1, Ordering::SeqCst) == 1 {
                let _state = base.state.lock().unwrap();
                base.not_done.notify_all();
            }
        }
    }

    fn evaluate_function(&self, task: FunctionTask) -> Result<()> {
        let FunctionTask { base, func, inputs } = task;
        let outputs = call_function(&base, &func, inputs)?;

        let next_functions = func.meta().next_functions();
        if outputs.len() != next_functions.len() {
            return Err(Error::InvalidOutputCount {
                name: func.name().to_string(),
                expected: next_functions.len(),
                got: outputs.len(),
            });
        }
        if !base.keep_graph {
            func.release_variables();
        }

        for (output, edge) in outputs.into_iter().zip(next_functions.iter()) {
            let Some(next_fn) = &edge.function else { continue };
            let next_meta = next_fn.meta();
            // Stochastic functions were scheduled up front; non-executable
            // ones never run.
            if next_meta.is_stochastic() || !next_meta.is_executable() {
                continue;
            }

            let key = FunctionKey::of(next_fn);
            let mut state = base.state.lock().unwrap();

            let is_ready = match state.dependencies.get_mut(&key) {
                None => {
                    return Err(Error::MissingDependency(next_fn.name().to_string()));
                }
                Some(count) => {
                    *count -= 1;
                    *count == 0
                }
            };
            if is_ready {
                state.dependencies.remove(&key);
            }

            match state.not_ready.entry(key) {
                Entry::Vacant(slot) => {
                    let mut buffer = InputBuffer::new(next_meta.num_inputs());
                    buffer.add(edge.input_nr, output)?;
                    if is_ready {
                        self.ready_queue(buffer.device())?.push_front(FunctionTask {
                            base: Arc::clone(&base),
                            func: Arc::clone(next_fn),
                            inputs: buffer,
                        });
                    } else {
                        slot.insert(buffer);
                    }
                }
                Entry::Occupied(mut slot) => {
                    slot.get_mut().add(edge.input_nr, output)?;
                    if is_ready {
                        let buffer = slot.remove();
                        self.ready_queue(buffer.device())?.push_front(FunctionTask {
                            base: Arc::clone(&base),
                            func: Arc::clone(next_fn),
                            inputs: buffer,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Run one function: materialise its inputs, apply pre-hooks, consult the
/// execution's callback (a rejection yields all-zero outputs and skips the
/// function and its post-hooks), invoke apply, apply post-hooks.
fn call_function(
    base: &GraphTask,
    func: &Arc<dyn Function>,
    inputs: InputBuffer,
) -> Result<VariableList> {
    let meta = func.meta();
    let mut inputs = inputs.variables();
    for hook in meta.pre_hooks() {
        inputs = hook.call(inputs)?;
    }

    if let Some(callback) = base.callbacks.get(&FunctionKey::of(func)) {
        if !callback(&**func, &inputs) {
            return Ok(vec![None; meta.num_outputs()]);
        }
    }

    let mut outputs = func.apply(&inputs)?;
    for hook in meta.post_hooks() {
        outputs = hook.call(outputs, &inputs)?;
    }
    Ok(outputs)
}

/// Count, for every executable non-stochastic function reachable from the
/// frontier, how many gradient arrivals it must see before it can run.
fn compute_dependencies(mut queue: Vec<Arc<dyn Function>>, state: &mut GraphState) {
    let mut seen: HashSet<FunctionKey> = queue.iter().map(FunctionKey::of).collect();
    while let Some(func) = queue.pop() {
        // Roots that are not executable contribute no edges.
        if !func.meta().is_executable() {
            continue;
        }
        for edge in func.meta().next_functions() {
            let Some(next) = edge.function else { continue };
            let meta = next.meta();
            if !meta.is_executable() {
                continue;
            }
            // Stochastic functions run unconditionally; nobody counts
            // arrivals for them.
            if meta.is_stochastic() {
                continue;
            }
            let key = FunctionKey::of(&next);
            *state.dependencies.entry(key).or_insert(0) += 1;
            if seen.insert(key) {
                queue.push(next);
            }
        }
    }
}
