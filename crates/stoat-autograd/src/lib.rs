//! # stoat-autograd
//!
//! Reverse-mode automatic differentiation engine.
//!
//! During the forward pass, differentiable operations build a DAG of
//! [`Function`] nodes by wrapping their results in [`Variable`]s. Calling
//! [`Engine::execute`] then walks that graph backwards from a set of root
//! edges: gradient contributions are gathered per function in an
//! [`InputBuffer`], every reachable function's `apply` runs exactly once on
//! the worker thread owning its device, and leaves deposit their result
//! through [`AccumulateGrad`].
//!
//! ```ignore
//! use stoat_autograd::{Engine, Variable, functions::Add, CallbackMap};
//!
//! let x = Variable::leaf(data, /* requires_grad */ true, false);
//! let y = Add.apply(&vec![Some(x.clone()), Some(x.clone())])?;
//! let root = (y[0].as_ref().unwrap().grad_fn().unwrap().clone(), 0);
//! Engine::global().execute(&[root], vec![Some(ones)], false, CallbackMap::new())?;
//! assert!(x.grad().is_some());
//! ```

pub mod engine;
pub mod function;
pub mod functions;
pub mod input_buffer;
pub mod saved;
pub mod variable;
pub mod version;

pub use engine::{Callback, CallbackMap, Engine};
pub use function::{
    Edge, Function, FunctionFlags, FunctionKey, FunctionMeta, FunctionPostHook, FunctionPreHook,
};
pub use functions::accumulate_grad::AccumulateGrad;
pub use input_buffer::InputBuffer;
pub use saved::SavedVariable;
pub use stoat_core::{Device, Error, Result};
pub use variable::{Variable, VariableHook, VariableList};
pub use version::VersionCounter;

#[cfg(test)]
pub(crate) mod testing;
