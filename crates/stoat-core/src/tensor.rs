use std::any::Any;
use std::fmt;

use crate::device::Device;
use crate::error::Result;

// Tensor — The contract the engine requires from a tensor library
//
// The autograd engine never inspects tensor contents. It moves gradients
// between functions, sums contributions that target the same input slot,
// clones data when a leaf's gradient must not alias an incoming one, and
// routes work by device. That is the whole surface: element-wise addition,
// shallow cloning, a fresh-empty constructor, and identity queries.
//
// WHY A TRAIT OBJECT AND NOT A GENERIC PARAMETER?
//
// The engine is a process-wide singleton that owns one worker thread per
// device. Making it generic over a backend type would mean one thread pool
// per backend instantiation; routing purely by device id needs none of the
// static type information. Tensors therefore flow through the graph as
// `Box<dyn Tensor>`, and a tensor library adapts its own type once.

/// An opaque tensor owned by the autograd graph.
///
/// A *shallow* clone must share underlying storage with the original, so
/// that an in-place mutation through one handle is observable through every
/// other — version counters depend on this to detect saved tensors going
/// stale.
pub trait Tensor: fmt::Debug + Send + Sync {
    /// A fresh, empty tensor of the same element type on the same device.
    /// Accumulating into it with [`Tensor::add_assign`] adopts the operand's
    /// shape.
    fn empty_like(&self) -> Box<dyn Tensor>;

    /// A new handle over this tensor's storage.
    fn clone_shallow(&self) -> Box<dyn Tensor>;

    /// Element-wise `self += other`. A dense tensor must accept a sparse
    /// `other`; an empty tensor adopts `other`'s shape and values.
    fn add_assign(&mut self, other: &dyn Tensor) -> Result<()>;

    /// Element-wise sum into a freshly allocated dense tensor. This is the
    /// promotion path when a sparse gradient meets a dense one.
    fn add_out(&self, other: &dyn Tensor) -> Result<Box<dyn Tensor>>;

    fn is_sparse(&self) -> bool;

    /// The device this tensor's storage lives on.
    fn device(&self) -> Device;

    /// Total storage footprint in bytes (element size times element count).
    fn nbytes(&self) -> usize;

    /// Escape hatch for hooks and transports that know the concrete type.
    fn as_any(&self) -> &dyn Any;
}
