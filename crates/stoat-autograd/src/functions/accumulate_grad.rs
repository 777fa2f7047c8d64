use std::sync::{Mutex, Weak};

use stoat_core::{bail, Error, Result, Tensor};
use stoat_core::DeviceGuard;

use crate::function::{Function, FunctionKey, FunctionMeta};
use crate::functions::basic_ops::{Add, CloneOp};
use crate::variable::{Variable, VariableInner, VariableList};

// AccumulateGrad — Terminal node depositing gradients onto a leaf
//
// Backward traversal ends at leaves; each leaf requiring grad owns exactly
// one of these nodes (see Variable::get_grad_accumulator), and every
// gradient that reaches the leaf flows through its apply.
//
// This type is NOT internally thread-safe. The engine guarantees that a
// function's apply is never entered concurrently — functions are pinned to
// the single worker of their input buffer's device — and the in-place
// update below depends on that guarantee. Parallelising workers per device
// would require locking here.

/// Gradient sink for one leaf variable.
pub struct AccumulateGrad {
    meta: FunctionMeta,
    // The leaf is held weakly: the graph must not keep user variables
    // alive. A separate weak reference to the grad lets a late gradient
    // still accumulate after the leaf itself was dropped.
    variable: Weak<VariableInner>,
    variable_grad: Mutex<Weak<VariableInner>>,
}

impl AccumulateGrad {
    pub(crate) fn new(variable: &Variable) -> AccumulateGrad {
        let meta = FunctionMeta::new();
        meta.set_executable(variable.requires_grad());
        meta.set_num_inputs(1);
        let grad = variable
            .grad()
            .map(|g| g.downgrade())
            .unwrap_or_else(Weak::new);
        AccumulateGrad {
            meta,
            variable: variable.downgrade(),
            variable_grad: Mutex::new(grad),
        }
    }

    /// `grad += new_grad` in place, promoting a sparse grad to dense when
    /// the incoming gradient is dense.
    fn accumulate_inplace(grad: &Variable, new_grad: &Variable) -> Result<()> {
        let _guard = DeviceGuard::new(grad.data().device());
        let promote = grad.data().is_sparse() && !new_grad.data().is_sparse();
        if promote {
            let sum = {
                let prev: Box<dyn Tensor> = grad.data().clone_shallow();
                new_grad.data().add_out(&*prev)?
            };
            *grad.data_mut() = sum;
        } else {
            // Take a detached handle first: grad and new_grad may be the
            // same variable, and the write lock must not overlap a read.
            let rhs: Box<dyn Tensor> = new_grad.data().clone_shallow();
            grad.data_mut().add_assign(&*rhs)?;
        }
        Ok(())
    }
}

impl Function for AccumulateGrad {
    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn apply(&self, grads: &VariableList) -> Result<VariableList> {
        if grads.len() != 1 {
            bail!("gradient accumulator expects exactly 1 input, got {}", grads.len());
        }
        let Some(mut new_grad) = grads[0].clone() else {
            return Ok(Vec::new());
        };

        let var = match self.variable.upgrade() {
            Some(inner) => Variable::from_inner(inner),
            None => {
                // The leaf went out of scope. If someone still holds its
                // grad and both sides are volatile, accumulate in place as
                // we would have; with autograd history involved there is no
                // way to hand anyone the replacement variable, so drop the
                // contribution.
                let grad = self
                    .variable_grad
                    .lock()
                    .unwrap()
                    .upgrade()
                    .map(Variable::from_inner);
                let Some(grad) = grad else {
                    return Ok(Vec::new());
                };
                if grad.is_volatile() && new_grad.is_volatile() {
                    Self::accumulate_inplace(&grad, &new_grad)?;
                }
                return Ok(Vec::new());
            }
        };

        if var.grad_fn().is_some() {
            return Err(Error::LeafMovedIntoGraph);
        }
        if var.version_counter().current() != 0 {
            return Err(Error::LeafModifiedInplace);
        }
        let bound = var.get_grad_accumulator();
        if bound.as_ref().map(|f| FunctionKey::of(f)) != Some(FunctionKey::of_ref(self)) {
            return Err(Error::AccumulatorRebound);
        }

        for hook in var.hooks() {
            new_grad = hook.call(new_grad)?;
        }

        let mut slot = var.grad_slot().lock().unwrap();
        match slot.clone() {
            None => {
                // First deposit: a deep copy, so the stored grad never
                // aliases the incoming gradient.
                let outputs = CloneOp.apply(&vec![Some(new_grad)])?;
                let cloned = outputs
                    .into_iter()
                    .next()
                    .flatten()
                    .ok_or_else(|| Error::msg("CloneOp produced no output"))?;
                *self.variable_grad.lock().unwrap() = cloned.downgrade();
                *slot = Some(cloned);
            }
            Some(existing) if existing.is_volatile() => {
                // Keeping the same grad tensor makes the first-order case
                // cheaper and the observable .grad stable for users.
                Self::accumulate_inplace(&existing, &new_grad)?;
            }
            Some(existing) => {
                // Once the grad is non-volatile it stays that way.
                if new_grad.is_volatile() {
                    let data = new_grad.data().clone_shallow();
                    new_grad = Variable::leaf(data, false, false);
                }
                let outputs = Add.apply(&vec![Some(existing), Some(new_grad)])?;
                let summed = outputs
                    .into_iter()
                    .next()
                    .flatten()
                    .ok_or_else(|| Error::msg("Add produced no output"))?;
                *self.variable_grad.lock().unwrap() = summed.downgrade();
                *slot = Some(summed);
            }
        }

        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "AccumulateGrad"
    }
}
