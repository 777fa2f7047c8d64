//! Saved variables: snapshots a function keeps for its backward pass.

use std::sync::{Arc, Weak};

use stoat_core::{Error, Result, Tensor};

use crate::function::Function;
use crate::variable::Variable;
use crate::version::VersionCounter;

/// Snapshot of a [`Variable`] taken when a function needs to retain an
/// input or output for backward.
///
/// The data is captured as a shallow clone, so storage stays shared with
/// the original — which is why the version captured at save time can detect
/// later in-place mutation.
///
/// When a function saves one of its *own outputs*, holding that output's
/// `grad_fn` strongly would keep the function alive through itself. The
/// reference is therefore held weakly in that case, and for leaves the
/// gradient accumulator is captured instead (the accumulator only holds the
/// leaf weakly, so no cycle arises).
pub struct SavedVariable {
    data: Option<Box<dyn Tensor>>,
    expected_version: u64,
    version: VersionCounter,
    requires_grad: bool,
    is_volatile: bool,
    output_nr: usize,
    grad_fn: Option<Arc<dyn Function>>,
    weak_grad_fn: Option<Weak<dyn Function>>,
    grad_accumulator: Option<Arc<dyn Function>>,
}

impl SavedVariable {
    /// Capture `var`. Pass `is_output = true` when the saving function is
    /// `var`'s own `grad_fn`.
    pub fn new(var: &Variable, is_output: bool) -> SavedVariable {
        let (grad_fn, weak_grad_fn) = match var.grad_fn() {
            Some(f) if is_output => (None, Some(Arc::downgrade(f))),
            Some(f) => (Some(f.clone()), None),
            None => (None, None),
        };
        let grad_accumulator = if var.grad_fn().is_none() && var.requires_grad() {
            var.get_grad_accumulator()
        } else {
            None
        };
        SavedVariable {
            data: Some(var.data().clone_shallow()),
            expected_version: var.version_counter().current(),
            version: var.version_counter().clone(),
            requires_grad: var.requires_grad(),
            is_volatile: var.is_volatile(),
            output_nr: var.output_nr(),
            grad_fn,
            weak_grad_fn,
            grad_accumulator,
        }
    }

    /// Rebuild a variable from the snapshot.
    ///
    /// Fails with [`Error::InplaceModified`] if the tensor was mutated in
    /// place since the save. The returned variable shares storage with the
    /// original (fresh shallow clone), shares its version counter (joined),
    /// and carries the restored `grad_fn` and output slot. Returns
    /// `Ok(None)` if the snapshot was empty.
    pub fn unpack(&self) -> Result<Option<Variable>> {
        let Some(data) = &self.data else {
            return Ok(None);
        };

        if self.version.current() != self.expected_version {
            return Err(Error::InplaceModified);
        }

        let grad_fn = match (&self.grad_fn, &self.weak_grad_fn) {
            (Some(f), _) => Some(f.clone()),
            // No race here: while this save is alive it pins whatever the
            // weak reference resolves to for the duration of the call.
            (None, Some(weak)) => weak.upgrade(),
            (None, None) => None,
        };

        // A saved leaf that requires grad must have kept its accumulator;
        // losing it means gradients would silently vanish.
        if self.requires_grad && grad_fn.is_none() && self.grad_accumulator.is_none() {
            return Err(Error::MissingGradAccumulator);
        }

        let var = Variable::unpacked(
            data.clone_shallow(),
            grad_fn,
            self.requires_grad,
            self.is_volatile,
            self.output_nr,
            self.grad_accumulator.as_ref(),
        );
        var.version_counter().join_with(&self.version);
        Ok(Some(var))
    }
}

impl std::fmt::Debug for SavedVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SavedVariable")
            .field("expected_version", &self.expected_version)
            .field("requires_grad", &self.requires_grad)
            .field("released", &self.data.is_none())
            .finish()
    }
}
