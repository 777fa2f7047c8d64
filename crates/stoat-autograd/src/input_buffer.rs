use stoat_core::{bail, Device, DeviceGuard, Result};

use crate::variable::{Variable, VariableList};

// InputBuffer — Per-function gradient gathering
//
// A function with N upstream edges receives up to N gradient contributions
// before it can run, possibly several into the same slot when one forward
// input was used more than once. The buffer merges arrivals slot by slot;
// slots nobody filled stay `None` and are read as zero gradients.
//
// Accumulation is out-of-place: a backward node may legitimately return the
// same gradient variable on several edges, so summing into either operand
// would corrupt a contribution someone else still holds. The merged slot is
// a detached variable owning fresh storage.

/// Slot-indexed accumulator for the gradients flowing into one function.
pub struct InputBuffer {
    slots: Vec<Option<Variable>>,
    device: Device,
}

impl InputBuffer {
    /// Buffer with `size` empty slots, nominally on the CPU until a
    /// gradient from an accelerator arrives.
    pub fn new(size: usize) -> InputBuffer {
        InputBuffer {
            slots: vec![None; size],
            device: Device::Cpu,
        }
    }

    /// Merge a gradient into slot `pos`: place it if the slot is empty,
    /// element-wise add otherwise (a sparse slot meeting a dense arrival is
    /// promoted to dense). A `None` gradient is a no-op.
    pub fn add(&mut self, pos: usize, var: Option<Variable>) -> Result<()> {
        let Some(var) = var else {
            return Ok(());
        };
        if pos >= self.slots.len() {
            bail!(
                "gradient slot {} out of range for input buffer of size {}",
                pos,
                self.slots.len()
            );
        }

        // The buffer is pinned to the first non-CPU device it sees.
        if self.device.is_cpu() {
            let arrived = var.data().device();
            if !arrived.is_cpu() {
                self.device = arrived;
            }
        }

        match self.slots[pos].take() {
            None => self.slots[pos] = Some(var),
            Some(prev) => {
                let _guard = DeviceGuard::new(var.data().device());
                let (sum, volatile) = {
                    let prev_data = prev.data();
                    let new_data = var.data();
                    let sum = if prev_data.is_sparse() && !new_data.is_sparse() {
                        new_data.add_out(&**prev_data)?
                    } else {
                        prev_data.add_out(&**new_data)?
                    };
                    (sum, prev.is_volatile() && var.is_volatile())
                };
                self.slots[pos] = Some(Variable::leaf(sum, false, volatile));
            }
        }
        Ok(())
    }

    /// The device whose worker should run the buffered function.
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Destructive extraction of the gathered gradients; unfilled slots
    /// come out as `None`.
    pub fn variables(self) -> VariableList {
        self.slots
    }
}

impl std::fmt::Debug for InputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let filled = self.slots.iter().filter(|s| s.is_some()).count();
        write!(
            f,
            "InputBuffer({}/{} slots, device={})",
            filled,
            self.slots.len(),
            self.device
        )
    }
}
