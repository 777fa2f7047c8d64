use std::sync::Arc;

use stoat_core::{DeviceGuard, Result};

use crate::function::{Function, FunctionMeta};
use crate::functions::{check_input_variables, wrap_outputs};
use crate::variable::VariableList;

// Basic ops — The two nodes gradient accumulation itself needs
//
// Depositing a gradient onto a leaf uses CloneOp (so the stored grad never
// aliases the incoming one) and Add (so repeated deposits build a real
// graph node, keeping higher-order differentiation possible). Both go
// through the ordinary wrap_outputs machinery, so their results carry
// grad_fn / output_nr like any user op's.

/// Element-wise sum of two variables.
pub struct Add;

impl Add {
    pub fn apply(&self, inputs: &VariableList) -> Result<VariableList> {
        check_input_variables("Add", inputs, 2)?;
        let a = super::required(inputs, 0)?;
        let b = super::required(inputs, 1)?;
        let _guard = DeviceGuard::new(a.data().device());
        let out = {
            let a_data = a.data();
            a_data.add_out(&**b.data())?
        };
        Ok(wrap_outputs(inputs, vec![out], |flags| {
            let backward: Arc<dyn Function> = Arc::new(AddBackward {
                meta: FunctionMeta::with_flags(flags),
            });
            backward
        }))
    }
}

struct AddBackward {
    meta: FunctionMeta,
}

impl Function for AddBackward {
    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    // d(a + b) = (grad, grad): the incoming gradient flows to both inputs,
    // except where the edge leads to nothing executable.
    fn apply(&self, grads: &VariableList) -> Result<VariableList> {
        let grad = grads.first().cloned().flatten();
        let outputs = (0..self.meta.num_outputs())
            .map(|i| {
                if self.meta.should_compute_output(i) {
                    grad.clone()
                } else {
                    None
                }
            })
            .collect();
        Ok(outputs)
    }

    fn name(&self) -> &'static str {
        "AddBackward"
    }
}

/// Deep copy of one variable: the output owns fresh storage.
pub struct CloneOp;

impl CloneOp {
    pub fn apply(&self, inputs: &VariableList) -> Result<VariableList> {
        check_input_variables("CloneOp", inputs, 1)?;
        let x = super::required(inputs, 0)?;
        let _guard = DeviceGuard::new(x.data().device());
        let out = {
            let data = x.data();
            let mut fresh = data.empty_like();
            fresh.add_assign(&**data)?;
            fresh
        };
        Ok(wrap_outputs(inputs, vec![out], |flags| {
            let backward: Arc<dyn Function> = Arc::new(CloneBackward {
                meta: FunctionMeta::with_flags(flags),
            });
            backward
        }))
    }
}

struct CloneBackward {
    meta: FunctionMeta,
}

impl Function for CloneBackward {
    fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    fn apply(&self, grads: &VariableList) -> Result<VariableList> {
        Ok(vec![grads.first().cloned().flatten()])
    }

    fn name(&self) -> &'static str {
        "CloneBackward"
    }
}
