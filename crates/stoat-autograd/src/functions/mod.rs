//! Built-in graph nodes and the helpers operation implementors use to wire
//! their outputs into the graph.

pub mod accumulate_grad;
pub mod basic_ops;

pub use accumulate_grad::AccumulateGrad;
pub use basic_ops::{Add, CloneOp};

use std::sync::Arc;

use stoat_core::{bail, Result, Tensor};

use crate::function::{Function, FunctionFlags};
use crate::variable::{Variable, VariableList};

/// Wrap raw forward outputs into graph variables.
///
/// Computes flags from the forward inputs; volatile inputs yield detached
/// volatile outputs, otherwise a single backward node is built from the
/// flags and every output is wired to it in order (claiming output slots
/// 0, 1, …). The backward node is created even when nothing requires grad,
/// so the wrapped variables uniformly report where they came from.
pub fn wrap_outputs(
    inputs: &VariableList,
    outputs: Vec<Box<dyn Tensor>>,
    make_backward: impl FnOnce(FunctionFlags) -> Arc<dyn Function>,
) -> VariableList {
    let flags = FunctionFlags::of(inputs);
    if flags.is_volatile {
        outputs
            .into_iter()
            .map(|data| Some(Variable::leaf(data, false, true)))
            .collect()
    } else {
        let backward = make_backward(flags);
        outputs
            .into_iter()
            .map(|data| Some(Variable::from_fn(data, backward.clone())))
            .collect()
    }
}

/// Check arity for a forward op that requires all of its inputs.
pub fn check_input_variables(name: &str, inputs: &VariableList, expected: usize) -> Result<()> {
    if inputs.len() != expected {
        bail!(
            "{} expects {} inputs, got {}",
            name,
            expected,
            inputs.len()
        );
    }
    for (i, var) in inputs.iter().enumerate() {
        if var.is_none() {
            bail!("{}: input {} is not defined", name, i);
        }
    }
    Ok(())
}

/// The checked input at position `i`.
pub(crate) fn required<'a>(inputs: &'a VariableList, i: usize) -> Result<&'a Variable> {
    match inputs.get(i) {
        Some(Some(var)) => Ok(var),
        _ => bail!("input {} is not defined", i),
    }
}
