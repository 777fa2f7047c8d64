/// All errors that can occur within Stoat.
///
/// This enum captures every failure mode of the backward engine: saved
/// tensors invalidated by in-place mutation, leaf-accumulation contract
/// violations, malformed graphs, and failures raised by user functions.
/// Using a single error type across the library simplifies error propagation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A saved tensor's version no longer matches the version captured at
    /// save time.
    #[error(
        "one of the variables needed for gradient computation has been \
         modified by an inplace operation"
    )]
    InplaceModified,

    /// A gradient accumulator found that its leaf now has a `grad_fn`.
    #[error("leaf variable has been moved into the graph interior")]
    LeafMovedIntoGraph,

    /// A leaf handed to its gradient accumulator has a non-zero version.
    #[error("leaf variable was used in an inplace operation")]
    LeafModifiedInplace,

    /// A leaf reports a different gradient accumulator than the one running.
    #[error("gradient accumulator is not bound to its variable")]
    AccumulatorRebound,

    /// A saved leaf requires grad yet no accumulator was retained.
    #[error("no grad accumulator for a saved leaf")]
    MissingGradAccumulator,

    /// A function's apply returned the wrong number of gradients.
    #[error(
        "function '{name}' returned an invalid number of outputs - \
         expected {expected}, but got {got}"
    )]
    InvalidOutputCount {
        name: String,
        expected: usize,
        got: usize,
    },

    /// The engine tried to decrement a dependency it never counted.
    #[error("dependency not found for {0}")]
    MissingDependency(String),

    /// Backward was invoked on a subgraph with no differentiable work.
    #[error("there are no graph nodes that require computing gradients")]
    NoExecutableRoots,

    /// Workers drained but some functions still have unfilled inputs.
    #[error("could not compute gradients for some functions")]
    UncomputedDependencies,

    /// Generic message for failures raised by user functions and hooks.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout Stoat.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
