//! Error taxonomy of the bridge

use selune_vm::{ScriptError, VmError};

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Failures reported by the bridge.
///
/// Errors detected while the host drives an instance (disposed handle, nil
/// invocation, malformed path) surface as values of this type at the call
/// site. Errors detected inside a native frame are converted to script
/// errors at the trampoline boundary and never unwind into the interpreter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// Marshaling hit a value it cannot represent on the other side.
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),

    /// Use of a handle after its registry slot was released.
    #[error("handle has been disposed")]
    DisposedHandle,

    /// A host function adapter was invoked after it was disposed.
    #[error("function '{0}' has been disposed")]
    DisposedAdapter(String),

    /// A function handle bound to nil was invoked.
    #[error("attempt to call a nil value")]
    NullInvocation,

    /// The instance stack has no room for a pending push sequence.
    #[error("stack overflow: no room for {0} additional values")]
    StackOverflow(usize),

    /// The remote lookup function produced no live instance for a key.
    #[error("could not find remote instance with key: {0}")]
    RemoteLookupFailed(String),

    /// A remote call argument (or result) cannot cross the instance
    /// boundary.
    #[error("unsupported remote argument #{index}: {reason}")]
    UnsupportedRemoteArgument {
        /// 1-based position of the offending user argument or result
        index: usize,
        /// why the value cannot be copied
        reason: String,
    },

    /// A script error, adapter failure, or interpreter fault.
    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    /// Use of a managed instance wrapper after it was closed.
    #[error("instance has been disposed")]
    DisposedInstance,

    /// A path operation received no fragments.
    #[error("path must contain at least one fragment")]
    EmptyPath,
}

impl From<VmError> for BridgeError {
    fn from(e: VmError) -> Self {
        BridgeError::ExecutionFailure(e.to_string())
    }
}

impl From<BridgeError> for ScriptError {
    fn from(e: BridgeError) -> Self {
        ScriptError::new(e.to_string())
    }
}
