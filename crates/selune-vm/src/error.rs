//! Error types for the VM primitive surface

/// Result type for fallible VM primitives.
pub type VmResult<T> = Result<T, VmError>;

/// Failure reported by the interpreter while the host drives it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VmError {
    /// A script-level error was raised and caught by the protected call
    /// mechanism; carries the error message the script (or a native
    /// callback) produced.
    #[error("{0}")]
    Runtime(String),

    /// The interpreter hit an unrecoverable internal fault. The installed
    /// panic hook has already run by the time this surfaces.
    #[error("unprotected error in VM: {0}")]
    Panic(String),
}

/// An error raised *into* the interpreter from native code.
///
/// Returning `Err(ScriptError)` from a [`NativeCallback`] makes the
/// interpreter raise a normal, catchable script error carrying the message —
/// the safe equivalent of the C API's error-raising longjmp. It never
/// unwinds a host stack frame across the boundary.
///
/// [`NativeCallback`]: crate::NativeCallback
#[derive(Debug, Clone)]
pub struct ScriptError {
    message: String,
}

impl ScriptError {
    /// Create an error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message scripts will observe.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ScriptError {}

impl From<ScriptError> for VmError {
    fn from(e: ScriptError) -> Self {
        VmError::Runtime(e.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_message() {
        let e = ScriptError::new("boom");
        assert_eq!(e.message(), "boom");
        assert_eq!(e.to_string(), "boom");
    }

    #[test]
    fn test_script_error_into_runtime() {
        let e: VmError = ScriptError::new("bad arg").into();
        assert!(matches!(e, VmError::Runtime(m) if m == "bad arg"));
    }
}
