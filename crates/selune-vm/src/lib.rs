//! Selune VM primitive surface
//!
//! This crate defines the operations the Selune bridge consumes from an
//! embedded stack-based interpreter: stack traffic, table and global access,
//! persistent registry slots, protected calls, and native-callback entry.
//! It implements nothing — the interpreter is an external collaborator that
//! provides a `StackVm` behind the trait (`selune-testvm` is the reference
//! implementation used by the bridge's test suites).
//!
//! Indices follow the stack-interpreter convention: 1-based from the bottom
//! of the current frame, negative counting down from the top (`-1` is the
//! top element).

#![warn(missing_docs)]

mod error;
mod state;
mod value;

pub use error::{ScriptError, VmError, VmResult};
pub use state::{NativeCallback, PanicHook, StackVm, VmKey};
pub use value::{RefKey, ValueTag};
