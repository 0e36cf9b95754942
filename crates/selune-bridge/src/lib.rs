//! Selune bridge — value marshaling and cross-instance invocation for an
//! embedded stack-based interpreter
//!
//! The bridge converts between host Rust values and interpreter stack
//! values, pins tables and functions into registry slots behind
//! host-owned handles, exposes host logic to scripts through a trampoline
//! that never lets a failure unwind across the native boundary, and copies
//! values between independent interpreter instances so one instance can
//! invoke functions in another.
//!
//! The interpreter itself is an external collaborator behind the
//! [`selune_vm::StackVm`] trait; `selune-testvm` provides the reference
//! implementation the test suites run against.
//!
//! # Example
//!
//! ```ignore
//! use selune_bridge::{HostFunction, Interp, ScriptValue};
//!
//! let interp = Interp::new(Box::new(vm));
//! let print = HostFunction::new("print", |_interp, args| {
//!     println!("{:?}", args[0]);
//!     Ok(vec![])
//! });
//! interp.register("print", &print)?;
//!
//! let f = interp.get(&["Execute".into()])?;
//! if let ScriptValue::Function(f) = f {
//!     f.invoke(&[])?;
//! }
//! ```

pub mod adapter;
pub mod error;
pub mod handle;
pub mod interp;
pub mod marshal;
pub mod registry;
pub mod remote;
pub mod value;

pub use adapter::{HostFunction, HostLogic};
pub use error::{BridgeError, BridgeResult};
pub use handle::{FunctionHandle, TableHandle};
pub use interp::Interp;
pub use registry::WeakRegistry;
pub use remote::{RemoteCall, RemoteLookup};
pub use value::ScriptValue;
