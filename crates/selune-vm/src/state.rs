//! `StackVm` — the interpreter operations the bridge depends on

use std::sync::Arc;

use crate::error::{ScriptError, VmResult};
use crate::value::{RefKey, ValueTag};

/// Opaque identity of one interpreter instance.
///
/// Native callbacks arrive carrying only this token; the bridge's instance
/// registry maps it back to the managed wrapper that owns the instance. The
/// token must be unique for the lifetime of the process (implementations
/// typically mint it from a global counter or the instance allocation
/// address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmKey(
    /// Raw identity token minted by the interpreter implementation.
    pub u64,
);

/// The fixed-signature entry point native code installs into an instance.
///
/// Invoked by the interpreter with the calling instance; the callback sees a
/// fresh frame containing exactly its arguments (`top()` == argc, index 1 is
/// the first argument). `Ok(n)` reports that the top `n` values of the frame
/// are the results; `Err` raises a catchable script error in the caller.
pub type NativeCallback = Arc<dyn Fn(&dyn StackVm) -> Result<usize, ScriptError> + Send + Sync>;

/// Hook invoked when the interpreter hits an unrecoverable fault, before the
/// fault surfaces to the host as [`VmError::Panic`].
///
/// [`VmError::Panic`]: crate::VmError::Panic
pub type PanicHook = Arc<dyn Fn(&str) + Send + Sync>;

/// The primitive operations of one embedded interpreter instance.
///
/// An instance is single-threaded and non-reentrant from the outside: only
/// one logical call (host→VM or VM→host) may be in flight at a time, and
/// callers are responsible for serializing access. Implementations must be
/// safe to *share* across threads (`Send + Sync`) so the process-wide
/// instance registry can hand them out, but they are not required to make
/// concurrent stack traffic meaningful.
///
/// Operations on a closed instance must be inert (no-ops returning neutral
/// values), never undefined behavior.
pub trait StackVm: Send + Sync {
    /// Stable identity token for this instance.
    fn key(&self) -> VmKey;

    /// Tear the instance down, releasing interpreter resources. Idempotent.
    fn close(&self);

    // ------------------------------------------------------------------
    // Stack
    // ------------------------------------------------------------------

    /// Height of the current frame's stack.
    fn top(&self) -> usize;

    /// Truncate (or nil-extend) the current frame to exactly `top` values.
    fn set_top(&self, top: usize);

    /// Push nil.
    fn push_nil(&self);

    /// Push a boolean.
    fn push_bool(&self, b: bool);

    /// Push a number.
    fn push_number(&self, n: f64);

    /// Push a string.
    fn push_string(&self, s: &str);

    /// Push a native function value bound to `callback`.
    fn push_native(&self, callback: NativeCallback);

    /// Push a copy of the value at `idx`.
    fn push_value(&self, idx: i32);

    /// Remove the value at `idx`, shifting values above it down.
    fn remove(&self, idx: i32);

    /// Pop `n` values off the top.
    fn pop_n(&self, n: usize);

    /// Convert a possibly-negative index into its absolute 1-based form.
    fn abs_index(&self, idx: i32) -> i32;

    /// Whether the stack can grow by `extra` more values.
    fn check_stack(&self, extra: usize) -> bool;

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Type tag of the value at `idx` (`ValueTag::None` past the top).
    fn tag(&self, idx: i32) -> ValueTag;

    /// Numeric view of the value at `idx` (0.0 when not a number).
    fn to_number(&self, idx: i32) -> f64;

    /// Boolean view of the value at `idx` (nil and false are false).
    fn to_bool(&self, idx: i32) -> bool;

    /// String view of the value at `idx` (`None` when not a string).
    fn to_str(&self, idx: i32) -> Option<String>;

    // ------------------------------------------------------------------
    // Tables and globals
    // ------------------------------------------------------------------

    /// Push a fresh empty table.
    fn create_table(&self);

    /// Pop a key and push the corresponding value from the globals table.
    fn get_global(&self);

    /// Pop a value and a key (value on top) and store them into the globals
    /// table.
    fn set_global(&self);

    /// Pop a key and push `table[key]`, where the table sits at `table_idx`.
    fn get_field(&self, table_idx: i32);

    /// Pop a value and a key (value on top) and perform `table[key] = value`
    /// on the table at `table_idx`.
    fn set_field(&self, table_idx: i32);

    /// Table iteration, `lua_next` convention: pops a key (nil to start) and,
    /// if an entry follows it in iteration order, pushes that entry's key and
    /// value and returns `true`; otherwise pushes nothing and returns
    /// `false`. The table sits at `table_idx`.
    fn next_entry(&self, table_idx: i32) -> bool;

    // ------------------------------------------------------------------
    // Persistent registry slots
    // ------------------------------------------------------------------

    /// Pop the top value into a fresh registry slot and return its key.
    /// Popping nil yields [`RefKey::NIL`] without consuming a slot.
    fn ref_top(&self) -> RefKey;

    /// Push the value held by a registry slot ([`RefKey::NIL`] pushes nil).
    fn load_ref(&self, key: RefKey);

    /// Free a registry slot ([`RefKey::NIL`] is a no-op).
    fn unref(&self, key: RefKey);

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Protected call. Expects the stack to hold a callable value followed by
    /// `nargs` arguments; consumes them and pushes every result the callee
    /// produces. A script error (including one raised from a native
    /// callback) truncates the pushed-call window and surfaces as
    /// [`VmError::Runtime`]; an interpreter fault invokes the panic hook and
    /// surfaces as [`VmError::Panic`].
    ///
    /// [`VmError::Runtime`]: crate::VmError::Runtime
    /// [`VmError::Panic`]: crate::VmError::Panic
    fn call(&self, nargs: usize) -> VmResult<()>;

    /// Install the hook run when the interpreter hits an unrecoverable
    /// fault. Replaces any previous hook.
    fn set_panic_hook(&self, hook: PanicHook);
}
