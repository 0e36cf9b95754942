//! Remote invocation — calling a function that lives in another instance
//!
//! The protocol callback is installed as a native function (conventionally
//! named `remote`). Its arguments are `(lookupKey, functionPath, ...args)`:
//! the key resolves a target instance through the host-supplied lookup
//! function, the path names a function in the target's globals (a table
//! argument is treated as a multi-segment path, anything else as a single
//! segment), and the remaining arguments are copied *by value* into the
//! target — scalars directly, tables by recursive deep clone. Functions
//! cannot cross the boundary and fail the whole call.
//!
//! Deep cloning performs no cycle detection: a self-referential table will
//! recurse without terminating. Cyclic arguments are unsupported.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use selune_vm::{NativeCallback, ScriptError, StackVm, ValueTag};

use crate::error::{BridgeError, BridgeResult};
use crate::interp::Interp;
use crate::marshal;
use crate::registry;
use crate::value::ScriptValue;

/// Host-supplied resolver from a lookup key to a live instance.
pub type RemoteLookup = Arc<dyn Fn(&ScriptValue) -> Option<Arc<Interp>> + Send + Sync>;

static LOOKUP: Lazy<RwLock<Option<RemoteLookup>>> = Lazy::new(|| RwLock::new(None));

/// The cross-instance call primitive.
pub struct RemoteCall;

impl RemoteCall {
    /// Install the host-supplied instance resolver. Process-wide; replaces
    /// any previous resolver.
    pub fn set_lookup(
        lookup: impl Fn(&ScriptValue) -> Option<Arc<Interp>> + Send + Sync + 'static,
    ) {
        *LOOKUP.write() = Some(Arc::new(lookup));
    }

    /// Remove the resolver. Remote calls fail until a new one is installed.
    pub fn clear_lookup() {
        *LOOKUP.write() = None;
    }

    /// The raw protocol callback, for hosts that install it themselves.
    pub fn callback() -> NativeCallback {
        Arc::new(remote_invoke)
    }

    /// Install the protocol callback as a global of `interp` under `name`.
    pub fn install(interp: &Arc<Interp>, name: &str) -> BridgeResult<()> {
        interp.set(
            &[ScriptValue::from(name)],
            ScriptValue::Callback(Self::callback()),
        )
    }
}

fn remote_invoke(vm: &dyn StackVm) -> Result<usize, ScriptError> {
    let lookup = LOOKUP.read().clone();
    let Some(lookup) = lookup else {
        return Err(ScriptError::new(
            "remoting is not supported by the environment",
        ));
    };

    let Some(source) = registry::instances().get(&vm.key()) else {
        tracing::warn!(
            instance = vm.key().0,
            "remote call from unregistered instance, closing it"
        );
        vm.close();
        return Ok(0);
    };

    let argc = vm.top();
    if argc < 2 {
        return Err(ScriptError::new(
            "both the instance key and the function path must be provided",
        ));
    }

    let key = marshal::read(&source, 1).map_err(ScriptError::from)?;
    let Some(target) = lookup(&key) else {
        return Err(BridgeError::RemoteLookupFailed(describe_key(&key)).into());
    };
    target.ensure_open().map_err(ScriptError::from)?;

    // Everything pushed onto the target from here on is undone by this
    // guard on failure, so the target returns to its recorded height.
    let target_vm = target.vm();
    let old_top = target_vm.top();
    let result = remote_body(vm, &source, &target, argc, old_top);
    if result.is_err() {
        target_vm.set_top(old_top);
    }
    result
}

fn remote_body(
    vm: &dyn StackVm,
    source: &Arc<Interp>,
    target: &Arc<Interp>,
    argc: usize,
    old_top: usize,
) -> Result<usize, ScriptError> {
    let target_vm = target.vm();
    if !target_vm.check_stack(argc + 1) {
        return Err(BridgeError::StackOverflow(argc + 1).into());
    }

    // Resolve the function path: a table argument carries the path segments
    // as its values in iteration order, anything else is a single segment.
    let path = match marshal::read(source, 2).map_err(ScriptError::from)? {
        ScriptValue::Table(table) => {
            let entries = table.entries().map_err(ScriptError::from)?;
            entries.into_iter().map(|(_, value)| value).collect()
        }
        other => vec![other],
    };

    let function = match target.get(&path).map_err(ScriptError::from)? {
        ScriptValue::Function(function) => function,
        other => {
            return Err(ScriptError::new(format!(
                "attempt to call a {} value at the remote path",
                other.type_name()
            )));
        }
    };
    marshal::push(target_vm, &ScriptValue::Function(function)).map_err(ScriptError::from)?;

    // User arguments start at stack slot 3; the key and path are framing.
    for i in 3..=argc as i32 {
        copy_value(vm, target_vm, i, (i - 2) as usize).map_err(ScriptError::from)?;
    }

    target_vm
        .call(argc - 2)
        .map_err(|e| ScriptError::new(format!("remote call failed: {e}")))?;

    let returned = target_vm.top().saturating_sub(old_top);
    if returned > 0 && !vm.check_stack(returned) {
        return Err(BridgeError::StackOverflow(returned).into());
    }

    // Copy results back in call order, then drop the target's result window.
    for i in 0..returned {
        copy_value(target_vm, vm, (old_top + 1 + i) as i32, i + 1).map_err(ScriptError::from)?;
    }
    target_vm.set_top(old_top);
    Ok(returned)
}

/// Copy the value at `idx` in `src` onto the top of `dst` by re-encoding its
/// content. `position` is the 1-based user argument (or result) number, used
/// in error messages.
fn copy_value(
    src: &dyn StackVm,
    dst: &dyn StackVm,
    idx: i32,
    position: usize,
) -> BridgeResult<()> {
    match src.tag(idx) {
        ValueTag::Nil | ValueTag::None => dst.push_nil(),
        ValueTag::Boolean => dst.push_bool(src.to_bool(idx)),
        ValueTag::Number => dst.push_number(src.to_number(idx)),
        ValueTag::String => dst.push_string(&src.to_str(idx).unwrap_or_default()),
        ValueTag::Table => clone_table(src, dst, idx, position)?,
        ValueTag::Function | ValueTag::NativeFunction => {
            return Err(BridgeError::UnsupportedRemoteArgument {
                index: position,
                reason: "callback functions cannot cross instances".into(),
            });
        }
        other => {
            return Err(BridgeError::UnsupportedRemoteArgument {
                index: position,
                reason: format!("{} values cannot cross instances", other.name()),
            });
        }
    }
    Ok(())
}

/// Deep-clone the table at `idx` in `src` into a fresh table pushed onto
/// `dst`. Nested table values recurse; keys must be scalars. No cycle
/// detection is performed — cloning a cyclic table will not terminate.
fn clone_table(
    src: &dyn StackVm,
    dst: &dyn StackVm,
    idx: i32,
    position: usize,
) -> BridgeResult<()> {
    let table_idx = src.abs_index(idx);
    if !src.check_stack(2) {
        return Err(BridgeError::StackOverflow(2));
    }
    if !dst.check_stack(3) {
        return Err(BridgeError::StackOverflow(3));
    }

    dst.create_table();
    src.push_nil();
    while src.next_entry(table_idx) {
        // source stack: key at -2, value at -1
        match src.tag(-2) {
            ValueTag::Boolean | ValueTag::Number | ValueTag::String => {
                copy_value(src, dst, -2, position)?;
            }
            other => {
                return Err(BridgeError::UnsupportedRemoteArgument {
                    index: position,
                    reason: format!("table keys of type {} cannot cross instances", other.name()),
                });
            }
        }
        copy_value(src, dst, -1, position)?;
        dst.set_field(-3);
        src.pop_n(1);
    }
    Ok(())
}

fn describe_key(key: &ScriptValue) -> String {
    match key {
        ScriptValue::Str(s) => s.clone(),
        ScriptValue::Number(n) => n.to_string(),
        ScriptValue::Bool(b) => b.to_string(),
        other => other.type_name().to_owned(),
    }
}
