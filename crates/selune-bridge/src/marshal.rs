//! Value marshaling between host values and the interpreter stack

use std::sync::Arc;

use selune_vm::{StackVm, ValueTag};

use crate::adapter::HostFunction;
use crate::error::{BridgeError, BridgeResult};
use crate::handle::{FunctionHandle, TableHandle};
use crate::interp::Interp;
use crate::value::ScriptValue;

/// Place the interpreter equivalent of `value` on top of the stack.
///
/// Handle variants must be owned by the target instance; pushing a handle
/// onto a foreign instance fails with `UnsupportedValue` (the remote
/// protocol copies values across instances instead).
pub fn push(vm: &dyn StackVm, value: &ScriptValue) -> BridgeResult<()> {
    match value {
        ScriptValue::Nil => vm.push_nil(),
        ScriptValue::Bool(b) => vm.push_bool(*b),
        ScriptValue::Number(n) => vm.push_number(*n),
        ScriptValue::Str(s) => vm.push_string(s),
        ScriptValue::Table(table) => table.push_onto(vm)?,
        ScriptValue::Function(function) => function.push_onto(vm)?,
        ScriptValue::Callback(callback) => vm.push_native(callback.clone()),
        ScriptValue::Adapter(adapter) => vm.push_native(HostFunction::callback(adapter)),
    }
    Ok(())
}

/// Produce a host value for the stack slot at `idx` without disturbing the
/// stack. Tables and functions are pinned into fresh registry slots and
/// returned as handles owned by `interp`.
pub fn read(interp: &Arc<Interp>, idx: i32) -> BridgeResult<ScriptValue> {
    let vm = interp.vm();
    match vm.tag(idx) {
        ValueTag::Nil | ValueTag::None => Ok(ScriptValue::Nil),
        ValueTag::Boolean => Ok(ScriptValue::Bool(vm.to_bool(idx))),
        ValueTag::Number => Ok(ScriptValue::Number(vm.to_number(idx))),
        ValueTag::String => Ok(ScriptValue::Str(vm.to_str(idx).unwrap_or_default())),
        ValueTag::Table => Ok(ScriptValue::Table(TableHandle::acquire(interp, idx))),
        // native functions share the callable tag as far as the host is
        // concerned; both pin into a function slot
        ValueTag::Function | ValueTag::NativeFunction => {
            Ok(ScriptValue::Function(FunctionHandle::acquire(interp, idx)))
        }
        other @ (ValueTag::Userdata | ValueTag::Thread) => Err(BridgeError::UnsupportedValue(
            format!("cannot marshal interpreter {} values", other.name()),
        )),
    }
}

/// Read the top stack slot and remove it.
pub fn pop(interp: &Arc<Interp>) -> BridgeResult<ScriptValue> {
    let value = read(interp, -1)?;
    interp.vm().pop_n(1);
    Ok(value)
}

/// Walk nested table lookups along `fragments`, starting from the globals
/// table, leaving only the final table on the stack. Each intermediate
/// table is discarded as soon as the next lookup is done, so the net stack
/// effect is exactly one value.
///
/// On error the stack may hold a partial walk; callers restore their
/// recorded height.
pub fn traverse(vm: &dyn StackVm, fragments: &[ScriptValue]) -> BridgeResult<()> {
    let Some((first, rest)) = fragments.split_first() else {
        return Err(BridgeError::EmptyPath);
    };
    if !vm.check_stack(fragments.len() + 1) {
        return Err(BridgeError::StackOverflow(fragments.len() + 1));
    }

    push(vm, first)?;
    vm.get_global();

    for fragment in rest {
        push(vm, fragment)?;
        vm.get_field(-2);
        vm.remove(-2);
    }
    Ok(())
}
