//! Foreign handles — registry-pinned tables and functions
//!
//! A handle owns exactly one registry slot in its owning instance. The slot
//! word is atomic: explicit release and the drop backstop both swap in the
//! released sentinel, so exactly one of them frees the slot no matter how
//! they race. A released handle is distinct from a handle bound to nil — the
//! former fails every operation with `DisposedHandle`, the latter is a valid
//! slot whose value happens to be nil.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use selune_vm::{RefKey, StackVm};

use crate::error::{BridgeError, BridgeResult};
use crate::interp::Interp;
use crate::marshal;
use crate::value::ScriptValue;

/// Slot-word sentinel marking a released handle. Kept outside the `RefKey`
/// range so it can never collide with a real slot or the nil pseudo-slot.
const RELEASED: i32 = i32::MIN;

/// Shared core of a handle: the owning instance and the atomic slot word.
pub(crate) struct HandleCore {
    interp: Arc<Interp>,
    slot: AtomicI32,
}

impl HandleCore {
    fn acquire(interp: &Arc<Interp>, idx: i32) -> Arc<HandleCore> {
        let vm = interp.vm();
        // The registration primitive consumes the top element; duplicate so
        // the value being read stays where it was.
        vm.push_value(idx);
        let key = vm.ref_top();
        Arc::new(HandleCore {
            interp: interp.clone(),
            slot: AtomicI32::new(key.0),
        })
    }

    fn slot(&self) -> BridgeResult<RefKey> {
        match self.slot.load(Ordering::Acquire) {
            RELEASED => Err(BridgeError::DisposedHandle),
            raw => Ok(RefKey(raw)),
        }
    }

    fn release(&self) {
        let prev = self.slot.swap(RELEASED, Ordering::AcqRel);
        if prev == RELEASED {
            return;
        }
        let key = RefKey(prev);
        if key.is_nil() || self.interp.is_disposed() {
            return;
        }
        self.interp.vm().unref(key);
    }

    fn push_onto(&self, vm: &dyn StackVm) -> BridgeResult<()> {
        if self.interp.key() != vm.key() {
            return Err(BridgeError::UnsupportedValue(
                "handle is owned by another instance".into(),
            ));
        }
        let key = self.slot()?;
        vm.load_ref(key);
        Ok(())
    }
}

impl Drop for HandleCore {
    fn drop(&mut self) {
        if self.slot.load(Ordering::Acquire) != RELEASED {
            tracing::trace!(
                instance = self.interp.key().0,
                slot = self.slot.load(Ordering::Relaxed),
                "releasing handle slot from drop"
            );
        }
        self.release();
    }
}

// ============================================================================
// FunctionHandle
// ============================================================================

/// A host-owned reference to a function living inside one instance.
///
/// Clones share the underlying slot; the slot is freed when the last clone
/// is dropped or any clone is explicitly released, whichever happens first.
#[derive(Clone)]
pub struct FunctionHandle {
    core: Arc<HandleCore>,
}

impl FunctionHandle {
    pub(crate) fn acquire(interp: &Arc<Interp>, idx: i32) -> Self {
        Self {
            core: HandleCore::acquire(interp, idx),
        }
    }

    /// Free the underlying registry slot. Idempotent; racing a clone's drop
    /// performs exactly one release.
    pub fn release(&self) {
        self.core.release();
    }

    /// Whether the handle has been released.
    pub fn is_released(&self) -> bool {
        self.core.slot.load(Ordering::Acquire) == RELEASED
    }

    pub(crate) fn push_onto(&self, vm: &dyn StackVm) -> BridgeResult<()> {
        self.core.push_onto(vm)
    }

    pub(crate) fn shares_slot(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Call the referenced function with `args`, returning every result in
    /// call order (first returned value first).
    pub fn invoke(&self, args: &[ScriptValue]) -> BridgeResult<Vec<ScriptValue>> {
        let interp = &self.core.interp;
        interp.ensure_open()?;
        let slot = self.core.slot()?;
        if slot.is_nil() {
            return Err(BridgeError::NullInvocation);
        }

        let vm = interp.vm();
        let old_top = vm.top();
        if !vm.check_stack(args.len() + 1) {
            return Err(BridgeError::StackOverflow(args.len() + 1));
        }

        vm.load_ref(slot);
        for arg in args {
            if let Err(e) = marshal::push(vm, arg) {
                vm.set_top(old_top);
                return Err(e);
            }
        }

        if let Err(e) = vm.call(args.len()) {
            vm.set_top(old_top);
            return Err(e.into());
        }

        // Result count is the stack growth across the call.
        let returned = vm.top().saturating_sub(old_top);
        let mut results = Vec::with_capacity(returned);
        for _ in 0..returned {
            match marshal::pop(interp) {
                Ok(value) => results.push(value),
                Err(e) => {
                    vm.set_top(old_top);
                    return Err(e);
                }
            }
        }
        results.reverse();
        vm.set_top(old_top);
        Ok(results)
    }
}

impl std::fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionHandle")
            .field("instance", &self.core.interp.key().0)
            .field("slot", &self.core.slot.load(Ordering::Relaxed))
            .finish()
    }
}

// ============================================================================
// TableHandle
// ============================================================================

/// A host-owned reference to a table living inside one instance.
#[derive(Clone)]
pub struct TableHandle {
    core: Arc<HandleCore>,
}

impl TableHandle {
    pub(crate) fn acquire(interp: &Arc<Interp>, idx: i32) -> Self {
        Self {
            core: HandleCore::acquire(interp, idx),
        }
    }

    /// Free the underlying registry slot. Idempotent.
    pub fn release(&self) {
        self.core.release();
    }

    /// Whether the handle has been released.
    pub fn is_released(&self) -> bool {
        self.core.slot.load(Ordering::Acquire) == RELEASED
    }

    pub(crate) fn push_onto(&self, vm: &dyn StackVm) -> BridgeResult<()> {
        self.core.push_onto(vm)
    }

    pub(crate) fn shares_slot(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Read `table[key]`.
    pub fn get(&self, key: impl Into<ScriptValue>) -> BridgeResult<ScriptValue> {
        let interp = &self.core.interp;
        interp.ensure_open()?;
        let slot = self.core.slot()?;
        let key = key.into();

        let vm = interp.vm();
        let base = vm.top();
        let result = (|| {
            if !vm.check_stack(3) {
                return Err(BridgeError::StackOverflow(3));
            }
            vm.load_ref(slot);
            marshal::push(vm, &key)?;
            vm.get_field(-2);
            let value = marshal::pop(interp)?;
            vm.pop_n(1);
            Ok(value)
        })();
        if result.is_err() {
            vm.set_top(base);
        }
        result
    }

    /// Perform `table[key] = value`.
    pub fn set(
        &self,
        key: impl Into<ScriptValue>,
        value: impl Into<ScriptValue>,
    ) -> BridgeResult<()> {
        let interp = &self.core.interp;
        interp.ensure_open()?;
        let slot = self.core.slot()?;
        let key = key.into();
        let value = value.into();

        let vm = interp.vm();
        let base = vm.top();
        let result = (|| {
            if !vm.check_stack(3) {
                return Err(BridgeError::StackOverflow(3));
            }
            vm.load_ref(slot);
            marshal::push(vm, &key)?;
            marshal::push(vm, &value)?;
            vm.set_field(-3);
            vm.pop_n(1);
            Ok(())
        })();
        if result.is_err() {
            vm.set_top(base);
        }
        result
    }

    /// Snapshot every entry in the table's iteration order.
    pub fn entries(&self) -> BridgeResult<Vec<(ScriptValue, ScriptValue)>> {
        let interp = &self.core.interp;
        interp.ensure_open()?;
        let slot = self.core.slot()?;

        let vm = interp.vm();
        let base = vm.top();
        let result = (|| {
            if !vm.check_stack(4) {
                return Err(BridgeError::StackOverflow(4));
            }
            vm.load_ref(slot);
            let table_idx = vm.abs_index(-1);
            let mut entries = Vec::new();
            vm.push_nil();
            while vm.next_entry(table_idx) {
                let key = marshal::read(interp, -2)?;
                let value = marshal::read(interp, -1)?;
                entries.push((key, value));
                vm.pop_n(1);
            }
            vm.pop_n(1);
            Ok(entries)
        })();
        if result.is_err() {
            vm.set_top(base);
        }
        result
    }
}

impl std::fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableHandle")
            .field("instance", &self.core.interp.key().0)
            .field("slot", &self.core.slot.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use selune_testvm::{CoreValue, TestVm};

    fn new_interp() -> (TestVm, Arc<Interp>) {
        let vm = TestVm::new();
        let interp = Interp::new(Box::new(vm.clone()));
        (vm, interp)
    }

    #[test]
    fn test_invoke_nil_bound_handle_fails() {
        let (vm, interp) = new_interp();
        vm.push_core(CoreValue::Nil);
        let handle = FunctionHandle::acquire(&interp, -1);
        vm.pop_core();

        assert!(matches!(
            handle.invoke(&[]),
            Err(BridgeError::NullInvocation)
        ));
        // releasing a nil-bound handle must not touch slot storage
        let live = vm.live_slots();
        handle.release();
        assert_eq!(vm.live_slots(), live);
    }

    #[test]
    fn test_release_is_exactly_once() {
        let (vm, interp) = new_interp();
        vm.define_fn("f", |_ctx| Ok(vec![]));
        let handle = match interp.get(&["f".into()]).unwrap() {
            ScriptValue::Function(f) => f,
            other => panic!("expected function, got {other:?}"),
        };
        let live_before = vm.live_slots();
        assert!(live_before >= 1);

        handle.release();
        let live_after = vm.live_slots();
        handle.release();
        assert_eq!(vm.live_slots(), live_after);
        assert!(handle.is_released());
        assert!(matches!(
            handle.invoke(&[]),
            Err(BridgeError::DisposedHandle)
        ));
    }

    #[test]
    fn test_clones_share_one_slot() {
        let (vm, interp) = new_interp();
        interp.create_table(&["t".into()]).unwrap();
        let baseline = vm.live_slots();

        let handle = match interp.get(&["t".into()]).unwrap() {
            ScriptValue::Table(t) => t,
            other => panic!("expected table, got {other:?}"),
        };
        assert_eq!(vm.live_slots(), baseline + 1);

        let clone = handle.clone();
        assert_eq!(vm.live_slots(), baseline + 1);

        clone.release();
        assert!(handle.is_released());
        assert!(matches!(handle.get("k"), Err(BridgeError::DisposedHandle)));
        assert_eq!(vm.live_slots(), baseline);

        // both drops after the explicit release are no-ops
        drop(handle);
        drop(clone);
        assert_eq!(vm.live_slots(), baseline);
    }

    #[test]
    fn test_drop_releases_slot() {
        let (vm, interp) = new_interp();
        interp.create_table(&["t".into()]).unwrap();
        let baseline = vm.live_slots();

        let handle = interp.get(&["t".into()]).unwrap();
        assert_eq!(vm.live_slots(), baseline + 1);
        drop(handle);
        assert_eq!(vm.live_slots(), baseline);
    }

    #[test]
    fn test_table_get_set_balanced() {
        let (vm, interp) = new_interp();
        let table = interp.create_table(&["t".into()]).unwrap();

        table.set("name", "selune").unwrap();
        table.set(1, true).unwrap();
        assert_eq!(table.get("name").unwrap(), ScriptValue::Str("selune".into()));
        assert_eq!(table.get(1).unwrap(), ScriptValue::Bool(true));
        assert!(table.get("missing").unwrap().is_nil());
        assert_eq!(vm.stack_height(), 0);
    }

    #[test]
    fn test_table_entries_iteration_order() {
        let (vm, interp) = new_interp();
        let table = interp.create_table(&["t".into()]).unwrap();
        table.set("a", 1).unwrap();
        table.set("b", 2).unwrap();
        table.set("c", 3).unwrap();

        let entries = table.entries().unwrap();
        let keys: Vec<_> = entries
            .iter()
            .map(|(k, _)| k.as_str().unwrap().to_owned())
            .collect();
        assert_eq!(keys, ["a", "b", "c"]);
        assert_eq!(vm.stack_height(), 0);
    }

    #[test]
    fn test_release_after_instance_close_does_not_touch_vm() {
        let (vm, interp) = new_interp();
        interp.create_table(&["t".into()]).unwrap();
        let table = match interp.get(&["t".into()]).unwrap() {
            ScriptValue::Table(t) => t,
            other => panic!("expected table, got {other:?}"),
        };

        interp.close();
        assert!(matches!(table.get("k"), Err(BridgeError::DisposedInstance)));
        table.release();
        drop(table);
        drop(vm);
    }

    #[test]
    fn test_invoke_returns_results_in_call_order() {
        let (vm, interp) = new_interp();
        vm.define_fn("three", |_ctx| {
            Ok(vec![
                CoreValue::str("first"),
                CoreValue::str("second"),
                CoreValue::str("third"),
            ])
        });

        let handle = match interp.get(&["three".into()]).unwrap() {
            ScriptValue::Function(f) => f,
            other => panic!("expected function, got {other:?}"),
        };
        let results = handle.invoke(&[]).unwrap();
        let strings: Vec<_> = results
            .iter()
            .map(|v| v.as_str().unwrap().to_owned())
            .collect();
        assert_eq!(strings, ["first", "second", "third"]);
        assert_eq!(vm.stack_height(), 0);
    }

    #[test]
    fn test_invoke_passes_arguments() {
        let (vm, interp) = new_interp();
        vm.define_fn("concat", |ctx| {
            let a = ctx.arg(0);
            let b = ctx.arg(1);
            Ok(vec![CoreValue::str(format!(
                "{}{}",
                a.as_str().unwrap_or_default(),
                b.as_str().unwrap_or_default()
            ))])
        });

        let handle = match interp.get(&["concat".into()]).unwrap() {
            ScriptValue::Function(f) => f,
            other => panic!("expected function, got {other:?}"),
        };
        let results = handle.invoke(&["foo".into(), "bar".into()]).unwrap();
        assert_eq!(results, vec![ScriptValue::Str("foobar".into())]);
        assert_eq!(vm.stack_height(), 0);
    }

    #[test]
    fn test_invoke_stack_overflow_is_reported() {
        let (vm, interp) = new_interp();
        vm.define_fn("f", |_ctx| Ok(vec![]));
        let handle = match interp.get(&["f".into()]).unwrap() {
            ScriptValue::Function(f) => f,
            other => panic!("expected function, got {other:?}"),
        };

        let args = vec![ScriptValue::Number(0.0); 4096];
        assert!(matches!(
            handle.invoke(&args),
            Err(BridgeError::StackOverflow(_))
        ));
        // the failed call must leave the stack untouched
        assert_eq!(vm.stack_height(), 0);
    }

    #[test]
    fn test_script_error_surfaces_as_execution_failure() {
        let (vm, interp) = new_interp();
        vm.define_fn("explode", |_ctx| {
            Err(selune_vm::ScriptError::new("kaboom"))
        });

        let handle = match interp.get(&["explode".into()]).unwrap() {
            ScriptValue::Function(f) => f,
            other => panic!("expected function, got {other:?}"),
        };
        match handle.invoke(&[]) {
            Err(BridgeError::ExecutionFailure(m)) => assert!(m.contains("kaboom")),
            other => panic!("expected execution failure, got {other:?}"),
        }
        assert_eq!(vm.stack_height(), 0);
    }
}
