//! Managed instance wrapper

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use selune_vm::{StackVm, VmKey};

use crate::adapter::HostFunction;
use crate::error::{BridgeError, BridgeResult};
use crate::handle::TableHandle;
use crate::marshal;
use crate::registry;
use crate::value::ScriptValue;

/// A managed wrapper owning one interpreter instance.
///
/// Construction registers the instance in the process-wide registry so that
/// native callbacks can rediscover the wrapper from the raw instance key,
/// and installs a panic hook that reports interpreter faults instead of
/// letting them take the process down.
///
/// Only one logical call may be in flight against an instance at a time;
/// callers serialize access (the wrapper adds no locking of its own around
/// stack traffic).
///
/// Dropping the wrapper tears the instance down if [`Interp::close`] was not
/// called; close and the drop backstop compose to exactly-once teardown.
pub struct Interp {
    vm: Box<dyn StackVm>,
    disposed: AtomicBool,
    // handed to handles acquired through &self methods
    self_ref: Weak<Interp>,
}

impl Interp {
    /// Wrap a freshly created interpreter instance.
    pub fn new(vm: Box<dyn StackVm>) -> Arc<Interp> {
        let key = vm.key();
        vm.set_panic_hook(Arc::new(move |message| {
            tracing::error!(instance = key.0, message, "interpreter panic");
        }));

        let interp = Arc::new_cyclic(|weak| Interp {
            vm,
            disposed: AtomicBool::new(false),
            self_ref: weak.clone(),
        });
        registry::instances().store(key, &interp);
        interp
    }

    /// The raw identity of the underlying instance.
    pub fn key(&self) -> VmKey {
        self.vm.key()
    }

    /// Whether [`Interp::close`] has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn vm(&self) -> &dyn StackVm {
        self.vm.as_ref()
    }

    pub(crate) fn ensure_open(&self) -> BridgeResult<()> {
        if self.is_disposed() {
            Err(BridgeError::DisposedInstance)
        } else {
            Ok(())
        }
    }

    fn shared(&self) -> BridgeResult<Arc<Interp>> {
        // fails only once the last strong reference is already gone
        self.self_ref
            .upgrade()
            .ok_or(BridgeError::DisposedInstance)
    }

    /// Tear the instance down: unregister it and close the interpreter.
    /// Idempotent; racing an explicit close against the drop backstop
    /// performs exactly one teardown.
    pub fn close(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let key = self.vm.key();
        registry::instances().remove(&key);
        tracing::debug!(instance = key.0, "closing interpreter instance");
        self.vm.close();
    }

    /// Read the value at a global path.
    ///
    /// A single fragment reads a global directly; more fragments walk nested
    /// tables, e.g. `["config", "window", "width"]`. The stack is left
    /// exactly as it was found.
    pub fn get(&self, path: &[ScriptValue]) -> BridgeResult<ScriptValue> {
        self.ensure_open()?;
        let this = self.shared()?;
        let vm = self.vm();
        let base = vm.top();
        let result = get_inner(&this, path);
        if result.is_err() {
            vm.set_top(base);
        }
        result
    }

    /// Store a value at a global path (see [`Interp::get`] for path
    /// semantics). The stack is left exactly as it was found.
    pub fn set(&self, path: &[ScriptValue], value: ScriptValue) -> BridgeResult<()> {
        self.ensure_open()?;
        let vm = self.vm();
        let base = vm.top();
        let result = set_inner(vm, path, &value);
        if result.is_err() {
            vm.set_top(base);
        }
        result
    }

    /// Create a fresh table at a global path and return a handle to it.
    pub fn create_table(&self, path: &[ScriptValue]) -> BridgeResult<TableHandle> {
        self.ensure_open()?;
        let this = self.shared()?;
        let vm = self.vm();
        let base = vm.top();
        let result = create_table_inner(&this, path);
        if result.is_err() {
            vm.set_top(base);
        }
        result
    }

    /// Install a host function adapter as a global.
    pub fn register(&self, name: &str, adapter: &Arc<HostFunction>) -> BridgeResult<()> {
        self.set(
            &[ScriptValue::from(name)],
            ScriptValue::Adapter(adapter.clone()),
        )
    }
}

impl Drop for Interp {
    fn drop(&mut self) {
        self.close();
    }
}

fn get_inner(interp: &Arc<Interp>, path: &[ScriptValue]) -> BridgeResult<ScriptValue> {
    let vm = interp.vm();
    match path {
        [] => Err(BridgeError::EmptyPath),
        [key] => {
            if !vm.check_stack(2) {
                return Err(BridgeError::StackOverflow(2));
            }
            marshal::push(vm, key)?;
            vm.get_global();
            marshal::pop(interp)
        }
        [fragments @ .., last] => {
            marshal::traverse(vm, fragments)?;
            marshal::push(vm, last)?;
            vm.get_field(-2);
            let value = marshal::pop(interp)?;
            vm.pop_n(1);
            Ok(value)
        }
    }
}

fn set_inner(vm: &dyn StackVm, path: &[ScriptValue], value: &ScriptValue) -> BridgeResult<()> {
    match path {
        [] => Err(BridgeError::EmptyPath),
        [key] => {
            if !vm.check_stack(3) {
                return Err(BridgeError::StackOverflow(3));
            }
            marshal::push(vm, key)?;
            marshal::push(vm, value)?;
            vm.set_global();
            Ok(())
        }
        [fragments @ .., last] => {
            marshal::traverse(vm, fragments)?;
            marshal::push(vm, last)?;
            marshal::push(vm, value)?;
            vm.set_field(-3);
            vm.pop_n(1);
            Ok(())
        }
    }
}

fn create_table_inner(interp: &Arc<Interp>, path: &[ScriptValue]) -> BridgeResult<TableHandle> {
    let vm = interp.vm();
    match path {
        [] => return Err(BridgeError::EmptyPath),
        [key] => {
            if !vm.check_stack(3) {
                return Err(BridgeError::StackOverflow(3));
            }
            marshal::push(vm, key)?;
            vm.create_table();
            vm.set_global();
        }
        [fragments @ .., last] => {
            marshal::traverse(vm, fragments)?;
            marshal::push(vm, last)?;
            vm.create_table();
            vm.set_field(-3);
            vm.pop_n(1);
        }
    }
    match get_inner(interp, path)? {
        ScriptValue::Table(table) => Ok(table),
        other => Err(BridgeError::UnsupportedValue(format!(
            "freshly created table read back as {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use selune_testvm::TestVm;

    fn new_interp() -> (TestVm, Arc<Interp>) {
        let vm = TestVm::new();
        let interp = Interp::new(Box::new(vm.clone()));
        (vm, interp)
    }

    #[test]
    fn test_single_fragment_get_set() {
        let (vm, interp) = new_interp();
        interp
            .set(&["answer".into()], ScriptValue::from(42))
            .unwrap();
        assert_eq!(
            interp.get(&["answer".into()]).unwrap(),
            ScriptValue::Number(42.0)
        );
        assert_eq!(vm.stack_height(), 0);
    }

    #[test]
    fn test_missing_global_reads_nil() {
        let (_vm, interp) = new_interp();
        assert!(interp.get(&["absent".into()]).unwrap().is_nil());
    }

    #[test]
    fn test_nested_path_get_set() {
        let (vm, interp) = new_interp();
        interp.create_table(&["config".into()]).unwrap();
        interp
            .create_table(&["config".into(), "window".into()])
            .unwrap();
        interp
            .set(
                &["config".into(), "window".into(), "width".into()],
                ScriptValue::from(800),
            )
            .unwrap();

        let width = interp
            .get(&["config".into(), "window".into(), "width".into()])
            .unwrap();
        assert_eq!(width, ScriptValue::Number(800.0));
        assert_eq!(vm.stack_height(), 0);
    }

    #[test]
    fn test_empty_path_is_rejected() {
        let (_vm, interp) = new_interp();
        assert!(matches!(interp.get(&[]), Err(BridgeError::EmptyPath)));
        assert!(matches!(
            interp.set(&[], ScriptValue::Nil),
            Err(BridgeError::EmptyPath)
        ));
        assert!(matches!(
            interp.create_table(&[]),
            Err(BridgeError::EmptyPath)
        ));
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_operations() {
        let (_vm, interp) = new_interp();
        interp.close();
        interp.close();
        assert!(interp.is_disposed());
        assert!(matches!(
            interp.get(&["x".into()]),
            Err(BridgeError::DisposedInstance)
        ));
        assert!(matches!(
            interp.set(&["x".into()], ScriptValue::Nil),
            Err(BridgeError::DisposedInstance)
        ));
    }

    #[test]
    fn test_close_unregisters_instance() {
        let (_vm, interp) = new_interp();
        let key = interp.key();
        assert!(registry::instances().get(&key).is_some());
        interp.close();
        assert!(registry::instances().get(&key).is_none());
    }

    #[test]
    fn test_drop_unregisters_instance() {
        let (_vm, interp) = new_interp();
        let key = interp.key();
        drop(interp);
        assert!(registry::instances().get(&key).is_none());
    }
}
