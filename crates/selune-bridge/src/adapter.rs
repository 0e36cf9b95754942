//! Host function adapters and the invocation trampoline
//!
//! A `HostFunction` is a unit of host logic exposed to scripts as a single
//! callable value. The same adapter may be installed in any number of
//! instances; its lifetime belongs to the host. The trampoline it produces
//! is the fixed-signature entry point the interpreter invokes, and it is the
//! one place where host failures become script errors — nothing is allowed
//! to unwind across the native boundary.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use selune_vm::{NativeCallback, ScriptError, StackVm};

use crate::error::{BridgeError, BridgeResult};
use crate::interp::Interp;
use crate::marshal;
use crate::registry;
use crate::value::ScriptValue;

/// Host logic callable from scripts.
///
/// Implementers receive the calling instance and the marshaled arguments and
/// return the results (empty for none). They must not assume any particular
/// calling thread, and should not retain argument handles beyond the call —
/// table and function handles pin interpreter resources until released.
pub trait HostLogic: Send + Sync {
    /// Run the logic for one invocation.
    fn invoke(
        &self,
        interp: &Arc<Interp>,
        args: &[ScriptValue],
    ) -> BridgeResult<Vec<ScriptValue>>;
}

impl<F> HostLogic for F
where
    F: Fn(&Arc<Interp>, &[ScriptValue]) -> BridgeResult<Vec<ScriptValue>> + Send + Sync,
{
    fn invoke(
        &self,
        interp: &Arc<Interp>,
        args: &[ScriptValue],
    ) -> BridgeResult<Vec<ScriptValue>> {
        self(interp, args)
    }
}

/// A host function adapter: a display name, an atomic disposed flag, and the
/// logic behind the invocation entry point.
pub struct HostFunction {
    name: String,
    disposed: AtomicBool,
    logic: Box<dyn HostLogic>,
}

impl HostFunction {
    /// Create an adapter with a stable display name (used in script-visible
    /// error messages).
    pub fn new(name: impl Into<String>, logic: impl HostLogic + 'static) -> Arc<HostFunction> {
        Arc::new(HostFunction {
            name: name.into(),
            disposed: AtomicBool::new(false),
            logic: Box::new(logic),
        })
    }

    /// The adapter's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark the adapter disposed. Idempotent. Invocations arriving after
    /// this point raise a script error without running the logic.
    pub fn dispose(&self) {
        self.disposed.swap(true, Ordering::AcqRel);
    }

    /// Whether the adapter has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// The native entry point for an adapter: reads stack arguments,
    /// resolves the calling instance, runs the logic, and pushes results.
    pub(crate) fn callback(this: &Arc<HostFunction>) -> NativeCallback {
        let adapter = this.clone();
        Arc::new(move |vm: &dyn StackVm| trampoline(&adapter, vm))
    }
}

impl std::fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn trampoline(adapter: &Arc<HostFunction>, vm: &dyn StackVm) -> Result<usize, ScriptError> {
    if adapter.is_disposed() {
        return Err(BridgeError::DisposedAdapter(adapter.name.clone()).into());
    }

    // Rediscover the managed wrapper from the raw instance key. A miss means
    // the wrapper was torn down while native code still held the callable:
    // shut the orphaned instance down and bail out without marshaling.
    let Some(interp) = registry::instances().get(&vm.key()) else {
        tracing::warn!(
            instance = vm.key().0,
            function = %adapter.name,
            "native call from unregistered instance, closing it"
        );
        vm.close();
        return Ok(0);
    };

    let argc = vm.top();
    let mut args = Vec::with_capacity(argc);
    for i in 1..=argc as i32 {
        let arg = marshal::read(&interp, i).map_err(|e| {
            ScriptError::new(format!(
                "bad argument #{i} to function '{}': {e}",
                adapter.name
            ))
        })?;
        args.push(arg);
    }

    let outcome = catch_unwind(AssertUnwindSafe(|| adapter.logic.invoke(&interp, &args)));
    let results = match outcome {
        Ok(Ok(results)) => results,
        Ok(Err(e)) => {
            return Err(ScriptError::new(format!(
                "error calling function '{}': {e}",
                adapter.name
            )));
        }
        Err(panic) => {
            return Err(ScriptError::new(format!(
                "error calling function '{}': panicked: {}",
                adapter.name,
                panic_message(&panic)
            )));
        }
    };

    if !results.is_empty() && !vm.check_stack(results.len()) {
        return Err(ScriptError::new(format!(
            "not enough space for return values of function '{}'",
            adapter.name
        )));
    }

    for (i, result) in results.iter().enumerate() {
        // a failed push raises; the interpreter discards the partial window
        marshal::push(vm, result).map_err(|e| {
            ScriptError::new(format!(
                "failed to push return value {i} of function '{}': {e}",
                adapter.name
            ))
        })?;
    }
    Ok(results.len())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use selune_testvm::{CoreValue, TestVm};

    fn new_interp() -> (TestVm, Arc<Interp>) {
        let vm = TestVm::new();
        let interp = Interp::new(Box::new(vm.clone()));
        (vm, interp)
    }

    fn invoke_global(
        interp: &Arc<Interp>,
        name: &str,
        args: &[ScriptValue],
    ) -> BridgeResult<Vec<ScriptValue>> {
        match interp.get(&[name.into()])? {
            ScriptValue::Function(f) => f.invoke(args),
            other => panic!("expected function, got {other:?}"),
        }
    }

    #[test]
    fn test_adapter_roundtrip_through_native_call() {
        let (vm, interp) = new_interp();
        let doubler = HostFunction::new(
            "double",
            |_: &Arc<Interp>, args: &[ScriptValue]| -> BridgeResult<Vec<ScriptValue>> {
                let n = args[0].as_number().unwrap_or_default();
                Ok(vec![ScriptValue::Number(n * 2.0)])
            },
        );
        interp.register("double", &doubler).unwrap();

        let results = invoke_global(&interp, "double", &[ScriptValue::Number(21.0)]).unwrap();
        assert_eq!(results, vec![ScriptValue::Number(42.0)]);
        assert_eq!(vm.stack_height(), 0);
    }

    #[test]
    fn test_disposed_adapter_raises_without_running() {
        let (vm, interp) = new_interp();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let adapter = HostFunction::new(
            "once",
            move |_: &Arc<Interp>, _: &[ScriptValue]| -> BridgeResult<Vec<ScriptValue>> {
                flag.store(true, Ordering::SeqCst);
                Ok(vec![])
            },
        );
        interp.register("once", &adapter).unwrap();
        adapter.dispose();
        adapter.dispose();

        match invoke_global(&interp, "once", &[]) {
            Err(BridgeError::ExecutionFailure(m)) => {
                assert!(m.contains("function 'once' has been disposed"), "{m}");
            }
            other => panic!("expected execution failure, got {other:?}"),
        }
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(vm.stack_height(), 0);
    }

    #[test]
    fn test_adapter_failure_becomes_script_error() {
        let (vm, interp) = new_interp();
        let adapter = HostFunction::new(
            "fail",
            |_: &Arc<Interp>, _: &[ScriptValue]| -> BridgeResult<Vec<ScriptValue>> {
                Err(BridgeError::ExecutionFailure("host refused".into()))
            },
        );
        interp.register("fail", &adapter).unwrap();

        match invoke_global(&interp, "fail", &[]) {
            Err(BridgeError::ExecutionFailure(m)) => {
                assert!(m.contains("error calling function 'fail'"), "{m}");
                assert!(m.contains("host refused"), "{m}");
            }
            other => panic!("expected execution failure, got {other:?}"),
        }
        assert_eq!(vm.stack_height(), 0);
    }

    #[test]
    fn test_adapter_panic_is_contained() {
        let (vm, interp) = new_interp();
        let adapter = HostFunction::new(
            "boom",
            |_: &Arc<Interp>, _: &[ScriptValue]| -> BridgeResult<Vec<ScriptValue>> {
                panic!("adapter bug");
            },
        );
        interp.register("boom", &adapter).unwrap();

        match invoke_global(&interp, "boom", &[]) {
            Err(BridgeError::ExecutionFailure(m)) => {
                assert!(m.contains("panicked"), "{m}");
                assert!(m.contains("adapter bug"), "{m}");
            }
            other => panic!("expected execution failure, got {other:?}"),
        }
        assert_eq!(vm.stack_height(), 0);
    }

    #[test]
    fn test_adapter_shared_across_instances() {
        let (_vm_a, interp_a) = new_interp();
        let (_vm_b, interp_b) = new_interp();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let log = calls.clone();
        let adapter = HostFunction::new(
            "tag",
            move |interp: &Arc<Interp>, _: &[ScriptValue]| -> BridgeResult<Vec<ScriptValue>> {
                log.lock().push(interp.key());
                Ok(vec![])
            },
        );
        interp_a.register("tag", &adapter).unwrap();
        interp_b.register("tag", &adapter).unwrap();

        invoke_global(&interp_a, "tag", &[]).unwrap();
        invoke_global(&interp_b, "tag", &[]).unwrap();

        let seen = calls.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], interp_a.key());
        assert_eq!(seen[1], interp_b.key());
    }

    #[test]
    fn test_call_from_unregistered_instance_closes_it() {
        let (vm, interp) = new_interp();
        let adapter = HostFunction::new(
            "ghost",
            |_: &Arc<Interp>, _: &[ScriptValue]| -> BridgeResult<Vec<ScriptValue>> {
                Ok(vec![ScriptValue::Bool(true)])
            },
        );
        interp.register("ghost", &adapter).unwrap();

        // Simulate the wrapper being collected while the interpreter still
        // holds the callable.
        registry::instances().remove(&interp.key());

        let callee = vm.get_global_value("ghost");
        vm.push_core(callee);
        selune_vm::StackVm::call(&vm, 0).unwrap();

        // zero results, and the orphaned instance was shut down defensively
        assert_eq!(vm.stack_height(), 0);
        assert!(vm.is_closed());
    }

    #[test]
    fn test_adapter_receives_table_argument_as_handle() {
        let (vm, interp) = new_interp();
        let seen = Arc::new(Mutex::new(None));
        let out = seen.clone();
        let adapter = HostFunction::new(
            "inspect",
            move |_: &Arc<Interp>, args: &[ScriptValue]| -> BridgeResult<Vec<ScriptValue>> {
                let table = args[0].as_table().expect("table argument");
                *out.lock() = Some(
                    table
                        .get("marker")?
                        .as_str()
                        .unwrap_or_default()
                        .to_owned(),
                );
                Ok(vec![])
            },
        );
        interp.register("inspect", &adapter).unwrap();

        vm.define_fn("run", |ctx| {
            let t = CoreValue::table_from(vec![(
                CoreValue::str("marker"),
                CoreValue::str("present"),
            )]);
            ctx.call_global("inspect", &[t])?;
            Ok(vec![])
        });

        invoke_global(&interp, "run", &[]).unwrap();
        assert_eq!(seen.lock().as_deref(), Some("present"));
        assert_eq!(vm.stack_height(), 0);
    }
}
