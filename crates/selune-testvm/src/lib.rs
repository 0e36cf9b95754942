//! Reference interpreter for the Selune bridge
//!
//! A compact single-instance stack interpreter implementing the
//! [`StackVm`] primitive surface: a frame-windowed value stack, globals,
//! insertion-ordered tables, persistent registry slots with free-list
//! reuse, and protected calls dispatching both script functions and native
//! callbacks. It exists so the bridge's scenario tests execute against real
//! stack traffic; it is test tooling, not a production VM.
//!
//! Script functions are host closures registered with
//! [`TestVm::define_fn`]; their bodies receive a [`ScriptCtx`] and call
//! other values — including native functions installed by the bridge —
//! back through the interpreter's own call machinery, so the trampoline
//! path is exercised exactly as it would be by interpreted code.
//!
//! An instance is single-threaded by contract (callers serialize access,
//! as the bridge documents). The core sits behind a
//! `ReentrantMutex<RefCell<..>>`: same-thread reentrancy — a native
//! callback driving the stack mid-call — is the normal path, while
//! cross-thread misuse blocks instead of corrupting state. No borrow is
//! held across a callback or script-body invocation.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use selune_vm::{
    NativeCallback, PanicHook, RefKey, ScriptError, StackVm, ValueTag, VmError, VmKey, VmResult,
};

mod value;

pub use value::{CoreValue, ScriptFn, TableData};
use value::{TableKey, TableRef};

/// Total stack capacity of one instance. `check_stack` reports headroom
/// against this limit.
const STACK_LIMIT: usize = 256;

struct Core {
    stack: Vec<CoreValue>,
    frames: Vec<usize>,
    globals: TableRef,
    slots: Vec<Option<CoreValue>>,
    free_slots: Vec<usize>,
}

impl Core {
    fn base(&self) -> usize {
        self.frames.last().copied().unwrap_or(0)
    }

    fn resolve(&self, idx: i32) -> Option<usize> {
        let base = self.base();
        if idx > 0 {
            let pos = base + idx as usize - 1;
            (pos < self.stack.len()).then_some(pos)
        } else if idx < 0 {
            let back = (-(idx as i64)) as usize;
            let height = self.stack.len() - base;
            (back <= height).then(|| self.stack.len() - back)
        } else {
            None
        }
    }

    fn value_at(&self, idx: i32) -> CoreValue {
        self.resolve(idx)
            .map(|pos| self.stack[pos].clone())
            .unwrap_or(CoreValue::Nil)
    }

    fn pop_value(&mut self) -> CoreValue {
        if self.stack.len() > self.base() {
            self.stack.pop().unwrap_or(CoreValue::Nil)
        } else {
            CoreValue::Nil
        }
    }
}

struct VmInner {
    key: VmKey,
    core: ReentrantMutex<RefCell<Core>>,
    closed: AtomicBool,
    panic_hook: Mutex<Option<PanicHook>>,
}

/// One interpreter instance. Clones share the instance; dropping the last
/// clone drops the instance state.
#[derive(Clone)]
pub struct TestVm {
    inner: Arc<VmInner>,
}

impl TestVm {
    /// Create a fresh instance with its own globals, stack, and slots.
    pub fn new() -> TestVm {
        static NEXT_KEY: AtomicU64 = AtomicU64::new(1);
        let key = VmKey(NEXT_KEY.fetch_add(1, Ordering::Relaxed));
        TestVm {
            inner: Arc::new(VmInner {
                key,
                core: ReentrantMutex::new(RefCell::new(Core {
                    stack: Vec::new(),
                    frames: Vec::new(),
                    globals: Arc::new(Mutex::new(TableData::default())),
                    slots: Vec::new(),
                    free_slots: Vec::new(),
                })),
                closed: AtomicBool::new(false),
                panic_hook: Mutex::new(None),
            }),
        }
    }

    /// View this instance through the primitive surface.
    pub fn as_stack_vm(&self) -> &dyn StackVm {
        self
    }

    /// Whether [`StackVm::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Absolute stack height, ignoring frame windows. Zero between calls —
    /// the stack-balance assertions in the bridge tests rely on this.
    pub fn stack_height(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.with_core(|core| core.stack.len())
    }

    /// Number of occupied registry slots.
    pub fn live_slots(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.with_core(|core| core.slots.iter().filter(|slot| slot.is_some()).count())
    }

    /// Define a script function as a global.
    pub fn define_fn(
        &self,
        name: &str,
        body: impl Fn(&ScriptCtx<'_>) -> Result<Vec<CoreValue>, ScriptError> + Send + Sync + 'static,
    ) {
        let function = CoreValue::Script(Arc::new(ScriptFn {
            name: name.to_owned(),
            body: Arc::new(body),
        }));
        self.set_global_value(name, function);
    }

    /// Store a global.
    pub fn set_global_value(&self, name: &str, value: CoreValue) {
        if self.is_closed() {
            return;
        }
        self.with_core(|core| core.globals.lock().set(TableKey::Str(Arc::from(name)), value));
    }

    /// Read a global (nil when absent).
    pub fn get_global_value(&self, name: &str) -> CoreValue {
        if self.is_closed() {
            return CoreValue::Nil;
        }
        self.with_core(|core| core.globals.lock().get(&TableKey::Str(Arc::from(name))))
    }

    /// Push a raw value cell.
    pub fn push_core(&self, value: CoreValue) {
        if self.is_closed() {
            return;
        }
        self.with_core(|core| core.stack.push(value));
    }

    /// Pop a raw value cell (nil when the current frame is empty).
    pub fn pop_core(&self) -> CoreValue {
        if self.is_closed() {
            return CoreValue::Nil;
        }
        self.with_core(|core| core.pop_value())
    }

    fn with_core<R>(&self, f: impl FnOnce(&mut Core) -> R) -> R {
        let guard = self.inner.core.lock();
        let mut core = guard.borrow_mut();
        f(&mut core)
    }

    fn vm_panic(&self, message: &str) -> VmError {
        let hook = self.inner.panic_hook.lock().clone();
        if let Some(hook) = hook {
            hook(message);
        }
        VmError::Panic(message.to_owned())
    }

    fn dispatch(&self, callee: CoreValue) -> VmResult<usize> {
        match callee {
            CoreValue::Native(callback) => callback(self.as_stack_vm()).map_err(VmError::from),
            CoreValue::Script(function) => {
                let args = self.with_core(|core| {
                    let base = core.base();
                    core.stack[base..].to_vec()
                });
                let ctx = ScriptCtx { vm: self, args };
                let results = (function.body)(&ctx).map_err(VmError::from)?;
                let count = results.len();
                self.with_core(|core| core.stack.extend(results));
                Ok(count)
            }
            CoreValue::Nil => Err(VmError::Runtime("attempt to call a nil value".into())),
            other => Err(VmError::Runtime(format!(
                "attempt to call a {} value",
                other.type_name()
            ))),
        }
    }
}

impl Default for TestVm {
    fn default() -> Self {
        Self::new()
    }
}

impl StackVm for TestVm {
    fn key(&self) -> VmKey {
        self.inner.key
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.with_core(|core| {
            core.stack.clear();
            core.frames.clear();
            core.slots.clear();
            core.free_slots.clear();
            core.globals.lock().clear();
        });
    }

    fn top(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.with_core(|core| core.stack.len() - core.base())
    }

    fn set_top(&self, top: usize) {
        if self.is_closed() {
            return;
        }
        self.with_core(|core| {
            let target = core.base() + top;
            while core.stack.len() < target {
                core.stack.push(CoreValue::Nil);
            }
            core.stack.truncate(target);
        });
    }

    fn push_nil(&self) {
        self.push_core(CoreValue::Nil);
    }

    fn push_bool(&self, b: bool) {
        self.push_core(CoreValue::Bool(b));
    }

    fn push_number(&self, n: f64) {
        self.push_core(CoreValue::Number(n));
    }

    fn push_string(&self, s: &str) {
        self.push_core(CoreValue::str(s));
    }

    fn push_native(&self, callback: NativeCallback) {
        self.push_core(CoreValue::Native(callback));
    }

    fn push_value(&self, idx: i32) {
        if self.is_closed() {
            return;
        }
        self.with_core(|core| {
            let value = core.value_at(idx);
            core.stack.push(value);
        });
    }

    fn remove(&self, idx: i32) {
        if self.is_closed() {
            return;
        }
        self.with_core(|core| {
            if let Some(pos) = core.resolve(idx) {
                core.stack.remove(pos);
            }
        });
    }

    fn pop_n(&self, n: usize) {
        if self.is_closed() {
            return;
        }
        self.with_core(|core| {
            let floor = core.base();
            let target = core.stack.len().saturating_sub(n).max(floor);
            core.stack.truncate(target);
        });
    }

    fn abs_index(&self, idx: i32) -> i32 {
        if idx >= 0 {
            return idx;
        }
        if self.is_closed() {
            return 0;
        }
        self.with_core(|core| {
            let height = (core.stack.len() - core.base()) as i32;
            height + idx + 1
        })
    }

    fn check_stack(&self, extra: usize) -> bool {
        if self.is_closed() {
            return true;
        }
        self.with_core(|core| core.stack.len() + extra <= STACK_LIMIT)
    }

    fn tag(&self, idx: i32) -> ValueTag {
        if self.is_closed() {
            return ValueTag::None;
        }
        self.with_core(|core| match core.resolve(idx) {
            Some(pos) => core.stack[pos].type_tag(),
            None => ValueTag::None,
        })
    }

    fn to_number(&self, idx: i32) -> f64 {
        if self.is_closed() {
            return 0.0;
        }
        self.with_core(|core| match core.value_at(idx) {
            CoreValue::Number(n) => n,
            CoreValue::Str(s) => s.parse().unwrap_or(0.0),
            _ => 0.0,
        })
    }

    fn to_bool(&self, idx: i32) -> bool {
        if self.is_closed() {
            return false;
        }
        self.with_core(|core| core.value_at(idx).truthy())
    }

    fn to_str(&self, idx: i32) -> Option<String> {
        if self.is_closed() {
            return None;
        }
        self.with_core(|core| match core.value_at(idx) {
            CoreValue::Str(s) => Some(s.to_string()),
            CoreValue::Number(n) => Some(format_number(n)),
            _ => None,
        })
    }

    fn create_table(&self) {
        self.push_core(CoreValue::Table(Arc::new(Mutex::new(TableData::default()))));
    }

    fn get_global(&self) {
        if self.is_closed() {
            return;
        }
        self.with_core(|core| {
            let key = core.pop_value();
            let value = match TableKey::from_value(&key) {
                Some(key) => core.globals.lock().get(&key),
                None => CoreValue::Nil,
            };
            core.stack.push(value);
        });
    }

    fn set_global(&self) {
        if self.is_closed() {
            return;
        }
        self.with_core(|core| {
            let value = core.pop_value();
            let key = core.pop_value();
            if let Some(key) = TableKey::from_value(&key) {
                core.globals.lock().set(key, value);
            }
        });
    }

    fn get_field(&self, table_idx: i32) {
        if self.is_closed() {
            return;
        }
        self.with_core(|core| {
            let table = core.value_at(table_idx);
            let key = core.pop_value();
            let value = table.index(&key);
            core.stack.push(value);
        });
    }

    fn set_field(&self, table_idx: i32) {
        if self.is_closed() {
            return;
        }
        self.with_core(|core| {
            let table = core.value_at(table_idx);
            let value = core.pop_value();
            let key = core.pop_value();
            table.set_index(key, value);
        });
    }

    fn next_entry(&self, table_idx: i32) -> bool {
        if self.is_closed() {
            return false;
        }
        self.with_core(|core| {
            let table = core.value_at(table_idx);
            let key = core.pop_value();
            let CoreValue::Table(table) = table else {
                return false;
            };
            let table = table.lock();
            let next_index = match &key {
                CoreValue::Nil => 0,
                other => match TableKey::from_value(other).and_then(|k| table.position(&k)) {
                    Some(pos) => pos + 1,
                    None => return false,
                },
            };
            match table.entry_at(next_index) {
                Some((key, value)) => {
                    core.stack.push(key.to_value());
                    core.stack.push(value);
                    true
                }
                None => false,
            }
        })
    }

    fn ref_top(&self) -> RefKey {
        if self.is_closed() {
            return RefKey::NIL;
        }
        self.with_core(|core| {
            let value = core.pop_value();
            if value.is_nil() {
                return RefKey::NIL;
            }
            match core.free_slots.pop() {
                Some(index) => {
                    core.slots[index] = Some(value);
                    RefKey(index as i32)
                }
                None => {
                    core.slots.push(Some(value));
                    RefKey((core.slots.len() - 1) as i32)
                }
            }
        })
    }

    fn load_ref(&self, key: RefKey) {
        if self.is_closed() {
            return;
        }
        self.with_core(|core| {
            let value = if key.is_nil() || key.0 < 0 {
                CoreValue::Nil
            } else {
                core.slots
                    .get(key.0 as usize)
                    .and_then(|slot| slot.clone())
                    .unwrap_or(CoreValue::Nil)
            };
            core.stack.push(value);
        });
    }

    fn unref(&self, key: RefKey) {
        if self.is_closed() || key.is_nil() || key.0 < 0 {
            return;
        }
        self.with_core(|core| {
            let index = key.0 as usize;
            if index < core.slots.len() && core.slots[index].is_some() {
                core.slots[index] = None;
                core.free_slots.push(index);
            }
        });
    }

    fn call(&self, nargs: usize) -> VmResult<()> {
        if self.is_closed() {
            return Err(VmError::Runtime("instance is closed".into()));
        }

        // Extract the callee and open the frame; the borrow must not be held
        // across the dispatch, which re-enters the primitives.
        let callee = {
            let guard = self.inner.core.lock();
            let mut core = guard.borrow_mut();
            let base = core.base();
            let len = core.stack.len();
            if len < base + nargs + 1 {
                drop(core);
                drop(guard);
                return Err(self.vm_panic("call without a callable on the stack"));
            }
            let fn_pos = len - nargs - 1;
            let callee = core.stack.remove(fn_pos);
            core.frames.push(fn_pos);
            callee
        };

        let outcome = self.dispatch(callee);

        let guard = self.inner.core.lock();
        let mut core = guard.borrow_mut();
        let Some(frame_base) = core.frames.pop() else {
            drop(core);
            drop(guard);
            return Err(self.vm_panic("call frame underflow"));
        };
        match outcome {
            Ok(nresults) => {
                let len = core.stack.len();
                if len < frame_base + nresults {
                    core.stack.truncate(frame_base);
                    drop(core);
                    drop(guard);
                    return Err(
                        self.vm_panic("native callback reported more results than it pushed")
                    );
                }
                // keep the top `nresults` values, drop args and temporaries
                core.stack.drain(frame_base..len - nresults);
                Ok(())
            }
            Err(e) => {
                core.stack.truncate(frame_base);
                Err(e)
            }
        }
    }

    fn set_panic_hook(&self, hook: PanicHook) {
        *self.inner.panic_hook.lock() = Some(hook);
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Execution context handed to script-function bodies.
pub struct ScriptCtx<'a> {
    vm: &'a TestVm,
    args: Vec<CoreValue>,
}

impl ScriptCtx<'_> {
    /// The instance the function is executing in.
    pub fn vm(&self) -> &TestVm {
        self.vm
    }

    /// Number of arguments the caller passed.
    pub fn argc(&self) -> usize {
        self.args.len()
    }

    /// Argument by zero-based position (nil when absent).
    pub fn arg(&self, index: usize) -> CoreValue {
        self.args.get(index).cloned().unwrap_or(CoreValue::Nil)
    }

    /// Read a global of the executing instance.
    pub fn global(&self, name: &str) -> CoreValue {
        self.vm.get_global_value(name)
    }

    /// Call a value through the interpreter's call machinery. Errors raised
    /// by the callee (script or native) come back as `Err`, which the body
    /// may handle or propagate — the script-level equivalent of a protected
    /// call.
    pub fn call(
        &self,
        callee: CoreValue,
        args: &[CoreValue],
    ) -> Result<Vec<CoreValue>, ScriptError> {
        let vm = self.vm;
        let before = vm.top();
        vm.push_core(callee);
        for arg in args {
            vm.push_core(arg.clone());
        }
        match StackVm::call(vm, args.len()) {
            Ok(()) => {
                let produced = vm.top().saturating_sub(before);
                let mut results = Vec::with_capacity(produced);
                for _ in 0..produced {
                    results.push(vm.pop_core());
                }
                results.reverse();
                Ok(results)
            }
            Err(e) => Err(ScriptError::new(e.to_string())),
        }
    }

    /// Call a global by name.
    pub fn call_global(
        &self,
        name: &str,
        args: &[CoreValue],
    ) -> Result<Vec<CoreValue>, ScriptError> {
        self.call(self.global(name), args)
    }
}
