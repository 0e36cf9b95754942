//! Value cells and tables

use std::sync::Arc;

use parking_lot::Mutex;
use selune_vm::{NativeCallback, ScriptError, ValueTag};

use crate::ScriptCtx;

/// Shared, mutable table storage.
pub type TableRef = Arc<Mutex<TableData>>;

/// Body of a script function. Scripts are registered programmatically as
/// host closures — source loading is outside the interpreter surface the
/// bridge consumes — but they call other values (including native
/// functions) through the interpreter's own call machinery.
pub type ScriptBody = Arc<dyn Fn(&ScriptCtx<'_>) -> Result<Vec<CoreValue>, ScriptError> + Send + Sync>;

/// A function defined "in script".
pub struct ScriptFn {
    pub(crate) name: String,
    pub(crate) body: ScriptBody,
}

/// One interpreter value cell.
#[derive(Clone)]
pub enum CoreValue {
    /// The nil value
    Nil,
    /// A boolean
    Bool(bool),
    /// A number
    Number(f64),
    /// An immutable string
    Str(Arc<str>),
    /// A table; clones share storage
    Table(TableRef),
    /// A script function
    Script(Arc<ScriptFn>),
    /// A native function installed by the host
    Native(NativeCallback),
}

impl CoreValue {
    /// Build a string value.
    pub fn str(s: impl AsRef<str>) -> CoreValue {
        CoreValue::Str(Arc::from(s.as_ref()))
    }

    /// Build a table value from key/value pairs, in insertion order.
    /// Pairs whose key is not a scalar are skipped.
    pub fn table_from(pairs: Vec<(CoreValue, CoreValue)>) -> CoreValue {
        let mut data = TableData::default();
        for (key, value) in pairs {
            if let Some(key) = TableKey::from_value(&key) {
                data.set(key, value);
            }
        }
        CoreValue::Table(Arc::new(Mutex::new(data)))
    }

    /// Whether this is nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, CoreValue::Nil)
    }

    /// Truthiness: nil and false are false, everything else is true.
    pub fn truthy(&self) -> bool {
        !matches!(self, CoreValue::Nil | CoreValue::Bool(false))
    }

    /// String view, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CoreValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CoreValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean view, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CoreValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Read `self[key]`, returning nil when this is not a table or the key
    /// is absent or non-scalar.
    pub fn index(&self, key: &CoreValue) -> CoreValue {
        match (self, TableKey::from_value(key)) {
            (CoreValue::Table(table), Some(key)) => table.lock().get(&key),
            _ => CoreValue::Nil,
        }
    }

    /// Perform `self[key] = value`; returns whether the store happened.
    pub fn set_index(&self, key: CoreValue, value: CoreValue) -> bool {
        match (self, TableKey::from_value(&key)) {
            (CoreValue::Table(table), Some(key)) => {
                table.lock().set(key, value);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn type_tag(&self) -> ValueTag {
        match self {
            CoreValue::Nil => ValueTag::Nil,
            CoreValue::Bool(_) => ValueTag::Boolean,
            CoreValue::Number(_) => ValueTag::Number,
            CoreValue::Str(_) => ValueTag::String,
            CoreValue::Table(_) => ValueTag::Table,
            CoreValue::Script(_) => ValueTag::Function,
            CoreValue::Native(_) => ValueTag::NativeFunction,
        }
    }

    /// Human-readable type name.
    pub fn type_name(&self) -> &'static str {
        self.type_tag().name()
    }
}

impl std::fmt::Debug for CoreValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreValue::Nil => write!(f, "nil"),
            CoreValue::Bool(b) => write!(f, "{b}"),
            CoreValue::Number(n) => write!(f, "{n}"),
            CoreValue::Str(s) => write!(f, "{s:?}"),
            CoreValue::Table(t) => write!(f, "table({} entries)", t.lock().len()),
            CoreValue::Script(s) => write!(f, "function({})", s.name),
            CoreValue::Native(_) => write!(f, "native function"),
        }
    }
}

/// A scalar table key.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum TableKey {
    Bool(bool),
    Number(f64),
    Str(Arc<str>),
}

impl TableKey {
    pub(crate) fn from_value(value: &CoreValue) -> Option<TableKey> {
        match value {
            CoreValue::Bool(b) => Some(TableKey::Bool(*b)),
            CoreValue::Number(n) => Some(TableKey::Number(*n)),
            CoreValue::Str(s) => Some(TableKey::Str(s.clone())),
            _ => None,
        }
    }

    pub(crate) fn to_value(&self) -> CoreValue {
        match self {
            TableKey::Bool(b) => CoreValue::Bool(*b),
            TableKey::Number(n) => CoreValue::Number(*n),
            TableKey::Str(s) => CoreValue::Str(s.clone()),
        }
    }
}

/// Insertion-ordered associative storage. Iteration order is the order keys
/// were first inserted, which is what the bridge's path-as-table convention
/// relies on.
#[derive(Default)]
pub struct TableData {
    entries: Vec<(TableKey, CoreValue)>,
}

impl TableData {
    pub(crate) fn get(&self, key: &TableKey) -> CoreValue {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or(CoreValue::Nil)
    }

    /// Store an entry. Assigning nil removes the key.
    pub(crate) fn set(&mut self, key: TableKey, value: CoreValue) {
        if value.is_nil() {
            self.entries.retain(|(k, _)| k != &key);
            return;
        }
        match self.entries.iter_mut().find(|(k, _)| k == &key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub(crate) fn position(&self, key: &TableKey) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    pub(crate) fn entry_at(&self, index: usize) -> Option<(TableKey, CoreValue)> {
        self.entries.get(index).cloned()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
