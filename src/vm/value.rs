// Nova Runtime Values
// Heap objects are Arc-backed; mutable kinds carry interior mutability so
// instances, lists and tables can be shared freely between stack slots

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHasher};

use crate::bytecode::Chunk;
use crate::error::StackFrame;

/// Native function type. A native reads its arguments through the VM's api
/// window (`api_slot`), pushes exactly one return value and returns `true`;
/// on failure it leaves an exception instance on the stack (usually via
/// `VM::raise`) and returns `false`.
pub type NativeFn = fn(&mut crate::vm::vm::VM) -> bool;

/// Immutable string with a precomputed hash.
///
/// Strings created through the VM's intern pool are canonical: equal content
/// is the same object. Dynamically built strings (concatenation results) may
/// be fresh objects; equality stays content-based with a pointer fast path.
pub struct NovaString {
    data: Box<str>,
    pub hash: u64,
}

impl NovaString {
    pub fn new(s: impl Into<Box<str>>) -> Self {
        let data = s.into();
        let mut hasher = FxHasher::default();
        data.hash(&mut hasher);
        let hash = hasher.finish();
        Self { data, hash }
    }

    pub fn as_str(&self) -> &str {
        &self.data
    }
}

impl Deref for NovaString {
    type Target = str;

    fn deref(&self) -> &str {
        &self.data
    }
}

impl Hash for NovaString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl PartialEq for NovaString {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.data == other.data
    }
}

impl Eq for NovaString {}

impl fmt::Display for NovaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.data)
    }
}

impl fmt::Debug for NovaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.data)
    }
}

/// Arity contract shared by compiled functions and natives.
///
/// `arity` is the declared parameter count ("most"); the last
/// `defaults.len()` parameters take default values, so the least acceptable
/// argument count is `arity - defaults.len()`. A vararg callable collects
/// trailing arguments into a tuple pushed as one extra slot.
#[derive(Clone)]
pub struct FnProto {
    pub name: Arc<NovaString>,
    /// Name of the owning module.
    pub module: Arc<NovaString>,
    pub arity: u8,
    pub defaults: Vec<Value>,
    pub vararg: bool,
}

impl FnProto {
    pub fn least(&self) -> u8 {
        self.arity - self.defaults.len() as u8
    }
}

/// Compiled function object.
pub struct Function {
    pub proto: FnProto,
    pub chunk: Chunk,
    pub upvalue_count: u8,
    /// Superclass frozen when this function is installed as a method, read
    /// by super dispatch. Lexical: re-defining the method overwrites it.
    pub super_class: RwLock<Option<Arc<Class>>>,
}

impl Function {
    pub fn new(proto: FnProto, chunk: Chunk, upvalue_count: u8) -> Self {
        Self {
            proto,
            chunk,
            upvalue_count,
            super_class: RwLock::new(None),
        }
    }
}

/// Native function object.
pub struct Native {
    pub proto: FnProto,
    pub fun: NativeFn,
}

/// A function plus its captured upvalues.
pub struct Closure {
    pub fun: Arc<Function>,
    pub upvalues: Box<[Arc<Mutex<UpvalueObj>>]>,
}

impl Closure {
    pub fn new(fun: Arc<Function>) -> Self {
        Self {
            fun,
            upvalues: Vec::new().into_boxed_slice(),
        }
    }
}

/// Upvalue cell. While open it names a live stack slot; once closed it owns
/// the migrated value. Readers must check `closed` first.
#[derive(Clone, Debug)]
pub struct UpvalueObj {
    pub location: usize,
    pub closed: Option<Box<Value>>,
}

impl UpvalueObj {
    pub fn new(location: usize) -> Self {
        Self {
            location,
            closed: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.closed.is_none()
    }
}

/// Class object. The method table is copied down from the superclass at
/// creation, flattening dispatch; later mutation of a superclass does not
/// propagate to existing subclasses.
pub struct Class {
    pub name: Arc<NovaString>,
    pub superclass: Option<Arc<Class>>,
    pub methods: RwLock<FxHashMap<Arc<NovaString>, Value>>,
}

impl Class {
    pub fn new(name: Arc<NovaString>, superclass: Option<Arc<Class>>) -> Self {
        let methods = match &superclass {
            Some(sup) => sup.methods.read().clone(),
            None => FxHashMap::default(),
        };
        Self {
            name,
            superclass,
            methods: RwLock::new(methods),
        }
    }

    pub fn method(&self, name: &Arc<NovaString>) -> Option<Value> {
        self.methods.read().get(name).cloned()
    }

    pub fn define_method(&self, name: Arc<NovaString>, method: Value) {
        self.methods.write().insert(name, method);
    }
}

/// Instance object.
pub struct Instance {
    pub class: Arc<Class>,
    pub fields: FxHashMap<Arc<NovaString>, Value>,
}

impl Instance {
    pub fn new(class: Arc<Class>) -> Self {
        Self {
            class,
            fields: FxHashMap::default(),
        }
    }
}

/// Native symbol registration for a module.
pub enum NativeReg {
    Function {
        name: &'static str,
        fun: NativeFn,
    },
    Method {
        class: &'static str,
        name: &'static str,
        fun: NativeFn,
    },
}

/// Module object. The main function is consumed on first run, which is what
/// makes imports compile-once, run-once.
pub struct Module {
    pub name: Arc<NovaString>,
    pub globals: RwLock<FxHashMap<Arc<NovaString>, Value>>,
    pub natives: RwLock<Vec<NativeReg>>,
    pub main: Mutex<Option<Arc<Function>>>,
}

impl Module {
    pub fn new(name: Arc<NovaString>) -> Self {
        Self {
            name,
            globals: RwLock::new(FxHashMap::default()),
            natives: RwLock::new(Vec::new()),
            main: Mutex::new(None),
        }
    }

    pub fn global(&self, name: &Arc<NovaString>) -> Option<Value> {
        self.globals.read().get(name).cloned()
    }

    pub fn register_native(&self, reg: NativeReg) {
        self.natives.write().push(reg);
    }

    pub fn resolve_native(&self, class: Option<&str>, name: &str) -> Option<NativeFn> {
        for reg in self.natives.read().iter() {
            match reg {
                NativeReg::Method {
                    class: c,
                    name: n,
                    fun,
                } if class == Some(*c) && name == *n => return Some(*fun),
                NativeReg::Function { name: n, fun } if class.is_none() && name == *n => {
                    return Some(*fun)
                }
                _ => {}
            }
        }
        None
    }
}

/// Receiver bound to a method callable.
pub struct BoundMethod {
    pub receiver: Value,
    /// Always a `Closure` or `Native` value.
    pub method: Value,
}

/// Trace of unwound frames, innermost first, attached to raised exceptions.
#[derive(Default)]
pub struct StackTrace {
    pub records: Vec<StackFrame>,
}

impl StackTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, frame: StackFrame) {
        self.records.push(frame);
    }
}

/// Hashable key of a table entry. Numbers hash by bit pattern.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    Null,
    Boolean(bool),
    Number(u64),
    Str(Arc<NovaString>),
    Tuple(Box<[TableKey]>),
}

impl TableKey {
    /// `None` when the value is not hashable.
    pub fn from_value(v: &Value) -> Option<TableKey> {
        match v {
            Value::Null => Some(TableKey::Null),
            Value::Boolean(b) => Some(TableKey::Boolean(*b)),
            Value::Number(n) => Some(TableKey::Number(n.to_bits())),
            Value::String(s) => Some(TableKey::Str(s.clone())),
            Value::Tuple(items) => items
                .iter()
                .map(TableKey::from_value)
                .collect::<Option<Vec<_>>>()
                .map(|keys| TableKey::Tuple(keys.into_boxed_slice())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            TableKey::Null => Value::Null,
            TableKey::Boolean(b) => Value::Boolean(*b),
            TableKey::Number(bits) => Value::Number(f64::from_bits(*bits)),
            TableKey::Str(s) => Value::String(s.clone()),
            TableKey::Tuple(keys) => {
                let items: Vec<Value> = keys.iter().map(TableKey::to_value).collect();
                Value::Tuple(Arc::from(items))
            }
        }
    }
}

/// Runtime value.
#[derive(Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Number(f64),
    /// Opaque host handle.
    Handle(usize),
    String(Arc<NovaString>),
    List(Arc<Mutex<Vec<Value>>>),
    Tuple(Arc<[Value]>),
    Table(Arc<Mutex<FxHashMap<TableKey, Value>>>),
    Function(Arc<Function>),
    Native(Arc<Native>),
    Closure(Arc<Closure>),
    BoundMethod(Arc<BoundMethod>),
    Class(Arc<Class>),
    Instance(Arc<Mutex<Instance>>),
    Module(Arc<Module>),
    StackTrace(Arc<Mutex<StackTrace>>),
}

impl Value {
    /// Only `null` and `false` are falsy. In particular the number 0 is
    /// truthy, so iterator states can carry list indexes.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Boolean(false))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    /// Structural equality for numbers (IEEE-754, NaN != NaN), null and
    /// booleans; content equality for strings; identity for everything else.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Handle(a), Value::Handle(b)) => a == b,
            (Value::String(a), Value::String(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Arc::ptr_eq(a, b),
            (Value::Table(a), Value::Table(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Arc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            (Value::BoundMethod(a), Value::BoundMethod(b)) => Arc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Arc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Arc::ptr_eq(a, b),
            (Value::Module(a), Value::Module(b)) => Arc::ptr_eq(a, b),
            (Value::StackTrace(a), Value::StackTrace(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => {
                if n.fract() == 0.0 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Handle(h) => write!(f, "<handle {:#x}>", h),
            Value::String(s) => write!(f, "{}", s),
            Value::List(list) => {
                if let Some(items) = list.try_lock() {
                    let parts: Vec<String> = items.iter().map(|v| format!("{}", v)).collect();
                    write!(f, "[{}]", parts.join(", "))
                } else {
                    write!(f, "[...]")
                }
            }
            Value::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(|v| format!("{}", v)).collect();
                write!(f, "({})", parts.join(", "))
            }
            Value::Table(table) => {
                if let Some(entries) = table.try_lock() {
                    let parts: Vec<String> = entries
                        .iter()
                        .map(|(k, v)| format!("{}: {}", k.to_value(), v))
                        .collect();
                    write!(f, "{{{}}}", parts.join(", "))
                } else {
                    write!(f, "{{...}}")
                }
            }
            Value::Function(fun) => write!(f, "<fn {}>", fun.proto.name),
            Value::Native(n) => write!(f, "<native fn {}>", n.proto.name),
            Value::Closure(c) => write!(f, "<fn {}>", c.fun.proto.name),
            Value::BoundMethod(bm) => match &bm.method {
                Value::Closure(c) => write!(f, "<bound method {}>", c.fun.proto.name),
                Value::Native(n) => write!(f, "<bound method {}>", n.proto.name),
                other => write!(f, "<bound method {}>", other),
            },
            Value::Class(cls) => write!(f, "<class {}>", cls.name),
            Value::Instance(inst) => {
                if let Some(inst) = inst.try_lock() {
                    write!(f, "<{} instance>", inst.class.name)
                } else {
                    write!(f, "<instance>")
                }
            }
            Value::Module(m) => write!(f, "<module {}>", m.name),
            Value::StackTrace(_) => write!(f, "<stacktrace>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}
