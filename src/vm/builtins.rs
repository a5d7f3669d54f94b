// Nova Core Runtime
// Built-in class graph, runtime method symbols and the core natives the VM
// itself depends on (iteration, table subscript, constructors)

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::ErrorKind;

use super::intern::StringPool;
use super::value::{Class, FnProto, Module, Native, NativeFn, NovaString, TableKey, Value};
use super::vm::VM;

pub const CORE_MODULE: &str = "__core__";

/// Method names the runtime needs at dispatch time, interned once at VM
/// init. The order must match `SYM_NAMES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum MethodSym {
    // Constructor method
    Ctor,

    // Iterator methods
    Iter,
    Next,

    // Binary overloads
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    // Reverse binary overloads
    Radd,
    Rsub,
    Rmul,
    Rdiv,
    Rmod,

    // Subscript overloads
    Get,
    Set,

    // Comparison and ordering overloads
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Neg,

    // Well-known exception fields
    Stacktrace,
    ErrField,
    CauseField,
}

pub const SYM_COUNT: usize = MethodSym::CauseField as usize + 1;

pub const SYM_NAMES: [&str; SYM_COUNT] = [
    "new",
    "__iter__",
    "__next__",
    "__add__",
    "__sub__",
    "__mul__",
    "__div__",
    "__mod__",
    "__radd__",
    "__rsub__",
    "__rmul__",
    "__rdiv__",
    "__rmod__",
    "__get__",
    "__set__",
    "__eq__",
    "__lt__",
    "__le__",
    "__gt__",
    "__ge__",
    "__neg__",
    "stacktrace",
    "_err",
    "_cause",
];

/// Built-in classes, created before any user code executes and kept alive
/// for the VM's whole lifetime.
pub struct CoreClasses {
    pub object: Arc<Class>,
    pub class: Arc<Class>,
    pub string: Arc<Class>,
    pub number: Arc<Class>,
    pub boolean: Arc<Class>,
    pub null: Arc<Class>,
    pub function: Arc<Class>,
    pub module: Arc<Class>,
    pub list: Arc<Class>,
    pub tuple: Arc<Class>,
    pub table: Arc<Class>,
    pub stacktrace: Arc<Class>,
    pub userdata: Arc<Class>,
    pub exception: Arc<Class>,
    exceptions: FxHashMap<ErrorKind, Arc<Class>>,
}

impl CoreClasses {
    pub fn exception_class(&self, kind: ErrorKind) -> Arc<Class> {
        self.exceptions
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| self.exception.clone())
    }
}

fn subclass(pool: &mut StringPool, name: &str, sup: &Arc<Class>) -> Arc<Class> {
    Arc::new(Class::new(pool.intern(name), Some(sup.clone())))
}

fn native_val(
    pool: &mut StringPool,
    module: &Arc<NovaString>,
    name: &str,
    arity: u8,
    defaults: Vec<Value>,
    fun: NativeFn,
) -> Value {
    Value::Native(Arc::new(Native {
        proto: FnProto {
            name: pool.intern(name),
            module: module.clone(),
            arity,
            defaults,
            vararg: false,
        },
        fun,
    }))
}

/// Build the core class graph, the runtime symbols and the core module.
pub fn init_core(
    pool: &mut StringPool,
) -> (CoreClasses, [Arc<NovaString>; SYM_COUNT], Arc<Module>) {
    let syms: [Arc<NovaString>; SYM_COUNT] = SYM_NAMES.map(|name| pool.intern(name));
    let core_name = pool.intern(CORE_MODULE);

    let object = Arc::new(Class::new(pool.intern("Object"), None));
    object.define_method(
        syms[MethodSym::Eq as usize].clone(),
        native_val(pool, &core_name, "__eq__", 1, Vec::new(), nat_value_eq),
    );

    // Every other builtin derives Object, copying __eq__ down
    let class = subclass(pool, "Class", &object);
    let string = subclass(pool, "String", &object);
    let number = subclass(pool, "Number", &object);
    let boolean = subclass(pool, "Boolean", &object);
    let null = subclass(pool, "Null", &object);
    let function = subclass(pool, "Function", &object);
    let module = subclass(pool, "Module", &object);
    let list = subclass(pool, "List", &object);
    let tuple = subclass(pool, "Tuple", &object);
    let table = subclass(pool, "Table", &object);
    let stacktrace = subclass(pool, "StackTrace", &object);
    let userdata = subclass(pool, "Userdata", &object);

    let ctor = syms[MethodSym::Ctor as usize].clone();
    let iter = syms[MethodSym::Iter as usize].clone();
    let next = syms[MethodSym::Next as usize].clone();

    list.define_method(
        ctor.clone(),
        native_val(
            pool,
            &core_name,
            "new",
            2,
            vec![Value::Number(0.0), Value::Null],
            nat_list_ctor,
        ),
    );
    list.define_method(
        iter.clone(),
        native_val(pool, &core_name, "__iter__", 1, Vec::new(), nat_list_iter),
    );
    list.define_method(
        next.clone(),
        native_val(pool, &core_name, "__next__", 1, Vec::new(), nat_list_next),
    );

    tuple.define_method(
        ctor.clone(),
        native_val(
            pool,
            &core_name,
            "new",
            1,
            vec![Value::Null],
            nat_tuple_ctor,
        ),
    );
    tuple.define_method(
        iter.clone(),
        native_val(pool, &core_name, "__iter__", 1, Vec::new(), nat_tuple_iter),
    );
    tuple.define_method(
        next.clone(),
        native_val(pool, &core_name, "__next__", 1, Vec::new(), nat_tuple_next),
    );

    string.define_method(
        ctor.clone(),
        native_val(
            pool,
            &core_name,
            "new",
            1,
            vec![Value::Null],
            nat_string_ctor,
        ),
    );
    string.define_method(
        iter,
        native_val(pool, &core_name, "__iter__", 1, Vec::new(), nat_string_iter),
    );
    string.define_method(
        next,
        native_val(pool, &core_name, "__next__", 1, Vec::new(), nat_string_next),
    );

    number.define_method(
        ctor.clone(),
        native_val(
            pool,
            &core_name,
            "new",
            1,
            vec![Value::Number(0.0)],
            nat_number_ctor,
        ),
    );
    boolean.define_method(
        ctor.clone(),
        native_val(
            pool,
            &core_name,
            "new",
            1,
            vec![Value::Boolean(false)],
            nat_boolean_ctor,
        ),
    );

    table.define_method(
        syms[MethodSym::Get as usize].clone(),
        native_val(pool, &core_name, "__get__", 1, Vec::new(), nat_table_get),
    );
    table.define_method(
        syms[MethodSym::Set as usize].clone(),
        native_val(pool, &core_name, "__set__", 2, Vec::new(), nat_table_set),
    );

    let exception = subclass(pool, "Exception", &object);
    exception.define_method(
        ctor,
        native_val(
            pool,
            &core_name,
            "new",
            2,
            vec![Value::Null, Value::Null],
            nat_exc_ctor,
        ),
    );
    exception.define_method(
        pool.intern("err"),
        native_val(pool, &core_name, "err", 0, Vec::new(), nat_exc_err),
    );

    let mut exceptions = FxHashMap::default();
    exceptions.insert(ErrorKind::Runtime, exception.clone());
    for kind in ErrorKind::ALL {
        if kind == ErrorKind::Runtime {
            continue;
        }
        exceptions.insert(kind, subclass(pool, kind.class_name(), &exception));
    }

    let core_module = Arc::new(Module::new(core_name));
    {
        let mut globals = core_module.globals.write();
        for cls in [
            &object, &class, &string, &number, &boolean, &null, &function, &module, &list,
            &tuple, &table, &stacktrace, &userdata,
        ] {
            globals.insert(cls.name.clone(), Value::Class((*cls).clone()));
        }
        for cls in exceptions.values() {
            globals.insert(cls.name.clone(), Value::Class(cls.clone()));
        }
    }

    let core = CoreClasses {
        object,
        class,
        string,
        number,
        boolean,
        null,
        function,
        module,
        list,
        tuple,
        table,
        stacktrace,
        userdata,
        exception,
        exceptions,
    };

    (core, syms, core_module)
}

/// Builtins-first native resolution consulted by `NAT_METHOD`/`NATIVE`
/// before a module's own registry.
pub fn resolve_builtin(module: &str, class: Option<&str>, name: &str) -> Option<NativeFn> {
    if module != CORE_MODULE {
        return None;
    }
    match (class, name) {
        (Some("Object"), "__eq__") => Some(nat_value_eq),
        (Some("Exception"), "new") => Some(nat_exc_ctor),
        (Some("Exception"), "err") => Some(nat_exc_err),
        (Some("List"), "new") => Some(nat_list_ctor),
        (Some("List"), "__iter__") => Some(nat_list_iter),
        (Some("List"), "__next__") => Some(nat_list_next),
        (Some("Tuple"), "new") => Some(nat_tuple_ctor),
        (Some("Tuple"), "__iter__") => Some(nat_tuple_iter),
        (Some("Tuple"), "__next__") => Some(nat_tuple_next),
        (Some("String"), "new") => Some(nat_string_ctor),
        (Some("String"), "__iter__") => Some(nat_string_iter),
        (Some("String"), "__next__") => Some(nat_string_next),
        (Some("Number"), "new") => Some(nat_number_ctor),
        (Some("Boolean"), "new") => Some(nat_boolean_ctor),
        (Some("Table"), "__get__") => Some(nat_table_get),
        (Some("Table"), "__set__") => Some(nat_table_set),
        _ => None,
    }
}

// ==================== Core Natives ====================

fn nat_value_eq(vm: &mut VM) -> bool {
    let a = vm.api_slot(0);
    let b = vm.api_slot(1);
    vm.push(Value::Boolean(a == b));
    true
}

fn nat_exc_ctor(vm: &mut VM) -> bool {
    let this = vm.api_slot(0);
    let err = vm.api_slot(1);
    let cause = vm.api_slot(2);
    if let Value::Instance(inst) = &this {
        let err_sym = vm.sym(MethodSym::ErrField).clone();
        let cause_sym = vm.sym(MethodSym::CauseField).clone();
        let mut guard = inst.lock();
        guard.fields.insert(err_sym, err);
        guard.fields.insert(cause_sym, cause);
    }
    vm.push(this);
    true
}

fn nat_exc_err(vm: &mut VM) -> bool {
    let this = vm.api_slot(0);
    let value = if let Value::Instance(inst) = &this {
        let err_sym = vm.sym(MethodSym::ErrField).clone();
        inst.lock().fields.get(&err_sym).cloned().unwrap_or(Value::Null)
    } else {
        Value::Null
    };
    vm.push(value);
    true
}

// Iterator state protocol: null starts iteration, a number advances by one,
// anything non-truthy the VM sees terminates the loop.
fn push_next_index(vm: &mut VM, len: usize, state: Value) -> bool {
    match state {
        Value::Null => {
            if len > 0 {
                vm.push(Value::Number(0.0));
            } else {
                vm.push(Value::Boolean(false));
            }
            true
        }
        Value::Number(i) => {
            let next = i + 1.0;
            if next >= 0.0 && (next as usize) < len {
                vm.push(Value::Number(next));
            } else {
                vm.push(Value::Boolean(false));
            }
            true
        }
        _ => vm.raise(
            ErrorKind::InvalidArg,
            "Iterator state must be a Number or null.",
        ),
    }
}

fn index_state(vm: &mut VM, state: &Value, len: usize) -> Option<usize> {
    match state {
        Value::Number(i) if *i >= 0.0 && (*i as usize) < len => Some(*i as usize),
        Value::Number(i) => {
            vm.raise(
                ErrorKind::IndexOutOfBound,
                format!("Index out of bound: {}.", i),
            );
            None
        }
        _ => {
            vm.raise(
                ErrorKind::InvalidArg,
                "Iterator state must be a Number.",
            );
            None
        }
    }
}

fn nat_list_iter(vm: &mut VM) -> bool {
    let len = match vm.api_slot(0) {
        Value::List(list) => list.lock().len(),
        _ => return vm.raise(ErrorKind::Type, "__iter__() receiver must be a List."),
    };
    let state = vm.api_slot(1);
    push_next_index(vm, len, state)
}

fn nat_list_next(vm: &mut VM) -> bool {
    let Value::List(list) = vm.api_slot(0) else {
        return vm.raise(ErrorKind::Type, "__next__() receiver must be a List.");
    };
    let state = vm.api_slot(1);
    let len = list.lock().len();
    let Some(index) = index_state(vm, &state, len) else {
        return false;
    };
    let value = list.lock()[index].clone();
    vm.push(value);
    true
}

fn nat_tuple_iter(vm: &mut VM) -> bool {
    let len = match vm.api_slot(0) {
        Value::Tuple(items) => items.len(),
        _ => return vm.raise(ErrorKind::Type, "__iter__() receiver must be a Tuple."),
    };
    let state = vm.api_slot(1);
    push_next_index(vm, len, state)
}

fn nat_tuple_next(vm: &mut VM) -> bool {
    let Value::Tuple(items) = vm.api_slot(0) else {
        return vm.raise(ErrorKind::Type, "__next__() receiver must be a Tuple.");
    };
    let state = vm.api_slot(1);
    let Some(index) = index_state(vm, &state, items.len()) else {
        return false;
    };
    vm.push(items[index].clone());
    true
}

fn nat_string_iter(vm: &mut VM) -> bool {
    let len = match vm.api_slot(0) {
        Value::String(s) => s.len(),
        _ => return vm.raise(ErrorKind::Type, "__iter__() receiver must be a String."),
    };
    let state = vm.api_slot(1);
    push_next_index(vm, len, state)
}

fn nat_string_next(vm: &mut VM) -> bool {
    let Value::String(s) = vm.api_slot(0) else {
        return vm.raise(ErrorKind::Type, "__next__() receiver must be a String.");
    };
    let state = vm.api_slot(1);
    let Some(index) = index_state(vm, &state, s.len()) else {
        return false;
    };
    let Some(ch) = s.as_str().get(index..index + 1).map(str::to_string) else {
        return vm.raise(
            ErrorKind::InvalidArg,
            "Byte index is not on a character boundary.",
        );
    };
    let value = Value::String(vm.intern(&ch));
    vm.push(value);
    true
}

fn nat_table_get(vm: &mut VM) -> bool {
    let Value::Table(table) = vm.api_slot(0) else {
        return vm.raise(ErrorKind::Type, "__get__() receiver must be a Table.");
    };
    let key = vm.api_slot(1);
    let Some(key) = TableKey::from_value(&key) else {
        let cls = vm.get_class(&key);
        return vm.raise(
            ErrorKind::Type,
            format!("Type {} is not hashable.", cls.name),
        );
    };
    let value = table.lock().get(&key).cloned().unwrap_or(Value::Null);
    vm.push(value);
    true
}

fn nat_table_set(vm: &mut VM) -> bool {
    let Value::Table(table) = vm.api_slot(0) else {
        return vm.raise(ErrorKind::Type, "__set__() receiver must be a Table.");
    };
    let key = vm.api_slot(1);
    let value = vm.api_slot(2);
    let Some(key) = TableKey::from_value(&key) else {
        let cls = vm.get_class(&key);
        return vm.raise(
            ErrorKind::Type,
            format!("Type {} is not hashable.", cls.name),
        );
    };
    table.lock().insert(key, value.clone());
    vm.push(value);
    true
}

fn nat_list_ctor(vm: &mut VM) -> bool {
    let count = match vm.api_slot(1) {
        Value::Number(n) if n >= 0.0 && n.trunc() == n => n as usize,
        Value::Null => 0,
        _ => {
            return vm.raise(
                ErrorKind::InvalidArg,
                "List size must be a non-negative integer.",
            )
        }
    };
    let fill = vm.api_slot(2);
    let list = vm.new_list(vec![fill; count]);
    vm.push(list);
    true
}

fn nat_tuple_ctor(vm: &mut VM) -> bool {
    match vm.api_slot(1) {
        Value::Null => {
            let tuple = vm.new_tuple(Vec::new());
            vm.push(tuple);
        }
        Value::List(list) => {
            let items = list.lock().clone();
            let tuple = vm.new_tuple(items);
            vm.push(tuple);
        }
        Value::Tuple(items) => vm.push(Value::Tuple(items)),
        _ => {
            return vm.raise(
                ErrorKind::Type,
                "Tuple() argument must be a List or a Tuple.",
            )
        }
    }
    true
}

fn nat_string_ctor(vm: &mut VM) -> bool {
    let text = match vm.api_slot(1) {
        Value::Null => String::new(),
        other => format!("{}", other),
    };
    let value = Value::String(vm.intern(&text));
    vm.push(value);
    true
}

fn nat_number_ctor(vm: &mut VM) -> bool {
    let value = match vm.api_slot(1) {
        Value::Number(n) => Value::Number(n),
        Value::Boolean(b) => Value::Number(if b { 1.0 } else { 0.0 }),
        Value::Null => Value::Number(0.0),
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(n) => Value::Number(n),
            Err(_) => {
                return vm.raise(
                    ErrorKind::InvalidArg,
                    format!("'{}' cannot be converted to a Number.", s),
                )
            }
        },
        other => {
            let cls = vm.get_class(&other);
            return vm.raise(
                ErrorKind::Type,
                format!("Cannot convert {} to a Number.", cls.name),
            );
        }
    };
    vm.push(value);
    true
}

fn nat_boolean_ctor(vm: &mut VM) -> bool {
    let value = Value::Boolean(vm.api_slot(1).is_truthy());
    vm.push(value);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sym_table_is_consistent() {
        assert_eq!(SYM_NAMES.len(), SYM_COUNT);
        assert_eq!(SYM_NAMES[MethodSym::Ctor as usize], "new");
        assert_eq!(SYM_NAMES[MethodSym::Neg as usize], "__neg__");
        assert_eq!(SYM_NAMES[MethodSym::Stacktrace as usize], "stacktrace");
    }

    #[test]
    fn exception_classes_subclass_exception() {
        let mut pool = StringPool::new();
        let (core, _, _) = init_core(&mut pool);
        for kind in ErrorKind::ALL {
            let cls = core.exception_class(kind);
            assert_eq!(cls.name.as_str(), kind.class_name());
            if kind != ErrorKind::Runtime {
                let sup = cls.superclass.clone().unwrap();
                assert!(Arc::ptr_eq(&sup, &core.exception));
            }
        }
    }

    #[test]
    fn core_module_exposes_classes() {
        let mut pool = StringPool::new();
        let (_, _, core_module) = init_core(&mut pool);
        for name in ["Object", "List", "Exception", "TypeException"] {
            let key = pool.intern(name);
            assert!(core_module.global(&key).is_some(), "missing {}", name);
        }
    }

    #[test]
    fn builtins_resolve_by_name() {
        assert!(resolve_builtin(CORE_MODULE, Some("List"), "__iter__").is_some());
        assert!(resolve_builtin(CORE_MODULE, Some("Exception"), "new").is_some());
        assert!(resolve_builtin(CORE_MODULE, None, "nothing").is_none());
        assert!(resolve_builtin("other", Some("List"), "__iter__").is_none());
    }
}
