// Nova Virtual Machine
// Stack-based bytecode interpreter: call protocol, operator overload
// dispatch, upvalue capture and the except/ensure unwinder

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::bytecode::{Chunk, Constant, OpCode};
use crate::error::{ErrorCallback, ErrorKind, NovaError, NovaResult, StackFrame};

use super::builtins::{self, CoreClasses, MethodSym, SYM_COUNT};
use super::gc::{GcHeap, GcStats};
use super::import::ModuleLoader;
use super::intern::StringPool;
use super::value::{
    BoundMethod, Class, Closure, FnProto, Function, Instance, Module, NovaString, StackTrace,
    UpvalueObj, Value,
};

/// Highest local slot addressable by a byte operand.
pub const MAX_LOCALS: usize = 255;
/// Exception handlers a single frame can have pending.
pub const HANDLER_MAX: usize = 8;
/// Frame recursion limit; the stack itself grows on demand.
pub const RECURSION_LIMIT: usize = 4096;

// Stack slots guaranteed to a native on entry
const MIN_NATIVE_SLOTS: usize = 20;
// Instructions between GC threshold checks
const GC_CHECK_INTERVAL: usize = 10_000;

/// Why a handler is being entered; pushed on the stack above the carried
/// value and consumed by `END_TRY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnwindCause {
    Except = 0,
    Return = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerKind {
    Except,
    Ensure,
}

/// Restore point for except/ensure blocks.
#[derive(Debug, Clone, Copy)]
struct Handler {
    kind: HandlerKind,
    address: usize,
    saved_sp: usize,
}

#[derive(Clone)]
pub(crate) enum FrameFn {
    Closure(Arc<Closure>),
    Native(Arc<super::value::Native>),
}

impl FrameFn {
    fn proto(&self) -> &FnProto {
        match self {
            FrameFn::Closure(c) => &c.fun.proto,
            FrameFn::Native(n) => &n.proto,
        }
    }
}

/// Call frame. `base` indexes the callee slot; locals follow it.
pub(crate) struct Frame {
    fun: FrameFn,
    ip: usize,
    base: usize,
    handlers: SmallVec<[Handler; HANDLER_MAX]>,
}

impl Frame {
    fn new(fun: FrameFn, base: usize) -> Self {
        Self {
            fun,
            ip: 0,
            base,
            handlers: SmallVec::new(),
        }
    }

    #[inline(always)]
    fn closure(&self) -> &Arc<Closure> {
        match &self.fun {
            FrameFn::Closure(c) => c,
            FrameFn::Native(_) => unreachable!("native frames execute no bytecode"),
        }
    }

    #[inline(always)]
    fn chunk(&self) -> &Chunk {
        &self.closure().fun.chunk
    }

    #[inline(always)]
    fn read_byte(&mut self) -> u8 {
        let byte = unsafe { *self.chunk().code.get_unchecked(self.ip) };
        self.ip += 1;
        byte
    }

    #[inline(always)]
    fn read_u16(&mut self) -> u16 {
        let chunk = self.chunk();
        let high = unsafe { *chunk.code.get_unchecked(self.ip) } as u16;
        let low = unsafe { *chunk.code.get_unchecked(self.ip + 1) } as u16;
        self.ip += 2;
        (high << 8) | low
    }

    #[inline(always)]
    fn read_i16(&mut self) -> i16 {
        self.read_u16() as i16
    }

    fn line(&self) -> u32 {
        match &self.fun {
            FrameFn::Closure(_) => self.chunk().get_line(self.ip.saturating_sub(1)),
            FrameFn::Native(_) => 0,
        }
    }

    fn trace_record(&self, depth: usize) -> StackFrame {
        let proto = self.fun.proto();
        StackFrame::new(
            proto.module.as_str(),
            proto.name.as_str(),
            self.line(),
            depth,
        )
    }
}

/// VM configuration.
pub struct VmConf {
    /// Initial operand stack capacity; rounded up to a multiple of
    /// `MAX_LOCALS + 1`.
    pub stack_size: usize,
    /// Tracked-object count that triggers the first collection.
    pub init_gc: usize,
    /// Multiplier applied to the live count after each collection.
    pub heap_grow_rate: usize,
    /// Invoked with (kind, module, line, message) for unhandled exceptions.
    pub error_callback: Option<ErrorCallback>,
}

impl Default for VmConf {
    fn default() -> Self {
        Self {
            stack_size: 100 * (MAX_LOCALS + 1),
            init_gc: 10_000,
            heap_grow_rate: 2,
            error_callback: None,
        }
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    ((value + multiple - 1) / multiple) * multiple
}

/// The Nova Virtual Machine. One VM is one isolation unit; all mutable
/// runtime state lives here.
pub struct VM {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    // Base of the stack window visible to the executing native
    api_stack: usize,
    // Open upvalues sorted by descending stack slot
    open_upvalues: Vec<Arc<Mutex<UpvalueObj>>>,
    strings: StringPool,
    syms: [Arc<NovaString>; SYM_COUNT],
    core: CoreClasses,
    pub(crate) core_module: Arc<Module>,
    pub(crate) modules: FxHashMap<Arc<NovaString>, Arc<Module>>,
    // Module owning the currently executing code
    pub(crate) module: Option<Arc<Module>>,
    empty_tuple: Arc<[Value]>,
    pub(crate) loader: Option<Box<dyn ModuleLoader>>,
    eval_break: Arc<AtomicBool>,
    error_callback: Option<ErrorCallback>,
    gc: GcHeap,
    gc_counter: usize,
    gc_stats_enabled: bool,
}

enum ReturnFlow {
    // An ensure handler intercepted the return
    Ensure,
    // The frame was popped, evaluation continues in the caller
    Popped,
    // The frame was popped and the eval boundary was reached
    Done,
}

impl VM {
    pub fn new(conf: VmConf) -> Self {
        let mut strings = StringPool::new();
        let (core, syms, core_module) = builtins::init_core(&mut strings);

        let stack_size = round_up(conf.stack_size.max(MAX_LOCALS + 1), MAX_LOCALS + 1);
        let mut vm = Self {
            stack: Vec::with_capacity(stack_size),
            frames: Vec::with_capacity(stack_size / (MAX_LOCALS + 1)),
            api_stack: 0,
            open_upvalues: Vec::new(),
            strings,
            syms,
            core,
            core_module: core_module.clone(),
            modules: FxHashMap::default(),
            module: None,
            empty_tuple: Arc::from(Vec::<Value>::new()),
            loader: None,
            eval_break: Arc::new(AtomicBool::new(false)),
            error_callback: conf.error_callback,
            gc: GcHeap::new(conf.init_gc, conf.heap_grow_rate),
            gc_counter: 0,
            gc_stats_enabled: false,
        };
        vm.modules
            .insert(core_module.name.clone(), core_module.clone());
        let main = vm.define_module("__main__");
        vm.module = Some(main);
        vm
    }

    /// Reset runtime state for reuse, keeping modules and interned strings.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.api_stack = 0;
        self.gc_counter = 0;
        self.module = self.get_module("__main__");
    }

    pub fn set_loader(&mut self, loader: Box<dyn ModuleLoader>) {
        self.loader = Some(loader);
    }

    pub fn set_gc_stats_enabled(&mut self, enabled: bool) {
        self.gc_stats_enabled = enabled;
    }

    /// Flag polled at dispatch safepoints; setting it makes the evaluator
    /// raise `ProgramInterrupt`. Safe to store from a signal handler thread.
    pub fn eval_break_handle(&self) -> Arc<AtomicBool> {
        self.eval_break.clone()
    }

    pub fn main_module(&self) -> Arc<Module> {
        self.get_module("__main__").expect("main module missing")
    }

    pub fn gc_stats(&self) -> GcStats {
        self.gc.get_stats()
    }

    pub fn intern(&mut self, s: &str) -> Arc<NovaString> {
        self.strings.intern(s)
    }

    pub fn sym(&self, sym: MethodSym) -> &Arc<NovaString> {
        &self.syms[sym as usize]
    }

    // ==================== Stack Operations ====================

    #[inline(always)]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline(always)]
    pub fn pop(&mut self) -> Value {
        unsafe { self.stack.pop().unwrap_unchecked() }
    }

    #[inline(always)]
    pub fn peek(&self) -> &Value {
        unsafe { self.stack.get_unchecked(self.stack.len() - 1) }
    }

    #[inline(always)]
    pub fn peek2(&self) -> &Value {
        unsafe { self.stack.get_unchecked(self.stack.len() - 2) }
    }

    /// Value `n` slots below the top (0 = top).
    #[inline(always)]
    pub fn peekn(&self, n: usize) -> &Value {
        unsafe { self.stack.get_unchecked(self.stack.len() - 1 - n) }
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Grow the stack's backing storage ahead of a call.
    pub fn reserve_stack(&mut self, needed: usize) {
        if self.stack.len() + needed > self.stack.capacity() {
            self.stack.reserve(needed);
        }
    }

    // ==================== Native Window ====================

    /// Value at `slot` of the executing native's window: slot 0 is the
    /// receiver (or callee), arguments follow.
    pub fn api_slot(&self, slot: usize) -> Value {
        self.stack[self.api_stack + slot].clone()
    }

    pub fn api_stack_len(&self) -> usize {
        self.stack.len() - self.api_stack
    }

    // ==================== Classes ====================

    /// Class of any value, O(1).
    pub fn get_class(&self, value: &Value) -> Arc<Class> {
        match value {
            Value::Number(_) => self.core.number.clone(),
            Value::Boolean(_) => self.core.boolean.clone(),
            Value::Null => self.core.null.clone(),
            Value::Handle(_) => self.core.userdata.clone(),
            Value::String(_) => self.core.string.clone(),
            Value::List(_) => self.core.list.clone(),
            Value::Tuple(_) => self.core.tuple.clone(),
            Value::Table(_) => self.core.table.clone(),
            Value::Function(_) | Value::Native(_) | Value::Closure(_) | Value::BoundMethod(_) => {
                self.core.function.clone()
            }
            Value::Class(_) => self.core.class.clone(),
            Value::Instance(inst) => inst.lock().class.clone(),
            Value::Module(_) => self.core.module.clone(),
            Value::StackTrace(_) => self.core.stacktrace.clone(),
        }
    }

    /// Class membership along the superclass chain.
    pub fn is_instance(&self, value: &Value, cls: &Arc<Class>) -> bool {
        let mut current = Some(self.get_class(value));
        while let Some(c) = current {
            if Arc::ptr_eq(&c, cls) {
                return true;
            }
            current = c.superclass.clone();
        }
        false
    }

    fn is_non_instantiable_builtin(&self, cls: &Arc<Class>) -> bool {
        [
            &self.core.null,
            &self.core.function,
            &self.core.module,
            &self.core.stacktrace,
            &self.core.class,
            &self.core.table,
            &self.core.userdata,
        ]
        .iter()
        .any(|c| Arc::ptr_eq(c, cls))
    }

    fn is_instantiable_builtin(&self, cls: &Arc<Class>) -> bool {
        [
            &self.core.list,
            &self.core.tuple,
            &self.core.number,
            &self.core.boolean,
            &self.core.string,
        ]
        .iter()
        .any(|c| Arc::ptr_eq(c, cls))
    }

    fn is_builtin_class(&self, cls: &Arc<Class>) -> bool {
        self.is_non_instantiable_builtin(cls) || self.is_instantiable_builtin(cls)
    }

    fn create_class(&mut self, name: Arc<NovaString>, superclass: Arc<Class>) {
        let cls = Arc::new(Class::new(name, Some(superclass)));
        self.push(Value::Class(cls));
    }

    // ==================== Allocation ====================

    // The threshold check runs before tracking so a collection can never
    // reclaim the object being allocated.

    pub fn new_list(&mut self, items: Vec<Value>) -> Value {
        self.maybe_collect();
        let list = Arc::new(Mutex::new(items));
        self.gc.track_list(&list);
        Value::List(list)
    }

    pub fn new_table(&mut self) -> Value {
        self.maybe_collect();
        let table = Arc::new(Mutex::new(FxHashMap::default()));
        self.gc.track_table(&table);
        Value::Table(table)
    }

    pub fn new_instance(&mut self, class: Arc<Class>) -> Value {
        self.maybe_collect();
        let inst = Arc::new(Mutex::new(Instance::new(class)));
        self.gc.track_instance(&inst);
        Value::Instance(inst)
    }

    /// The zero-length tuple is a singleton.
    pub fn new_tuple(&mut self, items: Vec<Value>) -> Value {
        if items.is_empty() {
            Value::Tuple(self.empty_tuple.clone())
        } else {
            Value::Tuple(Arc::from(items))
        }
    }

    fn new_string(&self, text: String) -> Value {
        Value::String(Arc::new(NovaString::new(text)))
    }

    #[inline(always)]
    fn maybe_collect(&mut self) {
        if self.gc.should_collect() {
            self.collect_garbage();
        }
    }

    pub fn collect_garbage(&mut self) {
        let mut roots: Vec<Value> = self.stack.clone();
        for module in self.modules.values() {
            for value in module.globals.read().values() {
                roots.push(value.clone());
            }
        }
        for upvalue in &self.open_upvalues {
            if let Some(closed) = &upvalue.lock().closed {
                roots.push((**closed).clone());
            }
        }
        for frame in &self.frames {
            if let FrameFn::Closure(closure) = &frame.fun {
                for upvalue in closure.upvalues.iter() {
                    if let Some(closed) = &upvalue.lock().closed {
                        roots.push((**closed).clone());
                    }
                }
            }
        }
        self.gc.collect(roots);
        if self.gc_stats_enabled {
            let stats = self.gc.get_stats();
            eprintln!(
                "[GC] collection #{}: tracked={}, cycles_broken={}",
                stats.collections, stats.tracked_count, stats.cycles_broken
            );
        }
    }

    // ==================== Raising ====================

    /// Construct an exception instance of the class for `kind`, attach a
    /// fresh stack trace and push it. Always returns false so call sites can
    /// `return self.raise(...)`.
    pub fn raise(&mut self, kind: ErrorKind, message: impl Into<String>) -> bool {
        let cls = self.core.exception_class(kind);
        let message = self.new_string(message.into());
        let mut inst = Instance::new(cls);
        inst.fields
            .insert(self.sym(MethodSym::ErrField).clone(), message);
        inst.fields.insert(
            self.sym(MethodSym::Stacktrace).clone(),
            Value::StackTrace(Arc::new(Mutex::new(StackTrace::new()))),
        );
        let inst = Arc::new(Mutex::new(inst));
        self.gc.track_instance(&inst);
        self.push(Value::Instance(inst));
        false
    }

    // ==================== Upvalues ====================

    /// Return the open upvalue for `location`, inserting a new one while
    /// keeping the list sorted by descending slot.
    pub(crate) fn capture_upvalue(&mut self, location: usize) -> Arc<Mutex<UpvalueObj>> {
        let mut at = 0;
        while at < self.open_upvalues.len() {
            let existing = self.open_upvalues[at].lock().location;
            if existing == location {
                return self.open_upvalues[at].clone();
            }
            if existing < location {
                break;
            }
            at += 1;
        }
        let created = Arc::new(Mutex::new(UpvalueObj::new(location)));
        self.open_upvalues.insert(at, created.clone());
        created
    }

    /// Close every open upvalue at slot >= `limit`, migrating the live value
    /// into the cell.
    pub(crate) fn close_upvalues(&mut self, limit: usize) {
        while let Some(first) = self.open_upvalues.first() {
            let location = first.lock().location;
            if location < limit {
                break;
            }
            let upvalue = self.open_upvalues.remove(0);
            let value = self.stack.get(location).cloned().unwrap_or(Value::Null);
            upvalue.lock().closed = Some(Box::new(value));
        }
    }

    // ==================== Frames ====================

    #[inline(always)]
    fn current_frame(&self) -> &Frame {
        unsafe { self.frames.last().unwrap_unchecked() }
    }

    #[inline(always)]
    fn current_frame_mut(&mut self) -> &mut Frame {
        unsafe { self.frames.last_mut().unwrap_unchecked() }
    }

    #[inline(always)]
    fn read_byte(&mut self) -> u8 {
        self.current_frame_mut().read_byte()
    }

    #[inline(always)]
    fn read_u16(&mut self) -> u16 {
        self.current_frame_mut().read_u16()
    }

    #[inline(always)]
    fn read_i16(&mut self) -> i16 {
        self.current_frame_mut().read_i16()
    }

    fn jump(&mut self, offset: i16) {
        let frame = self.current_frame_mut();
        frame.ip = (frame.ip as i64 + offset as i64) as usize;
    }

    fn get_const(&self, idx: usize) -> Value {
        match &self.current_frame().chunk().constants[idx] {
            Constant::Num(n) => Value::Number(*n),
            Constant::Bool(b) => Value::Boolean(*b),
            Constant::Str(s) => Value::String(s.clone()),
            Constant::Fun(f) => Value::Function(f.clone()),
            Constant::Native(_) => {
                debug_assert!(false, "native prototypes are not loadable constants");
                Value::Null
            }
        }
    }

    fn read_str_const(&mut self) -> Arc<NovaString> {
        let idx = self.read_u16() as usize;
        match &self.current_frame().chunk().constants[idx] {
            Constant::Str(s) => s.clone(),
            _ => panic!("expected string constant"),
        }
    }

    fn read_fun_const(&mut self) -> Arc<Function> {
        let idx = self.read_u16() as usize;
        match &self.current_frame().chunk().constants[idx] {
            Constant::Fun(f) => f.clone(),
            _ => panic!("expected function constant"),
        }
    }

    fn read_native_const(&mut self) -> Arc<FnProto> {
        let idx = self.read_u16() as usize;
        match &self.current_frame().chunk().constants[idx] {
            Constant::Native(p) => p.clone(),
            _ => panic!("expected native constant"),
        }
    }

    fn set_current_module(&mut self, name: &Arc<NovaString>) {
        if let Some(module) = self.modules.get(name) {
            self.module = Some(module.clone());
        }
    }

    fn current_globals(&self) -> Arc<Module> {
        self.module.clone().expect("no current module")
    }

    // ==================== Call Protocol ====================

    fn argument_error(&mut self, proto: &FnProto, expected: u8, supplied: u8, quantity: &str) -> bool {
        let message = format!(
            "Function `{}.{}` takes {} {} arguments, {} supplied.",
            proto.module, proto.name, quantity, expected, supplied
        );
        self.raise(ErrorKind::Type, message)
    }

    /// Normalize the supplied arguments to the declared shape: reject bad
    /// counts, push defaults, pack trailing varargs into a tuple.
    fn adjust_arguments(&mut self, proto: &FnProto, argc: u8) -> bool {
        let most = proto.arity;
        let least = proto.least();

        if !proto.vararg && most == least && argc != most {
            return self.argument_error(proto, most, argc, "exactly");
        }
        if !proto.vararg && argc > most {
            return self.argument_error(proto, most, argc, "at most");
        }
        if argc < least {
            return self.argument_error(proto, least, argc, "at least");
        }

        // Remaining parameters take their default values
        for i in (argc - least) as usize..proto.defaults.len() {
            let default = proto.defaults[i].clone();
            self.push(default);
        }

        if proto.vararg {
            let extra = if argc > most { (argc - most) as usize } else { 0 };
            self.pack_varargs(extra);
        }
        true
    }

    fn pack_varargs(&mut self, count: usize) {
        let at = self.stack.len() - count;
        let items = self.stack.split_off(at);
        let tuple = self.new_tuple(items);
        self.push(tuple);
    }

    fn push_frame(&mut self, fun: FrameFn) -> usize {
        let proto = fun.proto();
        let base = self.stack.len() - (proto.arity as usize + 1) - (proto.vararg as usize);
        self.frames.push(Frame::new(fun, base));
        self.frames.len() - 1
    }

    pub(crate) fn call_closure(&mut self, closure: Arc<Closure>, argc: u8) -> bool {
        if self.frames.len() + 1 == RECURSION_LIMIT {
            return self.raise(ErrorKind::StackOverflow, "Maximum recursion depth exceeded.");
        }
        if !self.adjust_arguments(&closure.fun.proto, argc) {
            return false;
        }
        self.reserve_stack(MAX_LOCALS + 1);
        let module_name = closure.fun.proto.module.clone();
        self.push_frame(FrameFn::Closure(closure));
        self.set_current_module(&module_name);
        true
    }

    fn call_native(&mut self, native: Arc<super::value::Native>, argc: u8) -> bool {
        if self.frames.len() + 1 == RECURSION_LIMIT {
            return self.raise(ErrorKind::StackOverflow, "Maximum recursion depth exceeded.");
        }
        if !self.adjust_arguments(&native.proto, argc) {
            return false;
        }
        self.reserve_stack(MIN_NATIVE_SLOTS);

        let fun = native.fun;
        let module_name = native.proto.module.clone();
        let frame_idx = self.push_frame(FrameFn::Native(native));
        let frame_base = self.frames[frame_idx].base;

        let saved_module = self.module.clone();
        let saved_api = self.api_stack;
        self.set_current_module(&module_name);
        self.api_stack = frame_base;

        if !fun(self) {
            // The native frame stays for the unwinder to record and discard
            self.module = saved_module;
            self.api_stack = saved_api;
            return false;
        }

        let ret = self.pop();
        self.frames.pop();
        self.stack.truncate(frame_base);
        self.module = saved_module;
        self.api_stack = saved_api;
        self.push(ret);
        true
    }

    /// Resolve and invoke a callable. The callee sits `argc + 1` slots below
    /// the stack top.
    pub fn call_value(&mut self, callee: Value, argc: u8) -> bool {
        match callee {
            Value::Closure(closure) => self.call_closure(closure, argc),
            Value::Native(native) => self.call_native(native, argc),
            Value::BoundMethod(bound) => {
                let receiver_at = self.stack.len() - argc as usize - 1;
                self.stack[receiver_at] = bound.receiver.clone();
                match bound.method.clone() {
                    Value::Closure(closure) => self.call_closure(closure, argc),
                    Value::Native(native) => self.call_native(native, argc),
                    other => {
                        let cls = self.get_class(&other);
                        self.raise(
                            ErrorKind::Type,
                            format!("Object {} is not a callable.", cls.name),
                        )
                    }
                }
            }
            Value::Class(cls) => self.call_class(cls, argc),
            other => {
                let cls = self.get_class(&other);
                self.raise(
                    ErrorKind::Type,
                    format!("Object {} is not a callable.", cls.name),
                )
            }
        }
    }

    fn call_class(&mut self, cls: Arc<Class>, argc: u8) -> bool {
        if self.is_non_instantiable_builtin(&cls) {
            return self.raise(
                ErrorKind::Runtime,
                format!("class {} can't be directly instantiated", cls.name),
            );
        }

        let receiver_at = self.stack.len() - argc as usize - 1;
        if self.is_instantiable_builtin(&cls) {
            // The native constructor fabricates the object itself
            self.stack[receiver_at] = Value::Null;
        } else {
            let instance = self.new_instance(cls.clone());
            self.stack[receiver_at] = instance;
        }

        let ctor_sym = self.sym(MethodSym::Ctor).clone();
        if let Some(ctor) = cls.method(&ctor_sym) {
            self.call_value(ctor, argc)
        } else if argc != 0 {
            self.raise(
                ErrorKind::Type,
                format!(
                    "Function {}.new() Expected 0 args, but instead `{}` supplied.",
                    cls.name, argc
                ),
            )
        } else {
            true
        }
    }

    // ==================== Method Invocation ====================

    pub(crate) fn invoke_method(
        &mut self,
        cls: &Arc<Class>,
        name: &Arc<NovaString>,
        argc: u8,
    ) -> bool {
        match cls.method(name) {
            Some(method) => self.call_value(method, argc),
            None => self.raise(
                ErrorKind::Method,
                format!("Method {}.{}() doesn't exists", cls.name, name),
            ),
        }
    }

    /// `x.name(args)` without materializing a bound method.
    pub fn invoke_value(&mut self, name: &Arc<NovaString>, argc: u8) -> bool {
        let receiver = self.peekn(argc as usize).clone();
        match &receiver {
            Value::Instance(inst) => {
                let (field, cls) = {
                    let guard = inst.lock();
                    (guard.fields.get(name).cloned(), guard.class.clone())
                };
                // A field shadows the method of the same name
                if let Some(field) = field {
                    return self.call_value(field, argc);
                }
                self.invoke_method(&cls, name, argc)
            }
            Value::Module(module) => {
                // Reflective helpers on the Module class shadow globals
                let method = self.core.module.method(name);
                if let Some(method) = method {
                    return self.call_value(method, argc);
                }
                match module.global(name) {
                    Some(value) => self.call_value(value, argc),
                    None => self.raise(
                        ErrorKind::Name,
                        format!("Name `{}` is not defined in module {}.", name, module.name),
                    ),
                }
            }
            _ => {
                let cls = self.get_class(&receiver);
                self.invoke_method(&cls, name, argc)
            }
        }
    }

    fn bind_method(&mut self, cls: &Arc<Class>, name: &Arc<NovaString>) -> bool {
        let Some(method) = cls.method(name) else {
            return false;
        };
        let receiver = self.pop();
        self.push(Value::BoundMethod(Arc::new(BoundMethod {
            receiver,
            method,
        })));
        true
    }

    // ==================== Field Access ====================

    pub(crate) fn get_field(&mut self, name: &Arc<NovaString>) -> bool {
        let value = self.peek().clone();
        match &value {
            Value::Instance(inst) => {
                let (field, cls) = {
                    let guard = inst.lock();
                    (guard.fields.get(name).cloned(), guard.class.clone())
                };
                if let Some(field) = field {
                    self.pop();
                    self.push(field);
                    return true;
                }
                if self.bind_method(&cls, name) {
                    return true;
                }
                self.raise(
                    ErrorKind::Field,
                    format!("Object {} doesn't have field `{}`.", cls.name, name),
                )
            }
            Value::Module(module) => {
                if let Some(global) = module.global(name) {
                    self.pop();
                    self.push(global);
                    return true;
                }
                let module_cls = self.core.module.clone();
                if self.bind_method(&module_cls, name) {
                    return true;
                }
                self.raise(
                    ErrorKind::Name,
                    format!("Name `{}` is not defined in module {}", name, module.name),
                )
            }
            _ => {
                let cls = self.get_class(&value);
                if self.bind_method(&cls, name) {
                    return true;
                }
                self.raise(
                    ErrorKind::Field,
                    format!("Object {} doesn't have field `{}`.", cls.name, name),
                )
            }
        }
    }

    pub(crate) fn set_field(&mut self, name: &Arc<NovaString>) -> bool {
        let target = self.pop();
        match &target {
            Value::Instance(inst) => {
                inst.lock().fields.insert(name.clone(), self.peek().clone());
                true
            }
            Value::Module(module) => {
                module
                    .globals
                    .write()
                    .insert(name.clone(), self.peek().clone());
                true
            }
            _ => {
                let cls = self.get_class(&target);
                self.raise(
                    ErrorKind::Field,
                    format!("Object {} doesn't have field `{}`.", cls.name, name),
                )
            }
        }
    }

    // ==================== Subscript Protocol ====================

    fn is_int(n: f64) -> bool {
        n.trunc() == n
    }

    /// Normalize a subscript index: negative indexes count from the end.
    fn check_index(&mut self, index: f64, len: usize) -> Option<usize> {
        let mut at = index as i64;
        if at < 0 {
            at += len as i64;
        }
        if at >= 0 && (at as usize) < len {
            Some(at as usize)
        } else {
            self.raise(
                ErrorKind::IndexOutOfBound,
                format!("Index out of bound: {}.", index),
            );
            None
        }
    }

    pub(crate) fn get_subscript(&mut self) -> bool {
        let operand = self.peek2().clone();
        let arg = self.peek().clone();
        match &operand {
            Value::List(list) => {
                let index = match arg {
                    Value::Number(n) if Self::is_int(n) => n,
                    _ => {
                        return self.raise(
                            ErrorKind::Type,
                            "Index of List subscript access must be an integer.",
                        )
                    }
                };
                let len = list.lock().len();
                let Some(at) = self.check_index(index, len) else {
                    return false;
                };
                let value = list.lock()[at].clone();
                self.pop();
                self.pop();
                self.push(value);
                true
            }
            Value::Tuple(items) => {
                let index = match arg {
                    Value::Number(n) if Self::is_int(n) => n,
                    _ => {
                        return self.raise(
                            ErrorKind::Type,
                            "Index of Tuple subscript must be an integer.",
                        )
                    }
                };
                let Some(at) = self.check_index(index, items.len()) else {
                    return false;
                };
                let value = items[at].clone();
                self.pop();
                self.pop();
                self.push(value);
                true
            }
            Value::String(s) => {
                let index = match arg {
                    Value::Number(n) if Self::is_int(n) => n,
                    _ => {
                        return self.raise(
                            ErrorKind::Type,
                            "Index of String subscript must be an integer.",
                        )
                    }
                };
                let Some(at) = self.check_index(index, s.len()) else {
                    return false;
                };
                let Some(ch) = s.as_str().get(at..at + 1).map(str::to_string) else {
                    return self.raise(
                        ErrorKind::InvalidArg,
                        "Byte index is not on a character boundary.",
                    );
                };
                let value = Value::String(self.intern(&ch));
                self.pop();
                self.pop();
                self.push(value);
                true
            }
            _ => {
                let cls = self.get_class(&operand);
                let sym = self.sym(MethodSym::Get).clone();
                self.invoke_method(&cls, &sym, 1)
            }
        }
    }

    pub(crate) fn set_subscript(&mut self) -> bool {
        // Stack: [value, index, operand]
        if let Value::List(list) = self.peek().clone() {
            let _operand = self.pop();
            let arg = self.pop();
            let value = self.peek().clone();
            let index = match arg {
                Value::Number(n) if Self::is_int(n) => n,
                _ => {
                    return self.raise(
                        ErrorKind::Type,
                        "Index of List subscript access must be an integer.",
                    )
                }
            };
            let len = list.lock().len();
            let Some(at) = self.check_index(index, len) else {
                return false;
            };
            list.lock()[at] = value;
            return true;
        }

        // Rearrange into [operand, index, value] and call __set__
        let len = self.stack.len();
        self.stack.swap(len - 1, len - 3);
        let operand = self.peekn(2).clone();
        let cls = self.get_class(&operand);
        let sym = self.sym(MethodSym::Set).clone();
        self.invoke_method(&cls, &sym, 2)
    }

    // ==================== Operator Overloading ====================

    /// Dispatch a binary operator to `lhs.__op__(rhs)`, falling back to the
    /// reverse overload `rhs.__rop__(lhs)` with swapped operands.
    fn binary_overload(
        &mut self,
        op: &str,
        overload: MethodSym,
        reverse: Option<MethodSym>,
    ) -> bool {
        let lhs = self.peek2().clone();
        let rhs = self.peek().clone();
        let cls1 = self.get_class(&lhs);
        let cls2 = self.get_class(&rhs);

        let sym = self.sym(overload).clone();
        if let Some(method) = cls1.method(&sym) {
            return self.call_value(method, 1);
        }

        if let Some(reverse) = reverse {
            let len = self.stack.len();
            self.stack.swap(len - 1, len - 2);
            let rsym = self.sym(reverse).clone();
            if let Some(method) = cls2.method(&rsym) {
                return self.call_value(method, 1);
            }
        }

        self.raise(
            ErrorKind::Type,
            format!(
                "Operator {} not defined for types {}, {}",
                op, cls1.name, cls2.name
            ),
        )
    }

    // ==================== Unwinding ====================

    fn restore_handler(
        &mut self,
        frame_idx: usize,
        handler: Handler,
        cause: UnwindCause,
        value: Value,
    ) {
        self.frames[frame_idx].ip = handler.address;
        self.close_upvalues(handler.saved_sp.saturating_sub(1));
        self.stack.truncate(handler.saved_sp);
        self.push(value);
        self.push(Value::Number(cause as u8 as f64));
    }

    /// Unwind towards `depth`, recording each frame in the exception's stack
    /// trace. Returns true when a handler took over; false when the
    /// exception reached the eval boundary (it stays on the stack top).
    pub fn unwind_stack(&mut self, depth: usize) -> bool {
        let trace = match self.peek() {
            Value::Instance(inst) => {
                let sym = self.sym(MethodSym::Stacktrace).clone();
                match inst.lock().fields.get(&sym) {
                    Some(Value::StackTrace(st)) => Some(st.clone()),
                    _ => None,
                }
            }
            _ => None,
        };

        while self.frames.len() > depth {
            let frame_idx = self.frames.len() - 1;

            let module_name = self.frames[frame_idx].fun.proto().module.clone();
            self.set_current_module(&module_name);

            if let Some(st) = &trace {
                let record = self.frames[frame_idx].trace_record(self.frames.len());
                st.lock().record(record);
            }

            // A pending handler takes over with cause = EXCEPT
            if let Some(handler) = self.frames[frame_idx].handlers.pop() {
                let exception = self.pop();
                self.restore_handler(frame_idx, handler, UnwindCause::Except, exception);
                return true;
            }

            let base = self.frames[frame_idx].base;
            self.close_upvalues(base);
            self.frames.pop();
        }
        false
    }

    /// Return path of `OP_RETURN` and of `OP_END_TRY` with a pending return:
    /// pending ensure handlers run first, then the frame pops.
    fn do_return(&mut self, depth: usize) -> ReturnFlow {
        let ret = self.pop();
        let frame_idx = self.frames.len() - 1;

        while let Some(handler) = self.frames[frame_idx].handlers.pop() {
            if handler.kind == HandlerKind::Ensure {
                self.restore_handler(frame_idx, handler, UnwindCause::Return, ret);
                return ReturnFlow::Ensure;
            }
        }

        let base = self.frames[frame_idx].base;
        self.close_upvalues(base);
        self.stack.truncate(base);
        self.push(ret);
        self.frames.pop();

        if self.frames.len() == depth {
            return ReturnFlow::Done;
        }
        let module_name = self.current_frame().fun.proto().module.clone();
        self.set_current_module(&module_name);
        ReturnFlow::Popped
    }

    // ==================== Evaluator ====================

    /// Run bytecode until the frame stack shrinks back to `depth`. Returns
    /// false when an unhandled exception reaches the boundary; the exception
    /// instance is left on top of the stack.
    pub fn run_eval(&mut self, depth: usize) -> bool {
        debug_assert!(self.frames.len() > depth, "no frame to evaluate");

        macro_rules! unwind {
            () => {{
                if !self.unwind_stack(depth) {
                    return false;
                }
                continue;
            }};
        }

        macro_rules! binary_num {
            ($wrap:expr, $op:tt, $name:expr, $sym:expr, $rsym:expr) => {{
                if matches!(self.peek(), Value::Number(_))
                    && matches!(self.peek2(), Value::Number(_))
                {
                    let Value::Number(b) = self.pop() else { unreachable!() };
                    let Value::Number(a) = self.pop() else { unreachable!() };
                    self.push($wrap(a $op b));
                } else if !self.binary_overload($name, $sym, $rsym) {
                    unwind!();
                }
            }};
        }

        loop {
            // Async interruption check: the flag is polled, not latched
            if self.eval_break.swap(false, Ordering::Relaxed) {
                self.raise(ErrorKind::Interrupt, "Program interrupted.");
                unwind!();
            }

            self.gc_counter += 1;
            if self.gc_counter >= GC_CHECK_INTERVAL {
                self.gc_counter = 0;
                self.maybe_collect();
            }

            let byte = self.read_byte();
            let op = OpCode::from(byte);

            match op {
                OpCode::Add => {
                    if matches!(self.peek(), Value::Number(_))
                        && matches!(self.peek2(), Value::Number(_))
                    {
                        let Value::Number(b) = self.pop() else { unreachable!() };
                        let Value::Number(a) = self.pop() else { unreachable!() };
                        self.push(Value::Number(a + b));
                    } else if matches!(self.peek(), Value::String(_))
                        && matches!(self.peek2(), Value::String(_))
                    {
                        let Value::String(b) = self.pop() else { unreachable!() };
                        let Value::String(a) = self.pop() else { unreachable!() };
                        let mut text = String::with_capacity(a.len() + b.len());
                        text.push_str(a.as_str());
                        text.push_str(b.as_str());
                        let value = self.new_string(text);
                        self.push(value);
                    } else if !self.binary_overload("+", MethodSym::Add, Some(MethodSym::Radd)) {
                        unwind!();
                    }
                }
                OpCode::Sub => {
                    binary_num!(Value::Number, -, "-", MethodSym::Sub, Some(MethodSym::Rsub))
                }
                OpCode::Mul => {
                    binary_num!(Value::Number, *, "*", MethodSym::Mul, Some(MethodSym::Rmul))
                }
                OpCode::Div => {
                    binary_num!(Value::Number, /, "/", MethodSym::Div, Some(MethodSym::Rdiv))
                }
                OpCode::Mod => {
                    binary_num!(Value::Number, %, "%", MethodSym::Mod, Some(MethodSym::Rmod))
                }
                OpCode::Pow => {
                    if !matches!(self.peek(), Value::Number(_))
                        || !matches!(self.peek2(), Value::Number(_))
                    {
                        self.raise(ErrorKind::Type, "Operands of `^` must be numbers");
                        unwind!();
                    }
                    let Value::Number(b) = self.pop() else { unreachable!() };
                    let Value::Number(a) = self.pop() else { unreachable!() };
                    self.push(Value::Number(a.powf(b)));
                }
                OpCode::Neg => {
                    if let Value::Number(n) = self.peek() {
                        let n = -*n;
                        self.pop();
                        self.push(Value::Number(n));
                    } else {
                        let operand = self.peek().clone();
                        let cls = self.get_class(&operand);
                        let sym = self.sym(MethodSym::Neg).clone();
                        if !self.invoke_method(&cls, &sym, 0) {
                            unwind!();
                        }
                    }
                }
                OpCode::Eq => {
                    // Numbers, null and booleans compare structurally without
                    // consulting overloads
                    if matches!(
                        self.peek2(),
                        Value::Number(_) | Value::Null | Value::Boolean(_)
                    ) {
                        let b = self.pop();
                        let a = self.pop();
                        self.push(Value::Boolean(a == b));
                    } else if !self.binary_overload("==", MethodSym::Eq, None) {
                        unwind!();
                    }
                }
                OpCode::Lt => {
                    binary_num!(Value::Boolean, <, "<", MethodSym::Lt, None)
                }
                OpCode::Le => {
                    binary_num!(Value::Boolean, <=, "<=", MethodSym::Le, None)
                }
                OpCode::Gt => {
                    binary_num!(Value::Boolean, >, ">", MethodSym::Gt, None)
                }
                OpCode::Ge => {
                    binary_num!(Value::Boolean, >=, ">=", MethodSym::Ge, None)
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Boolean(!value.is_truthy()));
                }
                OpCode::Is => {
                    if !matches!(self.peek(), Value::Class(_)) {
                        self.raise(ErrorKind::Type, "Right operand of `is` must be a class.");
                        unwind!();
                    }
                    let Value::Class(cls) = self.pop() else { unreachable!() };
                    let value = self.pop();
                    let is = self.is_instance(&value, &cls);
                    self.push(Value::Boolean(is));
                }
                OpCode::SubscrGet => {
                    if !self.get_subscript() {
                        unwind!();
                    }
                }
                OpCode::SubscrSet => {
                    if !self.set_subscript() {
                        unwind!();
                    }
                }
                OpCode::GetField => {
                    let name = self.read_str_const();
                    if !self.get_field(&name) {
                        unwind!();
                    }
                }
                OpCode::SetField => {
                    let name = self.read_str_const();
                    if !self.set_field(&name) {
                        unwind!();
                    }
                }
                OpCode::Jump => {
                    let offset = self.read_i16();
                    self.jump(offset);
                }
                OpCode::JumpF => {
                    let offset = self.read_i16();
                    if !self.pop().is_truthy() {
                        self.jump(offset);
                    }
                }
                OpCode::JumpT => {
                    let offset = self.read_i16();
                    if self.pop().is_truthy() {
                        self.jump(offset);
                    }
                }
                OpCode::ForIter => {
                    // Duplicate (iterable, state) and call iterable.__iter__(state)
                    let len = self.stack.len();
                    let iterable = self.stack[len - 2].clone();
                    let state = self.stack[len - 1].clone();
                    self.push(iterable);
                    self.push(state);
                    let sym = self.sym(MethodSym::Iter).clone();
                    if !self.invoke_value(&sym, 1) {
                        unwind!();
                    }
                }
                OpCode::ForNext => {
                    // [iterable, state, newstate]: commit the new state, then
                    // either fetch the next value or leave the loop
                    let len = self.stack.len();
                    let newstate = self.stack[len - 1].clone();
                    self.stack[len - 2] = newstate;
                    let offset = self.read_i16();
                    if self.pop().is_truthy() {
                        let len = self.stack.len();
                        let iterable = self.stack[len - 2].clone();
                        let state = self.stack[len - 1].clone();
                        self.push(iterable);
                        self.push(state);
                        let sym = self.sym(MethodSym::Next).clone();
                        if !self.invoke_value(&sym, 1) {
                            unwind!();
                        }
                    } else {
                        self.jump(offset);
                    }
                }
                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peekn(argc as usize).clone();
                    if !self.call_value(callee, argc) {
                        unwind!();
                    }
                }
                OpCode::Call0
                | OpCode::Call1
                | OpCode::Call2
                | OpCode::Call3
                | OpCode::Call4
                | OpCode::Call5
                | OpCode::Call6
                | OpCode::Call7
                | OpCode::Call8
                | OpCode::Call9
                | OpCode::Call10 => {
                    let argc = op.folded_argc(OpCode::Call0);
                    let callee = self.peekn(argc as usize).clone();
                    if !self.call_value(callee, argc) {
                        unwind!();
                    }
                }
                OpCode::Invoke => {
                    let argc = self.read_byte();
                    let name = self.read_str_const();
                    if !self.invoke_value(&name, argc) {
                        unwind!();
                    }
                }
                OpCode::Invoke0
                | OpCode::Invoke1
                | OpCode::Invoke2
                | OpCode::Invoke3
                | OpCode::Invoke4
                | OpCode::Invoke5
                | OpCode::Invoke6
                | OpCode::Invoke7
                | OpCode::Invoke8
                | OpCode::Invoke9
                | OpCode::Invoke10 => {
                    let argc = op.folded_argc(OpCode::Invoke0);
                    let name = self.read_str_const();
                    if !self.invoke_value(&name, argc) {
                        unwind!();
                    }
                }
                OpCode::Super
                | OpCode::Super0
                | OpCode::Super1
                | OpCode::Super2
                | OpCode::Super3
                | OpCode::Super4
                | OpCode::Super5
                | OpCode::Super6
                | OpCode::Super7
                | OpCode::Super8
                | OpCode::Super9
                | OpCode::Super10 => {
                    let argc = if op == OpCode::Super {
                        self.read_byte()
                    } else {
                        op.folded_argc(OpCode::Super0)
                    };
                    let name = self.read_str_const();
                    // The superclass was frozen into the method when it was
                    // defined; super binds lexically, not by receiver class
                    let sup = self.current_frame().closure().fun.super_class.read().clone();
                    match sup {
                        Some(cls) => {
                            if !self.invoke_method(&cls, &name, argc) {
                                unwind!();
                            }
                        }
                        None => {
                            self.raise(
                                ErrorKind::Method,
                                format!("Method {}() has no superclass method.", name),
                            );
                            unwind!();
                        }
                    }
                }
                OpCode::SuperBind => {
                    let name = self.read_str_const();
                    let sup = self.current_frame().closure().fun.super_class.read().clone();
                    match sup {
                        Some(cls) => {
                            if !self.bind_method(&cls, &name) {
                                self.raise(
                                    ErrorKind::Method,
                                    format!("Method {}.{}() doesn't exists", cls.name, name),
                                );
                                unwind!();
                            }
                        }
                        None => {
                            self.raise(
                                ErrorKind::Method,
                                format!("Method {}() has no superclass method.", name),
                            );
                            unwind!();
                        }
                    }
                }
                OpCode::Null => {
                    self.push(Value::Null);
                }
                OpCode::GetConst => {
                    let idx = self.read_u16() as usize;
                    let value = self.get_const(idx);
                    self.push(value);
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().base;
                    let value = self.stack[base + slot].clone();
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().base;
                    self.stack[base + slot] = self.peek().clone();
                }
                OpCode::GetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let upvalue = self.current_frame().closure().upvalues[idx].clone();
                    let value = {
                        let guard = upvalue.lock();
                        match &guard.closed {
                            Some(closed) => (**closed).clone(),
                            None => self.stack[guard.location].clone(),
                        }
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let value = self.peek().clone();
                    let upvalue = self.current_frame().closure().upvalues[idx].clone();
                    let open_at = {
                        let mut guard = upvalue.lock();
                        if guard.closed.is_some() {
                            guard.closed = Some(Box::new(value.clone()));
                            None
                        } else {
                            Some(guard.location)
                        }
                    };
                    if let Some(at) = open_at {
                        self.stack[at] = value;
                    }
                }
                OpCode::GetGlobal => {
                    let name = self.read_str_const();
                    let module = self.current_globals();
                    match module.global(&name) {
                        Some(value) => self.push(value),
                        None => {
                            self.raise(
                                ErrorKind::Name,
                                format!("Name `{}` is not defined.", name),
                            );
                            unwind!();
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_str_const();
                    let module = self.current_globals();
                    if !module.globals.read().contains_key(&name) {
                        self.raise(ErrorKind::Name, format!("Name `{}` is not defined.", name));
                        unwind!();
                    }
                    module.globals.write().insert(name, self.peek().clone());
                }
                OpCode::DefineGlobal => {
                    let name = self.read_str_const();
                    let value = self.pop();
                    let module = self.current_globals();
                    module.globals.write().insert(name, value);
                }
                OpCode::NewList => {
                    let list = self.new_list(Vec::new());
                    self.push(list);
                }
                OpCode::AppendList => {
                    let item = self.pop();
                    if let Value::List(list) = self.peek() {
                        list.lock().push(item);
                    }
                }
                OpCode::NewTuple => {
                    let size = self.read_byte() as usize;
                    let at = self.stack.len() - size;
                    let items = self.stack.split_off(at);
                    let tuple = self.new_tuple(items);
                    self.push(tuple);
                }
                OpCode::NewTable => {
                    let table = self.new_table();
                    self.push(table);
                }
                OpCode::NewClass => {
                    let name = self.read_str_const();
                    let object = self.core.object.clone();
                    self.create_class(name, object);
                }
                OpCode::NewSubclass => {
                    if !matches!(self.peek(), Value::Class(_)) {
                        self.raise(
                            ErrorKind::Type,
                            "Superclass in class declaration must be a Class.",
                        );
                        unwind!();
                    }
                    let Value::Class(sup) = self.pop() else { unreachable!() };
                    if self.is_builtin_class(&sup) {
                        self.raise(
                            ErrorKind::Type,
                            format!("Cannot subclass builtin class {}", sup.name),
                        );
                        unwind!();
                    }
                    let name = self.read_str_const();
                    self.create_class(name, sup);
                }
                OpCode::DefMethod => {
                    let name = self.read_str_const();
                    let method = self.pop();
                    if let Value::Class(cls) = self.peek() {
                        // Freeze the declaring class's superclass into the
                        // method for super dispatch
                        if let Value::Closure(closure) = &method {
                            *closure.fun.super_class.write() = cls.superclass.clone();
                        }
                        cls.define_method(name, method);
                    }
                }
                OpCode::NatMethod => {
                    let name = self.read_str_const();
                    let proto = self.read_native_const();
                    let module = self.current_globals();
                    let Value::Class(cls) = self.peek().clone() else {
                        panic!("NatMethod target is not a class");
                    };
                    let resolved =
                        builtins::resolve_builtin(module.name.as_str(), Some(cls.name.as_str()), name.as_str())
                            .or_else(|| module.resolve_native(Some(cls.name.as_str()), name.as_str()));
                    match resolved {
                        Some(fun) => {
                            cls.define_method(
                                name,
                                Value::Native(Arc::new(super::value::Native {
                                    proto: (*proto).clone(),
                                    fun,
                                })),
                            );
                        }
                        None => {
                            self.raise(
                                ErrorKind::Runtime,
                                format!("Cannot resolve native method {}().", proto.name),
                            );
                            unwind!();
                        }
                    }
                }
                OpCode::Native => {
                    let proto = self.read_native_const();
                    let module = self.current_globals();
                    let resolved =
                        builtins::resolve_builtin(module.name.as_str(), None, proto.name.as_str())
                            .or_else(|| module.resolve_native(None, proto.name.as_str()));
                    match resolved {
                        Some(fun) => {
                            self.push(Value::Native(Arc::new(super::value::Native {
                                proto: (*proto).clone(),
                                fun,
                            })));
                        }
                        None => {
                            self.raise(
                                ErrorKind::Runtime,
                                format!("Cannot resolve native {}.", proto.name),
                            );
                            unwind!();
                        }
                    }
                }
                OpCode::Closure => {
                    let fun = self.read_fun_const();
                    let count = fun.upvalue_count as usize;
                    let mut upvalues = Vec::with_capacity(count);
                    for _ in 0..count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.current_frame().base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let enclosing = self.current_frame().closure().clone();
                            upvalues.push(enclosing.upvalues[index].clone());
                        }
                    }
                    self.push(Value::Closure(Arc::new(Closure {
                        fun,
                        upvalues: upvalues.into_boxed_slice(),
                    })));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::SetupExcept | OpCode::SetupEnsure => {
                    let offset = self.read_u16() as usize;
                    let kind = if op == OpCode::SetupExcept {
                        HandlerKind::Except
                    } else {
                        HandlerKind::Ensure
                    };
                    let saved_sp = self.stack.len();
                    let frame = self.current_frame_mut();
                    debug_assert!(frame.handlers.len() < HANDLER_MAX);
                    frame.handlers.push(Handler {
                        kind,
                        address: frame.ip + offset,
                        saved_sp,
                    });
                }
                OpCode::PopHandler => {
                    self.current_frame_mut().handlers.pop();
                }
                OpCode::EndTry => {
                    // [value, cause] is still on the stack when a handler ran;
                    // a null value means the block completed normally
                    if !self.peek2().is_null() {
                        let Value::Number(cause) = self.pop() else {
                            panic!("corrupt unwind cause marker");
                        };
                        if cause as u8 == UnwindCause::Except as u8 {
                            // The handler completed without resolving
                            unwind!();
                        }
                        // Pending return: outer ensure handlers still run
                        match self.do_return(depth) {
                            ReturnFlow::Done => return true,
                            ReturnFlow::Ensure | ReturnFlow::Popped => {}
                        }
                    }
                }
                OpCode::Raise => {
                    let exception = self.peek().clone();
                    let exc_cls = self.core.exception.clone();
                    if !self.is_instance(&exception, &exc_cls) {
                        self.raise(ErrorKind::Type, "Can only raise Exception instances.");
                        unwind!();
                    }
                    // A fresh trace overwrites any prior one
                    if let Value::Instance(inst) = &exception {
                        let sym = self.sym(MethodSym::Stacktrace).clone();
                        inst.lock().fields.insert(
                            sym,
                            Value::StackTrace(Arc::new(Mutex::new(StackTrace::new()))),
                        );
                    }
                    unwind!();
                }
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Dup => {
                    let value = self.peek().clone();
                    self.push(value);
                }
                OpCode::Return => match self.do_return(depth) {
                    ReturnFlow::Done => return true,
                    ReturnFlow::Ensure | ReturnFlow::Popped => {}
                },
                OpCode::Unpack => {
                    let count = self.read_byte() as usize;
                    let value = self.peek().clone();
                    let items: Vec<Value> = match &value {
                        Value::List(list) => list.lock().clone(),
                        Value::Tuple(items) => items.to_vec(),
                        other => {
                            let cls = self.get_class(other);
                            self.raise(
                                ErrorKind::Type,
                                format!("Can unpack only Tuple or List, got {}.", cls.name),
                            );
                            unwind!();
                        }
                    };
                    self.pop();
                    if count > items.len() {
                        self.raise(ErrorKind::Type, "Too little values to unpack.");
                        unwind!();
                    }
                    for item in items.into_iter().take(count) {
                        self.push(item);
                    }
                }
                OpCode::Import | OpCode::ImportAs | OpCode::ImportFrom => {
                    let name = self.read_str_const();
                    if !self.import_module(&name) {
                        self.raise(
                            ErrorKind::Import,
                            format!("Cannot load module `{}`.", name),
                        );
                        unwind!();
                    }
                    let module = self.get_module(name.as_str()).unwrap();
                    let current = self.current_globals();
                    match op {
                        OpCode::Import => {
                            current
                                .globals
                                .write()
                                .insert(name.clone(), Value::Module(module));
                        }
                        OpCode::ImportAs => {
                            let alias = self.read_str_const();
                            current.globals.write().insert(alias, Value::Module(module));
                        }
                        _ => {}
                    }
                    // First load leaves the module body on the stack: wrap it
                    // in a closure and run the initializer
                    if !self.peek().is_null() {
                        let Value::Function(fun) = self.pop() else {
                            panic!("import left a non-function on the stack");
                        };
                        let closure = Arc::new(Closure::new(fun));
                        self.push(Value::Closure(closure.clone()));
                        if !self.call_closure(closure, 0) {
                            unwind!();
                        }
                    }
                }
                OpCode::ImportName => {
                    let module_name = self.read_str_const();
                    let binding = self.read_str_const();
                    let Some(module) = self.get_module(module_name.as_str()) else {
                        self.raise(
                            ErrorKind::Import,
                            format!("Cannot load module `{}`.", module_name),
                        );
                        unwind!();
                    };
                    let current = self.current_globals();
                    if binding.as_str().starts_with('*') {
                        let imported = module.globals.read().clone();
                        current.globals.write().extend(imported);
                    } else {
                        match module.global(&binding) {
                            Some(value) => {
                                current.globals.write().insert(binding, value);
                            }
                            None => {
                                self.raise(
                                    ErrorKind::Name,
                                    format!(
                                        "Name `{}` not defined in module `{}`.",
                                        binding, module.name
                                    ),
                                );
                                unwind!();
                            }
                        }
                    }
                }
            }
        }
    }

    // ==================== Host API ====================

    /// Call a callable with `args`, re-entering the evaluator as needed.
    /// Usable both from the host and from natives.
    pub fn call(&mut self, callee: Value, args: &[Value]) -> NovaResult<Value> {
        let depth = self.frames.len();
        self.reserve_stack(args.len() + 1 + MIN_NATIVE_SLOTS);
        self.push(callee);
        for arg in args {
            self.push(arg.clone());
        }

        let callee = self.peekn(args.len()).clone();
        if !self.call_value(callee, args.len() as u8) {
            // Record and discard any frame the failed call left behind
            if self.frames.len() > depth {
                let _ = self.unwind_stack(depth);
            }
            return Err(self.exception_to_error());
        }

        if self.frames.len() > depth {
            if !self.run_eval(depth) {
                return Err(self.exception_to_error());
            }
        }
        Ok(self.pop())
    }

    /// Wrap a compiled main function in a closure and run it; unhandled
    /// exceptions are reported through the error callback.
    pub fn run_main(&mut self, fun: Arc<Function>) -> NovaResult<Value> {
        let closure = Value::Closure(Arc::new(Closure::new(fun)));
        match self.call(closure, &[]) {
            Ok(value) => Ok(value),
            Err(err) => {
                if let Some(callback) = self.error_callback.as_mut() {
                    callback(err.kind, &err.module, err.line, &err.message);
                }
                Err(err)
            }
        }
    }

    /// Pop the exception instance off the stack and materialize the
    /// host-facing error.
    pub fn exception_to_error(&mut self) -> NovaError {
        let exception = self.pop();
        let Value::Instance(inst) = &exception else {
            return NovaError::new(ErrorKind::Runtime, exception.to_string(), "<unknown>", 0);
        };

        let err_sym = self.sym(MethodSym::ErrField).clone();
        let st_sym = self.sym(MethodSym::Stacktrace).clone();
        let guard = inst.lock();

        let kind = exception_kind(&guard.class);
        let message = match guard.fields.get(&err_sym) {
            Some(Value::String(s)) => s.to_string(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let trace = match guard.fields.get(&st_sym) {
            Some(Value::StackTrace(st)) => st.lock().records.clone(),
            _ => Vec::new(),
        };
        let (module, line) = trace
            .first()
            .map(|frame| (frame.module.clone(), frame.line))
            .unwrap_or_else(|| ("<unknown>".to_string(), 0));

        NovaError {
            kind,
            message,
            module,
            line,
            stack_trace: trace,
        }
    }
}

fn exception_kind(cls: &Arc<Class>) -> ErrorKind {
    let mut current = Some(cls.clone());
    while let Some(c) = current {
        if let Some(kind) = ErrorKind::from_class_name(c.name.as_str()) {
            return kind;
        }
        current = c.superclass.clone();
    }
    ErrorKind::Runtime
}

impl Default for VM {
    fn default() -> Self {
        Self::new(VmConf::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vm() -> VM {
        VM::new(VmConf::default())
    }

    #[allow(clippy::too_many_arguments)]
    fn make_fun_in(
        vm: &mut VM,
        module: &str,
        name: &str,
        arity: u8,
        defaults: Vec<Value>,
        vararg: bool,
        upvalue_count: u8,
        chunk: Chunk,
    ) -> Arc<Function> {
        let proto = FnProto {
            name: vm.intern(name),
            module: vm.intern(module),
            arity,
            defaults,
            vararg,
        };
        Arc::new(Function::new(proto, chunk, upvalue_count))
    }

    fn make_fun(
        vm: &mut VM,
        name: &str,
        arity: u8,
        defaults: Vec<Value>,
        vararg: bool,
        upvalue_count: u8,
        chunk: Chunk,
    ) -> Arc<Function> {
        make_fun_in(vm, "__main__", name, arity, defaults, vararg, upvalue_count, chunk)
    }

    fn closure_of(fun: Arc<Function>) -> Value {
        Value::Closure(Arc::new(Closure::new(fun)))
    }

    fn sconst(vm: &mut VM, chunk: &mut Chunk, s: &str) -> u16 {
        chunk.add_constant(Constant::Str(vm.intern(s))) as u16
    }

    fn emit_num(chunk: &mut Chunk, n: f64) {
        let idx = chunk.add_constant(Constant::Num(n)) as u16;
        chunk.write_op(OpCode::GetConst, 1);
        chunk.write_u16(idx, 1);
    }

    fn emit_str(vm: &mut VM, chunk: &mut Chunk, s: &str) {
        let idx = sconst(vm, chunk, s);
        chunk.write_op(OpCode::GetConst, 1);
        chunk.write_u16(idx, 1);
    }

    fn emit_named(vm: &mut VM, chunk: &mut Chunk, op: OpCode, name: &str) {
        let idx = sconst(vm, chunk, name);
        chunk.write_op(op, 1);
        chunk.write_u16(idx, 1);
    }

    fn emit_local(chunk: &mut Chunk, op: OpCode, slot: u8) {
        chunk.write_op(op, 1);
        chunk.write(slot, 1);
    }

    fn call_op(argc: u8) -> OpCode {
        OpCode::from(OpCode::Call0 as u8 + argc)
    }

    fn emit_invoke(vm: &mut VM, chunk: &mut Chunk, name: &str, argc: u8) {
        let idx = sconst(vm, chunk, name);
        chunk.write_op(OpCode::from(OpCode::Invoke0 as u8 + argc), 1);
        chunk.write_u16(idx, 1);
    }

    fn emit_closure(chunk: &mut Chunk, fun: Arc<Function>, captures: &[(bool, u8)]) {
        debug_assert_eq!(fun.upvalue_count as usize, captures.len());
        let idx = chunk.add_constant(Constant::Fun(fun)) as u16;
        chunk.write_op(OpCode::Closure, 1);
        chunk.write_u16(idx, 1);
        for (is_local, index) in captures {
            chunk.write(*is_local as u8, 1);
            chunk.write(*index, 1);
        }
    }

    fn run(vm: &mut VM, chunk: Chunk) -> NovaResult<Value> {
        let fun = make_fun(vm, "<main>", 0, Vec::new(), false, 0, chunk);
        vm.run_main(fun)
    }

    fn global(vm: &mut VM, name: &str) -> Option<Value> {
        let key = vm.intern(name);
        vm.main_module().global(&key)
    }

    fn as_num(value: &Value) -> f64 {
        match value {
            Value::Number(n) => *n,
            other => panic!("expected number, got {}", other),
        }
    }

    // ==================== Calls and Recursion ====================

    #[test]
    fn fib_recursion() {
        let mut vm = test_vm();

        let mut body = Chunk::new();
        emit_local(&mut body, OpCode::GetLocal, 1);
        emit_num(&mut body, 2.0);
        body.write_op(OpCode::Lt, 1);
        let else_jump = body.write_jump(OpCode::JumpF, 1);
        emit_local(&mut body, OpCode::GetLocal, 1);
        body.write_op(OpCode::Return, 1);
        body.patch_jump(else_jump);
        emit_named(&mut vm, &mut body, OpCode::GetGlobal, "fib");
        emit_local(&mut body, OpCode::GetLocal, 1);
        emit_num(&mut body, 1.0);
        body.write_op(OpCode::Sub, 1);
        body.write_op(call_op(1), 1);
        emit_named(&mut vm, &mut body, OpCode::GetGlobal, "fib");
        emit_local(&mut body, OpCode::GetLocal, 1);
        emit_num(&mut body, 2.0);
        body.write_op(OpCode::Sub, 1);
        body.write_op(call_op(1), 1);
        body.write_op(OpCode::Add, 1);
        body.write_op(OpCode::Return, 1);
        let fib = make_fun(&mut vm, "fib", 1, Vec::new(), false, 0, body);

        let mut main = Chunk::new();
        emit_closure(&mut main, fib, &[]);
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "fib");
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "fib");
        emit_num(&mut main, 10.0);
        main.write_op(call_op(1), 1);
        main.write_op(OpCode::Return, 1);

        let result = run(&mut vm, main).unwrap();
        assert_eq!(as_num(&result), 55.0);
    }

    #[test]
    fn call_api_reenters_evaluator() {
        let mut vm = test_vm();
        let mut body = Chunk::new();
        emit_local(&mut body, OpCode::GetLocal, 1);
        emit_local(&mut body, OpCode::GetLocal, 2);
        body.write_op(OpCode::Add, 1);
        body.write_op(OpCode::Return, 1);
        let add = make_fun(&mut vm, "add", 2, Vec::new(), false, 0, body);

        let result = vm
            .call(closure_of(add), &[Value::Number(2.0), Value::Number(3.0)])
            .unwrap();
        assert_eq!(as_num(&result), 5.0);
    }

    #[test]
    fn argument_adjustment_laws() {
        let mut vm = test_vm();
        // f(a, b, c = 9) returns c
        let mut body = Chunk::new();
        emit_local(&mut body, OpCode::GetLocal, 3);
        body.write_op(OpCode::Return, 1);
        let f = closure_of(make_fun(
            &mut vm,
            "f",
            3,
            vec![Value::Number(9.0)],
            false,
            0,
            body,
        ));

        let two = vm
            .call(f.clone(), &[Value::Number(1.0), Value::Number(2.0)])
            .unwrap();
        assert_eq!(as_num(&two), 9.0);

        let three = vm
            .call(
                f.clone(),
                &[Value::Number(1.0), Value::Number(2.0), Value::Number(5.0)],
            )
            .unwrap();
        assert_eq!(as_num(&three), 5.0);

        let err = vm.call(f.clone(), &[Value::Number(1.0)]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
        assert!(err.message.contains("at least"));

        let args = vec![Value::Number(1.0); 4];
        let err = vm.call(f, args.as_slice()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
        assert!(err.message.contains("at most"));

        // g(a, b) with no defaults reports "exactly"
        let mut body = Chunk::new();
        body.write_op(OpCode::Null, 1);
        body.write_op(OpCode::Return, 1);
        let g = closure_of(make_fun(&mut vm, "g", 2, Vec::new(), false, 0, body));
        let err = vm.call(g, &[Value::Number(1.0)]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
        assert!(err.message.contains("exactly"));
    }

    #[test]
    fn vararg_packing() {
        let mut vm = test_vm();
        // g(a, *rest) returns rest, which lands in the slot after `a`
        let mut body = Chunk::new();
        emit_local(&mut body, OpCode::GetLocal, 2);
        body.write_op(OpCode::Return, 1);
        let g = closure_of(make_fun(&mut vm, "g", 1, Vec::new(), true, 0, body));

        let empty = vm.call(g.clone(), &[Value::Number(1.0)]).unwrap();
        let Value::Tuple(items) = empty else {
            panic!("expected tuple")
        };
        assert!(items.is_empty());

        let packed = vm
            .call(
                g.clone(),
                &[Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)],
            )
            .unwrap();
        let Value::Tuple(items) = packed else {
            panic!("expected tuple")
        };
        assert_eq!(items.len(), 2);
        assert_eq!(as_num(&items[0]), 2.0);
        assert_eq!(as_num(&items[1]), 3.0);

        let err = vm.call(g, &[]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
        assert!(err.message.contains("at least"));
    }

    #[test]
    fn deep_recursion_overflows() {
        let mut vm = test_vm();
        let mut body = Chunk::new();
        emit_named(&mut vm, &mut body, OpCode::GetGlobal, "spin");
        body.write_op(call_op(0), 1);
        body.write_op(OpCode::Return, 1);
        let spin = make_fun(&mut vm, "spin", 0, Vec::new(), false, 0, body);

        let mut main = Chunk::new();
        emit_closure(&mut main, spin, &[]);
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "spin");
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "spin");
        main.write_op(call_op(0), 1);
        main.write_op(OpCode::Return, 1);

        let err = run(&mut vm, main).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StackOverflow);
    }

    // ==================== Exceptions ====================

    #[test]
    fn ensure_runs_on_return() {
        let mut vm = test_vm();

        let mut body = Chunk::new();
        let handler = body.write_jump(OpCode::SetupEnsure, 1);
        emit_num(&mut body, 1.0);
        body.write_op(OpCode::Return, 1);
        body.patch_jump(handler);
        // Handler entry: [pending return value, cause]
        emit_named(&mut vm, &mut body, OpCode::GetGlobal, "log");
        emit_str(&mut vm, &mut body, "e");
        body.write_op(OpCode::AppendList, 1);
        body.write_op(OpCode::Pop, 1);
        body.write_op(OpCode::EndTry, 1);
        let f = make_fun(&mut vm, "f", 0, Vec::new(), false, 0, body);

        let mut main = Chunk::new();
        main.write_op(OpCode::NewList, 1);
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "log");
        emit_closure(&mut main, f, &[]);
        main.write_op(call_op(0), 1);
        main.write_op(OpCode::Return, 1);

        let result = run(&mut vm, main).unwrap();
        assert_eq!(as_num(&result), 1.0);

        let Some(Value::List(items)) = global(&mut vm, "log") else {
            panic!("expected log list")
        };
        let items = items.lock();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_string(), Some("e"));
    }

    #[test]
    fn nested_ensure_runs_innermost_first() {
        let mut vm = test_vm();

        let mut body = Chunk::new();
        let outer = body.write_jump(OpCode::SetupEnsure, 1);
        let inner = body.write_jump(OpCode::SetupEnsure, 1);
        emit_num(&mut body, 1.0);
        body.write_op(OpCode::Return, 1);
        body.patch_jump(inner);
        emit_named(&mut vm, &mut body, OpCode::GetGlobal, "log");
        emit_str(&mut vm, &mut body, "inner");
        body.write_op(OpCode::AppendList, 1);
        body.write_op(OpCode::Pop, 1);
        body.write_op(OpCode::EndTry, 1);
        body.patch_jump(outer);
        emit_named(&mut vm, &mut body, OpCode::GetGlobal, "log");
        emit_str(&mut vm, &mut body, "outer");
        body.write_op(OpCode::AppendList, 1);
        body.write_op(OpCode::Pop, 1);
        body.write_op(OpCode::EndTry, 1);
        let f = make_fun(&mut vm, "f", 0, Vec::new(), false, 0, body);

        let mut main = Chunk::new();
        main.write_op(OpCode::NewList, 1);
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "log");
        emit_closure(&mut main, f, &[]);
        main.write_op(call_op(0), 1);
        main.write_op(OpCode::Return, 1);

        let result = run(&mut vm, main).unwrap();
        assert_eq!(as_num(&result), 1.0);

        let Some(Value::List(items)) = global(&mut vm, "log") else {
            panic!("expected log list")
        };
        let items = items.lock();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_string(), Some("inner"));
        assert_eq!(items[1].as_string(), Some("outer"));
    }

    #[test]
    fn except_catches_raised_exception() {
        let mut vm = test_vm();

        let mut main = Chunk::new();
        let handler = main.write_jump(OpCode::SetupExcept, 1);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "Exception");
        emit_str(&mut vm, &mut main, "x");
        main.write_op(call_op(1), 1);
        main.write_op(OpCode::Raise, 1);
        main.write_op(OpCode::PopHandler, 1);
        let skip = main.write_jump(OpCode::Jump, 1);
        main.patch_jump(handler);
        // Handler entry: [exception, cause]
        main.write_op(OpCode::Pop, 1);
        main.write_op(OpCode::Dup, 1);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "Exception");
        main.write_op(OpCode::Is, 1);
        let reraise = main.write_jump(OpCode::JumpF, 1);
        emit_invoke(&mut vm, &mut main, "err", 0);
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "out");
        main.write_op(OpCode::Null, 1);
        main.write_op(OpCode::Null, 1);
        main.write_op(OpCode::EndTry, 1);
        main.write_op(OpCode::Pop, 1);
        main.write_op(OpCode::Pop, 1);
        let done = main.write_jump(OpCode::Jump, 1);
        main.patch_jump(reraise);
        main.write_op(OpCode::Raise, 1);
        main.patch_jump(skip);
        main.patch_jump(done);
        main.write_op(OpCode::Null, 1);
        main.write_op(OpCode::Return, 1);

        let result = run(&mut vm, main).unwrap();
        assert!(result.is_null());
        let out = global(&mut vm, "out").unwrap();
        assert_eq!(out.as_string(), Some("x"));
    }

    #[test]
    fn unwinding_records_stacktrace_innermost_first() {
        let mut vm = test_vm();

        let mut inner = Chunk::new();
        emit_named(&mut vm, &mut inner, OpCode::GetGlobal, "Exception");
        emit_str(&mut vm, &mut inner, "boom");
        inner.write_op(call_op(1), 1);
        inner.write_op(OpCode::Raise, 3);
        inner.write_op(OpCode::Null, 3);
        inner.write_op(OpCode::Return, 3);
        let inner = make_fun(&mut vm, "inner", 0, Vec::new(), false, 0, inner);

        let mut outer = Chunk::new();
        emit_named(&mut vm, &mut outer, OpCode::GetGlobal, "inner");
        outer.write_op(call_op(0), 7);
        outer.write_op(OpCode::Return, 7);
        let outer = make_fun(&mut vm, "outer", 0, Vec::new(), false, 0, outer);

        let mut main = Chunk::new();
        emit_closure(&mut main, inner, &[]);
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "inner");
        emit_closure(&mut main, outer, &[]);
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "outer");
        let handler = main.write_jump(OpCode::SetupExcept, 1);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "outer");
        main.write_op(call_op(0), 1);
        main.write_op(OpCode::PopHandler, 1);
        let skip = main.write_jump(OpCode::Jump, 1);
        main.patch_jump(handler);
        main.write_op(OpCode::Pop, 1);
        main.write_op(OpCode::Dup, 1);
        emit_named(&mut vm, &mut main, OpCode::GetField, "stacktrace");
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "st");
        emit_invoke(&mut vm, &mut main, "err", 0);
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "msg");
        main.patch_jump(skip);
        main.write_op(OpCode::Null, 1);
        main.write_op(OpCode::Return, 1);

        run(&mut vm, main).unwrap();

        let msg = global(&mut vm, "msg").unwrap();
        assert_eq!(msg.as_string(), Some("boom"));

        let Some(Value::StackTrace(st)) = global(&mut vm, "st") else {
            panic!("expected stack trace")
        };
        let records = st.lock().records.clone();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].function, "inner");
        assert_eq!(records[1].function, "outer");
        assert_eq!(records[2].function, "<main>");
        assert!(records[0].depth > records[1].depth);
        assert!(records[1].depth > records[2].depth);
    }

    #[test]
    fn raise_requires_exception_instance() {
        let mut vm = test_vm();
        let mut main = Chunk::new();
        emit_num(&mut main, 1.0);
        main.write_op(OpCode::Raise, 1);
        main.write_op(OpCode::Return, 1);
        let err = run(&mut vm, main).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
        assert!(err.message.contains("raise"));
    }

    #[test]
    fn raised_exception_shape() {
        let mut vm = test_vm();
        assert!(!vm.raise(ErrorKind::Field, "nope"));
        let exc = vm.peek().clone();
        assert!(matches!(exc, Value::Instance(_)));
        let exception_cls = vm.core.exception.clone();
        assert!(vm.is_instance(&exc, &exception_cls));
        let field_cls = vm.core.exception_class(ErrorKind::Field);
        assert!(vm.is_instance(&exc, &field_cls));

        let err = vm.exception_to_error();
        assert_eq!(err.kind, ErrorKind::Field);
        assert_eq!(err.message, "nope");
    }

    #[test]
    fn eval_break_raises_program_interrupt() {
        let mut vm = test_vm();
        let mut main = Chunk::new();
        main.write_jump_back(OpCode::Jump, 0, 1);
        vm.eval_break_handle().store(true, Ordering::Relaxed);
        let err = run(&mut vm, main).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Interrupt);
    }

    // ==================== Closures and Upvalues ====================

    #[test]
    fn closure_captures_local_beyond_frame_exit() {
        let mut vm = test_vm();

        // counter body: i += 1; return i
        let mut counter = Chunk::new();
        emit_local(&mut counter, OpCode::GetUpvalue, 0);
        emit_num(&mut counter, 1.0);
        counter.write_op(OpCode::Add, 1);
        emit_local(&mut counter, OpCode::SetUpvalue, 0);
        counter.write_op(OpCode::Return, 1);
        let counter = make_fun(&mut vm, "counter", 0, Vec::new(), false, 1, counter);

        // mk body: var i = 0; return closure capturing i
        let mut mk = Chunk::new();
        emit_num(&mut mk, 0.0);
        emit_closure(&mut mk, counter, &[(true, 1)]);
        mk.write_op(OpCode::Return, 1);
        let mk = make_fun(&mut vm, "mk", 0, Vec::new(), false, 0, mk);

        let mut main = Chunk::new();
        emit_closure(&mut main, mk, &[]);
        main.write_op(call_op(0), 1);
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "c");
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "c");
        main.write_op(call_op(0), 1);
        main.write_op(OpCode::Pop, 1);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "c");
        main.write_op(call_op(0), 1);
        main.write_op(OpCode::Pop, 1);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "c");
        main.write_op(call_op(0), 1);
        main.write_op(OpCode::Return, 1);

        let result = run(&mut vm, main).unwrap();
        assert_eq!(as_num(&result), 3.0);
    }

    #[test]
    fn closures_share_one_upvalue_cell() {
        let mut vm = test_vm();

        let mut incr = Chunk::new();
        emit_local(&mut incr, OpCode::GetUpvalue, 0);
        emit_num(&mut incr, 1.0);
        incr.write_op(OpCode::Add, 1);
        emit_local(&mut incr, OpCode::SetUpvalue, 0);
        incr.write_op(OpCode::Return, 1);
        let incr = make_fun(&mut vm, "incr", 0, Vec::new(), false, 1, incr);

        let mut getter = Chunk::new();
        emit_local(&mut getter, OpCode::GetUpvalue, 0);
        getter.write_op(OpCode::Return, 1);
        let getter = make_fun(&mut vm, "getter", 0, Vec::new(), false, 1, getter);

        // Both closures capture the same local slot
        let mut mk = Chunk::new();
        emit_num(&mut mk, 0.0);
        emit_closure(&mut mk, incr, &[(true, 1)]);
        emit_closure(&mut mk, getter, &[(true, 1)]);
        mk.write_op(OpCode::NewTuple, 1);
        mk.write(2, 1);
        mk.write_op(OpCode::Return, 1);
        let mk = make_fun(&mut vm, "mk", 0, Vec::new(), false, 0, mk);

        let mut main = Chunk::new();
        emit_closure(&mut main, mk, &[]);
        main.write_op(call_op(0), 1);
        main.write_op(OpCode::Unpack, 1);
        main.write(2, 1);
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "get");
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "inc");
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "inc");
        main.write_op(call_op(0), 1);
        main.write_op(OpCode::Pop, 1);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "inc");
        main.write_op(call_op(0), 1);
        main.write_op(OpCode::Pop, 1);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "get");
        main.write_op(call_op(0), 1);
        main.write_op(OpCode::Return, 1);

        let result = run(&mut vm, main).unwrap();
        assert_eq!(as_num(&result), 2.0);
    }

    #[test]
    fn close_upvalue_opcode_closes_top_slot() {
        let mut vm = test_vm();

        let mut getter = Chunk::new();
        emit_local(&mut getter, OpCode::GetUpvalue, 0);
        getter.write_op(OpCode::Return, 1);
        let getter = make_fun(&mut vm, "getter", 0, Vec::new(), false, 1, getter);

        let mut main = Chunk::new();
        emit_num(&mut main, 5.0);
        emit_closure(&mut main, getter, &[(true, 1)]);
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "g");
        main.write_op(OpCode::CloseUpvalue, 1);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "g");
        main.write_op(call_op(0), 1);
        main.write_op(OpCode::Return, 1);

        let result = run(&mut vm, main).unwrap();
        assert_eq!(as_num(&result), 5.0);
    }

    #[test]
    fn open_upvalues_stay_sorted_and_deduped() {
        let mut vm = test_vm();
        for i in 0..4 {
            vm.push(Value::Number(i as f64));
        }
        let u2 = vm.capture_upvalue(2);
        let u0 = vm.capture_upvalue(0);
        let u1 = vm.capture_upvalue(1);

        let locations: Vec<usize> = vm
            .open_upvalues
            .iter()
            .map(|u| u.lock().location)
            .collect();
        assert_eq!(locations, vec![2, 1, 0]);

        let again = vm.capture_upvalue(1);
        assert!(Arc::ptr_eq(&u1, &again));
        assert_eq!(vm.open_upvalues.len(), 3);

        vm.close_upvalues(1);
        assert!(u1.lock().closed.is_some());
        assert!(u2.lock().closed.is_some());
        assert!(u0.lock().is_open());
        assert_eq!(vm.open_upvalues.len(), 1);
        {
            let guard = u1.lock();
            let closed = guard.closed.as_ref().unwrap();
            assert_eq!(as_num(closed), 1.0);
        }
        {
            let guard = u2.lock();
            let closed = guard.closed.as_ref().unwrap();
            assert_eq!(as_num(closed), 2.0);
        }
    }

    // ==================== Operators ====================

    #[test]
    fn reverse_overload_dispatches_radd() {
        let mut vm = test_vm();

        let mut radd = Chunk::new();
        emit_str(&mut vm, &mut radd, "r");
        radd.write_op(OpCode::Return, 1);
        let radd = make_fun(&mut vm, "__radd__", 1, Vec::new(), false, 0, radd);

        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::NewClass, "N");
        emit_closure(&mut main, radd, &[]);
        emit_named(&mut vm, &mut main, OpCode::DefMethod, "__radd__");
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "N");
        emit_num(&mut main, 1.0);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "N");
        main.write_op(call_op(0), 1);
        main.write_op(OpCode::Add, 1);
        main.write_op(OpCode::Return, 1);

        let result = run(&mut vm, main).unwrap();
        assert_eq!(result.as_string(), Some("r"));
    }

    #[test]
    fn missing_overloads_raise_type_exception() {
        let mut vm = test_vm();
        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::NewClass, "M");
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "M");
        emit_num(&mut main, 1.0);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "M");
        main.write_op(call_op(0), 1);
        main.write_op(OpCode::Add, 1);
        main.write_op(OpCode::Return, 1);

        let err = run(&mut vm, main).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
        assert!(err.message.contains("Operator +"));
    }

    #[test]
    fn unary_neg_overload() {
        let mut vm = test_vm();

        let mut neg = Chunk::new();
        emit_num(&mut neg, 7.0);
        neg.write_op(OpCode::Return, 1);
        let neg = make_fun(&mut vm, "__neg__", 0, Vec::new(), false, 0, neg);

        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::NewClass, "N");
        emit_closure(&mut main, neg, &[]);
        emit_named(&mut vm, &mut main, OpCode::DefMethod, "__neg__");
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "N");
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "N");
        main.write_op(call_op(0), 1);
        main.write_op(OpCode::Neg, 1);
        main.write_op(OpCode::Return, 1);

        let result = run(&mut vm, main).unwrap();
        assert_eq!(as_num(&result), 7.0);
    }

    #[test]
    fn equality_short_circuits_for_primitives() {
        let mut vm = test_vm();

        let mut main = Chunk::new();
        emit_num(&mut main, 1.0);
        emit_num(&mut main, 1.0);
        main.write_op(OpCode::Eq, 1);
        main.write_op(OpCode::Return, 1);
        assert_eq!(run(&mut vm, main).unwrap().as_bool(), Some(true));

        // Mixed number/string compares structurally false without overloads
        let mut main = Chunk::new();
        emit_num(&mut main, 1.0);
        emit_str(&mut vm, &mut main, "1");
        main.write_op(OpCode::Eq, 1);
        main.write_op(OpCode::Return, 1);
        assert_eq!(run(&mut vm, main).unwrap().as_bool(), Some(false));

        // Concatenated strings compare by content through __eq__
        let mut main = Chunk::new();
        emit_str(&mut vm, &mut main, "a");
        emit_str(&mut vm, &mut main, "b");
        main.write_op(OpCode::Add, 1);
        emit_str(&mut vm, &mut main, "ab");
        main.write_op(OpCode::Eq, 1);
        main.write_op(OpCode::Return, 1);
        assert_eq!(run(&mut vm, main).unwrap().as_bool(), Some(true));
    }

    #[test]
    fn is_walks_the_superclass_chain() {
        let mut vm = test_vm();

        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::NewClass, "A");
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "A");
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "A");
        emit_named(&mut vm, &mut main, OpCode::NewSubclass, "B");
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "B");
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "B");
        main.write_op(call_op(0), 1);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "A");
        main.write_op(OpCode::Is, 1);
        main.write_op(OpCode::Return, 1);
        assert_eq!(run(&mut vm, main).unwrap().as_bool(), Some(true));

        // `is` demands a class on the right
        let mut main = Chunk::new();
        emit_num(&mut main, 1.0);
        emit_num(&mut main, 2.0);
        main.write_op(OpCode::Is, 1);
        main.write_op(OpCode::Return, 1);
        let err = run(&mut vm, main).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
    }

    #[test]
    fn pow_is_numbers_only() {
        let mut vm = test_vm();

        let mut main = Chunk::new();
        emit_num(&mut main, 2.0);
        emit_num(&mut main, 10.0);
        main.write_op(OpCode::Pow, 1);
        main.write_op(OpCode::Return, 1);
        assert_eq!(as_num(&run(&mut vm, main).unwrap()), 1024.0);

        let mut main = Chunk::new();
        emit_str(&mut vm, &mut main, "a");
        emit_num(&mut main, 1.0);
        main.write_op(OpCode::Pow, 1);
        main.write_op(OpCode::Return, 1);
        let err = run(&mut vm, main).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
    }

    // ==================== Classes ====================

    #[test]
    fn constructor_stores_fields_and_returns_instance() {
        let mut vm = test_vm();

        // new(x): this.x = x; return this
        let mut ctor = Chunk::new();
        emit_local(&mut ctor, OpCode::GetLocal, 1);
        emit_local(&mut ctor, OpCode::GetLocal, 0);
        emit_named(&mut vm, &mut ctor, OpCode::SetField, "x");
        ctor.write_op(OpCode::Pop, 1);
        emit_local(&mut ctor, OpCode::GetLocal, 0);
        ctor.write_op(OpCode::Return, 1);
        let ctor = make_fun(&mut vm, "new", 1, Vec::new(), false, 0, ctor);

        // getx(): return this.x
        let mut getx = Chunk::new();
        emit_local(&mut getx, OpCode::GetLocal, 0);
        emit_named(&mut vm, &mut getx, OpCode::GetField, "x");
        getx.write_op(OpCode::Return, 1);
        let getx = make_fun(&mut vm, "getx", 0, Vec::new(), false, 0, getx);

        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::NewClass, "P");
        emit_closure(&mut main, ctor, &[]);
        emit_named(&mut vm, &mut main, OpCode::DefMethod, "new");
        emit_closure(&mut main, getx, &[]);
        emit_named(&mut vm, &mut main, OpCode::DefMethod, "getx");
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "P");
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "P");
        emit_num(&mut main, 7.0);
        main.write_op(call_op(1), 1);
        // Generic invoke form with a byte argument count
        let name = sconst(&mut vm, &mut main, "getx");
        main.write_op(OpCode::Invoke, 1);
        main.write(0, 1);
        main.write_u16(name, 1);
        main.write_op(OpCode::Return, 1);

        let result = run(&mut vm, main).unwrap();
        assert_eq!(as_num(&result), 7.0);
    }

    #[test]
    fn super_binds_lexically_to_the_frozen_superclass() {
        let mut vm = test_vm();

        let mut am = Chunk::new();
        emit_num(&mut am, 1.0);
        am.write_op(OpCode::Return, 1);
        let am = make_fun(&mut vm, "m", 0, Vec::new(), false, 0, am);

        // B.m: return super.m() + 2
        let mut bm = Chunk::new();
        emit_local(&mut bm, OpCode::GetLocal, 0);
        let name = sconst(&mut vm, &mut bm, "m");
        bm.write_op(OpCode::Super0, 1);
        bm.write_u16(name, 1);
        emit_num(&mut bm, 2.0);
        bm.write_op(OpCode::Add, 1);
        bm.write_op(OpCode::Return, 1);
        let bm = make_fun(&mut vm, "m", 0, Vec::new(), false, 0, bm);

        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::NewClass, "A");
        emit_closure(&mut main, am, &[]);
        emit_named(&mut vm, &mut main, OpCode::DefMethod, "m");
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "A");
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "A");
        emit_named(&mut vm, &mut main, OpCode::NewSubclass, "B");
        emit_closure(&mut main, bm, &[]);
        emit_named(&mut vm, &mut main, OpCode::DefMethod, "m");
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "B");
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "B");
        main.write_op(call_op(0), 1);
        emit_invoke(&mut vm, &mut main, "m", 0);
        main.write_op(OpCode::Return, 1);

        let result = run(&mut vm, main).unwrap();
        assert_eq!(as_num(&result), 3.0);
    }

    #[test]
    fn field_access_falls_back_to_bound_methods() {
        let mut vm = test_vm();

        let mut m = Chunk::new();
        emit_num(&mut m, 5.0);
        m.write_op(OpCode::Return, 1);
        let m = make_fun(&mut vm, "m", 0, Vec::new(), false, 0, m);

        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::NewClass, "C");
        emit_closure(&mut main, m, &[]);
        emit_named(&mut vm, &mut main, OpCode::DefMethod, "m");
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "C");
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "C");
        main.write_op(call_op(0), 1);
        emit_named(&mut vm, &mut main, OpCode::GetField, "m");
        main.write_op(call_op(0), 1);
        main.write_op(OpCode::Return, 1);

        let result = run(&mut vm, main).unwrap();
        assert_eq!(as_num(&result), 5.0);
    }

    #[test]
    fn builtin_classes_are_protected() {
        let mut vm = test_vm();

        // Non-instantiable builtin
        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "Table");
        main.write_op(call_op(0), 1);
        main.write_op(OpCode::Return, 1);
        let err = run(&mut vm, main).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Runtime);
        assert!(err.message.contains("instantiated"));

        // Builtin classes cannot be subclassed
        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "List");
        emit_named(&mut vm, &mut main, OpCode::NewSubclass, "X");
        main.write_op(OpCode::Return, 1);
        let err = run(&mut vm, main).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
        assert!(err.message.contains("subclass"));
    }

    #[test]
    fn instantiable_builtin_constructors() {
        let mut vm = test_vm();

        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "String");
        emit_num(&mut main, 42.0);
        // Generic call form with a byte argument count
        main.write_op(OpCode::Call, 1);
        main.write(1, 1);
        main.write_op(OpCode::Return, 1);
        assert_eq!(run(&mut vm, main).unwrap().as_string(), Some("42"));

        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "Number");
        emit_str(&mut vm, &mut main, "3.5");
        main.write_op(call_op(1), 1);
        main.write_op(OpCode::Return, 1);
        assert_eq!(as_num(&run(&mut vm, main).unwrap()), 3.5);

        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "Number");
        emit_str(&mut vm, &mut main, "abc");
        main.write_op(call_op(1), 1);
        main.write_op(OpCode::Return, 1);
        let err = run(&mut vm, main).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArg);

        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "List");
        emit_num(&mut main, 3.0);
        emit_num(&mut main, 0.0);
        main.write_op(call_op(2), 1);
        main.write_op(OpCode::Return, 1);
        let Value::List(items) = run(&mut vm, main).unwrap() else {
            panic!("expected list")
        };
        assert_eq!(items.lock().len(), 3);
    }

    // ==================== Iteration ====================

    #[test]
    fn for_loop_iterates_a_list() {
        let mut vm = test_vm();

        let mut main = Chunk::new();
        main.write_op(OpCode::Null, 1); // slot 1: loop variable
        main.write_op(OpCode::NewList, 1); // slot 2: results
        main.write_op(OpCode::NewList, 1); // the iterable
        for n in [10.0, 20.0, 30.0] {
            emit_num(&mut main, n);
            main.write_op(OpCode::AppendList, 1);
        }
        main.write_op(OpCode::Null, 1); // iterator state
        let loop_start = main.current_offset();
        main.write_op(OpCode::ForIter, 1);
        let exit = main.write_jump(OpCode::ForNext, 1);
        emit_local(&mut main, OpCode::SetLocal, 1);
        main.write_op(OpCode::Pop, 1);
        emit_local(&mut main, OpCode::GetLocal, 2);
        emit_local(&mut main, OpCode::GetLocal, 1);
        main.write_op(OpCode::AppendList, 1);
        main.write_op(OpCode::Pop, 1);
        main.write_jump_back(OpCode::Jump, loop_start, 1);
        main.patch_jump(exit);
        main.write_op(OpCode::Pop, 1);
        main.write_op(OpCode::Pop, 1);
        emit_local(&mut main, OpCode::GetLocal, 2);
        main.write_op(OpCode::Return, 1);

        let Value::List(items) = run(&mut vm, main).unwrap() else {
            panic!("expected list")
        };
        let items = items.lock();
        assert_eq!(items.len(), 3);
        assert_eq!(as_num(&items[0]), 10.0);
        assert_eq!(as_num(&items[1]), 20.0);
        assert_eq!(as_num(&items[2]), 30.0);
    }

    #[test]
    fn false_iterator_skips_the_body() {
        let mut vm = test_vm();

        let mut iterm = Chunk::new();
        let f = iterm.add_constant(Constant::Bool(false)) as u16;
        iterm.write_op(OpCode::GetConst, 1);
        iterm.write_u16(f, 1);
        iterm.write_op(OpCode::Return, 1);
        let iterm = make_fun(&mut vm, "__iter__", 1, Vec::new(), false, 0, iterm);

        let mut nextm = Chunk::new();
        nextm.write_op(OpCode::Null, 1);
        nextm.write_op(OpCode::Return, 1);
        let nextm = make_fun(&mut vm, "__next__", 1, Vec::new(), false, 0, nextm);

        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::NewClass, "E");
        emit_closure(&mut main, iterm, &[]);
        emit_named(&mut vm, &mut main, OpCode::DefMethod, "__iter__");
        emit_closure(&mut main, nextm, &[]);
        emit_named(&mut vm, &mut main, OpCode::DefMethod, "__next__");
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "E");

        main.write_op(OpCode::Null, 1); // slot 1: loop variable
        main.write_op(OpCode::NewList, 1); // slot 2: marker list
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "E");
        main.write_op(call_op(0), 1); // the iterable
        main.write_op(OpCode::Null, 1); // iterator state
        let loop_start = main.current_offset();
        main.write_op(OpCode::ForIter, 1);
        let exit = main.write_jump(OpCode::ForNext, 1);
        emit_local(&mut main, OpCode::SetLocal, 1);
        main.write_op(OpCode::Pop, 1);
        emit_local(&mut main, OpCode::GetLocal, 2);
        emit_num(&mut main, 1.0);
        main.write_op(OpCode::AppendList, 1);
        main.write_op(OpCode::Pop, 1);
        main.write_jump_back(OpCode::Jump, loop_start, 1);
        main.patch_jump(exit);
        main.write_op(OpCode::Pop, 1);
        main.write_op(OpCode::Pop, 1);
        emit_local(&mut main, OpCode::GetLocal, 2);
        main.write_op(OpCode::Return, 1);

        let Value::List(items) = run(&mut vm, main).unwrap() else {
            panic!("expected list")
        };
        assert!(items.lock().is_empty());
    }

    // ==================== Subscripts ====================

    #[test]
    fn list_subscript_supports_negative_indexes() {
        let mut vm = test_vm();
        let mut main = Chunk::new();
        main.write_op(OpCode::NewList, 1);
        for n in [10.0, 20.0, 30.0] {
            emit_num(&mut main, n);
            main.write_op(OpCode::AppendList, 1);
        }
        emit_num(&mut main, -1.0);
        main.write_op(OpCode::SubscrGet, 1);
        main.write_op(OpCode::Return, 1);
        assert_eq!(as_num(&run(&mut vm, main).unwrap()), 30.0);
    }

    #[test]
    fn list_subscript_out_of_bound() {
        let mut vm = test_vm();
        let mut main = Chunk::new();
        main.write_op(OpCode::NewList, 1);
        emit_num(&mut main, 10.0);
        main.write_op(OpCode::AppendList, 1);
        emit_num(&mut main, 5.0);
        main.write_op(OpCode::SubscrGet, 1);
        main.write_op(OpCode::Return, 1);
        let err = run(&mut vm, main).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IndexOutOfBound);
    }

    #[test]
    fn list_subscript_requires_integer_index() {
        let mut vm = test_vm();
        let mut main = Chunk::new();
        main.write_op(OpCode::NewList, 1);
        emit_num(&mut main, 10.0);
        main.write_op(OpCode::AppendList, 1);
        emit_num(&mut main, 1.5);
        main.write_op(OpCode::SubscrGet, 1);
        main.write_op(OpCode::Return, 1);
        let err = run(&mut vm, main).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
    }

    #[test]
    fn string_subscript_yields_single_character() {
        let mut vm = test_vm();
        let mut main = Chunk::new();
        emit_str(&mut vm, &mut main, "abc");
        emit_num(&mut main, 1.0);
        main.write_op(OpCode::SubscrGet, 1);
        main.write_op(OpCode::Return, 1);
        assert_eq!(run(&mut vm, main).unwrap().as_string(), Some("b"));
    }

    #[test]
    fn list_subscript_assignment() {
        let mut vm = test_vm();
        let mut main = Chunk::new();
        main.write_op(OpCode::NewList, 1);
        for n in [1.0, 2.0, 3.0] {
            emit_num(&mut main, n);
            main.write_op(OpCode::AppendList, 1);
        }
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "l");
        emit_num(&mut main, 99.0); // value
        emit_num(&mut main, 0.0); // index
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "l"); // operand
        main.write_op(OpCode::SubscrSet, 1);
        main.write_op(OpCode::Pop, 1);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "l");
        emit_num(&mut main, 0.0);
        main.write_op(OpCode::SubscrGet, 1);
        main.write_op(OpCode::Return, 1);
        assert_eq!(as_num(&run(&mut vm, main).unwrap()), 99.0);
    }

    #[test]
    fn table_subscript_goes_through_overloads() {
        let mut vm = test_vm();
        let mut main = Chunk::new();
        main.write_op(OpCode::NewTable, 1);
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "t");
        emit_str(&mut vm, &mut main, "v"); // value
        emit_str(&mut vm, &mut main, "k"); // index
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "t"); // operand
        main.write_op(OpCode::SubscrSet, 1);
        main.write_op(OpCode::Pop, 1);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "t");
        emit_str(&mut vm, &mut main, "k");
        main.write_op(OpCode::SubscrGet, 1);
        main.write_op(OpCode::Return, 1);
        assert_eq!(run(&mut vm, main).unwrap().as_string(), Some("v"));
    }

    #[test]
    fn tuple_subscript_reads_elements() {
        let mut vm = test_vm();
        let mut main = Chunk::new();
        emit_num(&mut main, 4.0);
        emit_num(&mut main, 5.0);
        main.write_op(OpCode::NewTuple, 1);
        main.write(2, 1);
        emit_num(&mut main, 1.0);
        main.write_op(OpCode::SubscrGet, 1);
        main.write_op(OpCode::Return, 1);
        assert_eq!(as_num(&run(&mut vm, main).unwrap()), 5.0);
    }

    // ==================== Globals and Jumps ====================

    #[test]
    fn set_global_requires_existing_name() {
        let mut vm = test_vm();

        let mut main = Chunk::new();
        emit_num(&mut main, 1.0);
        emit_named(&mut vm, &mut main, OpCode::DefineGlobal, "x");
        emit_num(&mut main, 2.0);
        emit_named(&mut vm, &mut main, OpCode::SetGlobal, "x");
        main.write_op(OpCode::Pop, 1);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "x");
        main.write_op(OpCode::Return, 1);
        assert_eq!(as_num(&run(&mut vm, main).unwrap()), 2.0);

        let mut main = Chunk::new();
        emit_num(&mut main, 1.0);
        emit_named(&mut vm, &mut main, OpCode::SetGlobal, "missing");
        main.write_op(OpCode::Return, 1);
        let err = run(&mut vm, main).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Name);
    }

    #[test]
    fn conditional_jumps_consume_the_condition() {
        let mut vm = test_vm();
        let mut main = Chunk::new();
        let t = main.add_constant(Constant::Bool(true)) as u16;
        main.write_op(OpCode::GetConst, 1);
        main.write_u16(t, 1);
        let taken = main.write_jump(OpCode::JumpT, 1);
        emit_num(&mut main, 1.0);
        main.write_op(OpCode::Return, 1);
        main.patch_jump(taken);
        emit_num(&mut main, 2.0);
        main.write_op(OpCode::Return, 1);
        assert_eq!(as_num(&run(&mut vm, main).unwrap()), 2.0);
    }

    // ==================== Imports ====================

    struct StubLoader {
        main: Option<Arc<Function>>,
    }

    impl ModuleLoader for StubLoader {
        fn load_module(&mut self, vm: &mut VM, name: &str) -> bool {
            if name != "dep" {
                return false;
            }
            let module = vm.define_module("dep");
            *module.main.lock() = Some(self.main.take().expect("dep loaded twice"));
            true
        }
    }

    fn dep_loader(vm: &mut VM) -> Box<StubLoader> {
        let mut body = Chunk::new();
        emit_num(&mut body, 42.0);
        emit_named(vm, &mut body, OpCode::DefineGlobal, "answer");
        body.write_op(OpCode::Null, 1);
        body.write_op(OpCode::Return, 1);
        let main = make_fun_in(vm, "dep", "<module>", 0, Vec::new(), false, 0, body);
        Box::new(StubLoader { main: Some(main) })
    }

    #[test]
    fn import_runs_the_initializer_once() {
        let mut vm = test_vm();
        let loader = dep_loader(&mut vm);
        vm.set_loader(loader);

        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::Import, "dep");
        main.write_op(OpCode::Pop, 1);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "dep");
        emit_named(&mut vm, &mut main, OpCode::GetField, "answer");
        main.write_op(OpCode::Return, 1);
        assert_eq!(as_num(&run(&mut vm, main).unwrap()), 42.0);

        // A second import binds the module without re-running the body; the
        // stub loader would panic if it were consulted again
        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::Import, "dep");
        main.write_op(OpCode::Pop, 1);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "dep");
        emit_named(&mut vm, &mut main, OpCode::GetField, "answer");
        main.write_op(OpCode::Return, 1);
        assert_eq!(as_num(&run(&mut vm, main).unwrap()), 42.0);
    }

    #[test]
    fn import_as_binds_under_the_alias() {
        let mut vm = test_vm();
        let loader = dep_loader(&mut vm);
        vm.set_loader(loader);

        let mut main = Chunk::new();
        let name = sconst(&mut vm, &mut main, "dep");
        let alias = sconst(&mut vm, &mut main, "d");
        main.write_op(OpCode::ImportAs, 1);
        main.write_u16(name, 1);
        main.write_u16(alias, 1);
        main.write_op(OpCode::Pop, 1);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "d");
        emit_named(&mut vm, &mut main, OpCode::GetField, "answer");
        main.write_op(OpCode::Return, 1);
        assert_eq!(as_num(&run(&mut vm, main).unwrap()), 42.0);
    }

    #[test]
    fn import_name_copies_bindings() {
        let mut vm = test_vm();
        let loader = dep_loader(&mut vm);
        vm.set_loader(loader);

        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::ImportFrom, "dep");
        main.write_op(OpCode::Pop, 1);
        let module = sconst(&mut vm, &mut main, "dep");
        let binding = sconst(&mut vm, &mut main, "answer");
        main.write_op(OpCode::ImportName, 1);
        main.write_u16(module, 1);
        main.write_u16(binding, 1);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "answer");
        main.write_op(OpCode::Return, 1);
        assert_eq!(as_num(&run(&mut vm, main).unwrap()), 42.0);

        // A `*` binding copies everything
        let mut main = Chunk::new();
        let module = sconst(&mut vm, &mut main, "dep");
        let star = sconst(&mut vm, &mut main, "*");
        main.write_op(OpCode::ImportName, 1);
        main.write_u16(module, 1);
        main.write_u16(star, 1);
        emit_named(&mut vm, &mut main, OpCode::GetGlobal, "answer");
        main.write_op(OpCode::Return, 1);
        assert_eq!(as_num(&run(&mut vm, main).unwrap()), 42.0);
    }

    #[test]
    fn missing_module_raises_import_exception() {
        let mut vm = test_vm();
        let loader = dep_loader(&mut vm);
        vm.set_loader(loader);

        let mut main = Chunk::new();
        emit_named(&mut vm, &mut main, OpCode::Import, "nowhere");
        main.write_op(OpCode::Pop, 1);
        main.write_op(OpCode::Null, 1);
        main.write_op(OpCode::Return, 1);
        let err = run(&mut vm, main).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Import);
    }
}
