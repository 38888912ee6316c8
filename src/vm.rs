// File: src/vm.rs
//
// Virtual machine for executing Vesper bytecode.
// Stack-based interpreter with fixed-size value/call/handler stacks,
// an open-upvalue list kept in descending slot order, a module cache,
// and a GC safepoint at the top of the dispatch loop. Arithmetic and
// comparison opcodes take a numeric fast path and fall back to `$`
// method dispatch on the receiver's class.

use crate::builtins;
use crate::bytecode::Op;
use crate::compiler::Compiler;
use crate::errors::{Reporter, TerminalReporter, TraceFrame};
use crate::heap::Heap;
use crate::lexer::Lexer;
use crate::module::ModuleResolver;
use crate::native::{NativeCtx, NativeFn, VmException};
use crate::parser::Parser;
use crate::source::SourceMap;
use crate::table::Table;
use crate::value::{hash_bytes, Obj, ObjId, UpvalueObj, Value};
use ahash::AHashMap;
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;

pub const STACK_SIZE: usize = 1024;
pub const MAX_FRAMES: usize = 128;
pub const MAX_HANDLERS: usize = 128;

/// Why execution is leaving the normal instruction flow.
#[derive(Debug)]
pub enum Unwind {
    /// A thrown value looking for a handler.
    Exception(Value),
    /// A thrown value that reached the top with no handler.
    Uncaught(Value, Vec<TraceFrame>),
    /// Stack overflow, corrupted bytecode; cannot be caught.
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Ok,
    RuntimeError,
}

#[derive(Debug, Clone, Copy)]
struct CallFrame {
    ip: usize,
    /// Index of the frame's first value (its first argument).
    base: usize,
    /// The closure whose upvalue array the frame reads, if any.
    closure: Option<ObjId>,
    function: ObjId,
    /// Extra values below `base` (the callee slot) discarded on return.
    pop_extra: usize,
    /// `$init` frames return the receiver instead of the popped result.
    is_initializer: bool,
    /// Module bodies return nothing, leaving the module on top.
    discard_return: bool,
}

#[derive(Debug, Clone, Copy)]
struct Handler {
    /// Absolute value-stack height to restore before entering the
    /// handler.
    stack_top: usize,
    /// Absolute pc of the handler within the owning function.
    pc: usize,
    /// Frame the handler lives in.
    frame_index: usize,
}

/// Interned names of the `$` special methods, cached at startup.
#[derive(Clone, Copy)]
pub struct Specials {
    pub init: ObjId,
    pub add: ObjId,
    pub sub: ObjId,
    pub mul: ObjId,
    pub div: ObjId,
    pub modulo: ObjId,
    pub lt: ObjId,
    pub le: ObjId,
    pub gt: ObjId,
    pub ge: ObjId,
    pub get_index: ObjId,
    pub set_index: ObjId,
    pub hash: ObjId,
    pub iter: ObjId,
    pub next: ObjId,
    pub str_: ObjId,
    pub msg: ObjId,
}

impl Specials {
    fn intern(heap: &mut Heap) -> Specials {
        Specials {
            init: heap.alloc_string("$init"),
            add: heap.alloc_string("$add"),
            sub: heap.alloc_string("$sub"),
            mul: heap.alloc_string("$mul"),
            div: heap.alloc_string("$div"),
            modulo: heap.alloc_string("$mod"),
            lt: heap.alloc_string("$lt"),
            le: heap.alloc_string("$le"),
            gt: heap.alloc_string("$gt"),
            ge: heap.alloc_string("$ge"),
            get_index: heap.alloc_string("$get_index"),
            set_index: heap.alloc_string("$set_index"),
            hash: heap.alloc_string("$hash"),
            iter: heap.alloc_string("$iter"),
            next: heap.alloc_string("$next"),
            str_: heap.alloc_string("$str"),
            msg: heap.alloc_string("msg"),
        }
    }
}

/// Handles to the core classes, filled in by `builtins::install`.
#[derive(Clone, Copy)]
pub struct CoreClasses {
    pub list: ObjId,
    pub list_iterator: ObjId,
    pub dict: ObjId,
    pub range: ObjId,
    pub string: ObjId,
    pub int: ObjId,
    pub float: ObjId,
    pub bool_: ObjId,
    pub name_error: ObjId,
    pub type_error: ObjId,
    pub stop_iteration: ObjId,
}

impl Default for CoreClasses {
    fn default() -> Self {
        let unset = ObjId(u32::MAX);
        CoreClasses {
            list: unset,
            list_iterator: unset,
            dict: unset,
            range: unset,
            string: unset,
            int: unset,
            float: unset,
            bool_: unset,
            name_error: unset,
            type_error: unset,
            stop_iteration: unset,
        }
    }
}

pub struct Vm {
    pub heap: Heap,
    stack: Box<[Value; STACK_SIZE]>,
    top: usize,
    frames: Vec<CallFrame>,
    handlers: Vec<Handler>,
    /// Open upvalues ordered by descending stack slot; at most one per
    /// slot.
    open_upvalues: Vec<ObjId>,
    /// Interned path string -> module object.
    modules: AHashMap<ObjId, ObjId>,
    native_modules: AHashMap<String, NativeFn>,
    pub builtins: Table,
    pub specials: Specials,
    pub core: CoreClasses,
    finally_depth: usize,
    resolver: ModuleResolver,
    reporter: Box<dyn Reporter>,
    out: Box<dyn Write>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Vm {
        let mut heap = Heap::new();
        let specials = Specials::intern(&mut heap);
        let mut vm = Vm {
            heap,
            stack: Box::new([Value::Null; STACK_SIZE]),
            top: 0,
            frames: Vec::new(),
            handlers: Vec::new(),
            open_upvalues: Vec::new(),
            modules: AHashMap::new(),
            native_modules: AHashMap::new(),
            builtins: Table::new(),
            specials,
            core: CoreClasses::default(),
            finally_depth: 0,
            resolver: ModuleResolver::new(std::env::current_dir().unwrap_or_default()),
            reporter: Box::new(TerminalReporter::new()),
            out: Box::new(std::io::stdout()),
        };
        builtins::install(&mut vm);
        vm
    }

    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.out = out;
    }

    pub fn set_reporter(&mut self, reporter: Box<dyn Reporter>) {
        self.reporter = reporter;
    }

    pub fn set_base_dir(&mut self, dir: PathBuf) {
        self.resolver = ModuleResolver::new(dir);
    }

    /// Register a native module; `use "name"` resolves it before
    /// touching the filesystem.
    pub fn create_module(&mut self, name: &str, main: NativeFn) {
        self.native_modules.insert(name.to_string(), main);
    }

    /// Root the REPL's persistent module by caching it under a name no
    /// import path can collide with.
    pub fn register_repl_module(&mut self, module: ObjId) {
        let key = self.heap.alloc_string("<repl>");
        self.modules.insert(key, module);
    }

    pub fn define_builtin(&mut self, name: &str, value: Value) {
        let id = self.heap.alloc_string(name);
        let hash = self.heap.str_hash(id);
        self.builtins.set(id, hash, value);
    }

    pub fn define_native_function(&mut self, name: &str, arity: u32, function: NativeFn) {
        let name_id = self.heap.alloc_string(name);
        let id = self.heap.alloc_native_function(name_id, arity, function, None);
        self.define_builtin(name, Value::Obj(id));
    }

    pub(crate) fn write_output(&mut self, text: &str) {
        let _ = self.out.write_all(text.as_bytes());
        let _ = self.out.flush();
    }

    pub(crate) fn stack_at(&self, index: usize) -> Value {
        self.stack[index]
    }

    // === Driving ===

    /// Run a compiled root function to completion. Frontend errors have
    /// already aborted by this point, so any failure here is a runtime
    /// exception or a fatal VM error.
    pub fn execute(&mut self, function: ObjId) -> ExecuteOutcome {
        let result = self
            .push(Value::Obj(function))
            .and_then(|()| self.call_value(0))
            .and_then(|()| self.run(0));

        match result {
            Ok(()) => {
                // The script body's return value.
                let _ = self.pop();
                ExecuteOutcome::Ok
            }
            Err(Unwind::Uncaught(value, trace)) => self.report_uncaught(value, trace),
            Err(Unwind::Exception(value)) => {
                let trace = self.build_trace();
                self.report_uncaught(value, trace)
            }
            Err(Unwind::Fatal(message)) => {
                self.reporter.vm_error(&message);
                self.reset();
                ExecuteOutcome::RuntimeError
            }
        }
    }

    fn report_uncaught(&mut self, value: Value, trace: Vec<TraceFrame>) -> ExecuteOutcome {
        let message = self
            .display_value(value)
            .unwrap_or_else(|_| "<exception>".to_string());
        self.reporter.uncaught_exception(&message, &trace);
        self.reset();
        ExecuteOutcome::RuntimeError
    }

    pub fn reset(&mut self) {
        self.top = 0;
        self.frames.clear();
        self.handlers.clear();
        self.open_upvalues.clear();
        self.finally_depth = 0;
    }

    /// True while a finally block is executing.
    pub fn in_finally(&self) -> bool {
        self.finally_depth > 0
    }

    /// Execute until the call stack shrinks back to `min_frames`.
    fn run(&mut self, min_frames: usize) -> Result<(), Unwind> {
        while self.frames.len() > min_frames {
            if self.heap.wants_gc() {
                self.collect_garbage();
            }
            match self.step() {
                Ok(()) => {}
                Err(Unwind::Exception(value)) => self.handle_throw(value, min_frames)?,
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Unwind to the innermost handler, or propagate.
    fn handle_throw(&mut self, value: Value, min_frames: usize) -> Result<(), Unwind> {
        match self.handlers.last().copied() {
            Some(handler) if handler.frame_index >= min_frames => {
                self.handlers.pop();
                if handler.frame_index >= self.frames.len() {
                    return Err(Unwind::Fatal("corrupted exception handler".to_string()));
                }
                self.frames.truncate(handler.frame_index + 1);
                self.close_upvalues(handler.stack_top);
                self.top = handler.stack_top;
                self.frames[handler.frame_index].ip = handler.pc;
                self.push(value)
            }
            Some(_) => {
                // The handler belongs to a frame outside this nested
                // execution; let the native boundary propagate it.
                Err(Unwind::Exception(value))
            }
            None if min_frames == 0 => {
                let trace = self.build_trace();
                Err(Unwind::Uncaught(value, trace))
            }
            None => Err(Unwind::Exception(value)),
        }
    }

    fn build_trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let function = self.heap.function(frame.function);
                let line = function
                    .chunk
                    .lines
                    .get(frame.ip.saturating_sub(1))
                    .copied()
                    .unwrap_or(0);
                TraceFrame { function: self.heap.str_chars(function.name).to_string(), line }
            })
            .collect()
    }

    // === Fetching ===

    fn read_u8(&mut self) -> Result<u8, Unwind> {
        let frame_index = self.frames.len() - 1;
        let (function, ip) = {
            let frame = &self.frames[frame_index];
            (frame.function, frame.ip)
        };
        let byte = self
            .heap
            .function(function)
            .chunk
            .code
            .get(ip)
            .copied()
            .ok_or_else(|| Unwind::Fatal("corrupted bytecode: ran off the end".to_string()))?;
        self.frames[frame_index].ip += 1;
        Ok(byte)
    }

    fn read_u32(&mut self) -> Result<u32, Unwind> {
        let mut value = 0u32;
        for _ in 0..4 {
            value = (value << 8) | self.read_u8()? as u32;
        }
        Ok(value)
    }

    // === Stack ===

    fn push(&mut self, value: Value) -> Result<(), Unwind> {
        if self.top == STACK_SIZE {
            return Err(Unwind::Fatal("stack overflow".to_string()));
        }
        self.stack[self.top] = value;
        self.top += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, Unwind> {
        if self.top == 0 {
            return Err(Unwind::Fatal("corrupted bytecode: pop from empty stack".to_string()));
        }
        self.top -= 1;
        Ok(self.stack[self.top])
    }

    fn peek(&self, depth: usize) -> Result<Value, Unwind> {
        if depth >= self.top {
            return Err(Unwind::Fatal("corrupted bytecode: peek past stack bottom".to_string()));
        }
        Ok(self.stack[self.top - 1 - depth])
    }

    // === Dispatch ===

    fn step(&mut self) -> Result<(), Unwind> {
        let byte = self.read_u8()?;
        let op = Op::try_from(byte)
            .map_err(|_| Unwind::Fatal(format!("corrupted bytecode: opcode 0x{:02x}", byte)))?;

        match op {
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => self.arithmetic(op),
            Op::Concat => self.concat(),
            Op::Less | Op::LessEq | Op::More | Op::MoreEq => self.comparison(op),
            Op::Equals => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                self.push(Value::Bool(lhs == rhs))
            }
            Op::NotEq => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                self.push(Value::Bool(lhs != rhs))
            }
            Op::Negate => {
                let value = self.pop()?;
                match value {
                    Value::Int(v) => self.push(Value::Int(v.wrapping_neg())),
                    Value::Float(v) => self.push(Value::Float(-v)),
                    _ => Err(self.type_error_unwind("operand of '-' must be a number")),
                }
            }
            Op::Not => {
                let value = self.pop()?;
                self.push(Value::Bool(!value.is_truthy()))
            }
            Op::GetConstant => {
                let index = self.read_u32()?;
                let value = self
                    .heap
                    .constant(index)
                    .ok_or_else(|| Unwind::Fatal("corrupted bytecode: bad constant".to_string()))?;
                self.push(value)
            }
            Op::GetLocal => {
                let index = self.read_u32()? as usize;
                let base = self.frame().base;
                self.push(self.stack[base + index])
            }
            Op::SetLocal => {
                let index = self.read_u32()? as usize;
                let base = self.frame().base;
                self.stack[base + index] = self.peek(0)?;
                Ok(())
            }
            Op::CreateGlobal => {
                let name = self.pop_string("global name")?;
                let initializer = self.pop()?;
                let module = self.current_module_id()?;
                let hash = self.heap.str_hash(name);
                self.heap.module_mut(module).globals.set(name, hash, initializer);
                Ok(())
            }
            Op::GetGlobal => {
                let name = self.pop_string("global name")?;
                let module = self.current_module();
                match self.lookup_global_id(module, name) {
                    Some(value) => self.push(value),
                    None => {
                        let text = self.heap.str_chars(name).to_string();
                        Err(self.name_error_unwind(&format!("undefined variable '{}'", text)))
                    }
                }
            }
            Op::SetGlobal => {
                let name = self.pop_string("global name")?;
                let value = self.peek(0)?;
                let module = self.current_module_id()?;
                let hash = self.heap.str_hash(name);
                if self.heap.module(module).globals.get(name, hash).is_some() {
                    self.heap.module_mut(module).globals.set(name, hash, value);
                    Ok(())
                } else {
                    let text = self.heap.str_chars(name).to_string();
                    Err(self.name_error_unwind(&format!("undefined variable '{}'", text)))
                }
            }
            Op::GetUpvalue => {
                let index = self.read_u32()? as usize;
                let upvalue = self.frame_upvalue(index)?;
                match self.heap.upvalue(upvalue) {
                    UpvalueObj::Open(slot) => self.push(self.stack[slot]),
                    UpvalueObj::Closed(value) => self.push(value),
                }
            }
            Op::SetUpvalue => {
                let index = self.read_u32()? as usize;
                let upvalue = self.frame_upvalue(index)?;
                let value = self.peek(0)?;
                match self.heap.upvalue(upvalue) {
                    UpvalueObj::Open(slot) => self.stack[slot] = value,
                    UpvalueObj::Closed(_) => {
                        *self.heap.upvalue_mut(upvalue) = UpvalueObj::Closed(value);
                    }
                }
                Ok(())
            }
            Op::GetField => self.get_field(),
            Op::SetField => self.set_field(),
            Op::StoreMethod => {
                let name = self.pop_string("method name")?;
                let method = self.pop()?;
                let class_value = self.peek(0)?;
                let Some(class_id) = class_value.as_obj().filter(|&id| self.is_class(id)) else {
                    return Err(Unwind::Fatal("corrupted bytecode: StoreMethod".to_string()));
                };
                let Some(method_id) = method.as_obj() else {
                    return Err(Unwind::Fatal("corrupted bytecode: StoreMethod".to_string()));
                };
                let hash = self.heap.str_hash(name);
                self.heap.class_mut(class_id).methods.set(name, hash, Value::Obj(method_id));
                Ok(())
            }
            Op::GetIndex => {
                let receiver = self.peek(1)?;
                self.dispatch_method(receiver, self.specials.get_index, 2, "'[]' is not supported")
            }
            Op::SetIndex => {
                let receiver = self.peek(2)?;
                self.dispatch_method(receiver, self.specials.set_index, 3, "'[]=' is not supported")
            }
            Op::LoadNull => self.push(Value::Null),
            Op::LoadTrue => self.push(Value::Bool(true)),
            Op::LoadFalse => self.push(Value::Bool(false)),
            Op::CreateClass => {
                let name = self.pop_string("class name")?;
                let class = self.heap.alloc_class(name, None);
                self.push(Value::Obj(class))
            }
            Op::Closure => self.make_closure(),
            Op::Jump => {
                let distance = self.read_u32()? as usize;
                self.frame_mut().ip += distance;
                Ok(())
            }
            Op::JumpIfTrue => {
                let distance = self.read_u32()? as usize;
                if self.peek(0)?.is_truthy() {
                    self.frame_mut().ip += distance;
                }
                Ok(())
            }
            Op::JumpIfFalse => {
                let distance = self.read_u32()? as usize;
                if !self.peek(0)?.is_truthy() {
                    self.frame_mut().ip += distance;
                }
                Ok(())
            }
            Op::JumpIfFalseAndPop => {
                let distance = self.read_u32()? as usize;
                let condition = self.pop()?;
                if !condition.is_truthy() {
                    self.frame_mut().ip += distance;
                }
                Ok(())
            }
            Op::JumpBack => {
                let distance = self.read_u32()? as usize;
                let frame = self.frame_mut();
                frame.ip = frame.ip.checked_sub(distance).ok_or_else(|| {
                    Unwind::Fatal("corrupted bytecode: backward jump".to_string())
                })?;
                Ok(())
            }
            Op::Call => {
                let argc = self.read_u32()? as usize;
                self.call_value(argc)
            }
            Op::Return => self.do_return(),
            Op::TryBegin => {
                let distance = self.read_u32()? as usize;
                if self.handlers.len() == MAX_HANDLERS {
                    return Err(Unwind::Fatal("exception handler stack overflow".to_string()));
                }
                let frame_index = self.frames.len() - 1;
                let pc = self.frames[frame_index].ip + distance;
                self.handlers.push(Handler { stack_top: self.top, pc, frame_index });
                Ok(())
            }
            Op::TryEnd => {
                self.handlers.pop();
                Ok(())
            }
            Op::FinallyBegin => {
                self.finally_depth += 1;
                Ok(())
            }
            Op::FinallyEnd => {
                self.finally_depth = self.finally_depth.saturating_sub(1);
                Ok(())
            }
            Op::Throw | Op::Rethrow => {
                let value = self.pop()?;
                Err(Unwind::Exception(value))
            }
            Op::CloseUpvalue => {
                let index = self.read_u8()? as usize;
                let slot = self.frame().base + index;
                self.close_upvalue_at(slot);
                Ok(())
            }
            Op::MatchClass => self.match_class(),
            Op::PopStack => {
                self.pop()?;
                Ok(())
            }
            Op::Import => self.import_module(),
            Op::ModuleSetLoaded => {
                let module = self.peek(0)?;
                let Some(id) = module.as_obj().filter(|&id| matches!(self.heap.get(id), Obj::Module(_)))
                else {
                    return Err(Unwind::Fatal("corrupted bytecode: ModuleSetLoaded".to_string()));
                };
                self.heap.module_mut(id).loaded = true;
                Ok(())
            }
            Op::ModuleImportAllToGlobalNamespace => {
                let module = self.pop()?;
                let Some(id) = module.as_obj().filter(|&id| matches!(self.heap.get(id), Obj::Module(_)))
                else {
                    return Err(Unwind::Fatal("corrupted bytecode: import all".to_string()));
                };
                let entries: Vec<(ObjId, u64, Value)> = self
                    .heap
                    .module(id)
                    .globals
                    .iter()
                    .map(|(k, v)| (k, self.heap.str_hash(k), v))
                    .collect();
                let current = self.current_module_id()?;
                for (key, hash, value) in entries {
                    self.heap.module_mut(current).globals.set(key, hash, value);
                }
                Ok(())
            }
            Op::CloneTop => {
                let value = self.peek(0)?;
                self.push(value)
            }
            Op::Inherit => self.inherit(),
            Op::CreateList => {
                let list = builtins::new_list(self, Vec::new());
                self.push(list)
            }
            Op::ListPush => {
                let value = self.pop()?;
                let list = self.peek(0)?;
                builtins::list_push_value(self, list, value)
            }
            Op::CreateDict => {
                let dict = builtins::new_dict(self);
                self.push(dict)
            }
            Op::DictPush => {
                let value = self.pop()?;
                let key = self.pop()?;
                let dict = self.peek(0)?;
                builtins::dict_set_value(self, dict, key, value)?;
                Ok(())
            }
        }
    }

    // === Arithmetic and comparison ===

    fn arithmetic(&mut self, op: Op) -> Result<(), Unwind> {
        let rhs = self.peek(0)?;
        let lhs = self.peek(1)?;

        let result = match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => match op {
                Op::Add => Value::Int(a.wrapping_add(b)),
                Op::Sub => Value::Int(a.wrapping_sub(b)),
                Op::Mul => Value::Int(a.wrapping_mul(b)),
                Op::Div => {
                    if b == 0 {
                        return Err(self.type_error_unwind("division by zero"));
                    }
                    Value::Int(a.wrapping_div(b))
                }
                Op::Mod => {
                    if b == 0 {
                        return Err(self.type_error_unwind("modulo by zero"));
                    }
                    Value::Int(a.wrapping_rem(b))
                }
                _ => unreachable!(),
            },
            _ => match (as_float(lhs), as_float(rhs)) {
                (Some(a), Some(b)) => Value::Float(match op {
                    Op::Add => a + b,
                    Op::Sub => a - b,
                    Op::Mul => a * b,
                    Op::Div => a / b,
                    Op::Mod => a % b,
                    _ => unreachable!(),
                }),
                _ => {
                    let (special, symbol) = match op {
                        Op::Add => (self.specials.add, "+"),
                        Op::Sub => (self.specials.sub, "-"),
                        Op::Mul => (self.specials.mul, "*"),
                        Op::Div => (self.specials.div, "/"),
                        Op::Mod => (self.specials.modulo, "%"),
                        _ => unreachable!(),
                    };
                    return self.dispatch_method(
                        lhs,
                        special,
                        2,
                        &format!("unsupported operands for '{}'", symbol),
                    );
                }
            },
        };

        self.pop()?;
        self.pop()?;
        self.push(result)
    }

    fn comparison(&mut self, op: Op) -> Result<(), Unwind> {
        let rhs = self.peek(0)?;
        let lhs = self.peek(1)?;

        match (as_float(lhs), as_float(rhs)) {
            (Some(a), Some(b)) => {
                let result = match op {
                    Op::Less => a < b,
                    Op::LessEq => a <= b,
                    Op::More => a > b,
                    Op::MoreEq => a >= b,
                    _ => unreachable!(),
                };
                self.pop()?;
                self.pop()?;
                self.push(Value::Bool(result))
            }
            _ => {
                let (special, symbol) = match op {
                    Op::Less => (self.specials.lt, "<"),
                    Op::LessEq => (self.specials.le, "<="),
                    Op::More => (self.specials.gt, ">"),
                    Op::MoreEq => (self.specials.ge, ">="),
                    _ => unreachable!(),
                };
                self.dispatch_method(
                    lhs,
                    special,
                    2,
                    &format!("unsupported operands for '{}'", symbol),
                )
            }
        }
    }

    fn concat(&mut self) -> Result<(), Unwind> {
        let rhs = self.peek(0)?;
        let lhs = self.peek(1)?;
        match (self.as_string(lhs), self.as_string(rhs)) {
            (Some(a), Some(b)) => {
                let joined = format!("{}{}", self.heap.str_chars(a), self.heap.str_chars(b));
                let id = self.heap.alloc_string(&joined);
                self.pop()?;
                self.pop()?;
                self.push(Value::Obj(id))
            }
            _ => Err(self.type_error_unwind("'++' requires two strings")),
        }
    }

    /// Look up `special` on the receiver's class and call it over the
    /// `argc` values already in place on the stack (receiver first).
    fn dispatch_method(
        &mut self,
        receiver: Value,
        special: ObjId,
        argc: usize,
        error: &str,
    ) -> Result<(), Unwind> {
        if let Some(class) = self.class_of(receiver) {
            if let Some(method) = self.find_method(class, special) {
                return self.call_object(method, argc, self.top - argc, 0, false, false);
            }
        }
        Err(self.type_error_unwind(error))
    }

    // === Fields ===

    fn get_field(&mut self) -> Result<(), Unwind> {
        let name = self.pop_string("field name")?;
        let value = self.pop()?;
        let hash = self.heap.str_hash(name);

        if let Some(id) = value.as_obj() {
            match self.heap.get(id) {
                Obj::Module(module) => {
                    return match module.globals.get(name, hash) {
                        Some(member) => self.push(member),
                        None => {
                            let text = self.heap.str_chars(name).to_string();
                            Err(self.name_error_unwind(&format!(
                                "module has no member '{}'",
                                text
                            )))
                        }
                    };
                }
                Obj::Instance(instance) => {
                    if let Some(field) = instance.fields.get(name, hash) {
                        return self.push(field);
                    }
                }
                _ => {}
            }
        }

        let Some(class) = self.class_of(value) else {
            let text = self.heap.str_chars(name).to_string();
            return Err(self.type_error_unwind(&format!("cannot read field '{}'", text)));
        };

        if let Some(getter) = self.find_getter(class, name) {
            // Getters run immediately with the receiver as `$`.
            self.push(value)?;
            return self.call_object(getter, 1, self.top - 1, 0, false, false);
        }
        if let Some(method) = self.find_method(class, name) {
            let bound = self.heap.alloc_bound_function(value, method);
            return self.push(Value::Obj(bound));
        }

        let text = self.heap.str_chars(name).to_string();
        Err(self.name_error_unwind(&format!("undefined field '{}'", text)))
    }

    fn set_field(&mut self) -> Result<(), Unwind> {
        let name = self.pop_string("field name")?;
        let target = self.pop()?;
        let value = self.peek(0)?;

        let Some(id) = target.as_obj() else {
            return Err(self.type_error_unwind("only instances have fields"));
        };
        if !matches!(self.heap.get(id), Obj::Instance(_)) {
            return Err(self.type_error_unwind("only instances have fields"));
        }
        let hash = self.heap.str_hash(name);
        self.heap.instance_mut(id).fields.set(name, hash, value);
        Ok(())
    }

    // === Calls ===

    fn call_value(&mut self, argc: usize) -> Result<(), Unwind> {
        let callee = self.peek(argc)?;
        let Some(id) = callee.as_obj() else {
            return Err(self.type_error_unwind("can only call functions and classes"));
        };

        match self.heap.get(id) {
            Obj::Closure(_) | Obj::Function(_) | Obj::NativeFunction(_) => {
                self.call_object(id, argc, self.top - argc, 1, false, false)
            }
            Obj::BoundFunction(bound) => {
                let receiver = bound.receiver;
                let callable = bound.callable;
                let receiver_slot = self.top - argc - 1;
                self.stack[receiver_slot] = receiver;
                self.call_object(callable, argc + 1, receiver_slot, 0, false, false)
            }
            Obj::Class(_) => self.call_class(id, argc),
            _ => Err(self.type_error_unwind("can only call functions and classes")),
        }
    }

    fn call_class(&mut self, class: ObjId, argc: usize) -> Result<(), Unwind> {
        let ctor = self.heap.class(class).payload_ctor;
        let instance = match ctor {
            Some(ctor) => {
                let payload = ctor();
                self.heap.alloc_native_instance(class, payload)
            }
            None => self.heap.alloc_instance(class),
        };

        let receiver_slot = self.top - argc - 1;
        self.stack[receiver_slot] = Value::Obj(instance);

        if let Some(init) = self.find_method(class, self.specials.init) {
            return self.call_object(init, argc + 1, receiver_slot, 0, true, false);
        }
        if argc != 0 {
            let name = self.heap.str_chars(self.heap.class(class).name).to_string();
            return Err(self.type_error_unwind(&format!("'{}' takes no arguments", name)));
        }
        Ok(())
    }

    /// The common call path. `base` indexes the first of `argc` values
    /// already on the stack (the receiver for methods); `pop_extra`
    /// values below `base` are dropped on return.
    fn call_object(
        &mut self,
        callable: ObjId,
        argc: usize,
        base: usize,
        pop_extra: usize,
        is_initializer: bool,
        discard_return: bool,
    ) -> Result<(), Unwind> {
        let (function, closure) = match self.heap.get(callable) {
            Obj::Closure(c) => (c.function, Some(callable)),
            Obj::Function(_) => (callable, None),
            Obj::NativeFunction(native) => {
                let arity = native.arity as usize;
                let function = native.function;
                if arity != argc {
                    let name = self.heap.str_chars(native.name).to_string();
                    return Err(self.type_error_unwind(&format!(
                        "'{}' expects {} arguments, got {}",
                        name,
                        arity,
                        argc
                    )));
                }
                let pin_mark = self.heap.pin_count();
                let result = {
                    let mut ctx = NativeCtx::new(self, base, argc, None);
                    function(&mut ctx)
                };
                self.heap.truncate_pins(pin_mark);
                return match result {
                    Ok(value) => {
                        let result = if is_initializer { self.stack[base] } else { value };
                        self.top = base - pop_extra;
                        if discard_return {
                            Ok(())
                        } else {
                            self.push(result)
                        }
                    }
                    Err(VmException::Thrown(value)) => Err(Unwind::Exception(value)),
                    Err(VmException::Fatal(message)) => Err(Unwind::Fatal(message)),
                };
            }
            Obj::BoundFunction(bound) => {
                // A bound function stored as a method; rebind.
                let callable = bound.callable;
                return self.call_object(
                    callable,
                    argc,
                    base,
                    pop_extra,
                    is_initializer,
                    discard_return,
                );
            }
            _ => return Err(self.type_error_unwind("can only call functions and classes")),
        };

        let arity = self.heap.function(function).arity as usize;
        if arity != argc {
            let name = self.heap.str_chars(self.heap.function(function).name).to_string();
            return Err(self.type_error_unwind(&format!(
                "'{}' expects {} arguments, got {}",
                if name.is_empty() { "<anonymous>" } else { &name },
                arity,
                argc
            )));
        }
        if self.frames.len() == MAX_FRAMES {
            return Err(Unwind::Fatal("call stack overflow".to_string()));
        }

        self.frames.push(CallFrame {
            ip: 0,
            base,
            closure,
            function,
            pop_extra,
            is_initializer,
            discard_return,
        });
        Ok(())
    }

    fn do_return(&mut self) -> Result<(), Unwind> {
        let result = self.pop()?;
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| Unwind::Fatal("return with no call frame".to_string()))?;

        self.close_upvalues(frame.base);
        // A constructor call evaluates to the instance even when
        // `$init` returns something else.
        let result = if frame.is_initializer { self.stack[frame.base] } else { result };
        self.top = frame.base - frame.pop_extra;

        if frame.discard_return {
            Ok(())
        } else {
            self.push(result)
        }
    }

    /// Call a value from native code or internal dispatch, running any
    /// pushed frames to completion and returning the result.
    pub(crate) fn call_and_return(&mut self, callee: Value, args: &[Value]) -> Result<Value, Unwind> {
        self.push(callee)?;
        for &arg in args {
            self.push(arg)?;
        }
        let depth = self.frames.len();
        self.call_value(args.len())?;
        if self.frames.len() > depth {
            self.run(depth)?;
        }
        self.pop()
    }

    // === Closures and upvalues ===

    fn make_closure(&mut self) -> Result<(), Unwind> {
        let count = self.read_u8()? as usize;
        let mut upvalues = Vec::with_capacity(count);
        for _ in 0..count {
            let index = self.read_u8()? as usize;
            let is_local = self.read_u8()? != 0;
            if is_local {
                let slot = self.frame().base + index;
                let upvalue = self.capture_upvalue(slot);
                upvalues.push(upvalue);
            } else {
                let closure = self
                    .frame()
                    .closure
                    .ok_or_else(|| Unwind::Fatal("corrupted bytecode: Closure".to_string()))?;
                let upvalue = self
                    .heap
                    .closure(closure)
                    .upvalues
                    .get(index)
                    .copied()
                    .ok_or_else(|| Unwind::Fatal("corrupted bytecode: upvalue index".to_string()))?;
                upvalues.push(upvalue);
            }
        }

        let function = self.peek(0)?;
        let Some(function_id) = function.as_obj() else {
            return Err(Unwind::Fatal("corrupted bytecode: Closure operand".to_string()));
        };
        let closure = self.heap.alloc_closure(function_id, upvalues);
        self.pop()?;
        self.push(Value::Obj(closure))
    }

    /// Find or create the open upvalue for a stack slot, keeping the
    /// list ordered by descending slot and free of duplicates.
    fn capture_upvalue(&mut self, slot: usize) -> ObjId {
        let mut insert_at = self.open_upvalues.len();
        for (i, &id) in self.open_upvalues.iter().enumerate() {
            match self.heap.upvalue(id) {
                UpvalueObj::Open(existing) if existing == slot => return id,
                UpvalueObj::Open(existing) if existing < slot => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        let id = self.heap.alloc_upvalue(slot);
        self.open_upvalues.insert(insert_at, id);
        id
    }

    /// Close every open upvalue at or above `from_slot`; they sit at
    /// the front of the descending list.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&id) = self.open_upvalues.first() {
            let UpvalueObj::Open(slot) = self.heap.upvalue(id) else {
                break;
            };
            if slot < from_slot {
                break;
            }
            *self.heap.upvalue_mut(id) = UpvalueObj::Closed(self.stack[slot]);
            self.open_upvalues.remove(0);
        }
    }

    fn close_upvalue_at(&mut self, slot: usize) {
        for i in 0..self.open_upvalues.len() {
            let id = self.open_upvalues[i];
            if let UpvalueObj::Open(existing) = self.heap.upvalue(id) {
                if existing == slot {
                    *self.heap.upvalue_mut(id) = UpvalueObj::Closed(self.stack[slot]);
                    self.open_upvalues.remove(i);
                    return;
                }
            }
        }
    }

    // === Classes ===

    fn inherit(&mut self) -> Result<(), Unwind> {
        let superclass = self.pop()?;
        let class_value = self.peek(0)?;
        let Some(super_id) = superclass.as_obj().filter(|&id| self.is_class(id)) else {
            return Err(self.type_error_unwind("superclass must be a class"));
        };
        let Some(class_id) = class_value.as_obj().filter(|&id| self.is_class(id)) else {
            return Err(Unwind::Fatal("corrupted bytecode: Inherit".to_string()));
        };

        let methods: Vec<(ObjId, u64, Value)> = self
            .heap
            .class(super_id)
            .methods
            .iter()
            .map(|(k, v)| (k, self.heap.str_hash(k), v))
            .collect();
        let getters: Vec<(ObjId, u64, Value)> = self
            .heap
            .class(super_id)
            .getters
            .iter()
            .map(|(k, v)| (k, self.heap.str_hash(k), v))
            .collect();

        let class = self.heap.class_mut(class_id);
        for (key, hash, value) in methods {
            class.methods.set(key, hash, value);
        }
        let class = self.heap.class_mut(class_id);
        for (key, hash, value) in getters {
            class.getters.set(key, hash, value);
        }
        self.heap.class_mut(class_id).superclass = Some(super_id);
        Ok(())
    }

    fn match_class(&mut self) -> Result<(), Unwind> {
        let pattern = self.pop()?;
        let value = self.peek(0)?;

        let Some(pattern_id) = pattern.as_obj() else {
            return Err(Unwind::Fatal("corrupted bytecode: MatchClass".to_string()));
        };

        let matched = match self.heap.get(pattern_id) {
            Obj::Class(_) => self.is_instance_of(value, pattern_id),
            Obj::Str(_) => {
                // Resolve the pattern name at match time; an undefined
                // name matches anything, which is what makes
                // `catch e -> ...` a catch-all with a binding.
                let module = self.current_module();
                match self.lookup_global_id(module, pattern_id) {
                    Some(Value::Obj(class_id)) if self.is_class(class_id) => {
                        self.is_instance_of(value, class_id)
                    }
                    Some(_) => {
                        let text = self.heap.str_chars(pattern_id).to_string();
                        return Err(self.type_error_unwind(&format!(
                            "pattern '{}' does not name a class",
                            text
                        )));
                    }
                    None => true,
                }
            }
            _ => return Err(Unwind::Fatal("corrupted bytecode: MatchClass".to_string())),
        };

        self.push(Value::Bool(matched))
    }

    pub(crate) fn class_of(&self, value: Value) -> Option<ObjId> {
        match value {
            Value::Int(_) => Some(self.core.int),
            Value::Float(_) => Some(self.core.float),
            Value::Bool(_) => Some(self.core.bool_),
            Value::Null => None,
            Value::Obj(id) => match self.heap.get(id) {
                Obj::Str(_) => Some(self.core.string),
                Obj::Instance(instance) => Some(instance.class),
                Obj::NativeInstance(instance) => Some(instance.class),
                _ => None,
            },
        }
    }

    fn is_instance_of(&self, value: Value, class: ObjId) -> bool {
        let mut current = self.class_of(value);
        while let Some(id) = current {
            if id == class {
                return true;
            }
            current = self.heap.class(id).superclass;
        }
        false
    }

    fn is_class(&self, id: ObjId) -> bool {
        matches!(self.heap.get(id), Obj::Class(_))
    }

    pub(crate) fn find_method(&self, class: ObjId, name: ObjId) -> Option<ObjId> {
        let hash = self.heap.str_hash(name);
        let mut current = Some(class);
        while let Some(id) = current {
            if let Some(method) = self.heap.class(id).methods.get(name, hash) {
                return method.as_obj();
            }
            current = self.heap.class(id).superclass;
        }
        None
    }

    fn find_getter(&self, class: ObjId, name: ObjId) -> Option<ObjId> {
        let hash = self.heap.str_hash(name);
        let mut current = Some(class);
        while let Some(id) = current {
            if let Some(getter) = self.heap.class(id).getters.get(name, hash) {
                return getter.as_obj();
            }
            current = self.heap.class(id).superclass;
        }
        None
    }

    // === Modules ===

    fn import_module(&mut self) -> Result<(), Unwind> {
        let path = self.pop_string("import path")?;

        if let Some(&module) = self.modules.get(&path) {
            return self.push(Value::Obj(module));
        }

        let path_text = self.heap.str_chars(path).to_string();
        debug!(module = %path_text, "importing module");

        if let Some(&main) = self.native_modules.get(&path_text) {
            let module = self.heap.alloc_module();
            self.modules.insert(path, module);
            self.push(Value::Obj(module))?;
            let pin_mark = self.heap.pin_count();
            let base = self.top;
            let result = {
                let mut ctx = NativeCtx::new(self, base, 0, Some(module));
                main(&mut ctx)
            };
            self.heap.truncate_pins(pin_mark);
            return match result {
                Ok(_) => Ok(()),
                Err(VmException::Thrown(value)) => Err(Unwind::Exception(value)),
                Err(VmException::Fatal(message)) => Err(Unwind::Fatal(message)),
            };
        }

        let Ok((resolved, source)) = self.resolver.read(&path_text) else {
            return Err(
                self.type_error_unwind(&format!("cannot find module '{}'", path_text))
            );
        };

        let directory = resolved
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default();
        let mut map = SourceMap::new(source, resolved.display().to_string(), directory);

        let lexed = {
            let source_text = map.source.clone();
            Lexer::new(&source_text).scan(&mut map, self.reporter.as_mut())
        };
        if lexed.had_error {
            return Err(
                self.type_error_unwind(&format!("failed to import module '{}'", path_text))
            );
        }
        let outcome = Parser::new(&lexed.tokens, &map).parse(self.reporter.as_mut());
        if outcome.had_error {
            return Err(
                self.type_error_unwind(&format!("failed to import module '{}'", path_text))
            );
        }
        let compiled =
            Compiler::compile(&outcome.ast, &map, &mut self.heap, self.reporter.as_mut());
        if compiled.had_error {
            return Err(
                self.type_error_unwind(&format!("failed to import module '{}'", path_text))
            );
        }

        // Install before executing so cyclic imports resolve to the
        // partially initialized module instead of recursing.
        self.modules.insert(path, compiled.module);
        self.push(Value::Obj(compiled.module))?;
        self.push(Value::Obj(compiled.function))?;
        self.call_object(compiled.function, 0, self.top, 1, false, true)
    }

    // === Globals ===

    pub(crate) fn current_module(&self) -> Option<ObjId> {
        self.frames.last().map(|frame| self.heap.function(frame.function).module)
    }

    fn current_module_id(&self) -> Result<ObjId, Unwind> {
        self.current_module()
            .ok_or_else(|| Unwind::Fatal("no module in scope".to_string()))
    }

    fn lookup_global_id(&self, module: Option<ObjId>, name: ObjId) -> Option<Value> {
        let hash = self.heap.str_hash(name);
        if let Some(module) = module {
            if let Some(value) = self.heap.module(module).globals.get(name, hash) {
                return Some(value);
            }
        }
        self.builtins.get(name, hash)
    }

    pub(crate) fn lookup_global_str(&self, module: Option<ObjId>, name: &str) -> Option<Value> {
        let hash = hash_bytes(name.as_bytes());
        if let Some(module) = module {
            let found = self
                .heap
                .module(module)
                .globals
                .get_slice(name, hash, |id| self.heap.str_chars(id));
            if found.is_some() {
                return found;
            }
        }
        self.builtins.get_slice(name, hash, |id| self.heap.str_chars(id))
    }

    /// Create or overwrite a binding; targets the builtins table when
    /// no module is in scope.
    pub(crate) fn define_global_str(&mut self, module: Option<ObjId>, name: &str, value: Value) {
        let id = self.heap.alloc_string(name);
        let hash = self.heap.str_hash(id);
        match module {
            Some(module) => {
                self.heap.module_mut(module).globals.set(id, hash, value);
            }
            None => {
                self.builtins.set(id, hash, value);
            }
        }
    }

    // === Values ===

    fn as_string(&self, value: Value) -> Option<ObjId> {
        value.as_obj().filter(|&id| matches!(self.heap.get(id), Obj::Str(_)))
    }

    fn pop_string(&mut self, what: &str) -> Result<ObjId, Unwind> {
        let value = self.pop()?;
        self.as_string(value)
            .ok_or_else(|| Unwind::Fatal(format!("corrupted bytecode: expected {}", what)))
    }

    /// Hash through the `$hash` protocol: ints and strings hash
    /// natively, instances call their override.
    pub(crate) fn hash_value(&mut self, value: Value) -> Result<u64, Unwind> {
        match value {
            Value::Int(v) => Ok(hash_bytes(&v.to_le_bytes())),
            Value::Obj(id) => match self.heap.get(id) {
                Obj::Str(s) => Ok(s.hash),
                Obj::Instance(_) | Obj::NativeInstance(_) => {
                    let class = self.class_of(value).expect("instances always have a class");
                    let Some(method) = self.find_method(class, self.specials.hash) else {
                        return Err(self.type_error_unwind("value is not hashable"));
                    };
                    match self.call_and_return(Value::Obj(method), &[value])? {
                        Value::Int(v) => Ok(v as u64),
                        _ => Err(self.type_error_unwind("$hash() has to return an 'Int'")),
                    }
                }
                _ => Err(self.type_error_unwind("value is not hashable")),
            },
            _ => Err(self.type_error_unwind("value is not hashable")),
        }
    }

    /// Render a value for `put`, honoring `$str` overrides on
    /// instances.
    pub(crate) fn display_value(&mut self, value: Value) -> Result<String, Unwind> {
        let id = match value {
            Value::Int(v) => return Ok(v.to_string()),
            Value::Float(v) => return Ok(v.to_string()),
            Value::Bool(v) => return Ok(v.to_string()),
            Value::Null => return Ok("null".to_string()),
            Value::Obj(id) => id,
        };

        enum Shape {
            Instance,
            Named(&'static str, ObjId),
            Plain(&'static str),
        }

        let shape = match self.heap.get(id) {
            Obj::Str(s) => return Ok(s.chars.to_string()),
            Obj::Instance(_) | Obj::NativeInstance(_) => Shape::Instance,
            Obj::Function(f) => Shape::Named("fn", f.name),
            Obj::Closure(c) => {
                let name = self.heap.function(c.function).name;
                Shape::Named("fn", name)
            }
            Obj::NativeFunction(f) => Shape::Named("native fn", f.name),
            Obj::Class(c) => Shape::Named("class", c.name),
            Obj::Module(_) => Shape::Plain("<module>"),
            Obj::BoundFunction(_) => Shape::Plain("<bound method>"),
            Obj::Upvalue(_) => Shape::Plain("<upvalue>"),
        };

        match shape {
            Shape::Plain(text) => Ok(text.to_string()),
            Shape::Named(kind, name) => {
                let name = self.heap.str_chars(name);
                if name.is_empty() {
                    Ok(format!("<{}>", kind))
                } else {
                    Ok(format!("<{} {}>", kind, name))
                }
            }
            Shape::Instance => {
                let class = self.class_of(value).expect("instances always have a class");
                if let Some(method) = self.find_method(class, self.specials.str_) {
                    match self.call_and_return(Value::Obj(method), &[value])? {
                        Value::Obj(sid) if matches!(self.heap.get(sid), Obj::Str(_)) => {
                            Ok(self.heap.str_chars(sid).to_string())
                        }
                        other => self.display_plain(other),
                    }
                } else {
                    let name = self.heap.str_chars(self.heap.class(class).name);
                    Ok(format!("<{} instance>", name))
                }
            }
        }
    }

    /// Non-dispatching fallback used when `$str` returns a non-string.
    fn display_plain(&self, value: Value) -> Result<String, Unwind> {
        Ok(match value {
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Bool(v) => v.to_string(),
            Value::Null => "null".to_string(),
            Value::Obj(id) => format!("<{}>", self.heap.get(id).type_name()),
        })
    }

    // === Errors ===

    pub(crate) fn make_error(&mut self, class: ObjId, message: &str) -> Value {
        let instance = self.heap.alloc_instance(class);
        let text = self.heap.alloc_string(message);
        let hash = self.heap.str_hash(self.specials.msg);
        self.heap
            .instance_mut(instance)
            .fields
            .set(self.specials.msg, hash, Value::Obj(text));
        Value::Obj(instance)
    }

    pub(crate) fn make_type_error(&mut self, message: &str) -> Value {
        self.make_error(self.core.type_error, message)
    }

    pub(crate) fn make_error_by_name(&mut self, class_name: &str, message: &str) -> Value {
        match self.lookup_global_str(None, class_name) {
            Some(Value::Obj(id)) if self.is_class(id) => self.make_error(id, message),
            _ => self.make_type_error(message),
        }
    }

    fn type_error_unwind(&mut self, message: &str) -> Unwind {
        Unwind::Exception(self.make_type_error(message))
    }

    fn name_error_unwind(&mut self, message: &str) -> Unwind {
        Unwind::Exception(self.make_error(self.core.name_error, message))
    }

    // === Frames ===

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("instruction executed with no call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("instruction executed with no call frame")
    }

    fn frame_upvalue(&self, index: usize) -> Result<ObjId, Unwind> {
        let closure = self
            .frame()
            .closure
            .ok_or_else(|| Unwind::Fatal("corrupted bytecode: upvalue access".to_string()))?;
        self.heap
            .closure(closure)
            .upvalues
            .get(index)
            .copied()
            .ok_or_else(|| Unwind::Fatal("corrupted bytecode: upvalue index".to_string()))
    }

    // === Garbage collection ===

    /// The safepoint: seed every root, trace, sweep.
    fn collect_garbage(&mut self) {
        for i in 0..self.top {
            self.heap.mark_value(self.stack[i]);
        }
        for i in 0..self.frames.len() {
            let frame = self.frames[i];
            self.heap.mark_obj(frame.function);
            if let Some(closure) = frame.closure {
                self.heap.mark_obj(closure);
            }
        }
        for i in 0..self.open_upvalues.len() {
            let id = self.open_upvalues[i];
            self.heap.mark_obj(id);
        }
        let module_entries: Vec<(ObjId, ObjId)> =
            self.modules.iter().map(|(&k, &v)| (k, v)).collect();
        for (key, value) in module_entries {
            self.heap.mark_obj(key);
            self.heap.mark_obj(value);
        }
        self.heap.mark_external_table(&self.builtins);

        let Specials {
            init,
            add,
            sub,
            mul,
            div,
            modulo,
            lt,
            le,
            gt,
            ge,
            get_index,
            set_index,
            hash,
            iter,
            next,
            str_,
            msg,
        } = self.specials;
        for id in [
            init, add, sub, mul, div, modulo, lt, le, gt, ge, get_index, set_index, hash, iter,
            next, str_, msg,
        ] {
            self.heap.mark_obj(id);
        }

        let CoreClasses {
            list,
            list_iterator,
            dict,
            range,
            string,
            int,
            float,
            bool_,
            name_error,
            type_error,
            stop_iteration,
        } = self.core;
        for id in [
            list,
            list_iterator,
            dict,
            range,
            string,
            int,
            float,
            bool_,
            name_error,
            type_error,
            stop_iteration,
        ] {
            self.heap.mark_obj(id);
        }

        self.heap.trace();
        self.heap.sweep();
    }

    #[cfg(test)]
    pub(crate) fn open_upvalue_slots(&self) -> Vec<usize> {
        self.open_upvalues
            .iter()
            .filter_map(|&id| match self.heap.upvalue(id) {
                UpvalueObj::Open(slot) => Some(slot),
                UpvalueObj::Closed(_) => None,
            })
            .collect()
    }
}

fn as_float(value: Value) -> Option<f64> {
    match value {
        Value::Int(v) => Some(v as f64),
        Value::Float(v) => Some(v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_keeps_open_upvalues_sorted_descending() {
        let mut vm = Vm::new();
        vm.capture_upvalue(3);
        vm.capture_upvalue(1);
        vm.capture_upvalue(5);
        vm.capture_upvalue(3); // duplicate shares the existing upvalue
        assert_eq!(vm.open_upvalue_slots(), vec![5, 3, 1]);
    }

    #[test]
    fn close_upvalues_closes_slots_at_or_above_the_boundary() {
        let mut vm = Vm::new();
        vm.stack[1] = Value::Int(10);
        vm.stack[4] = Value::Int(40);
        vm.top = 6;
        vm.capture_upvalue(1);
        let high = vm.capture_upvalue(4);
        vm.close_upvalues(2);
        assert_eq!(vm.open_upvalue_slots(), vec![1]);
        assert!(matches!(vm.heap.upvalue(high), UpvalueObj::Closed(Value::Int(40))));
    }

    #[test]
    fn numeric_promotion_produces_floats() {
        let mut vm = Vm::new();
        vm.push(Value::Int(1)).unwrap();
        vm.push(Value::Float(2.5)).unwrap();
        // Execute the fast path directly.
        vm.frames.push(CallFrame {
            ip: 0,
            base: 0,
            closure: None,
            function: {
                let module = vm.heap.alloc_module();
                let name = vm.heap.alloc_string("t");
                vm.heap.alloc_function(name, 0, module)
            },
            pop_extra: 0,
            is_initializer: false,
            discard_return: false,
        });
        vm.arithmetic(Op::Add).unwrap();
        assert_eq!(vm.pop().unwrap(), Value::Float(3.5));
    }
}
