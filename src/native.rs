// File: src/native.rs
//
// The interface native (Rust-implemented) functions program against.
// A native receives a `NativeCtx` giving pinned access to its
// arguments, allocation helpers, globals, and re-entrant calls into
// the VM. Objects allocated through the context stay pinned until the
// native returns, which is the contract that keeps them alive across
// a collection triggered by a nested call.

use crate::value::{NativePayload, Obj, ObjId, Value};
use crate::vm::Vm;

/// Exception carrier crossing the native boundary. Natives construct
/// the `Thrown` side; `Fatal` only passes through from nested VM
/// execution.
#[derive(Debug)]
pub enum VmException {
    Thrown(Value),
    Fatal(String),
}

pub type NativeFn = fn(&mut NativeCtx) -> Result<Value, VmException>;

pub type NativeResult = Result<Value, VmException>;

pub struct NativeCtx<'a> {
    pub vm: &'a mut Vm,
    /// Stack index of the first argument.
    base: usize,
    argc: usize,
    /// Module whose globals `get_global`/`set_global`/`create_*`
    /// target; set for native module mains, otherwise the calling
    /// function's module.
    module: Option<ObjId>,
}

impl<'a> NativeCtx<'a> {
    pub(crate) fn new(vm: &'a mut Vm, base: usize, argc: usize, module: Option<ObjId>) -> Self {
        NativeCtx { vm, base, argc, module }
    }

    pub fn argc(&self) -> usize {
        self.argc
    }

    /// The i-th argument; for methods, argument 0 is the receiver `$`.
    /// Arguments live on the VM stack, so they are already GC roots.
    pub fn arg(&self, index: usize) -> Value {
        assert!(index < self.argc, "native argument index out of range");
        self.vm.stack_at(self.base + index)
    }

    pub fn int_arg(&mut self, index: usize) -> Result<i64, VmException> {
        match self.arg(index) {
            Value::Int(v) => Ok(v),
            _ => Err(self.type_error("expected an 'Int'")),
        }
    }

    pub fn num_arg(&mut self, index: usize) -> Result<f64, VmException> {
        match self.arg(index) {
            Value::Int(v) => Ok(v as f64),
            Value::Float(v) => Ok(v),
            _ => Err(self.type_error("expected a number")),
        }
    }

    pub fn str_arg(&mut self, index: usize) -> Result<ObjId, VmException> {
        if let Value::Obj(id) = self.arg(index) {
            if matches!(self.vm.heap.get(id), Obj::Str(_)) {
                return Ok(id);
            }
        }
        Err(self.type_error("expected a 'String'"))
    }

    /// The receiver's native payload, downcast to its concrete type.
    pub fn payload<T: NativePayload + 'static>(&self, index: usize) -> Result<&T, VmException> {
        let Some(id) = self.arg(index).as_obj() else {
            return Err(payload_mismatch());
        };
        match self.vm.heap.get(id) {
            Obj::NativeInstance(instance) => {
                instance.payload.as_any().downcast_ref::<T>().ok_or_else(payload_mismatch)
            }
            _ => Err(payload_mismatch()),
        }
    }

    pub fn payload_mut<T: NativePayload + 'static>(
        &mut self,
        index: usize,
    ) -> Result<&mut T, VmException> {
        let Some(id) = self.arg(index).as_obj() else {
            return Err(payload_mismatch());
        };
        match self.vm.heap.get_mut(id) {
            Obj::NativeInstance(instance) => {
                instance.payload.as_any_mut().downcast_mut::<T>().ok_or_else(payload_mismatch)
            }
            _ => Err(payload_mismatch()),
        }
    }

    pub fn instance_arg(&self, index: usize) -> Result<ObjId, VmException> {
        if let Value::Obj(id) = self.arg(index) {
            if matches!(self.vm.heap.get(id), Obj::NativeInstance(_) | Obj::Instance(_)) {
                return Ok(id);
            }
        }
        Err(VmException::Fatal("native method called on a non-instance".to_string()))
    }

    /// Allocate and pin a string.
    pub fn alloc_string(&mut self, chars: &str) -> Value {
        let id = self.vm.heap.alloc_string(chars);
        let value = Value::Obj(id);
        self.vm.heap.pin(value);
        value
    }

    pub fn null(&self) -> Value {
        Value::Null
    }

    /// Call a Vesper value with the given arguments, running nested
    /// bytecode to completion.
    pub fn call(&mut self, callee: Value, args: &[Value]) -> NativeResult {
        self.vm.call_and_return(callee, args).map_err(VmException::from_unwind)
    }

    /// Render a value the way `put` would, honoring `$str` overrides.
    pub fn display(&mut self, value: Value) -> Result<String, VmException> {
        self.vm.display_value(value).map_err(VmException::from_unwind)
    }

    /// Hash a value through the `$hash` protocol.
    pub fn hash(&mut self, value: Value) -> Result<u64, VmException> {
        self.vm.hash_value(value).map_err(VmException::from_unwind)
    }

    pub fn get_global(&mut self, name: &str) -> Option<Value> {
        let module = self.module.or_else(|| self.vm.current_module());
        self.vm.lookup_global_str(module, name)
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        let module = self.module.or_else(|| self.vm.current_module());
        self.vm.define_global_str(module, name, value);
    }

    /// Register a native function in the target module's globals.
    pub fn create_function(&mut self, name: &str, arity: u32, function: NativeFn) {
        let module = self.module.or_else(|| self.vm.current_module());
        let name_id = self.vm.heap.alloc_string(name);
        let id = self.vm.heap.alloc_native_function(name_id, arity, function, module);
        self.vm.define_global_str(module, name, Value::Obj(id));
    }

    /// Exceptions raised by builtins; the payload becomes the
    /// language-level thrown value.
    pub fn type_error(&mut self, message: &str) -> VmException {
        VmException::Thrown(self.vm.make_type_error(message))
    }

    pub fn throw_class(&mut self, class_name: &str, message: &str) -> VmException {
        VmException::Thrown(self.vm.make_error_by_name(class_name, message))
    }
}

fn payload_mismatch() -> VmException {
    VmException::Fatal("native payload type mismatch".to_string())
}

impl VmException {
    pub(crate) fn from_unwind(unwind: crate::vm::Unwind) -> Self {
        match unwind {
            crate::vm::Unwind::Exception(value) => VmException::Thrown(value),
            crate::vm::Unwind::Uncaught(value, _) => VmException::Thrown(value),
            crate::vm::Unwind::Fatal(message) => VmException::Fatal(message),
        }
    }
}
