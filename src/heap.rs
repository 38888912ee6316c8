// File: src/heap.rs
//
// Managed heap for the Vesper VM: owns every runtime object, interns
// strings, holds the constant pool shared by the compiler and VM, and
// reclaims garbage with an allocation-triggered mark-and-sweep pass.
// Objects live in a slot vector addressed by `ObjId`; freed slots are
// recycled through a free list, so handles are stable for an object's
// whole lifetime.

use crate::native::NativeFn;
use crate::table::Table;
use crate::value::{
    hash_bytes, BoundFunctionObj, ClassObj, ClosureObj, FunctionObj, InstanceObj, ModuleObj,
    NativeFunctionObj, NativeInstanceObj, NativePayload, Obj, ObjId, PayloadCtor, StrObj,
    UpvalueObj, Value,
};
use ahash::AHashMap;
use std::rc::Rc;
use tracing::debug;

/// Collect once this many new objects have been allocated since the
/// last cycle (doubled after every cycle that stays busy).
const INITIAL_GC_BUDGET: usize = 1024;

/// Constant-pool dedup key for the value shapes worth deduplicating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConstKey {
    Int(i64),
    Bool(bool),
    Null,
    Str(ObjId),
}

pub struct Heap {
    slots: Vec<Option<Obj>>,
    marks: Vec<bool>,
    free: Vec<u32>,
    /// Canonical string per byte sequence. Entries are weak in the
    /// sense that the sweep removes a string here before freeing it.
    interned: AHashMap<Rc<str>, ObjId>,
    /// Constant pool shared by the compiler and VM; always a GC root.
    constants: Vec<Value>,
    const_index: AHashMap<ConstKey, u32>,
    /// Values pinned by native code and the module loader so fresh
    /// objects survive allocations that happen before they reach the
    /// stack or a table.
    pins: Vec<Value>,
    gray: Vec<ObjId>,
    live: usize,
    allocated_since_gc: usize,
    gc_budget: usize,
    /// Collect at every safepoint; used by tests and `--gc-stress`.
    pub stress: bool,
}

/// Handed to `NativePayload::trace` implementations during marking.
pub struct Tracer<'a> {
    marks: &'a mut Vec<bool>,
    gray: &'a mut Vec<ObjId>,
}

impl Tracer<'_> {
    pub fn mark_obj(&mut self, id: ObjId) {
        let index = id.0 as usize;
        if !self.marks[index] {
            self.marks[index] = true;
            self.gray.push(id);
        }
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(id) = value {
            self.mark_obj(id);
        }
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_obj(key);
            self.mark_value(value);
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            marks: Vec::new(),
            free: Vec::new(),
            interned: AHashMap::new(),
            constants: Vec::new(),
            const_index: AHashMap::new(),
            pins: Vec::new(),
            gray: Vec::new(),
            live: 0,
            allocated_since_gc: 0,
            gc_budget: INITIAL_GC_BUDGET,
            stress: false,
        }
    }

    // === Allocation ===

    fn insert(&mut self, obj: Obj) -> ObjId {
        self.allocated_since_gc += 1;
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(obj);
                ObjId(index)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Some(obj));
                self.marks.push(false);
                ObjId(index)
            }
        }
    }

    /// Canonical handle for the given bytes; allocates only on the
    /// first sighting.
    pub fn alloc_string(&mut self, chars: &str) -> ObjId {
        if let Some(&id) = self.interned.get(chars) {
            return id;
        }
        let shared: Rc<str> = Rc::from(chars);
        let obj = StrObj {
            chars: Rc::clone(&shared),
            char_len: chars.chars().count(),
            hash: hash_bytes(chars.as_bytes()),
        };
        let id = self.insert(Obj::Str(obj));
        self.interned.insert(shared, id);
        id
    }

    pub fn alloc_function(&mut self, name: ObjId, arity: u32, module: ObjId) -> ObjId {
        self.insert(Obj::Function(FunctionObj {
            name,
            arity,
            upvalue_count: 0,
            chunk: Default::default(),
            module,
        }))
    }

    pub fn alloc_native_function(
        &mut self,
        name: ObjId,
        arity: u32,
        function: NativeFn,
        module: Option<ObjId>,
    ) -> ObjId {
        self.insert(Obj::NativeFunction(NativeFunctionObj { name, arity, function, module }))
    }

    pub fn alloc_class(&mut self, name: ObjId, payload_ctor: Option<PayloadCtor>) -> ObjId {
        self.insert(Obj::Class(ClassObj {
            name,
            methods: Table::new(),
            getters: Table::new(),
            superclass: None,
            payload_ctor,
        }))
    }

    pub fn alloc_instance(&mut self, class: ObjId) -> ObjId {
        self.insert(Obj::Instance(InstanceObj { class, fields: Table::new() }))
    }

    pub fn alloc_native_instance(&mut self, class: ObjId, payload: Box<dyn NativePayload>) -> ObjId {
        self.insert(Obj::NativeInstance(NativeInstanceObj { class, payload }))
    }

    pub fn alloc_closure(&mut self, function: ObjId, upvalues: Vec<ObjId>) -> ObjId {
        self.insert(Obj::Closure(ClosureObj { function, upvalues }))
    }

    pub fn alloc_upvalue(&mut self, slot: usize) -> ObjId {
        self.insert(Obj::Upvalue(UpvalueObj::Open(slot)))
    }

    pub fn alloc_bound_function(&mut self, receiver: Value, callable: ObjId) -> ObjId {
        self.insert(Obj::BoundFunction(BoundFunctionObj { receiver, callable }))
    }

    pub fn alloc_module(&mut self) -> ObjId {
        self.insert(Obj::Module(ModuleObj { globals: Table::new(), loaded: false }))
    }

    // === Constant pool ===

    /// Add a value to the shared constant pool, deduplicating ints,
    /// bools, null, and interned objects. Floats always get a fresh
    /// slot.
    pub fn add_constant(&mut self, value: Value) -> u32 {
        let key = match value {
            Value::Int(v) => Some(ConstKey::Int(v)),
            Value::Bool(v) => Some(ConstKey::Bool(v)),
            Value::Null => Some(ConstKey::Null),
            Value::Obj(id) if matches!(self.get(id), Obj::Str(_)) => Some(ConstKey::Str(id)),
            _ => None,
        };
        if let Some(key) = key {
            if let Some(&index) = self.const_index.get(&key) {
                return index;
            }
            let index = self.constants.len() as u32;
            self.constants.push(value);
            self.const_index.insert(key, index);
            return index;
        }
        let index = self.constants.len() as u32;
        self.constants.push(value);
        index
    }

    /// Intern a string and register it as a constant in one step.
    pub fn string_constant(&mut self, chars: &str) -> (u32, ObjId) {
        let id = self.alloc_string(chars);
        let index = self.add_constant(Value::Obj(id));
        (index, id)
    }

    pub fn constant(&self, index: u32) -> Option<Value> {
        self.constants.get(index as usize).copied()
    }

    pub fn constant_count(&self) -> usize {
        self.constants.len()
    }

    // === Pins ===

    /// Keep `value` alive across allocations. Returns a watermark for
    /// `truncate_pins`.
    pub fn pin(&mut self, value: Value) -> usize {
        self.pins.push(value);
        self.pins.len() - 1
    }

    pub fn pin_count(&self) -> usize {
        self.pins.len()
    }

    pub fn truncate_pins(&mut self, count: usize) {
        self.pins.truncate(count);
    }

    // === Accessors ===

    pub fn get(&self, id: ObjId) -> &Obj {
        self.slots[id.0 as usize].as_ref().expect("use of freed object")
    }

    pub fn get_mut(&mut self, id: ObjId) -> &mut Obj {
        self.slots[id.0 as usize].as_mut().expect("use of freed object")
    }

    pub fn str_chars(&self, id: ObjId) -> &str {
        match self.get(id) {
            Obj::Str(s) => &s.chars,
            other => panic!("expected string, found {}", other.type_name()),
        }
    }

    pub fn string(&self, id: ObjId) -> &StrObj {
        match self.get(id) {
            Obj::Str(s) => s,
            other => panic!("expected string, found {}", other.type_name()),
        }
    }

    pub fn str_hash(&self, id: ObjId) -> u64 {
        self.string(id).hash
    }

    pub fn function(&self, id: ObjId) -> &FunctionObj {
        match self.get(id) {
            Obj::Function(f) => f,
            other => panic!("expected function, found {}", other.type_name()),
        }
    }

    pub fn function_mut(&mut self, id: ObjId) -> &mut FunctionObj {
        match self.get_mut(id) {
            Obj::Function(f) => f,
            other => panic!("expected function, found {}", other.type_name()),
        }
    }

    pub fn class(&self, id: ObjId) -> &ClassObj {
        match self.get(id) {
            Obj::Class(c) => c,
            other => panic!("expected class, found {}", other.type_name()),
        }
    }

    pub fn class_mut(&mut self, id: ObjId) -> &mut ClassObj {
        match self.get_mut(id) {
            Obj::Class(c) => c,
            other => panic!("expected class, found {}", other.type_name()),
        }
    }

    pub fn instance(&self, id: ObjId) -> &InstanceObj {
        match self.get(id) {
            Obj::Instance(i) => i,
            other => panic!("expected instance, found {}", other.type_name()),
        }
    }

    pub fn instance_mut(&mut self, id: ObjId) -> &mut InstanceObj {
        match self.get_mut(id) {
            Obj::Instance(i) => i,
            other => panic!("expected instance, found {}", other.type_name()),
        }
    }

    pub fn closure(&self, id: ObjId) -> &ClosureObj {
        match self.get(id) {
            Obj::Closure(c) => c,
            other => panic!("expected closure, found {}", other.type_name()),
        }
    }

    pub fn upvalue(&self, id: ObjId) -> UpvalueObj {
        match self.get(id) {
            Obj::Upvalue(u) => *u,
            other => panic!("expected upvalue, found {}", other.type_name()),
        }
    }

    pub fn upvalue_mut(&mut self, id: ObjId) -> &mut UpvalueObj {
        match self.get_mut(id) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.type_name()),
        }
    }

    pub fn module(&self, id: ObjId) -> &ModuleObj {
        match self.get(id) {
            Obj::Module(m) => m,
            other => panic!("expected module, found {}", other.type_name()),
        }
    }

    pub fn module_mut(&mut self, id: ObjId) -> &mut ModuleObj {
        match self.get_mut(id) {
            Obj::Module(m) => m,
            other => panic!("expected module, found {}", other.type_name()),
        }
    }

    pub fn native_instance(&self, id: ObjId) -> &NativeInstanceObj {
        match self.get(id) {
            Obj::NativeInstance(n) => n,
            other => panic!("expected native instance, found {}", other.type_name()),
        }
    }

    pub fn native_instance_mut(&mut self, id: ObjId) -> &mut NativeInstanceObj {
        match self.get_mut(id) {
            Obj::NativeInstance(n) => n,
            other => panic!("expected native instance, found {}", other.type_name()),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    // === Garbage collection ===

    /// True at a safepoint where the VM should run a cycle.
    pub fn wants_gc(&self) -> bool {
        self.stress || self.allocated_since_gc >= self.gc_budget
    }

    /// Seed the gray worklist with a root. The caller (the VM) is
    /// responsible for seeding every root before `trace`.
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(id) = value {
            self.mark_obj(id);
        }
    }

    pub fn mark_obj(&mut self, id: ObjId) {
        let index = id.0 as usize;
        if !self.marks[index] {
            self.marks[index] = true;
            self.gray.push(id);
        }
    }

    pub fn mark_external_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_obj(key);
            self.mark_value(value);
        }
    }

    fn mark_own_roots(&mut self) {
        for i in 0..self.constants.len() {
            let value = self.constants[i];
            self.mark_value(value);
        }
        for i in 0..self.pins.len() {
            let value = self.pins[i];
            self.mark_value(value);
        }
    }

    /// Drain the worklist, following each object's outgoing references.
    /// Iterative so deep object graphs cannot overflow the Rust stack.
    pub fn trace(&mut self) {
        self.mark_own_roots();

        let Heap { slots, marks, gray, .. } = self;
        let mut tracer = Tracer { marks, gray };

        while let Some(id) = tracer.gray.pop() {
            let Some(obj) = slots[id.0 as usize].as_ref() else {
                continue;
            };
            match obj {
                Obj::Str(_) => {}
                Obj::Function(f) => {
                    tracer.mark_obj(f.name);
                    tracer.mark_obj(f.module);
                }
                Obj::NativeFunction(f) => {
                    tracer.mark_obj(f.name);
                    if let Some(module) = f.module {
                        tracer.mark_obj(module);
                    }
                }
                Obj::Class(c) => {
                    tracer.mark_obj(c.name);
                    tracer.mark_table(&c.methods);
                    tracer.mark_table(&c.getters);
                    if let Some(superclass) = c.superclass {
                        tracer.mark_obj(superclass);
                    }
                }
                Obj::Instance(i) => {
                    tracer.mark_obj(i.class);
                    tracer.mark_table(&i.fields);
                }
                Obj::NativeInstance(n) => {
                    tracer.mark_obj(n.class);
                    n.payload.trace(&mut tracer);
                }
                Obj::Closure(c) => {
                    tracer.mark_obj(c.function);
                    for &upvalue in &c.upvalues {
                        tracer.mark_obj(upvalue);
                    }
                }
                Obj::Upvalue(u) => {
                    if let UpvalueObj::Closed(value) = u {
                        tracer.mark_value(*value);
                    }
                }
                Obj::BoundFunction(b) => {
                    tracer.mark_value(b.receiver);
                    tracer.mark_obj(b.callable);
                }
                Obj::Module(m) => {
                    tracer.mark_table(&m.globals);
                }
            }
        }
    }

    /// Free every unmarked slot and reset marks. Strings leave the
    /// intern pool before their storage goes away.
    pub fn sweep(&mut self) {
        let before = self.live;
        for index in 0..self.slots.len() {
            if self.marks[index] {
                self.marks[index] = false;
                continue;
            }
            if let Some(obj) = self.slots[index].take() {
                if let Obj::Str(s) = &obj {
                    self.interned.remove(&*s.chars);
                }
                self.free.push(index as u32);
                self.live -= 1;
            }
        }
        self.allocated_since_gc = 0;
        if self.live * 2 > self.gc_budget {
            self.gc_budget = self.live * 2;
        }
        debug!(live_before = before, live_after = self.live, "gc cycle");
    }

    pub fn interned_count(&self) -> usize {
        self.interned.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_bytes_intern_to_the_same_handle() {
        let mut heap = Heap::new();
        let a = heap.alloc_string("hello");
        let b = heap.alloc_string("hello");
        let c = heap.alloc_string("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.interned_count(), 2);
    }

    #[test]
    fn constants_deduplicate_ints_and_strings() {
        let mut heap = Heap::new();
        let a = heap.add_constant(Value::Int(42));
        let b = heap.add_constant(Value::Int(42));
        assert_eq!(a, b);
        let (c, _) = heap.string_constant("x");
        let (d, _) = heap.string_constant("x");
        assert_eq!(c, d);
        // Floats are not deduplicated.
        let e = heap.add_constant(Value::Float(1.0));
        let f = heap.add_constant(Value::Float(1.0));
        assert_ne!(e, f);
    }

    #[test]
    fn sweep_frees_unreachable_objects_and_prunes_the_intern_pool() {
        let mut heap = Heap::new();
        let keep = heap.alloc_string("keep");
        let _drop = heap.alloc_string("drop");
        assert_eq!(heap.interned_count(), 2);

        heap.mark_obj(keep);
        heap.trace();
        heap.sweep();

        assert_eq!(heap.interned_count(), 1);
        assert_eq!(heap.str_chars(keep), "keep");
        // Reallocating the dropped contents yields a fresh handle.
        let again = heap.alloc_string("drop");
        assert_eq!(heap.str_chars(again), "drop");
    }

    #[test]
    fn constants_and_pins_are_roots() {
        let mut heap = Heap::new();
        let (_, constant_str) = heap.string_constant("constant");
        let pinned = heap.alloc_string("pinned");
        let watermark = heap.pin_count();
        heap.pin(Value::Obj(pinned));

        heap.trace();
        heap.sweep();

        assert_eq!(heap.str_chars(constant_str), "constant");
        assert_eq!(heap.str_chars(pinned), "pinned");
        heap.truncate_pins(watermark);
    }

    #[test]
    fn slots_are_recycled_through_the_free_list() {
        let mut heap = Heap::new();
        let doomed = heap.alloc_string("doomed");
        let doomed_index = doomed.0;
        heap.trace();
        heap.sweep();
        let recycled = heap.alloc_string("recycled");
        assert_eq!(recycled.0, doomed_index);
    }

    #[test]
    fn trace_follows_closure_and_upvalue_edges() {
        let mut heap = Heap::new();
        let module = heap.alloc_module();
        let name = heap.alloc_string("f");
        let function = heap.alloc_function(name, 0, module);
        let captured = heap.alloc_string("captured");
        let upvalue = heap.alloc_upvalue(0);
        *heap.upvalue_mut(upvalue) = UpvalueObj::Closed(Value::Obj(captured));
        let closure = heap.alloc_closure(function, vec![upvalue]);

        heap.mark_obj(closure);
        heap.trace();
        heap.sweep();

        assert_eq!(heap.str_chars(captured), "captured");
        assert_eq!(heap.str_chars(name), "f");
        assert_eq!(heap.live_count(), 6);
    }

    #[test]
    fn stress_mode_requests_collection_at_every_safepoint() {
        let mut heap = Heap::new();
        heap.stress = true;
        assert!(heap.wants_gc());
    }
}
