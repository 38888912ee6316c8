// File: src/builtins.rs
//
// Core classes and native functions exposed to every Vesper program:
// List, ListIterator, Dict, Range, the value classes (String, Int,
// Float, Bool), the core error classes, `put`/`putln`, and the numeric
// helpers. Containers hold their elements in native payloads and
// report them to the collector through the payload trace hook.

use crate::heap::Tracer;
use crate::native::{NativeCtx, NativeFn, NativeResult, VmException};
use crate::value::{hash_bytes, NativePayload, Obj, ObjId, PayloadCtor, Value};
use crate::vm::{Unwind, Vm};
use std::any::Any;

// === Payloads ===

#[derive(Default)]
pub struct ListData {
    pub items: Vec<Value>,
}

impl NativePayload for ListData {
    fn trace(&self, tracer: &mut Tracer) {
        for &item in &self.items {
            tracer.mark_value(item);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Default)]
pub struct ListIterData {
    list: Option<ObjId>,
    index: usize,
}

impl NativePayload for ListIterData {
    fn trace(&self, tracer: &mut Tracer) {
        if let Some(list) = self.list {
            tracer.mark_obj(list);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Open-addressed map keyed by `$hash`-able values. No deletion
/// surface, so slots are either empty or occupied.
#[derive(Default)]
pub struct DictData {
    slots: Vec<Option<(u64, Value, Value)>>,
    len: usize,
}

impl DictData {
    const MAX_LOAD: f32 = 0.75;

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, hash: u64, key: Value) -> Option<Value> {
        if self.len == 0 {
            return None;
        }
        let mask = self.slots.len() - 1;
        let mut index = (hash as usize) & mask;
        loop {
            match &self.slots[index] {
                None => return None,
                Some((slot_hash, slot_key, value)) => {
                    if *slot_hash == hash && *slot_key == key {
                        return Some(*value);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    pub fn set(&mut self, hash: u64, key: Value, value: Value) {
        self.grow_if_needed();
        let mask = self.slots.len() - 1;
        let mut index = (hash as usize) & mask;
        loop {
            match &mut self.slots[index] {
                None => {
                    self.slots[index] = Some((hash, key, value));
                    self.len += 1;
                    return;
                }
                Some((slot_hash, slot_key, slot_value)) => {
                    if *slot_hash == hash && *slot_key == key {
                        *slot_value = value;
                        return;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    fn grow_if_needed(&mut self) {
        let capacity = self.slots.len();
        if capacity == 0 {
            self.slots = vec![None; 8];
            return;
        }
        if (self.len + 1) as f32 / capacity as f32 <= Self::MAX_LOAD {
            return;
        }
        let old = std::mem::replace(&mut self.slots, vec![None; capacity * 2]);
        self.len = 0;
        for slot in old.into_iter().flatten() {
            let (hash, key, value) = slot;
            self.set(hash, key, value);
        }
    }
}

impl NativePayload for DictData {
    fn trace(&self, tracer: &mut Tracer) {
        for slot in self.slots.iter().flatten() {
            let (_, key, value) = slot;
            tracer.mark_value(*key);
            tracer.mark_value(*value);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Default)]
pub struct RangeData {
    next: i64,
    stop: i64,
}

impl NativePayload for RangeData {
    fn trace(&self, _tracer: &mut Tracer) {}

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// === Installation ===

pub fn install(vm: &mut Vm) {
    vm.core.list = define_class(
        vm,
        "List",
        Some(list_payload as PayloadCtor),
        &[
            ("$iter", 1, list_iter as NativeFn),
            ("$get_index", 2, list_get_index),
            ("$set_index", 3, list_set_index),
            ("$str", 1, list_str),
            ("push", 2, list_push),
        ],
        &[("size", 1, list_size as NativeFn)],
    );
    vm.core.list_iterator = define_class(
        vm,
        "ListIterator",
        Some(list_iter_payload as PayloadCtor),
        &[("$init", 2, list_iterator_init as NativeFn), ("$next", 1, list_iterator_next)],
        &[],
    );
    vm.core.dict = define_class(
        vm,
        "Dict",
        Some(dict_payload as PayloadCtor),
        &[
            ("$get_index", 2, dict_get_index as NativeFn),
            ("$set_index", 3, dict_set_index),
        ],
        &[("size", 1, dict_size as NativeFn)],
    );
    vm.core.range = define_class(
        vm,
        "Range",
        Some(range_payload as PayloadCtor),
        &[
            ("$init", 3, range_init as NativeFn),
            ("$iter", 1, range_iter),
            ("$next", 1, range_next),
        ],
        &[],
    );
    // `range(a, b)` is the Range class itself under a friendlier name.
    let range_class = Value::Obj(vm.core.range);
    vm.define_builtin("range", range_class);

    vm.core.string = define_class(
        vm,
        "String",
        None,
        &[("len", 1, string_len as NativeFn), ("$hash", 1, string_hash)],
        &[],
    );
    vm.core.int = define_class(vm, "Int", None, &[("$hash", 1, int_hash as NativeFn)], &[]);
    vm.core.float = define_class(vm, "Float", None, &[], &[]);
    vm.core.bool_ = define_class(vm, "Bool", None, &[], &[]);

    vm.core.name_error = define_error_class(vm, "NameError");
    vm.core.type_error = define_error_class(vm, "TypeError");
    vm.core.stop_iteration = define_error_class(vm, "StopIteration");

    vm.define_native_function("put", 1, put);
    vm.define_native_function("putln", 1, putln);
    vm.define_native_function("floor", 1, num_floor);
    vm.define_native_function("ceil", 1, num_ceil);
    vm.define_native_function("round", 1, num_round);
    vm.define_native_function("pow", 2, num_pow);
    vm.define_native_function("sqrt", 1, num_sqrt);
    vm.define_native_function("is_inf", 1, num_is_inf);
    vm.define_native_function("is_nan", 1, num_is_nan);
    vm.define_native_function("sin", 1, num_sin);
    vm.define_native_function("cos", 1, num_cos);
    vm.define_native_function("tan", 1, num_tan);
}

fn list_payload() -> Box<dyn NativePayload> {
    Box::<ListData>::default()
}

fn list_iter_payload() -> Box<dyn NativePayload> {
    Box::<ListIterData>::default()
}

fn dict_payload() -> Box<dyn NativePayload> {
    Box::<DictData>::default()
}

fn range_payload() -> Box<dyn NativePayload> {
    Box::<RangeData>::default()
}

fn define_class(
    vm: &mut Vm,
    name: &str,
    payload_ctor: Option<PayloadCtor>,
    methods: &[(&str, u32, NativeFn)],
    getters: &[(&str, u32, NativeFn)],
) -> ObjId {
    let name_id = vm.heap.alloc_string(name);
    let class = vm.heap.alloc_class(name_id, payload_ctor);

    for &(method_name, arity, function) in methods {
        let method_name_id = vm.heap.alloc_string(method_name);
        let function_id = vm.heap.alloc_native_function(method_name_id, arity, function, None);
        let hash = vm.heap.str_hash(method_name_id);
        vm.heap.class_mut(class).methods.set(method_name_id, hash, Value::Obj(function_id));
    }
    for &(getter_name, arity, function) in getters {
        let getter_name_id = vm.heap.alloc_string(getter_name);
        let function_id = vm.heap.alloc_native_function(getter_name_id, arity, function, None);
        let hash = vm.heap.str_hash(getter_name_id);
        vm.heap.class_mut(class).getters.set(getter_name_id, hash, Value::Obj(function_id));
    }

    vm.define_builtin(name, Value::Obj(class));
    class
}

fn define_error_class(vm: &mut Vm, name: &str) -> ObjId {
    define_class(
        vm,
        name,
        None,
        &[("$init", 2, error_init as NativeFn), ("$str", 1, error_str)],
        &[],
    )
}

// === VM-facing container helpers (list/dict literals) ===

pub fn new_list(vm: &mut Vm, items: Vec<Value>) -> Value {
    let id = vm.heap.alloc_native_instance(vm.core.list, Box::new(ListData { items }));
    Value::Obj(id)
}

pub fn list_push_value(vm: &mut Vm, list: Value, value: Value) -> Result<(), Unwind> {
    let data = list.as_obj().and_then(|id| payload_mut::<ListData>(vm, id));
    match data {
        Some(data) => {
            data.items.push(value);
            Ok(())
        }
        None => Err(Unwind::Fatal("corrupted bytecode: ListPush".to_string())),
    }
}

pub fn new_dict(vm: &mut Vm) -> Value {
    let id = vm.heap.alloc_native_instance(vm.core.dict, Box::<DictData>::default());
    Value::Obj(id)
}

pub fn dict_set_value(vm: &mut Vm, dict: Value, key: Value, value: Value) -> Result<(), Unwind> {
    // The hash may run a user `$hash` method before the dict is
    // touched.
    let hash = vm.hash_value(key)?;
    let data = dict.as_obj().and_then(|id| payload_mut::<DictData>(vm, id));
    match data {
        Some(data) => {
            data.set(hash, key, value);
            Ok(())
        }
        None => Err(Unwind::Fatal("corrupted bytecode: DictPush".to_string())),
    }
}

fn payload_mut<'a, T: NativePayload + 'static>(vm: &'a mut Vm, id: ObjId) -> Option<&'a mut T> {
    match vm.heap.get_mut(id) {
        Obj::NativeInstance(instance) => instance.payload.as_any_mut().downcast_mut::<T>(),
        _ => None,
    }
}

// === List ===

fn list_iter(ctx: &mut NativeCtx) -> NativeResult {
    let list = ctx.instance_arg(0)?;
    let class = ctx.vm.core.list_iterator;
    let id = ctx
        .vm
        .heap
        .alloc_native_instance(class, Box::new(ListIterData { list: Some(list), index: 0 }));
    let value = Value::Obj(id);
    ctx.vm.heap.pin(value);
    Ok(value)
}

fn list_push(ctx: &mut NativeCtx) -> NativeResult {
    let value = ctx.arg(1);
    let data = ctx.payload_mut::<ListData>(0)?;
    data.items.push(value);
    Ok(Value::Null)
}

fn list_get_index(ctx: &mut NativeCtx) -> NativeResult {
    let index = ctx.int_arg(1)?;
    let data = ctx.payload::<ListData>(0)?;
    let len = data.items.len();
    let item = usize::try_from(index).ok().and_then(|i| data.items.get(i)).copied();
    match item {
        Some(item) => Ok(item),
        None => Err(ctx.type_error(&format!("list index {} out of range (size {})", index, len))),
    }
}

fn list_set_index(ctx: &mut NativeCtx) -> NativeResult {
    let index = ctx.int_arg(1)?;
    let value = ctx.arg(2);
    let data = ctx.payload_mut::<ListData>(0)?;
    let len = data.items.len();
    match usize::try_from(index).ok().filter(|&i| i < len) {
        Some(i) => {
            data.items[i] = value;
            Ok(value)
        }
        None => Err(ctx.type_error(&format!("list index {} out of range (size {})", index, len))),
    }
}

fn list_size(ctx: &mut NativeCtx) -> NativeResult {
    let data = ctx.payload::<ListData>(0)?;
    Ok(Value::Int(data.items.len() as i64))
}

fn list_str(ctx: &mut NativeCtx) -> NativeResult {
    let items = ctx.payload::<ListData>(0)?.items.clone();
    let mut out = String::from("[");
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&ctx.display(item)?);
    }
    out.push(']');
    Ok(ctx.alloc_string(&out))
}

// === ListIterator ===

fn list_iterator_init(ctx: &mut NativeCtx) -> NativeResult {
    let list = ctx.instance_arg(1)?;
    let data = ctx.payload_mut::<ListIterData>(0)?;
    data.list = Some(list);
    data.index = 0;
    Ok(Value::Null)
}

fn list_iterator_next(ctx: &mut NativeCtx) -> NativeResult {
    let (list, index) = {
        let data = ctx.payload::<ListIterData>(0)?;
        (data.list, data.index)
    };
    let Some(list) = list else {
        return Err(VmException::Fatal("iterator without a list".to_string()));
    };

    let items = match ctx.vm.heap.get(list) {
        Obj::NativeInstance(instance) => instance.payload.as_any().downcast_ref::<ListData>(),
        _ => None,
    };
    let Some(items) = items else {
        return Err(VmException::Fatal("iterator over a non-list".to_string()));
    };

    match items.items.get(index).copied() {
        Some(item) => {
            ctx.payload_mut::<ListIterData>(0)?.index += 1;
            Ok(item)
        }
        None => Err(ctx.throw_class("StopIteration", "iteration finished")),
    }
}

// === Dict ===

fn dict_get_index(ctx: &mut NativeCtx) -> NativeResult {
    let key = ctx.arg(1);
    let hash = ctx.hash(key)?;
    let data = ctx.payload::<DictData>(0)?;
    Ok(data.get(hash, key).unwrap_or(Value::Null))
}

fn dict_set_index(ctx: &mut NativeCtx) -> NativeResult {
    let key = ctx.arg(1);
    let value = ctx.arg(2);
    let hash = ctx.hash(key)?;
    let data = ctx.payload_mut::<DictData>(0)?;
    data.set(hash, key, value);
    Ok(value)
}

fn dict_size(ctx: &mut NativeCtx) -> NativeResult {
    let data = ctx.payload::<DictData>(0)?;
    Ok(Value::Int(data.len() as i64))
}

// === Range ===

fn range_init(ctx: &mut NativeCtx) -> NativeResult {
    let start = ctx.int_arg(1)?;
    let stop = ctx.int_arg(2)?;
    let data = ctx.payload_mut::<RangeData>(0)?;
    data.next = start;
    data.stop = stop;
    Ok(Value::Null)
}

fn range_iter(ctx: &mut NativeCtx) -> NativeResult {
    Ok(ctx.arg(0))
}

fn range_next(ctx: &mut NativeCtx) -> NativeResult {
    let data = ctx.payload_mut::<RangeData>(0)?;
    if data.next >= data.stop {
        return Err(ctx.throw_class("StopIteration", "iteration finished"));
    }
    let value = data.next;
    data.next += 1;
    Ok(Value::Int(value))
}

// === String and numbers ===

fn string_len(ctx: &mut NativeCtx) -> NativeResult {
    let id = ctx.str_arg(0)?;
    Ok(Value::Int(ctx.vm.heap.string(id).char_len as i64))
}

fn string_hash(ctx: &mut NativeCtx) -> NativeResult {
    let id = ctx.str_arg(0)?;
    Ok(Value::Int(ctx.vm.heap.string(id).hash as i64))
}

fn int_hash(ctx: &mut NativeCtx) -> NativeResult {
    let value = ctx.int_arg(0)?;
    Ok(Value::Int(hash_bytes(&value.to_le_bytes()) as i64))
}

// === Errors ===

fn error_init(ctx: &mut NativeCtx) -> NativeResult {
    let receiver = ctx.instance_arg(0)?;
    let message = ctx.arg(1);
    let msg_name = ctx.vm.specials.msg;
    let hash = ctx.vm.heap.str_hash(msg_name);
    ctx.vm.heap.instance_mut(receiver).fields.set(msg_name, hash, message);
    Ok(Value::Null)
}

fn error_str(ctx: &mut NativeCtx) -> NativeResult {
    let receiver = ctx.instance_arg(0)?;
    let msg_name = ctx.vm.specials.msg;
    let hash = ctx.vm.heap.str_hash(msg_name);
    match ctx.vm.heap.instance(receiver).fields.get(msg_name, hash) {
        Some(message) => Ok(message),
        None => Ok(ctx.alloc_string("")),
    }
}

// === Output ===

fn put(ctx: &mut NativeCtx) -> NativeResult {
    let text = ctx.display(ctx.arg(0))?;
    ctx.vm.write_output(&text);
    Ok(Value::Null)
}

fn putln(ctx: &mut NativeCtx) -> NativeResult {
    let mut text = ctx.display(ctx.arg(0))?;
    text.push('\n');
    ctx.vm.write_output(&text);
    Ok(Value::Null)
}

// === Numeric helpers ===

fn num_floor(ctx: &mut NativeCtx) -> NativeResult {
    let value = ctx.num_arg(0)?;
    Ok(Value::Int(value.floor() as i64))
}

fn num_ceil(ctx: &mut NativeCtx) -> NativeResult {
    let value = ctx.num_arg(0)?;
    Ok(Value::Int(value.ceil() as i64))
}

fn num_round(ctx: &mut NativeCtx) -> NativeResult {
    let value = ctx.num_arg(0)?;
    Ok(Value::Int(value.round() as i64))
}

fn num_pow(ctx: &mut NativeCtx) -> NativeResult {
    let base = ctx.arg(0);
    let exponent = ctx.arg(1);
    match (base, exponent) {
        (Value::Int(b), Value::Int(e)) if (0..=u32::MAX as i64).contains(&e) => {
            Ok(Value::Int(b.wrapping_pow(e as u32)))
        }
        _ => {
            let b = ctx.num_arg(0)?;
            let e = ctx.num_arg(1)?;
            Ok(Value::Float(b.powf(e)))
        }
    }
}

fn num_sqrt(ctx: &mut NativeCtx) -> NativeResult {
    let value = ctx.num_arg(0)?;
    Ok(Value::Float(value.sqrt()))
}

fn num_is_inf(ctx: &mut NativeCtx) -> NativeResult {
    Ok(Value::Bool(matches!(ctx.arg(0), Value::Float(v) if v.is_infinite())))
}

fn num_is_nan(ctx: &mut NativeCtx) -> NativeResult {
    Ok(Value::Bool(matches!(ctx.arg(0), Value::Float(v) if v.is_nan())))
}

fn num_sin(ctx: &mut NativeCtx) -> NativeResult {
    let value = ctx.num_arg(0)?;
    Ok(Value::Float(value.sin()))
}

fn num_cos(ctx: &mut NativeCtx) -> NativeResult {
    let value = ctx.num_arg(0)?;
    Ok(Value::Float(value.cos()))
}

fn num_tan(ctx: &mut NativeCtx) -> NativeResult {
    let value = ctx.num_arg(0)?;
    Ok(Value::Float(value.tan()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_data_insert_get_and_grow() {
        let mut dict = DictData::default();
        for i in 0..50 {
            dict.set(i as u64, Value::Int(i), Value::Int(i * 2));
        }
        assert_eq!(dict.len(), 50);
        for i in 0..50 {
            assert_eq!(dict.get(i as u64, Value::Int(i)), Some(Value::Int(i * 2)));
        }
        assert_eq!(dict.get(99, Value::Int(99)), None);
    }

    #[test]
    fn dict_data_overwrites_existing_keys() {
        let mut dict = DictData::default();
        dict.set(7, Value::Int(7), Value::Int(1));
        dict.set(7, Value::Int(7), Value::Int(2));
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.get(7, Value::Int(7)), Some(Value::Int(2)));
    }

    #[test]
    fn colliding_hashes_probe_linearly() {
        let mut dict = DictData::default();
        dict.set(3, Value::Int(10), Value::Int(100));
        dict.set(3, Value::Int(20), Value::Int(200));
        assert_eq!(dict.get(3, Value::Int(10)), Some(Value::Int(100)));
        assert_eq!(dict.get(3, Value::Int(20)), Some(Value::Int(200)));
    }
}
