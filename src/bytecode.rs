// File: src/bytecode.rs
//
// Bytecode instruction definitions for the Vesper VM.
// Instructions are a flat byte sequence: a one-byte opcode followed by
// big-endian operands of the widths documented per opcode. A parallel
// line table stores one source line per byte so stack traces only need
// an index lookup.

use num_enum::TryFromPrimitive;

/// Bytecode opcodes. Unless noted otherwise an instruction has no
/// operand bytes; `u32` operands are big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Op {
    // [lhs, rhs] -> [result]
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Less,
    LessEq,
    More,
    MoreEq,
    Equals,
    NotEq,

    // [value] -> [result]
    Negate,
    Not,

    /// u32 index into the shared constant pool.
    GetConstant,
    /// u32 frame slot.
    GetLocal,
    /// u32 frame slot; [rhs] stays on the stack.
    SetLocal,
    /// [initializer, name] -> []
    CreateGlobal,
    /// [name] -> [value]
    GetGlobal,
    /// [rhs, name] -> [rhs]
    SetGlobal,
    /// u32 upvalue index.
    GetUpvalue,
    /// u32 upvalue index; [rhs] stays on the stack.
    SetUpvalue,
    /// [value, name] -> [field]
    GetField,
    /// [rhs, instance, name] -> [rhs]
    SetField,
    /// [class, function, name] -> [class]
    StoreMethod,
    /// [value, index] -> [element]
    GetIndex,
    /// [value, index, rhs] -> [rhs]
    SetIndex,

    LoadNull,
    LoadTrue,
    LoadFalse,

    /// [name] -> [class]
    CreateClass,
    /// u8 count, then count * (u8 index, u8 is_local); [function] -> [closure]
    Closure,

    /// u32 forward distance from the byte after the operand.
    Jump,
    /// u32; peeks the condition.
    JumpIfTrue,
    /// u32; peeks the condition.
    JumpIfFalse,
    /// u32; always pops the condition.
    JumpIfFalseAndPop,
    /// u32 backward distance from the byte after the operand.
    JumpBack,

    /// u32 argument count; [callee, args...] -> [result]
    Call,
    Return,
    /// u32 forward distance to the handler; pushes an exception handler.
    TryBegin,
    TryEnd,
    FinallyBegin,
    FinallyEnd,
    /// [value] -> unwinds
    Throw,
    /// Same as Throw, emitted on the compiler's internal rethrow paths.
    Rethrow,
    /// u8 frame slot whose open upvalue (if any) is closed.
    CloseUpvalue,
    /// [value, class] -> [value, bool]
    MatchClass,
    PopStack,
    /// [path] -> [module]
    Import,
    /// [module] -> [module]; marks the module fully executed.
    ModuleSetLoaded,
    /// [module] -> []
    ModuleImportAllToGlobalNamespace,
    /// [value] -> [value, value]
    CloneTop,
    /// [class, superclass] -> [class]
    Inherit,

    /// -> [list]
    CreateList,
    /// [list, value] -> [list]
    ListPush,
    /// -> [dict]
    CreateDict,
    /// [dict, key, value] -> [dict]
    DictPush,
}

/// A compiled byte sequence plus its per-byte source line table.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    /// `lines[i]` is the source line of `code[i]`; always the same
    /// length as `code`.
    pub lines: Vec<u32>,
}

impl Chunk {
    pub fn new() -> Self {
        Chunk::default()
    }

    pub fn push_op(&mut self, op: Op, line: u32) {
        self.code.push(op as u8);
        self.lines.push(line);
    }

    pub fn push_u8(&mut self, value: u8, line: u32) {
        self.code.push(value);
        self.lines.push(line);
    }

    pub fn push_u32(&mut self, value: u32, line: u32) {
        self.code.extend_from_slice(&value.to_be_bytes());
        for _ in 0..4 {
            self.lines.push(line);
        }
    }

    /// Overwrite a previously emitted u32 at `offset`.
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.code[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Append another chunk verbatim; used to inline compiled `finally`
    /// blocks at every exit of a protected region.
    pub fn append(&mut self, other: &Chunk) {
        self.code.extend_from_slice(&other.code);
        self.lines.extend_from_slice(&other.lines);
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

/// Render a chunk one instruction per line, e.g. for `--dump-bytecode`.
pub fn disassemble(chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, &mut out);
    }
    out
}

fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    use std::fmt::Write;

    let line = chunk.lines.get(offset).copied().unwrap_or(0);
    let _ = write!(out, "{:04} {:>4} ", offset, line + 1);

    let Ok(op) = Op::try_from(chunk.code[offset]) else {
        let _ = writeln!(out, "??   0x{:02x}", chunk.code[offset]);
        return offset + 1;
    };

    let read_u32 = |at: usize| -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&chunk.code[at..at + 4]);
        u32::from_be_bytes(bytes)
    };

    match op {
        Op::GetConstant
        | Op::GetLocal
        | Op::SetLocal
        | Op::GetUpvalue
        | Op::SetUpvalue
        | Op::Call => {
            let _ = writeln!(out, "{:?} {}", op, read_u32(offset + 1));
            offset + 5
        }
        Op::Jump | Op::JumpIfTrue | Op::JumpIfFalse | Op::JumpIfFalseAndPop | Op::TryBegin => {
            let distance = read_u32(offset + 1) as usize;
            let _ = writeln!(out, "{:?} -> {}", op, offset + 5 + distance);
            offset + 5
        }
        Op::JumpBack => {
            let distance = read_u32(offset + 1) as usize;
            let _ = writeln!(out, "{:?} -> {}", op, (offset + 5).wrapping_sub(distance));
            offset + 5
        }
        Op::CloseUpvalue => {
            let _ = writeln!(out, "{:?} {}", op, chunk.code[offset + 1]);
            offset + 2
        }
        Op::Closure => {
            let count = chunk.code[offset + 1] as usize;
            let _ = write!(out, "{:?} {}", op, count);
            let mut at = offset + 2;
            for _ in 0..count {
                let index = chunk.code[at];
                let is_local = chunk.code[at + 1] != 0;
                let _ = write!(out, " ({}, {})", index, if is_local { "local" } else { "upvalue" });
                at += 2;
            }
            let _ = writeln!(out);
            at
        }
        _ => {
            let _ = writeln!(out, "{:?}", op);
            offset + 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_table_tracks_every_byte() {
        let mut chunk = Chunk::new();
        chunk.push_op(Op::GetConstant, 3);
        chunk.push_u32(7, 3);
        chunk.push_op(Op::Return, 4);
        assert_eq!(chunk.code.len(), chunk.lines.len());
        assert_eq!(chunk.lines, vec![3, 3, 3, 3, 3, 4]);
    }

    #[test]
    fn u32_operands_are_big_endian() {
        let mut chunk = Chunk::new();
        chunk.push_u32(0x0102_0304, 0);
        assert_eq!(chunk.code, vec![1, 2, 3, 4]);
        chunk.patch_u32(0, 0xAABB_CCDD);
        assert_eq!(chunk.code, vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn append_preserves_the_line_table() {
        let mut a = Chunk::new();
        a.push_op(Op::LoadNull, 1);
        let mut b = Chunk::new();
        b.push_op(Op::Return, 2);
        a.append(&b);
        assert_eq!(a.code.len(), 2);
        assert_eq!(a.lines, vec![1, 2]);
    }

    #[test]
    fn opcodes_round_trip_through_bytes() {
        for op in [Op::Add, Op::Closure, Op::DictPush, Op::Return] {
            assert_eq!(Op::try_from(op as u8), Ok(op));
        }
        assert!(Op::try_from(0xFF).is_err());
    }
}
