// File: src/compiler.rs
//
// Single-pass bytecode compiler for the Vesper programming language.
// Lowers the AST into per-function chunks, resolving lexical scopes
// and upvalue captures on the way. `try`/`finally` compiles the
// finally block into its own chunk once and inlines it at every exit
// of the protected region (fall-through, ret, break, rethrow), which
// keeps the VM's unwinding rule a single loop.

use crate::ast::{
    BinaryOp, CatchClause, Expr, ExprKind, FnDecl, Pattern, PatternKind, Stmt, StmtKind, UnaryOp,
    UseBinding,
};
use crate::bytecode::{Chunk, Op};
use crate::errors::Reporter;
use crate::heap::Heap;
use crate::source::{SourceMap, Span};
use crate::value::{ObjId, Value};
use ahash::AHashMap;
use std::path::Path;

/// Marker for the unwinding path out of a failed compilation; the
/// error has already gone through the reporter.
struct CompileError;

type CResult<T> = Result<T, CompileError>;

pub struct CompileResult {
    pub had_error: bool,
    /// The root "script" function for the compilation unit.
    pub function: ObjId,
    pub module: ObjId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Normal,
    Try,
    Catch,
    Finally,
}

#[derive(Debug, Clone, Copy)]
struct Local {
    index: u32,
    captured: bool,
}

struct Scope {
    locals: AHashMap<String, Local>,
    function_depth: u32,
    kind: ScopeKind,
    /// For `Try` and `Catch` scopes: the compiled finally block to
    /// inline when control jumps out across this scope.
    finally_chunk: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u32,
    is_local: bool,
}

#[derive(Default)]
struct FunctionScope {
    upvalues: Vec<UpvalueDesc>,
}

struct LoopRecord {
    start: usize,
    /// `scopes.len()` when the loop was recorded; scopes at or past
    /// this index were opened inside the loop body.
    scope_depth: usize,
    break_jumps: Vec<usize>,
}

pub struct Compiler<'a> {
    heap: &'a mut Heap,
    map: &'a SourceMap,
    module: ObjId,
    /// Chunk under construction per enclosing function (plus one
    /// temporary entry while a finally block compiles).
    chunks: Vec<Chunk>,
    functions: Vec<FunctionScope>,
    scopes: Vec<Scope>,
    loops: Vec<LoopRecord>,
    line_stack: Vec<u32>,
    /// Arena of compiled finally blocks referenced by scopes.
    finally_chunks: Vec<Chunk>,
    had_error: bool,
}

impl<'a> Compiler<'a> {
    /// Compile a whole unit into a fresh module.
    pub fn compile(
        ast: &[Stmt],
        map: &'a SourceMap,
        heap: &'a mut Heap,
        reporter: &mut dyn Reporter,
    ) -> CompileResult {
        let module = heap.alloc_module();
        Self::compile_into_module(ast, map, heap, reporter, module)
    }

    /// Compile into an existing module; the REPL reuses one module
    /// across lines so globals persist.
    pub fn compile_into_module(
        ast: &[Stmt],
        map: &'a SourceMap,
        heap: &'a mut Heap,
        reporter: &mut dyn Reporter,
        module: ObjId,
    ) -> CompileResult {
        let name = heap.alloc_string("script");
        let function = heap.alloc_function(name, 0, module);
        // Registering the root function as a constant also roots it.
        heap.add_constant(Value::Obj(function));

        let mut compiler = Compiler {
            heap,
            map,
            module,
            chunks: vec![Chunk::new()],
            functions: vec![FunctionScope::default()],
            scopes: Vec::new(),
            loops: Vec::new(),
            line_stack: Vec::new(),
            finally_chunks: Vec::new(),
            had_error: false,
        };

        for stmt in ast {
            if compiler.stmt(stmt, reporter).is_err() {
                break;
            }
        }

        // Module functions return like normal functions; load null so an
        // empty program does not return from an empty stack.
        let last_line = compiler.map.line_count().saturating_sub(1) as u32;
        compiler.line_stack.push(last_line);
        compiler.emit_op(Op::LoadNull);
        compiler.emit_op(Op::Return);
        compiler.line_stack.pop();

        let chunk = compiler.chunks.pop().unwrap_or_default();
        compiler.heap.function_mut(function).chunk = chunk;

        CompileResult { had_error: compiler.had_error, function, module }
    }

    // === Statements ===

    fn stmt(&mut self, stmt: &Stmt, r: &mut dyn Reporter) -> CResult<()> {
        self.line_stack.push(self.map.line_of(stmt.span.start) as u32);
        let result = match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.expr(expr, r).map(|()| self.emit_op(Op::PopStack))
            }
            StmtKind::VarDecl(vars) => self.var_decl(vars, stmt.span, r),
            StmtKind::Block(stmts) => {
                self.begin_scope(ScopeKind::Normal);
                let result = self.stmts(stmts, r);
                self.end_scope();
                result
            }
            StmtKind::Fn(decl) => self.fn_stmt(decl, r),
            StmtKind::Ret(value) => self.ret_stmt(value.as_ref(), stmt.span, r),
            StmtKind::If { cond, then, else_ } => self.if_stmt(cond, then, else_.as_deref(), r),
            StmtKind::Loop { init, cond, step, body } => {
                self.loop_stmt(init.as_deref(), cond.as_ref(), step.as_ref(), body, r)
            }
            StmtKind::Break => self.break_stmt(stmt.span, r),
            StmtKind::Class { name, superclass, methods } => {
                self.class_stmt(name, superclass.as_deref(), methods, stmt.span, r)
            }
            StmtKind::Impl { type_name, methods } => {
                self.impl_stmt(type_name, methods, stmt.span, r)
            }
            StmtKind::Try { body, catches, finally } => {
                self.try_stmt(body, catches, finally.as_deref(), stmt.span, r)
            }
            StmtKind::Throw(expr) => {
                self.expr(expr, r).map(|()| self.emit_op(Op::Throw))
            }
            StmtKind::Match { expr, cases } => self.match_stmt(expr, cases, stmt.span, r),
            StmtKind::Use { path, binding } => self.use_stmt(path, binding, stmt.span, r),
        };
        self.line_stack.pop();
        result
    }

    fn stmts(&mut self, stmts: &[Stmt], r: &mut dyn Reporter) -> CResult<()> {
        for stmt in stmts {
            self.stmt(stmt, r)?;
        }
        Ok(())
    }

    fn var_decl(
        &mut self,
        vars: &[(String, Option<Expr>)],
        span: Span,
        r: &mut dyn Reporter,
    ) -> CResult<()> {
        for (name, initializer) in vars {
            // The initializer is evaluated before the name exists, so a
            // shadowed outer variable is still visible inside it.
            match initializer {
                Some(expr) => self.expr(expr, r)?,
                None => self.emit_op(Op::LoadNull),
            }
            self.create_variable(name, span, r)?;
        }
        Ok(())
    }

    fn fn_stmt(&mut self, decl: &FnDecl, r: &mut dyn Reporter) -> CResult<()> {
        let name = self.heap.alloc_string(&decl.name);
        let function = self.heap.alloc_function(name, decl.params.len() as u32, self.module);
        let index = self.heap.add_constant(Value::Obj(function));

        // Binding before the body compiles lets the function call
        // itself recursively.
        self.load_constant(index);
        self.create_variable(&decl.name, decl.span, r)?;
        self.compile_function(function, &decl.params, &decl.body, decl.span, r)
    }

    fn compile_function(
        &mut self,
        function: ObjId,
        params: &[String],
        body: &[Stmt],
        span: Span,
        r: &mut dyn Reporter,
    ) -> CResult<()> {
        self.chunks.push(Chunk::new());
        self.functions.push(FunctionScope::default());
        self.begin_scope(ScopeKind::Normal);
        if let Some(scope) = self.scopes.last_mut() {
            scope.function_depth += 1;
        }

        for (i, param) in params.iter().enumerate() {
            if i == 0 && param == "$" {
                // The receiver slot of methods; only the compiler may
                // introduce `$`-names.
                self.create_special_variable(param, span, r)?;
            } else {
                self.create_variable(param, span, r)?;
            }
        }

        self.stmts(body, r)?;
        self.emit_op(Op::LoadNull);
        self.emit_op(Op::Return);

        self.end_scope();
        let chunk = self.chunks.pop().unwrap_or_default();
        self.heap.function_mut(function).chunk = chunk;

        let upvalues = self.functions.pop().unwrap_or_default().upvalues;
        self.heap.function_mut(function).upvalue_count = upvalues.len() as u32;
        if !upvalues.is_empty() {
            if upvalues.len() > u8::MAX as usize {
                return self.error_at(span, "function captures too many variables", r);
            }
            // Emitted into the enclosing chunk: wraps the function
            // value on top of the stack into a closure.
            self.emit_op(Op::Closure);
            self.emit_u8(upvalues.len() as u8);
            for upvalue in upvalues {
                self.emit_u8(upvalue.index as u8);
                self.emit_u8(upvalue.is_local as u8);
            }
        }

        Ok(())
    }

    fn ret_stmt(&mut self, value: Option<&Expr>, span: Span, r: &mut dyn Reporter) -> CResult<()> {
        let depth = self.current_function_depth();
        // Leaving a protected region through `ret` still runs its
        // finally blocks; a `ret` inside a finally is rejected.
        for i in (1..self.scopes.len()).rev() {
            if self.scopes[i].function_depth != depth {
                break;
            }
            if self.scopes[i].kind == ScopeKind::Finally {
                return self.error_at(span, "ret not allowed inside finally block", r);
            }
            self.cleanup_before_jump(i, false);
        }

        match value {
            Some(expr) => self.expr(expr, r)?,
            None => self.emit_op(Op::LoadNull),
        }
        self.emit_op(Op::Return);
        Ok(())
    }

    fn if_stmt(
        &mut self,
        cond: &Expr,
        then: &[Stmt],
        else_: Option<&Stmt>,
        r: &mut dyn Reporter,
    ) -> CResult<()> {
        self.expr(cond, r)?;
        let jump_to_else = self.emit_jump(Op::JumpIfFalseAndPop);

        self.begin_scope(ScopeKind::Normal);
        let then_result = self.stmts(then, r);
        self.end_scope();
        then_result?;

        if let Some(else_stmt) = else_ {
            let jump_to_end = self.emit_jump(Op::Jump);
            self.set_jump_to_here(jump_to_else);
            // The else branch is a Block or a chained If; both manage
            // their own scopes.
            self.stmt(else_stmt, r)?;
            self.set_jump_to_here(jump_to_end);
        } else {
            self.set_jump_to_here(jump_to_else);
        }

        Ok(())
    }

    fn loop_stmt(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Expr>,
        body: &[Stmt],
        r: &mut dyn Reporter,
    ) -> CResult<()> {
        self.begin_scope(ScopeKind::Normal);
        if let Some(init) = init {
            self.stmt(init, r)?;
        }

        let start = self.current_location();
        self.loops.push(LoopRecord { start, scope_depth: self.scopes.len(), break_jumps: Vec::new() });

        let mut jump_to_end = None;
        if let Some(cond) = cond {
            self.expr(cond, r)?;
            jump_to_end = Some(self.emit_jump(Op::JumpIfFalseAndPop));
        }

        self.begin_scope(ScopeKind::Normal);
        let body_result = self.stmts(body, r).and_then(|()| {
            if let Some(step) = step {
                self.expr(step, r)?;
                self.emit_op(Op::PopStack);
            }
            Ok(())
        });
        self.end_scope();
        body_result?;

        self.emit_jump_back(start);

        if let Some(jump) = jump_to_end {
            self.set_jump_to_here(jump);
        }

        let record = self.loops.pop().expect("loop record pushed above");
        for jump in record.break_jumps {
            self.set_jump_to_here(jump);
        }

        self.end_scope();
        Ok(())
    }

    fn break_stmt(&mut self, span: Span, r: &mut dyn Reporter) -> CResult<()> {
        let in_current_function = self
            .loops
            .last()
            .map(|l| {
                self.scopes
                    .get(l.scope_depth)
                    .map(|s| s.function_depth == self.current_function_depth())
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        if !in_current_function {
            return self.error_at(span, "cannot use break outside of a loop", r);
        }

        let depth = self.current_function_depth();
        let from = self.loops.last().map(|l| l.scope_depth).unwrap_or(0);
        for i in from..self.scopes.len() {
            if self.scopes[i].function_depth == depth && self.scopes[i].kind == ScopeKind::Finally {
                return self.error_at(span, "break not allowed inside finally block", r);
            }
            self.cleanup_before_jump(i, true);
        }

        let jump = self.emit_jump(Op::Jump);
        if let Some(record) = self.loops.last_mut() {
            record.break_jumps.push(jump);
        }
        Ok(())
    }

    fn class_stmt(
        &mut self,
        name: &str,
        superclass: Option<&str>,
        methods: &[FnDecl],
        span: Span,
        r: &mut dyn Reporter,
    ) -> CResult<()> {
        // Classes are created once at module load; allowing them in
        // local scope would recreate them on every execution of the
        // enclosing block.
        if !self.scopes.is_empty() {
            return self.error_at(span, "classes can only be created at global scope", r);
        }

        let (name_constant, _) = self.heap.string_constant(name);
        self.load_constant(name_constant);
        self.emit_op(Op::CreateClass);

        if let Some(superclass) = superclass {
            self.load_variable(superclass);
            self.emit_op(Op::Inherit);
        }

        self.compile_methods(name, methods, r)?;
        self.create_variable(name, span, r)?;
        Ok(())
    }

    fn impl_stmt(
        &mut self,
        type_name: &str,
        methods: &[FnDecl],
        span: Span,
        r: &mut dyn Reporter,
    ) -> CResult<()> {
        if !self.scopes.is_empty() {
            return self.error_at(span, "impl statements can only appear at global scope", r);
        }
        self.load_variable(type_name);
        self.compile_methods(type_name, methods, r)?;
        self.emit_op(Op::PopStack);
        Ok(())
    }

    /// Compile each method and attach it to the class on top of the
    /// stack. A method's first argument is its receiver, declared as
    /// `$`, the one place that name may be introduced.
    fn compile_methods(
        &mut self,
        class_name: &str,
        methods: &[FnDecl],
        r: &mut dyn Reporter,
    ) -> CResult<()> {
        for method in methods {
            let debug_name = format!("{}.{}", class_name, method.name);
            let name = self.heap.alloc_string(&debug_name);
            let function =
                self.heap.alloc_function(name, method.params.len() as u32, self.module);
            let index = self.heap.add_constant(Value::Obj(function));

            self.load_constant(index);
            self.compile_function(function, &method.params, &method.body, method.span, r)?;

            let (method_name_constant, _) = self.heap.string_constant(&method.name);
            self.load_constant(method_name_constant);
            self.emit_op(Op::StoreMethod);
        }
        Ok(())
    }

    /// Two nested protected regions so that an exception thrown inside
    /// a catch block still runs the finally:
    ///
    /// ```text
    /// TryBegin H_outer          ; catches rethrows and not-matched
    ///   TryBegin H_inner
    ///     <try block>
    ///   TryEnd
    ///   Jump end_of_catches
    /// H_inner:
    ///   <catch chain, Rethrow if no pattern matched>
    /// end_of_catches:
    /// TryEnd
    ///   <inline finally>        ; normal path
    ///   Jump past_rethrow
    /// H_outer:
    ///   <inline finally>        ; exceptional path
    ///   Rethrow
    /// past_rethrow:
    /// ```
    fn try_stmt(
        &mut self,
        body: &[Stmt],
        catches: &[CatchClause],
        finally: Option<&[Stmt]>,
        span: Span,
        r: &mut dyn Reporter,
    ) -> CResult<()> {
        let finally_chunk = match finally {
            Some(stmts) => {
                self.chunks.push(Chunk::new());
                self.begin_scope(ScopeKind::Finally);
                self.emit_op(Op::FinallyBegin);
                let result = self.stmts(stmts, r);
                self.end_scope();
                let chunk = self.chunks.pop().unwrap_or_default();
                result?;
                self.finally_chunks.push(chunk);
                Some(self.finally_chunks.len() - 1)
            }
            None => None,
        };

        let jump_to_finally_rethrow = self.emit_jump(Op::TryBegin);
        self.begin_scope(ScopeKind::Try);
        // Jumping out across the outer region must not inline the
        // finally a second time; the inner region already did.
        if let Some(scope) = self.scopes.last_mut() {
            scope.finally_chunk = None;
        }

        let jump_to_catches = self.emit_jump(Op::TryBegin);
        self.begin_scope(ScopeKind::Try);
        if let Some(scope) = self.scopes.last_mut() {
            scope.finally_chunk = finally_chunk;
        }
        let body_result = self.stmts(body, r);
        self.end_scope();
        body_result?;
        let jump_to_end_of_catches = self.emit_jump(Op::Jump);

        self.set_jump_to_here(jump_to_catches);
        let mut jumps_to_epilogue = Vec::new();
        for catch in catches {
            self.pattern(&catch.pattern, r)?;
            let jump_to_next = self.emit_jump(Op::JumpIfFalseAndPop);

            self.begin_scope(ScopeKind::Normal);
            // The caught value sits on the stack exactly where the next
            // local slot is; bind it even when anonymous so the VM
            // needs no special case.
            let bind_name = catch.binding.as_deref().unwrap_or("");
            if bind_name.is_empty() {
                self.create_special_variable(bind_name, span, r)?;
            } else {
                self.create_variable(bind_name, span, r)?;
            }
            self.begin_scope(ScopeKind::Catch);
            if let Some(scope) = self.scopes.last_mut() {
                scope.finally_chunk = finally_chunk;
            }
            let catch_result = self.stmts(&catch.body, r);
            self.end_scope();
            catch_result?;

            jumps_to_epilogue.push(self.emit_jump(Op::Jump));
            // Unbind the caught value so the scope pop leaves it on the
            // stack for the next handler and the rethrow.
            if let Some(scope) = self.scopes.last_mut() {
                scope.locals.remove(bind_name);
            }
            self.end_scope();
            self.set_jump_to_here(jump_to_next);
        }
        // No pattern matched: rethrow into the outer region.
        self.emit_op(Op::Rethrow);

        for jump in jumps_to_epilogue {
            self.set_jump_to_here(jump);
        }
        self.emit_op(Op::PopStack); // drop the caught value

        self.set_jump_to_here(jump_to_end_of_catches);
        self.end_scope(); // outer protected region: emits TryEnd

        if let Some(finally_chunk) = finally_chunk {
            self.inline_finally(finally_chunk); // normal path
            let jump_past_rethrow = self.emit_jump(Op::Jump);

            self.set_jump_to_here(jump_to_finally_rethrow);
            self.begin_scope(ScopeKind::Normal);
            // The in-flight exception occupies a stack slot while the
            // finally runs.
            self.create_special_variable("", span, r)?;
            self.inline_finally(finally_chunk); // exceptional path
            if let Some(scope) = self.scopes.last_mut() {
                scope.locals.remove("");
            }
            self.end_scope();
            self.emit_op(Op::Rethrow);

            self.set_jump_to_here(jump_past_rethrow);
        } else {
            let jump_past_rethrow = self.emit_jump(Op::Jump);
            self.set_jump_to_here(jump_to_finally_rethrow);
            // An exception thrown inside a catch block lands here.
            self.emit_op(Op::Rethrow);
            self.set_jump_to_here(jump_past_rethrow);
        }

        Ok(())
    }

    fn match_stmt(
        &mut self,
        expr: &Expr,
        cases: &[(Pattern, Stmt)],
        span: Span,
        r: &mut dyn Reporter,
    ) -> CResult<()> {
        self.begin_scope(ScopeKind::Normal);

        self.expr(expr, r)?;
        // A dotted name cannot collide with user identifiers.
        self.create_special_variable(".matched", span, r)?;

        let mut jumps_to_end = Vec::new();
        for (pattern, stmt) in cases {
            self.pattern(pattern, r)?;
            let jump_to_next = self.emit_jump(Op::JumpIfFalseAndPop);

            if !stmt_allowed_in_match(stmt) {
                return self.error_at(stmt.span, "statement not allowed in match expression", r);
            }
            self.stmt(stmt, r)?;
            jumps_to_end.push(self.emit_jump(Op::Jump));
            self.set_jump_to_here(jump_to_next);
        }

        for jump in jumps_to_end {
            self.set_jump_to_here(jump);
        }

        self.end_scope();
        Ok(())
    }

    fn use_stmt(
        &mut self,
        path: &str,
        binding: &UseBinding,
        span: Span,
        r: &mut dyn Reporter,
    ) -> CResult<()> {
        match binding {
            UseBinding::Default => {
                self.load_module(path);
                let stem = Path::new(path)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or(path)
                    .to_string();
                self.create_variable(&stem, span, r)?;
            }
            UseBinding::Named(name) => {
                self.load_module(path);
                self.create_variable(name, span, r)?;
            }
            UseBinding::All => {
                if !self.scopes.is_empty() {
                    return self.error_at(span, "use all can only appear at global scope", r);
                }
                self.load_module(path);
                self.emit_op(Op::ModuleImportAllToGlobalNamespace);
            }
            UseBinding::Selective(imports) => {
                self.load_module(path);
                for (original, alias) in imports {
                    if alias.as_deref() == Some(original.as_str()) {
                        return self.error_at(
                            span,
                            &format!("imported variable ('{}') name is the same as its alias", original),
                            r,
                        );
                    }
                    // GetField consumes the module, so clone it first.
                    self.emit_op(Op::CloneTop);
                    self.get_field(original);
                    self.create_variable(alias.as_deref().unwrap_or(original), span, r)?;
                }
                self.emit_op(Op::PopStack); // pop the module
            }
        }
        Ok(())
    }

    fn load_module(&mut self, path: &str) {
        let (constant, _) = self.heap.string_constant(path);
        self.load_constant(constant);
        self.emit_op(Op::Import);
        self.emit_op(Op::ModuleSetLoaded);
    }

    // === Expressions ===

    fn expr(&mut self, expr: &Expr, r: &mut dyn Reporter) -> CResult<()> {
        self.line_stack.push(self.map.line_of(expr.span.start) as u32);
        let result = self.expr_inner(expr, r);
        self.line_stack.pop();
        result
    }

    fn expr_inner(&mut self, expr: &Expr, r: &mut dyn Reporter) -> CResult<()> {
        match &expr.kind {
            ExprKind::Int(value) => {
                let constant = self.heap.add_constant(Value::Int(*value));
                self.load_constant(constant);
                Ok(())
            }
            ExprKind::Float(value) => {
                let constant = self.heap.add_constant(Value::Float(*value));
                self.load_constant(constant);
                Ok(())
            }
            ExprKind::Bool(value) => {
                self.emit_op(if *value { Op::LoadTrue } else { Op::LoadFalse });
                Ok(())
            }
            ExprKind::Null => {
                self.emit_op(Op::LoadNull);
                Ok(())
            }
            ExprKind::Str { text, .. } => {
                let (constant, _) = self.heap.string_constant(text);
                self.load_constant(constant);
                Ok(())
            }
            ExprKind::Identifier(name) => {
                self.load_variable(name);
                Ok(())
            }
            ExprKind::Binary { lhs, op, rhs } => self.binary(lhs, *op, rhs, r),
            ExprKind::Unary { op, expr } => {
                self.expr(expr, r)?;
                self.emit_op(match op {
                    UnaryOp::Negate => Op::Negate,
                    UnaryOp::Not => Op::Not,
                });
                Ok(())
            }
            ExprKind::Call { callee, args } => {
                self.expr(callee, r)?;
                for arg in args {
                    self.expr(arg, r)?;
                }
                self.emit_op(Op::Call);
                self.emit_u32(args.len() as u32);
                Ok(())
            }
            ExprKind::Assign { target, op, value } => self.assign(target, *op, value, expr.span, r),
            ExprKind::List(values) => {
                self.emit_op(Op::CreateList);
                for value in values {
                    self.expr(value, r)?;
                    self.emit_op(Op::ListPush);
                }
                Ok(())
            }
            ExprKind::Dict(pairs) => {
                self.emit_op(Op::CreateDict);
                for (key, value) in pairs {
                    self.expr(key, r)?;
                    self.expr(value, r)?;
                    self.emit_op(Op::DictPush);
                }
                Ok(())
            }
            ExprKind::GetField { object, name } => {
                self.expr(object, r)?;
                self.get_field(name);
                Ok(())
            }
            ExprKind::Lambda { params, body } => {
                let name = self.heap.alloc_string("");
                let function =
                    self.heap.alloc_function(name, params.len() as u32, self.module);
                let index = self.heap.add_constant(Value::Obj(function));
                self.load_constant(index);
                self.compile_function(function, params, body, expr.span, r)
            }
        }
    }

    fn binary(&mut self, lhs: &Expr, op: BinaryOp, rhs: &Expr, r: &mut dyn Reporter) -> CResult<()> {
        // Short-circuit forms compile to conditional jumps.
        if op == BinaryOp::And {
            self.expr(lhs, r)?;
            let jump = self.emit_jump(Op::JumpIfFalse);
            self.emit_op(Op::PopStack);
            self.expr(rhs, r)?;
            self.set_jump_to_here(jump);
            return Ok(());
        }
        if op == BinaryOp::Or {
            self.expr(lhs, r)?;
            let jump = self.emit_jump(Op::JumpIfTrue);
            self.emit_op(Op::PopStack);
            self.expr(rhs, r)?;
            self.set_jump_to_here(jump);
            return Ok(());
        }

        self.expr(lhs, r)?;
        self.expr(rhs, r)?;
        self.emit_op(match op {
            BinaryOp::Add => Op::Add,
            BinaryOp::Concat => Op::Concat,
            BinaryOp::Sub => Op::Sub,
            BinaryOp::Mul => Op::Mul,
            BinaryOp::Div => Op::Div,
            BinaryOp::Mod => Op::Mod,
            BinaryOp::Eq => Op::Equals,
            BinaryOp::NotEq => Op::NotEq,
            BinaryOp::Less => Op::Less,
            BinaryOp::LessEq => Op::LessEq,
            BinaryOp::More => Op::More,
            BinaryOp::MoreEq => Op::MoreEq,
            BinaryOp::Index => Op::GetIndex,
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        });
        Ok(())
    }

    fn assign(
        &mut self,
        target: &Expr,
        op: Option<BinaryOp>,
        value: &Expr,
        span: Span,
        r: &mut dyn Reporter,
    ) -> CResult<()> {
        // Compound assignment re-evaluates the target expression as the
        // left operand.
        match op {
            Some(op) => self.binary(target, op, value, r)?,
            None => self.expr(value, r)?,
        }

        match &target.kind {
            ExprKind::Identifier(name) => self.set_variable(name, span, r),
            ExprKind::GetField { object, name } => {
                self.expr(object, r)?;
                let (constant, _) = self.heap.string_constant(name);
                self.load_constant(constant);
                self.emit_op(Op::SetField);
                Ok(())
            }
            ExprKind::Binary { lhs, op: BinaryOp::Index, rhs } => {
                self.expr(lhs, r)?;
                self.expr(rhs, r)?;
                self.emit_op(Op::SetIndex);
                Ok(())
            }
            _ => self.error_at(span, "invalid left side of assignment", r),
        }
    }

    // === Patterns ===

    /// The matched value is on top of the stack; every pattern leaves
    /// `[value, bool]`.
    fn pattern(&mut self, pattern: &Pattern, r: &mut dyn Reporter) -> CResult<()> {
        self.line_stack.push(self.map.line_of(pattern.span.start) as u32);
        let result = match &pattern.kind {
            PatternKind::Wildcard => {
                self.emit_op(Op::LoadTrue);
                Ok(())
            }
            PatternKind::Expr(expr) => {
                self.emit_op(Op::CloneTop);
                self.expr(expr, r).map(|()| self.emit_op(Op::Equals))
            }
            PatternKind::Class { name, fields } => self.class_pattern(name, fields, r),
        };
        self.line_stack.pop();
        result
    }

    fn class_pattern(
        &mut self,
        name: &str,
        fields: &[(String, Pattern)],
        r: &mut dyn Reporter,
    ) -> CResult<()> {
        // The class name is resolved by MatchClass itself at match
        // time; classes only exist at global scope.
        let (constant, _) = self.heap.string_constant(name);
        self.load_constant(constant);
        self.emit_op(Op::MatchClass);

        if fields.is_empty() {
            return Ok(());
        }

        let jump_not_instance = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::PopStack); // pop the MatchClass result

        let mut jumps_if_failed = Vec::new();
        for (field_name, field_pattern) in fields {
            self.emit_op(Op::CloneTop);
            self.get_field(field_name);
            self.pattern(field_pattern, r)?;
            jumps_if_failed.push(self.emit_jump(Op::JumpIfFalseAndPop));
            self.emit_op(Op::PopStack); // pop the matched field
        }
        let jump_if_matched = self.emit_jump(Op::Jump);

        for jump in jumps_if_failed {
            self.set_jump_to_here(jump);
        }
        self.emit_op(Op::PopStack); // pop the failing field
        self.emit_op(Op::LoadFalse);
        let jump_to_end = self.emit_jump(Op::Jump);

        self.set_jump_to_here(jump_if_matched);
        self.emit_op(Op::LoadTrue);

        self.set_jump_to_here(jump_not_instance);
        self.set_jump_to_here(jump_to_end);
        Ok(())
    }

    // === Variables and scopes ===

    fn create_variable(&mut self, name: &str, span: Span, r: &mut dyn Reporter) -> CResult<()> {
        if name.starts_with('$') {
            return self.error_at(span, "user defined variables cannot start with '$'", r);
        }
        self.create_variable_impl(name, span, r)
    }

    /// Entry point for compiler-introduced names (`$`, the anonymous
    /// caught-value slot, `.matched`).
    fn create_special_variable(
        &mut self,
        name: &str,
        span: Span,
        r: &mut dyn Reporter,
    ) -> CResult<()> {
        self.create_variable_impl(name, span, r)
    }

    fn create_variable_impl(&mut self, name: &str, span: Span, r: &mut dyn Reporter) -> CResult<()> {
        if self.scopes.is_empty() {
            let (constant, _) = self.heap.string_constant(name);
            self.load_constant(constant);
            self.emit_op(Op::CreateGlobal);
            return Ok(());
        }

        if self.scopes.last().map(|s| s.locals.contains_key(name)).unwrap_or(false) {
            return self.error_at(span, &format!("redeclaration of variable '{}'", name), r);
        }

        let depth = self.current_function_depth();
        let mut slot = 0u32;
        for scope in self.scopes.iter().rev() {
            if scope.function_depth != depth {
                break;
            }
            slot += scope.locals.len() as u32;
        }

        if let Some(scope) = self.scopes.last_mut() {
            scope.locals.insert(name.to_string(), Local { index: slot, captured: false });
        }
        Ok(())
    }

    fn load_variable(&mut self, name: &str) {
        self.variable(name, true);
    }

    fn set_variable(&mut self, name: &str, span: Span, r: &mut dyn Reporter) -> CResult<()> {
        if name.starts_with('$') {
            return self.error_at(span, "cannot assign to special variables", r);
        }
        self.variable(name, false);
        Ok(())
    }

    /// Resolve a name: local of the current function, captured local of
    /// an enclosing function (threading upvalue descriptors through
    /// every function in between), or global.
    fn variable(&mut self, name: &str, is_load: bool) {
        let current_depth = self.current_function_depth();

        for scope_index in (0..self.scopes.len()).rev() {
            let Some(&local) = self.scopes[scope_index].locals.get(name) else {
                continue;
            };
            let local_depth = self.scopes[scope_index].function_depth;

            if local_depth == current_depth {
                self.emit_op(if is_load { Op::GetLocal } else { Op::SetLocal });
                self.emit_u32(local.index);
                return;
            }

            // Captured from an enclosing function: mark the local and
            // thread an upvalue descriptor through every function from
            // the one directly inside the definer down to the current
            // one.
            if let Some(entry) = self.scopes[scope_index].locals.get_mut(name) {
                entry.captured = true;
            }
            let mut last_index = self.add_upvalue(
                local_depth + 1,
                UpvalueDesc { index: local.index, is_local: true },
            );
            for depth in local_depth + 2..=current_depth {
                last_index =
                    self.add_upvalue(depth, UpvalueDesc { index: last_index, is_local: false });
            }

            self.emit_op(if is_load { Op::GetUpvalue } else { Op::SetUpvalue });
            self.emit_u32(last_index);
            return;
        }

        let (constant, _) = self.heap.string_constant(name);
        self.load_constant(constant);
        self.emit_op(if is_load { Op::GetGlobal } else { Op::SetGlobal });
    }

    fn add_upvalue(&mut self, function_depth: u32, desc: UpvalueDesc) -> u32 {
        let upvalues = &mut self.functions[function_depth as usize].upvalues;
        for (i, existing) in upvalues.iter().enumerate() {
            if *existing == desc {
                return i as u32;
            }
        }
        upvalues.push(desc);
        (upvalues.len() - 1) as u32
    }

    fn get_field(&mut self, name: &str) {
        let (constant, _) = self.heap.string_constant(name);
        self.load_constant(constant);
        self.emit_op(Op::GetField);
    }

    fn begin_scope(&mut self, kind: ScopeKind) {
        let function_depth = self.current_function_depth();
        self.scopes.push(Scope {
            locals: AHashMap::new(),
            function_depth,
            kind,
            finally_chunk: None,
        });
    }

    fn end_scope(&mut self) {
        let Some(scope_index) = self.scopes.len().checked_sub(1) else {
            return;
        };
        // Function-boundary scopes skip the pops: Return discards the
        // whole frame window anyway.
        let is_function_boundary = self.scopes[scope_index].function_depth != 0
            && (scope_index == 0
                || self.scopes[scope_index].function_depth
                    != self.scopes[scope_index - 1].function_depth);
        if !is_function_boundary {
            self.scope_cleanup(scope_index);
        }
        self.scopes.pop();
    }

    fn scope_cleanup(&mut self, scope_index: usize) {
        self.pop_locals(scope_index);
        match self.scopes[scope_index].kind {
            ScopeKind::Try => self.emit_op(Op::TryEnd),
            ScopeKind::Finally => self.emit_op(Op::FinallyEnd),
            _ => {}
        }
    }

    fn pop_locals(&mut self, scope_index: usize) {
        let locals: Vec<Local> = self.scopes[scope_index].locals.values().copied().collect();
        for local in locals {
            if local.captured {
                self.emit_op(Op::CloseUpvalue);
                self.emit_u8(local.index as u8);
            }
            self.emit_op(Op::PopStack);
        }
    }

    /// Emit the cleanup a non-local jump (ret/break) owes the given
    /// scope: optional pops, TryEnd for protected regions, and the
    /// inlined finally for regions that carry one.
    fn cleanup_before_jump(&mut self, scope_index: usize, pop_locals: bool) {
        if pop_locals {
            self.pop_locals(scope_index);
        }
        match self.scopes[scope_index].kind {
            ScopeKind::Try => {
                self.emit_op(Op::TryEnd);
                if let Some(finally) = self.scopes[scope_index].finally_chunk {
                    self.inline_finally(finally);
                }
            }
            ScopeKind::Catch => {
                if let Some(finally) = self.scopes[scope_index].finally_chunk {
                    self.inline_finally(finally);
                }
            }
            _ => {}
        }
    }

    fn inline_finally(&mut self, index: usize) {
        let Compiler { chunks, finally_chunks, .. } = self;
        if let Some(chunk) = chunks.last_mut() {
            chunk.append(&finally_chunks[index]);
        }
    }

    fn current_function_depth(&self) -> u32 {
        self.scopes.last().map(|s| s.function_depth).unwrap_or(0)
    }

    // === Emission ===

    fn line(&self) -> u32 {
        self.line_stack.last().copied().unwrap_or(0)
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        self.chunks.last_mut().expect("chunk stack is never empty while compiling")
    }

    fn emit_op(&mut self, op: Op) {
        let line = self.line();
        self.current_chunk().push_op(op, line);
    }

    fn emit_u8(&mut self, value: u8) {
        let line = self.line();
        self.current_chunk().push_u8(value, line);
    }

    fn emit_u32(&mut self, value: u32) {
        let line = self.line();
        self.current_chunk().push_u32(value, line);
    }

    fn load_constant(&mut self, index: u32) {
        self.emit_op(Op::GetConstant);
        self.emit_u32(index);
    }

    /// Emit a forward jump with a placeholder operand; returns the
    /// operand offset for `set_jump_to_here`.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        let at = self.current_chunk().len();
        self.emit_u32(0);
        at
    }

    fn emit_jump_back(&mut self, target: usize) {
        self.emit_op(Op::JumpBack);
        let distance = (self.current_chunk().len() + 4 - target) as u32;
        self.emit_u32(distance);
    }

    fn set_jump_to_here(&mut self, operand_offset: usize) {
        let distance = (self.current_chunk().len() - (operand_offset + 4)) as u32;
        self.current_chunk().patch_u32(operand_offset, distance);
    }

    fn current_location(&mut self) -> usize {
        self.current_chunk().len()
    }

    fn error_at<T>(&mut self, span: Span, message: &str, r: &mut dyn Reporter) -> CResult<T> {
        self.had_error = true;
        r.compiler_error(self.map, span, message);
        Err(CompileError)
    }
}

fn stmt_allowed_in_match(stmt: &Stmt) -> bool {
    !matches!(
        stmt.kind,
        StmtKind::VarDecl(_)
            | StmtKind::Fn(_)
            | StmtKind::Class { .. }
            | StmtKind::Impl { .. }
            | StmtKind::Use { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CollectingReporter;
    use crate::lexer::tokenize;
    use crate::parser::Parser;
    use std::path::PathBuf;

    fn compile_source(src: &str) -> (Heap, CompileResult, CollectingReporter) {
        let mut map = SourceMap::new(src.to_string(), "<test>".into(), PathBuf::from("."));
        let mut reporter = CollectingReporter::default();
        let lexed = tokenize(src, &mut map, &mut reporter);
        assert!(!lexed.had_error, "lex errors: {:?}", reporter.messages());
        let outcome = Parser::new(&lexed.tokens, &map).parse(&mut reporter);
        assert!(!outcome.had_error, "parse errors: {:?}", reporter.messages());
        let mut heap = Heap::new();
        let result = Compiler::compile(&outcome.ast, &map, &mut heap, &mut reporter);
        (heap, result, reporter)
    }

    fn ops_of(heap: &Heap, function: ObjId) -> Vec<Op> {
        // Walk the chunk decoding operand widths so tests can assert on
        // opcode sequences.
        let chunk = &heap.function(function).chunk;
        let mut ops = Vec::new();
        let mut i = 0;
        while i < chunk.code.len() {
            let op = Op::try_from(chunk.code[i]).expect("valid opcode");
            ops.push(op);
            i += 1 + match op {
                Op::GetConstant
                | Op::GetLocal
                | Op::SetLocal
                | Op::GetUpvalue
                | Op::SetUpvalue
                | Op::Jump
                | Op::JumpIfTrue
                | Op::JumpIfFalse
                | Op::JumpIfFalseAndPop
                | Op::JumpBack
                | Op::Call
                | Op::TryBegin => 4,
                Op::CloseUpvalue => 1,
                Op::Closure => {
                    let count = chunk.code[i + 1] as usize;
                    1 + count * 2
                }
                _ => 0,
            };
        }
        ops
    }

    #[test]
    fn line_table_matches_code_length() {
        let (heap, result, _) = compile_source("x : 1;\nputln(x + 2);\n");
        assert!(!result.had_error);
        let chunk = &heap.function(result.function).chunk;
        assert_eq!(chunk.code.len(), chunk.lines.len());
    }

    #[test]
    fn globals_compile_to_create_global() {
        let (heap, result, _) = compile_source("x : 1;");
        assert!(!result.had_error);
        let ops = ops_of(&heap, result.function);
        assert_eq!(
            ops,
            vec![Op::GetConstant, Op::GetConstant, Op::CreateGlobal, Op::LoadNull, Op::Return]
        );
    }

    #[test]
    fn block_locals_compile_to_slots() {
        let (heap, result, _) = compile_source("{ x : 1; put(x); }");
        assert!(!result.had_error);
        let ops = ops_of(&heap, result.function);
        assert!(ops.contains(&Op::GetLocal));
        assert!(ops.contains(&Op::PopStack));
    }

    #[test]
    fn redeclaration_in_same_scope_is_an_error() {
        let (_, result, reporter) = compile_source("{ x : 1; x : 2; }");
        assert!(result.had_error);
        assert!(reporter.any_contains("redeclaration"));
    }

    #[test]
    fn dollar_names_cannot_be_declared_or_assigned() {
        let (_, result, reporter) = compile_source("$x : 1;");
        assert!(result.had_error);
        assert!(reporter.any_contains("cannot start with '$'"));

        let (_, result, reporter) = compile_source("fn f(a) { $b = a; }");
        assert!(result.had_error);
        assert!(reporter.any_contains("special variables"));
    }

    #[test]
    fn closures_emit_upvalue_descriptors() {
        let src = "fn make() { x : 0; ret || { x = x + 1; ret x; }; }";
        let (heap, result, _) = compile_source(src);
        assert!(!result.had_error);
        let ops = ops_of(&heap, result.function);
        // The lambda body captured `x`, so `make`'s chunk carries a
        // Closure instruction.
        let make_chunk_has_closure = {
            // `make` is the first non-string function constant after the script.
            let mut found = false;
            for i in 0..heap.constant_count() {
                if let Some(Value::Obj(id)) = heap.constant(i as u32) {
                    if let crate::value::Obj::Function(f) = heap.get(id) {
                        if heap.str_chars(f.name) == "make" && !f.chunk.is_empty() {
                            found = ops_of(&heap, id).contains(&Op::Closure);
                        }
                    }
                }
            }
            found
        };
        assert!(make_chunk_has_closure);
        assert!(!ops.contains(&Op::Closure)); // script itself captures nothing
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let (_, result, reporter) = compile_source("break;");
        assert!(result.had_error);
        assert!(reporter.any_contains("break outside of a loop"));
    }

    #[test]
    fn break_inside_finally_is_an_error() {
        let (_, result, reporter) =
            compile_source("loop { try { put(1); } finally { break; } }");
        assert!(result.had_error);
        assert!(reporter.any_contains("break not allowed inside finally"));
    }

    #[test]
    fn ret_inside_finally_is_an_error() {
        let (_, result, reporter) =
            compile_source("fn f() { try { put(1); } finally { ret 1; } }");
        assert!(result.had_error);
        assert!(reporter.any_contains("ret not allowed inside finally"));
    }

    #[test]
    fn class_outside_global_scope_is_an_error() {
        let (_, result, reporter) = compile_source("{ class C { } }");
        assert!(result.had_error);
        assert!(reporter.any_contains("global scope"));
    }

    #[test]
    fn try_lowering_nests_two_protected_regions() {
        let (heap, result, _) =
            compile_source("try { put(1); } catch TypeError { put(2); } finally { put(3); }");
        assert!(!result.had_error);
        let ops = ops_of(&heap, result.function);
        let try_begins = ops.iter().filter(|&&op| op == Op::TryBegin).count();
        assert_eq!(try_begins, 2);
        // The finally body (FinallyBegin..FinallyEnd) is inlined on
        // both the normal and the exceptional path.
        let finally_begins = ops.iter().filter(|&&op| op == Op::FinallyBegin).count();
        assert_eq!(finally_begins, 2);
        assert!(ops.contains(&Op::Rethrow));
    }

    #[test]
    fn use_forms_lower_to_import() {
        let (heap, result, _) = compile_source("use \"mod\" -> m;");
        assert!(!result.had_error);
        let ops = ops_of(&heap, result.function);
        assert_eq!(
            &ops[..5],
            &[Op::GetConstant, Op::Import, Op::ModuleSetLoaded, Op::GetConstant, Op::CreateGlobal]
        );
    }

    #[test]
    fn methods_attach_with_store_method() {
        let (heap, result, _) = compile_source("class P { fn $init($) { } fn get($) { } }");
        assert!(!result.had_error);
        let ops = ops_of(&heap, result.function);
        assert_eq!(ops.iter().filter(|&&op| op == Op::StoreMethod).count(), 2);
        assert!(ops.contains(&Op::CreateClass));
    }
}
