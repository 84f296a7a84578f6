//! Bytecode Compiler
//!
//! Lowers the typed AST into fixed four-byte instructions against a flat
//! register window per call frame. Register occupancy is a 256-bit bitmap;
//! expression evaluation acquires scratch registers and releases them by
//! restoring a saved snapshot. Calls allocate one contiguous block so the
//! callee and its arguments land at `B, B+1 … B+argc`.
//!
//! Literal numbers, strings, and types are pooled per function. When the
//! parser marked a node accelerated (or hoistable), the matching fast-path
//! opcode (or a precomputed constant) is emitted instead of the generic
//! form.

use crate::ast::{AstKind, AstNode, IfBranch, ParseBinding};
use crate::context::{Context, ErrorKind};
use crate::object::{
    FnObj, ModuleDebug, ModuleObj, Obj, make_fn, make_module, make_string_hashed, value_is_equal,
};
use crate::op::{Op, OpCode};
use crate::parser::Parser;
use crate::tokenizer::{Literal, Token, TokenKind, Tokenizer};
use crate::value::Value;

const INVALID_REGISTER: u8 = u8::MAX;

/// Occupancy of the 256 registers.
#[derive(Clone, Copy)]
struct RegisterState {
    regs: [u64; 4],
}

impl RegisterState {
    fn new() -> RegisterState {
        RegisterState { regs: [0; 4] }
    }
}

struct LoopFrame {
    /// Jump target for `continue` (the loop's test instruction).
    continue_target: usize,
    /// Instruction indices whose offsets jump past the loop end.
    break_patches: Vec<usize>,
}

/// Per-function compilation state.
struct FnCtx<'a> {
    registers: RegisterState,
    saved: Vec<RegisterState>,
    min_top: u8,

    bindings: Vec<(String, u8)>,

    constants: Vec<Value>,
    output: Vec<Op>,
    debug: Vec<u32>,

    /// Captures of the function being compiled, as recorded by the parser.
    upvals: &'a [ParseBinding],

    loops: Vec<LoopFrame>,
}

impl<'a> FnCtx<'a> {
    fn new(upvals: &'a [ParseBinding]) -> FnCtx<'a> {
        FnCtx {
            registers: RegisterState::new(),
            saved: Vec::new(),
            min_top: 0,
            bindings: Vec::new(),
            constants: Vec::new(),
            output: Vec::new(),
            debug: Vec::new(),
            upvals,
            loops: Vec::new(),
        }
    }

    fn get_register(&mut self) -> u8 {
        for (word, offset) in self.registers.regs.iter_mut().zip([0u8, 64, 128, 192]) {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as u8;
            *word |= 1u64 << bit;
            let reg = offset + bit;
            if reg + 1 > self.min_top {
                self.min_top = reg + 1;
            }
            return reg;
        }
        INVALID_REGISTER
    }

    /// Acquire `count` consecutive registers, returning the first.
    fn get_registers(&mut self, count: u8) -> u8 {
        if count == 0 {
            return self.get_register();
        }
        'outer: for start in 0..=(255 - count) {
            for i in 0..count {
                let reg = start + i;
                if self.registers.regs[(reg / 64) as usize] & (1u64 << (reg % 64)) != 0 {
                    continue 'outer;
                }
            }
            for i in 0..count {
                let reg = start + i;
                self.registers.regs[(reg / 64) as usize] |= 1u64 << (reg % 64);
            }
            if start + count > self.min_top {
                self.min_top = start + count;
            }
            return start;
        }
        INVALID_REGISTER
    }

    fn free_register(&mut self, reg: u8) {
        self.registers.regs[(reg / 64) as usize] &= !(1u64 << (reg % 64));
    }

    fn push_registers(&mut self) {
        self.saved.push(self.registers);
    }

    fn restore_registers(&mut self) {
        self.registers = self.saved.pop().expect("register snapshot");
    }

    fn make_binding(&mut self, name: &str) -> u8 {
        let reg = self.get_register();
        self.bindings.push((name.to_string(), reg));
        reg
    }

    fn find_binding(&self, name: &str) -> u8 {
        for (bound, reg) in self.bindings.iter().rev() {
            if bound == name {
                return *reg;
            }
        }
        INVALID_REGISTER
    }

    fn find_upval(&self, name: &str) -> Option<u8> {
        self.upvals
            .iter()
            .position(|u| u.name == name)
            .map(|i| i as u8)
    }

    /// Block scoping: remember the binding count, and on exit drop the block
    /// locals and release their registers.
    fn enter_block(&self) -> usize {
        self.bindings.len()
    }

    fn exit_block(&mut self, mark: usize) {
        while self.bindings.len() > mark {
            let (_, reg) = self.bindings.pop().expect("binding");
            self.free_register(reg);
        }
    }

    fn emit(&mut self, op: Op, source: &Token) {
        self.output.push(op);
        self.debug
            .push(((source.line as u32) << 16) | source.col as u32);
    }

    fn here(&self) -> usize {
        self.output.len()
    }

    /// Patch a previously emitted branch to jump to `target`.
    fn patch_jump(&mut self, at: usize, target: usize) {
        let offset = target as isize - (at as isize + 1);
        self.output[at].set_ibc(offset as i16);
    }

    fn push_constant(&mut self, value: Value) -> u8 {
        for (idx, existing) in self.constants.iter().enumerate() {
            if value_is_equal(*existing, value) {
                return idx as u8;
            }
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u8
    }
}

pub fn compile(ctx: &mut Context, mut parser: Parser) -> Option<*mut ModuleObj> {
    let root = parser.root.take()?;
    let imports = std::mem::take(&mut parser.imports);
    let tokenizer = parser.tokenizer;

    let module = make_module(ctx, imports);
    ctx.push_root(module as *mut Obj);

    let mut compiler = Compiler {
        tokenizer: &tokenizer,
        module,
        had_error: false,
    };

    let no_upvals: Vec<ParseBinding> = Vec::new();
    let mut fctx = FnCtx::new(&no_upvals);

    let AstKind::Module { body } = &root.kind else {
        ctx.pop_root();
        return None;
    };

    for stmt in body {
        compiler.compile_statement(ctx, &mut fctx, stmt);
    }
    fctx.emit(Op::a(OpCode::Halt, 0), &root.source);

    unsafe {
        (*module).constants = fctx.constants;
        (*module).instructions = fctx.output;
        (*module).stack_size = fctx.min_top;
        if ctx.compiler_options.generate_debug_info {
            (*module).debug = Some(ModuleDebug {
                source: tokenizer.source.clone(),
                tokens: tokenizer.tokens.clone(),
                locs: fctx.debug,
            });
        }
    }

    ctx.pop_root();

    if compiler.had_error {
        None
    } else {
        Some(module)
    }
}

struct Compiler<'a> {
    tokenizer: &'a Tokenizer,
    module: *mut ModuleObj,
    had_error: bool,
}

impl<'a> Compiler<'a> {
    fn error(&mut self, ctx: &mut Context, message: &str, source: &Token) {
        let name = self.tokenizer.source_name.clone();
        ctx.report_error(ErrorKind::Compile, &name, message, source.line, source.col);
        self.had_error = true;
    }

    fn accelerate(&self, ctx: &Context, op: Op, wanted: bool) -> Op {
        if wanted && ctx.compiler_options.accelerate {
            op.accelerate()
        } else {
            op
        }
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn compile_statement(&mut self, ctx: &mut Context, fctx: &mut FnCtx, stmt: &AstNode) {
        match &stmt.kind {
            AstKind::Module { body } => {
                for inner in body {
                    self.compile_statement(ctx, fctx, inner);
                }
            }

            AstKind::Let {
                name, initializer, ..
            } => {
                let reg = fctx.make_binding(name);
                if reg == INVALID_REGISTER {
                    self.error(ctx, "out of registers", &stmt.source);
                    return;
                }
                match initializer {
                    Some(init) => self.compile_expression(ctx, fctx, init, reg),
                    None => fctx.emit(Op::a(OpCode::LoadNull, reg), &stmt.source),
                }
            }

            AstKind::Alias { .. } => {}

            AstKind::Return { expr } => match expr {
                Some(expr) => {
                    fctx.push_registers();
                    let reg = fctx.get_register();
                    self.compile_expression(ctx, fctx, expr, reg);
                    fctx.emit(Op::a(OpCode::Return, reg), &stmt.source);
                    fctx.restore_registers();
                }
                None => fctx.emit(Op::a(OpCode::End, 0), &stmt.source),
            },

            AstKind::If(branch) => self.compile_if(ctx, fctx, stmt, branch),

            AstKind::LoopWhile { condition, body } => {
                let start = fctx.here();
                fctx.push_registers();
                let creg = fctx.get_register();
                self.compile_expression(ctx, fctx, condition, creg);
                let exit = fctx.here();
                fctx.emit(Op::aibc(OpCode::JmpF, creg, 0), &condition.source);
                fctx.restore_registers();

                fctx.loops.push(LoopFrame {
                    continue_target: start,
                    break_patches: Vec::new(),
                });
                self.compile_block(ctx, fctx, body);
                let jump_back = fctx.here();
                fctx.emit(Op::aibc(OpCode::Jmp, 0, 0), &stmt.source);
                fctx.patch_jump(jump_back, start);

                let end = fctx.here();
                fctx.patch_jump(exit, end);
                let frame = fctx.loops.pop().expect("loop frame");
                for patch in frame.break_patches {
                    fctx.patch_jump(patch, end);
                }
            }

            AstKind::LoopNumeric {
                var_name,
                start,
                stop,
                step,
                body,
            } => {
                let mark = fctx.enter_block();
                let base = fctx.get_registers(3);
                if base == INVALID_REGISTER {
                    self.error(ctx, "out of registers", &stmt.source);
                    return;
                }
                fctx.bindings.push((var_name.clone(), base));

                self.compile_expression(ctx, fctx, start, base);
                match step {
                    Some(step) => self.compile_expression(ctx, fctx, step, base + 1),
                    None => fctx.emit(Op::aibc(OpCode::LoadSmall, base + 1, 1), &stmt.source),
                }
                self.compile_expression(ctx, fctx, stop, base + 2);

                // Pre-decrement so the first NUMFOR lands on the start value.
                fctx.emit(
                    Op::abc(OpCode::Sub, base, base, base + 1).accelerate(),
                    &stmt.source,
                );

                let test = fctx.here();
                fctx.emit(Op::aibc(OpCode::NumFor, base, 0), &stmt.source);

                fctx.loops.push(LoopFrame {
                    continue_target: test,
                    break_patches: Vec::new(),
                });
                self.compile_block(ctx, fctx, body);
                let jump_back = fctx.here();
                fctx.emit(Op::aibc(OpCode::Jmp, 0, 0), &stmt.source);
                fctx.patch_jump(jump_back, test);

                let end = fctx.here();
                fctx.patch_jump(test, end);
                let frame = fctx.loops.pop().expect("loop frame");
                for patch in frame.break_patches {
                    fctx.patch_jump(patch, end);
                }

                // The step and stop registers are loop plumbing; the binding
                // itself goes away with the block.
                fctx.exit_block(mark);
                fctx.free_register(base + 1);
                fctx.free_register(base + 2);
            }

            AstKind::LoopIterator {
                var_name,
                iterator,
                body,
                ..
            } => {
                let mark = fctx.enter_block();
                let base = fctx.get_registers(2);
                if base == INVALID_REGISTER {
                    self.error(ctx, "out of registers", &stmt.source);
                    return;
                }
                fctx.bindings.push((var_name.clone(), base));

                self.compile_expression(ctx, fctx, iterator, base + 1);

                let test = fctx.here();
                fctx.emit(Op::aibc(OpCode::IterFor, base, 0), &stmt.source);

                fctx.loops.push(LoopFrame {
                    continue_target: test,
                    break_patches: Vec::new(),
                });
                self.compile_block(ctx, fctx, body);
                let jump_back = fctx.here();
                fctx.emit(Op::aibc(OpCode::Jmp, 0, 0), &stmt.source);
                fctx.patch_jump(jump_back, test);

                let end = fctx.here();
                fctx.patch_jump(test, end);
                let frame = fctx.loops.pop().expect("loop frame");
                for patch in frame.break_patches {
                    fctx.patch_jump(patch, end);
                }

                fctx.exit_block(mark);
                fctx.free_register(base + 1);
            }

            AstKind::Break => match fctx.loops.is_empty() {
                false => {
                    let at = fctx.here();
                    fctx.loops.last_mut().expect("loop frame").break_patches.push(at);
                    fctx.emit(Op::aibc(OpCode::Jmp, 0, 0), &stmt.source);
                }
                true => self.error(ctx, "'break' outside of a loop", &stmt.source),
            },

            AstKind::Continue => match fctx.loops.last() {
                Some(frame) => {
                    let target = frame.continue_target;
                    let at = fctx.here();
                    fctx.emit(Op::aibc(OpCode::Jmp, 0, 0), &stmt.source);
                    fctx.patch_jump(at, target);
                }
                None => self.error(ctx, "'continue' outside of a loop", &stmt.source),
            },

            AstKind::Export { key, ty, inner } => {
                self.compile_statement(ctx, fctx, inner);

                fctx.push_registers();
                let kreg = fctx.get_register();
                let vreg = fctx.get_register();
                let treg = fctx.get_register();

                let kidx = fctx.push_constant(*key);
                fctx.emit(Op::aubc(OpCode::Load, kreg, kidx as u16), &stmt.source);

                match &inner.kind {
                    AstKind::Let { name, .. } => {
                        let reg = fctx.find_binding(name);
                        fctx.emit(Op::ab(OpCode::Move, vreg, reg), &stmt.source);
                    }
                    AstKind::Alias { ty: aliased, .. } => {
                        let idx = fctx.push_constant(Value::object(*aliased as *mut Obj));
                        fctx.emit(Op::aubc(OpCode::Load, vreg, idx as u16), &stmt.source);
                    }
                    _ => {}
                }

                let tidx = fctx.push_constant(Value::object(*ty as *mut Obj));
                fctx.emit(Op::aubc(OpCode::Load, treg, tidx as u16), &stmt.source);

                fctx.emit(Op::abc(OpCode::Export, kreg, vreg, treg), &stmt.source);
                fctx.restore_registers();
            }

            AstKind::Method {
                receiver,
                key,
                func,
            } => {
                fctx.push_registers();
                let treg = fctx.get_register();
                let kreg = fctx.get_register();
                let freg = fctx.get_register();

                let tidx = fctx.push_constant(Value::object(*receiver as *mut Obj));
                fctx.emit(Op::aubc(OpCode::Load, treg, tidx as u16), &stmt.source);
                let kidx = fctx.push_constant(*key);
                fctx.emit(Op::aubc(OpCode::Load, kreg, kidx as u16), &stmt.source);
                self.compile_expression(ctx, fctx, func, freg);

                fctx.emit(Op::abc(OpCode::TSet, treg, kreg, freg), &stmt.source);
                fctx.restore_registers();
            }

            // Expression statement: evaluate into a scratch register.
            _ => {
                fctx.push_registers();
                let reg = fctx.get_register();
                self.compile_expression(ctx, fctx, stmt, reg);
                fctx.restore_registers();
            }
        }
    }

    fn compile_block(&mut self, ctx: &mut Context, fctx: &mut FnCtx, body: &[AstNode]) {
        let mark = fctx.enter_block();
        for stmt in body {
            self.compile_statement(ctx, fctx, stmt);
        }
        fctx.exit_block(mark);
    }

    fn compile_if(&mut self, ctx: &mut Context, fctx: &mut FnCtx, stmt: &AstNode, branch: &IfBranch) {
        let mut end_patches = Vec::new();
        self.compile_if_chain(ctx, fctx, stmt, branch, &mut end_patches);
        let end = fctx.here();
        for patch in end_patches {
            fctx.patch_jump(patch, end);
        }
    }

    fn compile_if_chain(
        &mut self,
        ctx: &mut Context,
        fctx: &mut FnCtx,
        stmt: &AstNode,
        branch: &IfBranch,
        end_patches: &mut Vec<usize>,
    ) {
        match &branch.condition {
            Some(condition) => {
                let mark = fctx.enter_block();

                let test_reg;
                if branch.is_let {
                    // `if let x = expr`: x becomes a block-local holding the
                    // unwrapped value; entry is guarded by an EXISTS test.
                    let name = branch.let_name.clone().unwrap_or_default();
                    let breg = fctx.make_binding(&name);
                    self.compile_expression(ctx, fctx, condition, breg);
                    fctx.push_registers();
                    test_reg = fctx.get_register();
                    fctx.emit(Op::ab(OpCode::Exists, test_reg, breg), &condition.source);
                } else {
                    fctx.push_registers();
                    test_reg = fctx.get_register();
                    self.compile_expression(ctx, fctx, condition, test_reg);
                }

                let skip = fctx.here();
                fctx.emit(Op::aibc(OpCode::JmpF, test_reg, 0), &condition.source);
                fctx.restore_registers();

                for inner in &branch.body {
                    self.compile_statement(ctx, fctx, inner);
                }
                fctx.exit_block(mark);

                if let Some(next) = &branch.next {
                    let to_end = fctx.here();
                    fctx.emit(Op::aibc(OpCode::Jmp, 0, 0), &stmt.source);
                    end_patches.push(to_end);

                    let else_start = fctx.here();
                    fctx.patch_jump(skip, else_start);

                    if let AstKind::If(inner) = &next.kind {
                        self.compile_if_chain(ctx, fctx, next, inner, end_patches);
                    }
                } else {
                    let after = fctx.here();
                    fctx.patch_jump(skip, after);
                }
            }
            None => {
                // Trailing else.
                self.compile_block(ctx, fctx, &branch.body);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn find_binding_or_compile_temp(
        &mut self,
        ctx: &mut Context,
        fctx: &mut FnCtx,
        expr: &AstNode,
    ) -> u8 {
        if let AstKind::Identifier = expr.kind {
            let name = self.tokenizer.token_text(&expr.source);
            let reg = fctx.find_binding(name);
            if reg != INVALID_REGISTER {
                return reg;
            }
        }
        let reg = fctx.get_register();
        self.compile_expression(ctx, fctx, expr, reg);
        reg
    }

    fn find_binding_or_compile_loc(
        &mut self,
        ctx: &mut Context,
        fctx: &mut FnCtx,
        expr: &AstNode,
        backup: u8,
    ) -> u8 {
        if let AstKind::Identifier = expr.kind {
            let name = self.tokenizer.token_text(&expr.source);
            let reg = fctx.find_binding(name);
            if reg != INVALID_REGISTER {
                return reg;
            }
        }
        self.compile_expression(ctx, fctx, expr, backup);
        backup
    }

    fn number_constant(&mut self, fctx: &mut FnCtx, dst: u8, value: f64, source: &Token) {
        if value.fract() == 0.0 && value >= i16::MIN as f64 && value <= i16::MAX as f64 {
            fctx.emit(Op::aibc(OpCode::LoadSmall, dst, value as i16), source);
        } else {
            let idx = fctx.push_constant(Value::number(value));
            fctx.emit(Op::aubc(OpCode::Load, dst, idx as u16), source);
        }
    }

    fn compile_expression(
        &mut self,
        ctx: &mut Context,
        fctx: &mut FnCtx,
        expr: &AstNode,
        dst: u8,
    ) {
        match &expr.kind {
            AstKind::Literal => match expr.source.kind {
                TokenKind::TrueLit => fctx.emit(Op::ab(OpCode::LoadBool, dst, 1), &expr.source),
                TokenKind::FalseLit => fctx.emit(Op::ab(OpCode::LoadBool, dst, 0), &expr.source),
                TokenKind::NullLit => fctx.emit(Op::a(OpCode::LoadNull, dst), &expr.source),
                TokenKind::NumberLit => {
                    let Literal::Number(value) = self.tokenizer.literal(&expr.source) else {
                        self.error(ctx, "malformed number literal", &expr.source);
                        return;
                    };
                    self.number_constant(fctx, dst, *value, &expr.source);
                }
                TokenKind::StringLit => {
                    let Literal::Str(text) = self.tokenizer.literal(&expr.source) else {
                        self.error(ctx, "malformed string literal", &expr.source);
                        return;
                    };
                    let text = text.clone();
                    let s = make_string_hashed(ctx, &text);
                    let idx = fctx.push_constant(Value::object(s as *mut Obj));
                    fctx.emit(Op::aubc(OpCode::Load, dst, idx as u16), &expr.source);
                }
                TokenKind::IdentifierLit => {
                    let text = self.tokenizer.token_text(&expr.source).to_string();
                    let s = make_string_hashed(ctx, &text);
                    let idx = fctx.push_constant(Value::object(s as *mut Obj));
                    fctx.emit(Op::aubc(OpCode::Load, dst, idx as u16), &expr.source);
                }
                _ => self.error(ctx, "unsupported literal", &expr.source),
            },

            AstKind::EnumLiteral { value } => {
                if value.is_number() {
                    self.number_constant(fctx, dst, value.as_number(), &expr.source);
                } else {
                    let idx = fctx.push_constant(*value);
                    fctx.emit(Op::aubc(OpCode::Load, dst, idx as u16), &expr.source);
                }
            }

            AstKind::TypeLiteral { ty } => {
                let idx = fctx.push_constant(Value::object(*ty as *mut Obj));
                fctx.emit(Op::aubc(OpCode::Load, dst, idx as u16), &expr.source);
            }

            AstKind::Identifier => {
                let name = self.tokenizer.token_text(&expr.source).to_string();
                let reg = fctx.find_binding(&name);
                if reg != INVALID_REGISTER {
                    fctx.emit(Op::ab(OpCode::Move, dst, reg), &expr.source);
                    return;
                }
                if let Some(idx) = fctx.find_upval(&name) {
                    fctx.emit(Op::ab(OpCode::LoadUp, dst, idx), &expr.source);
                    return;
                }
                self.error(ctx, &format!("unresolved identifier '{}'", name), &expr.source);
            }

            AstKind::ImportRef { index } => {
                fctx.emit(Op::ab(OpCode::LoadImport, dst, *index as u8), &expr.source);
            }

            AstKind::Array { items } => {
                fctx.emit(
                    Op::aibc(OpCode::Array, dst, items.len() as i16),
                    &expr.source,
                );
                fctx.push_registers();
                let vreg = fctx.get_register();
                let ireg = fctx.get_register();
                for (i, item) in items.iter().enumerate() {
                    self.compile_expression(ctx, fctx, item, vreg);
                    fctx.emit(Op::aibc(OpCode::LoadSmall, ireg, i as i16), &item.source);
                    fctx.emit(Op::abc(OpCode::StoreSubF, dst, ireg, vreg), &item.source);
                }
                fctx.restore_registers();
            }

            AstKind::Table { fields, shape } => {
                if shape.is_null() {
                    fctx.emit(
                        Op::aibc(OpCode::Table, dst, fields.len() as i16),
                        &expr.source,
                    );
                } else {
                    fctx.push_registers();
                    let treg = fctx.get_register();
                    let tidx = fctx.push_constant(Value::object(*shape as *mut Obj));
                    fctx.emit(Op::aubc(OpCode::Load, treg, tidx as u16), &expr.source);
                    fctx.emit(
                        Op::abc(OpCode::Table, dst, fields.len() as u8, treg).accelerate(),
                        &expr.source,
                    );
                    fctx.restore_registers();
                }

                fctx.push_registers();
                let vreg = fctx.get_register();
                for field in fields {
                    self.compile_expression(ctx, fctx, &field.expr, vreg);
                    let kidx = fctx.push_constant(field.key);
                    fctx.emit(Op::abc(OpCode::StoreIdxK, dst, kidx, vreg), &field.expr.source);
                }
                fctx.restore_registers();
            }

            AstKind::Function {
                args,
                body,
                upvals,
                ..
            } => {
                let func = self.compile_fn(ctx, fctx, expr, args, body, upvals);
                let Some(func) = func else { return };
                let idx = fctx.push_constant(Value::object(func as *mut Obj));

                if upvals.is_empty() {
                    fctx.emit(Op::aubc(OpCode::Load, dst, idx as u16), &expr.source);
                    return;
                }

                // CLOSE expects the fn at B and the captured values in the
                // registers after it.
                fctx.push_registers();
                let base = fctx.get_registers(upvals.len() as u8 + 1);
                if base == INVALID_REGISTER {
                    self.error(ctx, "out of registers", &expr.source);
                    fctx.restore_registers();
                    return;
                }
                fctx.emit(Op::aubc(OpCode::Load, base, idx as u16), &expr.source);

                for (i, upval) in upvals.iter().enumerate() {
                    let slot = base + 1 + i as u8;
                    let local = fctx.find_binding(&upval.name);
                    if local != INVALID_REGISTER {
                        fctx.emit(Op::ab(OpCode::Move, slot, local), &expr.source);
                    } else if let Some(uidx) = fctx.find_upval(&upval.name) {
                        fctx.emit(Op::ab(OpCode::LoadUp, slot, uidx), &expr.source);
                    } else {
                        self.error(
                            ctx,
                            &format!("cannot capture '{}'", upval.name),
                            &expr.source,
                        );
                    }
                }

                fctx.emit(
                    Op::abc(OpCode::Close, dst, base, upvals.len() as u8),
                    &expr.source,
                );
                fctx.restore_registers();
            }

            AstKind::UnaryOp { operand, accelerated } => {
                match expr.source.kind {
                    TokenKind::Plus => {
                        self.compile_expression(ctx, fctx, operand, dst);
                    }
                    TokenKind::Minus => {
                        fctx.push_registers();
                        let oreg = self.find_binding_or_compile_temp(ctx, fctx, operand);
                        let op = self.accelerate(ctx, Op::ab(OpCode::Neg, dst, oreg), *accelerated);
                        fctx.emit(op, &expr.source);
                        fctx.restore_registers();
                    }
                    TokenKind::Not => {
                        fctx.push_registers();
                        let oreg = self.find_binding_or_compile_temp(ctx, fctx, operand);
                        fctx.emit(Op::ab(OpCode::Not, dst, oreg), &expr.source);
                        fctx.restore_registers();
                    }
                    TokenKind::Bang => {
                        fctx.push_registers();
                        let oreg = self.find_binding_or_compile_temp(ctx, fctx, operand);
                        fctx.emit(Op::ab(OpCode::Expect, dst, oreg), &expr.source);
                        fctx.restore_registers();
                    }
                    TokenKind::Question => {
                        fctx.push_registers();
                        let oreg = self.find_binding_or_compile_temp(ctx, fctx, operand);
                        fctx.emit(Op::ab(OpCode::Exists, dst, oreg), &expr.source);
                        fctx.restore_registers();
                    }
                    _ => self.error(ctx, "unsupported unary operator", &expr.source),
                }
            }

            AstKind::BinaryOp { .. } => self.compile_binary(ctx, fctx, expr, dst),

            AstKind::Call {
                callee,
                args,
                is_methodcall,
                ..
            } => self.compile_call(ctx, fctx, expr, callee, args, *is_methodcall, dst),

            _ => self.error(ctx, "expression expected", &expr.source),
        }
    }

    fn compile_fn(
        &mut self,
        ctx: &mut Context,
        _outer: &mut FnCtx,
        expr: &AstNode,
        args: &[crate::ast::FnArg],
        body: &[AstNode],
        upvals: &[ParseBinding],
    ) -> Option<*mut FnObj> {
        let mut fctx = FnCtx::new(upvals);

        for arg in args {
            fctx.make_binding(&arg.name);
        }

        for stmt in body {
            self.compile_statement(ctx, &mut fctx, stmt);
        }

        // A function without a trailing return still unwinds cleanly.
        fctx.emit(Op::a(OpCode::End, 0), &expr.source);
        fctx.emit(Op::a(OpCode::Halt, 0), &expr.source);

        let signature = expr.ty;
        let func = make_fn(
            ctx,
            self.module,
            signature,
            fctx.constants,
            fctx.output,
            fctx.min_top,
        );
        if ctx.compiler_options.generate_debug_info {
            unsafe { (*func).debug = Some(fctx.debug) };
        }
        Some(func)
    }

    fn compile_call(
        &mut self,
        ctx: &mut Context,
        fctx: &mut FnCtx,
        expr: &AstNode,
        callee: &AstNode,
        args: &[AstNode],
        is_methodcall: bool,
        dst: u8,
    ) {
        fctx.push_registers();

        let total_args = args.len() as u8 + is_methodcall as u8;
        let base = fctx.get_registers(total_args + 1);
        if base == INVALID_REGISTER {
            self.error(ctx, "out of registers", &expr.source);
            fctx.restore_registers();
            return;
        }

        if is_methodcall {
            // obj.method(args): the receiver is evaluated once into the
            // first argument slot, and the callee is loaded off it.
            let AstKind::BinaryOp { left, key, .. } = &callee.kind else {
                self.error(ctx, "malformed method call", &expr.source);
                fctx.restore_registers();
                return;
            };
            self.compile_expression(ctx, fctx, left, base + 1);
            let kidx = fctx.push_constant(*key);
            fctx.emit(
                Op::abc(OpCode::LoadIdxK, base, base + 1, kidx),
                &callee.source,
            );
            for (i, arg) in args.iter().enumerate() {
                self.compile_expression(ctx, fctx, arg, base + 2 + i as u8);
            }
        } else {
            self.compile_expression(ctx, fctx, callee, base);
            for (i, arg) in args.iter().enumerate() {
                self.compile_expression(ctx, fctx, arg, base + 1 + i as u8);
            }
        }

        fctx.emit(Op::abc(OpCode::Call, dst, base, total_args), &expr.source);
        fctx.restore_registers();
    }

    fn compile_binary(&mut self, ctx: &mut Context, fctx: &mut FnCtx, expr: &AstNode, dst: u8) {
        let AstKind::BinaryOp {
            left,
            right,
            accelerated,
            hoistable,
            from,
            key,
            idx,
        } = &expr.kind
        else {
            unreachable!()
        };
        let accelerated = *accelerated;

        match expr.source.kind {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Mul
            | TokenKind::Div
            | TokenKind::Equals
            | TokenKind::NotEq
            | TokenKind::Lt
            | TokenKind::Lte
            | TokenKind::Gt
            | TokenKind::Gte
            | TokenKind::And
            | TokenKind::Or
            | TokenKind::NullCoalesce => {
                fctx.push_registers();
                let lreg = self.find_binding_or_compile_loc(ctx, fctx, left, dst);
                let rreg = self.find_binding_or_compile_temp(ctx, fctx, right);

                let (code, a, b, c) = match expr.source.kind {
                    TokenKind::Plus => (OpCode::Add, dst, lreg, rreg),
                    TokenKind::Minus => (OpCode::Sub, dst, lreg, rreg),
                    TokenKind::Mul => (OpCode::Mul, dst, lreg, rreg),
                    TokenKind::Div => (OpCode::Div, dst, lreg, rreg),
                    TokenKind::Equals => (OpCode::Eq, dst, lreg, rreg),
                    TokenKind::NotEq => (OpCode::Neq, dst, lreg, rreg),
                    TokenKind::Lt => (OpCode::Lt, dst, lreg, rreg),
                    TokenKind::Lte => (OpCode::Lte, dst, lreg, rreg),
                    // Greater-than flips the operands of the less-than ops.
                    TokenKind::Gt => (OpCode::Lt, dst, rreg, lreg),
                    TokenKind::Gte => (OpCode::Lte, dst, rreg, lreg),
                    TokenKind::And => (OpCode::And, dst, lreg, rreg),
                    TokenKind::Or => (OpCode::Or, dst, lreg, rreg),
                    TokenKind::NullCoalesce => (OpCode::Coalesce, dst, lreg, rreg),
                    _ => unreachable!(),
                };
                let op = self.accelerate(ctx, Op::abc(code, a, b, c), accelerated);
                fctx.emit(op, &expr.source);
                fctx.restore_registers();
            }

            TokenKind::Assign
            | TokenKind::PlusEq
            | TokenKind::MinusEq
            | TokenKind::MulEq
            | TokenKind::DivEq => {
                self.compile_assignment(ctx, fctx, expr, left, right, accelerated, dst);
            }

            TokenKind::Period | TokenKind::IdentifierLit => {
                // Hoistable accesses resolve to a constant when the member
                // value already exists on the type.
                if *hoistable {
                    if let Some(value) = crate::types::type_get_field(ctx, *from, *key) {
                        let cidx = fctx.push_constant(value);
                        fctx.emit(Op::aubc(OpCode::Load, dst, cidx as u16), &expr.source);
                        return;
                    }
                }

                fctx.push_registers();
                let lreg = self.find_binding_or_compile_temp(ctx, fctx, left);
                if accelerated && ctx.compiler_options.accelerate {
                    fctx.emit(
                        Op::abc(OpCode::LoadIdx, dst, lreg, *idx).accelerate(),
                        &expr.source,
                    );
                } else {
                    let kidx = fctx.push_constant(*key);
                    fctx.emit(Op::abc(OpCode::LoadIdxK, dst, lreg, kidx), &expr.source);
                }
                fctx.restore_registers();
            }

            TokenKind::LeftBracket => {
                fctx.push_registers();
                let lreg = self.find_binding_or_compile_loc(ctx, fctx, left, dst);
                let rreg = self.find_binding_or_compile_temp(ctx, fctx, right);
                if accelerated && ctx.compiler_options.accelerate {
                    fctx.emit(Op::abc(OpCode::LoadSubF, dst, lreg, rreg), &expr.source);
                } else {
                    fctx.emit(Op::abc(OpCode::LoadIdx, dst, lreg, rreg), &expr.source);
                }
                fctx.restore_registers();
            }

            TokenKind::Is | TokenKind::Satisfies | TokenKind::As => {
                fctx.push_registers();
                let lreg = self.find_binding_or_compile_loc(ctx, fctx, left, dst);
                let treg = fctx.get_register();
                self.compile_expression(ctx, fctx, right, treg);
                let code = match expr.source.kind {
                    TokenKind::Is => OpCode::TCheck,
                    TokenKind::Satisfies => OpCode::TSatis,
                    _ => OpCode::TCast,
                };
                let op = Op::abc(code, dst, lreg, treg);
                let op = if code == OpCode::TCast {
                    self.accelerate(ctx, op, accelerated)
                } else {
                    op
                };
                fctx.emit(op, &expr.source);
                fctx.restore_registers();
            }

            TokenKind::Compose => {
                fctx.push_registers();
                let lreg = self.find_binding_or_compile_loc(ctx, fctx, left, dst);
                let rreg = self.find_binding_or_compile_temp(ctx, fctx, right);
                fctx.emit(Op::abc(OpCode::Compose, dst, lreg, rreg), &expr.source);
                fctx.restore_registers();
            }

            _ => self.error(ctx, "unsupported binary operator", &expr.source),
        }
    }

    fn compile_assignment(
        &mut self,
        ctx: &mut Context,
        fctx: &mut FnCtx,
        expr: &AstNode,
        target: &AstNode,
        value: &AstNode,
        accelerated: bool,
        dst: u8,
    ) {
        let compound = match expr.source.kind {
            TokenKind::PlusEq => Some(OpCode::Add),
            TokenKind::MinusEq => Some(OpCode::Sub),
            TokenKind::MulEq => Some(OpCode::Mul),
            TokenKind::DivEq => Some(OpCode::Div),
            _ => None,
        };

        match &target.kind {
            AstKind::Identifier => {
                let name = self.tokenizer.token_text(&target.source).to_string();
                let local = fctx.find_binding(&name);

                if local != INVALID_REGISTER {
                    match compound {
                        Some(code) => {
                            fctx.push_registers();
                            let rreg = self.find_binding_or_compile_temp(ctx, fctx, value);
                            let op = self.accelerate(
                                ctx,
                                Op::abc(code, local, local, rreg),
                                accelerated,
                            );
                            fctx.emit(op, &expr.source);
                            fctx.restore_registers();
                        }
                        None => self.compile_expression(ctx, fctx, value, local),
                    }
                    fctx.emit(Op::ab(OpCode::Move, dst, local), &expr.source);
                    return;
                }

                if let Some(uidx) = fctx.find_upval(&name) {
                    fctx.push_registers();
                    let tmp = fctx.get_register();
                    match compound {
                        Some(code) => {
                            fctx.emit(Op::ab(OpCode::LoadUp, tmp, uidx), &expr.source);
                            let rreg = self.find_binding_or_compile_temp(ctx, fctx, value);
                            let op =
                                self.accelerate(ctx, Op::abc(code, tmp, tmp, rreg), accelerated);
                            fctx.emit(op, &expr.source);
                        }
                        None => self.compile_expression(ctx, fctx, value, tmp),
                    }
                    fctx.emit(Op::ab(OpCode::StoreUp, uidx, tmp), &expr.source);
                    fctx.emit(Op::ab(OpCode::Move, dst, tmp), &expr.source);
                    fctx.restore_registers();
                    return;
                }

                self.error(ctx, &format!("unresolved identifier '{}'", name), &expr.source);
            }

            AstKind::BinaryOp {
                left,
                right,
                key,
                idx,
                accelerated: target_accel,
                ..
            } => {
                fctx.push_registers();
                let obj_reg = self.find_binding_or_compile_temp(ctx, fctx, left);

                match target.source.kind {
                    TokenKind::Period | TokenKind::IdentifierLit => {
                        let vreg = fctx.get_register();
                        match compound {
                            Some(code) => {
                                let kidx = fctx.push_constant(*key);
                                fctx.emit(
                                    Op::abc(OpCode::LoadIdxK, vreg, obj_reg, kidx),
                                    &expr.source,
                                );
                                let rreg = self.find_binding_or_compile_temp(ctx, fctx, value);
                                let op = self
                                    .accelerate(ctx, Op::abc(code, vreg, vreg, rreg), accelerated);
                                fctx.emit(op, &expr.source);
                            }
                            None => self.compile_expression(ctx, fctx, value, vreg),
                        }

                        if *target_accel && ctx.compiler_options.accelerate {
                            fctx.emit(
                                Op::abc(OpCode::StoreIdx, obj_reg, *idx, vreg).accelerate(),
                                &expr.source,
                            );
                        } else {
                            let kidx = fctx.push_constant(*key);
                            fctx.emit(
                                Op::abc(OpCode::StoreIdxK, obj_reg, kidx, vreg),
                                &expr.source,
                            );
                        }
                        fctx.emit(Op::ab(OpCode::Move, dst, vreg), &expr.source);
                    }

                    TokenKind::LeftBracket => {
                        let ireg = self.find_binding_or_compile_temp(ctx, fctx, right);
                        let vreg = fctx.get_register();
                        match compound {
                            Some(code) => {
                                if *target_accel && ctx.compiler_options.accelerate {
                                    fctx.emit(
                                        Op::abc(OpCode::LoadSubF, vreg, obj_reg, ireg),
                                        &expr.source,
                                    );
                                } else {
                                    fctx.emit(
                                        Op::abc(OpCode::LoadIdx, vreg, obj_reg, ireg),
                                        &expr.source,
                                    );
                                }
                                let rreg = self.find_binding_or_compile_temp(ctx, fctx, value);
                                let op = self
                                    .accelerate(ctx, Op::abc(code, vreg, vreg, rreg), accelerated);
                                fctx.emit(op, &expr.source);
                            }
                            None => self.compile_expression(ctx, fctx, value, vreg),
                        }

                        if *target_accel && ctx.compiler_options.accelerate {
                            fctx.emit(
                                Op::abc(OpCode::StoreSubF, obj_reg, ireg, vreg),
                                &expr.source,
                            );
                        } else {
                            fctx.emit(
                                Op::abc(OpCode::StoreIdx, obj_reg, ireg, vreg),
                                &expr.source,
                            );
                        }
                        fctx.emit(Op::ab(OpCode::Move, dst, vreg), &expr.source);
                    }

                    _ => self.error(ctx, "invalid assignment target", &expr.source),
                }
                fctx.restore_registers();
            }

            _ => self.error(ctx, "invalid assignment target", &expr.source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjKind, obj_kind};

    fn compile_source(ctx: &mut Context, source: &str) -> Option<*mut ModuleObj> {
        ctx.compile_module(source, "<test>")
    }

    fn ops(module: *mut ModuleObj) -> Vec<OpCode> {
        unsafe { (*module).instructions.iter().map(|op| op.code()).collect() }
    }

    #[test]
    fn test_small_number_uses_immediate() {
        let mut ctx = Context::new();
        let module = compile_source(&mut ctx, "let x = 5").unwrap();
        assert!(ops(module).contains(&OpCode::LoadSmall));
        unsafe {
            assert!((*module).constants.is_empty());
        }
    }

    #[test]
    fn test_large_number_pooled() {
        let mut ctx = Context::new();
        let module = compile_source(&mut ctx, "let x = 123456.5\nlet y = 123456.5").unwrap();
        unsafe {
            // Deduplicated: one constant despite two uses.
            assert_eq!((*module).constants.len(), 1);
        }
    }

    #[test]
    fn test_accelerated_arithmetic_flag() {
        let mut ctx = Context::new();
        let module = compile_source(&mut ctx, "let x = 1\nlet y = 2\nreturn x + y").unwrap();
        unsafe {
            let add = (*module)
                .instructions
                .iter()
                .find(|op| op.code() == OpCode::Add)
                .expect("add emitted");
            assert!(add.is_accelerated());
        }
    }

    #[test]
    fn test_string_concat_not_accelerated() {
        let mut ctx = Context::new();
        let module =
            compile_source(&mut ctx, "let a = \"x\"\nlet b = \"y\"\nreturn a + b").unwrap();
        unsafe {
            let add = (*module)
                .instructions
                .iter()
                .find(|op| op.code() == OpCode::Add)
                .expect("add emitted");
            assert!(!add.is_accelerated());
        }
    }

    #[test]
    fn test_closure_emits_close() {
        let mut ctx = Context::new();
        let module = compile_source(
            &mut ctx,
            "fn make(): fn: number { var n = 0 return fn: number { n += 1 return n } }",
        )
        .unwrap();
        // The outer function's stream holds the CLOSE.
        unsafe {
            let outer = (*module).constants.iter().find_map(|c| {
                if c.is_object() {
                    let obj = c.as_object();
                    if obj_kind(obj) == ObjKind::Fn {
                        return Some(obj as *mut FnObj);
                    }
                }
                None
            });
            let outer = outer.expect("outer fn constant");
            let has_close = (*outer)
                .instructions
                .iter()
                .any(|op| op.code() == OpCode::Close);
            assert!(has_close);
        }
    }

    #[test]
    fn test_numeric_loop_shape() {
        let mut ctx = Context::new();
        let module =
            compile_source(&mut ctx, "var sum = 0\nfor i in 10 { sum += i }\nreturn sum").unwrap();
        let codes = ops(module);
        assert!(codes.contains(&OpCode::NumFor));
        assert!(codes.contains(&OpCode::Jmp));
    }

    #[test]
    fn test_module_ends_with_halt() {
        let mut ctx = Context::new();
        let module = compile_source(&mut ctx, "let x = 1").unwrap();
        let codes = ops(module);
        assert_eq!(*codes.last().unwrap(), OpCode::Halt);
    }

    #[test]
    fn test_export_emits_export_op() {
        let mut ctx = Context::new();
        let module = compile_source(&mut ctx, "export let answer = 42").unwrap();
        assert!(ops(module).contains(&OpCode::Export));
    }
}
