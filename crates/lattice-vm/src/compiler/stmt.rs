// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Statement lowering: bindings, assignment, loops, defer, import.

use lattice_core::{AssignTarget, Expr, LetPattern, Line, Stmt};

use super::{CompileError, Compiler, LoopCtx, NameLoc};
use crate::bytecode::{encode_abc, encode_abx, encode_asbx, op};
use crate::value::Value;

impl Compiler {
    /// Compile one statement. When `dst` is given the statement sits in
    /// value position: expression statements produce their value there,
    /// everything else produces Unit.
    pub(super) fn compile_stmt(
        &mut self,
        stmt: &Stmt,
        dst: Option<u8>,
    ) -> Result<(), CompileError> {
        match stmt {
            Stmt::Expr { value, line: _ } => {
                if let Some(dst) = dst {
                    self.compile_expr(value, dst)?;
                } else {
                    let temp = self.alloc_reg(value.line())?;
                    self.compile_expr(value, temp)?;
                    self.free_reg(temp);
                }
                return Ok(());
            }
            Stmt::Let {
                pattern,
                value,
                fixed,
                line,
            } => self.compile_let(pattern, value, *fixed, *line)?,
            Stmt::Assign {
                target,
                value,
                line,
            } => self.compile_assign(target, value, *line)?,
            Stmt::Return { value, line } => {
                let temp = self.alloc_reg(*line)?;
                match value {
                    Some(expr) => self.compile_expr(expr, temp)?,
                    None => self.emit(encode_abc(op::LOADUNIT, temp, 0, 0), *line),
                }
                self.emit_return(temp, *line)?;
                self.free_reg(temp);
            }
            Stmt::While { cond, body, line } => self.compile_while(cond, body, *line)?,
            Stmt::For {
                var,
                iter,
                body,
                line,
            } => self.compile_for(var, iter, body, *line)?,
            Stmt::Break { line } => {
                let Some(ctx) = self.cur_ref().loops.last() else {
                    return Err(CompileError::BreakOutsideLoop { line: *line });
                };
                debug_assert!(self.cur_ref().scope_depth >= ctx.scope_depth);
                let at = self.emit_jump(op::JMP, 0, *line);
                self.cur()
                    .loops
                    .last_mut()
                    .expect("loop context")
                    .break_jumps
                    .push(at);
            }
            Stmt::Continue { line } => {
                if self.cur_ref().loops.is_empty() {
                    return Err(CompileError::ContinueOutsideLoop { line: *line });
                }
                let at = self.emit_jump(op::JMP, 0, *line);
                self.cur()
                    .loops
                    .last_mut()
                    .expect("loop context")
                    .continue_jumps
                    .push(at);
            }
            Stmt::Throw { value, line } => {
                let temp = self.alloc_reg(*line)?;
                self.compile_expr(value, temp)?;
                self.emit(encode_abc(op::THROW, temp, 0, 0), *line);
                self.free_reg(temp);
            }
            Stmt::Defer { body, line } => {
                self.cur().has_defers = true;
                let depth = self.cur_ref().scope_depth;
                #[expect(clippy::cast_possible_truncation, reason = "scope depth fits u8")]
                let at = self.emit_jump(op::DEFER_PUSH, depth as u8, *line);
                // The deferred body sits inline; DEFER_PUSH skips it.
                for inner in &body.stmts {
                    self.compile_stmt(inner, None)?;
                }
                let end_line = body.stmts.last().map_or(*line, Stmt::line);
                self.emit(encode_abc(op::HALT, 0, 0, 0), end_line);
                self.patch_jump(at, *line)?;
            }
            Stmt::Import {
                path,
                names,
                alias,
                line,
            } => self.compile_import(path, names.as_deref(), alias.as_deref(), *line)?,
        }

        if let Some(dst) = dst {
            self.emit(encode_abc(op::LOADUNIT, dst, 0, 0), stmt.line());
        }
        Ok(())
    }

    // --- let / fix ---

    fn compile_let(
        &mut self,
        pattern: &LetPattern,
        value: &Expr,
        fixed: bool,
        line: Line,
    ) -> Result<(), CompileError> {
        // Top-level script bindings live in the global environment so
        // the host (and spawned children) can see them.
        if self.states.len() == 1 && self.cur_ref().scope_depth == 0 {
            return self.compile_let_global(pattern, value, fixed, line);
        }
        match pattern {
            LetPattern::Ident(name) => {
                let reg = self.alloc_reg(line)?;
                self.compile_expr(value, reg)?;
                self.declare_local(name, reg);
                if fixed {
                    self.emit_freeze_var(name, NameLoc::Local(reg), false, line)?;
                }
            }
            LetPattern::Array { elements, rest } => {
                let src = self.alloc_reg(line)?;
                self.compile_expr(value, src)?;
                for (i, name) in elements.iter().enumerate() {
                    let reg = self.alloc_reg(line)?;
                    let idx = self.alloc_reg(line)?;
                    let small = i64::try_from(i).unwrap_or(i64::MAX);
                    self.emit_load_int(small, idx, line)?;
                    self.emit(encode_abc(op::GETINDEX, reg, src, idx), line);
                    self.free_reg(idx);
                    self.declare_local(name, reg);
                    if fixed {
                        self.emit_freeze_var(name, NameLoc::Local(reg), false, line)?;
                    }
                }
                if let Some(rest_name) = rest {
                    // rest = src[n..len(src)]
                    let reg = self.alloc_reg(line)?;
                    let lo = self.alloc_reg(line)?;
                    let hi = self.alloc_reg(line)?;
                    let n = i64::try_from(elements.len()).unwrap_or(i64::MAX);
                    self.emit_load_int(n, lo, line)?;
                    self.emit(encode_abc(op::LEN, hi, src, 0), line);
                    self.emit(encode_abc(op::BUILDRANGE, lo, lo, hi), line);
                    self.emit(encode_abc(op::GETINDEX, reg, src, lo), line);
                    self.free_reg(hi);
                    self.free_reg(lo);
                    self.declare_local(rest_name, reg);
                    if fixed {
                        self.emit_freeze_var(rest_name, NameLoc::Local(reg), false, line)?;
                    }
                }
                // The source value stays alive below the bindings and is
                // released with the scope.
            }
            LetPattern::Struct { fields } => {
                let src = self.alloc_reg(line)?;
                self.compile_expr(value, src)?;
                for (field, binding) in fields {
                    let reg = self.alloc_reg(line)?;
                    self.emit_get_field(reg, src, field, line)?;
                    self.declare_local(binding, reg);
                    if fixed {
                        self.emit_freeze_var(binding, NameLoc::Local(reg), false, line)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn compile_let_global(
        &mut self,
        pattern: &LetPattern,
        value: &Expr,
        fixed: bool,
        line: Line,
    ) -> Result<(), CompileError> {
        let src = self.alloc_reg(line)?;
        self.compile_expr(value, src)?;
        let mut define = |this: &mut Self, name: &str, reg: u8| -> Result<(), CompileError> {
            this.emit_define_global(name, reg, line)?;
            if fixed {
                this.emit_freeze_var(name, NameLoc::Global, false, line)?;
            }
            Ok(())
        };
        match pattern {
            LetPattern::Ident(name) => define(self, name, src)?,
            LetPattern::Array { elements, rest } => {
                for (i, name) in elements.iter().enumerate() {
                    let reg = self.alloc_reg(line)?;
                    let idx = self.alloc_reg(line)?;
                    self.emit_load_int(i64::try_from(i).unwrap_or(i64::MAX), idx, line)?;
                    self.emit(encode_abc(op::GETINDEX, reg, src, idx), line);
                    self.free_reg(idx);
                    define(self, name, reg)?;
                    self.free_reg(reg);
                }
                if let Some(rest_name) = rest {
                    let reg = self.alloc_reg(line)?;
                    let lo = self.alloc_reg(line)?;
                    let hi = self.alloc_reg(line)?;
                    let n = i64::try_from(elements.len()).unwrap_or(i64::MAX);
                    self.emit_load_int(n, lo, line)?;
                    self.emit(encode_abc(op::LEN, hi, src, 0), line);
                    self.emit(encode_abc(op::BUILDRANGE, lo, lo, hi), line);
                    self.emit(encode_abc(op::GETINDEX, reg, src, lo), line);
                    self.free_reg(hi);
                    self.free_reg(lo);
                    define(self, rest_name, reg)?;
                    self.free_reg(reg);
                }
            }
            LetPattern::Struct { fields } => {
                for (field, binding) in fields {
                    let reg = self.alloc_reg(line)?;
                    self.emit_get_field(reg, src, field, line)?;
                    define(self, binding, reg)?;
                    self.free_reg(reg);
                }
            }
        }
        self.free_reg(src);
        Ok(())
    }

    /// `GETFIELD` with the name in the constant pool; falls back to
    /// `GETINDEX` with a string key when the pool index outgrows the
    /// 8-bit C field.
    pub(super) fn emit_get_field(
        &mut self,
        dst: u8,
        obj: u8,
        field: &str,
        line: Line,
    ) -> Result<(), CompileError> {
        let idx = self.add_constant(Value::str(field), line)?;
        if let Ok(short) = u8::try_from(idx) {
            self.emit(encode_abc(op::GETFIELD, dst, obj, short), line);
        } else {
            let key = self.alloc_reg(line)?;
            self.emit(encode_abx(op::LOADK, key, idx), line);
            self.emit(encode_abc(op::GETINDEX, dst, obj, key), line);
            self.free_reg(key);
        }
        Ok(())
    }

    pub(super) fn emit_set_field(
        &mut self,
        obj: u8,
        field: &str,
        src: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        let idx = self.add_constant(Value::str(field), line)?;
        if let Ok(short) = u8::try_from(idx) {
            self.emit(encode_abc(op::SETFIELD, obj, short, src), line);
        } else {
            let key = self.alloc_reg(line)?;
            self.emit(encode_abx(op::LOADK, key, idx), line);
            self.emit(encode_abc(op::SETINDEX, obj, key, src), line);
            self.free_reg(key);
        }
        Ok(())
    }

    // --- assignment ---

    fn compile_assign(
        &mut self,
        target: &AssignTarget,
        value: &Expr,
        line: Line,
    ) -> Result<(), CompileError> {
        match target {
            AssignTarget::Ident(name) => {
                let temp = self.alloc_reg(line)?;
                self.compile_expr(value, temp)?;
                match self.resolve_name(name)? {
                    NameLoc::Local(reg) => {
                        self.emit(encode_abc(op::MOVE, reg, temp, 0), line);
                    }
                    NameLoc::Upvalue(up) => {
                        self.emit(encode_abc(op::SETUPVALUE, temp, up, 0), line);
                    }
                    NameLoc::Global => {
                        let idx = self.add_constant(Value::str(name), line)?;
                        self.emit(encode_abx(op::SETGLOBAL, temp, idx), line);
                    }
                }
                self.free_reg(temp);
            }
            AssignTarget::Index { obj, index } => {
                // In-place variant when the container is a resolved local.
                if let Expr::Ident { name, .. } = obj.as_ref() {
                    if let Some(obj_reg) = self.resolve_local(name) {
                        let idx = self.alloc_reg(line)?;
                        self.compile_expr(index, idx)?;
                        let val = self.alloc_reg(line)?;
                        self.compile_expr(value, val)?;
                        self.emit(encode_abc(op::SETINDEX_LOCAL, obj_reg, idx, val), line);
                        self.free_reg(val);
                        self.free_reg(idx);
                        return Ok(());
                    }
                }
                let obj_reg = self.alloc_reg(line)?;
                self.compile_expr(obj, obj_reg)?;
                let idx = self.alloc_reg(line)?;
                self.compile_expr(index, idx)?;
                let val = self.alloc_reg(line)?;
                self.compile_expr(value, val)?;
                self.emit(encode_abc(op::SETINDEX, obj_reg, idx, val), line);
                self.free_reg(val);
                self.free_reg(idx);
                self.free_reg(obj_reg);
            }
            AssignTarget::Slice { obj, start, end } => {
                let local = if let Expr::Ident { name, .. } = obj.as_ref() {
                    self.resolve_local(name)
                } else {
                    None
                };
                let obj_reg = match local {
                    Some(reg) => reg,
                    None => {
                        let r = self.alloc_reg(line)?;
                        self.compile_expr(obj, r)?;
                        r
                    }
                };
                let lo = self.alloc_reg(line)?;
                self.compile_expr(start, lo)?;
                let hi = self.alloc_reg(line)?;
                self.compile_expr(end, hi)?;
                self.emit(encode_abc(op::BUILDRANGE, lo, lo, hi), line);
                let val = self.alloc_reg(line)?;
                self.compile_expr(value, val)?;
                let opcode = if local.is_some() {
                    op::SETSLICE_LOCAL
                } else {
                    op::SETSLICE
                };
                self.emit(encode_abc(opcode, obj_reg, lo, val), line);
                self.free_reg(val);
                self.free_reg(hi);
                self.free_reg(lo);
                if local.is_none() {
                    self.free_reg(obj_reg);
                }
            }
            AssignTarget::Field { obj, field } => {
                let obj_reg = self.alloc_reg(line)?;
                self.compile_expr(obj, obj_reg)?;
                let val = self.alloc_reg(line)?;
                self.compile_expr(value, val)?;
                self.emit_set_field(obj_reg, field, val, line)?;
                self.free_reg(val);
                // Write the mutated container back when the target is a name.
                if let Expr::Ident { name, .. } = obj.as_ref() {
                    match self.resolve_name(name)? {
                        NameLoc::Local(reg) => {
                            self.emit(encode_abc(op::MOVE, reg, obj_reg, 0), line);
                        }
                        NameLoc::Upvalue(up) => {
                            self.emit(encode_abc(op::SETUPVALUE, obj_reg, up, 0), line);
                        }
                        NameLoc::Global => {
                            let idx = self.add_constant(Value::str(name), line)?;
                            self.emit(encode_abx(op::SETGLOBAL, obj_reg, idx), line);
                        }
                    }
                }
                self.free_reg(obj_reg);
            }
        }
        Ok(())
    }

    // --- loops ---

    fn compile_while(
        &mut self,
        cond: &Expr,
        body: &lattice_core::Block,
        line: Line,
    ) -> Result<(), CompileError> {
        let start = self.cur_ref().chunk.code_len();
        let scope_depth = self.cur_ref().scope_depth;
        self.cur().loops.push(LoopCtx {
            start,
            is_for: false,
            scope_depth,
            ..LoopCtx::default()
        });

        let cond_reg = self.alloc_reg(line)?;
        self.compile_expr(cond, cond_reg)?;
        let exit = self.emit_jump(op::JMPFALSE, cond_reg, line);
        self.free_reg(cond_reg);

        self.compile_block_stmts(body)?;
        self.emit_loop_jump(start, line)?;
        self.patch_jump(exit, line)?;

        let ctx = self.cur().loops.pop().expect("loop context");
        debug_assert!(!ctx.is_for);
        for jump in ctx.break_jumps {
            self.patch_jump(jump, line)?;
        }
        for jump in &ctx.continue_jumps {
            self.patch_backward(*jump, ctx.start, line)?;
        }
        Ok(())
    }

    fn compile_for(
        &mut self,
        var: &str,
        iter: &Expr,
        body: &lattice_core::Block,
        line: Line,
    ) -> Result<(), CompileError> {
        // Integer ranges take the specialized counter loop.
        if let Expr::Range { start, end, .. } = iter {
            return self.compile_for_range(var, start, end, body, line);
        }
        self.begin_scope();

        let coll = self.alloc_reg(line)?;
        self.compile_expr(iter, coll)?;
        self.emit(encode_abc(op::ITERINIT, coll, coll, 0), line);

        let idx = self.alloc_reg(line)?;
        self.emit(encode_asbx(op::LOADI, idx, 0), line);

        let var_reg = self.alloc_reg(line)?;
        self.declare_local(var, var_reg);

        let start = self.cur_ref().chunk.code_len();
        let scope_depth = self.cur_ref().scope_depth;
        self.cur().loops.push(LoopCtx {
            start,
            is_for: true,
            scope_depth,
            ..LoopCtx::default()
        });

        self.emit(encode_abc(op::ITERNEXT, var_reg, coll, idx), line);
        let probe = self.emit_jump(op::JMPNOTNIL, var_reg, line);
        let exit = self.emit_jump(op::JMP, 0, line);
        self.patch_jump(probe, line)?;

        self.compile_block_stmts(body)?;
        self.emit_loop_jump(start, line)?;
        self.patch_jump(exit, line)?;

        let ctx = self.cur().loops.pop().expect("loop context");
        for jump in ctx.break_jumps {
            self.patch_jump(jump, line)?;
        }
        for jump in &ctx.continue_jumps {
            // For-loops continue at the increment (the ITERNEXT head).
            self.patch_backward(*jump, ctx.start, line)?;
        }

        self.end_scope(line);
        // The hidden collection and index registers sit below the loop
        // variable, so the scope pop does not reclaim them.
        self.free_reg(idx);
        self.free_reg(coll);
        Ok(())
    }

    /// `for i in lo..hi`: statically-typed counter loop using the
    /// specialized integer opcodes. Continue jumps are forward jumps
    /// patched to the increment.
    fn compile_for_range(
        &mut self,
        var: &str,
        start: &Expr,
        end: &Expr,
        body: &lattice_core::Block,
        line: Line,
    ) -> Result<(), CompileError> {
        self.begin_scope();

        let var_reg = self.alloc_reg(line)?;
        self.compile_expr(start, var_reg)?;
        self.declare_local(var, var_reg);
        let hi = self.alloc_reg(line)?;
        self.compile_expr(end, hi)?;

        let loop_start = self.cur_ref().chunk.code_len();
        let scope_depth = self.cur_ref().scope_depth;
        self.cur().loops.push(LoopCtx {
            start: loop_start,
            is_for: true,
            scope_depth,
            ..LoopCtx::default()
        });

        let probe = self.alloc_reg(line)?;
        self.emit(encode_abc(op::LT_INT, probe, var_reg, hi), line);
        let exit = self.emit_jump(op::JMPFALSE, probe, line);
        self.free_reg(probe);

        self.compile_block_stmts(body)?;

        let ctx = self.cur().loops.pop().expect("loop context");
        // Continues land on the increment.
        for jump in ctx.continue_jumps {
            self.patch_jump(jump, line)?;
        }
        self.emit(encode_abc(op::INC_REG, var_reg, 0, 0), line);
        self.emit_loop_jump(loop_start, line)?;
        self.patch_jump(exit, line)?;
        for jump in ctx.break_jumps {
            self.patch_jump(jump, line)?;
        }

        self.end_scope(line);
        Ok(())
    }

    /// Patch a recorded forward-jump slot to point backwards at `target`.
    fn patch_backward(&mut self, at: usize, target: usize, line: Line) -> Result<(), CompileError> {
        let offset = target as i64 - at as i64 - 1;
        let Ok(offset) = i32::try_from(offset) else {
            return Err(CompileError::JumpTooFar { line });
        };
        self.cur().chunk.code[at] = crate::bytecode::encode_sbx24(op::JMP, offset);
        Ok(())
    }

    // --- import ---

    fn compile_import(
        &mut self,
        path: &str,
        names: Option<&[String]>,
        alias: Option<&str>,
        line: Line,
    ) -> Result<(), CompileError> {
        let module = self.alloc_reg(line)?;
        let path_idx = self.add_constant(Value::str(path), line)?;
        self.emit(encode_abx(op::IMPORT, module, path_idx), line);

        match names {
            Some(names) => {
                for name in names {
                    let field = self.alloc_reg(line)?;
                    self.emit_get_field(field, module, name, line)?;
                    let ok = self.emit_jump(op::JMPNOTNIL, field, line);
                    let msg = format!("module '{path}' does not export '{name}'");
                    self.emit_load_constant(Value::str(&msg), field, line)?;
                    self.emit(encode_abc(op::THROW, field, 0, 0), line);
                    self.patch_jump(ok, line)?;
                    self.emit_define_global(name, field, line)?;
                    self.free_reg(field);
                }
            }
            None => {
                let binding = alias.map_or_else(|| module_stem(path), str::to_string);
                self.emit_define_global(&binding, module, line)?;
            }
        }
        self.free_reg(module);
        Ok(())
    }
}

/// Default binding name of a whole-module import: the file stem.
fn module_stem(path: &str) -> String {
    let base = path.rsplit(['/', '\\']).next().unwrap_or(path);
    base.strip_suffix(".lat").unwrap_or(base).to_string()
}
