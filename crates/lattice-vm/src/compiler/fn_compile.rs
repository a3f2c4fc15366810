// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Function, closure, and sub-chunk compilation.
//!
//! Closures thread their captures through upvalue descriptors emitted
//! after the `CLOSURE` instruction. Spawn bodies, select arms, and scope
//! sync bodies compile as *boundary* sub-chunks: upvalue resolution stops
//! at the boundary and free names fall through to the global environment
//! (the runtime exports the parent's live locals as globals).

use std::sync::Arc;

use lattice_core::{Block, Expr, FnExpr, Line, Phase, SelectArm, SelectArmKind};

use super::{CompileError, Compiler, FuncState, UpvalDesc};
use crate::bytecode::{
    encode_abc, encode_abx, op, SELECT_ARM_BINDING, SELECT_ARM_DEFAULT, SELECT_ARM_TIMEOUT,
};
use crate::value::Value;

impl Compiler {
    /// Compile a function expression to a prototype constant and emit the
    /// `CLOSURE` instruction with its capture descriptors.
    pub(super) fn compile_closure(&mut self, func: &FnExpr, dst: u8) -> Result<(), CompileError> {
        let line = func.line;
        let arity =
            u8::try_from(func.params.len()).map_err(|_| CompileError::TooManyParams { line })?;

        self.states.push(FuncState::new(func.name.clone(), false));

        // Parameters occupy registers 1..=arity.
        for param in &func.params {
            let reg = self.alloc_reg(line)?;
            self.declare_local(&param.name, reg);
        }
        {
            let state = self.cur();
            state.chunk.arity = arity;
            state.chunk.variadic = func.variadic.is_some();
            if func.params.iter().any(|p| p.phase != Phase::Unphased) {
                state.chunk.param_phases = func.params.iter().map(|p| p.phase).collect();
            }
            state.ensures = func.ensures.clone();
            state.return_type = func.return_type.clone();
        }

        // Variadic rest parameter: pack excess arguments into an array.
        if let Some(rest) = &func.variadic {
            let rest_reg = self.alloc_reg(line)?;
            self.declare_local(rest, rest_reg);
            self.emit(encode_abc(op::COLLECT_VARARGS, rest_reg, rest_reg, 0), line);
        }

        // Entry code: defaults behind nil guards, then type guards.
        for (i, param) in func.params.iter().enumerate() {
            #[expect(clippy::cast_possible_truncation, reason = "arity fits u8")]
            let reg = (i + 1) as u8;
            if let Some(default) = &param.default {
                let skip = self.emit_jump(op::JMPNOTNIL, reg, line);
                self.compile_expr(default, reg)?;
                self.patch_jump(skip, line)?;
            }
            if let Some(ty) = &param.ty {
                let format = format!("parameter '{}' expects {ty}, got {{got}}", param.name);
                self.emit_check_type(reg, ty, &format, line)?;
            }
        }

        let rr = self.alloc_reg(line)?;
        self.compile_block(&func.body, rr)?;
        self.emit_return(rr, func.body.line)?;
        self.free_reg(rr);

        self.finish_closure(dst, line)
    }

    /// Pop the innermost function state and emit CLOSURE + descriptors.
    fn finish_closure(&mut self, dst: u8, line: Line) -> Result<(), CompileError> {
        let state = self.states.pop().expect("function state");
        let upvalues = state.upvalues.clone();
        let mut chunk = state.chunk;
        #[expect(clippy::cast_possible_truncation, reason = "upvalues capped at 255")]
        {
            chunk.upvalue_count = upvalues.len() as u8;
        }

        let proto = Value::chunk_closure(Arc::new(chunk));
        let proto_idx = self.add_constant(proto, line)?;
        self.emit(encode_abx(op::CLOSURE, dst, proto_idx), line);
        for desc in upvalues {
            self.emit(
                encode_abc(op::DATA, u8::from(desc.is_local), desc.index, 0),
                line,
            );
        }
        Ok(())
    }

    /// Return-site emission: type guard, `ensure` postconditions, frame
    /// defers, then `RETURN`.
    pub(super) fn emit_return(&mut self, reg: u8, line: Line) -> Result<(), CompileError> {
        let return_type = self.cur_ref().return_type.clone();
        let ensures = self.cur_ref().ensures.clone();

        if let Some(ty) = return_type {
            let format = format!("return type expects {ty}, got {{got}}");
            self.emit_check_type(reg, &ty, &format, line)?;
        }

        for ensure in &ensures {
            // `result` binds the returning value inside the predicate.
            let depth = self.cur_ref().scope_depth;
            self.cur().locals.push(super::Local {
                name: "result".to_string(),
                depth,
                reg,
                captured: false,
            });
            let g = self.alloc_reg(line)?;
            self.compile_expr(ensure, g)?;
            let ok = self.emit_jump(op::JMPTRUE, g, line);
            self.emit_load_constant(Value::str("ensure failed"), g, line)?;
            self.emit(encode_abc(op::THROW, g, 0, 0), line);
            self.patch_jump(ok, line)?;
            self.free_reg(g);
            self.cur().locals.pop();
        }

        if self.cur_ref().has_defers {
            self.emit(encode_abc(op::DEFER_RUN, 0, 0, 0), line);
        }
        self.emit(encode_abc(op::RETURN, reg, 1, 0), line);
        Ok(())
    }

    fn emit_check_type(
        &mut self,
        reg: u8,
        ty: &str,
        format: &str,
        line: Line,
    ) -> Result<(), CompileError> {
        let ty_idx = self.add_constant(Value::str(ty), line)?;
        let fmt_idx = self.add_constant(Value::str(format), line)?;
        self.emit(encode_abx(op::CHECK_TYPE, reg, ty_idx), line);
        self.emit(encode_abx(op::DATA, 0, fmt_idx), line);
        Ok(())
    }

    /// `compose(f, g)`: synthesize a one-parameter chunk computing
    /// `f(g(x))`, capturing `f` and `g` as upvalues from staging locals.
    pub(super) fn compile_compose(
        &mut self,
        f_expr: &Expr,
        g_expr: &Expr,
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        // Staging locals hold the composed functions until capture.
        let f_reg = self.alloc_reg(line)?;
        self.compile_expr(f_expr, f_reg)?;
        self.declare_local("__compose_f", f_reg);
        let g_reg = self.alloc_reg(line)?;
        self.compile_expr(g_expr, g_reg)?;
        self.declare_local("__compose_g", g_reg);

        // Synthesized chunk: x -> f(g(x)). Upvalue 0 = f, 1 = g.
        self.states.push(FuncState::new(Some("composed".to_string()), false));
        let x = self.alloc_reg(line)?;
        self.declare_local("x", x);
        self.cur().chunk.arity = 1;

        let inner = self.alloc_reg(line)?;
        self.emit(encode_abc(op::GETUPVALUE, inner, 1, 0), line);
        let a1 = self.alloc_reg(line)?;
        self.emit(encode_abc(op::MOVE, a1, x, 0), line);
        self.emit(encode_abc(op::CALL, inner, 1, 1), line);
        self.free_reg(a1);

        let outer = self.alloc_reg(line)?;
        self.emit(encode_abc(op::GETUPVALUE, outer, 0, 0), line);
        let a2 = self.alloc_reg(line)?;
        self.emit(encode_abc(op::MOVE, a2, inner, 0), line);
        self.emit(encode_abc(op::CALL, outer, 1, 1), line);
        self.free_reg(a2);

        self.emit(encode_abc(op::RETURN, outer, 1, 0), line);
        self.cur().upvalues = vec![
            UpvalDesc {
                index: f_reg,
                is_local: true,
            },
            UpvalDesc {
                index: g_reg,
                is_local: true,
            },
        ];
        self.finish_closure(dst, line)?;

        // Close over the staging registers before releasing them.
        self.emit(encode_abc(op::CLOSEUPVALUE, f_reg, 0, 0), line);
        self.cur().locals.pop();
        self.cur().locals.pop();
        self.free_reg(g_reg);
        self.free_reg(f_reg);
        Ok(())
    }

    /// Compile a block as a standalone boundary sub-chunk; returns its
    /// prototype's constant index.
    pub(super) fn compile_sub_chunk(
        &mut self,
        block: &Block,
        name: &str,
        line: Line,
    ) -> Result<u16, CompileError> {
        self.states.push(FuncState::new(Some(name.to_string()), true));
        let rr = self.alloc_reg(line)?;
        self.compile_block(block, rr)?;
        if self.cur_ref().has_defers {
            self.emit(encode_abc(op::DEFER_RUN, 0, 0, 0), line);
        }
        self.emit(encode_abc(op::RETURN, rr, 1, 0), line);
        self.free_reg(rr);

        let state = self.states.pop().expect("sub-chunk state");
        let proto = Value::chunk_closure(Arc::new(state.chunk));
        self.add_constant(proto, line)
    }

    /// Compile a single expression as a boundary sub-chunk.
    fn compile_expr_sub_chunk(
        &mut self,
        expr: &Expr,
        name: &str,
        line: Line,
    ) -> Result<u16, CompileError> {
        self.states.push(FuncState::new(Some(name.to_string()), true));
        let rr = self.alloc_reg(line)?;
        self.compile_expr(expr, rr)?;
        self.emit(encode_abc(op::RETURN, rr, 1, 0), line);
        self.free_reg(rr);

        let state = self.states.pop().expect("sub-chunk state");
        let proto = Value::chunk_closure(Arc::new(state.chunk));
        self.add_constant(proto, line)
    }

    /// `scope { stmts; spawn { .. } }`: sync body plus one sub-chunk per
    /// spawn.
    pub(super) fn compile_scope(
        &mut self,
        body: &Block,
        spawns: &[Block],
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        let spawn_count =
            u8::try_from(spawns.len()).map_err(|_| CompileError::TooManyRegisters { line })?;

        let sync_idx = self.compile_sub_chunk(body, "scope", line)?;
        let mut spawn_idxs = Vec::with_capacity(spawns.len());
        for (i, spawn) in spawns.iter().enumerate() {
            spawn_idxs.push(self.compile_sub_chunk(spawn, &format!("spawn#{i}"), line)?);
        }

        self.emit(encode_abc(op::SCOPE, dst, spawn_count, 0), line);
        self.emit(encode_abx(op::DATA, 0, sync_idx), line);
        for idx in spawn_idxs {
            self.emit(encode_abx(op::DATA, 0, idx), line);
        }
        Ok(())
    }

    /// `select { arms }`: channel/timeout expressions and bodies compile
    /// to separate chunks referenced from per-arm descriptor words.
    pub(super) fn compile_select(
        &mut self,
        arms: &[SelectArm],
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        let arm_count =
            u8::try_from(arms.len()).map_err(|_| CompileError::TooManyRegisters { line })?;

        struct ArmWords {
            flags: u8,
            chan_idx: u16,
            body_idx: u16,
            binding_idx: u16,
        }

        let mut words = Vec::with_capacity(arms.len());
        for (i, arm) in arms.iter().enumerate() {
            let mut flags = 0u8;
            let chan_idx = match &arm.kind {
                SelectArmKind::Channel(chan) => {
                    self.compile_expr_sub_chunk(chan, &format!("select.chan#{i}"), arm.line)?
                }
                SelectArmKind::Default => {
                    flags |= SELECT_ARM_DEFAULT;
                    0
                }
                SelectArmKind::Timeout(ms) => {
                    flags |= SELECT_ARM_TIMEOUT;
                    self.compile_expr_sub_chunk(ms, &format!("select.timeout#{i}"), arm.line)?
                }
            };
            let binding_idx = match &arm.binding {
                Some(binding) => {
                    flags |= SELECT_ARM_BINDING;
                    self.add_constant(Value::str(binding), arm.line)?
                }
                None => 0,
            };
            let body_idx = self.compile_sub_chunk(&arm.body, &format!("select.arm#{i}"), arm.line)?;
            words.push(ArmWords {
                flags,
                chan_idx,
                body_idx,
                binding_idx,
            });
        }

        self.emit(encode_abc(op::SELECT, dst, arm_count, 0), line);
        for w in words {
            self.emit(encode_abx(op::DATA, w.flags, w.chan_idx), line);
            self.emit(encode_abx(op::DATA, 0, w.body_idx), line);
            self.emit(encode_abx(op::DATA, 0, w.binding_idx), line);
        }
        Ok(())
    }
}
