// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Expression lowering.
//!
//! Every expression produces its value into a caller-specified `dst`
//! register. Integer-pair operations fold at compile time; small integer
//! literals use the inline immediate form; `+` with a byte-range literal
//! compiles to `ADDI`.

use lattice_core::{BinaryOp, Expr, Line, LogicalOp, UnaryOp};

use super::{CompileError, Compiler, NameLoc};
use crate::bytecode::{encode_abc, encode_abx, op};
use crate::value::Value;

impl Compiler {
    /// Compile an expression into `dst`.
    pub(super) fn compile_expr(&mut self, expr: &Expr, dst: u8) -> Result<(), CompileError> {
        // Integer constant folding first.
        if let Some(folded) = fold_expr(expr) {
            return self.emit_folded(&folded, dst, expr.line());
        }

        match expr {
            Expr::Int { value, line } => self.emit_load_int(*value, dst, *line)?,
            Expr::Float { value, line } => {
                self.emit_load_constant(Value::float(*value), dst, *line)?;
            }
            Expr::Bool { value, line } => {
                let opcode = if *value { op::LOADTRUE } else { op::LOADFALSE };
                self.emit(encode_abc(opcode, dst, 0, 0), *line);
            }
            Expr::Str { value, line } => {
                let mut constant = Value::str(value);
                constant.region = crate::value::Region::Const;
                self.emit_load_constant(constant, dst, *line)?;
            }
            Expr::Nil { line } => self.emit(encode_abc(op::LOADNIL, dst, 0, 0), *line),
            Expr::Unit { line } => self.emit(encode_abc(op::LOADUNIT, dst, 0, 0), *line),
            Expr::Ident { name, line } => self.compile_ident(name, dst, *line)?,
            Expr::Array { elements, line } => {
                self.compile_aggregate(op::NEWARRAY, elements, dst, *line)?;
            }
            Expr::Tuple { elements, line } => {
                self.compile_aggregate(op::NEWTUPLE, elements, dst, *line)?;
            }
            Expr::MapLit { entries, line } => self.compile_map_lit(entries, dst, *line)?,
            Expr::SetLit { elements, line } => {
                // Sets build through the set_of native over an array run.
                self.compile_native_over_args(
                    "set_of",
                    std::slice::from_ref(&Expr::Array {
                        elements: elements.clone(),
                        line: *line,
                    }),
                    dst,
                    *line,
                )?;
            }
            Expr::Range { start, end, line } => {
                let lo = self.alloc_reg(*line)?;
                self.compile_expr(start, lo)?;
                let hi = self.alloc_reg(*line)?;
                self.compile_expr(end, hi)?;
                self.emit(encode_abc(op::BUILDRANGE, dst, lo, hi), *line);
                self.free_reg(hi);
                self.free_reg(lo);
            }
            Expr::Binary { op, lhs, rhs, line } => {
                self.compile_binary(*op, lhs, rhs, dst, *line)?;
            }
            Expr::Logical { op, lhs, rhs, line } => {
                self.compile_logical(*op, lhs, rhs, dst, *line)?;
            }
            Expr::Unary { op, operand, line } => {
                let src = self.alloc_reg(*line)?;
                self.compile_expr(operand, src)?;
                let opcode = match op {
                    UnaryOp::Neg => op::NEG,
                    UnaryOp::Not => op::NOT,
                    UnaryOp::BitNot => op::BNOT,
                };
                self.emit(encode_abc(opcode, dst, src, 0), *line);
                self.free_reg(src);
            }
            Expr::Call { callee, args, line } => self.compile_call(callee, args, dst, *line)?,
            Expr::MethodCall {
                receiver,
                method,
                args,
                line,
            } => self.compile_method_call(receiver, method, args, dst, *line)?,
            Expr::Index { obj, index, line } => {
                let obj_reg = self.alloc_reg(*line)?;
                self.compile_expr(obj, obj_reg)?;
                let idx = self.alloc_reg(*line)?;
                self.compile_expr(index, idx)?;
                self.emit(encode_abc(op::GETINDEX, dst, obj_reg, idx), *line);
                self.free_reg(idx);
                self.free_reg(obj_reg);
            }
            Expr::Field { obj, field, line } => {
                let obj_reg = self.alloc_reg(*line)?;
                self.compile_expr(obj, obj_reg)?;
                self.emit_get_field(dst, obj_reg, field, *line)?;
                self.free_reg(obj_reg);
            }
            Expr::OptField { obj, field, line } => {
                // obj?.field: nil propagates without touching the field.
                self.compile_expr(obj, dst)?;
                let probe = self.emit_jump(op::JMPNOTNIL, dst, *line);
                let done = self.emit_jump(op::JMP, 0, *line);
                self.patch_jump(probe, *line)?;
                let obj_reg = self.alloc_reg(*line)?;
                self.emit(encode_abc(op::MOVE, obj_reg, dst, 0), *line);
                self.emit_get_field(dst, obj_reg, field, *line)?;
                self.free_reg(obj_reg);
                self.patch_jump(done, *line)?;
            }
            Expr::NilCoalesce { lhs, rhs, line } => {
                self.compile_expr(lhs, dst)?;
                let done = self.emit_jump(op::JMPNOTNIL, dst, *line);
                self.compile_expr(rhs, dst)?;
                self.patch_jump(done, *line)?;
            }
            Expr::If {
                cond,
                then_block,
                else_branch,
                line,
            } => {
                let cond_reg = self.alloc_reg(*line)?;
                self.compile_expr(cond, cond_reg)?;
                let to_else = self.emit_jump(op::JMPFALSE, cond_reg, *line);
                self.free_reg(cond_reg);
                self.compile_block(then_block, dst)?;
                let to_end = self.emit_jump(op::JMP, 0, *line);
                self.patch_jump(to_else, *line)?;
                match else_branch {
                    Some(else_expr) => self.compile_expr(else_expr, dst)?,
                    None => self.emit(encode_abc(op::LOADUNIT, dst, 0, 0), *line),
                }
                self.patch_jump(to_end, *line)?;
            }
            Expr::BlockExpr { block, .. } => self.compile_block(block, dst)?,
            Expr::Match {
                scrutinee,
                arms,
                line,
            } => self.compile_match(scrutinee, arms, dst, *line)?,
            Expr::Try {
                body,
                catch_name,
                catch_body,
                line,
            } => self.compile_try(body, catch_name, catch_body, dst, *line)?,
            Expr::TryUnwrap { value, line } => {
                self.compile_expr(value, dst)?;
                self.emit(encode_abc(op::TRY_UNWRAP, dst, 0, 0), *line);
            }
            Expr::Fn { func, .. } => self.compile_closure(func, dst)?,
            Expr::StructLit { name, fields, line } => {
                self.compile_struct_lit(name, fields, dst, *line)?;
            }
            Expr::EnumLit {
                enum_name,
                variant,
                args,
                line,
            } => self.compile_enum_lit(enum_name, variant, args, dst, *line)?,
            Expr::FreezeWith {
                target,
                contract,
                line,
            } => self.compile_freeze_with(target, contract, dst, *line)?,
            Expr::FreezeExcept {
                target,
                except,
                line,
            } => self.compile_freeze_except(target, except, dst, *line)?,
            Expr::Anneal { target, with, line } => {
                self.compile_anneal(target, with, dst, *line)?;
            }
            Expr::Crystallize { name, body, line } => {
                self.compile_crystallize(name, body, dst, *line, true)?;
            }
            Expr::Borrow { name, body, line } => {
                self.compile_crystallize(name, body, dst, *line, false)?;
            }
            Expr::Forge { body, line } => {
                // Build, then crystallize the result.
                self.compile_block(body, dst)?;
                self.emit(encode_abc(op::FREEZE, dst, dst, 0), *line);
            }
            Expr::Scope { body, spawns, line } => {
                self.compile_scope(body, spawns, dst, *line)?;
            }
            Expr::Select { arms, line } => self.compile_select(arms, dst, *line)?,
        }
        Ok(())
    }

    fn emit_folded(&mut self, value: &Folded, dst: u8, line: Line) -> Result<(), CompileError> {
        match value {
            Folded::Int(n) => self.emit_load_int(*n, dst, line),
            Folded::Bool(b) => {
                let opcode = if *b { op::LOADTRUE } else { op::LOADFALSE };
                self.emit(encode_abc(opcode, dst, 0, 0), line);
                Ok(())
            }
        }
    }

    pub(super) fn compile_ident(&mut self, name: &str, dst: u8, line: Line) -> Result<(), CompileError> {
        match self.resolve_name(name)? {
            NameLoc::Local(reg) => {
                if reg != dst {
                    self.emit(encode_abc(op::MOVE, dst, reg, 0), line);
                }
            }
            NameLoc::Upvalue(up) => {
                self.emit(encode_abc(op::GETUPVALUE, dst, up, 0), line);
            }
            NameLoc::Global => {
                let idx = self.add_constant(Value::str(name), line)?;
                self.emit(encode_abx(op::GETGLOBAL, dst, idx), line);
            }
        }
        Ok(())
    }

    fn compile_aggregate(
        &mut self,
        opcode: u8,
        elements: &[Expr],
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        let count =
            u8::try_from(elements.len()).map_err(|_| CompileError::TooManyRegisters { line })?;
        let base = self.cur_ref().next_reg;
        for element in elements {
            let reg = self.alloc_reg(line)?;
            self.compile_expr(element, reg)?;
        }
        self.emit(encode_abc(opcode, dst, base, count), line);
        self.free_regs_to(base);
        Ok(())
    }

    fn compile_map_lit(
        &mut self,
        entries: &[(Expr, Expr)],
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        // Maps build through the map_of native over a flat k/v run.
        let mut flat = Vec::with_capacity(entries.len() * 2);
        for (k, v) in entries {
            flat.push(k.clone());
            flat.push(v.clone());
        }
        self.compile_native_over_args("map_of", &flat, dst, line)
    }

    fn compile_binary(
        &mut self,
        bin_op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        // ADDI peephole: register + byte-range integer literal.
        if bin_op == BinaryOp::Add {
            if let Expr::Int { value, .. } = rhs {
                if let Ok(small) = i8::try_from(*value) {
                    let src = self.alloc_reg(line)?;
                    self.compile_expr(lhs, src)?;
                    #[expect(clippy::cast_sign_loss, reason = "two's complement immediate byte")]
                    self.emit(encode_abc(op::ADDI, dst, src, small as u8), line);
                    self.free_reg(src);
                    return Ok(());
                }
            }
        }

        let b = self.alloc_reg(line)?;
        self.compile_expr(lhs, b)?;
        let c = self.alloc_reg(line)?;
        self.compile_expr(rhs, c)?;
        let opcode = match bin_op {
            BinaryOp::Add => op::ADD,
            BinaryOp::Sub => op::SUB,
            BinaryOp::Mul => op::MUL,
            BinaryOp::Div => op::DIV,
            BinaryOp::Mod => op::MOD,
            BinaryOp::Eq => op::EQ,
            BinaryOp::Neq => op::NEQ,
            BinaryOp::Lt => op::LT,
            BinaryOp::LtEq => op::LTEQ,
            BinaryOp::Gt => op::GT,
            BinaryOp::GtEq => op::GTEQ,
            BinaryOp::BitAnd => op::BAND,
            BinaryOp::BitOr => op::BOR,
            BinaryOp::BitXor => op::BXOR,
            BinaryOp::Shl => op::LSHIFT,
            BinaryOp::Shr => op::RSHIFT,
        };
        self.emit(encode_abc(opcode, dst, b, c), line);
        self.free_reg(c);
        self.free_reg(b);
        Ok(())
    }

    fn compile_logical(
        &mut self,
        log_op: LogicalOp,
        lhs: &Expr,
        rhs: &Expr,
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        self.compile_expr(lhs, dst)?;
        let short = match log_op {
            LogicalOp::And => self.emit_jump(op::JMPFALSE, dst, line),
            LogicalOp::Or => self.emit_jump(op::JMPTRUE, dst, line),
        };
        self.compile_expr(rhs, dst)?;
        self.patch_jump(short, line)?;
        Ok(())
    }

    fn compile_try(
        &mut self,
        body: &lattice_core::Block,
        catch_name: &str,
        catch_body: &lattice_core::Block,
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        let err_reg = self.alloc_reg(line)?;
        let handler = self.emit_jump(op::PUSH_HANDLER, err_reg, line);
        self.compile_block(body, dst)?;
        self.emit(encode_abc(op::POP_HANDLER, 0, 0, 0), line);
        let done = self.emit_jump(op::JMP, 0, line);
        self.patch_jump(handler, line)?;

        // Catch block with the structured error map bound to catch_name.
        self.begin_scope();
        self.declare_local(catch_name, err_reg);
        let count = catch_body.stmts.len();
        if count == 0 {
            self.emit(encode_abc(op::LOADUNIT, dst, 0, 0), catch_body.line);
        }
        for (i, stmt) in catch_body.stmts.iter().enumerate() {
            let is_last = i + 1 == count;
            self.compile_stmt(stmt, is_last.then_some(dst))?;
        }
        self.end_scope(line);

        self.patch_jump(done, line)?;
        Ok(())
    }

    fn compile_struct_lit(
        &mut self,
        name: &str,
        fields: &[(String, Expr)],
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        let count =
            u8::try_from(fields.len()).map_err(|_| CompileError::TooManyRegisters { line })?;
        let base = self.cur_ref().next_reg;
        for (_, value) in fields {
            let reg = self.alloc_reg(line)?;
            self.compile_expr(value, reg)?;
        }
        // The data word names the struct and the literal's field order so
        // the VM can reorder to declaration order.
        let mut names = Vec::with_capacity(fields.len() + 1);
        names.push(Value::str(name));
        names.extend(fields.iter().map(|(n, _)| Value::str(n)));
        let names_idx = self.add_constant(Value::array(names), line)?;

        self.emit(encode_abc(op::NEWSTRUCT, dst, base, count), line);
        self.emit(encode_abx(op::DATA, 0, names_idx), line);
        self.free_regs_to(base);
        Ok(())
    }

    fn compile_enum_lit(
        &mut self,
        enum_name: &str,
        variant: &str,
        args: &[Expr],
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        let count = u8::try_from(args.len()).map_err(|_| CompileError::TooManyRegisters { line })?;
        let base = self.cur_ref().next_reg;
        for arg in args {
            let reg = self.alloc_reg(line)?;
            self.compile_expr(arg, reg)?;
        }
        let tag_idx = self.add_constant(Value::str(&format!("{enum_name}::{variant}")), line)?;
        self.emit(encode_abc(op::NEWENUM, dst, base, count), line);
        self.emit(encode_abx(op::DATA, 0, tag_idx), line);
        self.free_regs_to(base);
        Ok(())
    }

    fn compile_anneal(
        &mut self,
        target: &Expr,
        with: &Expr,
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        // anneal(target, closure): the native checks the target is
        // crystal, thaws a copy, runs the closure over it, and freezes
        // the result; identifier targets get the result written back and
        // the variable refrozen through the environment.
        let name = match target {
            Expr::Ident { name, .. } => Some(name.clone()),
            _ => None,
        };
        let f = self.emit_native_callee("anneal", line)?;
        let a1 = self.alloc_reg(line)?;
        self.compile_expr(target, a1)?;
        let a2 = self.alloc_reg(line)?;
        self.compile_expr(with, a2)?;
        self.emit(encode_abc(op::CALL, f, 2, 1), line);
        self.free_reg(a2);
        self.free_reg(a1);
        if let Some(name) = name {
            let loc = self.resolve_name(&name)?;
            match loc {
                NameLoc::Local(reg) => self.emit(encode_abc(op::MOVE, reg, f, 0), line),
                NameLoc::Upvalue(up) => self.emit(encode_abc(op::SETUPVALUE, f, up, 0), line),
                NameLoc::Global => {
                    let idx = self.add_constant(Value::str(&name), line)?;
                    self.emit(encode_abx(op::SETGLOBAL, f, idx), line);
                }
            }
            self.emit_freeze_var(&name, loc, false, line)?;
        }
        self.emit(encode_abc(op::MOVE, dst, f, 0), line);
        self.free_reg(f);
        Ok(())
    }

    fn compile_crystallize(
        &mut self,
        name: &str,
        body: &lattice_core::Block,
        dst: u8,
        line: Line,
        freeze: bool,
    ) -> Result<(), CompileError> {
        // Remember the prior phase, apply the temporary one, run the body,
        // restore. compile via: was = is_crystal(x); freeze/thaw x; body;
        // conditional restore.
        let loc = self.resolve_name(name)?;
        let was = self.alloc_reg(line)?;
        let probe = self.alloc_reg(line)?;
        self.compile_ident(name, probe, line)?;
        self.emit(encode_abc(op::IS_CRYSTAL, was, probe, 0), line);
        self.free_reg(probe);

        if freeze {
            self.emit_freeze_var(name, loc, false, line)?;
        } else {
            self.emit_thaw_var(name, loc, line)?;
        }

        self.compile_block(body, dst)?;

        // Restore only when the prior phase differed.
        if freeze {
            // Thaw unless it was already crystal.
            let skip = self.emit_jump(op::JMPTRUE, was, line);
            self.emit_thaw_var(name, loc, line)?;
            self.patch_jump(skip, line)?;
        } else {
            // Refreeze only when it was crystal before.
            let skip = self.emit_jump(op::JMPFALSE, was, line);
            self.emit_freeze_var(name, loc, false, line)?;
            self.patch_jump(skip, line)?;
        }
        self.free_reg(was);
        Ok(())
    }
}

/// Result of compile-time folding.
enum Folded {
    Int(i64),
    Bool(bool),
}

/// Fold integer-pair arithmetic and comparisons recursively.
fn fold_expr(expr: &Expr) -> Option<Folded> {
    fn fold_int(expr: &Expr) -> Option<i64> {
        match expr {
            Expr::Int { value, .. } => Some(*value),
            Expr::Binary { op, lhs, rhs, .. } => {
                let a = fold_int(lhs)?;
                let b = fold_int(rhs)?;
                match op {
                    BinaryOp::Add => a.checked_add(b),
                    BinaryOp::Sub => a.checked_sub(b),
                    BinaryOp::Mul => a.checked_mul(b),
                    BinaryOp::Div => a.checked_div(b),
                    BinaryOp::Mod => a.checked_rem(b),
                    _ => None,
                }
            }
            Expr::Unary {
                op: UnaryOp::Neg,
                operand,
                ..
            } => fold_int(operand).and_then(i64::checked_neg),
            _ => None,
        }
    }

    match expr {
        Expr::Binary { op, lhs, rhs, .. } => match op {
            BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::Mul
            | BinaryOp::Div
            | BinaryOp::Mod => fold_int(expr).map(Folded::Int),
            BinaryOp::Eq
            | BinaryOp::Neq
            | BinaryOp::Lt
            | BinaryOp::LtEq
            | BinaryOp::Gt
            | BinaryOp::GtEq => {
                let a = fold_int(lhs)?;
                let b = fold_int(rhs)?;
                let result = match op {
                    BinaryOp::Eq => a == b,
                    BinaryOp::Neq => a != b,
                    BinaryOp::Lt => a < b,
                    BinaryOp::LtEq => a <= b,
                    BinaryOp::Gt => a > b,
                    BinaryOp::GtEq => a >= b,
                    _ => unreachable!(),
                };
                Some(Folded::Bool(result))
            }
            _ => None,
        },
        _ => None,
    }
}
