// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Call lowering: plain calls, method dispatch, and the compiler-
//! recognized special forms.
//!
//! Special forms (`freeze`, `react`, `require`, `compose`, ...) are
//! recognized by function name at call sites and compile directly to
//! dedicated opcodes, with variable-name arguments reified as string
//! constants. `compose` is hard-coded and shadows user redefinitions of
//! the name.

use lattice_core::{Expr, Line};

use super::{CompileError, Compiler, NameLoc};
use crate::bytecode::{
    encode_abc, encode_abx, op, FREEZE_VAR_CONSUME, FREEZE_VAR_WRAP, LOC_GLOBAL, LOC_REGISTER,
    LOC_UPVALUE,
};
use crate::natives;
use crate::value::Value;

impl Compiler {
    /// Compile a call expression, recognizing special forms.
    pub(super) fn compile_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        if let Expr::Ident { name, .. } = callee {
            if self.compile_special_form(name, args, dst, line)? {
                return Ok(());
            }
        }

        let argc = u8::try_from(args.len()).map_err(|_| CompileError::TooManyRegisters { line })?;
        let f = self.alloc_reg(line)?;
        self.compile_expr(callee, f)?;
        for arg in args {
            let reg = self.alloc_reg(line)?;
            self.compile_expr(arg, reg)?;
        }
        self.emit(encode_abc(op::CALL, f, argc, 1), line);
        self.free_regs_to(f + 1);
        if dst != f {
            self.emit(encode_abc(op::MOVE, dst, f, 0), line);
        }
        self.free_reg(f);
        Ok(())
    }

    /// Compile a method call, picking the invoke variant by receiver shape.
    pub(super) fn compile_method_call(
        &mut self,
        receiver: &Expr,
        method: &str,
        args: &[Expr],
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        let argc = u8::try_from(args.len()).map_err(|_| CompileError::TooManyRegisters { line })?;
        let method_idx = self.add_constant(Value::str(method), line)?;

        // Receiver shape decides the invoke variant.
        enum Recv {
            Local(u8),
            Global(u16),
            Other,
        }
        let recv = if let Expr::Ident { name, .. } = receiver {
            match self.resolve_name(name)? {
                NameLoc::Local(reg) => Recv::Local(reg),
                NameLoc::Upvalue(_) => Recv::Other,
                NameLoc::Global => Recv::Global(self.add_constant(Value::str(name), line)?),
            }
        } else {
            Recv::Other
        };

        let t = self.alloc_reg(line)?;
        for arg in args {
            let reg = self.alloc_reg(line)?;
            self.compile_expr(arg, reg)?;
        }

        match recv {
            Recv::Local(obj_reg) => {
                self.emit(encode_abx(op::INVOKE_LOCAL, t, method_idx), line);
                self.emit(encode_abc(op::DATA, argc, obj_reg, 0), line);
            }
            Recv::Global(name_idx) => {
                self.emit(encode_abx(op::INVOKE_GLOBAL, t, method_idx), line);
                self.emit(encode_abx(op::DATA, argc, name_idx), line);
            }
            Recv::Other => {
                let obj = self.alloc_reg(line)?;
                self.compile_expr(receiver, obj)?;
                self.emit(encode_abx(op::INVOKE, t, method_idx), line);
                self.emit(encode_abc(op::DATA, argc, obj, 0), line);
                self.free_reg(obj);
            }
        }

        self.free_regs_to(t + 1);
        if dst != t {
            self.emit(encode_abc(op::MOVE, dst, t, 0), line);
        }
        self.free_reg(t);
        Ok(())
    }

    /// Try to compile `name(args)` as a special form. Returns `false`
    /// when the name is not special and the call is ordinary.
    fn compile_special_form(
        &mut self,
        name: &str,
        args: &[Expr],
        dst: u8,
        line: Line,
    ) -> Result<bool, CompileError> {
        match name {
            "freeze" => self.compile_phase_var_form(op::FREEZE_VAR, op::FREEZE, args, dst, line)?,
            "thaw" => self.compile_phase_var_form(op::THAW_VAR, op::THAW, args, dst, line)?,
            "sublimate" => {
                self.compile_phase_var_form(op::SUBLIMATE_VAR, op::SUBLIMATE, args, dst, line)?;
            }
            "grow" => {
                // grow(x): freeze with seed consumption.
                let var = Self::expect_var_name(args, "grow", line)?;
                let loc = self.resolve_name(&var)?;
                self.emit_freeze_var_flags(&var, loc, FREEZE_VAR_CONSUME, line)?;
                self.compile_ident(&var, dst, line)?;
            }
            "clone" => {
                Self::expect_argc(args, 1, "clone", line)?;
                let src = self.alloc_reg(line)?;
                self.compile_expr(&args[0], src)?;
                self.emit(encode_abc(op::CLONE, dst, src, 0), line);
                self.free_reg(src);
            }
            "is_crystal" | "is_fluid" => {
                Self::expect_argc(args, 1, name, line)?;
                let opcode = if name == "is_crystal" {
                    op::IS_CRYSTAL
                } else {
                    op::IS_FLUID
                };
                let src = self.alloc_reg(line)?;
                self.compile_expr(&args[0], src)?;
                self.emit(encode_abc(opcode, dst, src, 0), line);
                self.free_reg(src);
            }
            "mark_fluid" => {
                Self::expect_argc(args, 1, name, line)?;
                self.compile_expr(&args[0], dst)?;
                self.emit(encode_abc(op::MARKFLUID, dst, 0, 0), line);
            }
            "freeze_field" | "thaw_field" => {
                self.compile_field_phase_form(name, args, dst, line)?;
            }
            "require" => self.compile_require(args, dst, line)?,
            "react" => {
                Self::expect_argc(args, 2, "react", line)?;
                let var = Self::expect_var_name(args, "react", line)?;
                let name_idx = self.add_constant(Value::str(&var), line)?;
                let cb = self.alloc_reg(line)?;
                self.compile_expr(&args[1], cb)?;
                self.emit(encode_abx(op::REACT, cb, name_idx), line);
                self.free_reg(cb);
                self.emit(encode_abc(op::LOADUNIT, dst, 0, 0), line);
            }
            "unreact" => {
                let var = Self::expect_var_name(args, "unreact", line)?;
                let name_idx = self.add_constant(Value::str(&var), line)?;
                self.emit(encode_abx(op::UNREACT, 0, name_idx), line);
                self.emit(encode_abc(op::LOADUNIT, dst, 0, 0), line);
            }
            "bond" => {
                if args.len() < 2 || args.len() > 3 {
                    return Err(CompileError::invalid("bond expects (target, dep [, strategy])", line));
                }
                let target = Self::var_name_of(&args[0], "bond", line)?;
                let dep = Self::var_name_of(&args[1], "bond", line)?;
                let strategy = match args.get(2) {
                    Some(Expr::Str { value, .. }) => value.clone(),
                    Some(_) => {
                        return Err(CompileError::invalid("bond strategy must be a string", line))
                    }
                    None => "mirror".to_string(),
                };
                let target_idx = self.add_constant(Value::str(&target), line)?;
                // Operand tuple: (dep name, strategy name).
                let pair = self.alloc_reg(line)?;
                let d = self.alloc_reg(line)?;
                self.emit_load_constant(Value::str(&dep), d, line)?;
                let s = self.alloc_reg(line)?;
                self.emit_load_constant(Value::str(&strategy), s, line)?;
                self.emit(encode_abc(op::NEWTUPLE, pair, d, 2), line);
                self.free_reg(s);
                self.free_reg(d);
                self.emit(encode_abx(op::BOND, pair, target_idx), line);
                self.free_reg(pair);
                self.emit(encode_abc(op::LOADUNIT, dst, 0, 0), line);
            }
            "unbond" => {
                let var = Self::expect_var_name(args, "unbond", line)?;
                let name_idx = self.add_constant(Value::str(&var), line)?;
                self.emit(encode_abx(op::UNBOND, 0, name_idx), line);
                self.emit(encode_abc(op::LOADUNIT, dst, 0, 0), line);
            }
            "seed" => {
                Self::expect_argc(args, 2, "seed", line)?;
                let var = Self::expect_var_name(args, "seed", line)?;
                let name_idx = self.add_constant(Value::str(&var), line)?;
                let pred = self.alloc_reg(line)?;
                self.compile_expr(&args[1], pred)?;
                self.emit(encode_abx(op::SEED, pred, name_idx), line);
                self.free_reg(pred);
                self.emit(encode_abc(op::LOADUNIT, dst, 0, 0), line);
            }
            "unseed" => {
                let var = Self::expect_var_name(args, "unseed", line)?;
                let name_idx = self.add_constant(Value::str(&var), line)?;
                self.emit(encode_abx(op::UNSEED, 0, name_idx), line);
                self.emit(encode_abc(op::LOADUNIT, dst, 0, 0), line);
            }
            "track" | "history" | "phases" | "depressurize" => {
                let var = Self::expect_var_name(args, name, line)?;
                self.compile_native_with_name(name, &var, &[], dst, line)?;
            }
            "rewind" => {
                Self::expect_argc(args, 2, "rewind", line)?;
                let var = Self::expect_var_name(args, "rewind", line)?;
                self.compile_native_with_name("rewind", &var, &args[1..], dst, line)?;
            }
            "pressurize" => {
                Self::expect_argc(args, 2, "pressurize", line)?;
                let var = Self::expect_var_name(args, "pressurize", line)?;
                self.compile_native_with_name("pressurize", &var, &args[1..], dst, line)?;
            }
            "compose" => {
                Self::expect_argc(args, 2, "compose", line)?;
                self.compile_compose(&args[0], &args[1], dst, line)?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// `freeze`/`thaw`/`sublimate`: the `*_VAR` form for identifier
    /// targets (environment mirror, cascade, reactions), the register
    /// form otherwise.
    fn compile_phase_var_form(
        &mut self,
        var_opcode: u8,
        reg_opcode: u8,
        args: &[Expr],
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        if args.len() != 1 {
            return Err(CompileError::invalid("phase operation expects one argument", line));
        }
        if let Expr::Ident { name, .. } = &args[0] {
            let loc = self.resolve_name(name)?;
            self.emit_phase_var(var_opcode, name, loc, 0, line)?;
            self.compile_ident(name, dst, line)?;
            return Ok(());
        }
        // Value form: no environment side effects.
        self.compile_expr(&args[0], dst)?;
        if reg_opcode == op::SUBLIMATE {
            self.emit(encode_abc(reg_opcode, dst, 0, 0), line);
        } else {
            self.emit(encode_abc(reg_opcode, dst, dst, 0), line);
        }
        Ok(())
    }

    fn compile_field_phase_form(
        &mut self,
        name: &str,
        args: &[Expr],
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        Self::expect_argc(args, 2, name, line)?;
        let opcode = if name == "freeze_field" {
            op::FREEZE_FIELD
        } else {
            op::THAW_FIELD
        };
        let Expr::Str { value: field, .. } = &args[1] else {
            return Err(CompileError::invalid(
                format!("{name} expects a literal field name"),
                line,
            ));
        };
        let field_idx = self.add_constant(Value::str(field), line)?;

        if let Expr::Ident { name: var, .. } = &args[0] {
            match self.resolve_name(var)? {
                NameLoc::Local(reg) => {
                    self.emit(encode_abx(opcode, reg, field_idx), line);
                    self.emit(encode_abc(op::MOVE, dst, reg, 0), line);
                }
                NameLoc::Upvalue(up) => {
                    let temp = self.alloc_reg(line)?;
                    self.emit(encode_abc(op::GETUPVALUE, temp, up, 0), line);
                    self.emit(encode_abx(opcode, temp, field_idx), line);
                    self.emit(encode_abc(op::SETUPVALUE, temp, up, 0), line);
                    self.emit(encode_abc(op::MOVE, dst, temp, 0), line);
                    self.free_reg(temp);
                }
                NameLoc::Global => {
                    let name_idx = self.add_constant(Value::str(var), line)?;
                    let temp = self.alloc_reg(line)?;
                    self.emit(encode_abx(op::GETGLOBAL, temp, name_idx), line);
                    self.emit(encode_abx(opcode, temp, field_idx), line);
                    self.emit(encode_abx(op::SETGLOBAL, temp, name_idx), line);
                    self.emit(encode_abc(op::MOVE, dst, temp, 0), line);
                    self.free_reg(temp);
                }
            }
            return Ok(());
        }
        self.compile_expr(&args[0], dst)?;
        self.emit(encode_abx(opcode, dst, field_idx), line);
        Ok(())
    }

    /// `require("m.lat")` loads a module; `require(cond [, msg])` is a
    /// precondition contract.
    fn compile_require(&mut self, args: &[Expr], dst: u8, line: Line) -> Result<(), CompileError> {
        if args.len() == 1 {
            if let Expr::Str { value, .. } = &args[0] {
                let path_idx = self.add_constant(Value::str(value), line)?;
                self.emit(encode_abx(op::REQUIRE, dst, path_idx), line);
                return Ok(());
            }
        }
        if args.is_empty() || args.len() > 2 {
            return Err(CompileError::invalid("require expects (condition [, message])", line));
        }
        let cond = self.alloc_reg(line)?;
        self.compile_expr(&args[0], cond)?;
        let ok = self.emit_jump(op::JMPTRUE, cond, line);
        match args.get(1) {
            Some(msg) => self.compile_expr(msg, cond)?,
            None => self.emit_load_constant(Value::str("requirement failed"), cond, line)?,
        }
        self.emit(encode_abc(op::THROW, cond, 0, 0), line);
        self.patch_jump(ok, line)?;
        self.free_reg(cond);
        self.emit(encode_abc(op::LOADUNIT, dst, 0, 0), line);
        Ok(())
    }

    /// `freeze(x) where |v| { contract }`: plant a one-shot seed, then
    /// freeze with consume + wrap flags.
    pub(super) fn compile_freeze_with(
        &mut self,
        target: &Expr,
        contract: &lattice_core::FnExpr,
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        let Expr::Ident { name, .. } = target else {
            return Err(CompileError::invalid("freeze contract target must be a variable", line));
        };
        let name_idx = self.add_constant(Value::str(name), line)?;
        let pred = self.alloc_reg(line)?;
        self.compile_closure(contract, pred)?;
        self.emit(encode_abx(op::SEED, pred, name_idx), line);
        self.free_reg(pred);

        let loc = self.resolve_name(name)?;
        self.emit_freeze_var_flags(name, loc, FREEZE_VAR_CONSUME | FREEZE_VAR_WRAP, line)?;
        self.compile_ident(name, dst, line)
    }

    /// `freeze(x) except { a, b }`: freeze all fields/keys except the
    /// listed names, which are marked fluid.
    pub(super) fn compile_freeze_except(
        &mut self,
        target: &Expr,
        except: &[String],
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        let count =
            u8::try_from(except.len()).map_err(|_| CompileError::TooManyRegisters { line })?;

        let (target_reg, writeback) = match target {
            Expr::Ident { name, .. } => match self.resolve_name(name)? {
                NameLoc::Local(reg) => (reg, None),
                NameLoc::Upvalue(up) => {
                    let temp = self.alloc_reg(line)?;
                    self.emit(encode_abc(op::GETUPVALUE, temp, up, 0), line);
                    (temp, Some(WriteBack::Upvalue(up)))
                }
                NameLoc::Global => {
                    let name_idx = self.add_constant(Value::str(name), line)?;
                    let temp = self.alloc_reg(line)?;
                    self.emit(encode_abx(op::GETGLOBAL, temp, name_idx), line);
                    (temp, Some(WriteBack::Global(name_idx)))
                }
            },
            _ => {
                let temp = self.alloc_reg(line)?;
                self.compile_expr(target, temp)?;
                (temp, Some(WriteBack::None))
            }
        };

        // Exempt field names sit on a register run.
        let base = self.cur_ref().next_reg;
        for field in except {
            let reg = self.alloc_reg(line)?;
            self.emit_load_constant(Value::str(field), reg, line)?;
        }
        self.emit(encode_abc(op::FREEZE_EXCEPT, target_reg, 0, 0), line);
        self.emit(encode_abc(op::DATA, 0, base, count), line);
        self.free_regs_to(base);

        match writeback {
            None => {}
            Some(WriteBack::Upvalue(up)) => {
                self.emit(encode_abc(op::SETUPVALUE, target_reg, up, 0), line);
            }
            Some(WriteBack::Global(name_idx)) => {
                self.emit(encode_abx(op::SETGLOBAL, target_reg, name_idx), line);
            }
            Some(WriteBack::None) => {}
        }
        self.emit(encode_abc(op::MOVE, dst, target_reg, 0), line);
        if writeback.is_some() {
            self.free_reg(target_reg);
        }
        Ok(())
    }

    // --- Freeze/thaw emission shared with statements ---

    pub(super) fn emit_freeze_var(
        &mut self,
        name: &str,
        loc: NameLoc,
        consume: bool,
        line: Line,
    ) -> Result<(), CompileError> {
        let flags = if consume { FREEZE_VAR_CONSUME } else { 0 };
        self.emit_freeze_var_flags(name, loc, flags, line)
    }

    pub(super) fn emit_freeze_var_flags(
        &mut self,
        name: &str,
        loc: NameLoc,
        flags: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        self.emit_phase_var(op::FREEZE_VAR, name, loc, flags, line)
    }

    pub(super) fn emit_thaw_var(
        &mut self,
        name: &str,
        loc: NameLoc,
        line: Line,
    ) -> Result<(), CompileError> {
        self.emit_phase_var(op::THAW_VAR, name, loc, 0, line)
    }

    fn emit_phase_var(
        &mut self,
        opcode: u8,
        name: &str,
        loc: NameLoc,
        flags: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        let (loc_type, slot) = match loc {
            NameLoc::Local(reg) => (LOC_REGISTER, reg),
            NameLoc::Upvalue(up) => (LOC_UPVALUE, up),
            NameLoc::Global => (LOC_GLOBAL, 0),
        };
        let name_idx = self.add_constant(Value::str(name), line)?;
        self.emit(encode_abc(opcode, loc_type | flags, slot, 0), line);
        self.emit(encode_abx(op::DATA, 0, name_idx), line);
        Ok(())
    }

    // --- Native-call plumbing ---

    /// Load the callee closure of a registered native function.
    pub(super) fn emit_native_callee(&mut self, name: &str, line: Line) -> Result<u8, CompileError> {
        let id = natives::lookup_native(name)
            .ok_or_else(|| CompileError::invalid(format!("unknown native '{name}'"), line))?;
        let f = self.alloc_reg(line)?;
        let constant = Value::closure(crate::value::ClosureData {
            callee: crate::value::Callee::Native(id),
            upvalues: Vec::new(),
        });
        self.emit_load_constant(constant, f, line)?;
        Ok(f)
    }

    /// Call a native with ordinary expression arguments.
    pub(super) fn compile_native_over_args(
        &mut self,
        name: &str,
        args: &[Expr],
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        let argc = u8::try_from(args.len()).map_err(|_| CompileError::TooManyRegisters { line })?;
        let f = self.emit_native_callee(name, line)?;
        for arg in args {
            let reg = self.alloc_reg(line)?;
            self.compile_expr(arg, reg)?;
        }
        self.emit(encode_abc(op::CALL, f, argc, 1), line);
        self.free_regs_to(f + 1);
        if dst != f {
            self.emit(encode_abc(op::MOVE, dst, f, 0), line);
        }
        self.free_reg(f);
        Ok(())
    }

    /// Call a phase-service native whose first argument is a reified
    /// variable name.
    fn compile_native_with_name(
        &mut self,
        native: &str,
        var: &str,
        extra: &[Expr],
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        let argc = u8::try_from(extra.len() + 1)
            .map_err(|_| CompileError::TooManyRegisters { line })?;
        let f = self.emit_native_callee(native, line)?;
        let name_reg = self.alloc_reg(line)?;
        self.emit_load_constant(Value::str(var), name_reg, line)?;
        for arg in extra {
            let reg = self.alloc_reg(line)?;
            self.compile_expr(arg, reg)?;
        }
        self.emit(encode_abc(op::CALL, f, argc, 1), line);
        self.free_regs_to(f + 1);
        if dst != f {
            self.emit(encode_abc(op::MOVE, dst, f, 0), line);
        }
        self.free_reg(f);
        Ok(())
    }

    // --- Argument helpers ---

    fn expect_argc(args: &[Expr], n: usize, form: &str, line: Line) -> Result<(), CompileError> {
        if args.len() == n {
            Ok(())
        } else {
            Err(CompileError::invalid(
                format!("{form} expects {n} argument(s), got {}", args.len()),
                line,
            ))
        }
    }

    /// The variable name in the first argument slot.
    fn expect_var_name(args: &[Expr], form: &str, line: Line) -> Result<String, CompileError> {
        let first = args
            .first()
            .ok_or_else(|| CompileError::invalid(format!("{form} expects a variable"), line))?;
        Self::var_name_of(first, form, line)
    }

    /// A variable name given as an identifier or a string literal.
    fn var_name_of(expr: &Expr, form: &str, line: Line) -> Result<String, CompileError> {
        match expr {
            Expr::Ident { name, .. } => Ok(name.clone()),
            Expr::Str { value, .. } => Ok(value.clone()),
            _ => Err(CompileError::invalid(
                format!("{form} expects a variable name"),
                line,
            )),
        }
    }
}

/// Where a freeze-except temp writes back to.
#[derive(Clone, Copy)]
enum WriteBack {
    Upvalue(u8),
    Global(u16),
    None,
}
