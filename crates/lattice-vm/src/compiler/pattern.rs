// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Match lowering.
//!
//! The scrutinee is evaluated once. Arm tests funnel their failures to
//! the next arm; end-of-arm jumps funnel to a single rendezvous holding
//! `Nil` as the exhaustiveness default. Range patterns use a trampoline
//! so both bound failures share a single patch slot.

use lattice_core::{Expr, Line, MatchArm, MatchPattern, Phase};

use super::{CompileError, Compiler};
use crate::bytecode::{encode_abc, op};

impl Compiler {
    pub(super) fn compile_match(
        &mut self,
        scrutinee: &Expr,
        arms: &[MatchArm],
        dst: u8,
        line: Line,
    ) -> Result<(), CompileError> {
        let s = self.alloc_reg(line)?;
        self.compile_expr(scrutinee, s)?;

        let mut end_jumps = Vec::with_capacity(arms.len());
        for arm in arms {
            let mut fail_jumps = Vec::new();
            self.begin_scope();

            match &arm.pattern {
                MatchPattern::Wildcard => {}
                MatchPattern::PhaseQual(phase) => {
                    let opcode = match phase {
                        Phase::Crystal => op::IS_CRYSTAL,
                        Phase::Fluid | Phase::Unphased => op::IS_FLUID,
                        Phase::Sublimated => {
                            return Err(CompileError::invalid(
                                "match phase qualifier must be crystal or fluid",
                                arm.line,
                            ))
                        }
                    };
                    let t = self.alloc_reg(arm.line)?;
                    self.emit(encode_abc(opcode, t, s, 0), arm.line);
                    fail_jumps.push(self.emit_jump(op::JMPFALSE, t, arm.line));
                    self.free_reg(t);
                }
                MatchPattern::Literal(lit) => {
                    let t = self.alloc_reg(arm.line)?;
                    let l = self.alloc_reg(arm.line)?;
                    self.compile_expr(lit, l)?;
                    self.emit(encode_abc(op::EQ, t, s, l), arm.line);
                    self.free_reg(l);
                    fail_jumps.push(self.emit_jump(op::JMPFALSE, t, arm.line));
                    self.free_reg(t);
                }
                MatchPattern::Range { start, end } => {
                    fail_jumps.push(self.compile_range_pattern(s, *start, *end, arm.line)?);
                }
                MatchPattern::Binding(name) => {
                    let bind = self.alloc_reg(arm.line)?;
                    self.emit(encode_abc(op::MOVE, bind, s, 0), arm.line);
                    self.declare_local(name, bind);
                }
            }

            if let Some(guard) = &arm.guard {
                let g = self.alloc_reg(arm.line)?;
                self.compile_expr(guard, g)?;
                fail_jumps.push(self.emit_jump(op::JMPFALSE, g, arm.line));
                self.free_reg(g);
            }

            let count = arm.body.stmts.len();
            if count == 0 {
                self.emit(encode_abc(op::LOADUNIT, dst, 0, 0), arm.line);
            }
            for (i, stmt) in arm.body.stmts.iter().enumerate() {
                let is_last = i + 1 == count;
                self.compile_stmt(stmt, is_last.then_some(dst))?;
            }

            self.end_scope(arm.line);
            end_jumps.push(self.emit_jump(op::JMP, 0, arm.line));
            for fail in fail_jumps {
                self.patch_jump(fail, arm.line)?;
            }
        }

        // Rendezvous: no arm matched.
        self.emit(encode_abc(op::LOADNIL, dst, 0, 0), line);
        for end in end_jumps {
            self.patch_jump(end, line)?;
        }
        self.free_reg(s);
        Ok(())
    }

    /// Range pattern test with both failures funneled through one
    /// `JMPFALSE` slot:
    ///
    /// ```text
    /// GTEQ t, s, lo
    /// JMPFALSE t  ----+      (lower bound failed)
    /// LTEQ t, s, hi   |
    /// JMP  ------------+--+  (skip the trampoline)
    /// LOADFALSE t  <--+   |  (trampoline)
    /// JMPFALSE t  <-------+  (single patchable failure slot)
    /// ```
    fn compile_range_pattern(
        &mut self,
        s: u8,
        start: i64,
        end: i64,
        line: Line,
    ) -> Result<usize, CompileError> {
        let t = self.alloc_reg(line)?;
        let b = self.alloc_reg(line)?;

        self.emit_load_int(start, b, line)?;
        self.emit(encode_abc(op::GTEQ, t, s, b), line);
        let to_trampoline = self.emit_jump(op::JMPFALSE, t, line);

        self.emit_load_int(end, b, line)?;
        self.emit(encode_abc(op::LTEQ, t, s, b), line);
        let skip = self.emit_jump(op::JMP, 0, line);

        self.patch_jump(to_trampoline, line)?;
        self.emit(encode_abc(op::LOADFALSE, t, 0, 0), line);
        self.patch_jump(skip, line)?;

        let fail = self.emit_jump(op::JMPFALSE, t, line);
        self.free_reg(b);
        self.free_reg(t);
        Ok(fail)
    }
}
