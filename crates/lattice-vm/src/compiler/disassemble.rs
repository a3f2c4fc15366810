// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Debug helper: disassemble a chunk to a string.

use std::fmt::Write;

use crate::bytecode::{
    decode_a, decode_b, decode_bx, decode_c, decode_opcode, decode_sbx, decode_sbx24, decode_sc,
    op, Chunk,
};

/// Render a chunk as a human-readable listing with its constant pool.
#[must_use]
pub fn disassemble(chunk: &Chunk) -> String {
    let mut out = String::new();
    if let Some(name) = &chunk.name {
        let _ = writeln!(out, "; fn {name} (arity {})", chunk.arity);
    }

    for (i, &instr) in chunk.code.iter().enumerate() {
        let opcode = decode_opcode(instr);
        let a = decode_a(instr);
        let b = decode_b(instr);
        let c = decode_c(instr);
        let bx = decode_bx(instr);
        let sbx = decode_sbx(instr);

        let _ = write!(out, "{i:04}: ");
        let _ = match opcode {
            op::LOADK => writeln!(out, "LOADK      R{a}, K{bx}"),
            op::LOADI => writeln!(out, "LOADI      R{a}, {sbx}"),
            op::LOADNIL => writeln!(out, "LOADNIL    R{a}"),
            op::LOADTRUE => writeln!(out, "LOADTRUE   R{a}"),
            op::LOADFALSE => writeln!(out, "LOADFALSE  R{a}"),
            op::LOADUNIT => writeln!(out, "LOADUNIT   R{a}"),
            op::MOVE => writeln!(out, "MOVE       R{a}, R{b}"),
            op::ADD => writeln!(out, "ADD        R{a}, R{b}, R{c}"),
            op::SUB => writeln!(out, "SUB        R{a}, R{b}, R{c}"),
            op::MUL => writeln!(out, "MUL        R{a}, R{b}, R{c}"),
            op::DIV => writeln!(out, "DIV        R{a}, R{b}, R{c}"),
            op::MOD => writeln!(out, "MOD        R{a}, R{b}, R{c}"),
            op::NEG => writeln!(out, "NEG        R{a}, R{b}"),
            op::ADDI => writeln!(out, "ADDI       R{a}, R{b}, {}", decode_sc(instr)),
            op::ADD_INT => writeln!(out, "ADD_INT    R{a}, R{b}, R{c}"),
            op::SUB_INT => writeln!(out, "SUB_INT    R{a}, R{b}, R{c}"),
            op::MUL_INT => writeln!(out, "MUL_INT    R{a}, R{b}, R{c}"),
            op::LT_INT => writeln!(out, "LT_INT     R{a}, R{b}, R{c}"),
            op::LTEQ_INT => writeln!(out, "LTEQ_INT   R{a}, R{b}, R{c}"),
            op::INC_REG => writeln!(out, "INC_REG    R{a}"),
            op::DEC_REG => writeln!(out, "DEC_REG    R{a}"),
            op::CONCAT => writeln!(out, "CONCAT     R{a}, R{b}, R{c}"),
            op::EQ => writeln!(out, "EQ         R{a}, R{b}, R{c}"),
            op::NEQ => writeln!(out, "NEQ        R{a}, R{b}, R{c}"),
            op::LT => writeln!(out, "LT         R{a}, R{b}, R{c}"),
            op::LTEQ => writeln!(out, "LTEQ       R{a}, R{b}, R{c}"),
            op::GT => writeln!(out, "GT         R{a}, R{b}, R{c}"),
            op::GTEQ => writeln!(out, "GTEQ       R{a}, R{b}, R{c}"),
            op::NOT => writeln!(out, "NOT        R{a}, R{b}"),
            op::JMP => writeln!(out, "JMP        {:+}", decode_sbx24(instr)),
            op::JMPFALSE => writeln!(out, "JMPFALSE   R{a}, {sbx:+}"),
            op::JMPTRUE => writeln!(out, "JMPTRUE    R{a}, {sbx:+}"),
            op::JMPNOTNIL => writeln!(out, "JMPNOTNIL  R{a}, {sbx:+}"),
            op::GETGLOBAL => writeln!(out, "GETGLOBAL  R{a}, K{bx}"),
            op::SETGLOBAL => writeln!(out, "SETGLOBAL  R{a}, K{bx}"),
            op::DEFINEGLOBAL => writeln!(out, "DEFGLOBAL  R{a}, K{bx}"),
            op::GETUPVALUE => writeln!(out, "GETUPVAL   R{a}, U{b}"),
            op::SETUPVALUE => writeln!(out, "SETUPVAL   R{a}, U{b}"),
            op::CLOSEUPVALUE => writeln!(out, "CLOSEUPVAL R{a}"),
            op::GETFIELD => writeln!(out, "GETFIELD   R{a}, R{b}, K{c}"),
            op::SETFIELD => writeln!(out, "SETFIELD   R{a}, K{b}, R{c}"),
            op::GETINDEX => writeln!(out, "GETINDEX   R{a}, R{b}, R{c}"),
            op::SETINDEX => writeln!(out, "SETINDEX   R{a}, R{b}, R{c}"),
            op::SETINDEX_LOCAL => writeln!(out, "SETINDEX_L R{a}, R{b}, R{c}"),
            op::SETSLICE => writeln!(out, "SETSLICE   R{a}, R{b}, R{c}"),
            op::SETSLICE_LOCAL => writeln!(out, "SETSLICE_L R{a}, R{b}, R{c}"),
            op::NEWARRAY => writeln!(out, "NEWARRAY   R{a}, R{b}, #{c}"),
            op::NEWTUPLE => writeln!(out, "NEWTUPLE   R{a}, R{b}, #{c}"),
            op::NEWSTRUCT => writeln!(out, "NEWSTRUCT  R{a}, R{b}, #{c}"),
            op::NEWENUM => writeln!(out, "NEWENUM    R{a}, R{b}, #{c}"),
            op::BUILDRANGE => writeln!(out, "BUILDRANGE R{a}, R{b}, R{c}"),
            op::CLOSURE => writeln!(out, "CLOSURE    R{a}, K{bx}"),
            op::CALL => writeln!(out, "CALL       R{a}, {b} args"),
            op::RETURN => writeln!(out, "RETURN     R{a}"),
            op::INVOKE => writeln!(out, "INVOKE     R{a}, K{bx}"),
            op::INVOKE_LOCAL => writeln!(out, "INVOKE_L   R{a}, K{bx}"),
            op::INVOKE_GLOBAL => writeln!(out, "INVOKE_G   R{a}, K{bx}"),
            op::FREEZE => writeln!(out, "FREEZE     R{a}, R{b}"),
            op::THAW => writeln!(out, "THAW       R{a}, R{b}"),
            op::CLONE => writeln!(out, "CLONE      R{a}, R{b}"),
            op::FREEZE_VAR => writeln!(out, "FREEZE_VAR loc {a}, slot {b}"),
            op::THAW_VAR => writeln!(out, "THAW_VAR   loc {a}, slot {b}"),
            op::SUBLIMATE_VAR => writeln!(out, "SUBL_VAR   loc {a}, slot {b}"),
            op::FREEZE_FIELD => writeln!(out, "FREEZE_FLD R{a}, K{bx}"),
            op::THAW_FIELD => writeln!(out, "THAW_FLD   R{a}, K{bx}"),
            op::FREEZE_EXCEPT => writeln!(out, "FREEZE_EXC R{a}"),
            op::IS_CRYSTAL => writeln!(out, "IS_CRYSTAL R{a}, R{b}"),
            op::IS_FLUID => writeln!(out, "IS_FLUID   R{a}, R{b}"),
            op::MARKFLUID => writeln!(out, "MARKFLUID  R{a}"),
            op::SUBLIMATE => writeln!(out, "SUBLIMATE  R{a}"),
            op::REACT => writeln!(out, "REACT      R{a}, K{bx}"),
            op::UNREACT => writeln!(out, "UNREACT    K{bx}"),
            op::BOND => writeln!(out, "BOND       R{a}, K{bx}"),
            op::UNBOND => writeln!(out, "UNBOND     K{bx}"),
            op::SEED => writeln!(out, "SEED       R{a}, K{bx}"),
            op::UNSEED => writeln!(out, "UNSEED     K{bx}"),
            op::PUSH_HANDLER => writeln!(out, "PUSH_HNDLR R{a}, {sbx:+}"),
            op::POP_HANDLER => writeln!(out, "POP_HNDLR"),
            op::THROW => writeln!(out, "THROW      R{a}"),
            op::TRY_UNWRAP => writeln!(out, "TRY_UNWRAP R{a}"),
            op::DEFER_PUSH => writeln!(out, "DEFER_PUSH depth {a}, {sbx:+}"),
            op::DEFER_RUN => writeln!(out, "DEFER_RUN  depth {a}"),
            op::ITERINIT => writeln!(out, "ITERINIT   R{a}, R{b}"),
            op::ITERNEXT => writeln!(out, "ITERNEXT   R{a}, R{b}, R{c}"),
            op::LEN => writeln!(out, "LEN        R{a}, R{b}"),
            op::COLLECT_VARARGS => writeln!(out, "VARARGS    R{a}"),
            op::CHECK_TYPE => writeln!(out, "CHECK_TYPE R{a}, K{bx}"),
            op::IMPORT => writeln!(out, "IMPORT     R{a}, K{bx}"),
            op::REQUIRE => writeln!(out, "REQUIRE    R{a}, K{bx}"),
            op::SCOPE => writeln!(out, "SCOPE      R{a}, {b} spawns"),
            op::SELECT => writeln!(out, "SELECT     R{a}, {b} arms"),
            op::HALT => writeln!(out, "HALT       R{a}"),
            op::RESET_EPHEMERAL => writeln!(out, "RESET_EPH"),
            op::DATA => writeln!(out, "DATA       {a}, {b}, {c}"),
            _ => writeln!(out, "??? opcode={opcode}"),
        };
    }

    if !chunk.constants.is_empty() {
        let _ = writeln!(out, "\nConstants:");
        for (i, constant) in chunk.constants.iter().enumerate() {
            let _ = writeln!(out, "  K{i}: {}", crate::value::print_value(constant));
        }
    }

    out
}
