// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Test helpers: AST builders standing in for the external parser, plus
//! compile-and-run shorthands.

#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use lattice_core::{
    AssignTarget, BinaryOp, Block, Expr, FnDecl, FnExpr, Item, LetPattern, Param, Program, Stmt,
};

use crate::value::Value;
use crate::vm::{RuntimeError, Vm};

pub fn int(n: i64) -> Expr {
    Expr::Int { value: n, line: 1 }
}

pub fn float(f: f64) -> Expr {
    Expr::Float { value: f, line: 1 }
}

pub fn boolean(b: bool) -> Expr {
    Expr::Bool { value: b, line: 1 }
}

pub fn string(s: &str) -> Expr {
    Expr::Str {
        value: s.to_string(),
        line: 1,
    }
}

pub fn nil() -> Expr {
    Expr::Nil { line: 1 }
}

pub fn ident(name: &str) -> Expr {
    Expr::Ident {
        name: name.to_string(),
        line: 1,
    }
}

pub fn array(elements: Vec<Expr>) -> Expr {
    Expr::Array { elements, line: 1 }
}

pub fn bin(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        line: 1,
    }
}

pub fn call(name: &str, args: Vec<Expr>) -> Expr {
    Expr::Call {
        callee: Box::new(ident(name)),
        args,
        line: 1,
    }
}

pub fn call_expr(callee: Expr, args: Vec<Expr>) -> Expr {
    Expr::Call {
        callee: Box::new(callee),
        args,
        line: 1,
    }
}

pub fn method(receiver: Expr, name: &str, args: Vec<Expr>) -> Expr {
    Expr::MethodCall {
        receiver: Box::new(receiver),
        method: name.to_string(),
        args,
        line: 1,
    }
}

pub fn index(obj: Expr, idx: Expr) -> Expr {
    Expr::Index {
        obj: Box::new(obj),
        index: Box::new(idx),
        line: 1,
    }
}

pub fn field(obj: Expr, name: &str) -> Expr {
    Expr::Field {
        obj: Box::new(obj),
        field: name.to_string(),
        line: 1,
    }
}

pub fn block(stmts: Vec<Stmt>) -> Block {
    Block { stmts, line: 1 }
}

pub fn block_expr(stmts: Vec<Stmt>) -> Expr {
    Expr::BlockExpr {
        block: block(stmts),
        line: 1,
    }
}

pub fn let_s(name: &str, value: Expr) -> Stmt {
    Stmt::Let {
        pattern: LetPattern::Ident(name.to_string()),
        value,
        fixed: false,
        line: 1,
    }
}

pub fn fix_s(name: &str, value: Expr) -> Stmt {
    Stmt::Let {
        pattern: LetPattern::Ident(name.to_string()),
        value,
        fixed: true,
        line: 1,
    }
}

pub fn assign_s(name: &str, value: Expr) -> Stmt {
    Stmt::Assign {
        target: AssignTarget::Ident(name.to_string()),
        value,
        line: 1,
    }
}

pub fn expr_s(value: Expr) -> Stmt {
    Stmt::Expr { value, line: 1 }
}

pub fn ret_s(value: Expr) -> Stmt {
    Stmt::Return {
        value: Some(value),
        line: 1,
    }
}

pub fn throw_s(value: Expr) -> Stmt {
    Stmt::Throw { value, line: 1 }
}

pub fn defer_s(stmts: Vec<Stmt>) -> Stmt {
    Stmt::Defer {
        body: block(stmts),
        line: 1,
    }
}

pub fn params(names: &[&str]) -> Vec<Param> {
    names.iter().map(|n| Param::plain(n)).collect()
}

pub fn fn_expr(param_names: &[&str], body: Vec<Stmt>) -> FnExpr {
    FnExpr {
        name: None,
        params: params(param_names),
        variadic: None,
        body: block(body),
        return_type: None,
        ensures: Vec::new(),
        line: 1,
    }
}

pub fn closure(param_names: &[&str], body: Vec<Stmt>) -> Expr {
    Expr::Fn {
        func: Box::new(fn_expr(param_names, body)),
        line: 1,
    }
}

pub fn fn_item(name: &str, param_names: &[&str], body: Vec<Stmt>) -> Item {
    let mut func = fn_expr(param_names, body);
    func.name = Some(name.to_string());
    Item::Fn(FnDecl {
        name: name.to_string(),
        func,
        line: 1,
    })
}

pub fn program(items: Vec<Item>) -> Program {
    Program { items }
}

pub fn stmts_program(stmts: Vec<Stmt>) -> Program {
    Program {
        items: stmts.into_iter().map(Item::Stmt).collect(),
    }
}

/// Compile and run, panicking on failure.
pub fn run(program: &Program) -> (Value, Vm) {
    let chunk = crate::compiler::compile(program).expect("compile error");
    let mut vm = Vm::new();
    let value = vm.run_chunk(chunk).expect("runtime error");
    (value, vm)
}

/// Compile and run statements.
pub fn run_stmts(stmts: Vec<Stmt>) -> (Value, Vm) {
    run(&stmts_program(stmts))
}

/// Compile and run, expecting a runtime error.
pub fn run_err(program: &Program) -> RuntimeError {
    let chunk = crate::compiler::compile(program).expect("compile error");
    let mut vm = Vm::new();
    vm.run_chunk(chunk).expect_err("expected a runtime error")
}

/// Compile and run statements, expecting a runtime error.
pub fn run_stmts_err(stmts: Vec<Stmt>) -> RuntimeError {
    run_err(&stmts_program(stmts))
}
