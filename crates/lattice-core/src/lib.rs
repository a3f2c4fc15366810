// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! # Lattice core types
//!
//! Foundational types shared between the (external) parser and the VM:
//!
//! - The AST contract: `Program`, `Item`, `Stmt`, `Expr`, patterns
//! - The `Phase` enum that encodes Lattice's mutation policy
//!
//! The parser is a separate component: it consumes source text and yields a
//! `Program`. Everything in this crate is pure data with no runtime
//! machinery attached.

pub mod ast;
pub mod phase;

pub use ast::{
    AssignTarget, BinaryOp, Block, EnumDecl, EnumVariant, Expr, FnDecl, FnExpr, ImplBlock, Item,
    LetPattern, Line, LogicalOp, MatchArm, MatchPattern, Param, Program, SelectArm, SelectArmKind,
    Stmt, StructDecl, StructField, TestDecl, TraitDecl, UnaryOp,
};
pub use phase::Phase;
