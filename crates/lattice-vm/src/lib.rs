// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! # Lattice VM
//!
//! Execution core of the Lattice language: the register-based bytecode
//! compiler and virtual machine, including the phase system (fluid /
//! crystal / sublimated values with reactive propagation).
//!
//! This crate provides:
//! - Value representation with phase and region tags
//! - Bytecode chunks and the 32-bit instruction encoding
//! - The AST-to-bytecode register compiler
//! - The dispatch loop: calls, exceptions, defers, phase-aware mutation
//! - Phase runtime services: reactions, bonds, seeds, pressures, history
//! - Inline method caches for builtin dispatch
//! - Module loading (`import`/`require`) behind a resolver trait
//! - Structured concurrency: `scope { spawn ... }` and `select`
//!
//! The lexer/parser is an external collaborator: it produces the
//! `lattice_core::Program` consumed by [`compiler::compile`].

#[cfg(test)]
pub(crate) mod testutil;

pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod concurrency;
pub mod modules;
pub mod natives;
pub mod phase;
pub mod suggest;
pub mod value;
pub mod vm;

pub use compiler::{compile, disassemble, CompileError, Compiler};
pub use modules::{FsResolver, MockResolver, ModuleResolver};
pub use value::Value;
pub use vm::{RuntimeError, Vm, VmOptions};

use lattice_core::Program;
use thiserror::Error;

/// Top-level failure of an embed-and-run cycle.
#[derive(Debug, Error)]
pub enum LatticeError {
    /// Lowering the AST failed.
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),
    /// Execution failed with no active handler.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Compile and execute a program on a fresh VM, returning the script
/// result and the VM (for inspecting globals and output).
///
/// # Errors
///
/// Returns compile or runtime failures.
pub fn interpret(program: &Program) -> Result<(Value, Vm), LatticeError> {
    let chunk = compile(program)?;
    let mut vm = Vm::new();
    let value = vm.run_chunk(chunk)?;
    Ok((value, vm))
}

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
