// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Module loading: `import` and `require`.
//!
//! The VM never touches source text itself; a [`ModuleResolver`] turns a
//! written path into a canonical file, reads it, and parses it with the
//! external parser. `FsResolver` implements the production search order
//! (stdlib, package root, CWD, script dir, absolute) and takes the
//! parser as a hook; `MockResolver` serves tests with preloaded
//! programs and never touches the filesystem.

#[cfg(test)]
mod modules_test;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lattice_core::Program;
use parking_lot::Mutex;

use crate::value::{MapData, MapKey, Value};
use crate::vm::Vm;

/// Search roots consulted by `resolve`.
#[derive(Debug, Clone, Default)]
pub struct ModuleSearch {
    /// Built-in stdlib directory, tried first.
    pub stdlib_root: Option<PathBuf>,
    /// Package root (`lat_modules/`).
    pub module_root: PathBuf,
    /// Directory of the currently executing script.
    pub script_dir: Option<PathBuf>,
}

/// Resolves, reads, and parses module sources.
pub trait ModuleResolver: Send + Sync {
    /// Canonical path for a written module path, or `None` if not found.
    fn resolve(&self, path: &str, search: &ModuleSearch) -> Option<PathBuf>;

    /// Read the module source.
    ///
    /// # Errors
    ///
    /// Returns a message when the file cannot be read.
    fn read(&self, path: &Path) -> Result<String, String>;

    /// Parse the module source into a `Program`.
    ///
    /// # Errors
    ///
    /// Returns a message when parsing fails.
    fn parse(&self, source: &str, path: &Path) -> Result<Program, String>;
}

/// Parser hook type for [`FsResolver`].
pub type ParseFn = dyn Fn(&str, &Path) -> Result<Program, String> + Send + Sync;

/// Filesystem resolver with the production search order. Parsing is
/// delegated to the external parser through a hook.
#[derive(Default)]
pub struct FsResolver {
    parser: Option<Arc<ParseFn>>,
}

impl FsResolver {
    /// A resolver without a parser hook (imports will fail to parse).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the external parser.
    #[must_use]
    pub fn with_parser(parser: Arc<ParseFn>) -> Self {
        Self {
            parser: Some(parser),
        }
    }
}

impl ModuleResolver for FsResolver {
    fn resolve(&self, path: &str, search: &ModuleSearch) -> Option<PathBuf> {
        let with_ext = if Path::new(path).extension().is_some() {
            PathBuf::from(path)
        } else {
            PathBuf::from(format!("{path}.lat"))
        };

        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(stdlib) = &search.stdlib_root {
            candidates.push(stdlib.join(&with_ext));
        }
        candidates.push(search.module_root.join(&with_ext));
        candidates.push(with_ext.clone());
        if let Some(dir) = &search.script_dir {
            candidates.push(dir.join(&with_ext));
        }
        if with_ext.is_absolute() {
            candidates.push(with_ext);
        }

        candidates
            .into_iter()
            .find(|c| c.is_file())
            .and_then(|c| c.canonicalize().ok())
    }

    fn read(&self, path: &Path) -> Result<String, String> {
        std::fs::read_to_string(path).map_err(|e| e.to_string())
    }

    fn parse(&self, source: &str, path: &Path) -> Result<Program, String> {
        match &self.parser {
            Some(parser) => parser(source, path),
            None => Err("no parser installed".to_string()),
        }
    }
}

/// Test resolver: preloaded `(path, Program)` pairs, no filesystem.
#[derive(Default)]
pub struct MockResolver {
    programs: Mutex<HashMap<PathBuf, Program>>,
}

impl MockResolver {
    /// An empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under a written path (".lat" appended when
    /// missing, as the real resolver does).
    pub fn register(&self, path: &str, program: Program) {
        self.programs.lock().insert(Self::key(path), program);
    }

    fn key(path: &str) -> PathBuf {
        let with_ext = if path.ends_with(".lat") {
            path.to_string()
        } else {
            format!("{path}.lat")
        };
        PathBuf::from("/mock").join(with_ext)
    }
}

impl ModuleResolver for MockResolver {
    fn resolve(&self, path: &str, _search: &ModuleSearch) -> Option<PathBuf> {
        let key = Self::key(path);
        self.programs.lock().contains_key(&key).then_some(key)
    }

    fn read(&self, _path: &Path) -> Result<String, String> {
        Ok(String::new())
    }

    fn parse(&self, _source: &str, path: &Path) -> Result<Program, String> {
        self.programs
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| "unknown mock module".to_string())
    }
}

impl Vm {
    fn module_search(&self) -> ModuleSearch {
        ModuleSearch {
            stdlib_root: self.options.stdlib_root.clone(),
            module_root: self.options.module_root.clone(),
            script_dir: self.script_dir.clone(),
        }
    }

    /// `IMPORT`: execute a module in an isolated scope, filter its
    /// bindings by the export list, cache by absolute path.
    pub(crate) fn exec_import(&mut self, dst: u8, path_idx: u16) -> Result<(), String> {
        let path = self.constant_str(path_idx)?;
        let abs = self
            .resolver
            .resolve(&path, &self.module_search())
            .ok_or_else(|| format!("cannot find module '{path}'"))?;

        if let Some(cached) = self.module_cache.get(&abs).map(Value::clone_or_borrow) {
            log::debug!("module cache hit: {}", abs.display());
            self.set_reg(dst, cached);
            return Ok(());
        }
        log::debug!("loading module: {}", abs.display());

        let chunk = self.load_module_chunk(&path, &abs)?;
        self.env.push_scope();
        let run = self.run_nested_chunk(Arc::clone(&chunk));
        let bindings = self.env.pop_scope();
        run.map_err(|e| format!("error in module '{path}': {e}"))?;

        let mut data = MapData::default();
        for (name, value) in bindings {
            if chunk.has_exports && !chunk.export_names.iter().any(|e| *e == name) {
                continue;
            }
            data.entries
                .insert(MapKey::Str(Arc::from(name.as_str())), value);
        }
        let module = Value::map_from(data);
        self.module_cache.insert(abs, module.clone_or_borrow());
        self.set_reg(dst, module);
        Ok(())
    }

    /// `REQUIRE`: execute a module once in the current global scope;
    /// yields `true`.
    pub(crate) fn exec_require(&mut self, dst: u8, path_idx: u16) -> Result<(), String> {
        let path = self.constant_str(path_idx)?;
        let abs = self
            .resolver
            .resolve(&path, &self.module_search())
            .ok_or_else(|| format!("cannot find module '{path}'"))?;

        if self.required.contains(&abs) {
            self.set_reg(dst, Value::bool(true));
            return Ok(());
        }
        // Marked before execution so require cycles terminate.
        self.required.insert(abs.clone());

        let chunk = self.load_module_chunk(&path, &abs)?;
        self.run_nested_chunk(chunk)
            .map_err(|e| format!("error in module '{path}': {e}"))?;
        self.set_reg(dst, Value::bool(true));
        Ok(())
    }

    fn load_module_chunk(
        &mut self,
        path: &str,
        abs: &Path,
    ) -> Result<crate::bytecode::ChunkRef, String> {
        let source = self
            .resolver
            .read(abs)
            .map_err(|e| format!("cannot read module '{path}': {e}"))?;
        let program = self
            .resolver
            .parse(&source, abs)
            .map_err(|e| format!("cannot parse module '{path}': {e}"))?;
        let chunk = crate::compiler::compile(&program)
            .map_err(|e| format!("cannot compile module '{path}': {e}"))?;
        self.chunks.push(Arc::clone(&chunk));
        Ok(chunk)
    }

    /// Run a chunk re-entrantly on this VM (modules, sub-chunks).
    pub(crate) fn run_nested_chunk(
        &mut self,
        chunk: crate::bytecode::ChunkRef,
    ) -> Result<Value, String> {
        let depth = self.frames.len();
        self.push_frame(chunk, Vec::new(), None, 0, false, None)?;
        match self.execute(depth + 1) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.teardown_to_depth(depth);
                Err(err.message)
            }
        }
    }
}
