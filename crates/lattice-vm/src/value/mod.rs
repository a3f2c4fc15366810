// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Value representation for the Lattice language.
//!
//! A `Value` is a tagged sum carrying two auxiliary fields next to its
//! payload: the `Phase` (mutation policy) and the `Region` (owner of any
//! heap payload). Primitive payloads live inline; aggregate payloads are
//! owned by the value and copied on moves per the clone discipline below;
//! channels, refs, closures, and iterators are shared handles.
//!
//! ## Clone discipline
//!
//! Three clone modes, applied by precise use-site:
//!
//! - [`Value::bitwise_copy`]: primitives and borrowed strings only.
//! - [`Value::clone_or_borrow`]: bitwise copy when possible, otherwise a
//!   real deep clone preserving region tags. Register moves, call
//!   arguments, constant loads.
//! - [`Value::deep_clone`]: full clone promoting every region tag to
//!   `Owned`. Escapes: globals, closed upvalues, long-lived containers,
//!   native-call arguments.


mod channel;
mod intern;
mod key;
mod printer;

pub use channel::{Channel, SelectWaiter, TryRecv};
pub use intern::{intern, INTERN_MAX_LEN};
pub use key::MapKey;
pub use printer::print_value;

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use lattice_core::Phase;
use parking_lot::{Mutex, RwLock};

use crate::bytecode::ChunkRef;

/// Type tags used by PIC keys and builtin-method lookup.
pub mod tag {
    /// Int.
    pub const INT: u8 = 0;
    /// Float.
    pub const FLOAT: u8 = 1;
    /// Bool.
    pub const BOOL: u8 = 2;
    /// Nil.
    pub const NIL: u8 = 3;
    /// Unit.
    pub const UNIT: u8 = 4;
    /// Range.
    pub const RANGE: u8 = 5;
    /// Str.
    pub const STR: u8 = 6;
    /// Array.
    pub const ARRAY: u8 = 7;
    /// Map.
    pub const MAP: u8 = 8;
    /// Set.
    pub const SET: u8 = 9;
    /// Tuple.
    pub const TUPLE: u8 = 10;
    /// Struct.
    pub const STRUCT: u8 = 11;
    /// Enum.
    pub const ENUM: u8 = 12;
    /// Buffer.
    pub const BUFFER: u8 = 13;
    /// Channel.
    pub const CHANNEL: u8 = 14;
    /// Closure.
    pub const CLOSURE: u8 = 15;
    /// Ref.
    pub const REF: u8 = 16;
    /// Iterator.
    pub const ITERATOR: u8 = 17;
}

/// Owner of a value's heap payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Region {
    /// The value owns its payload.
    #[default]
    Owned,
    /// Payload lives in a chunk's constant pool.
    Const,
    /// Payload lives in the process-wide intern table (never freed).
    Interned,
    /// Payload lives in the per-VM ephemeral region, reset between
    /// top-level executions; must not escape without a deep clone.
    Ephemeral,
}

impl Region {
    /// Whether a string in this region may be shared without owning it.
    #[inline]
    #[must_use]
    pub const fn is_borrowed(self) -> bool {
        matches!(self, Self::Const | Self::Interned)
    }
}

/// Per-key phase table for maps (created lazily on first partial freeze).
pub type KeyPhases = HashMap<MapKey, Phase>;

/// Map payload: insertion-ordered entries plus optional per-key phases.
#[derive(Debug, Clone, Default)]
pub struct MapData {
    /// Entries in insertion order.
    pub entries: IndexMap<MapKey, Value>,
    /// Per-key phase marks; `None` until a partial freeze creates it.
    pub key_phases: Option<KeyPhases>,
}

impl MapData {
    /// Whether mutation of `key` is blocked given the container phase.
    ///
    /// Blocked iff the container is crystal and the key is not marked
    /// fluid, or the key is independently marked crystal. A sublimated
    /// container rejects all mutation; fluid marks do not exempt keys.
    #[must_use]
    pub fn key_is_frozen(&self, key: &MapKey, container: Phase) -> bool {
        if container == Phase::Sublimated {
            return true;
        }
        let mark = self
            .key_phases
            .as_ref()
            .and_then(|p| p.get(key))
            .copied()
            .unwrap_or(Phase::Unphased);
        if mark.is_frozen() {
            return true;
        }
        container.is_frozen() && mark != Phase::Fluid
    }

    /// Set the phase mark of one key, creating the table lazily.
    pub fn set_key_phase(&mut self, key: MapKey, phase: Phase) {
        self.key_phases.get_or_insert_with(HashMap::new).insert(key, phase);
    }
}

/// Set payload.
#[derive(Debug, Clone, Default)]
pub struct SetData {
    /// Elements in insertion order.
    pub entries: IndexSet<MapKey>,
}

/// Struct payload: name, ordered fields, optional per-field phases.
#[derive(Debug, Clone)]
pub struct StructData {
    /// Struct type name.
    pub name: Arc<str>,
    /// Fields in declaration order.
    pub fields: Vec<(Arc<str>, Value)>,
    /// Per-field phase marks, parallel to `fields`; `None` until an alloy
    /// declaration or partial freeze creates it.
    pub field_phases: Option<Vec<Phase>>,
}

impl StructData {
    /// Index of a field by name.
    #[must_use]
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n.as_ref() == name)
    }

    /// Whether mutation of field `idx` is blocked given the container
    /// phase. A sublimated container rejects all mutation; fluid marks
    /// do not exempt fields.
    #[must_use]
    pub fn field_is_frozen(&self, idx: usize, container: Phase) -> bool {
        if container == Phase::Sublimated {
            return true;
        }
        let mark = self
            .field_phases
            .as_ref()
            .and_then(|p| p.get(idx))
            .copied()
            .unwrap_or(Phase::Unphased);
        if mark.is_frozen() {
            return true;
        }
        container.is_frozen() && mark != Phase::Fluid
    }

    /// Set the phase mark of one field, creating the table lazily.
    pub fn set_field_phase(&mut self, idx: usize, phase: Phase) {
        let phases = self
            .field_phases
            .get_or_insert_with(|| vec![Phase::Unphased; self.fields.len()]);
        if phases.len() < self.fields.len() {
            phases.resize(self.fields.len(), Phase::Unphased);
        }
        phases[idx] = phase;
    }
}

/// Enum payload.
#[derive(Debug, Clone)]
pub struct EnumData {
    /// Enum type name.
    pub enum_name: Arc<str>,
    /// Variant name.
    pub variant: Arc<str>,
    /// Payload values.
    pub payload: Vec<Value>,
}

/// What a closure executes when called.
#[derive(Debug, Clone)]
pub enum Callee {
    /// A compiled bytecode chunk.
    Chunk(ChunkRef),
    /// A native function by registry id.
    Native(u16),
    /// An extension function by registry id (string-protocol ABI).
    Extension(u16),
}

/// Shared state of a captured variable.
///
/// Open cells point into a live register frame via the absolute register
/// index; the VM's open-cell list closes them on frame exit, after which
/// the cell owns its value directly.
#[derive(Debug)]
pub enum UpvalueState {
    /// Cell reads/writes through the register stack.
    Open(usize),
    /// Cell owns its value.
    Closed(Value),
}

/// A captured-variable cell, shared by every closure capturing the same
/// local (coalesced on creation).
pub type UpvalueCell = Arc<Mutex<UpvalueState>>;

/// Closure payload: the callee plus captured upvalue cells.
#[derive(Debug)]
pub struct ClosureData {
    /// What to execute.
    pub callee: Callee,
    /// Captured cells in capture order.
    pub upvalues: Vec<UpvalueCell>,
}

/// Materialized iterator state (shared, advanced in place).
#[derive(Debug, Clone)]
pub struct IterState {
    /// Remaining items.
    pub items: Vec<Value>,
    /// Next position.
    pub pos: usize,
}

/// Shared mutable reference cell.
pub type SharedRef = Arc<RwLock<Value>>;

/// The payload of a value.
#[derive(Debug, Clone)]
pub enum ValueKind {
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// Nil.
    Nil,
    /// The unit value.
    Unit,
    /// Integer range `start..end` (start inclusive, end exclusive).
    Range(i64, i64),
    /// String; the byte length is cached by `Arc<str>` itself and the
    /// region tag records the owner.
    Str(Arc<str>),
    /// Array of values.
    Array(Vec<Value>),
    /// Insertion-ordered map.
    Map(Box<MapData>),
    /// Set.
    Set(Box<SetData>),
    /// Tuple.
    Tuple(Vec<Value>),
    /// Struct instance.
    Struct(Box<StructData>),
    /// Enum instance.
    Enum(Box<EnumData>),
    /// Byte buffer.
    Buffer(Vec<u8>),
    /// Channel handle (shared across threads).
    Channel(Channel),
    /// Closure (shared, immutable).
    Closure(Arc<ClosureData>),
    /// Shared mutable cell.
    Ref(SharedRef),
    /// Materialized iterator.
    Iterator(Arc<Mutex<IterState>>),
}

/// A Lattice value: payload plus phase and region tags.
#[derive(Debug, Clone)]
pub struct Value {
    /// Mutation policy.
    pub phase: Phase,
    /// Heap-payload owner.
    pub region: Region,
    /// The payload.
    pub kind: ValueKind,
}

impl Default for Value {
    fn default() -> Self {
        Self::nil()
    }
}

impl Value {
    /// Build a value with default phase and region.
    #[inline]
    #[must_use]
    pub const fn of(kind: ValueKind) -> Self {
        Self {
            phase: Phase::Unphased,
            region: Region::Owned,
            kind,
        }
    }

    /// Create a nil value.
    #[inline]
    #[must_use]
    pub const fn nil() -> Self {
        Self::of(ValueKind::Nil)
    }

    /// Create the unit value.
    #[inline]
    #[must_use]
    pub const fn unit() -> Self {
        Self::of(ValueKind::Unit)
    }

    /// Create an integer value.
    #[inline]
    #[must_use]
    pub const fn int(n: i64) -> Self {
        Self::of(ValueKind::Int(n))
    }

    /// Create a float value.
    #[inline]
    #[must_use]
    pub const fn float(f: f64) -> Self {
        Self::of(ValueKind::Float(f))
    }

    /// Create a boolean value.
    #[inline]
    #[must_use]
    pub const fn bool(b: bool) -> Self {
        Self::of(ValueKind::Bool(b))
    }

    /// Create a range value.
    #[inline]
    #[must_use]
    pub const fn range(start: i64, end: i64) -> Self {
        Self::of(ValueKind::Range(start, end))
    }

    /// Create a string value. Strings at or below [`INTERN_MAX_LEN`]
    /// bytes are interned; longer strings are owned.
    #[must_use]
    pub fn str(s: &str) -> Self {
        if s.len() <= INTERN_MAX_LEN {
            Self {
                phase: Phase::Unphased,
                region: Region::Interned,
                kind: ValueKind::Str(intern(s)),
            }
        } else {
            Self::of(ValueKind::Str(Arc::from(s)))
        }
    }

    /// Create a string value tagged with the ephemeral region (used by
    /// `CONCAT` for intermediate string builds).
    #[must_use]
    pub fn str_ephemeral(s: String) -> Self {
        if s.len() <= INTERN_MAX_LEN {
            return Self::str(&s);
        }
        Self {
            phase: Phase::Unphased,
            region: Region::Ephemeral,
            kind: ValueKind::Str(Arc::from(s.as_str())),
        }
    }

    /// Create an array value.
    #[inline]
    #[must_use]
    pub const fn array(elements: Vec<Self>) -> Self {
        Self::of(ValueKind::Array(elements))
    }

    /// Create a tuple value.
    #[inline]
    #[must_use]
    pub const fn tuple(elements: Vec<Self>) -> Self {
        Self::of(ValueKind::Tuple(elements))
    }

    /// Create an empty map value.
    #[must_use]
    pub fn map() -> Self {
        Self::of(ValueKind::Map(Box::default()))
    }

    /// Create a map value from data.
    #[must_use]
    pub fn map_from(data: MapData) -> Self {
        Self::of(ValueKind::Map(Box::new(data)))
    }

    /// Create a closure value.
    #[must_use]
    pub fn closure(data: ClosureData) -> Self {
        Self::of(ValueKind::Closure(Arc::new(data)))
    }

    /// Create a closure value over a chunk with no captures (prototype).
    #[must_use]
    pub fn chunk_closure(chunk: ChunkRef) -> Self {
        Self::closure(ClosureData {
            callee: Callee::Chunk(chunk),
            upvalues: Vec::new(),
        })
    }

    /// Whether this value is nil.
    #[inline]
    #[must_use]
    pub const fn is_nil(&self) -> bool {
        matches!(self.kind, ValueKind::Nil)
    }

    /// Whether this value is truthy (not nil and not false).
    #[inline]
    #[must_use]
    pub const fn is_truthy(&self) -> bool {
        !matches!(self.kind, ValueKind::Nil | ValueKind::Bool(false))
    }

    /// Whether this value is a closure.
    #[inline]
    #[must_use]
    pub const fn is_closure(&self) -> bool {
        matches!(self.kind, ValueKind::Closure(_))
    }

    /// Whether this kind participates in constant-pool deduplication.
    #[inline]
    #[must_use]
    pub const fn is_poolable(&self) -> bool {
        matches!(
            self.kind,
            ValueKind::Str(_) | ValueKind::Int(_) | ValueKind::Float(_)
        )
    }

    /// The integer payload, if this is an Int.
    #[inline]
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self.kind {
            ValueKind::Int(n) => Some(n),
            _ => None,
        }
    }

    /// The string payload, if this is a Str.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Type tag for PIC keys and phase-dispatch scoring.
    #[inline]
    #[must_use]
    pub const fn type_tag(&self) -> u8 {
        match self.kind {
            ValueKind::Int(_) => tag::INT,
            ValueKind::Float(_) => tag::FLOAT,
            ValueKind::Bool(_) => tag::BOOL,
            ValueKind::Nil => tag::NIL,
            ValueKind::Unit => tag::UNIT,
            ValueKind::Range(..) => tag::RANGE,
            ValueKind::Str(_) => tag::STR,
            ValueKind::Array(_) => tag::ARRAY,
            ValueKind::Map(_) => tag::MAP,
            ValueKind::Set(_) => tag::SET,
            ValueKind::Tuple(_) => tag::TUPLE,
            ValueKind::Struct(_) => tag::STRUCT,
            ValueKind::Enum(_) => tag::ENUM,
            ValueKind::Buffer(_) => tag::BUFFER,
            ValueKind::Channel(_) => tag::CHANNEL,
            ValueKind::Closure(_) => tag::CLOSURE,
            ValueKind::Ref(_) => tag::REF,
            ValueKind::Iterator(_) => tag::ITERATOR,
        }
    }

    /// Type name for error messages.
    #[inline]
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self.kind {
            ValueKind::Int(_) => "Int",
            ValueKind::Float(_) => "Float",
            ValueKind::Bool(_) => "Bool",
            ValueKind::Nil => "Nil",
            ValueKind::Unit => "Unit",
            ValueKind::Range(..) => "Range",
            ValueKind::Str(_) => "Str",
            ValueKind::Array(_) => "Array",
            ValueKind::Map(_) => "Map",
            ValueKind::Set(_) => "Set",
            ValueKind::Tuple(_) => "Tuple",
            ValueKind::Struct(_) => "Struct",
            ValueKind::Enum(_) => "Enum",
            ValueKind::Buffer(_) => "Buffer",
            ValueKind::Channel(_) => "Channel",
            ValueKind::Closure(_) => "Fn",
            ValueKind::Ref(_) => "Ref",
            ValueKind::Iterator(_) => "Iterator",
        }
    }

    /// Bitwise copy: primitives and borrowed strings only.
    ///
    /// Returns `None` for values whose copy requires a real clone.
    #[inline]
    #[must_use]
    pub fn bitwise_copy(&self) -> Option<Self> {
        match &self.kind {
            ValueKind::Int(_)
            | ValueKind::Float(_)
            | ValueKind::Bool(_)
            | ValueKind::Nil
            | ValueKind::Unit
            | ValueKind::Range(..) => Some(self.clone()),
            ValueKind::Str(_) if self.region.is_borrowed() => Some(self.clone()),
            _ => None,
        }
    }

    /// Clone-or-borrow: bitwise copy when possible, otherwise a deep
    /// clone that preserves region tags. Register moves, call arguments,
    /// constant loads.
    #[inline]
    #[must_use]
    pub fn clone_or_borrow(&self) -> Self {
        match self.bitwise_copy() {
            Some(v) => v,
            None => self.clone(),
        }
    }

    /// Deep clone for escapes: every region tag is promoted to `Owned`
    /// (shared handles - channels, refs, closures, iterators - keep their
    /// identity; sharing is their purpose).
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        let kind = match &self.kind {
            ValueKind::Array(items) => {
                ValueKind::Array(items.iter().map(Self::deep_clone).collect())
            }
            ValueKind::Tuple(items) => {
                ValueKind::Tuple(items.iter().map(Self::deep_clone).collect())
            }
            ValueKind::Map(data) => {
                let entries = data
                    .entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_clone()))
                    .collect();
                ValueKind::Map(Box::new(MapData {
                    entries,
                    key_phases: data.key_phases.clone(),
                }))
            }
            ValueKind::Struct(data) => {
                let fields = data
                    .fields
                    .iter()
                    .map(|(n, v)| (Arc::clone(n), v.deep_clone()))
                    .collect();
                ValueKind::Struct(Box::new(StructData {
                    name: Arc::clone(&data.name),
                    fields,
                    field_phases: data.field_phases.clone(),
                }))
            }
            ValueKind::Enum(data) => ValueKind::Enum(Box::new(EnumData {
                enum_name: Arc::clone(&data.enum_name),
                variant: Arc::clone(&data.variant),
                payload: data.payload.iter().map(Self::deep_clone).collect(),
            })),
            other => other.clone(),
        };
        Self {
            phase: self.phase,
            region: match self.region {
                Region::Interned | Region::Const => self.region,
                Region::Owned | Region::Ephemeral => Region::Owned,
            },
            kind,
        }
    }

    /// Apply a phase to this value and, recursively, to its interior
    /// aggregate values (freeze/thaw walk the structure).
    pub fn set_phase_recursive(&mut self, phase: Phase) {
        self.phase = phase;
        match &mut self.kind {
            ValueKind::Array(items) | ValueKind::Tuple(items) => {
                for item in items {
                    item.set_phase_recursive(phase);
                }
            }
            ValueKind::Map(data) => {
                for (_, v) in &mut data.entries {
                    v.set_phase_recursive(phase);
                }
            }
            ValueKind::Struct(data) => {
                for (_, v) in &mut data.fields {
                    v.set_phase_recursive(phase);
                }
            }
            ValueKind::Enum(data) => {
                for v in &mut data.payload {
                    v.set_phase_recursive(phase);
                }
            }
            _ => {}
        }
    }

    /// A frozen copy of this value.
    #[must_use]
    pub fn frozen(&self) -> Self {
        let mut v = self.clone_or_borrow();
        v.set_phase_recursive(Phase::Crystal);
        v
    }

    /// A thawed copy of this value.
    #[must_use]
    pub fn thawed(&self) -> Self {
        let mut v = self.clone_or_borrow();
        v.set_phase_recursive(Phase::Fluid);
        v
    }
}

impl PartialEq for Value {
    /// Structural equality on payloads; phase and region do not take part
    /// (freeze-then-thaw round trips compare equal to the original).
    fn eq(&self, other: &Self) -> bool {
        match (&self.kind, &other.kind) {
            (ValueKind::Int(a), ValueKind::Int(b)) => a == b,
            (ValueKind::Float(a), ValueKind::Float(b)) => a == b,
            (ValueKind::Int(a), ValueKind::Float(b)) | (ValueKind::Float(b), ValueKind::Int(a)) => {
                #[expect(clippy::cast_precision_loss, reason = "mixed numeric comparison")]
                let af = *a as f64;
                af == *b
            }
            (ValueKind::Bool(a), ValueKind::Bool(b)) => a == b,
            (ValueKind::Nil, ValueKind::Nil) | (ValueKind::Unit, ValueKind::Unit) => true,
            (ValueKind::Range(a1, a2), ValueKind::Range(b1, b2)) => a1 == b1 && a2 == b2,
            (ValueKind::Str(a), ValueKind::Str(b)) => Arc::ptr_eq(a, b) || a == b,
            (ValueKind::Array(a), ValueKind::Array(b))
            | (ValueKind::Tuple(a), ValueKind::Tuple(b)) => a == b,
            (ValueKind::Map(a), ValueKind::Map(b)) => a.entries == b.entries,
            (ValueKind::Set(a), ValueKind::Set(b)) => a.entries == b.entries,
            (ValueKind::Struct(a), ValueKind::Struct(b)) => {
                a.name == b.name && a.fields == b.fields
            }
            (ValueKind::Enum(a), ValueKind::Enum(b)) => {
                a.enum_name == b.enum_name && a.variant == b.variant && a.payload == b.payload
            }
            (ValueKind::Buffer(a), ValueKind::Buffer(b)) => a == b,
            (ValueKind::Channel(a), ValueKind::Channel(b)) => a.same_channel(b),
            (ValueKind::Closure(a), ValueKind::Closure(b)) => Arc::ptr_eq(a, b),
            (ValueKind::Ref(a), ValueKind::Ref(b)) => Arc::ptr_eq(a, b),
            (ValueKind::Iterator(a), ValueKind::Iterator(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
