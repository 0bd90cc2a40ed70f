// This module implements the compile-time value model that the register allocator works
// on. A Value is a handle for something the lowered program computes: an immediate
// constant, a named source variable, an unnamed temporary, or a reference (the result of
// taking an address). Each value records its semantic type, its current Position if it has
// one, whether it has been initialized, how many consuming uses are still to come, and an
// LRU counter used to break ties when a register has to be evicted. Named values also own a
// home position that is decided at most once (a OnceCell, so there is no path that moves
// it) and a dirty flag telling whether the register copy differs from that home. The
// ValueStore owns every value of a module and hands out stable ValueId indices.

//! Value handles tracked by the allocator.

use super::error::CompileResult;
use super::position::Position;
use super::types::Type;
use crate::internal;
use std::cell::OnceCell;
use std::fmt;

/// Index of a value within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Storage class of a named value, used to pick its home.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Lives in the frame of the function that declares it.
    Auto,
    /// Lives in the process-wide static segment.
    Static,
    /// Immutable data promoted into the code segment.
    ReadOnly,
}

/// Extra state carried by named values.
#[derive(Debug)]
pub struct NamedData<'a> {
    pub name: &'a str,
    home: OnceCell<Position>,
    /// Register copy differs from the home location.
    pub dirty: bool,
    pub storage: Storage,
    /// Its address escaped, so register copies must not outlive an operation.
    pub address_taken: bool,
}

impl<'a> NamedData<'a> {
    fn new(name: &'a str, storage: Storage) -> Self {
        Self {
            name,
            home: OnceCell::new(),
            dirty: false,
            storage,
            address_taken: false,
        }
    }

    pub fn home(&self) -> Option<Position> {
        self.home.get().copied()
    }

    /// Fix the home position. A second call is a bookkeeping error.
    pub fn set_home(&self, position: Position) -> CompileResult<()> {
        if position.is_register() {
            return Err(internal!("home of `{}` cannot be a register", self.name));
        }
        self.home
            .set(position)
            .map_err(|_| internal!("home of `{}` assigned twice", self.name))
    }
}

#[derive(Debug)]
pub enum ValueKind<'a> {
    Constant(u64),
    Named(NamedData<'a>),
    Temporary,
    Reference,
}

/// A compile-time value handle.
#[derive(Debug)]
pub struct Value<'a> {
    pub ty: Type,
    position: Option<Position>,
    pub initialized: bool,
    remaining_references: u32,
    last_touched: u64,
    pub description: &'a str,
    pub kind: ValueKind<'a>,
}

impl<'a> Value<'a> {
    fn new(ty: Type, kind: ValueKind<'a>, description: &'a str) -> Self {
        let initialized = !matches!(kind, ValueKind::Named(_));
        Self {
            ty,
            position: None,
            initialized,
            remaining_references: 0,
            last_touched: 0,
            description,
            kind,
        }
    }

    pub fn position(&self) -> Option<Position> {
        self.position
    }

    pub fn register(&self) -> Option<crate::core::AsmReg> {
        self.position.and_then(|p| p.register())
    }

    /// Record a new current position. Callers keep the register file in step.
    pub(crate) fn set_position(&mut self, position: Option<Position>) {
        self.position = position;
    }

    pub fn remaining_references(&self) -> u32 {
        self.remaining_references
    }

    pub fn last_touched(&self) -> u64 {
        self.last_touched
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, ValueKind::Constant(_))
    }

    pub fn is_named(&self) -> bool {
        matches!(self.kind, ValueKind::Named(_))
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, ValueKind::Reference)
    }

    /// Temporaries and references: values without a name or a home.
    pub fn is_unnamed(&self) -> bool {
        matches!(self.kind, ValueKind::Temporary | ValueKind::Reference)
    }

    pub fn constant_bits(&self) -> Option<u64> {
        match self.kind {
            ValueKind::Constant(bits) => Some(bits),
            _ => None,
        }
    }

    pub fn named(&self) -> Option<&NamedData<'a>> {
        match &self.kind {
            ValueKind::Named(data) => Some(data),
            _ => None,
        }
    }

    pub fn named_mut(&mut self) -> Option<&mut NamedData<'a>> {
        match &mut self.kind {
            ValueKind::Named(data) => Some(data),
            _ => None,
        }
    }

    pub fn home(&self) -> Option<Position> {
        self.named().and_then(|n| n.home())
    }

    pub fn is_dirty(&self) -> bool {
        self.named().is_some_and(|n| n.dirty)
    }

    /// Whether the value sits in its home with no newer register copy.
    pub fn at_home(&self) -> bool {
        match (self.home(), self.position) {
            (Some(home), Some(pos)) => home == pos,
            _ => false,
        }
    }
}

/// Owner of every value created for a module.
#[derive(Debug, Default)]
pub struct ValueStore<'a> {
    values: Vec<Value<'a>>,
    tick: u64,
}

impl<'a> ValueStore<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, value: Value<'a>) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(value);
        id
    }

    pub fn create_constant(&mut self, ty: Type, bits: u64, description: &'a str) -> ValueId {
        self.push(Value::new(ty, ValueKind::Constant(bits), description))
    }

    pub fn create_named(&mut self, ty: Type, name: &'a str, storage: Storage) -> ValueId {
        self.push(Value::new(ty, ValueKind::Named(NamedData::new(name, storage)), name))
    }

    pub fn create_temporary(&mut self, ty: Type, description: &'a str) -> ValueId {
        self.push(Value::new(ty, ValueKind::Temporary, description))
    }

    pub fn create_reference(&mut self, ty: Type, description: &'a str) -> ValueId {
        self.push(Value::new(ty, ValueKind::Reference, description))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, id: ValueId) -> &Value<'a> {
        &self.values[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ValueId) -> &mut Value<'a> {
        &mut self.values[id.0 as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (ValueId, &Value<'a>)> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| (ValueId(i as u32), v))
    }

    /// Count one more future use. Only the builder calls this, before lowering.
    pub(crate) fn note_use(&mut self, id: ValueId) {
        self.get_mut(id).remaining_references += 1;
    }

    /// Consume one reference during lowering.
    pub fn consume(&mut self, id: ValueId) -> CompileResult<u32> {
        let value = self.get_mut(id);
        if value.remaining_references == 0 {
            return Err(internal!(
                "reference count underflow on {id} ({})",
                value.description
            ));
        }
        value.remaining_references -= 1;
        Ok(value.remaining_references)
    }

    /// Mark a value as most recently used.
    pub fn touch(&mut self, id: ValueId) {
        self.tick += 1;
        let tick = self.tick;
        self.get_mut(id).last_touched = tick;
    }

    pub fn description(&self, id: ValueId) -> &'a str {
        self.get(id).description
    }
}
