//! Register bank bookkeeping.
//!
//! This module implements the RegisterFile that tracks which value owns each
//! register of the VM's two banks and which registers are locked against
//! eviction. Allocation policy (which register to hand out, which occupant to
//! spill) lives in [`crate::codegen::alloc`]; this file only records state and
//! refuses inconsistent updates.

use super::value::ValueId;
use crate::internal;
use super::error::CompileResult;
use std::fmt;

/// Number of register banks (integer-class and float-class).
pub const NUM_BANKS: usize = 2;

/// Number of registers per bank.
pub const REGS_PER_BANK: usize = 16;

/// Register banks of the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegBank {
    Int = 0,
    Float = 1,
}

impl RegBank {
    pub const ALL: [RegBank; NUM_BANKS] = [RegBank::Int, RegBank::Float];

    fn index(self) -> usize {
        self as usize
    }
}

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: u8,
}

impl AsmReg {
    pub const fn new(bank: RegBank, id: u8) -> Self {
        Self { bank, id }
    }

    pub const fn int(id: u8) -> Self {
        Self::new(RegBank::Int, id)
    }

    pub const fn float(id: u8) -> Self {
        Self::new(RegBank::Float, id)
    }

    pub fn is_float(&self) -> bool {
        self.bank == RegBank::Float
    }
}

impl fmt::Display for AsmReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bank {
            RegBank::Int => write!(f, "r{}", self.id),
            RegBank::Float => write!(f, "f{}", self.id),
        }
    }
}

/// Bit set for efficiently tracking register sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegBitSet {
    banks: [u64; NUM_BANKS],
}

impl RegBitSet {
    /// Create empty register set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if register is set.
    pub fn contains(&self, reg: AsmReg) -> bool {
        (self.banks[reg.bank.index()] & (1u64 << reg.id)) != 0
    }

    /// Set a register.
    pub fn set(&mut self, reg: AsmReg) {
        self.banks[reg.bank.index()] |= 1u64 << reg.id;
    }

    /// Clear a register.
    pub fn clear(&mut self, reg: AsmReg) {
        self.banks[reg.bank.index()] &= !(1u64 << reg.id);
    }

    /// Count number of set registers in bank.
    pub fn count_in_bank(&self, bank: RegBank) -> u32 {
        self.banks[bank.index()].count_ones()
    }

    /// Registers of `bank` contained in the set, lowest first.
    pub fn iter_bank(&self, bank: RegBank) -> impl Iterator<Item = AsmReg> + '_ {
        let bits = self.banks[bank.index()];
        (0..64u8)
            .filter(move |id| bits & (1u64 << id) != 0)
            .map(move |id| AsmReg::new(bank, id))
    }

    /// Clear all registers.
    pub fn clear_all(&mut self) {
        self.banks.fill(0);
    }
}

/// RegisterFile records register ownership for the allocator.
///
/// `bank[i] == Some(v)` must coincide with `v` reporting `Register(i)` as its
/// position; the allocator keeps both sides in step through [`bind`] and
/// [`unbind`].
///
/// [`bind`]: RegisterFile::bind
/// [`unbind`]: RegisterFile::unbind
#[derive(Debug, Clone)]
pub struct RegisterFile {
    /// Which value owns each register.
    occupants: [[Option<ValueId>; REGS_PER_BANK]; NUM_BANKS],
    /// Currently occupied registers.
    used: RegBitSet,
    /// Registers that cannot be handed out or evicted.
    locked: RegBitSet,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile {
    pub fn new() -> Self {
        Self {
            occupants: [[None; REGS_PER_BANK]; NUM_BANKS],
            used: RegBitSet::new(),
            locked: RegBitSet::new(),
        }
    }

    /// All registers of a bank, lowest index first.
    pub fn registers(bank: RegBank) -> impl Iterator<Item = AsmReg> {
        (0..REGS_PER_BANK as u8).map(move |id| AsmReg::new(bank, id))
    }

    /// Value currently owning `reg`.
    pub fn occupant(&self, reg: AsmReg) -> Option<ValueId> {
        self.occupants[reg.bank.index()][reg.id as usize]
    }

    pub fn is_empty(&self, reg: AsmReg) -> bool {
        self.occupant(reg).is_none()
    }

    pub fn is_locked(&self, reg: AsmReg) -> bool {
        self.locked.contains(reg)
    }

    /// Set the locked flag, returning its previous state.
    pub fn set_locked(&mut self, reg: AsmReg, locked: bool) -> bool {
        let previous = self.locked.contains(reg);
        if locked {
            self.locked.set(reg);
        } else {
            self.locked.clear(reg);
        }
        previous
    }

    /// Record `value` as the owner of the empty register `reg`.
    pub fn bind(&mut self, reg: AsmReg, value: ValueId) -> CompileResult<()> {
        self.check_index(reg)?;
        if let Some(current) = self.occupant(reg) {
            return Err(internal!(
                "register {reg} believed empty but holds {current}"
            ));
        }
        self.occupants[reg.bank.index()][reg.id as usize] = Some(value);
        self.used.set(reg);
        Ok(())
    }

    /// Clear ownership of `reg`, returning the previous occupant.
    pub fn unbind(&mut self, reg: AsmReg) -> CompileResult<ValueId> {
        self.check_index(reg)?;
        let slot = &mut self.occupants[reg.bank.index()][reg.id as usize];
        match slot.take() {
            Some(value) => {
                self.used.clear(reg);
                Ok(value)
            }
            None => Err(internal!("register {reg} released while empty")),
        }
    }

    /// Empty, unlocked registers of a bank.
    pub fn free_registers(&self, bank: RegBank) -> impl Iterator<Item = AsmReg> + '_ {
        Self::registers(bank).filter(move |r| self.is_empty(*r) && !self.is_locked(*r))
    }

    /// Occupied registers of a bank together with their owners.
    pub fn occupied(&self, bank: RegBank) -> impl Iterator<Item = (AsmReg, ValueId)> + '_ {
        Self::registers(bank).filter_map(move |r| self.occupant(r).map(|v| (r, v)))
    }

    /// Occupied registers of both banks.
    pub fn all_occupied(&self) -> Vec<(AsmReg, ValueId)> {
        RegBank::ALL
            .iter()
            .flat_map(|bank| self.occupied(*bank))
            .collect()
    }

    /// Get register usage statistics for a bank: (used, locked, total).
    pub fn bank_usage(&self, bank: RegBank) -> (u32, u32, u32) {
        (
            self.used.count_in_bank(bank),
            self.locked.count_in_bank(bank),
            REGS_PER_BANK as u32,
        )
    }

    /// Forget every binding and lock.
    pub fn reset(&mut self) {
        self.occupants = [[None; REGS_PER_BANK]; NUM_BANKS];
        self.used.clear_all();
        self.locked.clear_all();
    }

    fn check_index(&self, reg: AsmReg) -> CompileResult<()> {
        if (reg.id as usize) < REGS_PER_BANK {
            Ok(())
        } else {
            Err(internal!("register {reg} out of range"))
        }
    }
}
