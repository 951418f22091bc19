//! Free/busy bookkeeping over the ARM64 register file.
//!
//! This is a helper for the MIR-building caller's manual allocation, not
//! a coloring allocator: it tracks which register is owned by which
//! instruction and enforces a lock/release discipline, nothing more.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::bits::reg::{Reg, RegClass};
use crate::error::OutOfRegisters;
use crate::mir::InstIndex;

/// Caller-saved general-purpose registers, in allocation order.
///
/// The temporaries x8-x15 come first so that the argument registers
/// x0-x7 stay free as long as possible; x16-x18 are left to the linker
/// and platform.
pub const GP_ALLOC_ORDER: [Reg; 16] = [
    Reg::X(8),
    Reg::X(9),
    Reg::X(10),
    Reg::X(11),
    Reg::X(12),
    Reg::X(13),
    Reg::X(14),
    Reg::X(15),
    Reg::X(0),
    Reg::X(1),
    Reg::X(2),
    Reg::X(3),
    Reg::X(4),
    Reg::X(5),
    Reg::X(6),
    Reg::X(7),
];

/// Caller-saved vector registers, in allocation order.
///
/// v16-v31 come first; the argument registers v0-v7 follow. v8-v15 are
/// callee-saved in their low 64 bits and are not handed out.
pub const VECTOR_ALLOC_ORDER: [Reg; 24] = [
    Reg::V(16),
    Reg::V(17),
    Reg::V(18),
    Reg::V(19),
    Reg::V(20),
    Reg::V(21),
    Reg::V(22),
    Reg::V(23),
    Reg::V(24),
    Reg::V(25),
    Reg::V(26),
    Reg::V(27),
    Reg::V(28),
    Reg::V(29),
    Reg::V(30),
    Reg::V(31),
    Reg::V(0),
    Reg::V(1),
    Reg::V(2),
    Reg::V(3),
    Reg::V(4),
    Reg::V(5),
    Reg::V(6),
    Reg::V(7),
];

#[derive(Debug, Default)]
struct State {
    owners: HashMap<Reg, InstIndex>,
    locked: HashSet<Reg>,
}

/// Ownership bookkeeping for the allocatable registers.
///
/// Ownership is tracked per hardware register: the canonical 64-bit view
/// is used as the key, so allocating `w3` and `x3` conflict as they must.
#[derive(Debug, Default)]
pub struct RegisterManager {
    state: RefCell<State>,
}

/// Scoped lock on one register; released when dropped.
#[derive(Debug)]
#[must_use = "dropping the lock releases the register"]
pub struct RegLock<'a> {
    manager: &'a RegisterManager,
    reg: Reg,
}

impl Drop for RegLock<'_> {
    fn drop(&mut self) {
        self.manager.state.borrow_mut().locked.remove(&self.reg);
        trace!(reg = %self.reg, "unlocked register");
    }
}

impl RegisterManager {
    /// A manager with every register free and unlocked.
    pub fn new() -> RegisterManager {
        RegisterManager::default()
    }

    /// Allocates the first free, unlocked register of `class` in the
    /// documented order and assigns it to `inst`.
    pub fn alloc_reg(&self, inst: InstIndex, class: RegClass) -> Result<Reg, OutOfRegisters> {
        let order: &[Reg] = match class {
            RegClass::GeneralPurpose => &GP_ALLOC_ORDER,
            RegClass::Vector => &VECTOR_ALLOC_ORDER,
            RegClass::Special => return Err(OutOfRegisters(class)),
        };
        let mut state = self.state.borrow_mut();
        for &reg in order {
            if state.owners.contains_key(&reg) || state.locked.contains(&reg) {
                continue;
            }
            state.owners.insert(reg, inst);
            trace!(reg = %reg, inst = %inst, "allocated register");
            return Ok(reg);
        }
        Err(OutOfRegisters(class))
    }

    /// Assigns `reg` to `inst`.
    ///
    /// # Panics
    ///
    /// Panics if the register is already owned; the caller promised it
    /// was free.
    pub fn get_reg_assume_free(&self, reg: Reg, inst: InstIndex) {
        let reg = canonical(reg);
        let mut state = self.state.borrow_mut();
        let previous = state.owners.insert(reg, inst);
        assert!(
            previous.is_none(),
            "register {reg} was assumed free but is owned by {}",
            previous.unwrap(),
        );
    }

    /// Releases `reg`, whoever owned it. Releasing a free register is
    /// not an error.
    pub fn free_reg(&self, reg: Reg) {
        self.state.borrow_mut().owners.remove(&canonical(reg));
    }

    /// The instruction owning `reg`, if any.
    pub fn owner(&self, reg: Reg) -> Option<InstIndex> {
        self.state.borrow().owners.get(&canonical(reg)).copied()
    }

    /// Whether `reg` is neither owned nor locked.
    pub fn is_free(&self, reg: Reg) -> bool {
        let reg = canonical(reg);
        let state = self.state.borrow();
        !state.owners.contains_key(&reg) && !state.locked.contains(&reg)
    }

    /// Excludes `reg` from allocation until the returned lock drops.
    /// Returns `None` if the register is already locked.
    pub fn lock_reg(&self, reg: Reg) -> Option<RegLock<'_>> {
        let reg = canonical(reg);
        let mut state = self.state.borrow_mut();
        if !state.locked.insert(reg) {
            return None;
        }
        trace!(reg = %reg, "locked register");
        Some(RegLock { manager: self, reg })
    }

    /// Locks several registers at once. Each slot is `None` if that
    /// register was already locked.
    pub fn lock_regs<const N: usize>(&self, regs: [Reg; N]) -> [Option<RegLock<'_>>; N] {
        regs.map(|reg| self.lock_reg(reg))
    }
}

/// The canonical key for one hardware register: its widest view.
fn canonical(reg: Reg) -> Reg {
    match reg {
        Reg::W(n) => Reg::X(n),
        Reg::Wzr => Reg::Xzr,
        Reg::D(n) | Reg::S(n) | Reg::H(n) | Reg::B(n) => Reg::V(n),
        other => other,
    }
}
