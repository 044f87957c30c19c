//! Live GC-reference tracking during code emission.
//!
//! Two register masks (fully-tracked GC refs and interior byrefs, always
//! disjoint) plus a bitset of live stack-resident tracked variables. The
//! state effective after each safepoint-eligible instruction is recorded
//! against the instruction id and materialized to native offsets once
//! layout has fixed them.

use fixedbitset::FixedBitSet;

use crate::instr::InstrId;
use crate::reg::{Reg, RegSet};

/// GC-ness of a register operand.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum GcType {
    None,
    Ref,
    Byref,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PointerKind {
    NonPointer,
    GcRef,
    Byref,
}

impl From<GcType> for PointerKind {
    fn from(ty: GcType) -> PointerKind {
        match ty {
            GcType::None => PointerKind::NonPointer,
            GcType::Ref => PointerKind::GcRef,
            GcType::Byref => PointerKind::Byref,
        }
    }
}

/// Snapshot of the live-pointer state at one program point.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GcState {
    pub gcref_regs: RegSet,
    pub byref_regs: RegSet,
    pub gcref_vars: FixedBitSet,
}

impl GcState {
    pub fn new(tracked_var_count: usize) -> GcState {
        GcState {
            gcref_regs: RegSet::empty(),
            byref_regs: RegSet::empty(),
            gcref_vars: FixedBitSet::with_capacity(tracked_var_count),
        }
    }

    pub fn assert_disjoint(&self) {
        assert!(
            !self.gcref_regs.intersects(self.byref_regs),
            "register marked both GC-ref and byref: {:?}",
            self.gcref_regs & self.byref_regs
        );
    }
}

/// Safepoint entry before offsets are known: keyed by instruction id.
#[derive(Clone, Debug)]
pub struct PendingSafepoint {
    pub instr: InstrId,
    pub gcref_regs: RegSet,
    pub byref_regs: RegSet,
    pub live_var_indices: Vec<u32>,
}

pub struct GcTracker {
    state: GcState,

    /// Registers currently homing a tracked variable. Never cleared
    /// implicitly by a NonPointer kill; the variable's death clears them.
    pinned_var_regs: RegSet,

    safepoints: Vec<PendingSafepoint>,
}

impl GcTracker {
    pub fn new(tracked_var_count: usize) -> GcTracker {
        GcTracker {
            state: GcState::new(tracked_var_count),
            pinned_var_regs: RegSet::empty(),
            safepoints: Vec::new(),
        }
    }

    pub fn state(&self) -> &GcState {
        &self.state
    }

    /// Replaces the whole state, e.g. with the explicit snapshot given at
    /// a label (control-flow join).
    pub fn set_state(&mut self, state: GcState) {
        state.assert_disjoint();
        self.state = state;
    }

    /// Reassigns membership of `mask` in the live-pointer masks. Marking
    /// GcRef removes the same bits from the byref mask and vice versa, so
    /// the two masks stay disjoint by construction. Marking NonPointer
    /// leaves registers pinned by tracked variables untouched.
    pub fn mark_register_set(&mut self, mask: RegSet, kind: PointerKind) {
        match kind {
            PointerKind::GcRef => {
                self.state.gcref_regs = self.state.gcref_regs | mask;
                self.state.byref_regs = self.state.byref_regs - mask;
            }
            PointerKind::Byref => {
                self.state.byref_regs = self.state.byref_regs | mask;
                self.state.gcref_regs = self.state.gcref_regs - mask;
            }
            PointerKind::NonPointer => {
                let killable = mask - self.pinned_var_regs;
                self.state.gcref_regs = self.state.gcref_regs - killable;
                self.state.byref_regs = self.state.byref_regs - killable;
            }
        }

        self.state.assert_disjoint();
    }

    pub fn mark_register(&mut self, reg: Reg, kind: PointerKind) {
        self.mark_register_set(RegSet::of(reg), kind);
    }

    /// Marks `reg` as the current home of a tracked variable, protecting
    /// it from implicit NonPointer kills.
    pub fn pin_variable_register(&mut self, reg: Reg) {
        self.pinned_var_regs.insert(reg);
    }

    pub fn unpin_variable_register(&mut self, reg: Reg) {
        self.pinned_var_regs.remove(reg);
    }

    pub fn mark_variable_live(&mut self, slot_index: usize) {
        self.state.gcref_vars.grow(slot_index + 1);
        self.state.gcref_vars.insert(slot_index);
    }

    pub fn mark_variable_dead(&mut self, slot_index: usize) {
        if slot_index < self.state.gcref_vars.len() {
            self.state.gcref_vars.set(slot_index, false);
        }
    }

    pub fn is_variable_live(&self, slot_index: usize) -> bool {
        slot_index < self.state.gcref_vars.len() && self.state.gcref_vars.contains(slot_index)
    }

    /// Records the state effective after `instr` as a safepoint entry.
    pub fn record_safepoint(&mut self, instr: InstrId) {
        self.state.assert_disjoint();

        if let Some(last) = self.safepoints.last() {
            debug_assert!(instr.0 > last.instr.0);
        }

        self.safepoints.push(PendingSafepoint {
            instr,
            gcref_regs: self.state.gcref_regs,
            byref_regs: self.state.byref_regs,
            live_var_indices: self.state.gcref_vars.ones().map(|idx| idx as u32).collect(),
        });
    }

    pub fn safepoints(&self) -> &[PendingSafepoint] {
        &self.safepoints
    }
}

/// Address expression of a store target, as far as the emitter can see
/// it. Deliberately shallow: anything the matcher cannot decompose is an
/// opaque leaf and classifies conservatively.
#[derive(Clone, Debug)]
pub enum AddrExpr {
    /// Address of a local/stack slot; provably not in the managed heap.
    LocalSlot(i32),
    /// A managed object reference.
    ObjectRef,
    /// A byref with no provable origin.
    ByrefValue,
    /// Opaque native-int arithmetic.
    NativeInt,
    /// addr + constant offset.
    AddOffset(Box<AddrExpr>, i64),
    /// base + index * scale + displacement.
    Lea {
        base: Box<AddrExpr>,
        index: Option<Box<AddrExpr>>,
        scale: u8,
        dsp: i32,
    },
}

/// Value being stored, for the null-store shortcut.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum StoreValue {
    NullConst,
    GcRef,
    Other,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WriteBarrierForm {
    NoBarrier,
    BarrierChecked,
    BarrierUnchecked,
    BarrierUnknown,
}

/// Classifies a reference store for write-barrier selection.
///
/// Peels add/LEA chains off a single ref or byref base. Returns
/// `BarrierUnknown` whenever the address cannot be decomposed; callers
/// must then decide checked vs. unchecked from the store node's
/// target-heap flag. A wrong `NoBarrier` would be a correctness bug, so
/// every unprovable shape falls back to the conservative answer.
pub fn classify_store(target: &AddrExpr, value: StoreValue) -> WriteBarrierForm {
    if value == StoreValue::NullConst {
        return WriteBarrierForm::NoBarrier;
    }

    classify_addr(target)
}

fn classify_addr(expr: &AddrExpr) -> WriteBarrierForm {
    match expr {
        AddrExpr::LocalSlot(_) => WriteBarrierForm::NoBarrier,
        AddrExpr::ObjectRef => WriteBarrierForm::BarrierUnchecked,
        AddrExpr::ByrefValue => WriteBarrierForm::BarrierChecked,
        AddrExpr::NativeInt => WriteBarrierForm::BarrierUnknown,

        AddrExpr::AddOffset(base, _) => classify_addr(base),

        AddrExpr::Lea {
            base,
            index,
            ..
        } => {
            let base_form = classify_addr(base);

            match index {
                None => base_form,
                Some(index) => match (base_form, classify_addr(index)) {
                    // Exactly one ref operand: the other side is scaled
                    // arithmetic off that object.
                    (WriteBarrierForm::BarrierUnchecked, WriteBarrierForm::BarrierUnknown)
                    | (WriteBarrierForm::BarrierUnknown, WriteBarrierForm::BarrierUnchecked) => {
                        WriteBarrierForm::BarrierUnchecked
                    }
                    (WriteBarrierForm::NoBarrier, other) | (other, WriteBarrierForm::NoBarrier) => {
                        other
                    }
                    // Two pointer-ish operands or anything else we cannot
                    // prove: stay conservative.
                    _ => WriteBarrierForm::BarrierUnknown,
                },
            }
        }
    }
}
