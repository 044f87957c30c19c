//! Instruction groups: the batching unit of the emitter. A group roughly
//! corresponds to a basic block but may also split purely because its
//! descriptor buffer filled up. Each group snapshots the live GC state at
//! its entry so later passes can process groups independently.

use crate::error::{EmitResult, FatalError};
use crate::gc::GcState;
use crate::instr::{InstrDesc, InstrId};

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct InsGroupId(pub u32);

impl InsGroupId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

// Group flags.
pub const IGF_PROLOG: u16 = 0x0001;
pub const IGF_EPILOG: u16 = 0x0002;
pub const IGF_FUNCLET_PROLOG: u16 = 0x0004;
pub const IGF_FUNCLET_EPILOG: u16 = 0x0008;
pub const IGF_NOGC_INTERRUPT: u16 = 0x0010; // no GC suspension inside this group
pub const IGF_EXTEND: u16 = 0x0020; // split off the previous group for capacity only
pub const IGF_HAS_ALIGN: u16 = 0x0040; // ends with alignment padding
pub const IGF_REMOVED_ALIGN: u16 = 0x0080; // alignment shrank to zero during layout
pub const IGF_HAS_REMOVABLE_JMP: u16 = 0x0100; // ends with a jump-to-next candidate
pub const IGF_COLD: u16 = 0x0200; // placed in the cold section

/// Flags a capacity split carries over to the extension group.
pub const IGF_PROPAGATE_MASK: u16 =
    IGF_EPILOG | IGF_FUNCLET_PROLOG | IGF_FUNCLET_EPILOG | IGF_NOGC_INTERRUPT | IGF_COLD;

/// Descriptor capacity of a regular group before it splits.
pub const GROUP_CAPACITY: usize = 64;

/// The prolog group may never split; its budget is fixed.
pub const PROLOG_CAPACITY: usize = 128;

pub struct InsGroup {
    pub num: u32,
    /// Byte offset within the group's section; assigned by layout passes.
    pub offs: u32,
    /// Current byte-size estimate (sum of descriptor sizes).
    pub size: u32,
    pub flags: u16,

    // live GC state at group entry
    pub gcref_regs: crate::reg::RegSet,
    pub byref_regs: crate::reg::RegSet,
    pub gcref_vars: fixedbitset::FixedBitSet,

    pub instrs: Vec<InstrId>,
}

impl InsGroup {
    fn new(num: u32, flags: u16, state: &GcState) -> InsGroup {
        InsGroup {
            num,
            offs: 0,
            size: 0,
            flags,
            gcref_regs: state.gcref_regs,
            byref_regs: state.byref_regs,
            gcref_vars: state.gcref_vars.clone(),
            instrs: Vec::new(),
        }
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn is_cold(&self) -> bool {
        self.has_flag(IGF_COLD)
    }

    pub fn is_no_gc(&self) -> bool {
        self.has_flag(IGF_NOGC_INTERRUPT)
    }

    fn capacity(&self) -> usize {
        if self.has_flag(IGF_PROLOG) {
            PROLOG_CAPACITY
        } else {
            GROUP_CAPACITY
        }
    }

    pub fn entry_state(&self) -> GcState {
        GcState {
            gcref_regs: self.gcref_regs,
            byref_regs: self.byref_regs,
            gcref_vars: self.gcref_vars.clone(),
        }
    }
}

/// Arena of instruction descriptors plus the ordered group list. Groups
/// and descriptors refer to each other by index, never by pointer.
pub struct GroupBuffer {
    instrs: Vec<InstrDesc>,
    groups: Vec<InsGroup>,
}

impl GroupBuffer {
    /// Starts with the method's prolog group. The prolog is a no-GC
    /// region and the single group that is not allowed to auto-extend.
    pub fn new(entry_state: &GcState) -> GroupBuffer {
        GroupBuffer {
            instrs: Vec::new(),
            groups: vec![InsGroup::new(0, IGF_PROLOG | IGF_NOGC_INTERRUPT, entry_state)],
        }
    }

    pub fn cur_group_id(&self) -> InsGroupId {
        InsGroupId(self.groups.len() as u32 - 1)
    }

    pub fn group(&self, id: InsGroupId) -> &InsGroup {
        &self.groups[id.idx()]
    }

    pub fn group_mut(&mut self, id: InsGroupId) -> &mut InsGroup {
        &mut self.groups[id.idx()]
    }

    pub fn groups(&self) -> &[InsGroup] {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut [InsGroup] {
        &mut self.groups
    }

    pub fn instr(&self, id: InstrId) -> &InstrDesc {
        &self.instrs[id.idx()]
    }

    pub fn instr_mut(&mut self, id: InstrId) -> &mut InstrDesc {
        &mut self.instrs[id.idx()]
    }

    pub fn instr_count(&self) -> usize {
        self.instrs.len()
    }

    /// Appends a descriptor to the current group. When the group's buffer
    /// is full, a new extension group is linked, inheriting the previous
    /// group's exit GC state (`state`, the tracker's current state) as
    /// its entry state — never inside the prolog.
    pub fn append(&mut self, desc: InstrDesc, state: &GcState) -> EmitResult<InstrId> {
        let cur = self.groups.last().expect("no current group");

        if cur.instrs.len() >= cur.capacity() {
            if cur.has_flag(IGF_PROLOG) {
                return Err(FatalError::PrologBufferOverflow {
                    capacity: PROLOG_CAPACITY,
                });
            }

            let flags = IGF_EXTEND | (cur.flags & IGF_PROPAGATE_MASK);
            self.push_group(flags, state);
        }

        let id = InstrId(self.instrs.len() as u32);
        let size = desc.enc_size;
        self.instrs.push(desc);

        let cur = self.groups.last_mut().unwrap();
        cur.instrs.push(id);
        cur.size += size;

        Ok(id)
    }

    /// Ends the current group (even if not full) and starts a new one
    /// whose entry state is the given explicit snapshot. Used at every
    /// potential control-flow join so branch targets always coincide with
    /// group boundaries.
    pub fn begin_label(&mut self, state: &GcState, flags: u16) -> InsGroupId {
        state.assert_disjoint();
        self.push_group(flags, state)
    }

    fn push_group(&mut self, flags: u16, state: &GcState) -> InsGroupId {
        let num = self.groups.len() as u32;
        self.groups.push(InsGroup::new(num, flags, state));
        InsGroupId(num)
    }

    /// Group ids in program order within one section.
    pub fn section_groups(&self, cold: bool) -> Vec<InsGroupId> {
        (0..self.groups.len())
            .map(|idx| InsGroupId(idx as u32))
            .filter(|id| self.group(*id).is_cold() == cold)
            .collect()
    }

    /// The group directly after `id` in the same section, empty or not.
    pub fn next_group_in_section(&self, id: InsGroupId) -> Option<InsGroupId> {
        let cold = self.group(id).is_cold();

        (id.idx() + 1..self.groups.len())
            .map(|idx| InsGroupId(idx as u32))
            .find(|next| self.group(*next).is_cold() == cold)
    }
}
