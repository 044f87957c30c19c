//! Branch-distance resolution.
//!
//! Every branch starts in the largest encoding form and only ever moves
//! down the target's form ladder. Because code never grows during
//! resolution, a displacement that fits a form once keeps fitting it, so
//! the fixed point exists and each pass that changes anything strictly
//! shrinks total code size.

use crate::error::{EmitResult, FatalError};
use crate::ig::{GroupBuffer, InsGroupId, IGF_HAS_REMOVABLE_JMP};
use crate::instr::InstrId;
use crate::target::{BranchForm, CondCode, TargetIsa};

/// Side record for one emitted branch. The descriptor in the group
/// buffer carries the provisional size; the jump record carries the
/// resolution state.
#[derive(Clone, Debug)]
pub struct JumpDesc {
    pub instr: InstrId,
    /// Group containing the branch.
    pub group: InsGroupId,
    /// Target group; branch targets always sit on group boundaries.
    pub target: InsGroupId,
    pub cond: Option<CondCode>,
    pub form: BranchForm,
    /// Cross-section or externally-patched branches stay in the long
    /// form; their distance is unknown until the host places the code.
    pub keep_long: bool,
    /// Unconditional branch that may be deleted if it targets the
    /// immediately following group.
    pub removable: bool,
    pub removed: bool,
}

impl JumpDesc {
    pub fn new(
        instr: InstrId,
        group: InsGroupId,
        target: InsGroupId,
        cond: Option<CondCode>,
    ) -> JumpDesc {
        JumpDesc {
            instr,
            group,
            target,
            cond,
            form: BranchForm::Long,
            keep_long: false,
            removable: false,
            removed: false,
        }
    }
}

/// Recomputes group sizes from descriptor sizes and assigns running
/// offsets, hot section first, then cold. Offsets are method-relative;
/// returns (hot_size, cold_size).
pub fn assign_offsets(buffer: &mut GroupBuffer) -> (u32, u32) {
    for id in 0..buffer.groups().len() {
        let id = InsGroupId(id as u32);
        let size = buffer
            .group(id)
            .instrs
            .iter()
            .map(|&instr| buffer.instr(instr).enc_size)
            .sum();
        buffer.group_mut(id).size = size;
    }

    let mut offset = 0;
    let mut hot_size = 0;
    for cold in [false, true] {
        for id in buffer.section_groups(cold) {
            let group = buffer.group_mut(id);
            group.offs = offset;
            offset += group.size;
        }
        if !cold {
            hot_size = offset;
        }
    }

    (hot_size, offset - hot_size)
}

/// Method-relative byte offset of every descriptor, indexed by
/// instruction id. Valid for the offsets last assigned.
pub fn instr_offsets(buffer: &GroupBuffer) -> Vec<u32> {
    let mut offsets = vec![0u32; buffer.instr_count()];

    for group in buffer.groups() {
        let mut offset = group.offs;
        for &instr in &group.instrs {
            offsets[instr.idx()] = offset;
            offset += buffer.instr(instr).enc_size;
        }
    }

    offsets
}

/// Runs form shrinking to its fixed point, then deletes removable
/// branches to the fall-through group and revalidates, until neither
/// pass changes anything.
pub fn resolve_jumps(
    buffer: &mut GroupBuffer,
    jumps: &mut [JumpDesc],
    isa: &dyn TargetIsa,
) -> EmitResult<()> {
    loop {
        resolve_forms(buffer, jumps, isa)?;
        if remove_fallthrough_jumps(buffer, jumps) == 0 {
            return Ok(());
        }
    }
}

fn resolve_forms(
    buffer: &mut GroupBuffer,
    jumps: &mut [JumpDesc],
    isa: &dyn TargetIsa,
) -> EmitResult<()> {
    loop {
        assign_offsets(buffer);
        let offsets = instr_offsets(buffer);

        let mut changed = false;

        for jump in jumps.iter_mut() {
            if jump.removed || jump.keep_long {
                continue;
            }

            let disp = displacement(buffer, &offsets, jump);
            let forms = isa.branch_forms(jump.cond.is_some());
            let cur = forms
                .iter()
                .position(|info| info.form == jump.form)
                .expect("resolved form not in ladder");

            // smallest form the current distance already reaches; code
            // only shrinks from here, so the distance can only improve
            let mut best = cur;
            for (idx, info) in forms.iter().enumerate().skip(cur + 1) {
                if info.fits(disp) {
                    best = idx;
                }
            }

            if best != cur {
                jump.form = forms[best].form;
                buffer.instr_mut(jump.instr).enc_size = forms[best].size;
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    // offsets are now final for this pass; fail on any branch no form
    // of the architecture can reach
    let offsets = instr_offsets(buffer);
    for jump in jumps.iter() {
        if jump.removed || jump.keep_long {
            continue;
        }

        let disp = displacement(buffer, &offsets, jump);
        if !isa.branch_form_info(jump.cond.is_some(), jump.form).fits(disp) {
            return Err(FatalError::BranchOutOfRange { distance: disp });
        }
    }

    Ok(())
}

fn displacement(buffer: &GroupBuffer, offsets: &[u32], jump: &JumpDesc) -> i64 {
    let src = offsets[jump.instr.idx()] as i64;
    let dst = buffer.group(jump.target).offs as i64;
    dst - src
}

/// Deletes unconditional removable branches whose target is the next
/// group with any encoded bytes. Returns the number of branches removed.
fn remove_fallthrough_jumps(buffer: &mut GroupBuffer, jumps: &mut [JumpDesc]) -> usize {
    let mut removed = 0;

    for jump in jumps.iter_mut() {
        if jump.removed || !jump.removable || jump.cond.is_some() || jump.keep_long {
            continue;
        }

        // only the final branch of its group can fall through
        if buffer.group(jump.group).instrs.last() != Some(&jump.instr) {
            continue;
        }

        if !falls_through(buffer, jump.group, jump.target, jump.instr) {
            continue;
        }

        jump.removed = true;
        buffer.instr_mut(jump.instr).enc_size = 0;
        buffer.group_mut(jump.group).flags &= !IGF_HAS_REMOVABLE_JMP;
        removed += 1;
    }

    removed
}

/// True when only zero-sized groups separate `from` from `target` in
/// their section, i.e. deleting the branch changes nothing observable.
fn falls_through(
    buffer: &GroupBuffer,
    from: InsGroupId,
    target: InsGroupId,
    branch: InstrId,
) -> bool {
    let mut cur = from;

    while let Some(next) = buffer.next_group_in_section(cur) {
        if next == target {
            return true;
        }

        let live_bytes: u32 = buffer
            .group(next)
            .instrs
            .iter()
            .filter(|&&instr| instr != branch)
            .map(|&instr| buffer.instr(instr).enc_size)
            .sum();
        if live_bytes != 0 {
            return false;
        }

        cur = next;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::GcState;
    use crate::ig::GroupBuffer;
    use crate::instr::{InstrDesc, Opcode, OperandSize};
    use crate::target::{target_for, Arch};

    fn nop() -> InstrDesc {
        let mut desc = InstrDesc::new(Opcode::Nop, OperandSize::Byte);
        desc.enc_size = 1;
        desc
    }

    fn jump(cond: bool, size: u32) -> InstrDesc {
        let opcode = if cond { Opcode::JumpCond } else { Opcode::Jump };
        let mut desc = InstrDesc::new(opcode, OperandSize::Qword);
        desc.enc_size = size;
        desc
    }

    struct Method {
        buffer: GroupBuffer,
        jumps: Vec<JumpDesc>,
        state: GcState,
    }

    impl Method {
        fn new() -> Method {
            let state = GcState::new(0);
            Method {
                buffer: GroupBuffer::new(&state),
                jumps: Vec::new(),
                state,
            }
        }

        fn group(&mut self) -> InsGroupId {
            self.buffer.begin_label(&self.state, 0)
        }

        fn nops(&mut self, count: usize) {
            for _ in 0..count {
                self.buffer.append(nop(), &self.state).unwrap();
            }
        }

        fn jump_to(&mut self, target: InsGroupId, cond: Option<CondCode>) -> usize {
            let isa = target_for(Arch::X64);
            let size = isa.branch_form_info(cond.is_some(), BranchForm::Long).size;
            let instr = self.buffer.append(jump(cond.is_some(), size), &self.state).unwrap();
            let group = self.buffer.cur_group_id();
            self.jumps.push(JumpDesc::new(instr, group, target, cond));
            self.jumps.len() - 1
        }

        fn resolve(&mut self) {
            resolve_jumps(&mut self.buffer, &mut self.jumps, target_for(Arch::X64)).unwrap();
        }
    }

    #[test]
    fn test_short_forward_branch() {
        let mut m = Method::new();
        let _ = m.group();
        let j = m.jump_to(InsGroupId(0), None);
        let _ = m.group();
        m.nops(10);
        let exit = m.group();
        m.nops(1);
        m.jumps[j].target = exit;

        m.resolve();
        assert_eq!(m.jumps[j].form, BranchForm::Short);
        assert_eq!(m.buffer.instr(m.jumps[j].instr).enc_size, 2);
        // short jump (2) + 10 nops of filler before the target
        assert_eq!(m.buffer.group(exit).offs, 12);
    }

    #[test]
    fn test_shrink_cascade() {
        // J1 reaches its target only through J2's bytes: long-long puts
        // the distance at 132, one past the short range, but J2 is
        // trivially short, and its shrink pulls J1 into range too.
        let mut m = Method::new();
        let g1 = m.group();
        let j1 = m.jump_to(InsGroupId(0), None);
        let g2 = m.group();
        m.nops(122);
        let j2 = m.jump_to(InsGroupId(0), None);
        let exit = m.group();
        m.nops(1);
        m.jumps[j1].target = exit;
        m.jumps[j2].target = exit;
        let _ = (g1, g2);

        m.resolve();
        assert_eq!(m.jumps[j2].form, BranchForm::Short);
        assert_eq!(m.jumps[j1].form, BranchForm::Short);
        assert_eq!(m.buffer.group(exit).offs, 2 + 122 + 2);
    }

    #[test]
    fn test_no_cascade_when_still_out_of_range() {
        // same shape with four more filler bytes: J2 shrinks, J1's
        // distance lands at 133 and must stay long
        let mut m = Method::new();
        let _ = m.group();
        let j1 = m.jump_to(InsGroupId(0), None);
        let _ = m.group();
        m.nops(126);
        let j2 = m.jump_to(InsGroupId(0), None);
        let exit = m.group();
        m.nops(1);
        m.jumps[j1].target = exit;
        m.jumps[j2].target = exit;

        m.resolve();
        assert_eq!(m.jumps[j2].form, BranchForm::Short);
        assert_eq!(m.jumps[j1].form, BranchForm::Long);
    }

    #[test]
    fn test_backward_branch() {
        let mut m = Method::new();
        let head = m.group();
        m.nops(20);
        let _ = m.group();
        m.nops(30);
        let j = m.jump_to(head, Some(CondCode::NotEqual));

        m.resolve();
        // 50 bytes behind the branch start
        assert_eq!(m.jumps[j].form, BranchForm::Short);

        let offsets = instr_offsets(&m.buffer);
        assert_eq!(offsets[m.jumps[j].instr.idx()], 50);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let mut m = Method::new();
        let _ = m.group();
        let j1 = m.jump_to(InsGroupId(0), Some(CondCode::Equal));
        let _ = m.group();
        m.nops(200);
        let exit = m.group();
        m.nops(1);
        m.jumps[j1].target = exit;

        m.resolve();
        let forms: Vec<_> = m.jumps.iter().map(|jump| jump.form).collect();
        let (hot, cold) = assign_offsets(&mut m.buffer);

        m.resolve();
        assert_eq!(forms, m.jumps.iter().map(|jump| jump.form).collect::<Vec<_>>());
        assert_eq!((hot, cold), assign_offsets(&mut m.buffer));
    }

    #[test]
    fn test_removable_fallthrough_jump() {
        let mut m = Method::new();
        let _ = m.group();
        m.nops(3);
        let j = m.jump_to(InsGroupId(0), None);
        m.jumps[j].removable = true;
        let next = m.group();
        m.nops(5);
        m.jumps[j].target = next;

        m.resolve();
        assert!(m.jumps[j].removed);
        assert_eq!(m.buffer.instr(m.jumps[j].instr).enc_size, 0);
        assert_eq!(m.buffer.group(next).offs, 3);
    }

    #[test]
    fn test_removable_jump_over_code_stays() {
        let mut m = Method::new();
        let _ = m.group();
        let j = m.jump_to(InsGroupId(0), None);
        m.jumps[j].removable = true;
        let _ = m.group();
        m.nops(4);
        let after = m.group();
        m.nops(1);
        m.jumps[j].target = after;

        m.resolve();
        assert!(!m.jumps[j].removed);
        assert_eq!(m.jumps[j].form, BranchForm::Short);
    }

    #[test]
    fn test_keep_long_never_shrinks() {
        let mut m = Method::new();
        let _ = m.group();
        let j = m.jump_to(InsGroupId(0), None);
        m.jumps[j].keep_long = true;
        let next = m.group();
        m.nops(1);
        m.jumps[j].target = next;

        m.resolve();
        assert_eq!(m.jumps[j].form, BranchForm::Long);
        assert_eq!(m.buffer.instr(m.jumps[j].instr).enc_size, 5);
    }
}
