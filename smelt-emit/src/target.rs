//! Target description: every architecture-specific decision (descriptor
//! sizing, branch-form ladders, byte encoding, literal-pool placement)
//! lives behind this trait so the group buffering, jump resolution, and
//! GC tracking algorithms stay architecture-neutral.

use smelt_asm::CodeBuffer;

use crate::code::RelocationKind;
use crate::instr::InstrDesc;

pub mod arm64;
pub mod x64;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Arch {
    X64,
    Arm64,
}

/// Architecture-neutral branch condition.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CondCode {
    Zero,
    NonZero,
    Equal,
    NotEqual,
    Greater,
    GreaterEq,
    Less,
    LessEq,
    UnsignedGreater,
    UnsignedGreaterEq,
    UnsignedLess,
    UnsignedLessEq,
}

/// Branch encoding forms, largest first; resolution only ever moves a
/// branch down this ladder.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum BranchForm {
    Long,
    Medium,
    Short,
}

#[derive(Copy, Clone, Debug)]
pub struct BranchFormInfo {
    pub form: BranchForm,
    /// Encoded size in bytes.
    pub size: u32,
    /// Reachable displacement range, measured from the start of the
    /// branch instruction to the target.
    pub min_disp: i64,
    pub max_disp: i64,
}

impl BranchFormInfo {
    pub fn fits(&self, disp: i64) -> bool {
        self.min_disp <= disp && disp <= self.max_disp
    }
}

/// A relocation discovered while encoding one instruction: byte offset
/// of the fixup site relative to the instruction start, plus its kind.
#[derive(Copy, Clone, Debug)]
pub struct EncodedFixup {
    pub offset_in_instr: u32,
    pub target: u64,
    pub kind: RelocationKind,
}

pub trait TargetIsa: Sync {
    fn arch(&self) -> Arch;

    fn ptr_size(&self) -> usize;

    /// True when read-only literal data must sit immediately after hot
    /// code (instruction-adjacent literal pools).
    fn const_pool_adjacent(&self) -> bool;

    /// Exact encoded size of a non-branch, non-align descriptor.
    fn instr_size(&self, desc: &InstrDesc) -> u32;

    /// Available encoding forms, largest first.
    fn branch_forms(&self, conditional: bool) -> &'static [BranchFormInfo];

    fn branch_form_info(&self, conditional: bool, form: BranchForm) -> BranchFormInfo {
        *self
            .branch_forms(conditional)
            .iter()
            .find(|info| info.form == form)
            .expect("branch form not supported by target")
    }

    /// Largest padding an alignment request can need.
    fn align_max_pad(&self, boundary: u32) -> u32;

    /// Actual padding needed at `offset`.
    fn align_pad(&self, offset: u32, boundary: u32) -> u32;

    /// Encodes a non-branch descriptor; returns relocation fixup sites.
    fn encode_instr(&self, desc: &InstrDesc, buf: &mut CodeBuffer) -> Vec<EncodedFixup>;

    /// Encodes a branch. `disp` is measured from the instruction start to
    /// the target; `abs_target` is the absolute target address for forms
    /// that cannot encode a relative displacement.
    fn encode_branch(
        &self,
        cond: Option<CondCode>,
        form: BranchForm,
        disp: i64,
        abs_target: u64,
        buf: &mut CodeBuffer,
    ) -> Vec<EncodedFixup>;

    /// Emits `pad` bytes of alignment filler.
    fn encode_align(&self, pad: u32, buf: &mut CodeBuffer);
}

pub fn target_for(arch: Arch) -> &'static dyn TargetIsa {
    match arch {
        Arch::X64 => &x64::TargetX64,
        Arch::Arm64 => &arm64::TargetArm64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_ladders_are_descending() {
        for arch in [Arch::X64, Arch::Arm64] {
            let target = target_for(arch);
            for conditional in [false, true] {
                let forms = target.branch_forms(conditional);
                assert!(!forms.is_empty());
                for pair in forms.windows(2) {
                    assert!(pair[0].size >= pair[1].size);
                    // a smaller form always reaches strictly less
                    assert!(pair[0].max_disp >= pair[1].max_disp);
                    assert!(pair[0].min_disp <= pair[1].min_disp);
                }
            }
        }
    }

    #[test]
    fn test_pool_placement() {
        assert!(!target_for(Arch::X64).const_pool_adjacent());
        assert!(target_for(Arch::Arm64).const_pool_adjacent());
    }
}
