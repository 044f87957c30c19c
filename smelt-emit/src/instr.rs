use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::gc::GcType;
use crate::reg::Reg;

/// Index of an instruction descriptor in the per-method arena.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct InstrId(pub u32);

impl InstrId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Operand size class.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Debug)]
pub enum OperandSize {
    Byte,
    Word,
    Dword,
    Qword,
    Simd16,
    Simd32,
}

impl OperandSize {
    pub fn in_bytes(self) -> usize {
        match self {
            OperandSize::Byte => 1,
            OperandSize::Word => 2,
            OperandSize::Dword => 4,
            OperandSize::Qword => 8,
            OperandSize::Simd16 => 16,
            OperandSize::Simd32 => 32,
        }
    }
}

/// Architecture-neutral opcode ids. Instruction selection happens in the
/// driving compiler; the emitter only turns a chosen opcode plus its
/// operands into bytes.
#[derive(Copy, Clone, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Opcode {
    Nop,
    Break,
    MovRR,
    MovImm,
    Load,
    Store,
    Lea,
    Add,
    AddImm,
    Sub,
    SubImm,
    Cmp,
    CmpImm,
    Test,
    Push,
    Pop,
    Call,
    CallReg,
    Ret,
    Jump,
    JumpCond,
    Align,
}

impl Opcode {
    pub fn is_branch(self) -> bool {
        matches!(self, Opcode::Jump | Opcode::JumpCond)
    }
}

// Descriptor flags.
pub const IF_DST_REG1: u16 = 0x0001; // instruction writes reg1
pub const IF_RELOC: u16 = 0x0002; // encoded constant needs a relocation
pub const IF_NO_GC_INTERRUPT: u16 = 0x0004; // appended inside a no-GC region
pub const IF_LCLVAR: u16 = 0x0008; // accesses a local-variable slot
pub const IF_SAFEPOINT: u16 = 0x0010; // GC may suspend after this instruction
pub const IF_BOUND: u16 = 0x0020; // branch target already resolved

/// Small-constant range of the compact descriptor form. Constants outside
/// promote transparently to the large payload variant.
pub const SMALL_CNS_MIN: i64 = i16::MIN as i64;
pub const SMALL_CNS_MAX: i64 = i16::MAX as i64;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CallTarget {
    /// Direct call; final address patched via relocation.
    Direct(u64),
    /// Indirect through reg1.
    Register,
}

/// Trailing payload of an instruction descriptor. The variant tag fully
/// determines which fields are present; accessors assert the tag.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InstrPayload {
    None,
    /// Compact form for constants in the small range.
    SmallCns(i16),
    /// Large constant.
    Cns(i64),
    /// Large displacement.
    Dsp(i32),
    /// Large constant plus displacement.
    CnsDsp { cns: i64, dsp: i32 },
    /// Full addressing mode: base + index * scale + displacement.
    AddrMode {
        base: Option<Reg>,
        index: Option<Reg>,
        scale: u8,
        dsp: i32,
    },
    /// Call-site info: GC-ness of up to two return registers and the
    /// number of outgoing argument slots.
    Call {
        target: CallTarget,
        ret_gc: GcType,
        ret2_gc: GcType,
        arg_slots: u16,
    },
}

impl InstrPayload {
    /// Constant payload; picks the compact form when the value fits.
    pub fn cns(value: i64) -> InstrPayload {
        if (SMALL_CNS_MIN..=SMALL_CNS_MAX).contains(&value) {
            InstrPayload::SmallCns(value as i16)
        } else {
            InstrPayload::Cns(value)
        }
    }
}

/// One emitted instruction. Immutable after `append` except for branch
/// and alignment descriptors, whose size may shrink during resolution.
#[derive(Clone, Debug)]
pub struct InstrDesc {
    pub opcode: Opcode,
    pub size: OperandSize,
    pub reg1: Option<Reg>,
    pub reg2: Option<Reg>,
    pub gc1: GcType,
    pub gc2: GcType,
    pub flags: u16,
    pub payload: InstrPayload,

    /// Encoded byte size; exact for non-branch descriptors, provisional
    /// for branches until jump resolution fixes their form.
    pub enc_size: u32,
}

impl InstrDesc {
    pub fn new(opcode: Opcode, size: OperandSize) -> InstrDesc {
        InstrDesc {
            opcode,
            size,
            reg1: None,
            reg2: None,
            gc1: GcType::None,
            gc2: GcType::None,
            flags: 0,
            payload: InstrPayload::None,
            enc_size: 0,
        }
    }

    pub fn with_reg(mut self, reg: Reg, gc: GcType) -> InstrDesc {
        assert!(self.reg1.is_none());
        self.reg1 = Some(reg);
        self.gc1 = gc;
        self
    }

    pub fn with_reg2(mut self, reg: Reg, gc: GcType) -> InstrDesc {
        assert!(self.reg1.is_some());
        assert!(self.reg2.is_none());
        self.reg2 = Some(reg);
        self.gc2 = gc;
        self
    }

    pub fn with_payload(mut self, payload: InstrPayload) -> InstrDesc {
        self.payload = payload;
        self
    }

    pub fn with_flags(mut self, flags: u16) -> InstrDesc {
        self.flags |= flags;
        self
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn writes_reg1(&self) -> bool {
        self.has_flag(IF_DST_REG1)
    }

    /// The constant carried by this descriptor, whichever form holds it.
    pub fn cns(&self) -> i64 {
        match self.payload {
            InstrPayload::SmallCns(value) => value as i64,
            InstrPayload::Cns(value) => value,
            InstrPayload::CnsDsp { cns, .. } => cns,
            _ => panic!("descriptor {:?} carries no constant", self.opcode),
        }
    }

    pub fn dsp(&self) -> i32 {
        match self.payload {
            InstrPayload::Dsp(value) => value,
            InstrPayload::CnsDsp { dsp, .. } => dsp,
            InstrPayload::AddrMode { dsp, .. } => dsp,
            _ => panic!("descriptor {:?} carries no displacement", self.opcode),
        }
    }

    pub fn is_branch(&self) -> bool {
        self.opcode.is_branch()
    }

    pub fn is_align(&self) -> bool {
        self.opcode == Opcode::Align
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_cns_roundtrip() {
        for value in [0i64, 1, -1, SMALL_CNS_MIN, SMALL_CNS_MAX] {
            let payload = InstrPayload::cns(value);
            assert!(matches!(payload, InstrPayload::SmallCns(_)));
            let desc = InstrDesc::new(Opcode::AddImm, OperandSize::Qword).with_payload(payload);
            assert_eq!(desc.cns(), value);
        }
    }

    #[test]
    fn test_large_cns_promotion() {
        for value in [
            SMALL_CNS_MIN - 1,
            SMALL_CNS_MAX + 1,
            i64::MIN,
            i64::MAX,
            0x1234_5678_9ABC,
        ] {
            let payload = InstrPayload::cns(value);
            assert!(matches!(payload, InstrPayload::Cns(_)));
            let desc = InstrDesc::new(Opcode::MovImm, OperandSize::Qword).with_payload(payload);
            assert_eq!(desc.cns(), value);
        }
    }

    #[test]
    #[should_panic]
    fn test_cns_wrong_tag() {
        let desc = InstrDesc::new(Opcode::Nop, OperandSize::Byte);
        desc.cns();
    }

    #[test]
    fn test_addr_mode_dsp() {
        let desc = InstrDesc::new(Opcode::Load, OperandSize::Qword).with_payload(
            InstrPayload::AddrMode {
                base: Some(Reg(5)),
                index: None,
                scale: 1,
                dsp: -16,
            },
        );
        assert_eq!(desc.dsp(), -16);
    }

    #[test]
    fn test_opcode_id_roundtrip() {
        let raw: u16 = Opcode::Lea.into();
        assert_eq!(Opcode::try_from(raw), Ok(Opcode::Lea));
        assert!(Opcode::try_from(0xFFFFu16).is_err());
    }
}
