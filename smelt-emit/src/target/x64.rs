use smelt_asm::x64::{self as asm, Register};
use smelt_asm::CodeBuffer;

use crate::code::RelocationKind;
use crate::instr::{CallTarget, InstrDesc, InstrPayload, Opcode, OperandSize, IF_RELOC};
use crate::reg::Reg;
use crate::target::{BranchForm, BranchFormInfo, CondCode, EncodedFixup, TargetIsa};

pub struct TargetX64;

// Displacements are measured from the instruction start; rel8/rel32 are
// relative to the instruction end, hence the size skew in the ranges.
static UNCOND_FORMS: [BranchFormInfo; 2] = [
    BranchFormInfo {
        form: BranchForm::Long,
        size: 5,
        min_disp: i32::MIN as i64,
        max_disp: i32::MAX as i64,
    },
    BranchFormInfo {
        form: BranchForm::Short,
        size: 2,
        min_disp: -126,
        max_disp: 129,
    },
];

static COND_FORMS: [BranchFormInfo; 2] = [
    BranchFormInfo {
        form: BranchForm::Long,
        size: 6,
        min_disp: i32::MIN as i64,
        max_disp: i32::MAX as i64,
    },
    BranchFormInfo {
        form: BranchForm::Short,
        size: 2,
        min_disp: -126,
        max_disp: 129,
    },
];

fn reg(r: Reg) -> Register {
    Register::new(r.int())
}

fn condition(cond: CondCode) -> asm::Condition {
    match cond {
        CondCode::Zero => asm::Condition::Zero,
        CondCode::NonZero => asm::Condition::NotZero,
        CondCode::Equal => asm::Condition::Equal,
        CondCode::NotEqual => asm::Condition::NotEqual,
        CondCode::Greater => asm::Condition::Greater,
        CondCode::GreaterEq => asm::Condition::GreaterOrEqual,
        CondCode::Less => asm::Condition::Less,
        CondCode::LessEq => asm::Condition::LessOrEqual,
        CondCode::UnsignedGreater => asm::Condition::Above,
        CondCode::UnsignedGreaterEq => asm::Condition::AboveOrEqual,
        CondCode::UnsignedLess => asm::Condition::Below,
        CondCode::UnsignedLessEq => asm::Condition::BelowOrEqual,
    }
}

fn fits_i8(value: i64) -> bool {
    value == value as i8 as i64
}

fn fits_i32(value: i64) -> bool {
    value == value as i32 as i64
}

struct AddrMode {
    base: Option<Reg>,
    index: Option<Reg>,
    scale: u8,
    dsp: i32,
}

impl TargetX64 {
    fn rex_w(&self, size: OperandSize) -> bool {
        match size {
            OperandSize::Dword => false,
            OperandSize::Qword => true,
            _ => panic!("unsupported operand size {:?}", size),
        }
    }

    fn emit_rex_mem(
        &self,
        buf: &mut CodeBuffer,
        w: bool,
        modrm_reg: Register,
        mode: &AddrMode,
    ) {
        let r = modrm_reg.needs_rex();
        let x = mode.index.map(|idx| reg(idx).needs_rex()).unwrap_or(false);
        let b = mode.base.map(|base| reg(base).needs_rex()).unwrap_or(false);

        if w || r || x || b {
            asm::emit_rex(buf, w, r, x, b);
        }
    }

    /// ModRM + optional SIB + displacement for a memory operand.
    fn emit_address(&self, buf: &mut CodeBuffer, modrm_reg: u8, mode: &AddrMode) {
        let base = reg(mode.base.expect("addressing mode without base"));

        // RBP/R13 as base cannot use mod 00; RSP/R12 always need a SIB.
        let needs_disp = mode.dsp != 0 || base.low_bits() == 0b101;
        let modbits = if !needs_disp {
            0b00
        } else if fits_i8(mode.dsp as i64) {
            0b01
        } else {
            0b10
        };

        match mode.index {
            None => {
                if base.low_bits() == 0b100 {
                    asm::emit_modrm(buf, modbits, modrm_reg, 0b100);
                    buf.emit_u8(0b00 << 6 | 0b100 << 3 | base.low_bits());
                } else {
                    asm::emit_modrm(buf, modbits, modrm_reg, base.low_bits());
                }
            }

            Some(index) => {
                let index = reg(index);
                assert!(index.low_bits() != 0b100 || index.needs_rex());

                let scale_bits = match mode.scale {
                    1 => 0,
                    2 => 1,
                    4 => 2,
                    8 => 3,
                    _ => panic!("invalid scale {}", mode.scale),
                };

                asm::emit_modrm(buf, modbits, modrm_reg, 0b100);
                buf.emit_u8(scale_bits << 6 | index.low_bits() << 3 | base.low_bits());
            }
        }

        if modbits == 0b01 {
            buf.emit_u8(mode.dsp as u8);
        } else if modbits == 0b10 {
            buf.emit_u32(mode.dsp as u32);
        }
    }

    fn addr_mode(&self, desc: &InstrDesc) -> AddrMode {
        match desc.payload {
            InstrPayload::AddrMode {
                base,
                index,
                scale,
                dsp,
            } => AddrMode {
                base,
                index,
                scale,
                dsp,
            },
            InstrPayload::Dsp(dsp) => AddrMode {
                base: desc.reg2,
                index: None,
                scale: 1,
                dsp,
            },
            _ => panic!("memory opcode {:?} without address payload", desc.opcode),
        }
    }

    fn emit_mem_op(
        &self,
        buf: &mut CodeBuffer,
        desc: &InstrDesc,
        opcode: u8,
    ) {
        let operand = reg(desc.reg1.expect("missing register operand"));
        let mode = self.addr_mode(desc);

        self.emit_rex_mem(buf, self.rex_w(desc.size), operand, &mode);
        buf.emit_u8(opcode);
        self.emit_address(buf, operand.low_bits(), &mode);
    }

    fn emit_alu_rr(&self, buf: &mut CodeBuffer, desc: &InstrDesc, opcode: u8) {
        let dst = reg(desc.reg1.expect("missing dst register"));
        let src = reg(desc.reg2.expect("missing src register"));

        if self.rex_w(desc.size) {
            asm::emit_rex64_modrm(buf, src, dst);
        } else {
            asm::emit_rex32_optional(buf, src, dst);
        }
        buf.emit_u8(opcode);
        asm::emit_modrm_registers(buf, src, dst);
    }

    /// Group-1 ALU with immediate: 0x83 imm8 when the constant fits the
    /// compact form, 0x81 imm32 otherwise.
    fn emit_alu_ri(&self, buf: &mut CodeBuffer, desc: &InstrDesc, modrm_ext: u8) {
        let dst = reg(desc.reg1.expect("missing dst register"));
        let cns = desc.cns();
        assert!(fits_i32(cns));

        if self.rex_w(desc.size) {
            asm::emit_rex(buf, true, false, false, dst.needs_rex());
        } else if dst.needs_rex() {
            asm::emit_rex(buf, false, false, false, true);
        }

        if fits_i8(cns) {
            buf.emit_u8(0x83);
            asm::emit_modrm(buf, 0b11, modrm_ext, dst.low_bits());
            buf.emit_u8(cns as u8);
        } else {
            buf.emit_u8(0x81);
            asm::emit_modrm(buf, 0b11, modrm_ext, dst.low_bits());
            buf.emit_u32(cns as u32);
        }
    }
}

impl TargetIsa for TargetX64 {
    fn arch(&self) -> crate::target::Arch {
        crate::target::Arch::X64
    }

    fn ptr_size(&self) -> usize {
        8
    }

    fn const_pool_adjacent(&self) -> bool {
        // literal data is addressed rip-relative; no adjacency required
        false
    }

    fn instr_size(&self, desc: &InstrDesc) -> u32 {
        let mut buf = CodeBuffer::new();
        self.encode_instr(desc, &mut buf);
        buf.len() as u32
    }

    fn branch_forms(&self, conditional: bool) -> &'static [BranchFormInfo] {
        if conditional {
            &COND_FORMS
        } else {
            &UNCOND_FORMS
        }
    }

    fn align_max_pad(&self, boundary: u32) -> u32 {
        boundary - 1
    }

    fn align_pad(&self, offset: u32, boundary: u32) -> u32 {
        assert!(boundary.is_power_of_two());
        (boundary - offset % boundary) % boundary
    }

    fn encode_instr(&self, desc: &InstrDesc, buf: &mut CodeBuffer) -> Vec<EncodedFixup> {
        let start = buf.position() as u32;
        let mut fixups = Vec::new();

        match desc.opcode {
            Opcode::Nop => buf.emit_u8(0x90),
            Opcode::Break => buf.emit_u8(0xCC),
            Opcode::Ret => buf.emit_u8(0xC3),

            Opcode::Push => {
                let r = reg(desc.reg1.expect("missing register"));
                if r.needs_rex() {
                    asm::emit_rex(buf, false, false, false, true);
                }
                buf.emit_u8(0x50 + r.low_bits());
            }

            Opcode::Pop => {
                let r = reg(desc.reg1.expect("missing register"));
                if r.needs_rex() {
                    asm::emit_rex(buf, false, false, false, true);
                }
                buf.emit_u8(0x58 + r.low_bits());
            }

            Opcode::MovRR => {
                let dst = reg(desc.reg1.expect("missing dst"));
                let src = reg(desc.reg2.expect("missing src"));
                if self.rex_w(desc.size) {
                    asm::emit_rex64_modrm(buf, src, dst);
                } else {
                    asm::emit_rex32_optional(buf, src, dst);
                }
                buf.emit_u8(0x89);
                asm::emit_modrm_registers(buf, src, dst);
            }

            Opcode::MovImm => {
                let dst = reg(desc.reg1.expect("missing dst"));
                let cns = desc.cns();

                if desc.has_flag(IF_RELOC) || !fits_i32(cns) {
                    // movabs: full 64-bit immediate, patchable in place
                    asm::emit_rex(buf, true, false, false, dst.needs_rex());
                    buf.emit_u8(0xB8 + dst.low_bits());
                    let imm_at = buf.position() as u32;
                    buf.emit_u64(cns as u64);

                    if desc.has_flag(IF_RELOC) {
                        fixups.push(EncodedFixup {
                            offset_in_instr: imm_at - start,
                            target: cns as u64,
                            kind: RelocationKind::AbsoluteAddress,
                        });
                    }
                } else if self.rex_w(desc.size) {
                    asm::emit_rex(buf, true, false, false, dst.needs_rex());
                    buf.emit_u8(0xC7);
                    asm::emit_modrm(buf, 0b11, 0, dst.low_bits());
                    buf.emit_u32(cns as u32);
                } else {
                    if dst.needs_rex() {
                        asm::emit_rex(buf, false, false, false, true);
                    }
                    buf.emit_u8(0xB8 + dst.low_bits());
                    buf.emit_u32(cns as u32);
                }
            }

            Opcode::Load => self.emit_mem_op(buf, desc, 0x8B),
            Opcode::Store => self.emit_mem_op(buf, desc, 0x89),
            Opcode::Lea => {
                assert_eq!(desc.size, OperandSize::Qword);
                self.emit_mem_op(buf, desc, 0x8D);
            }

            Opcode::Add => self.emit_alu_rr(buf, desc, 0x01),
            Opcode::Sub => self.emit_alu_rr(buf, desc, 0x29),
            Opcode::Cmp => self.emit_alu_rr(buf, desc, 0x39),
            Opcode::Test => self.emit_alu_rr(buf, desc, 0x85),

            Opcode::AddImm => self.emit_alu_ri(buf, desc, 0),
            Opcode::SubImm => self.emit_alu_ri(buf, desc, 5),
            Opcode::CmpImm => self.emit_alu_ri(buf, desc, 7),

            Opcode::Call => {
                let target = match desc.payload {
                    InstrPayload::Call { target, .. } => target,
                    _ => panic!("call without call payload"),
                };
                match target {
                    CallTarget::Direct(addr) => {
                        buf.emit_u8(0xE8);
                        let site = buf.position() as u32;
                        buf.emit_u32(0);
                        fixups.push(EncodedFixup {
                            offset_in_instr: site - start,
                            target: addr,
                            kind: RelocationKind::CodeTarget,
                        });
                    }
                    CallTarget::Register => {
                        let r = reg(desc.reg1.expect("missing call register"));
                        if r.needs_rex() {
                            asm::emit_rex(buf, false, false, false, true);
                        }
                        buf.emit_u8(0xFF);
                        asm::emit_modrm(buf, 0b11, 2, r.low_bits());
                    }
                }
            }

            Opcode::CallReg => {
                let r = reg(desc.reg1.expect("missing call register"));
                if r.needs_rex() {
                    asm::emit_rex(buf, false, false, false, true);
                }
                buf.emit_u8(0xFF);
                asm::emit_modrm(buf, 0b11, 2, r.low_bits());
            }

            Opcode::Jump | Opcode::JumpCond | Opcode::Align => {
                panic!("{:?} is not encoded via encode_instr", desc.opcode)
            }
        }

        fixups
    }

    fn encode_branch(
        &self,
        cond: Option<CondCode>,
        form: BranchForm,
        disp: i64,
        _abs_target: u64,
        buf: &mut CodeBuffer,
    ) -> Vec<EncodedFixup> {
        match (cond, form) {
            (None, BranchForm::Short) => {
                let rel = disp - 2;
                assert!(fits_i8(rel));
                buf.emit_u8(0xEB);
                buf.emit_u8(rel as u8);
            }
            (None, BranchForm::Long) => {
                let rel = disp - 5;
                assert!(fits_i32(rel));
                buf.emit_u8(0xE9);
                buf.emit_u32(rel as u32);
            }
            (Some(cc), BranchForm::Short) => {
                let rel = disp - 2;
                assert!(fits_i8(rel));
                buf.emit_u8(0x70 + condition(cc).int());
                buf.emit_u8(rel as u8);
            }
            (Some(cc), BranchForm::Long) => {
                let rel = disp - 6;
                assert!(fits_i32(rel));
                buf.emit_u8(0x0F);
                buf.emit_u8(0x80 + condition(cc).int());
                buf.emit_u32(rel as u32);
            }
            (_, BranchForm::Medium) => panic!("x64 has no medium branch form"),
        }

        Vec::new()
    }

    fn encode_align(&self, pad: u32, buf: &mut CodeBuffer) {
        for _ in 0..pad {
            buf.emit_u8(0x90);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::GcType;
    use crate::instr::InstrPayload;

    fn encode(desc: &InstrDesc) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        TargetX64.encode_instr(desc, &mut buf);
        buf.code()
    }

    #[test]
    fn test_simple_sizes() {
        assert_eq!(encode(&InstrDesc::new(Opcode::Nop, OperandSize::Byte)), vec![0x90]);
        assert_eq!(encode(&InstrDesc::new(Opcode::Ret, OperandSize::Byte)), vec![0xC3]);
    }

    #[test]
    fn test_mov_rr() {
        let desc = InstrDesc::new(Opcode::MovRR, OperandSize::Qword)
            .with_reg(Reg(0), GcType::None)
            .with_reg2(Reg(1), GcType::None);
        // mov rax, rcx
        assert_eq!(encode(&desc), vec![0x48, 0x89, 0xC8]);
    }

    #[test]
    fn test_push_rex() {
        let desc = InstrDesc::new(Opcode::Push, OperandSize::Qword).with_reg(Reg(13), GcType::None);
        assert_eq!(encode(&desc), vec![0x41, 0x55]);
    }

    #[test]
    fn test_add_imm_compact_vs_wide() {
        let small = InstrDesc::new(Opcode::AddImm, OperandSize::Qword)
            .with_reg(Reg(0), GcType::None)
            .with_payload(InstrPayload::cns(8));
        // add rax, 8 (imm8 form)
        assert_eq!(encode(&small), vec![0x48, 0x83, 0xC0, 0x08]);

        let wide = InstrDesc::new(Opcode::AddImm, OperandSize::Qword)
            .with_reg(Reg(0), GcType::None)
            .with_payload(InstrPayload::cns(0x1000));
        // add rax, 0x1000 (imm32 form)
        assert_eq!(encode(&wide), vec![0x48, 0x81, 0xC0, 0x00, 0x10, 0x00, 0x00]);
    }

    #[test]
    fn test_load_base_disp() {
        let desc = InstrDesc::new(Opcode::Load, OperandSize::Qword)
            .with_reg(Reg(0), GcType::None)
            .with_payload(InstrPayload::AddrMode {
                base: Some(Reg(5)),
                index: None,
                scale: 1,
                dsp: 16,
            });
        // mov rax, [rbp+16]
        assert_eq!(encode(&desc), vec![0x48, 0x8B, 0x45, 0x10]);
    }

    #[test]
    fn test_load_sib() {
        let desc = InstrDesc::new(Opcode::Load, OperandSize::Qword)
            .with_reg(Reg(1), GcType::None)
            .with_payload(InstrPayload::AddrMode {
                base: Some(Reg(0)),
                index: Some(Reg(2)),
                scale: 8,
                dsp: 0,
            });
        // mov rcx, [rax+rdx*8]
        assert_eq!(encode(&desc), vec![0x48, 0x8B, 0x0C, 0xD0]);
    }

    #[test]
    fn test_rsp_base_needs_sib() {
        let desc = InstrDesc::new(Opcode::Store, OperandSize::Qword)
            .with_reg(Reg(3), GcType::None)
            .with_payload(InstrPayload::AddrMode {
                base: Some(Reg(4)),
                index: None,
                scale: 1,
                dsp: 8,
            });
        // mov [rsp+8], rbx
        assert_eq!(encode(&desc), vec![0x48, 0x89, 0x5C, 0x24, 0x08]);
    }

    #[test]
    fn test_call_direct_records_fixup() {
        let desc = InstrDesc::new(Opcode::Call, OperandSize::Qword).with_payload(
            InstrPayload::Call {
                target: CallTarget::Direct(0x1234_5678),
                ret_gc: GcType::Ref,
                ret2_gc: GcType::None,
                arg_slots: 0,
            },
        );
        let mut buf = CodeBuffer::new();
        let fixups = TargetX64.encode_instr(&desc, &mut buf);
        assert_eq!(buf.len(), 5);
        assert_eq!(fixups.len(), 1);
        assert_eq!(fixups[0].offset_in_instr, 1);
        assert_eq!(fixups[0].kind, RelocationKind::CodeTarget);
    }

    #[test]
    fn test_branch_encodings() {
        let mut buf = CodeBuffer::new();
        TargetX64.encode_branch(None, BranchForm::Short, 10, 0, &mut buf);
        assert_eq!(buf.bytes(), &[0xEB, 0x08]);

        let mut buf = CodeBuffer::new();
        TargetX64.encode_branch(Some(CondCode::Equal), BranchForm::Long, 6, 0, &mut buf);
        assert_eq!(buf.bytes(), &[0x0F, 0x84, 0x00, 0x00, 0x00, 0x00]);

        // backward short jump to own start
        let mut buf = CodeBuffer::new();
        TargetX64.encode_branch(None, BranchForm::Short, 0, 0, &mut buf);
        assert_eq!(buf.bytes(), &[0xEB, 0xFE]);
    }

    #[test]
    fn test_size_matches_encoding() {
        let desc = InstrDesc::new(Opcode::MovImm, OperandSize::Qword)
            .with_reg(Reg(10), GcType::None)
            .with_payload(InstrPayload::cns(0x7FFF_FFFF_1234));
        assert_eq!(TargetX64.instr_size(&desc), encode(&desc).len() as u32);
        assert_eq!(TargetX64.instr_size(&desc), 10);
    }
}
