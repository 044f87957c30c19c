use smelt_asm::arm64::{self as asm, Register};
use smelt_asm::CodeBuffer;

use crate::code::RelocationKind;
use crate::instr::{CallTarget, InstrDesc, InstrPayload, Opcode, OperandSize, IF_RELOC};
use crate::reg::Reg;
use crate::target::{BranchForm, BranchFormInfo, CondCode, EncodedFixup, TargetIsa};

pub struct TargetArm64;

// Scratch register reserved for long-form branches.
const SCRATCH: Register = asm::R16;

const MIB: i64 = 1024 * 1024;

// Long forms go through an inline 64-bit literal and a register branch,
// so their reach is unlimited; the literal site gets a relocation.
static UNCOND_FORMS: [BranchFormInfo; 2] = [
    BranchFormInfo {
        form: BranchForm::Long,
        size: 16,
        min_disp: i64::MIN,
        max_disp: i64::MAX,
    },
    BranchFormInfo {
        form: BranchForm::Short,
        size: 4,
        min_disp: -128 * MIB,
        max_disp: 128 * MIB - 4,
    },
];

static COND_FORMS: [BranchFormInfo; 3] = [
    BranchFormInfo {
        form: BranchForm::Long,
        size: 20,
        min_disp: i64::MIN,
        max_disp: i64::MAX,
    },
    // inverted condition skipping an unconditional branch
    BranchFormInfo {
        form: BranchForm::Medium,
        size: 8,
        min_disp: -128 * MIB,
        max_disp: 128 * MIB - 4,
    },
    BranchFormInfo {
        form: BranchForm::Short,
        size: 4,
        min_disp: -MIB,
        max_disp: MIB - 4,
    },
];

fn reg(r: Reg) -> Register {
    Register::new(r.int())
}

fn cond(cc: CondCode) -> asm::Cond {
    match cc {
        CondCode::Zero | CondCode::Equal => asm::Cond::Eq,
        CondCode::NonZero | CondCode::NotEqual => asm::Cond::Ne,
        CondCode::Greater => asm::Cond::Gt,
        CondCode::GreaterEq => asm::Cond::Ge,
        CondCode::Less => asm::Cond::Lt,
        CondCode::LessEq => asm::Cond::Le,
        CondCode::UnsignedGreater => asm::Cond::Hi,
        CondCode::UnsignedGreaterEq => asm::Cond::Cs,
        CondCode::UnsignedLess => asm::Cond::Cc,
        CondCode::UnsignedLessEq => asm::Cond::Ls,
    }
}

fn sf(size: OperandSize) -> u32 {
    match size {
        OperandSize::Dword => 0,
        OperandSize::Qword => 1,
        _ => panic!("unsupported operand size {:?}", size),
    }
}

/// Size bits of a scaled load/store.
fn ldst_size(size: OperandSize) -> u32 {
    match size {
        OperandSize::Byte => 0,
        OperandSize::Word => 1,
        OperandSize::Dword => 2,
        OperandSize::Qword => 3,
        _ => panic!("unsupported load/store size {:?}", size),
    }
}

/// MOVZ/MOVN plus MOVKs; the same word count the encoder will emit.
fn mov_imm_words(value: u64) -> u32 {
    let halfwords: Vec<u32> = (0..4).map(|idx| (value >> (idx * 16)) as u16 as u32).collect();
    let nonzero = halfwords.iter().filter(|&&hw| hw != 0).count() as u32;
    nonzero.max(1)
}

impl TargetArm64 {
    fn emit_mov_imm(&self, buf: &mut CodeBuffer, rd: Register, value: u64) {
        let mut first = true;

        for idx in 0..4u32 {
            let halfword = (value >> (idx * 16)) as u16 as u32;
            if halfword == 0 {
                continue;
            }

            if first {
                buf.emit_u32(asm::inst_movz(1, rd, halfword, idx));
                first = false;
            } else {
                buf.emit_u32(asm::inst_movk(1, rd, halfword, idx));
            }
        }

        if first {
            buf.emit_u32(asm::inst_movz(1, rd, 0, 0));
        }
    }

    fn mem_operands(&self, desc: &InstrDesc) -> (Register, Register, u32) {
        let rt = reg(desc.reg1.expect("missing register operand"));

        let (base, dsp) = match desc.payload {
            InstrPayload::AddrMode {
                base,
                index,
                scale: _,
                dsp,
            } => {
                assert!(index.is_none(), "scaled index addressing not used on arm64");
                (base.expect("missing base register"), dsp)
            }
            InstrPayload::Dsp(dsp) => (desc.reg2.expect("missing base register"), dsp),
            _ => panic!("memory opcode {:?} without address payload", desc.opcode),
        };

        let scale = desc.size.in_bytes() as i32;
        assert!(dsp >= 0 && dsp % scale == 0, "unscaled offsets unsupported");

        (rt, reg(base), (dsp / scale) as u32)
    }
}

impl TargetIsa for TargetArm64 {
    fn arch(&self) -> crate::target::Arch {
        crate::target::Arch::Arm64
    }

    fn ptr_size(&self) -> usize {
        8
    }

    fn const_pool_adjacent(&self) -> bool {
        // literals are addressed pc-relative with limited reach; the pool
        // must follow the hot code immediately
        true
    }

    fn instr_size(&self, desc: &InstrDesc) -> u32 {
        match desc.opcode {
            Opcode::MovImm => {
                if desc.has_flag(IF_RELOC) {
                    // always the full four-word patchable sequence
                    16
                } else {
                    4 * mov_imm_words(desc.cns() as u64)
                }
            }
            Opcode::Jump | Opcode::JumpCond | Opcode::Align => {
                panic!("{:?} is not sized via instr_size", desc.opcode)
            }
            _ => 4,
        }
    }

    fn branch_forms(&self, conditional: bool) -> &'static [BranchFormInfo] {
        if conditional {
            &COND_FORMS
        } else {
            &UNCOND_FORMS
        }
    }

    fn align_max_pad(&self, boundary: u32) -> u32 {
        assert!(boundary >= 4);
        boundary - 4
    }

    fn align_pad(&self, offset: u32, boundary: u32) -> u32 {
        assert!(boundary.is_power_of_two());
        assert!(offset % 4 == 0);
        (boundary - offset % boundary) % boundary
    }

    fn encode_instr(&self, desc: &InstrDesc, buf: &mut CodeBuffer) -> Vec<EncodedFixup> {
        let start = buf.position() as u32;
        let mut fixups = Vec::new();

        match desc.opcode {
            Opcode::Nop => buf.emit_u32(asm::inst_nop()),
            Opcode::Break => buf.emit_u32(asm::inst_brk(0)),
            Opcode::Ret => buf.emit_u32(asm::inst_ret(asm::REG_LR)),

            Opcode::MovRR => {
                let dst = reg(desc.reg1.expect("missing dst"));
                let src = reg(desc.reg2.expect("missing src"));
                buf.emit_u32(asm::inst_mov_reg(sf(desc.size), dst, src));
            }

            Opcode::MovImm => {
                let dst = reg(desc.reg1.expect("missing dst"));
                let value = desc.cns() as u64;

                if desc.has_flag(IF_RELOC) {
                    // fixed-length movz/movk ladder so the site can be
                    // patched without resizing
                    let site = buf.position() as u32;
                    buf.emit_u32(asm::inst_movz(1, dst, value as u16 as u32, 0));
                    buf.emit_u32(asm::inst_movk(1, dst, (value >> 16) as u16 as u32, 1));
                    buf.emit_u32(asm::inst_movk(1, dst, (value >> 32) as u16 as u32, 2));
                    buf.emit_u32(asm::inst_movk(1, dst, (value >> 48) as u16 as u32, 3));
                    fixups.push(EncodedFixup {
                        offset_in_instr: site - start,
                        target: value,
                        kind: RelocationKind::AbsoluteAddress,
                    });
                } else {
                    self.emit_mov_imm(buf, dst, value);
                }
            }

            Opcode::Load => {
                let (rt, base, imm12) = self.mem_operands(desc);
                buf.emit_u32(asm::inst_ldr_imm(ldst_size(desc.size), rt, base, imm12));
            }

            Opcode::Store => {
                let (rt, base, imm12) = self.mem_operands(desc);
                buf.emit_u32(asm::inst_str_imm(ldst_size(desc.size), rt, base, imm12));
            }

            Opcode::Lea => {
                let dst = reg(desc.reg1.expect("missing dst"));
                let (base, dsp) = match desc.payload {
                    InstrPayload::AddrMode {
                        base, index, dsp, ..
                    } => {
                        assert!(index.is_none());
                        (reg(base.expect("missing base")), dsp)
                    }
                    _ => panic!("lea without addressing mode"),
                };
                assert!((0..4096).contains(&dsp));
                buf.emit_u32(asm::inst_add_imm(1, dst, base, dsp as u32));
            }

            Opcode::Add => {
                let dst = reg(desc.reg1.expect("missing dst"));
                let src = reg(desc.reg2.expect("missing src"));
                buf.emit_u32(asm::inst_add_reg(sf(desc.size), dst, dst, src));
            }

            Opcode::Sub => {
                let dst = reg(desc.reg1.expect("missing dst"));
                let src = reg(desc.reg2.expect("missing src"));
                buf.emit_u32(asm::inst_sub_reg(sf(desc.size), dst, dst, src));
            }

            Opcode::Cmp => {
                let lhs = reg(desc.reg1.expect("missing lhs"));
                let rhs = reg(desc.reg2.expect("missing rhs"));
                buf.emit_u32(asm::inst_subs_reg(sf(desc.size), asm::R16, lhs, rhs));
            }

            Opcode::Test => {
                let lhs = reg(desc.reg1.expect("missing lhs"));
                let rhs = reg(desc.reg2.expect("missing rhs"));
                buf.emit_u32(asm::inst_ands_reg(sf(desc.size), asm::R16, lhs, rhs));
            }

            Opcode::AddImm => {
                let dst = reg(desc.reg1.expect("missing dst"));
                let cns = desc.cns();
                assert!((0..4096).contains(&cns));
                buf.emit_u32(asm::inst_add_imm(sf(desc.size), dst, dst, cns as u32));
            }

            Opcode::SubImm => {
                let dst = reg(desc.reg1.expect("missing dst"));
                let cns = desc.cns();
                assert!((0..4096).contains(&cns));
                buf.emit_u32(asm::inst_sub_imm(sf(desc.size), dst, dst, cns as u32));
            }

            Opcode::CmpImm => {
                let lhs = reg(desc.reg1.expect("missing lhs"));
                let cns = desc.cns();
                assert!((0..4096).contains(&cns));
                buf.emit_u32(asm::inst_subs_imm(sf(desc.size), asm::R16, lhs, cns as u32));
            }

            Opcode::Push | Opcode::Pop => {
                panic!("arm64 prologs use store/load pairs, not push/pop")
            }

            Opcode::Call => {
                let target = match desc.payload {
                    InstrPayload::Call { target, .. } => target,
                    _ => panic!("call without call payload"),
                };
                match target {
                    CallTarget::Direct(addr) => {
                        let site = buf.position() as u32;
                        buf.emit_u32(asm::inst_bl(0));
                        fixups.push(EncodedFixup {
                            offset_in_instr: site - start,
                            target: addr,
                            kind: RelocationKind::CodeTarget,
                        });
                    }
                    CallTarget::Register => {
                        let r = reg(desc.reg1.expect("missing call register"));
                        buf.emit_u32(0xD63F0000 | r.encoding() << 5); // blr
                    }
                }
            }

            Opcode::CallReg => {
                let r = reg(desc.reg1.expect("missing call register"));
                buf.emit_u32(0xD63F0000 | r.encoding() << 5); // blr
            }

            Opcode::Jump | Opcode::JumpCond | Opcode::Align => {
                panic!("{:?} is not encoded via encode_instr", desc.opcode)
            }
        }

        fixups
    }

    fn encode_branch(
        &self,
        cc: Option<CondCode>,
        form: BranchForm,
        disp: i64,
        abs_target: u64,
        buf: &mut CodeBuffer,
    ) -> Vec<EncodedFixup> {
        assert!(disp % 4 == 0);
        let start = buf.position() as u32;
        let mut fixups = Vec::new();

        // ldr x16, +8; br x16; .quad target
        let emit_literal_branch = |buf: &mut CodeBuffer, fixups: &mut Vec<EncodedFixup>| {
            buf.emit_u32(asm::inst_ldr_literal(SCRATCH, 2));
            buf.emit_u32(asm::inst_br(SCRATCH));
            let site = buf.position() as u32;
            buf.emit_u64(abs_target);
            fixups.push(EncodedFixup {
                offset_in_instr: site - start,
                target: abs_target,
                kind: RelocationKind::CodeTarget,
            });
        };

        match (cc, form) {
            (None, BranchForm::Short) => {
                buf.emit_u32(asm::inst_b((disp / 4) as i32));
            }
            (None, BranchForm::Long) => {
                emit_literal_branch(buf, &mut fixups);
            }
            (Some(cc), BranchForm::Short) => {
                buf.emit_u32(asm::inst_b_cond(cond(cc), (disp / 4) as i32));
            }
            (Some(cc), BranchForm::Medium) => {
                // inverted condition skips the wide unconditional branch
                buf.emit_u32(asm::inst_b_cond(cond(cc).invert(), 2));
                buf.emit_u32(asm::inst_b(((disp - 4) / 4) as i32));
            }
            (Some(cc), BranchForm::Long) => {
                buf.emit_u32(asm::inst_b_cond(cond(cc).invert(), 5));
                emit_literal_branch(buf, &mut fixups);
            }
            (None, BranchForm::Medium) => panic!("arm64 has no medium unconditional form"),
        }

        fixups
    }

    fn encode_align(&self, pad: u32, buf: &mut CodeBuffer) {
        assert!(pad % 4 == 0);
        for _ in 0..pad / 4 {
            buf.emit_u32(asm::inst_nop());
        }
    }
}
