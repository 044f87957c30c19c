//! AArch64 register file and instruction-word builders. Every
//! instruction is one 32-bit word; builders assert their immediates fit.

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Register(u8);

impl Register {
    pub fn new(value: u8) -> Register {
        assert!(value < 31);
        Register(value)
    }

    pub fn encoding(self) -> u32 {
        assert!(self.is_gpr());
        self.0 as u32
    }

    pub fn value(self) -> u8 {
        self.0
    }

    fn is_gpr(&self) -> bool {
        self.0 < 31
    }
}

pub const R0: Register = Register(0);
pub const R1: Register = Register(1);
pub const R2: Register = Register(2);
pub const R3: Register = Register(3);
pub const R4: Register = Register(4);
pub const R5: Register = Register(5);
pub const R6: Register = Register(6);
pub const R7: Register = Register(7);
pub const R8: Register = Register(8);
pub const R9: Register = Register(9);
pub const R10: Register = Register(10);
pub const R11: Register = Register(11);
pub const R12: Register = Register(12);
pub const R13: Register = Register(13);
pub const R14: Register = Register(14);
pub const R15: Register = Register(15);
pub const R16: Register = Register(16);
pub const R17: Register = Register(17);
pub const R18: Register = Register(18);
pub const R19: Register = Register(19);
pub const R20: Register = Register(20);
pub const R21: Register = Register(21);
pub const R22: Register = Register(22);
pub const R23: Register = Register(23);
pub const R24: Register = Register(24);
pub const R25: Register = Register(25);
pub const R26: Register = Register(26);
pub const R27: Register = Register(27);
pub const R28: Register = Register(28);
pub const R29: Register = Register(29);
pub const R30: Register = Register(30);

pub const REG_FP: Register = R29;
pub const REG_LR: Register = R30;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Cond {
    Eq,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
}

impl Cond {
    pub fn int(self) -> u32 {
        match self {
            Cond::Eq => 0b0000,
            Cond::Ne => 0b0001,
            Cond::Cs => 0b0010,
            Cond::Cc => 0b0011,
            Cond::Mi => 0b0100,
            Cond::Pl => 0b0101,
            Cond::Vs => 0b0110,
            Cond::Vc => 0b0111,
            Cond::Hi => 0b1000,
            Cond::Ls => 0b1001,
            Cond::Ge => 0b1010,
            Cond::Lt => 0b1011,
            Cond::Gt => 0b1100,
            Cond::Le => 0b1101,
        }
    }

    pub fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Cs => Cond::Cc,
            Cond::Cc => Cond::Cs,
            Cond::Mi => Cond::Pl,
            Cond::Pl => Cond::Mi,
            Cond::Vs => Cond::Vc,
            Cond::Vc => Cond::Vs,
            Cond::Hi => Cond::Ls,
            Cond::Ls => Cond::Hi,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
        }
    }
}

pub fn fits_i19(value: i32) -> bool {
    -(1 << 18) <= value && value < (1 << 18)
}

pub fn fits_i26(value: i32) -> bool {
    -(1 << 25) <= value && value < (1 << 25)
}

/// B <imm26*4>
pub fn inst_b(imm26: i32) -> u32 {
    assert!(fits_i26(imm26));
    0b000101u32 << 26 | (imm26 as u32 & 0x03FF_FFFF)
}

/// BL <imm26*4>
pub fn inst_bl(imm26: i32) -> u32 {
    assert!(fits_i26(imm26));
    0b100101u32 << 26 | (imm26 as u32 & 0x03FF_FFFF)
}

/// B.cond <imm19*4>
pub fn inst_b_cond(cond: Cond, imm19: i32) -> u32 {
    assert!(fits_i19(imm19));
    0b0101_0100u32 << 24 | (imm19 as u32 & 0x7_FFFF) << 5 | cond.int()
}

/// BR <rn>
pub fn inst_br(rn: Register) -> u32 {
    0b1101_0110_0001_1111u32 << 16 | 0b0000_00u32 << 10 | rn.encoding() << 5
}

/// LDR <rt>, <literal at imm19*4>
pub fn inst_ldr_literal(rt: Register, imm19: i32) -> u32 {
    assert!(fits_i19(imm19));
    0b01_011_0_00u32 << 24 | (imm19 as u32 & 0x7_FFFF) << 5 | rt.encoding()
}

/// RET <rn>
pub fn inst_ret(rn: Register) -> u32 {
    0b1101_0110_0101_1111u32 << 16 | rn.encoding() << 5
}

/// BRK #imm16
pub fn inst_brk(imm16: u32) -> u32 {
    assert!(imm16 < (1 << 16));
    0b1101_0100_001u32 << 21 | imm16 << 5
}

/// NOP
pub fn inst_nop() -> u32 {
    0xD503201F
}

/// MOVZ <rd>, #imm16, LSL #(shift*16)
pub fn inst_movz(sf: u32, rd: Register, imm16: u32, shift: u32) -> u32 {
    assert!(imm16 < (1 << 16));
    assert!(shift < 4);
    sf << 31 | 0b10_100101u32 << 23 | shift << 21 | imm16 << 5 | rd.encoding()
}

/// MOVK <rd>, #imm16, LSL #(shift*16)
pub fn inst_movk(sf: u32, rd: Register, imm16: u32, shift: u32) -> u32 {
    assert!(imm16 < (1 << 16));
    assert!(shift < 4);
    sf << 31 | 0b11_100101u32 << 23 | shift << 21 | imm16 << 5 | rd.encoding()
}

/// MOVN <rd>, #imm16, LSL #(shift*16)
pub fn inst_movn(sf: u32, rd: Register, imm16: u32, shift: u32) -> u32 {
    assert!(imm16 < (1 << 16));
    assert!(shift < 4);
    sf << 31 | 0b00_100101u32 << 23 | shift << 21 | imm16 << 5 | rd.encoding()
}

/// ORR <rd>, XZR, <rm> — register move.
pub fn inst_mov_reg(sf: u32, rd: Register, rm: Register) -> u32 {
    sf << 31 | 0b0101010_000u32 << 21 | rm.encoding() << 16 | 0b11111 << 5 | rd.encoding()
}

fn addsub_imm(sf: u32, op: u32, s: u32, imm12: u32, rn: Register, rd: Register) -> u32 {
    assert!(imm12 < (1 << 12));
    sf << 31 | op << 30 | s << 29 | 0b100010u32 << 23 | imm12 << 10 | rn.encoding() << 5
        | rd.encoding()
}

pub fn inst_add_imm(sf: u32, rd: Register, rn: Register, imm12: u32) -> u32 {
    addsub_imm(sf, 0, 0, imm12, rn, rd)
}

pub fn inst_sub_imm(sf: u32, rd: Register, rn: Register, imm12: u32) -> u32 {
    addsub_imm(sf, 1, 0, imm12, rn, rd)
}

/// SUBS <rd>, <rn>, #imm12 — CMP when rd is XZR.
pub fn inst_subs_imm(sf: u32, rd: Register, rn: Register, imm12: u32) -> u32 {
    addsub_imm(sf, 1, 1, imm12, rn, rd)
}

fn addsub_reg(sf: u32, op: u32, s: u32, rm: Register, rn: Register, rd: Register) -> u32 {
    sf << 31 | op << 30 | s << 29 | 0b01011_00_0u32 << 21 | rm.encoding() << 16
        | rn.encoding() << 5
        | rd.encoding()
}

pub fn inst_add_reg(sf: u32, rd: Register, rn: Register, rm: Register) -> u32 {
    addsub_reg(sf, 0, 0, rm, rn, rd)
}

pub fn inst_sub_reg(sf: u32, rd: Register, rn: Register, rm: Register) -> u32 {
    addsub_reg(sf, 1, 0, rm, rn, rd)
}

pub fn inst_subs_reg(sf: u32, rd: Register, rn: Register, rm: Register) -> u32 {
    addsub_reg(sf, 1, 1, rm, rn, rd)
}

/// ANDS <rd>, <rn>, <rm> — TST when rd is XZR.
pub fn inst_ands_reg(sf: u32, rd: Register, rn: Register, rm: Register) -> u32 {
    sf << 31 | 0b11_01010_00_0u32 << 21 | rm.encoding() << 16 | rn.encoding() << 5
        | rd.encoding()
}

/// LDR <rt>, [<rn>, #imm12 * size] — unsigned scaled offset.
pub fn inst_ldr_imm(size: u32, rt: Register, rn: Register, imm12: u32) -> u32 {
    assert!(imm12 < (1 << 12));
    size << 30 | 0b111_0_01_01u32 << 22 | imm12 << 10 | rn.encoding() << 5 | rt.encoding()
}

/// STR <rt>, [<rn>, #imm12 * size]
pub fn inst_str_imm(size: u32, rt: Register, rn: Register, imm12: u32) -> u32 {
    assert!(imm12 < (1 << 12));
    size << 30 | 0b111_0_01_00u32 << 22 | imm12 << 10 | rn.encoding() << 5 | rt.encoding()
}
