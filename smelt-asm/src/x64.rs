use crate::CodeBuffer;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Register(u8);

impl Register {
    pub fn new(value: u8) -> Register {
        assert!(value < 16);
        Register(value)
    }

    pub fn low_bits(self) -> u8 {
        self.0 & 0b111
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn needs_rex(self) -> bool {
        self.0 > 7
    }
}

pub const RAX: Register = Register(0);
pub const RCX: Register = Register(1);
pub const RDX: Register = Register(2);
pub const RBX: Register = Register(3);
pub const RSP: Register = Register(4);
pub const RBP: Register = Register(5);
pub const RSI: Register = Register(6);
pub const RDI: Register = Register(7);

pub const R8: Register = Register(8);
pub const R9: Register = Register(9);
pub const R10: Register = Register(10);
pub const R11: Register = Register(11);
pub const R12: Register = Register(12);
pub const R13: Register = Register(13);
pub const R14: Register = Register(14);
pub const R15: Register = Register(15);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Condition {
    Overflow,
    NoOverflow,
    Below,
    NeitherAboveNorEqual,
    NotBelow,
    AboveOrEqual,
    Equal,
    Zero,
    NotEqual,
    NotZero,
    BelowOrEqual,
    NotAbove,
    NeitherBelowNorEqual,
    Above,
    Sign,
    NoSign,
    Parity,
    ParityEven,
    NoParity,
    ParityOdd,
    Less,
    NeitherGreaterNorEqual,
    NotLess,
    GreaterOrEqual,
    LessOrEqual,
    NotGreater,
    NeitherLessNorEqual,
    Greater,
}

impl Condition {
    pub fn int(self) -> u8 {
        match self {
            Condition::Overflow => 0b0000,
            Condition::NoOverflow => 0b0001,
            Condition::Below | Condition::NeitherAboveNorEqual => 0b0010,
            Condition::NotBelow | Condition::AboveOrEqual => 0b0011,
            Condition::Equal | Condition::Zero => 0b0100,
            Condition::NotEqual | Condition::NotZero => 0b0101,
            Condition::BelowOrEqual | Condition::NotAbove => 0b0110,
            Condition::NeitherBelowNorEqual | Condition::Above => 0b0111,
            Condition::Sign => 0b1000,
            Condition::NoSign => 0b1001,
            Condition::Parity | Condition::ParityEven => 0b1010,
            Condition::NoParity | Condition::ParityOdd => 0b1011,
            Condition::Less | Condition::NeitherGreaterNorEqual => 0b1100,
            Condition::NotLess | Condition::GreaterOrEqual => 0b1101,
            Condition::LessOrEqual | Condition::NotGreater => 0b1110,
            Condition::NeitherLessNorEqual | Condition::Greater => 0b1111,
        }
    }
}

/// REX prefix: 0100WRXB.
pub fn emit_rex(buf: &mut CodeBuffer, w: bool, r: bool, x: bool, b: bool) {
    buf.emit_u8(0x40 | (w as u8) << 3 | (r as u8) << 2 | (x as u8) << 1 | b as u8);
}

pub fn emit_rex64_modrm(buf: &mut CodeBuffer, reg: Register, rm: Register) {
    emit_rex(buf, true, reg.needs_rex(), false, rm.needs_rex());
}

pub fn emit_rex32_optional(buf: &mut CodeBuffer, reg: Register, rm: Register) {
    if reg.needs_rex() || rm.needs_rex() {
        emit_rex(buf, false, reg.needs_rex(), false, rm.needs_rex());
    }
}

pub fn emit_modrm(buf: &mut CodeBuffer, mode: u8, reg: u8, rm: u8) {
    assert!(mode < 4);
    assert!(reg < 8);
    assert!(rm < 8);
    buf.emit_u8(mode << 6 | reg << 3 | rm);
}

pub fn emit_modrm_registers(buf: &mut CodeBuffer, reg: Register, rm: Register) {
    emit_modrm(buf, 0b11, reg.low_bits(), rm.low_bits());
}
