use std::fmt;
use std::ops::{BitAnd, BitOr, Not, Sub};

/// Architecture-neutral general-purpose register id. The target
/// description owns the mapping to physical encodings.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Reg(pub u8);

impl Reg {
    pub fn int(self) -> u8 {
        self.0
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct FReg(pub u8);

impl FReg {
    pub fn int(self) -> u8 {
        self.0
    }
}

/// Register-id bitmask. Bit n set means register n is in the set.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct RegSet(u64);

impl RegSet {
    pub fn empty() -> RegSet {
        RegSet(0)
    }

    pub fn of(reg: Reg) -> RegSet {
        RegSet(1u64 << reg.int())
    }

    pub fn from_bits(bits: u64) -> RegSet {
        RegSet(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, reg: Reg) -> bool {
        self.0 & (1u64 << reg.int()) != 0
    }

    pub fn insert(&mut self, reg: Reg) {
        self.0 |= 1u64 << reg.int();
    }

    pub fn remove(&mut self, reg: Reg) {
        self.0 &= !(1u64 << reg.int());
    }

    pub fn intersects(self, other: RegSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn iter(self) -> RegSetIter {
        RegSetIter(self.0)
    }
}

impl BitOr for RegSet {
    type Output = RegSet;

    fn bitor(self, rhs: RegSet) -> RegSet {
        RegSet(self.0 | rhs.0)
    }
}

impl BitAnd for RegSet {
    type Output = RegSet;

    fn bitand(self, rhs: RegSet) -> RegSet {
        RegSet(self.0 & rhs.0)
    }
}

impl Sub for RegSet {
    type Output = RegSet;

    fn sub(self, rhs: RegSet) -> RegSet {
        RegSet(self.0 & !rhs.0)
    }
}

impl Not for RegSet {
    type Output = RegSet;

    fn not(self) -> RegSet {
        RegSet(!self.0)
    }
}

impl FromIterator<Reg> for RegSet {
    fn from_iter<T: IntoIterator<Item = Reg>>(iter: T) -> RegSet {
        let mut set = RegSet::empty();
        for reg in iter {
            set.insert(reg);
        }
        set
    }
}

pub struct RegSetIter(u64);

impl Iterator for RegSetIter {
    type Item = Reg;

    fn next(&mut self) -> Option<Reg> {
        if self.0 == 0 {
            None
        } else {
            let idx = self.0.trailing_zeros() as u8;
            self.0 &= self.0 - 1;
            Some(Reg(idx))
        }
    }
}

impl fmt::Debug for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for reg in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "r{}", reg.int())?;
            first = false;
        }
        write!(f, "}}")
    }
}
