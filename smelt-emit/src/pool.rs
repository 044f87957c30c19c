//! Read-only literal pool emitted alongside the method's code: floating
//! point immediates the instruction set cannot embed, 128-bit constants,
//! absolute addresses, and switch jump tables. Scalar constants are
//! deduplicated; jump tables never are.

use smelt_asm::CodeBuffer;

use crate::code::RelocationKind;
use crate::ig::InsGroupId;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PoolId(pub u32);

#[derive(Clone, PartialEq, Debug)]
pub enum PoolValue {
    /// f32 bit pattern.
    Float32(u32),
    /// f64 bit pattern.
    Float64(u64),
    Int128(u128),
    /// Absolute runtime address, patched on relocation.
    Address(u64),
    /// One absolute code address per target group.
    JumpTable(Vec<InsGroupId>),
}

impl PoolValue {
    fn alignment(&self, ptr_size: u32) -> u32 {
        match self {
            PoolValue::Float32(_) => 4,
            PoolValue::Float64(_) => 8,
            PoolValue::Int128(_) => 16,
            PoolValue::Address(_) => ptr_size,
            PoolValue::JumpTable(_) => ptr_size,
        }
    }

    fn size(&self, ptr_size: u32) -> u32 {
        match self {
            PoolValue::Float32(_) => 4,
            PoolValue::Float64(_) => 8,
            PoolValue::Int128(_) => 16,
            PoolValue::Address(_) => ptr_size,
            PoolValue::JumpTable(targets) => targets.len() as u32 * ptr_size,
        }
    }
}

pub struct ConstantPool {
    entries: Vec<PoolValue>,
}

impl ConstantPool {
    pub fn new() -> ConstantPool {
        ConstantPool {
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn add_f32(&mut self, value: f32) -> PoolId {
        self.add_dedup(PoolValue::Float32(value.to_bits()))
    }

    pub fn add_f64(&mut self, value: f64) -> PoolId {
        self.add_dedup(PoolValue::Float64(value.to_bits()))
    }

    pub fn add_i128(&mut self, value: u128) -> PoolId {
        self.add_dedup(PoolValue::Int128(value))
    }

    pub fn add_address(&mut self, value: u64) -> PoolId {
        self.add_dedup(PoolValue::Address(value))
    }

    pub fn add_jump_table(&mut self, targets: Vec<InsGroupId>) -> PoolId {
        assert!(!targets.is_empty());
        self.push(PoolValue::JumpTable(targets))
    }

    fn add_dedup(&mut self, value: PoolValue) -> PoolId {
        if let Some(idx) = self.entries.iter().position(|entry| *entry == value) {
            return PoolId(idx as u32);
        }

        self.push(value)
    }

    fn push(&mut self, value: PoolValue) -> PoolId {
        let id = PoolId(self.entries.len() as u32);
        self.entries.push(value);
        id
    }

    /// Pool-relative byte offset of an entry, entries laid out in
    /// insertion order with per-entry alignment padding.
    pub fn offset_of(&self, id: PoolId, ptr_size: u32) -> u32 {
        let mut offset = 0;

        for (idx, entry) in self.entries.iter().enumerate() {
            offset = align_up(offset, entry.alignment(ptr_size));
            if idx == id.0 as usize {
                return offset;
            }
            offset += entry.size(ptr_size);
        }

        panic!("unknown pool entry {:?}", id);
    }

    /// Total pool size in bytes.
    pub fn size(&self, ptr_size: u32) -> u32 {
        let mut offset = 0;

        for entry in &self.entries {
            offset = align_up(offset, entry.alignment(ptr_size));
            offset += entry.size(ptr_size);
        }

        offset
    }

    /// Writes the pool at the buffer's current position, which must be
    /// 16-byte aligned. `group_addr` supplies the final absolute address
    /// of a jump-table target group. Returns pool-relative fixup sites
    /// with the absolute value written into each.
    pub fn emit(
        &self,
        buf: &mut CodeBuffer,
        ptr_size: u32,
        group_addr: &dyn Fn(InsGroupId) -> u64,
    ) -> Vec<(u32, u64, RelocationKind)> {
        let base = buf.position() as u32;
        let mut fixups = Vec::new();

        for entry in &self.entries {
            let aligned = base + align_up(buf.position() as u32 - base, entry.alignment(ptr_size));
            while (buf.position() as u32) < aligned {
                buf.emit_u8(0);
            }

            let offset = buf.position() as u32 - base;

            match entry {
                PoolValue::Float32(bits) => buf.emit_u32(*bits),
                PoolValue::Float64(bits) => buf.emit_u64(*bits),
                PoolValue::Int128(value) => buf.emit_u128(*value),
                PoolValue::Address(addr) => {
                    fixups.push((offset, *addr, RelocationKind::AbsoluteAddress));
                    buf.emit_u64(*addr);
                }
                PoolValue::JumpTable(targets) => {
                    for (slot, &target) in targets.iter().enumerate() {
                        let addr = group_addr(target);
                        fixups.push((
                            offset + slot as u32 * ptr_size,
                            addr,
                            RelocationKind::JumpTableEntry(slot as u32),
                        ));
                        buf.emit_u64(addr);
                    }
                }
            }
        }

        fixups
    }
}

fn align_up(value: u32, alignment: u32) -> u32 {
    assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_dedup() {
        let mut pool = ConstantPool::new();
        let a = pool.add_f64(1.5);
        let b = pool.add_f64(2.5);
        let c = pool.add_f64(1.5);

        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_jump_tables_never_dedup() {
        let mut pool = ConstantPool::new();
        let targets = vec![InsGroupId(1), InsGroupId(2)];
        let a = pool.add_jump_table(targets.clone());
        let b = pool.add_jump_table(targets);
        assert_ne!(a, b);
    }

    #[test]
    fn test_alignment_padding() {
        let mut pool = ConstantPool::new();
        let f = pool.add_f32(1.0);
        let d = pool.add_f64(2.0);
        let q = pool.add_i128(3);

        assert_eq!(pool.offset_of(f, 8), 0);
        assert_eq!(pool.offset_of(d, 8), 8);
        assert_eq!(pool.offset_of(q, 8), 16);
        assert_eq!(pool.size(8), 32);
    }

    #[test]
    fn test_emit_bytes_and_fixups() {
        let mut pool = ConstantPool::new();
        pool.add_f32(1.0);
        pool.add_address(0x1122_3344);
        pool.add_jump_table(vec![InsGroupId(0), InsGroupId(1)]);

        let mut buf = CodeBuffer::new();
        let fixups = pool.emit(&mut buf, 8, &|group| 0x1000 + group.0 as u64 * 0x10);

        let code = buf.code();
        assert_eq!(&code[0..4], &1.0f32.to_bits().to_le_bytes());
        // address aligned to 8
        assert_eq!(&code[8..16], &0x1122_3344u64.to_le_bytes());
        assert_eq!(&code[16..24], &0x1000u64.to_le_bytes());
        assert_eq!(&code[24..32], &0x1010u64.to_le_bytes());

        assert_eq!(fixups.len(), 3);
        assert_eq!(fixups[0], (8, 0x1122_3344, RelocationKind::AbsoluteAddress));
        assert_eq!(fixups[1], (16, 0x1000, RelocationKind::JumpTableEntry(0)));
        assert_eq!(fixups[2], (24, 0x1010, RelocationKind::JumpTableEntry(1)));
    }
}
