//! Final layout and byte emission.
//!
//! Jump resolution leaves every alignment descriptor at its worst-case
//! padding; this pass fixes the real padding (offsets only shrink, so
//! every resolved branch form still fits), assigns final offsets, places
//! the literal pool, and encodes the whole method through the target.

use std::collections::HashMap;

use smelt_asm::CodeBuffer;

use crate::code::{Address, RelocationKind, CODE_ALIGNMENT};
use crate::ig::{GroupBuffer, InsGroupId, IGF_HAS_ALIGN, IGF_REMOVED_ALIGN};
use crate::jump::JumpDesc;
use crate::pool::ConstantPool;
use crate::target::TargetIsa;

/// Final offsets of one method. Instruction offsets are method-relative:
/// hot code covers `[0, hot_size)`, cold code `[hot_size, hot_size +
/// cold_size)`. In the emitted blob the pool sits between the two.
pub struct MethodLayout {
    pub instr_offsets: Vec<u32>,
    pub hot_size: u32,
    pub cold_size: u32,
    /// Blob offset of the literal pool (16-aligned end of hot code).
    pub pool_offset: u32,
    pub ro_data_size: u32,
}

impl MethodLayout {
    pub fn end_offset(&self) -> u32 {
        self.hot_size + self.cold_size
    }

    /// Maps a method-relative offset to its offset in the emitted blob.
    pub fn blob_offset(&self, method_offset: u32) -> u32 {
        if method_offset < self.hot_size {
            method_offset
        } else {
            self.pool_offset + self.ro_data_size + (method_offset - self.hot_size)
        }
    }

    pub fn blob_size(&self) -> u32 {
        self.pool_offset + self.ro_data_size + self.cold_size
    }
}

/// Replaces worst-case alignment padding with the exact padding at each
/// descriptor's final position and assigns final group and instruction
/// offsets.
pub fn compute(
    buffer: &mut GroupBuffer,
    pool: &ConstantPool,
    isa: &dyn TargetIsa,
    ptr_size: u32,
) -> MethodLayout {
    let mut offsets = vec![0u32; buffer.instr_count()];
    let mut offset = 0;
    let mut hot_size = 0;

    for cold in [false, true] {
        // each section is a separate CODE_ALIGNMENT-aligned allocation,
        // so padding is measured from the section start
        let section_start = offset;

        for id in buffer.section_groups(cold) {
            buffer.group_mut(id).offs = offset;
            let group_start = offset;

            for idx in 0..buffer.group(id).instrs.len() {
                let instr = buffer.group(id).instrs[idx];

                if buffer.instr(instr).is_align() {
                    let boundary = buffer.instr(instr).cns() as u32;
                    buffer.instr_mut(instr).enc_size =
                        isa.align_pad(offset - section_start, boundary);
                }

                offsets[instr.idx()] = offset;
                offset += buffer.instr(instr).enc_size;
            }

            buffer.group_mut(id).size = offset - group_start;

            if buffer.group(id).flags & IGF_HAS_ALIGN != 0 {
                let all_removed = buffer.group(id).instrs.iter().all(|&instr| {
                    !buffer.instr(instr).is_align() || buffer.instr(instr).enc_size == 0
                });
                if all_removed {
                    buffer.group_mut(id).flags |= IGF_REMOVED_ALIGN;
                }
            }
        }

        if !cold {
            hot_size = offset;
        }
    }

    let ro_data_size = pool.size(ptr_size);
    let pool_offset = if ro_data_size > 0 {
        align_up(hot_size, CODE_ALIGNMENT as u32)
    } else {
        hot_size
    };

    MethodLayout {
        instr_offsets: offsets,
        hot_size,
        cold_size: offset - hot_size,
        pool_offset,
        ro_data_size,
    }
}

/// Encodes every group plus the literal pool into one blob. Returns the
/// bytes and the relocation sites (blob offset, absolute target, kind).
pub fn encode(
    buffer: &GroupBuffer,
    jumps: &[JumpDesc],
    layout: &MethodLayout,
    pool: &ConstantPool,
    isa: &dyn TargetIsa,
    ptr_size: u32,
    hot_base: Address,
    cold_base: Option<Address>,
) -> (Vec<u8>, Vec<(u32, Address, RelocationKind)>) {
    let jump_by_instr: HashMap<_, _> = jumps
        .iter()
        .enumerate()
        .map(|(idx, jump)| (jump.instr, idx))
        .collect();

    let addr_of = |method_offset: u32| -> u64 {
        if method_offset < layout.hot_size {
            (hot_base.to_usize() + method_offset as usize) as u64
        } else {
            let cold = cold_base.expect("cold code without a cold allocation");
            (cold.to_usize() + (method_offset - layout.hot_size) as usize) as u64
        }
    };

    let mut buf = CodeBuffer::new();
    let mut relocs = Vec::new();

    for cold in [false, true] {
        if cold {
            // literal pool sits between the sections in the blob
            while (buf.position() as u32) < layout.pool_offset {
                buf.emit_u8(0);
            }
            let pool_fixups = pool.emit(&mut buf, ptr_size, &|group: InsGroupId| {
                addr_of(buffer.group(group).offs)
            });
            for (offset, target, kind) in pool_fixups {
                relocs.push((
                    layout.pool_offset + offset,
                    Address::from_usize(target as usize),
                    kind,
                ));
            }
        }

        for id in buffer.section_groups(cold) {
            for &instr in &buffer.group(id).instrs {
                let desc = buffer.instr(instr);
                let method_offset = layout.instr_offsets[instr.idx()];
                let blob_offset = layout.blob_offset(method_offset);
                let start = buf.position();

                let fixups = if desc.is_branch() {
                    let jump = &jumps[jump_by_instr[&instr]];
                    if jump.removed {
                        continue;
                    }

                    let target_addr = addr_of(buffer.group(jump.target).offs);
                    let disp = target_addr as i64 - addr_of(method_offset) as i64;
                    isa.encode_branch(jump.cond, jump.form, disp, target_addr, &mut buf)
                } else if desc.is_align() {
                    if desc.enc_size > 0 {
                        isa.encode_align(desc.enc_size, &mut buf);
                    }
                    Vec::new()
                } else {
                    isa.encode_instr(desc, &mut buf)
                };

                debug_assert_eq!(
                    (buf.position() - start) as u32,
                    desc.enc_size,
                    "descriptor {:?} sized {} but encoded {}",
                    desc.opcode,
                    desc.enc_size,
                    buf.position() - start
                );

                for fixup in fixups {
                    relocs.push((
                        blob_offset + fixup.offset_in_instr,
                        Address::from_usize(fixup.target as usize),
                        fixup.kind,
                    ));
                }
            }
        }
    }

    (buf.code(), relocs)
}

fn align_up(value: u32, alignment: u32) -> u32 {
    assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
