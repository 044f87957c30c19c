//! Final per-method artifacts: the code bytes plus the offset-keyed
//! tables handed to the compiler host. The host owns the physical bit
//! packing of its own formats; these tables only guarantee the logical
//! entries and their ordering.

use std::fmt;

use crate::reg::RegSet;
use crate::scope::{VarId, VarLoc};

pub const CODE_ALIGNMENT: usize = 16;

/// Raw memory address handed out by the host.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    pub fn from_usize(value: usize) -> Address {
        Address(value)
    }

    pub fn null() -> Address {
        Address(0)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn to_usize(self) -> usize {
        self.0
    }

    pub fn offset(self, offset: usize) -> Address {
        Address(self.0 + offset)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Live roots at one native offset where the GC may suspend the thread.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SafepointEntry {
    pub gcref_regs: RegSet,
    pub byref_regs: RegSet,
    /// Frame offsets of stack-resident tracked GC variables, ascending.
    pub gcref_var_offsets: Vec<i32>,
}

#[derive(Debug)]
pub struct SafepointTable {
    entries: Vec<(u32, SafepointEntry)>,
}

impl SafepointTable {
    pub fn new() -> SafepointTable {
        SafepointTable {
            entries: Vec::new(),
        }
    }

    pub fn get(&self, offset: u32) -> Option<&SafepointEntry> {
        let result = self
            .entries
            .binary_search_by_key(&offset, |&(offset, _)| offset);

        match result {
            Ok(idx) => Some(&self.entries[idx].1),
            Err(_) => None,
        }
    }

    pub fn insert(&mut self, offset: u32, entry: SafepointEntry) {
        assert!(
            !entry.gcref_regs.intersects(entry.byref_regs),
            "safepoint at {} with overlapping GC-ref/byref registers",
            offset
        );

        if let Some(last) = self.entries.last() {
            debug_assert!(offset > last.0);
        }

        self.entries.push((offset, entry));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u32, SafepointEntry)> {
        self.entries.iter()
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct VarLocationEntry {
    pub var: VarId,
    pub begin: u32,
    pub end: u32,
    pub loc: VarLoc,
}

/// Debugger variable-location table: per variable an ordered list of
/// non-overlapping half-open native-offset ranges.
#[derive(Debug)]
pub struct VarLocationTable {
    entries: Vec<VarLocationEntry>,
}

impl VarLocationTable {
    pub fn new() -> VarLocationTable {
        VarLocationTable {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, entry: VarLocationEntry) {
        assert!(entry.begin < entry.end);

        if let Some(prev) = self
            .entries
            .iter()
            .rev()
            .find(|prev| prev.var == entry.var)
        {
            assert!(
                prev.end <= entry.begin,
                "overlapping ranges for {:?}",
                entry.var
            );
        }

        self.entries.push(entry);
    }

    pub fn ranges_for(&self, var: VarId) -> Vec<VarLocationEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.var == var)
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VarLocationEntry> {
        self.entries.iter()
    }
}

pub struct CommentTable {
    entries: Vec<(u32, String)>,
}

impl CommentTable {
    pub fn new() -> CommentTable {
        CommentTable {
            entries: Vec::new(),
        }
    }

    pub fn get(&self, offset: u32) -> Vec<&String> {
        let result = self
            .entries
            .binary_search_by_key(&offset, |&(offset, _)| offset);

        match result {
            Ok(mut idx) => {
                while idx > 0 && self.entries[idx - 1].0 == offset {
                    idx -= 1;
                }

                let mut comments = Vec::new();
                while idx < self.entries.len() && self.entries[idx].0 == offset {
                    comments.push(&self.entries[idx].1);
                    idx += 1;
                }
                comments
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn insert(&mut self, offset: u32, comment: String) {
        if let Some(last) = self.entries.last() {
            debug_assert!(offset >= last.0);
        }

        self.entries.push((offset, comment));
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RelocationKind {
    /// Absolute address of another code object.
    CodeTarget,
    /// Absolute address of a runtime object or helper.
    AbsoluteAddress,
    /// Constant-pool slot holding the final offset of a jump target.
    JumpTableEntry(u32),
}

#[derive(Debug)]
pub struct RelocationTable {
    entries: Vec<(u32, Address, RelocationKind)>,
}

impl RelocationTable {
    pub fn new() -> RelocationTable {
        RelocationTable {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, site_offset: u32, target: Address, kind: RelocationKind) {
        self.entries.push((site_offset, target, kind));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u32, Address, RelocationKind)> {
        self.entries.iter()
    }
}

impl From<Vec<(u32, Address, RelocationKind)>> for RelocationTable {
    fn from(entries: Vec<(u32, Address, RelocationKind)>) -> RelocationTable {
        RelocationTable { entries }
    }
}

/// Everything emission produced for one method.
pub struct CodeDescriptor {
    pub code: Vec<u8>,
    pub hot_size: usize,
    pub cold_size: usize,
    pub ro_data_size: usize,
    pub safepoints: SafepointTable,
    pub var_locations: VarLocationTable,
    pub comments: CommentTable,
    pub relocations: RelocationTable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::Reg;

    fn entry(regs: &[u8]) -> SafepointEntry {
        SafepointEntry {
            gcref_regs: regs.iter().map(|&id| Reg(id)).collect(),
            byref_regs: RegSet::empty(),
            gcref_var_offsets: Vec::new(),
        }
    }

    #[test]
    fn test_safepoint_lookup() {
        let mut table = SafepointTable::new();
        table.insert(4, entry(&[1]));
        table.insert(12, entry(&[1, 2]));
        table.insert(20, entry(&[]));

        assert!(table.get(0).is_none());
        assert_eq!(table.get(12).unwrap().gcref_regs.count(), 2);
        assert!(table.get(13).is_none());
    }

    #[test]
    #[should_panic]
    fn test_var_location_overlap_asserts() {
        let mut table = VarLocationTable::new();
        table.insert(VarLocationEntry {
            var: VarId(0),
            begin: 0,
            end: 10,
            loc: VarLoc::Reg(Reg(1)),
        });
        table.insert(VarLocationEntry {
            var: VarId(0),
            begin: 8,
            end: 16,
            loc: VarLoc::Reg(Reg(2)),
        });
    }

    #[test]
    fn test_comment_table_multiple_at_offset() {
        let mut table = CommentTable::new();
        table.insert(0, "prolog".into());
        table.insert(8, "block 1".into());
        table.insert(8, "spill".into());

        assert_eq!(table.get(8).len(), 2);
        assert_eq!(table.get(4).len(), 0);
    }
}
