//! Interface to the embedding compiler/runtime. The emitter never talks
//! to the process address space directly; memory placement and table
//! registration go through this trait so hosts can relocate code or
//! write it into a shared cache.

use parking_lot::RwLock;

use crate::code::{Address, RelocationKind, SafepointTable, VarLocationTable, CODE_ALIGNMENT};

/// Memory reserved for one method: hot code, optional cold code, and
/// optional read-only data (literal pool, jump tables).
pub struct CodeAllocation {
    pub hot: Address,
    pub cold: Option<Address>,
    pub ro_data: Option<Address>,
}

pub trait CompilerHost {
    /// Reserves executable memory for a method. Code sections are
    /// aligned to [`CODE_ALIGNMENT`], read-only data to `ro_data_align`.
    /// `cold` and `ro_data` are `None` when the matching size is zero.
    /// On targets whose instructions reach the literal pool pc-relative,
    /// read-only data must sit directly after the hot section (plus
    /// alignment padding) and the returned pointer reflects that
    /// placement; elsewhere the host may place it independently.
    fn allocate_code_memory(
        &self,
        hot_size: usize,
        cold_size: usize,
        ro_data_size: usize,
        ro_data_align: usize,
    ) -> CodeAllocation;

    fn register_safepoint_table(&self, code: Address, table: &SafepointTable);

    fn register_variable_location_table(&self, code: Address, table: &VarLocationTable);

    /// Reports a patch site so the host can re-resolve it if the code
    /// object ever moves.
    fn record_relocation(&self, site: Address, target: Address, kind: RelocationKind);
}

/// Host double for tests: bump-allocates fake addresses and records
/// every registration. Read-only data is placed directly after the hot
/// section, which satisfies both placement policies.
pub struct RecordingHost {
    next: RwLock<usize>,
    pub allocations: RwLock<Vec<(Address, usize)>>,
    pub safepoint_tables: RwLock<Vec<(Address, usize)>>,
    pub var_location_tables: RwLock<Vec<(Address, usize)>>,
    pub relocations: RwLock<Vec<(Address, Address, RelocationKind)>>,
}

impl RecordingHost {
    pub fn new() -> RecordingHost {
        RecordingHost {
            next: RwLock::new(0x10_0000),
            allocations: RwLock::new(Vec::new()),
            safepoint_tables: RwLock::new(Vec::new()),
            var_location_tables: RwLock::new(Vec::new()),
            relocations: RwLock::new(Vec::new()),
        }
    }

    fn bump(&self, size: usize, align: usize) -> Address {
        let mut next = self.next.write();
        let base = (*next + align - 1) & !(align - 1);
        *next = base + size;
        Address::from_usize(base)
    }

    fn reserve(&self, size: usize, align: usize) -> Address {
        let base = self.bump(size, align);
        self.allocations.write().push((base, size));
        base
    }
}

impl CompilerHost for RecordingHost {
    fn allocate_code_memory(
        &self,
        hot_size: usize,
        cold_size: usize,
        ro_data_size: usize,
        ro_data_align: usize,
    ) -> CodeAllocation {
        let hot = self.reserve(hot_size, CODE_ALIGNMENT);

        // nothing is bumped in between, so this lands right after the
        // hot section
        let ro_data = if ro_data_size > 0 {
            Some(self.reserve(ro_data_size, ro_data_align))
        } else {
            None
        };

        let cold = if cold_size > 0 {
            Some(self.reserve(cold_size, CODE_ALIGNMENT))
        } else {
            None
        };

        CodeAllocation { hot, cold, ro_data }
    }

    fn register_safepoint_table(&self, code: Address, table: &SafepointTable) {
        self.safepoint_tables.write().push((code, table.len()));
    }

    fn register_variable_location_table(&self, code: Address, table: &VarLocationTable) {
        self.var_location_tables.write().push((code, table.len()));
    }

    fn record_relocation(&self, site: Address, target: Address, kind: RelocationKind) {
        self.relocations.write().push((site, target, kind));
    }
}
