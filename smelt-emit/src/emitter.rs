//! Per-method emission context. Owns the group buffer, the GC and scope
//! trackers, the branch records and the literal pool for exactly one
//! method; `finish` runs resolution and layout and hands the result to
//! the compiler host. Contexts are independent, so methods can be
//! compiled on any number of threads without shared emitter state.

use crate::code::{
    CodeDescriptor, RelocationTable, SafepointEntry, SafepointTable, CODE_ALIGNMENT,
};
use crate::config::EmitConfig;
use crate::error::EmitResult;
use crate::gc::{GcState, GcTracker};
use crate::host::CompilerHost;
use crate::ig::{
    GroupBuffer, InsGroupId, IGF_COLD, IGF_EPILOG, IGF_FUNCLET_EPILOG, IGF_FUNCLET_PROLOG,
    IGF_HAS_ALIGN, IGF_HAS_REMOVABLE_JMP, IGF_NOGC_INTERRUPT,
};
use crate::instr::{
    CallTarget, InstrDesc, InstrId, InstrPayload, Opcode, OperandSize, IF_NO_GC_INTERRUPT,
    IF_SAFEPOINT,
};
use crate::jump::{self, JumpDesc};
use crate::layout;
use crate::pool::{ConstantPool, PoolId};
use crate::reg::Reg;
use crate::scope::{BlockScopeVar, ScopeTracker, VarId, VarLoc};
use crate::target::{target_for, Arch, BranchForm, CondCode, TargetIsa};

/// Forward-referenceable branch target; bound to a group at most once.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BlockLabel(u32);

#[derive(Clone, Debug)]
enum ScopeEvent {
    Start(VarId, VarLoc),
    End(VarId),
    Move(VarId, VarLoc),
    OpenBlock(Vec<BlockScopeVar>),
    CloseBlock(Vec<VarId>),
}

pub struct MethodEmitter<'a> {
    config: &'a EmitConfig,
    isa: &'static dyn TargetIsa,

    buffer: GroupBuffer,
    gc: GcTracker,

    jumps: Vec<JumpDesc>,
    jump_labels: Vec<BlockLabel>,
    labels: Vec<Option<InsGroupId>>,
    pending_jump_tables: Vec<Vec<BlockLabel>>,

    pool: ConstantPool,

    /// Scope and comment events keyed by the arena index of the next
    /// appended instruction; native offsets exist only after layout.
    scope_events: Vec<(u32, ScopeEvent)>,
    comments: Vec<(u32, String)>,

    /// Frame offset of each tracked GC stack slot, indexed by slot.
    tracked_slot_offsets: Vec<i32>,

    nogc_depth: u32,
    cold: bool,
}

impl<'a> MethodEmitter<'a> {
    /// Opens a fresh context positioned in the method prolog.
    /// `tracked_slot_offsets` gives the frame offset of every tracked GC
    /// stack slot.
    pub fn new(config: &'a EmitConfig, tracked_slot_offsets: Vec<i32>) -> MethodEmitter<'a> {
        let slots = tracked_slot_offsets.len();

        MethodEmitter {
            config,
            isa: target_for(config.arch),
            buffer: GroupBuffer::new(&GcState::new(slots)),
            gc: GcTracker::new(slots),
            jumps: Vec::new(),
            jump_labels: Vec::new(),
            labels: Vec::new(),
            pending_jump_tables: Vec::new(),
            pool: ConstantPool::new(),
            scope_events: Vec::new(),
            comments: Vec::new(),
            tracked_slot_offsets,
            nogc_depth: 0,
            cold: false,
        }
    }

    pub fn config(&self) -> &EmitConfig {
        self.config
    }

    pub fn gc(&mut self) -> &mut GcTracker {
        &mut self.gc
    }

    fn region_flags(&self) -> u16 {
        let mut flags = 0;
        if self.nogc_depth > 0 {
            flags |= IGF_NOGC_INTERRUPT;
        }
        if self.cold {
            flags |= IGF_COLD;
        }
        flags
    }

    fn in_no_gc_region(&self) -> bool {
        self.nogc_depth > 0 || self.buffer.group(self.buffer.cur_group_id()).is_no_gc()
    }

    /// Closes the prolog and starts the first body group.
    pub fn end_prolog(&mut self) -> InsGroupId {
        self.begin_block()
    }

    /// Starts a new group at the current GC state.
    pub fn begin_block(&mut self) -> InsGroupId {
        self.buffer.begin_label(self.gc.state(), self.region_flags())
    }

    /// Epilogs never allow GC suspension.
    pub fn begin_epilog(&mut self) -> InsGroupId {
        let flags = IGF_EPILOG | IGF_NOGC_INTERRUPT | self.region_flags();
        self.buffer.begin_label(self.gc.state(), flags)
    }

    pub fn begin_funclet_prolog(&mut self) -> InsGroupId {
        let flags = IGF_FUNCLET_PROLOG | IGF_NOGC_INTERRUPT | self.region_flags();
        self.buffer.begin_label(self.gc.state(), flags)
    }

    pub fn begin_funclet_epilog(&mut self) -> InsGroupId {
        let flags = IGF_FUNCLET_EPILOG | IGF_NOGC_INTERRUPT | self.region_flags();
        self.buffer.begin_label(self.gc.state(), flags)
    }

    /// Moves everything that follows to the cold section. One-way: cold
    /// groups always follow all hot groups in the final layout.
    pub fn begin_cold_section(&mut self) -> InsGroupId {
        self.cold = true;
        self.begin_block()
    }

    pub fn create_label(&mut self) -> BlockLabel {
        self.labels.push(None);
        BlockLabel(self.labels.len() as u32 - 1)
    }

    /// Binds `label` to a new group entered with the current GC state.
    pub fn bind_label(&mut self, label: BlockLabel) -> InsGroupId {
        let group = self.begin_block();
        self.bind_label_to(label, group);
        group
    }

    /// Binds `label` at a control-flow join whose entry state differs
    /// from the fall-through state, e.g. after a region only some
    /// predecessors run. The tracker continues from `state`.
    pub fn bind_label_with_state(&mut self, label: BlockLabel, state: GcState) -> InsGroupId {
        self.gc.set_state(state);
        self.bind_label(label)
    }

    fn bind_label_to(&mut self, label: BlockLabel, group: InsGroupId) {
        let slot = &mut self.labels[label.0 as usize];
        assert!(slot.is_none(), "label {:?} bound twice", label);
        *slot = Some(group);
    }

    /// GC suspension is disallowed until the matching `end_no_gc`.
    /// Regions nest.
    pub fn begin_no_gc(&mut self) {
        self.nogc_depth += 1;
    }

    pub fn end_no_gc(&mut self) {
        assert!(self.nogc_depth > 0, "unbalanced no-GC region");
        self.nogc_depth -= 1;
    }

    /// Appends a non-branch descriptor and applies its GC effects.
    pub fn append(&mut self, mut desc: InstrDesc) -> EmitResult<InstrId> {
        assert!(
            !desc.opcode.is_branch(),
            "branches go through emit_jump"
        );
        assert!(!desc.is_align(), "alignment goes through align_to");

        desc.enc_size = self.isa.instr_size(&desc);

        let no_gc = self.in_no_gc_region();
        if no_gc {
            desc.flags |= IF_NO_GC_INTERRUPT;
        }

        let is_call = matches!(desc.opcode, Opcode::Call | Opcode::CallReg);
        if is_call && !no_gc {
            desc.flags |= IF_SAFEPOINT;
        }

        let writes_reg1 = desc.writes_reg1();
        let reg1 = desc.reg1;
        let gc1 = desc.gc1;
        let payload = desc.payload;
        let safepoint = desc.has_flag(IF_SAFEPOINT) && !no_gc;

        let id = self.buffer.append(desc, self.gc.state())?;

        if writes_reg1 {
            if let Some(reg) = reg1 {
                self.gc.mark_register(reg, gc1.into());
            }
        }

        if let InstrPayload::Call {
            ret_gc, ret2_gc, ..
        } = payload
        {
            let (ret, ret2) = return_regs(self.config.arch);
            self.gc.mark_register(ret, ret_gc.into());
            self.gc.mark_register(ret2, ret2_gc.into());
        }

        if safepoint {
            self.gc.record_safepoint(id);
        }

        Ok(id)
    }

    /// Appends a branch to `label`. Starts in the long form; resolution
    /// shrinks it once distances are known.
    pub fn emit_jump(&mut self, cond: Option<CondCode>, label: BlockLabel) -> EmitResult<InstrId> {
        self.emit_jump_impl(cond, label, false)
    }

    /// Unconditional branch the resolver may delete when it targets the
    /// immediately following group.
    pub fn emit_removable_jump(&mut self, label: BlockLabel) -> EmitResult<InstrId> {
        self.emit_jump_impl(None, label, true)
    }

    fn emit_jump_impl(
        &mut self,
        cond: Option<CondCode>,
        label: BlockLabel,
        removable: bool,
    ) -> EmitResult<InstrId> {
        let opcode = if cond.is_some() {
            Opcode::JumpCond
        } else {
            Opcode::Jump
        };

        let mut desc = InstrDesc::new(opcode, OperandSize::Qword);
        desc.enc_size = self
            .isa
            .branch_form_info(cond.is_some(), BranchForm::Long)
            .size;
        if self.in_no_gc_region() {
            desc.flags |= IF_NO_GC_INTERRUPT;
        }

        let id = self.buffer.append(desc, self.gc.state())?;
        let group = self.buffer.cur_group_id();

        // target group patched in finish() once all labels are bound
        let mut jump = JumpDesc::new(id, group, InsGroupId(0), cond);
        jump.removable = removable;
        self.jumps.push(jump);
        self.jump_labels.push(label);

        if removable {
            self.buffer.group_mut(group).flags |= IGF_HAS_REMOVABLE_JMP;
        }

        Ok(id)
    }

    /// Requests alignment of the next instruction to `boundary` bytes.
    /// Sized at the worst case until layout computes the real padding.
    pub fn align_to(&mut self, boundary: u32) -> EmitResult<InstrId> {
        assert!(boundary.is_power_of_two());

        let mut desc = InstrDesc::new(Opcode::Align, OperandSize::Byte)
            .with_payload(InstrPayload::cns(boundary as i64));
        desc.enc_size = self.isa.align_max_pad(boundary);

        let id = self.buffer.append(desc, self.gc.state())?;
        let group = self.buffer.cur_group_id();
        self.buffer.group_mut(group).flags |= IGF_HAS_ALIGN;
        Ok(id)
    }

    // ---- literal pool ----------------------------------------------------

    pub fn add_f32_const(&mut self, value: f32) -> PoolId {
        self.pool.add_f32(value)
    }

    pub fn add_f64_const(&mut self, value: f64) -> PoolId {
        self.pool.add_f64(value)
    }

    pub fn add_i128_const(&mut self, value: u128) -> PoolId {
        self.pool.add_i128(value)
    }

    pub fn add_address_const(&mut self, value: u64) -> PoolId {
        self.pool.add_address(value)
    }

    /// Reserves a switch jump table; slots are filled with the targets'
    /// final addresses during layout. Returns the table's index.
    pub fn add_jump_table(&mut self, targets: Vec<BlockLabel>) -> u32 {
        assert!(!targets.is_empty());
        self.pending_jump_tables.push(targets);
        self.pending_jump_tables.len() as u32 - 1
    }

    // ---- debug info ------------------------------------------------------

    /// Attaches a disassembly annotation at the current position. No-op
    /// unless comment emission is configured.
    pub fn comment(&mut self, text: impl Into<String>) {
        if self.config.emit_comments {
            self.comments
                .push((self.buffer.instr_count() as u32, text.into()));
        }
    }

    pub fn var_start(&mut self, var: VarId, loc: VarLoc) {
        self.push_scope_event(ScopeEvent::Start(var, loc));
    }

    pub fn var_end(&mut self, var: VarId) {
        self.push_scope_event(ScopeEvent::End(var));
    }

    pub fn var_move(&mut self, var: VarId, loc: VarLoc) {
        self.push_scope_event(ScopeEvent::Move(var, loc));
    }

    /// Parameter homes are live from offset 0; call before appending any
    /// instruction.
    pub fn open_param_ranges(&mut self, params: &[(VarId, VarLoc)]) {
        assert_eq!(self.buffer.instr_count(), 0);
        for &(var, loc) in params {
            self.var_start(var, loc);
        }
    }

    /// Debuggable-code block entry: opens every variable of the block's
    /// lexical scope, including unreferenced ones.
    pub fn open_block_scopes(&mut self, vars: Vec<BlockScopeVar>) {
        assert!(!self.config.opts_enabled);
        self.push_scope_event(ScopeEvent::OpenBlock(vars));
    }

    pub fn close_block_scopes(&mut self, vars: Vec<VarId>) {
        assert!(!self.config.opts_enabled);
        self.push_scope_event(ScopeEvent::CloseBlock(vars));
    }

    fn push_scope_event(&mut self, event: ScopeEvent) {
        self.scope_events
            .push((self.buffer.instr_count() as u32, event));
    }

    // ---- finalization ----------------------------------------------------

    /// Resolves branches, fixes the layout, encodes the method, and
    /// registers the result with the host. Consumes the context; nothing
    /// can be appended afterwards.
    pub fn finish(self, host: &dyn CompilerHost) -> EmitResult<CodeDescriptor> {
        let MethodEmitter {
            config,
            isa,
            mut buffer,
            gc,
            mut jumps,
            jump_labels,
            labels,
            pending_jump_tables,
            mut pool,
            scope_events,
            comments,
            tracked_slot_offsets,
            nogc_depth,
            cold: _,
        } = self;

        assert_eq!(nogc_depth, 0, "unclosed no-GC region");

        let resolve = |label: BlockLabel| -> InsGroupId {
            labels[label.0 as usize].unwrap_or_else(|| panic!("unbound label {:?}", label))
        };

        for (jump, &label) in jumps.iter_mut().zip(&jump_labels) {
            jump.target = resolve(label);
            if buffer.group(jump.group).is_cold() != buffer.group(jump.target).is_cold() {
                jump.keep_long = true;
            }
        }

        for targets in pending_jump_tables {
            pool.add_jump_table(targets.into_iter().map(resolve).collect());
        }

        jump::resolve_jumps(&mut buffer, &mut jumps, isa)?;

        let ptr_size = config.ptr_width() as u32;
        let lay = layout::compute(&mut buffer, &pool, isa, ptr_size);

        let alloc = host.allocate_code_memory(
            lay.hot_size as usize,
            lay.cold_size as usize,
            lay.ro_data_size as usize,
            CODE_ALIGNMENT,
        );
        let hot_base = alloc.hot;
        let cold_base = alloc.cold;

        if lay.ro_data_size > 0 && isa.const_pool_adjacent() {
            // literal loads reach the pool pc-relative, so the host has
            // no placement freedom here
            let ro = alloc.ro_data.expect("read-only data without an allocation");
            assert_eq!(
                ro.to_usize(),
                hot_base.to_usize() + lay.pool_offset as usize,
                "literal pool must directly follow hot code"
            );
        }

        let (code, reloc_sites) = layout::encode(
            &buffer, &jumps, &lay, &pool, isa, ptr_size, hot_base, cold_base,
        );

        // safepoints: instruction-end offsets, in address order
        let mut pending: Vec<(u32, SafepointEntry)> = gc
            .safepoints()
            .iter()
            .map(|point| {
                let offset = lay.instr_offsets[point.instr.idx()]
                    + buffer.instr(point.instr).enc_size;

                let mut var_offsets: Vec<i32> = point
                    .live_var_indices
                    .iter()
                    .map(|&slot| tracked_slot_offsets[slot as usize])
                    .collect();
                var_offsets.sort_unstable();

                (
                    offset,
                    SafepointEntry {
                        gcref_regs: point.gcref_regs,
                        byref_regs: point.byref_regs,
                        gcref_var_offsets: var_offsets,
                    },
                )
            })
            .collect();
        pending.sort_by_key(|&(offset, _)| offset);

        let mut safepoints = SafepointTable::new();
        for (offset, entry) in pending {
            safepoints.insert(offset, entry);
        }

        // events were keyed by arena index; materialize to offsets
        let event_offset = |key: u32| -> u32 {
            if (key as usize) < lay.instr_offsets.len() {
                lay.instr_offsets[key as usize]
            } else {
                lay.end_offset()
            }
        };

        let mut scope = ScopeTracker::new(tracked_slot_offsets.len());
        let mut ordered_events: Vec<(u32, ScopeEvent)> = scope_events
            .into_iter()
            .map(|(key, event)| (event_offset(key), event))
            .collect();
        ordered_events.sort_by_key(|&(offset, _)| offset);

        for (offset, event) in ordered_events {
            match event {
                ScopeEvent::Start(var, loc) => scope.start_range(var, loc, offset),
                ScopeEvent::End(var) => scope.end_range(var, offset),
                ScopeEvent::Move(var, loc) => scope.move_range(var, loc, offset),
                ScopeEvent::OpenBlock(vars) => scope.open_scopes_for_block(&vars, offset),
                ScopeEvent::CloseBlock(vars) => scope.close_scopes_for_block(&vars, offset),
            }
        }
        let var_locations = scope.finish(lay.end_offset());

        let mut comment_table = crate::code::CommentTable::new();
        let mut ordered_comments: Vec<(u32, String)> = comments
            .into_iter()
            .map(|(key, text)| (event_offset(key), text))
            .collect();
        ordered_comments.sort_by_key(|&(offset, _)| offset);
        for (offset, text) in ordered_comments {
            comment_table.insert(offset, text);
        }

        let mut relocations = RelocationTable::new();
        let pool_end = lay.pool_offset + lay.ro_data_size;
        for &(site, target, kind) in &reloc_sites {
            relocations.insert(site, target, kind);

            // blob order is hot, pool, cold; each maps to its own base
            let site_addr = if site < lay.pool_offset {
                hot_base.offset(site as usize)
            } else if site < pool_end {
                alloc
                    .ro_data
                    .expect("pool relocation without a data allocation")
                    .offset((site - lay.pool_offset) as usize)
            } else {
                cold_base
                    .expect("cold relocation without a cold allocation")
                    .offset((site - pool_end) as usize)
            };
            host.record_relocation(site_addr, target, kind);
        }

        host.register_safepoint_table(hot_base, &safepoints);
        host.register_variable_location_table(hot_base, &var_locations);

        Ok(CodeDescriptor {
            code,
            hot_size: lay.hot_size as usize,
            cold_size: lay.cold_size as usize,
            ro_data_size: lay.ro_data_size as usize,
            safepoints,
            var_locations,
            comments: comment_table,
            relocations,
        })
    }
}

/// Integer return registers of the calling convention.
fn return_regs(arch: Arch) -> (Reg, Reg) {
    match arch {
        // RAX, RDX
        Arch::X64 => (Reg(0), Reg(2)),
        // X0, X1
        Arch::Arm64 => (Reg(0), Reg(1)),
    }
}
