use smelt_emit::{
    Arch, CallTarget, CondCode, EmitConfig, GcType, InstrDesc, InstrPayload, MethodEmitter,
    Opcode, OperandSize, PointerKind, RecordingHost, Reg, RelocationKind, VarId, VarLoc,
};

const RBP: Reg = Reg(5);

fn nop(emitter: &mut MethodEmitter) {
    emitter
        .append(InstrDesc::new(Opcode::Nop, OperandSize::Byte))
        .unwrap();
}

fn ret(emitter: &mut MethodEmitter) {
    emitter
        .append(InstrDesc::new(Opcode::Ret, OperandSize::Qword))
        .unwrap();
}

fn call_direct(addr: u64, ret_gc: GcType) -> InstrDesc {
    InstrDesc::new(Opcode::Call, OperandSize::Qword).with_payload(InstrPayload::Call {
        target: CallTarget::Direct(addr),
        ret_gc,
        ret2_gc: GcType::None,
        arg_slots: 0,
    })
}

#[test]
fn test_simple_method_end_to_end() {
    let config = EmitConfig::new(Arch::X64);
    let mut emitter = MethodEmitter::new(&config, vec![-8]);

    // prolog: push rbp
    emitter
        .append(InstrDesc::new(Opcode::Push, OperandSize::Qword).with_reg(RBP, GcType::None))
        .unwrap();
    emitter.end_prolog();

    emitter.gc().mark_register(Reg(1), PointerKind::GcRef);
    emitter.gc().mark_variable_live(0);
    emitter.append(call_direct(0x7000, GcType::None)).unwrap();

    emitter.begin_epilog();
    emitter
        .append(InstrDesc::new(Opcode::Pop, OperandSize::Qword).with_reg(RBP, GcType::None))
        .unwrap();
    ret(&mut emitter);

    let host = RecordingHost::new();
    let code = emitter.finish(&host).unwrap();

    // push(1) call(5) pop(1) ret(1)
    assert_eq!(code.hot_size, 8);
    assert_eq!(code.cold_size, 0);
    assert_eq!(code.ro_data_size, 0);
    assert_eq!(code.code.len(), 8);
    assert_eq!(code.code[0], 0x55);
    assert_eq!(code.code[1], 0xE8);
    assert_eq!(code.code[6], 0x5D);
    assert_eq!(code.code[7], 0xC3);

    // one safepoint, at the call's return offset
    let entry = code.safepoints.get(6).unwrap();
    assert!(entry.gcref_regs.contains(Reg(1)));
    assert!(entry.byref_regs.is_empty());
    assert_eq!(entry.gcref_var_offsets, vec![-8]);
    assert!(code.safepoints.get(0).is_none());

    // call target relocation at the rel32 site
    assert_eq!(code.relocations.len(), 1);
    let &(site, target, kind) = code.relocations.iter().next().unwrap();
    assert_eq!(site, 2);
    assert_eq!(target.to_usize(), 0x7000);
    assert_eq!(kind, RelocationKind::CodeTarget);

    // host saw the allocation, the tables, and the relocation
    assert_eq!(host.allocations.read().len(), 1);
    let hot_base = host.allocations.read()[0].0;
    assert_eq!(host.safepoint_tables.read()[0], (hot_base, 1));
    assert_eq!(host.relocations.read().len(), 1);
}

#[test]
fn test_forward_branch_shrink_cascade() {
    // the first jump reaches its target only through the second one's
    // bytes; both must end up short
    let config = EmitConfig::new(Arch::X64);
    let mut emitter = MethodEmitter::new(&config, Vec::new());
    emitter.end_prolog();

    let exit = emitter.create_label();
    emitter.emit_jump(None, exit).unwrap();
    emitter.begin_block();
    for _ in 0..122 {
        nop(&mut emitter);
    }
    emitter.emit_jump(None, exit).unwrap();
    emitter.bind_label(exit);
    ret(&mut emitter);

    let host = RecordingHost::new();
    let code = emitter.finish(&host).unwrap();

    // 2 + 122 + 2 + 1: both branches shrank from 5 to 2 bytes
    assert_eq!(code.hot_size, 127);
    assert_eq!(code.code[0], 0xEB);
    assert_eq!(code.code[1], 124); // rel8 to the ret
    assert_eq!(code.code[124], 0xEB);
    assert_eq!(code.code[125], 0);
    assert_eq!(code.code[126], 0xC3);
}

#[test]
fn test_conditional_branch_stays_long_when_out_of_range() {
    let config = EmitConfig::new(Arch::X64);
    let mut emitter = MethodEmitter::new(&config, Vec::new());
    emitter.end_prolog();

    let exit = emitter.create_label();
    emitter.emit_jump(Some(CondCode::Equal), exit).unwrap();
    emitter.begin_block();
    for _ in 0..200 {
        nop(&mut emitter);
    }
    emitter.bind_label(exit);
    ret(&mut emitter);

    let host = RecordingHost::new();
    let code = emitter.finish(&host).unwrap();

    // jcc rel32 (6) + 200 + ret
    assert_eq!(code.hot_size, 207);
    assert_eq!(code.code[0], 0x0F);
    assert_eq!(code.code[1], 0x84);
}

#[test]
fn test_removable_jump_to_fallthrough_is_deleted() {
    let config = EmitConfig::new(Arch::X64);
    let mut emitter = MethodEmitter::new(&config, Vec::new());
    emitter.end_prolog();

    for _ in 0..3 {
        nop(&mut emitter);
    }
    let next = emitter.create_label();
    emitter.emit_removable_jump(next).unwrap();
    emitter.bind_label(next);
    ret(&mut emitter);

    let host = RecordingHost::new();
    let code = emitter.finish(&host).unwrap();

    // the jump vanished entirely
    assert_eq!(code.hot_size, 4);
    assert_eq!(code.code, vec![0x90, 0x90, 0x90, 0xC3]);
}

#[test]
fn test_gc_state_survives_group_splits() {
    // enough descriptors to force several capacity splits; the safepoint
    // at the end must still see the registers marked at the start
    let config = EmitConfig::new(Arch::X64);
    let mut emitter = MethodEmitter::new(&config, Vec::new());
    emitter.end_prolog();

    emitter.gc().mark_register(Reg(3), PointerKind::GcRef);
    emitter.gc().mark_register(Reg(6), PointerKind::Byref);

    for _ in 0..300 {
        nop(&mut emitter);
    }
    emitter.append(call_direct(0x9000, GcType::None)).unwrap();

    let host = RecordingHost::new();
    let code = emitter.finish(&host).unwrap();

    assert_eq!(code.safepoints.len(), 1);
    let (offset, entry) = code.safepoints.iter().next().unwrap();
    assert_eq!(*offset, 305);
    assert!(entry.gcref_regs.contains(Reg(3)));
    assert!(entry.byref_regs.contains(Reg(6)));
    assert!(!entry.gcref_regs.intersects(entry.byref_regs));
}

#[test]
fn test_variable_location_ranges() {
    let config = EmitConfig::new(Arch::X64);
    let mut emitter = MethodEmitter::new(&config, Vec::new());
    emitter.open_param_ranges(&[(VarId(0), VarLoc::Reg(Reg(7)))]);

    emitter
        .append(InstrDesc::new(Opcode::Push, OperandSize::Qword).with_reg(RBP, GcType::None))
        .unwrap();
    emitter.end_prolog();

    for _ in 0..4 {
        nop(&mut emitter);
    }
    // spill: the variable moves to the frame at offset 5
    emitter.var_move(
        VarId(0),
        VarLoc::Stack {
            base: RBP,
            offset: 8,
        },
    );
    for _ in 0..3 {
        nop(&mut emitter);
    }
    ret(&mut emitter);

    let host = RecordingHost::new();
    let code = emitter.finish(&host).unwrap();
    assert_eq!(code.hot_size, 9);

    let ranges = code.var_locations.ranges_for(VarId(0));
    assert_eq!(ranges.len(), 2);
    assert_eq!((ranges[0].begin, ranges[0].end), (0, 5));
    assert_eq!(ranges[0].loc, VarLoc::Reg(Reg(7)));
    assert_eq!((ranges[1].begin, ranges[1].end), (5, 9));
    assert_eq!(
        ranges[1].loc,
        VarLoc::Stack {
            base: RBP,
            offset: 8,
        }
    );
}

#[test]
fn test_jump_table_in_literal_pool() {
    let config = EmitConfig::new(Arch::X64);
    let mut emitter = MethodEmitter::new(&config, Vec::new());
    emitter.end_prolog();

    let case0 = emitter.create_label();
    let case1 = emitter.create_label();
    emitter.add_jump_table(vec![case0, case1]);
    emitter.add_f64_const(2.5);

    emitter.bind_label(case0);
    nop(&mut emitter);
    emitter.bind_label(case1);
    ret(&mut emitter);

    let host = RecordingHost::new();
    let code = emitter.finish(&host).unwrap();

    assert_eq!(code.hot_size, 2);
    // f64 at pool offset 0, two 8-byte slots at 8 and 16
    assert_eq!(code.ro_data_size, 24);
    // pool starts at the 16-aligned end of hot code
    assert_eq!(code.code.len(), 16 + 24);
    assert_eq!(&code.code[16..24], &2.5f64.to_bits().to_le_bytes());

    // the host was asked for hot code and read-only data separately and
    // placed the pool right after the hot section
    let allocations = host.allocations.read().clone();
    assert_eq!(allocations.len(), 2);
    let (hot_base, hot_size) = allocations[0];
    let (ro_base, ro_size) = allocations[1];
    assert_eq!(hot_size, 2);
    assert_eq!(ro_size, 24);
    assert_eq!(ro_base.to_usize(), hot_base.to_usize() + 16);

    let relocs: Vec<_> = code.relocations.iter().cloned().collect();
    assert_eq!(relocs.len(), 2);
    assert_eq!(relocs[0].0, 24);
    assert_eq!(relocs[0].1.to_usize(), hot_base.to_usize());
    assert_eq!(relocs[0].2, RelocationKind::JumpTableEntry(0));
    assert_eq!(relocs[1].0, 32);
    assert_eq!(relocs[1].1.to_usize(), hot_base.to_usize() + 1);
    assert_eq!(relocs[1].2, RelocationKind::JumpTableEntry(1));

    // the host's patch sites are addresses inside the data allocation
    let host_relocs = host.relocations.read().clone();
    assert_eq!(host_relocs[0].0.to_usize(), ro_base.to_usize() + 8);
    assert_eq!(host_relocs[1].0.to_usize(), ro_base.to_usize() + 16);

    // slots already hold the absolute case addresses
    let slot0 = u64::from_le_bytes(code.code[24..32].try_into().unwrap());
    assert_eq!(slot0 as usize, hot_base.to_usize());
}

#[test]
fn test_comments_only_when_configured() {
    let config = EmitConfig::debuggable(Arch::X64);
    let mut emitter = MethodEmitter::new(&config, Vec::new());
    emitter.comment("prolog");
    nop(&mut emitter);
    emitter.end_prolog();
    emitter.comment("body");
    ret(&mut emitter);

    let host = RecordingHost::new();
    let code = emitter.finish(&host).unwrap();
    assert_eq!(code.comments.get(0), vec!["prolog"]);
    assert_eq!(code.comments.get(1), vec!["body"]);

    let config = EmitConfig::new(Arch::X64);
    let mut emitter = MethodEmitter::new(&config, Vec::new());
    emitter.comment("dropped");
    nop(&mut emitter);

    let code = emitter.finish(&host).unwrap();
    assert!(code.comments.get(0).is_empty());
}

#[test]
fn test_arm64_method() {
    let config = EmitConfig::new(Arch::Arm64);
    let mut emitter = MethodEmitter::new(&config, Vec::new());
    emitter.end_prolog();

    let exit = emitter.create_label();
    emitter.emit_jump(Some(CondCode::Equal), exit).unwrap();
    nop(&mut emitter);
    emitter.bind_label(exit);
    ret(&mut emitter);

    let host = RecordingHost::new();
    let code = emitter.finish(&host).unwrap();

    // b.eq(4) nop(4) ret(4): the conditional branch shrank to one word
    assert_eq!(code.hot_size, 12);
    let word = |idx: usize| u32::from_le_bytes(code.code[idx..idx + 4].try_into().unwrap());
    assert_eq!(word(0), 0x5400_0040); // b.eq +8
    assert_eq!(word(4), 0xD503_201F); // nop
    assert_eq!(word(8), 0xD65F_03C0); // ret
}

#[test]
fn test_cold_section_branch_keeps_long_form() {
    let config = EmitConfig::new(Arch::X64);
    let mut emitter = MethodEmitter::new(&config, Vec::new());
    emitter.end_prolog();

    let slow_path = emitter.create_label();
    let resume = emitter.create_label();
    emitter.emit_jump(Some(CondCode::Equal), slow_path).unwrap();
    emitter.bind_label(resume);
    ret(&mut emitter);

    emitter.begin_cold_section();
    emitter.bind_label(slow_path);
    nop(&mut emitter);
    emitter.emit_jump(None, resume).unwrap();

    let host = RecordingHost::new();
    let code = emitter.finish(&host).unwrap();

    // hot: jcc rel32 (6) + ret; cold: nop + jmp rel32 (5)
    assert_eq!(code.hot_size, 7);
    assert_eq!(code.cold_size, 6);
    assert_eq!(host.allocations.read().len(), 2);

    // cross-section distances use the host's section bases
    let hot_base = host.allocations.read()[0].0.to_usize() as i64;
    let cold_base = host.allocations.read()[1].0.to_usize() as i64;

    let cold_bytes = &code.code[code.code.len() - 6..];
    assert_eq!(cold_bytes[0], 0x90);
    assert_eq!(cold_bytes[1], 0xE9);
    let rel = i32::from_le_bytes(cold_bytes[2..6].try_into().unwrap()) as i64;
    // jmp starts at cold offset 1; rel32 is relative to its end
    assert_eq!((cold_base + 1) + 5 + rel, hot_base + 6);
}
