//! End-to-end scenarios covering discovery, lowering, allocation, and emission as one
//! pipeline, plus a couple of structural checks on the IR shape the builder produces
//! for control-flow-bearing guest sequences.

use std::collections::{BTreeSet, HashMap};

use test_case::test_case;

use chip8_jit::block::{discover_block, Block};
use chip8_jit::emitter::{CompiledBlock, Emitter, JitOptions};
use chip8_jit::ir::{BlockHandle, IrBlock, IrBuilder, IrInstr, IrOpcode, IrProgram, IrReg, RegisterPointer};
use chip8_jit::regalloc::RegisterAllocator;
use chip8_jit::{core_load, core_new, core_run, CoreState, HostCollaborator};

fn host_stopped_after_one_step() -> StopAfter {
    StopAfter { remaining_steps: 0 }
}

/// A host collaborator that lets the dispatcher run a fixed number of blocks before
/// asking it to stop. Plain `NullHost` with `stop_requested` set up front only works
/// for single-block scenarios — call/return and similar sequences span more than one
/// dispatcher iteration before the guest program counter settles.
struct StopAfter {
    remaining_steps: u32,
}

impl HostCollaborator for StopAfter {
    fn publish_display(&mut self, _snapshot: &[u8]) {}

    fn stop(&mut self) -> bool {
        if self.remaining_steps == 0 {
            true
        } else {
            self.remaining_steps -= 1;
            false
        }
    }

    fn on_finished(&mut self) {}
}

fn memory_with(bytes: &[u8]) -> Vec<u8> {
    let mut mem = vec![0u8; 0x1000];
    mem[0x200..0x200 + bytes.len()].copy_from_slice(bytes);
    mem
}

/// Surface the cache's `tracing::debug!`/`trace!` spans on test failure instead of
/// swallowing them, same pattern as `wilsonzlin-aero`'s `net_e2e` integration test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn block_compilation_emits_tracing_spans() {
    init_tracing();
    let (mut core, mut cache) = core_new(None);
    core_load(&mut core, &[0x60, 0x05, 0x70, 0x03]);
    let mut host = host_stopped_after_one_step();
    core_run(&mut core, &mut cache, &mut host).expect("no compilation error");
    assert_eq!(core.v[0], 8);
}

/// Map the compiled bytes executable and call into them directly, bypassing the block
/// cache. Used only for the divmod scenario, whose IR is synthesized by hand rather
/// than decoded from guest bytes.
fn execute_compiled(core: &mut CoreState, code: &[u8]) -> u16 {
    unsafe {
        let len = code.len().max(1);
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        assert_ne!(ptr, libc::MAP_FAILED, "mmap failed");
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr as *mut u8, code.len());
        let rc = libc::mprotect(ptr, len, libc::PROT_READ | libc::PROT_EXEC);
        assert_eq!(rc, 0, "mprotect failed");
        let entry: unsafe extern "C" fn(*mut CoreState) -> u16 = std::mem::transmute(ptr);
        let next_pc = entry(core as *mut CoreState);
        libc::munmap(ptr, len);
        next_pc
    }
}

// Scenario 1: LoadImm + AddImm, no terminator follows.

#[test_case(0x05, 0x03, 8)]
#[test_case(0xFF, 0x02, 1)] // wraps past 255
#[test_case(0x00, 0x00, 0)]
fn scenario_1_load_imm_and_add_imm(load_imm: u8, add_imm: u8, expected: u8) {
    let (mut core, mut cache) = core_new(None);
    core_load(&mut core, &[0x60, load_imm, 0x70, add_imm]);
    let mut host = host_stopped_after_one_step();
    core_run(&mut core, &mut cache, &mut host).expect("no compilation error");

    assert_eq!(core.v[0], expected);
    // No terminator in the guest sequence: the builder pads with a self-targeting
    // exit rather than leaving the compiled block without a return.
    assert_eq!(core.program_counter, 0x204);
}

#[test]
fn scenario_1_uses_a_single_guest_bound_temporary_and_no_spills() {
    let mem = memory_with(&[0x60, 0x05, 0x70, 0x03]);
    let discovered = discover_block(&mem, 0x200);
    let program = IrBuilder::build(&discovered).expect("lowers");

    assert_eq!(program.reg_temps.len(), 1);
    assert!(program.reg_temps.contains_key(&IrReg::V0));

    let mut alloc = RegisterAllocator::new((0..4).collect(), Vec::new());
    alloc.track(&program, &program.reg_temps).expect("tracks liveness");
    assert_eq!(alloc.spill_area_size(), 0);
}

// Scenario 2: skip-eq-imm, taken.

#[test]
fn scenario_2_skip_eq_imm_taken_executes() {
    let (mut core, mut cache) = core_new(None);
    core_load(&mut core, &[0x60, 0x0A, 0x30, 0x0A, 0x60, 0xFF, 0x60, 0x01]);
    let mut host = host_stopped_after_one_step();
    core_run(&mut core, &mut cache, &mut host).expect("no compilation error");

    assert_eq!(core.v[0], 1);
}

#[test]
fn scenario_2_the_skipped_instruction_lowers_exactly_once() {
    let mem = memory_with(&[0x60, 0x0A, 0x30, 0x0A, 0x60, 0xFF, 0x60, 0x01]);
    let discovered = discover_block(&mem, 0x200);
    assert!(discovered.local_labels.contains(&0x206));

    let program = IrBuilder::build(&discovered).expect("lowers");
    // Pre-skip block: `V0 := 10`, the compare-and-branch, and the conditionally
    // skipped `V0 := 0xFF`. Post-skip block: `V0 := 1` plus the padded exit.
    assert_eq!(program.blocks.len(), 2);

    let load_immediate_count = program.blocks[0]
        .instrs
        .iter()
        .filter(|i| matches!(i.code, IrOpcode::LoadImmediate))
        .count();
    assert_eq!(load_immediate_count, 2, "V0 := 10 and the skipped V0 := 0xFF, each lowered once");
}

// Scenario 3: self-loop jump. Structural only — the compiled unit never returns, so
// nothing here actually calls into it.

#[test]
fn scenario_3_self_loop_jump_is_two_blocks_with_no_exit() {
    let mem = memory_with(&[0x60, 0x00, 0x70, 0x01, 0x12, 0x02]);
    let discovered = discover_block(&mem, 0x200);
    assert!(discovered.local_labels.contains(&0x202));

    let program = IrBuilder::build(&discovered).expect("lowers");
    assert_eq!(program.blocks.len(), 2);

    let has_jmp_jit = program.blocks.iter().flat_map(|b| b.instrs.iter()).any(|i| matches!(i.code, IrOpcode::JmpJit));
    assert!(!has_jmp_jit, "a jump target inside the same unit never needs to leave compiled code");

    let loops_to_self = program.blocks[1]
        .instrs
        .iter()
        .any(|i| matches!(i.code, IrOpcode::JmpBlock) && i.target == 1);
    assert!(loops_to_self);
}

// Scenario 4: call / return round trip.

#[test]
fn scenario_4_call_return_round_trip() {
    let (mut core, mut cache) = core_new(None);
    core_load(&mut core, &[0x22, 0x04, 0x00, 0x00, 0x60, 0x2A, 0x00, 0xEE]);
    // Two dispatcher iterations: the call block, then the callee's load + return.
    let mut host = StopAfter { remaining_steps: 1 };
    core_run(&mut core, &mut cache, &mut host).expect("no compilation error");

    assert_eq!(core.v[0], 0x2A);
    assert_eq!(core.program_counter, 0x202);
}

// Scenario 5: sprite draw into a clear display.

#[test]
fn scenario_5_sprite_draw_into_clear_display_has_no_collision() {
    let (mut core, mut cache) = core_new(None);
    core.memory[0x200] = 0xD0;
    core.memory[0x201] = 0x11;
    core.memory[0x300] = 0xFF;
    core.index_register = 0x300;
    core.program_counter = 0x200;

    let mut host = host_stopped_after_one_step();
    core_run(&mut core, &mut cache, &mut host).expect("no compilation error");

    assert_eq!(&core.display.pixels[0..8], &[1u8; 8]);
    assert_eq!(core.v[0xF], 0);
}

// Scenario 6: immediate divmod via the magic-constant table. CHIP-8 has no hardware
// divmod instruction, so this IR is synthesized directly rather than decoded from
// guest bytes, matching how the pipeline would lower a future opcode that needed one.

fn run_mod_imm(numerator: u8, divisor: u8) -> u8 {
    let mut reg_temps = HashMap::new();
    reg_temps.insert(IrReg::V0, 0);
    let v0 = RegisterPointer { is_temp: false, reg: 0 };

    let mut load = IrInstr::new(IrOpcode::LoadImmediate);
    load.vx = Some(v0);
    load.imm = numerator as u32;

    let mut modulo = IrInstr::new(IrOpcode::ModImm);
    modulo.vx = Some(v0);
    modulo.vy = Some(v0);
    modulo.imm = divisor as u32;

    let mut exit = IrInstr::new(IrOpcode::JmpJit);
    exit.target = 0x200;

    let program = IrProgram {
        blocks: vec![IrBlock {
            instrs: vec![load, modulo, exit],
        }],
        entry: BlockHandle(0),
        reg_temps,
    };
    let discovered = Block {
        start_pc: 0x200,
        instrs: Vec::new(),
        local_labels: BTreeSet::new(),
    };
    let compiled: CompiledBlock = Emitter::compile(&discovered, &program, &JitOptions::default()).expect("compiles");

    let mut core = CoreState::new_pinned();
    execute_compiled(&mut core, &compiled.code);
    core.v[0]
}

#[test_case(200, 7, 4)]
#[test_case(10, 3, 1)]
#[test_case(0, 5, 0)]
#[test_case(255, 1, 0)]
fn scenario_6_immediate_divmod_via_magic_constants(numerator: u8, divisor: u8, expected: u8) {
    assert_eq!(run_mod_imm(numerator, divisor), expected);
}

// Beyond the six named scenarios: register pressure exceeding the host pool forces at
// least one eviction-with-writeback cycle through the real allocator and emitter.

#[test]
fn sixteen_guest_registers_round_trip_through_eviction_and_writeback() {
    let mut bytes = Vec::new();
    for reg in 0u8..16 {
        bytes.push(0x60 | reg);
        bytes.push(reg + 1);
    }

    let (mut core, mut cache) = core_new(None);
    core_load(&mut core, &bytes);
    let mut host = host_stopped_after_one_step();
    core_run(&mut core, &mut cache, &mut host).expect("no compilation error");

    for reg in 0u8..16 {
        assert_eq!(core.v[reg as usize], reg + 1);
    }
}

// Fx0A (WaitKeyPress): the compiled block must re-enter at the same guest address while
// no key is held, and only advance once the host sets one.

#[test]
fn wait_key_press_blocks_until_a_key_is_held_then_advances_and_stores_it() {
    let (mut core, mut cache) = core_new(None);
    core_load(&mut core, &[0xF0, 0x0A]);

    let mut host = host_stopped_after_one_step();
    core_run(&mut core, &mut cache, &mut host).expect("no compilation error");
    assert_eq!(core.program_counter, 0x200, "no key held yet: re-enters the same instruction");
    assert_eq!(core.v[0], 0);

    core.key_state[7] = true;
    let mut host = host_stopped_after_one_step();
    core_run(&mut core, &mut cache, &mut host).expect("no compilation error");
    assert_eq!(core.v[0], 7);
    assert_eq!(core.program_counter, 0x202, "advances past Fx0A once a key is found");
}

// The IR builder has no lowering for `Bnnn` (jump to nnn + V0) — it is decoded fine but
// left as a hard compilation error rather than silently miscompiled, per the error
// taxonomy's "no recoverable path once the IR builder has the instruction" rule.
#[test]
fn unhandled_opcode_aborts_the_run_with_a_compile_error() {
    use chip8_jit::CompileError;

    let (mut core, mut cache) = core_new(None);
    core_load(&mut core, &[0xB2, 0x00]); // jump to (0x200 + V0)
    let mut host = host_stopped_after_one_step();

    let err = core_run(&mut core, &mut cache, &mut host).expect_err("Bnnn has no lowering");
    assert!(matches!(err, CompileError::UnhandledOpcode(_)));
}

// Regression: a runtime-call opcode (`WriteBcd`/`ReadHostKeyState`/`WriteHostTimer`) must
// not clobber a guest register that happens to be resident in the caller-saved pool
// register (`SIL`/`DL`) its argument gets loaded into. The host pool is limited to five
// entries so allocation order is deterministic (first vreg materialized takes pool index
// 4 = `RSI`, second takes index 3 = `RDX`, third takes index 2 = `RCX`). Each test also
// reads the victim register again *after* the runtime call, which is what keeps it
// resident (rather than already evicted by the ordinary liveness-expiry path) right up
// to the call — without that later read, the victim's live range would end before the
// call and it would've been safely flushed before any clobber could happen.
fn pressured_options() -> JitOptions {
    JitOptions {
        host_register_limit: Some(5),
        ..JitOptions::default()
    }
}

#[test]
fn write_bcd_does_not_corrupt_a_register_resident_in_the_argument_pool_slot() {
    // V0 (victim) is materialized first -> RSI, the exact register `WriteBcd`'s
    // argument is loaded into. V1 (BCD source) is materialized second -> RDX.
    let mut reg_temps = HashMap::new();
    reg_temps.insert(IrReg::V0, 0);
    reg_temps.insert(IrReg::V1, 1);
    let v0 = RegisterPointer { is_temp: false, reg: 0 };
    let v1 = RegisterPointer { is_temp: false, reg: 1 };
    let sink = RegisterPointer { is_temp: true, reg: 2 };

    let mut load_v0 = IrInstr::new(IrOpcode::LoadImmediate);
    load_v0.vx = Some(v0);
    load_v0.imm = 0x2A;

    let mut load_v1 = IrInstr::new(IrOpcode::LoadImmediate);
    load_v1.vx = Some(v1);
    load_v1.imm = 123;

    let mut bcd = IrInstr::new(IrOpcode::WriteBcd);
    bcd.vx = Some(v1);

    // Keeps V0 alive past the BCD call; without this its live range would end at
    // `load_v0` and it would be evicted (correctly) before the call even runs.
    let mut keep_v0_alive = IrInstr::new(IrOpcode::LoadReg);
    keep_v0_alive.vx = Some(sink);
    keep_v0_alive.vy = Some(v0);

    let mut exit = IrInstr::new(IrOpcode::JmpJit);
    exit.target = 0x200;

    let program = IrProgram {
        blocks: vec![IrBlock {
            instrs: vec![load_v0, load_v1, bcd, keep_v0_alive, exit],
        }],
        entry: BlockHandle(0),
        reg_temps,
    };
    let discovered = Block {
        start_pc: 0x200,
        instrs: Vec::new(),
        local_labels: BTreeSet::new(),
    };
    let compiled = Emitter::compile(&discovered, &program, &pressured_options()).expect("compiles");

    let mut core = CoreState::new_pinned();
    core.index_register = 0x300;
    execute_compiled(&mut core, &compiled.code);

    assert_eq!(core.v[0], 0x2A, "V0 must survive the BCD call untouched");
    assert_eq!(&core.memory[0x300..0x303], &[1, 2, 3]);
}

#[test]
fn write_host_timer_does_not_corrupt_a_register_resident_in_the_argument_pool_slot() {
    // `WriteHostTimer`'s argument lands in `DL` (pool index 3), not `SIL`, so the
    // timer source (V1) is materialized first -> RSI, and V0 (victim) second -> RDX,
    // the exact register the argument load would otherwise clobber in place.
    let mut reg_temps = HashMap::new();
    reg_temps.insert(IrReg::V1, 1);
    reg_temps.insert(IrReg::V0, 0);
    let v1 = RegisterPointer { is_temp: false, reg: 1 };
    let v0 = RegisterPointer { is_temp: false, reg: 0 };
    let sink = RegisterPointer { is_temp: true, reg: 2 };

    let mut load_v1 = IrInstr::new(IrOpcode::LoadImmediate);
    load_v1.vx = Some(v1);
    load_v1.imm = 9;

    let mut load_v0 = IrInstr::new(IrOpcode::LoadImmediate);
    load_v0.vx = Some(v0);
    load_v0.imm = 0x2A;

    let mut set_delay = IrInstr::new(IrOpcode::WriteHostTimer);
    set_delay.vx = Some(v1);
    set_delay.imm = 0; // delay timer, not sound

    // Keeps V0 alive past the timer-write call; see the BCD test above for why.
    let mut keep_v0_alive = IrInstr::new(IrOpcode::LoadReg);
    keep_v0_alive.vx = Some(sink);
    keep_v0_alive.vy = Some(v0);

    let mut exit = IrInstr::new(IrOpcode::JmpJit);
    exit.target = 0x200;

    let program = IrProgram {
        blocks: vec![IrBlock {
            instrs: vec![load_v1, load_v0, set_delay, keep_v0_alive, exit],
        }],
        entry: BlockHandle(0),
        reg_temps,
    };
    let discovered = Block {
        start_pc: 0x200,
        instrs: Vec::new(),
        local_labels: BTreeSet::new(),
    };
    let compiled = Emitter::compile(&discovered, &program, &pressured_options()).expect("compiles");

    let mut core = CoreState::new_pinned();
    execute_compiled(&mut core, &compiled.code);

    assert_eq!(core.v[0], 0x2A, "V0 must survive the timer-write call untouched");
    assert_eq!(core.delay_timer, 9);
}

#[test]
fn read_host_key_state_does_not_corrupt_a_register_resident_in_the_argument_pool_slot() {
    // V0 (victim) is materialized first -> RSI, the exact register `ReadHostKeyState`'s
    // argument is loaded into. V1 (key index) is materialized second -> RDX. The check
    // wants key 7 "pressed"; `core.key_state` defaults to all-unheld, so the branch is
    // not taken and execution falls through into the register that keeps V0 alive.
    let mut reg_temps = HashMap::new();
    reg_temps.insert(IrReg::V0, 0);
    reg_temps.insert(IrReg::V1, 1);
    let v0 = RegisterPointer { is_temp: false, reg: 0 };
    let v1 = RegisterPointer { is_temp: false, reg: 1 };
    let sink = RegisterPointer { is_temp: true, reg: 2 };

    let mut load_v0 = IrInstr::new(IrOpcode::LoadImmediate);
    load_v0.vx = Some(v0);
    load_v0.imm = 0x2A;

    let mut load_v1 = IrInstr::new(IrOpcode::LoadImmediate);
    load_v1.vx = Some(v1);
    load_v1.imm = 7; // key index to check; core.key_state defaults to all-unheld

    let mut key_check = IrInstr::new(IrOpcode::ReadHostKeyState);
    key_check.vx = Some(v1);
    key_check.imm = 1; // "pressed" check: branches to block 1 only if key 7 is held
    key_check.target = 1;

    // Keeps V0 alive past the key-state call; see the BCD test above for why. Only
    // reached on the (here, taken) fallthrough path, which is what the test wants.
    let mut keep_v0_alive = IrInstr::new(IrOpcode::LoadReg);
    keep_v0_alive.vx = Some(sink);
    keep_v0_alive.vy = Some(v0);

    let mut fallthrough_exit = IrInstr::new(IrOpcode::JmpJit);
    fallthrough_exit.target = 0x200;

    let mut branch_exit = IrInstr::new(IrOpcode::JmpJit);
    branch_exit.target = 0x200;

    let program = IrProgram {
        blocks: vec![
            IrBlock {
                instrs: vec![load_v0, load_v1, key_check, keep_v0_alive, fallthrough_exit],
            },
            IrBlock {
                instrs: vec![branch_exit],
            },
        ],
        entry: BlockHandle(0),
        reg_temps,
    };
    let discovered = Block {
        start_pc: 0x200,
        instrs: Vec::new(),
        local_labels: BTreeSet::new(),
    };
    let compiled = Emitter::compile(&discovered, &program, &pressured_options()).expect("compiles");

    let mut core = CoreState::new_pinned();
    execute_compiled(&mut core, &compiled.code);

    assert_eq!(core.v[0], 0x2A, "V0 must survive the key-state call untouched");
}
