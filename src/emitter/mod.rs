//! The two-pass machine-code emitter.
//!
//! Pass A walks the IR in block order, asking [`crate::regalloc::RegisterAllocator`]
//! for a host register per operand and emitting the corresponding host instructions
//! plus any load/spill work the allocator hands back. Exit instructions (`JmpJit`,
//! `JumpToStackWithOffsetAndDecrement`) are recorded as markers rather than emitted
//! directly, because their epilogue depends on the clobber set and spill-area size —
//! both of which are only fully known once Pass A has finished. Pass B expands those
//! markers (and prepends the prologue) once the final frame shape is known, then hands
//! the flat instruction list to `iced_x86::BlockEncoder` for relocation and encoding.
//!
//! Register identity inside this module is a small index (`0..POOL.len()`) into
//! [`HOST_POOL`], not a raw `iced_x86::Register` — the allocator only ever juggles
//! opaque `u32`s, and the table here is the one place that maps an index
//! back to the 8/16/32/64-bit views of the underlying physical register.

pub mod division;
pub mod stack;

use std::collections::HashMap;

use iced_x86::{BlockEncoder, BlockEncoderOptions, Code, Instruction, InstructionBlock, MemoryOperand, Register};

use crate::block::Block;
use crate::core_state::CoreState;
use crate::error::{CompileError, SimpleResult};
use crate::ir::{FlagTag, IrInstr, IrOpcode, IrProgram, IrReg, RegisterPointer};
use crate::regalloc::{AllocationResult, Eviction, RegisterAllocator, RequiredAction};
use crate::runtime;

/// Per-host-register 8/16/32/64-bit aliases, indexed by pool position.
#[derive(Debug, Clone, Copy)]
struct RegisterAliases {
    r8: Register,
    r16: Register,
    r32: Register,
    r64: Register,
}

/// Host general-purpose registers the allocator may hand out. Excludes `RSP` (the
/// host stack pointer), `R15` (reserved for the core-state base pointer), `R11`
/// (the emitter's primary scratch register), and `R10` (the emitter's secondary
/// scratch register, needed wherever two independent values must be combined into one
/// display/memory address — e.g. `dy * 64 + dx` — since neither operand of an `add`
/// can come from the allocator's own pool without risking a collision with whatever
/// virtual register already lives there).
const HOST_POOL: [RegisterAliases; 12] = [
    RegisterAliases { r8: Register::AL, r16: Register::AX, r32: Register::EAX, r64: Register::RAX },
    RegisterAliases { r8: Register::BL, r16: Register::BX, r32: Register::EBX, r64: Register::RBX },
    RegisterAliases { r8: Register::CL, r16: Register::CX, r32: Register::ECX, r64: Register::RCX },
    RegisterAliases { r8: Register::DL, r16: Register::DX, r32: Register::EDX, r64: Register::RDX },
    RegisterAliases { r8: Register::SIL, r16: Register::SI, r32: Register::ESI, r64: Register::RSI },
    RegisterAliases { r8: Register::DIL, r16: Register::DI, r32: Register::EDI, r64: Register::RDI },
    RegisterAliases { r8: Register::BPL, r16: Register::BP, r32: Register::EBP, r64: Register::RBP },
    RegisterAliases { r8: Register::R8L, r16: Register::R8W, r32: Register::R8D, r64: Register::R8 },
    RegisterAliases { r8: Register::R9L, r16: Register::R9W, r32: Register::R9D, r64: Register::R9 },
    RegisterAliases { r8: Register::R12L, r16: Register::R12W, r32: Register::R12D, r64: Register::R12 },
    RegisterAliases { r8: Register::R13L, r16: Register::R13W, r32: Register::R13D, r64: Register::R13 },
    RegisterAliases { r8: Register::R14L, r16: Register::R14W, r32: Register::R14D, r64: Register::R14 },
];

/// Pool indices whose use requires a prologue save / epilogue restore (callee-saved
/// under the SysV AMD64 ABI, same convention the allocator's `clobber_aware` set
/// tracks.
const CLOBBER_AWARE_INDICES: [u32; 5] = [1, 6, 9, 10, 11]; // RBX, RBP, R12, R13, R14

/// The reserved core-state base pointer, loaded from the block's single argument
/// (`rdi`) at entry and live for the whole block.
const CORE_BASE_REG: Register = Register::R15;

/// The emitter's private scratch register for multi-instruction sequences (runtime
/// calls, address computation). Never handed to the allocator. Used at its 64-bit
/// width for calls, immediate loads, and as a `MemoryOperand` index (it must match
/// `CORE_BASE_REG`'s width there); `SCRATCH_REG32` is the same physical register at
/// 32-bit width for the arithmetic that builds those indices — iced-x86 validates
/// operand register width against each `Code`'s operand kind, so the two must not be
/// used interchangeably.
const SCRATCH_REG: Register = Register::R11;
const SCRATCH_REG32: Register = Register::R11D;

/// A second private scratch register, same discipline as `SCRATCH_REG`/`SCRATCH_REG32`
/// but never combined with it in the same instruction — needed when a computation must
/// hold two independent intermediate values at once (see `HOST_POOL`'s doc comment).
const SCRATCH_REG2_32: Register = Register::R10D;
/// `SCRATCH_REG2_32`'s 8-bit view, for byte-wide loads (e.g. a display byte) that must
/// not alias a pool register the allocator could still consider live.
const SCRATCH_REG2_8: Register = Register::R10L;

fn host_reg(pool_index: u32) -> RegisterAliases {
    HOST_POOL[pool_index as usize]
}

/// An instruction the emitter has not yet turned into bytes: either a real host
/// instruction, or a marker expanded during Pass B once the frame shape is final.
enum EmitOp {
    Real(Instruction),
    /// A branch whose destination is a block index rather than a resolved address;
    /// Pass B patches in the real near-branch target once every block's final
    /// position is known.
    Branch(Instruction, usize),
    /// A `JmpJit`/`JumpToStackWithOffsetAndDecrement` exit: writeback + epilogue +
    /// return, expanded in Pass B with `return_pc` loaded into the return register.
    Exit { return_pc: ReturnPc },
}

/// Where Pass B should load the returned guest PC from at a given exit point.
#[derive(Clone, Copy)]
enum ReturnPc {
    Immediate(u16),
    /// The value currently held in this physical register (read before any epilogue
    /// pops run, so it must be a register the epilogue does not itself restore from).
    Register(Register),
}

/// A block of compiled host code, ready to run.
pub struct CompiledBlock {
    pub code: Vec<u8>,
    pub start_pc: u16,
}

impl CompiledBlock {
    /// Cast the compiled bytes to the native block ABI: a function taking the
    /// core-state pointer and returning the next guest PC.
    ///
    /// # Safety
    /// `self.code` must live in executable memory and `self` must outlive every call
    /// made through the returned pointer.
    pub unsafe fn entry_point(&self) -> unsafe extern "C" fn(*mut CoreState) -> u16 {
        std::mem::transmute::<*const u8, unsafe extern "C" fn(*mut CoreState) -> u16>(self.code.as_ptr())
    }
}

/// Tunables for compiled-code generation.
#[derive(Debug, Clone)]
pub struct JitOptions {
    /// Emit a `test rsp, 0xf` / `int3` guard before every `ret`.
    pub debug_stack_asserts: bool,
    /// Initial capacity hint for the spill-area bump allocator, in bytes.
    pub spill_area_hint: u32,
    /// Shrink the host register pool the allocator may hand out to its first `n`
    /// entries of [`HOST_POOL`] (in declaration order). `None` uses the full pool.
    /// Lowering this trades spill pressure for a smaller, more deterministic set of
    /// callee-saved registers a compiled block can touch; mainly useful for forcing
    /// eviction/spill paths in tests without needing sixteen live guest registers at
    /// once.
    pub host_register_limit: Option<usize>,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            debug_stack_asserts: true,
            spill_area_hint: 64,
            host_register_limit: None,
        }
    }
}

/// Emitter state, scoped to one compilation.
pub struct Emitter<'a> {
    program: &'a IrProgram,
    alloc: RegisterAllocator,
    options: &'a JitOptions,
    ops: Vec<EmitOp>,
    block_first_pos: HashMap<usize, usize>,
}

impl<'a> Emitter<'a> {
    fn new(program: &'a IrProgram, options: &'a JitOptions) -> Self {
        let pool_size = options.host_register_limit.unwrap_or(HOST_POOL.len()).min(HOST_POOL.len());
        let host_regs: Vec<u32> = (0..pool_size as u32).collect();
        let clobber_aware = CLOBBER_AWARE_INDICES.iter().copied().filter(|idx| host_regs.contains(idx)).collect();
        let alloc = RegisterAllocator::new(host_regs, clobber_aware);
        Self {
            program,
            alloc,
            options,
            ops: Vec::new(),
            block_first_pos: HashMap::new(),
        }
    }

    /// Run the full pipeline stage: liveness (regalloc pass 1), Pass A emission, Pass
    /// B frame finalization, host encode.
    pub fn compile(discovered: &Block, program: &IrProgram, options: &JitOptions) -> SimpleResult<CompiledBlock> {
        let mut emitter = Self::new(program, options);
        emitter.alloc.track(program, &program.reg_temps)?;
        emitter.emit_pass_a()?;
        emitter.finalize(discovered.start_pc)
    }

    fn push(&mut self, instr: Instruction) {
        self.ops.push(EmitOp::Real(instr));
    }

    fn order(&self) -> Vec<(usize, usize)> {
        crate::regalloc::flatten_order(self.program)
    }

    fn emit_pass_a(&mut self) -> SimpleResult<()> {
        let order = self.order();
        let mut last_block = usize::MAX;

        for (ir_index, &(block_idx, instr_idx)) in order.iter().enumerate() {
            if block_idx != last_block {
                // Every block is populated the moment it becomes active (the IR
                // builder never leaves one empty), so the position the next real
                // instruction lands at is exactly this block's entry point.
                self.block_first_pos.insert(block_idx, self.ops.len());
                last_block = block_idx;
            }
            let instr = self.program.blocks[block_idx].instrs[instr_idx].clone();
            self.emit_instr(&instr, ir_index as u32)?;
        }
        Ok(())
    }

    /// Request a host register for `reg`, emitting whatever load/spill work the
    /// allocator hands back, and return the chosen register's aliases.
    fn materialize(&mut self, reg: RegisterPointer, ir_index: u32, as_index: bool) -> SimpleResult<RegisterAliases> {
        let result = self.alloc.allocate(reg, ir_index)?;
        self.apply_evictions(&result.evictions);
        let aliases = host_reg(result.host_reg);
        if matches!(result.action, RequiredAction::Load) {
            self.emit_load(reg, aliases, as_index);
        }
        Ok(aliases)
    }

    fn apply_evictions(&mut self, evictions: &[Eviction]) {
        for ev in evictions {
            let aliases = host_reg(ev.host_reg);
            if let Some(guest_reg) = ev.writeback {
                self.emit_writeback(guest_reg, aliases);
            } else if let Some(slot) = ev.spill_slot {
                self.push(Instruction::with2(
                    Code::Mov_rm64_r64,
                    MemoryOperand::with_base_displ_size(Register::RSP, slot as i64, 1),
                    aliases.r64,
                ));
            }
        }
    }

    /// Load a virtual register's current value into `aliases` from its home location
    /// (a core-state field for guest-bound registers, a spill slot for temporaries
    /// that were previously evicted — the common case is neither, a fresh temporary
    /// whose "load" is really just "nothing to load", handled by the allocator
    /// returning `RequiredAction::None` so this is never called for it).
    fn emit_load(&mut self, reg: RegisterPointer, aliases: RegisterAliases, as_index: bool) {
        if let Some(&guest_reg) = self.program.reg_temps.iter().find(|(_, &id)| id == reg.reg).map(|(r, _)| r) {
            let (mem, width_reg) = self.guest_reg_operand(guest_reg, aliases);
            let code = if as_index || guest_reg == IrReg::Index {
                Code::Mov_r16_rm16
            } else {
                Code::Movzx_r32_rm8
            };
            self.push(Instruction::with2(code, width_reg, mem));
        } else {
            // A spilled temporary: reload from its bump-allocated slot. The allocator
            // only returns `Load` for a temporary here after it was first spilled, so
            // by construction a slot offset was recorded for it.
            let slot = self.spill_slot_for(reg.reg);
            self.push(Instruction::with2(
                Code::Mov_r64_rm64,
                aliases.r64,
                MemoryOperand::with_base_displ_size(Register::RSP, slot as i64, 1),
            ));
        }
    }

    fn emit_writeback(&mut self, guest_reg: IrReg, aliases: RegisterAliases) {
        let (mem, width_reg) = self.guest_reg_operand(guest_reg, aliases);
        let code = if guest_reg == IrReg::Index {
            Code::Mov_rm16_r16
        } else {
            Code::Mov_rm8_r8
        };
        self.push(Instruction::with2(code, mem, width_reg));
    }

    /// The core-state memory operand for a guest-bound register: `v[index]` for
    /// `V0..VF`, `index_register` for `Index`.
    fn guest_reg_memory(&self, guest_reg: IrReg) -> MemoryOperand {
        if guest_reg == IrReg::Index {
            MemoryOperand::with_base_displ_size(CORE_BASE_REG, CoreState::OFFSET_INDEX as i64, 1)
        } else {
            let idx = IrReg::GP.iter().position(|&r| r == guest_reg).expect("guest_reg is a GP register");
            MemoryOperand::with_base_displ_size(CORE_BASE_REG, CoreState::offset_of_register(idx) as i64, 1)
        }
    }

    /// The core-state memory operand and matching-width host register for a
    /// guest-bound register: `v[index]` for `V0..VF` (8-bit), `index_register` for
    /// `Index` (16-bit).
    fn guest_reg_operand(&self, guest_reg: IrReg, aliases: RegisterAliases) -> (MemoryOperand, Register) {
        let mem = self.guest_reg_memory(guest_reg);
        let width_reg = if guest_reg == IrReg::Index { aliases.r16 } else { aliases.r8 };
        (mem, width_reg)
    }

    /// The guest-bound register a virtual register stands for. Panics if `reg` is a
    /// plain temporary — only valid for operands the builder memoized via
    /// `temp_for`/`alloc_temp_for_reg`, never a `fresh()` temporary.
    fn guest_reg_for(&self, reg: RegisterPointer) -> IrReg {
        *self
            .program
            .reg_temps
            .iter()
            .find(|(_, &id)| id == reg.reg)
            .map(|(r, _)| r)
            .expect("operand is guest-bound")
    }

    fn spill_slot_for(&self, vreg: u32) -> u32 {
        self.alloc
            .spill_offset_of(vreg)
            .expect("a reload is only ever requested for a vreg that was previously spilled")
    }

    fn emit_instr(&mut self, ir: &IrInstr, ir_index: u32) -> SimpleResult<()> {
        use IrOpcode::*;
        match ir.code {
            LoadImmediate => {
                let dst = ir.vx.expect("LoadImmediate has vx");
                let is_index = self.is_index_reg(dst);
                let aliases = self.materialize(dst, ir_index, is_index)?;
                if ir.imm == 0 {
                    // Peephole: zero via self-xor rather than a literal move.
                    self.push(Instruction::with2(Code::Xor_r32_rm32, aliases.r32, aliases.r32));
                } else if is_index {
                    self.push(Instruction::with2(Code::Mov_r16_imm16, aliases.r16, ir.imm));
                } else {
                    self.push(Instruction::with2(Code::Mov_r8_imm8, aliases.r8, ir.imm));
                }
            }
            LoadReg => {
                let dst = ir.vx.expect("LoadReg has vx");
                let src = ir.vy.expect("LoadReg has vy");
                let is_index = self.is_index_reg(dst);
                let src_aliases = self.materialize(src, ir_index, is_index)?;
                let dst_aliases = self.materialize(dst, ir_index, is_index)?;
                if is_index {
                    self.push(Instruction::with2(Code::Mov_r16_rm16, dst_aliases.r16, src_aliases.r16));
                } else {
                    self.push(Instruction::with2(Code::Mov_r8_rm8, dst_aliases.r8, src_aliases.r8));
                }
            }
            AddImm | SubImm | AndImm => {
                let dst = ir.vx.expect("has vx");
                let src = ir.vy.expect("has vy");
                let is_index = self.is_index_reg(dst);
                let src_aliases = self.materialize(src, ir_index, is_index)?;
                let dst_aliases = self.materialize(dst, ir_index, is_index)?;
                if src_aliases.r8 != dst_aliases.r8 {
                    self.push(Instruction::with2(Code::Mov_r8_rm8, dst_aliases.r8, src_aliases.r8));
                }
                match (ir.code, ir.imm) {
                    (AddImm, 0) => {}
                    (AddImm, 1) => self.push(Instruction::with1(Code::Inc_rm8, dst_aliases.r8)),
                    (AddImm, imm) => self.push(Instruction::with2(Code::Add_rm8_imm8, dst_aliases.r8, imm)),
                    (SubImm, 0) => {}
                    (SubImm, imm) => self.push(Instruction::with2(Code::Sub_rm8_imm8, dst_aliases.r8, imm)),
                    (AndImm, imm) => self.push(Instruction::with2(Code::And_rm8_imm8, dst_aliases.r8, imm)),
                    _ => unreachable!(),
                }
            }
            MulImm | DivImm | ModImm => self.emit_mul_div_mod(ir, ir_index)?,
            ShrImm => {
                let dst = ir.vx.expect("has vx");
                let src = ir.vy.expect("has vy");
                let src_aliases = self.materialize(src, ir_index, false)?;
                let dst_aliases = self.materialize(dst, ir_index, false)?;
                if src_aliases.r8 != dst_aliases.r8 {
                    self.push(Instruction::with2(Code::Mov_r8_rm8, dst_aliases.r8, src_aliases.r8));
                }
                self.push(Instruction::with2(Code::Shr_rm8_imm8, dst_aliases.r8, ir.imm));
            }
            Add | Sub | SubInverse | OrRegReg | AndRegReg | XorRegReg | ShrOne | ShlOne => {
                self.emit_rmw(ir, ir_index)?
            }
            FlagRegisterCheck => self.emit_flag_check(ir, ir_index)?,
            JmpZ | JmpNZ => {
                let vx = ir.vx.expect("has vx");
                let aliases = self.materialize(vx, ir_index, false)?;
                self.push(Instruction::with2(Code::Test_rm8_r8, aliases.r8, aliases.r8));
                let code = if ir.code == JmpZ { Code::Je_rel32_64 } else { Code::Jne_rel32_64 };
                self.emit_branch(code, ir.target as usize);
            }
            JmpEqImm | JmpNeImm => {
                let vx = ir.vx.expect("has vx");
                let aliases = self.materialize(vx, ir_index, false)?;
                self.push(Instruction::with2(Code::Cmp_rm8_imm8, aliases.r8, ir.imm));
                let code = if ir.code == JmpEqImm { Code::Je_rel32_64 } else { Code::Jne_rel32_64 };
                self.emit_branch(code, ir.target as usize);
            }
            JmpEqReg | JmpNeReg => {
                let vx = ir.vx.expect("has vx");
                let vy = ir.vy.expect("has vy");
                let x_aliases = self.materialize(vx, ir_index, false)?;
                let y_aliases = self.materialize(vy, ir_index, false)?;
                self.push(Instruction::with2(Code::Cmp_r8_rm8, x_aliases.r8, y_aliases.r8));
                let code = if ir.code == JmpEqReg { Code::Je_rel32_64 } else { Code::Jne_rel32_64 };
                self.emit_branch(code, ir.target as usize);
            }
            JmpBlock => self.emit_branch(Code::Jmp_rel32_64, ir.target as usize),
            JmpJit => {
                // Every virtual register still resident in a host register must reach
                // the dispatcher in its canonical home (core state for guest-bound
                // registers) before this block's native code returns.
                self.spill_all_resident();
                self.ops.push(EmitOp::Exit {
                    return_pc: ReturnPc::Immediate(ir.target as u16),
                });
            }
            LoadByteFromI => {
                let index = ir.vx.expect("LoadByteFromI has vx (index)");
                let dst = ir.vy.expect("LoadByteFromI has vy (dest)");
                let index_aliases = self.materialize(index, ir_index, true)?;
                let dst_aliases = self.materialize(dst, ir_index, false)?;
                self.push(Instruction::with2(Code::Movzx_r32_rm16, SCRATCH_REG32, index_aliases.r16));
                let mem = MemoryOperand::with_base_index_displ_size(
                    CORE_BASE_REG,
                    SCRATCH_REG,
                    1,
                    CoreState::OFFSET_MEMORY as i64 + ir.imm as i64,
                    1,
                );
                self.push(Instruction::with2(Code::Mov_r8_rm8, dst_aliases.r8, mem));
            }
            ClearDisplayMemory => self.emit_clear_display(),
            XorDisplayMemory => self.emit_xor_display(ir, ir_index)?,
            CollisionAccumulate => self.emit_collision_accumulate(ir, ir_index)?,
            ReadStackOffset => {
                let dst = ir.vx.expect("has vx");
                let aliases = self.materialize(dst, ir_index, false)?;
                let mem = MemoryOperand::with_base_displ_size(
                    CORE_BASE_REG,
                    (CoreState::OFFSET_STACK + crate::emitter::stack::CallStack::offset_of_size()) as i64,
                    1,
                );
                self.push(Instruction::with2(Code::Movzx_r32_rm8, aliases.r32, mem));
            }
            WriteStackOffset => {
                let src = ir.vx.expect("has vx");
                let aliases = self.materialize(src, ir_index, false)?;
                let mem = MemoryOperand::with_base_displ_size(
                    CORE_BASE_REG,
                    (CoreState::OFFSET_STACK + crate::emitter::stack::CallStack::offset_of_size()) as i64,
                    1,
                );
                self.push(Instruction::with2(Code::Mov_rm8_r8, mem, aliases.r8));
            }
            WriteToStackWithOffset => {
                let idx = ir.vx.expect("has vx");
                let idx_aliases = self.materialize(idx, ir_index, false)?;
                self.push(Instruction::with2(Code::Movzx_r32_rm16, SCRATCH_REG32, idx_aliases.r16));
                self.push(Instruction::with1(Code::Shl_rm32_imm8, SCRATCH_REG32, 1u32));
                let mem = MemoryOperand::with_base_index_displ_size(
                    CORE_BASE_REG,
                    SCRATCH_REG,
                    1,
                    (CoreState::OFFSET_STACK + crate::emitter::stack::CallStack::offset_of_storage()) as i64,
                    1,
                );
                self.push(Instruction::with2(Code::Mov_rm16_imm16, mem, ir.imm));
            }
            JumpToStackWithOffsetAndDecrement => {
                let idx = ir.vx.expect("has vx (stack index)");
                let idx_aliases = self.materialize(idx, ir_index, false)?;
                self.push(Instruction::with2(Code::Movzx_r32_rm16, SCRATCH_REG32, idx_aliases.r16));
                self.push(Instruction::with1(Code::Shl_rm32_imm8, SCRATCH_REG32, 1u32));
                let mem = MemoryOperand::with_base_index_displ_size(
                    CORE_BASE_REG,
                    SCRATCH_REG,
                    1,
                    (CoreState::OFFSET_STACK + crate::emitter::stack::CallStack::offset_of_storage()) as i64,
                    1,
                );
                self.push(Instruction::with2(Code::Movzx_r32_rm16, idx_aliases.r32, mem));
                // `vy` (a fresh scratch the builder allocates alongside `idx`) carries
                // no value this emitter needs, but the allocator's liveness pass
                // recorded a write to it here — materialize it so the allocator's
                // resident bookkeeping matches what `track()` assumed.
                let scratch_vy = ir.vy.expect("JumpToStackWithOffsetAndDecrement has vy");
                self.materialize(scratch_vy, ir_index, false)?;
                // Flush every other resident register to its canonical home before
                // returning to the dispatcher. This evicts `idx`'s own virtual register
                // too, but eviction only emits a store instruction — it never clears the
                // physical register — so `idx_aliases.r16` below still holds the value
                // read from the stack above.
                self.spill_all_resident();
                self.ops.push(EmitOp::Exit {
                    return_pc: ReturnPc::Register(idx_aliases.r16),
                });
            }
            WriteToMemory | ReadFromMemory => self.emit_range_memory(ir, ir_index)?,
            ReadHostRandom => {
                let dst = ir.vx.expect("has vx");
                self.spill_all_resident();
                self.emit_call_runtime(runtime::rt_random_byte as usize, &[Arg::Imm8(ir.imm as u8)]);
                let dst_aliases = self.materialize(dst, ir_index, false)?;
                self.push(Instruction::with2(Code::Mov_r8_rm8, dst_aliases.r8, Register::AL));
            }
            WriteBcd => {
                let src = ir.vx.expect("has vx");
                // Spill every resident vreg to its canonical home *before* touching
                // SIL (a pool register another live vreg may still occupy), then
                // load the argument straight from that home — never through the pool.
                self.spill_all_resident();
                let mem = self.guest_reg_memory(self.guest_reg_for(src));
                self.push(Instruction::with2(Code::Mov_r8_rm8, Register::SIL, mem));
                self.emit_call_runtime(runtime::rt_write_bcd as usize, &[Arg::AlreadyInSil]);
            }
            ReadHostKeyScan => {
                let dst = ir.vx.expect("has vx");
                self.spill_all_resident();
                self.emit_call_runtime(runtime::rt_scan_pressed_key as usize, &[]);
                let dst_aliases = self.materialize(dst, ir_index, false)?;
                self.push(Instruction::with2(Code::Mov_r8_rm8, dst_aliases.r8, Register::AL));
            }
            ReadHostKeyState => {
                let src = ir.vx.expect("has vx");
                // Same ordering fix as `WriteBcd`: spill first, then load the key
                // index from its canonical home rather than through a pool register.
                self.spill_all_resident();
                let mem = self.guest_reg_memory(self.guest_reg_for(src));
                self.push(Instruction::with2(Code::Mov_r8_rm8, Register::SIL, mem));
                self.emit_call_runtime(runtime::rt_key_state as usize, &[Arg::AlreadyInSil]);
                self.push(Instruction::with2(Code::Test_rm8_r8, Register::AL, Register::AL));
                let want_pressed = ir.imm != 0;
                let code = if want_pressed { Code::Jne_rel32_64 } else { Code::Je_rel32_64 };
                self.emit_branch(code, ir.target as usize);
            }
            ReadHostTimer => {
                let dst = ir.vx.expect("has vx");
                self.spill_all_resident();
                self.emit_call_runtime(runtime::rt_read_timer as usize, &[Arg::Imm8(ir.imm as u8)]);
                let dst_aliases = self.materialize(dst, ir_index, false)?;
                self.push(Instruction::with2(Code::Mov_r8_rm8, dst_aliases.r8, Register::AL));
            }
            WriteHostTimer => {
                let src = ir.vx.expect("has vx");
                // Same ordering fix as `WriteBcd`: spill first, then load the value
                // from its canonical home rather than through a pool register.
                self.spill_all_resident();
                let mem = self.guest_reg_memory(self.guest_reg_for(src));
                self.push(Instruction::with2(Code::Mov_r8_rm8, Register::DL, mem));
                self.emit_call_runtime(runtime::rt_write_timer as usize, &[Arg::Imm8(ir.imm as u8), Arg::AlreadyInDl]);
            }
        }
        Ok(())
    }

    fn is_index_reg(&self, reg: RegisterPointer) -> bool {
        self.program
            .reg_temps
            .get(&IrReg::Index)
            .map(|&id| id == reg.reg)
            .unwrap_or(false)
    }

    fn emit_rmw(&mut self, ir: &IrInstr, ir_index: u32) -> SimpleResult<()> {
        let dst = ir.vx.expect("has vx");
        let src = ir.vy.expect("has vy");
        let src_aliases = self.materialize(src, ir_index, false)?;
        let dst_aliases = self.materialize(dst, ir_index, false)?;
        use IrOpcode::*;
        match ir.code {
            Add => self.push(Instruction::with2(Code::Add_rm8_r8, dst_aliases.r8, src_aliases.r8)),
            Sub => self.push(Instruction::with2(Code::Sub_rm8_r8, dst_aliases.r8, src_aliases.r8)),
            SubInverse => {
                // vx := vy - vx: negate then add, so the flag left behind still
                // reflects a subtraction for the paired FlagRegisterCheck.
                self.push(Instruction::with1(Code::Neg_rm8, dst_aliases.r8));
                self.push(Instruction::with2(Code::Add_rm8_r8, dst_aliases.r8, src_aliases.r8));
            }
            OrRegReg => self.push(Instruction::with2(Code::Or_rm8_r8, dst_aliases.r8, src_aliases.r8)),
            AndRegReg => self.push(Instruction::with2(Code::And_rm8_r8, dst_aliases.r8, src_aliases.r8)),
            XorRegReg => self.push(Instruction::with2(Code::Xor_rm8_r8, dst_aliases.r8, src_aliases.r8)),
            ShrOne => self.push(Instruction::with2(Code::Shr_rm8_imm8, dst_aliases.r8, 1u32)),
            ShlOne => self.push(Instruction::with2(Code::Shl_rm8_imm8, dst_aliases.r8, 1u32)),
            _ => unreachable!(),
        }
        Ok(())
    }

    fn emit_flag_check(&mut self, ir: &IrInstr, ir_index: u32) -> SimpleResult<()> {
        let vf = ir.vx.expect("FlagRegisterCheck has vx (VF)");
        // Flag elision: if the allocator reports VF's next access as
        // write-only, the value about to be written is dead before it's ever read —
        // skip materializing a host register and emitting the flag move entirely.
        if self.alloc.next_access_is_write_only(vf.reg, ir_index, vf.is_temp) {
            return Ok(());
        }
        let aliases = self.materialize(vf, ir_index, false)?;
        let tag = ir.flag_tag.expect("FlagRegisterCheck carries a tag");
        // `setcc` reads the flags the preceding arithmetic IR instruction left behind;
        // zeroing the destination first (the usual "break the false dependency" move)
        // would itself clobber those flags, so the 8-bit `setcc` write is the only
        // instruction here — VF is never read through anything wider than its `r8`
        // view, so the stale upper bits of its host register are never observed.
        let code = match tag {
            FlagTag::AddCarry => Code::Setb_rm8,
            FlagTag::SubXyBorrow => Code::Setb_rm8,
            FlagTag::SubYxNoBorrow => Code::Setae_rm8,
            FlagTag::ShrOut | FlagTag::ShlOut => Code::Setb_rm8,
        };
        self.push(Instruction::with1(code, aliases.r8));
        Ok(())
    }

    fn emit_mul_div_mod(&mut self, ir: &IrInstr, ir_index: u32) -> SimpleResult<()> {
        let dst = ir.vx.expect("has vx");
        let src = ir.vy.expect("has vy");
        let src_aliases = self.materialize(src, ir_index, false)?;
        let dst_aliases = self.materialize(dst, ir_index, false)?;
        match ir.code {
            IrOpcode::MulImm => {
                self.push(Instruction::with2(Code::Movzx_r32_rm8, dst_aliases.r32, src_aliases.r8));
                self.push(Instruction::with3(Code::Imul_r32_rm32_imm32, dst_aliases.r32, dst_aliases.r32, ir.imm));
            }
            IrOpcode::DivImm | IrOpcode::ModImm => {
                // Magic-number division: replace `n / d` with
                // `(n * mul) >> shift`, never a hardware `div`.
                let table = division::division_table();
                let magic = table[(ir.imm as usize).min(255)];
                self.push(Instruction::with2(Code::Movzx_r32_rm8, SCRATCH_REG32, src_aliases.r8));
                self.push(Instruction::with3(Code::Imul_r32_rm32_imm32, SCRATCH_REG32, SCRATCH_REG32, magic.mul as u32));
                self.push(Instruction::with2(Code::Shr_rm32_imm8, SCRATCH_REG32, magic.shift as u32));
                if ir.code == IrOpcode::ModImm {
                    // remainder = n - (n / d) * d
                    self.push(Instruction::with3(Code::Imul_r32_rm32_imm32, SCRATCH_REG32, SCRATCH_REG32, ir.imm));
                    self.push(Instruction::with2(Code::Movzx_r32_rm8, dst_aliases.r32, src_aliases.r8));
                    self.push(Instruction::with2(Code::Sub_rm32_r32, dst_aliases.r32, SCRATCH_REG32));
                } else {
                    self.push(Instruction::with2(Code::Mov_r32_rm32, dst_aliases.r32, SCRATCH_REG32));
                }
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Sprite-draw display write: XOR the single display byte at `(dx, dy)` against
    /// the sprite bit. `dx`/`dy` have already been range-masked by the
    /// IR builder's `AndImm` + `JmpNZ` guard, so this only ever touches in-bounds
    /// display bytes.
    fn emit_xor_display(&mut self, ir: &IrInstr, ir_index: u32) -> SimpleResult<()> {
        let dx = ir.vx.expect("has vx");
        let dy = ir.vy.expect("has vy");
        let dx_aliases = self.materialize(dx, ir_index, false)?;
        let dy_aliases = self.materialize(dy, ir_index, false)?;
        self.push(Instruction::with2(Code::Movzx_r32_rm8, SCRATCH_REG32, dy_aliases.r8));
        self.push(Instruction::with1(Code::Shl_rm32_imm8, SCRATCH_REG32, 6u32)); // * DISPLAY_WIDTH
        self.push(Instruction::with2(Code::Movzx_r32_rm8, SCRATCH_REG2_32, dx_aliases.r8));
        self.push(Instruction::with2(Code::Add_rm32_r32, SCRATCH_REG32, SCRATCH_REG2_32));
        // The bit is either 0 or 1 in the low bit of dx/dy's scratch computation in
        // the IR builder's caller; here we just XOR a constant `1` pixel byte.
        let mem = MemoryOperand::with_base_index_displ_size(
            CORE_BASE_REG,
            SCRATCH_REG,
            1,
            CoreState::OFFSET_DISPLAY as i64,
            1,
        );
        self.push(Instruction::with2(Code::Xor_rm8_imm8, mem, 1u32));
        Ok(())
    }

    /// Collision tracking for sprite draw:
    /// `vf |= old_pixel & new_bit`, evaluated just before the XOR flips the pixel.
    fn emit_collision_accumulate(&mut self, ir: &IrInstr, ir_index: u32) -> SimpleResult<()> {
        let dx = ir.vx.expect("has vx");
        let dy = ir.vy.expect("has vy");
        let dx_aliases = self.materialize(dx, ir_index, false)?;
        let dy_aliases = self.materialize(dy, ir_index, false)?;
        let vf = RegisterPointer { is_temp: false, reg: ir.imm2 };
        let vf_aliases = self.materialize(vf, ir_index, false)?;

        self.push(Instruction::with2(Code::Movzx_r32_rm8, SCRATCH_REG32, dy_aliases.r8));
        self.push(Instruction::with1(Code::Shl_rm32_imm8, SCRATCH_REG32, 6u32));
        self.push(Instruction::with2(Code::Movzx_r32_rm8, SCRATCH_REG2_32, dx_aliases.r8));
        self.push(Instruction::with2(Code::Add_rm32_r32, SCRATCH_REG32, SCRATCH_REG2_32));
        let mem = MemoryOperand::with_base_index_displ_size(
            CORE_BASE_REG,
            SCRATCH_REG,
            1,
            CoreState::OFFSET_DISPLAY as i64,
            1,
        );
        // Reuse SCRATCH_REG2's byte view for the loaded pixel: SCRATCH_REG2_32 is dead
        // after being folded into the address above, and neither AL nor any pool
        // register may be clobbered here without the allocator's knowledge.
        self.push(Instruction::with2(Code::Mov_r8_rm8, SCRATCH_REG2_8, mem));
        self.push(Instruction::with2(Code::Or_rm8_r8, vf_aliases.r8, SCRATCH_REG2_8));
        Ok(())
    }

    fn emit_clear_display(&mut self) {
        // Widest-SIMD-available clear: zero XMM0, then stream 128
        // 16-byte stores covering the 2048-byte display (a 256-bit YMM path would
        // halve the store count on AVX-capable hosts; omitted here since emitting
        // VEX-encoded stores needs a capability probe this crate has no home for).
        self.push(Instruction::with2(Code::Pxor_xmm_xmmm128, iced_x86::Register::XMM0, iced_x86::Register::XMM0));
        for i in 0..(crate::consts::DISPLAY_SIZE / 16) {
            let mem = MemoryOperand::with_base_displ_size(
                CORE_BASE_REG,
                CoreState::OFFSET_DISPLAY as i64 + (i * 16) as i64,
                1,
            );
            self.push(Instruction::with2(Code::Movdqu_rm128_xmm, mem, iced_x86::Register::XMM0));
        }
    }

    /// `Fx55`/`Fx65`: bulk copy between `V0..=Vx` and `memory[I..]`. `x` is a
    /// compile-time immediate (the opcode's own register-count nibble), so the loop
    /// is unrolled rather than emitted as a runtime loop, and `I` advances by `x + 1`
    /// per the original semantics (it is not restored afterward).
    fn emit_range_memory(&mut self, ir: &IrInstr, ir_index: u32) -> SimpleResult<()> {
        let count = ir.imm as u8 + 1;
        let index_ptr = RegisterPointer {
            is_temp: false,
            reg: *self.program.reg_temps.get(&IrReg::Index).expect("Index is always memoized"),
        };
        let index_aliases = self.materialize(index_ptr, ir_index, true)?;
        self.push(Instruction::with2(Code::Movzx_r32_rm16, SCRATCH_REG32, index_aliases.r16));

        for reg_idx in 0..count {
            let vreg = RegisterPointer {
                is_temp: false,
                reg: *self.program.reg_temps.get(&IrReg::from_index(reg_idx)).expect("memoized"),
            };
            let aliases = self.materialize(vreg, ir_index, false)?;
            let mem = MemoryOperand::with_base_index_displ_size(
                CORE_BASE_REG,
                SCRATCH_REG,
                1,
                CoreState::OFFSET_MEMORY as i64 + reg_idx as i64,
                1,
            );
            if ir.code == IrOpcode::WriteToMemory {
                self.push(Instruction::with2(Code::Mov_rm8_r8, mem, aliases.r8));
            } else {
                self.push(Instruction::with2(Code::Mov_r8_rm8, aliases.r8, mem));
            }
        }

        self.push(Instruction::with2(Code::Add_rm16_imm8, index_aliases.r16, count as u32));
        Ok(())
    }

    fn emit_branch(&mut self, code: Code, target_block: usize) {
        // The real target is unknown until Pass B has walked the whole program and
        // assigned every instruction its final position; `with_branch` takes a dummy
        // destination here and `finalize` patches it in once that's known.
        let instr = Instruction::with_branch(code, 0);
        self.ops.push(EmitOp::Branch(instr, target_block));
    }

    /// Evict every resident virtual register before a runtime-helper call, since the
    /// call clobbers every caller-saved host register per the SysV ABI. Guest-bound
    /// values are flushed to core state; temporaries get a spill slot. This mirrors
    /// the allocator's own eviction bookkeeping but forces it for
    /// every resident register rather than only the expired ones.
    fn spill_all_resident(&mut self) {
        let residents: Vec<u32> = self.alloc.resident().keys().copied().collect();
        for vreg in residents {
            let evictions = self.alloc.force_evict(vreg);
            self.apply_evictions(&evictions);
        }
    }

    fn emit_call_runtime(&mut self, target: usize, args: &[Arg]) {
        self.push(Instruction::with2(Code::Mov_r64_rm64, Register::RDI, CORE_BASE_REG));
        for arg in args {
            match arg {
                Arg::Imm8(v) => self.push(Instruction::with2(Code::Mov_r32_imm32, Register::ESI, *v as u32)),
                Arg::AlreadyInSil | Arg::AlreadyInDl => {}
            }
        }
        self.push(Instruction::with2(Code::Mov_r64_imm64, SCRATCH_REG, target as u64));
        self.push(Instruction::with1(Code::Call_rm64, SCRATCH_REG));
    }

    /// Pass B: now that the clobber set and frame size are final, prepend the
    /// prologue, expand every `EmitOp::Exit` into a concrete epilogue, resolve each
    /// `EmitOp::Branch`'s block-index target against the position its block actually
    /// landed at, and hand the flat instruction list to `BlockEncoder`.
    fn finalize(mut self, start_pc: u16) -> SimpleResult<CompiledBlock> {
        let mut clobbered: Vec<u32> = self.alloc.clobbered().iter().copied().collect();
        clobbered.sort_unstable();

        // The prologue's `push r15` plus one push per clobbered register must leave
        // `rsp` 16-byte aligned before the spill-area `sub` (so every `call` emitted
        // in the block body lands on an aligned `rsp`, per the SysV AMD64 ABI). `push
        // r15` alone restores alignment (the caller leaves `rsp + 8 ≡ 0 (mod 16)` at
        // entry), so an *odd* number of additional clobbered-register pushes would
        // leave `rsp` 8 bytes short; pad the frame by one slot to compensate.
        let clobber_pad = if clobbered.len() % 2 == 1 { 8 } else { 0 };
        let frame_size = align_up(next_spill_size(&self.alloc), 16) + clobber_pad;

        // Invert `block_first_pos` (block index -> position in the pre-expansion
        // `self.ops`) so the walk below can tell, at each `self.ops` index, which
        // block (if any) starts there.
        let mut pos_to_block: HashMap<usize, usize> = HashMap::new();
        for (&block_idx, &ops_idx) in &self.block_first_pos {
            pos_to_block.insert(ops_idx, block_idx);
        }

        let mut final_ops: Vec<Instruction> = Vec::with_capacity(self.ops.len() + 16);

        // Prologue: stash the caller's r15, install the core-state pointer from the
        // sole argument register, push every clobbered callee-saved register, then
        // reserve the spill area.
        final_ops.push(Instruction::with1(Code::Push_r64, CORE_BASE_REG));
        final_ops.push(Instruction::with2(Code::Mov_r64_rm64, CORE_BASE_REG, Register::RDI));
        for &idx in &clobbered {
            final_ops.push(Instruction::with1(Code::Push_r64, host_reg(idx).r64));
        }
        if frame_size > 0 {
            final_ops.push(Instruction::with2(Code::Sub_rm64_imm32, Register::RSP, frame_size));
        }

        let mut block_final_pos: HashMap<usize, usize> = HashMap::new();
        let mut branch_patches: Vec<(usize, usize)> = Vec::new();

        for (ops_idx, op) in std::mem::take(&mut self.ops).into_iter().enumerate() {
            if let Some(&block_idx) = pos_to_block.get(&ops_idx) {
                block_final_pos.insert(block_idx, final_ops.len());
            }
            match op {
                EmitOp::Real(instr) => final_ops.push(instr),
                EmitOp::Branch(instr, target_block) => {
                    branch_patches.push((final_ops.len(), target_block));
                    final_ops.push(instr);
                }
                EmitOp::Exit { return_pc } => {
                    self.emit_epilogue(&mut final_ops, &clobbered, frame_size, return_pc);
                }
            }
        }

        // Every IR block ends in an explicit exit (`JmpJit` or the stack-exit
        // opcode); this trap is unreachable in practice and exists only so a
        // malformed program faults instead of running into whatever bytes follow.
        final_ops.push(Instruction::with(Code::Ud2));

        // Sequential pseudo-IP per final instruction; stable from here on, so the
        // positions `block_final_pos`/`branch_patches` recorded above still hold.
        for (i, instr) in final_ops.iter_mut().enumerate() {
            instr.set_ip(i as u64);
        }
        for (branch_pos, target_block) in branch_patches {
            let target_pos = *block_final_pos
                .get(&target_block)
                .expect("a branch's target block was emitted somewhere in pass A");
            let target_ip = final_ops[target_pos].ip();
            final_ops[branch_pos].set_near_branch64(target_ip);
        }

        let block = InstructionBlock::new(&final_ops, 0);
        let result = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)
            .map_err(|e| CompileError::EmitFailed(e.to_string()))?;

        Ok(CompiledBlock {
            code: result.code_buffer,
            start_pc,
        })
    }

    fn emit_epilogue(&self, out: &mut Vec<Instruction>, clobbered: &[u32], frame_size: u32, return_pc: ReturnPc) {
        match return_pc {
            ReturnPc::Immediate(pc) => out.push(Instruction::with2(Code::Mov_r32_imm32, Register::EAX, pc as u32)),
            ReturnPc::Register(reg) if reg != Register::AX => {
                out.push(Instruction::with2(Code::Movzx_r32_rm16, Register::EAX, reg))
            }
            ReturnPc::Register(_) => {}
        }
        if frame_size > 0 {
            out.push(Instruction::with2(Code::Add_rm64_imm32, Register::RSP, frame_size));
        }
        for &idx in clobbered.iter().rev() {
            out.push(Instruction::with1(Code::Pop_r64, host_reg(idx).r64));
        }
        out.push(Instruction::with1(Code::Pop_r64, CORE_BASE_REG));
        if self.options.debug_stack_asserts {
            // By this point every push the prologue made has been popped back off, so
            // `rsp` must equal its value at block entry — and the SysV AMD64 ABI
            // guarantees `rsp + 8 ≡ 0 (mod 16)` there (the caller's `call` pushed an
            // 8-byte return address onto its own 16-aligned `rsp`), not `rsp` itself.
            // Check `rsp + 8` rather than `rsp` directly, via the scratch register
            // (never part of the clobber set, so it's free here and the about-to-be-
            // returned PC in `eax` is left untouched).
            //
            // The skip target is the `retnq` pushed right after this block; since
            // `out` is the very vector `finalize` later assigns sequential IPs over
            // in place, that position is already known here and needs no deferral.
            out.push(Instruction::with2(
                Code::Lea_r64_m,
                SCRATCH_REG,
                MemoryOperand::with_base_displ_size(Register::RSP, 8i64, 1),
            ));
            out.push(Instruction::with2(Code::Test_rm64_imm32, SCRATCH_REG, 0xFu32));
            let je_idx = out.len();
            out.push(Instruction::with_branch(Code::Je_rel32_64, 0));
            out.push(Instruction::with(Code::Int3));
            let skip_target = out.len() as u64;
            out[je_idx].set_near_branch64(skip_target);
        }
        out.push(Instruction::with(Code::Retnq));
    }
}

enum Arg {
    Imm8(u8),
    AlreadyInSil,
    AlreadyInDl,
}

fn next_spill_size(alloc: &RegisterAllocator) -> u32 {
    alloc.spill_area_size()
}

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_pool_excludes_reserved_registers() {
        for aliases in HOST_POOL {
            assert_ne!(aliases.r64, CORE_BASE_REG);
            assert_ne!(aliases.r64, SCRATCH_REG);
            assert_ne!(aliases.r64, Register::RSP);
        }
    }

    #[test]
    fn clobber_aware_indices_are_in_bounds() {
        for &idx in &CLOBBER_AWARE_INDICES {
            assert!((idx as usize) < HOST_POOL.len());
        }
    }
}
