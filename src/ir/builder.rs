//! Lowers a discovered guest [`Block`] into a graph of mid-IR blocks.
//!
//! A flat vector of IR blocks, an "active block" index (never an aliasing reference,
//! since the builder mutates `blocks` while lowering), a virtual-register pool with
//! memoized guest-bound temporaries, and the deferred `block_switch_counter`
//! discipline that lets a skip's compare and its paired "skipped" instruction still
//! land in the pre-skip block before the post-skip block becomes active.

use std::collections::HashMap;

use crate::block::{Block, PositionedInstr};
use crate::decoder::InstructionKind;
use crate::error::{CompileError, SimpleResult};

use super::opcode::{FlagTag, IrInstr, IrOpcode, IrReg, RegisterAccessInfo, RegisterPointer};

/// One node of the IR block graph: a flat, ordered list of [`IrInstr`].
#[derive(Debug, Default)]
pub struct IrBlock {
    pub instrs: Vec<IrInstr>,
}

impl IrBlock {
    fn push(&mut self, instr: IrInstr) {
        self.instrs.push(instr);
    }
}

/// An index into [`IrProgram::blocks`]. Never aliased; copied freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle(pub usize);

/// The output of lowering one discovered guest block: the full IR block graph plus
/// which block is the entry.
#[derive(Debug)]
pub struct IrProgram {
    pub blocks: Vec<IrBlock>,
    pub entry: BlockHandle,
    /// Each guest-bound register's memoized temporary id, handed to the allocator so
    /// it knows which virtual registers require core-state writeback at eviction.
    pub reg_temps: HashMap<IrReg, u32>,
}

/// Lowering state, scoped to a single compilation.
pub struct IrBuilder {
    blocks: Vec<IrBlock>,
    active: usize,
    temp_id: u32,
    reg_temps: HashMap<IrReg, u32>,
    pc_to_block: HashMap<u16, usize>,
    block_switch_counter: u32,
    block_to_switch_to: Option<usize>,
}

impl IrBuilder {
    fn new() -> Self {
        let entry = IrBlock::default();
        Self {
            blocks: vec![entry],
            active: 0,
            temp_id: 0,
            reg_temps: HashMap::new(),
            pc_to_block: HashMap::new(),
            block_switch_counter: 0,
            block_to_switch_to: None,
        }
    }

    fn new_temp(&mut self) -> u32 {
        let id = self.temp_id;
        self.temp_id += 1;
        id
    }

    fn temp_for(&mut self, reg: IrReg) -> RegisterPointer {
        let id = *self.reg_temps.entry(reg).or_insert_with(|| {
            let id = self.temp_id;
            self.temp_id += 1;
            id
        });
        RegisterPointer { is_temp: false, reg: id }
    }

    fn fresh(&mut self) -> RegisterPointer {
        RegisterPointer {
            is_temp: true,
            reg: self.new_temp(),
        }
    }

    fn new_block(&mut self) -> BlockHandle {
        self.blocks.push(IrBlock::default());
        BlockHandle(self.blocks.len() - 1)
    }

    fn use_block(&mut self, handle: BlockHandle) {
        self.active = handle.0;
    }

    fn emit(&mut self, instr: IrInstr) {
        self.blocks[self.active].push(instr);
    }

    /// Lower a fully discovered guest block into an [`IrProgram`].
    pub fn build(discovered: &Block) -> SimpleResult<IrProgram> {
        let mut b = Self::new();
        let entry = BlockHandle(0);

        let mut i = 0;
        while i < discovered.instrs.len() {
            let positioned = discovered.instrs[i];

            if discovered.local_labels.contains(&positioned.pc) && !b.pc_to_block.contains_key(&positioned.pc) {
                let handle = b.new_block();
                b.use_block(handle);
                b.pc_to_block.insert(positioned.pc, handle.0);
            }

            if b.block_switch_counter > 0 {
                b.block_switch_counter -= 1;
                if b.block_switch_counter == 0 {
                    if let Some(target) = b.block_to_switch_to.take() {
                        b.use_block(BlockHandle(target));
                    }
                }
            }

            b.lower_one(discovered, &positioned, i)?;
            i += 1;
        }

        // The discoverer can stop at end-of-stream without ever hitting a real
        // terminator (decode ran off the end of memory). The active block's
        // instruction stream then has no exit, which would leave the emitter with no
        // epilogue to fall into. Pad with a self-targeting `JmpJit` so the dispatcher
        // re-fetches at the next address instead of running off the end of the block.
        if block_needs_exit(&b.blocks[b.active]) {
            let fallthrough_pc = discovered
                .instrs
                .last()
                .map(|p| p.pc.wrapping_add(2))
                .unwrap_or(discovered.start_pc);
            pad_with_exit(&mut b.blocks[b.active], fallthrough_pc);
        }

        // A skip whose paired "skipped" instruction was the very last thing the
        // discoverer saw (nothing decodes at the post-skip address) leaves its target
        // block registered but never activated — `block_switch_counter` never reached
        // zero. That block is otherwise unreachable from the emitter's perspective
        // except as a branch target, so it still needs to exist and exit cleanly.
        if let Some(pending) = b.block_to_switch_to.take() {
            if block_needs_exit(&b.blocks[pending]) {
                let pending_pc = b
                    .pc_to_block
                    .iter()
                    .find(|&(_, &idx)| idx == pending)
                    .map(|(&pc, _)| pc)
                    .expect("every deferred switch target was registered by its creator");
                pad_with_exit(&mut b.blocks[pending], pending_pc);
            }
        }

        Ok(IrProgram {
            blocks: b.blocks,
            entry,
            reg_temps: b.reg_temps,
        })
    }

    fn lower_one(
        &mut self,
        discovered: &Block,
        positioned: &PositionedInstr,
        index: usize,
    ) -> SimpleResult<()> {
        use InstructionKind::*;
        let instr = positioned.instr;
        let next_pc = positioned.pc.wrapping_add(2);
        let vx = IrReg::from_index(instr.vx);
        let vy = IrReg::from_index(instr.vy);

        match instr.kind {
            ClearDisplay => self.emit(IrInstr::new(IrOpcode::ClearDisplayMemory)),
            LoadImm => {
                let dst = self.temp_for(vx);
                let mut ir = IrInstr::new(IrOpcode::LoadImmediate);
                ir.vx = Some(dst);
                ir.imm = instr.imm as u32;
                self.emit(ir);
            }
            AddImm => {
                let dst = self.temp_for(vx);
                let mut ir = IrInstr::new(IrOpcode::AddImm);
                ir.vx = Some(dst);
                ir.vy = Some(dst);
                ir.imm = instr.imm as u32;
                self.emit(ir);
            }
            LoadReg => {
                let dst = self.temp_for(vx);
                let src = self.temp_for(vy);
                let mut ir = IrInstr::new(IrOpcode::LoadReg);
                ir.vx = Some(dst);
                ir.vy = Some(src);
                self.emit(ir);
            }
            Or | And | Xor => {
                let dst = self.temp_for(vx);
                let src = self.temp_for(vy);
                let code = match instr.kind {
                    Or => IrOpcode::OrRegReg,
                    And => IrOpcode::AndRegReg,
                    Xor => IrOpcode::XorRegReg,
                    _ => unreachable!(),
                };
                let mut ir = IrInstr::new(code);
                ir.vx = Some(dst);
                ir.vy = Some(src);
                self.emit(ir);
            }
            AddReg => {
                let dst = self.temp_for(vx);
                let src = self.temp_for(vy);
                let mut ir = IrInstr::new(IrOpcode::Add);
                ir.vx = Some(dst);
                ir.vy = Some(src);
                self.emit(ir);
                self.emit_flag_check(FlagTag::AddCarry);
            }
            SubReg => {
                let dst = self.temp_for(vx);
                let src = self.temp_for(vy);
                let mut ir = IrInstr::new(IrOpcode::Sub);
                ir.vx = Some(dst);
                ir.vy = Some(src);
                self.emit(ir);
                self.emit_flag_check(FlagTag::SubXyBorrow);
            }
            SubInverse => {
                let dst = self.temp_for(vx);
                let src = self.temp_for(vy);
                let mut ir = IrInstr::new(IrOpcode::SubInverse);
                ir.vx = Some(dst);
                ir.vy = Some(src);
                self.emit(ir);
                self.emit_flag_check(FlagTag::SubYxNoBorrow);
            }
            Shr => {
                let dst = self.temp_for(vx);
                let src = self.temp_for(vy);
                let mut ir = IrInstr::new(IrOpcode::ShrOne);
                ir.vx = Some(dst);
                ir.vy = Some(src);
                self.emit(ir);
                self.emit_flag_check(FlagTag::ShrOut);
            }
            Shl => {
                let dst = self.temp_for(vx);
                let src = self.temp_for(vy);
                let mut ir = IrInstr::new(IrOpcode::ShlOne);
                ir.vx = Some(dst);
                ir.vy = Some(src);
                self.emit(ir);
                self.emit_flag_check(FlagTag::ShlOut);
            }
            LoadIndex => {
                let dst = self.temp_for(IrReg::Index);
                let mut ir = IrInstr::new(IrOpcode::LoadImmediate);
                ir.vx = Some(dst);
                ir.imm = instr.imm as u32;
                self.emit(ir);
            }
            AddIndex => {
                let idx = self.temp_for(IrReg::Index);
                let src = self.temp_for(vx);
                let mut ir = IrInstr::new(IrOpcode::Add);
                ir.vx = Some(idx);
                ir.vy = Some(src);
                self.emit(ir);
            }
            LoadFont => {
                let src = self.temp_for(vx);
                let scaled = self.fresh();
                let mut mul = IrInstr::new(IrOpcode::MulImm);
                mul.vx = Some(scaled);
                mul.vy = Some(src);
                mul.imm = 5;
                self.emit(mul);
                let idx = self.temp_for(IrReg::Index);
                let mut mov = IrInstr::new(IrOpcode::LoadReg);
                mov.vx = Some(idx);
                mov.vy = Some(scaled);
                self.emit(mov);
            }
            Random => {
                let dst = self.temp_for(vx);
                let mut ir = IrInstr::new(IrOpcode::ReadHostRandom);
                ir.vx = Some(dst);
                ir.imm = instr.imm as u32;
                self.emit(ir);
            }
            Bcd => {
                let src = self.temp_for(vx);
                let mut ir = IrInstr::new(IrOpcode::WriteBcd);
                ir.vx = Some(src);
                self.emit(ir);
            }
            RangeWrite | RangeRead => {
                let marker = self.temp_for(vx);
                let code = if instr.kind == RangeWrite {
                    IrOpcode::WriteToMemory
                } else {
                    IrOpcode::ReadFromMemory
                };
                let mut ir = IrInstr::new(code);
                ir.vx = Some(marker);
                ir.imm = instr.vx as u32; // count of registers, 0..=x inclusive

                // The emitter materializes `Index` and every `V0..=Vx` directly (it
                // needs all of them as operands, not just the count carried in
                // `vx`/`imm`), so each must be registered here too or the liveness
                // pass never sees them as accessed at this instruction: their live
                // ranges could end early, and on a block where one of them is never
                // independently referenced it would never be memoized into
                // `reg_temps` at all, which the emitter's lookup treats as a bug.
                // `Index` is read (the current pointer) and written back (advanced by
                // `count` after the loop) in both directions; each `V0..=Vx` is
                // read-only for `WriteToMemory` and write-only for `ReadFromMemory`.
                let index = self.temp_for(IrReg::Index);
                ir.extra_consumed_registers.push((
                    index,
                    RegisterAccessInfo {
                        vx_read: true,
                        vx_write: true,
                        vy_read: false,
                        vy_write: false,
                    },
                ));
                let (reg_read, reg_write) = if instr.kind == RangeWrite { (true, false) } else { (false, true) };
                for reg_idx in 0..=instr.vx {
                    let reg = self.temp_for(IrReg::from_index(reg_idx));
                    ir.extra_consumed_registers.push((
                        reg,
                        RegisterAccessInfo {
                            vx_read: reg_read,
                            vx_write: reg_write,
                            vy_read: false,
                            vy_write: false,
                        },
                    ));
                }
                self.emit(ir);
            }
            GetDelay => {
                let dst = self.temp_for(vx);
                let mut ir = IrInstr::new(IrOpcode::ReadHostTimer);
                ir.vx = Some(dst);
                ir.imm = 0;
                self.emit(ir);
            }
            SetDelay => {
                let src = self.temp_for(vx);
                let mut ir = IrInstr::new(IrOpcode::WriteHostTimer);
                ir.vx = Some(src);
                ir.imm = 0;
                self.emit(ir);
            }
            SetSound => {
                let src = self.temp_for(vx);
                let mut ir = IrInstr::new(IrOpcode::WriteHostTimer);
                ir.vx = Some(src);
                ir.imm = 1;
                self.emit(ir);
            }
            Draw => self.lower_sprite_draw(instr.vx, instr.vy, instr.imm as u8),
            Jump => {
                let target = instr.imm;
                if let Some(&block_idx) = self.pc_to_block.get(&target) {
                    let mut ir = IrInstr::new(IrOpcode::JmpBlock);
                    ir.target = block_idx as u32;
                    self.emit(ir);
                } else {
                    let mut ir = IrInstr::new(IrOpcode::JmpJit);
                    ir.target = target as u32;
                    self.emit(ir);
                }
            }
            Call => {
                let top = self.fresh();
                self.emit({
                    let mut ir = IrInstr::new(IrOpcode::ReadStackOffset);
                    ir.vx = Some(top);
                    ir
                });
                self.emit({
                    let mut ir = IrInstr::new(IrOpcode::WriteToStackWithOffset);
                    ir.vx = Some(top);
                    ir.imm = next_pc as u32;
                    ir
                });
                let bumped = self.fresh();
                self.emit({
                    let mut ir = IrInstr::new(IrOpcode::AddImm);
                    ir.vx = Some(bumped);
                    ir.vy = Some(top);
                    ir.imm = 1;
                    ir
                });
                self.emit({
                    let mut ir = IrInstr::new(IrOpcode::WriteStackOffset);
                    ir.vx = Some(bumped);
                    ir
                });
                self.emit({
                    let mut ir = IrInstr::new(IrOpcode::JmpJit);
                    ir.target = instr.imm as u32;
                    ir
                });
            }
            Return => {
                let top = self.fresh();
                self.emit({
                    let mut ir = IrInstr::new(IrOpcode::ReadStackOffset);
                    ir.vx = Some(top);
                    ir
                });
                let idx = self.fresh();
                self.emit({
                    let mut ir = IrInstr::new(IrOpcode::SubImm);
                    ir.vx = Some(idx);
                    ir.vy = Some(top);
                    ir.imm = 1;
                    ir
                });
                self.emit({
                    let mut ir = IrInstr::new(IrOpcode::WriteStackOffset);
                    ir.vx = Some(idx);
                    ir
                });
                let scratch = self.fresh();
                self.emit({
                    let mut ir = IrInstr::new(IrOpcode::JumpToStackWithOffsetAndDecrement);
                    ir.vx = Some(idx);
                    ir.vy = Some(scratch);
                    ir
                });
            }
            WaitKey => {
                // The block discoverer makes `WaitKey` a terminator, so this is always
                // the last guest instruction in its block: nothing else will be lowered
                // into either of the two IR blocks created below. Poll the host-observed
                // key state once; if nothing is pressed, loop back to this same guest
                // address (the dispatcher re-enters, giving the host a chance to update
                // key state between calls). Once a key is found, write it to `vx` and
                // fall through to the guest instruction that follows.
                let dst = self.temp_for(vx);
                let scan = self.fresh();
                let mut scan_ir = IrInstr::new(IrOpcode::ReadHostKeyScan);
                scan_ir.vx = Some(scan);
                self.emit(scan_ir);

                let retry_block = self.new_block();
                let mut cmp_ir = IrInstr::new(IrOpcode::JmpEqImm);
                cmp_ir.vx = Some(scan);
                cmp_ir.imm = 0xFF;
                cmp_ir.target = retry_block.0 as u32;
                self.emit(cmp_ir);

                let mut mov_ir = IrInstr::new(IrOpcode::LoadReg);
                mov_ir.vx = Some(dst);
                mov_ir.vy = Some(scan);
                self.emit(mov_ir);
                let mut exit_ir = IrInstr::new(IrOpcode::JmpJit);
                exit_ir.target = next_pc as u32;
                self.emit(exit_ir);

                self.use_block(retry_block);
                let mut retry_exit = IrInstr::new(IrOpcode::JmpJit);
                retry_exit.target = positioned.pc as u32;
                self.emit(retry_exit);
            }
            JumpPlusV0 => return Err(CompileError::UnhandledOpcode(instr.kind)),
            SkipEqImm | SkipNeImm | SkipEqReg | SkipNeReg | SkipKeyPressed | SkipKeyNotPressed => {
                self.lower_skip(discovered, positioned, index, instr.kind, vx, vy, instr.imm)?;
                return Ok(());
            }
            Invalid => return Err(CompileError::UnhandledOpcode(instr.kind)),
        }

        Ok(())
    }

    fn emit_flag_check(&mut self, tag: FlagTag) {
        let vf = self.temp_for(IrReg::VF);
        let mut ir = IrInstr::new(IrOpcode::FlagRegisterCheck);
        ir.vx = Some(vf);
        ir.flag_tag = Some(tag);
        self.emit(ir);
    }

    /// Emit the compare that branches straight to the post-skip block when the skip is
    /// taken, then stash the post-skip block handle and set the switch counter so the
    /// outer lowering loop lets the paired "skipped" instruction land in the
    /// still-active pre-skip block before switching.
    fn lower_skip(
        &mut self,
        _discovered: &Block,
        positioned: &PositionedInstr,
        _index: usize,
        kind: InstructionKind,
        vx: IrReg,
        vy: IrReg,
        imm: u16,
    ) -> SimpleResult<()> {
        let after_skip_pc = positioned.pc.wrapping_add(4);

        let handle = if let Some(&existing) = self.pc_to_block.get(&after_skip_pc) {
            BlockHandle(existing)
        } else {
            let h = self.new_block();
            self.pc_to_block.insert(after_skip_pc, h.0);
            h
        };

        let dst = self.temp_for(vx);
        use InstructionKind::*;
        match kind {
            SkipEqImm => {
                let mut ir = IrInstr::new(IrOpcode::JmpEqImm);
                ir.vx = Some(dst);
                ir.imm = imm as u32;
                ir.target = handle.0 as u32;
                self.emit(ir);
            }
            SkipNeImm => {
                let mut ir = IrInstr::new(IrOpcode::JmpNeImm);
                ir.vx = Some(dst);
                ir.imm = imm as u32;
                ir.target = handle.0 as u32;
                self.emit(ir);
            }
            SkipEqReg => {
                let src = self.temp_for(vy);
                let mut ir = IrInstr::new(IrOpcode::JmpEqReg);
                ir.vx = Some(dst);
                ir.vy = Some(src);
                ir.target = handle.0 as u32;
                self.emit(ir);
            }
            SkipNeReg => {
                let src = self.temp_for(vy);
                let mut ir = IrInstr::new(IrOpcode::JmpNeReg);
                ir.vx = Some(dst);
                ir.vy = Some(src);
                ir.target = handle.0 as u32;
                self.emit(ir);
            }
            SkipKeyPressed => {
                let mut ir = IrInstr::new(IrOpcode::ReadHostKeyState);
                ir.vx = Some(dst);
                ir.imm = 1; // branch (skip) when pressed
                ir.target = handle.0 as u32;
                self.emit(ir);
            }
            SkipKeyNotPressed => {
                let mut ir = IrInstr::new(IrOpcode::ReadHostKeyState);
                ir.vx = Some(dst);
                ir.imm = 0; // branch (skip) when not pressed
                ir.target = handle.0 as u32;
                self.emit(ir);
            }
            _ => unreachable!(),
        }

        self.block_to_switch_to = Some(handle.0);
        self.block_switch_counter = 2;

        // The paired "skipped" instruction (always the very next entry, per the block
        // discoverer's skip-plus-one rule) is left for the outer loop's own next
        // iteration to lower, still into this same active (pre-skip) block — the
        // counter above is tuned to defer the switch to the post-skip block by exactly
        // one more instruction after that. Lowering it here too would emit it twice.
        Ok(())
    }

    /// Sprite draw (`Dxyn`). `n` (row count) is a compile-time immediate, so the outer
    /// loop is unrolled; each of the 8 columns per row becomes its own guarded write,
    /// with no runtime loop counter needed at all.
    fn lower_sprite_draw(&mut self, x_index: u8, y_index: u8, n: u8) {
        let vx = IrReg::from_index(x_index);
        let vy = IrReg::from_index(y_index);
        let vf = self.temp_for(IrReg::VF);
        self.emit({
            let mut ir = IrInstr::new(IrOpcode::LoadImmediate);
            ir.vx = Some(vf);
            ir.imm = 0;
            ir
        });

        for row in 0..n as u32 {
            let sprite_byte = self.fresh();
            let index_reg = self.temp_for(IrReg::Index);
            self.emit({
                let mut ir = IrInstr::new(IrOpcode::LoadByteFromI);
                ir.vx = Some(index_reg);
                ir.vy = Some(sprite_byte);
                ir.imm = row;
                ir
            });

            let dy = self.fresh();
            let y_src = self.temp_for(vy);
            self.emit({
                let mut ir = IrInstr::new(IrOpcode::AddImm);
                ir.vx = Some(dy);
                ir.vy = Some(y_src);
                ir.imm = row;
                ir
            });
            self.emit({
                let mut ir = IrInstr::new(IrOpcode::AndImm);
                ir.vx = Some(dy);
                ir.vy = Some(dy);
                ir.imm = 31;
                ir
            });

            for col in 0..8u32 {
                let col_bit = self.fresh();
                self.emit({
                    let mut ir = IrInstr::new(IrOpcode::AndImm);
                    ir.vx = Some(col_bit);
                    ir.vy = Some(sprite_byte);
                    ir.imm = 0x80 >> col;
                    ir
                });

                let skip_col_block = self.new_block();
                self.emit({
                    let mut ir = IrInstr::new(IrOpcode::JmpZ);
                    ir.vx = Some(col_bit);
                    ir.target = skip_col_block.0 as u32;
                    ir
                });

                let dx = self.fresh();
                let x_src = self.temp_for(vx);
                self.emit({
                    let mut ir = IrInstr::new(IrOpcode::AddImm);
                    ir.vx = Some(dx);
                    ir.vy = Some(x_src);
                    ir.imm = col;
                    ir
                });
                self.emit({
                    let mut ir = IrInstr::new(IrOpcode::AndImm);
                    ir.vx = Some(dx);
                    ir.vy = Some(dx);
                    ir.imm = 63;
                    ir
                });

                self.emit({
                    let mut ir = IrInstr::new(IrOpcode::CollisionAccumulate);
                    ir.vx = Some(dx);
                    ir.vy = Some(dy);
                    ir.imm2 = vf.reg;
                    // VF is read (accumulated into) and written here but only carried
                    // via `imm2`, not `vx`/`vy` — record it so the allocator's liveness
                    // pass (which only walks `vx`/`vy`/`extra_consumed_registers`) does
                    // not treat it as dead across the whole unrolled sprite loop.
                    ir.extra_consumed_registers.push((
                        vf,
                        RegisterAccessInfo {
                            vx_read: true,
                            vx_write: true,
                            vy_read: false,
                            vy_write: false,
                        },
                    ));
                    ir
                });
                self.emit({
                    let mut ir = IrInstr::new(IrOpcode::XorDisplayMemory);
                    ir.vx = Some(dx);
                    ir.vy = Some(dy);
                    ir.target = skip_col_block.0 as u32;
                    ir
                });

                self.use_block(skip_col_block);
            }
        }
    }
}

/// Whether a block's instruction stream, as currently built, still needs a trailing
/// exit appended — true both for a block with no instructions at all and for one
/// whose last instruction isn't already one of the forms that leaves the compiled
/// unit (`JmpJit`, the call/return-class `JumpToStackWithOffsetAndDecrement`) or loops
/// back within it (`JmpBlock`).
fn block_needs_exit(block: &IrBlock) -> bool {
    !matches!(
        block.instrs.last().map(|instr| instr.code),
        Some(IrOpcode::JmpJit | IrOpcode::JmpBlock | IrOpcode::JumpToStackWithOffsetAndDecrement)
    )
}

fn pad_with_exit(block: &mut IrBlock, target_pc: u16) {
    let mut ir = IrInstr::new(IrOpcode::JmpJit);
    ir.target = target_pc as u32;
    block.push(ir);
}
