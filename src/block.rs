//! Guest basic-block discovery.
//!
//! Walks guest memory from a starting program counter and accumulates a straight-line
//! instruction sequence, honouring the skip/terminator rules of the guest ISA.

use std::collections::BTreeSet;

use crate::decoder::{decode, DecodedInstr, InstructionKind};
use crate::memory_stream::MemoryStream;

/// A decoded guest instruction paired with the guest address it was read from.
#[derive(Debug, Clone, Copy)]
pub struct PositionedInstr {
    pub pc: u16,
    pub instr: DecodedInstr,
}

/// A discovered guest basic block.
#[derive(Debug)]
pub struct Block {
    pub start_pc: u16,
    pub instrs: Vec<PositionedInstr>,
    /// Guest addresses inside the block that must become intra-block labels.
    pub local_labels: BTreeSet<u16>,
}

/// Walk guest memory from `start_pc`, building a straight-line block that ends at the
/// first skip, jump, call, return, or other control-flow instruction.
pub fn discover_block(memory: &[u8], start_pc: u16) -> Block {
    let mut instrs = Vec::new();
    let mut local_labels = BTreeSet::new();
    let mut stream = MemoryStream::new(memory, start_pc as usize);
    let mut current_pc = start_pc;

    loop {
        if !stream.has_next() {
            break;
        }
        let word = stream.next_word();
        let pc = current_pc;
        current_pc += 2;
        let instr = decode(word);

        if instr.kind == InstructionKind::Invalid {
            break;
        }

        instrs.push(PositionedInstr { pc, instr });

        if instr.kind == InstructionKind::Jump {
            let target = instr.imm;
            if target >= start_pc && target <= current_pc {
                local_labels.insert(target);
            }
            break;
        }

        if instr.kind.changes_control_flow() && !instr.kind.is_skip() {
            // Call, long jump, native return, or WaitKey: each is a plain terminator.
            break;
        }

        if instr.kind.is_skip() {
            if !stream.has_next() {
                break; // end-of-stream while resolving a skip: treat as SMC defense.
            }
            let skipped_pc = current_pc;
            let skipped_word = stream.next_word();
            current_pc += 2;
            let skipped = decode(skipped_word);
            local_labels.insert(current_pc);

            if skipped.kind == InstructionKind::Jump {
                let target = skipped.imm;
                if target >= start_pc && target <= current_pc {
                    local_labels.insert(target);
                }
            }

            instrs.push(PositionedInstr {
                pc: skipped_pc,
                instr: skipped,
            });

            if skipped.kind == InstructionKind::Invalid {
                break;
            }
            if skipped.kind.changes_control_flow() {
                break;
            }
            continue;
        }

        // plain, non-terminating instruction: keep going.
    }

    Block {
        start_pc,
        instrs,
        local_labels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with(bytes: &[u8]) -> Vec<u8> {
        let mut mem = vec![0u8; 0x1000];
        mem[0x200..0x200 + bytes.len()].copy_from_slice(bytes);
        mem
    }

    #[test]
    fn stops_on_invalid() {
        let mem = memory_with(&[0x60, 0x05, 0x50, 0x01]);
        let block = discover_block(&mem, 0x200);
        assert_eq!(block.instrs.len(), 1);
    }

    #[test]
    fn skip_eq_imm_registers_post_skip_label() {
        // V0 := 10; skip if V0 == 10; V0 := 0xFF (skipped); V0 := 1
        let mem = memory_with(&[0x60, 0x0A, 0x30, 0x0A, 0x60, 0xFF, 0x60, 0x01]);
        let block = discover_block(&mem, 0x200);
        assert_eq!(block.instrs.len(), 4);
        assert!(block.local_labels.contains(&0x206));
    }

    #[test]
    fn self_loop_jump_is_a_local_label() {
        let mem = memory_with(&[0x60, 0x00, 0x70, 0x01, 0x12, 0x02]);
        let block = discover_block(&mem, 0x200);
        assert_eq!(block.instrs.len(), 3);
        assert!(block.local_labels.contains(&0x202));
    }

    #[test]
    fn call_terminates_the_block() {
        let mem = memory_with(&[0x22, 0x04]);
        let block = discover_block(&mem, 0x200);
        assert_eq!(block.instrs.len(), 1);
        assert_eq!(block.instrs[0].instr.kind, InstructionKind::Call);
    }
}
