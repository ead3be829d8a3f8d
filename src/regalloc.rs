//! Single-pass liveness analysis plus on-demand linear-scan allocation.
//!
//! Pass 1 builds a live range per virtual register. Pass 2 is driven by the emitter:
//! each time it needs a host register for an operand it calls [`RegisterAllocator::allocate`],
//! which frees expired registers, returns a hit if the value is already resident,
//! otherwise picks a free register, a write-only-dead resident, or the furthest-next-use
//! victim to spill.

use std::collections::{BTreeSet, HashMap};

use crate::error::{CompileError, SimpleResult};
use crate::ir::{BlockHandle, IrBlock, IrInstr, IrReg, IrProgram, RegisterPointer};

/// One read or write of a virtual register, tagged with its position in the flattened
/// instruction order.
#[derive(Debug, Clone, Copy)]
pub struct AccessPoint {
    pub ir_index: u32,
    pub read: bool,
    pub write: bool,
}

/// The interval and access history of a single virtual register across a compilation.
#[derive(Debug, Clone, Default)]
pub struct LiveRange {
    pub start: u32,
    pub end: u32,
    pub accesses: Vec<AccessPoint>,
}

impl LiveRange {
    fn record(&mut self, point: AccessPoint) {
        if self.accesses.is_empty() {
            self.start = point.ir_index;
        }
        self.end = point.ir_index;
        self.accesses.push(point);
    }
}

/// What the emitter must do for the operand it just requested a register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAction {
    /// The value is already in the returned host register; nothing to emit.
    None,
    /// Materialize the value into the returned host register before using it.
    Load,
}

/// A host register the allocator freed or spilled while servicing a request. The
/// emitter must flush it before reusing the register.
#[derive(Debug, Clone)]
pub struct Eviction {
    pub host_reg: u32,
    pub vreg: u32,
    /// Present when the evicted register held a guest-bound value: the core-state
    /// field the emitter must write the value back to.
    pub writeback: Option<IrReg>,
    /// Present when the evicted register held a temporary: the spill slot offset the
    /// emitter must write the value to.
    pub spill_slot: Option<u32>,
}

/// The result of one allocation request.
#[derive(Debug, Clone)]
pub struct AllocationResult {
    pub host_reg: u32,
    pub action: RequiredAction,
    pub evictions: Vec<Eviction>,
}

/// Flattens an [`IrProgram`] into one linear instruction order, assigning each
/// instruction a monotonically increasing `ir_index` in block order.
pub fn flatten_order(program: &IrProgram) -> Vec<(usize, usize)> {
    let mut order = Vec::new();
    for (block_idx, block) in program.blocks.iter().enumerate() {
        for instr_idx in 0..block.instrs.len() {
            order.push((block_idx, instr_idx));
        }
    }
    order
}

fn instr_at<'a>(program: &'a IrProgram, pos: (usize, usize)) -> &'a IrInstr {
    &program.blocks[pos.0].instrs[pos.1]
}

/// Linear-scan register allocator state, scoped to one compilation.
pub struct RegisterAllocator {
    ranges: HashMap<u32, LiveRange>,
    guest_bound: HashMap<u32, IrReg>,
    free_regs: Vec<u32>,
    clobber_aware: BTreeSet<u32>,
    clobbered: BTreeSet<u32>,
    resident: HashMap<u32, u32>,
    resident_owner: HashMap<u32, u32>,
    spill_offset: HashMap<u32, u32>,
    free_spill_slots: Vec<u32>,
    next_spill_offset: u32,
}

impl RegisterAllocator {
    /// Build an allocator over `host_regs`, marking `clobber_aware` as the subset whose
    /// use requires a prologue save / epilogue restore.
    pub fn new(host_regs: Vec<u32>, clobber_aware: Vec<u32>) -> Self {
        Self {
            ranges: HashMap::new(),
            guest_bound: HashMap::new(),
            free_regs: host_regs,
            clobber_aware: clobber_aware.into_iter().collect(),
            clobbered: BTreeSet::new(),
            resident: HashMap::new(),
            resident_owner: HashMap::new(),
            spill_offset: HashMap::new(),
            free_spill_slots: Vec::new(),
            next_spill_offset: 0,
        }
    }

    /// Run pass 1 (liveness) over the whole IR program.
    pub fn track(&mut self, program: &IrProgram, reg_temps: &HashMap<IrReg, u32>) -> SimpleResult<()> {
        for (&reg, &id) in reg_temps {
            self.guest_bound.insert(id, reg);
        }

        let order = flatten_order(program);
        for (ir_index, pos) in order.iter().enumerate() {
            let ir_index = ir_index as u32;
            let instr = instr_at(program, *pos);
            let access = crate::ir::opcode::access_info(instr.code);

            if let Some(vx) = instr.vx {
                self.record_access(vx, ir_index, access.vx_read, access.vx_write)?;
            }
            if let Some(vy) = instr.vy {
                self.record_access(vy, ir_index, access.vy_read, access.vy_write)?;
            }
            for (reg, info) in &instr.extra_consumed_registers {
                self.record_access(*reg, ir_index, info.vx_read || info.vy_read, info.vx_write || info.vy_write)?;
            }
        }
        Ok(())
    }

    fn record_access(&mut self, reg: RegisterPointer, ir_index: u32, read: bool, write: bool) -> SimpleResult<()> {
        let range = self.ranges.entry(reg.reg).or_default();
        if reg.is_temp && range.accesses.is_empty() && read && !write {
            return Err(CompileError::UninitializedRead(reg.reg));
        }
        range.record(AccessPoint { ir_index, read, write });
        Ok(())
    }

    /// Whether `vreg`'s next access at or after `ir_index` is write-only. Defaults to
    /// `true` (discardable) for temporaries and `false` (must be preserved) for
    /// guest-bound registers.
    pub fn next_access_is_write_only(&self, vreg: u32, ir_index: u32, is_temp: bool) -> bool {
        let Some(range) = self.ranges.get(&vreg) else {
            return is_temp;
        };
        match range.accesses.iter().find(|a| a.ir_index > ir_index) {
            Some(a) => a.write && !a.read,
            None => is_temp,
        }
    }

    fn distance_to_next_use(&self, vreg: u32, ir_index: u32) -> u32 {
        let Some(range) = self.ranges.get(&vreg) else {
            return u32::MAX;
        };
        range
            .accesses
            .iter()
            .find(|a| a.ir_index > ir_index)
            .map(|a| a.ir_index - ir_index)
            .unwrap_or(u32::MAX)
    }

    fn free_expired(&mut self, ir_index: u32) -> Vec<Eviction> {
        let mut evicted = Vec::new();
        let expired: Vec<u32> = self
            .resident
            .iter()
            .filter(|(&vreg, _)| self.ranges.get(&vreg).map(|r| r.end < ir_index).unwrap_or(true))
            .map(|(&vreg, _)| vreg)
            .collect();
        for vreg in expired {
            let host = self.resident.remove(&vreg).unwrap();
            self.resident_owner.remove(&host);
            let writeback = self.guest_bound.get(&vreg).copied();
            let spill_slot = self.spill_offset.remove(&vreg);
            if let Some(slot) = spill_slot {
                self.free_spill_slots.push(slot);
            }
            self.free_regs.push(host);
            evicted.push(Eviction {
                host_reg: host,
                vreg,
                writeback,
                spill_slot: None,
            });
        }
        evicted
    }

    fn bump_spill_slot(&mut self) -> u32 {
        if let Some(slot) = self.free_spill_slots.pop() {
            slot
        } else {
            let slot = self.next_spill_offset;
            self.next_spill_offset += 4;
            slot
        }
    }

    /// Pass 2: obtain a host register for `reg` at `ir_index`.
    pub fn allocate(&mut self, reg: RegisterPointer, ir_index: u32) -> SimpleResult<AllocationResult> {
        let mut evictions = self.free_expired(ir_index);

        if let Some(&host) = self.resident.get(&reg.reg) {
            return Ok(AllocationResult {
                host_reg: host,
                action: RequiredAction::None,
                evictions,
            });
        }

        let host_reg = if let Some(host) = self.free_regs.pop() {
            if self.clobber_aware.contains(&host) {
                self.clobbered.insert(host);
            }
            host
        } else if let Some((&victim_vreg, &victim_host)) = self
            .resident
            .iter()
            .find(|(&v, _)| self.next_access_is_write_only(v, ir_index, !self.guest_bound.contains_key(&v)))
        {
            self.resident.remove(&victim_vreg);
            self.resident_owner.remove(&victim_host);
            victim_host
        } else if let Some((&victim_vreg, &victim_host)) = self
            .resident
            .iter()
            .max_by_key(|(&v, _)| self.distance_to_next_use(v, ir_index))
        {
            self.resident.remove(&victim_vreg);
            self.resident_owner.remove(&victim_host);
            let writeback = self.guest_bound.get(&victim_vreg).copied();
            let spill_slot = if writeback.is_none() {
                Some(self.bump_spill_slot())
            } else {
                None
            };
            if let Some(slot) = spill_slot {
                self.spill_offset.insert(victim_vreg, slot);
            }
            evictions.push(Eviction {
                host_reg: victim_host,
                vreg: victim_vreg,
                writeback,
                spill_slot,
            });
            victim_host
        } else {
            return Err(CompileError::AllocatorExhausted);
        };

        self.resident.insert(reg.reg, host_reg);
        self.resident_owner.insert(host_reg, reg.reg);

        let write_only = self.next_access_is_write_only(reg.reg, ir_index, reg.is_temp);
        let action = if write_only {
            RequiredAction::None
        } else {
            RequiredAction::Load
        };

        Ok(AllocationResult {
            host_reg,
            action,
            evictions,
        })
    }

    /// The set of callee-saved host registers touched so far.
    pub fn clobbered(&self) -> &BTreeSet<u32> {
        &self.clobbered
    }

    /// Live range lookup, exposed for tests and the emitter's writeback-at-exit pass.
    pub fn range(&self, vreg: u32) -> Option<&LiveRange> {
        self.ranges.get(&vreg)
    }

    /// All virtual registers currently resident in a host register.
    pub fn resident(&self) -> &HashMap<u32, u32> {
        &self.resident
    }

    /// Unconditionally evict `vreg` if it is currently resident, regardless of whether
    /// its live range has expired. Used before a runtime-helper call, which clobbers
    /// every caller-saved host register per the SysV ABI.
    pub fn force_evict(&mut self, vreg: u32) -> Vec<Eviction> {
        let Some(host) = self.resident.remove(&vreg) else {
            return Vec::new();
        };
        self.resident_owner.remove(&host);
        let writeback = self.guest_bound.get(&vreg).copied();
        let spill_slot = if writeback.is_none() {
            let slot = self.bump_spill_slot();
            self.spill_offset.insert(vreg, slot);
            Some(slot)
        } else {
            None
        };
        self.free_regs.push(host);
        vec![Eviction {
            host_reg: host,
            vreg,
            writeback,
            spill_slot,
        }]
    }

    /// The spill slot previously recorded for `vreg`, if it was ever evicted into one.
    pub fn spill_offset_of(&self, vreg: u32) -> Option<u32> {
        self.spill_offset.get(&vreg).copied()
    }

    /// Total bytes of spill area bump-allocated so far, for frame-size computation.
    pub fn spill_area_size(&self) -> u32 {
        self.next_spill_offset
    }
}
