//! The mid-level IR's tagged opcode set and per-operand register bookkeeping.
//!
//! The opcode is a plain tagged enum, never open polymorphism: per-opcode behavior for
//! the allocator and the emitter is centralized in the parallel tables at the bottom of
//! this file, keyed by the tag.

/// A guest-bound register, or the index register. Distinct from a temporary, which is
/// identified purely by its `u32` id in [`RegisterPointer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrReg {
    V0,
    V1,
    V2,
    V3,
    V4,
    V5,
    V6,
    V7,
    V8,
    V9,
    VA,
    VB,
    VC,
    VD,
    VE,
    VF,
    Index,
}

impl IrReg {
    /// All sixteen general-purpose registers, in order.
    pub const GP: [IrReg; 16] = [
        IrReg::V0,
        IrReg::V1,
        IrReg::V2,
        IrReg::V3,
        IrReg::V4,
        IrReg::V5,
        IrReg::V6,
        IrReg::V7,
        IrReg::V8,
        IrReg::V9,
        IrReg::VA,
        IrReg::VB,
        IrReg::VC,
        IrReg::VD,
        IrReg::VE,
        IrReg::VF,
    ];

    /// Construct from a 4-bit guest register index (`0..16`).
    pub fn from_index(index: u8) -> Self {
        Self::GP[index as usize]
    }

    /// Whether this is the flags register.
    pub const fn is_vf(self) -> bool {
        matches!(self, IrReg::VF)
    }
}

/// A reference to a virtual register: either a guest-bound register's memoized
/// temporary, or a fresh compiler temporary. `reg` is the opaque `u32` id either way;
/// `is_temp` only affects the *default* next-access-dead answer used by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterPointer {
    pub is_temp: bool,
    pub reg: u32,
}

/// Bitflags describing which operand positions a given opcode reads and/or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterAccessInfo {
    pub vx_read: bool,
    pub vx_write: bool,
    pub vy_read: bool,
    pub vy_write: bool,
}

impl RegisterAccessInfo {
    const NONE: Self = Self {
        vx_read: false,
        vx_write: false,
        vy_read: false,
        vy_write: false,
    };
}

/// The mid-IR's tagged opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrOpcode {
    Add,
    Sub,
    AddImm,
    SubImm,
    MulImm,
    DivImm,
    ModImm,
    AndImm,
    ShrImm,
    LoadImmediate,
    LoadByteFromI,
    LoadReg,
    JmpZ,
    JmpNZ,
    JmpEqImm,
    JmpNeImm,
    JmpEqReg,
    JmpNeReg,
    XorDisplayMemory,
    ClearDisplayMemory,
    JmpBlock,
    JmpJit,
    FlagRegisterCheck,
    OrRegReg,
    AndRegReg,
    XorRegReg,
    ShrOne,
    ShlOne,
    SubInverse,
    ReadStackOffset,
    WriteStackOffset,
    WriteToStackWithOffset,
    JumpToStackWithOffsetAndDecrement,
    WriteToMemory,
    ReadFromMemory,
    CollisionAccumulate,
    ReadHostRandom,
    WriteBcd,
    ReadHostKeyState,
    ReadHostKeyScan,
    ReadHostTimer,
    WriteHostTimer,
}

/// The polarity/direction tag carried by [`IrOpcode::FlagRegisterCheck`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagTag {
    /// Set VF on carry out of an addition.
    AddCarry,
    /// Set VF on borrow out of `vx - vy`.
    SubXyBorrow,
    /// Set VF when `vy - vx` does *not* borrow.
    SubYxNoBorrow,
    /// Set VF to the bit shifted out on the right.
    ShrOut,
    /// Set VF to the bit shifted out on the left.
    ShlOut,
}

/// One mid-IR instruction.
#[derive(Debug, Clone)]
pub struct IrInstr {
    pub code: IrOpcode,
    pub vx: Option<RegisterPointer>,
    pub vy: Option<RegisterPointer>,
    pub imm: u32,
    pub imm2: u32,
    pub flag_tag: Option<FlagTag>,
    /// Guest-level target: a block index for intra-unit branches, or a guest PC for
    /// `JmpJit`. Interpretation is opcode-dependent.
    pub target: u32,
    pub extra_consumed_registers: Vec<(RegisterPointer, RegisterAccessInfo)>,
}

impl IrInstr {
    /// Build a bare instruction with no operands; callers fill in fields as needed.
    pub fn new(code: IrOpcode) -> Self {
        Self {
            code,
            vx: None,
            vy: None,
            imm: 0,
            imm2: 0,
            flag_tag: None,
            target: 0,
            extra_consumed_registers: Vec::new(),
        }
    }
}

/// Look up the read/write access pattern an opcode imposes on its `vx`/`vy` operands.
///
/// This is one of two parallel per-opcode tables (the other is the emission function
/// table in `crate::emitter`).
pub fn access_info(code: IrOpcode) -> RegisterAccessInfo {
    use IrOpcode::*;
    match code {
        LoadImmediate => RegisterAccessInfo {
            vx_write: true,
            ..RegisterAccessInfo::NONE
        },
        LoadReg => RegisterAccessInfo {
            vx_write: true,
            vy_read: true,
            ..RegisterAccessInfo::NONE
        },
        AddImm | SubImm | MulImm | DivImm | ModImm | AndImm | ShrImm => RegisterAccessInfo {
            vx_write: true,
            vy_read: true,
            ..RegisterAccessInfo::NONE
        },
        Add | Sub | SubInverse | OrRegReg | AndRegReg | XorRegReg | ShrOne | ShlOne => {
            RegisterAccessInfo {
                vx_read: true,
                vx_write: true,
                vy_read: true,
                ..RegisterAccessInfo::NONE
            }
        }
        FlagRegisterCheck => RegisterAccessInfo {
            vx_write: true,
            ..RegisterAccessInfo::NONE
        },
        JmpZ | JmpNZ => RegisterAccessInfo {
            vx_read: true,
            ..RegisterAccessInfo::NONE
        },
        JmpEqImm | JmpNeImm => RegisterAccessInfo {
            vx_read: true,
            ..RegisterAccessInfo::NONE
        },
        JmpEqReg | JmpNeReg => RegisterAccessInfo {
            vx_read: true,
            vy_read: true,
            ..RegisterAccessInfo::NONE
        },
        JmpBlock | JmpJit | ClearDisplayMemory => RegisterAccessInfo::NONE,
        LoadByteFromI => RegisterAccessInfo {
            vx_read: true,
            vy_write: true,
            ..RegisterAccessInfo::NONE
        },
        XorDisplayMemory | CollisionAccumulate => RegisterAccessInfo {
            vx_read: true,
            vy_read: true,
            ..RegisterAccessInfo::NONE
        },
        ReadStackOffset => RegisterAccessInfo {
            vx_write: true,
            ..RegisterAccessInfo::NONE
        },
        WriteStackOffset | WriteToStackWithOffset => RegisterAccessInfo {
            vx_read: true,
            ..RegisterAccessInfo::NONE
        },
        JumpToStackWithOffsetAndDecrement => RegisterAccessInfo {
            vx_read: true,
            vx_write: true,
            vy_write: true,
            ..RegisterAccessInfo::NONE
        },
        WriteToMemory | ReadFromMemory => RegisterAccessInfo {
            vx_read: true,
            ..RegisterAccessInfo::NONE
        },
        ReadHostRandom | ReadHostTimer => RegisterAccessInfo {
            vx_write: true,
            ..RegisterAccessInfo::NONE
        },
        WriteBcd | WriteHostTimer => RegisterAccessInfo {
            vx_read: true,
            ..RegisterAccessInfo::NONE
        },
        ReadHostKeyState => RegisterAccessInfo {
            vx_read: true,
            ..RegisterAccessInfo::NONE
        },
        ReadHostKeyScan => RegisterAccessInfo {
            vx_write: true,
            ..RegisterAccessInfo::NONE
        },
    }
}
