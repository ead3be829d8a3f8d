//! The mid-level intermediate representation and its lowering pass.

pub mod builder;
pub mod opcode;

pub use builder::{BlockHandle, IrBlock, IrBuilder, IrProgram};
pub use opcode::{FlagTag, IrInstr, IrOpcode, IrReg, RegisterAccessInfo, RegisterPointer};
