//! Compilation and run-time error taxonomy.

use core::fmt;

/// Errors that can abort the translation pipeline.
///
/// Every compilation error is fatal to the run loop: there is no recoverable path once
/// the block discoverer has handed decoded instructions to the IR builder.
#[derive(Debug, derive_more::Display)]
pub enum CompileError {
    /// The IR builder encountered a decoded opcode it has no lowering for.
    #[display(fmt = "unhandled opcode in IR builder: {_0:?}")]
    UnhandledOpcode(crate::decoder::InstructionKind),
    /// A virtual register's first access was a read, not a write.
    #[display(fmt = "register allocator invariant violated: vreg {_0} read before written")]
    UninitializedRead(u32),
    /// The allocator ran out of free host registers with no eviction candidate.
    #[display(fmt = "register allocator exhausted: no free register and no eviction candidate")]
    AllocatorExhausted,
    /// The host assembler rejected a generated instruction.
    #[display(fmt = "emitter rejected instruction: {_0}")]
    EmitFailed(String),
    /// Executable memory could not be allocated for a compiled block.
    #[display(fmt = "failed to allocate executable memory: {_0}")]
    ExecMemoryAllocFailed(String),
}

impl std::error::Error for CompileError {}

/// Result of a pipeline stage that cannot touch runtime state.
pub type SimpleResult<T> = Result<T, CompileError>;

/// Result of driving the dispatcher loop: `Ok` once it has wound down cleanly,
/// `Err` if a compilation error aborted it. Mirrors the teacher's
/// `SimpleResult`/`IoResult` split between a pure-compilation alias and one that
/// also carries the outcome of a stateful run.
pub type IoResult<T> = Result<T, CompileError>;

/// A runtime condition distinguished from a compilation failure.
///
/// No guest arithmetic can fail; this only exists to describe the one runtime
/// condition the dispatcher can observe: the host asked the run loop to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The host collaborator's `stop()` returned true between blocks.
    Stopped,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "run loop stopped by host collaborator"),
        }
    }
}
