//! A dynamic binary translator for a CHIP-8 family instruction set.
//!
//! Discovers guest basic blocks, lowers them through a mid-level IR, allocates host
//! registers with a linear-scan pass, and emits native machine code that runs until
//! the guest program counter leaves the block. See `DESIGN.md` for the grounding
//! ledger behind each module below.

#![warn(missing_docs)]
#![deny(unused_must_use)]
#![deny(unused_crate_dependencies)]
#![deny(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

pub mod block;
pub mod cache;
pub mod consts;
pub mod core_state;
pub mod decoder;
pub mod emitter;
pub mod error;
pub mod font;
pub mod host;
pub mod ir;
pub mod memory_stream;
pub mod regalloc;
pub mod runtime;

pub use cache::BlockCache;
pub use core_state::CoreState;
pub use emitter::JitOptions;
pub use error::{CompileError, IoResult, RunOutcome, SimpleResult};
pub use host::HostCollaborator;

/// Allocate and zero-init the pinned core state, with the default font installed at
/// memory offset 0 and the host-register pool configured by `options`.
///
/// `options` defaults to [`JitOptions::default()`] when `None`, reproducing the
/// frozen baseline behavior described in the module docs.
pub fn core_new(options: Option<JitOptions>) -> (Box<CoreState>, BlockCache) {
    let core = CoreState::new_pinned();
    let cache = BlockCache::new(options.unwrap_or_default());
    (core, cache)
}

/// Copy guest ROM bytes to memory starting at guest PC `0x200` and set the program
/// counter there.
pub fn core_load(core: &mut CoreState, bytes: &[u8]) {
    core.load_rom(bytes);
}

/// Enter the dispatcher loop: compile-or-fetch each block by guest PC, execute it,
/// and repeat until the host collaborator's `stop()` returns true or a compilation
/// error aborts the run. Returns `Ok(RunOutcome::Stopped)` on a clean stop, `Err` if
/// a compilation error aborted the loop first.
pub fn core_run(
    core: &mut CoreState,
    cache: &mut BlockCache,
    host: &mut dyn HostCollaborator,
) -> IoResult<RunOutcome> {
    cache.run(core, host)
}
