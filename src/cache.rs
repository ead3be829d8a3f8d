//! Block cache & dispatcher.
//!
//! Keyed by the guest program counter at a block's entry. On a miss the pipeline runs
//! synchronously — discover, lower, allocate, emit — and the result is installed
//! before the dispatcher calls into it. On a hit the cached entry point is called
//! directly. The cache never evicts: compiled pages are never freed for the lifetime
//! of the process, matching the single-threaded, no-invalidation resource model.

use std::collections::HashMap;

use crate::block::discover_block;
use crate::core_state::CoreState;
use crate::emitter::{CompiledBlock, Emitter, JitOptions};
use crate::error::{CompileError, IoResult, RunOutcome, SimpleResult};
use crate::host::HostCollaborator;
use crate::ir::IrBuilder;

/// One page of executable memory backing a single compiled block.
///
/// Allocated via `mmap` with `PROT_READ | PROT_WRITE`, written, then remapped to
/// `PROT_READ | PROT_EXEC` before anything calls into it — the generated code is
/// never both writable and executable at the same time.
struct ExecPage {
    ptr: *mut u8,
    len: usize,
}

// Safety: the mapping is never written again after `make_executable` runs, and the
// only mutation (`mmap`/`mprotect`) happens during `ExecPage::new`, before the page is
// shared with the dispatcher. Pages are never freed or remapped afterward.
unsafe impl Send for ExecPage {}
unsafe impl Sync for ExecPage {}

impl ExecPage {
    fn new(code: &[u8]) -> SimpleResult<Self> {
        let len = code.len().max(1);
        // SAFETY: `mmap` with `MAP_PRIVATE | MAP_ANONYMOUS` and no backing fd is a
        // well-defined way to obtain a fresh, zeroed page range from the OS.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CompileError::ExecMemoryAllocFailed(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        let ptr = ptr as *mut u8;
        // SAFETY: `ptr` was just mapped read-write for exactly `len` bytes above.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }
        let page = Self { ptr, len };
        page.make_executable()?;
        Ok(page)
    }

    fn make_executable(&self) -> SimpleResult<()> {
        // SAFETY: `self.ptr`/`self.len` describe exactly the mapping created in `new`.
        let rc = unsafe { libc::mprotect(self.ptr as *mut libc::c_void, self.len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(CompileError::ExecMemoryAllocFailed(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        // x86-64 has a coherent instruction cache, but this fence documents the
        // ordering requirement spec §5 names: the final write to executable memory
        // must be visible to the first call into it.
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    /// # Safety
    /// The caller must treat this as a function pointer of the native block ABI and
    /// must not call it after the owning `ExecPage` (and thus the `BlockCache` that
    /// holds it) has been dropped.
    unsafe fn entry_point(&self) -> unsafe extern "C" fn(*mut CoreState) -> u16 {
        std::mem::transmute::<*mut u8, unsafe extern "C" fn(*mut CoreState) -> u16>(self.ptr)
    }
}

/// A cache entry: the executable page plus the guest PC it starts at.
struct CachedBlock {
    page: ExecPage,
    #[allow(dead_code)] // retained for diagnostics / future profiling hooks
    start_pc: u16,
}

/// Compiles, caches, and dispatches guest basic blocks.
pub struct BlockCache {
    entries: HashMap<u16, CachedBlock>,
    options: JitOptions,
}

impl BlockCache {
    /// Build an empty cache using the given compilation options.
    pub fn new(options: JitOptions) -> Self {
        Self {
            entries: HashMap::new(),
            options,
        }
    }

    /// Drop a single cached entry if present.
    ///
    /// Never called internally — the dispatcher never invalidates on its own (no
    /// automatic self-modifying-code detection, per spec). Exposed purely as a seam
    /// for a future embedder-driven invalidation policy.
    pub fn invalidate(&mut self, pc: u16) {
        if self.entries.remove(&pc).is_some() {
            tracing::debug!(pc, "block cache entry invalidated");
        }
    }

    /// Compile the block starting at `pc` against `memory` and install it, replacing
    /// any existing entry at that key.
    fn compile_and_insert(&mut self, memory: &[u8], pc: u16) -> SimpleResult<()> {
        let span = tracing::debug_span!("compile_block", pc);
        let _enter = span.enter();

        let discovered = discover_block(memory, pc);
        tracing::trace!(instrs = discovered.instrs.len(), "block discovered");

        let program = IrBuilder::build(&discovered)?;
        let compiled: CompiledBlock = Emitter::compile(&discovered, &program, &self.options)?;
        tracing::debug!(bytes = compiled.code.len(), "block compiled");

        let page = ExecPage::new(&compiled.code)?;
        self.entries.insert(
            pc,
            CachedBlock {
                page,
                start_pc: compiled.start_pc,
            },
        );
        Ok(())
    }

    /// Look up or compile the block at `pc`, then call into it, returning the next
    /// guest PC.
    fn step(&mut self, core: &mut CoreState, pc: u16) -> SimpleResult<u16> {
        if !self.entries.contains_key(&pc) {
            tracing::trace!(pc, "block cache miss");
            self.compile_and_insert(&core.memory, pc)?;
        } else {
            tracing::trace!(pc, "block cache hit");
        }
        let entry = self.entries.get(&pc).expect("just inserted or already present");
        // SAFETY: `entry.page` holds a block compiled by `Emitter::compile` against
        // this exact `CoreState` layout, mapped executable by `ExecPage::new`, and
        // `core` is a live, pinned `CoreState` the caller guarantees outlives this call.
        let next_pc = unsafe { (entry.page.entry_point())(core as *mut CoreState) };
        Ok(next_pc)
    }

    /// Run the dispatcher loop: compile-or-fetch, execute, repeat, until the host
    /// collaborator's `stop()` returns true or a compilation error aborts the run.
    pub fn run(&mut self, core: &mut CoreState, host: &mut dyn HostCollaborator) -> IoResult<RunOutcome> {
        let outcome = loop {
            let pc = core.program_counter;
            match self.step(core, pc) {
                Ok(next_pc) => core.program_counter = next_pc,
                Err(err) => {
                    tracing::error!(%err, pc, "compilation aborted the run loop");
                    host.on_finished();
                    return Err(err);
                }
            }

            host.publish_display(&core.display.pixels);
            if host.stop() {
                tracing::debug!("run loop stopped by host collaborator");
                break RunOutcome::Stopped;
            }
        };
        host.on_finished();
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NullHost;

    #[test]
    fn cache_miss_then_hit_reuses_the_same_entry() {
        let mut core = CoreState::new_pinned();
        core.load_rom(&[0x60, 0x05, 0x70, 0x03]); // V0 := 5; V0 += 3
        let mut cache = BlockCache::new(JitOptions::default());

        assert!(cache.entries.is_empty());
        let first = cache.step(&mut core, 0x200).unwrap();
        assert_eq!(cache.entries.len(), 1);
        assert_eq!(core.v[0], 8);

        // A second call at the same PC must hit the cache, not recompile.
        core.v[0] = 0;
        core.load_rom(&[0x60, 0x05, 0x70, 0x03]);
        let second = cache.step(&mut core, 0x200).unwrap();
        assert_eq!(cache.entries.len(), 1);
        assert_eq!(first, second);
        assert_eq!(core.v[0], 8);
    }

    #[test]
    fn invalidate_drops_a_single_entry() {
        let mut core = CoreState::new_pinned();
        core.load_rom(&[0x60, 0x05, 0x70, 0x03]);
        let mut cache = BlockCache::new(JitOptions::default());
        cache.step(&mut core, 0x200).unwrap();
        assert_eq!(cache.entries.len(), 1);

        cache.invalidate(0x200);
        assert!(cache.entries.is_empty());
    }

    #[test]
    fn run_stops_when_host_requests_it() {
        let mut core = CoreState::new_pinned();
        // call 0x204; at 0x204: V0 := 0x2A; return — the block returns control to the
        // dispatcher after one native call, so `run` must exit on the first check of
        // `stop()` rather than looping.
        core.load_rom(&[0x22, 0x04, 0x00, 0x00, 0x60, 0x2A, 0x00, 0xEE]);
        let mut cache = BlockCache::new(JitOptions::default());
        let mut host = NullHost::default();
        host.stop_requested = true;

        let outcome = cache.run(&mut core, &mut host).expect("no compilation error");
        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(core.v[0], 0x2A);
    }
}
