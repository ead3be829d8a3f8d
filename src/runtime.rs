//! Runtime helpers invoked from compiled code.
//!
//! A handful of guest opcodes need more than register/memory arithmetic — a PRNG,
//! BCD decomposition, or host-observed key/timer state — so the emitter does not try
//! to inline them. Instead it bakes the address of one of these `extern "C"` functions
//! into the generated block as an immediate and emits a direct `call`. Every helper
//! takes the core-state pointer first so it can read or write guest-observable state
//! through the same pointer compiled code already holds in its reserved register.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::consts::MEMORY_SIZE;
use crate::core_state::CoreState;

/// Process-wide xorshift64* state backing [`rt_random_byte`]. The dispatcher runs one
/// `CoreState` at a time under single-threaded cooperative scheduling, so a
/// process-wide generator is equivalent to a per-core one and avoids growing the
/// frozen `CoreState` layout for a concern that isn't guest-observable state.
static RNG_STATE: AtomicU64 = AtomicU64::new(0x9E3779B97F4A7C15);

fn xorshift64star(state: u64) -> u64 {
    let mut x = state;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    x
}

/// `Random vx, #mask` (`Cxkk`): draw one byte and mask it.
///
/// # Safety
/// `core` must point to a live, pinned [`CoreState`].
pub unsafe extern "C" fn rt_random_byte(_core: *mut CoreState, mask: u8) -> u8 {
    let prev = RNG_STATE.load(Ordering::Relaxed);
    let next = xorshift64star(prev);
    RNG_STATE.store(next, Ordering::Relaxed);
    (next.wrapping_mul(0x2545F4914F6CDD1D) >> 56) as u8 & mask
}

/// `Bcd vx` (`Fx33`): decompose `value` into three decimal digits and store them at
/// `memory[index_register..index_register + 3]`.
///
/// # Safety
/// `core` must point to a live, pinned [`CoreState`] with `index_register + 2` in
/// bounds of `memory`.
pub unsafe extern "C" fn rt_write_bcd(core: *mut CoreState, value: u8) {
    let core = &mut *core;
    let base = core.index_register as usize;
    assert!(base + 2 < MEMORY_SIZE, "Bcd write out of guest memory bounds");
    core.memory[base] = value / 100;
    core.memory[base + 1] = (value / 10) % 10;
    core.memory[base + 2] = value % 10;
}

/// `Ex9E`/`ExA1` key-skip: whether hex key `key` (`0..16`) is currently held down.
///
/// # Safety
/// `core` must point to a live, pinned [`CoreState`].
pub unsafe extern "C" fn rt_key_state(core: *mut CoreState, key: u8) -> u8 {
    let core = &*core;
    core.key_state.get(key as usize).copied().unwrap_or(false) as u8
}

/// `Fx0A` (`WaitKeyPress`): scan for any currently-held key, lowest index first.
/// Returns the key index (`0..16`) if one is held, or `0xFF` if none is.
///
/// # Safety
/// `core` must point to a live, pinned [`CoreState`].
pub unsafe extern "C" fn rt_scan_pressed_key(core: *mut CoreState) -> u8 {
    let core = &*core;
    core.key_state
        .iter()
        .position(|&pressed| pressed)
        .map(|index| index as u8)
        .unwrap_or(0xFF)
}

/// `Fx07`/`Fx15`/`Fx18`: read the delay (`which == 0`) or sound (`which == 1`) timer.
///
/// # Safety
/// `core` must point to a live, pinned [`CoreState`].
pub unsafe extern "C" fn rt_read_timer(core: *mut CoreState, which: u8) -> u8 {
    let core = &*core;
    if which == 0 {
        core.delay_timer
    } else {
        core.sound_timer
    }
}

/// Write side of the timer family above.
///
/// # Safety
/// `core` must point to a live, pinned [`CoreState`].
pub unsafe extern "C" fn rt_write_timer(core: *mut CoreState, which: u8, value: u8) {
    let core = &mut *core;
    if which == 0 {
        core.delay_timer = value;
    } else {
        core.sound_timer = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_byte_respects_mask() {
        let mut core = CoreState::new_pinned();
        for _ in 0..64 {
            let got = unsafe { rt_random_byte(&mut *core, 0x0F) };
            assert_eq!(got & !0x0F, 0);
        }
    }

    #[test]
    fn bcd_decomposes_exact_digits() {
        let mut core = CoreState::new_pinned();
        core.index_register = 0x300;
        unsafe { rt_write_bcd(&mut *core, 234) };
        assert_eq!(&core.memory[0x300..0x303], &[2, 3, 4]);
    }

    #[test]
    fn timers_round_trip() {
        let mut core = CoreState::new_pinned();
        unsafe { rt_write_timer(&mut *core, 0, 42) };
        unsafe { rt_write_timer(&mut *core, 1, 7) };
        assert_eq!(unsafe { rt_read_timer(&mut *core, 0) }, 42);
        assert_eq!(unsafe { rt_read_timer(&mut *core, 1) }, 7);
    }

    #[test]
    fn key_state_reflects_host_writes() {
        let mut core = CoreState::new_pinned();
        core.key_state[5] = true;
        assert_eq!(unsafe { rt_key_state(&mut *core, 5) }, 1);
        assert_eq!(unsafe { rt_key_state(&mut *core, 6) }, 0);
    }

    #[test]
    fn scan_pressed_key_finds_lowest_index_or_sentinel() {
        let mut core = CoreState::new_pinned();
        assert_eq!(unsafe { rt_scan_pressed_key(&mut *core) }, 0xFF);
        core.key_state[9] = true;
        core.key_state[3] = true;
        assert_eq!(unsafe { rt_scan_pressed_key(&mut *core) }, 3);
    }
}
