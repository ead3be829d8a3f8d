//! Frozen sizes and offsets for the pinned core state.
//!
//! Every constant here is part of the ABI compiled blocks rely on: the emitter bakes
//! these numbers into generated code as `[base + offset]` addressing. Changing any of
//! them invalidates every block a running process has already compiled.

/// Number of guest general-purpose registers, `V0..=VF`.
pub const GP_REGISTER_COUNT: usize = 16;

/// Register index of `VF`, the flags register.
pub const VF_INDEX: usize = 0xF;

/// Guest program memory size, in bytes.
pub const MEMORY_SIZE: usize = 0x1000;

/// Guest PC at which a loaded ROM begins execution.
pub const ROM_ENTRY_POINT: u16 = 0x200;

/// Guest display width, in pixels.
pub const DISPLAY_WIDTH: usize = 64;

/// Guest display height, in pixels.
pub const DISPLAY_HEIGHT: usize = 32;

/// Guest display size, one byte per pixel.
pub const DISPLAY_SIZE: usize = DISPLAY_WIDTH * DISPLAY_HEIGHT;

/// Alignment of the display region, wide enough for the host's widest SIMD store.
pub const DISPLAY_ALIGN: usize = 64;

/// Capacity of the guest call stack, in 16-bit entries.
pub const CALL_STACK_CAPACITY: usize = 16;

/// Size of the default font glyph set installed at memory offset 0.
pub const FONT_SIZE: usize = 80;

/// Host general-purpose registers the allocator may hand out, plus the two reserved
/// for the core-state pointer and the scratch register (see DESIGN.md).
pub const HOST_REGISTER_BUDGET: usize = 16 + 2;

static_assertions::const_assert!(MEMORY_SIZE > ROM_ENTRY_POINT as usize);
static_assertions::const_assert!(DISPLAY_SIZE == 2048);
static_assertions::const_assert!(GP_REGISTER_COUNT == 16);
static_assertions::const_assert!(CALL_STACK_CAPACITY <= 48 && CALL_STACK_CAPACITY >= 16);
