//! Layout descriptor: a fingerprint of compiler alignment and padding rules
//!
//! Two builds for the same machine, word class and byte order can still lay
//! out the same `#[repr(C)]` struct differently. The descriptor packs the
//! alignment of each primitive into a 4-bit nibble and the size of a
//! header-shaped probe struct into the top byte, so either kind of
//! difference changes the value.

use std::mem::{align_of, size_of};
use std::os::raw::{c_char, c_int, c_long, c_longlong, c_short};

/// Bits per alignment entry
const NIBBLE_BITS: u32 = 4;

/// Mask for one alignment entry
const NIBBLE_MASK: u64 = (1 << NIBBLE_BITS) - 1;

/// Shift of the probe struct size byte
const PROBE_SIZE_SHIFT: u32 = 56;

/// Representative of the structures persisted in a pool header
///
/// Mixes every width so that any change in padding rules changes its size.
#[allow(dead_code)]
#[repr(C)]
struct HeaderProbe {
    signature: [u8; 8],
    major: u32,
    compat: u16,
    flags: u8,
    uuid: [u8; 16],
    created: u64,
    checksum: c_long,
    ptr: *const u8,
    tail: u8,
}

const fn entry(align: usize, slot: u32) -> u64 {
    ((align as u64 - 1) & NIBBLE_MASK) << (slot * NIBBLE_BITS)
}

/// Compute the layout descriptor of this build
///
/// Pure and deterministic: depends only on compile-time layout.
pub const fn layout_descriptor() -> u64 {
    entry(align_of::<c_char>(), 0)
        | entry(align_of::<c_short>(), 1)
        | entry(align_of::<c_int>(), 2)
        | entry(align_of::<c_long>(), 3)
        | entry(align_of::<c_longlong>(), 4)
        | entry(align_of::<usize>(), 5)
        | entry(align_of::<libc::off_t>(), 6)
        | entry(align_of::<f32>(), 7)
        | entry(align_of::<f64>(), 8)
        | entry(align_of::<*const u8>(), 9)
        | (((size_of::<HeaderProbe>() as u64) & 0xFF) << PROBE_SIZE_SHIFT)
}
