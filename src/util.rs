//! Low-level helpers shared across the crate: power-of-two math, aligned
//! raw allocation, checksums, endian swaps, simple statistics and
//! quasi-random sequences.

use rand::distributions::uniform::SampleUniform;
use rand::Rng;

/// Assumed size of a cache line in bytes. Used for alignment of hot atomics
/// and freelist page storage.
pub const CACHE_LINE_SIZE: usize = 64;

#[inline]
#[must_use]
pub const fn is_pow_2(v: usize) -> bool {
    v.is_power_of_two()
}

/// Round up to the next power of two. `next_pow_2(0)` is 1.
#[inline]
#[must_use]
pub const fn next_pow_2(v: usize) -> usize {
    v.next_power_of_two()
}

// ---------------------------------------------------------------------------
// aligned raw allocation
// ---------------------------------------------------------------------------

/// Allocate `size` bytes aligned to `alignment` (a power of two, at least
/// pointer-sized). Returns null on failure.
#[cfg(unix)]
#[must_use]
pub fn aligned_alloc(size: usize, alignment: usize) -> *mut u8 {
    debug_assert!(alignment.is_power_of_two());
    let mut data: *mut libc::c_void = std::ptr::null_mut();
    // Safety: FFI call to posix_memalign; `data` is a valid out-pointer.
    let res = unsafe { libc::posix_memalign(&mut data, alignment, size) };
    if res != 0 {
        return std::ptr::null_mut();
    }
    data.cast::<u8>()
}

/// Release memory obtained from [`aligned_alloc`].
///
/// # Safety
/// - `ptr` must have been returned by [`aligned_alloc`] and not freed since.
#[cfg(unix)]
pub unsafe fn aligned_free(ptr: *mut u8) {
    // Safety: FFI call to free; upheld by caller.
    unsafe { libc::free(ptr.cast::<libc::c_void>()) };
}

#[cfg(windows)]
#[must_use]
pub fn aligned_alloc(size: usize, alignment: usize) -> *mut u8 {
    debug_assert!(alignment.is_power_of_two());
    // Safety: FFI call to _aligned_malloc.
    unsafe { libc::aligned_malloc(size, alignment).cast::<u8>() }
}

/// Release memory obtained from [`aligned_alloc`].
///
/// # Safety
/// - `ptr` must have been returned by [`aligned_alloc`] and not freed since.
#[cfg(windows)]
pub unsafe fn aligned_free(ptr: *mut u8) {
    // Safety: FFI call to _aligned_free; upheld by caller.
    unsafe { libc::aligned_free(ptr.cast::<libc::c_void>()) };
}

// ---------------------------------------------------------------------------
// endian / checksums
// ---------------------------------------------------------------------------

/// Reverse the byte order of a plain-old-data value.
///
/// Intended for integer and raw-struct wire fields; types with invalid bit
/// patterns (`bool`, niche-carrying enums) must not be passed here.
#[must_use]
pub fn swap_endian<T: Copy>(value: T) -> T {
    let mut v = value;
    // Safety: T is Copy and treated as a plain byte buffer of its own size;
    // the slice covers exactly the bytes of `v`.
    unsafe {
        let bytes =
            std::slice::from_raw_parts_mut(std::ptr::addr_of_mut!(v).cast::<u8>(), size_of::<T>());
        bytes.reverse();
    }
    v
}

/// CRC-8, polynomial 0x85 (x^8 + x^7 + x^2 + 1), init 0, no reflection.
#[must_use]
pub fn crc8(data: &[u8]) -> u8 {
    let mut result: u8 = 0;
    for &byte in data {
        result ^= byte;
        for _ in 0..8 {
            if result & 0x80 != 0 {
                result = (result << 1) ^ 0x85;
            } else {
                result <<= 1;
            }
        }
    }
    result
}

/// CRC-16/MODBUS: reflected polynomial 0xA001, init 0xFFFF.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut result: u16 = 0xFFFF;
    for &byte in data {
        result ^= u16::from(byte);
        for _ in 0..8 {
            if result & 0x01 != 0 {
                result = (result >> 1) ^ 0xA001;
            } else {
                result >>= 1;
            }
        }
    }
    result
}

// ---------------------------------------------------------------------------
// statistics
// ---------------------------------------------------------------------------

#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (divides by N).
#[must_use]
pub fn standard_deviation(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let sq_sum: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    (sq_sum / values.len() as f64).sqrt()
}

/// Median value. Even-sized inputs average the two middle values.
#[must_use]
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut tmp = values.to_vec();
    let n = tmp.len() / 2;
    let (lower, nth, _) = tmp.select_nth_unstable_by(n, |a, b| a.total_cmp(b));
    if values.len() % 2 == 1 {
        *nth
    } else {
        let lower_max = lower.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (lower_max + *nth) / 2.0
    }
}

/// Element of the Halton low-discrepancy sequence for `index` in the given
/// `base`, in [0, 1).
#[must_use]
pub fn halton(index: u32, base: u32) -> f32 {
    let mut f = 1.0f32;
    let mut r = 0.0f32;
    let mut current = index;
    while current != 0 {
        f /= base as f32;
        r += f * (current % base) as f32;
        current /= base;
    }
    r
}

/// Uniform random value in `[min, max]`.
pub fn random<T: SampleUniform + PartialOrd>(min: T, max: T) -> T {
    rand::thread_rng().gen_range(min..=max)
}

/// Uniform random integer in `[min, max]`.
pub fn random_int<T: SampleUniform + PartialOrd>(min: T, max: T) -> T {
    random(min, max)
}
