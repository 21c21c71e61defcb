//! Invertible 64-bit hashing.
//!
//! The leapfrog table stores hashes instead of keys, so the hash has to be a
//! bijection: [`deavalanche`] recovers the key from a stored hash. Key `0`
//! hashes to `0`, which the table reserves for empty cells.

const MUL_1: u64 = 0xff51_afd7_ed55_8ccd;
const MUL_2: u64 = 0xc4ce_b9fe_1a85_ec53;
const INV_MUL_1: u64 = 0x4f74_430c_22a5_4005;
const INV_MUL_2: u64 = 0x9cb4_b2f8_1293_37db;

/// MurmurHash3 finalizer.
#[inline]
pub const fn avalanche(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(MUL_1);
    h ^= h >> 33;
    h = h.wrapping_mul(MUL_2);
    h ^= h >> 33;
    h
}

/// Inverse of [`avalanche`].
#[inline]
pub const fn deavalanche(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(INV_MUL_2);
    h ^= h >> 33;
    h = h.wrapping_mul(INV_MUL_1);
    h ^= h >> 33;
    h
}

#[inline]
pub const fn round_up_power_of_two(value: u64) -> u64 {
    if value <= 1 {
        1
    } else {
        value.next_power_of_two()
    }
}
