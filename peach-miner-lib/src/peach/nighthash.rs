//! Nighthash: the data-dependent dispatcher over the eight hash primitives.
//!
//! `dflops` performs deterministic IEEE-754 binary32 arithmetic over the
//! input and `dmemtx` applies eight rounds of byte transforms; together they
//! pick the digest algorithm. Determinism requires round-to-nearest-even and
//! no multiply-add fusion, which plain Rust `f32` arithmetic guarantees. The
//! OpenCL build must be equally strict: no `-cl-fast-relaxed-math`, no
//! `-cl-mad-enable`, and `-cl-fp32-correctly-rounded-divide-sqrt` set.

use std::convert::TryInto;

use super::hashes;

pub const HASHLEN: usize = 32;

// Byte-index selector constants. The low two bits of each constant, shifted
// by an amount derived from the word's first byte, choose which of the four
// word bytes feeds the op accumulator, the operand, and the sign flip.
const FLOP_OP: u32 = 0x26C34;
const FLOP_OPERAND: u32 = 0x14198;
const FLOP_SIGN: u32 = 0x3D6EC;

/// Deterministic float transform. Walks the buffer one 32-bit word at a
/// time, applies one of {add, sub, mul, div} with a byte-derived operand and
/// accumulates the result bytes into the returned selector. NaNs (before or
/// after the operation) are replaced with `index`; infinities pass through.
/// When `txf` is set the float results are written back into the buffer.
pub fn dflops(data: &mut [u8], len: usize, index: u32, txf: bool) -> u32 {
    let mut op: u32 = 0;
    let mut i = 0;
    while i < len {
        let shift = ((data[i] & 7) as u32 + 1) << 1;
        op = op.wrapping_add(data[i + ((FLOP_OP >> shift) & 3) as usize] as u32);
        let mut operand = data[i + ((FLOP_OPERAND >> shift) & 3) as usize] as u32;
        if data[i + ((FLOP_SIGN >> shift) & 3) as usize] & 1 != 0 {
            // sign flip on the two's-complement integer, before the cast
            operand ^= 0x8000_0000;
        }
        let flv = operand as i32 as f32;
        let mut f = f32::from_le_bytes(data[i..i + 4].try_into().unwrap());
        if f.is_nan() {
            f = index as f32;
        }
        f = match op & 3 {
            0 => f + flv,
            1 => f - flv,
            2 => f * flv,
            _ => f / flv,
        };
        if f.is_nan() {
            f = index as f32;
        }
        let result = f.to_le_bytes();
        if txf {
            data[i..i + 4].copy_from_slice(&result);
        }
        op = op
            .wrapping_add(result[0] as u32)
            .wrapping_add(result[1] as u32)
            .wrapping_add(result[2] as u32)
            .wrapping_add(result[3] as u32);
        i += 4;
    }
    op
}

/// Deterministic memory transform: eight rounds, each picking one of eight
/// byte-level mutations by the running selector.
pub fn dmemtx(data: &mut [u8], len: usize, index: u32) -> u32 {
    let len32 = len >> 2;
    let len16 = len >> 1;
    let mut op = index;
    for i in 0..8u32 {
        op = op.wrapping_add(data[i as usize] as u32);
        match op & 7 {
            0 => {
                let mut words = data[..len32 * 4].chunks_exact_mut(8);
                for w in &mut words {
                    let v = u64::from_le_bytes(w[..].try_into().unwrap()) ^ 0x8181_8181_8181_8181;
                    w.copy_from_slice(&v.to_le_bytes());
                }
                for w in words.into_remainder().chunks_exact_mut(4) {
                    let v = u32::from_le_bytes(w[..].try_into().unwrap()) ^ 0x8181_8181;
                    w.copy_from_slice(&v.to_le_bytes());
                }
            }
            1 => {
                for z in 0..len16 {
                    data.swap(z, len16 + z);
                }
            }
            2 => {
                let mut words = data[..len32 * 4].chunks_exact_mut(8);
                for w in &mut words {
                    let v = !u64::from_le_bytes(w[..].try_into().unwrap());
                    w.copy_from_slice(&v.to_le_bytes());
                }
                for w in words.into_remainder().chunks_exact_mut(4) {
                    let v = !u32::from_le_bytes(w[..].try_into().unwrap());
                    w.copy_from_slice(&v.to_le_bytes());
                }
            }
            3 => {
                for (z, byte) in data[..len].iter_mut().enumerate() {
                    *byte = if z & 1 == 0 {
                        byte.wrapping_add(1)
                    } else {
                        byte.wrapping_sub(1)
                    };
                }
            }
            4 => {
                for (z, byte) in data[..len].iter_mut().enumerate() {
                    *byte = if z & 1 == 0 {
                        byte.wrapping_sub(i as u8)
                    } else {
                        byte.wrapping_add(i as u8)
                    };
                }
            }
            5 => {
                for byte in data[..len].iter_mut() {
                    if *byte == 0x68 {
                        *byte = 0x48;
                    }
                }
            }
            6 => {
                for z in 0..len16 {
                    if data[z] > data[len16 + z] {
                        data.swap(z, len16 + z);
                    }
                }
            }
            _ => {
                for z in 1..len {
                    data[z] ^= data[z - 1];
                }
            }
        }
    }
    op
}

/// Transform the input and hash it with the selected primitive, zero-extended
/// to 256 bits.
///
/// `txlen` carries the transform request: equal to `inlen` enables the full
/// transform (float write-back plus memory transform), a shorter nonzero
/// value restricts `dflops` to that prefix without mutating anything, and
/// zero runs `dflops` over the whole input without mutation.
pub fn nighthash(data: &mut [u8], inlen: usize, index: u32, txlen: usize) -> [u8; HASHLEN] {
    let flops_len = if txlen != 0 { txlen } else { inlen };
    let transform = txlen != 0 && txlen == inlen;
    let mut index = dflops(data, flops_len, index, transform);
    if transform {
        index = dmemtx(data, txlen, index);
    }
    let input = &data[..inlen];
    let mut digest = [0u8; HASHLEN];
    match index & 7 {
        0 => digest = hashes::blake2b_zero32(input),
        1 => digest = hashes::blake2b_zero64(input),
        2 => digest[..20].copy_from_slice(&hashes::sha1(input)),
        3 => digest = hashes::sha256(input),
        4 => digest = hashes::sha3_256(input),
        5 => digest = hashes::keccak256(input),
        6 => digest[..16].copy_from_slice(&hashes::md2(input)),
        _ => digest[..16].copy_from_slice(&hashes::md5(input)),
    }
    digest
}
