//! Blake2b-256 keyed with all-zero keys of 32 and 64 bytes.
//!
//! The key-setup compression over the zero-padded key block is constant per
//! key length, so both chain states are precomputed and every digest starts
//! directly on message data. The GPU kernel carries the same two states;
//! `key_block_midstate` exists so tests can prove them equal to a from-scratch
//! key compression.

use std::convert::TryInto;

pub const BLAKE2B_IV: [u64; 8] = [
    0x6a09e667f3bcc908, 0xbb67ae8584caa73b, 0x3c6ef372fe94f82b, 0xa54ff53a5f1d36f1,
    0x510e527fade682d1, 0x9b05688c2b3e6c1f, 0x1f83d9abfb41bd6b, 0x5be0cd19137e2179,
];

const SIGMA: [[usize; 16]; 10] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
    [14, 10, 4, 8, 9, 15, 13, 6, 1, 12, 0, 2, 11, 7, 5, 3],
    [11, 8, 12, 0, 5, 2, 15, 13, 10, 14, 3, 6, 7, 1, 9, 4],
    [7, 9, 3, 1, 13, 12, 11, 14, 2, 6, 5, 10, 4, 0, 15, 8],
    [9, 0, 5, 7, 2, 4, 10, 15, 14, 1, 11, 12, 6, 8, 3, 13],
    [2, 12, 6, 10, 0, 11, 8, 3, 4, 13, 7, 5, 15, 14, 1, 9],
    [12, 5, 1, 15, 14, 13, 4, 10, 0, 7, 6, 3, 9, 2, 8, 11],
    [13, 11, 7, 14, 12, 1, 3, 9, 5, 0, 15, 4, 8, 6, 2, 10],
    [6, 15, 14, 9, 11, 3, 0, 8, 12, 2, 13, 7, 1, 4, 10, 5],
    [10, 2, 8, 4, 7, 6, 1, 5, 15, 11, 9, 14, 3, 12, 13, 0],
];

pub const BLAKE2B_MID_KEY32: [u64; 8] = [
    0x63320ace264383eb, 0x012af5fd045a2737, 0xf4f49c55e6be39df, 0x791c5bc8affb11a7,
    0xc9bcacc002c0ea21, 0x8295b8abe2fdedd6, 0xb711490e5f9f41c8, 0x3f8e4d1d9ebeaf1a,
];

pub const BLAKE2B_MID_KEY64: [u64; 8] = [
    0x4b3ef40571692180, 0x828d6faf58119fea, 0xc17e93cd030d4a0b, 0x0ec6dadf4b584d2c,
    0x2828e55d48814e5e, 0xeabb1dc78fb01fdd, 0x77252f81e4ce0b22, 0xe5f8cbe830921646,
];

fn compress(h: &mut [u64; 8], block: &[u8], t: u64, last: bool) {
    let mut m = [0u64; 16];
    for (mi, chunk) in m.iter_mut().zip(block.chunks_exact(8)) {
        *mi = u64::from_le_bytes(chunk.try_into().unwrap());
    }
    let mut v = [0u64; 16];
    v[..8].copy_from_slice(h);
    v[8..].copy_from_slice(&BLAKE2B_IV);
    v[12] ^= t;
    if last {
        v[14] = !v[14];
    }

    macro_rules! g {
        ($a:expr, $b:expr, $c:expr, $d:expr, $x:expr, $y:expr) => {
            v[$a] = v[$a].wrapping_add(v[$b]).wrapping_add($x);
            v[$d] = (v[$d] ^ v[$a]).rotate_right(32);
            v[$c] = v[$c].wrapping_add(v[$d]);
            v[$b] = (v[$b] ^ v[$c]).rotate_right(24);
            v[$a] = v[$a].wrapping_add(v[$b]).wrapping_add($y);
            v[$d] = (v[$d] ^ v[$a]).rotate_right(16);
            v[$c] = v[$c].wrapping_add(v[$d]);
            v[$b] = (v[$b] ^ v[$c]).rotate_right(63);
        };
    }

    for round in 0..12 {
        let s = &SIGMA[round % 10];
        g!(0, 4, 8, 12, m[s[0]], m[s[1]]);
        g!(1, 5, 9, 13, m[s[2]], m[s[3]]);
        g!(2, 6, 10, 14, m[s[4]], m[s[5]]);
        g!(3, 7, 11, 15, m[s[6]], m[s[7]]);
        g!(0, 5, 10, 15, m[s[8]], m[s[9]]);
        g!(1, 6, 11, 12, m[s[10]], m[s[11]]);
        g!(2, 7, 8, 13, m[s[12]], m[s[13]]);
        g!(3, 4, 9, 14, m[s[14]], m[s[15]]);
    }

    for i in 0..8 {
        h[i] ^= v[i] ^ v[i + 8];
    }
}

/// Chain state after compressing the zero-padded all-zero key block.
pub fn key_block_midstate(keylen: usize) -> [u64; 8] {
    let mut h = BLAKE2B_IV;
    h[0] ^= 0x0101_0000 ^ ((keylen as u64) << 8) ^ 32;
    compress(&mut h, &[0u8; 128], 128, false);
    h
}

fn hash_from(mut h: [u64; 8], data: &[u8]) -> [u8; 32] {
    debug_assert!(!data.is_empty());
    let mut t = 128u64;
    let mut pos = 0;
    while data.len() - pos > 128 {
        t += 128;
        compress(&mut h, &data[pos..pos + 128], t, false);
        pos += 128;
    }
    let mut tail = [0u8; 128];
    tail[..data.len() - pos].copy_from_slice(&data[pos..]);
    t += (data.len() - pos) as u64;
    compress(&mut h, &tail, t, true);
    let mut digest = [0u8; 32];
    for (out, word) in digest.chunks_exact_mut(8).zip(h.iter()) {
        out.copy_from_slice(&word.to_le_bytes());
    }
    digest
}

pub fn blake2b_zero32(data: &[u8]) -> [u8; 32] {
    hash_from(BLAKE2B_MID_KEY32, data)
}

pub fn blake2b_zero64(data: &[u8]) -> [u8; 32] {
    hash_from(BLAKE2B_MID_KEY64, data)
}
