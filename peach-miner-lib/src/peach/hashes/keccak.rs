//! Keccak-f[1600] sponge at rate 136, in the two padding modes Peach uses:
//! SHA-3 (domain byte 0x06) and legacy Keccak (domain byte 0x01).

use std::convert::TryInto;

const KECCAK_ROUNDS: usize = 24;
const KECCAK_RATE: usize = 136;

const KECCAK_RC: [u64; KECCAK_ROUNDS] = [
    0x0000000000000001, 0x0000000000008082, 0x800000000000808a, 0x8000000080008000,
    0x000000000000808b, 0x0000000080000001, 0x8000000080008081, 0x8000000000008009,
    0x000000000000008a, 0x0000000000000088, 0x0000000080008009, 0x000000008000000a,
    0x000000008000808b, 0x800000000000008b, 0x8000000000008089, 0x8000000000008003,
    0x8000000000008002, 0x8000000000000080, 0x000000000000800a, 0x800000008000000a,
    0x8000000080008081, 0x8000000000008080, 0x0000000080000001, 0x8000000080008008,
];

// Rotation offsets, state laid out as lane[x + 5 * y].
const KECCAK_RHO: [u32; 25] = [
    0, 1, 62, 28, 27, 36, 44, 6, 55, 20, 3, 10, 43, 25, 39, 41, 45, 15, 21, 8, 18, 2, 61, 56, 14,
];

fn keccak_f(a: &mut [u64; 25]) {
    for &rc in KECCAK_RC.iter() {
        // theta
        let mut c = [0u64; 5];
        for x in 0..5 {
            c[x] = a[x] ^ a[x + 5] ^ a[x + 10] ^ a[x + 15] ^ a[x + 20];
        }
        for x in 0..5 {
            let d = c[(x + 4) % 5] ^ c[(x + 1) % 5].rotate_left(1);
            for y in 0..5 {
                a[x + 5 * y] ^= d;
            }
        }
        // rho and pi
        let mut b = [0u64; 25];
        for x in 0..5 {
            for y in 0..5 {
                b[y + 5 * ((2 * x + 3 * y) % 5)] = a[x + 5 * y].rotate_left(KECCAK_RHO[x + 5 * y]);
            }
        }
        // chi
        for y in 0..5 {
            for x in 0..5 {
                a[x + 5 * y] = b[x + 5 * y] ^ (!b[(x + 1) % 5 + 5 * y] & b[(x + 2) % 5 + 5 * y]);
            }
        }
        a[0] ^= rc;
    }
}

fn sponge256(data: &[u8], domain: u8) -> [u8; 32] {
    let mut a = [0u64; 25];
    let mut blocks = data.chunks_exact(KECCAK_RATE);
    for block in &mut blocks {
        for (i, lane) in block.chunks_exact(8).enumerate() {
            a[i] ^= u64::from_le_bytes(lane.try_into().unwrap());
        }
        keccak_f(&mut a);
    }
    let rem = blocks.remainder();
    let mut tail = [0u8; KECCAK_RATE];
    tail[..rem.len()].copy_from_slice(rem);
    tail[rem.len()] ^= domain;
    tail[KECCAK_RATE - 1] ^= 0x80;
    for (i, lane) in tail.chunks_exact(8).enumerate() {
        a[i] ^= u64::from_le_bytes(lane.try_into().unwrap());
    }
    keccak_f(&mut a);
    let mut digest = [0u8; 32];
    for (out, lane) in digest.chunks_exact_mut(8).zip(a.iter()) {
        out.copy_from_slice(&lane.to_le_bytes());
    }
    digest
}

pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    sponge256(data, 0x06)
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    sponge256(data, 0x01)
}

#[cfg(test)]
mod tests {
    use super::{keccak256, sha3_256};
    use sha3::Digest;

    #[test]
    fn nist_vector() {
        assert_eq!(
            hex::encode(sha3_256(b"abc")),
            "3a985da74fe225b2045c172d6bd390bd855f086e3e9d525b46bfe24511431532"
        );
        assert_eq!(
            hex::encode(keccak256(b"abc")),
            "4e03657aea45a94fc7d47ba826c8d667c0d1e6e33a64a036ec44f58fa12d6c45"
        );
    }

    #[test]
    fn agrees_with_rustcrypto_at_peach_lengths() {
        for &len in &[0usize, 36, 135, 136, 137, 1060] {
            let data: Vec<u8> = (0..len).map(|i| (i * 13 + 7) as u8).collect();
            let sha3_ref: [u8; 32] = sha3::Sha3_256::digest(&data).into();
            let keccak_ref: [u8; 32] = sha3::Keccak256::digest(&data).into();
            assert_eq!(sha3_256(&data), sha3_ref, "sha3 len {}", len);
            assert_eq!(keccak256(&data), keccak_ref, "keccak len {}", len);
        }
    }
}
