//! The 160-byte block trailer. Field offsets are fixed for wire and hash
//! compatibility; the 92-byte prefix plus the 32-byte nonce is the SHA-256
//! input seeding the solver.

use std::convert::TryInto;

pub const BTRAILER_LEN: usize = 160;

const PHASH: usize = 0;
const BNUM: usize = 32;
const MFEE: usize = 40;
const TCOUNT: usize = 48;
const TIME0: usize = 52;
const DIFFICULTY: usize = 56;
const MROOT: usize = 60;
const NONCE: usize = 92;
const STIME: usize = 124;
const BHASH: usize = 128;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlockTrailer([u8; BTRAILER_LEN]);

impl BlockTrailer {
    pub fn from_bytes(bytes: [u8; BTRAILER_LEN]) -> Self {
        BlockTrailer(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; BTRAILER_LEN] {
        &self.0
    }

    /// The SHA-256 prefix: everything up to and excluding the nonce.
    pub fn prefix(&self) -> &[u8] {
        &self.0[..NONCE]
    }

    pub fn phash(&self) -> [u8; 32] {
        self.0[PHASH..PHASH + 32].try_into().unwrap()
    }

    pub fn set_phash(&mut self, phash: &[u8; 32]) {
        self.0[PHASH..PHASH + 32].copy_from_slice(phash);
    }

    pub fn bnum(&self) -> u64 {
        u64::from_le_bytes(self.0[BNUM..BNUM + 8].try_into().unwrap())
    }

    pub fn set_bnum(&mut self, bnum: u64) {
        self.0[BNUM..BNUM + 8].copy_from_slice(&bnum.to_le_bytes());
    }

    pub fn mfee(&self) -> u64 {
        u64::from_le_bytes(self.0[MFEE..MFEE + 8].try_into().unwrap())
    }

    pub fn set_mfee(&mut self, mfee: u64) {
        self.0[MFEE..MFEE + 8].copy_from_slice(&mfee.to_le_bytes());
    }

    pub fn tcount(&self) -> u32 {
        u32::from_le_bytes(self.0[TCOUNT..TCOUNT + 4].try_into().unwrap())
    }

    pub fn set_tcount(&mut self, tcount: u32) {
        self.0[TCOUNT..TCOUNT + 4].copy_from_slice(&tcount.to_le_bytes());
    }

    pub fn time0(&self) -> u32 {
        u32::from_le_bytes(self.0[TIME0..TIME0 + 4].try_into().unwrap())
    }

    pub fn set_time0(&mut self, time0: u32) {
        self.0[TIME0..TIME0 + 4].copy_from_slice(&time0.to_le_bytes());
    }

    /// Only byte 0 of the difficulty field takes part in the PoW.
    pub fn difficulty(&self) -> u8 {
        self.0[DIFFICULTY]
    }

    pub fn set_difficulty(&mut self, diff: u8) {
        self.0[DIFFICULTY..DIFFICULTY + 4].copy_from_slice(&(diff as u32).to_le_bytes());
    }

    pub fn set_mroot(&mut self, mroot: &[u8; 32]) {
        self.0[MROOT..MROOT + 32].copy_from_slice(mroot);
    }

    pub fn nonce(&self) -> [u8; 32] {
        self.0[NONCE..NONCE + 32].try_into().unwrap()
    }

    pub fn set_nonce(&mut self, nonce: &[u8; 32]) {
        self.0[NONCE..NONCE + 32].copy_from_slice(nonce);
    }

    /// The device derives the upper half; the host refreshes the lower half
    /// before each launch.
    pub fn set_half_nonce(&mut self, half: &[u8; 16]) {
        self.0[NONCE..NONCE + 16].copy_from_slice(half);
        for byte in self.0[NONCE + 16..NONCE + 32].iter_mut() {
            *byte = 0;
        }
    }

    pub fn set_stime(&mut self, stime: u32) {
        self.0[STIME..STIME + 4].copy_from_slice(&stime.to_le_bytes());
    }

    pub fn set_bhash(&mut self, bhash: &[u8; 32]) {
        self.0[BHASH..BHASH + 32].copy_from_slice(bhash);
    }

    /// A pool share difficulty overrides the trailer difficulty only when it
    /// is nonzero and easier.
    pub fn effective_difficulty(&self, share_diff: u8) -> u8 {
        if share_diff != 0 && share_diff < self.difficulty() {
            share_diff
        } else {
            self.difficulty()
        }
    }
}

impl Default for BlockTrailer {
    fn default() -> Self {
        BlockTrailer([0; BTRAILER_LEN])
    }
}

impl std::fmt::Debug for BlockTrailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockTrailer")
            .field("phash", &hex::encode(&self.0[PHASH..PHASH + 32]))
            .field("bnum", &self.bnum())
            .field("tcount", &self.tcount())
            .field("time0", &self.time0())
            .field("difficulty", &self.difficulty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_offsets() {
        let mut bt = BlockTrailer::default();
        bt.set_phash(&[0xaa; 32]);
        bt.set_bnum(0x0102030405060708);
        bt.set_mfee(500);
        bt.set_tcount(17);
        bt.set_time0(0x61626364);
        bt.set_difficulty(0x1c);
        bt.set_mroot(&[0xbb; 32]);
        bt.set_nonce(&[0xcc; 32]);
        bt.set_stime(9);
        bt.set_bhash(&[0xdd; 32]);

        let bytes = bt.as_bytes();
        assert_eq!(&bytes[..32], &[0xaa; 32]);
        assert_eq!(&bytes[32..40], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(bytes[48], 17);
        assert_eq!(&bytes[52..56], &[0x64, 0x63, 0x62, 0x61]);
        assert_eq!(bytes[56], 0x1c);
        assert_eq!(&bytes[60..92], &[0xbb; 32]);
        assert_eq!(&bytes[92..124], &[0xcc; 32]);
        assert_eq!(bytes[124], 9);
        assert_eq!(&bytes[128..160], &[0xdd; 32]);
        assert_eq!(bt.prefix().len(), 92);
    }

    #[test]
    fn half_nonce_zeroes_upper() {
        let mut bt = BlockTrailer::default();
        bt.set_nonce(&[0xff; 32]);
        bt.set_half_nonce(&[0x11; 16]);
        assert_eq!(&bt.nonce()[..16], &[0x11; 16]);
        assert_eq!(&bt.nonce()[16..], &[0; 16]);
    }

    #[test]
    fn difficulty_override() {
        let mut bt = BlockTrailer::default();
        bt.set_difficulty(32);
        assert_eq!(bt.effective_difficulty(0), 32);
        assert_eq!(bt.effective_difficulty(40), 32);
        assert_eq!(bt.effective_difficulty(18), 18);
    }
}
