//! The eight fixed hash primitives Nighthash dispatches over.
//!
//! These are hand-rolled rather than pulled from crates because the OpenCL
//! kernel carries the same algorithms and the two sides must agree bit for
//! bit; the RustCrypto implementations serve as test oracles instead.

mod blake2b;
mod keccak;
mod md2;
mod md5;
mod sha1;
mod sha256;

pub use blake2b::{blake2b_zero32, blake2b_zero64, key_block_midstate};
pub use blake2b::{BLAKE2B_MID_KEY32, BLAKE2B_MID_KEY64};
pub use keccak::{keccak256, sha3_256};
pub use md2::md2;
pub use md5::md5;
pub use sha1::sha1;
pub use sha256::sha256;
