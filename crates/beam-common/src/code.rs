//! Peer-code minting.
//!
//! A peer code is the Base58 encoding of 12 random bytes drawn from the
//! OS RNG. 96 bits of entropy make a collision within a process run
//! effectively impossible; the registry still treats an occupied slot as a
//! hard error.

use rand::rngs::OsRng;
use rand::RngCore;

const CODE_BYTES: usize = 12;

/// Mints a fresh peer code.
///
/// # Examples
///
/// ```
/// let code = beam_common::code::mint();
/// assert!(!code.is_empty());
/// assert_ne!(code, beam_common::code::mint());
/// ```
#[must_use]
pub fn mint() -> String {
    let mut bytes = [0u8; CODE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    bs58::encode(bytes).into_string()
}
