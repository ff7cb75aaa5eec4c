//! Random token generation for credentials, foundations, and STUN transaction IDs.
//!
//! Uses the OS-backed `rand::thread_rng` throughout, per Design Notes' guidance
//! to prefer a cryptographically strong RNG over a historical `random()` call.

use rand::distributions::{Alphanumeric, DistString};

pub(crate) fn random_alphanumeric(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

pub(crate) fn random_transaction_id() -> [u8; 12] {
    rand::random()
}

pub(crate) fn random_foundation() -> String {
    random_alphanumeric(8)
}
