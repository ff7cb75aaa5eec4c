//! The STUN codec interface the core consumes (§6). Message encoding/decoding
//! and HMAC/fingerprint computation are out of scope for this crate; the core
//! only ever builds and inspects [`StunMessage`] values and asks a [`StunCodec`]
//! to turn them into bytes or back.

use crate::TransportAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Request,
    Success,
    Error,
    Indication,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    pub class: u16,
    pub number: u16,
    pub reason: String,
}

impl ErrorCode {
    pub fn new(number: u16, reason: impl Into<String>) -> Self {
        ErrorCode {
            class: number / 100,
            number,
            reason: reason.into(),
        }
    }

    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 431;
    pub const ROLE_CONFLICT: u16 = 487;
}

/// Either side of a STUN binding exchange. Carries exactly the attributes the
/// core's connectivity checks need (§6); FINGERPRINT and MESSAGE-INTEGRITY are
/// presence flags only — their actual bytes and verification live in the codec.
#[derive(Debug, Clone)]
pub struct StunMessage {
    pub class: Class,
    pub transaction_id: [u8; 12],
    pub username: Option<String>,
    pub message_integrity: bool,
    pub fingerprint: bool,
    pub priority: Option<u32>,
    pub use_candidate: bool,
    pub ice_controlling: Option<u64>,
    pub ice_controlled: Option<u64>,
    pub xor_mapped_address: Option<TransportAddress>,
    pub error_code: Option<ErrorCode>,
}

impl StunMessage {
    pub fn request(transaction_id: [u8; 12]) -> Self {
        StunMessage {
            class: Class::Request,
            transaction_id,
            username: None,
            message_integrity: false,
            fingerprint: false,
            priority: None,
            use_candidate: false,
            ice_controlling: None,
            ice_controlled: None,
            xor_mapped_address: None,
            error_code: None,
        }
    }

    pub fn success(transaction_id: [u8; 12]) -> Self {
        StunMessage {
            class: Class::Success,
            ..StunMessage::request(transaction_id)
        }
    }

    pub fn error(transaction_id: [u8; 12], error_code: ErrorCode) -> Self {
        StunMessage {
            class: Class::Error,
            error_code: Some(error_code),
            ..StunMessage::request(transaction_id)
        }
    }

    pub fn indication(transaction_id: [u8; 12]) -> Self {
        StunMessage {
            class: Class::Indication,
            ..StunMessage::request(transaction_id)
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed STUN message")]
pub struct StunDecodeError;

pub trait StunCodec {
    /// Encode `msg`. When `integrity_key` is `Some`, MESSAGE-INTEGRITY is computed
    /// over the message using it as the short-term HMAC key, and FINGERPRINT is
    /// appended with the length field temporarily reduced by 8 bytes while the
    /// HMAC is computed, per §6.
    fn encode(&self, msg: &StunMessage, integrity_key: Option<&[u8]>) -> Vec<u8>;

    fn decode(&self, bytes: &[u8]) -> Result<StunMessage, StunDecodeError>;

    /// Verify MESSAGE-INTEGRITY against `key`, recomputing the HMAC with the
    /// length field temporarily reduced by 8 bytes to exclude FINGERPRINT.
    fn verify_integrity_short_term(&self, bytes: &[u8], key: &[u8]) -> bool;
}
