//! Signed pagination cursors
//!
//! Cursors are opaque base64url tokens: a JSON payload and an HMAC-SHA256
//! signature. Verification is timing-safe through the hmac crate. Secret
//! rotation invalidates outstanding cursors by construction.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use engram_core::{EngramResult, SystemError, ValidationError};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Upper bound on an encoded cursor.
pub const MAX_CURSOR_BYTES: usize = 512;

#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    /// Result offset the next page starts at.
    o: i64,
}

/// Encoder/decoder bound to one HMAC secret.
#[derive(Clone)]
pub struct CursorCodec {
    secret: Vec<u8>,
}

impl CursorCodec {
    /// The secret must be non-empty and non-whitespace.
    pub fn new(secret: &str) -> EngramResult<Self> {
        if secret.trim().is_empty() {
            return Err(SystemError::Config {
                reason: "cursor secret must be non-empty and non-whitespace".into(),
            }
            .into());
        }
        Ok(Self {
            secret: secret.as_bytes().to_vec(),
        })
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length")
    }

    pub fn encode(&self, offset: u64) -> String {
        let payload = serde_json::to_vec(&CursorPayload { o: offset as i64 })
            .expect("cursor payload serializes");
        let mut mac = self.mac();
        mac.update(&payload);
        let signature = mac.finalize().into_bytes();
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature)
        )
    }

    /// Decode and verify. Oversized, malformed, forged, and negative
    /// cursors are all validation errors, never panics.
    pub fn decode(&self, token: &str) -> EngramResult<u64> {
        if token.len() > MAX_CURSOR_BYTES {
            return Err(ValidationError::CursorTooLarge {
                size: token.len(),
                max: MAX_CURSOR_BYTES,
            }
            .into());
        }
        let (payload_part, signature_part) =
            token.split_once('.').ok_or(ValidationError::InvalidCursor {
                reason: "missing signature".into(),
            })?;
        let payload =
            URL_SAFE_NO_PAD
                .decode(payload_part)
                .map_err(|_| ValidationError::InvalidCursor {
                    reason: "payload is not base64url".into(),
                })?;
        let signature =
            URL_SAFE_NO_PAD
                .decode(signature_part)
                .map_err(|_| ValidationError::InvalidCursor {
                    reason: "signature is not base64url".into(),
                })?;

        let mut mac = self.mac();
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| ValidationError::InvalidCursor {
                reason: "signature mismatch".into(),
            })?;

        let decoded: CursorPayload =
            serde_json::from_slice(&payload).map_err(|_| ValidationError::InvalidCursor {
                reason: "malformed payload".into(),
            })?;
        if decoded.o < 0 {
            return Err(ValidationError::InvalidCursor {
                reason: "negative offset".into(),
            }
            .into());
        }
        Ok(decoded.o as u64)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let codec = CursorCodec::new("secret-key").unwrap();
        let token = codec.encode(42);
        assert_eq!(codec.decode(&token).unwrap(), 42);
    }

    #[test]
    fn test_blank_secret_rejected() {
        assert!(CursorCodec::new("").is_err());
        assert!(CursorCodec::new("   ").is_err());
    }

    #[test]
    fn test_tampered_cursor_rejected() {
        let codec = CursorCodec::new("secret-key").unwrap();
        let token = codec.encode(42);
        let mut tampered = token.clone();
        tampered.replace_range(0..1, "A");
        assert!(codec.decode(&tampered).is_err());
    }

    #[test]
    fn test_rotation_invalidates() {
        let old = CursorCodec::new("old-secret").unwrap();
        let new = CursorCodec::new("new-secret").unwrap();
        let token = old.encode(7);
        assert!(new.decode(&token).is_err());
    }

    #[test]
    fn test_oversized_cursor_rejected() {
        let codec = CursorCodec::new("secret-key").unwrap();
        let oversized = "A".repeat(MAX_CURSOR_BYTES + 1);
        let err = codec.decode(&oversized).unwrap_err();
        assert_eq!(err.code(), 1007);
    }

    #[test]
    fn test_negative_offset_rejected() {
        let codec = CursorCodec::new("secret-key").unwrap();
        // Forge a validly-signed negative payload.
        let payload = serde_json::to_vec(&CursorPayload { o: -1 }).unwrap();
        let mut mac = codec.mac();
        mac.update(&payload);
        let sig = mac.finalize().into_bytes();
        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(sig)
        );
        let err = codec.decode(&token).unwrap_err();
        assert_eq!(err.code(), 1006);
    }

    #[test]
    fn test_garbage_never_panics() {
        let codec = CursorCodec::new("secret-key").unwrap();
        for garbage in ["", ".", "a.b", "!!!.???", "AAAA"] {
            assert!(codec.decode(garbage).is_err());
        }
    }
}
