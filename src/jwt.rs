//! Minimal HS256 JWT encode/verify, used only by `cert_share` to wrap the
//! encrypted certificate envelope (spec §4.6).
//!
//! No general-purpose JWT crate is in the dependency stack, so this builds
//! the token directly from the already-grounded `hmac`+`sha2`+`base64`
//! primitives, in the same spirit as the teacher's `crypto.rs` hand-rolling
//! the AES-GCM envelope rather than reaching for a framework.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(serde::Serialize)]
struct Header<'a> {
    alg: &'a str,
    typ: &'a str,
}

/// Encode `claims` as a compact HS256 JWT signed with `secret`.
pub fn encode<T: Serialize>(claims: &T, secret: &[u8]) -> Result<String> {
    let header = Header { alg: "HS256", typ: "JWT" };
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signing_input = format!("{header_b64}.{payload_b64}");

    let mut mac = HmacSha256::new_from_slice(secret).context("invalid HMAC key length")?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature}"))
}

/// Verify the signature on `token` and deserialize its claims. Does not
/// check `exp`/`iat`; callers with expiry semantics check those fields
/// themselves (see `cert_share`).
pub fn decode<T: DeserializeOwned>(token: &str, secret: &[u8]) -> Result<T> {
    let mut parts = token.split('.');
    let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        bail!("malformed JWT: expected exactly three dot-separated segments");
    };

    let signing_input = format!("{header_b64}.{payload_b64}");
    let mut mac = HmacSha256::new_from_slice(secret).context("invalid HMAC key length")?;
    mac.update(signing_input.as_bytes());

    let signature = URL_SAFE_NO_PAD.decode(signature_b64).context("invalid base64 signature")?;
    mac.verify_slice(&signature).context("JWT signature verification failed")?;

    let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("invalid base64 payload")?;
    serde_json::from_slice(&payload).context("failed to parse JWT payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Claims {
        sub: String,
        exp: i64,
    }

    #[test]
    fn roundtrip_with_correct_secret() {
        let claims = Claims { sub: "alpha".into(), exp: 123 };
        let token = encode(&claims, b"secret").unwrap();
        let decoded: Claims = decode(&token, b"secret").unwrap();
        assert_eq!(claims, decoded);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let claims = Claims { sub: "alpha".into(), exp: 123 };
        let token = encode(&claims, b"secret").unwrap();
        let result: Result<Claims> = decode(&token, b"wrong-secret");
        assert!(result.is_err());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let claims = Claims { sub: "alpha".into(), exp: 123 };
        let token = encode(&claims, b"secret").unwrap();
        let mut segments: Vec<&str> = token.split('.').collect();
        let tampered_payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"mallory","exp":123}"#);
        segments[1] = &tampered_payload;
        let tampered = segments.join(".");
        let result: Result<Claims> = decode(&tampered, b"secret");
        assert!(result.is_err());
    }

    #[test]
    fn malformed_token_is_rejected() {
        let result: Result<Claims> = decode("not-a-jwt", b"secret");
        assert!(result.is_err());
    }
}
