//! Inter-service request signatures.
//!
//! A signature is the hex HMAC-SHA256 of `valid || path`, where `valid` is a
//! unix timestamp after which the signature stops being accepted.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::{TransferError, TransferResult};

type HmacSha256 = Hmac<Sha256>;

/// Query parameters carried by a signed request.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub valid: String,
    pub signature: String,
}

fn mac(key: &[u8], message: &str) -> TransferResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| TransferError::Unauthorized("unusable signing key".into()))?;
    mac.update(message.as_bytes());
    Ok(mac)
}

/// Sign `path` for `valid_for` from now.
#[cfg(test)]
pub fn sign_api_request(path: &str, valid_for: std::time::Duration, key: &[u8]) -> TransferResult<Signature> {
    let valid = (chrono::Utc::now().timestamp() + valid_for.as_secs() as i64).to_string();
    let digest = mac(key, &format!("{valid}{path}"))?.finalize().into_bytes();
    Ok(Signature {
        valid,
        signature: hex::encode(digest),
    })
}

/// Check `signature` over `path` against every configured secret.
pub fn verify_signature(
    tokens: &[String],
    path: &str,
    valid: &str,
    signature: &str,
) -> TransferResult<()> {
    let expires: i64 = valid
        .parse()
        .map_err(|_| TransferError::Unauthorized("Signature validity is not a timestamp".into()))?;
    if expires < chrono::Utc::now().timestamp() {
        return Err(TransferError::Unauthorized("Signature validity expired".into()));
    }

    let provided = hex::decode(signature)
        .map_err(|_| TransferError::Unauthorized("Missing valid query signature".into()))?;
    let message = format!("{valid}{path}");
    for token in tokens {
        if mac(token.as_bytes(), &message)?.verify_slice(&provided).is_ok() {
            return Ok(());
        }
    }
    Err(TransferError::Unauthorized("Missing valid query signature".into()))
}
