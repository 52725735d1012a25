//! Keyed, order-independent digests over mount parameter maps.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Errors raised while signing or verifying a parameter map.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TokenError {
    /// The shared secret is empty.
    #[error("shared secret must not be empty")]
    EmptySecret,
    /// The token does not match the parameter map.
    #[error("token does not match the command parameters")]
    Mismatch,
}

/// Renders the map as `k=v` pairs sorted by key and joined with `&`.
///
/// The map type already orders its keys, so two maps with equal contents
/// produce equal strings regardless of insertion order.
#[must_use]
pub fn canonical(parameters: &BTreeMap<String, String>) -> String {
    parameters
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Computes the lowercase hex HMAC-SHA256 of the canonical form.
///
/// # Errors
///
/// Returns [`TokenError::EmptySecret`] when `secret` is empty.
pub fn sign(secret: &str, parameters: &BTreeMap<String, String>) -> Result<String, TokenError> {
    if secret.is_empty() {
        return Err(TokenError::EmptySecret);
    }
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| TokenError::EmptySecret)?;
    mac.update(canonical(parameters).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Recomputes the digest and compares it with `token` in constant time.
///
/// # Errors
///
/// Returns [`TokenError::Mismatch`] for any difference and
/// [`TokenError::EmptySecret`] when `secret` is empty.
pub fn verify(
    secret: &str,
    parameters: &BTreeMap<String, String>,
    token: &str,
) -> Result<(), TokenError> {
    let expected = sign(secret, parameters)?;
    if bool::from(expected.as_bytes().ct_eq(token.as_bytes())) {
        Ok(())
    } else {
        Err(TokenError::Mismatch)
    }
}
