use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use thiserror::Error;

/// HMAC-SHA-1-96: full 20-byte MAC carried on the wire.
pub const KEY_ID_HMAC_SHA1: u16 = 1;
/// HMAC-SHA-256-128: full 32-byte MAC carried on the wire.
pub const KEY_ID_HMAC_SHA256: u16 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("unknown key id {0}")]
    UnknownKeyId(u16),

    #[error("auth data length {actual} does not match algorithm length {expected}")]
    LenMismatch { expected: usize, actual: usize },

    #[error("HMAC verification failed")]
    Failed,
}

/// Wire size of the MAC selected by `key_id`.
pub fn mac_len(key_id: u16) -> Result<usize, AuthError> {
    match key_id {
        KEY_ID_HMAC_SHA1 => Ok(20),
        KEY_ID_HMAC_SHA256 => Ok(32),
        other => Err(AuthError::UnknownKeyId(other)),
    }
}

/// Compute the MAC over `message` with the auth-data bytes at
/// `auth_offset` treated as zero.
pub fn compute(
    message: &[u8],
    auth_offset: usize,
    key: &[u8],
    key_id: u16,
) -> Result<Vec<u8>, AuthError> {
    let len = mac_len(key_id)?;
    if message.len() < auth_offset + len {
        return Err(AuthError::LenMismatch { expected: auth_offset + len, actual: message.len() });
    }
    let mut scratch = message.to_vec();
    scratch[auth_offset..auth_offset + len].fill(0);
    match key_id {
        KEY_ID_HMAC_SHA1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(key).map_err(|_| AuthError::Failed)?;
            mac.update(&scratch);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        KEY_ID_HMAC_SHA256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| AuthError::Failed)?;
            mac.update(&scratch);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        other => Err(AuthError::UnknownKeyId(other)),
    }
}

/// MAC over the message as-is, with no auth-data span to zero; used for
/// the RTR auth field, which sits outside the bytes it covers.
pub fn keyed_digest(message: &[u8], key: &[u8], key_id: u16) -> Result<Vec<u8>, AuthError> {
    match key_id {
        KEY_ID_HMAC_SHA1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(key).map_err(|_| AuthError::Failed)?;
            mac.update(message);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        KEY_ID_HMAC_SHA256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| AuthError::Failed)?;
            mac.update(message);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        other => Err(AuthError::UnknownKeyId(other)),
    }
}

/// Overwrite the auth-data bytes of an encoded message with the MAC
/// computed over it.
pub fn sign(
    message: &mut [u8],
    auth_offset: usize,
    key: &[u8],
    key_id: u16,
) -> Result<(), AuthError> {
    let mac = compute(message, auth_offset, key, key_id)?;
    message[auth_offset..auth_offset + mac.len()].copy_from_slice(&mac);
    Ok(())
}

/// Recompute the MAC and compare it, constant-time, against the received
/// auth data. The received data length must match the algorithm exactly.
pub fn verify(
    message: &[u8],
    auth_offset: usize,
    auth_data: &[u8],
    key: &[u8],
    key_id: u16,
) -> Result<(), AuthError> {
    let len = mac_len(key_id)?;
    if auth_data.len() != len {
        return Err(AuthError::LenMismatch { expected: len, actual: auth_data.len() });
    }
    let mut scratch = message.to_vec();
    if scratch.len() < auth_offset + len {
        return Err(AuthError::LenMismatch { expected: auth_offset + len, actual: scratch.len() });
    }
    scratch[auth_offset..auth_offset + len].fill(0);
    match key_id {
        KEY_ID_HMAC_SHA1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(key).map_err(|_| AuthError::Failed)?;
            mac.update(&scratch);
            mac.verify_slice(auth_data).map_err(|_| AuthError::Failed)
        }
        KEY_ID_HMAC_SHA256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| AuthError::Failed)?;
            mac.update(&scratch);
            mac.verify_slice(auth_data).map_err(|_| AuthError::Failed)
        }
        other => Err(AuthError::UnknownKeyId(other)),
    }
}
