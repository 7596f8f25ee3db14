//! PKCS#11 wrapper for the hardware security module.
//!
//! `HsmContext` owns the loaded PKCS#11 module and a fixed pool of
//! logged-in sessions. The facade functions each operate over an
//! already-acquired session and cover the key lifecycle (create, list,
//! fetch, delete, rotate) plus AES-CBC-PAD encrypt/decrypt.
//!
//! Keys are identified externally by the decimal rendering of their
//! module-internal object handle; no `CKA_ID` is assigned at creation.

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::RvError;
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, KeyType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::{info, warn};

use crate::pool::{Lease, Pool};

/// AES block size; every IV is exactly this long.
pub const IV_LEN: usize = 16;

/// AES-256.
const AES_KEY_BYTES: u64 = 32;

#[derive(Error, Debug)]
pub enum HsmError {
    #[error("PKCS#11 error: {0}")]
    Pkcs11(#[from] cryptoki::error::Error),
    #[error("Slot with label {0} not found")]
    SlotNotFound(String),
    #[error("Key not found: {0}")]
    KeyNotFound(String),
    #[error("IV generation failed: {0}")]
    EntropyFailure(String),
    #[error("Invalid IV length: {0} (expected 16 bytes)")]
    InvalidIv(usize),
}

/// HSM context managing the PKCS#11 module and the session pool.
pub struct HsmContext {
    #[allow(dead_code)]
    pkcs11: Pkcs11,
    sessions: Pool<Session>,
}

impl HsmContext {
    /// Load the PKCS#11 module, locate the slot by its descriptive label,
    /// and open and authenticate `pool_size` sessions.
    ///
    /// Any open or login failure is fatal: a partially-authenticated pool
    /// would silently hand out unusable sessions, so the process must not
    /// start in that state.
    pub fn new(
        library_path: &str,
        slot_label: &str,
        pin: &str,
        pool_size: usize,
    ) -> Result<Self, HsmError> {
        let pkcs11 = Pkcs11::new(library_path)?;
        pkcs11.initialize(CInitializeArgs::OsThreads)?;

        let slot = find_slot_by_label(&pkcs11, slot_label)?;
        let pin = AuthPin::new(pin.into());

        let mut sessions = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let session = pkcs11.open_rw_session(slot)?;
            match session.login(UserType::User, Some(&pin)) {
                Ok(()) => {}
                // PKCS#11 login state is shared across an application's
                // sessions on a token; later sessions report it as an
                // error even though they are authenticated.
                Err(cryptoki::error::Error::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => {}
                Err(e) => return Err(e.into()),
            }
            sessions.push(session);
        }
        info!("Opened {} authenticated HSM sessions", pool_size);

        Ok(Self {
            pkcs11,
            sessions: Pool::new(sessions),
        })
    }

    /// Check an authenticated session out of the pool, waiting until one
    /// is available. The lease returns it on drop.
    pub async fn acquire_session(&self) -> Lease<Session> {
        self.sessions.acquire().await
    }

    pub fn pool_capacity(&self) -> usize {
        self.sessions.capacity()
    }

    /// Drain the pool, logging each available session out and closing it.
    /// Sessions still leased by in-flight requests are not reclaimed;
    /// shutdown should only run after requests have drained.
    pub async fn close(&self) {
        for session in self.sessions.drain().await {
            if let Err(e) = session.logout() {
                warn!("Failed to log out HSM session: {}", e);
            }
            // The session closes when dropped; the module finalizes when
            // the context is dropped.
        }
        info!("HSM session pool drained");
    }
}

/// Locate a slot whose description matches `slot_label`. PKCS#11 pads the
/// description with trailing spaces, so the comparison trims them.
fn find_slot_by_label(pkcs11: &Pkcs11, slot_label: &str) -> Result<Slot, HsmError> {
    for slot in pkcs11.get_slots_with_token()? {
        let info = pkcs11.get_slot_info(slot)?;
        if info.slot_description().trim_end() == slot_label {
            return Ok(slot);
        }
    }
    Err(HsmError::SlotNotFound(slot_label.to_string()))
}

/// Attribute template matching every AES secret-key object.
fn secret_key_template() -> Vec<Attribute> {
    vec![
        Attribute::Class(ObjectClass::SECRET_KEY),
        Attribute::KeyType(KeyType::AES),
    ]
}

/// Generate a new token-persistent AES-256 key, encrypt+decrypt capable.
/// The returned handle is the key's identifier.
pub fn create_key(session: &Session) -> Result<ObjectHandle, HsmError> {
    let template = vec![
        Attribute::Class(ObjectClass::SECRET_KEY),
        Attribute::KeyType(KeyType::AES),
        Attribute::ValueLen(AES_KEY_BYTES.into()),
        Attribute::Token(true),
        Attribute::Encrypt(true),
        Attribute::Decrypt(true),
    ];
    session
        .generate_key(&Mechanism::AesKeyGen, &template)
        .map_err(Into::into)
}

/// Enumerate all AES secret-key objects. The underlying find-objects
/// enumeration pages in bounded batches and stops on an empty batch; it is
/// restartable only from the beginning.
pub fn list_keys(session: &Session) -> Result<Vec<ObjectHandle>, HsmError> {
    session
        .find_objects(&secret_key_template())
        .map_err(Into::into)
}

/// Look up one key by its identifier. Returns the first matching object
/// and fails with `KeyNotFound` when nothing matches.
pub fn fetch_key(session: &Session, key_id: &str) -> Result<ObjectHandle, HsmError> {
    let handles = session.find_objects(&secret_key_template())?;
    handles
        .into_iter()
        .find(|handle| handle.to_string() == key_id)
        .ok_or_else(|| HsmError::KeyNotFound(key_id.to_string()))
}

/// Resolve `key_id` and destroy the object. Destruction failure is
/// reported, not retried.
pub fn delete_key(session: &Session, key_id: &str) -> Result<(), HsmError> {
    let key = fetch_key(session, key_id)?;
    session.destroy_object(key)?;
    Ok(())
}

/// Replace a key: resolve the old one, create a new key, destroy the old
/// one, and return the new handle. The three steps are not atomic — if
/// destruction fails after the new key was created, both keys remain live
/// and the operation reports failure. The new identifier is unrelated to
/// the old one.
pub fn rotate_key(session: &Session, key_id: &str) -> Result<ObjectHandle, HsmError> {
    let old_key = fetch_key(session, key_id)?;
    let new_key = create_key(session)?;

    if let Err(e) = session.destroy_object(old_key) {
        warn!(
            "Rotation of key {} incomplete: old key not destroyed ({}); new key {} is live",
            key_id, e, new_key
        );
        return Err(e.into());
    }

    Ok(new_key)
}

/// Generate a fresh random IV from the operating system's entropy source.
/// Entropy failure aborts before the module is ever invoked.
fn generate_iv() -> Result<[u8; IV_LEN], HsmError> {
    let mut iv = [0u8; IV_LEN];
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|e| HsmError::EntropyFailure(e.to_string()))?;
    Ok(iv)
}

/// Encrypt `plaintext` under `key` with AES-CBC-PAD and a fresh random IV.
/// Every call produces an independent IV; the (iv, ciphertext) pair must
/// be kept together by the caller.
pub fn encrypt(
    session: &Session,
    key: ObjectHandle,
    plaintext: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), HsmError> {
    let iv = generate_iv()?;
    let ciphertext = session.encrypt(&Mechanism::AesCbcPad(iv), key, plaintext)?;
    Ok((iv.to_vec(), ciphertext))
}

/// Decrypt `ciphertext` under `key` with the caller-supplied IV. The
/// caller is responsible for pairing the correct IV with its ciphertext;
/// nothing beyond the IV length is validated here.
pub fn decrypt(
    session: &Session,
    key: ObjectHandle,
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, HsmError> {
    let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| HsmError::InvalidIv(iv.len()))?;
    session
        .decrypt(&Mechanism::AesCbcPad(iv), key, ciphertext)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== HsmError Display Tests ====================

    #[test]
    fn test_hsm_error_slot_not_found_display() {
        let err = HsmError::SlotNotFound("ForKMS".to_string());
        assert_eq!(err.to_string(), "Slot with label ForKMS not found");
    }

    #[test]
    fn test_hsm_error_key_not_found_display() {
        let err = HsmError::KeyNotFound("42".to_string());
        assert_eq!(err.to_string(), "Key not found: 42");
    }

    #[test]
    fn test_hsm_error_entropy_failure_display() {
        let err = HsmError::EntropyFailure("no entropy".to_string());
        assert_eq!(err.to_string(), "IV generation failed: no entropy");
    }

    #[test]
    fn test_hsm_error_invalid_iv_display() {
        let err = HsmError::InvalidIv(12);
        assert_eq!(err.to_string(), "Invalid IV length: 12 (expected 16 bytes)");
    }

    // ==================== IV Generation Tests ====================

    #[test]
    fn test_generated_iv_has_block_length() {
        let iv = generate_iv().unwrap();
        assert_eq!(iv.len(), IV_LEN);
    }

    #[test]
    fn test_successive_ivs_differ() {
        // 16 random bytes colliding across two draws would indicate a
        // broken entropy source.
        let first = generate_iv().unwrap();
        let second = generate_iv().unwrap();
        assert_ne!(first, second);
    }
}
