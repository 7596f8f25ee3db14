//! REST API handlers.
//!
//! Every key operation follows the same sequence: acquire a session from
//! the pool, resolve and evaluate the caller's policy, dispatch to the
//! HSM, and release the session on every exit path (the lease drops at
//! the end of the handler scope). A request that fails authorization
//! never touches the HSM.

use axum::{
    extract::{Form, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::Caller;
use crate::pkcs11::{self, HsmContext, HsmError, IV_LEN};
use crate::policy::{actions, is_action_allowed};
use crate::store::PolicyStore;

/// Shared application state, constructed once at startup and threaded
/// through every handler. There is no ambient global state.
pub struct AppState {
    pub hsm: HsmContext,
    pub policies: Arc<dyn PolicyStore>,
    /// Basic-auth accounts: username -> password. The username doubles as
    /// the caller's role for policy lookup.
    pub accounts: HashMap<String, String>,
}

// ==================== API Types ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateKeyResponse {
    pub key_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListKeysResponse {
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetKeyResponse {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteKeyResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateKeyResponse {
    pub new_key_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncryptForm {
    pub plaintext: String,
}

/// IV and ciphertext are base64 at the HTTP boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptResponse {
    pub iv: String,
    pub ciphertext: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecryptForm {
    pub iv: String,
    pub ciphertext: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptResponse {
    pub plaintext: String,
}

// ==================== Error Handling ====================

pub struct ApiError(pub StatusCode, pub Json<ErrorResponse>);

impl ApiError {
    pub fn forbidden() -> Self {
        ApiError(
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                error: "Forbidden".to_string(),
            }),
        )
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError(
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse { error: msg.into() }),
        )
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError(
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: msg.into() }),
        )
    }

    /// Translate an HSM failure into the operation's boundary message.
    /// `KeyNotFound` keeps its own message but is still a 500 — the HTTP
    /// contract does not distinguish it from other internal failures.
    fn hsm(operation_msg: &str, e: HsmError) -> Self {
        match e {
            HsmError::KeyNotFound(_) => {
                tracing::warn!("{}", e);
                ApiError::internal("Key not found")
            }
            _ => {
                tracing::error!("{}: {}", operation_msg, e);
                ApiError::internal(operation_msg)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

// ==================== Authorization ====================

/// Resolve the stored policy for (key id, role) and evaluate it for
/// `action`. Missing policy, store failure, and a non-matching policy all
/// collapse to the same Forbidden outcome: the engine is default-deny.
async fn authorize(
    policies: &dyn PolicyStore,
    key_id: &str,
    role: &str,
    action: &str,
) -> Result<(), ApiError> {
    let policy = match policies.fetch_policy(key_id, role).await {
        Ok(policy) => policy,
        Err(e) => {
            tracing::error!("Policy lookup failed for ({}, {}): {}", key_id, role, e);
            return Err(ApiError::forbidden());
        }
    };

    match policy {
        Some(policy) if is_action_allowed(&policy, action) => Ok(()),
        Some(_) => {
            tracing::warn!(
                "Action {} denied for role {} on key {:?}",
                action,
                role,
                key_id
            );
            Err(ApiError::forbidden())
        }
        None => {
            tracing::warn!("No policy found for ({:?}, {})", key_id, role);
            Err(ApiError::forbidden())
        }
    }
}

// ==================== Handlers ====================

/// Health check
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Generate a new symmetric key; the identifier is issued by the module.
pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<CreateKeyResponse>, ApiError> {
    let session = state.hsm.acquire_session().await;
    authorize(state.policies.as_ref(), "", &caller.role, actions::CREATE_KEY).await?;

    let key = pkcs11::create_key(&session).map_err(|e| ApiError::hsm("Failed to create key", e))?;

    Ok(Json(CreateKeyResponse {
        key_id: key.to_string(),
    }))
}

/// Enumerate all symmetric keys stored in the module.
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<ListKeysResponse>, ApiError> {
    let session = state.hsm.acquire_session().await;
    authorize(state.policies.as_ref(), "", &caller.role, actions::LIST_KEYS).await?;

    let keys = pkcs11::list_keys(&session).map_err(|e| ApiError::hsm("Failed to list keys", e))?;

    Ok(Json(ListKeysResponse {
        keys: keys.iter().map(|key| key.to_string()).collect(),
    }))
}

/// Look up one key by identifier.
pub async fn get_key(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(key_id): Path<String>,
) -> Result<Json<GetKeyResponse>, ApiError> {
    let session = state.hsm.acquire_session().await;
    authorize(state.policies.as_ref(), &key_id, &caller.role, actions::GET_KEY).await?;

    let key =
        pkcs11::fetch_key(&session, &key_id).map_err(|e| ApiError::hsm("Key not found", e))?;

    Ok(Json(GetKeyResponse {
        key: key.to_string(),
    }))
}

/// Destroy a key.
pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(key_id): Path<String>,
) -> Result<Json<DeleteKeyResponse>, ApiError> {
    let session = state.hsm.acquire_session().await;
    authorize(state.policies.as_ref(), &key_id, &caller.role, actions::DELETE_KEY).await?;

    pkcs11::delete_key(&session, &key_id)
        .map_err(|e| ApiError::hsm("Failed to delete key", e))?;

    Ok(Json(DeleteKeyResponse {
        message: "Key deleted".to_string(),
    }))
}

/// Replace a key with a freshly generated one. On partial failure (new
/// key created, old key destruction failed) both keys remain live and the
/// operation reports failure; no rollback is attempted.
pub async fn rotate_key(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(key_id): Path<String>,
) -> Result<Json<RotateKeyResponse>, ApiError> {
    let session = state.hsm.acquire_session().await;
    authorize(state.policies.as_ref(), &key_id, &caller.role, actions::ROTATE_KEY).await?;

    let new_key = pkcs11::rotate_key(&session, &key_id)
        .map_err(|e| ApiError::hsm("Failed to rotate key", e))?;

    Ok(Json(RotateKeyResponse {
        new_key_id: new_key.to_string(),
    }))
}

/// Encrypt form-supplied plaintext under a key, returning a fresh IV and
/// the ciphertext, both base64.
pub async fn encrypt(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(key_id): Path<String>,
    Form(form): Form<EncryptForm>,
) -> Result<Json<EncryptResponse>, ApiError> {
    let session = state.hsm.acquire_session().await;
    authorize(state.policies.as_ref(), &key_id, &caller.role, actions::ENCRYPT).await?;

    let key = pkcs11::fetch_key(&session, &key_id).map_err(|e| ApiError::hsm("Key not found", e))?;
    let (iv, ciphertext) = pkcs11::encrypt(&session, key, form.plaintext.as_bytes())
        .map_err(|e| ApiError::hsm("Encryption failed", e))?;

    let engine = base64::engine::general_purpose::STANDARD;
    Ok(Json(EncryptResponse {
        iv: engine.encode(iv),
        ciphertext: engine.encode(ciphertext),
    }))
}

/// Decrypt a base64 (iv, ciphertext) pair under a key. Pairing the right
/// IV with its ciphertext is the caller's responsibility.
pub async fn decrypt(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(key_id): Path<String>,
    Form(form): Form<DecryptForm>,
) -> Result<Json<DecryptResponse>, ApiError> {
    let session = state.hsm.acquire_session().await;
    authorize(state.policies.as_ref(), &key_id, &caller.role, actions::DECRYPT).await?;

    let engine = base64::engine::general_purpose::STANDARD;
    let iv = engine
        .decode(&form.iv)
        .map_err(|e| ApiError::bad_request(format!("Invalid base64 iv: {}", e)))?;
    if iv.len() != IV_LEN {
        return Err(ApiError::bad_request(format!(
            "Invalid IV length: {} (expected {} bytes)",
            iv.len(),
            IV_LEN
        )));
    }
    let ciphertext = engine
        .decode(&form.ciphertext)
        .map_err(|e| ApiError::bad_request(format!("Invalid base64 ciphertext: {}", e)))?;

    let key = pkcs11::fetch_key(&session, &key_id).map_err(|e| ApiError::hsm("Key not found", e))?;
    let plaintext = pkcs11::decrypt(&session, key, &iv, &ciphertext)
        .map_err(|e| ApiError::hsm("Decryption failed", e))?;

    let plaintext = String::from_utf8(plaintext).map_err(|_| {
        tracing::error!("Decryption produced non-UTF-8 output for key {}", key_id);
        ApiError::internal("Decryption failed")
    })?;

    Ok(Json(DecryptResponse { plaintext }))
}
