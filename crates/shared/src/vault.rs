use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use thiserror::Error;
use tracing::{info, warn};

use crate::llm::CompletionProvider;
use crate::repos::{CredentialRecord, Store, StoreError};

pub const PROVIDER_SERVICE: &str = "openai";

const PBKDF2_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("API credential is not configured for this session")]
    NotConfigured,
    #[error("API credential was rejected by the provider")]
    Invalid,
    #[error("credential encryption failed")]
    EncryptFailed,
    #[error("stored credential could not be decrypted")]
    DecryptFailed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Symmetric cipher for stored provider credentials.
///
/// The key is PBKDF2-HMAC-SHA256 over a per-deployment secret and salt.
/// Ciphertexts are `base64url(nonce || ciphertext)` with the service tag as
/// associated data.
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCipher")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl CredentialCipher {
    pub fn derive(secret: &str, salt: &str) -> Self {
        let mut key = [0_u8; 32];
        pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt.as_bytes(), PBKDF2_ITERATIONS, &mut key);
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str, aad: &str) -> Result<String, VaultError> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| VaultError::EncryptFailed)?;
        let nonce_bytes = build_nonce_bytes();
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| VaultError::EncryptFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    pub fn decrypt(&self, encoded: &str, aad: &str) -> Result<String, VaultError> {
        let sealed = URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .map_err(|_| VaultError::DecryptFailed)?;
        if sealed.len() <= NONCE_LEN {
            return Err(VaultError::DecryptFailed);
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| VaultError::DecryptFailed)?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| VaultError::DecryptFailed)?;

        String::from_utf8(plaintext).map_err(|_| VaultError::DecryptFailed)
    }
}

fn build_nonce_bytes() -> [u8; NONCE_LEN] {
    let uuid_bytes = uuid::Uuid::new_v4();
    let mut nonce = [0_u8; NONCE_LEN];
    nonce.copy_from_slice(&uuid_bytes.as_bytes()[..NONCE_LEN]);
    nonce
}

/// Per-session provider credentials: validation, encrypted storage and
/// resolution of the active secret.
#[derive(Clone)]
pub struct CredentialVault {
    store: Store,
    cipher: CredentialCipher,
    provider: Arc<dyn CompletionProvider>,
}

impl CredentialVault {
    pub fn new(
        store: Store,
        cipher: CredentialCipher,
        provider: Arc<dyn CompletionProvider>,
    ) -> Self {
        Self {
            store,
            cipher,
            provider,
        }
    }

    /// Probes the provider with the secret. Any failure other than a
    /// successful probe reports the secret as invalid.
    pub async fn validate(&self, raw_secret: &str) -> bool {
        let secret = raw_secret.trim();
        if secret.is_empty() {
            return false;
        }

        match self.provider.validate_key(secret).await {
            Ok(valid) => valid,
            Err(err) => {
                warn!("credential validation probe failed: {err}");
                false
            }
        }
    }

    /// Encrypts and stores the secret as the session's active credential.
    pub async fn store(
        &self,
        session_id: &str,
        raw_secret: &str,
    ) -> Result<CredentialRecord, VaultError> {
        let encrypted = self.cipher.encrypt(raw_secret.trim(), PROVIDER_SERVICE)?;
        let record = self
            .store
            .replace_active_credential(session_id, PROVIDER_SERVICE, &encrypted)
            .await?;

        info!(session_id, credential_id = %record.id, "provider credential stored");
        Ok(record)
    }

    /// Validates, then stores. Rejected secrets are never persisted.
    pub async fn validate_and_store(
        &self,
        session_id: &str,
        raw_secret: &str,
    ) -> Result<CredentialRecord, VaultError> {
        if !self.validate(raw_secret).await {
            return Err(VaultError::Invalid);
        }
        self.store(session_id, raw_secret).await
    }

    pub async fn resolve(&self, session_id: &str) -> Result<String, VaultError> {
        let record = self
            .store
            .latest_active_credential(session_id, PROVIDER_SERVICE)
            .await?
            .ok_or(VaultError::NotConfigured)?;

        self.cipher
            .decrypt(&record.encrypted_secret, &record.service)
    }
}
