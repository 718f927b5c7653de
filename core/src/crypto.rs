// Symmetric cipher for sensitive configuration values
// Key is derived from hostname + a persisted salt, so tokens are only
// decryptable on the machine that wrote them

use crate::error::{CoreError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::info;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use std::path::Path;

/// PBKDF2 iteration count for key derivation
const KDF_ITERATIONS: u32 = 100_000;

/// First byte of every token, bumped if the layout ever changes
const TOKEN_VERSION: u8 = 0x01;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Cipher wrapping AES-256-GCM with a machine-derived key.
///
/// Tokens are `base64(version || nonce || ciphertext)`; whether a stored
/// value is encrypted is a property of the value itself (see
/// [`SecretCipher::is_token`]), not of any schema.
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Initialize the cipher for the given config directory
    ///
    /// Loads the salt from `<config_dir>/.salt`, generating 16 random bytes
    /// (mode 0600) on first run, then derives the key from the hostname.
    pub fn initialize(config_dir: &Path) -> Result<Self> {
        let salt_path = config_dir.join(".salt");

        let salt = if salt_path.exists() {
            std::fs::read(&salt_path)?
        } else {
            std::fs::create_dir_all(config_dir)?;
            let salt: [u8; 16] = rand::random();
            std::fs::write(&salt_path, salt)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&salt_path, std::fs::Permissions::from_mode(0o600))?;
            }
            salt.to_vec()
        };

        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "clipd".to_string());
        let material = format!("{}:clipd-secrets", hostname);

        info!("secret cipher initialized (salt: {})", salt_path.display());
        Ok(Self::from_key_material(&material, &salt))
    }

    /// Derive the cipher from explicit key material and salt
    pub fn from_key_material(material: &str, salt: &[u8]) -> Self {
        let mut key_bytes = [0u8; 32];
        pbkdf2_hmac::<Sha256>(material.as_bytes(), salt, KDF_ITERATIONS, &mut key_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypt a string value into a base64 token
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CoreError::Internal("encryption failed".into()))?;

        let mut token = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        token.push(TOKEN_VERSION);
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(token))
    }

    /// Decrypt a base64 token back into the original string
    pub fn decrypt(&self, token: &str) -> Result<String> {
        let raw = BASE64
            .decode(token)
            .map_err(|_| CoreError::Validation("not a cipher token".into()))?;

        if raw.len() < 1 + NONCE_LEN + TAG_LEN || raw[0] != TOKEN_VERSION {
            return Err(CoreError::Validation("not a cipher token".into()));
        }

        let nonce = Nonce::from_slice(&raw[1..1 + NONCE_LEN]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &raw[1 + NONCE_LEN..])
            .map_err(|_| CoreError::Validation("token does not decrypt".into()))?;

        String::from_utf8(plaintext).map_err(|_| CoreError::Validation("token is not UTF-8".into()))
    }

    /// Check whether a value looks like one of our tokens
    pub fn is_token(value: &str) -> bool {
        match BASE64.decode(value) {
            Ok(raw) => raw.len() >= 1 + NONCE_LEN + TAG_LEN && raw[0] == TOKEN_VERSION,
            Err(_) => false,
        }
    }
}
