// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Failed to encrypt token")]
    Encrypt,
    #[error("Failed to decrypt token: {0}")]
    Decrypt(String),
}

/// Encrypts/decrypts user access tokens before they are embedded in
/// operation documents. Pluggable so tests can run without key material.
pub trait TokenCipher: Send + Sync {
    fn encrypt(&self, plain: &str) -> Result<String, CryptoError>;
    fn decrypt(&self, cipher: &str) -> Result<String, CryptoError>;
}

/// AES-256-GCM with a random nonce per message; the wire form is
/// `base64(nonce || ciphertext)`.
pub struct AesGcmTokenCipher {
    cipher: Aes256Gcm,
}

impl AesGcmTokenCipher {
    /// The key is derived from the shared passphrase by SHA-256 so that any
    /// passphrase length is accepted.
    pub fn new(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }
}

impl TokenCipher for AesGcmTokenCipher {
    fn encrypt(&self, plain: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plain.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;
        let mut payload = nonce.to_vec();
        payload.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(payload))
    }

    fn decrypt(&self, cipher: &str) -> Result<String, CryptoError> {
        let payload = BASE64
            .decode(cipher)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        if payload.len() < 12 {
            return Err(CryptoError::Decrypt("payload too short".to_string()));
        }
        let (nonce, ciphertext) = payload.split_at(12);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt("authentication failed".to_string()))?;
        String::from_utf8(plain).map_err(|e| CryptoError::Decrypt(e.to_string()))
    }
}

/// Identity cipher for tests and local development.
pub struct PlainTokenCipher;

impl TokenCipher for PlainTokenCipher {
    fn encrypt(&self, plain: &str) -> Result<String, CryptoError> {
        Ok(plain.to_string())
    }

    fn decrypt(&self, cipher: &str) -> Result<String, CryptoError> {
        Ok(cipher.to_string())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn round_trip() {
        let cipher = AesGcmTokenCipher::new("local-dev-shared-secret");
        let encrypted = cipher.encrypt("EDL-token-value").unwrap();
        assert_ne!(encrypted, "EDL-token-value");
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "EDL-token-value");
    }

    #[test]
    fn nonces_are_unique_per_message() {
        let cipher = AesGcmTokenCipher::new("local-dev-shared-secret");
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_payloads_are_rejected() {
        let cipher = AesGcmTokenCipher::new("local-dev-shared-secret");
        let mut encrypted = cipher.encrypt("EDL-token-value").unwrap();
        encrypted.push_str("AAAA");
        assert!(cipher.decrypt(&encrypted).is_err());
    }
}
